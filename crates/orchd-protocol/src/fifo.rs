//! Named-pipe endpoints: FIFO lifecycle, sending, and the receive loops.
//!
//! The server owns a FIFO at a well-known path; every client owns a FIFO
//! derived from its PID. The server learns where to reply from the PID
//! embedded in each request, opening the client's FIFO only for the
//! duration of the reply ([`PeerSender`]). Runner and status tasks spawned
//! by the server report back through the server FIFO like any other writer,
//! but being in-process they open a bare [`PeerSender`] instead of building
//! a client FIFO of their own (every in-process task shares the server's
//! PID, so per-PID FIFOs would collide).
//!
//! Blocking behaviour mirrors the classic FIFO rendezvous:
//!
//! - the server's receiver is opened with read access *and* write access,
//!   the standard trick that keeps the descriptor readable across client
//!   generations instead of reporting EOF whenever the last writer closes;
//! - a client blocks opening its own FIFO for reading until the server
//!   connects to reply, and treats EOF as end-of-reply-stream;
//! - opening a send side whose reader has not yet arrived retries on
//!   `ENXIO` until the reader shows up.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

use crate::frame::{self, FrameDecoder, FrameError, IPC_MAX, RECV_BUFFER_LEN};

/// How long to wait before re-trying an open whose peer is not ready.
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Write attempts for completion notifications and replies. Losing one
/// costs the orchestrator a slot forever, so the bound is generous.
pub const SEND_RETRY_MAX_TRIES: u32 = 16;

/// Transport errors.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The server FIFO already exists; another server is likely running.
    #[error("server FIFO already exists")]
    AlreadyExists,

    /// The server FIFO does not exist; the server is not running.
    #[error("server FIFO not found")]
    ServerNotRunning,

    /// Outgoing payload is empty or exceeds [`IPC_MAX`].
    #[error("message length {0} outside 1..={IPC_MAX}")]
    BadMessageLength(usize),

    /// `send_retry` exhausted its write attempts.
    #[error("peer unreachable after retries")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Filesystem rendezvous points for one orchestrator instance.
///
/// The default instance lives in `/tmp`; tests point each instance at its
/// own scratch directory so servers can run side by side.
#[derive(Debug, Clone)]
pub struct PipePaths {
    dir: PathBuf,
}

impl Default for PipePaths {
    fn default() -> Self {
        Self::in_dir("/tmp")
    }
}

impl PipePaths {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The FIFO the server listens on.
    pub fn server_path(&self) -> PathBuf {
        self.dir.join("orchestrator.fifo")
    }

    /// The FIFO the client with `pid` listens on.
    pub fn client_path(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("client{pid}.fifo"))
    }
}

/// Unlinks a FIFO when the owning endpoint goes away.
#[derive(Debug)]
struct FifoGuard {
    path: PathBuf,
}

impl Drop for FifoGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn make_fifo(path: &Path, mode: u32) -> Result<FifoGuard, IpcError> {
    mkfifo(path, Mode::from_bits_truncate(mode)).map_err(|errno| match errno {
        nix::errno::Errno::EEXIST => IpcError::AlreadyExists,
        other => IpcError::Io(io::Error::from_raw_os_error(other as i32)),
    })?;
    Ok(FifoGuard { path: path.to_path_buf() })
}

/// Open `path` for writing, waiting for a reader to appear.
async fn open_sender_wait(path: &Path) -> io::Result<pipe::Sender> {
    loop {
        match pipe::OpenOptions::new().open_sender(path) {
            Ok(tx) => return Ok(tx),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write one whole frame.
///
/// A frame never exceeds `PIPE_BUF`, so the kernel either takes all of it
/// in one atomic write or none of it; there is no partial-write path.
async fn write_frame(tx: &pipe::Sender, fr: &[u8]) -> io::Result<()> {
    loop {
        tx.writable().await?;
        match tx.try_write(fr) {
            Ok(n) if n == fr.len() => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short frame write: {n} of {}", fr.len()),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

fn encode_checked(payload: &[u8]) -> Result<Vec<u8>, IpcError> {
    frame::encode(payload).map_err(|e| match e {
        FrameError::BadPayloadLength(n) => IpcError::BadMessageLength(n),
        FrameError::Desynchronized => unreachable!("encode never desynchronizes"),
    })
}

/// The server endpoint: owns the well-known FIFO for its lifetime.
#[derive(Debug)]
pub struct ServerConn {
    paths: PipePaths,
    receiver: Option<pipe::Receiver>,
    decoder: FrameDecoder,
    read_buf: Box<[u8]>,
    _fifo: FifoGuard,
}

impl ServerConn {
    /// Create the server FIFO (mode 0620: owner reads, group writes).
    ///
    /// Fails with [`IpcError::AlreadyExists`] when the FIFO is already
    /// present — the usual sign of another running server.
    pub fn new(paths: PipePaths) -> Result<Self, IpcError> {
        let fifo = make_fifo(&paths.server_path(), 0o620)?;
        Ok(Self {
            paths,
            receiver: None,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
            _fifo: fifo,
        })
    }

    pub fn paths(&self) -> &PipePaths {
        &self.paths
    }

    /// Receive the next message payload, in write order.
    ///
    /// Desynchronized input is diagnosed, the readable backlog is drained,
    /// and the loop resumes at the next clean frame boundary.
    pub async fn recv(&mut self) -> Result<Vec<u8>, IpcError> {
        loop {
            match self.decoder.next_frame() {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => {}
                Err(FrameError::Desynchronized) | Err(FrameError::BadPayloadLength(_)) => {
                    tracing::error!("dropping input frames: invalid frame on server FIFO");
                    self.drain()?;
                    continue;
                }
            }

            if self.receiver.is_none() {
                // Read-write keeps the FIFO from reporting EOF between
                // client generations; this endpoint never writes to it.
                let rx = pipe::OpenOptions::new()
                    .read_write(true)
                    .open_receiver(self.paths.server_path())?;
                self.receiver = Some(rx);
            }
            let rx = self.receiver.as_mut().unwrap();

            let n = rx.read(&mut self.read_buf).await?;
            if n == 0 {
                // Cannot normally happen in read-write mode; don't spin.
                tokio::task::yield_now().await;
                continue;
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }

    /// Throw away buffered and immediately-readable bytes.
    fn drain(&mut self) -> Result<(), IpcError> {
        self.decoder.clear();
        let Some(rx) = &self.receiver else { return Ok(()) };
        let mut scratch = [0u8; 1024];
        loop {
            match rx.try_read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// A client endpoint: its own FIFO for replies plus the send side of the
/// server FIFO.
#[derive(Debug)]
pub struct ClientConn {
    paths: PipePaths,
    pid: u32,
    sender: pipe::Sender,
    receiver: Option<pipe::Receiver>,
    decoder: FrameDecoder,
    read_buf: Box<[u8]>,
    finished: bool,
    _fifo: FifoGuard,
}

impl ClientConn {
    /// Create the client's FIFO (mode 0622: anyone may reply into it) and
    /// connect to the server FIFO for writing.
    pub async fn connect(paths: PipePaths) -> Result<Self, IpcError> {
        let pid = std::process::id();
        let own_path = paths.client_path(pid);
        // A previous client with this PID may have died without cleanup.
        let _ = std::fs::remove_file(&own_path);
        let fifo = make_fifo(&own_path, 0o622)?;

        let server_path = paths.server_path();
        if !server_path.exists() {
            return Err(IpcError::ServerNotRunning);
        }
        let sender = open_sender_wait(&server_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                IpcError::ServerNotRunning
            } else {
                IpcError::Io(e)
            }
        })?;

        Ok(Self {
            paths,
            pid,
            sender,
            receiver: None,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; RECV_BUFFER_LEN].into_boxed_slice(),
            finished: false,
            _fifo: fifo,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn paths(&self) -> &PipePaths {
        &self.paths
    }

    /// Send one message to the server.
    pub async fn send(&self, payload: &[u8]) -> Result<(), IpcError> {
        let fr = encode_checked(payload)?;
        write_frame(&self.sender, &fr).await?;
        Ok(())
    }

    /// Receive the next reply, or `None` once the server has closed the
    /// reply stream.
    ///
    /// The first call blocks until the server opens the reply side of this
    /// client's FIFO; that open is the rendezvous.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, IpcError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            match self.decoder.next_frame() {
                Ok(Some(payload)) => return Ok(Some(payload)),
                Ok(None) => {}
                Err(_) => {
                    tracing::error!("dropping reply stream: invalid frame on client FIFO");
                    self.finished = true;
                    return Ok(None);
                }
            }

            if self.receiver.is_none() {
                let path = self.paths.client_path(self.pid);
                // A plain blocking open: returns once the server (or a
                // status task) opens the write side.
                let file = tokio::task::spawn_blocking(move || std::fs::File::open(path))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
                self.receiver = Some(pipe::Receiver::from_file(file)?);
            }
            let rx = self.receiver.as_mut().unwrap();

            let n = rx.read(&mut self.read_buf).await?;
            if n == 0 {
                if self.decoder.pending() > 0 {
                    tracing::error!("dropping input frame: truncated at end of reply stream");
                }
                self.finished = true;
                return Ok(None);
            }
            self.decoder.feed(&self.read_buf[..n]);
        }
    }
}

/// Which FIFO a [`PeerSender`] targets; kept so a broken pipe can be
/// reopened from the remembered address.
#[derive(Debug, Clone)]
enum PeerAddr {
    Server,
    Client(u32),
}

/// A scoped send-side handle to one peer's FIFO.
///
/// For the server this is the reply channel to one client (the C sources
/// called this pair `server_open_sending` / `server_close_sending`; here
/// the close is `Drop`). For runner and status tasks it is the completion
/// channel back to the server.
#[derive(Debug)]
pub struct PeerSender {
    paths: PipePaths,
    addr: PeerAddr,
    sender: pipe::Sender,
}

impl PeerSender {
    /// Open the reply direction toward the client with `pid`.
    ///
    /// Waits for the client to open its read side; fails immediately when
    /// the client FIFO no longer exists (the client is gone).
    pub async fn to_client(paths: &PipePaths, pid: u32) -> Result<Self, IpcError> {
        let sender = open_sender_wait(&paths.client_path(pid)).await?;
        Ok(Self {
            paths: paths.clone(),
            addr: PeerAddr::Client(pid),
            sender,
        })
    }

    /// Open the notification direction toward the server.
    pub async fn to_server(paths: &PipePaths) -> Result<Self, IpcError> {
        let path = paths.server_path();
        if !path.exists() {
            return Err(IpcError::ServerNotRunning);
        }
        let sender = open_sender_wait(&path).await?;
        Ok(Self {
            paths: paths.clone(),
            addr: PeerAddr::Server,
            sender,
        })
    }

    fn target_path(&self) -> PathBuf {
        match self.addr {
            PeerAddr::Server => self.paths.server_path(),
            PeerAddr::Client(pid) => self.paths.client_path(pid),
        }
    }

    /// Send one message; a vanished peer surfaces as an I/O error.
    pub async fn send(&self, payload: &[u8]) -> Result<(), IpcError> {
        let fr = encode_checked(payload)?;
        write_frame(&self.sender, &fr).await?;
        Ok(())
    }

    /// Send one message, reopening the peer FIFO and retrying on broken or
    /// interrupted writes.
    ///
    /// This is the mandatory path for completion notifications: a lost
    /// `TASK_DONE` costs the orchestrator a slot forever.
    pub async fn send_retry(&mut self, payload: &[u8], max_tries: u32) -> Result<(), IpcError> {
        let fr = encode_checked(payload)?;

        let mut recovered = 0u32;
        for _ in 0..max_tries {
            match write_frame(&self.sender, &fr).await {
                Ok(()) => {
                    if recovered > 0 {
                        tracing::warn!(
                            attempts = recovered,
                            "IPC synchronization error recovered from"
                        );
                    }
                    return Ok(());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::Interrupted
                    ) =>
                {
                    self.sender = open_sender_wait(&self.target_path()).await?;
                    recovered += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(IpcError::Timeout)
    }
}
