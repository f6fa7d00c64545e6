//! The requests a client process can make against a running server.
//!
//! Every request is one short-lived exchange: create the client endpoint,
//! write one message into the server FIFO, then read replies from our own
//! FIFO — exactly one for a submission, a stream terminated by EOF for a
//! status query.

use thiserror::Error;

use orchd_protocol::{
    ClientConn, ClientMessage, IpcError, MonoTime, PipePaths, ServerMessage, StatusResponse,
    Submission, WireError, MAX_COMMAND_LEN,
};

/// Client-side request failures (the server refusing is not one of them;
/// see [`SubmitOutcome::Refused`]).
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server FIFO does not exist.
    #[error("server FIFO not found; is the server running?")]
    ServerNotRunning,

    /// The command line is empty or longer than a message can carry.
    #[error("command empty or too long (max: {MAX_COMMAND_LEN})")]
    CommandTooLong,

    /// The server closed the reply stream without answering.
    #[error("server closed the connection without a reply")]
    NoReply,

    /// The server sent something undecodable.
    #[error("invalid reply from server: {0}")]
    BadReply(#[from] WireError),

    #[error(transparent)]
    Ipc(IpcError),
}

impl From<IpcError> for ClientError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::ServerNotRunning => ClientError::ServerNotRunning,
            IpcError::BadMessageLength(_) => ClientError::CommandTooLong,
            other => ClientError::Ipc(other),
        }
    }
}

/// Whether a submission may contain pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// `-u`: a single program.
    Single,
    /// `-p`: a pipeline.
    Pipeline,
}

/// What the server said about a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted; the task runs under this identifier.
    Scheduled(u32),
    /// Refused; the server's error text.
    Refused(String),
}

/// Submit a command line for execution.
pub async fn submit(
    paths: PipePaths,
    command_line: &str,
    expected_ms: u32,
    mode: SubmitMode,
) -> Result<SubmitOutcome, ClientError> {
    if command_line.is_empty() || command_line.len() > MAX_COMMAND_LEN {
        return Err(ClientError::CommandTooLong);
    }

    let mut conn = ClientConn::connect(paths).await?;
    let submission = Submission {
        client_pid: conn.pid(),
        time_sent: MonoTime::now(),
        expected_time: expected_ms,
        command_line: command_line.to_owned(),
    };
    let message = match mode {
        SubmitMode::Single => ClientMessage::SendProgram(submission),
        SubmitMode::Pipeline => ClientMessage::SendTask(submission),
    };
    let payload = message.encode().map_err(|_| ClientError::CommandTooLong)?;
    conn.send(&payload).await?;

    // Exactly one reply ends the exchange.
    let reply = conn.recv().await?.ok_or(ClientError::NoReply)?;
    match ServerMessage::decode(&reply)? {
        ServerMessage::TaskId { id } => Ok(SubmitOutcome::Scheduled(id)),
        ServerMessage::Error { text } => Ok(SubmitOutcome::Refused(text)),
        ServerMessage::Status(_) => {
            tracing::warn!("unexpected status line in submission reply");
            Err(ClientError::NoReply)
        }
    }
}

/// What the server sent back for a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusOutcome {
    /// The streamed snapshot, in server order: done, executing, queued.
    Snapshot(Vec<StatusResponse>),
    /// Refused; the server's error text.
    Refused(String),
}

/// Ask for a snapshot of the server's historical, running and queued
/// tasks; the stream ends when the server closes our FIFO.
pub async fn ask_status(paths: PipePaths) -> Result<StatusOutcome, ClientError> {
    let mut conn = ClientConn::connect(paths).await?;
    let message = ClientMessage::Status { client_pid: conn.pid() };
    let payload = message
        .encode()
        .map_err(|_| ClientError::CommandTooLong)?;
    conn.send(&payload).await?;

    let mut lines = Vec::new();
    while let Some(reply) = conn.recv().await? {
        match ServerMessage::decode(&reply) {
            Ok(ServerMessage::Status(line)) => lines.push(line),
            Ok(ServerMessage::Error { text }) => return Ok(StatusOutcome::Refused(text)),
            Ok(other) => tracing::warn!("unexpected reply in status stream: {other:?}"),
            Err(e) => tracing::warn!("dropping invalid status line: {e}"),
        }
    }
    Ok(StatusOutcome::Snapshot(lines))
}
