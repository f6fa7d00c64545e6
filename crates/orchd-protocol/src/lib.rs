//! orchd-protocol: the vocabulary shared by the orchestrator, its spawned
//! tasks, and the client tooling.
//!
//! This crate provides:
//!
//! - **Framing** (`frame`): atomic length-prefixed frames bounded by
//!   `PIPE_BUF`, with an incremental decoder that recovers from partial and
//!   desynchronized reads.
//! - **Transport** (`fifo`): the named-pipe endpoints — server FIFO
//!   lifecycle, per-client reply FIFOs, scoped send handles, and the
//!   retrying send path completion notifications depend on.
//! - **Wire protocol** (`wire`): the typed client/server messages with
//!   explicit field-by-field serialization.
//! - **Timestamps** (`time`): monotonic-clock readings that are meaningful
//!   across the processes of one machine, and the stage vocabulary used by
//!   task timing.

pub mod fifo;
pub mod frame;
pub mod time;
pub mod wire;

pub use fifo::{ClientConn, IpcError, PeerSender, PipePaths, ServerConn, SEND_RETRY_MAX_TRIES};
pub use frame::{FrameDecoder, FrameError, IPC_MAX};
pub use time::{micros_between, MonoTime, TimeStage};
pub use wire::{
    ClientMessage, ServerMessage, StatusResponse, Submission, TaskStatus, WireError,
    MAX_COMMAND_LEN, MAX_ERROR_LEN, MAX_STATUS_COMMAND_LEN,
};
