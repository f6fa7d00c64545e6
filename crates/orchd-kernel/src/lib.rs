//! orchd-kernel: the server core of orchd.
//!
//! This crate provides:
//!
//! - **Parser**: shell-like command lines into pipelines of programs
//! - **Queue**: the policy-ordered (FCFS / SJF) pending-task min-heap
//! - **Task**: programs, pipeline/procedure payloads, tagged tasks and
//!   their five-stage timing
//! - **Log**: the append-only fixed-record completion log with bounded
//!   snapshot replay
//! - **Scheduler**: the fixed slot table that dispatches queued tasks into
//!   spawned runners
//! - **Runner**: subprocess pipeline execution and completion reporting
//! - **Status**: the snapshot procedure that streams server state to a
//!   client
//! - **Orchestrator**: the receive → handle → dispatch loop tying it all
//!   to the FIFO transport

pub mod log;
pub mod orchestrator;
pub mod parser;
pub mod queue;
pub mod runner;
pub mod scheduler;
pub mod status;
pub mod task;

pub use log::{LogError, LogFile, LogReader, LogRecord, COMMAND_CAPACITY, RECORD_LEN};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, StartupError, NO_CAPACITY_ERROR, PARSING_FAILURE_ERROR,
};
pub use parser::{parse_pipeline, parse_single, ParseError};
pub use queue::{Policy, PolicyParseError, TaskQueue};
pub use scheduler::{Scheduler, SchedulerError, STATUS_SLOTS};
pub use status::StatusJob;
pub use task::{Procedure, Program, TaggedTask, TaskPayload};
