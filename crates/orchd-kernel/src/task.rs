//! Tasks and their scheduling metadata.
//!
//! A [`Program`] is one argv; a task payload is either a pipeline of
//! programs or an in-process [`Procedure`] (the status snapshot is the one
//! procedure this system ships). A [`TaggedTask`] bundles the payload with
//! the identity and the five lifecycle timestamps the scheduler, the log
//! and the status report all work from.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use orchd_protocol::{MonoTime, TimeStage};

use crate::parser::{self, ParseError};

/// Placeholder command line carried by procedure tasks.
const PROCEDURE_COMMAND_LINE: &str = "PROCEDURE TASK";

/// One program invocation: a non-empty argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    argv: Vec<String>,
}

impl Program {
    /// Build a program from its argv. The parser never produces an empty
    /// argv; this is asserted, not checked.
    pub fn new(argv: Vec<String>) -> Self {
        debug_assert!(!argv.is_empty(), "a program needs an executable name");
        Self { argv }
    }

    /// The executable name.
    pub fn name(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the executable name.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    /// The whole argv.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// An in-process task body, run in a spawned task when dispatched.
///
/// Procedures receive the slot they were dispatched into so they can report
/// their own completion, and resolve to an exit-code-like byte.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn run(&self, slot: usize) -> u8;
}

/// What a task executes.
///
/// Pipelines clone deeply; procedures clone by reference.
#[derive(Clone)]
pub enum TaskPayload {
    /// External programs connected stdout → stdin, length ≥ 1.
    Pipeline(Vec<Program>),
    /// An in-process procedure.
    Procedure(Arc<dyn Procedure>),
}

impl fmt::Debug for TaskPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPayload::Pipeline(p) => f.debug_tuple("Pipeline").field(p).finish(),
            TaskPayload::Procedure(_) => f.write_str("Procedure(..)"),
        }
    }
}

/// A task plus identity, the client's duration hint, and the five
/// lifecycle timestamps.
#[derive(Debug, Clone)]
pub struct TaggedTask {
    id: u32,
    command_line: String,
    expected_time: u32,
    times: [Option<MonoTime>; TimeStage::COUNT],
    payload: TaskPayload,
}

impl TaggedTask {
    /// Parse a command line into a pipeline task.
    pub fn from_command_line(
        command_line: &str,
        id: u32,
        expected_time: u32,
    ) -> Result<Self, ParseError> {
        let pipeline = parser::parse_pipeline(command_line)?;
        Ok(Self {
            id,
            command_line: command_line.to_owned(),
            expected_time,
            times: [None; TimeStage::COUNT],
            payload: TaskPayload::Pipeline(pipeline),
        })
    }

    /// Wrap a procedure as a task.
    pub fn from_procedure(procedure: Arc<dyn Procedure>, id: u32, expected_time: u32) -> Self {
        Self {
            id,
            command_line: PROCEDURE_COMMAND_LINE.to_owned(),
            expected_time,
            times: [None; TimeStage::COUNT],
            payload: TaskPayload::Procedure(procedure),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn expected_time(&self) -> u32 {
        self.expected_time
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    /// The pipeline stages, or `None` for a procedure task.
    pub fn pipeline(&self) -> Option<&[Program]> {
        match &self.payload {
            TaskPayload::Pipeline(p) => Some(p),
            TaskPayload::Procedure(_) => None,
        }
    }

    /// The timestamp of `stage`, if it has been set.
    pub fn time(&self, stage: TimeStage) -> Option<MonoTime> {
        self.times[stage as usize]
    }

    /// All five stage timestamps, in causal order.
    pub fn times(&self) -> &[Option<MonoTime>; TimeStage::COUNT] {
        &self.times
    }

    /// Record `stage` at an explicit point in time.
    pub fn set_time(&mut self, stage: TimeStage, t: MonoTime) {
        debug_assert!(
            self.times[..stage as usize]
                .iter()
                .flatten()
                .all(|earlier| *earlier <= t),
            "stage timestamps must be non-decreasing"
        );
        self.times[stage as usize] = Some(t);
    }

    /// Record `stage` as happening now.
    pub fn stamp(&mut self, stage: TimeStage) {
        self.set_time(stage, MonoTime::now());
    }
}
