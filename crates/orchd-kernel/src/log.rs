//! The completion log: append-only, fixed-size binary records.
//!
//! Every completed main-scheduler task becomes one record. Records are
//! written whole in a single call and never modified, so a reader that
//! stops after a known record count can never observe a half-written or
//! later record. [`LogFile::snapshot`] captures that count: status tasks
//! read through the snapshot and stay blind to records appended after it,
//! which is what makes their output a consistent point-in-time view.
//!
//! Record layout (native endian):
//!
//! ```text
//! u32 id | u32 command_len | u32 expected_time | u8 error
//! 5 × (u64 secs, u32 nanos)          unset stage = all-zero
//! command bytes, zero-padded to COMMAND_CAPACITY
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use orchd_protocol::{MonoTime, TimeStage, MAX_COMMAND_LEN};

use crate::task::TaggedTask;

/// Fixed size of the command buffer inside a record.
pub const COMMAND_CAPACITY: usize = MAX_COMMAND_LEN;

/// Fixed fields before the command buffer.
const FIXED_LEN: usize = 4 + 4 + 4 + 1 + TimeStage::COUNT * (8 + 4);

/// Total size of one record on disk.
pub const RECORD_LEN: usize = FIXED_LEN + COMMAND_CAPACITY;

/// Log failures.
#[derive(Debug, Error)]
pub enum LogError {
    /// A record on disk could not be decoded; replay stops.
    #[error("log record could not be decoded")]
    InvalidSequence,

    /// The command line does not fit the fixed record buffer.
    #[error("command line of {0} bytes exceeds the record buffer")]
    CommandTooLong(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The durable form of one completed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub id: u32,
    pub expected_time: u32,
    pub error: bool,
    pub times: [Option<MonoTime>; TimeStage::COUNT],
    pub command_line: String,
}

impl LogRecord {
    /// Capture a completed task with its error bit.
    pub fn from_task(task: &TaggedTask, error: bool) -> Self {
        Self {
            id: task.id(),
            expected_time: task.expected_time(),
            error,
            times: *task.times(),
            command_line: task.command_line().to_owned(),
        }
    }

    fn serialize(&self) -> Result<Vec<u8>, LogError> {
        let command = self.command_line.as_bytes();
        if command.len() > COMMAND_CAPACITY {
            return Err(LogError::CommandTooLong(command.len()));
        }

        let mut buf = vec![0u8; RECORD_LEN];
        buf[0..4].copy_from_slice(&self.id.to_ne_bytes());
        buf[4..8].copy_from_slice(&(command.len() as u32).to_ne_bytes());
        buf[8..12].copy_from_slice(&self.expected_time.to_ne_bytes());
        buf[12] = self.error as u8;

        let mut at = 13;
        for stage in TimeStage::ALL {
            let t = self.times[stage as usize].unwrap_or_default();
            buf[at..at + 8].copy_from_slice(&t.secs.to_ne_bytes());
            buf[at + 8..at + 12].copy_from_slice(&t.nanos.to_ne_bytes());
            at += 12;
        }

        buf[FIXED_LEN..FIXED_LEN + command.len()].copy_from_slice(command);
        Ok(buf)
    }

    fn deserialize(buf: &[u8; RECORD_LEN]) -> Result<Self, LogError> {
        let u32_at = |at: usize| u32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
        let u64_at = |at: usize| u64::from_ne_bytes(buf[at..at + 8].try_into().unwrap());

        let id = u32_at(0);
        let command_len = u32_at(4) as usize;
        if command_len > COMMAND_CAPACITY {
            return Err(LogError::InvalidSequence);
        }
        let expected_time = u32_at(8);
        let error = buf[12] != 0;

        let mut times = [None; TimeStage::COUNT];
        let mut at = 13;
        for slot in &mut times {
            let t = MonoTime {
                secs: u64_at(at),
                nanos: u32_at(at + 8),
            };
            *slot = (!t.is_zero()).then_some(t);
            at += 12;
        }

        let command_line = std::str::from_utf8(&buf[FIXED_LEN..FIXED_LEN + command_len])
            .map_err(|_| LogError::InvalidSequence)?
            .to_owned();

        Ok(Self {
            id,
            expected_time,
            error,
            times,
            command_line,
        })
    }
}

/// The writable log owned by the orchestrator.
#[derive(Debug)]
pub struct LogFile {
    file: File,
    path: PathBuf,
    task_count: u64,
}

impl LogFile {
    /// Create (or truncate) the log at `path` for appending, mode 0640.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        // Single writer, sequential: the cursor never moves backwards, so
        // plain write access behaves as append here.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o640)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            task_count: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written in this process lifetime.
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    /// Append one record with a single write.
    pub fn append(&mut self, record: &LogRecord) -> Result<(), LogError> {
        let buf = record.serialize()?;
        self.file.write_all(&buf)?;
        self.task_count += 1;
        Ok(())
    }

    /// Capture a point-in-time reader over the records written so far.
    pub fn snapshot(&self) -> LogReader {
        LogReader {
            path: self.path.clone(),
            count: self.task_count,
        }
    }
}

/// A bounded replay cursor over the log.
///
/// Reads at most the record count captured at snapshot time, even if the
/// file on disk has grown since.
#[derive(Debug, Clone)]
pub struct LogReader {
    path: PathBuf,
    count: u64,
}

impl LogReader {
    /// Open an existing log read-only, covering every whole record on
    /// disk right now (trailing partial bytes are ignored).
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let len = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            count: len / RECORD_LEN as u64,
        })
    }

    /// Number of records this snapshot covers.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Stream the snapshot's records through `f` in append order.
    ///
    /// Stops early when `f` breaks. A record that cannot be read or
    /// decoded is diagnosed and ends the replay with
    /// [`LogError::InvalidSequence`].
    pub fn read_all<F>(&self, mut f: F) -> Result<(), LogError>
    where
        F: FnMut(LogRecord) -> ControlFlow<()>,
    {
        if self.count == 0 {
            return Ok(());
        }

        let mut file = File::open(&self.path)?;
        let mut buf = [0u8; RECORD_LEN];
        for index in 0..self.count {
            if let Err(e) = file.read_exact(&mut buf) {
                tracing::error!(record = index, "log replay cut short: {e}");
                return Err(LogError::InvalidSequence);
            }
            let record = LogRecord::deserialize(&buf).map_err(|e| {
                tracing::error!(record = index, "undecodable log record");
                e
            })?;
            if let ControlFlow::Break(()) = f(record) {
                break;
            }
        }
        Ok(())
    }
}
