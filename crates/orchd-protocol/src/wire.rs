//! Typed messages exchanged between clients, the server, and its tasks.
//!
//! Every message starts with a one-byte type tag; fixed fields follow and a
//! trailing string, when present, runs to the end of the frame (its length
//! is implied by the frame length, never stored). Fields are serialized one
//! by one in native byte order — the transport is machine-local, and
//! writing fields explicitly avoids any dependence on struct layout.
//!
//! Decoding validates the frame length for each variant before touching the
//! fields; an invalid message is reported and dropped, the stream carries
//! on.

use thiserror::Error;

use crate::frame::IPC_MAX;
use crate::time::{micros_between, MonoTime, TimeStage};

/// Fixed fields of a submission: tag + pid + time_sent + expected_time.
const SUBMIT_HEADER_LEN: usize = 1 + 4 + TIME_LEN + 4;

/// Serialized [`MonoTime`]: secs + nanos.
const TIME_LEN: usize = 8 + 4;

/// `TASK_DONE` is tag + slot + time_ended + is_status + error.
const TASK_DONE_LEN: usize = 1 + 4 + TIME_LEN + 1 + 1;

/// `STATUS` request and `TASK_ID` reply are tag + one `u32`.
const TAG_U32_LEN: usize = 1 + 4;

/// Fixed fields of a status reply: tag + status + id + error + four `f64`s.
const STATUS_HEADER_LEN: usize = 1 + 1 + 4 + 1 + 4 * 8;

/// Longest command line a submission can carry.
pub const MAX_COMMAND_LEN: usize = IPC_MAX - SUBMIT_HEADER_LEN;

/// Longest command line a status reply can carry.
pub const MAX_STATUS_COMMAND_LEN: usize = IPC_MAX - STATUS_HEADER_LEN;

/// Longest error text the server can report.
pub const MAX_ERROR_LEN: usize = IPC_MAX - 1;

/// Wire protocol violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message too short for its type")]
    TooShort,
    #[error("message too long for its type")]
    TooLong,
    #[error("unknown message type {0}")]
    BadType(u8),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Where a reported task stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Done = 0,
    Executing = 1,
    Queued = 2,
}

impl TaskStatus {
    fn from_u8(v: u8) -> Result<Self, WireError> {
        match v {
            0 => Ok(TaskStatus::Done),
            1 => Ok(TaskStatus::Executing),
            2 => Ok(TaskStatus::Queued),
            other => Err(WireError::BadType(other)),
        }
    }
}

/// Messages flowing toward the server FIFO.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Submit a command line; the parsed task must be a single program.
    SendProgram(Submission),
    /// Submit a command line that may contain a pipeline.
    SendTask(Submission),
    /// A runner or status task reports completion of the task in `slot`.
    TaskDone {
        slot: u32,
        time_ended: MonoTime,
        is_status: bool,
        error: bool,
    },
    /// A client asks for a state snapshot, to be streamed to its FIFO.
    Status { client_pid: u32 },
}

/// Payload shared by `SEND_PROGRAM` and `SEND_TASK`.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub client_pid: u32,
    pub time_sent: MonoTime,
    pub expected_time: u32,
    pub command_line: String,
}

const C2S_SEND_PROGRAM: u8 = 0;
const C2S_SEND_TASK: u8 = 1;
const C2S_TASK_DONE: u8 = 2;
const C2S_STATUS: u8 = 3;

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(SUBMIT_HEADER_LEN);
        match self {
            ClientMessage::SendProgram(s) => encode_submission(&mut out, C2S_SEND_PROGRAM, s)?,
            ClientMessage::SendTask(s) => encode_submission(&mut out, C2S_SEND_TASK, s)?,
            ClientMessage::TaskDone { slot, time_ended, is_status, error } => {
                out.push(C2S_TASK_DONE);
                put_u32(&mut out, *slot);
                put_time(&mut out, *time_ended);
                out.push(*is_status as u8);
                out.push(*error as u8);
            }
            ClientMessage::Status { client_pid } => {
                out.push(C2S_STATUS);
                put_u32(&mut out, *client_pid);
            }
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        match r.take_u8()? {
            tag @ (C2S_SEND_PROGRAM | C2S_SEND_TASK) => {
                let sub = decode_submission(&mut r, payload.len())?;
                if tag == C2S_SEND_PROGRAM {
                    Ok(ClientMessage::SendProgram(sub))
                } else {
                    Ok(ClientMessage::SendTask(sub))
                }
            }
            C2S_TASK_DONE => {
                exact_len(payload.len(), TASK_DONE_LEN)?;
                Ok(ClientMessage::TaskDone {
                    slot: r.take_u32()?,
                    time_ended: r.take_time()?,
                    is_status: r.take_u8()? != 0,
                    error: r.take_u8()? != 0,
                })
            }
            C2S_STATUS => {
                exact_len(payload.len(), TAG_U32_LEN)?;
                Ok(ClientMessage::Status { client_pid: r.take_u32()? })
            }
            other => Err(WireError::BadType(other)),
        }
    }
}

fn encode_submission(out: &mut Vec<u8>, tag: u8, s: &Submission) -> Result<(), WireError> {
    if s.command_line.is_empty() {
        return Err(WireError::TooShort);
    }
    if s.command_line.len() > MAX_COMMAND_LEN {
        return Err(WireError::TooLong);
    }
    out.push(tag);
    put_u32(out, s.client_pid);
    put_time(out, s.time_sent);
    put_u32(out, s.expected_time);
    out.extend_from_slice(s.command_line.as_bytes());
    Ok(())
}

fn decode_submission(r: &mut Reader<'_>, total: usize) -> Result<Submission, WireError> {
    // At least one command byte must follow the fixed fields.
    if total <= SUBMIT_HEADER_LEN {
        return Err(WireError::TooShort);
    }
    if total > IPC_MAX {
        return Err(WireError::TooLong);
    }
    Ok(Submission {
        client_pid: r.take_u32()?,
        time_sent: r.take_time()?,
        expected_time: r.take_u32()?,
        command_line: r.take_rest_str()?,
    })
}

/// Messages flowing from the server toward one client FIFO.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// A request was refused; the text explains why.
    Error { text: String },
    /// A submission was accepted under this identifier.
    TaskId { id: u32 },
    /// One task in a status snapshot.
    Status(StatusResponse),
}

/// One line of a status snapshot.
///
/// The four interval fields are microseconds, NaN when the interval's
/// endpoints are not both set (a queued task has no executing time).
#[derive(Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub status: TaskStatus,
    pub id: u32,
    pub error: bool,
    pub time_c2s_fifo: f64,
    pub time_waiting: f64,
    pub time_executing: f64,
    pub time_s2s_fifo: f64,
    pub command_line: String,
}

impl StatusResponse {
    /// Derive a status line from a task's stage timestamps.
    ///
    /// A completed task is done, a dispatched one is executing, anything
    /// else is still queued; the intervals come from adjacent stage pairs.
    pub fn from_times(
        command_line: &str,
        id: u32,
        error: bool,
        times: &[Option<MonoTime>; TimeStage::COUNT],
    ) -> Self {
        let status = if times[TimeStage::Completed as usize].is_some() {
            TaskStatus::Done
        } else if times[TimeStage::Dispatched as usize].is_some() {
            TaskStatus::Executing
        } else {
            TaskStatus::Queued
        };

        let t = |stage: TimeStage| times[stage as usize];
        Self {
            status,
            id,
            error,
            time_c2s_fifo: micros_between(t(TimeStage::Arrived), t(TimeStage::Sent)),
            time_waiting: micros_between(t(TimeStage::Dispatched), t(TimeStage::Arrived)),
            time_executing: micros_between(t(TimeStage::Ended), t(TimeStage::Dispatched)),
            time_s2s_fifo: micros_between(t(TimeStage::Completed), t(TimeStage::Ended)),
            command_line: command_line.to_owned(),
        }
    }
}

const S2C_ERROR: u8 = 0;
const S2C_TASK_ID: u8 = 1;
const S2C_STATUS: u8 = 2;

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(STATUS_HEADER_LEN);
        match self {
            ServerMessage::Error { text } => {
                if text.is_empty() {
                    return Err(WireError::TooShort);
                }
                if text.len() > MAX_ERROR_LEN {
                    return Err(WireError::TooLong);
                }
                out.push(S2C_ERROR);
                out.extend_from_slice(text.as_bytes());
            }
            ServerMessage::TaskId { id } => {
                out.push(S2C_TASK_ID);
                put_u32(&mut out, *id);
            }
            ServerMessage::Status(s) => {
                if s.command_line.len() > MAX_STATUS_COMMAND_LEN {
                    return Err(WireError::TooLong);
                }
                out.push(S2C_STATUS);
                out.push(s.status as u8);
                put_u32(&mut out, s.id);
                out.push(s.error as u8);
                put_f64(&mut out, s.time_c2s_fifo);
                put_f64(&mut out, s.time_waiting);
                put_f64(&mut out, s.time_executing);
                put_f64(&mut out, s.time_s2s_fifo);
                out.extend_from_slice(s.command_line.as_bytes());
            }
        }
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(payload);
        match r.take_u8()? {
            S2C_ERROR => {
                if payload.len() < 2 {
                    return Err(WireError::TooShort);
                }
                if payload.len() > IPC_MAX {
                    return Err(WireError::TooLong);
                }
                Ok(ServerMessage::Error { text: r.take_rest_str()? })
            }
            S2C_TASK_ID => {
                exact_len(payload.len(), TAG_U32_LEN)?;
                Ok(ServerMessage::TaskId { id: r.take_u32()? })
            }
            S2C_STATUS => {
                // The command line may legitimately be empty here (it is
                // bounded, not length-prefixed), so only the fixed fields
                // are required.
                if payload.len() < STATUS_HEADER_LEN {
                    return Err(WireError::TooShort);
                }
                if payload.len() > IPC_MAX {
                    return Err(WireError::TooLong);
                }
                Ok(ServerMessage::Status(StatusResponse {
                    status: TaskStatus::from_u8(r.take_u8()?)?,
                    id: r.take_u32()?,
                    error: r.take_u8()? != 0,
                    time_c2s_fifo: r.take_f64()?,
                    time_waiting: r.take_f64()?,
                    time_executing: r.take_f64()?,
                    time_s2s_fifo: r.take_f64()?,
                    command_line: r.take_rest_str()?,
                }))
            }
            other => Err(WireError::BadType(other)),
        }
    }
}

fn exact_len(actual: usize, expected: usize) -> Result<(), WireError> {
    use std::cmp::Ordering;
    match actual.cmp(&expected) {
        Ordering::Less => Err(WireError::TooShort),
        Ordering::Greater => Err(WireError::TooLong),
        Ordering::Equal => Ok(()),
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn put_f64(out: &mut Vec<u8>, v: f64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn put_time(out: &mut Vec<u8>, t: MonoTime) {
    out.extend_from_slice(&t.secs.to_ne_bytes());
    out.extend_from_slice(&t.nanos.to_ne_bytes());
}

/// Bounds-checked field reader over a message payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::TooShort)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::TooShort)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_f64(&mut self) -> Result<f64, WireError> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_time(&mut self) -> Result<MonoTime, WireError> {
        Ok(MonoTime {
            secs: self.take_u64()?,
            nanos: self.take_u32()?,
        })
    }

    fn take_rest_str(&mut self) -> Result<String, WireError> {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        String::from_utf8(rest.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
}
