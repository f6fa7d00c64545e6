//! The orchestrator: one cooperative loop gluing the pieces together.
//!
//! Receive a message, handle it, then try to dispatch — arrivals and
//! completions are the only events that change what is schedulable, and
//! both arrive as messages, so a dispatch pass after each one is exactly
//! "dispatch whenever the listener would otherwise block".
//!
//! There is no in-process parallelism to reason about: the loop owns the
//! schedulers, the log and the id counter outright, and the tasks it
//! spawns talk back only through the server FIFO.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use orchd_protocol::{
    ClientMessage, IpcError, MonoTime, PeerSender, PipePaths, ServerConn, ServerMessage,
    Submission, TimeStage, SEND_RETRY_MAX_TRIES,
};

use crate::log::{LogFile, LogRecord};
use crate::queue::Policy;
use crate::scheduler::{Scheduler, SchedulerError, STATUS_SLOTS};
use crate::status::StatusJob;
use crate::task::TaggedTask;

/// Reply sent when a submission fails to parse.
pub const PARSING_FAILURE_ERROR: &str = "Parsing failure!";

/// Reply sent when the status scheduler is full.
pub const NO_CAPACITY_ERROR: &str = "No capacity available!";

/// Everything the server binary decides before startup.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Where the log and per-task capture files live.
    pub out_dir: PathBuf,
    /// Concurrency cap of the main scheduler.
    pub nslots: usize,
    /// Policy of the main scheduler.
    pub policy: Policy,
    /// FIFO rendezvous directory.
    pub paths: PipePaths,
}

/// Failures that prevent the server from starting at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create server FIFO: {0}")]
    Ipc(#[from] IpcError),

    #[error("failed to open log file: {0}")]
    Log(#[source] io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// The long-running server core.
pub struct Orchestrator {
    conn: ServerConn,
    main: Scheduler,
    status: Scheduler,
    log: LogFile,
    next_id: u32,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self, StartupError> {
        // Claim the FIFO before touching the log: a second server started
        // by mistake must bounce off AlreadyExists without truncating the
        // running server's log.
        let conn = ServerConn::new(config.paths.clone())?;
        let log = LogFile::create(config.out_dir.join("log.bin")).map_err(StartupError::Log)?;
        let main = Scheduler::new(
            config.policy,
            config.nslots,
            config.out_dir.clone(),
            config.paths.clone(),
        )?;
        let status = Scheduler::new(
            Policy::Fcfs,
            STATUS_SLOTS,
            config.out_dir,
            config.paths,
        )?;

        Ok(Self {
            conn,
            main,
            status,
            log,
            next_id: 1,
        })
    }

    /// Serve until the transport fails.
    pub async fn run(&mut self) -> Result<(), IpcError> {
        tracing::info!(
            policy = %self.main.policy(),
            slots = self.main.slot_count(),
            log = %self.log.path().display(),
            "orchestrator listening"
        );
        loop {
            let payload = self.conn.recv().await?;
            self.handle(&payload).await;
            self.main.dispatch_possible();
        }
    }

    async fn handle(&mut self, payload: &[u8]) {
        let message = match ClientMessage::decode(payload) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("dropping undecodable message: {e}");
                return;
            }
        };

        match message {
            ClientMessage::SendProgram(submission) => {
                self.handle_submission(submission, true).await;
            }
            ClientMessage::SendTask(submission) => {
                self.handle_submission(submission, false).await;
            }
            ClientMessage::TaskDone { slot, time_ended, is_status, error } => {
                self.handle_task_done(slot as usize, time_ended, is_status, error).await;
            }
            ClientMessage::Status { client_pid } => {
                self.handle_status(client_pid).await;
            }
        }
    }

    /// Parse, tag, queue and acknowledge a submission.
    ///
    /// `single` demands the parsed pipeline have exactly one stage (the
    /// `SEND_PROGRAM` contract); everything that fails to parse — or fails
    /// that check — is the same "Parsing failure!" to the client.
    async fn handle_submission(&mut self, submission: Submission, single: bool) {
        let id = self.next_id;
        let parsed =
            TaggedTask::from_command_line(&submission.command_line, id, submission.expected_time);

        let mut task = match parsed {
            Ok(task) if !single || task.pipeline().map(|p| p.len()) == Some(1) => task,
            _ => {
                tracing::debug!(
                    command = %submission.command_line,
                    "rejecting unparsable submission"
                );
                self.reply(
                    submission.client_pid,
                    &ServerMessage::Error { text: PARSING_FAILURE_ERROR.to_owned() },
                )
                .await;
                return;
            }
        };

        task.set_time(TimeStage::Sent, submission.time_sent);
        task.stamp(TimeStage::Arrived);
        self.next_id += 1;

        tracing::info!(id, command = task.command_line(), "task accepted");
        self.main.add(task);
        self.reply(submission.client_pid, &ServerMessage::TaskId { id }).await;
    }

    /// Reclaim the slot named by a completion notification.
    async fn handle_task_done(
        &mut self,
        slot: usize,
        time_ended: MonoTime,
        is_status: bool,
        error: bool,
    ) {
        let scheduler = if is_status { &mut self.status } else { &mut self.main };
        match scheduler.mark_done(slot, time_ended).await {
            Ok(task) => {
                if !is_status {
                    tracing::info!(id = task.id(), error, "task completed");
                    let record = LogRecord::from_task(&task, error);
                    if let Err(e) = self.log.append(&record) {
                        tracing::error!(id = task.id(), "failed to append log record: {e}");
                    }
                }
            }
            // Unknown or vacant slot: diagnose and drop.
            Err(e) => tracing::warn!(slot, is_status, "unusable completion notification: {e}"),
        }
    }

    /// Capture and dispatch a status snapshot, or refuse outright.
    async fn handle_status(&mut self, client_pid: u32) {
        if !self.status.can_schedule_now() {
            tracing::warn!(client_pid, "status request refused: no capacity");
            self.reply(
                client_pid,
                &ServerMessage::Error { text: NO_CAPACITY_ERROR.to_owned() },
            )
            .await;
            return;
        }

        let job = StatusJob::capture(client_pid, &self.log, &self.main, self.paths().clone());
        self.status.add(TaggedTask::from_procedure(Arc::new(job), 0, 0));
        self.status.dispatch_possible();
    }

    /// Send one reply to a client, with retries; failures are diagnosed
    /// and swallowed (the client may simply be gone).
    async fn reply(&self, client_pid: u32, message: &ServerMessage) {
        let payload = match message.encode() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(client_pid, "cannot encode reply: {e}");
                return;
            }
        };

        match PeerSender::to_client(self.paths(), client_pid).await {
            Ok(mut tx) => {
                if let Err(e) = tx.send_retry(&payload, SEND_RETRY_MAX_TRIES).await {
                    tracing::error!(client_pid, "failed to deliver reply: {e}");
                }
            }
            Err(e) => tracing::error!(client_pid, "failed to open reply channel: {e}"),
        }
    }

    fn paths(&self) -> &PipePaths {
        self.conn.paths()
    }
}
