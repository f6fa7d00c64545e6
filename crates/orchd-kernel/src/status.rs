//! The status snapshot: a procedure task that streams server state to one
//! client.
//!
//! The snapshot is captured when the request is handled — the log's record
//! count plus copies of the main scheduler's running and queued tasks —
//! and streamed from a spawned task so a slow or dead client never stalls
//! the orchestrator. Consistency with later server state is explicitly not
//! promised; the client gets the world as it was at capture time.

use std::ops::ControlFlow;

use async_trait::async_trait;

use orchd_protocol::{PeerSender, PipePaths, ServerMessage, StatusResponse};

use crate::log::{LogFile, LogReader, LogRecord};
use crate::runner;
use crate::scheduler::Scheduler;
use crate::task::{Procedure, TaggedTask};

/// One captured status request, ready to run as a procedure task.
pub struct StatusJob {
    client_pid: u32,
    log: LogReader,
    running: Vec<TaggedTask>,
    queued: Vec<TaggedTask>,
    paths: PipePaths,
}

impl StatusJob {
    /// Capture the requesting client and the server state to report.
    pub fn capture(
        client_pid: u32,
        log: &LogFile,
        scheduler: &Scheduler,
        paths: PipePaths,
    ) -> Self {
        Self {
            client_pid,
            log: log.snapshot(),
            running: scheduler.running().cloned().collect(),
            queued: scheduler.queued().cloned().collect(),
            paths,
        }
    }

    /// Stream the snapshot to the client; returns the exit-code byte.
    async fn stream(&self) -> u8 {
        let tx = match PeerSender::to_client(&self.paths, self.client_pid).await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(
                    client_pid = self.client_pid,
                    "cannot open connection for status reply: {e}"
                );
                return 1;
            }
        };

        // Historical tasks first, replayed from the log snapshot.
        let mut done: Vec<LogRecord> = Vec::with_capacity(self.log.count() as usize);
        if let Err(e) = self.log.read_all(|record| {
            done.push(record);
            ControlFlow::Continue(())
        }) {
            tracing::warn!("failed to read log file, continuing: {e}");
        }
        for record in &done {
            let response =
                StatusResponse::from_times(&record.command_line, record.id, record.error, &record.times);
            send_line(&tx, response).await;
        }

        // Then the live view: occupied slots, then the queue.
        for task in self.running.iter().chain(self.queued.iter()) {
            let response =
                StatusResponse::from_times(task.command_line(), task.id(), false, task.times());
            send_line(&tx, response).await;
        }

        // Dropping the sender closes the stream; the client reads EOF and
        // knows the snapshot is complete.
        0
    }
}

/// Send one status line, ignoring delivery failures (the snapshot keeps
/// streaming; a half-served client is its own problem).
async fn send_line(tx: &PeerSender, response: StatusResponse) {
    let message = ServerMessage::Status(response);
    match message.encode() {
        Ok(payload) => {
            if let Err(e) = tx.send(&payload).await {
                tracing::debug!("status line dropped: {e}");
            }
        }
        Err(e) => tracing::warn!("status line could not be encoded: {e}"),
    }
}

#[async_trait]
impl Procedure for StatusJob {
    async fn run(&self, slot: usize) -> u8 {
        let code = self.stream().await;
        runner::notify_done(&self.paths, slot, true, false).await;
        code
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use orchd_protocol::{ClientConn, MonoTime, ServerConn, TaskStatus, TimeStage};

    use crate::queue::Policy;

    use super::*;

    fn sample_task(id: u32, stamped_through: TimeStage) -> TaggedTask {
        let mut task = TaggedTask::from_command_line("echo hi", id, 100).unwrap();
        for stage in TimeStage::ALL {
            if stage <= stamped_through {
                task.stamp(stage);
            }
        }
        task
    }

    fn scheduler(dir: &Path) -> Scheduler {
        Scheduler::new(
            Policy::Fcfs,
            2,
            dir.to_path_buf(),
            PipePaths::in_dir(dir),
        )
        .unwrap()
    }

    /// Drive a captured job against a real client FIFO and collect what
    /// the client would see.
    async fn collect_stream(job: StatusJob, paths: PipePaths) -> (Vec<ServerMessage>, Vec<u8>) {
        let mut server = ServerConn::new(paths.clone()).unwrap();
        let mut client = ClientConn::connect(paths).await.unwrap();

        let job_pid = client.pid();
        assert_eq!(job.client_pid, job_pid);

        let streamer = tokio::spawn(async move { job.run(0).await });

        let mut lines = Vec::new();
        while let Some(payload) = client.recv().await.unwrap() {
            lines.push(ServerMessage::decode(&payload).unwrap());
        }
        let done_payload = server.recv().await.unwrap();
        streamer.await.unwrap();
        (lines, done_payload)
    }

    #[tokio::test]
    async fn snapshot_streams_done_then_running_then_queued() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());

        let mut log = LogFile::create(dir.path().join("log.bin")).unwrap();
        log.append(&LogRecord::from_task(
            &sample_task(1, TimeStage::Completed),
            true,
        ))
        .unwrap();

        let mut sched = scheduler(dir.path());
        sched.add(sample_task(3, TimeStage::Arrived));
        // Slot occupancy without spawning: capture only clones the tasks,
        // so a queued-then-captured scheduler is enough for the queue leg;
        // the running leg is exercised in the orchestrator suite.

        let job = StatusJob::capture(std::process::id(), &log, &sched, paths.clone());
        let (lines, done_payload) = collect_stream(job, paths).await;

        assert_eq!(lines.len(), 2);
        match &lines[0] {
            ServerMessage::Status(s) => {
                assert_eq!(s.status, TaskStatus::Done);
                assert_eq!(s.id, 1);
                assert!(s.error);
                assert!(!s.time_executing.is_nan());
            }
            other => panic!("expected status line, got {other:?}"),
        }
        match &lines[1] {
            ServerMessage::Status(s) => {
                assert_eq!(s.status, TaskStatus::Queued);
                assert_eq!(s.id, 3);
                assert!(s.time_executing.is_nan());
            }
            other => panic!("expected status line, got {other:?}"),
        }

        // The job reported its own completion with the status flag.
        let done = orchd_protocol::ClientMessage::decode(&done_payload).unwrap();
        match done {
            orchd_protocol::ClientMessage::TaskDone { slot, is_status, error, time_ended } => {
                assert_eq!(slot, 0);
                assert!(is_status);
                assert!(!error);
                assert_ne!(time_ended, MonoTime::default());
            }
            other => panic!("expected TASK_DONE, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_snapshot_still_closes_the_stream_and_reports_done() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PipePaths::in_dir(dir.path());

        let log = LogFile::create(dir.path().join("log.bin")).unwrap();
        let sched = scheduler(dir.path());

        let job = StatusJob::capture(std::process::id(), &log, &sched, paths.clone());
        let (lines, done_payload) = collect_stream(job, paths).await;

        assert!(lines.is_empty());
        assert!(matches!(
            orchd_protocol::ClientMessage::decode(&done_payload).unwrap(),
            orchd_protocol::ClientMessage::TaskDone { is_status: true, .. }
        ));
    }
}
