//! Shared harness: a real orchestrator over FIFOs in scratch directories.
#![allow(dead_code)] // each test binary uses a different subset

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use orchd_kernel::{LogReader, LogRecord, Orchestrator, OrchestratorConfig, Policy};
use orchd_protocol::PipePaths;

pub struct TestServer {
    pub paths: PipePaths,
    pub out_dir: PathBuf,
    handle: JoinHandle<()>,
    _pipe_dir: TempDir,
    _out_dir: TempDir,
}

impl TestServer {
    /// Start an orchestrator with its own FIFO and output directories.
    pub fn start(nslots: usize, policy: Policy) -> Self {
        let pipe_dir = tempfile::tempdir().expect("pipe dir");
        let out_dir = tempfile::tempdir().expect("out dir");
        let paths = PipePaths::in_dir(pipe_dir.path());

        let mut orchestrator = Orchestrator::new(OrchestratorConfig {
            out_dir: out_dir.path().to_path_buf(),
            nslots,
            policy,
            paths: paths.clone(),
        })
        .expect("orchestrator startup");

        let handle = tokio::spawn(async move {
            let _ = orchestrator.run().await;
        });

        Self {
            paths,
            out_dir: out_dir.path().to_path_buf(),
            handle,
            _pipe_dir: pipe_dir,
            _out_dir: out_dir,
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.out_dir.join("log.bin")
    }

    /// Every whole record currently in the log, in append order.
    pub fn log_records(&self) -> Vec<LogRecord> {
        read_log(&self.log_path()).unwrap_or_default()
    }

    /// Poll until the log holds `count` records (panics after `timeout`).
    pub async fn wait_for_log_count(&self, count: usize, timeout: Duration) -> Vec<LogRecord> {
        wait_until(timeout, || {
            let records = self.log_records();
            (records.len() >= count).then_some(records)
        })
        .await
        .unwrap_or_else(|| {
            panic!(
                "log never reached {count} records (has {})",
                self.log_records().len()
            )
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn read_log(path: &Path) -> Option<Vec<LogRecord>> {
    let reader = LogReader::open(path).ok()?;
    let mut records = Vec::new();
    reader
        .read_all(|record| {
            records.push(record);
            ControlFlow::Continue(())
        })
        .ok()?;
    Some(records)
}

/// Poll `f` every few milliseconds until it yields a value or `timeout`
/// elapses.
pub async fn wait_until<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> Option<T> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
