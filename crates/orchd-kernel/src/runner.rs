//! Runs one dispatched pipeline and reports its completion.
//!
//! Each dispatched pipeline task becomes one spawned runner. The runner
//! wires the stages together — stage `i`'s stdout feeds stage `i+1`'s
//! stdin, every stderr goes to the task's error file, the final stdout to
//! the task's output file — waits for all of them, and then tells the
//! orchestrator its slot is free again with a `TASK_DONE` message.
//!
//! The completion notification uses the retrying send path: if it is lost,
//! the orchestrator never reclaims the slot.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, ChildStdout, Command};

use orchd_protocol::{ClientMessage, MonoTime, PeerSender, PipePaths, SEND_RETRY_MAX_TRIES};

use crate::task::Program;

/// Everything a runner needs, detached from the scheduler that spawned it.
#[derive(Debug, Clone)]
pub(crate) struct RunnerSpec {
    pub id: u32,
    pub programs: Vec<Program>,
    pub slot: usize,
    pub out_dir: PathBuf,
    pub paths: PipePaths,
}

/// Run the pipeline, notify the orchestrator, resolve to the error bit.
pub(crate) async fn run(spec: RunnerSpec) -> u8 {
    let error = run_pipeline(&spec).await;
    notify_done(&spec.paths, spec.slot, false, error).await;
    error as u8
}

/// Tell the orchestrator that the task in `slot` is done.
///
/// Shared by pipeline runners and the status procedure; `time_ended` is
/// taken before any connection work so it marks the end of the task
/// itself.
pub(crate) async fn notify_done(paths: &PipePaths, slot: usize, is_status: bool, error: bool) {
    let message = ClientMessage::TaskDone {
        slot: slot as u32,
        time_ended: MonoTime::now(),
        is_status,
        error,
    };
    let payload = match message.encode() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(slot, "cannot encode completion notification: {e}");
            return;
        }
    };

    match PeerSender::to_server(paths).await {
        Ok(mut tx) => {
            if let Err(e) = tx.send_retry(&payload, SEND_RETRY_MAX_TRIES).await {
                tracing::error!(slot, "completion notification lost: {e}");
            }
        }
        Err(e) => {
            tracing::error!(slot, "cannot reach orchestrator to report completion: {e}");
        }
    }
}

/// Execute the stages; `true` means at least one stage failed to start or
/// exited non-zero.
async fn run_pipeline(spec: &RunnerSpec) -> bool {
    let out_file = open_capture(&spec.out_dir.join(format!("{}.out", spec.id)));
    let err_file = open_capture(&spec.out_dir.join(format!("{}.err", spec.id)));

    let mut error = false;
    let mut children: Vec<Child> = Vec::with_capacity(spec.programs.len());
    let mut prev_stdout: Option<ChildStdout> = None;
    let last = spec.programs.len() - 1;

    for (i, program) in spec.programs.iter().enumerate() {
        let mut cmd = Command::new(program.name());
        cmd.args(program.args());

        // Stage 0 must not read the server's stdin; later stages read the
        // previous stage's stdout (or EOF if that stage never started).
        cmd.stdin(match prev_stdout.take() {
            Some(stdout) => match TryInto::<Stdio>::try_into(stdout) {
                Ok(stdio) => stdio,
                Err(e) => {
                    tracing::warn!(task = spec.id, stage = i, "lost pipe to previous stage: {e}");
                    error = true;
                    Stdio::null()
                }
            },
            None => Stdio::null(),
        });

        cmd.stdout(if i == last {
            capture_stdio(&out_file)
        } else {
            Stdio::piped()
        });
        cmd.stderr(capture_stdio(&err_file));

        match cmd.spawn() {
            Ok(mut child) => {
                if i != last {
                    prev_stdout = child.stdout.take();
                }
                children.push(child);
            }
            Err(e) => {
                // The C original's exec failure: the stage never runs, the
                // diagnostic lands in the task's error file, and the next
                // stage simply reads EOF.
                error = true;
                report_stage_failure(&err_file, program.name(), &e);
            }
        }
    }

    for mut child in children {
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(_) => error = true,
            Err(e) => {
                tracing::warn!(task = spec.id, "wait for pipeline stage failed: {e}");
                error = true;
            }
        }
    }

    error
}

/// Open a capture file (create + truncate, mode 0640); on failure the
/// stage falls back to the inherited descriptor.
fn open_capture(path: &Path) -> Option<File> {
    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o640)
        .open(path)
    {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                "failed to create capture file, falling back to inherited output: {e}"
            );
            None
        }
    }
}

fn capture_stdio(file: &Option<File>) -> Stdio {
    match file.as_ref().and_then(|f| f.try_clone().ok()) {
        Some(clone) => Stdio::from(clone),
        None => Stdio::inherit(),
    }
}

fn report_stage_failure(err_file: &Option<File>, name: &str, e: &std::io::Error) {
    match err_file {
        Some(file) => {
            let mut w = file;
            let _ = writeln!(w, "orchd: failed to start {name}: {e}");
        }
        None => tracing::warn!("failed to start {name}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &Path, id: u32, command_line: &str) -> RunnerSpec {
        RunnerSpec {
            id,
            programs: crate::parser::parse_pipeline(command_line).unwrap(),
            slot: 0,
            out_dir: dir.to_path_buf(),
            // Points at an empty directory: completion notifications in
            // these tests are exercised (and dropped) without a server.
            paths: PipePaths::in_dir(dir),
        }
    }

    #[tokio::test]
    async fn single_program_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 1, "echo hi")).await;
        assert!(!error);
        let out = std::fs::read_to_string(dir.path().join("1.out")).unwrap();
        assert_eq!(out, "hi\n");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("1.err")).unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn pipeline_stages_are_connected() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 2, "printf ab | tr a X")).await;
        assert!(!error);
        let out = std::fs::read_to_string(dir.path().join("2.out")).unwrap();
        assert_eq!(out, "Xb");
    }

    #[tokio::test]
    async fn three_stage_pipeline_flows_left_to_right() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 3, "printf 'a\nb\nc\n' | grep -v b | tr a-c A-C")).await;
        assert!(!error);
        let out = std::fs::read_to_string(dir.path().join("3.out")).unwrap();
        assert_eq!(out, "A\nC\n");
    }

    #[tokio::test]
    async fn missing_program_sets_the_error_bit() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 4, "definitely-not-a-command-4321")).await;
        assert!(error);
        let err = std::fs::read_to_string(dir.path().join("4.err")).unwrap();
        assert!(err.contains("failed to start"));
    }

    #[tokio::test]
    async fn failed_middle_stage_leaves_downstream_running_on_eof() {
        let dir = tempfile::tempdir().unwrap();
        let error =
            run_pipeline(&spec(dir.path(), 5, "echo hi | no-such-filter-9b3 | wc -c")).await;
        assert!(error);
        // wc still ran, reading EOF.
        let out = std::fs::read_to_string(dir.path().join("5.out")).unwrap();
        assert_eq!(out.trim(), "0");
    }

    #[tokio::test]
    async fn nonzero_exit_sets_the_error_bit() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 6, "false")).await;
        assert!(error);
    }

    #[tokio::test]
    async fn capture_files_are_truncated_on_reuse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("7.out"), "stale contents").unwrap();
        let error = run_pipeline(&spec(dir.path(), 7, "echo fresh")).await;
        assert!(!error);
        let out = std::fs::read_to_string(dir.path().join("7.out")).unwrap();
        assert_eq!(out, "fresh\n");
    }

    #[tokio::test]
    async fn stderr_of_every_stage_lands_in_the_error_file() {
        let dir = tempfile::tempdir().unwrap();
        let error = run_pipeline(&spec(dir.path(), 8, "sh -c 'echo oops >&2' | cat")).await;
        assert!(!error);
        let err = std::fs::read_to_string(dir.path().join("8.err")).unwrap();
        assert_eq!(err, "oops\n");
    }
}
