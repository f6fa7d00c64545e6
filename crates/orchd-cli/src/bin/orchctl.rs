//! orchctl — submit work to and query a running orchd server.
//!
//! Usage:
//!   orchctl status                          # Query server status
//!   orchctl execute <ms> -u <command_line>  # Run a single program
//!   orchctl execute <ms> -p <command_line>  # Run a pipeline
//!   orchctl help                            # Show this message
//!
//! Exit codes: 0 success, 1 usage or client failure, 2 server-reported
//! error.

use std::env;
use std::process::ExitCode;

use orchd_client::{ask_status, submit, format_status_line, StatusOutcome, SubmitMode, SubmitOutcome};
use orchd_protocol::PipePaths;

/// Exit code for errors the server reported.
const EXIT_SERVER_ERROR: u8 = 2;

fn main() -> ExitCode {
    orchd_cli::init_tracing();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("orchctl");

    match args.get(1).map(String::as_str) {
        Some("help") => {
            print_help(program);
            ExitCode::SUCCESS
        }
        Some("status") if args.len() == 2 => run_async(cmd_status()),
        Some("execute") if args.len() == 5 => {
            let Ok(expected_ms) = args[2].parse::<u32>() else {
                return usage(program);
            };
            let mode = match args[3].as_str() {
                "-u" => SubmitMode::Single,
                "-p" => SubmitMode::Pipeline,
                _ => return usage(program),
            };
            run_async(cmd_execute(expected_ms, mode, args[4].clone()))
        }
        _ => usage(program),
    }
}

fn usage(program: &str) -> ExitCode {
    print_help(program);
    ExitCode::FAILURE
}

fn print_help(program: &str) {
    eprintln!("Usage:");
    eprintln!("  See this message:    {program} help");
    eprintln!("  Query server status: {program} status");
    eprintln!("  Run single program:  {program} execute <time_ms> -u <command_line>");
    eprintln!("  Run pipeline:        {program} execute <time_ms> -p <command_line>");
}

fn run_async(request: impl std::future::Future<Output = ExitCode>) -> ExitCode {
    match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime.block_on(request),
        Err(e) => {
            eprintln!("Error: failed to build runtime: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_execute(expected_ms: u32, mode: SubmitMode, command_line: String) -> ExitCode {
    match submit(PipePaths::default(), &command_line, expected_ms, mode).await {
        Ok(SubmitOutcome::Scheduled(id)) => {
            println!("Task {id} scheduled");
            ExitCode::SUCCESS
        }
        Ok(SubmitOutcome::Refused(text)) => {
            eprintln!("{text}");
            ExitCode::from(EXIT_SERVER_ERROR)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn cmd_status() -> ExitCode {
    match ask_status(PipePaths::default()).await {
        Ok(StatusOutcome::Snapshot(lines)) => {
            for line in &lines {
                println!("{}", format_status_line(line));
            }
            ExitCode::SUCCESS
        }
        Ok(StatusOutcome::Refused(text)) => {
            eprintln!("{text}");
            ExitCode::from(EXIT_SERVER_ERROR)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
