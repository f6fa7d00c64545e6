//! Human-readable rendering of status snapshots.

use orchd_protocol::{StatusResponse, TaskStatus};

/// Pick a unit for a microsecond interval.
///
/// Undefined intervals (NaN) render as `|-?-|`.
pub fn format_micros(micros: f64) -> String {
    if micros >= 1_000_000.0 {
        format!("{:.3}s", micros / 1_000_000.0)
    } else if micros >= 1_000.0 {
        format!("{:.3}ms", micros / 1_000.0)
    } else if micros.is_nan() {
        "|-?-|".to_owned()
    } else {
        format!("{micros:.3}us")
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Done => "DONE",
        TaskStatus::Executing => "EXECUTING",
        TaskStatus::Queued => "QUEUED",
    }
}

/// One status line:
/// `(STATUS) "command" c2s-fifo waiting executing s2s-fifo`.
pub fn format_status_line(line: &StatusResponse) -> String {
    format!(
        "({}) \"{}\" {} {} {} {}",
        status_str(line.status),
        line.command_line,
        format_micros(line.time_c2s_fifo),
        format_micros(line.time_waiting),
        format_micros(line.time_executing),
        format_micros(line.time_s2s_fifo),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_selection_scales_with_magnitude() {
        assert_eq!(format_micros(12.5), "12.500us");
        assert_eq!(format_micros(1_500.0), "1.500ms");
        assert_eq!(format_micros(2_500_000.0), "2.500s");
    }

    #[test]
    fn undefined_interval_is_a_placeholder() {
        assert_eq!(format_micros(f64::NAN), "|-?-|");
    }

    #[test]
    fn zero_is_microseconds() {
        assert_eq!(format_micros(0.0), "0.000us");
    }

    #[test]
    fn lines_carry_status_and_command() {
        let line = StatusResponse {
            status: TaskStatus::Executing,
            id: 4,
            error: false,
            time_c2s_fifo: 10.0,
            time_waiting: 2_000.0,
            time_executing: f64::NAN,
            time_s2s_fifo: f64::NAN,
            command_line: "sleep 5".to_owned(),
        };
        assert_eq!(
            format_status_line(&line),
            "(EXECUTING) \"sleep 5\" 10.000us 2.000ms |-?-| |-?-|"
        );
    }
}
