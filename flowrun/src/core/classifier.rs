//! Text-based status classification of execution logs.
//!
//! - `failure` comes only from termination (a step raised, or the run was
//!   halted) or, when re-scanning persisted logs, from a missing completion
//!   marker. It is never downgraded by text.
//! - Otherwise a log is `warning` if any line's first 15 characters,
//!   lowercased, contain the warning glyph or `warning:`.
//! - Everything else is `success`.

use crate::core::types::{Status, Termination};

/// Number of leading characters (not bytes) inspected per line.
pub const PREFIX_CHARS: usize = 15;
/// Warning glyph (U+26A0). The emoji form `⚠️` starts with it.
pub const WARNING_GLYPH: char = '⚠';
pub const WARNING_TOKEN: &str = "warning:";

/// Last line of a log whose unit ran to the end without raising.
pub const COMPLETION_MARKER: &str = "[flowrun] execution completed";
/// Line written when a unit raised or was halted.
pub const FAILURE_MARKER: &str = "[flowrun] execution failed";

/// True if the first [`PREFIX_CHARS`] characters of `line` signal a warning.
pub fn line_signals_warning(line: &str) -> bool {
    let prefix: String = line.chars().take(PREFIX_CHARS).collect();
    let prefix = prefix.to_lowercase();
    prefix.contains(WARNING_GLYPH) || prefix.contains(WARNING_TOKEN)
}

/// Scan the whole log once; the first matching line is sufficient.
pub fn has_warning(log_text: &str) -> bool {
    log_text.lines().any(line_signals_warning)
}

/// Classify a finished run from its termination mode and captured log.
pub fn classify(termination: &Termination, log_text: &str) -> Status {
    match termination {
        Termination::Raised { .. } | Termination::Halted { .. } => Status::Failure,
        Termination::Completed => classify_completed(log_text),
    }
}

/// True if the last non-empty line of the log is the completion marker.
pub fn has_completion_marker(log_text: &str) -> bool {
    log_text
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.starts_with(COMPLETION_MARKER))
}

/// Classify a persisted log without knowing how the run ended.
///
/// A log without a trailing completion marker (killed, halted, still being
/// written, or failed) is `failure`.
pub fn classify_persisted(log_text: &str) -> Status {
    if !has_completion_marker(log_text) {
        return Status::Failure;
    }
    classify_completed(log_text)
}

fn classify_completed(log_text: &str) -> Status {
    if has_warning(log_text) {
        Status::Warning
    } else {
        Status::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_log(body: &str) -> String {
        format!("header\n{body}{COMPLETION_MARKER}: 2026-01-01T00:00:00Z\n")
    }

    #[test]
    fn plain_log_is_success() {
        let log = "step 1\nstep 2\n";
        assert_eq!(classify(&Termination::Completed, log), Status::Success);
    }

    #[test]
    fn appending_plain_lines_keeps_success() {
        let mut log = String::from("loading data\n");
        for i in 0..50 {
            log.push_str(&format!("row {i} processed, no warning here at all\n"));
        }
        assert_eq!(classify(&Termination::Completed, &log), Status::Success);
    }

    #[test]
    fn warning_prefix_line_makes_warning() {
        let log = "loading\nwarning: 3 rows dropped\ndone\n";
        assert_eq!(classify(&Termination::Completed, log), Status::Warning);
    }

    #[test]
    fn warning_match_is_case_insensitive() {
        assert!(line_signals_warning("WARNING: upper"));
        assert!(line_signals_warning("  Warning: indented"));
        assert!(line_signals_warning("UserWarning: x"));
    }

    #[test]
    fn warning_glyph_matches() {
        assert!(line_signals_warning("⚠️ Expected results file not found"));
        assert!(line_signals_warning("note ⚠ careful"));
    }

    #[test]
    fn warning_beyond_prefix_is_ignored() {
        // "warning:" starts at character 16.
        assert!(!line_signals_warning("value=123456789 warning: in data"));
        assert!(!line_signals_warning("column_name,status,warning:"));
    }

    #[test]
    fn prefix_counts_characters_not_bytes() {
        // 14 multi-byte characters then the glyph at position 15.
        let line = format!("{}⚠ tail", "\u{e9}".repeat(14));
        assert!(line_signals_warning(&line));
        // Glyph at position 16 is outside the prefix.
        let line = format!("{}⚠ tail", "\u{e9}".repeat(15));
        assert!(!line_signals_warning(&line));
    }

    #[test]
    fn raised_is_failure_even_with_earlier_warnings() {
        let log = "warning: early\n";
        let termination = Termination::Raised {
            message: "exit 1".to_string(),
            exit_code: Some(1),
        };
        assert_eq!(classify(&termination, log), Status::Failure);
    }

    #[test]
    fn halted_is_failure() {
        let termination = Termination::Halted {
            after_step: "load".to_string(),
        };
        assert_eq!(classify(&termination, "ok\n"), Status::Failure);
    }

    #[test]
    fn persisted_log_without_marker_is_failure() {
        assert_eq!(classify_persisted("partial output\n"), Status::Failure);
        assert_eq!(classify_persisted(""), Status::Failure);
    }

    #[test]
    fn persisted_log_with_marker_is_scanned() {
        assert_eq!(classify_persisted(&completed_log("ok\n")), Status::Success);
        assert_eq!(
            classify_persisted(&completed_log("Warning: slow\n")),
            Status::Warning
        );
    }

    #[test]
    fn marker_must_be_last_line() {
        let log = format!("{COMPLETION_MARKER}: early\nmore output\n");
        assert_eq!(classify_persisted(&log), Status::Failure);
    }

    #[test]
    fn failure_marker_after_output_is_failure() {
        let log = format!("output\n{FAILURE_MARKER}: step main exited 1\n");
        assert_eq!(classify_persisted(&log), Status::Failure);
    }
}
