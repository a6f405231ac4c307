//! Failure-trace truncation.
//!
//! Handler errors can carry arbitrarily long context chains. Middle-omission
//! keeps both the outermost message (what failed) and the innermost cause.

use crate::config::MAX_TRACE_CHARS;

/// Truncate `trace` to about `max_chars` characters using middle-omission.
///
/// The split is done on character boundaries, never inside a multi-byte
/// sequence.
pub fn truncate_trace(trace: &str, max_chars: usize) -> String {
    if trace.len() <= max_chars {
        return trace.to_owned();
    }

    let chars: Vec<char> = trace.chars().collect();
    let total = chars.len();
    if total <= max_chars {
        return trace.to_owned();
    }

    let half = max_chars / 2;
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[total - half..].iter().collect();
    let omitted = total - 2 * half;

    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}

/// [`truncate_trace`] with the default stored-trace cap.
pub fn truncate_default(trace: &str) -> String {
    truncate_trace(trace, MAX_TRACE_CHARS)
}
