//! Order-key extraction from segment file names.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{error, warn};

/// Parse a UTC timestamp out of a file's base name.
///
/// The whole base name must match `pattern`; the capture group at
/// `group_index` (1-based) is then parsed with the chrono `date_format`.
/// Returns `None` on any mismatch or parse failure - callers treat an
/// unresolvable key as "filter this candidate out", never as an abort.
pub fn extract_order_key(
    pattern: &Regex,
    date_format: &str,
    group_index: usize,
    path: &Path,
) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;

    let Some(captures) = captures_full(pattern, name) else {
        warn!(
            file = %name,
            pattern = %pattern.as_str(),
            "file name does not match pattern"
        );
        return None;
    };

    // captures_len counts the implicit whole-match group at index 0.
    if group_index >= pattern.captures_len() {
        error!(
            pattern = %pattern.as_str(),
            group_index,
            "pattern has no capture group at the configured index"
        );
        return None;
    }

    let text = captures.get(group_index)?.as_str();

    match NaiveDateTime::parse_from_str(text, date_format) {
        Ok(naive) => Some(naive.and_utc()),
        Err(err) => {
            warn!(
                file = %name,
                text = %text,
                format = %date_format,
                %err,
                "timestamp did not parse"
            );
            None
        }
    }
}

/// Capture against the whole name, not a substring.
fn captures_full<'t>(pattern: &Regex, name: &'t str) -> Option<regex::Captures<'t>> {
    let captures = pattern.captures(name)?;
    let whole = captures.get(0)?;
    (whole.start() == 0 && whole.end() == name.len()).then_some(captures)
}
