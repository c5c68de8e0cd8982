//! Segment discovery: list, filter, and order candidate log files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::timestamp::extract_order_key;

/// Where a segment's order key comes from. Chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKeySource {
    /// Parse the timestamp out of the file name.
    FileName,
    /// Use the filesystem's last-modified time.
    ModifiedTime,
}

/// Immutable selection parameters for a run.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    /// Regex the whole base name must match.
    pub name_pattern: Regex,
    /// chrono format for the timestamp captured from the name.
    pub date_format: String,
    /// 1-based capture group holding the timestamp text.
    pub date_group: usize,
    /// Exclusive lower bound - only keys strictly after this qualify.
    pub cutoff: DateTime<Utc>,
    pub source: OrderKeySource,
}

impl SelectionCriteria {
    /// Whole-name match against the segment pattern.
    pub fn matches_name(&self, name: &str) -> bool {
        is_full_match(&self.name_pattern, name)
    }
}

/// One candidate log file, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub order_key: DateTime<Utc>,
}

/// List the immediate children of `dir` and return the segments that pass
/// every filter stage, ordered ascending by key.
///
/// Filter stages, each short-circuiting to reject: name match, exclusion
/// set, resolvable order key, strictly-after-cutoff. A failure evaluating a
/// single candidate drops that candidate only; an unreadable directory is
/// an error.
///
/// Key ties are broken by file name so the order is total regardless of
/// enumeration order.
pub async fn select_segments(
    dir: &Path,
    criteria: &SelectionCriteria,
    exclusions: &HashSet<PathBuf>,
) -> Result<Vec<Segment>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            debug!(path = %path.display(), "skipping non-UTF8 file name");
            continue;
        };

        if !criteria.matches_name(name) {
            continue;
        }

        if exclusions.contains(&path) {
            debug!(path = %path.display(), "already attempted this run");
            continue;
        }

        let order_key = match criteria.source {
            OrderKeySource::FileName => {
                match extract_order_key(
                    &criteria.name_pattern,
                    &criteria.date_format,
                    criteria.date_group,
                    &path,
                ) {
                    Some(key) => key,
                    None => continue,
                }
            }
            OrderKeySource::ModifiedTime => match modified_time(&entry).await {
                Some(key) => key,
                None => {
                    warn!(path = %path.display(), "could not read modification time");
                    continue;
                }
            },
        };

        if order_key <= criteria.cutoff {
            continue;
        }

        segments.push(Segment { path, order_key });
    }

    segments.sort_by(|a, b| {
        a.order_key
            .cmp(&b.order_key)
            .then_with(|| a.path.cmp(&b.path))
    });

    Ok(segments)
}

async fn modified_time(entry: &tokio::fs::DirEntry) -> Option<DateTime<Utc>> {
    let metadata = entry.metadata().await.ok()?;
    let modified = metadata.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}

fn is_full_match(pattern: &Regex, name: &str) -> bool {
    pattern
        .find(name)
        .is_some_and(|m| m.start() == 0 && m.end() == name.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn criteria(cutoff: DateTime<Utc>) -> SelectionCriteria {
        SelectionCriteria {
            name_pattern: Regex::new(r"(?:[\w_-]+?)(\d{14})\.trn").unwrap(),
            date_format: "%Y%m%d%H%M%S".to_string(),
            date_group: 1,
            cutoff,
            source: OrderKeySource::FileName,
        }
    }

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"segment").unwrap();
        path
    }

    #[tokio::test]
    async fn cutoff_is_exclusive_and_order_ascending() {
        let tmp = tempdir().unwrap();
        touch(tmp.path(), "db20230101010000.trn");
        let second = touch(tmp.path(), "db20230102010000.trn");
        let third = touch(tmp.path(), "db20230103010000.trn");

        let cutoff = Utc.with_ymd_and_hms(2023, 1, 1, 1, 0, 0).unwrap();
        let segments = select_segments(tmp.path(), &criteria(cutoff), &HashSet::new())
            .await
            .unwrap();

        let paths: Vec<_> = segments.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, vec![second, third]);
    }

    #[tokio::test]
    async fn rejects_names_not_matching_pattern() {
        let tmp = tempdir().unwrap();
        touch(tmp.path(), "db20230102010000.bak");
        touch(tmp.path(), "notes.txt");

        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let segments = select_segments(tmp.path(), &criteria(cutoff), &HashSet::new())
            .await
            .unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn excluded_paths_are_not_reselected() {
        let tmp = tempdir().unwrap();
        let first = touch(tmp.path(), "db20230102010000.trn");
        let second = touch(tmp.path(), "db20230103010000.trn");

        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut exclusions = HashSet::new();
        exclusions.insert(first);

        let segments = select_segments(tmp.path(), &criteria(cutoff), &exclusions)
            .await
            .unwrap();
        let paths: Vec<_> = segments.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, vec![second]);
    }

    #[tokio::test]
    async fn selection_is_idempotent_once_excluded() {
        let tmp = tempdir().unwrap();
        touch(tmp.path(), "db20230102010000.trn");
        touch(tmp.path(), "db20230103010000.trn");

        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let mut exclusions = HashSet::new();

        let first_pass = select_segments(tmp.path(), &criteria(cutoff), &exclusions)
            .await
            .unwrap();
        assert_eq!(first_pass.len(), 2);
        exclusions.extend(first_pass.into_iter().map(|s| s.path));

        let second_pass = select_segments(tmp.path(), &criteria(cutoff), &exclusions)
            .await
            .unwrap();
        assert!(second_pass.is_empty());
    }

    #[tokio::test]
    async fn key_ties_break_by_file_name() {
        let tmp = tempdir().unwrap();
        let b = touch(tmp.path(), "b_20230102010000.trn");
        let a = touch(tmp.path(), "a_20230102010000.trn");

        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let segments = select_segments(tmp.path(), &criteria(cutoff), &HashSet::new())
            .await
            .unwrap();
        let paths: Vec<_> = segments.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, vec![a, b]);
    }

    #[tokio::test]
    async fn unparseable_keys_drop_only_that_candidate() {
        let tmp = tempdir().unwrap();
        // Matches the loose pattern but carries no parseable timestamp.
        let loose = SelectionCriteria {
            name_pattern: Regex::new(r"(?:[\w_-]+?)(\d+)\.trn").unwrap(),
            date_format: "%Y%m%d%H%M%S".to_string(),
            date_group: 1,
            cutoff: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            source: OrderKeySource::FileName,
        };
        touch(tmp.path(), "db1.trn");
        let good = touch(tmp.path(), "db20230102010000.trn");

        let segments = select_segments(tmp.path(), &loose, &HashSet::new())
            .await
            .unwrap();
        let paths: Vec<_> = segments.iter().map(|s| s.path.clone()).collect();
        assert_eq!(paths, vec![good]);
    }

    #[tokio::test]
    async fn modified_time_mode_respects_cutoff() {
        let tmp = tempdir().unwrap();
        touch(tmp.path(), "db20230102010000.trn");

        let mut by_mtime = criteria(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        by_mtime.source = OrderKeySource::ModifiedTime;

        let segments = select_segments(tmp.path(), &by_mtime, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(segments.len(), 1);

        // A cutoff in the far future filters everything out.
        by_mtime.cutoff = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        let segments = select_segments(tmp.path(), &by_mtime, &HashSet::new())
            .await
            .unwrap();
        assert!(segments.is_empty());
    }

    #[tokio::test]
    async fn missing_directory_is_an_error() {
        let tmp = tempdir().unwrap();
        let gone = tmp.path().join("nope");
        let cutoff = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let result = select_segments(&gone, &criteria(cutoff), &HashSet::new()).await;
        assert!(result.is_err());
    }
}
