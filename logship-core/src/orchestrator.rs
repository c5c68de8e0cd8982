//! Run orchestration: optional seed restore, the catch-up drain, and the
//! live-monitoring loop, in that order.
//!
//! Catch-up tolerates per-segment failures (a failed segment is excluded
//! and the pass continues); the seed and the live loop do not - there is no
//! persisted exclusion state, so a failed live apply cannot be resumed
//! without risking a duplicate or a gap, and the run terminates instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::apply::Applier;
use crate::error::{Result, ShipError};
use crate::select::{OrderKeySource, Segment, SelectionCriteria, select_segments};
use crate::timestamp::extract_order_key;
use crate::watch::{DirWatcher, WatchEventKind, WatchOutcome, WatchSink};

/// Capture group holding the timestamp in both name patterns.
const DATE_GROUP: usize = 1;

/// Already-parsed values driving one run. Loading and validating the
/// configuration surface is the binary's job.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory the log segments land in.
    pub backup_dir: PathBuf,
    /// Regex selecting log segments; group 1 carries the timestamp.
    pub log_pattern: Regex,
    /// chrono format for the captured timestamp.
    pub log_date_format: String,
    /// Full backup artifact, for seeding and/or cutoff derivation.
    pub full_backup_path: Option<PathBuf>,
    /// Regex for the full backup name; group 1 carries the timestamp.
    pub full_pattern: Option<Regex>,
    pub full_date_format: Option<String>,
    /// Explicit exclusive cutoff. Wins over derivation from the full
    /// backup's name.
    pub later_than: Option<DateTime<Utc>>,
    /// Order segments by filesystem modification time instead of by the
    /// timestamp in their names.
    pub use_modified_time: bool,
    /// Restore the full backup before any segment.
    pub seed_restore: bool,
    /// Keep watching the backup directory after catch-up drains.
    pub monitor: bool,
}

/// Mutable state for one invocation. Owned by the orchestrator; nothing
/// else writes it.
#[derive(Debug)]
pub struct RunState {
    pub cutoff: DateTime<Utc>,
    /// Paths already attempted this run. Grows only.
    pub exclusions: HashSet<PathBuf>,
    pub seeded: bool,
}

impl RunState {
    fn new(cutoff: DateTime<Utc>) -> Self {
        Self {
            cutoff,
            exclusions: HashSet::new(),
            seeded: false,
        }
    }
}

/// How a run ended. Both variants map to a zero exit status; failures
/// surface as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

enum Drain {
    Empty,
    Cancelled,
}

/// Sequences seed, catch-up, and live monitoring against one applier.
pub struct Orchestrator {
    config: RunConfig,
    applier: Arc<dyn Applier>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: RunConfig, applier: Arc<dyn Applier>) -> Self {
        Self { config, applier }
    }

    /// Drive one full run to completion or cancellation.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let backup_dir = std::path::absolute(&self.config.backup_dir)?;
        if !backup_dir.is_dir() {
            return Err(ShipError::Config(format!(
                "backup directory '{}' does not exist",
                backup_dir.display()
            )));
        }

        let cutoff = self.resolve_cutoff()?;
        info!(%cutoff, "replaying segments strictly after the cutoff");
        let mut state = RunState::new(cutoff);

        if self.config.seed_restore {
            self.seed(&mut state).await?;
        }

        match self.catch_up(&backup_dir, &mut state, cancel).await? {
            Drain::Cancelled => return Ok(RunOutcome::Cancelled),
            Drain::Empty => {}
        }

        if !self.config.monitor {
            return Ok(RunOutcome::Completed);
        }

        self.live_monitor(&backup_dir, &mut state, cancel).await
    }

    /// The explicit cutoff wins; otherwise it is parsed out of the full
    /// backup's file name. No resolvable cutoff is a configuration error.
    fn resolve_cutoff(&self) -> Result<DateTime<Utc>> {
        if let Some(cutoff) = self.config.later_than {
            return Ok(cutoff);
        }

        if let (Some(path), Some(pattern), Some(format)) = (
            &self.config.full_backup_path,
            &self.config.full_pattern,
            &self.config.full_date_format,
        ) {
            return extract_order_key(pattern, format, DATE_GROUP, path).ok_or_else(|| {
                ShipError::Config(format!(
                    "could not derive a cutoff from full backup '{}'",
                    path.display()
                ))
            });
        }

        Err(ShipError::Config(
            "no cutoff: set an explicit later-than instant or a full backup with name/date patterns"
                .to_string(),
        ))
    }

    async fn seed(&self, state: &mut RunState) -> Result<()> {
        let Some(artifact) = &self.config.full_backup_path else {
            return Err(ShipError::Config(
                "seed restore requested but no full backup path configured".to_string(),
            ));
        };

        if let Err(err) = self.applier.apply_full(artifact).await {
            error!(artifact = %artifact.display(), %err, "full restore failed");
            return Err(err);
        }

        state.seeded = true;
        info!(artifact = %artifact.display(), "full restore complete");
        Ok(())
    }

    /// Repeatedly drain the directory until a pass selects nothing. The
    /// repeat absorbs segments that landed while the previous pass was
    /// still applying.
    async fn catch_up(
        &self,
        backup_dir: &Path,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<Drain> {
        let criteria = self.criteria(state.cutoff);

        loop {
            if cancel.is_cancelled() {
                info!("catch-up interrupted between passes");
                return Ok(Drain::Cancelled);
            }

            let segments = select_segments(backup_dir, &criteria, &state.exclusions).await?;
            if segments.is_empty() {
                debug!("no segments this pass, catch-up drained");
                return Ok(Drain::Empty);
            }

            for segment in &segments {
                debug!(path = %segment.path.display(), key = %segment.order_key, "queued");
            }

            for Segment { path, .. } in segments {
                if cancel.is_cancelled() {
                    info!("catch-up interrupted mid-pass");
                    return Ok(Drain::Cancelled);
                }

                // Excluded before the attempt: a failing segment is never
                // retried within the run.
                state.exclusions.insert(path.clone());

                if let Err(err) = self.applier.apply_log(&path).await {
                    error!(
                        path = %path.display(),
                        %err,
                        "log restore failed, continuing with the next segment"
                    );
                }
            }
        }
    }

    /// Event-driven replay. Entered only after catch-up drains; any apply
    /// failure here ends the run.
    async fn live_monitor(
        &self,
        backup_dir: &Path,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        info!(dir = %backup_dir.display(), "monitoring for new segments");

        let mut watcher = DirWatcher::new(false)?;
        watcher.register(backup_dir)?;

        let mut sink = LiveSink {
            applier: Arc::clone(&self.applier),
            criteria: self.criteria(state.cutoff),
            backup_dir: backup_dir.to_path_buf(),
            state,
        };

        match watcher.run(&mut sink, cancel).await? {
            WatchOutcome::Cancelled => Ok(RunOutcome::Cancelled),
            WatchOutcome::Exhausted => Err(ShipError::WatchExhausted),
        }
    }

    fn criteria(&self, cutoff: DateTime<Utc>) -> SelectionCriteria {
        SelectionCriteria {
            name_pattern: self.config.log_pattern.clone(),
            date_format: self.config.log_date_format.clone(),
            date_group: DATE_GROUP,
            cutoff,
            source: if self.config.use_modified_time {
                OrderKeySource::ModifiedTime
            } else {
                OrderKeySource::FileName
            },
        }
    }
}

/// Watch sink for the live loop: applies matching creations immediately,
/// reconciles on overflow, ignores everything else.
struct LiveSink<'a> {
    applier: Arc<dyn Applier>,
    criteria: SelectionCriteria,
    backup_dir: PathBuf,
    state: &'a mut RunState,
}

#[async_trait]
impl WatchSink for LiveSink<'_> {
    async fn apply(&mut self, kind: WatchEventKind, path: &Path) -> Result<()> {
        match kind {
            WatchEventKind::Created => {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return Ok(());
                };
                if !self.criteria.matches_name(name) {
                    return Ok(());
                }
                if self.state.exclusions.contains(path) {
                    debug!(path = %path.display(), "segment already attempted, ignoring event");
                    return Ok(());
                }

                self.state.exclusions.insert(path.to_path_buf());
                info!(path = %path.display(), "new segment");
                self.applier.apply_log(path).await
            }
            WatchEventKind::Overflow => {
                warn!(
                    root = %path.display(),
                    "event queue overflowed, reconciling with a directory sweep"
                );
                let segments =
                    select_segments(&self.backup_dir, &self.criteria, &self.state.exclusions)
                        .await?;
                for Segment { path, .. } in segments {
                    self.state.exclusions.insert(path.clone());
                    self.applier.apply_log(&path).await?;
                }
                Ok(())
            }
            WatchEventKind::Modified | WatchEventKind::Removed => Ok(()),
        }
    }
}
