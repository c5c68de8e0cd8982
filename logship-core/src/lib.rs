//! # Logship Core
//!
//! Engine for keeping a standby database synchronized with a primary by
//! replaying incremental backup segments as they land in a directory.
//!
//! ## Overview
//!
//! A run moves through up to three phases:
//!
//! - **Seed** (optional): restore the full backup that establishes the
//!   baseline.
//! - **Catch-up**: repeatedly list, filter, order, and apply the segments
//!   already on disk until a pass finds nothing new.
//! - **Live monitor** (optional): watch the directory and apply each
//!   matching segment as its creation event arrives.
//!
//! Ordering correctness is valued over throughput: segments are applied
//! strictly sequentially, a path is attempted at most once per run, and
//! catch-up always drains completely before the first live event is
//! considered.
//!
//! ## Feature Flags
//!
//! - `database`: enables [`apply::SqlApplier`], the SQLx-backed applier.

/// The apply seam and the SQL-statement applier
pub mod apply;
/// Error types shared across the crate
pub mod error;
/// Seed / catch-up / live-monitor sequencing
pub mod orchestrator;
/// Segment listing, filtering, and ordering
pub mod select;
/// Order-key extraction from file names
pub mod timestamp;
/// Directory watching and event dispatch
pub mod watch;

pub use apply::Applier;
pub use error::{Result, ShipError};
pub use orchestrator::{Orchestrator, RunConfig, RunOutcome, RunState};
pub use select::{OrderKeySource, Segment, SelectionCriteria, select_segments};
pub use timestamp::extract_order_key;
pub use watch::{DirWatcher, WatchEventKind, WatchOutcome, WatchSink};
