//! TOML configuration surface and CLI-over-file merging.
//!
//! The file carries everything; flags only force-enable booleans or
//! override the cutoff, mirroring how the tool is driven from cron versus
//! by hand. All validation happens here, before any database work.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use logship_core::RunConfig;

const DEFAULT_LOG_PATTERN: &str = r"(?:[\w_-]+?)(\d+)\.trn";
const DEFAULT_LOG_DATE_FORMAT: &str = "%Y%m%d%H%M%S";
const DEFAULT_FULL_PATTERN: &str = r"(?:[\w_-]+?)(\d+)\.bak";
const DEFAULT_FULL_DATE_FORMAT: &str = "%Y%m%d%H%M";

/// On-disk configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backup: BackupSection,
    pub restore: RestoreSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupSection {
    /// Directory the log segments land in.
    pub dir: PathBuf,
    #[serde(default = "default_log_pattern")]
    pub log_pattern: String,
    #[serde(default = "default_log_date_format")]
    pub log_date_format: String,
    /// Full backup artifact for seeding and/or cutoff derivation.
    pub full_path: Option<PathBuf>,
    #[serde(default = "default_full_pattern")]
    pub full_pattern: String,
    #[serde(default = "default_full_date_format")]
    pub full_date_format: String,
    /// Explicit exclusive cutoff, RFC 3339.
    pub later_than: Option<String>,
    #[serde(default)]
    pub use_modified_time: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestoreSection {
    /// Connection string for the standby.
    pub url: String,
    /// Database name substituted into the restore statements.
    pub database: String,
    /// Statement template overrides; `{db}` and `{path}` placeholders.
    pub full_statement: Option<String>,
    pub log_statement: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RunSection {
    #[serde(default)]
    pub seed_restore: bool,
    #[serde(default)]
    pub monitor: bool,
}

fn default_log_pattern() -> String {
    DEFAULT_LOG_PATTERN.to_string()
}

fn default_log_date_format() -> String {
    DEFAULT_LOG_DATE_FORMAT.to_string()
}

fn default_full_pattern() -> String {
    DEFAULT_FULL_PATTERN.to_string()
}

fn default_full_date_format() -> String {
    DEFAULT_FULL_DATE_FORMAT.to_string()
}

/// Flag overrides taken from the command line. Booleans only force-enable;
/// an absent flag defers to the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub later_than: Option<String>,
    pub restore_full: bool,
    pub use_lastmod: bool,
    pub monitor: bool,
}

/// Everything the binary needs to start a run.
#[derive(Debug)]
pub struct Settings {
    pub run: RunConfig,
    pub database_url: String,
    pub database: String,
    pub full_statement: Option<String>,
    pub log_statement: Option<String>,
}

/// Read, merge, and validate the configuration.
pub fn load(conf_path: &Path, overrides: &Overrides) -> Result<Settings> {
    let raw = std::fs::read_to_string(conf_path)
        .with_context(|| format!("cannot read configuration file '{}'", conf_path.display()))?;
    let file: FileConfig = toml::from_str(&raw)
        .with_context(|| format!("invalid configuration in '{}'", conf_path.display()))?;
    merge(file, overrides)
}

fn merge(file: FileConfig, overrides: &Overrides) -> Result<Settings> {
    let backup = file.backup;

    if !backup.dir.is_dir() {
        bail!(
            "backup directory '{}' does not exist or is not a directory",
            backup.dir.display()
        );
    }

    let log_pattern = Regex::new(&backup.log_pattern)
        .with_context(|| format!("invalid log pattern '{}'", backup.log_pattern))?;
    let full_pattern = Regex::new(&backup.full_pattern)
        .with_context(|| format!("invalid full backup pattern '{}'", backup.full_pattern))?;

    let later_than = overrides
        .later_than
        .as_deref()
        .or(backup.later_than.as_deref())
        .map(parse_cutoff)
        .transpose()?;

    if let Some(full_path) = &backup.full_path {
        if !full_path.is_file() {
            bail!("full backup '{}' is not a file", full_path.display());
        }
    }

    let seed_restore = overrides.restore_full || file.run.seed_restore;
    if seed_restore && backup.full_path.is_none() {
        bail!("seed restore requested but [backup].full_path is not set");
    }

    if later_than.is_none() && backup.full_path.is_none() {
        bail!(
            "no cutoff: set [backup].later_than (or --later-than) or a full backup to derive it from"
        );
    }

    Ok(Settings {
        run: RunConfig {
            backup_dir: backup.dir,
            log_pattern,
            log_date_format: backup.log_date_format,
            full_backup_path: backup.full_path,
            full_pattern: Some(full_pattern),
            full_date_format: Some(backup.full_date_format),
            later_than,
            use_modified_time: overrides.use_lastmod || backup.use_modified_time,
            seed_restore,
            monitor: overrides.monitor || file.run.monitor,
        },
        database_url: file.restore.url,
        database: file.restore.database,
        full_statement: file.restore.full_statement,
        log_statement: file.restore.log_statement,
    })
}

fn parse_cutoff(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("cannot parse 'later than' instant '{text}' (expected RFC 3339)"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_conf(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("conf.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn minimal_conf(backup_dir: &Path) -> String {
        format!(
            r#"
[backup]
dir = "{}"
later_than = "2023-01-01T01:00:00Z"

[restore]
url = "postgres://standby.internal/postgres"
database = "appdb"
"#,
            backup_dir.display()
        )
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let tmp = tempdir().unwrap();
        let conf = write_conf(tmp.path(), &minimal_conf(tmp.path()));

        let settings = load(&conf, &Overrides::default()).unwrap();

        assert_eq!(settings.run.log_pattern.as_str(), DEFAULT_LOG_PATTERN);
        assert_eq!(settings.run.log_date_format, DEFAULT_LOG_DATE_FORMAT);
        assert!(!settings.run.seed_restore);
        assert!(!settings.run.monitor);
        assert_eq!(settings.database, "appdb");
    }

    #[test]
    fn flags_force_enable_booleans() {
        let tmp = tempdir().unwrap();
        let conf = write_conf(tmp.path(), &minimal_conf(tmp.path()));

        let overrides = Overrides {
            use_lastmod: true,
            monitor: true,
            ..Overrides::default()
        };
        let settings = load(&conf, &overrides).unwrap();

        assert!(settings.run.use_modified_time);
        assert!(settings.run.monitor);
    }

    #[test]
    fn cli_cutoff_wins_over_file() {
        let tmp = tempdir().unwrap();
        let conf = write_conf(tmp.path(), &minimal_conf(tmp.path()));

        let overrides = Overrides {
            later_than: Some("2024-06-01T00:00:00Z".to_string()),
            ..Overrides::default()
        };
        let settings = load(&conf, &overrides).unwrap();

        assert_eq!(
            settings.run.later_than.unwrap().to_rfc3339(),
            "2024-06-01T00:00:00+00:00"
        );
    }

    #[test]
    fn missing_backup_dir_is_rejected() {
        let tmp = tempdir().unwrap();
        let body = minimal_conf(&tmp.path().join("gone"));
        let conf = write_conf(tmp.path(), &body);

        assert!(load(&conf, &Overrides::default()).is_err());
    }

    #[test]
    fn bad_cutoff_is_rejected() {
        let tmp = tempdir().unwrap();
        let body = minimal_conf(tmp.path()).replace("2023-01-01T01:00:00Z", "last tuesday");
        let conf = write_conf(tmp.path(), &body);

        assert!(load(&conf, &Overrides::default()).is_err());
    }

    #[test]
    fn seed_without_full_path_is_rejected() {
        let tmp = tempdir().unwrap();
        let conf = write_conf(tmp.path(), &minimal_conf(tmp.path()));

        let overrides = Overrides {
            restore_full: true,
            ..Overrides::default()
        };
        assert!(load(&conf, &overrides).is_err());
    }

    #[test]
    fn no_cutoff_source_is_rejected() {
        let tmp = tempdir().unwrap();
        let body = format!(
            r#"
[backup]
dir = "{}"

[restore]
url = "postgres://standby.internal/postgres"
database = "appdb"
"#,
            tmp.path().display()
        );
        let conf = write_conf(tmp.path(), &body);

        assert!(load(&conf, &Overrides::default()).is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempdir().unwrap();
        let body = format!("{}\nsurprise = true\n", minimal_conf(tmp.path()));
        let conf = write_conf(tmp.path(), &body);

        assert!(load(&conf, &Overrides::default()).is_err());
    }
}
