//! The apply seam: opaque, possibly slow, possibly failing restore calls.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// External collaborator that replays backup artifacts onto the standby.
#[async_trait]
pub trait Applier: Send + Sync {
    /// Restore the full backup that seeds the baseline state.
    async fn apply_full(&self, artifact: &Path) -> Result<()>;

    /// Replay one log segment.
    async fn apply_log(&self, segment: &Path) -> Result<()>;
}

#[cfg(feature = "database")]
pub use sql::{DEFAULT_FULL_STATEMENT, DEFAULT_LOG_STATEMENT, SqlApplier};

#[cfg(feature = "database")]
mod sql {
    use std::path::Path;
    use std::time::Instant;

    use async_trait::async_trait;
    use sqlx::PgPool;
    use tracing::{debug, info};

    use crate::error::{Result, ShipError};

    use super::Applier;

    /// Restore statement templates carry two placeholders: `{db}` and
    /// `{path}`. The defaults match a log-shipping standby.
    pub const DEFAULT_FULL_STATEMENT: &str =
        "RESTORE DATABASE {db} FROM DISK='{path}' WITH NORECOVERY, REPLACE";
    pub const DEFAULT_LOG_STATEMENT: &str = "RESTORE LOG {db} FROM DISK='{path}' WITH NORECOVERY";

    /// Applies backups by executing configured SQL statements through a
    /// connection pool. Each call is one statement on one pooled
    /// connection; nothing is held between calls.
    pub struct SqlApplier {
        pool: PgPool,
        database: String,
        full_statement: String,
        log_statement: String,
    }

    impl std::fmt::Debug for SqlApplier {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SqlApplier")
                .field("database", &self.database)
                .finish()
        }
    }

    impl SqlApplier {
        pub fn new(
            pool: PgPool,
            database: impl Into<String>,
            full_statement: Option<String>,
            log_statement: Option<String>,
        ) -> Self {
            Self {
                pool,
                database: database.into(),
                full_statement: full_statement
                    .unwrap_or_else(|| DEFAULT_FULL_STATEMENT.to_string()),
                log_statement: log_statement.unwrap_or_else(|| DEFAULT_LOG_STATEMENT.to_string()),
            }
        }

        fn render(&self, template: &str, path: &Path) -> String {
            template
                .replace("{db}", &self.database)
                .replace("{path}", &path.display().to_string())
        }

        async fn execute(&self, statement: String, path: &Path) -> Result<()> {
            let started = Instant::now();
            sqlx::raw_sql(&statement)
                .execute(&self.pool)
                .await
                .map_err(|err| ShipError::Apply {
                    path: path.to_path_buf(),
                    reason: format!("'{statement}' failed: {err}"),
                })?;
            debug!(
                statement = %statement,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "statement executed"
            );
            Ok(())
        }
    }

    #[async_trait]
    impl Applier for SqlApplier {
        async fn apply_full(&self, artifact: &Path) -> Result<()> {
            info!(artifact = %artifact.display(), "starting full restore");
            let statement = self.render(&self.full_statement, artifact);
            self.execute(statement, artifact).await
        }

        async fn apply_log(&self, segment: &Path) -> Result<()> {
            info!(segment = %segment.display(), "starting log restore");
            let statement = self.render(&self.log_statement, segment);
            self.execute(statement, segment).await
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn templates_render_database_and_path() {
            let pool = PgPool::connect_lazy("postgres://localhost/standby").unwrap();
            let applier = SqlApplier::new(pool, "appdb", None, None);
            let rendered =
                applier.render(DEFAULT_LOG_STATEMENT, Path::new("/backups/db1.trn"));
            assert_eq!(
                rendered,
                "RESTORE LOG appdb FROM DISK='/backups/db1.trn' WITH NORECOVERY"
            );
        }
    }
}
