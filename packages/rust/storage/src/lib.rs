//! libSQL run-history store (offline mode).
//!
//! The [`Storage`] struct records finished pipeline runs and the files each
//! run selected for download. The full final [`PipelineState`] is kept as JSON
//! so `archivist show` can print exactly what a run produced.
//!
//! **Access rules:**
//! - `archivist find`: read-write via [`Storage::open`]
//! - `archivist history` / `show`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use uuid::Uuid;

use archivist_shared::{ArchivistError, PipelineState, Result};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of `archivist history`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub id: String,
    pub query: String,
    pub cache_key_hash: Option<String>,
    /// Whether the early stages were served from the stage cache.
    pub cached: bool,
    pub finished_at: DateTime<Utc>,
    pub result_count: usize,
    pub filtered_count: usize,
    pub entry_count: usize,
    pub error_count: usize,
}

/// A file a run selected for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRecord {
    pub identifier: String,
    pub file_name: String,
}

fn storage_err(e: impl std::fmt::Display) -> ArchivistError {
    ArchivistError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArchivistError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` without migrating or writing.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ArchivistError::Storage(format!(
                "no run history at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ArchivistError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ArchivistError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run operations
    // -----------------------------------------------------------------------

    /// Record a finished run and its selected downloads. Returns the new run id.
    pub async fn record_run(&self, state: &PipelineState) -> Result<String> {
        self.check_writable()?;

        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        let state_json = serde_json::to_string(state).map_err(storage_err)?;
        let entry_count = state.entries_to_consider().len();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO runs (id, query, cache_key_hash, cached, finished_at,
                               result_count, filtered_count, entry_count, error_count, state_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id.as_str(),
                state.query.as_str(),
                state.cache_key_hash.as_deref(),
                i64::from(state.is_cached()),
                now.as_str(),
                state.results().len() as i64,
                state.filtered_results().len() as i64,
                entry_count as i64,
                state.errors.len() as i64,
                state_json,
            ],
        )
        .await
        .map_err(storage_err)?;

        if let Some(pdfs) = &state.pdfs_to_download {
            for (identifier, files) in pdfs {
                for file_name in files {
                    tx.execute(
                        "INSERT OR IGNORE INTO downloads (run_id, identifier, file_name)
                         VALUES (?1, ?2, ?3)",
                        params![id.as_str(), identifier.as_str(), file_name.as_str()],
                    )
                    .await
                    .map_err(storage_err)?;
                }
            }
        }

        tx.commit().await.map_err(storage_err)?;
        tracing::debug!(run_id = %id, query = %state.query, "recorded run");
        Ok(id)
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<RunSummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, query, cache_key_hash, cached, finished_at,
                        result_count, filtered_count, entry_count, error_count
                 FROM runs ORDER BY finished_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }

    /// Final state of run `id`, if recorded.
    pub async fn get_run(&self, id: &str) -> Result<Option<PipelineState>> {
        let mut rows = self
            .conn
            .query("SELECT state_json FROM runs WHERE id = ?1", params![id])
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).map_err(storage_err)?;
                let state = serde_json::from_str(&json).map_err(|e| {
                    ArchivistError::Storage(format!("run {id} has a corrupt state: {e}"))
                })?;
                Ok(Some(state))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// Files selected by run `id`, ordered by identifier then name.
    pub async fn downloads_for_run(&self, id: &str) -> Result<Vec<DownloadRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT identifier, file_name FROM downloads
                 WHERE run_id = ?1 ORDER BY identifier, file_name",
                params![id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(DownloadRecord {
                identifier: row.get::<String>(0).map_err(storage_err)?,
                file_name: row.get::<String>(1).map_err(storage_err)?,
            });
        }
        Ok(results)
    }
}

/// Convert a `runs` row to a [`RunSummary`].
fn row_to_summary(row: &libsql::Row) -> Result<RunSummary> {
    let count = |idx: i32| -> Result<usize> {
        Ok(row.get::<i64>(idx).map_err(storage_err)?.max(0) as usize)
    };

    Ok(RunSummary {
        id: row.get::<String>(0).map_err(storage_err)?,
        query: row.get::<String>(1).map_err(storage_err)?,
        cache_key_hash: row.get::<String>(2).ok(),
        cached: row.get::<i64>(3).map_err(storage_err)? != 0,
        finished_at: {
            let s: String = row.get(4).map_err(storage_err)?;
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| ArchivistError::Storage(format!("invalid date: {e}")))?
        },
        result_count: count(5)?,
        filtered_count: count(6)?,
        entry_count: count(7)?,
        error_count: count(8)?,
    })
}
