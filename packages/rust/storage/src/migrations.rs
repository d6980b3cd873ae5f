//! SQL migration definitions for the Archivist run-history database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: runs, downloads",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per finished pipeline run
CREATE TABLE IF NOT EXISTS runs (
    id             TEXT PRIMARY KEY,
    query          TEXT NOT NULL,
    cache_key_hash TEXT,
    cached         INTEGER NOT NULL DEFAULT 0,
    finished_at    TEXT NOT NULL,
    result_count   INTEGER NOT NULL DEFAULT 0,
    filtered_count INTEGER NOT NULL DEFAULT 0,
    entry_count    INTEGER NOT NULL DEFAULT 0,
    error_count    INTEGER NOT NULL DEFAULT 0,
    state_json     TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_finished_at ON runs(finished_at);

-- Files selected for download by a run
CREATE TABLE IF NOT EXISTS downloads (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id     TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    identifier TEXT NOT NULL,
    file_name  TEXT NOT NULL,
    UNIQUE(run_id, identifier, file_name)
);

CREATE INDEX IF NOT EXISTS idx_downloads_run_id ON downloads(run_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Index runs by cache key",
            sql: r#"
CREATE INDEX IF NOT EXISTS idx_runs_cache_key_hash ON runs(cache_key_hash);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
