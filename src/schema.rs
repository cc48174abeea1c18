/// Bookkeeping tables owned by the migration manager. Safe to run on every open: nothing
/// here overwrites existing rows, so the engine's `schema_version` survives reconnects.
pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Version of the managed (user) schema, advanced as migrations complete
INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '0');

-- Version of the bookkeeping tables below
INSERT OR IGNORE INTO meta (key, value) VALUES ('history_version', '1');

-- One row per attempted migration execution. Rows are updated as the attempt moves
-- through its lifecycle but never deleted.
CREATE TABLE IF NOT EXISTS migration_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,                 -- Parsed from the NNN_ prefix of the filename
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,                   -- SHA-256 (hex) of the file content at execution time
    status TEXT NOT NULL,                     -- pending, running, completed, failed, rolled_back
    executed_at INTEGER DEFAULT NULL,         -- When the apply block last ran (UTC)
    execution_time_ms INTEGER NOT NULL DEFAULT 0,
    error_message TEXT DEFAULT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    backup_path TEXT DEFAULT NULL,            -- Backup taken before the batch this record ran in
    rollback_sql TEXT DEFAULT NULL,           -- Revert block captured when the record was created
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_migration_records_version ON migration_records (version, status);
CREATE INDEX IF NOT EXISTS idx_migration_records_status ON migration_records (status);

-- At most one completed record per (version, checksum)
CREATE UNIQUE INDEX IF NOT EXISTS idx_migration_records_completed
    ON migration_records (version, checksum) WHERE status = 'completed';

COMMIT;
"#;
