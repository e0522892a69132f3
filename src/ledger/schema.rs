//! SQLite schema and forward-only migrations for the operations ledger.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version. Bump when adding a migration.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema, applying any missing migrations in order.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL mode so readers never block the single writer
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        apply_v1_schema(conn)?;
    }
    if current_version < 2 {
        apply_v2_schema(conn)?;
    }

    Ok(())
}

/// Migration 1: operations plus the four fact tables.
fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_type TEXT NOT NULL,
            operation_id TEXT,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            duration_seconds REAL,
            success INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            error_type TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            context TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS issue_processing (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id INTEGER NOT NULL,
            issue_number INTEGER NOT NULL,
            complexity INTEGER,
            files_changed INTEGER,
            lines_added INTEGER,
            lines_deleted INTEGER,
            tests_added INTEGER,
            success INTEGER NOT NULL DEFAULT 0,
            failure_reason TEXT,
            time_to_completion_seconds REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (operation_id) REFERENCES operations (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_generation (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id INTEGER NOT NULL,
            issue_number INTEGER,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            tokens_used INTEGER,
            cost REAL,
            first_attempt_success INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            test_pass_rate REAL,
            error_type TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (operation_id) REFERENCES operations (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pr_management (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id INTEGER NOT NULL,
            pr_number INTEGER NOT NULL,
            issue_number INTEGER,
            created INTEGER NOT NULL DEFAULT 1,
            merged INTEGER NOT NULL DEFAULT 0,
            ci_passed INTEGER,
            review_approved INTEGER,
            time_to_merge_seconds REAL,
            ci_failure_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (operation_id) REFERENCES operations (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS roadmap_tracking (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id INTEGER NOT NULL,
            proposals_generated INTEGER NOT NULL DEFAULT 0,
            proposals_validated INTEGER NOT NULL DEFAULT 0,
            proposals_approved INTEGER NOT NULL DEFAULT 0,
            issues_created INTEGER NOT NULL DEFAULT 0,
            issues_implemented INTEGER NOT NULL DEFAULT 0,
            average_proposal_quality REAL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            FOREIGN KEY (operation_id) REFERENCES operations (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operations_type_success
         ON operations (operation_type, success)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_operations_started_at
         ON operations (started_at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_issue_processing_issue
         ON issue_processing (issue_number)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pr_management_pr
         ON pr_management (pr_number)",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    Ok(())
}

/// Migration 2: latest-only repository context snapshot.
fn apply_v2_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS repository_context (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            context_data TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}

/// Get the highest applied schema version (0 when fresh).
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}
