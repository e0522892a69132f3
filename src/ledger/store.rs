//! SQLite-backed operations ledger.
//!
//! Single-writer discipline: all access goes through one connection behind a
//! mutex. Readers see a consistent snapshot (WAL mode); writers serialize at
//! this boundary with one transaction per write.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::ledger::schema::{get_schema_version, initialize_schema, SCHEMA_VERSION};
use crate::ledger::types::*;

/// Timestamp format used in every ledger column.
pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const WRITE_RETRIES: u32 = 2;
const RETRY_BASE_DELAY_MS: u64 = 100;

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::storage(format!("bad timestamp '{s}': {e}")))
}

/// Durable relational record of operations and their side facts.
pub struct Ledger {
    conn: Arc<Mutex<Connection>>,
}

impl Ledger {
    /// Open or create a ledger at the given path, applying missing migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::storage(format!("creating ledger dir: {e}")))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| Error::storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        initialize_schema(&conn).map_err(|e| Error::storage(e.to_string()))?;

        let version = get_schema_version(&conn).map_err(|e| Error::storage(e.to_string()))?;
        if version != SCHEMA_VERSION {
            return Err(Error::InvariantViolation(format!(
                "ledger schema version {version} does not match expected {SCHEMA_VERSION}"
            )));
        }

        info!(schema_version = version, "ledger opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| Error::Internal(format!("ledger lock poisoned: {e}")))?;
        f(&conn).map_err(|e| Error::storage(e.to_string()))
    }

    /// Run a write inside a transaction, retrying transient storage faults.
    fn with_write<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&Connection) -> rusqlite::Result<T>,
    {
        let mut attempt = 0;
        loop {
            let result = self.with_conn(|conn| {
                let tx = conn.unchecked_transaction()?;
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            });

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    let delay = RETRY_BASE_DELAY_MS + fastrand::u64(0..50);
                    warn!(attempt, delay_ms = delay, error = %err, "ledger write retry");
                    std::thread::sleep(Duration::from_millis(delay));
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ==================== Operations ====================

    /// Record the start of an operation. Inserts with `success = false` and
    /// no completion time.
    pub fn start_operation(
        &self,
        kind: OperationKind,
        external_id: Option<&str>,
        context: Option<&Value>,
    ) -> Result<OperationId> {
        self.start_operation_at(kind, external_id, context, Utc::now())
    }

    /// Backdated variant of [`start_operation`](Self::start_operation), used
    /// when importing historical records.
    pub fn start_operation_at(
        &self,
        kind: OperationKind,
        external_id: Option<&str>,
        context: Option<&Value>,
        started_at: DateTime<Utc>,
    ) -> Result<OperationId> {
        let context_json = context.map(|c| c.to_string());
        let id = self.with_write(|conn| {
            conn.execute(
                "INSERT INTO operations (operation_type, operation_id, started_at, success, context)
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    kind.to_string(),
                    external_id,
                    format_timestamp(started_at),
                    context_json,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        debug!(operation = %kind, external_id, db_id = id, "operation started");
        Ok(id)
    }

    /// Record the completion of an operation. Computes `duration_seconds`
    /// from the stored start time. Each operation completes exactly once.
    pub fn complete_operation(
        &self,
        id: OperationId,
        success: bool,
        error_message: Option<&str>,
        error_kind: Option<ErrorKind>,
        retry_count: u32,
    ) -> Result<()> {
        self.complete_operation_at(id, success, error_message, error_kind, retry_count, Utc::now())
    }

    /// Backdated variant of [`complete_operation`](Self::complete_operation).
    pub fn complete_operation_at(
        &self,
        id: OperationId,
        success: bool,
        error_message: Option<&str>,
        error_kind: Option<ErrorKind>,
        retry_count: u32,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        if !success && error_message.is_some() && error_kind.is_none() {
            return Err(Error::InvariantViolation(
                "failed operation with an error message must carry an error kind".into(),
            ));
        }

        let started_at: String = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT started_at FROM operations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })?
            .ok_or_else(|| Error::storage(format!("operation {id} not found")))?;

        let started = parse_timestamp(&started_at)?;
        if completed_at < started {
            return Err(Error::InvariantViolation(format!(
                "operation {id} completion time precedes its start time"
            )));
        }
        let duration = (completed_at - started).num_milliseconds() as f64 / 1000.0;

        self.with_write(|conn| {
            conn.execute(
                "UPDATE operations
                 SET completed_at = ?1, duration_seconds = ?2, success = ?3,
                     error_message = ?4, error_type = ?5, retry_count = ?6
                 WHERE id = ?7",
                params![
                    format_timestamp(completed_at),
                    duration,
                    success,
                    error_message,
                    error_kind.map(|k| k.to_string()),
                    retry_count,
                    id,
                ],
            )?;
            Ok(())
        })?;

        debug!(db_id = id, success, duration_seconds = duration, "operation completed");
        Ok(())
    }

    /// Attach a side fact to an operation. Facts are immutable once written.
    pub fn attach_fact(&self, id: OperationId, fact: &OperationFact) -> Result<()> {
        self.with_write(|conn| match fact {
            OperationFact::IssueProcessing(f) => {
                conn.execute(
                    "INSERT INTO issue_processing (
                        operation_id, issue_number, complexity, files_changed,
                        lines_added, lines_deleted, tests_added, success,
                        failure_reason, time_to_completion_seconds
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id,
                        f.issue_number,
                        f.complexity,
                        f.files_changed,
                        f.lines_added,
                        f.lines_deleted,
                        f.tests_added,
                        f.success,
                        f.failure_reason,
                        f.time_to_completion_seconds,
                    ],
                )?;
                Ok(())
            }
            OperationFact::CodeGeneration(f) => {
                conn.execute(
                    "INSERT INTO code_generation (
                        operation_id, issue_number, provider, model, tokens_used,
                        cost, first_attempt_success, retry_count, test_pass_rate, error_type
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        id,
                        f.issue_number,
                        f.provider,
                        f.model,
                        f.tokens_used,
                        f.cost,
                        f.first_attempt_success,
                        f.retry_count,
                        f.test_pass_rate,
                        f.error_kind.map(|k| k.to_string()),
                    ],
                )?;
                Ok(())
            }
            OperationFact::PrManagement(f) => {
                conn.execute(
                    "INSERT INTO pr_management (
                        operation_id, pr_number, issue_number, created, merged,
                        ci_passed, review_approved, time_to_merge_seconds, ci_failure_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        f.pr_number,
                        f.issue_number,
                        f.created,
                        f.merged,
                        f.ci_passed,
                        f.review_approved,
                        f.time_to_merge_seconds,
                        f.ci_failure_count,
                    ],
                )?;
                Ok(())
            }
            OperationFact::Roadmap(f) => {
                conn.execute(
                    "INSERT INTO roadmap_tracking (
                        operation_id, proposals_generated, proposals_validated,
                        proposals_approved, issues_created, issues_implemented,
                        average_proposal_quality
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        f.proposals_generated,
                        f.proposals_validated,
                        f.proposals_approved,
                        f.issues_created,
                        f.issues_implemented,
                        f.average_proposal_quality,
                    ],
                )?;
                Ok(())
            }
        })
    }

    /// Fetch a single operation by id.
    pub fn get_operation(&self, id: OperationId) -> Result<Option<OperationRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, operation_type, operation_id, started_at, completed_at,
                        duration_seconds, success, error_message, error_type,
                        retry_count, context
                 FROM operations WHERE id = ?1",
                params![id],
                row_to_operation,
            )
            .optional()
        })
    }

    /// All failed operations whose start falls inside the lookback window,
    /// newest first.
    pub fn failed_operations_since(&self, since: DateTime<Utc>) -> Result<Vec<OperationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, operation_type, operation_id, started_at, completed_at,
                        duration_seconds, success, error_message, error_type,
                        retry_count, context
                 FROM operations
                 WHERE success = 0 AND completed_at IS NOT NULL AND started_at >= ?1
                 ORDER BY started_at DESC",
            )?;
            let rows = stmt.query_map(params![format_timestamp(since)], row_to_operation)?;
            rows.collect()
        })
    }

    /// Most recent successful operations of one kind, for contrast samples.
    pub fn recent_successes(
        &self,
        kind: OperationKind,
        limit: usize,
    ) -> Result<Vec<OperationRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, operation_type, operation_id, started_at, completed_at,
                        duration_seconds, success, error_message, error_type,
                        retry_count, context
                 FROM operations
                 WHERE success = 1 AND operation_type = ?1
                 ORDER BY started_at DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![kind.to_string(), limit as i64], row_to_operation)?;
            rows.collect()
        })
    }

    /// Mark operations that never completed (e.g. a crash mid-flight) as
    /// unknown failures. Intended for boot-time cleanup.
    pub fn fail_stale_operations(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let now = format_timestamp(Utc::now());
        let count = self.with_write(|conn| {
            conn.execute(
                "UPDATE operations
                 SET completed_at = ?1, success = 0,
                     error_message = 'operation never completed (stale at boot)',
                     error_type = ?2
                 WHERE completed_at IS NULL AND started_at < ?3",
                params![now, ErrorKind::Unknown.to_string(), format_timestamp(older_than)],
            )
        })?;
        if count > 0 {
            warn!(count, "marked stale operations as unknown failures");
        }
        Ok(count)
    }

    // ==================== Repository context ====================

    /// Replace the repository context snapshot (latest-only).
    pub fn save_repository_context(&self, context: &RepositoryContext) -> Result<()> {
        let data = serde_json::to_string(context)?;
        let last_updated = format_timestamp(context.last_updated.unwrap_or_else(Utc::now));
        self.with_write(|conn| {
            conn.execute("DELETE FROM repository_context", [])?;
            conn.execute(
                "INSERT INTO repository_context (context_data, last_updated) VALUES (?1, ?2)",
                params![data, last_updated],
            )?;
            Ok(())
        })
    }

    /// Load the latest repository context snapshot, if any.
    pub fn load_repository_context(&self) -> Result<Option<RepositoryContext>> {
        let data: Option<String> = self.with_conn(|conn| {
            conn.query_row(
                "SELECT context_data FROM repository_context
                 ORDER BY created_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
        })?;

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Row counts for all principal tables.
    pub fn table_stats(&self) -> Result<Vec<(String, i64)>> {
        const TABLES: [&str; 5] = [
            "operations",
            "issue_processing",
            "code_generation",
            "pr_management",
            "roadmap_tracking",
        ];
        self.with_conn(|conn| {
            let mut stats = Vec::with_capacity(TABLES.len());
            for table in TABLES {
                let count: i64 =
                    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                        row.get(0)
                    })?;
                stats.push((table.to_string(), count));
            }
            Ok(stats)
        })
    }
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<OperationRecord> {
    let kind_str: String = row.get(1)?;
    let started_at: String = row.get(3)?;
    let completed_at: Option<String> = row.get(4)?;
    let error_type: Option<String> = row.get(8)?;
    let context: Option<String> = row.get(10)?;

    let to_sql_err = |msg: String| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            msg.into(),
        )
    };

    Ok(OperationRecord {
        id: row.get(0)?,
        kind: kind_str.parse().map_err(to_sql_err)?,
        external_id: row.get(2)?,
        started_at: NaiveDateTime::parse_from_str(&started_at, TIMESTAMP_FORMAT)
            .map_err(|e| to_sql_err(e.to_string()))?
            .and_utc(),
        completed_at: completed_at
            .map(|s| {
                NaiveDateTime::parse_from_str(&s, TIMESTAMP_FORMAT)
                    .map(|naive| naive.and_utc())
                    .map_err(|e| to_sql_err(e.to_string()))
            })
            .transpose()?,
        duration_seconds: row.get(5)?,
        success: row.get(6)?,
        error_message: row.get(7)?,
        error_kind: error_type.map(|s| s.parse().unwrap_or(ErrorKind::Unknown)),
        retry_count: row.get(9)?,
        context: context.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;

    fn ledger() -> Ledger {
        Ledger::in_memory().unwrap()
    }

    #[test]
    fn test_start_and_complete_operation() {
        let ledger = ledger();
        let id = ledger
            .start_operation(OperationKind::ProcessIssue, Some("42"), None)
            .unwrap();

        let op = ledger.get_operation(id).unwrap().unwrap();
        assert!(!op.success);
        assert!(op.completed_at.is_none());
        assert_eq!(op.external_id.as_deref(), Some("42"));

        ledger
            .complete_operation(id, true, None, None, 0)
            .unwrap();

        let op = ledger.get_operation(id).unwrap().unwrap();
        assert!(op.success);
        assert!(op.is_complete());
        assert!(op.duration_seconds.is_some());
        assert!(op.completed_at.unwrap() >= op.started_at);
    }

    #[test]
    fn test_failure_requires_error_kind_with_message() {
        let ledger = ledger();
        let id = ledger
            .start_operation(OperationKind::GenerateCode, None, None)
            .unwrap();

        let result = ledger.complete_operation(id, false, Some("boom"), None, 1);
        assert!(matches!(result, Err(Error::InvariantViolation(_))));

        ledger
            .complete_operation(id, false, Some("boom"), Some(ErrorKind::ProviderFault), 1)
            .unwrap();

        let op = ledger.get_operation(id).unwrap().unwrap();
        assert_eq!(op.error_kind, Some(ErrorKind::ProviderFault));
        assert_eq!(op.retry_count, 1);
    }

    #[test]
    fn test_completion_before_start_rejected() {
        let ledger = ledger();
        let started = Utc::now();
        let id = ledger
            .start_operation_at(OperationKind::ManagePr, None, None, started)
            .unwrap();

        let result = ledger.complete_operation_at(
            id,
            true,
            None,
            None,
            0,
            started - ChronoDuration::hours(1),
        );
        assert!(matches!(result, Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_attach_facts_and_round_trip() {
        let ledger = ledger();
        let id = ledger
            .start_operation(OperationKind::GenerateCode, Some("7"), None)
            .unwrap();

        ledger
            .attach_fact(
                id,
                &OperationFact::CodeGeneration(CodeGenerationFact {
                    issue_number: Some(7),
                    provider: "anthropic".into(),
                    model: "claude-3-5-sonnet".into(),
                    tokens_used: Some(2048),
                    cost: Some(0.031),
                    first_attempt_success: true,
                    retry_count: 0,
                    test_pass_rate: Some(0.95),
                    error_kind: None,
                }),
            )
            .unwrap();

        let (provider, tokens): (String, i64) = ledger
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT provider, tokens_used FROM code_generation WHERE operation_id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(provider, "anthropic");
        assert_eq!(tokens, 2048);
    }

    #[test]
    fn test_failed_operations_window() {
        let ledger = ledger();
        let now = Utc::now();

        // Two recent failures, one old failure, one recent success.
        for hours_ago in [1, 2] {
            let id = ledger
                .start_operation_at(
                    OperationKind::ProcessIssue,
                    None,
                    None,
                    now - ChronoDuration::hours(hours_ago),
                )
                .unwrap();
            ledger
                .complete_operation_at(
                    id,
                    false,
                    Some("timeout"),
                    Some(ErrorKind::ProviderFault),
                    0,
                    now - ChronoDuration::hours(hours_ago) + ChronoDuration::minutes(1),
                )
                .unwrap();
        }
        let old = ledger
            .start_operation_at(
                OperationKind::ProcessIssue,
                None,
                None,
                now - ChronoDuration::days(60),
            )
            .unwrap();
        ledger
            .complete_operation_at(
                old,
                false,
                Some("timeout"),
                Some(ErrorKind::ProviderFault),
                0,
                now - ChronoDuration::days(60) + ChronoDuration::minutes(1),
            )
            .unwrap();
        let ok = ledger
            .start_operation(OperationKind::ProcessIssue, None, None)
            .unwrap();
        ledger.complete_operation(ok, true, None, None, 0).unwrap();

        let failures = ledger
            .failed_operations_since(now - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|op| !op.success));
    }

    #[test]
    fn test_recent_successes_limit() {
        let ledger = ledger();
        for _ in 0..8 {
            let id = ledger
                .start_operation(OperationKind::ProcessIssue, None, None)
                .unwrap();
            ledger.complete_operation(id, true, None, None, 0).unwrap();
        }

        let successes = ledger
            .recent_successes(OperationKind::ProcessIssue, 5)
            .unwrap();
        assert_eq!(successes.len(), 5);
    }

    #[test]
    fn test_fail_stale_operations() {
        let ledger = ledger();
        let old_start = Utc::now() - ChronoDuration::hours(5);
        ledger
            .start_operation_at(OperationKind::RoadmapCycle, None, None, old_start)
            .unwrap();
        let fresh = ledger
            .start_operation(OperationKind::LearningCycle, None, None)
            .unwrap();

        let marked = ledger
            .fail_stale_operations(Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        assert_eq!(marked, 1);

        // The fresh, still-running operation is untouched.
        let op = ledger.get_operation(fresh).unwrap().unwrap();
        assert!(!op.is_complete());
    }

    #[test]
    fn test_repository_context_round_trip() {
        let ledger = ledger();
        assert!(ledger.load_repository_context().unwrap().is_none());

        let mut ctx = RepositoryContext::new("acme/widgets", "main");
        ctx.facts.insert("stars".into(), serde_json::json!(17));
        ctx.last_updated = Some(Utc::now());
        ledger.save_repository_context(&ctx).unwrap();

        let loaded = ledger.load_repository_context().unwrap().unwrap();
        assert_eq!(loaded.repository, "acme/widgets");
        assert_eq!(loaded.facts["stars"], serde_json::json!(17));

        // Latest-only: saving again replaces the previous snapshot.
        let ctx2 = RepositoryContext::new("acme/gadgets", "trunk");
        ledger.save_repository_context(&ctx2).unwrap();
        let loaded = ledger.load_repository_context().unwrap().unwrap();
        assert_eq!(loaded.repository, "acme/gadgets");
    }

    #[test]
    fn test_table_stats() {
        let ledger = ledger();
        let id = ledger
            .start_operation(OperationKind::ProcessIssue, None, None)
            .unwrap();
        ledger
            .attach_fact(
                id,
                &OperationFact::Roadmap(RoadmapFact {
                    proposals_generated: 5,
                    ..Default::default()
                }),
            )
            .unwrap();

        let stats = ledger.table_stats().unwrap();
        let ops = stats.iter().find(|(t, _)| t == "operations").unwrap();
        assert_eq!(ops.1, 1);
        let roadmap = stats.iter().find(|(t, _)| t == "roadmap_tracking").unwrap();
        assert_eq!(roadmap.1, 1);
    }
}
