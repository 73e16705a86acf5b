//! SQLite-backed operation store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{
    CreateOperationRequest, Lease, Operation, OperationFilter, OperationStatus, OperationStore,
    Step, StepOutputs, StoreError,
};

const COLUMNS: &str = "id, requested_by, parameters, current_step, status, outputs, retry_count, \
     poll_attempt, last_error, step_started_at, next_run_at, cancel_requested_by, created_at, \
     updated_at, version";

/// Fixed-width UTC timestamps so that text comparison in SQL orders correctly.
pub(crate) fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_db_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid timestamp {:?}: {}", s, e)))
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// Raw column values, decoded into an [`Operation`] outside the row callback.
struct OperationRow {
    id: String,
    requested_by: String,
    parameters: String,
    current_step: String,
    status: String,
    outputs: String,
    retry_count: u32,
    poll_attempt: u32,
    last_error: Option<String>,
    step_started_at: String,
    next_run_at: Option<String>,
    cancel_requested_by: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl OperationRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            requested_by: row.get(1)?,
            parameters: row.get(2)?,
            current_step: row.get(3)?,
            status: row.get(4)?,
            outputs: row.get(5)?,
            retry_count: row.get(6)?,
            poll_attempt: row.get(7)?,
            last_error: row.get(8)?,
            step_started_at: row.get(9)?,
            next_run_at: row.get(10)?,
            cancel_requested_by: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            version: row.get(14)?,
        })
    }

    fn into_operation(self) -> Result<Operation, StoreError> {
        let current_step: Step = self
            .current_step
            .parse()
            .map_err(StoreError::Serialization)?;
        let status: OperationStatus = self.status.parse().map_err(StoreError::Serialization)?;
        let outputs: StepOutputs = serde_json::from_str(&self.outputs).map_err(ser_err)?;
        let last_error = self
            .last_error
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(ser_err)?;
        let next_run_at = self.next_run_at.as_deref().map(parse_db_time).transpose()?;

        Ok(Operation {
            id: self.id,
            requested_by: self.requested_by,
            parameters: serde_json::from_str(&self.parameters).map_err(ser_err)?,
            current_step,
            status,
            outputs,
            retry_count: self.retry_count,
            poll_attempt: self.poll_attempt,
            last_error,
            step_started_at: parse_db_time(&self.step_started_at)?,
            next_run_at,
            cancel_requested_by: self.cancel_requested_by,
            created_at: parse_db_time(&self.created_at)?,
            updated_at: parse_db_time(&self.updated_at)?,
            version: self.version as u64,
        })
    }
}

/// SQLite-backed operation store.
pub struct SqliteOperationStore {
    conn: Mutex<Connection>,
}

impl SqliteOperationStore {
    /// Create a new SQLite operation store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite operation store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                requested_by TEXT NOT NULL,
                target_cluster_id TEXT NOT NULL,
                parameters TEXT NOT NULL,
                current_step TEXT NOT NULL,
                status TEXT NOT NULL,
                outputs TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                poll_attempt INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                step_started_at TEXT NOT NULL,
                next_run_at TEXT,
                cancel_requested_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);
            CREATE INDEX IF NOT EXISTS idx_operations_next_run_at ON operations(next_run_at);
            CREATE INDEX IF NOT EXISTS idx_operations_created_at ON operations(created_at);

            CREATE TABLE IF NOT EXISTS operation_leases (
                operation_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &OperationFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }

        if let Some(ref requested_by) = filter.requested_by {
            conditions.push("requested_by = ?");
            params.push(Box::new(requested_by.clone()));
        }

        if let Some(ref cluster) = filter.target_cluster_id {
            conditions.push("target_cluster_id = ?");
            params.push(Box::new(cluster.clone()));
        }

        if let Some(ref from) = filter.from {
            conditions.push("created_at >= ?");
            params.push(Box::new(to_db_time(from)));
        }

        if let Some(ref to) = filter.to {
            conditions.push("created_at <= ?");
            params.push(Box::new(to_db_time(to)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Operation>, StoreError> {
        let sql = format!("SELECT {} FROM operations WHERE id = ?", COLUMNS);
        let row = conn
            .query_row(&sql, params![id], OperationRow::from_row)
            .optional()
            .map_err(db_err)?;
        row.map(OperationRow::into_operation).transpose()
    }

    fn collect(
        conn: &Connection,
        sql: &str,
        params: Vec<Box<dyn rusqlite::ToSql>>,
    ) -> Result<Vec<Operation>, StoreError> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), OperationRow::from_row)
            .map_err(db_err)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(row.map_err(db_err)?.into_operation()?);
        }
        Ok(operations)
    }
}

impl OperationStore for SqliteOperationStore {
    fn create(&self, request: CreateOperationRequest) -> Result<Operation, StoreError> {
        let conn = self.lock()?;

        let id = request
            .operation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();

        let operation = Operation {
            id,
            requested_by: request.requested_by,
            parameters: request.parameters,
            current_step: Step::CheckSnapshot,
            status: OperationStatus::Pending,
            outputs: StepOutputs::default(),
            retry_count: 0,
            poll_attempt: 0,
            last_error: None,
            step_started_at: now,
            next_run_at: None,
            cancel_requested_by: None,
            created_at: now,
            updated_at: now,
            version: 1,
        };

        let parameters_json = serde_json::to_string(&operation.parameters).map_err(ser_err)?;
        let outputs_json = serde_json::to_string(&operation.outputs).map_err(ser_err)?;

        let result = conn.execute(
            "INSERT INTO operations (id, requested_by, target_cluster_id, parameters, current_step, status, outputs, retry_count, poll_attempt, step_started_at, created_at, updated_at, version) VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, 1)",
            params![
                operation.id,
                operation.requested_by,
                operation.parameters.target_cluster_id,
                parameters_json,
                operation.current_step.as_str(),
                operation.status.as_str(),
                outputs_json,
                to_db_time(&now),
                to_db_time(&now),
                to_db_time(&now),
            ],
        );

        match result {
            Ok(_) => Ok(operation),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists(operation.id))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn get(&self, id: &str) -> Result<Option<Operation>, StoreError> {
        let conn = self.lock()?;
        Self::fetch(&conn, id)
    }

    fn conditional_update(
        &self,
        operation: &Operation,
        expected_version: u64,
    ) -> Result<Operation, StoreError> {
        let conn = self.lock()?;

        let now = Utc::now();
        let new_version = expected_version + 1;
        let outputs_json = serde_json::to_string(&operation.outputs).map_err(ser_err)?;
        let last_error_json = operation
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(ser_err)?;

        let changed = conn
            .execute(
                "UPDATE operations SET current_step = ?, status = ?, outputs = ?, retry_count = ?, poll_attempt = ?, last_error = ?, step_started_at = ?, next_run_at = ?, cancel_requested_by = ?, updated_at = ?, version = ? WHERE id = ? AND version = ?",
                params![
                    operation.current_step.as_str(),
                    operation.status.as_str(),
                    outputs_json,
                    operation.retry_count,
                    operation.poll_attempt,
                    last_error_json,
                    to_db_time(&operation.step_started_at),
                    operation.next_run_at.as_ref().map(to_db_time),
                    operation.cancel_requested_by,
                    to_db_time(&now),
                    new_version as i64,
                    operation.id,
                    expected_version as i64,
                ],
            )
            .map_err(db_err)?;

        if changed == 0 {
            let actual: Option<i64> = conn
                .query_row(
                    "SELECT version FROM operations WHERE id = ?",
                    params![operation.id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?;

            return match actual {
                None => Err(StoreError::NotFound(operation.id.clone())),
                Some(actual) => Err(StoreError::VersionConflict {
                    operation_id: operation.id.clone(),
                    expected: expected_version,
                    actual: actual as u64,
                }),
            };
        }

        let mut updated = operation.clone();
        updated.version = new_version;
        updated.updated_at = now;
        Ok(updated)
    }

    fn delete(&self, id: &str) -> Result<Operation, StoreError> {
        let conn = self.lock()?;

        let operation = Self::fetch(&conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        conn.execute(
            "DELETE FROM operation_leases WHERE operation_id = ?",
            params![id],
        )
        .map_err(db_err)?;
        conn.execute("DELETE FROM operations WHERE id = ?", params![id])
            .map_err(db_err)?;

        Ok(operation)
    }

    fn list(&self, filter: &OperationFilter) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;

        let (where_clause, mut params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM operations {} ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
            COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        Self::collect(&conn, &sql, params)
    }

    fn count(&self, filter: &OperationFilter) -> Result<i64, StoreError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM operations {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Operation>, StoreError> {
        let conn = self.lock()?;

        let active: Vec<String> = OperationStatus::active()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let sql = format!(
            "SELECT {} FROM operations WHERE status IN ({}) AND (next_run_at IS NULL OR next_run_at <= ?) ORDER BY COALESCE(next_run_at, created_at) ASC LIMIT ?",
            COLUMNS,
            active.join(", ")
        );

        Self::collect(
            &conn,
            &sql,
            vec![Box::new(to_db_time(&now)), Box::new(limit)],
        )
    }

    fn acquire_lease(&self, id: &str, owner: &str, ttl: Duration) -> Result<Lease, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM operations WHERE id = ?", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let now = Utc::now();
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, expires_at FROM operation_leases WHERE operation_id = ?",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;

        if let Some((holder, expires_at)) = existing {
            let expires_at = parse_db_time(&expires_at)?;
            if holder != owner && expires_at > now {
                return Err(StoreError::LeaseConflict {
                    operation_id: id.to_string(),
                    holder,
                    expires_at,
                });
            }
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Database(format!("invalid lease ttl: {}", e)))?;
        let expires_at = now + ttl;

        tx.execute(
            "INSERT INTO operation_leases (operation_id, owner, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(operation_id) DO UPDATE SET owner = excluded.owner, acquired_at = excluded.acquired_at, expires_at = excluded.expires_at",
            params![id, owner, to_db_time(&now), to_db_time(&expires_at)],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        Ok(Lease {
            operation_id: id.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at,
        })
    }

    fn release_lease(&self, id: &str, owner: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM operation_leases WHERE operation_id = ? AND owner = ?",
            params![id, owner],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn create_test_store() -> SqliteOperationStore {
        SqliteOperationStore::in_memory().unwrap()
    }

    fn create_test_request() -> CreateOperationRequest {
        fixtures::create_request("orders-restored")
    }

    #[test]
    fn test_create_operation() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        assert!(!op.id.is_empty());
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.current_step, Step::CheckSnapshot);
        assert_eq!(op.version, 1);
        assert_eq!(op.outputs, StepOutputs::default());
    }

    #[test]
    fn test_create_with_explicit_id_rejects_duplicate() {
        let store = create_test_store();
        let mut request = create_test_request();
        request.operation_id = Some("restore-1".to_string());

        store.create(request.clone()).unwrap();
        let err = store.create(request).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == "restore-1"));
    }

    #[test]
    fn test_get_roundtrips_all_fields() {
        let store = create_test_store();
        let created = store.create(create_test_request()).unwrap();

        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.parameters, created.parameters);
        assert_eq!(fetched.requested_by, created.requested_by);
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[test]
    fn test_get_nonexistent_operation() {
        let store = create_test_store();
        assert!(store.get("nonexistent-id").unwrap().is_none());
    }

    #[test]
    fn test_conditional_update_bumps_version() {
        let store = create_test_store();
        let mut op = store.create(create_test_request()).unwrap();

        op.status = OperationStatus::InProgress;
        op.current_step = Step::CopySnapshot;
        let updated = store.conditional_update(&op, 1).unwrap();
        assert_eq!(updated.version, 2);

        let fetched = store.get(&op.id).unwrap().unwrap();
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.current_step, Step::CopySnapshot);
        assert_eq!(fetched.status, OperationStatus::InProgress);
    }

    #[test]
    fn test_conditional_update_rejects_stale_version() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        let mut first = op.clone();
        first.status = OperationStatus::InProgress;
        store.conditional_update(&first, 1).unwrap();

        let mut second = op.clone();
        second.status = OperationStatus::Cancelling;
        let err = store.conditional_update(&second, 1).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        let fetched = store.get(&op.id).unwrap().unwrap();
        assert_eq!(fetched.status, OperationStatus::InProgress);
    }

    #[test]
    fn test_conditional_update_missing_operation() {
        let store = create_test_store();
        let mut op = store.create(create_test_request()).unwrap();
        op.id = "ghost".to_string();

        let err = store.conditional_update(&op, 1).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_next_run_at_and_last_error_persist() {
        let store = create_test_store();
        let mut op = store.create(create_test_request()).unwrap();

        let at = Utc::now() + chrono::Duration::seconds(30);
        op.status = OperationStatus::Waiting;
        op.next_run_at = Some(at);
        op.last_error = Some(crate::operation::StepError {
            step: Step::CheckSnapshot,
            kind: crate::operation::ErrorKind::TransientProviderError,
            message: "throttled".to_string(),
            at: Utc::now(),
        });
        store.conditional_update(&op, 1).unwrap();

        let fetched = store.get(&op.id).unwrap().unwrap();
        assert_eq!(fetched.next_run_at.unwrap().timestamp_micros(), at.timestamp_micros());
        assert_eq!(fetched.last_error.unwrap().message, "throttled");
    }

    #[test]
    fn test_list_with_status_filter() {
        let store = create_test_store();
        store.create(create_test_request()).unwrap();
        let mut second = store.create(create_test_request()).unwrap();
        second.status = OperationStatus::Failed;
        store.conditional_update(&second, 1).unwrap();

        let pending = store
            .list(&OperationFilter::new().with_status(OperationStatus::Pending))
            .unwrap();
        assert_eq!(pending.len(), 1);

        let failed = store
            .count(&OperationFilter::new().with_status(OperationStatus::Failed))
            .unwrap();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_list_with_time_range_and_cluster() {
        let store = create_test_store();
        store.create(create_test_request()).unwrap();
        store
            .create(fixtures::create_request("billing-restored"))
            .unwrap();

        let by_cluster = store
            .list(&OperationFilter::new().with_target_cluster("billing-restored"))
            .unwrap();
        assert_eq!(by_cluster.len(), 1);

        let future = Utc::now() + chrono::Duration::hours(1);
        let none = store
            .list(&OperationFilter::new().with_time_range(Some(future), None))
            .unwrap();
        assert!(none.is_empty());

        let past = Utc::now() - chrono::Duration::hours(1);
        let all = store
            .list(&OperationFilter::new().with_time_range(Some(past), Some(future)))
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_list_pagination() {
        let store = create_test_store();
        for _ in 0..5 {
            store.create(create_test_request()).unwrap();
        }

        let page = store
            .list(&OperationFilter::new().with_limit(2).with_offset(4))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(store.count(&OperationFilter::new()).unwrap(), 5);
    }

    #[test]
    fn test_list_due_skips_future_and_terminal() {
        let store = create_test_store();
        let due = store.create(create_test_request()).unwrap();

        let mut later = store.create(create_test_request()).unwrap();
        later.status = OperationStatus::Waiting;
        later.next_run_at = Some(Utc::now() + chrono::Duration::minutes(5));
        store.conditional_update(&later, 1).unwrap();

        let mut done = store.create(create_test_request()).unwrap();
        done.status = OperationStatus::Succeeded;
        store.conditional_update(&done, 1).unwrap();

        let ops = store.list_due(Utc::now(), 10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].id, due.id);

        let ops = store
            .list_due(Utc::now() + chrono::Duration::minutes(10), 10)
            .unwrap();
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_lease_excludes_other_owner() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        let lease = store
            .acquire_lease(&op.id, "worker-a", Duration::from_secs(60))
            .unwrap();
        assert_eq!(lease.owner, "worker-a");

        let err = store
            .acquire_lease(&op.id, "worker-b", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict { holder, .. } if holder == "worker-a"));
    }

    #[test]
    fn test_lease_reaffirm_by_owner_extends_expiry() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        let first = store
            .acquire_lease(&op.id, "worker-a", Duration::from_secs(1))
            .unwrap();
        let second = store
            .acquire_lease(&op.id, "worker-a", Duration::from_secs(60))
            .unwrap();
        assert!(second.expires_at > first.expires_at);
    }

    #[test]
    fn test_expired_lease_can_be_taken_over() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        store
            .acquire_lease(&op.id, "crashed", Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let lease = store
            .acquire_lease(&op.id, "worker-b", Duration::from_secs(60))
            .unwrap();
        assert_eq!(lease.owner, "worker-b");
    }

    #[test]
    fn test_release_lease_only_by_owner() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        store
            .acquire_lease(&op.id, "worker-a", Duration::from_secs(60))
            .unwrap();
        store.release_lease(&op.id, "worker-b").unwrap();
        assert!(store
            .acquire_lease(&op.id, "worker-b", Duration::from_secs(60))
            .is_err());

        store.release_lease(&op.id, "worker-a").unwrap();
        assert!(store
            .acquire_lease(&op.id, "worker-b", Duration::from_secs(60))
            .is_ok());
    }

    #[test]
    fn test_lease_on_missing_operation() {
        let store = create_test_store();
        let err = store
            .acquire_lease("ghost", "worker-a", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_delete_operation() {
        let store = create_test_store();
        let op = store.create(create_test_request()).unwrap();

        let deleted = store.delete(&op.id).unwrap();
        assert_eq!(deleted.id, op.id);
        assert!(store.get(&op.id).unwrap().is_none());
        assert!(matches!(
            store.delete(&op.id).unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.db");

        let id = {
            let store = SqliteOperationStore::new(&path).unwrap();
            store.create(create_test_request()).unwrap().id
        };

        let reopened = SqliteOperationStore::new(&path).unwrap();
        assert!(reopened.get(&id).unwrap().is_some());
    }
}
