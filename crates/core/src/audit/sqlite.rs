use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use super::{AuditError, AuditEvent, AuditFilter, AuditOutcome, AuditRecord, AuditStore};

const COLUMNS: &str = "id, operation_id, sequence, timestamp, event_type, step, outcome, actor, data";

fn db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_err(e: rusqlite::Error) -> AuditError {
    AuditError::Database(e.to_string())
}

/// SQLite-backed audit store
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    /// Create a new SQLite audit store, creating the database file and tables if needed
    pub fn new(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite audit store (useful for testing)
    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT,
                sequence INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                step TEXT,
                outcome TEXT NOT NULL,
                actor TEXT,
                data TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_events_operation_sequence
                ON audit_events(operation_id, sequence) WHERE operation_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_audit_events_timestamp ON audit_events(timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_events_event_type ON audit_events(event_type);
            "#,
        )
        .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AuditError> {
        self.conn
            .lock()
            .map_err(|_| AuditError::Database("connection mutex poisoned".to_string()))
    }

    fn build_where_clause(filter: &AuditFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref operation_id) = filter.operation_id {
            conditions.push("operation_id = ?");
            params.push(Box::new(operation_id.clone()));
        }

        if let Some(ref event_type) = filter.event_type {
            conditions.push("event_type = ?");
            params.push(Box::new(event_type.clone()));
        }

        if let Some(step) = filter.step {
            conditions.push("step = ?");
            params.push(Box::new(step.as_str().to_string()));
        }

        if let Some(outcome) = filter.outcome {
            conditions.push("outcome = ?");
            params.push(Box::new(outcome.as_str().to_string()));
        }

        if let Some(ref actor) = filter.actor {
            conditions.push("actor = ?");
            params.push(Box::new(actor.clone()));
        }

        if let Some(ref from) = filter.from {
            conditions.push("timestamp >= ?");
            params.push(Box::new(db_time(from)));
        }

        if let Some(ref to) = filter.to {
            conditions.push("timestamp <= ?");
            params.push(Box::new(db_time(to)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn collect(
        conn: &Connection,
        sql: &str,
        params: Vec<Box<dyn rusqlite::ToSql>>,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let mut stmt = conn.prepare(sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                let id: i64 = row.get(0)?;
                let operation_id: Option<String> = row.get(1)?;
                let sequence: i64 = row.get(2)?;
                let timestamp_str: String = row.get(3)?;
                let event_type: String = row.get(4)?;
                let actor: Option<String> = row.get(7)?;
                let data_json: String = row.get(8)?;

                Ok((id, operation_id, sequence, timestamp_str, event_type, actor, data_json))
            })
            .map_err(db_err)?;

        let mut records = Vec::new();
        for row_result in rows {
            let (id, operation_id, sequence, timestamp_str, event_type, actor, data_json) =
                row_result.map_err(db_err)?;

            let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&timestamp_str)
                .map_err(|e| AuditError::Database(format!("Invalid timestamp: {}", e)))?
                .into();

            let data: AuditEvent = serde_json::from_str(&data_json)
                .map_err(|e| AuditError::Serialization(e.to_string()))?;

            // step and outcome columns exist for filtering; the event is the source of truth.
            records.push(AuditRecord {
                id,
                operation_id,
                sequence,
                timestamp,
                event_type,
                step: data.step(),
                outcome: data.outcome(),
                actor,
                data,
            });
        }

        Ok(records)
    }
}

impl AuditStore for SqliteAuditStore {
    fn append(&self, record: &AuditRecord) -> Result<AuditRecord, AuditError> {
        let mut conn = self.lock()?;

        let data_json = serde_json::to_string(&record.data)
            .map_err(|e| AuditError::Serialization(e.to_string()))?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let sequence: i64 = match record.operation_id {
            Some(ref operation_id) => tx
                .query_row(
                    "SELECT COALESCE(MAX(sequence), 0) + 1 FROM audit_events WHERE operation_id = ?",
                    params![operation_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?,
            None => 0,
        };

        tx.execute(
            "INSERT INTO audit_events (operation_id, sequence, timestamp, event_type, step, outcome, actor, data) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                record.operation_id,
                sequence,
                db_time(&record.timestamp),
                record.event_type,
                record.step.map(|s| s.as_str()),
                record.outcome.as_str(),
                record.actor,
                data_json,
            ],
        )
        .map_err(db_err)?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err)?;

        let mut stored = record.clone();
        stored.id = id;
        stored.sequence = sequence;
        Ok(stored)
    }

    fn events_for(&self, operation_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM audit_events WHERE operation_id = ? ORDER BY sequence ASC",
            COLUMNS
        );
        Self::collect(&conn, &sql, vec![Box::new(operation_id.to_string())])
    }

    fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.lock()?;

        let (where_clause, mut params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM audit_events {} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        Self::collect(&conn, &sql, params)
    }

    fn count(&self, filter: &AuditFilter) -> Result<i64, AuditError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM audit_events {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }
}
