//! SQLite event store implementation.

use crate::{Error, Event, EventKind, ExecutionId, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Summary of one execution's event trail.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub id: ExecutionId,
    pub function_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub event_count: usize,
}

/// SQLite-backed event store.
///
/// The connection sits behind a mutex so one store can be shared by
/// concurrent executions; every call holds the lock for a single statement.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open or create an event store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory event store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                execution_id TEXT NOT NULL,
                function_id TEXT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_execution
                ON events(execution_id, seq);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::Poisoned)
    }

    /// Append an event to the store.
    pub fn append(&self, event: &Event) -> Result<()> {
        let data = serde_json::to_string(&event.data)?;
        self.conn()?.execute(
            "INSERT INTO events (id, execution_id, function_id, timestamp, kind, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id.to_string(),
                event.execution_id.to_string(),
                event.function_id,
                event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                event.kind.as_str(),
                data,
            ],
        )?;
        Ok(())
    }

    /// Load all events for an execution, in append order.
    pub fn load_execution(&self, execution_id: ExecutionId) -> Result<Vec<Event>> {
        self.load_events(execution_id, None)
    }

    /// Load events for an execution, optionally restricted to one kind.
    pub fn load_events(
        &self,
        execution_id: ExecutionId,
        kind: Option<EventKind>,
    ) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, function_id, timestamp, kind, data FROM events
             WHERE execution_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY seq",
        )?;

        let rows = stmt.query_map(
            params![execution_id.to_string(), kind.map(|k| k.as_str())],
            |row| {
                Ok(RawEvent {
                    id: row.get(0)?,
                    execution_id: row.get(1)?,
                    function_id: row.get(2)?,
                    timestamp: row.get(3)?,
                    kind: row.get(4)?,
                    data: row.get(5)?,
                })
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?.decode()?);
        }
        Ok(events)
    }

    /// Summaries of every stored execution, most recent first.
    pub fn list_executions(&self) -> Result<Vec<ExecutionSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id,
                    MAX(function_id),
                    MIN(timestamp),
                    MAX(CASE WHEN kind IN ('AI_FUNCTION_END', 'AI_FUNCTION_ERROR')
                        THEN timestamp END),
                    COUNT(*)
             FROM events
             GROUP BY execution_id
             ORDER BY MIN(seq) DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, function_id, started_at, ended_at, count) = row?;
            summaries.push(ExecutionSummary {
                id: parse_id(&id)?,
                function_id,
                started_at: parse_timestamp(&started_at)?,
                ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
                event_count: usize::try_from(count).unwrap_or_default(),
            });
        }
        Ok(summaries)
    }
}

struct RawEvent {
    id: String,
    execution_id: String,
    function_id: Option<String>,
    timestamp: String,
    kind: String,
    data: String,
}

impl RawEvent {
    fn decode(self) -> Result<Event> {
        Ok(Event {
            id: self
                .id
                .parse()
                .map_err(|_| Error::Corrupt(format!("malformed event id {}", self.id)))?,
            execution_id: parse_id(&self.execution_id)?,
            timestamp: parse_timestamp(&self.timestamp)?,
            kind: serde_json::from_value(serde_json::Value::String(self.kind))?,
            function_id: self.function_id,
            data: serde_json::from_str(&self.data)?,
        })
    }
}

fn parse_id(raw: &str) -> Result<ExecutionId> {
    raw.parse()
        .map_err(|_| Error::Corrupt(format!("malformed execution id {raw}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::Corrupt(format!("malformed timestamp {raw}")))
}
