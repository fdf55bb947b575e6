//! Embedded transaction store.
//!
//! A single SQLite database holds every captured transaction in the
//! `mock_transactions` table. The store opens with WAL journaling and
//! normal synchronous durability, creates the table and its secondary
//! indexes on first use, and exposes single-record and batched inserts
//! plus the reverse-chronological query used by the control plane.

use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// One captured request/response pair.
///
/// Bodies are raw bytes: the pipeline stores exactly what was read from
/// the request and written to the response, including deliberately
/// malformed UTF-8 produced by the `invalidUTF8` template helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub uuid: String,
    pub reception_id: String,
    pub sender_id: String,
    pub request_headers: String,
    pub request_method: String,
    pub request_endpoint: String,
    #[serde(with = "body_bytes")]
    pub request_body: Vec<u8>,
    pub response_headers: String,
    #[serde(with = "body_bytes")]
    pub response_body: Vec<u8>,
    pub response_status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// JSON representation for body bytes. The store keeps the exact bytes;
/// over the control-plane API they surface as lossy UTF-8 text, the same
/// view an HTTP client gets of a non-UTF-8 body.
mod body_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(text.into_bytes())
    }
}

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS mock_transactions (
    uuid TEXT PRIMARY KEY,
    recepcion_id TEXT,
    sender_id TEXT,
    request_headers TEXT,
    request_method TEXT NOT NULL,
    request_endpoint TEXT NOT NULL,
    request_body BLOB,
    response_headers TEXT,
    response_body BLOB,
    response_status_code INTEGER,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
)";

const CREATE_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS idx_transactions_recepcion_id ON mock_transactions(recepcion_id);
CREATE INDEX IF NOT EXISTS idx_transactions_sender_id ON mock_transactions(sender_id);
CREATE INDEX IF NOT EXISTS idx_transactions_method ON mock_transactions(request_method);
CREATE INDEX IF NOT EXISTS idx_transactions_endpoint ON mock_transactions(request_endpoint);
CREATE INDEX IF NOT EXISTS idx_transactions_method_endpoint
    ON mock_transactions(request_method, request_endpoint);
";

const INSERT_SQL: &str = "
INSERT INTO mock_transactions (
    uuid, recepcion_id, sender_id, request_headers, request_method,
    request_endpoint, request_body, response_headers, response_body,
    response_status_code, timestamp
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

/// Handle to the embedded store. Cheap to clone; all clones share one
/// connection (SQLite serializes writers regardless of connection count).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        // journal_mode replies with the resulting mode, so it cannot go
        // through pragma_update. In-memory databases stay on "memory".
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute(CREATE_TABLE, [])?;
        conn.execute_batch(CREATE_INDEXES)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert a single record outside any batch (the capture fallback path).
    pub fn insert(&self, record: &TransactionRecord) -> Result<()> {
        let conn = self.conn.lock();
        execute_insert(&conn, record)?;
        Ok(())
    }

    /// Insert a whole batch inside one transaction with a prepared
    /// statement. Either every record commits or none does.
    pub fn insert_batch(&self, records: &[TransactionRecord]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT_SQL)?;
            for record in records {
                stmt.execute(params![
                    record.uuid,
                    record.reception_id,
                    record.sender_id,
                    record.request_headers,
                    record.request_method,
                    record.request_endpoint,
                    record.request_body,
                    record.response_headers,
                    record.response_body,
                    record.response_status_code,
                    format_timestamp(&record.timestamp),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All captured records, most recent first.
    pub fn fetch_all(&self) -> Result<Vec<TransactionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, recepcion_id, sender_id, request_headers, request_method,
                    request_endpoint, request_body, response_headers, response_body,
                    response_status_code, timestamp
             FROM mock_transactions ORDER BY timestamp DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let timestamp: String = row.get(10)?;
            Ok(TransactionRecord {
                uuid: row.get(0)?,
                reception_id: row.get(1)?,
                sender_id: row.get(2)?,
                request_headers: row.get(3)?,
                request_method: row.get(4)?,
                request_endpoint: row.get(5)?,
                request_body: row.get(6)?,
                response_headers: row.get(7)?,
                response_body: row.get(8)?,
                response_status_code: row.get::<_, i64>(9)? as u16,
                timestamp: parse_timestamp(&timestamp),
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Total number of captured records.
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mock_transactions", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}

fn execute_insert(conn: &Connection, record: &TransactionRecord) -> rusqlite::Result<usize> {
    conn.execute(
        INSERT_SQL,
        params![
            record.uuid,
            record.reception_id,
            record.sender_id,
            record.request_headers,
            record.request_method,
            record.request_endpoint,
            record.request_body,
            record.response_headers,
            record.response_body,
            record.response_status_code,
            format_timestamp(&record.timestamp),
        ],
    )
}

/// Fixed-width UTC timestamp so lexicographic order matches time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(uuid: &str, endpoint: &str, ts: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            uuid: uuid.to_string(),
            reception_id: "rec-1".to_string(),
            sender_id: "snd-1".to_string(),
            request_headers: "{}".to_string(),
            request_method: "GET".to_string(),
            request_endpoint: endpoint.to_string(),
            request_body: Vec::new(),
            response_headers: "{}".to_string(),
            response_body: br#"{"test":true}"#.to_vec(),
            response_status_code: 200,
            timestamp: ts,
        }
    }

    #[test]
    fn test_insert_and_fetch_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let rec = record("u-1", "/api/test", Utc::now());
        store.insert(&rec).unwrap();

        let fetched = store.fetch_all().unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].uuid, "u-1");
        assert_eq!(fetched[0].request_endpoint, "/api/test");
        assert_eq!(fetched[0].response_status_code, 200);
    }

    #[test]
    fn test_batch_insert_is_atomic_on_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.insert(&record("dup", "/a", Utc::now())).unwrap();

        // Second record collides on the primary key; the whole batch must
        // roll back.
        let batch = vec![
            record("fresh", "/b", Utc::now()),
            record("dup", "/c", Utc::now()),
        ];
        assert!(store.insert_batch(&batch).is_err());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_fetch_all_reverse_chronological() {
        let store = Store::open_in_memory().unwrap();
        let base = Utc::now();
        store
            .insert(&record("old", "/a", base - Duration::seconds(60)))
            .unwrap();
        store.insert(&record("new", "/b", base)).unwrap();
        store
            .insert(&record("mid", "/c", base - Duration::seconds(30)))
            .unwrap();

        let order: Vec<String> = store
            .fetch_all()
            .unwrap()
            .into_iter()
            .map(|r| r.uuid)
            .collect();
        assert_eq!(order, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_batch_insert_commits_every_record() {
        let store = Store::open_in_memory().unwrap();
        let batch: Vec<TransactionRecord> = (0..25)
            .map(|i| record(&format!("u-{i}"), "/bulk", Utc::now()))
            .collect();
        store.insert_batch(&batch).unwrap();
        assert_eq!(store.count().unwrap(), 25);
    }

    #[test]
    fn test_bodies_round_trip_byte_for_byte() {
        let store = Store::open_in_memory().unwrap();

        // Bodies that are not valid UTF-8 must come back unchanged.
        let mut rec = record("bytes", "/raw", Utc::now());
        rec.request_body = vec![0xED, 0xA0, 0x80];
        rec.response_body = vec![0xC0, 0x81, b'!', 0xF5];
        assert!(std::str::from_utf8(&rec.response_body).is_err());
        store.insert(&rec).unwrap();

        let fetched = store.fetch_all().unwrap();
        assert_eq!(fetched[0].request_body, vec![0xED, 0xA0, 0x80]);
        assert_eq!(fetched[0].response_body, vec![0xC0, 0x81, b'!', 0xF5]);
    }

    #[test]
    fn test_record_json_surfaces_bodies_as_lossy_text() {
        let mut rec = record("api", "/raw", Utc::now());
        rec.response_body = vec![b'a', 0xC0, b'b'];

        let encoded = serde_json::to_value(&rec).unwrap();
        assert_eq!(encoded["response_body"], "a\u{FFFD}b");
    }

    #[test]
    fn test_timestamp_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let ts = Utc::now();
        store.insert(&record("t-1", "/ts", ts)).unwrap();

        let fetched = store.fetch_all().unwrap();
        let diff = (fetched[0].timestamp - ts).num_microseconds().unwrap_or(0);
        assert!(diff.abs() < 2);
    }
}
