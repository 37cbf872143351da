//! SQLite 事件日志
//!
//! 单表 `events`：自增 `id` 作为全局追加顺序，`UNIQUE(stream_id, sequence_no)` 是持久化层的序列化点。
//! 每次追加一个事务，`synchronous=FULL`，返回即已落盘。

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;

use crate::core::error::{HydraError, Result};
use crate::core::events::RecordedEvent;
use crate::storage::event_log::{check_expected, EventFilter, EventLog};

pub struct SqliteEventLog {
    conn: Mutex<Connection>,
}

impl SqliteEventLog {
    /// 打开（或创建）数据库文件；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    HydraError::Config(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL,
                UNIQUE (stream_id, sequence_no)
            );
            CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn head_of(conn: &Connection, stream_id: &str) -> Result<u64> {
        let head: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_no), 0) FROM events WHERE stream_id = ?1",
            params![stream_id],
            |row| row.get(0),
        )?;
        Ok(head as u64)
    }
}

/// 时间戳按文本读出，解析失败与 payload 损坏一样只影响所在 stream
type RawRow = (String, i64, String, String, String);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_row((stream_id, sequence_no, event_type, timestamp, payload): RawRow) -> Result<RecordedEvent> {
    let sequence_no = sequence_no as u64;
    let timestamp = parse_timestamp(&timestamp).map_err(|e| {
        HydraError::corruption(&stream_id, sequence_no, format!("unparseable timestamp: {e}"))
    })?;
    let payload: Value = serde_json::from_str(&payload).map_err(|e| {
        HydraError::corruption(&stream_id, sequence_no, format!("unparseable payload: {e}"))
    })?;
    Ok(RecordedEvent {
        stream_id,
        sequence_no,
        event_type,
        timestamp,
        payload,
    })
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|t| t.with_timezone(&Utc))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation
    )
}

impl EventLog for SqliteEventLog {
    fn append_all(
        &self,
        stream_id: &str,
        events: Vec<(String, Value)>,
        expected_sequence: Option<u64>,
    ) -> Result<Vec<RecordedEvent>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let head = Self::head_of(&tx, stream_id)?;
        check_expected(stream_id, head, expected_sequence)?;

        let timestamp = Utc::now();
        let mut recorded = Vec::with_capacity(events.len());
        for (i, (event_type, payload)) in events.into_iter().enumerate() {
            let sequence_no = head + 1 + i as u64;
            let inserted = tx.execute(
                "INSERT INTO events (stream_id, sequence_no, event_type, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    stream_id,
                    sequence_no as i64,
                    event_type,
                    timestamp.to_rfc3339(),
                    payload.to_string()
                ],
            );
            match inserted {
                Ok(_) => {}
                // 另一个进程抢先写入了同一序号
                Err(e) if is_unique_violation(&e) => {
                    return Err(HydraError::Conflict {
                        stream_id: stream_id.to_string(),
                        expected: expected_sequence.unwrap_or(head),
                        actual: head + 1 + i as u64,
                    })
                }
                Err(e) => return Err(e.into()),
            }
            recorded.push(RecordedEvent {
                stream_id: stream_id.to_string(),
                sequence_no,
                event_type,
                timestamp,
                payload,
            });
        }
        tx.commit()?;
        Ok(recorded)
    }

    fn read_stream(&self, stream_id: &str) -> Result<Vec<RecordedEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT stream_id, sequence_no, event_type, timestamp, payload
             FROM events WHERE stream_id = ?1 ORDER BY sequence_no ASC",
        )?;
        let rows = stmt
            .query_map(params![stream_id], raw_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    fn read_all(&self, filter: &EventFilter) -> Result<Vec<RecordedEvent>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT stream_id, sequence_no, event_type, timestamp, payload FROM (
                SELECT id, stream_id, sequence_no, event_type, timestamp, payload
                FROM events
                WHERE (?1 IS NULL OR event_type = ?1) AND (?2 IS NULL OR stream_id = ?2)
                ORDER BY id DESC
                LIMIT ?3
             ) ORDER BY id ASC",
        )?;
        let limit = filter.limit.map_or(-1, |l| l as i64);
        let rows = stmt
            .query_map(
                params![filter.event_type, filter.stream_id, limit],
                raw_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(decode_row).collect()
    }

    fn stream_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT DISTINCT stream_id FROM events ORDER BY stream_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    fn head(&self, stream_id: &str) -> Result<u64> {
        Self::head_of(&self.lock(), stream_id)
    }

    fn flush(&self) -> Result<()> {
        let conn = self.lock();
        // 内存库不支持 WAL，checkpoint 返回空行
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .optional()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_read_back() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        log.append("t1", "TaskCreated", json!({"brief": "x"}), Some(0))
            .unwrap();
        log.append("t1", "ResumeFailed", json!({"reason": "timeout"}), Some(1))
            .unwrap();

        let events = log.read_stream("t1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_no, 1);
        assert_eq!(events[1].payload["reason"], "timeout");
        assert_eq!(log.head("t1").unwrap(), 2);
    }

    #[test]
    fn test_conflict_leaves_stream_unchanged() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        for _ in 0..3 {
            log.append("t1", "ResumeFailed", json!({}), None).unwrap();
        }
        let err = log
            .append("t1", "ResumeFailed", json!({}), Some(2))
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(log.head("t1").unwrap(), 3);
    }

    #[test]
    fn test_append_all_is_atomic_on_conflict() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        log.append("t1", "TaskCreated", json!({}), None).unwrap();
        let batch = vec![
            ("SessionStarted".to_string(), json!({})),
            ("TaskStatusChanged".to_string(), json!({})),
        ];
        assert!(log.append_all("t1", batch, Some(0)).is_err());
        assert_eq!(log.read_stream("t1").unwrap().len(), 1);
    }

    #[test]
    fn test_read_all_limit_keeps_latest() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        log.append("a", "ResumeAlertRaised", json!({"n": 1}), None).unwrap();
        log.append("b", "ResumeAlertRaised", json!({"n": 2}), None).unwrap();
        log.append("b", "ResumeFailed", json!({}), None).unwrap();
        log.append("a", "ResumeAlertRaised", json!({"n": 3}), None).unwrap();

        let filter = EventFilter::event_type("ResumeAlertRaised").with_limit(2);
        let latest = log.read_all(&filter).unwrap();
        let ns: Vec<_> = latest.iter().map(|e| e.payload["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3]);
        assert_eq!(log.stream_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_unparseable_payload_is_corruption() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        {
            let conn = log.lock();
            conn.execute(
                "INSERT INTO events (stream_id, sequence_no, event_type, timestamp, payload)
                 VALUES ('t1', 1, 'TaskCreated', ?1, '{not json')",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        }
        let err = log.read_stream("t1").unwrap_err();
        assert!(matches!(err, HydraError::Corruption { sequence_no: 1, .. }));
    }

    #[test]
    fn test_reopen_file_preserves_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hydra.db");
        {
            let log = SqliteEventLog::open(&path).unwrap();
            log.append("t1", "TaskCreated", json!({}), None).unwrap();
            log.flush().unwrap();
        }
        let log = SqliteEventLog::open(&path).unwrap();
        assert_eq!(log.head("t1").unwrap(), 1);
    }

    #[test]
    fn test_garbled_timestamp_degrades_only_its_stream() {
        let dir = tempfile::tempdir().unwrap();
        let log = SqliteEventLog::open(dir.path().join("hydra.db")).unwrap();
        for stream in ["bad", "good"] {
            log.append(
                stream,
                "TaskCreated",
                json!({"profile_id": "generalist", "brief": "b"}),
                Some(0),
            )
            .unwrap();
        }
        log.lock()
            .execute("UPDATE events SET timestamp = 'garbage' WHERE stream_id = 'bad'", [])
            .unwrap();

        assert!(matches!(
            log.read_stream("bad").unwrap_err(),
            HydraError::Corruption { sequence_no: 1, .. }
        ));

        let registry = crate::core::hydrate(&log).unwrap();
        assert_eq!(registry.report().degraded_streams, vec!["bad".to_string()]);
        assert_eq!(
            registry.task("bad").unwrap().status,
            crate::core::TaskStatus::Degraded
        );
        assert_eq!(
            registry.task("good").unwrap().status,
            crate::core::TaskStatus::Created
        );
    }

    #[test]
    fn test_timestamp_round_trips_exactly() {
        let log = SqliteEventLog::open_in_memory().unwrap();
        let written = log.append("t1", "TaskCreated", json!({}), None).unwrap();
        let read = log.read_stream("t1").unwrap();
        assert_eq!(read[0].timestamp, written.timestamp);
    }
}
