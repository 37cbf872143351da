//! 事件日志抽象
//!
//! 只追加、按 stream 有序；`sequence_no = head + 1`，追加在返回前完成落盘。
//! 给出 `expected` 且与当前 head 不一致时返回 `Conflict`，不追加任何内容。
//! 没有更新与删除，修正通过新的补偿事件完成。

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use crate::core::error::{HydraError, Result};
use crate::core::events::{DomainEvent, RecordedEvent};

/// 跨 stream 查询条件
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub stream_id: Option<String>,
    /// 只保留最后 N 条（按全局追加顺序）
    pub limit: Option<usize>,
}

impl EventFilter {
    pub fn event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &RecordedEvent) -> bool {
        self.event_type
            .as_deref()
            .map_or(true, |t| event.event_type == t)
            && self
                .stream_id
                .as_deref()
                .map_or(true, |s| event.stream_id == s)
    }
}

/// 事件日志存储接口
pub trait EventLog: Send + Sync {
    /// 追加单条原始事件
    fn append(
        &self,
        stream_id: &str,
        event_type: &str,
        payload: Value,
        expected_sequence: Option<u64>,
    ) -> Result<RecordedEvent> {
        let mut appended =
            self.append_all(stream_id, vec![(event_type.to_string(), payload)], expected_sequence)?;
        appended
            .pop()
            .ok_or_else(|| HydraError::corruption(stream_id, 0, "append returned no event"))
    }

    /// 原子追加多条事件：全部成功或全部不写
    fn append_all(
        &self,
        stream_id: &str,
        events: Vec<(String, Value)>,
        expected_sequence: Option<u64>,
    ) -> Result<Vec<RecordedEvent>>;

    /// 从序号 1 开始读取整个 stream
    fn read_stream(&self, stream_id: &str) -> Result<Vec<RecordedEvent>>;

    /// 按全局追加顺序的跨 stream 查询
    fn read_all(&self, filter: &EventFilter) -> Result<Vec<RecordedEvent>>;

    /// 所有已知 stream（有序）
    fn stream_ids(&self) -> Result<Vec<String>>;

    fn head(&self, stream_id: &str) -> Result<u64>;

    /// 关闭前的持久化检查点
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// 追加类型化领域事件
pub fn append_domain(
    log: &dyn EventLog,
    stream_id: &str,
    events: &[DomainEvent],
    expected_sequence: Option<u64>,
) -> Result<Vec<RecordedEvent>> {
    let encoded = events
        .iter()
        .map(DomainEvent::encode)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    log.append_all(stream_id, encoded, expected_sequence)
}

pub(crate) fn check_expected(stream_id: &str, head: u64, expected: Option<u64>) -> Result<()> {
    match expected {
        Some(expected) if expected != head => Err(HydraError::Conflict {
            stream_id: stream_id.to_string(),
            expected,
            actual: head,
        }),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    streams: BTreeMap<String, Vec<RecordedEvent>>,
    /// 全局追加顺序：(stream_id, sequence_no)
    order: Vec<(String, u64)>,
}

/// 内存事件日志（测试与 `store.backend = "memory"`）
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    inner: Mutex<MemoryInner>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用原始记录预置日志，不做任何校验；用于离线回放（含缺口、未知类型）
    pub fn from_records(records: Vec<RecordedEvent>) -> Self {
        let mut inner = MemoryInner::default();
        for record in records {
            inner
                .order
                .push((record.stream_id.clone(), record.sequence_no));
            inner
                .streams
                .entry(record.stream_id.clone())
                .or_default()
                .push(record);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl EventLog for InMemoryEventLog {
    fn append_all(
        &self,
        stream_id: &str,
        events: Vec<(String, Value)>,
        expected_sequence: Option<u64>,
    ) -> Result<Vec<RecordedEvent>> {
        let mut inner = self.lock();
        let head = inner
            .streams
            .get(stream_id)
            .and_then(|s| s.last())
            .map_or(0, |e| e.sequence_no);
        check_expected(stream_id, head, expected_sequence)?;

        let timestamp = Utc::now();
        let recorded: Vec<RecordedEvent> = events
            .into_iter()
            .enumerate()
            .map(|(i, (event_type, payload))| RecordedEvent {
                stream_id: stream_id.to_string(),
                sequence_no: head + 1 + i as u64,
                event_type,
                timestamp,
                payload,
            })
            .collect();

        for event in &recorded {
            inner.order.push((stream_id.to_string(), event.sequence_no));
        }
        inner
            .streams
            .entry(stream_id.to_string())
            .or_default()
            .extend(recorded.iter().cloned());
        Ok(recorded)
    }

    fn read_stream(&self, stream_id: &str) -> Result<Vec<RecordedEvent>> {
        Ok(self.lock().streams.get(stream_id).cloned().unwrap_or_default())
    }

    fn read_all(&self, filter: &EventFilter) -> Result<Vec<RecordedEvent>> {
        let inner = self.lock();
        let mut matched: Vec<RecordedEvent> = inner
            .order
            .iter()
            .filter_map(|(stream, seq)| {
                inner
                    .streams
                    .get(stream)
                    .and_then(|events| events.iter().find(|e| e.sequence_no == *seq))
            })
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        Ok(matched)
    }

    fn stream_ids(&self) -> Result<Vec<String>> {
        Ok(self.lock().streams.keys().cloned().collect())
    }

    fn head(&self, stream_id: &str) -> Result<u64> {
        Ok(self
            .lock()
            .streams
            .get(stream_id)
            .and_then(|s| s.last())
            .map_or(0, |e| e.sequence_no))
    }
}
