//! 会话监管：进行中的 resume attempt 与取消令牌
//!
//! 每个 in-flight attempt 持有根 token 的子 token；`cancel` 取消单个任务，`cancel_all` 在关闭时取消全部。
//! 标记表是 single-flight 的判定依据：同一 task_id 同时只能登记一个 attempt。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct InFlight {
    attempt_id: String,
    token: CancellationToken,
}

#[derive(Debug)]
pub struct SessionSupervisor {
    /// 关闭时触发
    root: CancellationToken,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// 登记 attempt；已有进行中的 attempt 时返回 None
    pub fn try_begin(&self, task_id: &str, attempt_id: &str) -> Option<CancellationToken> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.contains_key(task_id) {
            return None;
        }
        let token = self.root.child_token();
        in_flight.insert(
            task_id.to_string(),
            InFlight {
                attempt_id: attempt_id.to_string(),
                token: token.clone(),
            },
        );
        Some(token)
    }

    /// 移除标记（只移除同一 attempt 的标记）
    pub fn finish(&self, task_id: &str, attempt_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(task_id)
            .is_some_and(|f| f.attempt_id == attempt_id)
        {
            in_flight.remove(task_id);
        }
    }

    /// 请求取消某任务的 attempt；没有进行中的 attempt 时返回 false
    pub fn cancel(&self, task_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        match in_flight.get(task_id) {
            Some(f) => {
                f.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
