//! 优雅关闭
//!
//! `ShutdownSignal` 记录第一次触发的原因并取消 token（启动扫描据此停止发起新的 attempt）；
//! `drain_engine` 取消进行中的 resume attempt，在宽限期内等待其 `ResumeCancelled` 落盘，
//! 最后对事件日志做一次检查点。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::orchestrator::Orchestrator;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
}

#[derive(Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 只保留第一次的原因；重复触发无副作用
    pub fn trigger(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            info!(?reason, "Shutdown requested");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待触发并返回原因
    pub async fn wait(&self) -> Option<ShutdownReason> {
        self.token.cancelled().await;
        self.reason()
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn listen_for_signals(self: &Arc<Self>) {
        let signal = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.trigger(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let signal = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal as unix_signal, SignalKind};
                if let Ok(mut sigterm) = unix_signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    signal.trigger(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭结果，写进最后一条日志
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownReport {
    pub reason: Option<ShutdownReason>,
    pub in_flight_at_start: usize,
    /// false 表示超过硬上限，日志未做检查点
    pub drained: bool,
}

/// 取消并等待进行中的 attempt，然后 flush 事件日志
///
/// `grace` 是等待 attempt 结算的时间；`hard_limit` 兜住整个过程，包括 flush。
pub async fn drain_engine(
    orchestrator: &Orchestrator,
    reason: Option<ShutdownReason>,
    grace: Duration,
    hard_limit: Duration,
) -> ShutdownReport {
    let in_flight_at_start = orchestrator.in_flight_count();
    info!(in_flight = in_flight_at_start, "Draining resume attempts");
    let drained = match tokio::time::timeout(hard_limit, orchestrator.shutdown(grace)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Engine shutdown failed: {}", e);
            false
        }
        Err(_) => {
            warn!("Engine shutdown exceeded {:?}", hard_limit);
            false
        }
    };
    ShutdownReport {
        reason,
        in_flight_at_start,
        drained,
    }
}
