//! 启动时的 resume 扫描
//!
//! 回放完成后对所有候选任务执行一次 resume，Semaphore 限制同时进行的 attempt 数；
//! 不做定时重试，后续重试由外部调用方决定。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::AttemptResult;

/// 一次扫描的汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// 因 ResumeBusy / 状态变化 / 关闭而未执行
    pub skipped: usize,
}

pub struct ResumeSweep {
    semaphore: Arc<Semaphore>,
}

impl ResumeSweep {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub async fn run(&self, orchestrator: &Orchestrator, shutdown: &CancellationToken) -> SweepReport {
        let candidates = orchestrator.resume_candidates();
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };
        info!(candidates = candidates.len(), "Starting resume sweep");

        let attempts = candidates.iter().map(|candidate| async move {
            let Ok(_permit) = self.semaphore.acquire().await else {
                return None;
            };
            if shutdown.is_cancelled() {
                return None;
            }
            match orchestrator.resume_task(&candidate.task_id).await {
                Ok(outcome) => Some(outcome.result),
                Err(e) => {
                    warn!(task_id = %candidate.task_id, "Sweep skipped task: {}", e);
                    None
                }
            }
        });

        for result in join_all(attempts).await {
            match result {
                Some(AttemptResult::Succeeded) => report.succeeded += 1,
                Some(AttemptResult::Failed { .. }) => report.failed += 1,
                Some(AttemptResult::Cancelled { .. }) => report.cancelled += 1,
                None => report.skipped += 1,
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            skipped = report.skipped,
            "Resume sweep finished"
        );
        report
    }
}

impl Default for ResumeSweep {
    fn default() -> Self {
        Self::new(2)
    }
}
