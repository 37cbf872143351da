//! 核心编排层：事件模型、状态投影、提交路径、resume 协调与告警、编排门面、启动扫描、优雅关闭

pub mod alerts;
pub mod error;
pub mod events;
pub mod journal;
pub mod orchestrator;
pub mod projector;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use alerts::AlertEmitter;
pub use error::{HydraError, Result};
pub use events::{DomainEvent, EventType, RecordedEvent};
pub use journal::Journal;
pub use orchestrator::{Orchestrator, StartedTask, TaskOutcome};
pub use projector::{hydrate, Applied, Registry};
pub use recovery::{AttemptResult, ResumeCoordinator, ResumeOutcome};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{drain_engine, ShutdownReason, ShutdownReport, ShutdownSignal};
pub use state::{
    AlertRecord, HydrationReport, Metrics, ResumeCandidate, Session, SessionStatus, StatusReport,
    Task, TaskSnapshot, TaskStatus, TaskTimeline, TimelineEntry, Worktree,
};
pub use task_scheduler::{ResumeSweep, SweepReport};
