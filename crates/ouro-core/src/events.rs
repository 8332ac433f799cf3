use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChatId, TaskId, TaskKind, UsageReport};

/// Which process an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum WorkerRole {
    /// A slot in the fixed-size worker pool.
    Pool { slot: usize },
    /// The single always-on direct chat agent.
    Direct,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Pool { slot } => write!(f, "worker-{slot}"),
            WorkerRole::Direct => f.write_str("direct-chat"),
        }
    }
}

/// Identifies one incarnation of a worker process. The generation changes on
/// every respawn so late events from a killed process can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerRef {
    pub role: WorkerRole,
    pub generation: u64,
}

/// Messages a worker writes to its stdout, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready,
    Progress {
        #[serde(default)]
        task_id: Option<TaskId>,
        #[serde(default)]
        text: String,
    },
    Usage {
        #[serde(default)]
        task_id: Option<TaskId>,
        usage: UsageReport,
    },
    TaskDone {
        task_id: TaskId,
        #[serde(default)]
        result: String,
        #[serde(default)]
        usage: Option<UsageReport>,
    },
    TaskFailed {
        task_id: TaskId,
        #[serde(default)]
        error: String,
        #[serde(default)]
        usage: Option<UsageReport>,
    },
    SendMessage {
        #[serde(default)]
        chat_id: Option<ChatId>,
        text: String,
    },
    ScheduleTask {
        text: String,
        #[serde(default)]
        kind: Option<TaskKind>,
    },
    CancelTask {
        task_id: TaskId,
    },
    RequestRestart {
        #[serde(default)]
        reason: String,
    },
    PromoteToStable {
        #[serde(default)]
        reason: String,
    },
    RequestReview {
        #[serde(default)]
        reason: String,
    },
    ToggleEvolution {
        enabled: bool,
    },
    /// A stdout line that was not a protocol message. Counts as progress.
    Output {
        line: String,
    },
}

/// An operator message delivered by the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Transport-level sequence number; the next poll offset is `update_id + 1`.
    pub update_id: i64,
    pub chat_id: ChatId,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallLevel {
    Soft,
    Hard,
}

/// Everything the main loop reacts to, drained in arrival order by one consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Worker {
        from: WorkerRef,
        at: DateTime<Utc>,
        message: WorkerMessage,
    },
    /// The worker's stdout closed; the process is gone or going.
    WorkerExited {
        from: WorkerRef,
    },
    Inbound(InboundMessage),
    ChatStalled {
        level: StallLevel,
        /// Chat turn the stall was measured on; a later turn ignores it.
        episode: u64,
        idle_secs: u64,
        total_secs: u64,
    },
    Shutdown {
        reason: String,
    },
}

impl SupervisorEvent {
    pub fn worker(from: WorkerRef, message: WorkerMessage) -> Self {
        SupervisorEvent::Worker {
            from,
            at: Utc::now(),
            message,
        }
    }

    pub fn kind_tag(&self) -> &'static str {
        match self {
            SupervisorEvent::Worker { .. } => "worker",
            SupervisorEvent::WorkerExited { .. } => "worker_exited",
            SupervisorEvent::Inbound(_) => "inbound",
            SupervisorEvent::ChatStalled { .. } => "chat_stalled",
            SupervisorEvent::Shutdown { .. } => "shutdown",
        }
    }
}
