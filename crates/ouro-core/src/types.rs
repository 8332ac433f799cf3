//! Core task types shared by the supervisor crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat identifiers are whatever the messaging transport uses; Telegram ids are i64.
pub type ChatId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id: first 8 hex chars of a v4 uuid.
    pub fn generate() -> Self {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        Self(raw[..8].to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What a task is for. Determines ordering weight and exclusivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Operator-submitted work.
    #[default]
    Chat,
    /// Self-evolution cycle; writes to the repository.
    Evolution,
    /// Code review pass over recent changes.
    Review,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Chat => "chat",
            TaskKind::Evolution => "evolution",
            TaskKind::Review => "review",
        }
    }

    /// Lower ranks are assigned first.
    pub fn rank(self) -> u8 {
        match self {
            TaskKind::Chat => 0,
            TaskKind::Review => 1,
            TaskKind::Evolution => 2,
        }
    }

    /// At most one task of an exclusive kind may run at a time.
    pub fn is_exclusive(self) -> bool {
        matches!(self, TaskKind::Evolution)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "chat" | "task" => Ok(TaskKind::Chat),
            "evolution" => Ok(TaskKind::Evolution),
            "review" => Ok(TaskKind::Review),
            other => Err(format!(
                "invalid task kind '{other}'. valid values: chat, evolution, review"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work flowing through the queue and the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Free-form instructions handed to the agent.
    pub text: String,
    /// Where replies go.
    #[serde(default)]
    pub chat_id: Option<ChatId>,
    /// Submission order; combined with the kind rank to form the ordering key.
    #[serde(default)]
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub soft_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hard_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Result text for done tasks, failure reason otherwise.
    #[serde(default)]
    pub outcome: Option<String>,
}

impl Task {
    pub fn new(kind: TaskKind, text: impl Into<String>, chat_id: Option<ChatId>) -> Self {
        Self {
            id: TaskId::generate(),
            kind,
            text: text.into(),
            chat_id,
            seq: 0,
            created_at: Utc::now(),
            status: TaskStatus::Pending,
            started_at: None,
            soft_deadline: None,
            hard_deadline: None,
            finished_at: None,
            cancel_requested: false,
            outcome: None,
        }
    }

    pub fn ordering_key(&self) -> (u8, u64) {
        (self.kind.rank(), self.seq)
    }

    /// Short one-line preview of the task text for status output.
    pub fn preview(&self, max_chars: usize) -> String {
        let flat = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max_chars {
            return flat;
        }
        let mut out: String = flat.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

/// Cost and token usage attached to worker events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageReport {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub model: Option<String>,
}
