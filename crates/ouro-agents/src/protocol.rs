//! JSON-lines contract between the supervisor and worker processes.

use ouro_core::{ChatId, Task, TaskId, WorkerMessage};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Messages written to a worker's stdin, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorCommand {
    Assign {
        task: Task,
    },
    Cancel {
        task_id: TaskId,
    },
    /// A turn for the direct chat agent.
    OwnerMessage {
        chat_id: ChatId,
        text: String,
    },
    Shutdown,
}

impl SupervisorCommand {
    pub fn encode(&self) -> Result<String, AgentError> {
        serde_json::to_string(self).map_err(|source| AgentError::Encode { source })
    }

    pub fn kind_tag(&self) -> &'static str {
        match self {
            SupervisorCommand::Assign { .. } => "assign",
            SupervisorCommand::Cancel { .. } => "cancel",
            SupervisorCommand::OwnerMessage { .. } => "owner_message",
            SupervisorCommand::Shutdown => "shutdown",
        }
    }
}

/// Anything that is not a protocol object is passed through as output.
pub fn parse_worker_line(line: &str) -> WorkerMessage {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        match serde_json::from_str::<WorkerMessage>(trimmed) {
            Ok(message) => return message,
            Err(err) => tracing::debug!(error = %err, "worker line is not a protocol message"),
        }
    }
    WorkerMessage::Output {
        line: line.trim_end().to_string(),
    }
}
