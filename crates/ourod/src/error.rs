use ouro_agents::AgentError;
use ouro_core::{ConfigError, StoreError, TaskId};
use ouro_git::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task id {0} was already used")]
    DuplicateId(TaskId),
    #[error("task {0} is not running")]
    NotRunning(TaskId),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to launch {worker}: {source}")]
    Launch {
        worker: String,
        #[source]
        source: AgentError,
    },
    #[error("failed to deliver {command} to {worker}: {source}")]
    Deliver {
        worker: String,
        command: &'static str,
        #[source]
        source: AgentError,
    },
    #[error("no live worker in slot {slot}")]
    NoWorker { slot: usize },
}

/// Failures that stop the supervisor from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("repository sync failed: {0}")]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("failed to install signal handlers: {source}")]
    Signals {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start thread {name}: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
