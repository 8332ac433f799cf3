#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("worker command is empty")]
    EmptyCommand,
    #[error("worker spawn failed ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode supervisor command: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },
    #[error("stdin channel closed for {worker}")]
    ChannelClosed { worker: String },
}

#[cfg(test)]
mod tests {
    use super::AgentError;
    use std::error::Error;

    #[test]
    fn spawn_error_includes_command_and_source() {
        let err = AgentError::Spawn {
            command: "python3 -m ouroboros.worker".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no python"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("python3 -m ouroboros.worker"));
        assert!(rendered.contains("no python"));
        assert!(err.source().is_some());
    }

    #[test]
    fn channel_closed_names_worker() {
        let err = AgentError::ChannelClosed {
            worker: "worker-2".to_string(),
        };
        assert_eq!(err.to_string(), "stdin channel closed for worker-2");
    }
}
