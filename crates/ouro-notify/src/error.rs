#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to execute curl for {transport}: {source}")]
    Spawn {
        transport: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{transport} request failed (status {status:?}): {message}")]
    RequestFailed {
        transport: &'static str,
        status: Option<i32>,
        message: String,
    },
    #[error("{transport} api error: {description}")]
    Api {
        transport: &'static str,
        description: String,
    },
    #[error("failed to decode {transport} response: {source}")]
    Decode {
        transport: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
