use std::path::PathBuf;
use std::string::FromUtf8Error;

use ouro_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("git command returned non-zero exit ({command}) status={status:?}: {}", stderr.trim())]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("git command output was not valid UTF-8 ({command}, {stream}): {source}")]
    NonUtf8Output {
        command: String,
        stream: &'static str,
        #[source]
        source: FromUtf8Error,
    },
}

/// Structured failure of a sync-layer operation. The `Display` text is what
/// the operator sees.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("git fetch failed: {source}")]
    FetchFailed {
        #[source]
        source: GitError,
    },
    #[error("Reset blocked ({detail}) to protect local changes.{rescue_note}")]
    Blocked {
        detail: String,
        rescue_note: String,
        rescue_path: Option<PathBuf>,
    },
    #[error("{target} cannot fast-forward to {source_branch}")]
    NotFastForward {
        target: String,
        source_branch: String,
    },
    #[error("Branch {branch} not found on remote")]
    BranchMissing { branch: String },
    #[error("git {step} failed: {source}")]
    Git {
        step: &'static str,
        #[source]
        source: GitError,
    },
    #[error("{step} failed to start ({command}): {source}")]
    Spawn {
        step: &'static str,
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{step} failed ({command}) status={status:?}: {output}")]
    CommandFailed {
        step: &'static str,
        command: String,
        status: Option<i32>,
        output: String,
    },
    #[error("{step} has no command configured")]
    EmptyCommand { step: &'static str },
    #[error("filesystem operation failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no current branch recorded in state")]
    NoCurrentBranch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::{GitError, SyncError};
    use std::error::Error;

    #[test]
    fn io_variant_includes_command_and_io_message() {
        let err = GitError::Io {
            command: "git status".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing binary"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("git command failed to start (git status)"));
        assert!(rendered.contains("missing binary"));
        assert!(err.source().is_some());
    }

    #[test]
    fn command_failed_variant_mentions_status_and_stderr() {
        let err = GitError::CommandFailed {
            command: "git rev-parse HEAD".to_string(),
            status: Some(128),
            stdout: String::new(),
            stderr: "fatal: bad revision\n".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("(git rev-parse HEAD) status=Some(128)"));
        assert!(rendered.ends_with("fatal: bad revision"));
    }

    #[test]
    fn blocked_message_carries_detail_and_rescue_note() {
        let err = SyncError::Blocked {
            detail: "unpushed=1, dirty=2".to_string(),
            rescue_note: " Rescue saved to /r.".to_string(),
            rescue_path: None,
        };
        assert_eq!(
            err.to_string(),
            "Reset blocked (unpushed=1, dirty=2) to protect local changes. Rescue saved to /r."
        );
    }
}
