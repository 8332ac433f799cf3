use std::path::Path;

use serde::Serialize;

use crate::command::GitCli;
use crate::error::GitError;

/// Derived from git each time it is needed; never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepoSyncState {
    pub current_branch: Option<String>,
    pub dirty_lines: Vec<String>,
    pub unpushed_lines: Vec<String>,
    pub warnings: Vec<String>,
}

impl RepoSyncState {
    pub fn is_unsynced(&self) -> bool {
        !self.dirty_lines.is_empty() || !self.unpushed_lines.is_empty()
    }

    /// e.g. `unpushed=2, dirty=1`.
    pub fn detail(&self) -> String {
        let mut bits = Vec::new();
        if !self.unpushed_lines.is_empty() {
            bits.push(format!("unpushed={}", self.unpushed_lines.len()));
        }
        if !self.dirty_lines.is_empty() {
            bits.push(format!("dirty={}", self.dirty_lines.len()));
        }
        if bits.is_empty() {
            "unsynced".to_string()
        } else {
            bits.join(", ")
        }
    }
}

/// Git failures become warnings; the result is always usable.
pub fn collect_repo_sync_state(git: &GitCli, repo_dir: &Path) -> RepoSyncState {
    let mut state = RepoSyncState::default();

    match git.run(repo_dir, ["rev-parse", "--abbrev-ref", "HEAD"]) {
        Ok(out) if !out.stdout.trim().is_empty() => {
            state.current_branch = Some(out.stdout.trim().to_string());
        }
        Ok(_) => {}
        Err(err) => state.warnings.push(format!("branch_error:{}", short(&err))),
    }

    match git.run(repo_dir, ["status", "--porcelain"]) {
        Ok(out) => state.dirty_lines = non_empty_lines(&out.stdout),
        Err(err) => state.warnings.push(format!("status_error:{}", short(&err))),
    }

    let upstream = match git.run(
        repo_dir,
        ["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
    ) {
        Ok(out) if !out.stdout.trim().is_empty() => Some(out.stdout.trim().to_string()),
        other => match state.current_branch.as_deref() {
            Some(branch) if branch != "HEAD" => Some(format!("origin/{branch}")),
            _ => {
                if let Err(err) = other {
                    state.warnings.push(format!("upstream_error:{}", short(&err)));
                }
                None
            }
        },
    };

    if let Some(upstream) = upstream {
        match git.run(repo_dir, ["log", "--oneline", &format!("{upstream}..HEAD")]) {
            Ok(out) => state.unpushed_lines = non_empty_lines(&out.stdout),
            Err(err) => state
                .warnings
                .push(format!("unpushed_error:{}", short(&err))),
        }
    }

    state
}

fn non_empty_lines(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

fn short(err: &GitError) -> String {
    match err {
        GitError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
            stderr.trim().lines().next().unwrap_or_default().to_string()
        }
        other => other.to_string(),
    }
}
