//! Write-once archives of at-risk work, taken before destructive resets.

use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use ouro_core::atomic_write_text;

use crate::command::GitCli;
use crate::error::SyncError;
use crate::sync_state::RepoSyncState;

pub const RESCUE_MAX_FILES: usize = 200;
pub const RESCUE_MAX_BYTES: u64 = 12_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UntrackedCopy {
    pub copied_files: usize,
    pub skipped_files: usize,
    pub copied_bytes: u64,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `rescue_meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescueInfo {
    pub ts: String,
    pub target_branch: String,
    pub reason: String,
    pub current_branch: Option<String>,
    pub dirty_count: usize,
    pub unpushed_count: usize,
    pub warnings: Vec<String>,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_error: Option<String>,
    pub untracked: UntrackedCopy,
}

pub fn create_rescue_snapshot(
    git: &GitCli,
    repo_dir: &Path,
    rescue_root: &Path,
    target_branch: &str,
    reason: &str,
    state: &RepoSyncState,
) -> Result<RescueInfo, SyncError> {
    let now = Utc::now();
    let id = uuid::Uuid::new_v4().simple().to_string();
    let dir = rescue_root.join(format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &id[..8]));
    fs::create_dir_all(&dir).map_err(|source| SyncError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut info = RescueInfo {
        ts: now.to_rfc3339(),
        target_branch: target_branch.to_string(),
        reason: reason.to_string(),
        current_branch: state.current_branch.clone(),
        dirty_count: state.dirty_lines.len(),
        unpushed_count: state.unpushed_lines.len(),
        warnings: state.warnings.clone(),
        path: dir.clone(),
        diff_error: None,
        untracked: UntrackedCopy::default(),
    };

    if let Ok(status) = git.run(repo_dir, ["status", "--porcelain"]) {
        atomic_write_text(&dir.join("status.porcelain.txt"), &with_newline(status.stdout.trim_end()))?;
    }

    match git.run_bytes(repo_dir, ["diff", "--binary", "HEAD"]) {
        Ok(diff) => {
            let path = dir.join("changes.diff");
            fs::write(&path, &diff).map_err(|source| SyncError::Io { path, source })?;
        }
        Err(err) => info.diff_error = Some(err.to_string()),
    }

    info.untracked = copy_untracked(git, repo_dir, &dir.join("untracked"));

    if !state.unpushed_lines.is_empty() {
        atomic_write_text(
            &dir.join("unpushed_commits.txt"),
            &with_newline(&state.unpushed_lines.join("\n")),
        )?;
    }

    let meta = serde_json::to_string_pretty(&info).map_err(|source| {
        SyncError::Store(ouro_core::StoreError::Serialize {
            what: "rescue metadata",
            source,
        })
    })?;
    atomic_write_text(&dir.join("rescue_meta.json"), &meta)?;
    tracing::info!(
        path = %dir.display(),
        dirty = info.dirty_count,
        unpushed = info.unpushed_count,
        untracked = info.untracked.copied_files,
        "rescue snapshot written"
    );
    Ok(info)
}

fn with_newline(text: &str) -> String {
    if text.is_empty() {
        String::new()
    } else {
        format!("{text}\n")
    }
}

/// Copy untracked, non-ignored files, bounded by file count and total size.
fn copy_untracked(git: &GitCli, repo_dir: &Path, dst_root: &Path) -> UntrackedCopy {
    let mut out = UntrackedCopy::default();
    let listing = match git.run(repo_dir, ["ls-files", "--others", "--exclude-standard"]) {
        Ok(listing) => listing.stdout,
        Err(err) => {
            out.error = Some(err.to_string());
            return out;
        }
    };
    let Ok(repo_root) = repo_dir.canonicalize() else {
        out.error = Some(format!("cannot resolve {}", repo_dir.display()));
        return out;
    };

    for rel in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if out.copied_files >= RESCUE_MAX_FILES {
            out.truncated = true;
            break;
        }
        let src = match repo_dir.join(rel).canonicalize() {
            Ok(src) if src.starts_with(&repo_root) && src.is_file() => src,
            _ => {
                out.skipped_files += 1;
                continue;
            }
        };
        let size = match src.metadata() {
            Ok(meta) => meta.len(),
            Err(_) => {
                out.skipped_files += 1;
                continue;
            }
        };
        if out.copied_bytes + size > RESCUE_MAX_BYTES {
            out.truncated = true;
            break;
        }
        let dst = dst_root.join(rel);
        let copied = dst
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::copy(&src, &dst));
        match copied {
            Ok(_) => {
                out.copied_files += 1;
                out.copied_bytes += size;
            }
            Err(err) => {
                tracing::debug!(file = rel, error = %err, "rescue copy skipped");
                out.skipped_files += 1;
            }
        }
    }
    out
}
