use serde_json::json;
use std::fs;
use std::str::FromStr;

use crate::error::SyncError;
use crate::repo::GitSync;
use crate::rescue::create_rescue_snapshot;
use crate::sync_state::collect_repo_sync_state;

/// What a reset does when the working tree holds uncommitted or unpushed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsyncedPolicy {
    #[default]
    Ignore,
    Block,
    RescueAndBlock,
    RescueAndReset,
}

impl UnsyncedPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            UnsyncedPolicy::Ignore => "ignore",
            UnsyncedPolicy::Block => "block",
            UnsyncedPolicy::RescueAndBlock => "rescue_and_block",
            UnsyncedPolicy::RescueAndReset => "rescue_and_reset",
        }
    }

    pub fn rescues(self) -> bool {
        matches!(
            self,
            UnsyncedPolicy::RescueAndBlock | UnsyncedPolicy::RescueAndReset
        )
    }

    pub fn blocks(self) -> bool {
        matches!(self, UnsyncedPolicy::Block | UnsyncedPolicy::RescueAndBlock)
    }
}

impl FromStr for UnsyncedPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "ignore" => Ok(UnsyncedPolicy::Ignore),
            "block" => Ok(UnsyncedPolicy::Block),
            "rescue_and_block" => Ok(UnsyncedPolicy::RescueAndBlock),
            "rescue_and_reset" => Ok(UnsyncedPolicy::RescueAndReset),
            other => Err(format!("unknown unsynced policy '{other}'")),
        }
    }
}

const PREVIEW_LINES: usize = 20;

impl GitSync {
    /// Force the working tree onto `origin/<branch>`, guarding local work per
    /// `policy`. Returns a short success message.
    pub fn checkout_and_reset(
        &self,
        branch: &str,
        reason: &str,
        policy: UnsyncedPolicy,
    ) -> Result<String, SyncError> {
        if let Err(err) = self.fetch() {
            self.audit.record(
                "reset_fetch_failed",
                json!({"target_branch": branch, "reason": reason, "error": err.to_string()}),
            );
            return Err(err);
        }

        let state = collect_repo_sync_state(&self.git, &self.repo_dir);
        if state.is_unsynced() {
            let mut rescue_path = None;
            let mut rescue_note = String::new();
            let mut rescue_record = serde_json::Value::Null;
            if policy.rescues() {
                match create_rescue_snapshot(
                    &self.git,
                    &self.repo_dir,
                    &self.store.layout().rescue_root(),
                    branch,
                    reason,
                    &state,
                ) {
                    Ok(info) => {
                        rescue_note = format!(" Rescue saved to {}.", info.path.display());
                        rescue_path = Some(info.path.clone());
                        rescue_record = serde_json::to_value(&info).unwrap_or_default();
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "rescue snapshot failed");
                        rescue_note = format!(" Rescue failed: {err}");
                        rescue_record = json!({"error": err.to_string()});
                    }
                }
            }

            if policy.blocks() {
                self.audit.record(
                    "reset_blocked_unsynced_state",
                    json!({
                        "target_branch": branch,
                        "reason": reason,
                        "policy": policy.as_str(),
                        "current_branch": state.current_branch,
                        "dirty_count": state.dirty_lines.len(),
                        "unpushed_count": state.unpushed_lines.len(),
                        "dirty_preview": state.dirty_lines.iter().take(PREVIEW_LINES).collect::<Vec<_>>(),
                        "unpushed_preview": state.unpushed_lines.iter().take(PREVIEW_LINES).collect::<Vec<_>>(),
                        "warnings": state.warnings,
                        "rescue": rescue_record,
                    }),
                );
                return Err(SyncError::Blocked {
                    detail: state.detail(),
                    rescue_note,
                    rescue_path,
                });
            }
            tracing::warn!(
                branch,
                policy = policy.as_str(),
                detail = %state.detail(),
                "resetting over unsynced work"
            );
        }

        self.ensure_remote_branch(branch, reason)?;

        let remote_ref = format!("origin/{branch}");
        self.git
            .run(&self.repo_dir, ["checkout", "-f", "-B", branch, remote_ref.as_str()])
            .map_err(|source| SyncError::Git {
                step: "checkout",
                source,
            })?;
        self.git
            .run(&self.repo_dir, ["reset", "--hard", remote_ref.as_str()])
            .map_err(|source| SyncError::Git {
                step: "reset",
                source,
            })?;
        self.purge_cache_dirs();

        let sha = self.head_sha().map_err(|source| SyncError::Git {
            step: "rev-parse",
            source,
        })?;
        let branch_owned = branch.to_string();
        let sha_owned = sha.clone();
        self.store.update(move |doc| {
            doc.current_branch = Some(branch_owned);
            doc.current_sha = Some(sha_owned);
        })?;
        tracing::info!(branch, sha = %sha, reason, "working tree reset");
        Ok(format!("reset to {branch}@{}", short_sha(&sha)))
    }

    /// Create `branch` on the remote when missing: stable forks from the
    /// development branch, development from the default branch.
    fn ensure_remote_branch(&self, branch: &str, reason: &str) -> Result<(), SyncError> {
        let exists = |name: &str| {
            self.remote_branch_exists(name)
                .map_err(|source| SyncError::Git {
                    step: "ls-remote",
                    source,
                })
        };
        if exists(branch)? {
            return Ok(());
        }

        let fork_from = if branch == self.settings.branch_stable {
            Some(self.settings.branch_dev.as_str())
        } else if branch == self.settings.branch_dev {
            Some(self.settings.default_branch.as_str())
        } else {
            None
        };
        if let Some(from) = fork_from {
            tracing::warn!(branch, from, "branch missing on remote; creating");
            let refspec = format!("refs/remotes/origin/{from}:refs/heads/{branch}");
            match self
                .git
                .run(&self.repo_dir, ["push", "origin", refspec.as_str()])
            {
                Ok(_) => {
                    self.audit.record(
                        "branch_created",
                        json!({"branch": branch, "from": from, "reason": reason}),
                    );
                    self.fetch()?;
                }
                Err(err) => {
                    tracing::warn!(branch, from, error = %err, "branch creation failed");
                }
            }
        }

        if !exists(branch)? {
            self.audit.record(
                "reset_branch_missing",
                json!({"target_branch": branch, "reason": reason}),
            );
            return Err(SyncError::BranchMissing {
                branch: branch.to_string(),
            });
        }
        Ok(())
    }

    /// Remove configured cache directories anywhere under the tree, skipping `.git`.
    fn purge_cache_dirs(&self) {
        if self.settings.cache_dirs.is_empty() {
            return;
        }
        let mut doomed = Vec::new();
        let walker = walkdir::WalkDir::new(&self.repo_dir)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != ".git");
        for entry in walker.filter_map(Result::ok) {
            if entry.file_type().is_dir()
                && self
                    .settings
                    .cache_dirs
                    .iter()
                    .any(|name| entry.file_name() == name.as_str())
            {
                doomed.push(entry.into_path());
            }
        }
        for dir in doomed {
            if let Err(err) = fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %dir.display(), error = %err, "cache purge failed");
                }
            }
        }
    }

    /// Move the stable branch to the current development commit, creating it
    /// if absent. Pushes only when the remote tip differs.
    pub fn promote_to_stable(&self, reason: &str) -> Result<String, SyncError> {
        let source_branch = self
            .store
            .load()
            .current_branch
            .ok_or(SyncError::NoCurrentBranch)?;
        let stable = self.settings.branch_stable.clone();
        self.fetch()?;

        let source_sha = self
            .git
            .run(&self.repo_dir, ["rev-parse", source_branch.as_str()])
            .map_err(|source| SyncError::Git {
                step: "rev-parse",
                source,
            })?
            .stdout
            .trim()
            .to_string();

        let remote_tip = if self.remote_branch_exists(&stable).map_err(|source| SyncError::Git {
            step: "ls-remote",
            source,
        })? {
            let remote_ref = format!("origin/{stable}");
            let tip = self
                .git
                .run(&self.repo_dir, ["rev-parse", remote_ref.as_str()])
                .map_err(|source| SyncError::Git {
                    step: "rev-parse",
                    source,
                })?
                .stdout
                .trim()
                .to_string();
            let fast_forward = self
                .git
                .run_check(
                    &self.repo_dir,
                    ["merge-base", "--is-ancestor", tip.as_str(), source_sha.as_str()],
                )
                .map_err(|source| SyncError::Git {
                    step: "merge-base",
                    source,
                })?;
            if !fast_forward {
                return Err(SyncError::NotFastForward {
                    target: stable,
                    source_branch,
                });
            }
            Some(tip)
        } else {
            None
        };

        if remote_tip.as_deref() == Some(source_sha.as_str()) {
            return Ok(format!("{stable} already up-to-date with {source_branch}"));
        }

        let refspec = format!("{source_sha}:refs/heads/{stable}");
        self.git
            .run(&self.repo_dir, ["push", "origin", refspec.as_str()])
            .map_err(|source| SyncError::Git {
                step: "push",
                source,
            })?;
        if source_branch != stable {
            let local_ref = format!("refs/heads/{stable}");
            if let Err(err) = self.git.run(
                &self.repo_dir,
                ["update-ref", local_ref.as_str(), source_sha.as_str()],
            ) {
                tracing::debug!(error = %err, "local stable ref not updated");
            }
        }
        self.audit.record(
            "branch_promoted",
            json!({
                "stable_branch": stable,
                "from_branch": source_branch,
                "sha": source_sha,
                "created": remote_tip.is_none(),
                "reason": reason,
            }),
        );
        tracing::info!(stable = %stable, from = %source_branch, sha = %source_sha, "promoted to stable");
        Ok(format!("{stable} updated from {source_branch}"))
    }
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_support::{run_git, Fixture};

    fn dirty_clone(fx: &Fixture) -> GitSync {
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        sync.checkout_and_reset("ouroboros", "setup", UnsyncedPolicy::Ignore)
            .expect("initial reset");
        fs::write(fx.repo.join("mine.txt"), "precious\n").expect("write");
        run_git(&fx.repo, &["add", "mine.txt"]);
        run_git(&fx.repo, &["commit", "-q", "-m", "local only"]);
        fs::write(fx.repo.join("README.md"), "dirty edit\n").expect("edit");
        sync
    }

    #[test]
    fn policy_parses_and_classifies() {
        assert_eq!(
            "rescue_and_reset".parse::<UnsyncedPolicy>(),
            Ok(UnsyncedPolicy::RescueAndReset)
        );
        assert!(UnsyncedPolicy::RescueAndBlock.blocks());
        assert!(UnsyncedPolicy::RescueAndBlock.rescues());
        assert!(!UnsyncedPolicy::Ignore.blocks());
        assert!("yolo".parse::<UnsyncedPolicy>().is_err());
    }

    #[test]
    fn missing_dev_branch_is_created_from_main() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        let msg = sync
            .checkout_and_reset("ouroboros", "boot", UnsyncedPolicy::Ignore)
            .expect("reset");
        assert!(msg.starts_with("reset to ouroboros@"));
        assert_eq!(sync.current_branch().expect("branch"), "ouroboros");
        assert!(sync.remote_branch_exists("ouroboros").expect("ls-remote"));
        let doc = sync.store.load();
        assert_eq!(doc.current_branch.as_deref(), Some("ouroboros"));
        assert_eq!(doc.current_sha, Some(sync.head_sha().expect("sha")));
        assert_eq!(sync.audit.read_kind("branch_created").len(), 1);
    }

    #[test]
    fn unknown_branch_without_fork_source_is_missing() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        let err = sync
            .checkout_and_reset("feature-x", "test", UnsyncedPolicy::Ignore)
            .expect_err("missing branch");
        assert!(matches!(err, SyncError::BranchMissing { .. }));
        assert_eq!(sync.audit.read_kind("reset_branch_missing").len(), 1);
    }

    #[test]
    fn block_policy_leaves_working_tree_untouched() {
        let fx = Fixture::new();
        let sync = dirty_clone(&fx);
        let head_before = sync.head_sha().expect("sha");

        let err = sync
            .checkout_and_reset("ouroboros", "test", UnsyncedPolicy::Block)
            .expect_err("blocked");
        assert!(matches!(err, SyncError::Blocked { rescue_path: None, .. }));
        assert!(err.to_string().contains("unpushed=1, dirty=1"));
        assert_eq!(sync.head_sha().expect("sha"), head_before);
        assert_eq!(
            fs::read_to_string(fx.repo.join("README.md")).expect("readme"),
            "dirty edit\n"
        );
        let records = sync.audit.read_kind("reset_blocked_unsynced_state");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["dirty_count"], 1);
        assert_eq!(records[0]["unpushed_count"], 1);
        assert!(!fx.drive.join("archive/rescue").read_dir().expect("rescue dir").any(|_| true));
    }

    #[test]
    fn rescue_and_block_writes_snapshot_then_refuses() {
        let fx = Fixture::new();
        let sync = dirty_clone(&fx);
        let err = sync
            .checkout_and_reset("ouroboros", "test", UnsyncedPolicy::RescueAndBlock)
            .expect_err("blocked");
        match err {
            SyncError::Blocked {
                rescue_path: Some(path),
                ..
            } => assert!(path.join("rescue_meta.json").is_file()),
            other => panic!("expected blocked with rescue, got {other:?}"),
        }
        assert!(fx.repo.join("mine.txt").exists());
    }

    #[test]
    fn rescue_and_reset_snapshots_counts_then_resets() {
        let fx = Fixture::new();
        let sync = dirty_clone(&fx);
        let before = collect_repo_sync_state(&sync.git, &fx.repo);
        fs::create_dir_all(fx.repo.join("pkg/__pycache__")).expect("cache dir");
        fs::write(fx.repo.join("pkg/__pycache__/m.pyc"), "bytecode").expect("pyc");

        sync.checkout_and_reset("ouroboros", "restart", UnsyncedPolicy::RescueAndReset)
            .expect("reset");

        let rescues = fs::read_dir(fx.drive.join("archive/rescue"))
            .expect("rescue dir")
            .filter_map(Result::ok)
            .collect::<Vec<_>>();
        assert_eq!(rescues.len(), 1);
        let meta: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(rescues[0].path().join("rescue_meta.json")).expect("meta"),
        )
        .expect("meta json");
        // The untracked __pycache__ dir appeared after `before` was taken.
        assert_eq!(meta["dirty_count"], before.dirty_lines.len() + 1);
        assert_eq!(meta["unpushed_count"], before.unpushed_lines.len());

        assert!(!fx.repo.join("mine.txt").exists());
        assert_eq!(
            fs::read_to_string(fx.repo.join("README.md")).expect("readme"),
            "seed\n"
        );
        assert!(!fx.repo.join("pkg/__pycache__").exists());
    }

    #[test]
    fn fetch_failure_is_audited() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        fs::remove_dir_all(&fx.remote).expect("remove remote");
        let err = sync
            .checkout_and_reset("ouroboros", "test", UnsyncedPolicy::Ignore)
            .expect_err("fetch fails");
        assert!(matches!(err, SyncError::FetchFailed { .. }));
        assert_eq!(sync.audit.read_kind("reset_fetch_failed").len(), 1);
    }

    #[test]
    fn promote_creates_stable_then_pushes_only_on_change() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        sync.checkout_and_reset("ouroboros", "boot", UnsyncedPolicy::Ignore)
            .expect("reset");

        let first = sync.promote_to_stable("first").expect("create stable");
        assert_eq!(first, "ouroboros-stable updated from ouroboros");
        assert!(sync.remote_branch_exists("ouroboros-stable").expect("ls-remote"));

        let second = sync.promote_to_stable("again").expect("no-op");
        assert!(second.contains("already up-to-date"));
        assert_eq!(sync.audit.read_kind("branch_promoted").len(), 1);

        fx.push_remote_commit("ouroboros", "new.txt", "new\n");
        sync.checkout_and_reset("ouroboros", "pull", UnsyncedPolicy::Ignore)
            .expect("reset to new dev tip");
        sync.promote_to_stable("third").expect("advance stable");
        assert_eq!(sync.audit.read_kind("branch_promoted").len(), 2);
        let stable_tip = run_git(&fx.repo, &["ls-remote", "origin", "refs/heads/ouroboros-stable"]);
        assert!(stable_tip.starts_with(&sync.head_sha().expect("sha")));
    }
}
