use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use ouro_core::{AuditLog, GitSettings, RuntimeCommands, StateStore, SupervisorConfig};

use crate::command::GitCli;
use crate::error::{GitError, SyncError};

/// Owns the single working tree and every git operation on it.
#[derive(Debug, Clone)]
pub struct GitSync {
    pub git: GitCli,
    pub repo_dir: PathBuf,
    pub settings: GitSettings,
    pub runtime: RuntimeCommands,
    pub store: StateStore,
    pub audit: AuditLog,
}

impl GitSync {
    pub fn new(config: &SupervisorConfig, store: StateStore, audit: AuditLog) -> Self {
        Self {
            git: GitCli::default(),
            repo_dir: config.repo_dir.clone(),
            settings: config.git.clone(),
            runtime: config.runtime.clone(),
            store,
            audit,
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Clone when no repository is present, otherwise repoint `origin`. Sets
    /// the committer identity and fetches either way. Safe to repeat.
    pub fn ensure_repo_present(&self) -> Result<(), SyncError> {
        let url = self.settings.remote_url.expose();
        if !self.repo_dir.join(".git").exists() {
            if self.repo_dir.exists() {
                tracing::warn!(path = %self.repo_dir.display(), "removing stale non-repository directory");
                fs::remove_dir_all(&self.repo_dir).map_err(|source| SyncError::Io {
                    path: self.repo_dir.clone(),
                    source,
                })?;
            }
            let parent = self
                .repo_dir
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            fs::create_dir_all(&parent).map_err(|source| SyncError::Io {
                path: parent.clone(),
                source,
            })?;
            tracing::info!(
                remote = %self.settings.remote_url.redacted(),
                path = %self.repo_dir.display(),
                "cloning repository"
            );
            self.git
                .run(
                    &parent,
                    [OsStr::new("clone"), OsStr::new(url), self.repo_dir.as_os_str()],
                )
                .map_err(|source| SyncError::Git {
                    step: "clone",
                    source,
                })?;
        } else {
            let set_url = self.git.run(&self.repo_dir, ["remote", "set-url", "origin", url]);
            if let Err(GitError::CommandFailed { .. }) = set_url {
                self.git
                    .run(&self.repo_dir, ["remote", "add", "origin", url])
                    .map_err(|source| SyncError::Git {
                        step: "remote add",
                        source,
                    })?;
            } else {
                set_url.map_err(|source| SyncError::Git {
                    step: "remote set-url",
                    source,
                })?;
            }
        }

        self.git
            .run(
                &self.repo_dir,
                ["config", "user.name", self.settings.committer_name.as_str()],
            )
            .map_err(|source| SyncError::Git {
                step: "config user.name",
                source,
            })?;
        self.git
            .run(
                &self.repo_dir,
                ["config", "user.email", self.settings.committer_email.as_str()],
            )
            .map_err(|source| SyncError::Git {
                step: "config user.email",
                source,
            })?;
        self.fetch()
    }

    pub(crate) fn fetch(&self) -> Result<(), SyncError> {
        self.git
            .run(&self.repo_dir, ["fetch", "origin", "--prune"])
            .map(|_| ())
            .map_err(|source| SyncError::FetchFailed { source })
    }

    pub fn head_sha(&self) -> Result<String, GitError> {
        let output = self.git.run(&self.repo_dir, ["rev-parse", "HEAD"])?;
        Ok(output.stdout.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<String, GitError> {
        let output = self
            .git
            .run(&self.repo_dir, ["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(output.stdout.trim().to_string())
    }

    /// Whether `refs/heads/<branch>` exists on `origin`. Judged by output,
    /// since `ls-remote` exits 0 for a missing head.
    pub fn remote_branch_exists(&self, branch: &str) -> Result<bool, GitError> {
        let output = self
            .git
            .run(&self.repo_dir, ["ls-remote", "--heads", "origin", branch])?;
        let wanted = format!("refs/heads/{branch}");
        Ok(output
            .stdout
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(wanted.as_str())))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{run_git, Fixture};

    #[test]
    fn ensure_repo_present_clones_and_sets_identity() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        assert!(fx.repo.join(".git").exists());
        assert_eq!(run_git(&fx.repo, &["config", "user.name"]), "Ouroboros");
        assert_eq!(sync.current_branch().expect("branch"), "main");
    }

    #[test]
    fn ensure_repo_present_twice_equals_once() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("first");
        let sha = sync.head_sha().expect("sha");
        sync.ensure_repo_present().expect("second");
        assert_eq!(sync.head_sha().expect("sha again"), sha);
        let remotes = run_git(&fx.repo, &["remote"]);
        assert_eq!(remotes, "origin");
    }

    #[test]
    fn stale_non_repository_directory_is_replaced() {
        let fx = Fixture::new();
        std::fs::create_dir_all(&fx.repo).expect("stale dir");
        std::fs::write(fx.repo.join("junk.txt"), "junk").expect("junk");
        fx.sync().ensure_repo_present().expect("clone over stale dir");
        assert!(!fx.repo.join("junk.txt").exists());
        assert!(fx.repo.join("README.md").exists());
    }

    #[test]
    fn remote_branch_exists_reads_ls_remote_output() {
        let fx = Fixture::new();
        let sync = fx.sync();
        sync.ensure_repo_present().expect("clone");
        assert!(sync.remote_branch_exists("main").expect("ls-remote main"));
        assert!(!sync.remote_branch_exists("ouroboros").expect("ls-remote dev"));
    }
}
