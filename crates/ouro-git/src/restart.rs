use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use ouro_core::{atomic_write_text, remove_if_exists};

use crate::error::SyncError;
use crate::repo::GitSync;
use crate::reset::{short_sha, UnsyncedPolicy};

/// Expected post-restart position, written before the process exits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartMarker {
    pub ts: String,
    pub expected_sha: String,
    pub expected_branch: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartVerification {
    pub ok: bool,
    pub message: String,
}

/// Deletes the marker file when dropped, whatever path verification took.
struct MarkerGuard<'a>(&'a Path);

impl Drop for MarkerGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = remove_if_exists(self.0) {
            tracing::warn!(error = %err, "failed to remove restart marker");
        }
    }
}

const OUTPUT_TAIL_CHARS: usize = 2000;

impl GitSync {
    /// Install runtime dependencies from the manifest, or the fallback set
    /// when the tree has no manifest. Returns the source that was used.
    pub fn sync_runtime_dependencies(&self, reason: &str) -> Result<String, SyncError> {
        let manifest = self.repo_dir.join(&self.runtime.deps_manifest);
        let (command, source) = if manifest.exists() {
            let manifest_arg = manifest.to_string_lossy();
            (
                self.runtime
                    .deps_install_cmd
                    .iter()
                    .map(|arg| arg.replace("{manifest}", &manifest_arg))
                    .collect::<Vec<_>>(),
                format!("requirements:{}", manifest.display()),
            )
        } else {
            (
                self.runtime.deps_fallback_cmd.clone(),
                "fallback:minimal".to_string(),
            )
        };

        match run_step("dependency sync", &command, &self.repo_dir) {
            Ok(_) => {
                self.audit.record(
                    "deps_sync_ok",
                    json!({"reason": reason, "source": source}),
                );
                tracing::info!(source = %source, "dependencies synced");
                Ok(source)
            }
            Err(err) => {
                self.audit.record(
                    "deps_sync_error",
                    json!({"reason": reason, "source": source, "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    /// Smoke-load the freshly checked-out code.
    pub fn import_test(&self) -> Result<String, SyncError> {
        run_step("import test", &self.runtime.import_test_cmd, &self.repo_dir).map_err(|err| {
            self.audit
                .record("import_test_error", json!({"error": err.to_string()}));
            err
        })?;
        Ok("ok".to_string())
    }

    /// Reset onto the development branch, sync dependencies, run the import
    /// test. Stops at the first failure.
    pub fn safe_restart(&self, reason: &str, policy: UnsyncedPolicy) -> Result<String, SyncError> {
        let branch = self.settings.branch_dev.clone();
        let reset_msg = self.checkout_and_reset(&branch, reason, policy)?;
        self.sync_runtime_dependencies(reason)?;
        self.import_test()?;
        let reason_owned = reason.to_string();
        self.store.update(move |doc| {
            doc.last_restart_ok_at = Some(Utc::now());
            doc.last_restart_reason = Some(reason_owned);
        })?;
        tracing::info!(reason, "safe restart complete");
        Ok(reset_msg)
    }

    pub fn restart_marker_path(&self) -> PathBuf {
        self.store.layout().restart_marker_file()
    }

    pub fn write_restart_marker(&self, reason: &str) -> Result<RestartMarker, SyncError> {
        let marker = RestartMarker {
            ts: Utc::now().to_rfc3339(),
            expected_sha: self.head_sha().map_err(|source| SyncError::Git {
                step: "rev-parse",
                source,
            })?,
            expected_branch: self.current_branch().map_err(|source| SyncError::Git {
                step: "rev-parse",
                source,
            })?,
            reason: reason.to_string(),
        };
        let body = serde_json::to_string_pretty(&marker).map_err(|source| {
            SyncError::Store(ouro_core::StoreError::Serialize {
                what: "restart marker",
                source,
            })
        })?;
        atomic_write_text(&self.restart_marker_path(), &body)?;
        Ok(marker)
    }

    /// Compare the marker left by the previous process with the tree we
    /// booted on. Absent marker is success. The marker is always deleted.
    pub fn verify_restart_marker(&self) -> RestartVerification {
        let path = self.restart_marker_path();
        if !path.exists() {
            return RestartVerification {
                ok: true,
                message: "No restart marker".to_string(),
            };
        }
        let _guard = MarkerGuard(&path);

        let marker = match fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|body| {
                serde_json::from_str::<RestartMarker>(&body).map_err(|err| err.to_string())
            }) {
            Ok(marker) => marker,
            Err(err) => {
                let message = format!("Restart marker verification error: {err}");
                tracing::warn!("{message}");
                return RestartVerification { ok: false, message };
            }
        };

        let actual = self
            .head_sha()
            .and_then(|sha| self.current_branch().map(|branch| (branch, sha)));
        match actual {
            Ok((branch, sha)) if branch == marker.expected_branch && sha == marker.expected_sha => {
                RestartVerification {
                    ok: true,
                    message: "ok".to_string(),
                }
            }
            Ok((branch, sha)) => {
                let message = format!(
                    "Restart verification failed: {branch}@{} != {}@{}",
                    short_sha(&sha),
                    marker.expected_branch,
                    short_sha(&marker.expected_sha)
                );
                tracing::warn!("{message}");
                RestartVerification { ok: false, message }
            }
            Err(err) => {
                let message = format!("Restart marker verification error: {err}");
                tracing::warn!("{message}");
                RestartVerification { ok: false, message }
            }
        }
    }

    /// Verify the restart marker and record the outcome in the state document.
    pub fn auto_resume_after_restart(&self) -> Result<RestartVerification, SyncError> {
        let verification = self.verify_restart_marker();
        let ok = verification.ok;
        let message = verification.message.clone();
        self.store.update(move |doc| {
            doc.auto_resume_ok = Some(ok);
            doc.auto_resume_msg = Some(message);
        })?;
        Ok(verification)
    }
}

fn run_step(step: &'static str, command: &[String], cwd: &Path) -> Result<String, SyncError> {
    let (program, args) = command
        .split_first()
        .ok_or(SyncError::EmptyCommand { step })?;
    let rendered = command.join(" ");
    tracing::debug!(step, command = %rendered, "running");
    let output = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|source| SyncError::Spawn {
            step,
            command: rendered.clone(),
            source,
        })?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(SyncError::CommandFailed {
            step,
            command: rendered,
            status: output.status.code(),
            output: tail(combined.trim(), OUTPUT_TAIL_CHARS),
        });
    }
    Ok(combined)
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
