//! The persistent state document and every other file the supervisor keeps
//! on the drive. Not safe for concurrent writers; the supervisor serializes
//! all writes through one `StateStore`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::DriveLayout;
use crate::types::{ChatId, Task};

/// Chat log is moved to the archive once it grows past this.
pub const CHAT_LOG_ROTATE_BYTES: u64 = 800 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to replace {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Single source of truth across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateDocument {
    pub created_at: DateTime<Utc>,
    pub owner_chat_id: Option<ChatId>,
    pub spent_usd: f64,
    pub spent_calls: u64,
    pub total_budget_usd: f64,
    pub current_branch: Option<String>,
    pub current_sha: Option<String>,
    pub last_restart_ok_at: Option<DateTime<Utc>>,
    pub last_restart_reason: Option<String>,
    /// Next inbound update id to request from the transport.
    pub tg_offset: i64,
    pub auto_resume_ok: Option<bool>,
    pub auto_resume_msg: Option<String>,
    pub evolution_enabled: bool,
    pub evolution_cycle: u64,
    pub messages_sent: u64,
    pub queue_snapshot_path: Option<PathBuf>,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            created_at: Utc::now(),
            owner_chat_id: None,
            spent_usd: 0.0,
            spent_calls: 0,
            total_budget_usd: 0.0,
            current_branch: None,
            current_sha: None,
            last_restart_ok_at: None,
            last_restart_reason: None,
            tg_offset: 0,
            auto_resume_ok: None,
            auto_resume_msg: None,
            evolution_enabled: false,
            evolution_cycle: 0,
            messages_sent: 0,
            queue_snapshot_path: None,
        }
    }
}

/// Pending and running task descriptors at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub pending: Vec<Task>,
    #[serde(default)]
    pub running: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotLoad {
    Absent,
    Loaded(QueueSnapshot),
    /// Unreadable snapshot; the file has already been removed.
    Discarded { reason: String },
}

/// Result of a best-effort append. Never an error for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Written,
    Failed { reason: String },
}

impl AppendOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, AppendOutcome::Written)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    layout: DriveLayout,
}

impl StateStore {
    pub fn new(layout: DriveLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &DriveLayout {
        &self.layout
    }

    pub fn ensure_layout(&self) -> Result<(), StoreError> {
        for dir in self.layout.subdirs() {
            fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDir { path: dir, source })?;
        }
        let rescue = self.layout.rescue_root();
        fs::create_dir_all(&rescue).map_err(|source| StoreError::CreateDir {
            path: rescue,
            source,
        })
    }

    /// Re-reads the document every call. Absent or corrupt files yield a
    /// fresh default, which is saved back.
    pub fn load(&self) -> StateDocument {
        let path = self.layout.state_file();
        let parsed = match fs::read_to_string(&path) {
            Ok(body) => match serde_json::from_str::<StateDocument>(&body) {
                Ok(doc) => return doc,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "state document corrupt; resetting to default");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "state document unreadable; resetting to default");
                None
            }
        };
        let doc = parsed.unwrap_or_default();
        if let Err(err) = self.save(&doc) {
            tracing::warn!(error = %err, "failed to persist default state document");
        }
        doc
    }

    pub fn save(&self, doc: &StateDocument) -> Result<(), StoreError> {
        let body = serde_json::to_string_pretty(doc).map_err(|source| StoreError::Serialize {
            what: "state document",
            source,
        })?;
        atomic_write_text(&self.layout.state_file(), &body)
    }

    /// Load, apply `f`, save. Returns the saved document.
    pub fn update<F>(&self, f: F) -> Result<StateDocument, StoreError>
    where
        F: FnOnce(&mut StateDocument),
    {
        let mut doc = self.load();
        f(&mut doc);
        self.save(&doc)?;
        Ok(doc)
    }

    pub fn save_queue_snapshot(&self, snapshot: &QueueSnapshot) -> Result<PathBuf, StoreError> {
        let path = self.layout.queue_snapshot_file();
        let body =
            serde_json::to_string_pretty(snapshot).map_err(|source| StoreError::Serialize {
                what: "queue snapshot",
                source,
            })?;
        atomic_write_text(&path, &body)?;
        let current = self.load();
        if current.queue_snapshot_path.as_deref() != Some(path.as_path()) {
            let recorded = path.clone();
            self.update(move |doc| doc.queue_snapshot_path = Some(recorded))?;
        }
        Ok(path)
    }

    pub fn load_queue_snapshot(&self) -> SnapshotLoad {
        let path = self.layout.queue_snapshot_file();
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return SnapshotLoad::Absent,
            Err(err) => return self.discard_snapshot(&path, err.to_string()),
        };
        match serde_json::from_str::<QueueSnapshot>(&body) {
            Ok(snapshot) => SnapshotLoad::Loaded(snapshot),
            Err(err) => self.discard_snapshot(&path, err.to_string()),
        }
    }

    fn discard_snapshot(&self, path: &Path, reason: String) -> SnapshotLoad {
        tracing::warn!(path = %path.display(), reason = %reason, "discarding corrupt queue snapshot");
        if let Err(err) = fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove corrupt queue snapshot");
        }
        SnapshotLoad::Discarded { reason }
    }

    pub fn delete_queue_snapshot(&self) -> Result<(), StoreError> {
        remove_if_exists(&self.layout.queue_snapshot_file())
    }

    /// Move the chat log into the archive when it exceeds `max_bytes`.
    pub fn rotate_chat_log(&self, max_bytes: u64) -> Result<Option<PathBuf>, StoreError> {
        let path = self.layout.chat_log();
        let size = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Read { path, source }),
        };
        if size <= max_bytes {
            return Ok(None);
        }
        let archive = self.layout.archive_dir();
        fs::create_dir_all(&archive).map_err(|source| StoreError::CreateDir {
            path: archive.clone(),
            source,
        })?;
        let target = archive.join(format!(
            "chat_{}.jsonl",
            Utc::now().format("%Y%m%d_%H%M%S%3f")
        ));
        fs::rename(&path, &target).map_err(|source| StoreError::Rename {
            path: target.clone(),
            source,
        })?;
        tracing::info!(from = %path.display(), to = %target.display(), size, "chat log rotated");
        Ok(Some(target))
    }
}

/// Append one JSON record as a single newline-terminated line. Failures are
/// logged and returned as an outcome, never as an error.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> AppendOutcome {
    match try_append(path, record) {
        Ok(()) => AppendOutcome::Written,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "jsonl append failed");
            AppendOutcome::Failed {
                reason: err.to_string(),
            }
        }
    }
}

fn try_append<T: Serialize>(path: &Path, record: &T) -> Result<(), StoreError> {
    let mut line = serde_json::to_string(record).map_err(|source| StoreError::Serialize {
        what: "jsonl record",
        source,
    })?;
    line.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    // One write per record so concurrent O_APPEND writers never interleave.
    file.write_all(line.as_bytes())
        .map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub fn atomic_write_text(path: &Path, contents: &str) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
        path: parent.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let tmp = parent.join(format!(
        ".{file_name}.tmp.{}.{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ));

    let write_result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()
    })();
    if let Err(source) = write_result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Write { path: tmp, source });
    }

    if let Err(source) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::Rename {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

pub fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(StoreError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
