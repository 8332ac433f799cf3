use chrono::Utc;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::store::{append_jsonl, AppendOutcome};

/// Lifecycle audit trail, one `{ts, type, ...fields}` object per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `fields` should be a JSON object; anything else is stored under `value`.
    pub fn record(&self, kind: &str, fields: Value) -> AppendOutcome {
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
        record.insert("type".to_string(), Value::String(kind.to_string()));
        match fields {
            Value::Object(extra) => {
                for (key, value) in extra {
                    if key != "ts" && key != "type" {
                        record.insert(key, value);
                    }
                }
            }
            Value::Null => {}
            other => {
                record.insert("value".to_string(), other);
            }
        }
        append_jsonl(&self.path, &Value::Object(record))
    }

    /// Records of one type, oldest first. Unparseable lines are skipped.
    pub fn read_kind(&self, kind: &str) -> Vec<Value> {
        let Ok(body) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        body.lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter(|record| record.get("type").and_then(Value::as_str) == Some(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_prefixes_ts_and_type() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("logs/supervisor.jsonl"));
        assert!(log
            .record("task_done", json!({"task_id": "abc", "type": "ignored"}))
            .is_written());
        log.record("launcher_start", Value::Null);

        let done = log.read_kind("task_done");
        assert_eq!(done.len(), 1);
        assert_eq!(done[0]["task_id"], "abc");
        assert!(done[0]["ts"].is_string());
        assert_eq!(log.read_kind("launcher_start").len(), 1);
        assert!(log.read_kind("missing").is_empty());
    }

    #[test]
    fn non_object_fields_are_wrapped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        log.record("note", json!("free text"));
        assert_eq!(log.read_kind("note")[0]["value"], "free text");
    }
}
