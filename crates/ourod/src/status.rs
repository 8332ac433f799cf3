use std::fmt::Write;

use ouro_core::{BudgetLedger, StateDocument};
use ouro_git::short_sha;

use crate::pool::SlotView;
use crate::queue::TaskQueue;

const PENDING_PREVIEW: usize = 5;
const PREVIEW_CHARS: usize = 60;

/// Operator-facing `/status` text.
pub fn status_text(
    doc: &StateDocument,
    ledger: &BudgetLedger,
    queue: &TaskQueue,
    workers: &[SlotView],
    chat_busy: bool,
) -> String {
    let busy = workers.iter().filter(|w| w.task.is_some()).count();
    let live = workers.iter().filter(|w| w.pid.is_some()).count();
    let branch = doc.current_branch.as_deref().unwrap_or("?");
    let sha = doc.current_sha.as_deref().map(short_sha).unwrap_or("?");

    let mut out = String::new();
    let _ = writeln!(out, "branch: {branch}@{sha}");
    let _ = writeln!(out, "{}", ledger.summary());
    let _ = writeln!(out, "workers: {busy} busy / {live} live / {} total", workers.len());
    let _ = writeln!(
        out,
        "queue: {} pending, {} running",
        queue.pending_len(),
        queue.running_len()
    );
    let _ = writeln!(
        out,
        "evolution: {} (cycle {})",
        if doc.evolution_enabled { "on" } else { "off" },
        doc.evolution_cycle
    );
    let _ = writeln!(out, "direct chat: {}", if chat_busy { "busy" } else { "idle" });

    for (task, slot) in queue.running() {
        let _ = writeln!(
            out,
            "  running {} [{}] on worker-{slot}: {}",
            task.id,
            task.kind,
            task.preview(PREVIEW_CHARS)
        );
    }
    for task in queue.pending().iter().take(PENDING_PREVIEW) {
        let _ = writeln!(
            out,
            "  pending {} [{}]: {}",
            task.id,
            task.kind,
            task.preview(PREVIEW_CHARS)
        );
    }
    if queue.pending_len() > PENDING_PREVIEW {
        let _ = writeln!(out, "  ... and {} more", queue.pending_len() - PENDING_PREVIEW);
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ouro_core::{DriveLayout, StateStore, Task, TaskKind};

    #[test]
    fn status_lists_branch_budget_and_queue_head() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(DriveLayout::new(dir.path()));
        store.ensure_layout().expect("layout");
        let doc = store
            .update(|doc| {
                doc.current_branch = Some("ouroboros".to_string());
                doc.current_sha = Some("0123456789abcdef".to_string());
                doc.spent_usd = 2.5;
            })
            .expect("update");
        let ledger = BudgetLedger::new(10.0, store);

        let mut queue = TaskQueue::new(600, 1800);
        for i in 0..7 {
            queue
                .enqueue(Task::new(TaskKind::Chat, format!("task number {i}"), None))
                .expect("enqueue");
        }
        queue.mark_running(0, 1, Utc::now()).expect("mark");
        let running_id = queue.running().next().map(|(t, _)| t.id.clone()).expect("running");
        let workers = vec![
            SlotView {
                slot: 0,
                generation: 1,
                pid: Some(100),
                task: None,
                spawned_at: None,
                last_progress: None,
            },
            SlotView {
                slot: 1,
                generation: 2,
                pid: Some(101),
                task: Some(running_id.clone()),
                spawned_at: None,
                last_progress: None,
            },
        ];

        let text = status_text(&doc, &ledger, &queue, &workers, false);
        assert!(text.contains("branch: ouroboros@01234567"));
        assert!(text.contains("$2.50 spent"));
        assert!(text.contains("workers: 1 busy / 2 live / 2 total"));
        assert!(text.contains("queue: 6 pending, 1 running"));
        assert!(text.contains(&format!("running {running_id}")));
        assert!(text.contains("... and 1 more"));
    }
}
