//! Task queue: ordered pending list, running set keyed by id, and a bounded
//! history of terminal tasks.
//!
//! Every task lives in exactly one of the three. Mutations bump a revision
//! counter so the caller knows when to persist a snapshot.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::PathBuf;

use ouro_core::{
    AuditLog, QueueSnapshot, SnapshotLoad, StateStore, StoreError, Task, TaskId, TaskKind,
    TaskStatus,
};

use crate::error::QueueError;

pub const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone)]
struct RunningEntry {
    task: Task,
    slot: usize,
    soft_warned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    CancelledPending(Task),
    /// Cooperative cancel flagged; the pool must deliver it to `slot`.
    RunningSignalled { slot: usize, task_id: TaskId },
    AlreadyRequested { slot: usize },
    AlreadyTerminal(TaskStatus),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutEvent {
    Soft {
        task_id: TaskId,
        slot: usize,
        elapsed_secs: i64,
    },
    /// The task is already `timed_out`; the worker in `slot` must be reclaimed.
    Hard { task: Task, slot: usize },
}

/// Where a task currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLocation {
    Pending,
    Running { slot: usize },
    Terminal(TaskStatus),
}

#[derive(Debug)]
pub struct TaskQueue {
    pending: Vec<Task>,
    running: BTreeMap<TaskId, RunningEntry>,
    history: VecDeque<Task>,
    known_ids: HashSet<TaskId>,
    next_seq: u64,
    soft_timeout: Duration,
    hard_timeout: Duration,
    revision: u64,
}

impl TaskQueue {
    pub fn new(soft_timeout_secs: u64, hard_timeout_secs: u64) -> Self {
        Self {
            pending: Vec::new(),
            running: BTreeMap::new(),
            history: VecDeque::new(),
            known_ids: HashSet::new(),
            next_seq: 0,
            soft_timeout: Duration::seconds(soft_timeout_secs as i64),
            hard_timeout: Duration::seconds(hard_timeout_secs as i64),
            revision: 0,
        }
    }

    /// Incremented on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn pending(&self) -> &[Task] {
        &self.pending
    }

    pub fn running(&self) -> impl Iterator<Item = (&Task, usize)> {
        self.running.values().map(|entry| (&entry.task, entry.slot))
    }

    pub fn history(&self) -> impl Iterator<Item = &Task> {
        self.history.iter().rev()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    pub fn locate(&self, id: &TaskId) -> Option<TaskLocation> {
        if self.pending.iter().any(|task| &task.id == id) {
            return Some(TaskLocation::Pending);
        }
        if let Some(entry) = self.running.get(id) {
            return Some(TaskLocation::Running { slot: entry.slot });
        }
        self.history
            .iter()
            .find(|task| &task.id == id)
            .map(|task| TaskLocation::Terminal(task.status))
    }

    pub fn running_task(&self, id: &TaskId) -> Option<&Task> {
        self.running.get(id).map(|entry| &entry.task)
    }

    /// True when a task of `kind` is pending or running.
    pub fn has_active_kind(&self, kind: TaskKind) -> bool {
        self.pending.iter().any(|task| task.kind == kind)
            || self.running.values().any(|entry| entry.task.kind == kind)
    }

    pub fn has_running_kind(&self, kind: TaskKind) -> bool {
        self.running.values().any(|entry| entry.task.kind == kind)
    }

    pub fn enqueue(&mut self, mut task: Task) -> Result<TaskId, QueueError> {
        if !self.known_ids.insert(task.id.clone()) {
            return Err(QueueError::DuplicateId(task.id));
        }
        task.seq = self.next_seq;
        self.next_seq += 1;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.soft_deadline = None;
        task.hard_deadline = None;
        task.finished_at = None;
        task.cancel_requested = false;
        let id = task.id.clone();
        tracing::info!(task_id = %id, kind = %task.kind, seq = task.seq, "task enqueued");
        self.pending.push(task);
        self.sort_pending();
        self.revision += 1;
        Ok(id)
    }

    /// Stable sort by (kind rank, submission sequence).
    pub fn sort_pending(&mut self) {
        self.pending.sort_by_key(Task::ordering_key);
    }

    /// Index of the first pending task that may start now. An exclusive
    /// kind is skipped while another task of that kind is running.
    pub fn next_assignable(&self) -> Option<usize> {
        self.pending.iter().position(|task| {
            !(task.kind.is_exclusive() && self.has_running_kind(task.kind))
        })
    }

    /// Moves `pending[index]` to the running set and stamps its deadlines.
    pub fn mark_running(&mut self, index: usize, slot: usize, now: DateTime<Utc>) -> Option<Task> {
        if index >= self.pending.len() {
            return None;
        }
        let mut task = self.pending.remove(index);
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.soft_deadline = Some(now + self.soft_timeout);
        task.hard_deadline = Some(now + self.hard_timeout);
        let assigned = task.clone();
        self.running.insert(
            task.id.clone(),
            RunningEntry {
                task,
                slot,
                soft_warned: false,
            },
        );
        self.revision += 1;
        Some(assigned)
    }

    /// Puts a running task back at its place in the pending order, e.g.
    /// when the assignment could not be delivered.
    pub fn requeue(&mut self, id: &TaskId) -> Result<(), QueueError> {
        let entry = self
            .running
            .remove(id)
            .ok_or_else(|| QueueError::NotRunning(id.clone()))?;
        let mut task = entry.task;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.soft_deadline = None;
        task.hard_deadline = None;
        self.pending.push(task);
        self.sort_pending();
        self.revision += 1;
        Ok(())
    }

    /// Finishes a running task. A failure after a cancel request is
    /// recorded as `cancelled`.
    pub fn complete(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        outcome: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<Task> {
        let entry = self.running.remove(id)?;
        let mut task = entry.task;
        task.status = match status {
            TaskStatus::Failed if task.cancel_requested => TaskStatus::Cancelled,
            other => other,
        };
        task.finished_at = Some(now);
        task.outcome = Some(outcome.into());
        self.push_history(task.clone());
        self.revision += 1;
        Some(task)
    }

    pub fn cancel(&mut self, id: &TaskId, now: DateTime<Utc>) -> CancelOutcome {
        if let Some(index) = self.pending.iter().position(|task| &task.id == id) {
            let mut task = self.pending.remove(index);
            task.status = TaskStatus::Cancelled;
            task.finished_at = Some(now);
            task.outcome = Some("cancelled before start".to_string());
            self.push_history(task.clone());
            self.revision += 1;
            return CancelOutcome::CancelledPending(task);
        }
        if let Some(entry) = self.running.get_mut(id) {
            if entry.task.cancel_requested {
                return CancelOutcome::AlreadyRequested { slot: entry.slot };
            }
            entry.task.cancel_requested = true;
            self.revision += 1;
            return CancelOutcome::RunningSignalled {
                slot: entry.slot,
                task_id: id.clone(),
            };
        }
        match self.history.iter().find(|task| &task.id == id) {
            Some(task) => CancelOutcome::AlreadyTerminal(task.status),
            None => CancelOutcome::NotFound,
        }
    }

    /// Soft warnings fire once per task. Hard expiries leave the running
    /// set as `timed_out`.
    pub fn enforce_timeouts(&mut self, now: DateTime<Utc>) -> Vec<TimeoutEvent> {
        let mut events = Vec::new();
        let mut expired = Vec::new();
        for (id, entry) in self.running.iter_mut() {
            let started = entry.task.started_at.unwrap_or(now);
            if entry.task.hard_deadline.is_some_and(|deadline| now >= deadline) {
                expired.push(id.clone());
            } else if !entry.soft_warned
                && entry.task.soft_deadline.is_some_and(|deadline| now >= deadline)
            {
                entry.soft_warned = true;
                events.push(TimeoutEvent::Soft {
                    task_id: id.clone(),
                    slot: entry.slot,
                    elapsed_secs: (now - started).num_seconds(),
                });
            }
        }
        for id in expired {
            let Some(slot) = self.running.get(&id).map(|entry| entry.slot) else {
                continue;
            };
            let outcome = format!("hard timeout after {}s", self.hard_timeout.num_seconds());
            if let Some(task) = self.complete(&id, TaskStatus::TimedOut, outcome, now) {
                events.push(TimeoutEvent::Hard { task, slot });
            }
        }
        events
    }

    pub fn snapshot(&self, reason: &str) -> QueueSnapshot {
        QueueSnapshot {
            saved_at: Utc::now(),
            reason: reason.to_string(),
            pending: self.pending.clone(),
            running: self.running.values().map(|entry| entry.task.clone()).collect(),
        }
    }

    pub fn persist_snapshot(&self, store: &StateStore, reason: &str) -> Result<PathBuf, StoreError> {
        store.save_queue_snapshot(&self.snapshot(reason))
    }

    /// Rehydrates the pending set from the last snapshot. Tasks that were
    /// running in the previous process are resubmitted under new ids and the
    /// old ids are audited as failed. Returns the number of pending tasks added.
    pub fn restore_pending_from_snapshot(&mut self, store: &StateStore, audit: &AuditLog) -> usize {
        let snapshot = match store.load_queue_snapshot() {
            SnapshotLoad::Absent => return 0,
            SnapshotLoad::Discarded { reason } => {
                tracing::warn!(%reason, "queue snapshot discarded");
                audit.record("queue_snapshot_discarded", json!({ "reason": reason }));
                return 0;
            }
            SnapshotLoad::Loaded(snapshot) => snapshot,
        };

        let mut restored = 0;
        for task in snapshot.pending {
            let id = task.id.clone();
            match self.enqueue(task) {
                Ok(_) => restored += 1,
                Err(err) => tracing::warn!(task_id = %id, error = %err, "skipping snapshot task"),
            }
        }
        for old in snapshot.running {
            self.known_ids.insert(old.id.clone());
            let fresh = Task::new(old.kind, old.text.clone(), old.chat_id);
            audit.record(
                "task_failed",
                json!({
                    "task_id": old.id,
                    "kind": old.kind,
                    "reason": "lost_on_restart",
                    "resubmitted_as": fresh.id,
                }),
            );
            match self.enqueue(fresh) {
                Ok(_) => restored += 1,
                Err(err) => tracing::warn!(task_id = %old.id, error = %err, "resubmit failed"),
            }
        }
        tracing::info!(restored, saved_at = %snapshot.saved_at, "queue restored from snapshot");
        restored
    }

    fn push_history(&mut self, task: Task) {
        while self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouro_core::DriveLayout;

    fn queue() -> TaskQueue {
        TaskQueue::new(600, 1800)
    }

    fn chat(text: &str) -> Task {
        Task::new(TaskKind::Chat, text, Some(7))
    }

    fn assert_partitioned(queue: &TaskQueue, ids: &[TaskId]) {
        for id in ids {
            let in_pending = queue.pending().iter().filter(|t| &t.id == id).count();
            let in_running = queue.running().filter(|(t, _)| &t.id == id).count();
            let in_history = queue.history().filter(|t| &t.id == id).count();
            assert_eq!(in_pending + in_running + in_history, 1, "task {id} misplaced");
        }
    }

    #[test]
    fn chat_tasks_are_ordered_before_review_and_evolution() {
        let mut q = queue();
        q.enqueue(Task::new(TaskKind::Evolution, "evolve", None)).expect("enqueue");
        q.enqueue(Task::new(TaskKind::Review, "review", None)).expect("enqueue");
        q.enqueue(chat("first")).expect("enqueue");
        q.enqueue(chat("second")).expect("enqueue");

        let order: Vec<_> = q.pending().iter().map(|t| t.text.as_str()).collect();
        assert_eq!(order, vec!["first", "second", "review", "evolve"]);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut q = queue();
        let task = chat("once");
        q.enqueue(task.clone()).expect("enqueue");
        assert_eq!(q.enqueue(task.clone()), Err(QueueError::DuplicateId(task.id)));
    }

    #[test]
    fn only_one_evolution_task_runs_at_a_time() {
        let mut q = queue();
        q.enqueue(Task::new(TaskKind::Evolution, "e1", None)).expect("enqueue");
        q.enqueue(Task::new(TaskKind::Evolution, "e2", None)).expect("enqueue");
        let index = q.next_assignable().expect("first evolution");
        q.mark_running(index, 0, Utc::now()).expect("mark");
        assert_eq!(q.next_assignable(), None);

        q.enqueue(chat("chat")).expect("enqueue");
        let index = q.next_assignable().expect("chat is still assignable");
        assert_eq!(q.pending()[index].text, "chat");
    }

    #[test]
    fn mark_running_sets_deadlines_from_timeouts() {
        let mut q = queue();
        q.enqueue(chat("work")).expect("enqueue");
        let now = Utc::now();
        let task = q.mark_running(0, 3, now).expect("mark");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.soft_deadline, Some(now + Duration::seconds(600)));
        assert_eq!(task.hard_deadline, Some(now + Duration::seconds(1800)));
        assert_eq!(q.locate(&task.id), Some(TaskLocation::Running { slot: 3 }));
    }

    #[test]
    fn cancel_pending_removes_it_and_running_sets_flag() {
        let mut q = queue();
        let a = q.enqueue(chat("a")).expect("enqueue");
        let b = q.enqueue(chat("b")).expect("enqueue");
        q.mark_running(0, 1, Utc::now()).expect("mark a");

        match q.cancel(&b, Utc::now()) {
            CancelOutcome::CancelledPending(task) => assert_eq!(task.status, TaskStatus::Cancelled),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(q.pending_len(), 0);
        assert_eq!(
            q.cancel(&a, Utc::now()),
            CancelOutcome::RunningSignalled {
                slot: 1,
                task_id: a.clone()
            }
        );
        assert_eq!(q.cancel(&a, Utc::now()), CancelOutcome::AlreadyRequested { slot: 1 });
        assert_eq!(
            q.cancel(&b, Utc::now()),
            CancelOutcome::AlreadyTerminal(TaskStatus::Cancelled)
        );
        assert_eq!(q.cancel(&TaskId::new("nope"), Utc::now()), CancelOutcome::NotFound);
        assert_partitioned(&q, &[a, b]);
    }

    #[test]
    fn failure_after_cancel_request_counts_as_cancelled() {
        let mut q = queue();
        let id = q.enqueue(chat("a")).expect("enqueue");
        q.mark_running(0, 0, Utc::now()).expect("mark");
        q.cancel(&id, Utc::now());
        let task = q
            .complete(&id, TaskStatus::Failed, "interrupted", Utc::now())
            .expect("complete");
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(q.complete(&id, TaskStatus::Done, "late", Utc::now()).is_none());
    }

    #[test]
    fn soft_timeout_warns_once_and_hard_timeout_expires() {
        let mut q = queue();
        let id = q.enqueue(chat("slow")).expect("enqueue");
        let start = Utc::now();
        q.mark_running(0, 2, start).expect("mark");

        assert!(q.enforce_timeouts(start + Duration::seconds(10)).is_empty());
        let soft = q.enforce_timeouts(start + Duration::seconds(601));
        assert!(matches!(&soft[..], [TimeoutEvent::Soft { slot: 2, .. }]));
        assert!(q.enforce_timeouts(start + Duration::seconds(700)).is_empty());

        let hard = q.enforce_timeouts(start + Duration::seconds(1800));
        match &hard[..] {
            [TimeoutEvent::Hard { task, slot: 2 }] => {
                assert_eq!(task.id, id);
                assert_eq!(task.status, TaskStatus::TimedOut);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(q.enforce_timeouts(start + Duration::seconds(4000)).is_empty());
        assert_eq!(q.locate(&id), Some(TaskLocation::Terminal(TaskStatus::TimedOut)));
    }

    #[test]
    fn requeue_returns_task_to_pending_in_order() {
        let mut q = queue();
        let a = q.enqueue(chat("a")).expect("enqueue");
        q.enqueue(chat("b")).expect("enqueue");
        q.mark_running(0, 0, Utc::now()).expect("mark");
        q.requeue(&a).expect("requeue");
        assert_eq!(q.pending()[0].id, a);
        assert_eq!(q.pending()[0].status, TaskStatus::Pending);
        assert_eq!(q.requeue(&a), Err(QueueError::NotRunning(a)));
    }

    #[test]
    fn history_is_bounded() {
        let mut q = queue();
        for i in 0..(HISTORY_LIMIT + 5) {
            let id = q.enqueue(chat(&format!("t{i}"))).expect("enqueue");
            q.cancel(&id, Utc::now());
        }
        assert_eq!(q.history().count(), HISTORY_LIMIT);
        assert_eq!(q.history().next().map(|t| t.text.as_str()), Some("t204"));
    }

    #[test]
    fn snapshot_restore_keeps_pending_and_resubmits_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(DriveLayout::new(dir.path()));
        store.ensure_layout().expect("layout");
        let audit = AuditLog::new(store.layout().supervisor_log());

        let mut before = queue();
        let lost = before.enqueue(chat("running")).expect("enqueue");
        let p1 = before.enqueue(chat("p1")).expect("enqueue");
        let p2 = before.enqueue(Task::new(TaskKind::Review, "p2", None)).expect("enqueue");
        before.mark_running(0, 0, Utc::now()).expect("mark");
        before.persist_snapshot(&store, "test").expect("persist");

        let mut after = queue();
        assert_eq!(after.restore_pending_from_snapshot(&store, &audit), 3);
        assert_eq!(after.running_len(), 0);
        let ids: Vec<_> = after.pending().iter().map(|t| t.id.clone()).collect();
        assert!(ids.contains(&p1));
        assert!(ids.contains(&p2));
        assert!(!ids.contains(&lost));
        assert!(after.pending().iter().all(|t| t.status == TaskStatus::Pending));

        let failed = audit.read_kind("task_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["task_id"], lost.0.as_str());
        assert_eq!(failed[0]["reason"], "lost_on_restart");

        let mut reused = Task::new(TaskKind::Chat, "reuse", None);
        reused.id = lost.clone();
        assert_eq!(after.enqueue(reused), Err(QueueError::DuplicateId(lost)));
    }

    #[test]
    fn corrupt_snapshot_restores_nothing_and_is_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(DriveLayout::new(dir.path()));
        store.ensure_layout().expect("layout");
        let audit = AuditLog::new(store.layout().supervisor_log());
        let path = store.layout().queue_snapshot_file();
        std::fs::write(&path, "{not json").expect("write corrupt snapshot");

        let mut q = queue();
        assert_eq!(q.restore_pending_from_snapshot(&store, &audit), 0);
        assert!(!path.exists());
        assert_eq!(audit.read_kind("queue_snapshot_discarded").len(), 1);
    }
}
