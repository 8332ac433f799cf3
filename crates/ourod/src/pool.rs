//! Fixed-size worker pool. Each slot holds at most one live process and at
//! most one assigned task. Dead slots are replaced, never left empty.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::{mpsc, Arc};

use ouro_agents::{SupervisorCommand, WorkerLauncher, WorkerProcess};
use ouro_core::{AdmissionError, AuditLog, SupervisorEvent, TaskId, WorkerRef, WorkerRole};

use crate::error::PoolError;
use crate::queue::TaskQueue;

/// First retry delay after a failed launch; doubles per consecutive failure.
const LAUNCH_BACKOFF_BASE_SECS: i64 = 5;
const LAUNCH_BACKOFF_MAX_SECS: i64 = 300;

#[derive(Debug, Default)]
struct WorkerSlot {
    process: Option<WorkerProcess>,
    task: Option<TaskId>,
    generation: u64,
    last_progress: Option<DateTime<Utc>>,
    /// Consecutive failed launches; reset by a successful one.
    launch_failures: u32,
    /// While the slot has no process, no relaunch before this instant.
    next_launch_at: Option<DateTime<Utc>>,
}

/// Read-only view of a slot for status output and audit records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub generation: u64,
    pub pid: Option<u32>,
    pub task: Option<TaskId>,
    pub spawned_at: Option<DateTime<Utc>>,
    pub last_progress: Option<DateTime<Utc>>,
}

/// A slot whose worker was found dead or killed, and what happened next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub slot: usize,
    pub orphaned: Option<TaskId>,
    pub exit_code: Option<i32>,
    pub respawn_error: Option<String>,
}

#[derive(Debug, Default)]
pub struct AssignReport {
    pub assigned: Vec<(TaskId, usize)>,
    pub refused: Option<AdmissionError>,
    /// Assignments that could not be written to the worker; the task went
    /// back to pending and the slot was marked for replacement.
    pub undelivered: Vec<(TaskId, usize)>,
}

#[derive(Debug, Default)]
pub struct SpawnReport {
    pub spawned: usize,
    pub orphaned: Vec<TaskId>,
    pub failures: Vec<String>,
}

pub struct WorkerPool {
    launcher: Arc<dyn WorkerLauncher>,
    events: mpsc::Sender<SupervisorEvent>,
    audit: AuditLog,
    slots: Vec<WorkerSlot>,
    next_generation: u64,
}

impl WorkerPool {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        events: mpsc::Sender<SupervisorEvent>,
        audit: AuditLog,
    ) -> Self {
        Self {
            launcher,
            events,
            audit,
            slots: Vec::new(),
            next_generation: 1,
        }
    }

    /// Requested pool size.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&mut self) -> usize {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.process.as_mut())
            .map(|process| process.is_alive())
            .filter(|alive| *alive)
            .count()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.task.is_some()).count()
    }

    pub fn views(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotView {
                slot: index,
                generation: slot.generation,
                pid: slot.process.as_ref().map(|p| p.pid),
                task: slot.task.clone(),
                spawned_at: slot.process.as_ref().map(|p| p.spawned_at),
                last_progress: slot.last_progress,
            })
            .collect()
    }

    /// Whether `who` is the current incarnation of a pool slot. Events from
    /// older generations are stale.
    pub fn is_current(&self, who: WorkerRef) -> bool {
        match who.role {
            WorkerRole::Pool { slot } => self
                .slots
                .get(slot)
                .is_some_and(|s| s.generation == who.generation && s.process.is_some()),
            WorkerRole::Direct => false,
        }
    }

    /// Brings the pool to `n` slots, each with a live process. Shrinking
    /// terminates the surplus and reports their tasks as orphaned.
    pub fn spawn_workers(&mut self, n: usize) -> SpawnReport {
        let mut report = SpawnReport::default();
        while self.slots.len() > n {
            if let Some(mut slot) = self.slots.pop() {
                if let Some(process) = slot.process.as_mut() {
                    process.kill();
                }
                report.orphaned.extend(slot.task.take());
            }
        }
        while self.slots.len() < n {
            self.slots.push(WorkerSlot::default());
        }
        for index in 0..n {
            if self.slots[index].process.is_some() {
                continue;
            }
            match self.launch_into(index, Utc::now()) {
                Ok(()) => report.spawned += 1,
                Err(err) => {
                    tracing::warn!(slot = index, error = %err, "worker launch failed");
                    report.failures.push(err.to_string());
                }
            }
        }
        tracing::info!(size = n, spawned = report.spawned, "worker pool sized");
        report
    }

    /// Terminates every worker and empties the pool. Returns the tasks that
    /// were running so the caller can fail them.
    pub fn kill_workers(&mut self, reason: &str) -> Vec<TaskId> {
        let mut orphaned = Vec::new();
        let count = self.slots.len();
        for mut slot in self.slots.drain(..) {
            if let Some(process) = slot.process.as_mut() {
                process.kill();
            }
            orphaned.extend(slot.task.take());
        }
        self.audit.record(
            "workers_killed",
            json!({ "reason": reason, "count": count, "orphaned": orphaned }),
        );
        tracing::warn!(%reason, count, orphaned = orphaned.len(), "all workers killed");
        orphaned
    }

    /// Pairs idle workers with the next eligible pending tasks. Admission is
    /// checked before each assignment; the first refusal stops the round.
    pub fn assign_tasks<F>(&mut self, queue: &mut TaskQueue, admit: F) -> AssignReport
    where
        F: Fn() -> Result<(), AdmissionError>,
    {
        let mut report = AssignReport::default();
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.process.is_none() || slot.task.is_some() {
                continue;
            }
            let Some(pending_index) = queue.next_assignable() else {
                break;
            };
            if let Err(refusal) = admit() {
                report.refused = Some(refusal);
                break;
            }
            let Some(task) = queue.mark_running(pending_index, index, Utc::now()) else {
                break;
            };
            let task_id = task.id.clone();
            match self.deliver(index, &SupervisorCommand::Assign { task }) {
                Ok(()) => {
                    let slot = &mut self.slots[index];
                    slot.task = Some(task_id.clone());
                    slot.last_progress = Some(Utc::now());
                    tracing::info!(task_id = %task_id, slot = index, "task assigned");
                    report.assigned.push((task_id, index));
                }
                Err(err) => {
                    tracing::warn!(task_id = %task_id, slot = index, error = %err, "assignment not delivered");
                    if let Err(err) = queue.requeue(&task_id) {
                        tracing::warn!(error = %err, "requeue failed");
                    }
                    if let Some(mut process) = self.slots[index].process.take() {
                        process.kill();
                    }
                    report.undelivered.push((task_id, index));
                }
            }
        }
        report
    }

    /// Unbinds `task_id` from `slot`. False when the slot was not running it.
    pub fn release(&mut self, slot: usize, task_id: &TaskId) -> bool {
        match self.slots.get_mut(slot) {
            Some(s) if s.task.as_ref() == Some(task_id) => {
                s.task = None;
                true
            }
            _ => false,
        }
    }

    pub fn record_progress(&mut self, slot: usize) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.last_progress = Some(Utc::now());
        }
    }

    pub fn send_cancel(&self, slot: usize, task_id: &TaskId) -> Result<(), PoolError> {
        self.deliver(
            slot,
            &SupervisorCommand::Cancel {
                task_id: task_id.clone(),
            },
        )
    }

    /// Probes every slot and replaces dead workers. Slots left empty by a
    /// failed launch are retried once their backoff has elapsed.
    pub fn ensure_workers_healthy(&mut self, now: DateTime<Utc>) -> Vec<Replacement> {
        let mut dead = Vec::new();
        let mut retry = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.process.as_mut() {
                Some(process) => {
                    if !process.is_alive() {
                        dead.push(index);
                    }
                }
                None if slot.next_launch_at.map_or(true, |at| now >= at) => retry.push(index),
                None => {}
            }
        }
        for index in retry {
            if self.launch_into(index, now).is_ok() {
                tracing::info!(slot = index, "worker launched after earlier failure");
            }
        }
        dead.into_iter()
            .map(|index| self.replace_slot(index, "health check"))
            .collect()
    }

    /// Kills whatever runs in `slot`, records it, and launches a new
    /// generation in its place.
    pub fn replace_slot(&mut self, index: usize, reason: &str) -> Replacement {
        let Some(slot) = self.slots.get_mut(index) else {
            return Replacement {
                slot: index,
                orphaned: None,
                exit_code: None,
                respawn_error: Some(PoolError::NoWorker { slot: index }.to_string()),
            };
        };
        let orphaned = slot.task.take();
        let old_generation = slot.generation;
        let (pid, exit_code) = match slot.process.take() {
            Some(mut process) => {
                let code = process.exit_code();
                process.kill();
                (Some(process.pid), code)
            }
            None => (None, None),
        };
        self.audit.record(
            "worker_dead",
            json!({
                "slot": index,
                "generation": old_generation,
                "pid": pid,
                "exit_code": exit_code,
                "task_id": orphaned,
                "reason": reason,
            }),
        );
        tracing::warn!(slot = index, generation = old_generation, ?exit_code, %reason, "replacing worker");

        let respawn_error = self
            .launch_into(index, Utc::now())
            .err()
            .map(|err| err.to_string());
        Replacement {
            slot: index,
            orphaned,
            exit_code,
            respawn_error,
        }
    }

    /// A failure leaves the slot empty and schedules the next attempt with
    /// exponential backoff, so a broken worker command is retried slowly.
    fn launch_into(&mut self, index: usize, now: DateTime<Utc>) -> Result<(), PoolError> {
        let who = WorkerRef {
            role: WorkerRole::Pool { slot: index },
            generation: self.next_generation,
        };
        self.next_generation += 1;
        let slot = &mut self.slots[index];
        slot.generation = who.generation;
        slot.task = None;
        match self.launcher.launch(who, self.events.clone()) {
            Ok(process) => {
                slot.process = Some(process);
                slot.last_progress = Some(now);
                slot.launch_failures = 0;
                slot.next_launch_at = None;
                Ok(())
            }
            Err(source) => {
                slot.launch_failures = slot.launch_failures.saturating_add(1);
                let delay = launch_backoff(slot.launch_failures);
                slot.next_launch_at = Some(now + delay);
                let err = PoolError::Launch {
                    worker: who.role.to_string(),
                    source,
                };
                self.audit.record(
                    "worker_launch_failed",
                    json!({
                        "slot": index,
                        "attempt": slot.launch_failures,
                        "retry_in_secs": delay.num_seconds(),
                        "error": err.to_string(),
                    }),
                );
                tracing::warn!(slot = index, attempt = slot.launch_failures, retry_in_secs = delay.num_seconds(), error = %err, "worker launch failed");
                Err(err)
            }
        }
    }

    fn deliver(&self, index: usize, command: &SupervisorCommand) -> Result<(), PoolError> {
        let process = self
            .slots
            .get(index)
            .and_then(|slot| slot.process.as_ref())
            .ok_or(PoolError::NoWorker { slot: index })?;
        process.send(command).map_err(|source| PoolError::Deliver {
            worker: process.who.role.to_string(),
            command: command.kind_tag(),
            source,
        })
    }
}

fn launch_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    let secs = LAUNCH_BACKOFF_BASE_SECS.saturating_mul(1_i64 << exponent);
    Duration::seconds(secs.min(LAUNCH_BACKOFF_MAX_SECS))
}


#[cfg(test)]
mod tests {
    use super::test_support::{idle_launcher, script_launcher};
    use super::*;
    use ouro_core::{Task, TaskKind, TaskStatus};
    use std::time::{Duration, Instant};

    struct Harness {
        _dir: tempfile::TempDir,
        audit: AuditLog,
        rx: mpsc::Receiver<SupervisorEvent>,
        pool: WorkerPool,
    }

    fn harness(launcher: Arc<dyn WorkerLauncher>) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = AuditLog::new(dir.path().join("supervisor.jsonl"));
        let (tx, rx) = mpsc::channel();
        let pool = WorkerPool::new(launcher, tx, audit.clone());
        Harness {
            _dir: dir,
            audit,
            rx,
            pool,
        }
    }

    fn admit() -> Result<(), AdmissionError> {
        Ok(())
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn live_slots_track_last_requested_size() {
        let mut h = harness(idle_launcher());
        h.pool.spawn_workers(3);
        assert_eq!(h.pool.live_count(), 3);
        h.pool.spawn_workers(1);
        assert_eq!(h.pool.size(), 1);
        assert_eq!(h.pool.live_count(), 1);
        h.pool.kill_workers("test");
        assert_eq!(h.pool.live_count(), 0);
        h.pool.spawn_workers(2);
        assert_eq!(h.pool.live_count(), 2);
        assert_eq!(h.audit.read_kind("workers_killed").len(), 1);
    }

    #[test]
    fn assign_binds_one_task_per_idle_worker() {
        let mut h = harness(idle_launcher());
        h.pool.spawn_workers(1);
        let mut queue = TaskQueue::new(600, 1800);
        let first = queue.enqueue(Task::new(TaskKind::Chat, "a", None)).expect("enqueue");
        queue.enqueue(Task::new(TaskKind::Chat, "b", None)).expect("enqueue");

        let report = h.pool.assign_tasks(&mut queue, admit);
        assert_eq!(report.assigned, vec![(first.clone(), 0)]);
        assert_eq!(queue.running_len(), 1);
        assert_eq!(queue.pending_len(), 1);

        let again = h.pool.assign_tasks(&mut queue, admit);
        assert!(again.assigned.is_empty());
        assert!(h.pool.release(0, &first));
        assert!(!h.pool.release(0, &first));
    }

    #[test]
    fn admission_refusal_stops_assignment() {
        let mut h = harness(idle_launcher());
        h.pool.spawn_workers(2);
        let mut queue = TaskQueue::new(600, 1800);
        queue.enqueue(Task::new(TaskKind::Chat, "a", None)).expect("enqueue");

        let report = h.pool.assign_tasks(&mut queue, || {
            Err(AdmissionError::BudgetExhausted {
                spent: 10.0,
                ceiling: 10.0,
            })
        });
        assert!(report.assigned.is_empty());
        assert!(report.refused.is_some());
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.pending()[0].status, TaskStatus::Pending);
    }

    #[test]
    fn dead_worker_is_replaced_and_its_task_orphaned() {
        let mut h = harness(script_launcher("read line; exit 3"));
        h.pool.spawn_workers(1);
        let mut queue = TaskQueue::new(600, 1800);
        let id = queue.enqueue(Task::new(TaskKind::Chat, "a", None)).expect("enqueue");
        let report = h.pool.assign_tasks(&mut queue, admit);
        assert_eq!(report.assigned.len(), 1);
        let old_generation = h.pool.views()[0].generation;

        let stdout_closed = wait_until(|| {
            matches!(
                h.rx.try_recv(),
                Ok(SupervisorEvent::WorkerExited { .. })
            )
        });
        assert!(stdout_closed);
        assert!(wait_until(|| h.pool.live_count() == 0));

        let replaced = h.pool.ensure_workers_healthy(Utc::now());
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].orphaned, Some(id));
        assert_eq!(h.pool.size(), 1);
        assert!(h.pool.views()[0].generation > old_generation);
        assert_eq!(h.audit.read_kind("worker_dead").len(), 1);
    }

    #[test]
    fn unlaunchable_worker_is_retried_with_backoff() {
        let mut h = harness(Arc::new(ouro_agents::ProcessLauncher::new(
            ouro_agents::LaunchSpec {
                command: vec!["/nonexistent/worker".into()],
                cwd: std::env::temp_dir(),
                env: Vec::new(),
                start_method: "spawn".into(),
            },
        )));
        let report = h.pool.spawn_workers(3);
        assert_eq!(report.spawned, 0);
        assert_eq!(report.failures.len(), 3);

        let start = Utc::now();
        for second in 0..60 {
            let replaced = h.pool.ensure_workers_healthy(start + chrono::Duration::seconds(second));
            assert!(replaced.is_empty());
        }
        assert!(h.audit.read_kind("worker_dead").is_empty());
        // Per slot: the initial launch plus retries after 5s, 15s and 35s.
        let failures = h.audit.read_kind("worker_launch_failed");
        assert_eq!(failures.len(), 12);
        assert_eq!(h.pool.live_count(), 0);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(launch_backoff(1), chrono::Duration::seconds(5));
        assert_eq!(launch_backoff(2), chrono::Duration::seconds(10));
        assert_eq!(launch_backoff(4), chrono::Duration::seconds(40));
        assert_eq!(launch_backoff(30), chrono::Duration::seconds(300));
    }

    #[test]
    fn stale_generations_are_not_current() {
        let mut h = harness(idle_launcher());
        h.pool.spawn_workers(1);
        let first = WorkerRef {
            role: WorkerRole::Pool { slot: 0 },
            generation: h.pool.views()[0].generation,
        };
        assert!(h.pool.is_current(first));
        h.pool.replace_slot(0, "test");
        assert!(!h.pool.is_current(first));
        assert!(!h.pool.is_current(WorkerRef {
            role: WorkerRole::Pool { slot: 9 },
            generation: first.generation,
        }));
    }

    #[test]
    fn cancel_is_written_to_the_worker() {
        let mut h = harness(script_launcher("while read line; do echo \"$line\"; done"));
        h.pool.spawn_workers(1);
        h.pool
            .send_cancel(0, &TaskId::new("abc12345"))
            .expect("send cancel");
        let echoed = h.rx.recv_timeout(Duration::from_secs(5)).expect("echo");
        match echoed {
            SupervisorEvent::Worker { message, .. } => {
                assert!(format!("{message:?}").contains("abc12345"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            h.pool.send_cancel(4, &TaskId::new("x")),
            Err(PoolError::NoWorker { slot: 4 })
        ));
    }
}
