//! Event handlers. `Supervisor` owns the queue, the worker pool, the direct
//! chat agent, the budget ledger and the git layer. The daemon loop feeds it
//! one event at a time, so every handler sees the effects of the previous one.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{mpsc, Arc};

use ouro_agents::WorkerLauncher;
use ouro_core::{
    AuditLog, BudgetLedger, ChatId, InboundMessage, StallLevel, StateDocument, StateStore,
    SupervisorConfig, SupervisorEvent, Task, TaskId, TaskKind, TaskStatus, UsageReport,
    WorkerMessage, WorkerRef, WorkerRole,
};
use ouro_git::{GitSync, UnsyncedPolicy};
use ouro_notify::{MessageTransport, Messenger, SendOutcome};

use crate::commands::{SlashCommand, HELP_TEXT};
use crate::direct_chat::DirectChat;
use crate::pool::{Replacement, SlotView, SpawnReport, WorkerPool};
use crate::queue::{CancelOutcome, TaskQueue, TimeoutEvent};
use crate::status::status_text;

pub const RESTART_EXIT_CODE: i32 = 75;
pub const PANIC_EXIT_CODE: i32 = 2;
/// Evolution cycles only start while more than this much budget is left.
pub const EVOLUTION_MIN_REMAINING_USD: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown { reason: String },
    Panic,
    /// The tree was reset and a restart marker written; the host relaunches us.
    Restart { reason: String },
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Shutdown { .. } => 0,
            ExitReason::Panic => PANIC_EXIT_CODE,
            ExitReason::Restart { .. } => RESTART_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Exit(ExitReason),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub assigned: usize,
    pub soft_timeouts: usize,
    pub hard_timeouts: usize,
    pub replaced: usize,
}

pub struct Supervisor {
    pub(crate) config: SupervisorConfig,
    pub(crate) store: StateStore,
    pub(crate) audit: AuditLog,
    pub(crate) ledger: BudgetLedger,
    pub(crate) queue: TaskQueue,
    pub(crate) pool: WorkerPool,
    pub(crate) chat: DirectChat,
    pub(crate) messenger: Messenger,
    pub(crate) git: GitSync,
    persisted_revision: Option<u64>,
    budget_refusal_notified: bool,
}

impl Supervisor {
    /// Wires the components together. Touches neither disk nor processes.
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn MessageTransport>,
        launcher: Arc<dyn WorkerLauncher>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Self {
        let store = StateStore::new(config.drive.clone());
        let audit = AuditLog::new(store.layout().supervisor_log());
        let ledger = BudgetLedger::new(config.total_budget_usd, store.clone());
        let messenger = Messenger::new(
            transport,
            store.clone(),
            ledger.clone(),
            config.notify.clone(),
        );
        let git = GitSync::new(&config, store.clone(), audit.clone());
        let pool = WorkerPool::new(Arc::clone(&launcher), events.clone(), audit.clone());
        let chat = DirectChat::new(launcher, events);
        let queue = TaskQueue::new(
            config.workers.soft_timeout_secs,
            config.workers.hard_timeout_secs,
        );
        Self {
            config,
            store,
            audit,
            ledger,
            queue,
            pool,
            chat,
            messenger,
            git,
            persisted_revision: None,
            budget_refusal_notified: false,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn workers(&self) -> Vec<SlotView> {
        self.pool.views()
    }

    pub fn live_workers(&mut self) -> usize {
        self.pool.live_count()
    }

    pub fn chat_busy(&self) -> bool {
        self.chat.is_busy()
    }

    pub fn chat_activity(&self) -> crate::direct_chat::SharedActivity {
        self.chat.activity()
    }

    pub fn owner(&self) -> Option<ChatId> {
        self.store.load().owner_chat_id
    }

    pub fn status_text(&self) -> String {
        status_text(
            &self.store.load(),
            &self.ledger,
            &self.queue,
            &self.pool.views(),
            self.chat.is_busy(),
        )
    }

    /// Sizes the pool to the configured maximum.
    pub fn start_workers(&mut self) -> SpawnReport {
        let report = self.pool.spawn_workers(self.config.workers.max_workers);
        if !report.orphaned.is_empty() {
            self.fail_orphans(report.orphaned.clone(), "worker pool resized");
        }
        report
    }

    pub fn submit_task(
        &mut self,
        kind: TaskKind,
        text: impl Into<String>,
        chat_id: Option<ChatId>,
        source: &str,
    ) -> Option<TaskId> {
        let task = Task::new(kind, text, chat_id);
        match self.queue.enqueue(task) {
            Ok(id) => {
                self.audit.record(
                    "task_enqueued",
                    json!({ "task_id": id, "kind": kind, "source": source }),
                );
                Some(id)
            }
            Err(err) => {
                tracing::warn!(error = %err, "enqueue rejected");
                None
            }
        }
    }

    pub fn handle_event(&mut self, event: SupervisorEvent) -> LoopControl {
        tracing::trace!(kind = event.kind_tag(), "dispatching event");
        let control = match event {
            SupervisorEvent::Worker { from, message, .. } => self.handle_worker_message(from, message),
            SupervisorEvent::WorkerExited { from } => {
                self.handle_worker_exit(from);
                LoopControl::Continue
            }
            SupervisorEvent::Inbound(message) => self.handle_inbound(message),
            SupervisorEvent::ChatStalled {
                level,
                episode,
                idle_secs,
                total_secs,
            } => {
                self.handle_chat_stall(level, episode, idle_secs, total_secs);
                LoopControl::Continue
            }
            SupervisorEvent::Shutdown { reason } => self.shutdown(&reason),
        };
        self.persist_if_changed("event");
        control
    }

    /// Periodic work: replace dead workers, sweep timeouts, start an
    /// evolution cycle when due, hand pending tasks to idle workers.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        for replacement in self.pool.ensure_workers_healthy(now) {
            report.replaced += 1;
            self.handle_replacement(replacement, "worker died");
        }

        for timeout in self.queue.enforce_timeouts(now) {
            match timeout {
                TimeoutEvent::Soft {
                    task_id,
                    slot,
                    elapsed_secs,
                } => {
                    report.soft_timeouts += 1;
                    tracing::warn!(task_id = %task_id, slot, elapsed_secs, "soft timeout");
                    // Audit only; the hard timeout sends the single owner message.
                    self.audit.record(
                        "task_soft_timeout",
                        json!({ "task_id": task_id, "slot": slot, "elapsed_secs": elapsed_secs }),
                    );
                }
                TimeoutEvent::Hard { task, slot } => {
                    report.hard_timeouts += 1;
                    let replacement = self.pool.replace_slot(slot, "hard timeout");
                    report.replaced += 1;
                    self.audit.record(
                        "task_timed_out",
                        json!({
                            "task_id": task.id,
                            "kind": task.kind,
                            "slot": slot,
                            "respawn_error": replacement.respawn_error,
                        }),
                    );
                    tracing::warn!(task_id = %task.id, slot, "hard timeout, worker replaced");
                    self.handle_replacement(replacement, "hard timeout");
                    self.reply_for(
                        &task,
                        &format!(
                            "⏱️ Task {} exceeded the hard timeout ({}s). Worker killed and replaced.",
                            task.id, self.config.workers.hard_timeout_secs
                        ),
                    );
                }
            }
        }

        self.maybe_enqueue_evolution();
        report.assigned = self.assign_pending();
        self.persist_if_changed("tick");
        report
    }

    /// Kills everything, persists, and reports the loop should stop.
    pub fn shutdown(&mut self, reason: &str) -> LoopControl {
        tracing::info!(%reason, "supervisor shutting down");
        self.audit.record("shutdown", json!({ "reason": reason }));
        self.stop_all(&format!("shutdown: {reason}"));
        self.persist_queue("shutdown");
        LoopControl::Exit(ExitReason::Shutdown {
            reason: reason.to_string(),
        })
    }

    pub fn persist_queue(&mut self, reason: &str) {
        match self.queue.persist_snapshot(&self.store, reason) {
            Ok(_) => self.persisted_revision = Some(self.queue.revision()),
            Err(err) => tracing::warn!(error = %err, %reason, "queue snapshot not saved"),
        }
    }

    pub fn notify_owner(&mut self, text: &str) -> Option<SendOutcome> {
        match self.owner() {
            Some(owner) => Some(self.messenger.send_with_budget(owner, text)),
            None => {
                tracing::debug!("no owner bound, notification dropped");
                None
            }
        }
    }

    fn assign_pending(&mut self) -> usize {
        let ledger = &self.ledger;
        let report = self
            .pool
            .assign_tasks(&mut self.queue, || ledger.check_admission());
        for (task_id, slot) in &report.assigned {
            self.audit
                .record("task_assigned", json!({ "task_id": task_id, "slot": slot }));
        }
        match report.refused {
            Some(refusal) if !self.budget_refusal_notified => {
                self.budget_refusal_notified = true;
                tracing::warn!(error = %refusal, "task admission refused");
                self.notify_owner(&format!(
                    "💸 {refusal}. Pending tasks stay queued until the budget is raised."
                ));
            }
            Some(_) => {}
            None if !report.assigned.is_empty() => self.budget_refusal_notified = false,
            None => {}
        }
        report.assigned.len()
    }

    fn persist_if_changed(&mut self, reason: &str) {
        if self.persisted_revision != Some(self.queue.revision()) {
            self.persist_queue(reason);
        }
    }

    fn handle_worker_message(&mut self, from: WorkerRef, message: WorkerMessage) -> LoopControl {
        let usage = match &message {
            WorkerMessage::Usage { usage, .. } => Some(usage.clone()),
            WorkerMessage::TaskDone { usage, .. } | WorkerMessage::TaskFailed { usage, .. } => {
                usage.clone()
            }
            _ => None,
        };
        // Money already spent counts even when the sender is stale.
        if let Some(usage) = usage {
            self.record_usage(&usage);
        }

        match from.role {
            WorkerRole::Pool { slot } => {
                if !self.pool.is_current(from) {
                    tracing::debug!(worker = %from.role, generation = from.generation, "stale worker event ignored");
                    return LoopControl::Continue;
                }
                self.pool.record_progress(slot);
                match message {
                    WorkerMessage::TaskDone {
                        task_id, result, ..
                    } => self.finish_task(slot, &task_id, TaskStatus::Done, result),
                    WorkerMessage::TaskFailed { task_id, error, .. } => {
                        self.finish_task(slot, &task_id, TaskStatus::Failed, error)
                    }
                    other => return self.handle_control_message(from, other),
                }
            }
            WorkerRole::Direct => {
                if !self.chat.is_current(from) {
                    tracing::debug!(generation = from.generation, "stale chat event ignored");
                    return LoopControl::Continue;
                }
                self.chat.record_progress();
                match message {
                    WorkerMessage::TaskDone { result, .. } => {
                        self.chat.finish_turn();
                        if !result.trim().is_empty() {
                            self.notify_owner(&result);
                        }
                    }
                    WorkerMessage::TaskFailed { error, .. } => {
                        self.chat.finish_turn();
                        self.notify_owner(&format!("⚠️ Chat turn failed: {error}"));
                    }
                    other => return self.handle_control_message(from, other),
                }
            }
        }
        LoopControl::Continue
    }

    /// Messages any agent may send, pool worker or direct chat.
    fn handle_control_message(&mut self, from: WorkerRef, message: WorkerMessage) -> LoopControl {
        match message {
            WorkerMessage::Ready => {
                tracing::info!(worker = %from.role, generation = from.generation, "worker ready")
            }
            WorkerMessage::Progress { task_id, text } => {
                tracing::debug!(worker = %from.role, task_id = ?task_id, "{text}")
            }
            WorkerMessage::Output { line } => tracing::debug!(worker = %from.role, "{line}"),
            WorkerMessage::Usage { .. } => {}
            WorkerMessage::SendMessage { chat_id, text } => {
                match chat_id.or_else(|| self.owner()) {
                    Some(target) => {
                        self.messenger.send_with_budget(target, &text);
                    }
                    None => tracing::warn!(worker = %from.role, "send_message without a chat to send to"),
                }
            }
            WorkerMessage::ScheduleTask { text, kind } => {
                let kind = kind.unwrap_or_default();
                let owner = self.owner();
                if let Some(id) = self.submit_task(kind, text, owner, &from.role.to_string()) {
                    self.notify_owner(&format!("🗓️ Scheduled {kind} task {id}."));
                }
            }
            WorkerMessage::CancelTask { task_id } => {
                let reply = self.cancel_task(&task_id);
                self.notify_owner(&reply);
            }
            WorkerMessage::RequestRestart { reason } => {
                return self.restart(non_empty(&reason, "agent request"));
            }
            WorkerMessage::PromoteToStable { reason } => {
                self.promote(non_empty(&reason, "agent request"));
            }
            WorkerMessage::RequestReview { reason } => {
                self.request_review(non_empty(&reason, "agent request"));
            }
            WorkerMessage::ToggleEvolution { enabled } => self.set_evolution(enabled),
            WorkerMessage::TaskDone { task_id, .. } | WorkerMessage::TaskFailed { task_id, .. } => {
                tracing::warn!(worker = %from.role, task_id = %task_id, "unexpected completion");
            }
        }
        LoopControl::Continue
    }

    fn record_usage(&mut self, usage: &UsageReport) {
        if let Err(err) = self.ledger.update_from_usage(usage) {
            tracing::warn!(error = %err, "usage not recorded");
        }
    }

    fn finish_task(&mut self, slot: usize, task_id: &TaskId, status: TaskStatus, text: String) {
        if !self.pool.release(slot, task_id) {
            tracing::warn!(task_id = %task_id, slot, "completion from a slot not running that task, ignored");
            return;
        }
        let Some(task) = self.queue.complete(task_id, status, text.clone(), Utc::now()) else {
            tracing::warn!(task_id = %task_id, "completion for a task that is not running");
            return;
        };
        self.audit.record(
            &format!("task_{}", task.status.as_str()),
            json!({ "task_id": task.id, "kind": task.kind, "slot": slot }),
        );
        tracing::info!(task_id = %task.id, status = %task.status, "task finished");
        let reply = match task.status {
            TaskStatus::Done if text.trim().is_empty() => {
                format!("✅ Task {} ({}) done.", task.id, task.kind)
            }
            TaskStatus::Done => format!("✅ Task {} ({}) done.\n{}", task.id, task.kind, text),
            TaskStatus::Cancelled => format!("🛑 Task {} cancelled.", task.id),
            _ => format!("❌ Task {} failed: {}", task.id, text),
        };
        self.reply_for(&task, &reply);
    }

    fn reply_for(&mut self, task: &Task, text: &str) {
        match task.chat_id {
            Some(chat_id) => {
                self.messenger.send_with_budget(chat_id, text);
            }
            None => {
                self.notify_owner(text);
            }
        }
    }

    fn handle_worker_exit(&mut self, from: WorkerRef) {
        match from.role {
            WorkerRole::Pool { slot } => {
                if !self.pool.is_current(from) {
                    return;
                }
                let replacement = self.pool.replace_slot(slot, "worker exited");
                self.handle_replacement(replacement, "worker exited");
            }
            WorkerRole::Direct => {
                if !self.chat.is_current(from) {
                    return;
                }
                let was_busy = self.chat.is_busy();
                self.chat.discard("agent exited");
                if was_busy {
                    self.notify_owner("⚠️ The chat agent exited mid-turn. Send your message again.");
                }
            }
        }
    }

    fn handle_replacement(&mut self, replacement: Replacement, reason: &str) {
        if let Some(error) = &replacement.respawn_error {
            tracing::warn!(slot = replacement.slot, %error, "replacement worker failed to start");
        }
        let Some(task_id) = replacement.orphaned else {
            return;
        };
        let outcome = match replacement.exit_code {
            Some(code) => format!("{reason} (exit code {code})"),
            None => reason.to_string(),
        };
        if let Some(task) = self.queue.complete(&task_id, TaskStatus::Failed, outcome.clone(), Utc::now()) {
            self.audit.record(
                &format!("task_{}", task.status.as_str()),
                json!({ "task_id": task.id, "slot": replacement.slot, "reason": outcome }),
            );
            let text = match task.status {
                TaskStatus::Cancelled => format!("🛑 Task {} cancelled.", task.id),
                _ => format!("❌ Task {} failed: {outcome}", task.id),
            };
            self.reply_for(&task, &text);
        }
    }

    fn fail_orphans(&mut self, orphans: Vec<TaskId>, reason: &str) {
        let mut failed = Vec::new();
        for id in orphans {
            if let Some(task) = self.queue.complete(&id, TaskStatus::Failed, reason, Utc::now()) {
                self.audit.record(
                    &format!("task_{}", task.status.as_str()),
                    json!({ "task_id": task.id, "reason": reason }),
                );
                failed.push(task.id.to_string());
            }
        }
        if !failed.is_empty() {
            self.notify_owner(&format!(
                "❌ {} running task(s) stopped ({reason}): {}",
                failed.len(),
                failed.join(", ")
            ));
        }
    }

    fn stop_all(&mut self, reason: &str) {
        let orphans = self.pool.kill_workers(reason);
        self.fail_orphans(orphans, reason);
        self.chat.discard(reason);
    }

    fn handle_inbound(&mut self, message: InboundMessage) -> LoopControl {
        self.messenger.log_inbound(&message);
        let next_offset = message.update_id + 1;
        let mut newly_bound = false;
        let owner = match self.store.update(|doc| {
            if doc.tg_offset < next_offset {
                doc.tg_offset = next_offset;
            }
            if doc.owner_chat_id.is_none() {
                doc.owner_chat_id = Some(message.chat_id);
                newly_bound = true;
            }
        }) {
            Ok(doc) => doc.owner_chat_id,
            Err(err) => {
                tracing::warn!(error = %err, "state update for inbound message failed");
                self.owner()
            }
        };
        let Some(owner) = owner else {
            return LoopControl::Continue;
        };
        if message.chat_id != owner {
            tracing::info!(chat_id = message.chat_id, "ignoring message from a chat that is not the owner");
            return LoopControl::Continue;
        }
        if newly_bound {
            self.audit.record("owner_bound", json!({ "chat_id": owner }));
            tracing::info!(chat_id = owner, "owner bound");
            self.messenger
                .send_with_budget(owner, "👋 This chat is now bound as the owner.");
        }

        match SlashCommand::parse(&message.text) {
            Some(SlashCommand::Panic) => return self.panic(),
            Some(SlashCommand::Restart) => return self.restart("owner /restart"),
            Some(SlashCommand::Status) => {
                let text = self.status_text();
                self.messenger.send_with_budget(owner, &text);
            }
            Some(SlashCommand::Cancel(Some(task_id))) => {
                let reply = self.cancel_task(&task_id);
                self.messenger.send_with_budget(owner, &reply);
            }
            Some(SlashCommand::Cancel(None)) => {
                self.messenger.send_with_budget(owner, "Usage: /cancel <task_id>");
            }
            Some(SlashCommand::Review) => self.request_review("owner /review"),
            Some(SlashCommand::Evolve(Some(enabled))) => self.set_evolution(enabled),
            Some(SlashCommand::Evolve(None)) => {
                self.messenger.send_with_budget(owner, "Usage: /evolve on|off");
            }
            Some(SlashCommand::Promote) => self.promote("owner /promote"),
            Some(SlashCommand::Unknown(name)) => {
                self.messenger
                    .send_with_budget(owner, &format!("Unknown command /{name}. {HELP_TEXT}"));
            }
            None => self.chat_turn(owner, &message.text),
        }
        LoopControl::Continue
    }

    fn chat_turn(&mut self, chat_id: ChatId, text: &str) {
        if let Err(refusal) = self.ledger.check_admission() {
            self.messenger.send_with_budget(
                chat_id,
                &format!("💸 {refusal}. New work is refused until the budget is raised."),
            );
            return;
        }
        if let Err(err) = self.chat.start_turn(chat_id, text) {
            tracing::warn!(error = %err, "direct chat turn not started");
            self.messenger
                .send_with_budget(chat_id, &format!("⚠️ Chat agent unavailable: {err}"));
        }
    }

    fn handle_chat_stall(&mut self, level: StallLevel, episode: u64, idle_secs: u64, total_secs: u64) {
        if !self.chat.is_busy() {
            return;
        }
        let current = self.chat.episode();
        if episode != current {
            tracing::debug!(episode, current, "stall report for an earlier chat turn ignored");
            return;
        }
        self.audit.record(
            "chat_stalled",
            json!({
                "level": level,
                "episode": episode,
                "idle_secs": idle_secs,
                "total_secs": total_secs,
            }),
        );
        match level {
            StallLevel::Soft => {
                self.notify_owner(&format!(
                    "⏳ The chat agent has been quiet for {idle_secs}s (turn running {total_secs}s). Still waiting."
                ));
            }
            StallLevel::Hard => {
                self.chat.discard("hard stall");
                self.notify_owner(&format!(
                    "⚠️ The chat agent stalled for {idle_secs}s and was reset. Send your message again."
                ));
            }
        }
    }

    fn cancel_task(&mut self, task_id: &TaskId) -> String {
        match self.queue.cancel(task_id, Utc::now()) {
            CancelOutcome::CancelledPending(task) => {
                self.audit.record(
                    "task_cancelled",
                    json!({ "task_id": task.id, "kind": task.kind, "while": "pending" }),
                );
                format!("🛑 Task {task_id} cancelled before it started.")
            }
            CancelOutcome::RunningSignalled { slot, task_id } => {
                match self.pool.send_cancel(slot, &task_id) {
                    Ok(()) => format!("🛑 Cancel sent to task {task_id} on worker-{slot}."),
                    Err(err) => {
                        tracing::warn!(task_id = %task_id, slot, error = %err, "cancel not delivered, killing worker");
                        let replacement = self.pool.replace_slot(slot, "cancel not delivered");
                        self.handle_replacement(replacement, "cancel not delivered");
                        format!("🛑 Task {task_id} stopped; its worker was replaced.")
                    }
                }
            }
            CancelOutcome::AlreadyRequested { slot } => {
                format!("Cancel already requested for task {task_id} on worker-{slot}.")
            }
            CancelOutcome::AlreadyTerminal(status) => format!("Task {task_id} is already {status}."),
            CancelOutcome::NotFound => format!("Task {task_id} not found."),
        }
    }

    fn request_review(&mut self, reason: &str) {
        if self.queue.has_active_kind(TaskKind::Review) {
            self.notify_owner("🔍 A review task is already queued or running.");
            return;
        }
        let text = format!(
            "Review the recent changes on branch {} ({reason}). Report bugs, risks and regressions.",
            self.config.git.branch_dev
        );
        let owner = self.owner();
        if let Some(id) = self.submit_task(TaskKind::Review, text, owner, reason) {
            self.notify_owner(&format!("🔍 Review task {id} queued."));
        }
    }

    fn set_evolution(&mut self, enabled: bool) {
        if let Err(err) = self.store.update(|doc| doc.evolution_enabled = enabled) {
            tracing::warn!(error = %err, "evolution flag not saved");
            return;
        }
        self.audit
            .record("evolution_toggled", json!({ "enabled": enabled }));
        self.notify_owner(if enabled {
            "🧬 Evolution mode on."
        } else {
            "🧬 Evolution mode off."
        });
    }

    fn maybe_enqueue_evolution(&mut self) {
        let doc: StateDocument = self.store.load();
        if !doc.evolution_enabled {
            return;
        }
        if self.queue.pending_len() > 0 || self.queue.has_running_kind(TaskKind::Evolution) {
            return;
        }
        let remaining = self.ledger.remaining();
        if remaining <= EVOLUTION_MIN_REMAINING_USD {
            if let Err(err) = self.store.update(|doc| doc.evolution_enabled = false) {
                tracing::warn!(error = %err, "evolution flag not saved");
            }
            self.audit.record(
                "evolution_toggled",
                json!({ "enabled": false, "reason": "low_budget", "remaining_usd": remaining }),
            );
            self.notify_owner(&format!(
                "💸 Only ${remaining:.2} left. Evolution mode turned off."
            ));
            return;
        }

        let cycle = doc.evolution_cycle + 1;
        let text = format!(
            "Evolution cycle #{cycle}: study your own code and recent conversations, pick one \
             improvement, implement it on branch {}, test it, commit and push.",
            self.config.git.branch_dev
        );
        let owner = doc.owner_chat_id;
        let Some(id) = self.submit_task(TaskKind::Evolution, text, owner, "evolution") else {
            return;
        };
        if let Err(err) = self.store.update(|doc| doc.evolution_cycle = cycle) {
            tracing::warn!(error = %err, "evolution cycle counter not saved");
        }
        self.notify_owner(&format!("🧬 Evolution cycle #{cycle} queued as task {id}."));
    }

    fn promote(&mut self, reason: &str) {
        let text = match self.git.promote_to_stable(reason) {
            Ok(message) => format!("✅ {message}"),
            Err(err) => {
                tracing::warn!(error = %err, "promotion failed");
                format!("⚠️ Promote to stable failed: {err}")
            }
        };
        self.notify_owner(&text);
    }

    fn panic(&mut self) -> LoopControl {
        tracing::error!("panic command received");
        self.notify_owner("🛑 PANIC: stopping all workers and exiting.");
        self.audit.record("panic", json!({}));
        self.stop_all("panic");
        LoopControl::Exit(ExitReason::Panic)
    }

    /// Kill workers, reset to the development branch with a rescue
    /// snapshot, then exit for relaunch. On failure keep running on the
    /// current tree.
    fn restart(&mut self, reason: &str) -> LoopControl {
        tracing::warn!(%reason, "restart requested");
        self.notify_owner(&format!("♻️ Restarting: {reason}"));
        self.stop_all(&format!("restart: {reason}"));
        self.persist_queue("restart");

        match self.git.safe_restart(reason, UnsyncedPolicy::RescueAndReset) {
            Ok(message) => {
                if let Err(err) = self.git.write_restart_marker(reason) {
                    tracing::warn!(error = %err, "restart marker not written");
                }
                self.audit.record(
                    "restart_requested",
                    json!({ "reason": reason, "result": message }),
                );
                LoopControl::Exit(ExitReason::Restart {
                    reason: reason.to_string(),
                })
            }
            Err(err) => {
                tracing::error!(error = %err, "restart failed, staying on current tree");
                self.audit.record(
                    "restart_failed",
                    json!({ "reason": reason, "error": err.to_string() }),
                );
                self.notify_owner(&format!(
                    "⚠️ Restart failed: {err}. Workers respawned on the current tree."
                ));
                self.start_workers();
                LoopControl::Continue
            }
        }
    }
}

fn non_empty<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ouro_core::Settings;
    use ouro_notify::RecordingTransport;
    use std::path::Path;

    use crate::pool::test_support::idle_launcher;

    pub const OWNER: ChatId = 4242;

    pub fn config(root: &Path, max_workers: usize) -> SupervisorConfig {
        let settings = Settings::from_pairs([
            ("OPENROUTER_API_KEY", "sk-test".to_string()),
            ("TELEGRAM_BOT_TOKEN", "123:abc".to_string()),
            ("TOTAL_BUDGET", "100".to_string()),
            ("GITHUB_TOKEN", "ghp_test".to_string()),
            ("GITHUB_USER", "ouro".to_string()),
            ("GITHUB_REPO", "ouroboros".to_string()),
            ("OUROBOROS_MAX_WORKERS", max_workers.to_string()),
            (
                "OUROBOROS_DRIVE_ROOT",
                root.join("drive").to_string_lossy().into_owned(),
            ),
            (
                "OUROBOROS_REPO_DIR",
                root.join("repo").to_string_lossy().into_owned(),
            ),
            (
                "OUROBOROS_REMOTE_URL",
                root.join("missing-remote.git").to_string_lossy().into_owned(),
            ),
        ]);
        SupervisorConfig::from_settings(&settings).expect("test config")
    }

    pub struct Harness {
        pub dir: tempfile::TempDir,
        pub transport: Arc<RecordingTransport>,
        pub events: mpsc::Receiver<SupervisorEvent>,
        pub sup: Supervisor,
    }

    pub fn harness(max_workers: usize) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = config(dir.path(), max_workers);
        let transport = Arc::new(RecordingTransport::new());
        let (tx, rx) = mpsc::channel();
        let sup = Supervisor::new(cfg, transport.clone(), idle_launcher(), tx);
        sup.store.ensure_layout().expect("layout");
        sup.store
            .update(|doc| doc.owner_chat_id = Some(OWNER))
            .expect("bind owner");
        Harness {
            dir,
            transport,
            events: rx,
            sup,
        }
    }

    pub fn from_slot(h: &Harness, slot: usize) -> WorkerRef {
        let generation = h.sup.workers()[slot].generation;
        WorkerRef {
            role: WorkerRole::Pool { slot },
            generation,
        }
    }

    pub fn worker_event(from: WorkerRef, message: WorkerMessage) -> SupervisorEvent {
        SupervisorEvent::worker(from, message)
    }

    pub fn inbound(update_id: i64, chat_id: ChatId, text: &str) -> SupervisorEvent {
        SupervisorEvent::Inbound(InboundMessage {
            update_id,
            chat_id,
            text: text.to_string(),
        })
    }
}
