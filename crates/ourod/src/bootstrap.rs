//! Boot sequence and background threads.
//!
//! Order matters: the working tree is synced and verified before any worker
//! starts, and the queue is restored only once the pool is up.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use ouro_agents::LaunchSpec;
use ouro_core::{SupervisorConfig, SupervisorEvent};
use ouro_git::{RestartVerification, UnsyncedPolicy};
use ouro_notify::MessageTransport;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use crate::error::SupervisorError;
use crate::supervisor::Supervisor;
use crate::watchdog::{spawn_watchdog, WatchdogSettings, DEFAULT_POLL_INTERVAL};

/// Long-poll window requested from the transport.
pub const POLL_TIMEOUT_SECS: u64 = 25;
/// Pause after a failed or empty poll so errors never spin.
const POLL_RETRY_DELAY: Duration = Duration::from_secs(3);
const POLL_IDLE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootReport {
    pub reset_message: String,
    pub workers_spawned: usize,
    pub restored: usize,
    pub resume: RestartVerification,
}

/// Worker command line and environment from the configuration.
pub fn launch_spec(config: &SupervisorConfig) -> LaunchSpec {
    LaunchSpec {
        command: config.workers.command.clone(),
        cwd: config.repo_dir.clone(),
        env: config.worker_env.to_vec(),
        start_method: config.workers.start_method.clone(),
    }
}

/// Brings the supervisor from cold start to ready. Any error here is fatal.
pub fn boot(supervisor: &mut Supervisor) -> Result<BootReport, SupervisorError> {
    supervisor.store.ensure_layout()?;
    let total_budget = supervisor.config.total_budget_usd;
    supervisor
        .store
        .update(|doc| doc.total_budget_usd = total_budget)?;

    supervisor.git.ensure_repo_present()?;
    let reset_message = supervisor
        .git
        .safe_restart("bootstrap", UnsyncedPolicy::RescueAndReset)?;
    tracing::info!(result = %reset_message, "working tree ready");

    supervisor.pool.kill_workers("bootstrap");
    let spawn = supervisor.start_workers();
    for failure in &spawn.failures {
        tracing::warn!(%failure, "worker failed to start at boot");
    }

    let restored = supervisor
        .queue
        .restore_pending_from_snapshot(&supervisor.store, &supervisor.audit);
    supervisor.persist_queue("startup");
    if restored > 0 {
        supervisor.notify_owner(&format!(
            "♻️ Restored pending queue from snapshot: {restored} tasks."
        ));
    }

    let doc = supervisor.store.load();
    let config = &supervisor.config;
    supervisor.audit.record(
        "launcher_start",
        json!({
            "branch": doc.current_branch,
            "sha": doc.current_sha,
            "max_workers": config.workers.max_workers,
            "model_default": config.models.main,
            "model_code": config.models.code,
            "model_light": config.models.light,
            "soft_timeout_sec": config.workers.soft_timeout_secs,
            "hard_timeout_sec": config.workers.hard_timeout_secs,
            "worker_start_method": config.workers.start_method,
            "diag_heartbeat_sec": config.diagnostics.heartbeat_secs,
            "diag_slow_cycle_sec": config.diagnostics.slow_cycle_secs,
        }),
    );

    let resume = supervisor.git.auto_resume_after_restart()?;
    if !resume.ok {
        supervisor.notify_owner(&format!("⚠️ {}", resume.message));
    }

    Ok(BootReport {
        reset_message,
        workers_spawned: spawn.spawned,
        restored,
        resume,
    })
}

/// Threads that feed the event channel. Dropping this stops the poller and
/// watchdog at their next wake-up and closes the signal iterator.
pub struct BackgroundThreads {
    stop: Arc<AtomicBool>,
    signals: Option<Handle>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl BackgroundThreads {
    pub fn start(
        supervisor: &Supervisor,
        transport: Arc<dyn MessageTransport>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<Self, SupervisorError> {
        let mut threads = Self {
            stop: Arc::new(AtomicBool::new(false)),
            signals: None,
            handles: Vec::new(),
        };

        let offset = supervisor.store.load().tg_offset;
        threads.handles.push(spawn_inbound_poller(
            transport,
            offset,
            events.clone(),
            Arc::clone(&threads.stop),
        )?);

        let settings = WatchdogSettings {
            poll_interval: DEFAULT_POLL_INTERVAL,
            soft: Duration::from_secs(supervisor.config.workers.soft_timeout_secs),
            hard: Duration::from_secs(supervisor.config.workers.hard_timeout_secs),
        };
        threads.handles.push(spawn_watchdog(
            supervisor.chat_activity(),
            settings,
            events.clone(),
            Arc::clone(&threads.stop),
        )?);

        let (handle, join) = spawn_signal_listener(events)?;
        threads.signals = Some(handle);
        threads.handles.push(join);
        Ok(threads)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.signals.take() {
            handle.close();
        }
        // The poller may sit in a long poll; it is left to finish on its own.
        self.handles.clear();
    }
}

impl Drop for BackgroundThreads {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Long-polls the transport from `offset` and forwards messages in order.
pub fn spawn_inbound_poller(
    transport: Arc<dyn MessageTransport>,
    mut offset: i64,
    events: mpsc::Sender<SupervisorEvent>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, SupervisorError> {
    thread::Builder::new()
        .name("inbound-poller".to_string())
        .spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match transport.poll(offset, POLL_TIMEOUT_SECS) {
                    Ok(batch) => {
                        offset = batch.next_offset;
                        if batch.messages.is_empty() {
                            thread::sleep(POLL_IDLE_DELAY);
                            continue;
                        }
                        for message in batch.messages {
                            if events.send(SupervisorEvent::Inbound(message)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(transport = transport.name(), error = %err, "inbound poll failed");
                        thread::sleep(POLL_RETRY_DELAY);
                    }
                }
            }
        })
        .map_err(|source| SupervisorError::Thread {
            name: "inbound-poller",
            source,
        })
}

/// SIGINT and SIGTERM become a `Shutdown` event.
fn spawn_signal_listener(
    events: mpsc::Sender<SupervisorEvent>,
) -> Result<(Handle, thread::JoinHandle<()>), SupervisorError> {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(|source| SupervisorError::Signals { source })?;
    let handle = signals.handle();
    let join = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                tracing::warn!(signal, "termination signal received");
                let event = SupervisorEvent::Shutdown {
                    reason: format!("signal {signal}"),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        })
        .map_err(|source| SupervisorError::Thread {
            name: "signals",
            source,
        })?;
    Ok((handle, join))
}
