//! The single always-on conversational agent. Owner messages that are not
//! commands become turns for this process. It is created lazily and
//! discarded on a hard stall or when it exits.

use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Instant;

use ouro_agents::{SupervisorCommand, WorkerLauncher, WorkerProcess};
use ouro_core::{ChatId, SupervisorEvent, WorkerRef, WorkerRole};

use crate::error::PoolError;

/// Shared with the watchdog thread.
#[derive(Debug, Clone)]
pub struct ChatActivity {
    pub busy: bool,
    pub turn_started: Option<Instant>,
    pub last_progress: Instant,
    /// Incremented per turn; stall warnings are tracked per episode.
    pub episode: u64,
}

impl Default for ChatActivity {
    fn default() -> Self {
        Self {
            busy: false,
            turn_started: None,
            last_progress: Instant::now(),
            episode: 0,
        }
    }
}

pub type SharedActivity = Arc<Mutex<ChatActivity>>;

pub fn lock_activity(activity: &SharedActivity) -> MutexGuard<'_, ChatActivity> {
    match activity.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct DirectChat {
    launcher: Arc<dyn WorkerLauncher>,
    events: mpsc::Sender<SupervisorEvent>,
    process: Option<WorkerProcess>,
    generation: u64,
    activity: SharedActivity,
}

impl DirectChat {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, events: mpsc::Sender<SupervisorEvent>) -> Self {
        Self {
            launcher,
            events,
            process: None,
            generation: 0,
            activity: Arc::new(Mutex::new(ChatActivity::default())),
        }
    }

    pub fn activity(&self) -> SharedActivity {
        Arc::clone(&self.activity)
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn is_busy(&self) -> bool {
        lock_activity(&self.activity).busy
    }

    pub fn episode(&self) -> u64 {
        lock_activity(&self.activity).episode
    }

    pub fn is_current(&self, who: WorkerRef) -> bool {
        who.role == WorkerRole::Direct && self.process.is_some() && who.generation == self.generation
    }

    /// Sends one owner message as a new turn, starting the agent if needed.
    pub fn start_turn(&mut self, chat_id: ChatId, text: &str) -> Result<(), PoolError> {
        self.ensure_started()?;
        let Some(process) = self.process.as_ref() else {
            return Err(PoolError::NoWorker { slot: 0 });
        };
        let command = SupervisorCommand::OwnerMessage {
            chat_id,
            text: text.to_string(),
        };
        if let Err(source) = process.send(&command) {
            self.discard("owner message not delivered");
            return Err(PoolError::Deliver {
                worker: WorkerRole::Direct.to_string(),
                command: command.kind_tag(),
                source,
            });
        }
        let mut activity = lock_activity(&self.activity);
        let now = Instant::now();
        activity.busy = true;
        activity.turn_started = Some(now);
        activity.last_progress = now;
        activity.episode += 1;
        Ok(())
    }

    pub fn record_progress(&self) {
        lock_activity(&self.activity).last_progress = Instant::now();
    }

    pub fn finish_turn(&self) {
        let mut activity = lock_activity(&self.activity);
        activity.busy = false;
        activity.turn_started = None;
    }

    /// Kills the agent. The next owner message starts a fresh one.
    pub fn discard(&mut self, reason: &str) {
        if let Some(mut process) = self.process.take() {
            tracing::warn!(generation = self.generation, pid = process.pid, %reason, "direct chat agent discarded");
            process.kill();
        }
        self.finish_turn();
    }

    fn ensure_started(&mut self) -> Result<(), PoolError> {
        if let Some(process) = self.process.as_mut() {
            if process.is_alive() {
                return Ok(());
            }
            self.discard("agent found dead");
        }
        self.generation += 1;
        let who = WorkerRef {
            role: WorkerRole::Direct,
            generation: self.generation,
        };
        let process = self
            .launcher
            .launch(who, self.events.clone())
            .map_err(|source| PoolError::Launch {
                worker: who.role.to_string(),
                source,
            })?;
        self.process = Some(process);
        Ok(())
    }
}
