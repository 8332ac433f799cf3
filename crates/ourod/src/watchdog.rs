//! Stall detection for the direct chat agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use ouro_core::{StallLevel, SupervisorEvent};

use crate::direct_chat::{lock_activity, ChatActivity, SharedActivity};
use crate::error::SupervisorError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub poll_interval: Duration,
    pub soft: Duration,
    pub hard: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallVerdict {
    pub level: StallLevel,
    /// Turn the verdict belongs to.
    pub episode: u64,
    pub idle: Duration,
    pub total: Duration,
}

/// Remembers which episodes have already been reported.
#[derive(Debug, Default)]
pub struct StallTracker {
    soft_warned: Option<u64>,
    hard_reported: Option<u64>,
}

impl StallTracker {
    pub fn evaluate(
        &mut self,
        activity: &ChatActivity,
        now: Instant,
        settings: &WatchdogSettings,
    ) -> Option<StallVerdict> {
        if !activity.busy {
            self.soft_warned = None;
            self.hard_reported = None;
            return None;
        }
        let idle = now.saturating_duration_since(activity.last_progress);
        let total = activity
            .turn_started
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or(idle);
        let episode = Some(activity.episode);

        if idle >= settings.hard {
            if self.hard_reported == episode {
                return None;
            }
            self.hard_reported = episode;
            return Some(StallVerdict {
                level: StallLevel::Hard,
                episode: activity.episode,
                idle,
                total,
            });
        }
        if idle >= settings.soft && self.soft_warned != episode {
            self.soft_warned = episode;
            return Some(StallVerdict {
                level: StallLevel::Soft,
                episode: activity.episode,
                idle,
                total,
            });
        }
        None
    }
}

/// Polls the shared activity and pushes `ChatStalled` events. Exits when
/// `stop` is set or the event channel closes.
pub fn spawn_watchdog(
    activity: SharedActivity,
    settings: WatchdogSettings,
    events: mpsc::Sender<SupervisorEvent>,
    stop: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, SupervisorError> {
    thread::Builder::new()
        .name("chat-watchdog".to_string())
        .spawn(move || {
            let mut tracker = StallTracker::default();
            let step = settings.poll_interval.min(Duration::from_millis(500));
            let mut next_check = Instant::now() + settings.poll_interval;
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(step);
                let now = Instant::now();
                if now < next_check {
                    continue;
                }
                next_check = now + settings.poll_interval;
                let snapshot = lock_activity(&activity).clone();
                let Some(verdict) = tracker.evaluate(&snapshot, now, &settings) else {
                    continue;
                };
                tracing::warn!(level = ?verdict.level, idle_secs = verdict.idle.as_secs(), "direct chat stalled");
                let event = SupervisorEvent::ChatStalled {
                    level: verdict.level,
                    episode: verdict.episode,
                    idle_secs: verdict.idle.as_secs(),
                    total_secs: verdict.total.as_secs(),
                };
                if events.send(event).is_err() {
                    return;
                }
            }
        })
        .map_err(|source| SupervisorError::Thread {
            name: "chat-watchdog",
            source,
        })
}
