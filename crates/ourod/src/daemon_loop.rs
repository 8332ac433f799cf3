//! Main loop: block on the event channel with a tick timeout, dispatch one
//! event at a time, run the periodic tick, and log diagnostics.

use chrono::Utc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use ouro_core::{DiagnosticsSettings, SupervisorEvent};

use crate::supervisor::{ExitReason, LoopControl, Supervisor};

pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub tick: Duration,
    pub heartbeat: Option<Duration>,
    pub slow_cycle: Option<Duration>,
}

impl LoopSettings {
    pub fn from_diagnostics(diagnostics: &DiagnosticsSettings) -> Self {
        let positive = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self {
            tick: DEFAULT_TICK,
            heartbeat: positive(diagnostics.heartbeat_secs),
            slow_cycle: positive(diagnostics.slow_cycle_secs),
        }
    }
}

/// Runs until a handler asks to exit or every producer is gone.
pub fn run_loop(
    supervisor: &mut Supervisor,
    events: &mpsc::Receiver<SupervisorEvent>,
    settings: LoopSettings,
) -> ExitReason {
    let mut last_tick = Instant::now();
    let mut last_heartbeat = Instant::now();
    loop {
        let cycle_start = Instant::now();
        let wait = settings.tick.saturating_sub(last_tick.elapsed());
        match events.recv_timeout(wait) {
            Ok(event) => {
                let kind = event.kind_tag();
                if let LoopControl::Exit(reason) = supervisor.handle_event(event) {
                    tracing::info!(?reason, event = kind, "main loop exiting");
                    return reason;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("event channel closed");
                if let LoopControl::Exit(reason) = supervisor.shutdown("event channel closed") {
                    return reason;
                }
            }
        }

        // Ticks run on schedule even while events keep arriving.
        if last_tick.elapsed() >= settings.tick {
            last_tick = Instant::now();
            let report = supervisor.tick(Utc::now());
            if report.assigned + report.hard_timeouts + report.replaced > 0 {
                tracing::info!(
                    assigned = report.assigned,
                    soft_timeouts = report.soft_timeouts,
                    hard_timeouts = report.hard_timeouts,
                    replaced = report.replaced,
                    "tick"
                );
            }
        }

        if let Some(every) = settings.heartbeat {
            if last_heartbeat.elapsed() >= every {
                last_heartbeat = Instant::now();
                log_heartbeat(supervisor);
            }
        }

        if let Some(threshold) = settings.slow_cycle {
            let took = cycle_start.elapsed();
            if took >= threshold {
                tracing::warn!(
                    took_ms = took.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    "slow main loop cycle"
                );
            }
        }
    }
}

/// `--once`: drain whatever is already queued, run one tick, shut down.
pub fn run_once(supervisor: &mut Supervisor, events: &mpsc::Receiver<SupervisorEvent>) -> ExitReason {
    while let Ok(event) = events.try_recv() {
        if let LoopControl::Exit(reason) = supervisor.handle_event(event) {
            return reason;
        }
    }
    let report = supervisor.tick(Utc::now());
    tracing::info!(assigned = report.assigned, "single tick done (--once)");
    log_heartbeat(supervisor);
    match supervisor.shutdown("--once") {
        LoopControl::Exit(reason) => reason,
        LoopControl::Continue => ExitReason::Shutdown {
            reason: "--once".to_string(),
        },
    }
}

fn log_heartbeat(supervisor: &mut Supervisor) {
    let live = supervisor.live_workers();
    let busy = supervisor.workers().iter().filter(|w| w.task.is_some()).count();
    tracing::info!(
        pending = supervisor.queue().pending_len(),
        running = supervisor.queue().running_len(),
        workers = live,
        busy,
        chat_busy = supervisor.chat_busy(),
        spent_usd = supervisor.ledger().spent(),
        "heartbeat"
    );
}
