//! Worker processes: spawn with piped stdio, pump lines into the event
//! channel, write commands through a dedicated stdin thread.

use chrono::{DateTime, Utc};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use ouro_core::{SupervisorEvent, WorkerRef, WorkerRole};

use crate::error::AgentError;
use crate::protocol::{parse_worker_line, SupervisorCommand};

/// How to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Recorded on the handle and passed to the worker; not interpreted here.
    pub start_method: String,
}

/// Seam between the pool and the OS so tests can swap in other commands.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        who: WorkerRef,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<WorkerProcess, AgentError>;
}

#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub spec: LaunchSpec,
}

impl ProcessLauncher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self { spec }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        who: WorkerRef,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> Result<WorkerProcess, AgentError> {
        let (program, args) = self
            .spec
            .command
            .split_first()
            .ok_or(AgentError::EmptyCommand)?;
        let rendered = self.spec.command.join(" ");

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.spec.cwd)
            .envs(self.spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("OUROBOROS_WORKER_ID", who.role.to_string())
            .env("OUROBOROS_WORKER_GENERATION", who.generation.to_string())
            .env("OUROBOROS_WORKER_START_METHOD", &self.spec.start_method)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let WorkerRole::Pool { slot } = who.role {
            command.env("OUROBOROS_WORKER_SLOT", slot.to_string());
        }

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            command: rendered,
            source,
        })?;
        let pid = child.id();

        pump_worker_output(&mut child, who, events);
        let (stdin_tx, stdin_open) = spawn_stdin_writer(&mut child);

        tracing::info!(worker = %who.role, generation = who.generation, pid, "worker spawned");
        Ok(WorkerProcess {
            who,
            pid,
            child,
            stdin_tx,
            stdin_open,
            spawned_at: Utc::now(),
            start_method: self.spec.start_method.clone(),
        })
    }
}

/// Stdout lines become protocol events; EOF becomes `WorkerExited`.
/// Stderr lines are diagnostics only.
fn pump_worker_output(child: &mut Child, who: WorkerRef, events: mpsc::Sender<SupervisorEvent>) {
    if let Some(stdout) = child.stdout.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines().map_while(Result::ok) {
                if line.trim().is_empty() {
                    continue;
                }
                let message = parse_worker_line(&line);
                if events.send(SupervisorEvent::worker(who, message)).is_err() {
                    return;
                }
            }
            let _ = events.send(SupervisorEvent::WorkerExited { from: who });
        });
    }

    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                tracing::debug!(worker = %who.role, generation = who.generation, "{line}");
            }
        });
    }
}

fn spawn_stdin_writer(child: &mut Child) -> (Option<mpsc::Sender<String>>, Arc<AtomicBool>) {
    let open = Arc::new(AtomicBool::new(false));
    let Some(mut stdin) = child.stdin.take() else {
        return (None, open);
    };
    open.store(true, Ordering::SeqCst);
    let (tx, rx) = mpsc::channel::<String>();
    let flag = Arc::clone(&open);
    thread::spawn(move || {
        while let Ok(line) = rx.recv() {
            if writeln!(stdin, "{line}").is_err() || stdin.flush().is_err() {
                break;
            }
        }
        flag.store(false, Ordering::SeqCst);
    });
    (Some(tx), open)
}

/// Handle to one worker process incarnation.
pub struct WorkerProcess {
    pub who: WorkerRef,
    pub pid: u32,
    child: Child,
    stdin_tx: Option<mpsc::Sender<String>>,
    stdin_open: Arc<AtomicBool>,
    pub spawned_at: DateTime<Utc>,
    pub start_method: String,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("who", &self.who)
            .field("pid", &self.pid)
            .field("spawned_at", &self.spawned_at)
            .field("start_method", &self.start_method)
            .finish_non_exhaustive()
    }
}

impl WorkerProcess {
    pub fn send(&self, command: &SupervisorCommand) -> Result<(), AgentError> {
        let line = command.encode()?;
        let closed = || AgentError::ChannelClosed {
            worker: self.who.role.to_string(),
        };
        if !self.stdin_open.load(Ordering::SeqCst) {
            return Err(closed());
        }
        self.stdin_tx
            .as_ref()
            .ok_or_else(closed)?
            .send(line)
            .map_err(|_| closed())
    }

    /// Polling liveness: process still running and its stdin writer alive.
    pub fn is_alive(&mut self) -> bool {
        let running = matches!(self.child.try_wait(), Ok(None));
        running && self.stdin_open.load(Ordering::SeqCst)
    }

    /// Exit code if the process has already exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }

    /// Kill and reap. Safe to call more than once.
    pub fn kill(&mut self) {
        self.stdin_tx = None;
        if matches!(self.child.try_wait(), Ok(None)) {
            if let Err(err) = self.child.kill() {
                tracing::debug!(worker = %self.who.role, error = %err, "kill failed");
            }
        }
        let _ = self.child.wait();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ouro_core::WorkerMessage;
    use std::time::Duration;

    fn launcher(script: &str) -> ProcessLauncher {
        ProcessLauncher::new(LaunchSpec {
            command: vec!["sh".into(), "-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: vec![("OUROBOROS_TEST".into(), "1".into())],
            start_method: "spawn".into(),
        })
    }

    fn who() -> WorkerRef {
        WorkerRef {
            role: WorkerRole::Pool { slot: 0 },
            generation: 1,
        }
    }

    #[test]
    fn stdout_lines_become_events_then_exit() {
        let (tx, rx) = mpsc::channel();
        let _worker = launcher(r#"echo '{"type":"ready"}'; echo "slot=$OUROBOROS_WORKER_SLOT""#)
            .launch(who(), tx)
            .expect("launch");

        let first = rx.recv_timeout(Duration::from_secs(5)).expect("ready event");
        assert!(matches!(
            first,
            SupervisorEvent::Worker { message: WorkerMessage::Ready, .. }
        ));
        let second = rx.recv_timeout(Duration::from_secs(5)).expect("output event");
        match second {
            SupervisorEvent::Worker {
                message: WorkerMessage::Output { line },
                from,
                ..
            } => {
                assert_eq!(line, "slot=0");
                assert_eq!(from, who());
            }
            other => panic!("unexpected {other:?}"),
        }
        let third = rx.recv_timeout(Duration::from_secs(5)).expect("exit event");
        assert_eq!(third, SupervisorEvent::WorkerExited { from: who() });
    }

    #[test]
    fn commands_reach_worker_stdin() {
        let (tx, rx) = mpsc::channel();
        let worker = launcher("read line; echo \"got:$line\"")
            .launch(who(), tx)
            .expect("launch");
        worker
            .send(&SupervisorCommand::Shutdown)
            .expect("send shutdown");
        let event = rx.recv_timeout(Duration::from_secs(5)).expect("echo");
        match event {
            SupervisorEvent::Worker {
                message: WorkerMessage::Output { line },
                ..
            } => assert_eq!(line, r#"got:{"type":"shutdown"}"#),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn kill_reaps_and_liveness_reflects_it() {
        let (tx, _rx) = mpsc::channel();
        let mut worker = launcher("sleep 60").launch(who(), tx).expect("launch");
        assert!(worker.is_alive());
        worker.kill();
        assert!(!worker.is_alive());
        worker.kill();
    }

    #[test]
    fn exited_worker_is_not_alive() {
        let (tx, rx) = mpsc::channel();
        let mut worker = launcher("exit 3").launch(who(), tx).expect("launch");
        let _ = rx.recv_timeout(Duration::from_secs(5));
        let mut code = None;
        for _ in 0..50 {
            code = worker.exit_code();
            if code.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(code, Some(3));
        assert!(!worker.is_alive());
    }

    #[test]
    fn empty_command_is_rejected() {
        let (tx, _rx) = mpsc::channel();
        let launcher = ProcessLauncher::new(LaunchSpec {
            command: vec![],
            cwd: std::env::temp_dir(),
            env: vec![],
            start_method: "spawn".into(),
        });
        assert!(matches!(
            launcher.launch(who(), tx),
            Err(AgentError::EmptyCommand)
        ));
    }
}
