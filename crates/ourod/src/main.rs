use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use ouro_agents::ProcessLauncher;
use ouro_core::{Settings, SupervisorConfig};
use ouro_notify::{MessageTransport, TelegramTransport};
use ourod::logging::init_logging;
use ourod::{boot, launch_spec, run_loop, run_once, BackgroundThreads, LoopSettings, Supervisor};

/// Supervisor for the self-modifying Ouroboros agent.
#[derive(Debug, Parser)]
#[command(name = "ouroboros", version)]
struct Args {
    /// TOML file with a `[settings]` table; environment variables win.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Boot, run a single tick, then exit.
    #[arg(long)]
    once: bool,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("ouroboros startup failed: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<i32> {
    let args = Args::parse();
    init_logging(args.log_json);

    let mut settings = Settings::from_env();
    if let Some(path) = &args.config {
        settings
            .overlay_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?;
    }
    let config = SupervisorConfig::from_settings(&settings).context("invalid configuration")?;
    tracing::info!(
        drive = %config.drive.root.display(),
        repo = %config.repo_dir.display(),
        remote = %config.git.remote_url.redacted(),
        max_workers = config.workers.max_workers,
        "configuration loaded"
    );

    let transport: Arc<dyn MessageTransport> =
        Arc::new(TelegramTransport::new(config.telegram_bot_token.expose()));
    let launcher = Arc::new(ProcessLauncher::new(launch_spec(&config)));
    let loop_settings = LoopSettings::from_diagnostics(&config.diagnostics);
    let (tx, rx) = mpsc::channel();

    let mut supervisor = Supervisor::new(config, Arc::clone(&transport), launcher, tx.clone());
    let report = boot(&mut supervisor).context("bootstrap failed")?;
    tracing::info!(
        reset = %report.reset_message,
        workers = report.workers_spawned,
        restored = report.restored,
        resume_ok = report.resume.ok,
        "supervisor ready"
    );

    if args.once {
        let reason = run_once(&mut supervisor, &rx);
        return Ok(reason.exit_code());
    }

    let mut threads = BackgroundThreads::start(&supervisor, transport, tx)
        .context("starting background threads")?;
    let reason = run_loop(&mut supervisor, &rx, loop_settings);
    threads.stop();
    tracing::info!(?reason, code = reason.exit_code(), "supervisor stopped");
    Ok(reason.exit_code())
}
