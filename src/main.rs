use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fleet_loop::config::{SupervisorConfig, WorkerCommand, recovery_command_from_env};
use fleet_loop::control::{self, ControlCommand};
use fleet_loop::items::JsonlWorkItems;
use fleet_loop::launcher::ProcessLauncher;
use fleet_loop::liveness::SignalProbe;
use fleet_loop::records::SessionKey;
use fleet_loop::recovery::{CommandRecovery, RecoveryBridge, TranscriptRecovery};
use fleet_loop::supervisor::{self, Supervisor, SupervisorDeps};

const USAGE: &str = "\
usage: fleet-loop [supervise]
       fleet-loop status
       fleet-loop send <project> <session> <command> [arg]

commands: pause, resume, cancel, skip_ball, change_model <model>";

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None | Some("supervise") => supervise().await,
        Some("status") => {
            init_console_tracing();
            status().await
        }
        Some("send") => {
            init_console_tracing();
            send(&args[1..]).await
        }
        Some("-h" | "--help" | "help") => {
            eprintln!("{USAGE}");
            Ok(())
        }
        Some(other) => {
            eprintln!("{USAGE}");
            bail!("unknown subcommand: {other}")
        }
    }
}

fn init_console_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .init();
}

fn build_deps(config: &SupervisorConfig) -> SupervisorDeps {
    let recovery: Arc<dyn RecoveryBridge> = match recovery_command_from_env() {
        Some(hook) => Arc::new(CommandRecovery::new(hook, config.recovery_timeout)),
        None => Arc::new(TranscriptRecovery::new(config.recovery_timeout)),
    };
    SupervisorDeps {
        launcher: Arc::new(ProcessLauncher::new(
            WorkerCommand::from_env(),
            config.settle_delay,
        )),
        liveness: Arc::new(SignalProbe),
        recovery,
        items: Arc::new(JsonlWorkItems),
    }
}

async fn supervise() -> anyhow::Result<()> {
    let config = SupervisorConfig::from_env().context("invalid supervisor configuration")?;

    // Console plus a daily log file under the fleet home.
    let file_appender = tracing_appender::rolling::daily(config.log_dir(), "supervisor.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("fleet-loop supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Projects: {}", config.projects.len());
    eprintln!(
        "   Poll: every {}m, stall after {}m, max {} workers",
        config.poll_interval.as_secs() / 60,
        config.stall_timeout.as_secs() / 60,
        config.max_concurrent
    );
    eprintln!(
        "   Auto-restart: {}, auto-launch: {}",
        config.auto_restart, config.auto_launch
    );
    if config.projects.is_empty() {
        tracing::warn!("No projects configured (set FLEET_PROJECTS)");
    }

    let deps = build_deps(&config);
    let handle = Supervisor::new(config, deps).start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, finishing current cycle");
    handle.stop().await?;
    Ok(())
}

async fn status() -> anyhow::Result<()> {
    let config = SupervisorConfig::from_env().context("invalid supervisor configuration")?;

    match supervisor::supervisor_status(&config.supervisor_record_path(), &SignalProbe).await? {
        Some(record) => println!(
            "supervisor: running (pid {}, since {})",
            record.pid,
            record.started_at.format("%Y-%m-%d %H:%M UTC")
        ),
        None => println!("supervisor: not running"),
    }

    let deps = build_deps(&config);
    let statuses = Supervisor::new(config, deps).snapshot().await;
    if statuses.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    for s in statuses {
        println!(
            "{:<40} {:<12} pending={} active={} done={} blocked={}  {}",
            s.key.project.display(),
            s.key.session_id,
            s.counts.pending,
            s.counts.in_progress,
            s.counts.complete,
            s.counts.blocked,
            s.status
        );
    }
    Ok(())
}

async fn send(args: &[String]) -> anyhow::Result<()> {
    let [project, session, command, rest @ ..] = args else {
        eprintln!("{USAGE}");
        bail!("send needs <project> <session> <command>");
    };
    let command: ControlCommand = command.parse()?;
    let key = SessionKey::new(PathBuf::from(project), session.clone());
    let record = control::send(&key, command, rest.join(" ")).await?;
    println!("sent {} to {}", record.command, key);
    Ok(())
}
