// btrmind
// Storage-health daemon and one-shot maintenance commands

use anyhow::{Context, Result};
use btrmind::{Config, ControlLoop, InstanceLock, StatusReport, DEFAULT_CONFIG_PATH};
use btrmind_agent::PolicyStore;
use btrmind_core::{Action, ExecutionErrorKind, PersistenceError};
use btrmind_fs::{Executor, SafetyGuard, StatProvider, TelemetrySampler};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "btrmind")]
#[command(about = "Autonomous storage-health control loop", version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Simulate actions without touching the filesystem
    #[arg(long)]
    dry_run: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control loop (default)
    Run,

    /// Sample once and report utilization against the thresholds
    Analyze,

    /// Run cleanup actions once under the safety guard
    Cleanup {
        /// Also compress cold files and rebalance metadata
        #[arg(long)]
        aggressive: bool,

        /// Run even though the last daemon status reports an escalation
        #[arg(long)]
        force: bool,
    },

    /// Show what the daemon has learned
    Stats,

    /// Validate and print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if cli.dry_run {
        config.dry_run = true;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Analyze => analyze(&config).await,
        Commands::Cleanup { aggressive, force } => cleanup(&config, aggressive, force).await,
        Commands::Stats => stats(&config).await,
        Commands::Config => show_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn stat_provider(config: &Config) -> Result<Arc<dyn StatProvider>> {
    let provider = config.stat_provider().context("building the statistics provider")?;
    Ok(Arc::new(provider))
}

fn instance_lock(config: &Config) -> Result<InstanceLock> {
    let path = InstanceLock::path_for(&config.learning.model_path);
    InstanceLock::acquire(&path).context("another btrmind process is managing this volume")
}

async fn run(config: Config) -> Result<()> {
    let _lock = instance_lock(&config)?;
    let control = ControlLoop::new(&config, stat_provider(&config)?)
        .await
        .context("refusing to start")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(control.guard(), shutdown_tx)?;
    control.run(shutdown_rx).await;
    info!("btrmind stopped");
    Ok(())
}

#[cfg(unix)]
fn spawn_signal_handler(guard: Arc<SafetyGuard>, shutdown: watch::Sender<bool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP; resetting safety guard");
                    guard.reset().await;
                }
            }
        }
        shutdown.send_replace(true);
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(_guard: Arc<SafetyGuard>, shutdown: watch::Sender<bool>) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
        }
        shutdown.send_replace(true);
    });
    Ok(())
}

async fn analyze(config: &Config) -> Result<()> {
    let mut sampler = TelemetrySampler::new(stat_provider(config)?, config.sampler());
    let snapshot = sampler
        .sample()
        .await
        .with_context(|| format!("sampling {}", config.monitoring.target_path.display()))?;
    let level = config.thresholds.level(snapshot.utilization_pct());

    println!("Filesystem: {}", config.monitoring.target_path.display());
    println!("  Utilization:        {:.1}% ({})", snapshot.utilization_pct(), level.name());
    println!("  Free:               {} bytes", snapshot.free_bytes());
    println!("  Metadata overhead:  {:.1}%", snapshot.metadata_overhead_pct());
    println!("  Fragmentation:      {:.1}%", snapshot.fragmentation_pct());
    if let Some(files) = snapshot.files() {
        let partial = if files.truncated { " (partial walk)" } else { "" };
        println!(
            "  Files:              {} averaging {:.0} bytes, {} written recently{partial}",
            files.file_count,
            files.avg_file_size_bytes(),
            files.recent_writes
        );
    }
    println!(
        "  Thresholds:         warning {:.0}% / critical {:.0}% / emergency {:.0}%",
        config.thresholds.warning, config.thresholds.critical, config.thresholds.emergency
    );

    println!("Actions:");
    let executor = Executor::new(config.executor());
    for action in Action::ALL.into_iter().filter(|a| a.is_mutating()) {
        if !executor.enabled().allows(action) {
            println!("  {:<20} disabled", action.name());
            continue;
        }
        match executor.plan(action).await {
            Ok(Some(plan)) => println!("  {:<20} {}", action.name(), plan.summary()),
            Ok(None) => {}
            Err(e) => println!("  {:<20} unavailable: {e}", action.name()),
        }
    }
    Ok(())
}

async fn cleanup(config: &Config, aggressive: bool, force: bool) -> Result<()> {
    let _lock = instance_lock(config)?;
    let model_path = &config.learning.model_path;
    let escalation = StatusReport::recorded_escalation(model_path)
        .await
        .with_context(|| format!("reading the daemon status for {}", model_path.display()))?;
    if let Some(cause) = escalation {
        let cause = format!(
            "{} failed {} times, last at {}: {}",
            cause.action,
            cause.failures,
            cause.at.to_rfc3339(),
            cause.last_error
        );
        if !force {
            anyhow::bail!(
                "the safety guard is escalated ({cause}); fix the cause, then rerun with --force"
            );
        }
        info!(%cause, "Escalation overridden with --force");
    }

    let actions: &[Action] = if aggressive {
        &[
            Action::DeleteTemporary,
            Action::CompressInactive,
            Action::RebalanceMetadata,
            Action::PruneSnapshots,
        ]
    } else {
        &[Action::DeleteTemporary, Action::PruneSnapshots]
    };

    let guard = SafetyGuard::new(Executor::new(config.executor()), config.safety());
    let mut attempted = 0;
    let mut failed = 0;
    for &action in actions {
        match guard.execute(action, config.dry_run).await {
            Ok(result) => {
                attempted += 1;
                let mode = if result.dry_run { " (dry run)" } else { "" };
                println!(
                    "{:<20} ok{mode}: {} bytes reclaimed in {:.1}s {}",
                    action.name(),
                    result.bytes_reclaimed,
                    result.duration.as_secs_f64(),
                    result.message
                );
            }
            Err(e) if e.kind() == ExecutionErrorKind::Disabled => {
                println!("{:<20} skipped: disabled", action.name());
            }
            Err(e) => {
                attempted += 1;
                failed += 1;
                println!("{:<20} failed: {e}", action.name());
            }
        }
    }
    if attempted > 0 && failed == attempted {
        anyhow::bail!("every cleanup action failed");
    }
    Ok(())
}

async fn stats(config: &Config) -> Result<()> {
    let model_path = &config.learning.model_path;
    let store = PolicyStore::new(model_path);
    let policy = match store.load().await {
        Ok(policy) => policy,
        Err(PersistenceError::Missing(_)) => {
            println!("No persisted policy at {}", model_path.display());
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("reading {}", model_path.display()));
        }
    };

    println!("Policy: {}", model_path.display());
    println!("  Version:         {}", policy.version());
    println!("  Training steps:  {}", policy.training_steps());
    println!("  Exploration:     {:.4}", policy.epsilon());
    println!("  Parameters:      {}", policy.network().parameter_count());

    print_status(&StatusReport::path_for(model_path)).await?;

    let mut sampler = TelemetrySampler::new(stat_provider(config)?, config.sampler());
    match sampler.sample().await {
        Ok(snapshot) => {
            let q = policy.q_values(&snapshot);
            let greedy = policy.greedy(&snapshot, &config.actions.enabled());
            println!("Estimated returns at {:.1}% utilization:", snapshot.utilization_pct());
            for action in Action::ALL {
                let marker = if action == greedy { "*" } else { " " };
                println!("  {marker} {:<20} {:>10.3}", action.name(), q[action.index()]);
            }
        }
        Err(e) => println!("Current state unavailable: {e}"),
    }
    Ok(())
}

async fn print_status(path: &Path) -> Result<()> {
    let report = match StatusReport::read(path).await {
        Ok(report) => report,
        Err(PersistenceError::Missing(_)) => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let learning = &report.learning;
    println!("Daemon run {} ({} cycles, {})", report.run_id, report.cycles, report.loop_state);
    println!("  Written:         {}", report.written_at.to_rfc3339());
    println!(
        "  Decisions:       {} ({} exploratory)",
        learning.decisions, learning.explorations
    );
    println!("  Skipped steps:   {}", learning.skipped_steps);
    println!("  Replay buffer:   {}", learning.buffer_size);
    println!("  Average reward:  {:.3}", learning.average_reward);
    if let Some(loss) = learning.mean_loss {
        println!("  Mean loss:       {loss:.5}");
    }
    for summary in &report.knowledge.actions {
        println!(
            "  {:<20} selected {:>6}  mean reward {:>8.3}  mean Q {:>8.3}",
            summary.action.name(),
            summary.selections,
            summary.mean_reward,
            summary.mean_q
        );
    }
    match &report.guard.escalation {
        Some(cause) => println!(
            "Safety guard: ESCALATED by {} after {} failures at {} ({})",
            cause.action,
            cause.failures,
            cause.at.to_rfc3339(),
            cause.last_error
        ),
        None => println!("Safety guard: normal"),
    }
    for action in &report.guard.actions {
        println!(
            "  {:<20} failures {}  cool-down {}s",
            action.action.name(),
            action.consecutive_failures,
            action.cooldown_remaining_secs
        );
    }
    Ok(())
}

fn show_config(config: &Config) -> Result<()> {
    let text = config.to_toml_string().context("rendering configuration")?;
    println!("# configuration is valid");
    print!("{text}");
    Ok(())
}
