use clap::Parser;
use listwalk::testing::SimulatedApp;
use listwalk::{Campaign, CheckpointStore, Config, FileCheckpointStore, InteractionGate, NoopExecutor};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "listwalk")]
#[command(about = "Resumable list extraction campaigns")]
#[command(version)]
struct Cli {
    /// Campaign config file
    config: PathBuf,

    /// Validate config without running
    #[arg(long)]
    check: bool,

    /// Show checkpoint progress and recorded interactions
    #[arg(long)]
    status: bool,

    /// Run against the built-in simulator with N followers per target
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> listwalk::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Config valid: {}", config.name);
        println!("  Account: {}", config.account);
        println!("  Targets: {}", config.targets.len());
        for target in &config.targets {
            println!("    - {}", target);
        }
        if !config.interactions.is_empty() {
            let kinds: Vec<&str> = config.interactions.iter().map(|k| k.as_str()).collect();
            println!("  Interactions: {}", kinds.join(", "));
        }
        println!("  Global cap: {}", config.limits.global_cap);
        if let Some(cap) = config.limits.per_target_cap {
            println!("  Per-target cap: {}", cap);
        }
        println!(
            "  Retries: {} per step, {} restarts per target",
            config.limits.step_attempts, config.limits.recovery_attempts
        );
        println!("  Dismiss strategies: {}", config.app.dismiss.len());
        return Ok(());
    }

    if cli.status {
        return print_status(&config).await;
    }

    let Some(per_target) = cli.simulate else {
        eprintln!("No device backend is built in. Use --check, --status or --simulate <N>.");
        std::process::exit(2);
    };

    println!("Running: {} (simulated)", config.name);

    let mut app = SimulatedApp::new();
    for target in &config.targets {
        app = app.with_generated_target(target, per_target);
    }
    let mut campaign = Campaign::from_config(config, Box::new(app), Box::new(NoopExecutor))?;

    let token = campaign.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let report = campaign.run().await?;

    println!();
    println!("Stopped: {:?}", report.stop_reason);
    for target in &report.targets {
        println!(
            "  {:<24} {:<10} +{} ({} total)",
            target.target_id,
            format!("{:?}", target.status).to_lowercase(),
            target.accepted,
            target.seen_total
        );
    }
    println!("  Accepted: {}", report.accepted.len());
    println!(
        "  Interactions: {} ({} skipped)",
        report.interactions, report.skipped_interactions
    );
    println!("  Duration: {}ms", report.duration_ms);
    for failure in &report.failures {
        println!("  ✗ {}: {}", failure.target_id, failure.reason);
    }

    if !report.failures.is_empty() {
        std::process::exit(1);
    }

    Ok(())
}

async fn print_status(config: &Config) -> listwalk::Result<()> {
    let store = FileCheckpointStore::new(&config.storage.checkpoint_dir, &config.name)?;
    println!("Campaign: {}", config.name);
    for target in &config.targets {
        match store.load(target)? {
            Some(cp) => {
                let status = if cp.is_exhausted() { "exhausted" } else { "active" };
                let estimate = cp
                    .estimated_total
                    .map(|t| format!(" of ~{}", t))
                    .unwrap_or_default();
                println!(
                    "  {:<24} {:<10} {}{} (updated {})",
                    target,
                    status,
                    cp.seen_count,
                    estimate,
                    cp.last_updated.format("%Y-%m-%d %H:%M")
                );
            }
            None => println!("  {:<24} pending", target),
        }
    }

    let gate = InteractionGate::open(&config.storage.interactions_db)?;
    println!(
        "Interactions recorded for {}: {}",
        config.account,
        gate.count(&config.account).await?
    );
    Ok(())
}
