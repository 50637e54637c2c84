//! Gas Exposure Analytics CLI
//!
//! Periodic exposure evaluation for firefighter wearables.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use gas_exposure_analytics::{
    config::Config,
    core::{DecisionRecord, FirefighterStatus, LimitRegistry, LimitTable},
    health::HealthMonitor,
    scheduler::Scheduler,
    store::{MemoryStore, ReadingStore, SharedStore, TimeoutStore},
    Engine, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "exposure-analytics")]
#[command(version = VERSION)]
#[command(about = "Windowed gas exposure evaluation for firefighters", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate on every tick interval until interrupted
    Run,

    /// Run a single tick and print its summary
    Tick {
        /// Evaluation time (RFC 3339); defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Show a firefighter's current exposure status
    Status {
        firefighter: String,

        /// Show every decision written at this tick (RFC 3339) instead
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Validate the configuration and limit table
    Validate,

    /// Show engine health counters
    Health,

    /// Export decision records
    Export {
        /// Output directory
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Export format
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Only export decisions for this firefighter
        #[arg(long)]
        firefighter: Option<String>,
    },

    /// Show configuration and the active limit table
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Json,
    Jsonl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    match cli.command {
        Commands::Run => cmd_run(config).await,
        Commands::Tick { at } => cmd_tick(config, at).await,
        Commands::Status { firefighter, at } => cmd_status(config, &firefighter, at).await,
        Commands::Validate => cmd_validate(&config).await,
        Commands::Health => cmd_health(&config).await,
        Commands::Export {
            output,
            format,
            firefighter,
        } => cmd_export(&config, output, format, firefighter.as_deref()).await,
        Commands::Config => cmd_config(&config),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gas_exposure_analytics=info,exposure_analytics=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Everything a running engine needs, built from the configuration.
struct Runtime {
    engine: Arc<Engine>,
    store: Arc<MemoryStore>,
    health: Arc<HealthMonitor>,
}

impl Runtime {
    async fn build(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let limits = LimitRegistry::from_file(&config.limits_path)
            .with_context(|| format!("loading limits from {}", config.limits_path.display()))?;
        let store = Arc::new(
            MemoryStore::load(&config.store_path, config.default_region.clone())
                .with_context(|| format!("loading store from {}", config.store_path.display()))?,
        );
        let regions = assigned_regions(&config, &store).await;
        limits
            .require_regions(regions)
            .context("limit table does not cover every assigned region")?;
        let health = Arc::new(HealthMonitor::with_persistence(health_path(&config)));

        let bounded: SharedStore = Arc::new(TimeoutStore::new(
            Arc::clone(&store) as SharedStore,
            config.store_timeout,
        ));
        let engine = Arc::new(Engine::new(
            bounded,
            Arc::new(limits),
            config,
            Arc::clone(&health),
        ));

        Ok(Self {
            engine,
            store,
            health,
        })
    }

    /// Pick up new readings from the store file and write decisions back.
    async fn persist(&self) {
        let config = self.engine.config();
        if let Err(e) = self.store.sync(&config.store_path).await {
            tracing::warn!(error = %e, "Could not sync store snapshot");
        }
        if let Err(e) = self.health.save() {
            tracing::warn!(error = %e, "Could not save health counters");
        }
    }
}

/// The default region plus every region assigned in the store.
async fn assigned_regions(config: &Config, store: &MemoryStore) -> Vec<String> {
    std::iter::once(config.default_region.clone())
        .chain(store.regions().await)
        .collect()
}

fn health_path(config: &Config) -> PathBuf {
    config.data_path.join("health.json")
}

async fn cmd_run(config: Config) -> Result<()> {
    config
        .ensure_directories()
        .context("creating data directories")?;
    let runtime = Runtime::build(config).await?;
    let limits_path = runtime.engine.config().limits_path.clone();

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        handler_token.cancel();
    })
    .context("installing Ctrl+C handler")?;

    tracing::info!(
        instance = %runtime.health.instance_id(),
        limits_version = %runtime.engine.limits().version(),
        "Exposure analytics started"
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(Arc::clone(&runtime.engine)).with_summaries(tx);
    let driver = tokio::spawn(async move { scheduler.run(cancel).await });

    let mut limits_modified = modified_time(&limits_path);
    while let Some(summary) = rx.recv().await {
        if !summary.exceeded_keys.is_empty() {
            tracing::warn!(
                tick = %summary.tick,
                exceeded = summary.exceeded_keys.len(),
                "Firefighters above exposure limits"
            );
        }
        runtime.persist().await;
        let regions = assigned_regions(runtime.engine.config(), &runtime.store).await;
        if let Err(e) = runtime.engine.limits().require_regions(regions) {
            tracing::error!(error = %e, "Firefighters assigned to a region without limits");
        }

        // Reload between ticks when the limits file changes.
        let modified = modified_time(&limits_path);
        if modified != limits_modified {
            limits_modified = modified;
            if let Err(e) = runtime.engine.limits().reload(&limits_path) {
                tracing::error!(error = %e, "Limit reload rejected, keeping current table");
            }
        }
    }

    let stats = driver.await.context("scheduler task failed")?;
    runtime.persist().await;
    println!("{}", runtime.health.summary());
    println!(
        "Ticks: {} started, {} finished, {} abandoned",
        stats.ticks_started, stats.ticks_finished, stats.ticks_abandoned
    );
    Ok(())
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

async fn cmd_tick(config: Config, at: Option<DateTime<Utc>>) -> Result<()> {
    config
        .ensure_directories()
        .context("creating data directories")?;
    let runtime = Runtime::build(config).await?;

    let summary = runtime.engine.run_tick(at.unwrap_or_else(Utc::now)).await;
    runtime.persist().await;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.error_count > 0 {
        bail!("{} firefighter(s) failed evaluation", summary.error_count);
    }
    Ok(())
}

async fn cmd_status(config: Config, firefighter: &str, at: Option<DateTime<Utc>>) -> Result<()> {
    let runtime = Runtime::build(config).await?;

    let status = match at {
        Some(tick) => {
            let decisions = runtime.engine.decisions_at(firefighter, tick).await?;
            if decisions.is_empty() {
                println!("No decisions for {firefighter} at {tick}");
                return Ok(());
            }
            FirefighterStatus::from_decisions(
                firefighter,
                decisions,
                runtime.engine.config().yellow_warning_percent,
            )
        }
        None => runtime.engine.firefighter_status(firefighter).await?,
    };
    print_status(&status);
    Ok(())
}

fn print_status(status: &FirefighterStatus) {
    println!("Firefighter {}", status.firefighter_id);
    println!("============{}", "=".repeat(status.firefighter_id.len()));
    println!();
    match status.as_of {
        Some(as_of) => println!("As of:       {as_of}"),
        None => println!("As of:       no decisions recorded"),
    }
    println!("Level:       {:?}", status.level);
    println!("Exceeding:   {}", if status.exceeding { "YES" } else { "no" });
    if let Some(gauge) = status.max_gauge_percent {
        println!("Max gauge:   {gauge:.0}%");
    }
    println!();
    print_decisions(&status.decisions);
}

fn print_decisions(decisions: &[DecisionRecord]) {
    println!(
        "{:<20} {:<10} {:>10} {:>10} {:>7}  STATUS",
        "GAS", "WINDOW", "VALUE", "LIMIT", "GAUGE"
    );
    for d in decisions {
        let value = match (d.value, d.range_exceeded) {
            (_, true) => "RANGE".to_string(),
            (Some(v), false) => format!("{v:.2}"),
            (None, false) => "-".to_string(),
        };
        let gauge = d
            .gauge_percent
            .map(|g| format!("{g:.0}%"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<10} {:>10} {:>10.2} {:>7}  {}",
            d.gas, d.window, value, d.limit, gauge, d.status
        );
    }
}

async fn cmd_validate(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let table = LimitTable::from_file(&config.limits_path)
        .with_context(|| format!("validating {}", config.limits_path.display()))?;
    let store = MemoryStore::load(&config.store_path, config.default_region.clone())
        .with_context(|| format!("loading store from {}", config.store_path.display()))?;
    let regions = assigned_regions(config, &store).await;
    table
        .ensure_regions(regions.iter().map(String::as_str))
        .context("limit table does not cover every assigned region")?;

    println!("Configuration OK");
    println!("Limits version: {}", table.version());
    println!("Gases: {}", table.gases().join(", "));
    println!(
        "Windows: {}",
        table
            .windows()
            .iter()
            .map(|w| w.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    for region in table.regions() {
        println!(
            "Region {region}: {} evaluated key(s)",
            table.required_keys(region).count()
        );
    }
    Ok(())
}

async fn cmd_health(config: &Config) -> Result<()> {
    let health = HealthMonitor::with_persistence(health_path(config));
    println!("{}", health.summary());

    let reachable = match MemoryStore::load(&config.store_path, config.default_region.clone()) {
        Ok(store) => {
            let store: SharedStore = Arc::new(store);
            TimeoutStore::new(store, config.store_timeout).ping().await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &reachable {
        tracing::warn!(error = %e, "Store health probe failed");
    }
    health.set_store_reachable(reachable.is_ok());

    let report = health.report(Utc::now(), config.tick_interval, config.health_stale_ticks);
    println!();
    println!(
        "Store reachable: {}",
        if report.store_reachable { "yes" } else { "no" }
    );
    println!(
        "Last tick within {} interval(s): {}",
        config.health_stale_ticks,
        if report.tick_recent { "yes" } else { "no" }
    );
    println!("Healthy: {}", if report.healthy { "yes" } else { "no" });
    Ok(())
}

async fn cmd_export(
    config: &Config,
    output: Option<PathBuf>,
    format: ExportFormat,
    firefighter: Option<&str>,
) -> Result<()> {
    let store = MemoryStore::load(&config.store_path, config.default_region.clone())
        .with_context(|| format!("loading store from {}", config.store_path.display()))?;
    let decisions: Vec<DecisionRecord> = store
        .all_decisions()
        .await
        .into_iter()
        .filter(|d| firefighter.map_or(true, |ff| d.firefighter_id == ff))
        .collect();

    if decisions.is_empty() {
        println!("No decisions found in {:?}", config.store_path);
        println!("Run 'exposure-analytics tick' or 'exposure-analytics run' first.");
        return Ok(());
    }

    let export_dir = output.unwrap_or_else(|| config.export_path.clone());
    std::fs::create_dir_all(&export_dir)
        .with_context(|| format!("creating {}", export_dir.display()))?;

    let (extension, body) = match format {
        ExportFormat::Jsonl => {
            let lines = decisions
                .iter()
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;
            ("jsonl", lines.join("\n"))
        }
        ExportFormat::Json => ("json", serde_json::to_string_pretty(&decisions)?),
    };

    let output_path = export_dir.join(format!(
        "decisions_{}.{extension}",
        Utc::now().format("%Y%m%d_%H%M%S")
    ));
    std::fs::write(&output_path, body)
        .with_context(|| format!("writing {}", output_path.display()))?;

    println!("Exported {} decision(s) to {output_path:?}", decisions.len());
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);

    println!();
    println!("Limit table");
    println!("===========");
    println!();
    match LimitTable::from_file(&config.limits_path) {
        Ok(table) => println!("{}", serde_json::to_string_pretty(&table.to_limits_file())?),
        Err(e) => println!("Could not load {:?}: {e}", config.limits_path),
    }
    Ok(())
}
