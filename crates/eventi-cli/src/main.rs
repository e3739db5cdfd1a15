use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use eventi_adapters::RunFilter;
use eventi_storage::PgEventStore;
use eventi_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "eventi-cli")]
#[command(about = "Event ETL: run producers, load staging, reconcile and serve the API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full run: producers, staging load, reconciliation and run log.
    Run {
        /// Run kind from producers.yaml (daily, weekly, monthly).
        #[arg(long, default_value = "daily")]
        kind: String,
        /// Restrict every producer to one city.
        #[arg(long)]
        city: Option<String>,
        /// Restrict one group, e.g. `cities_zero=milano,roma`. Repeatable.
        #[arg(long = "group")]
        groups: Vec<String>,
        /// Trigger parameters as a JSON object, e.g. `{"city": "roma"}`.
        #[arg(long)]
        conf: Option<String>,
    },
    /// Load pending batch files into staging without running producers.
    Load,
    /// Merge the current staging table into production.
    Reconcile,
    Migrate,
    Serve,
    /// Run the cron schedule from producers.yaml until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("EVENTI_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn build_filter(
    city: Option<String>,
    groups: Vec<String>,
    conf: Option<String>,
) -> Result<RunFilter> {
    let mut filter = match conf {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("--conf is not valid JSON")?;
            RunFilter::from_conf(&value)?
        }
        None => RunFilter::default(),
    };
    if let Some(city) = city {
        filter = filter.with_target(&city);
    }
    for pair in groups {
        let (key, values) = RunFilter::parse_group_arg(&pair)?;
        filter = filter.with_group(&key, values);
    }
    Ok(filter)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run {
        kind: "daily".to_string(),
        city: None,
        groups: Vec::new(),
        conf: None,
    }) {
        Commands::Run {
            kind,
            city,
            groups,
            conf,
        } => {
            let filter = build_filter(city, groups, conf)?;
            let pipeline = eventi_sync::pipeline_from_env().await?;
            let summary = pipeline.run_once(&kind, &filter).await?;
            print_json(&summary)?;
        }
        Commands::Load => {
            let pipeline = eventi_sync::pipeline_from_env().await?;
            let report = pipeline.load_only().await?;
            print_json(&report)?;
        }
        Commands::Reconcile => {
            let pipeline = eventi_sync::pipeline_from_env().await?;
            let counts = pipeline.reconcile_only().await?;
            print_json(&counts)?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgEventStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            eventi_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(eventi_sync::pipeline_from_env().await?);
            let Some(sched) = eventi_sync::maybe_build_scheduler(pipeline).await? else {
                anyhow::bail!("scheduler disabled; set EVENTI_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}
