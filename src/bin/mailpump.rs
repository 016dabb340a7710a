//! mailpump command-line entry point.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use mailpump::api::{self, AppState};
use mailpump::config::Config;
use mailpump::config::secrets::ExposeSecret;
use mailpump::db::Db;
use mailpump::engine::{FetchStrategy, Pipeline};
use mailpump::ratelimit;
use mailpump::store::EmailStore;
use mailpump::telemetry::{TelemetryConfig, init_telemetry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mailpump", about = "Drain the email backlog through a rate-limited worker pool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP trigger endpoint
    Serve,
    /// Process the backlog once and exit
    Run {
        /// Override FETCH_STRATEGY ("bulk" or "streaming")
        #[arg(long)]
        strategy: Option<FetchStrategy>,
        /// Override WORKER_COUNT
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Insert pending emails for local testing
    Seed {
        /// Number of emails to insert
        #[arg(long, default_value_t = 100)]
        count: i64,
        /// Recipient domain
        #[arg(long, default_value = "example.com")]
        domain: String,
    },
    /// Show email counts per status
    Stats {
        /// Print counts as a JSON object
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenvy::dotenv().is_err() {
        eprintln!("no .env file found, using process environment");
    }
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "mailpump".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect_with(config.database_url.expose_secret(), &config.pool).await?;
    db.migrate().await?;

    let result = match cli.command {
        Command::Serve => cmd_serve(&config, db.clone()).await,
        Command::Run { strategy, workers } => {
            if let Some(strategy) = strategy {
                config.pipeline.strategy = strategy;
            }
            if let Some(workers) = workers {
                config.pipeline.worker_count = workers.max(1);
            }
            cmd_run(&config, db.clone()).await
        }
        Command::Seed { count, domain } => cmd_seed(&db, count, &domain).await,
        Command::Stats { json } => cmd_stats(&db, json).await,
    };

    db.close().await?;
    result
}

async fn build_pipeline(config: &Config, db: Db) -> anyhow::Result<Pipeline> {
    let limiter = ratelimit::from_config(&config.rate_limit, &config.redis_url).await?;
    info!(
        strategy = %config.pipeline.strategy,
        workers = config.pipeline.worker_count,
        batch_size = config.pipeline.batch_size,
        limiter = ?config.rate_limit.backend,
        "pipeline configured"
    );
    Ok(Pipeline::new(Arc::new(db), limiter, config.pipeline.clone()))
}

async fn cmd_serve(config: &Config, db: Db) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config, db).await?;
    let state = Arc::new(AppState::new(pipeline, config.run_timeout));

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        shutdown.cancel();
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    api::serve(listener, state).await?;
    Ok(())
}

async fn cmd_run(config: &Config, db: Db) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config, db).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        warn!("interrupted, cancelling run");
        on_signal.cancel();
    });
    if let Some(timeout) = config.run_timeout {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_timeout.cancel();
        });
    }

    match pipeline.run_once(&cancel).await {
        Ok(summary) => {
            println!(
                "Processed {} email(s) ({} dispatched, {} update failures, {} claims lost)",
                summary.processed,
                summary.dispatched,
                summary.update_failures,
                summary.claims_lost
            );
            Ok(())
        }
        Err(e) => {
            println!("Processed {} email(s) before stopping", e.processed);
            Err(e.into())
        }
    }
}

async fn cmd_seed(db: &Db, count: i64, domain: &str) -> anyhow::Result<()> {
    if count <= 0 {
        anyhow::bail!("--count must be positive");
    }
    let ids = db.insert_pending(count, domain).await?;
    match (ids.first(), ids.last()) {
        (Some(first), Some(last)) => {
            println!("Inserted {} pending email(s), ids {first}..={last}", ids.len())
        }
        _ => println!("Inserted 0 pending emails"),
    }
    Ok(())
}

async fn cmd_stats(db: &Db, json: bool) -> anyhow::Result<()> {
    let counts = db.status_counts().await?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.to_string(), serde_json::Value::from(*n)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }
    println!("{:<12}  COUNT", "STATUS");
    println!("{}", "-".repeat(24));
    let mut total = 0;
    for (status, n) in &counts {
        println!("{:<12}  {n}", status.to_string());
        total += n;
    }
    println!("{}", "-".repeat(24));
    println!("{:<12}  {total}", "total");
    Ok(())
}
