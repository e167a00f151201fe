mod auth;
mod classify;
mod config;
mod db;
mod dedup;
mod error;
mod gmail;
mod models;
mod parse;
mod pipeline;

use crate::config::Config;
use crate::gmail::GmailClient;
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use google_gmail1::Gmail;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Phase {
    #[value(name = "1")]
    Label,
    #[value(name = "2")]
    Forward,
    All,
}

/// Scan a mailbox for flight-confirmation emails, label them, and
/// forward unique confirmations to a trip aggregator.
#[derive(Debug, Parser)]
#[command(name = "flightscan", version)]
struct Cli {
    /// Which phase to run
    #[arg(long, value_enum, default_value = "all")]
    phase: Phase,

    /// Log intended changes without performing them
    #[arg(long)]
    dry_run: bool,

    /// Mailbox search query (default from settings)
    #[arg(long)]
    query: Option<String>,

    /// Label to apply to identified confirmations
    #[arg(long)]
    label_name: Option<String>,

    /// Forward every pending email without duplicate filtering
    #[arg(long)]
    no_deduplicate: bool,

    /// Show processing statistics and exit
    #[arg(long)]
    stats: bool,

    /// Clear the stored OAuth token and exit
    #[arg(long)]
    reset_token: bool,

    /// Log filter, e.g. "info" or "flightscan=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if cli.reset_token {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. Run again without --reset-token to re-authenticate.");
        return Ok(());
    }

    let config = Config::load();
    let query = cli.query.clone().unwrap_or_else(|| config.search_query.clone());
    let label_name = cli
        .label_name
        .clone()
        .unwrap_or_else(|| config.label_name.clone());

    info!("flightscan starting (dry-run: {})", cli.dry_run);

    let db = db::Database::new(&config.database_url).await?;
    db.run_migrations().await?;

    if cli.stats {
        print_stats(&db).await?;
        return Ok(());
    }

    // Missing credentials abort before any sweep starts
    let secret = auth::Authenticator::load_secret(&config.credentials_file)
        .await
        .with_context(|| format!("cannot read credentials from {}", config.credentials_file))?;
    let authenticator = auth::Authenticator::authenticate(secret).await?;

    let hub = Gmail::new(
        hyper::Client::builder().build(
            hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .expect("Failed to load native roots")
                .https_only()
                .enable_http1()
                .build(),
        ),
        authenticator,
    );

    let gmail = GmailClient::new(hub, config.max_retries);
    let pipeline = Pipeline::new(gmail, db, config, cli.dry_run);

    if matches!(cli.phase, Phase::Label | Phase::All) {
        pipeline.run_label_phase(&query, &label_name).await?;
    }

    if matches!(cli.phase, Phase::Forward | Phase::All) {
        pipeline.run_forward_phase(!cli.no_deduplicate).await?;
    }

    print_stats(pipeline.database()).await?;
    info!("all operations complete");

    Ok(())
}

async fn print_stats(db: &db::Database) -> Result<()> {
    let stats = db.get_stats().await?;

    println!("{:-<42}", "");
    println!("{:<20} | {:<10} | {:>5}", "phase", "status", "count");
    println!("{:-<42}", "");
    for stat in &stats {
        println!("{:<20} | {:<10} | {:>5}", stat.phase, stat.status, stat.count);
    }
    if stats.is_empty() {
        println!("(no processing events recorded yet)");
    }
    println!("{:-<42}", "");

    if let Some(checkpoint) = db.get_last_checkpoint().await? {
        println!(
            "last checkpoint: {} ({} failed) {}",
            checkpoint.status.as_deref().unwrap_or("-"),
            checkpoint.failed_message_ids.len(),
            checkpoint.note.as_deref().unwrap_or("")
        );
    }

    Ok(())
}
