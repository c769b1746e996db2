use anyhow::{Context, Result};
use arxiv_digest::{BodyFormat, Config, PipelineOrchestrator, RunOptions};
use chrono::NaiveDate;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fetch new ArXiv papers, keep the relevant ones and send them as a digest.
#[derive(Debug, Parser)]
#[command(name = "arxiv-digest", version)]
struct Cli {
    /// Last day of the search window (YYYY-MM-DD, UTC, inclusive). Defaults to now.
    #[arg(long, value_parser = parse_date)]
    end_date: Option<NaiveDate>,

    /// Compose and print the digest without sending it or recording papers as seen.
    #[arg(long)]
    dry_run: bool,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    let succeeded = runtime.block_on(run(cli))?;
    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<bool> {
    let config = Config::from_env().context("failed to read configuration")?;
    config.validate().context("invalid configuration")?;

    info!(
        "Starting arxiv-digest: {} topics, {} categories, model {}",
        config.topics.len(),
        config.categories.len(),
        config.llm.model
    );

    let orchestrator = PipelineOrchestrator::from_config(&config)
        .await
        .context("failed to initialise the pipeline")?;

    let report = orchestrator
        .run(RunOptions {
            end_date: cli.end_date,
            dry_run: cli.dry_run,
        })
        .await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if let Some(rendered) = &report.rendered {
        println!("Subject: {}\n", rendered.subject);
        if let Some(text) = rendered.body(BodyFormat::PlainText) {
            println!("{}", text);
        }
    }

    if let Some(message) = &report.error {
        error!("Run {} failed: {}", report.run_id, message);
    }
    Ok(report.is_success())
}
