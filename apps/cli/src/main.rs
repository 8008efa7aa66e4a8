use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use lltrack_core::{
    DataLayer, Lifecycle, Page, Tracker, TrackerConfig,
    events::{Normalizer, PageHints},
};
use tracing_subscriber::EnvFilter;

use crate::{
    format::{format_duration, format_metrics, format_record_line},
    input::read_capture,
};

mod format;
mod input;

#[derive(Parser)]
#[command(name = "lltrack")]
#[command(about = "Normalize and replay analytics data-layer captures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the canonical event records for a capture (no network)
    Normalize {
        /// JSON-lines file or JSON array of data-layer entries
        file: PathBuf,

        /// Page path used for page-id fallback
        #[arg(long, default_value = "/")]
        path: String,

        /// Print full JSON records instead of one-line summaries
        #[arg(long)]
        json: bool,
    },
    /// Push a capture through a consent-gated tracker and deliver it
    Replay {
        /// JSON-lines file or JSON array of data-layer entries
        file: PathBuf,

        /// Collect endpoint, e.g. http://localhost:8000/api/analytics/collect/
        #[arg(short, long)]
        endpoint: String,

        /// Cookie header for the simulated page, e.g. "cookie_consent_marketing=1"
        #[arg(short, long, default_value = "")]
        cookie: String,

        /// Tracker config JSON file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Page path used for page-id fallback
        #[arg(long, default_value = "/")]
        path: String,
    },
}

fn create_progress(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// `--endpoint` is explicit, so it wins over the file and the environment.
fn with_endpoint(config: TrackerConfig, endpoint: String) -> TrackerConfig {
    TrackerConfig {
        collect_url: endpoint,
        ..config
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Normalize { file, path, json } => normalize(file, path, json).await,
        Command::Replay {
            file,
            endpoint,
            cookie,
            config,
            path,
        } => replay(file, endpoint, cookie, config, path).await,
    }
}

async fn normalize(file: PathBuf, path: String, json: bool) -> Result<()> {
    let capture = read_capture(&file).await?;
    let normalizer = Normalizer::new(PageHints {
        path,
        crypto_rng: true,
        ..PageHints::default()
    });

    let mut dropped = 0;
    for entry in &capture.entries {
        match normalizer.normalize(entry) {
            Some(record) if json => println!("{}", serde_json::to_string(&record)?),
            Some(record) => println!("{}", format_record_line(&record)),
            None => dropped += 1,
        }
    }

    eprintln!(
        "{} {} entries, {} not events, {} unreadable",
        style("✓").green().bold(),
        capture.entries.len(),
        dropped,
        capture.skipped
    );
    Ok(())
}

async fn replay(
    file: PathBuf,
    endpoint: String,
    cookie: String,
    config_path: Option<PathBuf>,
    path: String,
) -> Result<()> {
    let started = Instant::now();
    let config = match &config_path {
        Some(p) => TrackerConfig::load(p)?,
        None => TrackerConfig::default(),
    };
    let config = with_endpoint(config.with_env_overrides()?, endpoint);
    config.validate()?;

    let capture = read_capture(&file).await?;
    if capture.entries.is_empty() {
        bail!("{} has no entries to replay", file.display());
    }

    println!(
        "\n{}  {}\n",
        style("lltrack").cyan().bold(),
        style("replay").dim()
    );

    let page = Arc::new(Page::new("http://localhost", path).with_cookie(cookie));
    let data_layer = DataLayer::new();
    let transport = Tracker::page_transport(&page, &config, None)?;
    let Some(handle) = Tracker::boot(page, data_layer.clone(), config, transport) else {
        println!(
            "{} consent not granted, nothing was sent",
            style("✗").yellow().bold()
        );
        return Ok(());
    };
    let tracker = handle.tracker.clone();

    let pb = create_progress(capture.entries.len() as u64, "Pushing entries");
    for entry in capture.entries {
        data_layer.push(entry);
        pb.inc(1);
        tokio::task::yield_now().await;
    }
    pb.finish_with_message("Entries pushed");

    tracker.lifecycle(Lifecycle::PageHide);
    handle.shutdown().await?;

    let metrics = tracker.metrics();
    let queued = tracker.queue_len();
    let mark = if queued == 0 {
        style("✓").green().bold()
    } else {
        style("!").yellow().bold()
    };
    println!("{} {}", mark, format_metrics(&metrics, queued));
    println!(
        "\n{} {}\n",
        style("Total time:").dim(),
        style(format_duration(started.elapsed())).cyan().bold()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_flag_beats_environment() {
        let from_env = TrackerConfig {
            collect_url: "https://env.test/collect/".into(),
            batch_size: 7,
            ..TrackerConfig::default()
        };
        let config = with_endpoint(from_env, "http://localhost:8000/collect/".into());
        assert_eq!(config.collect_url, "http://localhost:8000/collect/");
        assert_eq!(config.batch_size, 7);
    }
}
