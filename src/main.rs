// src/main.rs

use anyhow::{bail, Result};
use clap::Parser;
use odm::prelude::*;
use std::path::PathBuf;

/// Download every URL concurrently, each in its own isolated worker.
#[derive(Debug, Parser)]
#[command(name = "odm", version, about)]
struct Cli {
    /// Config file (default: ~/.config/odm/config.toml, created if missing).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory for downloaded files; overrides the config.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Bandwidth cap shared by all downloads, in bytes per second.
    #[arg(long, value_name = "BYTES_PER_SEC")]
    limit: Option<u64>,
    /// Print the final job records as JSON.
    #[arg(long)]
    json: bool,
    #[arg(required = true, value_name = "URL")]
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    odm::logging::init(None);

    let mut config = match &cli.config {
        Some(path) => odm::config::load_from(path)?,
        None => odm::config::load_or_init()?,
    };
    if let Some(dir) = cli.dir {
        config.download_dir = dir;
    }
    if cli.limit.is_some() {
        config.max_bytes_per_sec = cli.limit;
    }
    let poll = config.reconcile_interval();

    let manager = DownloadManager::start(config).await?;
    let mut ids = Vec::with_capacity(cli.urls.len());
    for url in &cli.urls {
        ids.push(manager.add(url.as_str()).await?);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted, cancelling outstanding downloads.");
                for job in manager.list().await? {
                    if !job.state.status.is_terminal() {
                        manager.remove(job.id).await?;
                    }
                }
                bail!("interrupted");
            }
            _ = tokio::time::sleep(poll) => {}
        }

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            jobs.push(manager.get(*id).await?);
        }
        for job in &jobs {
            let pct = job.state.progress().map(|p| p * 100.0).unwrap_or(0.0);
            println!(
                "[{:<8}] {:>6.2}% {:>12} B  {}",
                job.state.status, pct, job.state.bytes_transferred, job.name
            );
        }
        if jobs.iter().all(|job| job.state.status.is_terminal()) {
            return report(&jobs, cli.json);
        }
    }
}

fn report(jobs: &[DownloadJob], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
    } else {
        println!();
        for job in jobs {
            match job.state.status {
                JobStatus::Finish => println!(
                    "done   {} -> {} ({} bytes, sha256 {})",
                    job.name,
                    job.destination.display(),
                    job.state.bytes_transferred,
                    job.state.sha256.as_deref().unwrap_or("-")
                ),
                status => println!(
                    "{:<6} {}: {}",
                    status.as_str(),
                    job.source,
                    job.state.error.as_deref().unwrap_or("")
                ),
            }
        }
    }

    let failed = jobs
        .iter()
        .filter(|job| job.state.status == JobStatus::Error)
        .count();
    if failed > 0 {
        bail!("{failed} of {} downloads failed", jobs.len());
    }
    Ok(())
}
