//! CLI entry point for the download center.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use download_center::{
    Database, DownloadCenter, DownloadConfig, DownloadRequest, DownloadStatus, Store,
    TracingNotifier,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    // Read input: from positional args or stdin
    let urls: Vec<String> = if args.urls.is_empty() {
        if io::stdin().is_terminal() {
            info!("No input provided. Pipe URLs via stdin or pass as arguments.");
            info!("Example: echo 'https://example.com/file.bin' | download-center");
            return Ok(());
        }
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(ToString::to_string)
            .collect()
    } else {
        args.urls.clone()
    };

    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(());
    }

    let mut config = DownloadConfig::default();
    config.concurrency.max_concurrent = usize::from(args.concurrency);
    config.chunk.size = u64::from(args.chunk_size_mib) * 1024 * 1024;

    let db = match &args.db {
        Some(path) => Database::new(path).await?,
        None => Database::new_in_memory().await?,
    };
    let center = DownloadCenter::new(config, Store::new(db), Arc::new(TracingNotifier));
    center.start().await?;

    let total = urls.len();
    for url in urls {
        let mut request = DownloadRequest::new(url.clone(), args.destination.clone());
        request.allow_unknown_size = args.allow_unknown_size;
        match center.add_task(request).await {
            Ok(task_id) => debug!(task_id, url, "task queued"),
            Err(error) => warn!(url, %error, "rejected input"),
        }
    }

    let use_bar = !args.quiet && io::stderr().is_terminal();
    let bar = if use_bar {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Some(bar)
    } else {
        None
    };

    // Poll until every task reaches a terminal state.
    loop {
        let stats = center.queue_stats();
        let done = stats.total - stats.pending - stats.active;
        if let Some(bar) = &bar {
            bar.set_position(done as u64);
            let active = center.tasks_by_status(DownloadStatus::Downloading);
            let label = active
                .first()
                .map(|task| {
                    format!(
                        "{} ({}%)",
                        task.filename,
                        task.progress.percentage
                    )
                })
                .unwrap_or_else(|| "waiting...".to_string());
            bar.set_message(label);
        }

        if stats.pending == 0 && stats.active == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    if let Some(bar) = bar {
        bar.finish_and_clear();
    }
    center.shutdown();

    let completed = center.tasks_by_status(DownloadStatus::Completed);
    let failed = center.tasks_by_status(DownloadStatus::Failed);
    println!(
        "Completed: {}, Failed: {}",
        completed.len(),
        failed.len()
    );
    for task in &failed {
        eprintln!(
            "  failed: {} - {}",
            task.url,
            task.error.as_deref().unwrap_or("unknown error")
        );
    }

    if failed.is_empty() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
