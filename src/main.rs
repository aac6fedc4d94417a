//! CLI entry point for the chapterdl tool.

use std::io::{self, IsTerminal, Read};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use chapterdl_core::plugin::CBZ_CONVERTER_NAME;
use chapterdl_core::{Coordinator, JobRecord, JobState, TracingObserver};
use clap::Parser;
use tracing::{debug, info, warn};

mod app_config;
mod cli;
mod progress;

use cli::Args;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let loaded = app_config::load_default_file_config()?;
    if let (Some(path), Some(_)) = (&loaded.path, &loaded.config) {
        debug!(path = %path.display(), "Loaded config file");
    }
    let settings = app_config::resolve_run_settings(&args, loaded.config.as_ref())?;

    let urls = read_urls(&args)?;
    if urls.is_empty() {
        info!("No input provided. Pass chapter URLs as arguments or pipe them via stdin.");
        info!("Example: chapterdl https://example.com/series/12/manifest.json");
        return Ok(ExitCode::SUCCESS);
    }

    let coordinator = Arc::new(
        Coordinator::with_default_plugins(settings.coordinator.clone())
            .context("Failed to start the download coordinator")?,
    );
    if !settings.convert {
        coordinator
            .converters()
            .set_enabled(CBZ_CONVERTER_NAME, false);
    }
    coordinator.set_observer(Arc::new(TracingObserver));

    let mut queued = 0usize;
    for url in &urls {
        match coordinator.enqueue(url) {
            Ok(id) => {
                queued += 1;
                debug!(job_id = %id, url = %url, "Enqueued chapter");
            }
            Err(error) => warn!(url = %url, error = %error, "Skipped URL"),
        }
    }
    if queued == 0 {
        warn!("No chapter could be queued");
        return Ok(ExitCode::FAILURE);
    }
    info!(
        chapters = queued,
        output_dir = %settings.coordinator.output_root.display(),
        "Downloading"
    );

    let use_progress = progress::should_use_progress(
        io::stderr().is_terminal(),
        args.quiet,
        progress::is_dumb_terminal(),
    );
    let (progress_handle, progress_stop) =
        progress::spawn_progress_ui(use_progress, Arc::clone(&coordinator));

    let interrupted = tokio::select! {
        () = coordinator.wait_idle() => false,
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "Could not listen for Ctrl-C");
                coordinator.wait_idle().await;
                false
            }
        },
    };

    if interrupted {
        warn!(
            drain_timeout_secs = args.drain_timeout,
            "Interrupted, letting running chapters finish"
        );
        for record in coordinator.snapshot().jobs {
            if record.state == JobState::Pending
                && let Err(error) = coordinator.cancel(record.id)
            {
                debug!(job_id = %record.id, error = %error, "Pending job already moved on");
            }
        }
    }
    let report = coordinator
        .shutdown(Duration::from_secs(args.drain_timeout))
        .await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let snapshot = coordinator.snapshot();
    if !args.quiet {
        for record in &snapshot.jobs {
            println!("{}", summary_line(record));
        }
    }
    let stats = snapshot.stats;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        forced = report.forced,
        "Download complete"
    );

    if interrupted || stats.failed > 0 || stats.cancelled > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

/// Chapter URLs from the positional arguments, or from stdin when piped.
fn read_urls(args: &Args) -> Result<Vec<String>> {
    let input = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read URLs from stdin")?;
        buffer
    } else {
        String::new()
    };
    Ok(parse_url_lines(&input))
}

/// One URL per line; blank lines and `#` comments are skipped.
fn parse_url_lines(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn summary_line(record: &JobRecord) -> String {
    let name = record.display_name();
    match record.state {
        JobState::Success => {
            let outputs: Vec<String> = record
                .outputs
                .iter()
                .map(|path| path.display().to_string())
                .collect();
            if outputs.is_empty() {
                let dir = record
                    .download_dir
                    .as_ref()
                    .map(|dir| dir.display().to_string())
                    .unwrap_or_default();
                format!("[done] {name} -> {dir}")
            } else {
                format!("[done] {name} -> {}", outputs.join(", "))
            }
        }
        JobState::Error => match &record.error {
            Some(detail) => format!("[failed] {name}: {detail}"),
            None => format!("[failed] {name}"),
        },
        state => format!("[{state}] {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_lines_skips_blank_and_comments() {
        let urls = parse_url_lines(
            "https://a.test/1.json\n\n  # later\n  https://a.test/2.json  \n",
        );
        assert_eq!(urls, vec!["https://a.test/1.json", "https://a.test/2.json"]);
    }

    #[test]
    fn test_summary_line_for_unfinished_state() {
        let queue =
            chapterdl_core::queue::QueueManager::new(chapterdl_core::DuplicatePolicy::Reject);
        let id = queue.enqueue("https://a.test/1.json", None).unwrap();
        let record = queue.get(id).unwrap();
        assert_eq!(summary_line(&record), "[pending] https://a.test/1.json");
    }
}
