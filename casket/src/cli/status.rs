// casket/src/cli/status.rs
use casket_common::pipeline::PipelineEvent;
use colored::Colorize;
use tokio::sync::broadcast;
use tracing::debug;

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit_idx = 0;
    while value >= 1000.0 && unit_idx < UNITS.len() - 1 {
        value /= 1000.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit_idx])
    }
}

/// Prints engine progress until the channel closes.
pub async fn handle_events(mut event_rx: broadcast::Receiver<PipelineEvent>) {
    loop {
        match event_rx.recv().await {
            Ok(event) => print_event(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Status display skipped {} events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_event(event: PipelineEvent) {
    match event {
        PipelineEvent::PipelineStarted { total_jobs } if total_jobs > 1 => {
            println!("{} {} casks", "==> Installing".bold().blue(), total_jobs);
        }
        PipelineEvent::TransactionStarted { token, version } => {
            println!("{} {} {}", "==>".bold().blue(), token.cyan(), version);
        }
        PipelineEvent::DownloadStarted { token, url } => {
            println!("    {} {} from {}", "Downloading".bold(), token.cyan(), url);
        }
        PipelineEvent::DownloadRetry {
            token,
            attempt,
            delay_ms,
            error,
        } => {
            println!(
                "    {} {} (attempt {}, waiting {} ms): {}",
                "Retrying".yellow(),
                token.cyan(),
                attempt,
                delay_ms,
                error
            );
        }
        PipelineEvent::DownloadFinished {
            size_bytes, cached, ..
        } => {
            let source = if cached { "cached" } else { "downloaded" };
            println!("    {} ({})", source, format_size(size_bytes));
        }
        PipelineEvent::Verified { token, digest: None } => {
            println!(
                "    {} {} has no checksum, installing unverified",
                "Warning:".yellow().bold(),
                token.cyan()
            );
        }
        PipelineEvent::StepStarted {
            step_index,
            step_kind,
            ..
        } => {
            println!("    [{}] {}", step_index, step_kind);
        }
        PipelineEvent::RollbackStarted { token, failed_step } => {
            println!(
                "    {} {} after step {}",
                "Rolling back".red().bold(),
                token.cyan(),
                failed_step
            );
        }
        PipelineEvent::TransactionSucceeded { token, version } => {
            println!("{} Installed {} {}", "✓".green(), token.green(), version);
        }
        PipelineEvent::TransactionFailed { token, error } => {
            println!("{} {}: {}", "✗".red().bold(), token.cyan(), error.red());
        }
        PipelineEvent::AlreadyInstalled { token, version } => {
            println!("{} {} {} is already installed.", "✓".green(), token.cyan(), version);
        }
        PipelineEvent::UninstallStarted { token, version } => {
            println!("{} {} {}", "==> Uninstalling".bold().blue(), token.cyan(), version);
        }
        PipelineEvent::UninstallFinished { token, version } => {
            println!("{} Uninstalled {} {}", "✓".green(), token.green(), version);
        }
        PipelineEvent::LogWarn { message } => {
            println!("{} {}", "Warning:".yellow().bold(), message);
        }
        PipelineEvent::PipelineFinished {
            duration_secs,
            success_count,
            fail_count,
        } => {
            if success_count + fail_count > 1 {
                println!(
                    "{} {} succeeded, {} failed in {:.1}s",
                    "==>".bold().blue(),
                    success_count,
                    fail_count,
                    duration_secs
                );
            }
        }
        other => debug!("{:?}", other),
    }
}
