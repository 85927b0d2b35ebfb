use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use chrono_humanize::{Accuracy, HumanTime, Tense};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    pipeline::{Outcome, Pipeline, RunReport},
    types::Forge,
};

/// Totals across every pass the agent made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentSummary {
    pub passes: usize,
    pub opened: usize,
}

fn humanize(duration: Duration) -> String {
    chrono::Duration::from_std(duration)
        .map(|d| HumanTime::from(d).to_text_en(Accuracy::Rough, Tense::Present))
        .unwrap_or_else(|_| format!("{duration:?}"))
}

fn log_report(report: &RunReport, elapsed: Duration) {
    if let Some(error) = &report.search_error {
        warn!(%error, pages = report.pages, "Search ended early");
    }
    for outcome in &report.outcomes {
        if let Outcome::Failed { repo, error } = outcome {
            warn!(%repo, %error, "Repository failed");
        }
    }

    info!(
        pages = report.pages,
        hits = report.hits,
        opened = report.count(|o| matches!(o, Outcome::Opened { .. })),
        planned = report.count(|o| matches!(o, Outcome::Planned { .. })),
        skipped = report.count(|o| matches!(o, Outcome::Skipped { .. })),
        failed = report.count(|o| matches!(o, Outcome::Failed { .. })),
        took = %humanize(elapsed),
        "Pass complete"
    );
}

/// Polls until `shutdown` is cancelled, or for a single pass when the
/// configuration asks for it.
///
/// A fatal forge error (rate limit, rejected credentials) ends the loop
/// with an error.
pub async fn run<F>(
    forge: Arc<F>,
    config: Config,
    shutdown: CancellationToken,
) -> Result<AgentSummary>
where
    F: Forge + Send + Sync + 'static,
{
    anyhow::ensure!(!config.interval.is_zero(), "Check interval must be positive");

    let login = forge
        .current_user()
        .await
        .context("Failed to identify the authenticated user")?;
    info!(user = %login, dry_run = config.dry_run, "Bot started");

    let config = Arc::new(config);
    let pipeline = Pipeline::new(forge, Arc::clone(&config), login);
    let mut summary = AgentSummary::default();

    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Utc::now();
        let report = match pipeline.run(&shutdown).await {
            Ok(report) => Some(report),
            Err(err) if err.is_fatal() => return Err(err).context("Pass aborted"),
            Err(err) => {
                warn!(error = %err, "Pass failed, retrying at the next check");
                None
            }
        };
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();

        summary.passes += 1;
        if let Some(report) = report {
            log_report(&report, elapsed);
            summary.opened += report.opened().count();
        }

        if config.once || shutdown.is_cancelled() {
            break;
        }
        info!(next = %humanize(config.interval), "Waiting for next check");
    }

    info!(passes = summary.passes, opened = summary.opened, "Bot stopped");
    Ok(summary)
}

/// Returns a token cancelled on SIGINT or SIGTERM.
pub fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "Received signal, exiting");
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(err) => {
            warn!(error = %err, "Cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
