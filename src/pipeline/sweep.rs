//! Periodic sweep: expires overdue human requests and marks idle contacted
//! leads as `no_response`. Both checks are off unless configured.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Pipeline;
use crate::leads::{LeadFilter, LeadStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub expired_requests: usize,
    pub no_response: usize,
}

/// Spawn the sweeper. Returns a `JoinHandle` and a shutdown flag.
pub fn spawn_sweeper(
    pipeline: Arc<Pipeline>,
    interval: Duration,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sweeper started");
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                info!("Sweeper shutting down");
                return;
            }
            let report = sweep_once(&pipeline, Utc::now()).await;
            if report != SweepReport::default() {
                info!(
                    expired_requests = report.expired_requests,
                    no_response = report.no_response,
                    "Sweep finished"
                );
            }
        }
    });

    (handle, shutdown_flag)
}

pub async fn sweep_once(pipeline: &Pipeline, now: DateTime<Utc>) -> SweepReport {
    let expired_requests = pipeline.gate.expire_overdue(now).await.len();

    let mut no_response = 0;
    if let Some(window) = pipeline
        .config
        .no_response_after
        .and_then(|w| chrono::Duration::from_std(w).ok())
    {
        let contacted = LeadFilter {
            status: Some(LeadStatus::Contacted),
            city: None,
        };
        for lead in pipeline.leads.list(&contacted).await {
            if now - lead.updated_at < window {
                continue;
            }
            match pipeline.mark_no_response(lead.id).await {
                Ok(_) => no_response += 1,
                // A reply may have landed since the listing.
                Err(e) => warn!(lead_id = %lead.id, error = %e, "Could not mark lead as no response"),
            }
        }
    }

    debug!(expired_requests, no_response, "Sweep pass");
    SweepReport {
        expired_requests,
        no_response,
    }
}
