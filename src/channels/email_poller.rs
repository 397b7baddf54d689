//! Mailbox poller: fetches new replies on an interval and hands each one to
//! the pipeline's inbound handler.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channels::Mailbox;
use crate::pipeline::Pipeline;

/// Spawn a background task that polls the mailbox.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_email_poller(
    mailbox: Arc<dyn Mailbox>,
    own_address: String,
    interval: Duration,
    pipeline: Arc<Pipeline>,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Email poller started");

        let mut tick = tokio::time::interval(interval);

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Email poller shutting down");
                return;
            }

            poll_once(mailbox.as_ref(), &own_address, &pipeline).await;
        }
    });

    (handle, shutdown_flag)
}

/// Run a single poll cycle. Returns the number of messages handed to the pipeline.
pub async fn poll_once(mailbox: &dyn Mailbox, own_address: &str, pipeline: &Pipeline) -> usize {
    let messages = match mailbox.fetch_new().await {
        Ok(msgs) => msgs,
        Err(e) => {
            error!(error = %e, "Email poll failed");
            return 0;
        }
    };

    if messages.is_empty() {
        return 0;
    }
    debug!(count = messages.len(), "Fetched unseen emails");

    let mut handled = 0;
    for email in messages {
        // Self-loop prevention
        if email.sender.eq_ignore_ascii_case(own_address) {
            debug!(sender = %email.sender, "Skipping self-sent email");
            continue;
        }

        let message_id = email.message_id.clone();
        match pipeline.handle_inbound_email(email).await {
            Ok(outcome) => {
                debug!(message_id = %message_id, outcome = ?outcome, "Inbound email handled");
                handled += 1;
            }
            Err(e) => warn!(message_id = %message_id, error = %e, "Inbound email failed"),
        }
    }
    handled
}
