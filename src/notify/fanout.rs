//! Notifier: broadcast fan-out to dashboard clients plus the activity log.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, warn};

use super::events::{ActivityEntry, DashboardEvent};
use crate::store::Database;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Number of activity entries kept in memory for display.
pub const ACTIVITY_LOG_CAPACITY: usize = 50;

/// Publishes dashboard events to every connected client and records them.
pub struct Notifier {
    tx: broadcast::Sender<DashboardEvent>,
    activity: RwLock<VecDeque<ActivityEntry>>,
    db: Option<Arc<dyn Database>>,
}

impl Notifier {
    /// Create a notifier with no persistence.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            tx,
            activity: RwLock::new(VecDeque::with_capacity(ACTIVITY_LOG_CAPACITY)),
            db: None,
        })
    }

    /// Create a notifier that appends to the database audit log and preloads
    /// the most recent entries for display.
    pub async fn with_db(db: Arc<dyn Database>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        let recent = match db.recent_activity(ACTIVITY_LOG_CAPACITY).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Failed to load activity log, starting empty");
                Vec::new()
            }
        };
        Arc::new(Self {
            tx,
            activity: RwLock::new(recent.into_iter().collect()),
            db: Some(db),
        })
    }

    /// Subscribe to live events. Each WS client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Record an event in the activity log, persist it, and broadcast it.
    ///
    /// Never fails and never waits on clients. Audit persistence errors are
    /// logged and dropped.
    pub async fn publish(&self, event: DashboardEvent) {
        let entry = event.to_activity();
        {
            let mut activity = self.activity.write().await;
            if activity.len() == ACTIVITY_LOG_CAPACITY {
                activity.pop_front();
            }
            activity.push_back(entry.clone());
            // Sent under the log lock so clients see log order.
            self.best_effort_broadcast(event);
        }

        if let Some(db) = &self.db
            && let Err(e) = db.append_activity(&entry).await
        {
            warn!(event_type = %entry.event_type, error = %e, "Failed to persist activity entry");
        }
    }

    /// At-most-once delivery to currently connected clients.
    ///
    /// Returns the number of clients the event was queued for. With no
    /// subscribers the event is dropped. A client that falls behind the
    /// channel capacity loses the backlog and must resynchronise from a
    /// fresh snapshot.
    pub fn best_effort_broadcast(&self, event: DashboardEvent) -> usize {
        let event_type = event.event_type();
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(event_type, "No dashboard clients connected");
                0
            }
        }
    }

    /// The most recent activity entries, oldest first.
    pub async fn recent_activity(&self) -> Vec<ActivityEntry> {
        self.activity.read().await.iter().cloned().collect()
    }
}
