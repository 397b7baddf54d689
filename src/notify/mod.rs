//! Notification fan-out to live dashboard clients.

pub mod events;
pub mod fanout;

pub use events::{ActivityEntry, DashboardEvent};
pub use fanout::Notifier;
