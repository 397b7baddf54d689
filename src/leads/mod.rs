//! Leads: data model, state machine and the process-scoped lead store.

pub mod model;
pub mod store;

pub use model::{Lead, LeadFilter, LeadStatus, PlaceCandidate};
pub use store::LeadStore;
