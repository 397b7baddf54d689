//! Lead Pilot: finds local businesses without a website and walks them
//! through research, outreach, reply handling and meeting booking.

pub mod channels;
pub mod classifier;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod gate;
pub mod leads;
pub mod llm;
pub mod notify;
pub mod pipeline;
pub mod services;
pub mod store;
