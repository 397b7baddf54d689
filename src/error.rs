//! Error types for Lead Pilot.

use std::time::Duration;

use uuid::Uuid;

use crate::leads::model::LeadStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures from an external collaborator (geo search, mail, calendar, voice, LLM).
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service} call failed: {reason}")]
    Failed { service: String, reason: String },

    #[error("{service} returned an invalid response: {reason}")]
    InvalidResponse { service: String, reason: String },

    #[error("{service} is not configured")]
    NotConfigured { service: String },
}

impl ExternalError {
    pub fn failed(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Failed {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(service: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidResponse {
            service: service.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<LlmError> for ExternalError {
    fn from(e: LlmError) -> Self {
        ExternalError::failed("llm", e)
    }
}

/// Pipeline-related errors: state machine, gate, and stage failures.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Lead {lead_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        lead_id: Uuid,
        from: LeadStatus,
        to: LeadStatus,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Lead {lead_id} already has pending human request {request_id}")]
    AlreadyPending { lead_id: Uuid, request_id: String },

    #[error("External call failed: {0}")]
    External(#[from] ExternalError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Busy: {0}")]
    Busy(String),
}

impl PipelineError {
    pub fn lead_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "lead",
            id: id.to_string(),
        }
    }

    pub fn request_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "human request",
            id: id.to_string(),
        }
    }

    /// Only external collaborator failures are worth retrying. Store-level
    /// errors indicate a logical race or stale client state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::External(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_external_errors_are_retryable() {
        let ext = PipelineError::External(ExternalError::failed("smtp", "connection refused"));
        assert!(ext.is_retryable());

        let nf = PipelineError::lead_not_found(Uuid::new_v4());
        assert!(!nf.is_retryable());

        let inv = PipelineError::InvalidTransition {
            lead_id: Uuid::new_v4(),
            from: LeadStatus::Found,
            to: LeadStatus::Confirmed,
        };
        assert!(!inv.is_retryable());
    }

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = PipelineError::InvalidTransition {
            lead_id: Uuid::nil(),
            from: LeadStatus::Contacted,
            to: LeadStatus::MeetingScheduled,
        };
        let msg = err.to_string();
        assert!(msg.contains("contacted"));
        assert!(msg.contains("meeting_scheduled"));
    }
}
