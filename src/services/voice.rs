//! Voice-call collaborator: posts a call job to a configured webhook.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExternalError;

/// Result of a completed outbound call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub transcript: String,
    /// Free-form outcome reported by the voice agent, e.g. "interested".
    pub outcome: String,
    /// E-mail address the prospect gave during the call, if any.
    #[serde(default)]
    pub captured_email: Option<String>,
}

impl CallOutcome {
    /// False when the call dropped, hit voicemail or never reached anyone.
    pub fn is_connected(&self) -> bool {
        self.outcome != "issue_appeared"
    }
}

#[async_trait]
pub trait VoiceCaller: Send + Sync {
    async fn place_call(
        &self,
        number: &str,
        script_context: &str,
    ) -> Result<CallOutcome, ExternalError>;
}

/// Calls a voice-agent HTTP endpoint that places the call and returns the
/// transcript when it ends.
pub struct HttpVoiceCaller {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpVoiceCaller {
    pub fn new(endpoint: impl Into<String>, api_key: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl VoiceCaller for HttpVoiceCaller {
    async fn place_call(
        &self,
        number: &str,
        script_context: &str,
    ) -> Result<CallOutcome, ExternalError> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "phone_number": number,
            "context": script_context,
        }));
        if let Some(key) = &self.api_key {
            req = req.header("xi-api-key", key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ExternalError::failed("voice", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::failed(
                "voice",
                format!("call endpoint returned {status}: {body}"),
            ));
        }

        let outcome: CallOutcome = resp
            .json()
            .await
            .map_err(|e| ExternalError::invalid("voice", e))?;
        info!(number, outcome = %outcome.outcome, "Call completed");
        Ok(outcome)
    }
}
