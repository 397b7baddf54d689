//! Configuration types.
//!
//! Everything is read from environment variables. Unparseable values fall
//! back to their defaults rather than failing start-up.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::email::EmailConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};

/// Pipeline behaviour shared by the stage runner, gate and classifier.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Classifier results below this confidence drive no transition.
    pub classifier_threshold: f32,
    /// Upper bound for any single external call.
    pub call_timeout: Duration,
    /// Sleep between attempts. Its length is the number of retries.
    pub retry_backoff: Vec<Duration>,
    /// Maximum number of candidates kept from one discovery search.
    pub max_leads_per_search: usize,
    /// Minimum geo rating for discovery candidates.
    pub min_rating: Option<f32>,
    /// Pending human requests older than this are expired. `None` keeps them forever.
    pub human_request_ttl: Option<Duration>,
    /// Contacted leads idle for this long are marked `no_response`. `None` disables the sweep.
    pub no_response_after: Option<Duration>,
    /// Email outreach waits for a human-supplied website mock-up URL.
    pub require_website_mockup: bool,
    /// Signature used in outreach mail.
    pub sender_name: String,
    /// Default meeting length when a request gives no end time.
    pub meeting_minutes: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            classifier_threshold: 0.7,
            call_timeout: Duration::from_secs(60),
            retry_backoff: vec![Duration::from_secs(2), Duration::from_secs(8)],
            max_leads_per_search: 20,
            min_rating: None,
            human_request_ttl: None,
            no_response_after: None,
            require_website_mockup: false,
            sender_name: "Lead Pilot".to_string(),
            meeting_minutes: 30,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let classifier_threshold = env_parse("LEAD_PILOT_CLASSIFIER_THRESHOLD")
            .filter(|t: &f32| (0.0..=1.0).contains(t))
            .unwrap_or(defaults.classifier_threshold);

        let call_timeout = env_parse("LEAD_PILOT_CALL_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.call_timeout);

        let retry_backoff = std::env::var("LEAD_PILOT_RETRY_BACKOFF_SECS")
            .ok()
            .and_then(|s| parse_backoff(&s))
            .unwrap_or(defaults.retry_backoff);

        Self {
            classifier_threshold,
            call_timeout,
            retry_backoff,
            max_leads_per_search: env_parse("LEAD_PILOT_MAX_LEADS")
                .unwrap_or(defaults.max_leads_per_search),
            min_rating: env_parse("LEAD_PILOT_MIN_RATING"),
            human_request_ttl: env_parse::<u64>("LEAD_PILOT_HUMAN_REQUEST_TTL_MIN")
                .map(|m| Duration::from_secs(m * 60)),
            no_response_after: env_parse::<u64>("LEAD_PILOT_NO_RESPONSE_HOURS")
                .map(|h| Duration::from_secs(h * 3600)),
            require_website_mockup: env_parse("LEAD_PILOT_REQUIRE_WEBSITE_MOCKUP")
                .unwrap_or(defaults.require_website_mockup),
            sender_name: std::env::var("LEAD_PILOT_SENDER_NAME")
                .unwrap_or(defaults.sender_name),
            meeting_minutes: env_parse("LEAD_PILOT_MEETING_MINUTES")
                .unwrap_or(defaults.meeting_minutes),
        }
    }
}

impl PipelineConfig {
    /// Reject values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.classifier_threshold) {
            return Err(invalid(
                "classifier_threshold",
                format!("{} is outside 0.0..=1.0", self.classifier_threshold),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(invalid("call_timeout", "must be greater than zero"));
        }
        if self.max_leads_per_search == 0 {
            return Err(invalid("max_leads_per_search", "must be at least 1"));
        }
        if self.meeting_minutes == 0 {
            return Err(invalid("meeting_minutes", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Credentials and endpoints for the external collaborators.
/// A `None` section means the corresponding adapter is disabled.
#[derive(Debug, Clone, Default)]
pub struct ServicesConfig {
    pub llm: Option<LlmConfig>,
    pub email: Option<EmailConfig>,
    pub places_api_key: Option<SecretString>,
    pub calendar: Option<CalendarConfig>,
    pub voice: Option<VoiceConfig>,
}

#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub access_token: SecretString,
    pub calendar_id: String,
}

#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
}

impl ServicesConfig {
    pub fn from_env() -> Self {
        let llm = llm_from_env();

        let calendar = std::env::var("GOOGLE_CALENDAR_TOKEN")
            .ok()
            .map(|token| CalendarConfig {
                access_token: SecretString::from(token),
                calendar_id: std::env::var("GOOGLE_CALENDAR_ID")
                    .unwrap_or_else(|_| "primary".to_string()),
            });

        let voice = std::env::var("VOICE_CALL_ENDPOINT")
            .ok()
            .map(|endpoint| VoiceConfig {
                endpoint,
                api_key: std::env::var("VOICE_CALL_API_KEY").ok().map(SecretString::from),
            });

        Self {
            llm,
            email: EmailConfig::from_env(),
            places_api_key: std::env::var("GOOGLE_PLACES_API_KEY")
                .ok()
                .map(SecretString::from),
            calendar,
            voice,
        }
    }
}

/// The first configured API key picks the backend.
fn llm_from_env() -> Option<LlmConfig> {
    let (backend, key) = if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        (LlmBackend::Anthropic, key)
    } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        (LlmBackend::OpenAi, key)
    } else {
        return None;
    };
    let defaults = LlmConfig::new(backend, SecretString::from(key));
    Some(LlmConfig {
        model: std::env::var("LEAD_PILOT_MODEL").unwrap_or(defaults.model.clone()),
        classifier_model: std::env::var("LEAD_PILOT_CLASSIFIER_MODEL").ok(),
        drafting_timeout: env_parse("LEAD_PILOT_LLM_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.drafting_timeout),
        classification_timeout: env_parse("LEAD_PILOT_CLASSIFIER_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.classification_timeout),
        ..defaults
    })
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct PilotConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub pipeline: PipelineConfig,
    pub services: ServicesConfig,
}

impl PilotConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("LEAD_PILOT_PORT").unwrap_or(8000),
            db_path: std::env::var("LEAD_PILOT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/lead-pilot.db")),
            log_dir: std::env::var("LEAD_PILOT_LOG_DIR").ok().map(PathBuf::from),
            pipeline: PipelineConfig::from_env(),
            services: ServicesConfig::from_env(),
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse a comma-separated list of backoff seconds, e.g. `"2,8"`.
fn parse_backoff(s: &str) -> Option<Vec<Duration>> {
    s.split(',')
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<u64>().ok().map(Duration::from_secs))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.classifier_threshold, 0.7);
        assert_eq!(
            cfg.retry_backoff,
            vec![Duration::from_secs(2), Duration::from_secs(8)]
        );
        assert_eq!(cfg.max_leads_per_search, 20);
        assert!(cfg.human_request_ttl.is_none());
        assert!(cfg.no_response_after.is_none());
    }

    #[test]
    fn validation_rejects_unusable_values() {
        assert!(PipelineConfig::default().validate().is_ok());

        let zero_timeout = PipelineConfig {
            call_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            zero_timeout.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "call_timeout"
        ));

        let threshold = PipelineConfig {
            classifier_threshold: 1.5,
            ..Default::default()
        };
        assert!(threshold.validate().is_err());
    }

    #[test]
    fn backoff_parsing() {
        assert_eq!(
            parse_backoff("1, 3,5"),
            Some(vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5)
            ])
        );
        assert_eq!(parse_backoff(""), Some(vec![]));
        assert_eq!(parse_backoff("2,x"), None);
    }
}
