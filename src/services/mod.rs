//! External collaborators the pipeline calls out to.

pub mod calendar;
pub mod places;
pub mod voice;

use std::sync::Arc;

pub use calendar::{Calendar, CalendarEvent, CalendarEventRequest, GoogleCalendar};
pub use places::{GeoDiscovery, GooglePlaces, SearchFilters};
pub use voice::{CallOutcome, HttpVoiceCaller, VoiceCaller};

use crate::channels::Mailer;
use crate::config::ServicesConfig;
use crate::error::ExternalError;
use crate::llm::{LlmProvider, create_providers};

/// The set of collaborator adapters wired into the pipeline. A missing entry
/// makes the stages that need it fail with `NotConfigured`.
#[derive(Clone, Default)]
pub struct Services {
    pub geo: Option<Arc<dyn GeoDiscovery>>,
    /// Research and proposal drafting.
    pub llm: Option<Arc<dyn LlmProvider>>,
    /// Reply classification. Falls back to `llm` when unset.
    pub classifier_llm: Option<Arc<dyn LlmProvider>>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub calendar: Option<Arc<dyn Calendar>>,
    pub voice: Option<Arc<dyn VoiceCaller>>,
}

impl Services {
    /// Build production adapters for every configured collaborator.
    pub fn from_config(config: &ServicesConfig) -> Self {
        let providers = config.llm.as_ref().and_then(|c| match create_providers(c) {
            Ok(providers) => Some(providers),
            Err(e) => {
                tracing::error!(error = %e, "LLM provider unavailable");
                None
            }
        });
        let (llm, classifier_llm) = match providers {
            Some(p) => (Some(p.drafting), Some(p.classification)),
            None => (None, None),
        };

        Self {
            geo: config
                .places_api_key
                .clone()
                .map(|key| Arc::new(GooglePlaces::new(key)) as Arc<dyn GeoDiscovery>),
            llm,
            classifier_llm,
            mailer: config
                .email
                .clone()
                .map(|c| Arc::new(crate::channels::email::SmtpMailer::new(c)) as Arc<dyn Mailer>),
            calendar: config.calendar.clone().map(|c| {
                Arc::new(GoogleCalendar::new(c.access_token, c.calendar_id)) as Arc<dyn Calendar>
            }),
            voice: config.voice.clone().map(|c| {
                Arc::new(HttpVoiceCaller::new(c.endpoint, c.api_key)) as Arc<dyn VoiceCaller>
            }),
        }
    }

    pub fn geo(&self) -> Result<&Arc<dyn GeoDiscovery>, ExternalError> {
        self.geo.as_ref().ok_or_else(|| not_configured("places"))
    }

    pub fn llm(&self) -> Result<&Arc<dyn LlmProvider>, ExternalError> {
        self.llm.as_ref().ok_or_else(|| not_configured("llm"))
    }

    /// The provider used for reply classification, if any.
    pub fn classifier_llm(&self) -> Option<Arc<dyn LlmProvider>> {
        self.classifier_llm.clone().or_else(|| self.llm.clone())
    }

    pub fn mailer(&self) -> Result<&Arc<dyn Mailer>, ExternalError> {
        self.mailer.as_ref().ok_or_else(|| not_configured("smtp"))
    }

    pub fn calendar(&self) -> Result<&Arc<dyn Calendar>, ExternalError> {
        self.calendar.as_ref().ok_or_else(|| not_configured("calendar"))
    }

    pub fn voice(&self) -> Result<&Arc<dyn VoiceCaller>, ExternalError> {
        self.voice.as_ref().ok_or_else(|| not_configured("voice"))
    }

    /// Names of the configured collaborators, for the start-up banner.
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.geo.is_some() {
            names.push("places");
        }
        if self.llm.is_some() {
            names.push("llm");
        }
        if self.mailer.is_some() {
            names.push("smtp");
        }
        if self.calendar.is_some() {
            names.push("calendar");
        }
        if self.voice.is_some() {
            names.push("voice");
        }
        names
    }
}

fn not_configured(service: &str) -> ExternalError {
    ExternalError::NotConfigured {
        service: service.to_string(),
    }
}
