//! Calendar collaborator: Google Calendar events API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExternalError;

const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3/calendars";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub attendees: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub event_id: String,
    pub join_link: Option<String>,
}

#[async_trait]
pub trait Calendar: Send + Sync {
    async fn create_event(
        &self,
        request: &CalendarEventRequest,
    ) -> Result<CalendarEvent, ExternalError>;
}

/// Google Calendar adapter using a pre-issued OAuth access token.
pub struct GoogleCalendar {
    client: reqwest::Client,
    access_token: SecretString,
    calendar_id: String,
}

impl GoogleCalendar {
    pub fn new(access_token: SecretString, calendar_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token,
            calendar_id: calendar_id.into(),
        }
    }
}

fn event_body(request: &CalendarEventRequest) -> serde_json::Value {
    serde_json::json!({
        "summary": request.title,
        "description": request.description.clone().unwrap_or_default(),
        "start": { "dateTime": request.start.to_rfc3339(), "timeZone": "UTC" },
        "end": { "dateTime": request.end.to_rfc3339(), "timeZone": "UTC" },
        "attendees": request
            .attendees
            .iter()
            .map(|email| serde_json::json!({ "email": email }))
            .collect::<Vec<_>>(),
        "conferenceData": {
            "createRequest": {
                "requestId": uuid::Uuid::new_v4().to_string(),
                "conferenceSolutionKey": { "type": "hangoutsMeet" }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventResponse {
    id: String,
    hangout_link: Option<String>,
    html_link: Option<String>,
}

#[async_trait]
impl Calendar for GoogleCalendar {
    async fn create_event(
        &self,
        request: &CalendarEventRequest,
    ) -> Result<CalendarEvent, ExternalError> {
        let url = format!(
            "{CALENDAR_API}/{}/events?conferenceDataVersion=1&sendUpdates=all",
            self.calendar_id
        );
        let resp = self
            .client
            .post(url)
            .bearer_auth(self.access_token.expose_secret())
            .json(&event_body(request))
            .send()
            .await
            .map_err(|e| ExternalError::failed("calendar", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::failed(
                "calendar",
                format!("events.insert returned {status}: {body}"),
            ));
        }

        let event: EventResponse = resp
            .json()
            .await
            .map_err(|e| ExternalError::invalid("calendar", e))?;
        info!(event_id = %event.id, title = %request.title, "Calendar event created");
        Ok(CalendarEvent {
            event_id: event.id,
            join_link: event.hangout_link.or(event.html_link),
        })
    }
}
