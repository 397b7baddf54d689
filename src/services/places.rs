//! Geo discovery: Google Places text search.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ExternalError;
use crate::leads::model::PlaceCandidate;

const PLACES_SEARCH_URL: &str = "https://places.googleapis.com/v1/places:searchText";
const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,places.nationalPhoneNumber,places.websiteUri,places.rating,places.userRatingCount";

/// Business categories searched when the caller does not name one.
const DEFAULT_SEARCH_TYPES: &[&str] = &["restaurant", "cafe", "store"];

#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Business type, e.g. "bakery". `None` searches a few common categories.
    pub business_type: Option<String>,
    pub min_rating: Option<f32>,
    pub max_results: usize,
}

/// Searches a city for businesses. Must be idempotent per `place_id`.
#[async_trait]
pub trait GeoDiscovery: Send + Sync {
    async fn search(
        &self,
        city: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<PlaceCandidate>, ExternalError>;
}

/// Google Places (New) text search adapter.
pub struct GooglePlaces {
    client: reqwest::Client,
    api_key: SecretString,
}

impl GooglePlaces {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    async fn search_query(&self, query: &str) -> Result<Vec<PlaceCandidate>, ExternalError> {
        let resp = self
            .client
            .post(PLACES_SEARCH_URL)
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&serde_json::json!({ "textQuery": query }))
            .send()
            .await
            .map_err(|e| ExternalError::failed("places", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ExternalError::failed(
                "places",
                format!("searchText returned {status}: {body}"),
            ));
        }

        let parsed: SearchTextResponse = resp
            .json()
            .await
            .map_err(|e| ExternalError::invalid("places", e))?;
        Ok(parsed.places.into_iter().map(PlaceCandidate::from).collect())
    }
}

#[async_trait]
impl GeoDiscovery for GooglePlaces {
    async fn search(
        &self,
        city: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<PlaceCandidate>, ExternalError> {
        let types: Vec<String> = match &filters.business_type {
            Some(t) => vec![t.clone()],
            None => DEFAULT_SEARCH_TYPES.iter().map(|t| t.to_string()).collect(),
        };

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for business_type in types {
            if filters.max_results > 0 && out.len() >= filters.max_results {
                break;
            }
            let query = format!("{business_type} in {city}");
            debug!(query = %query, "Places search");
            for candidate in self.search_query(&query).await? {
                if seen.insert(candidate.place_id.clone()) {
                    out.push(candidate);
                }
            }
        }

        info!(city, count = out.len(), "Places search complete");
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct SearchTextResponse {
    #[serde(default)]
    places: Vec<PlaceResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceResult {
    id: String,
    display_name: Option<LocalizedText>,
    formatted_address: Option<String>,
    national_phone_number: Option<String>,
    website_uri: Option<String>,
    rating: Option<f32>,
    user_rating_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LocalizedText {
    text: String,
}

impl From<PlaceResult> for PlaceCandidate {
    fn from(p: PlaceResult) -> Self {
        PlaceCandidate {
            place_id: p.id,
            name: p.display_name.map(|d| d.text).unwrap_or_default(),
            address: p.formatted_address.unwrap_or_default(),
            phone: p.national_phone_number,
            website: p.website_uri.filter(|w| is_functional_website(w)),
            rating: p.rating,
            review_count: p.user_rating_count,
        }
    }
}

/// Placeholder and parked sites count as "no website".
pub fn is_functional_website(url: &str) -> bool {
    let lower = url.trim().to_lowercase();
    lower.len() > 5
        && lower.contains('.')
        && !lower.starts_with("http://localhost")
        && !lower.ends_with("example.com")
        && !lower.contains("placeholder")
        && !lower.contains("coming-soon")
        && !lower.contains("under-construction")
}
