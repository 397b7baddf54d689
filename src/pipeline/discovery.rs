//! Discovery: geo search for businesses without a website.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use super::Pipeline;
use super::retry::call_with_retry;
use crate::error::PipelineError;
use crate::leads::PlaceCandidate;
use crate::notify::DashboardEvent;
use crate::services::SearchFilters;

/// Whether a discovery run is in progress, for `/api/status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryStatus {
    pub is_running: bool,
    pub current_city: Option<String>,
}

/// Held for the duration of one discovery run. Dropping it clears the
/// running flag.
pub struct DiscoveryGuard {
    status: Arc<Mutex<DiscoveryStatus>>,
}

impl DiscoveryGuard {
    pub(crate) fn acquire(
        status: &Arc<Mutex<DiscoveryStatus>>,
        city: &str,
    ) -> Result<Self, PipelineError> {
        let mut current = status
            .lock()
            .map_err(|_| PipelineError::Busy("discovery state poisoned".into()))?;
        if current.is_running {
            return Err(PipelineError::Busy(format!(
                "discovery already running for {}",
                current.current_city.as_deref().unwrap_or("another city")
            )));
        }
        current.is_running = true;
        current.current_city = Some(city.to_string());
        Ok(Self {
            status: Arc::clone(status),
        })
    }
}

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        if let Ok(mut current) = self.status.lock() {
            current.is_running = false;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub city: String,
    /// Candidates returned by the geo search.
    pub found: usize,
    /// Candidates without a website that passed the filters.
    pub promising: usize,
    /// New leads created.
    pub created: usize,
    /// Promising candidates that were already leads.
    pub existing: usize,
}

/// Keep candidates with no website, apply the rating floor and cap the batch.
pub fn select_promising(
    candidates: Vec<PlaceCandidate>,
    min_rating: Option<f32>,
    max: usize,
) -> Vec<PlaceCandidate> {
    candidates
        .into_iter()
        .filter(|c| c.website.is_none())
        .filter(|c| match min_rating {
            Some(min) => c.rating.is_some_and(|r| r >= min),
            None => true,
        })
        .take(max)
        .collect()
}

impl Pipeline {
    /// Check the city, claim the discovery slot and run in the background.
    pub fn start_discovery(
        self: &Arc<Self>,
        city: &str,
        business_type: Option<String>,
    ) -> Result<(), PipelineError> {
        let city = validate_city(city)?;
        let guard = DiscoveryGuard::acquire(&self.discovery, &city)?;
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let _ = pipeline.run_discovery(&city, business_type).await;
        });
        Ok(())
    }

    /// Run discovery for `city` and wait for it to finish.
    pub async fn discover(
        &self,
        city: &str,
        business_type: Option<String>,
    ) -> Result<DiscoveryReport, PipelineError> {
        let city = validate_city(city)?;
        let _guard = DiscoveryGuard::acquire(&self.discovery, &city)?;
        self.run_discovery(&city, business_type).await
    }

    async fn run_discovery(
        &self,
        city: &str,
        business_type: Option<String>,
    ) -> Result<DiscoveryReport, PipelineError> {
        info!(city, "Discovery started");
        self.notifier
            .publish(DashboardEvent::ProcessStarted {
                city: city.to_string(),
                timestamp: Utc::now(),
            })
            .await;

        let result = self.search_and_store(city, business_type).await;
        match &result {
            Ok(report) if report.promising == 0 => {
                self.notifier
                    .publish(DashboardEvent::DiscoveryEmpty {
                        city: city.to_string(),
                        message: format!(
                            "No businesses without a website found in {city} ({} searched)",
                            report.found
                        ),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Ok(report) => {
                self.notifier
                    .publish(DashboardEvent::DiscoveryCompleted {
                        city: city.to_string(),
                        count: report.created,
                        message: format!(
                            "Found {} new leads in {city} ({} already known)",
                            report.created, report.existing
                        ),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
            Err(e) => {
                error!(city, error = %e, "Discovery failed");
                self.notifier
                    .publish(DashboardEvent::DiscoveryFailed {
                        city: city.to_string(),
                        message: e.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }

        self.notifier
            .publish(DashboardEvent::ProcessFinished {
                city: city.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        result
    }

    async fn search_and_store(
        &self,
        city: &str,
        business_type: Option<String>,
    ) -> Result<DiscoveryReport, PipelineError> {
        let geo = Arc::clone(self.services.geo()?);
        let filters = SearchFilters {
            business_type,
            min_rating: self.config.min_rating,
            max_results: self.config.max_leads_per_search,
        };

        let candidates = call_with_retry(self.runner.policy(), "places", || {
            let geo = Arc::clone(&geo);
            let filters = filters.clone();
            let city = city.to_string();
            async move { geo.search(&city, &filters).await }
        })
        .await?;

        let found = candidates.len();
        let promising = select_promising(
            candidates,
            self.config.min_rating,
            self.config.max_leads_per_search,
        );

        let mut report = DiscoveryReport {
            city: city.to_string(),
            found,
            promising: promising.len(),
            ..Default::default()
        };

        for candidate in promising {
            let (lead, created) = self.leads.create(candidate, city).await?;
            if created {
                report.created += 1;
                self.notifier
                    .publish(DashboardEvent::LeadAdded {
                        lead_id: lead.id,
                        business: lead,
                        timestamp: Utc::now(),
                    })
                    .await;
            } else {
                report.existing += 1;
            }
        }

        info!(
            city,
            found = report.found,
            created = report.created,
            existing = report.existing,
            "Discovery finished"
        );
        Ok(report)
    }
}

fn validate_city(city: &str) -> Result<String, PipelineError> {
    let city = city.trim();
    if city.is_empty() {
        return Err(PipelineError::Validation("city must not be empty".into()));
    }
    Ok(city.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, website: Option<&str>, rating: Option<f32>) -> PlaceCandidate {
        PlaceCandidate {
            place_id: id.into(),
            name: format!("Shop {id}"),
            address: "Main St".into(),
            phone: None,
            website: website.map(str::to_string),
            rating,
            review_count: None,
        }
    }

    #[test]
    fn only_candidates_without_website_are_promising() {
        let selected = select_promising(
            vec![
                candidate("a", None, Some(4.0)),
                candidate("b", Some("https://b.com"), Some(4.8)),
                candidate("c", None, None),
            ],
            None,
            20,
        );
        let ids: Vec<_> = selected.iter().map(|c| c.place_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn rating_floor_and_cap() {
        let selected = select_promising(
            vec![
                candidate("a", None, Some(3.0)),
                candidate("b", None, Some(4.5)),
                candidate("c", None, None),
                candidate("d", None, Some(4.9)),
            ],
            Some(4.0),
            1,
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].place_id, "b");
    }

    #[test]
    fn guard_blocks_concurrent_runs() {
        let status = Arc::new(Mutex::new(DiscoveryStatus::default()));
        let guard = DiscoveryGuard::acquire(&status, "Austin").unwrap();
        assert!(matches!(
            DiscoveryGuard::acquire(&status, "Dallas"),
            Err(PipelineError::Busy(_))
        ));
        drop(guard);

        let current = status.lock().unwrap().clone();
        assert!(!current.is_running);
        assert_eq!(current.current_city.as_deref(), Some("Austin"));
        assert!(DiscoveryGuard::acquire(&status, "Dallas").is_ok());
    }

    #[test]
    fn blank_city_is_rejected() {
        assert!(matches!(validate_city("  "), Err(PipelineError::Validation(_))));
        assert_eq!(validate_city(" Austin ").unwrap(), "Austin");
    }
}
