//! Lead store: in-memory lead records with per-lead serialized updates and
//! optional write-through to the database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{Lead, LeadFilter, PlaceCandidate, natural_key};
use crate::error::{DatabaseError, PipelineError};
use crate::store::Database;

#[derive(Default)]
struct Inner {
    leads: HashMap<Uuid, Arc<Mutex<Lead>>>,
    by_key: HashMap<(String, String), Uuid>,
}

/// Process-scoped store of every lead.
///
/// The outer lock guards membership; each lead has its own mutex so that
/// same-id updates serialize while different leads proceed concurrently.
pub struct LeadStore {
    inner: RwLock<Inner>,
    db: Option<Arc<dyn Database>>,
}

impl LeadStore {
    /// Create an empty in-memory store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
            db: None,
        })
    }

    /// Create a store backed by the database, rehydrated from the last
    /// committed state.
    pub async fn with_db(db: Arc<dyn Database>) -> Result<Arc<Self>, DatabaseError> {
        let leads = db.load_leads().await?;
        let mut inner = Inner::default();
        for lead in leads {
            inner.by_key.insert(lead.natural_key(), lead.id);
            inner.leads.insert(lead.id, Arc::new(Mutex::new(lead)));
        }
        info!(count = inner.leads.len(), "Lead store loaded from database");
        Ok(Arc::new(Self {
            inner: RwLock::new(inner),
            db: Some(db),
        }))
    }

    /// Insert a lead for a discovery candidate unless one already exists for
    /// the same city and place. Returns the lead and whether it was created.
    pub async fn create(
        &self,
        candidate: PlaceCandidate,
        city: &str,
    ) -> Result<(Lead, bool), PipelineError> {
        let key = natural_key(city, &candidate.place_id);
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.by_key.get(&key).and_then(|id| inner.leads.get(id)) {
            let lead = existing.lock().await.clone();
            debug!(lead_id = %lead.id, place_id = %lead.place_id, "Lead already exists");
            return Ok((lead, false));
        }

        let lead = Lead::from_candidate(candidate, city.trim());
        if let Some(db) = &self.db {
            db.upsert_lead(&lead).await?;
        }
        inner.by_key.insert(key, lead.id);
        inner
            .leads
            .insert(lead.id, Arc::new(Mutex::new(lead.clone())));

        info!(lead_id = %lead.id, name = %lead.name, city = %lead.city, "Lead created");
        Ok((lead, true))
    }

    /// Get a copy of a lead.
    pub async fn get(&self, id: Uuid) -> Result<Lead, PipelineError> {
        let slot = {
            let inner = self.inner.read().await;
            inner.leads.get(&id).cloned()
        };
        match slot {
            Some(slot) => Ok(slot.lock().await.clone()),
            None => Err(PipelineError::lead_not_found(id)),
        }
    }

    /// Apply `mutate` to a lead atomically.
    ///
    /// The closure works on a copy. If it fails, or the result cannot be
    /// persisted, the copy is discarded and the stored lead is unchanged.
    /// Notes may only be appended and the id never changes.
    pub async fn update<T, F>(&self, id: Uuid, mutate: F) -> Result<(Lead, T), PipelineError>
    where
        F: FnOnce(&mut Lead) -> Result<T, PipelineError>,
    {
        // Held for the whole update so a concurrent reset cannot interleave.
        let inner = self.inner.read().await;
        let slot = inner
            .leads
            .get(&id)
            .ok_or_else(|| PipelineError::lead_not_found(id))?;
        let mut current = slot.lock().await;

        let mut draft = current.clone();
        let out = mutate(&mut draft)?;

        if draft.id != current.id {
            return Err(PipelineError::Validation("lead id is immutable".into()));
        }
        if draft.notes.len() < current.notes.len()
            || draft.notes[..current.notes.len()] != current.notes[..]
        {
            return Err(PipelineError::Validation("lead notes are append-only".into()));
        }

        draft.updated_at = Utc::now();
        if let Some(db) = &self.db {
            db.upsert_lead(&draft).await?;
        }
        *current = draft.clone();
        Ok((draft, out))
    }

    /// List leads matching `filter`, oldest first.
    pub async fn list(&self, filter: &LeadFilter) -> Vec<Lead> {
        let slots: Vec<_> = {
            let inner = self.inner.read().await;
            inner.leads.values().cloned().collect()
        };
        let mut leads = Vec::with_capacity(slots.len());
        for slot in slots {
            let lead = slot.lock().await;
            if filter.matches(&lead) {
                leads.push(lead.clone());
            }
        }
        leads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        leads
    }

    /// Every lead, oldest first.
    pub async fn snapshot(&self) -> Vec<Lead> {
        self.list(&LeadFilter::default()).await
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.leads.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.leads.is_empty()
    }

    /// Find the lead whose reference code appears in `text`.
    pub async fn find_by_reference(&self, text: &str) -> Option<Lead> {
        let haystack = text.to_uppercase();
        self.snapshot()
            .await
            .into_iter()
            .find(|lead| haystack.contains(&lead.reference_code))
    }

    /// Find the lead whose e-mail address equals `address`.
    pub async fn find_by_email(&self, address: &str) -> Option<Lead> {
        let address = address.trim();
        self.snapshot().await.into_iter().find(|lead| {
            lead.email
                .as_deref()
                .is_some_and(|e| e.trim().eq_ignore_ascii_case(address))
        })
    }

    /// Clear every lead. Waits for in-flight updates to finish.
    pub async fn reset(&self) -> Result<usize, PipelineError> {
        let mut inner = self.inner.write().await;
        let count = inner.leads.len();
        if let Some(db) = &self.db
            && let Err(e) = db.clear_leads().await
        {
            warn!(error = %e, "Failed to clear persisted leads");
            return Err(e.into());
        }
        inner.leads.clear();
        inner.by_key.clear();
        info!(count, "Lead store reset");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leads::model::LeadStatus;
    use crate::store::LibSqlBackend;

    fn candidate(place_id: &str) -> PlaceCandidate {
        PlaceCandidate {
            place_id: place_id.into(),
            name: format!("Shop {place_id}"),
            address: "1 Congress Ave".into(),
            phone: Some("+15125550100".into()),
            website: None,
            rating: Some(4.5),
            review_count: Some(40),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_city_and_place() {
        let store = LeadStore::new();
        let (first, created) = store.create(candidate("p1"), "Austin").await.unwrap();
        assert!(created);
        let (second, created) = store.create(candidate("p1"), "austin").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(store.len().await, 1);

        let (other_city, created) = store.create(candidate("p1"), "Dallas").await.unwrap();
        assert!(created);
        assert_ne!(other_city.id, first.id);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = LeadStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.get(id).await,
            Err(PipelineError::NotFound { .. })
        ));
        let res = store.update(id, |_| Ok(())).await;
        assert!(matches!(res, Err(PipelineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn failed_mutation_is_discarded() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();

        let res: Result<(Lead, ()), _> = store
            .update(lead.id, |l| {
                l.add_note("test", "should vanish");
                l.status = LeadStatus::Researched;
                Err(PipelineError::Validation("boom".into()))
            })
            .await;
        assert!(res.is_err());

        let after = store.get(lead.id).await.unwrap();
        assert_eq!(after.status, LeadStatus::Found);
        assert!(after.notes.is_empty());
    }

    #[tokio::test]
    async fn notes_cannot_be_rewritten() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();
        store
            .update(lead.id, |l| {
                l.add_note("test", "first");
                Ok(())
            })
            .await
            .unwrap();

        let res = store
            .update(lead.id, |l| {
                l.notes[0].text = "edited".into();
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(PipelineError::Validation(_))));

        let res = store
            .update(lead.id, |l| {
                l.notes.clear();
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(PipelineError::Validation(_))));
        assert_eq!(store.get(lead.id).await.unwrap().notes[0].text, "first");
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_notes() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();

        let id = lead.id;
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update(id, move |l| {
                        l.add_note("test", format!("note {i}"));
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.get(id).await.unwrap().notes.len(), 50);
    }

    #[tokio::test]
    async fn update_refreshes_updated_at() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let (updated, _) = store.update(lead.id, |_| Ok(())).await.unwrap();
        assert!(updated.updated_at > lead.updated_at);
        assert_eq!(updated.created_at, lead.created_at);
    }

    #[tokio::test]
    async fn list_filters_by_status_and_city() {
        let store = LeadStore::new();
        let (a, _) = store.create(candidate("a"), "Austin").await.unwrap();
        store.create(candidate("b"), "Austin").await.unwrap();
        store.create(candidate("c"), "Dallas").await.unwrap();
        store
            .update(a.id, |l| {
                l.transition_to(LeadStatus::Researched).ok();
                Ok(())
            })
            .await
            .unwrap();

        let austin = store
            .list(&LeadFilter {
                status: None,
                city: Some("austin".into()),
            })
            .await;
        assert_eq!(austin.len(), 2);

        let researched = store
            .list(&LeadFilter {
                status: Some(LeadStatus::Researched),
                city: None,
            })
            .await;
        assert_eq!(researched.len(), 1);
        assert_eq!(researched[0].id, a.id);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();
        assert_eq!(store.reset().await.unwrap(), 1);
        assert!(store.is_empty().await);
        assert!(matches!(
            store.get(lead.id).await,
            Err(PipelineError::NotFound { .. })
        ));

        // Natural key is free again.
        let (again, created) = store.create(candidate("p1"), "Austin").await.unwrap();
        assert!(created);
        assert_ne!(again.id, lead.id);
    }

    #[tokio::test]
    async fn lookup_by_reference_and_email() {
        let store = LeadStore::new();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();
        store
            .update(lead.id, |l| {
                l.email = Some("Owner@Shop.com".into());
                Ok(())
            })
            .await
            .unwrap();

        let text = format!("Re: proposal [ref: {}]", lead.reference_code.to_lowercase());
        assert_eq!(store.find_by_reference(&text).await.unwrap().id, lead.id);
        assert!(store.find_by_reference("no code here").await.is_none());
        assert_eq!(
            store.find_by_email("owner@shop.com").await.unwrap().id,
            lead.id
        );
    }

    #[tokio::test]
    async fn rehydrates_from_database() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store = LeadStore::with_db(Arc::clone(&db)).await.unwrap();
        let (lead, _) = store.create(candidate("p1"), "Austin").await.unwrap();
        store
            .update(lead.id, |l| {
                l.transition_to(LeadStatus::Researched).ok();
                Ok(())
            })
            .await
            .unwrap();

        let restarted = LeadStore::with_db(Arc::clone(&db)).await.unwrap();
        let loaded = restarted.get(lead.id).await.unwrap();
        assert_eq!(loaded.status, LeadStatus::Researched);

        // Natural key index is rebuilt too.
        let (same, created) = restarted.create(candidate("p1"), "Austin").await.unwrap();
        assert!(!created);
        assert_eq!(same.id, lead.id);

        restarted.reset().await.unwrap();
        assert!(db.load_leads().await.unwrap().is_empty());
    }
}
