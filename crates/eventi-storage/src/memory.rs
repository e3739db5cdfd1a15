use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventi_core::{
    DashboardStats, ErrorLogEntry, ErrorQuery, EventOrderField, EventPatch, EventQuery, FacetCount,
    NewErrorLogEntry, NewRunRecord, NewStagingRecord, Page, ProductionRecord, RunQuery, RunRecord,
    StagingQuery, StagingRecord,
};
use tracing::debug;

use crate::{EventFacet, EventStore, MergePlan, StoreError, StoreResult, RECENT_RUNS, TOP_CITIES};

type InsertFault = Box<dyn Fn(&NewStagingRecord) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    staging: BTreeMap<i64, StagingRecord>,
    production: BTreeMap<i64, ProductionRecord>,
    errors: Vec<ErrorLogEntry>,
    runs: Vec<RunRecord>,
    next_staging_id: i64,
    next_production_id: i64,
    next_error_id: i64,
    next_run_id: i64,
    fail_next_merge: Option<String>,
}

/// In-memory store for tests and local dry runs.
///
/// Mirrors the Postgres store's observable behavior, including the unique
/// `uuid` constraint on production rows and all-or-nothing merges.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<MemoryState>,
    insert_fault: Option<InsertFault>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject staging inserts for which `fault` returns a message, the way a
    /// database constraint would.
    pub fn with_insert_fault(
        mut self,
        fault: impl Fn(&NewStagingRecord) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.insert_fault = Some(Box::new(fault));
        self
    }

    /// Make the next `apply_merge` fail before touching production.
    pub fn fail_next_merge(&self, message: impl Into<String>) -> StoreResult<()> {
        self.lock()?.fail_next_merge = Some(message.into());
        Ok(())
    }

    /// Seed a production row directly, bypassing reconciliation.
    pub fn seed_production(&self, staged: &StagingRecord, now: DateTime<Utc>) -> StoreResult<i64> {
        let mut state = self.lock()?;
        if state.production.values().any(|p| p.uuid == staged.uuid) {
            return Err(StoreError::Constraint(format!(
                "duplicate key value violates unique constraint on uuid {}",
                staged.uuid
            )));
        }
        Ok(insert_production(&mut state, staged, now))
    }

    pub fn production_snapshot(&self) -> StoreResult<Vec<ProductionRecord>> {
        Ok(self.lock()?.production.values().cloned().collect())
    }

    pub fn error_snapshot(&self) -> StoreResult<Vec<ErrorLogEntry>> {
        Ok(self.lock()?.errors.clone())
    }

    pub fn run_snapshot(&self) -> StoreResult<Vec<RunRecord>> {
        Ok(self.lock()?.runs.clone())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Message("in-memory store lock poisoned".to_string()))
    }

    fn check_insert(&self, record: &NewStagingRecord) -> StoreResult<()> {
        if let Some(fault) = &self.insert_fault {
            if let Some(message) = fault(record) {
                return Err(StoreError::Constraint(message));
            }
        }
        Ok(())
    }
}

fn push_staging(state: &mut MemoryState, record: &NewStagingRecord) -> StagingRecord {
    state.next_staging_id += 1;
    let row = StagingRecord {
        id: state.next_staging_id,
        uuid: record.uuid.clone(),
        content_hash: record.content_hash.clone(),
        fields: record.fields.clone(),
        loaded_at: Utc::now(),
    };
    state.staging.insert(row.id, row.clone());
    row
}

fn insert_production(state: &mut MemoryState, staged: &StagingRecord, now: DateTime<Utc>) -> i64 {
    state.next_production_id += 1;
    let id = state.next_production_id;
    state.production.insert(
        id,
        ProductionRecord {
            id,
            uuid: staged.uuid.clone(),
            content_hash: staged.content_hash.clone(),
            fields: staged.fields.clone(),
            is_active: true,
            created_at: now,
            updated_at: now,
        },
    );
    id
}

fn facet_counts<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<FacetCount> {
    let mut counts: BTreeMap<Option<String>, u64> = BTreeMap::new();
    for value in values {
        *counts.entry(value.map(ToString::to_string)).or_default() += 1;
    }
    let mut out = counts
        .into_iter()
        .map(|(value, count)| FacetCount { value, count })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

fn sort_production(rows: &mut [ProductionRecord], query: &EventQuery) {
    let field = query.ordering.field;
    rows.sort_by(|a, b| {
        let ord = match field {
            EventOrderField::DateStart => a.fields.date_start.cmp(&b.fields.date_start),
            EventOrderField::DateEnd => a.fields.date_end.cmp(&b.fields.date_end),
            EventOrderField::CreatedAt => a.created_at.cmp(&b.created_at),
            EventOrderField::Title => a.fields.title.cmp(&b.fields.title),
            EventOrderField::City => a.fields.city.cmp(&b.fields.city),
        };
        let ord = ord.then_with(|| a.id.cmp(&b.id));
        if query.ordering.descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn truncate_staging(&self) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.staging.clear();
        Ok(())
    }

    async fn insert_staging(&self, record: &NewStagingRecord) -> StoreResult<i64> {
        self.check_insert(record)?;
        let mut state = self.lock()?;
        let row = push_staging(&mut state, record);
        debug!(id = row.id, uuid = %row.uuid, "staged record");
        Ok(row.id)
    }

    async fn insert_staging_batch(
        &self,
        records: &[NewStagingRecord],
    ) -> StoreResult<Vec<StagingRecord>> {
        for record in records {
            self.check_insert(record)?;
        }
        let mut state = self.lock()?;
        Ok(records.iter().map(|r| push_staging(&mut state, r)).collect())
    }

    async fn staging_in_load_order(&self) -> StoreResult<Vec<StagingRecord>> {
        Ok(self.lock()?.staging.values().cloned().collect())
    }

    async fn list_staging(&self, query: &StagingQuery) -> StoreResult<Page<StagingRecord>> {
        let state = self.lock()?;
        let rows = state
            .staging
            .values()
            .rev()
            .filter(|r| query.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        Ok(Page::from_vec(rows, query.pagination))
    }

    async fn get_staging(&self, id: i64) -> StoreResult<Option<StagingRecord>> {
        Ok(self.lock()?.staging.get(&id).cloned())
    }

    async fn delete_staging(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock()?.staging.remove(&id).is_some())
    }

    async fn delete_staging_by_source(&self, source: &str) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let before = state.staging.len();
        state.staging.retain(|_, r| r.fields.source != source);
        Ok((before - state.staging.len()) as u64)
    }

    async fn count_staging(&self) -> StoreResult<u64> {
        Ok(self.lock()?.staging.len() as u64)
    }

    async fn production_fingerprints(
        &self,
        uuids: &[String],
    ) -> StoreResult<HashMap<String, Option<String>>> {
        let state = self.lock()?;
        let by_uuid = state
            .production
            .values()
            .map(|p| (p.uuid.as_str(), p.content_hash.clone()))
            .collect::<HashMap<_, _>>();
        Ok(uuids
            .iter()
            .filter_map(|u| by_uuid.get(u.as_str()).map(|h| (u.clone(), h.clone())))
            .collect())
    }

    async fn apply_merge(&self, plan: &MergePlan, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(message) = state.fail_next_merge.take() {
            return Err(StoreError::Message(message));
        }

        // Validate the whole plan before the first write so a rejected plan leaves no trace.
        let id_by_uuid = state
            .production
            .values()
            .map(|p| (p.uuid.clone(), p.id))
            .collect::<HashMap<_, _>>();
        for staged in &plan.inserts {
            if id_by_uuid.contains_key(&staged.uuid) {
                return Err(StoreError::Constraint(format!(
                    "duplicate key value violates unique constraint on uuid {}",
                    staged.uuid
                )));
            }
        }

        for staged in &plan.inserts {
            insert_production(&mut state, staged, now);
        }
        for staged in &plan.updates {
            match id_by_uuid
                .get(&staged.uuid)
                .and_then(|id| state.production.get_mut(id))
            {
                Some(row) => {
                    row.content_hash = staged.content_hash.clone();
                    row.fields = staged.fields.clone();
                    row.updated_at = now;
                }
                None => {
                    debug!(uuid = %staged.uuid, "update target vanished; inserting instead");
                    insert_production(&mut state, staged, now);
                }
            }
        }
        Ok(())
    }

    async fn list_production(&self, query: &EventQuery) -> StoreResult<Page<ProductionRecord>> {
        let state = self.lock()?;
        let mut rows = state
            .production
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        sort_production(&mut rows, query);
        Ok(Page::from_vec(rows, query.pagination))
    }

    async fn get_production(&self, id: i64) -> StoreResult<Option<ProductionRecord>> {
        Ok(self.lock()?.production.get(&id).cloned())
    }

    async fn get_production_by_uuid(&self, uuid: &str) -> StoreResult<Option<ProductionRecord>> {
        Ok(self
            .lock()?
            .production
            .values()
            .find(|p| p.uuid == uuid)
            .cloned())
    }

    async fn update_production(
        &self,
        id: i64,
        patch: &EventPatch,
    ) -> StoreResult<Option<ProductionRecord>> {
        let mut state = self.lock()?;
        let Some(row) = state.production.get_mut(&id) else {
            return Ok(None);
        };
        patch.apply_to(row);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn toggle_active(&self, id: i64) -> StoreResult<Option<bool>> {
        let mut state = self.lock()?;
        let Some(row) = state.production.get_mut(&id) else {
            return Ok(None);
        };
        row.is_active = !row.is_active;
        row.updated_at = Utc::now();
        Ok(Some(row.is_active))
    }

    async fn delete_production(&self, id: i64) -> StoreResult<bool> {
        Ok(self.lock()?.production.remove(&id).is_some())
    }

    async fn production_facets(&self, facet: EventFacet) -> StoreResult<Vec<FacetCount>> {
        let state = self.lock()?;
        Ok(match facet {
            EventFacet::City => facet_counts(state.production.values().map(|p| p.fields.city.as_deref())),
            EventFacet::Source => {
                facet_counts(state.production.values().map(|p| Some(p.fields.source.as_str())))
            }
        })
    }

    async fn dashboard_stats(&self) -> StoreResult<DashboardStats> {
        let state = self.lock()?;
        let mut events_by_city =
            facet_counts(state.production.values().map(|p| p.fields.city.as_deref()));
        events_by_city.truncate(TOP_CITIES);
        let mut recent = state.runs.clone();
        recent.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        recent.truncate(RECENT_RUNS);
        Ok(DashboardStats {
            total_events: state.production.len() as u64,
            active_events: state.production.values().filter(|p| p.is_active).count() as u64,
            events_by_city,
            events_by_source: facet_counts(
                state.production.values().map(|p| Some(p.fields.source.as_str())),
            ),
            recent_etl_runs: recent,
            staging_count: state.staging.len() as u64,
        })
    }

    async fn insert_error(&self, entry: &NewErrorLogEntry) -> StoreResult<i64> {
        let mut state = self.lock()?;
        state.next_error_id += 1;
        let id = state.next_error_id;
        state.errors.push(ErrorLogEntry {
            id,
            error_type: entry.error_type,
            source: entry.source.clone(),
            json_file: entry.json_file.clone(),
            record_data: entry.record_data.clone(),
            error_message: entry.error_message.clone(),
            run_id: entry.run_id.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn list_errors(&self, query: &ErrorQuery) -> StoreResult<Page<ErrorLogEntry>> {
        let state = self.lock()?;
        let rows = state
            .errors
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .cloned()
            .collect::<Vec<_>>();
        Ok(Page::from_vec(rows, query.pagination))
    }

    async fn get_error(&self, id: i64) -> StoreResult<Option<ErrorLogEntry>> {
        Ok(self.lock()?.errors.iter().find(|e| e.id == id).cloned())
    }

    async fn insert_run(&self, run: &NewRunRecord) -> StoreResult<i64> {
        let mut state = self.lock()?;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.push(RunRecord::from_new(id, run.clone()));
        Ok(id)
    }

    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Page<RunRecord>> {
        let state = self.lock()?;
        let mut rows = state
            .runs
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        Ok(Page::from_vec(rows, query.pagination))
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        Ok(self.lock()?.runs.iter().find(|r| r.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventi_core::EventFields;

    fn new_record(uuid: &str, hash: &str, source: &str) -> NewStagingRecord {
        NewStagingRecord {
            uuid: uuid.to_string(),
            content_hash: Some(hash.to_string()),
            fields: EventFields {
                source: source.to_string(),
                title: format!("Event {uuid}"),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn staging_keeps_load_order_and_clears_on_truncate() {
        let store = InMemoryEventStore::new();
        store.insert_staging(&new_record("a", "h1", "city_today")).await.unwrap();
        store.insert_staging(&new_record("b", "h2", "zero_eu")).await.unwrap();

        let rows = store.staging_in_load_order().await.unwrap();
        assert_eq!(rows.iter().map(|r| r.uuid.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);

        store.truncate_staging().await.unwrap();
        assert_eq!(store.count_staging().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_fault_rejects_only_matching_records() {
        let store = InMemoryEventStore::new().with_insert_fault(|r| {
            (r.uuid.len() > 16).then(|| "value too long for type character varying(16)".to_string())
        });
        assert!(store.insert_staging(&new_record("short", "h", "s")).await.is_ok());
        let err = store
            .insert_staging(&new_record("this-uuid-is-way-too-long", "h", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        assert_eq!(store.count_staging().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_insert_is_all_or_nothing() {
        let store = InMemoryEventStore::new()
            .with_insert_fault(|r| (r.fields.title.is_empty()).then(|| "title required".into()));
        let mut bad = new_record("b", "h", "partner");
        bad.fields.title.clear();
        let result = store
            .insert_staging_batch(&[new_record("a", "h", "partner"), bad])
            .await;
        assert!(result.is_err());
        assert_eq!(store.count_staging().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn merge_with_duplicate_insert_leaves_production_untouched() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert_staging(&new_record("a", "h1", "s")).await.unwrap();
        let staged = store.staging_in_load_order().await.unwrap();
        store.seed_production(&staged[0], now).unwrap();

        store.insert_staging(&new_record("b", "h2", "s")).await.unwrap();
        let staged = store.staging_in_load_order().await.unwrap();
        let plan = MergePlan {
            inserts: vec![staged[1].clone(), staged[0].clone()],
            updates: vec![],
        };
        assert!(store.apply_merge(&plan, now).await.is_err());
        assert_eq!(store.production_snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_by_source_counts_removed_rows() {
        let store = InMemoryEventStore::new();
        store.insert_staging(&new_record("a", "h", "partner")).await.unwrap();
        store.insert_staging(&new_record("b", "h", "partner")).await.unwrap();
        store.insert_staging(&new_record("c", "h", "city_today")).await.unwrap();
        assert_eq!(store.delete_staging_by_source("partner").await.unwrap(), 2);
        assert_eq!(store.count_staging().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_for_a_deleted_row_recreates_it() {
        let store = InMemoryEventStore::new();
        let now = Utc::now();
        store.insert_staging(&new_record("kept", "h1", "city_today")).await.unwrap();
        store.insert_staging(&new_record("gone", "h1", "city_today")).await.unwrap();
        let staged = store.staging_in_load_order().await.unwrap();
        let kept_id = store.seed_production(&staged[0], now).unwrap();
        let gone_id = store.seed_production(&staged[1], now).unwrap();
        assert!(store.delete_production(gone_id).await.unwrap());

        let mut changed = staged.clone();
        for row in &mut changed {
            row.content_hash = Some("h2".into());
        }
        let plan = MergePlan {
            inserts: Vec::new(),
            updates: changed,
        };
        store.apply_merge(&plan, now).await.unwrap();

        let production = store.production_snapshot().unwrap();
        assert_eq!(production.len(), 2);
        assert!(production.iter().all(|p| p.content_hash.as_deref() == Some("h2")));
        let kept = production.iter().find(|p| p.uuid == "kept").unwrap();
        assert_eq!(kept.id, kept_id);
        assert!(production.iter().any(|p| p.uuid == "gone" && p.id != gone_id));
    }
}
