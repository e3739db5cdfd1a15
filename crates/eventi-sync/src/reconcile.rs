use std::collections::HashMap;

use chrono::{DateTime, Utc};
use eventi_core::{ReconcileCounts, StagingRecord};
use eventi_storage::{EventStore, MergePlan};
use tracing::info;

use crate::SyncError;

/// Collapse staging to one row per `uuid` (the last loaded wins) and decide,
/// against the current production fingerprints, which rows to insert or update.
pub fn build_merge_plan(
    staging: Vec<StagingRecord>,
    fingerprints: &HashMap<String, Option<String>>,
) -> (MergePlan, ReconcileCounts) {
    let mut latest: Vec<StagingRecord> = Vec::with_capacity(staging.len());
    let mut position: HashMap<String, usize> = HashMap::new();
    for record in staging {
        match position.get(&record.uuid) {
            Some(&at) => latest[at] = record,
            None => {
                position.insert(record.uuid.clone(), latest.len());
                latest.push(record);
            }
        }
    }

    let mut plan = MergePlan::default();
    let mut counts = ReconcileCounts::default();
    for record in latest {
        match fingerprints.get(&record.uuid) {
            None => {
                counts.inserted += 1;
                plan.inserts.push(record);
            }
            Some(current) if *current != record.content_hash => {
                counts.updated += 1;
                plan.updates.push(record);
            }
            Some(_) => counts.unchanged += 1,
        }
    }
    (plan, counts)
}

pub struct Reconciler<'a> {
    store: &'a dyn EventStore,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a dyn EventStore) -> Self {
        Self { store }
    }

    /// Merge staging into production as one unit. Counts are returned only
    /// once every write is committed.
    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileCounts, SyncError> {
        let staging = self
            .store
            .staging_in_load_order()
            .await
            .map_err(SyncError::Merge)?;
        let mut uuids: Vec<String> = staging.iter().map(|r| r.uuid.clone()).collect();
        uuids.sort();
        uuids.dedup();
        let fingerprints = self
            .store
            .production_fingerprints(&uuids)
            .await
            .map_err(SyncError::Merge)?;

        let (plan, counts) = build_merge_plan(staging, &fingerprints);
        if !plan.is_empty() {
            self.store
                .apply_merge(&plan, now)
                .await
                .map_err(SyncError::Merge)?;
        }
        info!(
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            "reconciliation committed"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use eventi_core::{EventFields, NewStagingRecord};
    use eventi_storage::InMemoryEventStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).single().expect("ts")
    }

    fn staged(uuid: &str, hash: Option<&str>, title: &str) -> NewStagingRecord {
        NewStagingRecord {
            uuid: uuid.into(),
            content_hash: hash.map(str::to_string),
            fields: EventFields {
                source: "city_today".into(),
                title: title.into(),
                city: Some("milano".into()),
                ..Default::default()
            },
        }
    }

    async fn stage(store: &InMemoryEventStore, records: &[NewStagingRecord]) {
        store.truncate_staging().await.unwrap();
        for record in records {
            store.insert_staging(record).await.unwrap();
        }
    }

    fn staging_row(id: i64, uuid: &str, hash: Option<&str>) -> StagingRecord {
        StagingRecord {
            id,
            uuid: uuid.into(),
            content_hash: hash.map(str::to_string),
            fields: EventFields::default(),
            loaded_at: t0(),
        }
    }

    #[test]
    fn last_loaded_duplicate_wins() {
        let rows = vec![
            staging_row(1, "a", Some("h1")),
            staging_row(2, "b", Some("x")),
            staging_row(3, "a", Some("h2")),
        ];
        let (plan, counts) = build_merge_plan(rows, &HashMap::new());
        assert_eq!(counts.inserted, 2);
        assert_eq!(plan.inserts[0].id, 3);
        assert_eq!(plan.inserts[0].content_hash.as_deref(), Some("h2"));
    }

    #[test]
    fn missing_fingerprints_compare_equal() {
        let known = HashMap::from([("a".to_string(), None), ("b".to_string(), None)]);
        let rows = vec![staging_row(1, "a", None), staging_row(2, "b", Some("h"))];
        let (plan, counts) = build_merge_plan(rows, &known);
        assert_eq!(
            counts,
            ReconcileCounts {
                inserted: 0,
                updated: 1,
                unchanged: 1
            }
        );
        assert_eq!(plan.updates[0].uuid, "b");
    }

    #[tokio::test]
    async fn new_identifiers_are_inserted_with_staging_fields() {
        let store = InMemoryEventStore::new();
        stage(&store, &[staged("a", Some("h1"), "Concert"), staged("b", Some("h2"), "Expo")]).await;

        let counts = Reconciler::new(&store).reconcile(t0()).await.unwrap();
        assert_eq!(
            counts,
            ReconcileCounts {
                inserted: 2,
                updated: 0,
                unchanged: 0
            }
        );
        let production = store.production_snapshot().unwrap();
        assert_eq!(production.len(), 2);
        let a = production.iter().find(|p| p.uuid == "a").unwrap();
        assert_eq!(a.fields, staged("a", Some("h1"), "Concert").fields);
        assert!(a.is_active);
    }

    #[tokio::test]
    async fn changed_fingerprint_overwrites_and_advances_updated_at() {
        let store = InMemoryEventStore::new();
        stage(&store, &[staged("a", Some("h1"), "Concert")]).await;
        Reconciler::new(&store).reconcile(t0()).await.unwrap();
        let before = store.production_snapshot().unwrap().remove(0);

        stage(&store, &[staged("a", Some("h2"), "Concert (new venue)")]).await;
        let later = t0() + Duration::hours(24);
        let counts = Reconciler::new(&store).reconcile(later).await.unwrap();

        assert_eq!(
            counts,
            ReconcileCounts {
                inserted: 0,
                updated: 1,
                unchanged: 0
            }
        );
        let after = store.production_snapshot().unwrap().remove(0);
        assert_eq!(after.id, before.id);
        assert_eq!(after.content_hash.as_deref(), Some("h2"));
        assert_eq!(after.fields.title, "Concert (new venue)");
        assert_eq!(after.updated_at, later);
        assert_eq!(after.created_at, before.created_at);
    }

    #[tokio::test]
    async fn second_pass_over_same_staging_is_all_unchanged() {
        let store = InMemoryEventStore::new();
        stage(&store, &[staged("a", Some("h1"), "Concert"), staged("b", None, "Expo")]).await;
        Reconciler::new(&store).reconcile(t0()).await.unwrap();
        let snapshot = store.production_snapshot().unwrap();

        let counts = Reconciler::new(&store)
            .reconcile(t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(
            counts,
            ReconcileCounts {
                inserted: 0,
                updated: 0,
                unchanged: 2
            }
        );
        assert_eq!(store.production_snapshot().unwrap(), snapshot);
    }

    #[tokio::test]
    async fn failed_merge_leaves_production_untouched() {
        let store = InMemoryEventStore::new();
        stage(&store, &[staged("a", Some("h1"), "Concert")]).await;
        Reconciler::new(&store).reconcile(t0()).await.unwrap();
        let snapshot = store.production_snapshot().unwrap();

        stage(&store, &[staged("a", Some("h2"), "Changed"), staged("c", Some("h3"), "New")]).await;
        store.fail_next_merge("connection reset").unwrap();
        let err = Reconciler::new(&store).reconcile(t0()).await.unwrap_err();

        assert!(matches!(err, SyncError::Merge(_)));
        assert_eq!(store.production_snapshot().unwrap(), snapshot);
    }
}
