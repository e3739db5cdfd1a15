//! Persistence seam for the Eventi ETL: event store (Postgres + in-memory),
//! pending batch inbox, and retry backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventi_core::{
    DashboardStats, ErrorLogEntry, ErrorQuery, EventPatch, EventQuery, FacetCount, NewErrorLogEntry,
    NewRunRecord, NewStagingRecord, Page, ProductionRecord, RunQuery, RunRecord, StagingQuery,
    StagingRecord,
};
use thiserror::Error;

mod inbox;
mod memory;
mod postgres;

pub use inbox::{BatchInbox, BatchRef, FsInbox, MemoryInbox};
pub use memory::InMemoryEventStore;
pub use postgres::PgEventStore;

pub const CRATE_NAME: &str = "eventi-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("{0}")]
    Message(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Writes decided by the reconciler, applied as one unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePlan {
    /// Staging rows whose `uuid` has no production row yet.
    pub inserts: Vec<StagingRecord>,
    /// Staging rows whose fingerprint differs from the production row with the same `uuid`.
    pub updates: Vec<StagingRecord>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFacet {
    City,
    Source,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn truncate_staging(&self) -> StoreResult<()>;
    /// Single-statement insert; a failure leaves no trace of the record.
    async fn insert_staging(&self, record: &NewStagingRecord) -> StoreResult<i64>;
    /// All-or-nothing insert used by the external bulk endpoint.
    async fn insert_staging_batch(
        &self,
        records: &[NewStagingRecord],
    ) -> StoreResult<Vec<StagingRecord>>;
    /// Every staging row, oldest load first.
    async fn staging_in_load_order(&self) -> StoreResult<Vec<StagingRecord>>;
    async fn list_staging(&self, query: &StagingQuery) -> StoreResult<Page<StagingRecord>>;
    async fn get_staging(&self, id: i64) -> StoreResult<Option<StagingRecord>>;
    async fn delete_staging(&self, id: i64) -> StoreResult<bool>;
    async fn delete_staging_by_source(&self, source: &str) -> StoreResult<u64>;
    async fn count_staging(&self) -> StoreResult<u64>;

    /// Current fingerprint per known `uuid`; unknown ids are absent from the map.
    async fn production_fingerprints(
        &self,
        uuids: &[String],
    ) -> StoreResult<HashMap<String, Option<String>>>;
    async fn apply_merge(&self, plan: &MergePlan, now: DateTime<Utc>) -> StoreResult<()>;
    async fn list_production(&self, query: &EventQuery) -> StoreResult<Page<ProductionRecord>>;
    async fn get_production(&self, id: i64) -> StoreResult<Option<ProductionRecord>>;
    async fn get_production_by_uuid(&self, uuid: &str) -> StoreResult<Option<ProductionRecord>>;
    async fn update_production(
        &self,
        id: i64,
        patch: &EventPatch,
    ) -> StoreResult<Option<ProductionRecord>>;
    async fn toggle_active(&self, id: i64) -> StoreResult<Option<bool>>;
    async fn delete_production(&self, id: i64) -> StoreResult<bool>;
    async fn production_facets(&self, facet: EventFacet) -> StoreResult<Vec<FacetCount>>;
    async fn dashboard_stats(&self) -> StoreResult<DashboardStats>;

    async fn insert_error(&self, entry: &NewErrorLogEntry) -> StoreResult<i64>;
    async fn list_errors(&self, query: &ErrorQuery) -> StoreResult<Page<ErrorLogEntry>>;
    async fn get_error(&self, id: i64) -> StoreResult<Option<ErrorLogEntry>>;

    async fn insert_run(&self, run: &NewRunRecord) -> StoreResult<i64>;
    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Page<RunRecord>>;
    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>>;
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(15),
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub(crate) const TOP_CITIES: usize = 10;
pub(crate) const RECENT_RUNS: usize = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn empty_plan_reports_empty() {
        assert!(MergePlan::default().is_empty());
    }
}
