//! Core domain model for the Eventi ETL: staging, production, run and error records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "eventi-core";

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 500;

/// Descriptive event fields shared by staging and production rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EventFields {
    pub source: String,
    pub url: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub city: Option<String>,
    pub location_name: Option<String>,
    pub location_address: Option<String>,
    pub price: Option<String>,
    pub website: Option<String>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub time_info: Option<String>,
    pub schedule: Option<String>,
    pub weekdays: Option<String>,
    pub raw_data: Option<JsonValue>,
    pub scraped_at: Option<DateTime<Utc>>,
}

/// Validated, normalized record ready to be written to staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagingRecord {
    pub uuid: String,
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub fields: EventFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: i64,
    pub uuid: String,
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub fields: EventFields,
    pub loaded_at: DateTime<Utc>,
}

/// Durable, deduplicated event. At most one row per `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionRecord {
    pub id: i64,
    pub uuid: String,
    pub content_hash: Option<String>,
    #[serde(flatten)]
    pub fields: EventFields,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator edits applied through the admin API. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<Vec<String>>,
    pub image_url: Option<String>,
    pub city: Option<String>,
    pub location_name: Option<String>,
    pub location_address: Option<String>,
    pub price: Option<String>,
    pub website: Option<String>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub time_info: Option<String>,
    pub schedule: Option<String>,
    pub weekdays: Option<String>,
    pub is_active: Option<bool>,
}

impl EventPatch {
    pub fn apply_to(&self, record: &mut ProductionRecord) {
        let fields = &mut record.fields;
        if let Some(v) = &self.title {
            fields.title = v.clone();
        }
        patch_opt(&mut fields.description, &self.description);
        patch_opt(&mut fields.category, &self.category);
        patch_opt(&mut fields.image_url, &self.image_url);
        patch_opt(&mut fields.city, &self.city);
        patch_opt(&mut fields.location_name, &self.location_name);
        patch_opt(&mut fields.location_address, &self.location_address);
        patch_opt(&mut fields.price, &self.price);
        patch_opt(&mut fields.website, &self.website);
        patch_opt(&mut fields.date_start, &self.date_start);
        patch_opt(&mut fields.date_end, &self.date_end);
        patch_opt(&mut fields.time_info, &self.time_info);
        patch_opt(&mut fields.schedule, &self.schedule);
        patch_opt(&mut fields.weekdays, &self.weekdays);
        if let Some(active) = self.is_active {
            record.is_active = active;
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn patch_opt<T: Clone>(target: &mut Option<T>, value: &Option<T>) {
    if let Some(v) = value {
        *target = Some(v.clone());
    }
}

/// Ingestion failure categories persisted in the error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    MissingRequiredFields,
    InvalidJson,
    MalformedRecord,
    DbInsertError,
    /// The batch file itself could not be read or marked consumed.
    MalformedBatch,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRequiredFields => "missing_required_fields",
            Self::InvalidJson => "invalid_json",
            Self::MalformedRecord => "malformed_record",
            Self::DbInsertError => "db_insert_error",
            Self::MalformedBatch => "malformed_batch",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

impl FromStr for ErrorCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing_required_fields" => Ok(Self::MissingRequiredFields),
            "invalid_json" => Ok(Self::InvalidJson),
            "malformed_record" => Ok(Self::MalformedRecord),
            "db_insert_error" => Ok(Self::DbInsertError),
            "malformed_batch" => Ok(Self::MalformedBatch),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewErrorLogEntry {
    pub error_type: ErrorCategory,
    pub source: Option<String>,
    pub json_file: Option<String>,
    pub record_data: Option<JsonValue>,
    pub error_message: String,
    pub run_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub error_type: ErrorCategory,
    pub source: Option<String>,
    pub json_file: Option<String>,
    pub record_data: Option<JsonValue>,
    pub error_message: String,
    pub run_id: String,
    pub created_at: DateTime<Utc>,
}

/// `Completed` means the pipeline finished, not that it finished without errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunRecord {
    pub run_type: String,
    pub source: Option<String>,
    pub cities: Option<Vec<String>>,
    pub periodo: Option<String>,
    pub started_at: DateTime<Utc>,
    pub staging_completed_at: Option<DateTime<Utc>>,
    pub upsert_completed_at: Option<DateTime<Utc>>,
    pub staging_count: u64,
    pub counts: ReconcileCounts,
    pub error_count: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

/// One audit row per pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_type: String,
    pub source: Option<String>,
    pub cities: Option<Vec<String>>,
    pub periodo: Option<String>,
    pub started_at: DateTime<Utc>,
    pub staging_completed_at: Option<DateTime<Utc>>,
    pub upsert_completed_at: Option<DateTime<Utc>>,
    pub staging_count: u64,
    pub inserted_count: u64,
    pub updated_count: u64,
    pub unchanged_count: u64,
    pub error_count: u64,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl RunRecord {
    pub fn from_new(id: i64, new: NewRunRecord) -> Self {
        Self {
            id,
            run_type: new.run_type,
            source: new.source,
            cities: new.cities,
            periodo: new.periodo,
            started_at: new.started_at,
            staging_completed_at: new.staging_completed_at,
            upsert_completed_at: new.upsert_completed_at,
            staging_count: new.staging_count,
            inserted_count: new.counts.inserted,
            updated_count: new.counts.updated,
            unchanged_count: new.counts.unchanged,
            error_count: new.error_count,
            status: new.status,
            error_message: new.error_message,
        }
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.upsert_completed_at
            .map(|done| (done - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub page_size: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Pagination {
    pub fn new(page: Option<usize>, page_size: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            page_size: page_size
                .unwrap_or(DEFAULT_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Rows to skip; saturates for page numbers past any real result set.
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub count: u64,
    pub page: usize,
    pub page_size: usize,
    pub results: Vec<T>,
}

impl<T> Page<T> {
    /// Slice an already filtered and ordered collection.
    pub fn from_vec(all: Vec<T>, pagination: Pagination) -> Self {
        let count = all.len() as u64;
        let results = all
            .into_iter()
            .skip(pagination.offset())
            .take(pagination.page_size)
            .collect();
        Self {
            count,
            page: pagination.page,
            page_size: pagination.page_size,
            results,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            count: self.count,
            page: self.page,
            page_size: self.page_size,
            results: self.results.into_iter().map(f).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrderField {
    DateStart,
    DateEnd,
    CreatedAt,
    Title,
    City,
}

impl EventOrderField {
    pub fn column(&self) -> &'static str {
        match self {
            Self::DateStart => "date_start",
            Self::DateEnd => "date_end",
            Self::CreatedAt => "created_at",
            Self::Title => "title",
            Self::City => "city",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOrdering {
    pub field: EventOrderField,
    pub descending: bool,
}

impl Default for EventOrdering {
    fn default() -> Self {
        Self {
            field: EventOrderField::DateStart,
            descending: true,
        }
    }
}

impl FromStr for EventOrdering {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (descending, name) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let field = match name {
            "date_start" => EventOrderField::DateStart,
            "date_end" => EventOrderField::DateEnd,
            "created_at" => EventOrderField::CreatedAt,
            "title" => EventOrderField::Title,
            "city" => EventOrderField::City,
            _ => return Err(UnknownVariant(s.to_string())),
        };
        Ok(Self { field, descending })
    }
}

/// Filters over production events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub city: Option<String>,
    pub source: Option<String>,
    pub is_active: Option<bool>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    /// Events still running on or after this date.
    pub date_from: Option<NaiveDate>,
    /// Events starting on or before this date.
    pub date_to: Option<NaiveDate>,
    pub search: Option<String>,
    pub ordering: EventOrdering,
    pub pagination: Pagination,
}

impl EventQuery {
    pub fn matches(&self, record: &ProductionRecord) -> bool {
        let f = &record.fields;
        eq_opt(&self.city, &f.city)
            && self.source.as_ref().map_or(true, |s| s == &f.source)
            && self.is_active.map_or(true, |a| a == record.is_active)
            && self.date_start.map_or(true, |d| f.date_start == Some(d))
            && self.date_end.map_or(true, |d| f.date_end == Some(d))
            && self.date_from.map_or(true, |from| {
                f.date_end.or(f.date_start).map_or(false, |last| last >= from)
            })
            && self.date_to.map_or(true, |to| f.date_start.map_or(false, |start| start <= to))
            && search_matches(
                self.search.as_deref(),
                &[
                    Some(f.title.as_str()),
                    f.description.as_deref(),
                    f.location_name.as_deref(),
                    f.location_address.as_deref(),
                ],
            )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StagingQuery {
    pub city: Option<String>,
    pub source: Option<String>,
    pub uuid: Option<String>,
    pub search: Option<String>,
    pub pagination: Pagination,
}

impl StagingQuery {
    pub fn matches(&self, record: &StagingRecord) -> bool {
        let f = &record.fields;
        eq_opt(&self.city, &f.city)
            && self.source.as_ref().map_or(true, |s| s == &f.source)
            && self.uuid.as_ref().map_or(true, |u| u == &record.uuid)
            && search_matches(
                self.search.as_deref(),
                &[
                    Some(f.title.as_str()),
                    f.description.as_deref(),
                    f.location_name.as_deref(),
                ],
            )
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunQuery {
    pub run_type: Option<String>,
    pub source: Option<String>,
    pub status: Option<RunStatus>,
    pub pagination: Pagination,
}

impl RunQuery {
    pub fn matches(&self, run: &RunRecord) -> bool {
        self.run_type.as_ref().map_or(true, |t| t == &run.run_type)
            && eq_opt(&self.source, &run.source)
            && self.status.map_or(true, |s| s == run.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorQuery {
    pub error_type: Option<ErrorCategory>,
    pub source: Option<String>,
    pub run_id: Option<String>,
    pub search: Option<String>,
    pub pagination: Pagination,
}

impl ErrorQuery {
    pub fn matches(&self, entry: &ErrorLogEntry) -> bool {
        self.error_type.map_or(true, |t| t == entry.error_type)
            && eq_opt(&self.source, &entry.source)
            && self.run_id.as_ref().map_or(true, |r| r == &entry.run_id)
            && search_matches(
                self.search.as_deref(),
                &[Some(entry.error_message.as_str()), entry.json_file.as_deref()],
            )
    }
}

fn eq_opt(filter: &Option<String>, value: &Option<String>) -> bool {
    match filter {
        Some(wanted) => value.as_deref() == Some(wanted.as_str()),
        None => true,
    }
}

/// Case-insensitive substring match over any of the haystacks.
pub fn search_matches(needle: Option<&str>, haystacks: &[Option<&str>]) -> bool {
    let Some(needle) = needle.map(str::trim).filter(|n| !n.is_empty()) else {
        return true;
    };
    let needle = needle.to_lowercase();
    haystacks
        .iter()
        .flatten()
        .any(|h| h.to_lowercase().contains(&needle))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: Option<String>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_events: u64,
    pub active_events: u64,
    pub events_by_city: Vec<FacetCount>,
    pub events_by_source: Vec<FacetCount>,
    pub recent_etl_runs: Vec<RunRecord>,
    pub staging_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_parses_descending_prefix() {
        let ord: EventOrdering = "-created_at".parse().unwrap();
        assert_eq!(ord.field, EventOrderField::CreatedAt);
        assert!(ord.descending);
        let ord: EventOrdering = "title".parse().unwrap();
        assert!(!ord.descending);
        assert!("price".parse::<EventOrdering>().is_err());
    }

    #[test]
    fn pagination_clamps_and_slices() {
        let p = Pagination::new(Some(0), Some(10_000));
        assert_eq!(p.page, 1);
        assert_eq!(p.page_size, MAX_PAGE_SIZE);

        let page = Page::from_vec((1..=7).collect::<Vec<_>>(), Pagination::new(Some(2), Some(3)));
        assert_eq!(page.count, 7);
        assert_eq!(page.results, vec![4, 5, 6]);
    }

    #[test]
    fn huge_page_number_saturates_to_an_empty_page() {
        let p = Pagination::new(Some(usize::MAX), Some(MAX_PAGE_SIZE));
        assert_eq!(p.offset(), usize::MAX);
        let page = Page::from_vec(vec![1, 2, 3], p);
        assert_eq!(page.count, 3);
        assert!(page.results.is_empty());
    }

    #[test]
    fn error_category_round_trips_through_str() {
        for cat in [
            ErrorCategory::MissingRequiredFields,
            ErrorCategory::InvalidJson,
            ErrorCategory::MalformedRecord,
            ErrorCategory::DbInsertError,
            ErrorCategory::MalformedBatch,
        ] {
            assert_eq!(cat.as_str().parse::<ErrorCategory>().unwrap(), cat);
        }
    }

    #[test]
    fn search_is_case_insensitive_and_skips_missing_fields() {
        assert!(search_matches(Some("jazz"), &[None, Some("Serata JAZZ dal vivo")]));
        assert!(!search_matches(Some("rock"), &[Some("Jazz"), None]));
        assert!(search_matches(Some("  "), &[None]));
    }

    #[test]
    fn patch_only_touches_present_fields() {
        let now = Utc::now();
        let mut record = ProductionRecord {
            id: 1,
            uuid: "a".into(),
            content_hash: Some("h1".into()),
            fields: EventFields {
                source: "city_today".into(),
                title: "Concert".into(),
                city: Some("Milano".into()),
                ..Default::default()
            },
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let patch = EventPatch {
            title: Some("Concert (sold out)".into()),
            is_active: Some(false),
            ..Default::default()
        };
        patch.apply_to(&mut record);
        assert_eq!(record.fields.title, "Concert (sold out)");
        assert_eq!(record.fields.city.as_deref(), Some("Milano"));
        assert!(!record.is_active);
    }
}
