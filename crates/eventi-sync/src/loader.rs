use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use eventi_adapters::ProducerRegistry;
use eventi_core::{ErrorCategory, EventFields, NewErrorLogEntry, NewStagingRecord};
use eventi_storage::{BatchInbox, BatchRef, EventStore};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub name: String,
    pub source: String,
    pub accepted: u64,
    pub errors: u64,
    /// False when the batch could not be read, parsed or renamed and stays pending.
    pub consumed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub accepted: u64,
    pub errors: u64,
    pub batches: Vec<BatchStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    Missing(Vec<&'static str>),
    Malformed(String),
}

/// Moves pending producer batches into staging, logging every record it
/// cannot accept instead of failing the batch.
pub struct StagingLoader<'a> {
    store: &'a dyn EventStore,
    inbox: &'a dyn BatchInbox,
    registry: &'a ProducerRegistry,
}

impl<'a> StagingLoader<'a> {
    pub fn new(
        store: &'a dyn EventStore,
        inbox: &'a dyn BatchInbox,
        registry: &'a ProducerRegistry,
    ) -> Self {
        Self {
            store,
            inbox,
            registry,
        }
    }

    pub async fn load_pending(&self, run_id: &str, now: DateTime<Utc>) -> Result<LoadReport, SyncError> {
        let mut report = LoadReport::default();
        for batch in self.inbox.pending().await.map_err(SyncError::Inbox)? {
            let stats = self.load_batch(&batch, run_id, now).await;
            report.accepted += stats.accepted;
            report.errors += stats.errors;
            report.batches.push(stats);
        }
        info!(
            accepted = report.accepted,
            errors = report.errors,
            batches = report.batches.len(),
            "staging load finished"
        );
        Ok(report)
    }

    /// Load one batch. Inbox failures are logged against the batch, which
    /// stays pending; they never stop the remaining batches.
    async fn load_batch(&self, batch: &BatchRef, run_id: &str, now: DateTime<Utc>) -> BatchStats {
        let source = self.registry.source_for_file(&batch.name).to_string();
        let mut stats = BatchStats {
            name: batch.name.clone(),
            source: source.clone(),
            accepted: 0,
            errors: 0,
            consumed: false,
        };
        let bytes = match self.inbox.read(batch).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(batch = %batch.name, error = %err, "batch could not be read; left pending");
                stats.errors += 1;
                self.log_error(NewErrorLogEntry {
                    error_type: ErrorCategory::MalformedBatch,
                    source: Some(source),
                    json_file: Some(batch.name.clone()),
                    record_data: None,
                    error_message: format!("could not read batch: {err}"),
                    run_id: run_id.to_string(),
                })
                .await;
                return stats;
            }
        };

        let records = match parse_batch(&bytes) {
            Ok(records) => records,
            Err(message) => {
                warn!(batch = %batch.name, %message, "unreadable batch left pending");
                stats.errors += 1;
                self.log_error(NewErrorLogEntry {
                    error_type: ErrorCategory::InvalidJson,
                    source: Some(source),
                    json_file: Some(batch.name.clone()),
                    record_data: None,
                    error_message: message,
                    run_id: run_id.to_string(),
                })
                .await;
                return stats;
            }
        };

        for record in records {
            let (category, message) = match normalize_record(&record, &source) {
                Ok(staged) => match self.store.insert_staging(&staged).await {
                    Ok(_) => {
                        stats.accepted += 1;
                        continue;
                    }
                    Err(err) => (ErrorCategory::DbInsertError, err.to_string()),
                },
                Err(Rejection::Missing(fields)) => (
                    ErrorCategory::MissingRequiredFields,
                    format!("Missing fields: {}", fields.join(", ")),
                ),
                Err(Rejection::Malformed(message)) => (ErrorCategory::MalformedRecord, message),
            };
            stats.errors += 1;
            self.log_error(NewErrorLogEntry {
                error_type: category,
                source: Some(source.clone()),
                json_file: Some(batch.name.clone()),
                record_data: Some(record),
                error_message: message,
                run_id: run_id.to_string(),
            })
            .await;
        }

        match self.inbox.mark_consumed(batch, now).await {
            Ok(()) => stats.consumed = true,
            Err(err) => {
                warn!(batch = %batch.name, error = %err, "batch loaded but could not be marked consumed");
                stats.errors += 1;
                self.log_error(NewErrorLogEntry {
                    error_type: ErrorCategory::MalformedBatch,
                    source: Some(stats.source.clone()),
                    json_file: Some(batch.name.clone()),
                    record_data: None,
                    error_message: format!("could not mark batch consumed: {err}"),
                    run_id: run_id.to_string(),
                })
                .await;
            }
        }
        info!(
            batch = %batch.name,
            source = %stats.source,
            accepted = stats.accepted,
            errors = stats.errors,
            consumed = stats.consumed,
            "batch loaded"
        );
        stats
    }

    async fn log_error(&self, entry: NewErrorLogEntry) {
        if let Err(err) = self.store.insert_error(&entry).await {
            warn!(
                error = %err,
                category = %entry.error_type,
                json_file = entry.json_file.as_deref().unwrap_or(""),
                "could not write error log entry"
            );
        }
    }
}

fn parse_batch(bytes: &[u8]) -> Result<Vec<JsonValue>, String> {
    match serde_json::from_slice::<JsonValue>(bytes).map_err(|e| e.to_string())? {
        JsonValue::Array(records) => Ok(records),
        other => Err(format!("expected a JSON array of events, found {}", json_kind(&other))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Validate one producer record and coerce it to staging column types.
pub(crate) fn normalize_record(record: &JsonValue, source: &str) -> Result<NewStagingRecord, Rejection> {
    let Some(map) = record.as_object() else {
        return Err(Rejection::Missing(vec!["uuid", "title"]));
    };
    let uuid = required_str(map, "uuid");
    let title = required_str(map, "title");
    let (Some(uuid), Some(title)) = (uuid, title) else {
        let mut missing = Vec::new();
        if uuid.is_none() {
            missing.push("uuid");
        }
        if title.is_none() {
            missing.push("title");
        }
        return Err(Rejection::Missing(missing));
    };

    Ok(NewStagingRecord {
        uuid: uuid.to_string(),
        content_hash: text(map, "content_hash")?,
        fields: EventFields {
            source: source.to_string(),
            url: text(map, "url")?,
            title: title.to_string(),
            description: text(map, "description")?,
            category: category(map)?,
            image_url: text(map, "image_url")?,
            city: text(map, "city")?,
            location_name: text(map, "location_name")?,
            location_address: text(map, "location_address")?,
            price: text(map, "price")?,
            website: text(map, "website")?,
            date_start: date(map, "date_start")?,
            date_end: date(map, "date_end")?,
            time_info: text(map, "time_info")?,
            schedule: text(map, "schedule")?,
            weekdays: weekdays(map)?,
            raw_data: Some(record.clone()),
            scraped_at: timestamp(map, "scraped_at")?,
        },
    })
}

fn required_str<'m>(map: &'m Map<String, JsonValue>, key: &str) -> Option<&'m str> {
    map.get(key).and_then(JsonValue::as_str).filter(|s| !s.is_empty())
}

fn malformed(key: &str, expected: &str, value: &JsonValue) -> Rejection {
    Rejection::Malformed(format!("field `{key}` must be {expected}, got {value}"))
}

fn text(map: &Map<String, JsonValue>, key: &str) -> Result<Option<String>, Rejection> {
    match map.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(malformed(key, "text", other)),
    }
}

fn string_list(key: &str, items: &[JsonValue]) -> Result<Vec<String>, Rejection> {
    items
        .iter()
        .map(|item| match item {
            JsonValue::String(s) => Ok(s.clone()),
            other => Err(malformed(key, "a list of strings", other)),
        })
        .collect()
}

fn category(map: &Map<String, JsonValue>) -> Result<Option<Vec<String>>, Rejection> {
    match map.get("category") {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(vec![s.clone()])),
        Some(JsonValue::Array(items)) => string_list("category", items).map(Some),
        Some(other) => Err(malformed("category", "a string or a list of strings", other)),
    }
}

fn weekdays(map: &Map<String, JsonValue>) -> Result<Option<String>, Rejection> {
    match map.get("weekdays") {
        Some(JsonValue::Array(items)) => Ok(Some(string_list("weekdays", items)?.join(", "))),
        _ => text(map, "weekdays"),
    }
}

fn date(map: &Map<String, JsonValue>, key: &str) -> Result<Option<NaiveDate>, Rejection> {
    match map.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(value @ JsonValue::String(s)) => {
            let s = s.trim();
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
                .map(Some)
                .ok_or_else(|| malformed(key, "a YYYY-MM-DD date", value))
        }
        Some(other) => Err(malformed(key, "a YYYY-MM-DD date", other)),
    }
}

fn timestamp(map: &Map<String, JsonValue>, key: &str) -> Result<Option<DateTime<Utc>>, Rejection> {
    match map.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(None),
        Some(value @ JsonValue::String(s)) => parse_timestamp(s.trim())
            .map(Some)
            .ok_or_else(|| malformed(key, "an ISO 8601 timestamp", value)),
        Some(other) => Err(malformed(key, "an ISO 8601 timestamp", other)),
    }
}

/// RFC 3339, or a naive ISO timestamp taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}
