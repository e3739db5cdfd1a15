//! Token-protected staging API for producers that push instead of writing batch files.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use eventi_adapters::content_fingerprint;
use eventi_core::{EventFields, NewStagingRecord, Page, StagingRecord};
use eventi_storage::StoreError;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use crate::{ApiError, ApiResult, AppState, Scope, StagingListParams};

const REQUIRED: &str = "This field is required.";
const UUID_MAX_LEN: usize = 64;
const SOURCE_MAX_LEN: usize = 50;

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/external/staging", get(list).post(create))
        .route("/api/external/staging/bulk", post(bulk_create))
        .route("/api/external/staging/clear_source", delete(clear_source))
        .route("/api/external/staging/{id}", get(detail).delete(remove))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExternalEvent {
    uuid: Option<String>,
    content_hash: Option<String>,
    source: Option<String>,
    url: Option<String>,
    title: Option<String>,
    description: Option<String>,
    category: Option<OneOrMany>,
    image_url: Option<String>,
    city: Option<String>,
    location_name: Option<String>,
    location_address: Option<String>,
    price: Option<String>,
    website: Option<String>,
    date_start: Option<NaiveDate>,
    date_end: Option<NaiveDate>,
    time_info: Option<String>,
    schedule: Option<String>,
    weekdays: Option<OneOrMany>,
    raw_data: Option<JsonValue>,
    scraped_at: Option<DateTime<Utc>>,
}

type FieldErrors = BTreeMap<&'static str, String>;

fn required(
    errors: &mut FieldErrors,
    field: &'static str,
    value: Option<String>,
    max_len: Option<usize>,
) -> String {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => {
            errors.insert(field, REQUIRED.to_string());
            String::new()
        }
        Some(v) => {
            if let Some(max) = max_len.filter(|max| v.chars().count() > *max) {
                errors.insert(field, format!("Ensure this field has no more than {max} characters."));
            }
            v
        }
    }
}

/// Validate one pushed event; field errors are keyed by field name.
fn validate(value: JsonValue) -> Result<NewStagingRecord, FieldErrors> {
    if !value.is_object() {
        return Err(FieldErrors::from([("non_field_errors", "Expected an object.".to_string())]));
    }
    let event: ExternalEvent = serde_json::from_value(value.clone())
        .map_err(|e| FieldErrors::from([("non_field_errors", e.to_string())]))?;

    let mut errors = FieldErrors::new();
    let uuid = required(&mut errors, "uuid", event.uuid, Some(UUID_MAX_LEN));
    let source = required(&mut errors, "source", event.source, Some(SOURCE_MAX_LEN));
    let title = required(&mut errors, "title", event.title, None);
    if !errors.is_empty() {
        return Err(errors);
    }

    let content_hash = event
        .content_hash
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| {
            content_fingerprint(
                event.description.as_deref(),
                event.price.as_deref(),
                event.time_info.as_deref(),
            )
        });

    Ok(NewStagingRecord {
        uuid,
        content_hash: Some(content_hash),
        fields: EventFields {
            source,
            url: event.url,
            title,
            description: event.description,
            category: event.category.map(|c| match c {
                OneOrMany::One(one) => vec![one],
                OneOrMany::Many(many) => many,
            }),
            image_url: event.image_url,
            city: event.city,
            location_name: event.location_name,
            location_address: event.location_address,
            price: event.price,
            website: event.website,
            date_start: event.date_start,
            date_end: event.date_end,
            time_info: event.time_info,
            schedule: event.schedule,
            weekdays: event.weekdays.map(|w| match w {
                OneOrMany::One(one) => one,
                OneOrMany::Many(many) => many.join(", "),
            }),
            raw_data: Some(event.raw_data.unwrap_or(value)),
            scraped_at: event.scraped_at,
        },
    })
}

async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<StagingListParams>,
) -> ApiResult<Json<Page<StagingRecord>>> {
    state.tokens.authorize(&headers, Scope::Read)?;
    Ok(Json(state.store.list_staging(&params.into_query()).await?))
}

async fn detail(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<StagingRecord>> {
    state.tokens.authorize(&headers, Scope::Read)?;
    state
        .store
        .get_staging(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<JsonValue>,
) -> ApiResult<(StatusCode, Json<StagingRecord>)> {
    state.tokens.authorize(&headers, Scope::Write)?;
    let record = validate(body).map_err(|errors| ApiError::Invalid {
        message: "invalid event".to_string(),
        details: json!(errors),
    })?;
    let created = state
        .store
        .insert_staging_batch(std::slice::from_ref(&record))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::Message("staging insert returned no row".to_string()))?;
    info!(id = created.id, uuid = %created.uuid, source = %created.fields.source, "external staging event created");
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Default, Deserialize)]
struct BulkBody {
    #[serde(default)]
    events: Vec<JsonValue>,
}

async fn bulk_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BulkBody>,
) -> ApiResult<(StatusCode, Json<JsonValue>)> {
    state.tokens.authorize(&headers, Scope::Write)?;
    if body.events.is_empty() {
        return Err(ApiError::BadRequest(
            "No events provided. Expected {\"events\": [...]}".to_string(),
        ));
    }

    let mut records = Vec::with_capacity(body.events.len());
    let mut problems = Vec::new();
    for (index, value) in body.events.into_iter().enumerate() {
        match validate(value) {
            Ok(record) => records.push(record),
            Err(errors) => problems.push(json!({ "index": index, "errors": errors })),
        }
    }
    if !problems.is_empty() {
        return Err(ApiError::Invalid {
            message: format!(
                "{} of {} events are invalid; nothing was stored",
                problems.len(),
                problems.len() + records.len()
            ),
            details: JsonValue::Array(problems),
        });
    }

    let created = state.store.insert_staging_batch(&records).await?;
    info!(created = created.len(), "external staging bulk insert");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "created": created.len(), "events": created })),
    ))
}

#[derive(Debug, Default, Deserialize)]
struct ClearSourceParams {
    source: Option<String>,
}

async fn clear_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ClearSourceParams>,
) -> ApiResult<Json<JsonValue>> {
    state.tokens.authorize(&headers, Scope::Write)?;
    let source = params
        .source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("source parameter is required".to_string()))?;
    let deleted = state.store.delete_staging_by_source(&source).await?;
    info!(%source, deleted, "external staging source cleared");
    Ok(Json(json!({ "deleted": deleted, "source": source })))
}

async fn remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.tokens.authorize(&headers, Scope::Write)?;
    if state.store.delete_staging(id).await? {
        info!(id, "external staging event deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{seeded_store, test_app};
    use axum::body::Body;
    use axum::http::{header, Request};
    use eventi_storage::EventStore;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<JsonValue>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, JsonValue) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(JsonValue::Null))
    }

    #[test]
    fn validation_reports_every_missing_field() {
        let errors = validate(json!({"title": "  "})).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert_eq!(errors["uuid"], REQUIRED);
        let errors = validate(json!({"uuid": "x".repeat(65), "source": "s", "title": "t"})).unwrap_err();
        assert!(errors["uuid"].contains("64"));
        assert!(validate(json!([1])).is_err());
    }

    #[test]
    fn validation_normalizes_category_and_weekdays() {
        let record = validate(json!({
            "uuid": "u1", "source": "partner", "title": "Sagra",
            "category": "Food", "weekdays": ["sab", "dom"], "date_start": "2026-05-01"
        }))
        .unwrap();
        assert_eq!(record.fields.category, Some(vec!["Food".to_string()]));
        assert_eq!(record.fields.weekdays.as_deref(), Some("sab, dom"));
        assert!(record.fields.raw_data.is_some());
    }

    #[test]
    fn missing_content_hash_is_derived_from_content() {
        let derived = validate(json!({
            "uuid": "u1", "source": "partner", "title": "Sagra",
            "description": "Polenta", "price": "5 EUR", "time_info": "dalle 19"
        }))
        .unwrap();
        assert_eq!(
            derived.content_hash,
            Some(content_fingerprint(Some("Polenta"), Some("5 EUR"), Some("dalle 19")))
        );

        let given = validate(json!({
            "uuid": "u1", "source": "partner", "title": "Sagra", "content_hash": "abc"
        }))
        .unwrap();
        assert_eq!(given.content_hash.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_401_and_read_token_cannot_write() {
        let app = test_app(seeded_store().await);
        let (status, _) = call(app.clone(), request("GET", "/api/external/staging", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(app.clone(), request("GET", "/api/external/staging", Some("guess"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(app.clone(), request("GET", "/api/external/staging", Some("reader"), None)).await;
        assert_eq!(status, StatusCode::OK);
        let body = json!({"uuid": "u", "source": "s", "title": "t"});
        let (status, _) = call(app, request("POST", "/api/external/staging", Some("reader"), Some(body))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let store = seeded_store().await;
        let app = test_app(store.clone());

        let (status, body) = call(
            app.clone(),
            request("POST", "/api/external/staging/bulk", Some("writer"), Some(json!({"events": []}))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "No events provided. Expected {\"events\": [...]}");

        let mixed = json!({"events": [
            {"uuid": "p1", "source": "partner", "title": "Ok"},
            {"uuid": "p2", "source": "partner"}
        ]});
        let (status, body) = call(
            app.clone(),
            request("POST", "/api/external/staging/bulk", Some("writer"), Some(mixed)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["details"][0]["index"], 1);
        assert_eq!(body["details"][0]["errors"]["title"], REQUIRED);
        assert_eq!(store.count_staging().await.unwrap(), 0);

        let good = json!({"events": [
            {"uuid": "p1", "source": "partner", "title": "Ok"},
            {"uuid": "p2", "source": "partner", "title": "Also ok", "category": ["A", "B"]}
        ]});
        let (status, body) = call(
            app,
            request("POST", "/api/external/staging/bulk", Some("writer"), Some(good)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["created"], 2);
        assert_eq!(body["events"][1]["category"], json!(["A", "B"]));
        assert_eq!(store.count_staging().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn clear_source_requires_source_and_reports_deleted() {
        let store = seeded_store().await;
        let app = test_app(store.clone());
        for (uuid, source) in [("p1", "partner"), ("p2", "partner"), ("o1", "other")] {
            let body = json!({"uuid": uuid, "source": source, "title": "t"});
            let (status, _) = call(
                app.clone(),
                request("POST", "/api/external/staging", Some("writer"), Some(body)),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, body) = call(
            app.clone(),
            request("DELETE", "/api/external/staging/clear_source", Some("writer"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "source parameter is required");

        let (status, body) = call(
            app,
            request("DELETE", "/api/external/staging/clear_source?source=partner", Some("writer"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"deleted": 2, "source": "partner"}));
        assert_eq!(store.count_staging().await.unwrap(), 1);
    }
}
