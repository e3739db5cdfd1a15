use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventi_core::{
    DashboardStats, ErrorCategory, ErrorLogEntry, ErrorQuery, EventFields, EventPatch, EventQuery,
    FacetCount, NewErrorLogEntry, NewRunRecord, NewStagingRecord, Page, ProductionRecord, RunQuery,
    RunRecord, RunStatus, StagingQuery, StagingRecord,
};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{info, warn};

use crate::{EventFacet, EventStore, MergePlan, StoreError, StoreResult, RECENT_RUNS, TOP_CITIES};

const EVENT_COLUMNS: &str = "uuid, content_hash, source, url, title, description, category, \
     image_url, city, location_name, location_address, price, website, date_start, date_end, \
     time_info, schedule, weekdays, raw_data, scraped_at";

const RUN_COLUMNS: &str = "id, run_type, source, cities, periodo, started_at, \
     staging_completed_at, upsert_completed_at, staging_count, inserted_count, updated_count, \
     unchanged_count, error_count, status, error_message";

const ERROR_COLUMNS: &str =
    "id, error_type, source, json_file, record_data, error_message, run_id, created_at";

/// Postgres-backed store over the `events_data` schema.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn bind_event<'q>(
    query: Query<'q, Postgres, PgArguments>,
    uuid: &str,
    content_hash: &Option<String>,
    fields: &EventFields,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(uuid.to_string())
        .bind(content_hash.clone())
        .bind(fields.source.clone())
        .bind(fields.url.clone())
        .bind(fields.title.clone())
        .bind(fields.description.clone())
        .bind(fields.category.clone())
        .bind(fields.image_url.clone())
        .bind(fields.city.clone())
        .bind(fields.location_name.clone())
        .bind(fields.location_address.clone())
        .bind(fields.price.clone())
        .bind(fields.website.clone())
        .bind(fields.date_start)
        .bind(fields.date_end)
        .bind(fields.time_info.clone())
        .bind(fields.schedule.clone())
        .bind(fields.weekdays.clone())
        .bind(fields.raw_data.clone())
        .bind(fields.scraped_at)
}

fn fields_from_row(row: &PgRow) -> Result<EventFields, sqlx::Error> {
    Ok(EventFields {
        source: row.try_get("source")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        image_url: row.try_get("image_url")?,
        city: row.try_get("city")?,
        location_name: row.try_get("location_name")?,
        location_address: row.try_get("location_address")?,
        price: row.try_get("price")?,
        website: row.try_get("website")?,
        date_start: row.try_get("date_start")?,
        date_end: row.try_get("date_end")?,
        time_info: row.try_get("time_info")?,
        schedule: row.try_get("schedule")?,
        weekdays: row.try_get("weekdays")?,
        raw_data: row.try_get("raw_data")?,
        scraped_at: row.try_get("scraped_at")?,
    })
}

fn staging_from_row(row: &PgRow) -> Result<StagingRecord, sqlx::Error> {
    Ok(StagingRecord {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        content_hash: row.try_get("content_hash")?,
        fields: fields_from_row(row)?,
        loaded_at: row.try_get("loaded_at")?,
    })
}

fn production_from_row(row: &PgRow) -> Result<ProductionRecord, sqlx::Error> {
    Ok(ProductionRecord {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        content_hash: row.try_get("content_hash")?,
        fields: fields_from_row(row)?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn count_col(row: &PgRow, col: &str) -> Result<u64, sqlx::Error> {
    let value: i64 = row.try_get(col)?;
    Ok(value.max(0) as u64)
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        run_type: row.try_get("run_type")?,
        source: row.try_get("source")?,
        cities: row.try_get("cities")?,
        periodo: row.try_get("periodo")?,
        started_at: row.try_get("started_at")?,
        staging_completed_at: row.try_get("staging_completed_at")?,
        upsert_completed_at: row.try_get("upsert_completed_at")?,
        staging_count: count_col(row, "staging_count")?,
        inserted_count: count_col(row, "inserted_count")?,
        updated_count: count_col(row, "updated_count")?,
        unchanged_count: count_col(row, "unchanged_count")?,
        error_count: count_col(row, "error_count")?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        error_message: row.try_get("error_message")?,
    })
}

fn error_from_row(row: &PgRow) -> Result<ErrorLogEntry, sqlx::Error> {
    let error_type: String = row.try_get("error_type")?;
    let run_id: Option<String> = row.try_get("run_id")?;
    let error_message: Option<String> = row.try_get("error_message")?;
    Ok(ErrorLogEntry {
        id: row.try_get("id")?,
        error_type: error_type
            .parse::<ErrorCategory>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        source: row.try_get("source")?,
        json_file: row.try_get("json_file")?,
        record_data: row.try_get("record_data")?,
        error_message: error_message.unwrap_or_default(),
        run_id: run_id.unwrap_or_default(),
        created_at: row.try_get("created_at")?,
    })
}

fn like_pattern(term: &str) -> String {
    let escaped = term
        .trim()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn push_search(qb: &mut QueryBuilder<'_, Postgres>, term: Option<&str>, columns: &[&str]) {
    let Some(term) = term.map(str::trim).filter(|t| !t.is_empty()) else {
        return;
    };
    let pattern = like_pattern(term);
    qb.push(" AND (");
    for (idx, column) in columns.iter().enumerate() {
        if idx > 0 {
            qb.push(" OR ");
        }
        qb.push(format!("{column} ILIKE "));
        qb.push_bind(pattern.clone());
    }
    qb.push(")");
}

fn push_limit(qb: &mut QueryBuilder<'_, Postgres>, page: &eventi_core::Pagination) {
    qb.push(" LIMIT ");
    qb.push_bind(page.page_size as i64);
    qb.push(" OFFSET ");
    qb.push_bind(i64::try_from(page.offset()).unwrap_or(i64::MAX));
}

fn push_event_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    if let Some(city) = &query.city {
        qb.push(" AND city = ").push_bind(city.clone());
    }
    if let Some(source) = &query.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(active) = query.is_active {
        qb.push(" AND is_active = ").push_bind(active);
    }
    if let Some(date) = query.date_start {
        qb.push(" AND date_start = ").push_bind(date);
    }
    if let Some(date) = query.date_end {
        qb.push(" AND date_end = ").push_bind(date);
    }
    if let Some(from) = query.date_from {
        qb.push(" AND COALESCE(date_end, date_start) >= ").push_bind(from);
    }
    if let Some(to) = query.date_to {
        qb.push(" AND date_start <= ").push_bind(to);
    }
    push_search(
        qb,
        query.search.as_deref(),
        &["title", "description", "location_name", "location_address"],
    );
}

fn push_staging_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &StagingQuery) {
    if let Some(city) = &query.city {
        qb.push(" AND city = ").push_bind(city.clone());
    }
    if let Some(source) = &query.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(uuid) = &query.uuid {
        qb.push(" AND uuid = ").push_bind(uuid.clone());
    }
    push_search(qb, query.search.as_deref(), &["title", "description", "location_name"]);
}

fn push_run_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &RunQuery) {
    if let Some(run_type) = &query.run_type {
        qb.push(" AND run_type = ").push_bind(run_type.clone());
    }
    if let Some(source) = &query.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
}

fn push_error_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &ErrorQuery) {
    if let Some(error_type) = query.error_type {
        qb.push(" AND error_type = ").push_bind(error_type.as_str());
    }
    if let Some(source) = &query.source {
        qb.push(" AND source = ").push_bind(source.clone());
    }
    if let Some(run_id) = &query.run_id {
        qb.push(" AND run_id = ").push_bind(run_id.clone());
    }
    push_search(qb, query.search.as_deref(), &["error_message", "json_file"]);
}

async fn fetch_count(pool: &PgPool, mut qb: QueryBuilder<'_, Postgres>) -> StoreResult<u64> {
    let row = qb.build().fetch_one(pool).await?;
    Ok(count_col(&row, "total")?)
}

async fn facet_query(pool: &PgPool, column: &str, limit: Option<usize>) -> StoreResult<Vec<FacetCount>> {
    let mut sql = format!(
        "SELECT {column} AS value, COUNT(*) AS count FROM events_data.production_events \
         GROUP BY {column} ORDER BY count DESC, value"
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(FacetCount {
            value: row.try_get("value")?,
            count: count_col(&row, "count")?,
        });
    }
    Ok(out)
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn truncate_staging(&self) -> StoreResult<()> {
        sqlx::query("TRUNCATE TABLE events_data.staging_events RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_staging(&self, record: &NewStagingRecord) -> StoreResult<i64> {
        let sql = format!(
            "INSERT INTO events_data.staging_events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             RETURNING id"
        );
        let row = bind_event(sqlx::query(&sql), &record.uuid, &record.content_hash, &record.fields)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("id")?)
    }

    async fn insert_staging_batch(
        &self,
        records: &[NewStagingRecord],
    ) -> StoreResult<Vec<StagingRecord>> {
        let sql = format!(
            "INSERT INTO events_data.staging_events ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20) \
             RETURNING id, loaded_at, {EVENT_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let row = bind_event(sqlx::query(&sql), &record.uuid, &record.content_hash, &record.fields)
                .fetch_one(&mut *tx)
                .await?;
            out.push(staging_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn staging_in_load_order(&self) -> StoreResult<Vec<StagingRecord>> {
        let sql = format!(
            "SELECT id, loaded_at, {EVENT_COLUMNS} FROM events_data.staging_events ORDER BY id"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(staging_from_row(&row)?);
        }
        Ok(out)
    }

    async fn list_staging(&self, query: &StagingQuery) -> StoreResult<Page<StagingRecord>> {
        let mut count_qb = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM events_data.staging_events WHERE TRUE",
        );
        push_staging_filters(&mut count_qb, query);
        let count = fetch_count(&self.pool, count_qb).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT id, loaded_at, {EVENT_COLUMNS} FROM events_data.staging_events WHERE TRUE"
        ));
        push_staging_filters(&mut qb, query);
        qb.push(" ORDER BY loaded_at DESC, id DESC");
        push_limit(&mut qb, &query.pagination);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(staging_from_row(&row)?);
        }
        Ok(Page {
            count,
            page: query.pagination.page,
            page_size: query.pagination.page_size,
            results,
        })
    }

    async fn get_staging(&self, id: i64) -> StoreResult<Option<StagingRecord>> {
        let sql = format!(
            "SELECT id, loaded_at, {EVENT_COLUMNS} FROM events_data.staging_events WHERE id = $1"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(staging_from_row).transpose()?)
    }

    async fn delete_staging(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM events_data.staging_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_staging_by_source(&self, source: &str) -> StoreResult<u64> {
        let res = sqlx::query("DELETE FROM events_data.staging_events WHERE source = $1")
            .bind(source)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn count_staging(&self) -> StoreResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM events_data.staging_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count_col(&row, "total")?)
    }

    async fn production_fingerprints(
        &self,
        uuids: &[String],
    ) -> StoreResult<HashMap<String, Option<String>>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, content_hash
              FROM events_data.production_events
             WHERE uuid = ANY($1)
            "#,
        )
        .bind(uuids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("uuid")?, row.try_get("content_hash")?);
        }
        Ok(out)
    }

    async fn apply_merge(&self, plan: &MergePlan, now: DateTime<Utc>) -> StoreResult<()> {
        let insert_sql = format!(
            "INSERT INTO events_data.production_events ({EVENT_COLUMNS}, is_active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, TRUE, $21, $21)"
        );
        let update_sql = "UPDATE events_data.production_events SET \
             content_hash = $2, source = $3, url = $4, title = $5, description = $6, category = $7, \
             image_url = $8, city = $9, location_name = $10, location_address = $11, price = $12, \
             website = $13, date_start = $14, date_end = $15, time_info = $16, schedule = $17, \
             weekdays = $18, raw_data = $19, scraped_at = $20, updated_at = $21 \
             WHERE uuid = $1";

        // Dropping `tx` on any early return rolls the whole merge back.
        let mut tx = self.pool.begin().await?;
        for staged in &plan.inserts {
            bind_event(sqlx::query(&insert_sql), &staged.uuid, &staged.content_hash, &staged.fields)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        for staged in &plan.updates {
            let res = bind_event(sqlx::query(update_sql), &staged.uuid, &staged.content_hash, &staged.fields)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            if res.rows_affected() == 0 {
                // Removed since the plan was built: recreate it from staging.
                warn!(uuid = %staged.uuid, "update target vanished; inserting instead");
                bind_event(sqlx::query(&insert_sql), &staged.uuid, &staged.content_hash, &staged.fields)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_production(&self, query: &EventQuery) -> StoreResult<Page<ProductionRecord>> {
        let mut count_qb = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM events_data.production_events WHERE TRUE",
        );
        push_event_filters(&mut count_qb, query);
        let count = fetch_count(&self.pool, count_qb).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT id, {EVENT_COLUMNS}, is_active, created_at, updated_at \
             FROM events_data.production_events WHERE TRUE"
        ));
        push_event_filters(&mut qb, query);
        let dir = if query.ordering.descending { "DESC" } else { "ASC" };
        qb.push(format!(
            " ORDER BY {} {dir} NULLS LAST, id {dir}",
            query.ordering.field.column()
        ));
        push_limit(&mut qb, &query.pagination);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(production_from_row(&row)?);
        }
        Ok(Page {
            count,
            page: query.pagination.page,
            page_size: query.pagination.page_size,
            results,
        })
    }

    async fn get_production(&self, id: i64) -> StoreResult<Option<ProductionRecord>> {
        let sql = format!(
            "SELECT id, {EVENT_COLUMNS}, is_active, created_at, updated_at \
             FROM events_data.production_events WHERE id = $1"
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(production_from_row).transpose()?)
    }

    async fn get_production_by_uuid(&self, uuid: &str) -> StoreResult<Option<ProductionRecord>> {
        let sql = format!(
            "SELECT id, {EVENT_COLUMNS}, is_active, created_at, updated_at \
             FROM events_data.production_events WHERE uuid = $1"
        );
        let row = sqlx::query(&sql).bind(uuid).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(production_from_row).transpose()?)
    }

    async fn update_production(
        &self,
        id: i64,
        patch: &EventPatch,
    ) -> StoreResult<Option<ProductionRecord>> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "SELECT id, {EVENT_COLUMNS}, is_active, created_at, updated_at \
             FROM events_data.production_events WHERE id = $1 FOR UPDATE"
        );
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let mut record = production_from_row(&row)?;
        patch.apply_to(&mut record);
        record.updated_at = Utc::now();

        let update_sql = "UPDATE events_data.production_events SET \
             content_hash = $2, source = $3, url = $4, title = $5, description = $6, category = $7, \
             image_url = $8, city = $9, location_name = $10, location_address = $11, price = $12, \
             website = $13, date_start = $14, date_end = $15, time_info = $16, schedule = $17, \
             weekdays = $18, raw_data = $19, scraped_at = $20, updated_at = $21, is_active = $22 \
             WHERE uuid = $1";
        bind_event(sqlx::query(update_sql), &record.uuid, &record.content_hash, &record.fields)
            .bind(record.updated_at)
            .bind(record.is_active)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(record))
    }

    async fn toggle_active(&self, id: i64) -> StoreResult<Option<bool>> {
        let row = sqlx::query(
            r#"
            UPDATE events_data.production_events
               SET is_active = NOT is_active,
                   updated_at = NOW()
             WHERE id = $1
         RETURNING is_active
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get::<bool, _>("is_active")).transpose()?)
    }

    async fn delete_production(&self, id: i64) -> StoreResult<bool> {
        let res = sqlx::query("DELETE FROM events_data.production_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn production_facets(&self, facet: EventFacet) -> StoreResult<Vec<FacetCount>> {
        let column = match facet {
            EventFacet::City => "city",
            EventFacet::Source => "source",
        };
        facet_query(&self.pool, column, None).await
    }

    async fn dashboard_stats(&self) -> StoreResult<DashboardStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE is_active) AS active
              FROM events_data.production_events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let events_by_city = facet_query(&self.pool, "city", Some(TOP_CITIES)).await?;
        let events_by_source = facet_query(&self.pool, "source", None).await?;
        let recent = self
            .list_runs(&RunQuery {
                pagination: eventi_core::Pagination::new(Some(1), Some(RECENT_RUNS)),
                ..Default::default()
            })
            .await?;
        Ok(DashboardStats {
            total_events: count_col(&totals, "total")?,
            active_events: count_col(&totals, "active")?,
            events_by_city,
            events_by_source,
            recent_etl_runs: recent.results,
            staging_count: self.count_staging().await?,
        })
    }

    async fn insert_error(&self, entry: &NewErrorLogEntry) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO events_data.etl_errors
                   (error_type, source, json_file, record_data, error_message, run_id)
            VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id
            "#,
        )
        .bind(entry.error_type.as_str())
        .bind(entry.source.clone())
        .bind(entry.json_file.clone())
        .bind(entry.record_data.clone())
        .bind(entry.error_message.clone())
        .bind(entry.run_id.clone())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn list_errors(&self, query: &ErrorQuery) -> StoreResult<Page<ErrorLogEntry>> {
        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM events_data.etl_errors WHERE TRUE");
        push_error_filters(&mut count_qb, query);
        let count = fetch_count(&self.pool, count_qb).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {ERROR_COLUMNS} FROM events_data.etl_errors WHERE TRUE"
        ));
        push_error_filters(&mut qb, query);
        qb.push(" ORDER BY created_at DESC, id DESC");
        push_limit(&mut qb, &query.pagination);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(error_from_row(&row)?);
        }
        Ok(Page {
            count,
            page: query.pagination.page,
            page_size: query.pagination.page_size,
            results,
        })
    }

    async fn get_error(&self, id: i64) -> StoreResult<Option<ErrorLogEntry>> {
        let sql = format!("SELECT {ERROR_COLUMNS} FROM events_data.etl_errors WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(error_from_row).transpose()?)
    }

    async fn insert_run(&self, run: &NewRunRecord) -> StoreResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO events_data.etl_runs (
                run_type, source, cities, periodo, started_at, staging_completed_at,
                upsert_completed_at, staging_count, inserted_count, updated_count,
                unchanged_count, error_count, status, error_message
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING id
            "#,
        )
        .bind(run.run_type.clone())
        .bind(run.source.clone())
        .bind(run.cities.clone())
        .bind(run.periodo.clone())
        .bind(run.started_at)
        .bind(run.staging_completed_at)
        .bind(run.upsert_completed_at)
        .bind(run.staging_count as i64)
        .bind(run.counts.inserted as i64)
        .bind(run.counts.updated as i64)
        .bind(run.counts.unchanged as i64)
        .bind(run.error_count as i64)
        .bind(run.status.as_str())
        .bind(run.error_message.clone())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Page<RunRecord>> {
        let mut count_qb =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM events_data.etl_runs WHERE TRUE");
        push_run_filters(&mut count_qb, query);
        let count = fetch_count(&self.pool, count_qb).await?;

        let mut qb = QueryBuilder::new(format!(
            "SELECT {RUN_COLUMNS} FROM events_data.etl_runs WHERE TRUE"
        ));
        push_run_filters(&mut qb, query);
        qb.push(" ORDER BY started_at DESC, id DESC");
        push_limit(&mut qb, &query.pagination);
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(run_from_row(&row)?);
        }
        Ok(Page {
            count,
            page: query.pagination.page,
            page_size: query.pagination.page_size,
            results,
        })
    }

    async fn get_run(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM events_data.etl_runs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(run_from_row).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern(" 50%_off "), "%50\\%\\_off%");
    }

    #[test]
    fn event_filters_bind_each_present_field() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE TRUE");
        push_event_filters(
            &mut qb,
            &EventQuery {
                city: Some("Milano".into()),
                is_active: Some(true),
                search: Some("jazz".into()),
                ..Default::default()
            },
        );
        let sql = qb.sql();
        assert!(sql.contains("city = $1"));
        assert!(sql.contains("is_active = $2"));
        assert!(sql.contains("title ILIKE $3"));
        assert!(sql.contains("location_address ILIKE $6"));
    }
}
