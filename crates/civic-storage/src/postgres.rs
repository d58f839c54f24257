use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civic_core::{
    ClosedRequestRow, CountField, GroupCount, IngestionCheckpoint, Pin, RequestFilter,
    RequestType, ServiceRequest,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::{RequestStore, StoreError, UpsertOutcome};

/// Keeps each INSERT well below the 65535 bind parameter limit.
const UPSERT_CHUNK_ROWS: usize = 1000;

const REQUEST_COLUMNS: &str = "sr_number, created_date, updated_date, closed_date, request_type, \
     status, request_source, nc, nc_name, cd, address, latitude, longitude, police_precinct, \
     action_taken, owner";

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &PgStoreConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;
        info!(max_connections = config.max_connections, "connected postgres pool");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database schema is up to date");
        Ok(())
    }
}

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &RequestFilter) {
    builder.push(" WHERE TRUE");
    if let Some(start) = filter.start_date {
        builder.push(" AND created_date >= ").push_bind(start);
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND created_date <= ").push_bind(end);
    }
    if !filter.nc_list.is_empty() {
        builder
            .push(" AND nc_name = ANY(")
            .push_bind(filter.nc_list.clone())
            .push(")");
    }
    if !filter.request_types.is_empty() {
        builder
            .push(" AND request_type = ANY(")
            .push_bind(filter.request_types.clone())
            .push(")");
    }
}

fn request_from_row(row: &PgRow) -> Result<ServiceRequest, sqlx::Error> {
    let request_type: String = row.try_get("request_type")?;
    Ok(ServiceRequest {
        sr_number: row.try_get("sr_number")?,
        created_date: row.try_get("created_date")?,
        updated_date: row.try_get("updated_date")?,
        closed_date: row.try_get("closed_date")?,
        request_type: RequestType::from(request_type),
        status: row.try_get("status")?,
        request_source: row.try_get("request_source")?,
        nc: row.try_get("nc")?,
        nc_name: row.try_get("nc_name")?,
        cd: row.try_get("cd")?,
        address: row.try_get("address")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        police_precinct: row.try_get("police_precinct")?,
        action_taken: row.try_get("action_taken")?,
        owner: row.try_get("owner")?,
    })
}

fn checkpoint_from_row(row: &PgRow) -> Result<IngestionCheckpoint, sqlx::Error> {
    Ok(IngestionCheckpoint {
        partition_key: row.try_get("partition_key")?,
        last_offset: row.try_get("last_offset")?,
        record_count: row.try_get("record_count")?,
        high_watermark: row.try_get("high_watermark")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_checkpoint<'c, E>(executor: E, checkpoint: &IngestionCheckpoint) -> Result<(), sqlx::Error>
where
    E: sqlx::PgExecutor<'c>,
{
    sqlx::query(
        r#"
        INSERT INTO ingestion_checkpoints
               (partition_key, last_offset, record_count, high_watermark, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (partition_key) DO UPDATE
           SET last_offset = EXCLUDED.last_offset,
               record_count = EXCLUDED.record_count,
               high_watermark = EXCLUDED.high_watermark,
               updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&checkpoint.partition_key)
    .bind(checkpoint.last_offset)
    .bind(checkpoint.record_count)
    .bind(checkpoint.high_watermark)
    .bind(checkpoint.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl RequestStore for PgStore {
    async fn upsert_page(
        &self,
        rows: &[ServiceRequest],
        checkpoint: Option<&IngestionCheckpoint>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut outcome = UpsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO service_requests ({REQUEST_COLUMNS}) "
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.sr_number)
                    .push_bind(row.created_date)
                    .push_bind(row.updated_date)
                    .push_bind(row.closed_date)
                    .push_bind(row.request_type.as_str())
                    .push_bind(row.status.as_deref())
                    .push_bind(row.request_source.as_deref())
                    .push_bind(row.nc)
                    .push_bind(row.nc_name.as_deref())
                    .push_bind(row.cd)
                    .push_bind(row.address.as_deref())
                    .push_bind(row.latitude)
                    .push_bind(row.longitude)
                    .push_bind(row.police_precinct.as_deref())
                    .push_bind(row.action_taken.as_deref())
                    .push_bind(row.owner.as_deref());
            });
            // created_date is deliberately absent from the SET list.
            builder.push(
                r#"
                ON CONFLICT (sr_number) DO UPDATE
                   SET updated_date = EXCLUDED.updated_date,
                       closed_date = EXCLUDED.closed_date,
                       request_type = EXCLUDED.request_type,
                       status = EXCLUDED.status,
                       request_source = EXCLUDED.request_source,
                       nc = EXCLUDED.nc,
                       nc_name = EXCLUDED.nc_name,
                       cd = EXCLUDED.cd,
                       address = EXCLUDED.address,
                       latitude = EXCLUDED.latitude,
                       longitude = EXCLUDED.longitude,
                       police_precinct = EXCLUDED.police_precinct,
                       action_taken = EXCLUDED.action_taken,
                       owner = EXCLUDED.owner,
                       ingested_at = NOW()
                 WHERE (service_requests.updated_date, service_requests.closed_date,
                        service_requests.request_type, service_requests.status,
                        service_requests.request_source, service_requests.nc,
                        service_requests.nc_name, service_requests.cd,
                        service_requests.address, service_requests.latitude,
                        service_requests.longitude, service_requests.police_precinct,
                        service_requests.action_taken, service_requests.owner)
                       IS DISTINCT FROM
                       (EXCLUDED.updated_date, EXCLUDED.closed_date,
                        EXCLUDED.request_type, EXCLUDED.status,
                        EXCLUDED.request_source, EXCLUDED.nc,
                        EXCLUDED.nc_name, EXCLUDED.cd,
                        EXCLUDED.address, EXCLUDED.latitude,
                        EXCLUDED.longitude, EXCLUDED.police_precinct,
                        EXCLUDED.action_taken, EXCLUDED.owner)
                RETURNING (xmax = 0) AS inserted
                "#,
            );

            let returned = builder.build().fetch_all(&mut *tx).await?;
            let mut touched = 0u64;
            for row in &returned {
                let inserted: bool = row.try_get("inserted")?;
                if inserted {
                    outcome.inserted += 1;
                } else {
                    outcome.updated += 1;
                }
                touched += 1;
            }
            outcome.unchanged += chunk.len() as u64 - touched;
        }

        if let Some(checkpoint) = checkpoint {
            write_checkpoint(&mut *tx, checkpoint).await?;
        }
        tx.commit().await?;

        debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "committed page"
        );
        Ok(outcome)
    }

    async fn load_checkpoint(
        &self,
        partition_key: &str,
    ) -> Result<Option<IngestionCheckpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT partition_key, last_offset, record_count, high_watermark, updated_at
              FROM ingestion_checkpoints
             WHERE partition_key = $1
            "#,
        )
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(checkpoint_from_row).transpose()?)
    }

    async fn save_checkpoint(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError> {
        write_checkpoint(&self.pool, checkpoint).await?;
        Ok(())
    }

    async fn sr_numbers_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        let numbers = sqlx::query_scalar::<_, String>(
            r#"
            SELECT sr_number
              FROM service_requests
             WHERE created_date >= $1
               AND created_date <= $2
             ORDER BY sr_number
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(numbers)
    }

    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sr_numbers: &[String],
    ) -> Result<u64, StoreError> {
        if sr_numbers.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            DELETE FROM service_requests
             WHERE sr_number = ANY($1)
               AND created_date >= $2
               AND created_date <= $3
            "#,
        )
        .bind(sr_numbers.to_vec())
        .bind(start)
        .bind(end)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn get_request(&self, sr_number: &str) -> Result<Option<ServiceRequest>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM service_requests WHERE sr_number = $1"
        ))
        .bind(sr_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(request_from_row).transpose()?)
    }

    async fn closed_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ClosedRequestRow>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT request_type, nc_name, created_date, closed_date FROM service_requests",
        );
        push_filter(&mut builder, filter);
        builder.push(" AND closed_date IS NOT NULL");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ClosedRequestRow {
                request_type: row.try_get("request_type")?,
                nc_name: row.try_get("nc_name")?,
                created_date: row.try_get("created_date")?,
                closed_date: row.try_get("closed_date")?,
            });
        }
        Ok(out)
    }

    async fn count_by(
        &self,
        filter: &RequestFilter,
        fields: &[CountField],
    ) -> Result<Vec<GroupCount>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        for (idx, field) in fields.iter().enumerate() {
            builder.push(format!("{}::text AS k{idx}, ", field.column()));
        }
        builder.push("COUNT(*) AS n FROM service_requests");
        push_filter(&mut builder, filter);
        if !fields.is_empty() {
            let positions = (1..=fields.len())
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            // Byte order with NULLs first, matching the in-memory store.
            let ordering = fields
                .iter()
                .map(|f| format!("{}::text COLLATE \"C\" NULLS FIRST", f.column()))
                .collect::<Vec<_>>()
                .join(", ");
            builder.push(format!(" GROUP BY {positions} ORDER BY {ordering}"));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut keys = Vec::with_capacity(fields.len());
            for idx in 0..fields.len() {
                keys.push(row.try_get::<Option<String>, _>(format!("k{idx}").as_str())?);
            }
            let count: i64 = row.try_get("n")?;
            if count > 0 {
                out.push(GroupCount { keys, count });
            }
        }
        Ok(out)
    }

    async fn pins(&self, filter: &RequestFilter) -> Result<Vec<Pin>, StoreError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT sr_number, latitude, longitude, request_type FROM service_requests",
        );
        push_filter(&mut builder, filter);
        builder.push(" AND latitude IS NOT NULL AND longitude IS NOT NULL ORDER BY sr_number");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Pin {
                sr_number: row.try_get("sr_number")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                request_type: row.try_get("request_type")?,
            });
        }
        Ok(out)
    }
}
