use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use civic_adapters::{map_page, sr_numbers, PageCursor, RecordSource, SourceQuery};
use civic_core::{
    validate_years, DeleteReport, IngestReport, IngestionCheckpoint, ServiceRequest,
    UnitReport, UnitStatus, ValidationError,
};
use civic_storage::{BackoffPolicy, RequestStore, StoreError};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const UPDATE_PARTITION: &str = "update";
pub const DELETE_PARTITION: &str = "delete";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ingestion engine is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub default_query_size: usize,
    pub max_query_size: usize,
    pub update_window_days: i64,
    pub delete_window_days: i64,
    pub store_backoff: BackoffPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            default_query_size: 1000,
            max_query_size: 50_000,
            update_window_days: 7,
            delete_window_days: 30,
            store_backoff: BackoffPolicy::default(),
        }
    }
}

/// The only writer of service request rows: year backfills, incremental
/// sync and deletion reconciliation.
pub struct IngestEngine {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn RequestStore>,
    options: IngestOptions,
    partition_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Collapse repeated request numbers within a page; the last occurrence wins.
fn dedup_page(rows: Vec<ServiceRequest>) -> Vec<ServiceRequest> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<ServiceRequest> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.get(&row.sr_number) {
            Some(&idx) => unique[idx] = row,
            None => {
                positions.insert(row.sr_number.clone(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

impl IngestEngine {
    pub fn new(
        source: Arc<dyn RecordSource>,
        store: Arc<dyn RequestStore>,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
            partition_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &IngestOptions {
        &self.options
    }

    async fn lock_partition(&self, key: &str) -> Result<OwnedSemaphorePermit, IngestError> {
        let semaphore = {
            let mut locks = self.partition_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        semaphore.acquire_owned().await.map_err(|_| IngestError::Closed)
    }

    fn resolve_query_size(&self, query_size: Option<usize>) -> Result<usize, ValidationError> {
        let size = query_size.unwrap_or(self.options.default_query_size);
        if size == 0 || size > self.options.max_query_size {
            return Err(ValidationError::InvalidParameter {
                name: "querySize",
                value: size.to_string(),
            });
        }
        Ok(size)
    }

    fn resolve_limit(limit: Option<u64>) -> Result<Option<u64>, ValidationError> {
        match limit {
            Some(0) => Err(ValidationError::InvalidParameter {
                name: "limit",
                value: "0".to_string(),
            }),
            other => Ok(other),
        }
    }

    async fn with_store_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let backoff = self.options.store_backoff;
        let mut attempt = 0usize;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < backoff.max_retries => {
                    warn!(op, attempt, error = %err, "retrying store operation");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Backfill every requested year. Validation happens before any fetch;
    /// a failing year is reported and the remaining years still run.
    pub async fn populate_full_database(
        &self,
        years: &BTreeSet<i32>,
        query_size: Option<usize>,
        limit: Option<u64>,
    ) -> Result<IngestReport, IngestError> {
        self.populate_full_database_at(years, query_size, limit, Utc::now())
            .await
    }

    pub async fn populate_full_database_at(
        &self,
        years: &BTreeSet<i32>,
        query_size: Option<usize>,
        limit: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        validate_years(years, now.year())?;
        let page_size = self.resolve_query_size(query_size)?;
        let limit = Self::resolve_limit(limit)?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut units = BTreeMap::new();
        for &year in years {
            let key = IngestionCheckpoint::year_key(year);
            let unit = self
                .backfill_year(year, &key, page_size, limit)
                .instrument(info_span!("backfill_year", %run_id, year))
                .await;
            units.insert(key, unit);
        }

        let report = IngestReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            units,
        };
        info!(
            %run_id,
            years = years.len(),
            inserted = report.total(|u| u.inserted),
            updated = report.total(|u| u.updated),
            failed = report.has_failures(),
            "backfill finished"
        );
        Ok(report)
    }

    async fn backfill_year(
        &self,
        year: i32,
        key: &str,
        page_size: usize,
        limit: Option<u64>,
    ) -> UnitReport {
        let _permit = match self.lock_partition(key).await {
            Ok(permit) => permit,
            Err(err) => return failed_unit(err),
        };

        let checkpoint = IngestionCheckpoint::fresh(key, Utc::now());
        if let Err(err) = self
            .with_store_retry("reset_checkpoint", || self.store.save_checkpoint(&checkpoint))
            .await
        {
            error!(year, error = %err, "could not reset year checkpoint");
            return failed_unit(err);
        }

        self.ingest_pages(SourceQuery::Year(year), checkpoint, page_size, limit)
            .await
    }

    /// Incremental sync of rows changed upstream since the stored watermark,
    /// or within the rolling update window on the first run.
    pub async fn update(&self) -> Result<IngestReport, IngestError> {
        self.update_at(Utc::now(), None, None).await
    }

    pub async fn update_at(
        &self,
        now: DateTime<Utc>,
        query_size: Option<usize>,
        limit: Option<u64>,
    ) -> Result<IngestReport, IngestError> {
        let page_size = self.resolve_query_size(query_size)?;
        let limit = Self::resolve_limit(limit)?;
        let _permit = self.lock_partition(UPDATE_PARTITION).await?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let stored = self
            .with_store_retry("load_checkpoint", || {
                self.store.load_checkpoint(UPDATE_PARTITION)
            })
            .await?;

        let (since, checkpoint) = match stored {
            Some(checkpoint) if checkpoint.high_watermark.is_some() => {
                let since = checkpoint.high_watermark.unwrap_or(now);
                (since, IngestionCheckpoint { last_offset: 0, ..checkpoint })
            }
            stored => {
                let since = now - ChronoDuration::days(self.options.update_window_days);
                let checkpoint = stored
                    .map(|cp| IngestionCheckpoint { last_offset: 0, ..cp })
                    .unwrap_or_else(|| IngestionCheckpoint::fresh(UPDATE_PARTITION, now));
                (since, checkpoint)
            }
        };

        let unit = self
            .ingest_pages(SourceQuery::UpdatedSince(since), checkpoint, page_size, limit)
            .instrument(info_span!("update", %run_id, %since))
            .await;
        info!(
            %run_id,
            inserted = unit.inserted,
            updated = unit.updated,
            unchanged = unit.unchanged,
            status = ?unit.status,
            "incremental sync finished"
        );

        Ok(IngestReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            units: BTreeMap::from([(UPDATE_PARTITION.to_string(), unit)]),
        })
    }

    /// Page through `query`, committing each page together with the advanced
    /// checkpoint. Stops at the first fetch or store failure.
    async fn ingest_pages(
        &self,
        query: SourceQuery,
        mut checkpoint: IngestionCheckpoint,
        page_size: usize,
        limit: Option<u64>,
    ) -> UnitReport {
        let mut unit = UnitReport::default();
        let mut cursor = PageCursor::new(0, page_size, limit);

        while let Some((offset, size)) = cursor.next_request() {
            let page = match self.source.fetch_page(&query, offset, size).await {
                Ok(page) => page,
                Err(err) => {
                    error!(partition = %checkpoint.partition_key, offset, error = %err, "page fetch failed");
                    unit.record_failure(err);
                    return unit;
                }
            };
            let received = page.records.len();
            unit.pages += 1;
            unit.fetched += received as u64;

            let mapped = map_page(&page.records);
            unit.skipped += mapped.errors.len() as u64;
            let rows = dedup_page(mapped.rows);
            let watermark = rows.iter().filter_map(|row| row.updated_date).max();

            let mut next = checkpoint.clone();
            next.advance(
                (offset + received as u64) as i64,
                rows.len() as i64,
                watermark,
                Utc::now(),
            );

            match self
                .with_store_retry("upsert_page", || self.store.upsert_page(&rows, Some(&next)))
                .await
            {
                Ok(outcome) => {
                    unit.inserted += outcome.inserted;
                    unit.updated += outcome.updated;
                    unit.unchanged += outcome.unchanged;
                    checkpoint = next;
                }
                Err(err) => {
                    error!(partition = %checkpoint.partition_key, offset, error = %err, "page commit failed");
                    unit.record_failure(err);
                    return unit;
                }
            }

            cursor.record_page(received, page.has_more);
        }

        if cursor.stopped_by_limit() {
            unit.status = UnitStatus::Truncated;
        }
        unit
    }

    /// Delete local rows created in the reconciliation window that upstream no
    /// longer reports. Any upstream failure aborts without deleting.
    pub async fn delete(&self) -> Result<DeleteReport, IngestError> {
        self.delete_at(Utc::now()).await
    }

    pub async fn delete_at(&self, now: DateTime<Utc>) -> Result<DeleteReport, IngestError> {
        let _permit = self.lock_partition(DELETE_PARTITION).await?;
        let window_end = now;
        let window_start = now - ChronoDuration::days(self.options.delete_window_days);
        let run_id = Uuid::new_v4();
        let mut report = DeleteReport {
            run_id,
            status: UnitStatus::Completed,
            window_start,
            window_end,
            upstream_count: 0,
            local_count: 0,
            deleted: 0,
            deleted_sr_numbers: Vec::new(),
            error: None,
        };

        // Snapshot local rows before paging upstream: rows committed while the
        // upstream read runs are never candidates for deletion.
        let local = self
            .with_store_retry("local_window", || {
                self.store.sr_numbers_created_between(window_start, window_end)
            })
            .await?;
        report.local_count = local.len() as u64;

        let query = SourceQuery::CreatedBetween {
            start: window_start,
            end: window_end,
        };
        let upstream = match self.collect_sr_numbers(&query).await {
            Ok(upstream) => upstream,
            Err(err) => {
                warn!(%run_id, error = %err, "reconciliation aborted: upstream read failed");
                report.status = UnitStatus::Failed;
                report.error = Some(err.to_string());
                return Ok(report);
            }
        };
        report.upstream_count = upstream.len() as u64;

        if upstream.is_empty() && !local.is_empty() {
            warn!(%run_id, local = local.len(), "reconciliation aborted: upstream window is empty");
            report.status = UnitStatus::Failed;
            report.error = Some(format!(
                "upstream reported no rows for a window holding {} local rows",
                local.len()
            ));
            return Ok(report);
        }

        let missing: Vec<String> = local
            .into_iter()
            .filter(|sr| !upstream.contains(sr))
            .collect();
        if !missing.is_empty() {
            report.deleted = self
                .with_store_retry("delete_window", || {
                    self.store
                        .delete_created_between(window_start, window_end, &missing)
                })
                .await?;
        }
        info!(
            %run_id,
            upstream = report.upstream_count,
            local = report.local_count,
            deleted = report.deleted,
            "reconciliation finished"
        );
        report.deleted_sr_numbers = missing;
        Ok(report)
    }

    async fn collect_sr_numbers(
        &self,
        query: &SourceQuery,
    ) -> Result<BTreeSet<String>, civic_adapters::SourceError> {
        let mut cursor = PageCursor::new(0, self.options.default_query_size, None);
        let mut seen = BTreeSet::new();
        while let Some((offset, size)) = cursor.next_request() {
            let page = self.source.fetch_page(query, offset, size).await?;
            seen.extend(sr_numbers(&page.records));
            cursor.record_page(page.records.len(), page.has_more);
        }
        Ok(seen)
    }
}

fn failed_unit(err: impl std::fmt::Display) -> UnitReport {
    let mut unit = UnitReport::default();
    unit.record_failure(err);
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use civic_adapters::MemorySource;
    use civic_storage::MemoryStore;
    use serde_json::{json, Value as JsonValue};

    fn record(sr: &str, created: &str) -> JsonValue {
        json!({
            "srnumber": sr,
            "createddate": created,
            "updateddate": created,
            "requesttype": "Bulky Items",
            "status": "Open",
            "ncname": "SHERMAN OAKS NC",
        })
    }

    fn year_records(year: i32, count: usize) -> Vec<JsonValue> {
        (0..count)
            .map(|i| record(&format!("1-{year}{i:05}"), &format!("{year}-03-01T10:00:00.000")))
            .collect()
    }

    fn options() -> IngestOptions {
        IngestOptions {
            store_backoff: BackoffPolicy::no_delay(3),
            ..IngestOptions::default()
        }
    }

    fn engine(source: Arc<MemorySource>, store: Arc<MemoryStore>) -> IngestEngine {
        IngestEngine::new(source, store, options())
    }

    fn years(list: &[i32]) -> BTreeSet<i32> {
        list.iter().copied().collect()
    }

    #[tokio::test]
    async fn backfill_pages_and_is_idempotent() {
        let source = Arc::new(MemorySource::new(year_records(2019, 1200)));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source.clone(), store.clone());

        let first = engine
            .populate_full_database(&years(&[2019]), Some(500), None)
            .await
            .unwrap();
        assert_eq!(source.fetch_calls(), 3);
        let unit = &first.units["year:2019"];
        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!((unit.pages, unit.fetched, unit.inserted), (3, 1200, 1200));

        let second = engine
            .populate_full_database(&years(&[2019]), Some(500), None)
            .await
            .unwrap();
        let unit = &second.units["year:2019"];
        assert_eq!((unit.inserted, unit.updated, unit.unchanged), (0, 0, 1200));
        assert_eq!(store.len().await, 1200);

        let checkpoint = store.load_checkpoint("year:2019").await.unwrap().unwrap();
        assert_eq!(checkpoint.last_offset, 1200);
        assert_eq!(checkpoint.record_count, 1200);
    }

    #[tokio::test]
    async fn out_of_range_years_never_reach_the_source() {
        let source = Arc::new(MemorySource::new(year_records(2019, 10)));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source.clone(), store.clone());
        let next_year = Utc::now().year() + 1;

        for bad in [years(&[2014, 2019]), years(&[next_year]), BTreeSet::new()] {
            let err = engine
                .populate_full_database(&bad, None, None)
                .await
                .unwrap_err();
            assert!(matches!(err, IngestError::Validation(_)));
        }
        let err = engine
            .populate_full_database(&years(&[2019]), Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
        assert_eq!(source.fetch_calls(), 0);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failing_year_does_not_abort_the_others() {
        let mut records = year_records(2016, 3);
        records.extend(year_records(2017, 4));
        let source = Arc::new(MemorySource::new(records).with_rejected_partition("year:2016"));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, store.clone());

        let report = engine
            .populate_full_database(&years(&[2016, 2017]), None, None)
            .await
            .unwrap();
        assert!(report.has_failures());
        assert_eq!(report.units["year:2016"].status, UnitStatus::Failed);
        assert!(report.units["year:2016"].error.is_some());
        assert_eq!(report.units["year:2017"].inserted, 4);
        assert_eq!(store.len().await, 4);
    }

    #[tokio::test]
    async fn limit_truncates_a_year() {
        let source = Arc::new(MemorySource::new(year_records(2018, 50)));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source.clone(), store.clone());

        let report = engine
            .populate_full_database(&years(&[2018]), Some(20), Some(30))
            .await
            .unwrap();
        let unit = &report.units["year:2018"];
        assert_eq!(unit.status, UnitStatus::Truncated);
        assert_eq!(unit.inserted, 30);
        assert_eq!(source.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn bad_records_and_duplicates_are_absorbed() {
        let mut records = year_records(2019, 2);
        let mut broken = record("1-broken", "2019-03-02T10:00:00.000");
        broken["closeddate"] = json!("sometime in march");
        records.push(broken);
        let mut dup = record("1-201900000", "2019-03-01T10:00:00.000");
        dup["status"] = json!("Closed");
        records.push(dup);
        let source = Arc::new(MemorySource::new(records));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, store.clone());

        let report = engine
            .populate_full_database(&years(&[2019]), Some(10), None)
            .await
            .unwrap();
        let unit = &report.units["year:2019"];
        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!((unit.fetched, unit.skipped, unit.inserted), (4, 1, 2));
        let row = store.get_request("1-201900000").await.unwrap().unwrap();
        assert_eq!(row.status.as_deref(), Some("Closed"));
    }

    #[tokio::test]
    async fn transient_store_failures_are_retried() {
        let source = Arc::new(MemorySource::new(year_records(2019, 5)));
        let store = Arc::new(MemoryStore::new());
        store.fail_writes(2);
        let engine = engine(source, store.clone());

        let report = engine
            .populate_full_database(&years(&[2019]), None, None)
            .await
            .unwrap();
        assert_eq!(report.units["year:2019"].status, UnitStatus::Completed);
        assert_eq!(store.len().await, 5);

        store.fail_writes(10);
        let report = engine
            .populate_full_database(&years(&[2019]), None, None)
            .await
            .unwrap();
        assert_eq!(report.units["year:2019"].status, UnitStatus::Failed);
    }

    #[tokio::test]
    async fn update_uses_window_then_watermark() {
        let now = Utc.with_ymd_and_hms(2020, 6, 10, 0, 0, 0).unwrap();
        let old = record("1-old", "2020-05-01T00:00:00.000");
        let mut changed = record("1-changed", "2020-05-01T00:00:00.000");
        changed["updateddate"] = json!("2020-06-08T09:00:00.000");
        changed["status"] = json!("Closed");
        let source = Arc::new(MemorySource::new(vec![old, changed]));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source.clone(), store.clone());

        let report = engine.update_at(now, None, None).await.unwrap();
        assert_eq!(report.units[UPDATE_PARTITION].inserted, 1);
        assert!(store.get_request("1-old").await.unwrap().is_none());

        let checkpoint = store.load_checkpoint(UPDATE_PARTITION).await.unwrap().unwrap();
        assert_eq!(
            checkpoint.high_watermark,
            Some(Utc.with_ymd_and_hms(2020, 6, 8, 9, 0, 0).unwrap())
        );

        let again = engine.update_at(now, None, None).await.unwrap();
        let unit = &again.units[UPDATE_PARTITION];
        assert_eq!((unit.fetched, unit.inserted, unit.unchanged), (1, 0, 1));
    }

    #[tokio::test]
    async fn truncated_update_resumes_rows_sharing_the_watermark() {
        let now = Utc.with_ymd_and_hms(2020, 6, 10, 0, 0, 0).unwrap();
        let records: Vec<JsonValue> = ["A", "B", "C"]
            .into_iter()
            .map(|sr| {
                let mut raw = record(sr, "2020-06-01T00:00:00.000");
                raw["updateddate"] = json!("2020-06-08T09:00:00.000");
                raw
            })
            .collect();
        let source = Arc::new(MemorySource::new(records));
        let store = Arc::new(MemoryStore::new());
        let engine = engine(source, store.clone());

        let first = engine.update_at(now, Some(2), Some(2)).await.unwrap();
        assert_eq!(first.units[UPDATE_PARTITION].status, UnitStatus::Truncated);
        assert!(store.get_request("C").await.unwrap().is_none());

        let second = engine.update_at(now, Some(2), None).await.unwrap();
        let unit = &second.units[UPDATE_PARTITION];
        assert_eq!(unit.status, UnitStatus::Completed);
        assert_eq!((unit.inserted, unit.unchanged), (1, 2));
        assert!(store.get_request("C").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reconciliation_deletes_rows_missing_upstream() {
        let now = Utc.with_ymd_and_hms(2020, 6, 10, 0, 0, 0).unwrap();
        let local = vec![
            record("A", "2020-06-01T00:00:00.000"),
            record("B", "2020-06-02T00:00:00.000"),
            record("C", "2020-06-03T00:00:00.000"),
        ];
        let store = Arc::new(MemoryStore::new());
        let rows = map_page(&local).rows;
        store.upsert_page(&rows, None).await.unwrap();

        let upstream = Arc::new(MemorySource::new(vec![local[0].clone(), local[2].clone()]));
        let engine = engine(upstream, store.clone());
        let report = engine.delete_at(now).await.unwrap();

        assert_eq!(report.status, UnitStatus::Completed);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.deleted_sr_numbers, vec!["B".to_string()]);
        assert!(store.get_request("A").await.unwrap().is_some());
        assert!(store.get_request("B").await.unwrap().is_none());
        assert!(store.get_request("C").await.unwrap().is_some());
    }

    /// Upstream that commits a freshly created row locally while it is being
    /// paged, as a concurrent incremental sync would.
    struct RacingSource {
        upstream: MemorySource,
        store: Arc<MemoryStore>,
        arriving: ServiceRequest,
    }

    #[async_trait::async_trait]
    impl RecordSource for RacingSource {
        async fn fetch_page(
            &self,
            query: &SourceQuery,
            offset: u64,
            page_size: usize,
        ) -> Result<civic_adapters::SourcePage, civic_adapters::SourceError> {
            self.store
                .upsert_page(std::slice::from_ref(&self.arriving), None)
                .await
                .unwrap();
            self.upstream.fetch_page(query, offset, page_size).await
        }
    }

    #[tokio::test]
    async fn reconciliation_keeps_rows_committed_during_the_upstream_read() {
        let now = Utc.with_ymd_and_hms(2020, 6, 10, 0, 0, 0).unwrap();
        let existing = record("A", "2020-06-01T00:00:00.000");
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_page(&map_page(&[existing.clone()]).rows, None)
            .await
            .unwrap();

        let arriving = map_page(&[record("NEW", "2020-06-09T00:00:00.000")])
            .rows
            .remove(0);
        let source = Arc::new(RacingSource {
            upstream: MemorySource::new(vec![existing]),
            store: store.clone(),
            arriving,
        });
        let engine = IngestEngine::new(source, store.clone(), options());

        let report = engine.delete_at(now).await.unwrap();
        assert_eq!(report.status, UnitStatus::Completed);
        assert!(report.deleted_sr_numbers.is_empty());
        assert!(store.get_request("NEW").await.unwrap().is_some());
        assert!(store.get_request("A").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reconciliation_never_deletes_on_upstream_trouble() {
        let now = Utc.with_ymd_and_hms(2020, 6, 10, 0, 0, 0).unwrap();
        let store = Arc::new(MemoryStore::new());
        let rows = map_page(&[record("A", "2020-06-01T00:00:00.000")]).rows;
        store.upsert_page(&rows, None).await.unwrap();

        let empty = engine(Arc::new(MemorySource::new(Vec::new())), store.clone());
        let report = empty.delete_at(now).await.unwrap();
        assert_eq!(report.status, UnitStatus::Failed);
        assert_eq!(report.deleted, 0);

        let failing = engine(
            Arc::new(MemorySource::new(Vec::new()).with_failing_partition(DELETE_PARTITION)),
            store.clone(),
        );
        let report = failing.delete_at(now).await.unwrap();
        assert_eq!(report.status, UnitStatus::Failed);
        assert_eq!(store.len().await, 1);
    }
}
