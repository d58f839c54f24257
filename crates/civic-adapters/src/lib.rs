//! Remote source client contract, the Socrata client and the upstream record mapper.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use civic_core::{RequestType, ServiceRequest};
use civic_storage::{is_rejected_status, FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "civic-adapters";

/// Carried for records that arrive without a request type.
pub const UNSPECIFIED_REQUEST_TYPE: &str = "Unspecified";

/// What a page request selects upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceQuery {
    /// Every record created in the calendar year.
    Year(i32),
    /// Records whose upstream `updateddate` is at or after the watermark.
    /// Rows sharing the watermark timestamp are re-read; upserts absorb them.
    UpdatedSince(DateTime<Utc>),
    /// Request numbers only, for records created inside the inclusive window.
    CreatedBetween {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl SourceQuery {
    pub fn partition_key(&self) -> String {
        match self {
            Self::Year(year) => format!("year:{year}"),
            Self::UpdatedSince(_) => "update".to_string(),
            Self::CreatedBetween { .. } => "delete".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcePage {
    pub records: Vec<JsonValue>,
    pub has_more: bool,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream rejected query on {dataset} (status {status}): {body}")]
    QueryRejected {
        dataset: String,
        status: u16,
        body: String,
    },
    #[error("upstream fetch failed: {0}")]
    Transport(String),
    #[error("upstream page is not a JSON array: {0}")]
    Decode(#[from] serde_json::Error),
}

impl SourceError {
    fn from_fetch(dataset: &str, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, body, .. } if is_rejected_status(status) => {
                Self::QueryRejected {
                    dataset: dataset.to_string(),
                    status,
                    body,
                }
            }
            other => Self::Transport(other.to_string()),
        }
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch at most `page_size` records starting at `offset`.
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        page_size: usize,
    ) -> Result<SourcePage, SourceError>;
}

/// Offset and page-size bookkeeping for one paged read with an optional cap
/// on the total number of records delivered.
#[derive(Debug, Clone)]
pub struct PageCursor {
    offset: u64,
    page_size: usize,
    limit: Option<u64>,
    delivered: u64,
    exhausted: bool,
}

impl PageCursor {
    pub fn new(start_offset: u64, page_size: usize, limit: Option<u64>) -> Self {
        Self {
            offset: start_offset,
            page_size: page_size.max(1),
            limit,
            delivered: 0,
            exhausted: false,
        }
    }

    /// Next `(offset, page_size)` to request, or `None` when paging is done.
    pub fn next_request(&self) -> Option<(u64, usize)> {
        if self.exhausted {
            return None;
        }
        let size = match self.limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(self.delivered);
                remaining.min(self.page_size as u64) as usize
            }
            None => self.page_size,
        };
        (size > 0).then_some((self.offset, size))
    }

    pub fn record_page(&mut self, received: usize, has_more: bool) {
        self.offset += received as u64;
        self.delivered += received as u64;
        if !has_more || received == 0 {
            self.exhausted = true;
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// True when paging stopped because the cap was hit while upstream still had rows.
    pub fn stopped_by_limit(&self) -> bool {
        !self.exhausted && self.limit.is_some_and(|limit| self.delivered >= limit)
    }
}

fn default_base_url() -> String {
    "https://data.lacity.org".to_string()
}

fn default_dataset() -> String {
    "rq3b-xjk8".to_string()
}

/// Where and how to reach the upstream open-data portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocrataConfig {
    pub base_url: String,
    /// Dataset used for incremental sync, reconciliation and unmapped years.
    pub default_dataset: String,
    pub datasets_by_year: BTreeMap<i32, String>,
    pub app_token: Option<String>,
}

impl Default for SocrataConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            default_dataset: default_dataset(),
            datasets_by_year: BTreeMap::new(),
            app_token: None,
        }
    }
}

impl SocrataConfig {
    pub fn dataset_for(&self, query: &SourceQuery) -> &str {
        match query {
            SourceQuery::Year(year) => self
                .datasets_by_year
                .get(year)
                .map(String::as_str)
                .unwrap_or(&self.default_dataset),
            _ => &self.default_dataset,
        }
    }

    pub fn resource_url(&self, dataset: &str) -> String {
        format!("{}/resource/{dataset}.json", self.base_url.trim_end_matches('/'))
    }
}

fn floating_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

/// SoQL parameters for one page of `query`.
pub fn soql_params(query: &SourceQuery, offset: u64, page_size: usize) -> Vec<(String, String)> {
    let mut params = vec![
        ("$limit".to_string(), page_size.to_string()),
        ("$offset".to_string(), offset.to_string()),
    ];
    match query {
        SourceQuery::Year(year) => {
            params.push((
                "$where".to_string(),
                format!(
                    "createddate between '{year}-01-01T00:00:00.000' and '{year}-12-31T23:59:59.999'"
                ),
            ));
            params.push(("$order".to_string(), "srnumber".to_string()));
        }
        SourceQuery::UpdatedSince(since) => {
            params.push((
                "$where".to_string(),
                format!("updateddate >= '{}'", floating_timestamp(*since)),
            ));
            params.push(("$order".to_string(), "updateddate,srnumber".to_string()));
        }
        SourceQuery::CreatedBetween { start, end } => {
            params.push(("$select".to_string(), "srnumber".to_string()));
            params.push((
                "$where".to_string(),
                format!(
                    "createddate between '{}' and '{}'",
                    floating_timestamp(*start),
                    floating_timestamp(*end)
                ),
            ));
            params.push(("$order".to_string(), "srnumber".to_string()));
        }
    }
    params
}

/// Production client for a Socrata SODA endpoint.
#[derive(Debug, Clone)]
pub struct SocrataClient {
    config: SocrataConfig,
    fetcher: Arc<HttpFetcher>,
}

impl SocrataClient {
    pub fn new(config: SocrataConfig, fetcher: Arc<HttpFetcher>) -> Self {
        Self {
            config,
            fetcher,
        }
    }

    pub fn config(&self) -> &SocrataConfig {
        &self.config
    }
}

#[async_trait]
impl RecordSource for SocrataClient {
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        let dataset = self.config.dataset_for(query);
        let url = self.config.resource_url(dataset);
        let params = soql_params(query, offset, page_size);
        let mut headers = Vec::new();
        if let Some(token) = self.config.app_token.as_deref() {
            headers.push(("X-App-Token", token));
        }

        let fetched = self
            .fetcher
            .fetch_bytes(dataset, &url, &params, &headers)
            .await
            .map_err(|err| SourceError::from_fetch(dataset, err))?;

        let records: Vec<JsonValue> = serde_json::from_slice(&fetched.body)?;
        let has_more = records.len() >= page_size;
        debug!(dataset, offset, received = records.len(), "fetched upstream page");
        Ok(SourcePage { records, has_more })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record {sr_number:?} is missing required field '{field}'")]
    MissingField {
        sr_number: Option<String>,
        field: &'static str,
    },
    #[error("record {sr_number} has unparseable '{field}': {value:?}")]
    InvalidTimestamp {
        sr_number: String,
        field: &'static str,
        value: String,
    },
}

/// Parse an upstream timestamp. Floating timestamps are taken as UTC.
pub fn parse_source_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%m/%d/%Y %I:%M:%S %p", "%m/%d/%Y %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn text_field(obj: &JsonMap<String, JsonValue>, field: &str) -> Option<String> {
    match obj.get(field)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn loose_f64(obj: &JsonMap<String, JsonValue>, field: &str) -> Option<f64> {
    let value = match obj.get(field)? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

fn loose_i32(obj: &JsonMap<String, JsonValue>, field: &str) -> Option<i32> {
    let value = loose_f64(obj, field)?;
    if value.fract() != 0.0 || value < i32::MIN as f64 || value > i32::MAX as f64 {
        return None;
    }
    Some(value as i32)
}

fn coordinate(obj: &JsonMap<String, JsonValue>, field: &str, bound: f64) -> Option<f64> {
    loose_f64(obj, field).filter(|v| *v != 0.0 && v.abs() <= bound)
}

fn optional_timestamp(
    obj: &JsonMap<String, JsonValue>,
    field: &'static str,
    sr_number: &str,
) -> Result<Option<DateTime<Utc>>, MappingError> {
    let Some(raw) = text_field(obj, field) else {
        return Ok(None);
    };
    parse_source_timestamp(&raw)
        .map(Some)
        .ok_or_else(|| MappingError::InvalidTimestamp {
            sr_number: sr_number.to_string(),
            field,
            value: raw,
        })
}

/// Translate one upstream record into the local row shape.
pub fn map_record(raw: &JsonValue) -> Result<ServiceRequest, MappingError> {
    let obj = raw.as_object().ok_or(MappingError::NotAnObject)?;
    let sr_number = text_field(obj, "srnumber").ok_or(MappingError::MissingField {
        sr_number: None,
        field: "srnumber",
    })?;
    let created_date = optional_timestamp(obj, "createddate", &sr_number)?.ok_or_else(|| {
        MappingError::MissingField {
            sr_number: Some(sr_number.clone()),
            field: "createddate",
        }
    })?;
    let updated_date = optional_timestamp(obj, "updateddate", &sr_number)?;
    let closed_date = optional_timestamp(obj, "closeddate", &sr_number)?;
    if closed_date.is_some_and(|closed| closed < created_date) {
        warn!(sr_number = %sr_number, "closed timestamp precedes creation timestamp");
    }

    let request_type = text_field(obj, "requesttype")
        .unwrap_or_else(|| UNSPECIFIED_REQUEST_TYPE.to_string());

    Ok(ServiceRequest {
        created_date,
        updated_date,
        closed_date,
        request_type: RequestType::from(request_type),
        status: text_field(obj, "status"),
        request_source: text_field(obj, "requestsource"),
        nc: loose_i32(obj, "nc"),
        nc_name: text_field(obj, "ncname"),
        cd: loose_i32(obj, "cd"),
        address: text_field(obj, "address"),
        latitude: coordinate(obj, "latitude", 90.0),
        longitude: coordinate(obj, "longitude", 180.0),
        police_precinct: text_field(obj, "policeprecinct"),
        action_taken: text_field(obj, "actiontaken"),
        owner: text_field(obj, "owner"),
        sr_number,
    })
}

#[derive(Debug, Default)]
pub struct MappedPage {
    pub rows: Vec<ServiceRequest>,
    /// Position in the page plus the reason the record was dropped.
    pub errors: Vec<(usize, MappingError)>,
}

/// Map a whole page; bad records are collected, never fatal.
pub fn map_page(records: &[JsonValue]) -> MappedPage {
    let mut page = MappedPage::default();
    for (idx, raw) in records.iter().enumerate() {
        match map_record(raw) {
            Ok(row) => page.rows.push(row),
            Err(err) => {
                warn!(index = idx, error = %err, "skipping unmappable upstream record");
                page.errors.push((idx, err));
            }
        }
    }
    page
}

/// Extract the request numbers from a `$select=srnumber` page.
pub fn sr_numbers(records: &[JsonValue]) -> Vec<String> {
    records
        .iter()
        .filter_map(|raw| raw.as_object().and_then(|obj| text_field(obj, "srnumber")))
        .collect()
}

/// In-process upstream with SoQL-equivalent selection, ordering and paging.
#[derive(Debug, Default)]
pub struct MemorySource {
    records: Vec<JsonValue>,
    failing_partitions: BTreeSet<String>,
    rejected_partitions: BTreeSet<String>,
    fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new(records: Vec<JsonValue>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }

    /// Every fetch for this partition fails as a transport error.
    pub fn with_failing_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.failing_partitions.insert(partition_key.into());
        self
    }

    /// Every fetch for this partition fails as a rejected query.
    pub fn with_rejected_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.rejected_partitions.insert(partition_key.into());
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn select(&self, query: &SourceQuery) -> Vec<JsonValue> {
        let timestamp = |raw: &JsonValue, field: &str| {
            raw.as_object()
                .and_then(|obj| text_field(obj, field))
                .and_then(|s| parse_source_timestamp(&s))
        };
        let sr = |raw: &JsonValue| {
            raw.as_object()
                .and_then(|obj| text_field(obj, "srnumber"))
                .unwrap_or_default()
        };

        let mut selected: Vec<&JsonValue> = self
            .records
            .iter()
            .filter(|raw| match query {
                SourceQuery::Year(year) => {
                    timestamp(raw, "createddate").is_some_and(|ts| ts.year() == *year)
                }
                SourceQuery::UpdatedSince(since) => {
                    timestamp(raw, "updateddate").is_some_and(|ts| ts >= *since)
                }
                SourceQuery::CreatedBetween { start, end } => timestamp(raw, "createddate")
                    .is_some_and(|ts| ts >= *start && ts <= *end),
            })
            .collect();

        match query {
            SourceQuery::UpdatedSince(_) => {
                selected.sort_by_key(|raw| (timestamp(raw, "updateddate"), sr(raw)))
            }
            _ => selected.sort_by_key(|raw| sr(raw)),
        }

        selected
            .into_iter()
            .map(|raw| match query {
                SourceQuery::CreatedBetween { .. } => {
                    serde_json::json!({ "srnumber": sr(raw) })
                }
                _ => raw.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn fetch_page(
        &self,
        query: &SourceQuery,
        offset: u64,
        page_size: usize,
    ) -> Result<SourcePage, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let partition = query.partition_key();
        if self.rejected_partitions.contains(&partition) {
            return Err(SourceError::QueryRejected {
                dataset: "memory".to_string(),
                status: 400,
                body: format!("rejected {partition}"),
            });
        }
        if self.failing_partitions.contains(&partition) {
            return Err(SourceError::Transport(format!("injected failure for {partition}")));
        }

        let records: Vec<JsonValue> = self
            .select(query)
            .into_iter()
            .skip(offset as usize)
            .take(page_size)
            .collect();
        let has_more = records.len() >= page_size;
        Ok(SourcePage { records, has_more })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(sr: &str, created: &str) -> JsonValue {
        json!({
            "srnumber": sr,
            "createddate": created,
            "requesttype": "Bulky Items",
            "ncname": "SHERMAN OAKS NC",
        })
    }

    #[test]
    fn maps_socrata_record_with_loose_types() {
        let record = json!({
            "srnumber": "1-1523590121",
            "createddate": "2019-12-31T23:15:00.000",
            "updateddate": "2020-01-02T08:00:00.000",
            "closeddate": "01/02/2020 07:30:00 AM",
            "requesttype": "Sidewalk Vending",
            "status": "Closed",
            "requestsource": "Mobile App",
            "nc": "52",
            "ncname": "SHERMAN OAKS NC",
            "cd": 4,
            "address": "  ",
            "latitude": "34.1512",
            "longitude": -118.4490,
            "policeprecinct": "VAN NUYS",
        });

        let row = map_record(&record).expect("mapped");
        assert_eq!(row.sr_number, "1-1523590121");
        assert_eq!(row.created_date, Utc.with_ymd_and_hms(2019, 12, 31, 23, 15, 0).unwrap());
        assert_eq!(row.closed_date, Some(Utc.with_ymd_and_hms(2020, 1, 2, 7, 30, 0).unwrap()));
        assert_eq!(row.request_type, RequestType::Other("Sidewalk Vending".into()));
        assert_eq!(row.nc, Some(52));
        assert_eq!(row.cd, Some(4));
        assert_eq!(row.address, None);
        assert_eq!(row.coordinates(), Some((34.1512, -118.4490)));
        assert_eq!(row.owner, None);
    }

    #[test]
    fn zero_or_garbage_coordinates_become_null() {
        let mut record = raw("1-1", "2019-01-01T00:00:00.000");
        record["latitude"] = json!(0);
        record["longitude"] = json!("n/a");
        let row = map_record(&record).unwrap();
        assert_eq!(row.latitude, None);
        assert_eq!(row.longitude, None);
    }

    #[test]
    fn missing_required_fields_skip_only_that_record() {
        let records = vec![
            raw("1-1", "2019-01-01T00:00:00.000"),
            json!({ "createddate": "2019-01-01T00:00:00.000" }),
            json!({ "srnumber": "1-3" }),
            json!({ "srnumber": "1-4", "createddate": "not a date" }),
            json!("scalar"),
            raw("1-6", "2019-01-02T00:00:00.000"),
        ];
        let page = map_page(&records);
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.errors.len(), 4);
        assert_eq!(
            page.errors[1].1,
            MappingError::MissingField { sr_number: Some("1-3".into()), field: "createddate" }
        );
        assert!(matches!(page.errors[2].1, MappingError::InvalidTimestamp { .. }));
        assert_eq!(page.errors[3].1, MappingError::NotAnObject);
    }

    #[test]
    fn cursor_stops_on_short_page_and_on_limit() {
        let mut cursor = PageCursor::new(0, 500, None);
        let mut requests = Vec::new();
        for received in [500, 500, 200] {
            let (offset, size) = cursor.next_request().unwrap();
            requests.push((offset, size));
            cursor.record_page(received, received == size);
        }
        assert_eq!(requests, vec![(0, 500), (500, 500), (1000, 500)]);
        assert_eq!(cursor.next_request(), None);
        assert!(!cursor.stopped_by_limit());

        let mut capped = PageCursor::new(0, 500, Some(700));
        assert_eq!(capped.next_request(), Some((0, 500)));
        capped.record_page(500, true);
        assert_eq!(capped.next_request(), Some((500, 200)));
        capped.record_page(200, true);
        assert_eq!(capped.next_request(), None);
        assert!(capped.stopped_by_limit());
        assert_eq!(capped.delivered(), 700);
    }

    #[test]
    fn soql_parameters_per_query_kind() {
        let params: BTreeMap<_, _> = soql_params(&SourceQuery::Year(2019), 1000, 500)
            .into_iter()
            .collect();
        assert_eq!(params["$limit"], "500");
        assert_eq!(params["$offset"], "1000");
        assert_eq!(params["$order"], "srnumber");
        assert!(params["$where"].starts_with("createddate between '2019-01-01"));

        let since = Utc.with_ymd_and_hms(2020, 5, 1, 12, 0, 0).unwrap();
        let params: BTreeMap<_, _> = soql_params(&SourceQuery::UpdatedSince(since), 0, 10)
            .into_iter()
            .collect();
        assert_eq!(params["$where"], "updateddate >= '2020-05-01T12:00:00.000'");

        let window = SourceQuery::CreatedBetween { start: since, end: since };
        let params: BTreeMap<_, _> = soql_params(&window, 0, 10).into_iter().collect();
        assert_eq!(params["$select"], "srnumber");
    }

    #[test]
    fn per_year_dataset_overrides_default() {
        let mut config = SocrataConfig::default();
        config.datasets_by_year.insert(2016, "ndkd-k878".into());
        assert_eq!(config.dataset_for(&SourceQuery::Year(2016)), "ndkd-k878");
        assert_eq!(config.dataset_for(&SourceQuery::Year(2017)), config.default_dataset);
        assert_eq!(
            config.resource_url("ndkd-k878"),
            "https://data.lacity.org/resource/ndkd-k878.json"
        );
    }

    #[tokio::test]
    async fn memory_source_pages_and_projects() {
        let source = MemorySource::new(vec![
            raw("1-3", "2019-03-01T00:00:00.000"),
            raw("1-1", "2019-01-01T00:00:00.000"),
            raw("1-2", "2018-06-01T00:00:00.000"),
        ]);
        let first = source.fetch_page(&SourceQuery::Year(2019), 0, 1).await.unwrap();
        assert!(first.has_more);
        assert_eq!(sr_numbers(&first.records), vec!["1-1"]);
        let second = source.fetch_page(&SourceQuery::Year(2019), 1, 1).await.unwrap();
        assert_eq!(sr_numbers(&second.records), vec!["1-3"]);

        let window = SourceQuery::CreatedBetween {
            start: Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap(),
        };
        let page = source.fetch_page(&window, 0, 10).await.unwrap();
        assert!(!page.has_more);
        assert_eq!(page.records, vec![json!({"srnumber": "1-1"}), json!({"srnumber": "1-2"})]);
        assert_eq!(source.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn injected_failures_map_to_source_errors() {
        let source = MemorySource::new(Vec::new())
            .with_failing_partition("year:2016")
            .with_rejected_partition("year:2017");
        assert!(matches!(
            source.fetch_page(&SourceQuery::Year(2016), 0, 10).await,
            Err(SourceError::Transport(_))
        ));
        assert!(matches!(
            source.fetch_page(&SourceQuery::Year(2017), 0, 10).await,
            Err(SourceError::QueryRejected { status: 400, .. })
        ));
    }

    #[test]
    fn rejected_fetch_errors_become_query_errors() {
        let rejected = SourceError::from_fetch(
            "rq3b-xjk8",
            FetchError::HttpStatus { status: 400, url: "u".into(), body: "bad $where".into() },
        );
        assert!(matches!(rejected, SourceError::QueryRejected { .. }));
        let throttled = SourceError::from_fetch(
            "rq3b-xjk8",
            FetchError::HttpStatus { status: 503, url: "u".into(), body: String::new() },
        );
        assert!(matches!(throttled, SourceError::Transport(_)));
    }
}
