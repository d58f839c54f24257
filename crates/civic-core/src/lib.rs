//! Core domain model, query filters and report shapes for the civic 311 service.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "civic-core";

/// First year the upstream open-data portal publishes service requests for.
pub const FIRST_INGEST_YEAR: i32 = 2015;

/// Request categories published by the upstream dataset.
///
/// Unknown categories are carried verbatim in `Other` so that new upstream
/// categories flow through ingestion and aggregation without a release.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RequestType {
    BulkyItems,
    DeadAnimalRemoval,
    ElectronicWaste,
    Feedback,
    GraffitiRemoval,
    HomelessEncampment,
    IllegalDumpingPickup,
    MetalHouseholdAppliances,
    MultipleStreetlightIssue,
    ReportWaterWaste,
    SingleStreetlightIssue,
    Other(String),
}

impl RequestType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::BulkyItems => "Bulky Items",
            Self::DeadAnimalRemoval => "Dead Animal Removal",
            Self::ElectronicWaste => "Electronic Waste",
            Self::Feedback => "Feedback",
            Self::GraffitiRemoval => "Graffiti Removal",
            Self::HomelessEncampment => "Homeless Encampment",
            Self::IllegalDumpingPickup => "Illegal Dumping Pickup",
            Self::MetalHouseholdAppliances => "Metal/Household Appliances",
            Self::MultipleStreetlightIssue => "Multiple Streetlight Issue",
            Self::ReportWaterWaste => "Report Water Waste",
            Self::SingleStreetlightIssue => "Single Streetlight Issue",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for RequestType {
    fn from(value: String) -> Self {
        match value.trim() {
            "Bulky Items" => Self::BulkyItems,
            "Dead Animal Removal" => Self::DeadAnimalRemoval,
            "Electronic Waste" => Self::ElectronicWaste,
            "Feedback" => Self::Feedback,
            "Graffiti Removal" => Self::GraffitiRemoval,
            "Homeless Encampment" => Self::HomelessEncampment,
            "Illegal Dumping Pickup" => Self::IllegalDumpingPickup,
            "Metal/Household Appliances" => Self::MetalHouseholdAppliances,
            "Multiple Streetlight Issue" => Self::MultipleStreetlightIssue,
            "Report Water Waste" => Self::ReportWaterWaste,
            "Single Streetlight Issue" => Self::SingleStreetlightIssue,
            _ => Self::Other(value),
        }
    }
}

impl From<RequestType> for String {
    fn from(value: RequestType) -> Self {
        match value {
            RequestType::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream service request as persisted locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRequest {
    pub sr_number: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: Option<DateTime<Utc>>,
    pub closed_date: Option<DateTime<Utc>>,
    pub request_type: RequestType,
    pub status: Option<String>,
    pub request_source: Option<String>,
    pub nc: Option<i32>,
    pub nc_name: Option<String>,
    pub cd: Option<i32>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub police_precinct: Option<String>,
    pub action_taken: Option<String>,
    pub owner: Option<String>,
}

impl ServiceRequest {
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }

    /// True when every field an upsert may overwrite is equal. `created_date`
    /// is excluded because an upsert never rewrites it.
    pub fn same_mutable_fields(&self, other: &ServiceRequest) -> bool {
        self.updated_date == other.updated_date
            && self.closed_date == other.closed_date
            && self.request_type == other.request_type
            && self.status == other.status
            && self.request_source == other.request_source
            && self.nc == other.nc
            && self.nc_name == other.nc_name
            && self.cd == other.cd
            && self.address == other.address
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.police_precinct == other.police_precinct
            && self.action_taken == other.action_taken
            && self.owner == other.owner
    }
}

/// Progress marker for one ingestion partition (`year:2019`, `update`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionCheckpoint {
    pub partition_key: String,
    pub last_offset: i64,
    pub record_count: i64,
    pub high_watermark: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionCheckpoint {
    pub fn fresh(partition_key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            partition_key: partition_key.into(),
            last_offset: 0,
            record_count: 0,
            high_watermark: None,
            updated_at: now,
        }
    }

    pub fn year_key(year: i32) -> String {
        format!("year:{year}")
    }

    /// Record one committed page. Offsets and the watermark never move backwards.
    pub fn advance(
        &mut self,
        next_offset: i64,
        committed_rows: i64,
        watermark: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.last_offset = self.last_offset.max(next_offset);
        self.record_count += committed_rows;
        self.high_watermark = match (self.high_watermark, watermark) {
            (Some(current), Some(seen)) => Some(current.max(seen)),
            (current, seen) => current.or(seen),
        };
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("'{0}' parameter is required")]
    MissingParameter(&'static str),
    #[error("invalid value {value:?} for '{name}'")]
    InvalidParameter { name: &'static str, value: String },
    #[error("'years' values must lie within [{min}, {max}], got {year}")]
    YearOutOfRange { year: i32, min: i32, max: i32 },
    #[error("unknown count field {0:?}")]
    UnknownCountField(String),
    #[error("startDate {start} is after endDate {end}")]
    InvertedDateRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

/// Parse a comma-separated year list such as `2015,2016,2017`.
pub fn parse_years_csv(raw: &str) -> Result<BTreeSet<i32>, ValidationError> {
    let mut years = BTreeSet::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let year = part.parse::<i32>().map_err(|_| ValidationError::InvalidParameter {
            name: "years",
            value: part.to_string(),
        })?;
        years.insert(year);
    }
    if years.is_empty() {
        return Err(ValidationError::MissingParameter("years"));
    }
    Ok(years)
}

pub fn validate_years(years: &BTreeSet<i32>, current_year: i32) -> Result<(), ValidationError> {
    if years.is_empty() {
        return Err(ValidationError::MissingParameter("years"));
    }
    for &year in years {
        if !(FIRST_INGEST_YEAR..=current_year).contains(&year) {
            return Err(ValidationError::YearOutOfRange {
                year,
                min: FIRST_INGEST_YEAR,
                max: current_year,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBound {
    Start,
    End,
}

/// Parse a caller-supplied filter timestamp. A bare date expands to the start
/// or the end of that day depending on `bound`, keeping the range inclusive.
pub fn parse_filter_timestamp(raw: &str, bound: DateBound) -> Result<DateTime<Utc>, ValidationError> {
    let raw = raw.trim();
    let invalid = || ValidationError::InvalidParameter {
        name: match bound {
            DateBound::Start => "startDate",
            DateBound::End => "endDate",
        },
        value: raw.to_string(),
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .map_err(|_| invalid())?;
    let time = match bound {
        DateBound::Start => NaiveTime::from_hms_opt(0, 0, 0).ok_or_else(invalid)?,
        DateBound::End => NaiveTime::from_hms_milli_opt(23, 59, 59, 999).ok_or_else(invalid)?,
    };
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Filter shared by every read endpoint. Empty lists mean "all".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub nc_list: Vec<String>,
    pub request_types: Vec<String>,
}

impl RequestFilter {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(ValidationError::InvertedDateRange { start, end });
            }
        }
        Ok(())
    }

    pub fn matches(&self, request: &ServiceRequest) -> bool {
        if self.start_date.is_some_and(|start| request.created_date < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| request.created_date > end) {
            return false;
        }
        if !self.nc_list.is_empty() {
            let Some(nc_name) = request.nc_name.as_deref() else {
                return false;
            };
            if !self.nc_list.iter().any(|nc| nc == nc_name) {
                return false;
            }
        }
        if !self.request_types.is_empty()
            && !self
                .request_types
                .iter()
                .any(|t| t == request.request_type.as_str())
        {
            return false;
        }
        true
    }
}

/// Grouping dimensions accepted by the request counts endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CountField {
    RequestType,
    NcName,
    Status,
    RequestSource,
    Cd,
}

impl CountField {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw.trim() {
            "requestType" | "requesttype" | "request_type" => Ok(Self::RequestType),
            "nc" | "ncName" | "ncname" | "nc_name" => Ok(Self::NcName),
            "status" => Ok(Self::Status),
            "requestSource" | "requestsource" | "request_source" => Ok(Self::RequestSource),
            "cd" => Ok(Self::Cd),
            other => Err(ValidationError::UnknownCountField(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestType => "requestType",
            Self::NcName => "ncName",
            Self::Status => "status",
            Self::RequestSource => "requestSource",
            Self::Cd => "cd",
        }
    }

    /// Physical column in `service_requests`. Fixed allowlist; never user text.
    pub fn column(self) -> &'static str {
        match self {
            Self::RequestType => "request_type",
            Self::NcName => "nc_name",
            Self::Status => "status",
            Self::RequestSource => "request_source",
            Self::Cd => "cd",
        }
    }

    pub fn value_of(self, request: &ServiceRequest) -> Option<String> {
        match self {
            Self::RequestType => Some(request.request_type.as_str().to_string()),
            Self::NcName => request.nc_name.clone(),
            Self::Status => request.status.clone(),
            Self::RequestSource => request.request_source.clone(),
            Self::Cd => request.cd.map(|cd| cd.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TtcGroupBy {
    #[default]
    RequestType,
    Council,
    Both,
}

/// Minimal projection used by the time-to-close computation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedRequestRow {
    pub request_type: String,
    pub nc_name: Option<String>,
    pub created_date: DateTime<Utc>,
    pub closed_date: DateTime<Utc>,
}

/// Map marker, serialized as `{id, lat, long, type}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    #[serde(rename = "id")]
    pub sr_number: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "long")]
    pub longitude: f64,
    #[serde(rename = "type")]
    pub request_type: String,
}

/// One row of a grouped count; `keys` lines up with the requested fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub keys: Vec<Option<String>>,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Completed,
    Truncated,
    Failed,
    Skipped,
}

/// Outcome of one ingestion unit (a backfill year or an incremental sync run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub status: UnitStatus,
    pub pages: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub error: Option<String>,
}

impl Default for UnitReport {
    fn default() -> Self {
        Self {
            status: UnitStatus::Completed,
            pages: 0,
            fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            error: None,
        }
    }
}

impl UnitReport {
    pub fn record_failure(&mut self, error: impl fmt::Display) {
        self.status = UnitStatus::Failed;
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: BTreeMap<String, UnitReport>,
}

impl IngestReport {
    pub fn has_failures(&self) -> bool {
        self.units.values().any(|u| u.status == UnitStatus::Failed)
    }

    pub fn total(&self, pick: impl Fn(&UnitReport) -> u64) -> u64 {
        self.units.values().map(pick).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub run_id: Uuid,
    pub status: UnitStatus,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub upstream_count: u64,
    pub local_count: u64,
    pub deleted: u64,
    pub deleted_sr_numbers: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub day: i64,
    pub count: u64,
}

/// Box-plot style summary of closing durations in fractional days.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtcGroupStats {
    pub count: u64,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    pub whisker_min: f64,
    pub whisker_max: f64,
    pub outlier_count: u64,
    pub histogram: Vec<DayBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeToCloseReport {
    pub group_by: TtcGroupBy,
    pub total: u64,
    pub excluded_negative: u64,
    pub groups: BTreeMap<String, TtcGroupStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyReport {
    pub aggregate: bool,
    pub total: i64,
    /// Council name (or `all` when aggregated) to request type to count.
    pub counts: BTreeMap<String, BTreeMap<String, i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CountsReport {
    pub fields: Vec<CountField>,
    pub total: i64,
    pub rows: Vec<GroupCount>,
}
