//! Read-only aggregation services over the request store.

mod stats;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use civic_core::{
    CountField, CountsReport, FrequencyReport, Pin, RequestFilter, ServiceRequest,
    TimeToCloseReport, TtcGroupBy, ValidationError,
};
use civic_storage::{RequestStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

pub use stats::{quantile, summarize};

pub const CRATE_NAME: &str = "civic-query";

/// Group label for rows without a council.
pub const UNKNOWN_COUNCIL: &str = "Unknown";
/// Outer key of an aggregated frequency report.
pub const ALL_COUNCILS: &str = "all";
/// Inner key when request types are collapsed.
pub const TOTAL_KEY: &str = "total";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("service request {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of the request frequency breakdown.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyQuery {
    /// Break counts out per request type; otherwise one `total` per council.
    pub service: bool,
    pub councils: Vec<String>,
    /// Fold all councils into one `all` bucket.
    pub aggregate: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl Default for FrequencyQuery {
    fn default() -> Self {
        Self {
            service: true,
            councils: Vec::new(),
            aggregate: true,
            start_date: None,
            end_date: None,
        }
    }
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn RequestStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Distribution of closing times, in days, for matching closed requests.
    pub async fn time_to_close(
        &self,
        filter: &RequestFilter,
        group_by: TtcGroupBy,
    ) -> Result<TimeToCloseReport, QueryError> {
        filter.validate()?;
        let rows = self.store.closed_requests(filter).await?;

        let mut excluded_negative = 0u64;
        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for row in rows {
            let millis = (row.closed_date - row.created_date).num_milliseconds();
            if millis < 0 {
                excluded_negative += 1;
                continue;
            }
            let council = row.nc_name.as_deref().unwrap_or(UNKNOWN_COUNCIL);
            let key = match group_by {
                TtcGroupBy::RequestType => row.request_type.clone(),
                TtcGroupBy::Council => council.to_string(),
                TtcGroupBy::Both => format!("{} / {}", row.request_type, council),
            };
            samples
                .entry(key)
                .or_default()
                .push(stats::millis_to_days(millis));
        }
        if excluded_negative > 0 {
            warn!(excluded_negative, "closed before created; left out of time-to-close");
        }

        let groups: BTreeMap<_, _> = samples
            .into_iter()
            .filter_map(|(key, days)| summarize(days).map(|s| (key, s)))
            .collect();
        let total: u64 = groups.values().map(|g| g.count).sum();
        debug!(groups = groups.len(), total, "computed time to close");

        Ok(TimeToCloseReport {
            group_by,
            total,
            excluded_negative,
            groups,
        })
    }

    pub async fn frequency(&self, query: &FrequencyQuery) -> Result<FrequencyReport, QueryError> {
        let filter = RequestFilter {
            start_date: query.start_date,
            end_date: query.end_date,
            nc_list: query.councils.clone(),
            request_types: Vec::new(),
        };
        filter.validate()?;

        let mut fields = Vec::new();
        if !query.aggregate {
            fields.push(CountField::NcName);
        }
        if query.service {
            fields.push(CountField::RequestType);
        }
        let grouped = self.store.count_by(&filter, &fields).await?;

        let mut counts: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        let mut total = 0i64;
        for group in grouped {
            let mut keys = group.keys.into_iter();
            let outer = if query.aggregate {
                ALL_COUNCILS.to_string()
            } else {
                keys.next()
                    .flatten()
                    .unwrap_or_else(|| UNKNOWN_COUNCIL.to_string())
            };
            let inner = if query.service {
                keys.next().flatten().unwrap_or_default()
            } else {
                TOTAL_KEY.to_string()
            };
            *counts.entry(outer).or_default().entry(inner).or_default() += group.count;
            total += group.count;
        }

        Ok(FrequencyReport {
            aggregate: query.aggregate,
            total,
            counts,
        })
    }

    pub async fn request_counts(
        &self,
        filter: &RequestFilter,
        fields: &[CountField],
    ) -> Result<CountsReport, QueryError> {
        filter.validate()?;
        if fields.is_empty() {
            return Err(ValidationError::MissingParameter("countFields").into());
        }
        let rows = self.store.count_by(filter, fields).await?;
        Ok(CountsReport {
            fields: fields.to_vec(),
            total: rows.iter().map(|r| r.count).sum(),
            rows,
        })
    }

    pub async fn request_detail(&self, sr_number: &str) -> Result<ServiceRequest, QueryError> {
        let sr_number = sr_number.trim();
        if sr_number.is_empty() {
            return Err(ValidationError::MissingParameter("srnumber").into());
        }
        self.store
            .get_request(sr_number)
            .await?
            .ok_or_else(|| QueryError::NotFound(sr_number.to_string()))
    }

    /// Map pins for matching requests that carry coordinates.
    pub async fn base_pins(&self, filter: &RequestFilter) -> Result<Vec<Pin>, QueryError> {
        filter.validate()?;
        Ok(self.store.pins(filter).await?)
    }
}
