use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civic_core::{
    ClosedRequestRow, CountField, GroupCount, IngestionCheckpoint, Pin, RequestFilter,
    ServiceRequest,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same transaction can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => match err {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => true,
                sqlx::Error::Database(db) => matches!(
                    db.code().as_deref(),
                    // serialization_failure, deadlock_detected, admin_shutdown
                    Some("40001") | Some("40P01") | Some("57P01")
                ),
                _ => false,
            },
            Self::Migrate(_) => false,
            Self::Unavailable(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertOutcome {
    pub fn committed(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

/// Everything the ingestion engine writes and the query services read.
///
/// Each write method is one transaction. Implementations must keep
/// `created_date` of an existing row untouched on upsert.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Upsert one page of rows and, in the same transaction, persist the
    /// partition checkpoint. Rows must have unique request numbers.
    async fn upsert_page(
        &self,
        rows: &[ServiceRequest],
        checkpoint: Option<&IngestionCheckpoint>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn load_checkpoint(
        &self,
        partition_key: &str,
    ) -> Result<Option<IngestionCheckpoint>, StoreError>;

    async fn save_checkpoint(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError>;

    async fn sr_numbers_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError>;

    /// Delete the given request numbers, restricted to rows created inside the window.
    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sr_numbers: &[String],
    ) -> Result<u64, StoreError>;

    async fn get_request(&self, sr_number: &str) -> Result<Option<ServiceRequest>, StoreError>;

    /// Rows matching `filter` that carry a closed timestamp.
    async fn closed_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ClosedRequestRow>, StoreError>;

    async fn count_by(
        &self,
        filter: &RequestFilter,
        fields: &[CountField],
    ) -> Result<Vec<GroupCount>, StoreError>;

    async fn pins(&self, filter: &RequestFilter) -> Result<Vec<Pin>, StoreError>;
}
