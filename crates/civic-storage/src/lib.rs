//! Store access layer and HTTP fetch utilities for the civic 311 service.

mod http;
mod memory;
mod postgres;
mod store;

pub use http::{
    classify_reqwest_error, classify_status, is_rejected_status, BackoffPolicy, FetchError,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket,
    TokenBucketConfig,
};
pub use memory::MemoryStore;
pub use postgres::{PgStore, PgStoreConfig};
pub use store::{RequestStore, StoreError, UpsertOutcome};

pub const CRATE_NAME: &str = "civic-storage";
