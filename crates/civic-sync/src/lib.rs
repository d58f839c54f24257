//! Ingestion engine, process settings and the periodic sync scheduler.

mod engine;
mod runtime;
mod scheduler;
mod settings;

pub use engine::{IngestEngine, IngestError, IngestOptions, DELETE_PARTITION, UPDATE_PARTITION};
pub use runtime::{connect_services, Services};
pub use scheduler::maybe_build_scheduler;
pub use settings::{
    DatabaseSettings, HttpSettings, IngestSettings, SchedulerSettings, ServerSettings, Settings,
    DEFAULT_SETTINGS_FILE,
};

pub const CRATE_NAME: &str = "civic-sync";
