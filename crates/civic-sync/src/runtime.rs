use std::sync::Arc;

use anyhow::{Context, Result};
use civic_adapters::SocrataClient;
use civic_storage::{HttpFetcher, PgStore};

use crate::engine::IngestEngine;
use crate::settings::Settings;

/// Production wiring: Postgres store plus the Socrata-backed engine.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<PgStore>,
    pub engine: Arc<IngestEngine>,
}

pub async fn connect_services(settings: &Settings) -> Result<Services> {
    let store = Arc::new(
        PgStore::connect(&settings.pg_store_config())
            .await
            .context("connecting to postgres")?,
    );
    let fetcher = Arc::new(HttpFetcher::new(settings.http_client_config())?);

    let client = SocrataClient::new(settings.source.clone(), fetcher);

    let engine = Arc::new(IngestEngine::new(
        Arc::new(client),
        store.clone(),
        settings.ingest_options(),
    ));
    Ok(Services { store, engine })
}
