use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use civic_core::{
    ClosedRequestRow, CountField, GroupCount, IngestionCheckpoint, Pin, RequestFilter,
    ServiceRequest,
};
use tokio::sync::RwLock;

use crate::store::{RequestStore, StoreError, UpsertOutcome};

/// In-process store with the same upsert and filter semantics as `PgStore`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: RwLock<BTreeMap<String, ServiceRequest>>,
    checkpoints: RwLock<HashMap<String, IngestionCheckpoint>>,
    failing_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_requests(rows: impl IntoIterator<Item = ServiceRequest>) -> Self {
        let requests = rows
            .into_iter()
            .map(|row| (row.sr_number.clone(), row))
            .collect();
        Self {
            requests: RwLock::new(requests),
            ..Self::default()
        }
    }

    /// Make the next `count` write calls fail with a transient error.
    pub fn fail_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<ServiceRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected write failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn upsert_page(
        &self,
        rows: &[ServiceRequest],
        checkpoint: Option<&IngestionCheckpoint>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.check_write()?;

        let mut outcome = UpsertOutcome::default();
        let mut requests = self.requests.write().await;
        for row in rows {
            match requests.get_mut(&row.sr_number) {
                None => {
                    requests.insert(row.sr_number.clone(), row.clone());
                    outcome.inserted += 1;
                }
                Some(existing) if existing.same_mutable_fields(row) => outcome.unchanged += 1,
                Some(existing) => {
                    let created_date = existing.created_date;
                    *existing = row.clone();
                    existing.created_date = created_date;
                    outcome.updated += 1;
                }
            }
        }
        if let Some(checkpoint) = checkpoint {
            self.checkpoints
                .write()
                .await
                .insert(checkpoint.partition_key.clone(), checkpoint.clone());
        }
        Ok(outcome)
    }

    async fn load_checkpoint(
        &self,
        partition_key: &str,
    ) -> Result<Option<IngestionCheckpoint>, StoreError> {
        Ok(self.checkpoints.read().await.get(partition_key).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &IngestionCheckpoint) -> Result<(), StoreError> {
        self.check_write()?;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.partition_key.clone(), checkpoint.clone());
        Ok(())
    }

    async fn sr_numbers_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.created_date >= start && r.created_date <= end)
            .map(|r| r.sr_number.clone())
            .collect())
    }

    async fn delete_created_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        sr_numbers: &[String],
    ) -> Result<u64, StoreError> {
        self.check_write()?;
        let mut requests = self.requests.write().await;
        let mut deleted = 0;
        for sr in sr_numbers {
            let in_window = requests
                .get(sr)
                .is_some_and(|r| r.created_date >= start && r.created_date <= end);
            if in_window && requests.remove(sr).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn get_request(&self, sr_number: &str) -> Result<Option<ServiceRequest>, StoreError> {
        Ok(self.requests.read().await.get(sr_number).cloned())
    }

    async fn closed_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ClosedRequestRow>, StoreError> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .filter_map(|r| {
                r.closed_date.map(|closed_date| ClosedRequestRow {
                    request_type: r.request_type.as_str().to_string(),
                    nc_name: r.nc_name.clone(),
                    created_date: r.created_date,
                    closed_date,
                })
            })
            .collect())
    }

    async fn count_by(
        &self,
        filter: &RequestFilter,
        fields: &[CountField],
    ) -> Result<Vec<GroupCount>, StoreError> {
        let mut groups: BTreeMap<Vec<Option<String>>, i64> = BTreeMap::new();
        for request in self.requests.read().await.values() {
            if !filter.matches(request) {
                continue;
            }
            let keys = fields.iter().map(|f| f.value_of(request)).collect();
            *groups.entry(keys).or_default() += 1;
        }
        Ok(groups
            .into_iter()
            .map(|(keys, count)| GroupCount { keys, count })
            .collect())
    }

    async fn pins(&self, filter: &RequestFilter) -> Result<Vec<Pin>, StoreError> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .filter_map(|r| {
                r.coordinates().map(|(latitude, longitude)| Pin {
                    sr_number: r.sr_number.clone(),
                    latitude,
                    longitude,
                    request_type: r.request_type.as_str().to_string(),
                })
            })
            .collect())
    }
}
