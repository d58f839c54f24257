use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::engine::IngestEngine;
use crate::settings::SchedulerSettings;

/// Build (but do not start) the periodic update and reconciliation jobs.
/// Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    engine: Arc<IngestEngine>,
    settings: &SchedulerSettings,
) -> Result<Option<JobScheduler>> {
    if !settings.enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let update_engine = engine.clone();
    let update_job = Job::new_async(settings.update_cron.as_str(), move |_uuid, _l| {
        let engine = update_engine.clone();
        Box::pin(async move {
            match engine.update().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    inserted = report.total(|u| u.inserted),
                    updated = report.total(|u| u.updated),
                    "scheduled update finished"
                ),
                Err(err) => error!(error = %err, "scheduled update failed"),
            }
        })
    })
    .with_context(|| format!("creating update job for cron {}", settings.update_cron))?;
    sched.add(update_job).await.context("adding update job")?;

    let delete_job = Job::new_async(settings.delete_cron.as_str(), move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.delete().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    deleted = report.deleted,
                    status = ?report.status,
                    "scheduled reconciliation finished"
                ),
                Err(err) => error!(error = %err, "scheduled reconciliation failed"),
            }
        })
    })
    .with_context(|| format!("creating delete job for cron {}", settings.delete_cron))?;
    sched.add(delete_job).await.context("adding delete job")?;

    Ok(Some(sched))
}
