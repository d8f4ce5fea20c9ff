//! Cron-driven periodic tasks: the GX upload scheduler and the lifecycle
//! reconciler. Each runs on its own tokio task, sleeping until the next fire
//! time of its configured cron expression.

use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use shared::gx::GxError;

use crate::model::GxStatus;
use crate::repo;
use crate::AppState;

/// Spawns a loop firing `task` on every upcoming occurrence of `expression`
/// (six-field cron, seconds first).
pub fn spawn_cron<F, Fut>(name: &'static str, expression: String, task: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let schedule = match Schedule::from_str(&expression) {
            Ok(schedule) => schedule,
            Err(err) => {
                error!(scheduler = name, expression, error = %err, "invalid cron expression");
                return;
            }
        };
        info!(scheduler = name, expression, "scheduler started");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(scheduler = name, "cron schedule has no upcoming fire time");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            if let Err(err) = task().await {
                warn!(scheduler = name, error = %err, "scheduler tick failed");
            }
        }
    })
}

/// One GX upload cycle: under the global in-flight cap, submits the oldest
/// QUEUED_FOR_UPLOAD artifacts to GX by presigned source URL and records the
/// returned process ids. Transient GX failures leave rows untouched.
pub async fn gx_upload_tick(state: &AppState) -> anyhow::Result<()> {
    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;

    let in_flight = repo::count_gx_in_flight(&tx).await?;
    let capacity = state.settings.gx.max_process - in_flight;
    if capacity <= 0 {
        return Ok(());
    }
    let batch = repo::take_gx_queued_for_upload(&tx, capacity).await?;
    if batch.is_empty() {
        return Ok(());
    }

    for master in &batch {
        let Some(bucket_id) = master.gx_bucket_id else {
            // Bulk artifacts have no bucket to ingest into; record them as a
            // terminal skip so the parent job can still complete.
            repo::record_gx_submission(
                &tx,
                master.id,
                None,
                GxStatus::Skipped,
                Some("no gx bucket for bulk artifact"),
            )
            .await?;
            continue;
        };

        let source_url = state.storage.presign_get(&master.file_location).await?;
        match state
            .gx
            .ingest_remote(
                bucket_id,
                &master.processed_file_name,
                &master.extension,
                &source_url,
            )
            .await
        {
            Ok(response) => match response.ingest {
                Some(receipt) if receipt.process_id.is_some() => {
                    let raw = receipt.status.unwrap_or_default();
                    let mapped = GxStatus::from_gx(&raw);
                    let message = if mapped == GxStatus::Error {
                        Some(format!("gx status '{raw}'"))
                    } else {
                        None
                    };
                    repo::record_gx_submission(
                        &tx,
                        master.id,
                        receipt.process_id,
                        mapped,
                        message.as_deref(),
                    )
                    .await?;
                    info!(
                        gx_master_id = master.id,
                        status = mapped.as_str(),
                        step = "gx.submitted",
                        "artifact submitted to gx"
                    );
                }
                _ => {
                    let message = response
                        .message
                        .filter(|message| !message.is_empty())
                        .unwrap_or_else(|| "invalid response".to_string());
                    repo::record_gx_submission(
                        &tx,
                        master.id,
                        None,
                        GxStatus::Error,
                        Some(&message),
                    )
                    .await?;
                }
            },
            Err(GxError::Rejected { status, message }) => {
                repo::record_gx_submission(
                    &tx,
                    master.id,
                    None,
                    GxStatus::Error,
                    Some(&format!("gx rejected ingest ({status}): {message}")),
                )
                .await?;
            }
            Err(GxError::Transient(err)) => {
                warn!(gx_master_id = master.id, error = %err, "gx unavailable; will retry next cycle");
            }
        }
    }

    tx.commit().await?;
    Ok(())
}

/// One lifecycle cycle: poll in-flight GX processes, then flip finished jobs.
pub async fn lifecycle_tick(state: &AppState) -> anyhow::Result<()> {
    state.lifecycle.poll_gx(&state.gx).await?;
    state.lifecycle.reconcile_jobs().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cron_expressions_parse() {
        let settings = shared::config::SchedulerSettings::default();
        assert!(Schedule::from_str(&settings.gx_doc_upload).is_ok());
        assert!(Schedule::from_str(&settings.lifecycle).is_ok());
    }

    #[test]
    fn upcoming_fire_time_is_in_the_future() {
        let schedule = Schedule::from_str("0 * * * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert!(next > Utc::now());
    }
}
