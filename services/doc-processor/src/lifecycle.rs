//! Job lifecycle management.
//!
//! Failure decisions and final job reconciliation run on their own pooled
//! connections with transactions committed before returning, so a terminal
//! verdict is durable even when the worker's surrounding transaction aborts.

use anyhow::{Context, Result};
use deadpool_postgres::Pool;
use tracing::{info, warn};

use shared::gx::{GxClient, GxError};

use crate::model::{FileStatus, GxStatus, JobStatus};
use crate::repo;

/// Outcome of a finished job, derived purely from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

/// Decides whether a job is finished and how. `None` while any child is
/// still in flight. A job completes only when every terminal child counts as
/// success; skipped and deduplicated children do.
pub fn job_outcome(
    files: &[FileStatus],
    gx: &[GxStatus],
    skip_gx_process: bool,
) -> Option<JobOutcome> {
    if files.iter().any(|status| !status.is_terminal()) {
        return None;
    }
    if !skip_gx_process && gx.iter().any(|status| !status.is_terminal()) {
        return None;
    }
    let success = files.iter().all(|status| status.is_success())
        && (skip_gx_process || gx.iter().all(|status| status.is_success()));
    Some(if success {
        JobOutcome::Completed
    } else {
        JobOutcome::Failed
    })
}

#[derive(Clone)]
pub struct JobLifecycleManager {
    pool: Pool,
}

impl JobLifecycleManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Marks a file and, if it has no reason yet, its job as FAILED. Runs in
    /// its own committed transaction.
    pub async fn fail_file(
        &self,
        file_master_id: i64,
        processing_job_id: i64,
        reason: &str,
    ) -> Result<()> {
        let mut client = self.pool.get().await.context("acquiring connection")?;
        let tx = client.transaction().await.context("opening transaction")?;
        repo::fail_file_master(&tx, file_master_id, reason).await?;
        repo::fail_job(&tx, processing_job_id, reason).await?;
        tx.commit().await.context("committing failure")?;
        info!(file_master_id, processing_job_id, reason, "file marked failed");
        Ok(())
    }

    /// Marks the job FAILED, keeping any earlier recorded reason.
    pub async fn fail_job(&self, processing_job_id: i64, reason: &str) -> Result<()> {
        let client = self.pool.get().await.context("acquiring connection")?;
        repo::fail_job(&client, processing_job_id, reason).await?;
        info!(processing_job_id, reason, "job marked failed");
        Ok(())
    }

    /// Polls GX for every in-flight ingest process and fans the status back
    /// onto the owning rows. Transient GX failures leave rows untouched for
    /// the next cycle.
    pub async fn poll_gx(&self, gx: &GxClient) -> Result<()> {
        let client = self.pool.get().await.context("acquiring connection")?;
        let in_flight = repo::list_gx_to_poll(&client).await?;
        for master in in_flight {
            let Some(process_id) = master.gx_process_id else {
                continue;
            };
            match gx.get_status(process_id).await {
                Ok(response) => match response.ingest {
                    Some(status) => {
                        let raw = status.status.unwrap_or_default();
                        let mapped = GxStatus::from_gx(&raw);
                        let message = if mapped == GxStatus::Error {
                            Some(
                                status
                                    .status_message
                                    .unwrap_or_else(|| format!("gx status '{raw}'")),
                            )
                        } else {
                            status.status_message
                        };
                        repo::update_gx_status(&client, master.id, mapped, message.as_deref())
                            .await?;
                    }
                    None => {
                        let message = response
                            .message
                            .unwrap_or_else(|| "invalid response".to_string());
                        repo::update_gx_status(
                            &client,
                            master.id,
                            GxStatus::Error,
                            Some(&message),
                        )
                        .await?;
                    }
                },
                Err(GxError::Rejected { status, message }) => {
                    repo::update_gx_status(
                        &client,
                        master.id,
                        GxStatus::Error,
                        Some(&format!("gx rejected status poll ({status}): {message}")),
                    )
                    .await?;
                }
                Err(GxError::Transient(err)) => {
                    warn!(gx_master_id = master.id, error = %err, "gx poll failed; retrying next cycle");
                }
            }
        }
        Ok(())
    }

    /// Flips every IN_PROGRESS job whose children all reached a terminal
    /// state to COMPLETED or FAILED.
    pub async fn reconcile_jobs(&self) -> Result<()> {
        let mut client = self.pool.get().await.context("acquiring connection")?;
        let jobs = repo::jobs_in_progress(&client).await?;
        for job in jobs {
            let files = repo::file_statuses_for_job(&client, job.id).await?;
            let gx = repo::gx_statuses_for_job(&client, job.id).await?;
            if files.is_empty() {
                // A bulk archive can legitimately yield zero rows only once
                // extraction finished; anything else is still in flight.
                continue;
            }
            let Some(outcome) = job_outcome(&files, &gx, job.skip_gx_process) else {
                continue;
            };
            let tx = client.transaction().await.context("opening transaction")?;
            match outcome {
                JobOutcome::Completed => {
                    repo::transition_job(
                        &tx,
                        job.id,
                        &[JobStatus::InProgress],
                        JobStatus::Completed,
                        Some("completed"),
                    )
                    .await?;
                }
                JobOutcome::Failed => {
                    repo::fail_job(&tx, job.id, "one or more files failed processing").await?;
                }
            }
            tx.commit().await.context("committing reconciliation")?;
            info!(job_id = job.id, ?outcome, "job reconciled");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_children_defer_the_verdict() {
        assert_eq!(job_outcome(&[FileStatus::Queued], &[], false), None);
        assert_eq!(job_outcome(&[FileStatus::InProgress], &[], false), None);
        assert_eq!(
            job_outcome(
                &[FileStatus::Completed],
                &[GxStatus::QueuedForUpload],
                false
            ),
            None
        );
        assert_eq!(
            job_outcome(&[FileStatus::Completed], &[GxStatus::Processing], false),
            None
        );
    }

    #[test]
    fn all_successful_children_complete_the_job() {
        assert_eq!(
            job_outcome(
                &[FileStatus::Completed, FileStatus::Duplicate, FileStatus::Ignored],
                &[GxStatus::Complete],
                false
            ),
            Some(JobOutcome::Completed)
        );
    }

    #[test]
    fn skipped_gx_counts_as_success() {
        assert_eq!(
            job_outcome(&[FileStatus::Completed], &[GxStatus::Skipped], false),
            Some(JobOutcome::Completed)
        );
    }

    #[test]
    fn any_failed_child_fails_the_job() {
        assert_eq!(
            job_outcome(
                &[FileStatus::Completed, FileStatus::Failed],
                &[GxStatus::Complete],
                false
            ),
            Some(JobOutcome::Failed)
        );
        assert_eq!(
            job_outcome(&[FileStatus::Completed], &[GxStatus::Error], false),
            Some(JobOutcome::Failed)
        );
    }

    #[test]
    fn skip_gx_ignores_gx_children() {
        assert_eq!(
            job_outcome(&[FileStatus::Completed], &[GxStatus::Queued], true),
            Some(JobOutcome::Completed)
        );
    }
}
