//! File queue consumer: the per-file normalisation pipeline.
//!
//! Locks the FileMaster, loads the bytes from the object store, dispatches to
//! the matching handler, and acts on the result: publish the artifact, upload
//! a transformed PDF, or fan extracted children back onto the file queue.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use shared::dto::FileJobMessage;
use shared::error::ProcessingError;
use shared::queue::{extracted_dedup_id, message_group_id};
use shared::storage::{construct_key, sanitize_file_name, KeyKind};

use crate::handlers::ExtractedFileItem;
use crate::model::{extension_of, FileMaster, GxStatus, JobStatus, ProcessingJob, SourceType};
use crate::post_commit::PostCommitQueue;
use crate::repo::{self, FileInsert, NewFileMaster};
use crate::zip_worker::base_name;
use crate::AppState;

pub async fn handle_file_message(state: AppState, body: String) -> anyhow::Result<()> {
    let message: FileJobMessage = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(err) => {
            error!(error = %err, body, "dropping undecodable file message");
            return Ok(());
        }
    };
    let file_master_id = message.file_master_id;

    let client = state.pool.get().await?;
    if !repo::lock_file_master(&client, file_master_id).await? {
        info!(file_master_id, "file master not in queued state; acknowledging");
        return Ok(());
    }
    let Some(file) = repo::get_file_master(&client, file_master_id).await? else {
        warn!(file_master_id, "file master vanished after locking");
        return Ok(());
    };
    let Some(job) = repo::get_job(&client, file.processing_job_id).await? else {
        warn!(file_master_id, "processing job missing; acknowledging");
        return Ok(());
    };
    if job.status == JobStatus::Terminated {
        info!(file_master_id, job_id = job.id, "job terminated; exiting without side effects");
        return Ok(());
    }
    repo::transition_job(
        &client,
        job.id,
        &[JobStatus::Queued],
        JobStatus::InProgress,
        Some("processing files"),
    )
    .await?;
    drop(client);

    match process_file(&state, &job, &file).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_terminal() => {
            let reason = err.to_string();
            error!(file_master_id, error = %reason, "file processing failed terminally");
            state.lifecycle.fail_file(file.id, job.id, &reason).await?;
            Ok(())
        }
        Err(err) => {
            warn!(file_master_id, error = %err, "file processing failed; releasing for redelivery");
            let client = state.pool.get().await?;
            repo::unlock_file_master(&client, file.id).await?;
            Err(anyhow::Error::new(err))
        }
    }
}

async fn process_file(
    state: &AppState,
    job: &ProcessingJob,
    file: &FileMaster,
) -> Result<(), ProcessingError> {
    // Already normalised and not wanted by GX: record the skip and finish.
    if job.skip_gx_process && file.extension == "pdf" {
        let mut client = state.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?;
        repo::insert_gx_master(
            &tx,
            file,
            &file.file_location,
            &file.file_name,
            file.file_size,
            GxStatus::Skipped,
        )
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;
        repo::complete_file_master(&tx, file.id, Some("gx processing skipped"))
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?;
        tx.commit()
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?;
        info!(file_master_id = file.id, step = "file.skipped", "gx skipped for pdf");
        return Ok(());
    }

    if file.extension == "zip"
        && file.extraction_depth >= state.settings.zip_handler.max_depth as i32
    {
        return Err(ProcessingError::MalformedContent(format!(
            "archive nesting exceeds depth cap of {}",
            state.settings.zip_handler.max_depth
        )));
    }

    let spool = tempfile::tempdir()?;
    let input = spool.path().join(sanitize_file_name(&file.file_name));
    state
        .storage
        .download_to_file(&file.file_location, &input)
        .await
        .map_err(|err| ProcessingError::TransientIo(format!("downloading file: {err}")))?;

    let handler = state.registry.dispatch(&file.extension)?;
    let items = handler.handle(&input, file).await?;

    if items.is_empty() {
        // The stored object already is the terminal artifact.
        return publish_artifact(
            state,
            job,
            file,
            &file.file_location,
            &file.file_name,
            file.file_size,
        )
        .await;
    }

    if items.len() == 1
        && extension_of(&items[0].name) == "pdf"
        && items[0].name == file.pdf_name()
    {
        let item = &items[0];
        let key = construct_key(&item.name, file.gx_bucket_id, job.id, KeyKind::Files);
        state
            .storage
            .put_bytes(&key, item.bytes.clone())
            .await
            .map_err(|err| ProcessingError::TransientIo(format!("uploading artifact: {err}")))?;
        info!(
            file_master_id = file.id,
            key = %key,
            step = "file.transformed",
            "stored transformed pdf"
        );
        return publish_artifact(state, job, file, &key, &item.name, item.bytes.len() as i64)
            .await;
    }

    fan_out_children(state, job, file, items).await
}

/// Copies the final PDF into the gxFiles namespace, creates the GxMaster, and
/// completes the parent file. The copy runs before the transaction: keys are
/// deterministic and re-copying is idempotent, while a GxMaster row must
/// never reference an object that is not there yet.
async fn publish_artifact(
    state: &AppState,
    job: &ProcessingJob,
    file: &FileMaster,
    src_key: &str,
    processed_name: &str,
    file_size: i64,
) -> Result<(), ProcessingError> {
    let artifact_key = construct_key(
        processed_name,
        file.gx_bucket_id,
        file.processing_job_id,
        KeyKind::GxFiles,
    );
    state
        .storage
        .copy(src_key, &artifact_key)
        .await
        .map_err(|err| ProcessingError::TransientIo(format!("copying artifact: {err}")))?;

    let mut client = state.pool.get().await?;
    let tx = client
        .transaction()
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;
    // A job that opted out of GX still gets its artifact recorded, just as
    // a terminal skip instead of an upload candidate.
    let status = if job.skip_gx_process {
        GxStatus::Skipped
    } else {
        GxStatus::QueuedForUpload
    };
    repo::insert_gx_master(&tx, file, &artifact_key, processed_name, file_size, status)
    .await
    .map_err(|err| ProcessingError::Database(err.to_string()))?;
    repo::complete_file_master(&tx, file.id, None)
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;
    tx.commit()
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;
    info!(
        file_master_id = file.id,
        artifact = %artifact_key,
        status = status.as_str(),
        step = "file.artifact",
        "artifact recorded"
    );
    Ok(())
}

/// Creates one FileMaster per extracted child, marks the parent done, and
/// schedules the child uploads (and their queue messages) after commit.
async fn fan_out_children(
    state: &AppState,
    job: &ProcessingJob,
    file: &FileMaster,
    items: Vec<ExtractedFileItem>,
) -> Result<(), ProcessingError> {
    let group = message_group_id(file.gx_bucket_id, job.id);
    let child_depth = file.extraction_depth + 1;
    let total = items.len();

    let mut client = state.pool.get().await?;
    let tx = client
        .transaction()
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;

    let mut uploads: Vec<(i64, String, Vec<u8>)> = Vec::new();
    for item in items {
        let name = base_name(&item.name);
        let extension = extension_of(&name);
        let hash = format!("{:x}", Sha256::digest(&item.bytes));
        let size = item.bytes.len() as i64;
        let key = construct_key(&name, file.gx_bucket_id, job.id, KeyKind::Files);
        let new = NewFileMaster {
            zip_master_id: file.zip_master_id,
            processing_job_id: job.id,
            gx_bucket_id: file.gx_bucket_id,
            dedup_group: &group,
            file_location: &key,
            file_name: &name,
            file_size: size,
            extension: &extension,
            file_hash: &hash,
            source_type: SourceType::Extracted,
            extraction_depth: child_depth,
        };

        if name.is_empty() || name.starts_with('.') {
            repo::insert_ignored_file_master(&tx, &new, "invalid extracted file name")
                .await
                .map_err(|err| ProcessingError::Database(err.to_string()))?;
            continue;
        }
        if !state.registry.supports(&extension) {
            repo::insert_ignored_file_master(
                &tx,
                &new,
                &format!("unsupported file extension '{extension}'"),
            )
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?;
            continue;
        }

        match repo::insert_file_master(&tx, &new)
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?
        {
            FileInsert::Queued(id) => uploads.push((id, key, item.bytes)),
            FileInsert::Duplicate { id, duplicate_of } => {
                info!(
                    file_master_id = id,
                    duplicate_of,
                    file = %name,
                    "duplicate extracted file recorded"
                );
            }
        }
    }

    repo::complete_file_master(&tx, file.id, Some(&format!("extracted {total} files")))
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;

    // Nothing leaves the service before the rows are durable: the uploads
    // (and the queue sends chained onto them) are registered now but only
    // dispatched once commit returns.
    let mut after_commit = PostCommitQueue::new();
    let job_id = job.id;
    let group = Arc::new(group);
    for (file_master_id, key, bytes) in uploads {
        let storage = state.storage.clone();
        let queue = state.queue.clone();
        let lifecycle = state.lifecycle.clone();
        let pool = state.uploads.clone();
        let group = group.clone();
        after_commit.defer(async move {
            pool.spawn(
                async move { storage.put_bytes(&key, bytes).await },
                move |result| async move {
                    match result {
                        Ok(()) => {
                            let dedup = extracted_dedup_id(file_master_id);
                            if let Err(err) = queue
                                .send_file_job(&FileJobMessage { file_master_id }, &group, &dedup)
                                .await
                            {
                                error!(file_master_id, error = %err, "failed to enqueue extracted file");
                                let _ = lifecycle
                                    .fail_file(file_master_id, job_id, "failed to enqueue file")
                                    .await;
                            }
                        }
                        Err(err) => {
                            error!(file_master_id, error = %err, "child upload failed");
                            let _ = lifecycle
                                .fail_file(file_master_id, job_id, "failed to upload extracted file")
                                .await;
                        }
                    }
                },
            );
        });
    }

    tx.commit()
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;
    after_commit.dispatch().await;

    info!(
        file_master_id = file.id,
        children = total,
        step = "file.extracted",
        "fanned out extracted children"
    );
    Ok(())
}
