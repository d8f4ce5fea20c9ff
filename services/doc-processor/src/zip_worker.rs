//! ZIP queue consumer: streams an uploaded archive, creates one FileMaster
//! per entry under the dedup index, and fans the entries out onto the file
//! queue once their uploads land.
//!
//! Terminal problems (not a ZIP, traversal, size cap) fail the ZipMaster and
//! acknowledge the message; transient ones release the row lock and rethrow
//! so the broker redelivers.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use shared::dto::{FileJobMessage, ZipJobMessage};
use shared::error::ProcessingError;
use shared::queue::{content_dedup_id, message_group_id};
use shared::storage::{construct_key, KeyKind};

use crate::model::{extension_of, JobStatus, SourceType, ZipMaster, ZipStatus};
use crate::post_commit::PostCommitQueue;
use crate::repo::{self, FileInsert, NewFileMaster};
use crate::AppState;

/// A spooled archive entry ready for insert + upload.
struct SpooledEntry {
    file_name: String,
    extension: String,
    file_hash: String,
    file_size: i64,
    spool_path: PathBuf,
}

/// An entry rejected during validation; recorded as IGNORED.
struct RejectedEntry {
    file_name: String,
    extension: String,
    file_size: i64,
    reason: String,
}

enum EntryPlan {
    Accept,
    Reject(String),
}

/// Validates one archive entry name: rejects empty names, dot-files, path
/// traversal, and extensions no handler supports.
fn plan_entry(
    raw_name: &str,
    enclosed: Option<&std::path::Path>,
    registry: &crate::handlers::HandlerRegistry,
) -> EntryPlan {
    if raw_name.trim().is_empty() {
        return EntryPlan::Reject("empty entry name".into());
    }
    if enclosed.is_none() {
        return EntryPlan::Reject("path traversal in entry name".into());
    }
    let base = base_name(raw_name);
    if base.is_empty() {
        return EntryPlan::Reject("empty entry name".into());
    }
    if base.starts_with('.') {
        return EntryPlan::Reject("hidden file".into());
    }
    let extension = extension_of(&base);
    if !registry.supports(&extension) {
        return EntryPlan::Reject(format!("unsupported file extension '{extension}'"));
    }
    EntryPlan::Accept
}

pub(crate) fn base_name(raw_name: &str) -> String {
    raw_name
        .replace('\\', "/")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

pub async fn handle_zip_message(state: AppState, body: String) -> anyhow::Result<()> {
    let message: ZipJobMessage = match serde_json::from_str(&body) {
        Ok(message) => message,
        Err(err) => {
            // A malformed payload can never succeed; acknowledge and move on.
            error!(error = %err, body, "dropping undecodable zip message");
            return Ok(());
        }
    };
    let zip_master_id = message.zip_master_id;

    let client = state.pool.get().await?;
    if !repo::lock_zip_master(&client, zip_master_id).await? {
        info!(zip_master_id, "zip master not in queued state; acknowledging");
        return Ok(());
    }
    let Some(zip) = repo::get_zip_master(&client, zip_master_id).await? else {
        warn!(zip_master_id, "zip master vanished after locking");
        return Ok(());
    };
    repo::transition_job(
        &client,
        zip.processing_job_id,
        &[JobStatus::Queued],
        JobStatus::InProgress,
        Some("extracting archive"),
    )
    .await?;
    drop(client);

    match extract_archive(&state, &zip).await {
        Ok(created) => {
            let client = state.pool.get().await?;
            repo::transition_zip(
                &client,
                zip.id,
                ZipStatus::Extracting,
                ZipStatus::Extracted,
                None,
            )
            .await?;
            if created == 0 {
                // Nothing to process downstream; the job is vacuously done.
                repo::transition_job(
                    &client,
                    zip.processing_job_id,
                    &[JobStatus::InProgress],
                    JobStatus::Completed,
                    Some("archive contained no entries"),
                )
                .await?;
            }
            info!(
                zip_master_id = zip.id,
                job_id = zip.processing_job_id,
                files = created,
                step = "zip.extracted",
                "archive extracted"
            );
            Ok(())
        }
        Err(err) if err.is_terminal() => {
            let reason = err.to_string();
            error!(zip_master_id = zip.id, error = %reason, "zip extraction failed terminally");
            let client = state.pool.get().await?;
            repo::transition_zip(
                &client,
                zip.id,
                ZipStatus::Extracting,
                ZipStatus::ExtractionFailed,
                Some(&reason),
            )
            .await?;
            drop(client);
            state
                .lifecycle
                .fail_job(zip.processing_job_id, &reason)
                .await?;
            Ok(())
        }
        Err(err) => {
            warn!(zip_master_id = zip.id, error = %err, "zip extraction failed; releasing for redelivery");
            let client = state.pool.get().await?;
            repo::unlock_zip_master(&client, zip.id).await?;
            Err(anyhow::Error::new(err))
        }
    }
}

/// Streams the archive entry-by-entry through a spool directory, inserts the
/// FileMaster rows in one transaction, and schedules the entry uploads (and
/// their queue messages) strictly after commit.
async fn extract_archive(state: &AppState, zip: &ZipMaster) -> Result<usize, ProcessingError> {
    let spool = spool_dir(state)?;
    let archive_path = spool.path().join("archive.zip");
    state
        .storage
        .download_to_file(&zip.original_file_path, &archive_path)
        .await
        .map_err(|err| ProcessingError::TransientIo(format!("downloading archive: {err}")))?;

    match infer::get_from_path(&archive_path)? {
        Some(kind) if kind.mime_type() == "application/zip" => {}
        _ => {
            return Err(ProcessingError::MalformedContent(
                "uploaded content is not a zip archive".into(),
            ));
        }
    }

    let (accepted, rejected) = spool_entries(state, &spool, &archive_path)?;

    let group = message_group_id(zip.gx_bucket_id, zip.processing_job_id);
    let mut client = state.pool.get().await?;
    let tx = client
        .transaction()
        .await
        .map_err(|err| ProcessingError::Database(err.to_string()))?;

    let mut created = 0usize;
    let mut uploads: Vec<(i64, String, PathBuf, String)> = Vec::new();

    for entry in &rejected {
        let new = NewFileMaster {
            zip_master_id: Some(zip.id),
            processing_job_id: zip.processing_job_id,
            gx_bucket_id: zip.gx_bucket_id,
            dedup_group: &group,
            file_location: "",
            file_name: &entry.file_name,
            file_size: entry.file_size,
            extension: &entry.extension,
            file_hash: "",
            source_type: SourceType::Extracted,
            extraction_depth: 1,
        };
        repo::insert_ignored_file_master(&tx, &new, &entry.reason)
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?;
        created += 1;
    }

    for entry in &accepted {
        let key = construct_key(
            &entry.file_name,
            zip.gx_bucket_id,
            zip.processing_job_id,
            KeyKind::Files,
        );
        let new = NewFileMaster {
            zip_master_id: Some(zip.id),
            processing_job_id: zip.processing_job_id,
            gx_bucket_id: zip.gx_bucket_id,
            dedup_group: &group,
            file_location: &key,
            file_name: &entry.file_name,
            file_size: entry.file_size,
            extension: &entry.extension,
            file_hash: &entry.file_hash,
            source_type: SourceType::Extracted,
            extraction_depth: 1,
        };
        match repo::insert_file_master(&tx, &new)
            .await
            .map_err(|err| ProcessingError::Database(err.to_string()))?
        {
            FileInsert::Queued(id) => {
                uploads.push((id, key, entry.spool_path.clone(), entry.file_hash.clone()));
                created += 1;
            }
            FileInsert::Duplicate { id, duplicate_of } => {
                info!(
                    file_master_id = id,
                    duplicate_of,
                    file = %entry.file_name,
                    "duplicate archive entry recorded"
                );
                created += 1;
            }
        }
    }

    // Uploads must not start before the rows are visible; each success sends
    // the per-file message, each failure flips its row.
    let mut after_commit = PostCommitQueue::new();
    let spool = Arc::new(spool);
    for (file_master_id, key, path, hash) in uploads {
        let storage = state.storage.clone();
        let queue = state.queue.clone();
        let lifecycle = state.lifecycle.clone();
        let pool = state.uploads.clone();
        let group = group.clone();
        let dedup = content_dedup_id(&group, &hash);
        let spool = spool.clone();
        let job_id = zip.processing_job_id;
        after_commit.defer(async move {
            pool.spawn(
                async move {
                    let _keep_spool_alive = spool;
                    storage.put_file(&key, &path).await
                },
                move |result| async move {
                    match result {
                        Ok(()) => {
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
                            error!(file_master_id, error = %err, "entry upload failed");
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

    Ok(created)
}

fn spool_dir(state: &AppState) -> Result<tempfile::TempDir, ProcessingError> {
    if state.settings.zip_handler.temp_dir.is_empty() {
        Ok(tempfile::tempdir()?)
    } else {
        Ok(tempfile::tempdir_in(&state.settings.zip_handler.temp_dir)?)
    }
}

/// Walks the archive, hashing each accepted entry while spooling it to disk.
fn spool_entries(
    state: &AppState,
    spool: &tempfile::TempDir,
    archive_path: &std::path::Path,
) -> Result<(Vec<SpooledEntry>, Vec<RejectedEntry>), ProcessingError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| match err {
        zip::result::ZipError::Io(io) => ProcessingError::TransientIo(io.to_string()),
        other => ProcessingError::MalformedContent(format!("invalid zip archive: {other}")),
    })?;

    let max_bytes = state.settings.zip_handler.max_uncompressed_bytes;
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    let mut total_bytes: u64 = 0;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|err| match err {
            zip::result::ZipError::Io(io) => ProcessingError::TransientIo(io.to_string()),
            other => ProcessingError::MalformedContent(format!("reading entry: {other}")),
        })?;
        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let base = base_name(&raw_name);
        let extension = extension_of(&base);
        match plan_entry(&raw_name, entry.enclosed_name(), &state.registry) {
            EntryPlan::Reject(reason) => {
                rejected.push(RejectedEntry {
                    file_name: if base.is_empty() { raw_name } else { base },
                    extension,
                    file_size: entry.size() as i64,
                    reason,
                });
                continue;
            }
            EntryPlan::Accept => {}
        }

        total_bytes = total_bytes.saturating_add(entry.size());
        if total_bytes > max_bytes {
            return Err(ProcessingError::MalformedContent(format!(
                "archive exceeds uncompressed size cap of {max_bytes} bytes"
            )));
        }

        let spool_path = spool.path().join(format!("entry-{index}"));
        let mut out = std::fs::File::create(&spool_path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];
        let mut written: u64 = 0;
        loop {
            let read = entry
                .read(&mut buffer)
                .map_err(|err| ProcessingError::MalformedContent(format!("reading entry: {err}")))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            out.write_all(&buffer[..read])?;
            written += read as u64;
        }
        out.flush()?;

        accepted.push(SpooledEntry {
            file_name: base,
            extension,
            file_hash: format!("{:x}", hasher.finalize()),
            file_size: written as i64,
            spool_path,
        });
    }

    Ok((accepted, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use crate::handlers::HandlerRegistry;

    #[test]
    fn base_name_flattens_directories() {
        assert_eq!(base_name("docs/a.pdf"), "a.pdf");
        assert_eq!(base_name("docs\\b.pdf"), "b.pdf");
        assert_eq!(base_name("c.pdf"), "c.pdf");
        assert_eq!(base_name("docs/"), "");
    }

    #[test]
    fn entry_validation_matrix() {
        let settings = shared::config::Settings::new().expect("default settings");
        let registry = HandlerRegistry::from_settings(&settings);

        let accept = |name: &str| {
            matches!(
                plan_entry(name, Some(Path::new(name)), &registry),
                EntryPlan::Accept
            )
        };
        let reject_reason = |name: &str, enclosed: Option<&Path>| match plan_entry(
            name, enclosed, &registry,
        ) {
            EntryPlan::Reject(reason) => reason,
            EntryPlan::Accept => panic!("expected rejection for {name}"),
        };

        assert!(accept("a.pdf"));
        assert!(accept("docs/report.docx"));
        assert!(accept("mail.msg"));
        assert!(accept("nested.zip"));

        assert!(reject_reason("", None).contains("empty"));
        assert!(reject_reason("../evil.pdf", None).contains("traversal"));
        assert!(reject_reason(".hidden", Some(Path::new(".hidden"))).contains("hidden"));
        assert!(
            reject_reason("readme.xyz", Some(Path::new("readme.xyz"))).contains("unsupported")
        );
        assert!(reject_reason("binary", Some(Path::new("binary"))).contains("unsupported"));
    }
}
