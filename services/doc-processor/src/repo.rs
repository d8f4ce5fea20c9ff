//! All SQL for the pipeline. Status transitions are expressed as
//! status-conditional UPDATEs so the row itself acts as the lock: of any
//! number of concurrent workers, exactly one sees `rows_affected == 1`.

use anyhow::{Context, Result};
use deadpool_postgres::GenericClient;
use uuid::Uuid;

use shared::dto::DocumentEntry;

use crate::model::{
    parse_status, FileMaster, FileStatus, GxMaster, GxStatus, JobStatus, ProcessingJob,
    SourceType, ZipMaster, ZipStatus,
};

/// Creates tables, the dedup index, and the read-model view. Idempotent.
pub async fn ensure_schema(client: &impl GenericClient) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS processing_jobs (
                id BIGSERIAL PRIMARY KEY,
                original_filename TEXT NOT NULL,
                file_location TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                current_stage TEXT,
                error_message TEXT,
                gx_bucket_id BIGINT,
                skip_gx_process BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        "CREATE TABLE IF NOT EXISTS zip_masters (
                id BIGSERIAL PRIMARY KEY,
                processing_job_id BIGINT NOT NULL UNIQUE REFERENCES processing_jobs(id),
                gx_bucket_id BIGINT,
                zip_processing_status TEXT NOT NULL,
                original_file_path TEXT NOT NULL,
                original_file_name TEXT NOT NULL,
                file_size BIGINT NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        "CREATE TABLE IF NOT EXISTS file_masters (
                id BIGSERIAL PRIMARY KEY,
                zip_master_id BIGINT REFERENCES zip_masters(id),
                processing_job_id BIGINT NOT NULL REFERENCES processing_jobs(id),
                gx_bucket_id BIGINT,
                dedup_group TEXT NOT NULL,
                duplicate_of_file_id BIGINT,
                file_location TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size BIGINT NOT NULL DEFAULT 0,
                extension TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                file_processing_status TEXT NOT NULL,
                error_message TEXT,
                source_type TEXT NOT NULL,
                extraction_depth INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_file_masters_dedup
                ON file_masters (dedup_group, file_hash)
                WHERE file_processing_status NOT IN ('DUPLICATE','IGNORED','TERMINATED')",
        "CREATE TABLE IF NOT EXISTS gx_masters (
                id BIGSERIAL PRIMARY KEY,
                source_file_id BIGINT NOT NULL REFERENCES file_masters(id),
                gx_bucket_id BIGINT,
                file_location TEXT NOT NULL,
                processed_file_name TEXT NOT NULL,
                file_size BIGINT NOT NULL DEFAULT 0,
                extension TEXT NOT NULL,
                gx_status TEXT NOT NULL,
                gx_process_id UUID,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        "CREATE OR REPLACE VIEW document_processing_view AS
                SELECT fm.processing_job_id,
                       fm.file_name,
                       'Ingestion' AS phase,
                       CASE fm.file_processing_status
                           WHEN 'QUEUED' THEN 'Queued'
                           WHEN 'IN_PROGRESS' THEN 'Processing'
                           WHEN 'COMPLETED' THEN 'Processed'
                           WHEN 'FAILED' THEN 'Failed'
                           WHEN 'DUPLICATE' THEN 'Duplicate'
                           WHEN 'IGNORED' THEN 'Ignored'
                           WHEN 'TERMINATED' THEN 'Terminated'
                           ELSE fm.file_processing_status
                       END AS display_status,
                       fm.error_message,
                       fm.created_at
                  FROM file_masters fm
                 WHERE NOT EXISTS (
                           SELECT 1 FROM gx_masters g WHERE g.source_file_id = fm.id
                       )
                UNION ALL
                SELECT fm.processing_job_id,
                       g.processed_file_name,
                       'GroundX' AS phase,
                       CASE g.gx_status
                           WHEN 'QUEUED_FOR_UPLOAD' THEN 'Queued'
                           WHEN 'QUEUED' THEN 'Indexing'
                           WHEN 'PROCESSING' THEN 'Indexing'
                           WHEN 'ACTIVE' THEN 'Indexing'
                           WHEN 'COMPLETE' THEN 'Indexed'
                           WHEN 'SKIPPED' THEN 'Skipped'
                           WHEN 'ERROR' THEN 'Failed'
                           WHEN 'CANCELLED' THEN 'Cancelled'
                           WHEN 'TERMINATED' THEN 'Terminated'
                           ELSE g.gx_status
                       END AS display_status,
                       g.error_message,
                       g.created_at
                  FROM gx_masters g
                  JOIN file_masters fm ON fm.id = g.source_file_id",
    ];
    for statement in statements {
        client
            .execute(statement, &[])
            .await
            .context("ensuring schema")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// processing_jobs

pub async fn insert_processing_job(
    client: &impl GenericClient,
    original_filename: &str,
    gx_bucket_id: Option<i64>,
    skip_gx_process: bool,
) -> Result<i64> {
    let row = client
        .query_one(
            "INSERT INTO processing_jobs
                 (original_filename, status, gx_bucket_id, skip_gx_process)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
            &[
                &original_filename,
                &JobStatus::PendingUpload.as_str(),
                &gx_bucket_id,
                &skip_gx_process,
            ],
        )
        .await
        .context("inserting processing job")?;
    Ok(row.get(0))
}

pub async fn set_job_location(
    client: &impl GenericClient,
    job_id: i64,
    file_location: &str,
) -> Result<()> {
    client
        .execute(
            "UPDATE processing_jobs SET file_location = $2, updated_at = now() WHERE id = $1",
            &[&job_id, &file_location],
        )
        .await
        .context("setting job location")?;
    Ok(())
}

pub async fn get_job(client: &impl GenericClient, job_id: i64) -> Result<Option<ProcessingJob>> {
    let row = client
        .query_opt("SELECT * FROM processing_jobs WHERE id = $1", &[&job_id])
        .await
        .context("loading processing job")?;
    Ok(row.as_ref().map(ProcessingJob::from_row))
}

/// Status-conditional transition; returns whether this caller won the row.
pub async fn transition_job(
    client: &impl GenericClient,
    job_id: i64,
    from: &[JobStatus],
    to: JobStatus,
    stage: Option<&str>,
) -> Result<bool> {
    let from: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
    let rows = client
        .execute(
            "UPDATE processing_jobs
                SET status = $2,
                    current_stage = COALESCE($3, current_stage),
                    updated_at = now()
              WHERE id = $1 AND status = ANY($4)",
            &[&job_id, &to.as_str(), &stage, &from],
        )
        .await
        .context("transitioning job status")?;
    Ok(rows == 1)
}

/// Idempotent failure: only the first recorded reason sticks, and terminal
/// jobs are left untouched.
pub async fn fail_job(client: &impl GenericClient, job_id: i64, reason: &str) -> Result<bool> {
    let rows = client
        .execute(
            "UPDATE processing_jobs
                SET status = 'FAILED',
                    error_message = COALESCE(error_message, $2),
                    updated_at = now()
              WHERE id = $1
                AND status NOT IN ('COMPLETED','FAILED','TERMINATED')",
            &[&job_id, &reason],
        )
        .await
        .context("failing job")?;
    Ok(rows == 1)
}

pub async fn jobs_in_progress(client: &impl GenericClient) -> Result<Vec<ProcessingJob>> {
    let rows = client
        .query(
            "SELECT * FROM processing_jobs WHERE status = 'IN_PROGRESS' ORDER BY id ASC",
            &[],
        )
        .await
        .context("listing in-progress jobs")?;
    Ok(rows.iter().map(ProcessingJob::from_row).collect())
}

// ---------------------------------------------------------------------------
// zip_masters

pub async fn insert_zip_master(
    client: &impl GenericClient,
    job: &ProcessingJob,
    file_size: i64,
) -> Result<i64> {
    let row = client
        .query_one(
            "INSERT INTO zip_masters
                 (processing_job_id, gx_bucket_id, zip_processing_status,
                  original_file_path, original_file_name, file_size)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
            &[
                &job.id,
                &job.gx_bucket_id,
                &ZipStatus::QueuedForExtraction.as_str(),
                &job.file_location,
                &job.original_filename,
                &file_size,
            ],
        )
        .await
        .context("inserting zip master")?;
    Ok(row.get(0))
}

pub async fn get_zip_master(client: &impl GenericClient, id: i64) -> Result<Option<ZipMaster>> {
    let row = client
        .query_opt("SELECT * FROM zip_masters WHERE id = $1", &[&id])
        .await
        .context("loading zip master")?;
    Ok(row.as_ref().map(ZipMaster::from_row))
}

/// QUEUED_FOR_EXTRACTION -> EXTRACTING; false means another worker owns it
/// (or it was terminated) and the message should be acknowledged as a no-op.
pub async fn lock_zip_master(client: &impl GenericClient, id: i64) -> Result<bool> {
    transition_zip(client, id, ZipStatus::QueuedForExtraction, ZipStatus::Extracting, None).await
}

/// EXTRACTING -> QUEUED_FOR_EXTRACTION, releasing the lock before a transient
/// rethrow so redelivery can reacquire the row.
pub async fn unlock_zip_master(client: &impl GenericClient, id: i64) -> Result<bool> {
    transition_zip(client, id, ZipStatus::Extracting, ZipStatus::QueuedForExtraction, None).await
}

pub async fn transition_zip(
    client: &impl GenericClient,
    id: i64,
    from: ZipStatus,
    to: ZipStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let rows = client
        .execute(
            "UPDATE zip_masters
                SET zip_processing_status = $2,
                    error_message = COALESCE($3, error_message),
                    updated_at = now()
              WHERE id = $1 AND zip_processing_status = $4",
            &[&id, &to.as_str(), &error_message, &from.as_str()],
        )
        .await
        .context("transitioning zip master")?;
    Ok(rows == 1)
}

// ---------------------------------------------------------------------------
// file_masters

pub struct NewFileMaster<'a> {
    pub zip_master_id: Option<i64>,
    pub processing_job_id: i64,
    pub gx_bucket_id: Option<i64>,
    pub dedup_group: &'a str,
    pub file_location: &'a str,
    pub file_name: &'a str,
    pub file_size: i64,
    pub extension: &'a str,
    pub file_hash: &'a str,
    pub source_type: SourceType,
    pub extraction_depth: i32,
}

/// Result of an insert attempted under the dedup index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInsert {
    /// Fresh row; the file must be processed.
    Queued(i64),
    /// Content already held by another live row within the group; the new row
    /// was stored as DUPLICATE pointing at the holder.
    Duplicate { id: i64, duplicate_of: i64 },
}

/// Inserts a QUEUED row, falling back to a DUPLICATE row when the partial
/// unique index already holds this content for the group. The conflict probe
/// uses `ON CONFLICT ... DO NOTHING` so the surrounding transaction survives.
pub async fn insert_file_master(
    client: &impl GenericClient,
    new: &NewFileMaster<'_>,
) -> Result<FileInsert> {
    let inserted = client
        .query_opt(
            "INSERT INTO file_masters
                 (zip_master_id, processing_job_id, gx_bucket_id, dedup_group,
                  file_location, file_name, file_size, extension, file_hash,
                  file_processing_status, source_type, extraction_depth)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (dedup_group, file_hash)
                 WHERE file_processing_status NOT IN ('DUPLICATE','IGNORED','TERMINATED')
                 DO NOTHING
             RETURNING id",
            &[
                &new.zip_master_id,
                &new.processing_job_id,
                &new.gx_bucket_id,
                &new.dedup_group,
                &new.file_location,
                &new.file_name,
                &new.file_size,
                &new.extension,
                &new.file_hash,
                &FileStatus::Queued.as_str(),
                &new.source_type.as_str(),
                &new.extraction_depth,
            ],
        )
        .await
        .context("inserting file master")?;

    if let Some(row) = inserted {
        return Ok(FileInsert::Queued(row.get(0)));
    }

    let holder: i64 = client
        .query_one(
            "SELECT id FROM file_masters
              WHERE dedup_group = $1 AND file_hash = $2
                AND file_processing_status NOT IN ('DUPLICATE','IGNORED','TERMINATED')
              ORDER BY id ASC
              LIMIT 1",
            &[&new.dedup_group, &new.file_hash],
        )
        .await
        .context("resolving dedup holder")?
        .get(0);

    let row = client
        .query_one(
            "INSERT INTO file_masters
                 (zip_master_id, processing_job_id, gx_bucket_id, dedup_group,
                  file_location, file_name, file_size, extension, file_hash,
                  file_processing_status, duplicate_of_file_id, source_type,
                  extraction_depth)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING id",
            &[
                &new.zip_master_id,
                &new.processing_job_id,
                &new.gx_bucket_id,
                &new.dedup_group,
                &new.file_location,
                &new.file_name,
                &new.file_size,
                &new.extension,
                &new.file_hash,
                &FileStatus::Duplicate.as_str(),
                &holder,
                &new.source_type.as_str(),
                &new.extraction_depth,
            ],
        )
        .await
        .context("inserting duplicate file master")?;
    Ok(FileInsert::Duplicate {
        id: row.get(0),
        duplicate_of: holder,
    })
}

/// Records a rejected archive entry (dot-file, traversal, unsupported
/// extension) without scheduling any work for it.
pub async fn insert_ignored_file_master(
    client: &impl GenericClient,
    new: &NewFileMaster<'_>,
    reason: &str,
) -> Result<i64> {
    let row = client
        .query_one(
            "INSERT INTO file_masters
                 (zip_master_id, processing_job_id, gx_bucket_id, dedup_group,
                  file_location, file_name, file_size, extension, file_hash,
                  file_processing_status, error_message, source_type,
                  extraction_depth)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING id",
            &[
                &new.zip_master_id,
                &new.processing_job_id,
                &new.gx_bucket_id,
                &new.dedup_group,
                &new.file_location,
                &new.file_name,
                &new.file_size,
                &new.extension,
                &new.file_hash,
                &FileStatus::Ignored.as_str(),
                &reason,
                &new.source_type.as_str(),
                &new.extraction_depth,
            ],
        )
        .await
        .context("inserting ignored file master")?;
    Ok(row.get(0))
}

pub async fn get_file_master(client: &impl GenericClient, id: i64) -> Result<Option<FileMaster>> {
    let row = client
        .query_opt("SELECT * FROM file_masters WHERE id = $1", &[&id])
        .await
        .context("loading file master")?;
    Ok(row.as_ref().map(FileMaster::from_row))
}

/// QUEUED -> IN_PROGRESS; the at-most-once gate across redeliveries.
pub async fn lock_file_master(client: &impl GenericClient, id: i64) -> Result<bool> {
    transition_file(client, id, FileStatus::Queued, FileStatus::InProgress, None).await
}

/// IN_PROGRESS -> QUEUED before a transient rethrow.
pub async fn unlock_file_master(client: &impl GenericClient, id: i64) -> Result<bool> {
    transition_file(client, id, FileStatus::InProgress, FileStatus::Queued, None).await
}

pub async fn transition_file(
    client: &impl GenericClient,
    id: i64,
    from: FileStatus,
    to: FileStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let rows = client
        .execute(
            "UPDATE file_masters
                SET file_processing_status = $2,
                    error_message = COALESCE($3, error_message),
                    updated_at = now()
              WHERE id = $1 AND file_processing_status = $4",
            &[&id, &to.as_str(), &error_message, &from.as_str()],
        )
        .await
        .context("transitioning file master")?;
    Ok(rows == 1)
}

pub async fn complete_file_master(
    client: &impl GenericClient,
    id: i64,
    remark: Option<&str>,
) -> Result<bool> {
    let rows = client
        .execute(
            "UPDATE file_masters
                SET file_processing_status = 'COMPLETED',
                    error_message = $2,
                    updated_at = now()
              WHERE id = $1 AND file_processing_status = 'IN_PROGRESS'",
            &[&id, &remark],
        )
        .await
        .context("completing file master")?;
    Ok(rows == 1)
}

/// Idempotent failure from any non-terminal status; first reason wins.
pub async fn fail_file_master(client: &impl GenericClient, id: i64, reason: &str) -> Result<bool> {
    let rows = client
        .execute(
            "UPDATE file_masters
                SET file_processing_status = 'FAILED',
                    error_message = COALESCE(error_message, $2),
                    updated_at = now()
              WHERE id = $1
                AND file_processing_status IN ('QUEUED','IN_PROGRESS')",
            &[&id, &reason],
        )
        .await
        .context("failing file master")?;
    Ok(rows == 1)
}

pub async fn file_statuses_for_job(
    client: &impl GenericClient,
    job_id: i64,
) -> Result<Vec<FileStatus>> {
    let rows = client
        .query(
            "SELECT file_processing_status FROM file_masters WHERE processing_job_id = $1",
            &[&job_id],
        )
        .await
        .context("listing file statuses")?;
    Ok(rows
        .iter()
        .map(|r| {
            let raw: String = r.get(0);
            parse_status(&raw, FileStatus::Failed, "file_masters")
        })
        .collect())
}

// ---------------------------------------------------------------------------
// gx_masters

pub async fn insert_gx_master(
    client: &impl GenericClient,
    file: &FileMaster,
    artifact_key: &str,
    processed_file_name: &str,
    file_size: i64,
    status: GxStatus,
) -> Result<i64> {
    let row = client
        .query_one(
            "INSERT INTO gx_masters
                 (source_file_id, gx_bucket_id, file_location,
                  processed_file_name, file_size, extension, gx_status)
             VALUES ($1, $2, $3, $4, $5, 'pdf', $6)
             RETURNING id",
            &[
                &file.id,
                &file.gx_bucket_id,
                &artifact_key,
                &processed_file_name,
                &file_size,
                &status.as_str(),
            ],
        )
        .await
        .context("inserting gx master")?;
    Ok(row.get(0))
}

pub async fn count_gx_in_flight(client: &impl GenericClient) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT COUNT(*) FROM gx_masters WHERE gx_status IN ('QUEUED','PROCESSING')",
            &[],
        )
        .await
        .context("counting in-flight gx masters")?;
    Ok(row.get(0))
}

pub async fn take_gx_queued_for_upload(
    client: &impl GenericClient,
    limit: i64,
) -> Result<Vec<GxMaster>> {
    let rows = client
        .query(
            "SELECT * FROM gx_masters
              WHERE gx_status = 'QUEUED_FOR_UPLOAD'
              ORDER BY created_at ASC
              LIMIT $1",
            &[&limit],
        )
        .await
        .context("selecting gx masters for upload")?;
    Ok(rows.iter().map(GxMaster::from_row).collect())
}

pub async fn list_gx_to_poll(client: &impl GenericClient) -> Result<Vec<GxMaster>> {
    let rows = client
        .query(
            "SELECT * FROM gx_masters
              WHERE gx_status IN ('QUEUED','PROCESSING','ACTIVE')
                AND gx_process_id IS NOT NULL
              ORDER BY created_at ASC",
            &[],
        )
        .await
        .context("selecting gx masters to poll")?;
    Ok(rows.iter().map(GxMaster::from_row).collect())
}

pub async fn record_gx_submission(
    client: &impl GenericClient,
    id: i64,
    process_id: Option<Uuid>,
    status: GxStatus,
    error_message: Option<&str>,
) -> Result<()> {
    client
        .execute(
            "UPDATE gx_masters
                SET gx_process_id = COALESCE($2, gx_process_id),
                    gx_status = $3,
                    error_message = $4
              WHERE id = $1",
            &[&id, &process_id, &status.as_str(), &error_message],
        )
        .await
        .context("recording gx submission")?;
    Ok(())
}

pub async fn update_gx_status(
    client: &impl GenericClient,
    id: i64,
    status: GxStatus,
    message: Option<&str>,
) -> Result<()> {
    client
        .execute(
            "UPDATE gx_masters SET gx_status = $2, error_message = $3 WHERE id = $1",
            &[&id, &status.as_str(), &message],
        )
        .await
        .context("updating gx status")?;
    Ok(())
}

pub async fn gx_statuses_for_job(
    client: &impl GenericClient,
    job_id: i64,
) -> Result<Vec<GxStatus>> {
    let rows = client
        .query(
            "SELECT g.gx_status
               FROM gx_masters g
               JOIN file_masters fm ON fm.id = g.source_file_id
              WHERE fm.processing_job_id = $1",
            &[&job_id],
        )
        .await
        .context("listing gx statuses")?;
    Ok(rows
        .iter()
        .map(|r| {
            let raw: String = r.get(0);
            parse_status(&raw, GxStatus::Error, "gx_masters")
        })
        .collect())
}

// ---------------------------------------------------------------------------
// administration and the read model

/// Flips every non-terminal row of all four tables to TERMINATED.
pub async fn terminate_all(client: &impl GenericClient) -> Result<(u64, u64, u64, u64)> {
    let jobs = client
        .execute(
            "UPDATE processing_jobs SET status = 'TERMINATED', updated_at = now()
              WHERE status NOT IN ('COMPLETED','FAILED','TERMINATED')",
            &[],
        )
        .await
        .context("terminating jobs")?;
    let zips = client
        .execute(
            "UPDATE zip_masters SET zip_processing_status = 'TERMINATED', updated_at = now()
              WHERE zip_processing_status NOT IN ('EXTRACTED','EXTRACTION_FAILED','TERMINATED')",
            &[],
        )
        .await
        .context("terminating zip masters")?;
    let files = client
        .execute(
            "UPDATE file_masters SET file_processing_status = 'TERMINATED', updated_at = now()
              WHERE file_processing_status IN ('QUEUED','IN_PROGRESS')",
            &[],
        )
        .await
        .context("terminating file masters")?;
    let gx = client
        .execute(
            "UPDATE gx_masters SET gx_status = 'TERMINATED'
              WHERE gx_status IN ('QUEUED_FOR_UPLOAD','QUEUED','PROCESSING','ACTIVE')",
            &[],
        )
        .await
        .context("terminating gx masters")?;
    Ok((jobs, zips, files, gx))
}

pub async fn list_documents(
    client: &impl GenericClient,
    limit: i64,
    offset: i64,
) -> Result<Vec<DocumentEntry>> {
    let rows = client
        .query(
            "SELECT processing_job_id, file_name, phase, display_status, error_message
               FROM document_processing_view
              ORDER BY created_at DESC
              LIMIT $1 OFFSET $2",
            &[&limit, &offset],
        )
        .await
        .context("querying document view")?;
    Ok(rows
        .iter()
        .map(|r| DocumentEntry {
            processing_job_id: r.get(0),
            file_name: r.get(1),
            phase: r.get(2),
            display_status: r.get(3),
            error_message: r.get(4),
        })
        .collect())
}
