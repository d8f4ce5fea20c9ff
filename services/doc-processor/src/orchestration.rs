//! API-facing job orchestration: creates jobs, hands out presigned upload
//! URLs, and on client confirmation routes the job onto the right queue. The
//! HTTP layer here stays thin; everything stateful lives in the repository
//! and the queue/storage adapters.

use std::io::Read;

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use shared::dto::{
    CompleteMultipartRequest, CreateBucketRequest, CreateJobRequest, CreateJobResponse,
    InitiateMultipartResponse, PresignPartResponse, TriggerResponse, ZipJobMessage,
};
use shared::error::ProcessingError;
use shared::queue::{content_dedup_id, message_group_id};
use shared::storage::{construct_key, KeyKind};

use crate::model::{extension_of, JobStatus, ProcessingJob, SourceType};
use crate::repo::{self, FileInsert, NewFileMaster};
use crate::AppState;

/// Archives land under the `zip` namespace, everything else under `source`.
fn upload_key_kind(file_name: &str) -> KeyKind {
    if extension_of(file_name) == "zip" {
        KeyKind::Zip
    } else {
        KeyKind::Source
    }
}

fn validate_file_name(file_name: &str) -> Result<(), ProcessingError> {
    if file_name.trim().is_empty() {
        return Err(ProcessingError::Validation("file name must not be empty".into()));
    }
    Ok(())
}

/// Creates a PENDING_UPLOAD job with a deterministic source key and returns a
/// presigned PUT for the client upload.
pub async fn create_job_direct(
    state: &AppState,
    request: &CreateJobRequest,
) -> anyhow::Result<CreateJobResponse> {
    validate_file_name(&request.file_name)?;

    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;
    let job_id = repo::insert_processing_job(
        &tx,
        &request.file_name,
        request.gx_bucket_id,
        request.skip_gx_process,
    )
    .await?;
    let key = construct_key(
        &request.file_name,
        request.gx_bucket_id,
        job_id,
        upload_key_kind(&request.file_name),
    );
    repo::set_job_location(&tx, job_id, &key).await?;
    tx.commit().await?;

    let upload_url = state.storage.presign_put(&key).await?;
    info!(job_id, key = %key, step = "job.created", "created direct-upload job");
    Ok(CreateJobResponse {
        job_id,
        file_location: key,
        upload_url,
    })
}

/// Creates a job and opens a multipart upload against its source key.
pub async fn initiate_multipart(
    state: &AppState,
    request: &CreateJobRequest,
) -> anyhow::Result<InitiateMultipartResponse> {
    validate_file_name(&request.file_name)?;

    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;
    let job_id = repo::insert_processing_job(
        &tx,
        &request.file_name,
        request.gx_bucket_id,
        request.skip_gx_process,
    )
    .await?;
    let key = construct_key(
        &request.file_name,
        request.gx_bucket_id,
        job_id,
        upload_key_kind(&request.file_name),
    );
    repo::set_job_location(&tx, job_id, &key).await?;
    tx.commit().await?;

    let upload_id = state.storage.initiate_multipart(&key).await?;
    info!(job_id, key = %key, step = "job.multipart", "initiated multipart upload");
    Ok(InitiateMultipartResponse {
        job_id,
        file_location: key,
        upload_id,
    })
}

async fn load_job(state: &AppState, job_id: i64) -> anyhow::Result<Option<ProcessingJob>> {
    let client = state.pool.get().await?;
    repo::get_job(&client, job_id).await
}

pub async fn presign_part(
    state: &AppState,
    job: &ProcessingJob,
    upload_id: &str,
    part_number: i32,
) -> anyhow::Result<PresignPartResponse> {
    let upload_url = state
        .storage
        .presign_part(&job.file_location, upload_id, part_number)
        .await?;
    Ok(PresignPartResponse {
        part_number,
        upload_url,
    })
}

pub async fn complete_multipart(
    state: &AppState,
    job: &ProcessingJob,
    request: &CompleteMultipartRequest,
) -> anyhow::Result<()> {
    let parts: Vec<(i32, String)> = request
        .parts
        .iter()
        .map(|part| (part.part_number, part.etag.clone()))
        .collect();
    state
        .storage
        .complete_multipart(&job.file_location, &request.upload_id, &parts)
        .await
}

/// Validates the uploaded object and routes the job: ZIP jobs onto the zip
/// queue, single files onto the file queue. Queue sends happen only after
/// the owning transaction committed.
pub async fn trigger_processing(state: &AppState, job_id: i64) -> anyhow::Result<TriggerResponse> {
    let Some(job) = load_job(state, job_id).await? else {
        return Err(ProcessingError::Validation(format!("job {job_id} does not exist")).into());
    };
    if !matches!(
        job.status,
        JobStatus::PendingUpload | JobStatus::UploadComplete
    ) {
        return Err(ProcessingError::Validation(format!(
            "job {job_id} is {} and cannot be triggered",
            job.status.as_str()
        ))
        .into());
    }

    let extension = job.extension();
    {
        // No callback arrives from the blob store, so the confirmation call
        // itself records the upload-complete hop.
        let client = state.pool.get().await?;
        repo::transition_job(
            &client,
            job.id,
            &[JobStatus::PendingUpload],
            JobStatus::UploadComplete,
            Some("upload confirmed"),
        )
        .await?;
    }

    if extension == "zip" {
        return trigger_zip(state, &job).await;
    }

    if job.gx_bucket_id.is_none() {
        let reason = "bulk jobs must upload a zip archive";
        state.lifecycle.fail_job(job.id, reason).await?;
        return Err(ProcessingError::Validation(reason.into()).into());
    }
    if !state.registry.supports(&extension) {
        let reason = format!("unsupported file extension '{extension}'");
        state.lifecycle.fail_job(job.id, &reason).await?;
        return Err(ProcessingError::Validation(reason).into());
    }

    trigger_single_file(state, &job, &extension).await
}

async fn trigger_zip(state: &AppState, job: &ProcessingJob) -> anyhow::Result<TriggerResponse> {
    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;
    let zip_master_id = repo::insert_zip_master(&tx, job, 0).await?;
    repo::transition_job(
        &tx,
        job.id,
        &[JobStatus::UploadComplete, JobStatus::PendingUpload],
        JobStatus::Queued,
        Some("queued for extraction"),
    )
    .await?;
    tx.commit().await?;

    let group = format!("zip-job-{}", job.id);
    let dedup = format!("zip-master-{zip_master_id}");
    if let Err(err) = state
        .queue
        .send_zip_job(&ZipJobMessage { zip_master_id }, &group, &dedup)
        .await
    {
        error!(job_id = job.id, error = %err, "failed to enqueue zip job");
        state
            .lifecycle
            .fail_job(job.id, "failed to enqueue archive for extraction")
            .await?;
        return Err(err);
    }
    info!(job_id = job.id, zip_master_id, step = "job.queued", "zip job queued");
    Ok(TriggerResponse {
        job_id: job.id,
        status: JobStatus::Queued.as_str().to_string(),
    })
}

async fn trigger_single_file(
    state: &AppState,
    job: &ProcessingJob,
    extension: &str,
) -> anyhow::Result<TriggerResponse> {
    let (file_hash, file_size) = hash_object(state, &job.file_location).await?;
    let group = message_group_id(job.gx_bucket_id, job.id);

    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;
    let new = NewFileMaster {
        zip_master_id: None,
        processing_job_id: job.id,
        gx_bucket_id: job.gx_bucket_id,
        dedup_group: &group,
        file_location: &job.file_location,
        file_name: &job.original_filename,
        file_size,
        extension,
        file_hash: &file_hash,
        source_type: SourceType::Uploaded,
        extraction_depth: 0,
    };
    let inserted = repo::insert_file_master(&tx, &new).await?;

    let (status, stage) = match inserted {
        FileInsert::Queued(_) => (JobStatus::Queued, "queued for processing"),
        // The content already lives in this group; every child is terminal,
        // so the job is done the moment it is recorded.
        FileInsert::Duplicate { .. } => (JobStatus::Completed, "duplicate content"),
    };
    repo::transition_job(
        &tx,
        job.id,
        &[JobStatus::UploadComplete, JobStatus::PendingUpload],
        status,
        Some(stage),
    )
    .await?;
    tx.commit().await?;

    if let FileInsert::Queued(file_master_id) = inserted {
        let dedup = content_dedup_id(&group, &file_hash);
        if let Err(err) = state
            .queue
            .send_file_job(
                &shared::dto::FileJobMessage { file_master_id },
                &group,
                &dedup,
            )
            .await
        {
            error!(job_id = job.id, error = %err, "failed to enqueue file job");
            state
                .lifecycle
                .fail_job(job.id, "failed to enqueue file for processing")
                .await?;
            return Err(err);
        }
    }
    info!(
        job_id = job.id,
        status = status.as_str(),
        step = "job.queued",
        "file job routed"
    );
    Ok(TriggerResponse {
        job_id: job.id,
        status: status.as_str().to_string(),
    })
}

/// Streams the uploaded object through SHA-256; the hash keys deduplication
/// and the broker-side message id.
async fn hash_object(state: &AppState, key: &str) -> anyhow::Result<(String, i64)> {
    let spool = tempfile::tempdir()?;
    let path = spool.path().join("source");
    let size = state.storage.download_to_file(key, &path).await?;

    let mut file = std::fs::File::open(&path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok((format!("{:x}", hasher.finalize()), size as i64))
}

/// Flips everything non-terminal to TERMINATED and purges both queues.
pub async fn terminate_all(state: &AppState) -> anyhow::Result<TerminateResponse> {
    let mut client = state.pool.get().await?;
    let tx = client.transaction().await?;
    let (jobs, zips, files, gx) = repo::terminate_all(&tx).await?;
    tx.commit().await?;
    state.queue.purge_all().await?;
    info!(jobs, zips, files, gx, "terminated all in-flight processing");
    Ok(TerminateResponse {
        jobs,
        zip_masters: zips,
        file_masters: files,
        gx_masters: gx,
    })
}

#[derive(Debug, Serialize)]
pub struct TerminateResponse {
    pub jobs: u64,
    pub zip_masters: u64,
    pub file_masters: u64,
    pub gx_masters: u64,
}

// ---------------------------------------------------------------------------
// HTTP surface

#[derive(Debug, Serialize)]
struct JobView {
    id: i64,
    original_filename: String,
    status: JobStatus,
    current_stage: Option<String>,
    error_message: Option<String>,
    gx_bucket_id: Option<i64>,
    skip_gx_process: bool,
}

impl From<&ProcessingJob> for JobView {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            id: job.id,
            original_filename: job.original_filename.clone(),
            status: job.status,
            current_stage: job.current_stage.clone(),
            error_message: job.error_message.clone(),
            gx_bucket_id: job.gx_bucket_id,
            skip_gx_process: job.skip_gx_process,
        }
    }
}

fn map_error(err: anyhow::Error) -> actix_web::Error {
    match err.downcast_ref::<ProcessingError>() {
        Some(inner) if inner.is_terminal() => {
            actix_web::error::ErrorBadRequest(inner.to_string())
        }
        _ => {
            error!(error = %err, "request failed");
            actix_web::error::ErrorInternalServerError("internal error")
        }
    }
}

async fn post_job(
    state: web::Data<AppState>,
    request: web::Json<CreateJobRequest>,
) -> actix_web::Result<HttpResponse> {
    let response = create_job_direct(&state, &request).await.map_err(map_error)?;
    Ok(HttpResponse::Ok().json(response))
}

async fn post_multipart(
    state: web::Data<AppState>,
    request: web::Json<CreateJobRequest>,
) -> actix_web::Result<HttpResponse> {
    let response = initiate_multipart(&state, &request).await.map_err(map_error)?;
    Ok(HttpResponse::Ok().json(response))
}

#[derive(Debug, Deserialize)]
struct PresignPartBody {
    upload_id: String,
    part_number: i32,
}

async fn post_part(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<PresignPartBody>,
) -> actix_web::Result<HttpResponse> {
    let job_id = path.into_inner();
    let Some(job) = load_job(&state, job_id).await.map_err(map_error)? else {
        return Ok(HttpResponse::NotFound().finish());
    };
    let response = presign_part(&state, &job, &body.upload_id, body.part_number)
        .await
        .map_err(map_error)?;
    Ok(HttpResponse::Ok().json(response))
}

async fn post_complete(
    state: web::Data<AppState>,
    path: web::Path<i64>,
    body: web::Json<CompleteMultipartRequest>,
) -> actix_web::Result<HttpResponse> {
    let job_id = path.into_inner();
    let Some(job) = load_job(&state, job_id).await.map_err(map_error)? else {
        return Ok(HttpResponse::NotFound().finish());
    };
    complete_multipart(&state, &job, &body).await.map_err(map_error)?;
    Ok(HttpResponse::Ok().finish())
}

async fn post_trigger(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> actix_web::Result<HttpResponse> {
    let response = trigger_processing(&state, path.into_inner())
        .await
        .map_err(map_error)?;
    Ok(HttpResponse::Ok().json(response))
}

async fn get_job(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> actix_web::Result<HttpResponse> {
    match load_job(&state, path.into_inner()).await.map_err(map_error)? {
        Some(job) => Ok(HttpResponse::Ok().json(JobView::from(&job))),
        None => Ok(HttpResponse::NotFound().finish()),
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_documents(
    state: web::Data<AppState>,
    query: web::Query<PageQuery>,
) -> actix_web::Result<HttpResponse> {
    let client = state.pool.get().await.map_err(|err| map_error(err.into()))?;
    let entries = repo::list_documents(
        &client,
        query.limit.unwrap_or(100).clamp(1, 1000),
        query.offset.unwrap_or(0).max(0),
    )
    .await
    .map_err(map_error)?;
    Ok(HttpResponse::Ok().json(entries))
}

async fn post_bucket(
    state: web::Data<AppState>,
    request: web::Json<CreateBucketRequest>,
) -> actix_web::Result<HttpResponse> {
    let bucket = state
        .gx
        .create_bucket(&request.name)
        .await
        .map_err(|err| actix_web::error::ErrorBadGateway(err.to_string()))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "bucket_id": bucket.bucket_id,
        "name": bucket.name,
    })))
}

async fn post_terminate(state: web::Data<AppState>) -> actix_web::Result<HttpResponse> {
    let response = terminate_all(&state).await.map_err(map_error)?;
    Ok(HttpResponse::Ok().json(response))
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/jobs", web::post().to(post_job))
        .route("/jobs/multipart", web::post().to(post_multipart))
        .route("/jobs/{id}/parts", web::post().to(post_part))
        .route("/jobs/{id}/complete", web::post().to(post_complete))
        .route("/jobs/{id}/process", web::post().to(post_trigger))
        .route("/jobs/{id}", web::get().to(get_job))
        .route("/documents", web::get().to(get_documents))
        .route("/buckets", web::post().to(post_bucket))
        .route("/admin/terminate", web::post().to(post_terminate))
        .route("/health", web::get().to(health));
}
