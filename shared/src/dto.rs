//! Payload types exchanged over the work queues and the HTTP surface.

use serde::{Deserialize, Serialize};

/// Message on the ZIP queue; one per archive awaiting extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipJobMessage {
    pub zip_master_id: i64,
}

/// Message on the file queue; one per file awaiting normalisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileJobMessage {
    pub file_master_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub file_name: String,
    /// Absent for bulk jobs, which must upload a ZIP.
    pub gx_bucket_id: Option<i64>,
    #[serde(default)]
    pub skip_gx_process: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: i64,
    pub file_location: String,
    pub upload_url: String,
}

#[derive(Debug, Serialize)]
pub struct InitiateMultipartResponse {
    pub job_id: i64,
    pub file_location: String,
    pub upload_id: String,
}

#[derive(Debug, Serialize)]
pub struct PresignPartResponse {
    pub part_number: i32,
    pub upload_url: String,
}

#[derive(Debug, Deserialize)]
pub struct CompletedPartDto {
    pub part_number: i32,
    pub etag: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteMultipartRequest {
    pub upload_id: String,
    pub parts: Vec<CompletedPartDto>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub job_id: i64,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBucketRequest {
    pub name: String,
}

/// One row of the read-model view: a user-visible artifact in either the
/// ingestion phase or the GX phase.
#[derive(Debug, Serialize)]
pub struct DocumentEntry {
    pub processing_job_id: i64,
    pub file_name: String,
    pub phase: String,
    pub display_status: String,
    pub error_message: Option<String>,
}
