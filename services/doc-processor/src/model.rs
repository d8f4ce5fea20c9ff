//! Persistent entities and their status machines.

use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Row;
use tracing::warn;
use uuid::Uuid;

/// Lifecycle of the client-visible job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    PendingUpload,
    UploadComplete,
    Queued,
    InProgress,
    Completed,
    Failed,
    Terminated,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::PendingUpload => "PENDING_UPLOAD",
            JobStatus::UploadComplete => "UPLOAD_COMPLETE",
            JobStatus::Queued => "QUEUED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Terminated
        )
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING_UPLOAD" => Ok(JobStatus::PendingUpload),
            "UPLOAD_COMPLETE" => Ok(JobStatus::UploadComplete),
            "QUEUED" => Ok(JobStatus::Queued),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "TERMINATED" => Ok(JobStatus::Terminated),
            other => Err(anyhow!("unknown job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZipStatus {
    QueuedForExtraction,
    Extracting,
    Extracted,
    ExtractionFailed,
    Terminated,
}

impl ZipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZipStatus::QueuedForExtraction => "QUEUED_FOR_EXTRACTION",
            ZipStatus::Extracting => "EXTRACTING",
            ZipStatus::Extracted => "EXTRACTED",
            ZipStatus::ExtractionFailed => "EXTRACTION_FAILED",
            ZipStatus::Terminated => "TERMINATED",
        }
    }
}

impl FromStr for ZipStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED_FOR_EXTRACTION" => Ok(ZipStatus::QueuedForExtraction),
            "EXTRACTING" => Ok(ZipStatus::Extracting),
            "EXTRACTED" => Ok(ZipStatus::Extracted),
            "EXTRACTION_FAILED" => Ok(ZipStatus::ExtractionFailed),
            "TERMINATED" => Ok(ZipStatus::Terminated),
            other => Err(anyhow!("unknown zip status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Duplicate,
    Ignored,
    Terminated,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Queued => "QUEUED",
            FileStatus::InProgress => "IN_PROGRESS",
            FileStatus::Completed => "COMPLETED",
            FileStatus::Failed => "FAILED",
            FileStatus::Duplicate => "DUPLICATE",
            FileStatus::Ignored => "IGNORED",
            FileStatus::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FileStatus::Queued | FileStatus::InProgress)
    }

    /// Terminal statuses that still count as success for the parent job.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Duplicate | FileStatus::Ignored
        )
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(FileStatus::Queued),
            "IN_PROGRESS" => Ok(FileStatus::InProgress),
            "COMPLETED" => Ok(FileStatus::Completed),
            "FAILED" => Ok(FileStatus::Failed),
            "DUPLICATE" => Ok(FileStatus::Duplicate),
            "IGNORED" => Ok(FileStatus::Ignored),
            "TERMINATED" => Ok(FileStatus::Terminated),
            other => Err(anyhow!("unknown file status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GxStatus {
    QueuedForUpload,
    Queued,
    Processing,
    Active,
    Complete,
    Skipped,
    Error,
    Cancelled,
    Terminated,
}

impl GxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GxStatus::QueuedForUpload => "QUEUED_FOR_UPLOAD",
            GxStatus::Queued => "QUEUED",
            GxStatus::Processing => "PROCESSING",
            GxStatus::Active => "ACTIVE",
            GxStatus::Complete => "COMPLETE",
            GxStatus::Skipped => "SKIPPED",
            GxStatus::Error => "ERROR",
            GxStatus::Cancelled => "CANCELLED",
            GxStatus::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GxStatus::Complete
                | GxStatus::Skipped
                | GxStatus::Error
                | GxStatus::Cancelled
                | GxStatus::Terminated
        )
    }

    /// Terminal statuses that still count as success for the parent job.
    pub fn is_success(&self) -> bool {
        matches!(self, GxStatus::Complete | GxStatus::Skipped)
    }

    /// Total mapping from GX's wire statuses. Unknown values degrade to
    /// [`GxStatus::Error`]; callers record the raw value alongside.
    pub fn from_gx(raw: &str) -> GxStatus {
        match raw.to_ascii_lowercase().as_str() {
            "queued" => GxStatus::Queued,
            "processing" | "training" => GxStatus::Processing,
            "active" => GxStatus::Active,
            "complete" => GxStatus::Complete,
            "error" => GxStatus::Error,
            "cancelled" => GxStatus::Cancelled,
            _ => GxStatus::Error,
        }
    }
}

impl FromStr for GxStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED_FOR_UPLOAD" => Ok(GxStatus::QueuedForUpload),
            "QUEUED" => Ok(GxStatus::Queued),
            "PROCESSING" => Ok(GxStatus::Processing),
            "ACTIVE" => Ok(GxStatus::Active),
            "COMPLETE" => Ok(GxStatus::Complete),
            "SKIPPED" => Ok(GxStatus::Skipped),
            "ERROR" => Ok(GxStatus::Error),
            "CANCELLED" => Ok(GxStatus::Cancelled),
            "TERMINATED" => Ok(GxStatus::Terminated),
            other => Err(anyhow!("unknown gx status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Uploaded,
    Extracted,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Uploaded => "UPLOADED",
            SourceType::Extracted => "EXTRACTED",
        }
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADED" => Ok(SourceType::Uploaded),
            "EXTRACTED" => Ok(SourceType::Extracted),
            other => Err(anyhow!("unknown source type '{other}'")),
        }
    }
}

/// Parses a status column, degrading to the given fallback with a warning so
/// a bad row never takes the consumer down.
pub(crate) fn parse_status<T: FromStr<Err = anyhow::Error> + Copy>(
    raw: &str,
    fallback: T,
    table: &str,
) -> T {
    T::from_str(raw).unwrap_or_else(|err| {
        warn!(error = %err, table, "unknown status in database; using fallback");
        fallback
    })
}

#[derive(Debug, Clone)]
pub struct ProcessingJob {
    pub id: i64,
    pub original_filename: String,
    pub file_location: String,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub error_message: Option<String>,
    pub gx_bucket_id: Option<i64>,
    pub skip_gx_process: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingJob {
    pub fn from_row(row: &Row) -> Self {
        let status: String = row.get("status");
        Self {
            id: row.get("id"),
            original_filename: row.get("original_filename"),
            file_location: row.get("file_location"),
            status: parse_status(&status, JobStatus::Failed, "processing_jobs"),
            current_stage: row.get("current_stage"),
            error_message: row.get("error_message"),
            gx_bucket_id: row.get("gx_bucket_id"),
            skip_gx_process: row.get("skip_gx_process"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Lowercased extension of the originally uploaded file.
    pub fn extension(&self) -> String {
        extension_of(&self.original_filename)
    }
}

#[derive(Debug, Clone)]
pub struct ZipMaster {
    pub id: i64,
    pub processing_job_id: i64,
    pub gx_bucket_id: Option<i64>,
    pub zip_processing_status: ZipStatus,
    pub original_file_path: String,
    pub original_file_name: String,
    pub file_size: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ZipMaster {
    pub fn from_row(row: &Row) -> Self {
        let status: String = row.get("zip_processing_status");
        Self {
            id: row.get("id"),
            processing_job_id: row.get("processing_job_id"),
            gx_bucket_id: row.get("gx_bucket_id"),
            zip_processing_status: parse_status(&status, ZipStatus::ExtractionFailed, "zip_masters"),
            original_file_path: row.get("original_file_path"),
            original_file_name: row.get("original_file_name"),
            file_size: row.get("file_size"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileMaster {
    pub id: i64,
    pub zip_master_id: Option<i64>,
    pub processing_job_id: i64,
    pub gx_bucket_id: Option<i64>,
    pub dedup_group: String,
    pub duplicate_of_file_id: Option<i64>,
    pub file_location: String,
    pub file_name: String,
    pub file_size: i64,
    pub extension: String,
    pub file_hash: String,
    pub file_processing_status: FileStatus,
    pub error_message: Option<String>,
    pub source_type: SourceType,
    pub extraction_depth: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileMaster {
    pub fn from_row(row: &Row) -> Self {
        let status: String = row.get("file_processing_status");
        let source: String = row.get("source_type");
        Self {
            id: row.get("id"),
            zip_master_id: row.get("zip_master_id"),
            processing_job_id: row.get("processing_job_id"),
            gx_bucket_id: row.get("gx_bucket_id"),
            dedup_group: row.get("dedup_group"),
            duplicate_of_file_id: row.get("duplicate_of_file_id"),
            file_location: row.get("file_location"),
            file_name: row.get("file_name"),
            file_size: row.get("file_size"),
            extension: row.get("extension"),
            file_hash: row.get("file_hash"),
            file_processing_status: parse_status(&status, FileStatus::Failed, "file_masters"),
            error_message: row.get("error_message"),
            source_type: parse_status(&source, SourceType::Uploaded, "file_masters"),
            extraction_depth: row.get("extraction_depth"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }

    /// Filename with the extension replaced by `.pdf`; the expected name of a
    /// transformed artifact.
    pub fn pdf_name(&self) -> String {
        format!("{}.pdf", stem_of(&self.file_name))
    }
}

#[derive(Debug, Clone)]
pub struct GxMaster {
    pub id: i64,
    pub source_file_id: i64,
    pub gx_bucket_id: Option<i64>,
    pub file_location: String,
    pub processed_file_name: String,
    pub file_size: i64,
    pub extension: String,
    pub gx_status: GxStatus,
    pub gx_process_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GxMaster {
    pub fn from_row(row: &Row) -> Self {
        let status: String = row.get("gx_status");
        Self {
            id: row.get("id"),
            source_file_id: row.get("source_file_id"),
            gx_bucket_id: row.get("gx_bucket_id"),
            file_location: row.get("file_location"),
            processed_file_name: row.get("processed_file_name"),
            file_size: row.get("file_size"),
            extension: row.get("extension"),
            gx_status: parse_status(&status, GxStatus::Error, "gx_masters"),
            gx_process_id: row.get("gx_process_id"),
            error_message: row.get("error_message"),
            created_at: row.get("created_at"),
        }
    }
}

/// Lowercased extension without the dot; empty when there is none.
pub fn extension_of(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Filename without its final extension.
pub fn stem_of(file_name: &str) -> String {
    std::path::Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips() {
        for status in [
            JobStatus::PendingUpload,
            JobStatus::UploadComplete,
            JobStatus::Queued,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Terminated,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("NOPE").is_err());
    }

    #[test]
    fn file_status_terminality() {
        assert!(!FileStatus::Queued.is_terminal());
        assert!(!FileStatus::InProgress.is_terminal());
        for status in [
            FileStatus::Completed,
            FileStatus::Failed,
            FileStatus::Duplicate,
            FileStatus::Ignored,
            FileStatus::Terminated,
        ] {
            assert!(status.is_terminal());
        }
        assert!(FileStatus::Duplicate.is_success());
        assert!(!FileStatus::Failed.is_success());
    }

    #[test]
    fn gx_wire_mapping_is_total() {
        assert_eq!(GxStatus::from_gx("queued"), GxStatus::Queued);
        assert_eq!(GxStatus::from_gx("Processing"), GxStatus::Processing);
        assert_eq!(GxStatus::from_gx("complete"), GxStatus::Complete);
        assert_eq!(GxStatus::from_gx("cancelled"), GxStatus::Cancelled);
        assert_eq!(GxStatus::from_gx("definitely-new"), GxStatus::Error);
    }

    #[test]
    fn skipped_counts_as_success() {
        assert!(GxStatus::Skipped.is_terminal());
        assert!(GxStatus::Skipped.is_success());
        assert!(!GxStatus::Error.is_success());
    }

    #[test]
    fn extension_and_stem_helpers() {
        assert_eq!(extension_of("Report.DOCX"), "docx");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(stem_of("report.docx"), "report");
        assert_eq!(stem_of("archive.tar.gz"), "archive.tar");
    }
}
