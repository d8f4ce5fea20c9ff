//! Thin wrapper over the object store: presigned URLs, multipart uploads,
//! streamed transfers, server-side copies, and deterministic key layout.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::debug;

use crate::config::{Settings, StorageSettings};

/// Namespace segment of an object key, one per artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Uploaded archive awaiting extraction.
    Zip,
    /// Uploaded single file as received.
    Source,
    /// Intermediate files produced by extraction or conversion.
    Files,
    /// Normalised artifacts ready for GX ingestion.
    GxFiles,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Zip => "zip",
            KeyKind::Source => "source",
            KeyKind::Files => "files",
            KeyKind::GxFiles => "gxFiles",
        }
    }
}

/// Replaces every character outside `[A-Za-z0-9._-]` with an underscore.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Deterministic object key for a job-owned artifact:
/// `{bucket|bulk}/{kind}/{jobId}/{safeName}`.
pub fn construct_key(
    file_name: &str,
    gx_bucket_id: Option<i64>,
    job_id: i64,
    kind: KeyKind,
) -> String {
    let safe = sanitize_file_name(file_name);
    match gx_bucket_id {
        Some(bucket) => format!("{bucket}/{}/{job_id}/{safe}", kind.as_str()),
        None => format!("bulk/{}/{job_id}/{safe}", kind.as_str()),
    }
}

#[derive(Clone)]
pub struct StorageService {
    client: Client,
    bucket: String,
    presign_ttl: Duration,
}

impl StorageService {
    /// Builds the S3 client from ambient AWS configuration plus the optional
    /// endpoint override used against minio-style stores.
    pub async fn from_settings(settings: &Settings) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let client = Self::client_from(&base, &settings.storage);
        Self {
            client,
            bucket: settings.storage.bucket.clone(),
            presign_ttl: settings.presign_ttl(),
        }
    }

    fn client_from(base: &aws_config::SdkConfig, storage: &StorageSettings) -> Client {
        let mut builder = aws_sdk_s3::config::Builder::from(base);
        if !storage.endpoint.is_empty() {
            builder = builder.endpoint_url(storage.endpoint.clone());
        }
        if storage.force_path_style {
            builder = builder.force_path_style(true);
        }
        Client::from_conf(builder.build())
    }

    pub fn new(client: Client, bucket: String, presign_ttl: Duration) -> Self {
        Self {
            client,
            bucket,
            presign_ttl,
        }
    }

    fn presign_cfg(&self) -> Result<PresigningConfig> {
        PresigningConfig::expires_in(self.presign_ttl).context("building presign config")
    }

    /// Presigned PUT for direct client uploads.
    pub async fn presign_put(&self, key: &str) -> Result<String> {
        let req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presign_cfg()?)
            .await
            .with_context(|| format!("presigning put for {key}"))?;
        Ok(req.uri().to_string())
    }

    /// Presigned GET handed to GX as the ingest source URL.
    pub async fn presign_get(&self, key: &str) -> Result<String> {
        let req = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(self.presign_cfg()?)
            .await
            .with_context(|| format!("presigning get for {key}"))?;
        Ok(req.uri().to_string())
    }

    pub async fn initiate_multipart(&self, key: &str) -> Result<String> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("initiating multipart upload for {key}"))?;
        out.upload_id()
            .map(|id| id.to_string())
            .context("multipart initiate returned no upload id")
    }

    pub async fn presign_part(&self, key: &str, upload_id: &str, part_number: i32) -> Result<String> {
        let req = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .presigned(self.presign_cfg()?)
            .await
            .with_context(|| format!("presigning part {part_number} for {key}"))?;
        Ok(req.uri().to_string())
    }

    pub async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<()> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("completing multipart upload for {key}"))?;
        Ok(())
    }

    /// Streams an object into a local file without buffering it in memory.
    pub async fn download_to_file(&self, key: &str, dest: &Path) -> Result<u64> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("fetching {key}"))?;
        let mut reader = out.body.into_async_read();
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("streaming {key} to disk"))?;
        debug!(key, bytes = written, "downloaded object");
        Ok(written)
    }

    pub async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("uploading {len} bytes to {key}"))?;
        Ok(())
    }

    /// Streamed upload of a spooled file.
    pub async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("opening {} for upload", path.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading {} to {key}", path.display()))?;
        Ok(())
    }

    /// Server-side copy within the bucket; no bytes travel through the service.
    pub async fn copy(&self, src_key: &str, dst_key: &str) -> Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src_key))
            .key(dst_key)
            .send()
            .await
            .with_context(|| format!("copying {src_key} to {dst_key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_everything_unsafe() {
        assert_eq!(sanitize_file_name("report (final).pdf"), "report__final_.pdf");
        assert_eq!(sanitize_file_name("ä b/c.pdf"), "__b_c.pdf");
        assert_eq!(sanitize_file_name("ok-name_1.PDF"), "ok-name_1.PDF");
    }

    #[test]
    fn key_layout_with_bucket() {
        assert_eq!(
            construct_key("doc.pdf", Some(7), 42, KeyKind::GxFiles),
            "7/gxFiles/42/doc.pdf"
        );
        assert_eq!(
            construct_key("doc.pdf", Some(7), 42, KeyKind::Source),
            "7/source/42/doc.pdf"
        );
    }

    #[test]
    fn key_layout_without_bucket_is_bulk() {
        assert_eq!(
            construct_key("b.zip", None, 9, KeyKind::Zip),
            "bulk/zip/9/b.zip"
        );
        assert_eq!(
            construct_key("a.pdf", None, 9, KeyKind::Files),
            "bulk/files/9/a.pdf"
        );
    }

    #[test]
    fn keys_only_contain_safe_characters() {
        let key = construct_key("we?ird na#me.pdf", Some(3), 1, KeyKind::Files);
        assert!(key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')));
    }

    #[test]
    fn keys_are_distinct_per_kind_and_job() {
        let a = construct_key("x.pdf", Some(1), 1, KeyKind::Files);
        let b = construct_key("x.pdf", Some(1), 1, KeyKind::GxFiles);
        let c = construct_key("x.pdf", Some(1), 2, KeyKind::Files);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
