//! HTTP client for the GX semantic-indexing service.
//!
//! Three operations: bucket creation, ingest-by-source-URL, and process
//! status lookup. Authentication is a static header from configuration.
//! Responses with 4xx statuses are permanent rejections; 5xx and transport
//! failures are transient and leave the caller's state untouched so the next
//! scheduler cycle retries.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::GxSettings;

#[derive(Error, Debug)]
pub enum GxError {
    /// 4xx response; the request will never succeed as-is.
    #[error("gx rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// 5xx, timeout, or transport failure; retry on a later cycle.
    #[error("gx unavailable: {0}")]
    Transient(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestDocument<'a> {
    bucket_id: i64,
    file_name: &'a str,
    file_type: &'a str,
    source_url: &'a str,
}

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    documents: Vec<IngestDocument<'a>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReceipt {
    pub process_id: Option<Uuid>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IngestResponse {
    pub ingest: Option<IngestReceipt>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStatus {
    pub process_id: Option<Uuid>,
    pub status: Option<String>,
    pub status_message: Option<String>,
    pub progress: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub ingest: Option<IngestStatus>,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GxBucket {
    pub bucket_id: i64,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BucketResponse {
    bucket: GxBucket,
}

#[derive(Debug, Serialize)]
struct BucketRequest<'a> {
    name: &'a str,
}

#[derive(Clone)]
pub struct GxClient {
    http: reqwest::Client,
    base_url: String,
    auth_header: String,
    auth_value: String,
}

impl GxClient {
    pub fn from_settings(settings: &GxSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("building gx client")?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            auth_header: settings.api_key_header.clone(),
            auth_value: settings.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn execute<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GxError> {
        let response = request
            .header(&self.auth_header, &self.auth_value)
            .send()
            .await
            .map_err(|err| GxError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(GxError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }
        if !status.is_success() {
            return Err(GxError::Transient(format!("status {status}")));
        }
        response
            .json::<T>()
            .await
            .map_err(|err| GxError::Transient(format!("decoding response: {err}")))
    }

    pub async fn create_bucket(&self, name: &str) -> Result<GxBucket, GxError> {
        let response: BucketResponse = self
            .execute(
                self.http
                    .post(self.url("/bucket"))
                    .json(&BucketRequest { name }),
            )
            .await?;
        Ok(response.bucket)
    }

    /// Asks GX to fetch and index one document from a presigned source URL.
    pub async fn ingest_remote(
        &self,
        bucket_id: i64,
        file_name: &str,
        file_type: &str,
        source_url: &str,
    ) -> Result<IngestResponse, GxError> {
        let request = IngestRequest {
            documents: vec![IngestDocument {
                bucket_id,
                file_name,
                file_type,
                source_url,
            }],
        };
        self.execute(self.http.post(self.url("/ingest/upload")).json(&request))
            .await
    }

    pub async fn get_status(&self, process_id: Uuid) -> Result<StatusResponse, GxError> {
        self.execute(
            self.http
                .get(self.url(&format!("/ingest/status/{process_id}"))),
        )
        .await
    }
}
