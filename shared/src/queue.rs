//! FIFO work-queue adapter.
//!
//! Two queues drive the pipeline: one for archives awaiting extraction and one
//! for individual files. Messages carry a group id (per bucket, or per job for
//! bulk uploads) so the broker serialises work within a group, and a
//! deduplication id so replays of the same content are dropped broker-side.
//! Acknowledgement is delete-on-success; a handler error leaves the message
//! in flight until the visibility timeout triggers redelivery.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use aws_sdk_sqs::Client;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::QueueSettings;
use crate::dto::{FileJobMessage, ZipJobMessage};

#[derive(Clone)]
pub struct QueueClient {
    client: Client,
    zip_queue_url: String,
    file_queue_url: String,
}

impl QueueClient {
    pub async fn from_settings(settings: &QueueSettings) -> Self {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self {
            client: Client::new(&base),
            zip_queue_url: settings.zip_queue_url.clone(),
            file_queue_url: settings.file_queue_url.clone(),
        }
    }

    pub fn new(client: Client, zip_queue_url: String, file_queue_url: String) -> Self {
        Self {
            client,
            zip_queue_url,
            file_queue_url,
        }
    }

    pub fn zip_queue_url(&self) -> &str {
        &self.zip_queue_url
    }

    pub fn file_queue_url(&self) -> &str {
        &self.file_queue_url
    }

    pub async fn send_zip_job(
        &self,
        message: &ZipJobMessage,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<()> {
        self.send(&self.zip_queue_url, message, group_id, dedup_id)
            .await
    }

    pub async fn send_file_job(
        &self,
        message: &FileJobMessage,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<()> {
        self.send(&self.file_queue_url, message, group_id, dedup_id)
            .await
    }

    async fn send<T: Serialize>(
        &self,
        queue_url: &str,
        message: &T,
        group_id: &str,
        dedup_id: &str,
    ) -> Result<()> {
        let body = serde_json::to_string(message).context("serialising queue message")?;
        self.client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .message_group_id(group_id)
            .message_deduplication_id(dedup_id)
            .send()
            .await
            .with_context(|| format!("sending message to {queue_url}"))?;
        Ok(())
    }

    /// Drops every queued message; used by the administrative terminate path.
    pub async fn purge_all(&self) -> Result<()> {
        for url in [&self.zip_queue_url, &self.file_queue_url] {
            self.client
                .purge_queue()
                .queue_url(url)
                .send()
                .await
                .with_context(|| format!("purging {url}"))?;
        }
        Ok(())
    }
}

/// Long-polling consumer loop. Each received message is handled on its own
/// task, bounded by `max_concurrent_messages`; the message is deleted only
/// when the handler returns `Ok`, so failures surface as broker redelivery.
pub async fn run_consumer<F, Fut>(
    client: QueueClient,
    queue_url: String,
    settings: QueueSettings,
    name: &'static str,
    handler: F,
) where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_messages));
    info!(
        consumer = name,
        queue = %queue_url,
        max_concurrent = settings.max_concurrent_messages,
        "starting queue consumer"
    );

    loop {
        let received = client
            .client
            .receive_message()
            .queue_url(&queue_url)
            .max_number_of_messages(settings.max_messages_per_poll.clamp(1, 10))
            .wait_time_seconds(settings.poll_timeout_secs.clamp(0, 20))
            .send()
            .await;

        let output = match received {
            Ok(output) => output,
            Err(err) => {
                warn!(consumer = name, error = %err, "receive failed; backing off");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        };

        for message in output.messages.unwrap_or_default() {
            let Some(body) = message.body else { continue };
            let Some(receipt) = message.receipt_handle else {
                continue;
            };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let handler = handler.clone();
            let sqs = client.client.clone();
            let queue_url = queue_url.clone();
            tokio::spawn(async move {
                let result = handler(body).await;
                match result {
                    Ok(()) => {
                        if let Err(err) = sqs
                            .delete_message()
                            .queue_url(&queue_url)
                            .receipt_handle(&receipt)
                            .send()
                            .await
                        {
                            warn!(consumer = name, error = %err, "failed to acknowledge message");
                        }
                    }
                    Err(err) => {
                        // Not acknowledged; the broker redelivers after the
                        // visibility timeout, up to the queue's receive cap.
                        error!(consumer = name, error = %err, "message handling failed");
                    }
                }
                drop(permit);
            });
        }
    }
}

/// Group id for all messages belonging to one logical document group: the GX
/// bucket, or the job itself for bulk uploads.
pub fn message_group_id(gx_bucket_id: Option<i64>, job_id: i64) -> String {
    match gx_bucket_id {
        Some(bucket) => bucket.to_string(),
        None => format!("bulk-{job_id}"),
    }
}

/// Deduplication id for uploaded content: replays of the same bytes within a
/// group collapse broker-side.
pub fn content_dedup_id(group_id: &str, file_hash: &str) -> String {
    format!("{group_id}-{file_hash}")
}

/// Deduplication id for extracted children. Uniqueness is enforced by the
/// database index, so the broker only needs a collision-free id.
pub fn extracted_dedup_id(file_master_id: i64) -> String {
    format!("file-master-{file_master_id}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_prefers_bucket() {
        assert_eq!(message_group_id(Some(7), 42), "7");
        assert_eq!(message_group_id(None, 42), "bulk-42");
    }

    #[test]
    fn content_dedup_id_is_stable() {
        assert_eq!(content_dedup_id("7", "abc"), "7-abc");
        assert_eq!(content_dedup_id("bulk-42", "abc"), "bulk-42-abc");
    }

    #[test]
    fn extracted_dedup_id_is_unique_per_call() {
        let a = extracted_dedup_id(5);
        let b = extracted_dedup_id(5);
        assert!(a.starts_with("file-master-5-"));
        assert_ne!(a, b);
    }
}
