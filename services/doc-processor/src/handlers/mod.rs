//! File handlers: one per input type, behind a common contract.
//!
//! A handler receives the spooled input file and returns extracted items.
//! Three shapes of result drive the per-file pipeline:
//! - empty: the input already is a terminal PDF;
//! - exactly one PDF named like the input: a transformation of the input;
//! - anything else: children to be processed recursively.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use shared::config::{RetrySettings, Settings};
use shared::error::ProcessingError;

use crate::model::FileMaster;

mod msg;
mod office;
mod pdf;
mod zip;

pub use msg::MsgHandler;
pub use office::OfficeHandler;
pub use pdf::PdfHandler;
pub use zip::ZipHandler;

/// A file produced by a handler, either a transformation of the input or a
/// child to recurse on.
#[derive(Debug, Clone)]
pub struct ExtractedFileItem {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl ExtractedFileItem {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

#[async_trait]
pub trait FileHandler: Send + Sync {
    fn supports(&self, extension: &str) -> bool;

    async fn handle(
        &self,
        input: &Path,
        file: &FileMaster,
    ) -> Result<Vec<ExtractedFileItem>, ProcessingError>;
}

/// Decorator retrying the inner handler on transient failures. Terminal
/// failures (validation, protected, malformed) pass through untouched.
pub struct RetryingHandler {
    inner: Arc<dyn FileHandler>,
    retry: RetrySettings,
}

impl RetryingHandler {
    pub fn new(inner: Arc<dyn FileHandler>, retry: RetrySettings) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl FileHandler for RetryingHandler {
    fn supports(&self, extension: &str) -> bool {
        self.inner.supports(extension)
    }

    async fn handle(
        &self,
        input: &Path,
        file: &FileMaster,
    ) -> Result<Vec<ExtractedFileItem>, ProcessingError> {
        let attempts = self.retry.attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.inner.handle(input, file).await {
                Ok(items) => return Ok(items),
                Err(err) if err.is_terminal() => return Err(err),
                Err(err) => {
                    warn!(
                        file_master_id = file.id,
                        attempt,
                        attempts,
                        error = %err,
                        "handler attempt failed"
                    );
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay()).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ProcessingError::TransientExternal("handler retries exhausted".into())
        }))
    }
}

/// Maps file extensions onto handlers; unknown extensions are a terminal
/// validation failure.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn FileHandler>>,
}

impl HandlerRegistry {
    pub fn from_settings(settings: &Settings) -> Self {
        let handlers: Vec<Arc<dyn FileHandler>> = vec![
            Arc::new(RetryingHandler::new(
                Arc::new(ZipHandler::new(settings.zip_handler.clone())),
                settings.zip_handler.retry.clone(),
            )),
            Arc::new(RetryingHandler::new(
                Arc::new(OfficeHandler::new(settings.office.clone())),
                settings.office.retry.clone(),
            )),
            Arc::new(RetryingHandler::new(
                Arc::new(MsgHandler::new(settings.msg_handler.clone())),
                settings.msg_handler.retry.clone(),
            )),
            Arc::new(RetryingHandler::new(
                Arc::new(PdfHandler::new(settings.pdf.clone())),
                settings.pdf.retry.clone(),
            )),
        ];
        Self { handlers }
    }

    #[cfg(test)]
    pub fn with_handlers(handlers: Vec<Arc<dyn FileHandler>>) -> Self {
        Self { handlers }
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.handlers.iter().any(|h| h.supports(extension))
    }

    pub fn dispatch(&self, extension: &str) -> Result<Arc<dyn FileHandler>, ProcessingError> {
        self.handlers
            .iter()
            .find(|h| h.supports(extension))
            .cloned()
            .ok_or_else(|| {
                ProcessingError::Validation(format!("unsupported file extension '{extension}'"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        calls: AtomicU32,
        fail_times: u32,
        error: fn() -> ProcessingError,
    }

    #[async_trait]
    impl FileHandler for FlakyHandler {
        fn supports(&self, extension: &str) -> bool {
            extension == "tst"
        }

        async fn handle(
            &self,
            _input: &Path,
            _file: &FileMaster,
        ) -> Result<Vec<ExtractedFileItem>, ProcessingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err((self.error)())
            } else {
                Ok(vec![])
            }
        }
    }

    fn test_file_master() -> FileMaster {
        use crate::model::{FileStatus, SourceType};
        FileMaster {
            id: 1,
            zip_master_id: None,
            processing_job_id: 1,
            gx_bucket_id: Some(7),
            dedup_group: "7".into(),
            duplicate_of_file_id: None,
            file_location: "7/files/1/a.tst".into(),
            file_name: "a.tst".into(),
            file_size: 1,
            extension: "tst".into(),
            file_hash: "00".into(),
            file_processing_status: FileStatus::InProgress,
            error_message: None,
            source_type: SourceType::Uploaded,
            extraction_depth: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn fast_retry(attempts: u32) -> RetrySettings {
        RetrySettings {
            attempts,
            delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let inner = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 2,
            error: || ProcessingError::TransientIo("flaky".into()),
        });
        let handler = RetryingHandler::new(inner.clone(), fast_retry(3));
        let result = handler
            .handle(Path::new("/dev/null"), &test_file_master())
            .await;
        assert!(result.is_ok());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let inner = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 5,
            error: || ProcessingError::FileProtected,
        });
        let handler = RetryingHandler::new(inner.clone(), fast_retry(3));
        let err = handler
            .handle(Path::new("/dev/null"), &test_file_master())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let inner = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 10,
            error: || ProcessingError::TransientExternal("still down".into()),
        });
        let handler = RetryingHandler::new(inner.clone(), fast_retry(2));
        let err = handler
            .handle(Path::new("/dev/null"), &test_file_master())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn registry_rejects_unknown_extensions() {
        let registry = HandlerRegistry::with_handlers(vec![Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_times: 0,
            error: || ProcessingError::TransientIo("unused".into()),
        })]);
        assert!(registry.supports("tst"));
        assert!(!registry.supports("xyz"));
        let err = match registry.dispatch("xyz") {
            Ok(_) => panic!("expected dispatch to fail for unsupported extension"),
            Err(err) => err,
        };
        assert!(matches!(err, ProcessingError::Validation(_)));
    }
}
