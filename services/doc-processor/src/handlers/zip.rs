//! Handler for archives nested inside other archives. The top-level ZIP path
//! is the dedicated queue consumer; this handler only surfaces the entries of
//! an inner archive so the pipeline can recurse on them.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;
use zip::result::ZipError;
use zip::ZipArchive;

use shared::config::ZipSettings;
use shared::error::ProcessingError;

use crate::model::FileMaster;

use super::{ExtractedFileItem, FileHandler};

pub struct ZipHandler {
    settings: ZipSettings,
}

impl ZipHandler {
    pub fn new(settings: ZipSettings) -> Self {
        Self { settings }
    }
}

fn classify_zip_error(err: ZipError) -> ProcessingError {
    match err {
        ZipError::Io(io) => ProcessingError::TransientIo(io.to_string()),
        other => ProcessingError::MalformedContent(format!("invalid zip archive: {other}")),
    }
}

#[async_trait]
impl FileHandler for ZipHandler {
    fn supports(&self, extension: &str) -> bool {
        extension == "zip"
    }

    async fn handle(
        &self,
        input: &Path,
        file: &FileMaster,
    ) -> Result<Vec<ExtractedFileItem>, ProcessingError> {
        let reader = std::fs::File::open(input)?;
        let mut archive = ZipArchive::new(reader).map_err(classify_zip_error)?;

        let mut items = Vec::new();
        let mut total_bytes: u64 = 0;
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(classify_zip_error)?;
            if entry.is_dir() {
                continue;
            }
            total_bytes = total_bytes.saturating_add(entry.size());
            if total_bytes > self.settings.max_uncompressed_bytes {
                return Err(ProcessingError::MalformedContent(format!(
                    "archive exceeds uncompressed size cap of {} bytes",
                    self.settings.max_uncompressed_bytes
                )));
            }
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut bytes)
                .map_err(|err| ProcessingError::MalformedContent(format!("reading entry: {err}")))?;
            items.push(ExtractedFileItem::new(entry.name().to_string(), bytes));
        }
        info!(
            file_master_id = file.id,
            entries = items.len(),
            "expanded nested archive"
        );
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use zip::write::FileOptions;

    use crate::model::{FileStatus, SourceType};

    fn nested_file_master() -> FileMaster {
        FileMaster {
            id: 10,
            zip_master_id: Some(1),
            processing_job_id: 1,
            gx_bucket_id: Some(7),
            dedup_group: "7".into(),
            duplicate_of_file_id: None,
            file_location: "7/files/1/inner.zip".into(),
            file_name: "inner.zip".into(),
            file_size: 0,
            extension: "zip".into(),
            file_hash: "00".into(),
            file_processing_status: FileStatus::InProgress,
            error_message: None,
            source_type: SourceType::Extracted,
            extraction_depth: 1,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, bytes) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn surfaces_entries_with_names_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inner.zip");
        write_zip(&path, &[("a.pdf", b"pdf-bytes"), ("b.txt", b"text")]);

        let handler = ZipHandler::new(ZipSettings::default());
        let items = handler
            .handle(&path, &nested_file_master())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "a.pdf");
        assert_eq!(items[0].bytes, b"pdf-bytes");
        assert_eq!(items[1].name, "b.txt");
    }

    #[tokio::test]
    async fn skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inner.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer.add_directory("docs/", FileOptions::default()).unwrap();
        writer
            .start_file("docs/a.pdf", FileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        writer.finish().unwrap();

        let handler = ZipHandler::new(ZipSettings::default());
        let items = handler.handle(&path, &nested_file_master()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "docs/a.pdf");
    }

    #[tokio::test]
    async fn garbage_archive_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        std::fs::write(&path, b"definitely not a zip").unwrap();

        let handler = ZipHandler::new(ZipSettings::default());
        let err = handler
            .handle(&path, &nested_file_master())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn size_cap_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.zip");
        write_zip(&path, &[("big.bin", vec![0u8; 2048].as_slice())]);

        let settings = ZipSettings {
            max_uncompressed_bytes: 1024,
            ..ZipSettings::default()
        };
        let handler = ZipHandler::new(settings);
        let err = handler
            .handle(&path, &nested_file_master())
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }
}
