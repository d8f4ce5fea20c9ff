//! Office-document conversion via the headless office suite.
//!
//! Each conversion runs in its own temporary directory with an isolated user
//! profile, because the suite refuses concurrent use of a shared profile. The
//! directory is removed on every exit path.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use shared::config::OfficeSettings;
use shared::error::ProcessingError;

use crate::model::{stem_of, FileMaster};
use crate::process::run_command;

use super::{ExtractedFileItem, FileHandler};

pub struct OfficeHandler {
    settings: OfficeSettings,
    extensions: std::collections::HashSet<String>,
}

impl OfficeHandler {
    pub fn new(settings: OfficeSettings) -> Self {
        let extensions = settings.extension_set();
        Self {
            settings,
            extensions,
        }
    }
}

#[async_trait]
impl FileHandler for OfficeHandler {
    fn supports(&self, extension: &str) -> bool {
        self.extensions.contains(extension)
    }

    async fn handle(
        &self,
        input: &Path,
        file: &FileMaster,
    ) -> Result<Vec<ExtractedFileItem>, ProcessingError> {
        let workdir = tempfile::tempdir()?;
        let profile_dir = workdir.path().join("profile");
        std::fs::create_dir(&profile_dir)?;

        // The suite derives the output name from the input name, so the spool
        // file is staged under the original filename first.
        let staged = workdir.path().join(&file.file_name);
        std::fs::copy(input, &staged)?;

        let args = vec![
            format!("-env:UserInstallation=file://{}", profile_dir.display()),
            "--headless".to_string(),
            "--norestore".to_string(),
            "--convert-to".to_string(),
            "pdf".to_string(),
            "--outdir".to_string(),
            workdir.path().to_string_lossy().into_owned(),
            staged.to_string_lossy().into_owned(),
        ];
        let output = run_command(
            &self.settings.binary,
            &args,
            "office-convert",
            self.settings.convert_timeout(),
        )
        .await?;
        if !output.success() {
            return Err(ProcessingError::TransientExternal(format!(
                "office conversion exited with {}: {}",
                output.exit_code, output.stderr
            )));
        }

        let pdf_name = format!("{}.pdf", stem_of(&file.file_name));
        let converted = workdir.path().join(&pdf_name);
        let bytes = std::fs::read(&converted).map_err(|err| {
            ProcessingError::TransientExternal(format!(
                "office conversion produced no output ({err})"
            ))
        })?;
        info!(
            file_master_id = file.id,
            bytes = bytes.len(),
            output = %pdf_name,
            "converted office document"
        );
        Ok(vec![ExtractedFileItem::new(pdf_name, bytes)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supports_configured_extensions_only() {
        let handler = OfficeHandler::new(OfficeSettings::default());
        for ext in ["doc", "docx", "ppt", "pptx", "xls", "xlsx", "wpd", "rtf", "txt", "odt"] {
            assert!(handler.supports(ext), "expected {ext} to be supported");
        }
        assert!(!handler.supports("pdf"));
        assert!(!handler.supports("zip"));
        assert!(!handler.supports("exe"));
    }

    #[test]
    fn custom_extension_list_is_honoured() {
        let settings = OfficeSettings {
            convertible_extensions: "docx,odt".into(),
            ..OfficeSettings::default()
        };
        let handler = OfficeHandler::new(settings);
        assert!(handler.supports("docx"));
        assert!(!handler.supports("xls"));
    }
}
