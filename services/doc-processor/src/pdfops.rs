//! PDF inspection, splitting, and optimization.
//!
//! Page counts and encryption checks are done in-process with lopdf; the
//! heavy lifting is delegated to qpdf (splitting, structural optimization)
//! and ghostscript (recompression), both invoked through the process runner.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use shared::config::PdfSettings;
use shared::error::ProcessingError;

use crate::process::run_command;

const GS_PASSWORD_PATTERN: &str = "requires a password for access";
const QPDF_ENCRYPTED_PATTERN: &str = "file is encrypted";
const QPDF_PASSWORD_PATTERN: &str = "invalid password";

/// Loads the document and returns its page count. Encrypted documents are a
/// terminal failure; unreadable ones are malformed.
pub fn page_count(path: &Path) -> Result<usize, ProcessingError> {
    let doc = lopdf::Document::load(path)
        .map_err(|err| ProcessingError::MalformedContent(format!("loading pdf: {err}")))?;
    if doc.trailer.get(b"Encrypt").is_ok() {
        return Err(ProcessingError::FileProtected);
    }
    Ok(doc.get_pages().len())
}

/// Inclusive 1-based page ranges of at most `max_pages` each.
pub fn split_ranges(pages: usize, max_pages: usize) -> Vec<(usize, usize)> {
    if pages == 0 || max_pages == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::with_capacity(pages.div_ceil(max_pages));
    let mut start = 1;
    while start <= pages {
        let end = (start + max_pages - 1).min(pages);
        ranges.push((start, end));
        start = end + 1;
    }
    ranges
}

/// Name of the N-th split artifact (1-based).
pub fn part_name(base: &str, part: usize) -> String {
    format!("{base}_part{part}.pdf")
}

fn classify_qpdf_failure(stderr: &str, context: &str) -> ProcessingError {
    if stderr.contains(QPDF_ENCRYPTED_PATTERN) || stderr.contains(QPDF_PASSWORD_PATTERN) {
        ProcessingError::FileProtected
    } else {
        ProcessingError::TransientExternal(format!("{context}: qpdf failed: {stderr}"))
    }
}

/// Splits `input` into sequential chunks of at most `max_pages` pages via
/// qpdf, writing `{base}_part{N}.pdf` files into `out_dir`.
pub async fn split_pdf(
    settings: &PdfSettings,
    input: &Path,
    out_dir: &Path,
    base: &str,
    pages: usize,
) -> Result<Vec<PathBuf>, ProcessingError> {
    let ranges = split_ranges(pages, settings.max_pages);
    let mut outputs = Vec::with_capacity(ranges.len());
    for (index, (start, end)) in ranges.iter().enumerate() {
        let out_path = out_dir.join(part_name(base, index + 1));
        let args = vec![
            input.to_string_lossy().into_owned(),
            "--pages".to_string(),
            ".".to_string(),
            format!("{start}-{end}"),
            "--".to_string(),
            out_path.to_string_lossy().into_owned(),
        ];
        let output = run_command("qpdf", &args, "pdf-split", settings.optimization_timeout()).await?;
        if !output.success() {
            return Err(classify_qpdf_failure(&output.stderr, "pdf-split"));
        }
        outputs.push(out_path);
    }
    info!(parts = outputs.len(), pages, "split pdf into chunks");
    Ok(outputs)
}

/// Optimizer strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerStrategy {
    Qpdf,
    Ghostscript,
    None,
}

impl OptimizerStrategy {
    pub fn from_config(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "qpdf" => OptimizerStrategy::Qpdf,
            "ghostscript" => OptimizerStrategy::Ghostscript,
            "none" | "" => OptimizerStrategy::None,
            other => {
                warn!(strategy = other, "unknown optimizer strategy; disabling optimization");
                OptimizerStrategy::None
            }
        }
    }
}

/// Runs the configured optimizer over `path`, replacing the file only when
/// the candidate is non-empty and strictly smaller than the input.
pub async fn optimize_pdf(settings: &PdfSettings, path: &Path) -> Result<bool, ProcessingError> {
    let strategy = OptimizerStrategy::from_config(&settings.optimizer_strategy);
    if strategy == OptimizerStrategy::None {
        return Ok(false);
    }

    let original_size = std::fs::metadata(path)?.len();
    let candidate = path.with_extension("opt.pdf");

    let output = match strategy {
        OptimizerStrategy::Ghostscript => {
            let args = vec![
                "-sDEVICE=pdfwrite".to_string(),
                "-dCompatibilityLevel=1.4".to_string(),
                format!("-dPDFSETTINGS={}", settings.ghostscript_preset),
                "-dNOPAUSE".to_string(),
                "-dQUIET".to_string(),
                "-dBATCH".to_string(),
                format!("-sOutputFile={}", candidate.display()),
                path.to_string_lossy().into_owned(),
            ];
            run_command("gs", &args, "pdf-optimize", settings.optimization_timeout()).await?
        }
        OptimizerStrategy::Qpdf => {
            let mut args = settings.qpdf_argv();
            args.push(path.to_string_lossy().into_owned());
            args.push(candidate.to_string_lossy().into_owned());
            run_command("qpdf", &args, "pdf-optimize", settings.optimization_timeout()).await?
        }
        OptimizerStrategy::None => unreachable!(),
    };

    if !output.success() {
        let _ = std::fs::remove_file(&candidate);
        if output.stderr_contains(GS_PASSWORD_PATTERN) {
            return Err(ProcessingError::FileProtected);
        }
        return Err(classify_qpdf_failure(&output.stderr, "pdf-optimize"));
    }

    let candidate_size = std::fs::metadata(&candidate).map(|m| m.len()).unwrap_or(0);
    if candidate_size > 0 && candidate_size < original_size {
        std::fs::rename(&candidate, path)?;
        debug!(
            original = original_size,
            optimized = candidate_size,
            "optimizer shrank pdf"
        );
        Ok(true)
    } else {
        let _ = std::fs::remove_file(&candidate);
        debug!(
            original = original_size,
            candidate = candidate_size,
            "optimizer result discarded; keeping original"
        );
        Ok(false)
    }
}

/// Builds a minimal multi-page PDF fixture; shared by handler tests.
#[cfg(test)]
pub(crate) fn write_test_pdf(path: &Path, pages: usize) {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc
        .add_object(dictionary! { "Type" => "Font", "Subtype" => "Type1", "BaseFont" => "Helvetica" });
    let resources_id = doc.add_object(dictionary! { "Font" => dictionary! { "F1" => font_id } });
    let mut kids = Vec::with_capacity(pages);
    for number in 0..pages {
        let operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 18.into()]),
            Operation::new("Td", vec![100.into(), 700.into()]),
            Operation::new(
                "Tj",
                vec![Object::string_literal(format!("Page {}", number + 1))],
            ),
            Operation::new("ET", vec![]),
        ];
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }
    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages as u32,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
    let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).expect("save test pdf");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("three.pdf");
        write_test_pdf(&path, 3);
        assert_eq!(page_count(&path).unwrap(), 3);
    }

    #[test]
    fn garbage_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();
        let err = page_count(&path).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn ranges_cover_input_exactly() {
        assert_eq!(split_ranges(120, 50), vec![(1, 50), (51, 100), (101, 120)]);
        assert_eq!(split_ranges(50, 50), vec![(1, 50)]);
        assert_eq!(split_ranges(1, 50), vec![(1, 1)]);
        assert_eq!(split_ranges(0, 50), Vec::<(usize, usize)>::new());

        let pages = 173;
        let ranges = split_ranges(pages, 25);
        assert_eq!(ranges.len(), pages.div_ceil(25));
        let total: usize = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(total, pages);
        for window in ranges.windows(2) {
            assert_eq!(window[0].1 + 1, window[1].0);
        }
    }

    #[test]
    fn part_names_are_sequential() {
        assert_eq!(part_name("doc", 1), "doc_part1.pdf");
        assert_eq!(part_name("doc", 3), "doc_part3.pdf");
    }

    #[test]
    fn unknown_strategy_disables_optimization() {
        assert_eq!(OptimizerStrategy::from_config("qpdf"), OptimizerStrategy::Qpdf);
        assert_eq!(
            OptimizerStrategy::from_config("Ghostscript"),
            OptimizerStrategy::Ghostscript
        );
        assert_eq!(OptimizerStrategy::from_config("none"), OptimizerStrategy::None);
        assert_eq!(OptimizerStrategy::from_config("zopfli"), OptimizerStrategy::None);
    }

    #[tokio::test]
    async fn none_strategy_keeps_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        write_test_pdf(&path, 1);
        let before = std::fs::read(&path).unwrap();
        let settings = PdfSettings::default();
        assert!(!optimize_pdf(&settings, &path).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }
}
