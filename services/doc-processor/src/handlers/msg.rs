//! Outlook MSG handler.
//!
//! The `.msg` container is a compound file. Attachments keep their original
//! bytes and filenames; a non-empty message body is additionally rendered to
//! PDF (HTML body preferred, plain text wrapped in `<pre>` otherwise) through
//! the external HTML renderer and appended as `Email_Body_{uuid}.pdf`.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use shared::config::MsgSettings;
use shared::error::ProcessingError;

use crate::model::FileMaster;
use crate::process::run_command;

use super::{ExtractedFileItem, FileHandler};

// MAPI property streams inside the container: __substg1.0_{tag}{type} with
// 001F = UTF-16LE, 001E = 8-bit, 0102 = binary.
const PROP_SUBJECT: &str = "0037";
const PROP_SENDER_NAME: &str = "0C1A";
const PROP_DISPLAY_TO: &str = "0E04";
const PROP_BODY_PLAIN: &str = "1000";
const PROP_BODY_HTML: &str = "1013";
const PROP_ATTACH_DATA: &str = "3701";
const PROP_ATTACH_LONG_NAME: &str = "3707";
const PROP_ATTACH_SHORT_NAME: &str = "3704";
const ATTACH_PREFIX: &str = "__attach_version1.0_";

#[derive(Debug, Default)]
struct ParsedMsg {
    subject: Option<String>,
    sender: Option<String>,
    to: Option<String>,
    html_body: Option<Vec<u8>>,
    plain_body: Option<String>,
    attachments: Vec<(String, Vec<u8>)>,
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
        .trim_end_matches('\0')
        .to_string()
}

fn read_stream<R: Read + std::io::Seek>(
    comp: &mut cfb::CompoundFile<R>,
    path: &str,
) -> Option<Vec<u8>> {
    let mut stream = comp.open_stream(path).ok()?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).ok()?;
    Some(bytes)
}

/// Reads a string property, preferring the UTF-16 variant.
fn read_string_prop<R: Read + std::io::Seek>(
    comp: &mut cfb::CompoundFile<R>,
    storage: &str,
    tag: &str,
) -> Option<String> {
    if let Some(bytes) = read_stream(comp, &format!("{storage}__substg1.0_{tag}001F")) {
        return Some(decode_utf16le(&bytes));
    }
    read_stream(comp, &format!("{storage}__substg1.0_{tag}001E"))
        .map(|bytes| String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string())
}

fn parse_msg(path: &Path) -> Result<ParsedMsg, ProcessingError> {
    let mut comp = cfb::open(path)
        .map_err(|err| ProcessingError::MalformedContent(format!("opening msg container: {err}")))?;

    let mut parsed = ParsedMsg {
        subject: read_string_prop(&mut comp, "/", PROP_SUBJECT),
        sender: read_string_prop(&mut comp, "/", PROP_SENDER_NAME),
        to: read_string_prop(&mut comp, "/", PROP_DISPLAY_TO),
        html_body: read_stream(&mut comp, &format!("/__substg1.0_{PROP_BODY_HTML}0102")),
        plain_body: read_string_prop(&mut comp, "/", PROP_BODY_PLAIN),
        attachments: Vec::new(),
    };

    let storages: Vec<String> = comp
        .read_root_storage()
        .filter(|entry| entry.is_storage() && entry.name().starts_with(ATTACH_PREFIX))
        .map(|entry| entry.name().to_string())
        .collect();

    for (index, storage) in storages.iter().enumerate() {
        let prefix = format!("/{storage}/");
        let Some(data) = read_stream(&mut comp, &format!("{prefix}__substg1.0_{PROP_ATTACH_DATA}0102"))
        else {
            // Embedded messages and OLE objects carry no plain data stream.
            warn!(storage = %storage, "attachment without data stream skipped");
            continue;
        };
        let name = read_string_prop(&mut comp, &prefix, PROP_ATTACH_LONG_NAME)
            .or_else(|| read_string_prop(&mut comp, &prefix, PROP_ATTACH_SHORT_NAME))
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("attachment_{}", index + 1));
        parsed.attachments.push((name, data));
    }

    Ok(parsed)
}

fn escape_html(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            other => other.to_string(),
        })
        .collect()
}

/// Assembles the rendered body page: header block with subject/from/to, then
/// the HTML body as-is or the plain text wrapped in `<pre>`.
fn compose_body_html(parsed: &ParsedMsg, font_css: &str) -> Option<String> {
    let body = match (&parsed.html_body, &parsed.plain_body) {
        (Some(html), _) if !html.is_empty() => String::from_utf8_lossy(html).into_owned(),
        (_, Some(plain)) if !plain.trim().is_empty() => {
            format!("<pre>{}</pre>", escape_html(plain))
        }
        _ => return None,
    };

    let subject = escape_html(parsed.subject.as_deref().unwrap_or("(no subject)"));
    let from = escape_html(parsed.sender.as_deref().unwrap_or(""));
    let to = escape_html(parsed.to.as_deref().unwrap_or(""));
    Some(format!(
        "<html><head><meta charset=\"utf-8\">{font_css}</head><body>\
         <div><b>Subject:</b> {subject}<br><b>From:</b> {from}<br><b>To:</b> {to}</div>\
         <hr>{body}</body></html>"
    ))
}

pub struct MsgHandler {
    settings: MsgSettings,
}

impl MsgHandler {
    pub fn new(settings: MsgSettings) -> Self {
        Self { settings }
    }

    /// CSS for the configured body font. A missing font file must not fail
    /// the job; it is logged and the renderer default applies.
    fn font_css(&self) -> String {
        if self.settings.body_font_path.is_empty() {
            return String::new();
        }
        let path = Path::new(&self.settings.body_font_path);
        if !path.exists() {
            warn!(
                font = %self.settings.body_font_path,
                "configured body font missing; using default font"
            );
            return String::new();
        }
        format!(
            "<style>@font-face {{ font-family: 'EmailBody'; src: url('file://{}'); }} \
             body {{ font-family: 'EmailBody', sans-serif; }}</style>",
            path.display()
        )
    }

    async fn render_body_pdf(&self, html: &str) -> Result<Vec<u8>, ProcessingError> {
        let workdir = tempfile::tempdir()?;
        let html_path = workdir.path().join("body.html");
        let pdf_path = workdir.path().join("body.pdf");
        std::fs::write(&html_path, html)?;

        let args = vec![
            "--quiet".to_string(),
            "--encoding".to_string(),
            "utf-8".to_string(),
            html_path.to_string_lossy().into_owned(),
            pdf_path.to_string_lossy().into_owned(),
        ];
        let output = run_command(
            &self.settings.html_to_pdf_binary,
            &args,
            "msg-body-render",
            self.settings.html_to_pdf_timeout(),
        )
        .await?;
        if !output.success() {
            return Err(ProcessingError::TransientExternal(format!(
                "html renderer exited with {}: {}",
                output.exit_code, output.stderr
            )));
        }
        Ok(std::fs::read(&pdf_path)?)
    }
}

#[async_trait]
impl FileHandler for MsgHandler {
    fn supports(&self, extension: &str) -> bool {
        extension == "msg"
    }

    async fn handle(
        &self,
        input: &Path,
        file: &FileMaster,
    ) -> Result<Vec<ExtractedFileItem>, ProcessingError> {
        let parsed = parse_msg(input)?;

        let mut items: Vec<ExtractedFileItem> = parsed
            .attachments
            .iter()
            .map(|(name, bytes)| ExtractedFileItem::new(name.clone(), bytes.clone()))
            .collect();

        if let Some(html) = compose_body_html(&parsed, &self.font_css()) {
            let pdf = self.render_body_pdf(&html).await?;
            items.push(ExtractedFileItem::new(
                format!("Email_Body_{}.pdf", Uuid::new_v4()),
                pdf,
            ));
        }

        info!(
            file_master_id = file.id,
            attachments = parsed.attachments.len(),
            items = items.len(),
            "expanded msg file"
        );
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn write_test_msg(path: &Path, with_html: bool) {
        let mut comp = cfb::create(path).unwrap();
        comp.create_stream("/__substg1.0_0037001F")
            .unwrap()
            .write_all(&utf16le("Quarterly numbers"))
            .unwrap();
        comp.create_stream("/__substg1.0_0C1A001F")
            .unwrap()
            .write_all(&utf16le("Alex Sender"))
            .unwrap();
        comp.create_stream("/__substg1.0_0E04001F")
            .unwrap()
            .write_all(&utf16le("Billing Team"))
            .unwrap();
        comp.create_stream("/__substg1.0_1000001F")
            .unwrap()
            .write_all(&utf16le("See attachment.\n<check totals>"))
            .unwrap();
        if with_html {
            comp.create_stream("/__substg1.0_10130102")
                .unwrap()
                .write_all(b"<p>See attachment.</p>")
                .unwrap();
        }
        comp.create_storage("/__attach_version1.0_#00000000").unwrap();
        comp.create_stream("/__attach_version1.0_#00000000/__substg1.0_3707001F")
            .unwrap()
            .write_all(&utf16le("totals.pdf"))
            .unwrap();
        comp.create_stream("/__attach_version1.0_#00000000/__substg1.0_37010102")
            .unwrap()
            .write_all(b"%PDF-fake")
            .unwrap();
        comp.flush().unwrap();
    }

    #[test]
    fn decodes_utf16_and_strips_trailing_nul() {
        let mut bytes = utf16le("hello");
        bytes.extend_from_slice(&[0, 0]);
        assert_eq!(decode_utf16le(&bytes), "hello");
    }

    #[test]
    fn parses_headers_body_and_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.msg");
        write_test_msg(&path, true);

        let parsed = parse_msg(&path).unwrap();
        assert_eq!(parsed.subject.as_deref(), Some("Quarterly numbers"));
        assert_eq!(parsed.sender.as_deref(), Some("Alex Sender"));
        assert_eq!(parsed.to.as_deref(), Some("Billing Team"));
        assert_eq!(parsed.html_body.as_deref(), Some(b"<p>See attachment.</p>".as_slice()));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].0, "totals.pdf");
        assert_eq!(parsed.attachments[0].1, b"%PDF-fake");
    }

    #[test]
    fn garbage_container_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.msg");
        std::fs::write(&path, b"not a compound file").unwrap();
        let err = parse_msg(&path).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn html_body_is_preferred() {
        let parsed = ParsedMsg {
            subject: Some("s".into()),
            sender: Some("f".into()),
            to: Some("t".into()),
            html_body: Some(b"<p>rich</p>".to_vec()),
            plain_body: Some("plain".into()),
            attachments: vec![],
        };
        let html = compose_body_html(&parsed, "").unwrap();
        assert!(html.contains("<p>rich</p>"));
        assert!(!html.contains("<pre>"));
        assert!(html.contains("<b>Subject:</b> s"));
    }

    #[test]
    fn plain_body_is_escaped_and_wrapped() {
        let parsed = ParsedMsg {
            plain_body: Some("totals < forecast & fees".into()),
            ..ParsedMsg::default()
        };
        let html = compose_body_html(&parsed, "").unwrap();
        assert!(html.contains("<pre>totals &lt; forecast &amp; fees</pre>"));
        assert!(html.contains("(no subject)"));
    }

    #[test]
    fn empty_body_renders_nothing() {
        let parsed = ParsedMsg {
            plain_body: Some("   \n".into()),
            ..ParsedMsg::default()
        };
        assert!(compose_body_html(&parsed, "").is_none());
    }

    #[test]
    fn missing_font_falls_back_to_default() {
        let handler = MsgHandler::new(MsgSettings {
            body_font_path: "/definitely/missing/font.ttf".into(),
            ..MsgSettings::default()
        });
        assert!(handler.font_css().is_empty());
    }
}
