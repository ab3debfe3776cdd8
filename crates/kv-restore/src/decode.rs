use crate::error::{Error, ErrorKind, Result};
use crate::snapshot::Snapshot;

/// Closed set of request body encodings a backup can arrive in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadEncoding {
    Json,
    Multipart { boundary: String },
    PlainText,
}

impl PayloadEncoding {
    pub fn from_content_type(content_type: &str) -> Result<Self> {
        let ct = content_type.trim().to_ascii_lowercase();
        if ct.contains("application/json") {
            return Ok(Self::Json);
        }
        if ct.contains("multipart/form-data") {
            let boundary = content_type
                .split(';')
                .filter_map(|p| p.trim().split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
                .map(|(_, v)| v.trim().trim_matches('"').to_string())
                .filter(|b| !b.is_empty())
                .ok_or_else(|| Error::validation("multipart body without boundary"))?;
            return Ok(Self::Multipart { boundary });
        }
        if ct.contains("text/plain") {
            return Ok(Self::PlainText);
        }
        Err(Error::new(
            ErrorKind::UnsupportedFormat,
            format!("unsupported content-type: {content_type}"),
        ))
    }
}

pub fn decode_payload(content_type: &str, body: &[u8]) -> Result<Snapshot> {
    match PayloadEncoding::from_content_type(content_type)? {
        PayloadEncoding::Json | PayloadEncoding::PlainText => Snapshot::from_json_str(utf8(body)?),
        PayloadEncoding::Multipart { boundary } => {
            let parts = parse_multipart(utf8(body)?, &boundary);
            // Prefer the part that carries an uploaded file, then a field named "file".
            let part = parts
                .iter()
                .find(|p| p.filename.is_some())
                .or_else(|| parts.iter().find(|p| p.name.as_deref() == Some("file")))
                .or_else(|| parts.first())
                .ok_or_else(|| Error::validation("backup file not found in form data"))?;
            Snapshot::from_json_str(&part.content)
        }
    }
}

fn utf8(body: &[u8]) -> Result<&str> {
    std::str::from_utf8(body).map_err(|e| Error::validation(format!("body is not UTF-8: {e}")))
}

#[derive(Debug, Clone, Default)]
struct FormPart {
    name: Option<String>,
    filename: Option<String>,
    content: String,
}

fn parse_multipart(text: &str, boundary: &str) -> Vec<FormPart> {
    let marker = format!("--{boundary}");
    let mut parts = Vec::new();

    for section in text.split(marker.as_str()).skip(1) {
        if section.starts_with("--") {
            break;
        }
        let section = section.strip_prefix("\r\n").or_else(|| section.strip_prefix('\n'));
        let Some(section) = section else {
            continue;
        };
        let (head, body) = match section.split_once("\r\n\r\n") {
            Some(split) => split,
            None => match section.split_once("\n\n") {
                Some(split) => split,
                None => continue,
            },
        };

        let mut part = FormPart::default();
        for line in head.lines() {
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            if !k.trim().eq_ignore_ascii_case("content-disposition") {
                continue;
            }
            for param in v.split(';').skip(1) {
                let Some((pk, pv)) = param.trim().split_once('=') else {
                    continue;
                };
                let pv = pv.trim().trim_matches('"').to_string();
                match pk.trim() {
                    "name" => part.name = Some(pv),
                    "filename" => part.filename = Some(pv),
                    _ => {}
                }
            }
        }
        let body = body
            .strip_suffix("\r\n")
            .or_else(|| body.strip_suffix('\n'))
            .unwrap_or(body);
        part.content = body.to_string();
        parts.push(part);
    }
    parts
}
