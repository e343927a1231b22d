//! Mail-message parsing for uploads.
//!
//! Outlook `.msg` files are OLE compound files holding MAPI properties as
//! streams; everything else is read as an RFC 822 message (`.eml`).

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use std::io::{Cursor, Read};
use std::sync::LazyLock;

use super::parser::{decode_text, split_paragraphs};

const COMPOUND_FILE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

// MAPI property ids
const PR_SUBJECT: &str = "0037";
const PR_SENDER_NAME: &str = "0C1A";
const PR_SENDER_EMAIL_ADDRESS: &str = "0C1F";
const PR_SENDER_SMTP_ADDRESS: &str = "5D01";
const PR_DISPLAY_TO: &str = "0E04";
const PR_BODY: &str = "1000";
const PR_MESSAGE_DELIVERY_TIME: u32 = 0x0E06_0040;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

static HTML_TAG_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)<[^>]*>").expect("html tag regex is valid"));
static ENCODED_WORD_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"=\?([^?]+)\?([bBqQ])\?([^?]*)\?=").expect("encoded word regex is valid")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailMessage {
    pub sender_name: String,
    pub sender_email: String,
    pub recipients: String,
    pub subject: String,
    pub delivery_time: String,
    pub body: String,
}

impl MailMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(&COMPOUND_FILE_MAGIC) {
            parse_outlook_msg(bytes)
        } else {
            parse_rfc822(bytes)
        }
    }

    /// Four header paragraphs (From, To, Subject, Date) followed by the body lines.
    pub fn to_paragraphs(&self) -> Vec<String> {
        let mut paragraphs = vec![
            format!("From: {}", format_sender(&self.sender_name, &self.sender_email)),
            format!("To: {}", self.recipients),
            format!("Subject: {}", self.subject),
            format!("Date: {}", self.delivery_time),
        ];
        paragraphs.extend(split_paragraphs(&self.body));
        paragraphs
    }
}

fn format_sender(name: &str, email: &str) -> String {
    match (name.is_empty(), email.is_empty()) {
        (false, false) => format!("{} <{}>", name, email),
        (false, true) => name.to_string(),
        _ => email.to_string(),
    }
}

// ── Outlook .msg ───────────────────────────────────────────────────────────

fn parse_outlook_msg(bytes: &[u8]) -> Result<MailMessage> {
    let mut file = cfb::CompoundFile::open(Cursor::new(bytes))
        .context("Failed to open Outlook message as compound file")?;

    let sender_email = read_string_property(&mut file, PR_SENDER_SMTP_ADDRESS)
        .or_else(|| read_string_property(&mut file, PR_SENDER_EMAIL_ADDRESS))
        .unwrap_or_default();

    let delivery_time = read_delivery_time(&mut file)
        .map(|t| t.to_rfc2822())
        .unwrap_or_default();

    Ok(MailMessage {
        sender_name: read_string_property(&mut file, PR_SENDER_NAME).unwrap_or_default(),
        sender_email,
        recipients: read_string_property(&mut file, PR_DISPLAY_TO).unwrap_or_default(),
        subject: read_string_property(&mut file, PR_SUBJECT).unwrap_or_default(),
        delivery_time,
        body: read_string_property(&mut file, PR_BODY).unwrap_or_default(),
    })
}

fn read_stream<F: Read + std::io::Seek>(
    file: &mut cfb::CompoundFile<F>,
    path: &str,
) -> Option<Vec<u8>> {
    let mut stream = file.open_stream(path).ok()?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).ok()?;
    Some(buf)
}

/// Unicode (`001F`) properties win over 8-bit (`001E`) ones.
fn read_string_property<F: Read + std::io::Seek>(
    file: &mut cfb::CompoundFile<F>,
    property: &str,
) -> Option<String> {
    if let Some(raw) = read_stream(file, &format!("/__substg1.0_{}001F", property)) {
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16_lossy(&units);
        return Some(text.trim_end_matches('\0').to_string());
    }
    read_stream(file, &format!("/__substg1.0_{}001E", property))
        .map(|raw| decode_text(&raw).trim_end_matches('\0').to_string())
}

/// Fixed-size properties live in `__properties_version1.0`: a 32-byte header
/// for the top-level message, then 16-byte entries (tag, flags, value).
fn read_delivery_time<F: Read + std::io::Seek>(
    file: &mut cfb::CompoundFile<F>,
) -> Option<DateTime<Utc>> {
    let raw = read_stream(file, "/__properties_version1.0")?;
    raw.get(32..)?
        .chunks_exact(16)
        .find(|entry| u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]) == PR_MESSAGE_DELIVERY_TIME)
        .and_then(|entry| {
            let mut value = [0u8; 8];
            value.copy_from_slice(&entry[8..16]);
            filetime_to_datetime(u64::from_le_bytes(value))
        })
}

fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    let secs = (filetime / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((filetime % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

// ── RFC 822 ────────────────────────────────────────────────────────────────

struct MimePart {
    headers: Vec<(String, String)>,
    body: String,
}

impl MimePart {
    fn parse(raw: &str) -> Self {
        let (head, body) = split_head_body(raw);
        Self {
            headers: parse_headers(head),
            body: body.to_string(),
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn content_type(&self) -> String {
        self.header("content-type")
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "text/plain".to_string())
    }

    fn decoded_body(&self) -> String {
        let encoding = self
            .header("content-transfer-encoding")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match encoding.as_str() {
            "base64" => {
                let compact: String = self.body.split_whitespace().collect();
                BASE64
                    .decode(compact.as_bytes())
                    .map(|bytes| decode_text(&bytes))
                    .unwrap_or_else(|_| self.body.clone())
            }
            "quoted-printable" => decode_text(&decode_quoted_printable(&self.body)),
            _ => self.body.clone(),
        }
    }

    /// First `text/plain` leaf, falling back to tag-stripped `text/html`.
    fn text_body(&self) -> Option<String> {
        let content_type = self.content_type();
        if content_type.starts_with("multipart/") {
            let boundary = header_param(self.header("content-type")?, "boundary")?;
            let parts = split_multipart(&self.body, &boundary);
            if let Some(text) = parts
                .iter()
                .filter(|p| !p.content_type().starts_with("text/html"))
                .find_map(|p| p.text_body())
            {
                return Some(text);
            }
            return parts.iter().find_map(|p| p.text_body());
        }
        match content_type.as_str() {
            "text/plain" => Some(self.decoded_body()),
            "text/html" => Some(HTML_TAG_RE.replace_all(&self.decoded_body(), "").into_owned()),
            _ => None,
        }
    }
}

fn parse_rfc822(bytes: &[u8]) -> Result<MailMessage> {
    let raw = decode_text(bytes);
    let message = MimePart::parse(&raw);

    if message.header("from").is_none() && message.header("subject").is_none() {
        return Err(anyhow!("Not a mail message: no From or Subject header"));
    }

    let (sender_name, sender_email) = parse_address(message.header("from").unwrap_or_default());

    Ok(MailMessage {
        sender_name,
        sender_email,
        recipients: decode_encoded_words(message.header("to").unwrap_or_default()),
        subject: decode_encoded_words(message.header("subject").unwrap_or_default()),
        delivery_time: message.header("date").unwrap_or_default().to_string(),
        body: message.text_body().unwrap_or_default(),
    })
}

fn split_head_body(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        return (&raw[..pos], &raw[pos + 4..]);
    }
    if let Some(pos) = raw.find("\n\n") {
        return (&raw[..pos], &raw[pos + 2..]);
    }
    (raw, "")
}

/// Headers with folded continuation lines joined.
fn parse_headers(head: &str) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    headers
}

fn header_param(header: &str, param: &str) -> Option<String> {
    header.split(';').skip(1).find_map(|segment| {
        let (key, value) = segment.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(param)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn split_multipart(body: &str, boundary: &str) -> Vec<MimePart> {
    let delimiter = format!("--{}", boundary);
    body.split(delimiter.as_str())
        .skip(1)
        .take_while(|segment| !segment.starts_with("--"))
        .map(|segment| MimePart::parse(segment.trim_start_matches(['\r', '\n'])))
        .collect()
}

/// `"Jane Doe" <jane@example.com>` → (`Jane Doe`, `jane@example.com`).
fn parse_address(value: &str) -> (String, String) {
    let value = decode_encoded_words(value);
    match (value.find('<'), value.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = value[..open].trim().trim_matches('"').trim().to_string();
            let email = value[open + 1..close].trim().to_string();
            (name, email)
        }
        _ => (String::new(), value.trim().to_string()),
    }
}

fn decode_quoted_printable(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'=' {
            // soft line break
            if bytes[i + 1..].starts_with(b"\r\n") {
                i += 3;
                continue;
            }
            if bytes[i + 1..].starts_with(b"\n") {
                i += 2;
                continue;
            }
            if let Some(hex) = bytes.get(i + 1..i + 3) {
                if let Ok(value) = u8::from_str_radix(&String::from_utf8_lossy(hex), 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// RFC 2047 encoded words; the charset is assumed to be UTF-8 compatible.
fn decode_encoded_words(value: &str) -> String {
    ENCODED_WORD_RE
        .replace_all(value, |caps: &regex::Captures| {
            let payload = &caps[3];
            let decoded = if caps[2].eq_ignore_ascii_case("b") {
                BASE64.decode(payload.as_bytes()).ok()
            } else {
                Some(decode_quoted_printable(&payload.replace('_', " ")))
            };
            decoded
                .map(|bytes| decode_text(&bytes))
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
pub(crate) fn build_outlook_msg(
    sender_name: &str,
    sender_email: &str,
    to: &str,
    subject: &str,
    body: &str,
    delivered: DateTime<Utc>,
) -> Vec<u8> {
    use std::io::Write;

    fn utf16(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    let mut file = cfb::CompoundFile::create(Cursor::new(Vec::new())).unwrap();
    for (property, value) in [
        (PR_SENDER_NAME, sender_name),
        (PR_SENDER_SMTP_ADDRESS, sender_email),
        (PR_DISPLAY_TO, to),
        (PR_SUBJECT, subject),
        (PR_BODY, body),
    ] {
        let mut stream = file
            .create_stream(format!("/__substg1.0_{}001F", property))
            .unwrap();
        stream.write_all(&utf16(value)).unwrap();
    }

    let filetime = ((delivered.timestamp() + FILETIME_UNIX_OFFSET_SECS) as u64) * 10_000_000;
    let mut props = vec![0u8; 32];
    props.extend_from_slice(&PR_MESSAGE_DELIVERY_TIME.to_le_bytes());
    props.extend_from_slice(&[0, 0, 0, 0]);
    props.extend_from_slice(&filetime.to_le_bytes());
    let mut stream = file.create_stream("/__properties_version1.0").unwrap();
    stream.write_all(&props).unwrap();
    drop(stream);

    file.flush().unwrap();
    file.into_inner().into_inner()
}
