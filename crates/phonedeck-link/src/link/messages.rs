//! SMS messages and the two reply shapes that carry them.
//!
//! A listing entry looks like
//! `+CMGL: <id>,"<status>","<recipient>","<datetime>",,<len>` followed by the
//! body; a single read looks like `+CMGR: "<status>",…` followed by the body.
//! Optional fields that are not present stay `None`; a quoted empty field is
//! `Some("")`.

use crate::link::exchange::ResultCode;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Ctrl-Z, ends the body of an outgoing message.
pub const SMS_TERMINATOR: u8 = 0x1A;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneMessage {
    pub body: String,
    pub recipient: Option<String>,
    pub id: Option<String>,
    pub datetime: Option<String>,
    pub status: Option<String>,
}

impl PhoneMessage {
    /// Outgoing message.
    pub fn outgoing(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            recipient: Some(recipient.into()),
            ..Default::default()
        }
    }
}

/// One comma-separated header field: `None` when nothing sits between the
/// commas.
fn split_fields(tail: &str) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut seen = false;

    for c in tail.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                seen = true;
            }
            ',' if !quoted => {
                fields.push(if seen { Some(std::mem::take(&mut current)) } else { None });
                current.clear();
                seen = false;
            }
            _ => {
                if quoted || !c.is_whitespace() {
                    current.push(c);
                    seen = true;
                }
            }
        }
    }
    fields.push(if seen { Some(current) } else { None });
    fields
}

fn header_tail(line: &str) -> Option<String> {
    let re = Regex::new(r"^\+CMG\w:\s*(.*)$").ok()?;
    let caps = re.captures(line.trim())?;
    Some(caps.get(1)?.as_str().to_string())
}

fn field(fields: &[Option<String>], idx: usize) -> Option<String> {
    fields.get(idx).cloned().flatten()
}

/// Body length from the last header field of a listing entry.
fn declared_length(line: &str) -> Option<usize> {
    let tail = header_tail(line)?;
    if tail.trim_start().starts_with('"') {
        return None;
    }
    split_fields(&tail).last().cloned().flatten()?.parse().ok()
}

/// Decode a header line into a message without a body.
fn parse_header(line: &str) -> Option<PhoneMessage> {
    let tail = header_tail(line)?;
    let raw_first = tail.trim_start();
    let fields = split_fields(&tail);

    if raw_first.starts_with('"') {
        // read-single shape: status first
        Some(PhoneMessage {
            status: field(&fields, 0),
            recipient: field(&fields, 1),
            datetime: field(&fields, 3),
            ..Default::default()
        })
    } else {
        let id = field(&fields, 0)?;
        if !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(PhoneMessage {
            id: Some(id),
            status: field(&fields, 1),
            recipient: field(&fields, 2),
            datetime: field(&fields, 3),
            ..Default::default()
        })
    }
}

/// A reply-closing result code as the phone sends it: upper case, so a
/// body line reading "Ok" or "Busy" is left alone.
fn is_closing_code(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed == trimmed.to_uppercase() && ResultCode::parse(trimmed).is_final()
}

fn trim_blank_tail(body: &mut Vec<&str>) {
    while body.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        body.pop();
    }
}

/// Collect body lines following a header, up to the next header. When the
/// reply ends instead, its closing result code is dropped unless the
/// header's declared length says the line belongs to the body.
fn take_body<'a>(
    lines: &mut std::iter::Peekable<impl Iterator<Item = &'a str>>,
    declared_len: Option<usize>,
) -> String {
    let mut body: Vec<&str> = Vec::new();
    while let Some(next) = lines.peek() {
        if header_tail(next).is_some() {
            break;
        }
        body.push(next.trim_end_matches('\r'));
        lines.next();
    }
    trim_blank_tail(&mut body);

    let at_end = lines.peek().is_none();
    if at_end && body.last().map(|l| is_closing_code(l)).unwrap_or(false) {
        let full_len = body.join("\n").chars().count();
        if declared_len != Some(full_len) {
            body.pop();
            trim_blank_tail(&mut body);
        }
    }
    body.join("\n")
}

/// Parse a reply carrying exactly one message. Returns `None` when no
/// header line is present.
pub fn parse_message_response(reply: &str) -> Option<PhoneMessage> {
    parse_message_list(reply).into_iter().next()
}

/// Parse a listing reply into messages. Lines before the first header
/// (echo, blank lines) are ignored.
pub fn parse_message_list(reply: &str) -> Vec<PhoneMessage> {
    let mut out = Vec::new();
    let mut lines = reply.lines().peekable();
    while let Some(line) = lines.next() {
        match parse_header(line) {
            Some(mut msg) => {
                let declared = declared_length(line);
                msg.body = take_body(&mut lines, declared);
                out.push(msg);
            }
            None if line.trim_start().starts_with("+CMG") => {
                log::debug!("skipping malformed message header: {}", line.trim());
            }
            None => {}
        }
    }
    out
}

/// Bytes sent after the send prompt: body then the terminator.
pub fn encode_body(body: &str) -> Vec<u8> {
    let mut bytes = crate::link::connection::encode_text(body);
    bytes.push(SMS_TERMINATOR);
    bytes
}
