//! Command / reply exchange with a bounded retry budget.
//!
//! One exchange sends a command line terminated by CR and polls for a
//! reply. An empty poll counts as one trial; after `max_trials` empty polls
//! the exchange gives up with [`Reply::NoAnswer`]. Once reply bytes start
//! arriving, polling continues until a poll comes back empty, so a reply
//! split across reads comes back whole even when a body line looks like a
//! result code. Input left over from an earlier exchange is discarded
//! before each send.

use crate::link::connection::{decode_text, encode_text, PhoneConnection};
use crate::link::error::{LinkError, LinkResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default retry budget for one exchange.
pub const MAX_TRIALS: u32 = 5;

/// Default receive window per trial.
pub const RECV_WINDOW: Duration = Duration::from_millis(300);

/// Retry budget and per-trial receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_trials: u32,
    pub recv_window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_trials: MAX_TRIALS,
            recv_window: RECV_WINDOW,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of one exchange.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Decoded reply text, untrimmed.
    Answered(String),
    /// Every trial came back empty.
    NoAnswer { command: String, trials: u32 },
    /// Send or receive failed.
    Failed(LinkError),
}

impl Reply {
    pub fn is_answered(&self) -> bool {
        matches!(self, Self::Answered(_))
    }

    /// Text to show in place of the reply: the reply itself, nothing for no
    /// answer, or the bracketed diagnostic for a failure.
    pub fn text(&self) -> String {
        match self {
            Self::Answered(t) => t.clone(),
            Self::NoAnswer { .. } => String::new(),
            Self::Failed(e) => e.placeholder(),
        }
    }

    pub fn into_result(self) -> LinkResult<String> {
        match self {
            Self::Answered(t) => Ok(t),
            Self::NoAnswer { command, trials } => Err(LinkError::no_answer(&command, trials)),
            Self::Failed(e) => Err(e),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Exchange
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Send `command` + CR and wait for a reply.
pub async fn exchange(conn: &dyn PhoneConnection, command: &str, policy: &RetryPolicy) -> Reply {
    let mut bytes = encode_text(command);
    bytes.push(b'\r');
    exchange_bytes(conn, command, &bytes, policy).await
}

/// Send raw bytes and wait for a reply. `label` names the exchange in logs
/// and errors.
pub async fn exchange_bytes(
    conn: &dyn PhoneConnection,
    label: &str,
    bytes: &[u8],
    policy: &RetryPolicy,
) -> Reply {
    if let Err(e) = drain_stale(conn, policy).await {
        log::warn!("{}: clearing input before '{}' failed: {}", conn.device(), label, e);
        return Reply::Failed(e);
    }
    if let Err(e) = conn.send(bytes).await {
        log::warn!("{}: send of '{}' failed: {}", conn.device(), label, e);
        return Reply::Failed(e);
    }
    match collect_reply(conn, policy).await {
        Ok(Some(text)) => Reply::Answered(text),
        Ok(None) => {
            log::debug!(
                "{}: no answer to '{}' after {} trials",
                conn.device(),
                label,
                policy.max_trials
            );
            Reply::NoAnswer {
                command: label.to_string(),
                trials: policy.max_trials,
            }
        }
        Err(e) => {
            log::warn!("{}: receive for '{}' failed: {}", conn.device(), label, e);
            Reply::Failed(e)
        }
    }
}

/// Read and discard whatever is already waiting on the link. Returns the
/// number of bytes dropped.
pub async fn drain_stale(conn: &dyn PhoneConnection, policy: &RetryPolicy) -> LinkResult<usize> {
    let mut dropped = 0usize;
    while conn.available_bytes().await? > 0 {
        let stale = conn.recv(policy.recv_window).await?;
        if stale.is_empty() {
            break;
        }
        log::debug!("{}: discarding stale input {:?}", conn.device(), decode_text(&stale));
        dropped += stale.len();
    }
    Ok(dropped)
}

/// Poll until a non-blank reply has been read in full (ended by an empty
/// poll), or the trial budget runs out (`Ok(None)`).
pub async fn collect_reply(
    conn: &dyn PhoneConnection,
    policy: &RetryPolicy,
) -> LinkResult<Option<String>> {
    let mut buf: Vec<u8> = Vec::new();
    let mut trials = 0u32;
    let mut started = false;

    loop {
        let chunk = conn.recv(policy.recv_window).await?;
        if started {
            if chunk.is_empty() {
                break;
            }
            buf.extend_from_slice(&chunk);
        } else {
            buf.extend_from_slice(&chunk);
            if decode_text(&buf).trim().is_empty() {
                trials += 1;
                if trials >= policy.max_trials {
                    return Ok(None);
                }
                continue;
            }
            started = true;
        }
    }
    let text = decode_text(&buf);
    if final_code(&text).is_none() {
        log::debug!("{}: reply ended without a result code", conn.device());
    }
    Ok(Some(text))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Result codes & payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Classification of one reply line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    Ok,
    Error,
    CmeError(String),
    CmsError(String),
    NoCarrier,
    Busy,
    NoDialtone,
    NoAnswer,
    Connect(String),
    /// Not a result code.
    Other(String),
}

impl ResultCode {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let upper = trimmed.to_uppercase();
        match upper.as_str() {
            "OK" => Self::Ok,
            "ERROR" => Self::Error,
            "NO CARRIER" => Self::NoCarrier,
            "BUSY" => Self::Busy,
            "NO DIALTONE" => Self::NoDialtone,
            "NO ANSWER" => Self::NoAnswer,
            "CONNECT" => Self::Connect(String::new()),
            _ => {
                if let Some(rest) = upper.strip_prefix("+CME ERROR:") {
                    Self::CmeError(rest.trim().to_string())
                } else if let Some(rest) = upper.strip_prefix("+CMS ERROR:") {
                    Self::CmsError(rest.trim().to_string())
                } else if let Some(rest) = upper.strip_prefix("CONNECT ") {
                    Self::Connect(rest.trim().to_string())
                } else {
                    Self::Other(trimmed.to_string())
                }
            }
        }
    }

    /// True for any line that ends a reply.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error | Self::CmeError(_) | Self::CmsError(_))
    }
}

/// Final result code of a reply, if it ended with one.
pub fn final_code(reply: &str) -> Option<ResultCode> {
    let last = reply.lines().map(str::trim).filter(|l| !l.is_empty()).last()?;
    let code = ResultCode::parse(last);
    if code.is_final() {
        Some(code)
    } else {
        None
    }
}

fn strip_tag(line: &str) -> String {
    match Regex::new(r"^\+[A-Za-z0-9]+:\s*") {
        Ok(re) => re.replace(line, "").into_owned(),
        Err(_) => line.to_string(),
    }
}

/// Informational lines of a reply: echo, blank lines and result codes
/// removed, `+TAG:` prefixes stripped.
pub fn payload_lines(command: &str, reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !l.eq_ignore_ascii_case(command.trim()))
        .filter(|l| !ResultCode::parse(l).is_final())
        .map(strip_tag)
        .collect()
}

/// First informational line, if any.
pub fn payload(command: &str, reply: &str) -> Option<String> {
    payload_lines(command, reply).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::simulated::{SimReply, SimulatedConnection, SimulatedFactory};
    use crate::link::connection::ConnectionFactory;
    use crate::link::error::LinkErrorKind;
    use crate::link::types::ConnectionParameters;
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_trials: MAX_TRIALS,
            recv_window: Duration::from_millis(5),
        }
    }

    async fn open(sim: Arc<SimulatedConnection>) -> Arc<dyn PhoneConnection> {
        let factory = SimulatedFactory::new();
        let device = sim.device().to_string();
        factory.add(sim);
        factory.open(&ConnectionParameters::new(device)).await.unwrap()
    }

    #[tokio::test]
    async fn test_no_answer_after_exactly_max_trials() {
        let sim = SimulatedConnection::silent("SIM0");
        let conn = open(sim.clone()).await;
        let reply = exchange(conn.as_ref(), "AT", &fast()).await;
        assert!(matches!(reply, Reply::NoAnswer { trials: 5, .. }));
        assert_eq!(sim.recv_polls(), MAX_TRIALS as usize);
        assert_eq!(reply.text(), "");
        let err = reply.into_result().unwrap_err();
        assert!(err.is_no_answer());
    }

    #[tokio::test]
    async fn test_answer_collected_across_chunks() {
        let sim = SimulatedConnection::with_responder("SIM0", |line| {
            if line == "AT+CGMR" {
                SimReply::ok("R1A/1.0")
            } else {
                SimReply::Silent
            }
        });
        sim.set_chunk_limit(3);
        let conn = open(sim).await;
        let reply = exchange(conn.as_ref(), "AT+CGMR", &fast()).await;
        let text = reply.into_result().unwrap();
        assert_eq!(payload("AT+CGMR", &text).as_deref(), Some("R1A/1.0"));
        assert_eq!(final_code(&text), Some(ResultCode::Ok));
    }

    #[tokio::test]
    async fn test_split_listing_stays_with_its_command() {
        let sim = SimulatedConnection::with_responder("SIM0", |line| match line {
            "AT+CMGL=\"ALL\"" => SimReply::Text(
                "\r\n+CMGL: 1,\"1\",\"555\",\"d\",,2\r\nOK\r\n\
                 +CMGL: 2,\"1\",\"556\",\"d\",,3\r\nhey\r\n\r\nOK\r\n"
                    .into(),
            ),
            "AT" => SimReply::ok(""),
            _ => SimReply::Silent,
        });
        // Cut right after the first body line, which reads "OK".
        sim.set_chunk_limit(33);
        let conn = open(sim).await;

        let listing = exchange(conn.as_ref(), "AT+CMGL=\"ALL\"", &fast()).await;
        let listing = listing.into_result().unwrap();
        assert!(listing.contains("+CMGL: 2,"));
        assert!(listing.contains("hey"));

        let next = exchange(conn.as_ref(), "AT", &fast()).await.into_result().unwrap();
        assert!(!next.contains("+CMGL"));
        assert_eq!(final_code(&next), Some(ResultCode::Ok));
    }

    #[tokio::test]
    async fn test_stale_input_is_dropped_before_send() {
        let sim = SimulatedConnection::with_responder("SIM0", |line| {
            if line == "AT+CGMM" {
                SimReply::ok("K750i")
            } else {
                SimReply::Silent
            }
        });
        let conn = open(sim.clone()).await;
        sim.inject_rx(b"\r\nRING\r\n").await;

        let text = exchange(conn.as_ref(), "AT+CGMM", &fast()).await.into_result().unwrap();
        assert!(!text.contains("RING"));
        assert_eq!(payload("AT+CGMM", &text).as_deref(), Some("K750i"));
    }

    #[tokio::test]
    async fn test_blank_chunks_count_as_trials() {
        let sim = SimulatedConnection::with_responder("SIM0", |_| SimReply::Text("\r\n".into()));
        let conn = open(sim.clone()).await;
        let reply = exchange(conn.as_ref(), "AT", &fast()).await;
        assert!(matches!(reply, Reply::NoAnswer { .. }));
        assert_eq!(sim.recv_polls(), 5);
    }

    #[tokio::test]
    async fn test_failure_renders_placeholder() {
        let sim = SimulatedConnection::silent("SIM0");
        let conn = open(sim).await;
        conn.close().await.unwrap();
        let reply = exchange(conn.as_ref(), "AT", &fast()).await;
        assert!(reply.text().starts_with("<Exception: "));
        assert_eq!(reply.into_result().unwrap_err().kind, LinkErrorKind::IoError);
    }

    #[test]
    fn test_result_code_parse() {
        assert_eq!(ResultCode::parse(" ok "), ResultCode::Ok);
        assert_eq!(ResultCode::parse("+CME ERROR: 10"), ResultCode::CmeError("10".into()));
        assert_eq!(ResultCode::parse("+CMS ERROR: 500"), ResultCode::CmsError("500".into()));
        assert_eq!(ResultCode::parse("CONNECT 9600"), ResultCode::Connect("9600".into()));
        assert!(ResultCode::parse("+CME ERROR: 3").is_error());
        assert!(!ResultCode::parse("+CSQ: 10,0").is_final());
    }

    #[test]
    fn test_payload_lines_strip_echo_and_tags() {
        let reply = "AT+CNUM\r\n+CNUM: \"\",\"+4712345678\",145\r\n\r\nOK\r\n";
        assert_eq!(
            payload_lines("AT+CNUM", reply),
            vec!["\"\",\"+4712345678\",145".to_string()]
        );
        assert_eq!(payload("AT", "\r\nOK\r\n"), None);
    }
}
