//! In-memory phone for tests and offline demos.
//!
//! A [`SimulatedConnection`] splits transmitted bytes into command lines
//! (terminated by CR or Ctrl-Z) and hands each line to a scripted responder
//! whose reply is queued for the next receive. Every send is recorded so
//! tests can assert wire order, and receive polls are counted so retry
//! budgets can be checked exactly.

use crate::link::connection::{decode_text, ConnectionFactory, PhoneConnection};
use crate::link::error::{LinkError, LinkResult};
use crate::link::types::*;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// What the simulated phone does with one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimReply {
    /// Say nothing.
    Silent,
    /// Queue text (ISO-8859-1 encoded).
    Text(String),
    /// Queue raw bytes.
    Bytes(Vec<u8>),
    /// Swallow the next `bytes` transmitted bytes as file content, then
    /// queue `then`.
    AcceptRaw { bytes: usize, then: String },
}

impl SimReply {
    pub fn ok(payload: &str) -> Self {
        if payload.is_empty() {
            Self::Text("\r\nOK\r\n".to_string())
        } else {
            Self::Text(format!("\r\n{}\r\n\r\nOK\r\n", payload))
        }
    }
}

pub type Responder = Box<dyn Fn(&str) -> SimReply + Send + Sync>;

#[derive(Debug, Default)]
struct RawCapture {
    remaining: usize,
    then: String,
}

/// Scripted in-memory device.
pub struct SimulatedConnection {
    device: String,
    open: AtomicBool,
    responder: Responder,
    rx_buf: Mutex<VecDeque<u8>>,
    rx_notify: Notify,
    pending_line: Mutex<Vec<u8>>,
    raw: Mutex<RawCapture>,
    raw_received: Mutex<Vec<u8>>,
    sends: Mutex<Vec<Vec<u8>>>,
    lines_seen: Mutex<Vec<String>>,
    control_lines: Mutex<ControlLines>,
    last_params: Mutex<Option<ConnectionParameters>>,
    recv_polls: AtomicUsize,
    open_count: AtomicUsize,
    chunk_limit: AtomicUsize,
}

impl SimulatedConnection {
    /// A device that never answers.
    pub fn silent(device: impl Into<String>) -> Arc<Self> {
        Self::with_responder(device, |_| SimReply::Silent)
    }

    pub fn with_responder<F>(device: impl Into<String>, responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> SimReply + Send + Sync + 'static,
    {
        Arc::new(Self {
            device: device.into(),
            open: AtomicBool::new(false),
            responder: Box::new(responder),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            rx_notify: Notify::new(),
            pending_line: Mutex::new(Vec::new()),
            raw: Mutex::new(RawCapture::default()),
            raw_received: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            lines_seen: Mutex::new(Vec::new()),
            control_lines: Mutex::new(ControlLines::default()),
            last_params: Mutex::new(None),
            recv_polls: AtomicUsize::new(0),
            open_count: AtomicUsize::new(0),
            chunk_limit: AtomicUsize::new(usize::MAX),
        })
    }

    /// Cap the bytes returned by a single receive, to split replies.
    pub fn set_chunk_limit(&self, limit: usize) {
        self.chunk_limit.store(limit.max(1), Ordering::SeqCst);
    }

    /// Queue bytes as if the phone had sent them unprompted.
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drive the phone-side lines (CTS, DSR, DCD, RI).
    pub async fn set_phone_lines(&self, edit: impl FnOnce(&mut ControlLines)) {
        let mut cl = self.control_lines.lock().await;
        edit(&mut cl);
    }

    /// Every `send` call in order.
    pub async fn sends(&self) -> Vec<Vec<u8>> {
        self.sends.lock().await.clone()
    }

    /// Every command line the responder saw, in order.
    pub async fn lines_seen(&self) -> Vec<String> {
        self.lines_seen.lock().await.clone()
    }

    /// Bytes swallowed by `AcceptRaw`.
    pub async fn raw_received(&self) -> Vec<u8> {
        self.raw_received.lock().await.clone()
    }

    pub async fn last_params(&self) -> Option<ConnectionParameters> {
        self.last_params.lock().await.clone()
    }

    pub fn recv_polls(&self) -> usize {
        self.recv_polls.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    async fn claim(&self, params: &ConnectionParameters) -> LinkResult<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(LinkError::connection("device busy").with_port(&self.device));
        }
        self.open_count.fetch_add(1, Ordering::SeqCst);
        *self.last_params.lock().await = Some(params.clone());
        self.rx_buf.lock().await.clear();
        self.pending_line.lock().await.clear();
        let mut cl = self.control_lines.lock().await;
        cl.rts = true;
        cl.dtr = true;
        cl.dsr = true;
        cl.cts = true;
        Ok(())
    }

    async fn queue_reply(&self, reply: SimReply) {
        match reply {
            SimReply::Silent => {}
            SimReply::Text(text) => {
                self.inject_rx(&crate::link::connection::encode_text(&text)).await
            }
            SimReply::Bytes(bytes) => self.inject_rx(&bytes).await,
            SimReply::AcceptRaw { bytes, then } => {
                if bytes == 0 {
                    self.inject_rx(&crate::link::connection::encode_text(&then)).await;
                } else {
                    *self.raw.lock().await = RawCapture {
                        remaining: bytes,
                        then,
                    };
                }
            }
        }
    }

    async fn feed(&self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            // Raw capture takes priority over line splitting.
            let finished_raw = {
                let mut raw = self.raw.lock().await;
                if raw.remaining > 0 {
                    let n = raw.remaining.min(bytes.len());
                    self.raw_received.lock().await.extend_from_slice(&bytes[..n]);
                    bytes = &bytes[n..];
                    raw.remaining -= n;
                    if raw.remaining == 0 {
                        Some(std::mem::take(&mut raw.then))
                    } else {
                        continue;
                    }
                } else {
                    None
                }
            };
            if let Some(then) = finished_raw {
                self.inject_rx(&crate::link::connection::encode_text(&then)).await;
                continue;
            }

            let byte = bytes[0];
            bytes = &bytes[1..];
            if byte == b'\r' || byte == 0x1A {
                let line = {
                    let mut pending = self.pending_line.lock().await;
                    decode_text(&std::mem::take(&mut *pending))
                };
                let line = line.trim_start_matches('\n').to_string();
                self.lines_seen.lock().await.push(line.clone());
                let reply = (self.responder)(&line);
                self.queue_reply(reply).await;
            } else {
                self.pending_line.lock().await.push(byte);
            }
        }
    }
}

#[async_trait::async_trait]
impl PhoneConnection for SimulatedConnection {
    fn device(&self) -> &str {
        &self.device
    }

    async fn send(&self, bytes: &[u8]) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::io("port is closed").with_port(&self.device));
        }
        self.sends.lock().await.push(bytes.to_vec());
        self.feed(bytes).await;
        Ok(())
    }

    async fn recv(&self, window: Duration) -> LinkResult<Vec<u8>> {
        if !self.is_open() {
            return Err(LinkError::io("port is closed").with_port(&self.device));
        }
        self.recv_polls.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(window) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = rx.len().min(self.chunk_limit.load(Ordering::SeqCst));
        Ok(rx.drain(..count).collect())
    }

    async fn available_bytes(&self) -> LinkResult<usize> {
        Ok(self.rx_buf.lock().await.len())
    }

    async fn control_lines(&self) -> LinkResult<ControlLines> {
        if !self.is_open() {
            return Err(LinkError::io("port is closed").with_port(&self.device));
        }
        Ok(*self.control_lines.lock().await)
    }

    async fn set_rts(&self, on: bool) -> LinkResult<()> {
        self.control_lines.lock().await.rts = on;
        Ok(())
    }

    async fn set_dtr(&self, on: bool) -> LinkResult<()> {
        self.control_lines.lock().await.dtr = on;
        Ok(())
    }

    async fn close(&self) -> LinkResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            *self.control_lines.lock().await = ControlLines::default();
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Factory over a fixed set of simulated devices.
#[derive(Default)]
pub struct SimulatedFactory {
    devices: std::sync::RwLock<BTreeMap<String, Arc<SimulatedConnection>>>,
}

impl SimulatedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<SimulatedConnection>) {
        if let Ok(mut map) = self.devices.write() {
            map.insert(conn.device.clone(), conn);
        }
    }

    pub fn get(&self, device: &str) -> Option<Arc<SimulatedConnection>> {
        self.devices.read().ok()?.get(device).cloned()
    }
}

#[async_trait::async_trait]
impl ConnectionFactory for SimulatedFactory {
    async fn open(&self, params: &ConnectionParameters) -> LinkResult<Arc<dyn PhoneConnection>> {
        let conn = self.get(&params.device).ok_or_else(|| {
            LinkError::connection("no such device").with_port(&params.device)
        })?;
        conn.claim(params).await?;
        Ok(conn)
    }

    fn candidate_devices(&self) -> Vec<String> {
        self.devices
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_ok() -> Arc<SimulatedConnection> {
        SimulatedConnection::with_responder("SIM0", |line| {
            if line == "AT" {
                SimReply::ok("")
            } else {
                SimReply::Silent
            }
        })
    }

    #[tokio::test]
    async fn test_open_close_cycle() {
        let factory = SimulatedFactory::new();
        let conn = echo_ok();
        factory.add(conn.clone());

        let params = ConnectionParameters::new("SIM0");
        let handle = factory.open(&params).await.unwrap();
        assert!(handle.is_open());
        assert!(factory.open(&params).await.is_err(), "second open must be busy");
        handle.close().await.unwrap();
        handle.close().await.unwrap();
        assert!(!handle.is_open());
        assert!(factory.open(&params).await.is_ok());
        assert_eq!(conn.open_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_device() {
        let factory = SimulatedFactory::new();
        let err = match factory.open(&ConnectionParameters::new("NOPE")).await {
            Ok(_) => panic!("missing device opened"),
            Err(e) => e,
        };
        assert_eq!(err.kind, crate::link::error::LinkErrorKind::ConnectionError);
    }

    #[tokio::test]
    async fn test_responder_reply_is_received() {
        let conn = echo_ok();
        conn.claim(&ConnectionParameters::new("SIM0")).await.unwrap();
        conn.send(b"AT\r").await.unwrap();
        let reply = conn.recv(Duration::from_millis(10)).await.unwrap();
        assert_eq!(decode_text(&reply), "\r\nOK\r\n");
        assert_eq!(conn.lines_seen().await, vec!["AT".to_string()]);
    }

    #[tokio::test]
    async fn test_closed_send_is_io_error() {
        let conn = echo_ok();
        let err = conn.send(b"AT\r").await.unwrap_err();
        assert_eq!(err.kind, crate::link::error::LinkErrorKind::IoError);
    }

    #[tokio::test]
    async fn test_chunk_limit_splits_reply() {
        let conn = echo_ok();
        conn.claim(&ConnectionParameters::new("SIM0")).await.unwrap();
        conn.set_chunk_limit(2);
        conn.send(b"AT\r").await.unwrap();
        let first = conn.recv(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(conn.available_bytes().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_accept_raw_captures_content() {
        let conn = SimulatedConnection::with_responder("SIM1", |line| {
            if line.starts_with("AT+EWRT") {
                SimReply::AcceptRaw {
                    bytes: 5,
                    then: "\r\nOK\r\n".to_string(),
                }
            } else {
                SimReply::Silent
            }
        });
        conn.claim(&ConnectionParameters::new("SIM1")).await.unwrap();
        conn.send(b"AT+EWRT=\"x\"\r").await.unwrap();
        conn.send(b"ab\rcd").await.unwrap();
        assert_eq!(conn.raw_received().await, b"ab\rcd".to_vec());
        assert_eq!(conn.available_bytes().await.unwrap(), 6);
        assert_eq!(conn.lines_seen().await.len(), 1);
    }

    #[tokio::test]
    async fn test_control_lines_follow_open() {
        let conn = echo_ok();
        conn.claim(&ConnectionParameters::new("SIM0")).await.unwrap();
        conn.set_phone_lines(|l| l.ri = true).await;
        conn.set_rts(false).await.unwrap();
        let lines = conn.control_lines().await.unwrap();
        assert!(lines.ri && lines.dsr && !lines.rts);
        assert!(conn.ri().await.unwrap());
    }
}
