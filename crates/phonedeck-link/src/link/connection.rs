//! Serial connection abstraction.
//!
//! A [`PhoneConnection`] is one opened device handle: raw byte send and
//! receive, control lines, and a count of bytes waiting. Handles are created
//! by a [`ConnectionFactory`] so the transport core never names a concrete
//! backend. The real backend wraps the `serialport` crate and moves every
//! blocking call onto the tokio blocking pool.

use crate::link::error::{LinkError, LinkResult};
use crate::link::types::*;
use serialport::SerialPort;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Connection trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One opened device handle.
///
/// Implementations must be `Send + Sync` so they can be held behind an
/// `Arc` and used from multiple async tasks; callers serialise use through
/// the gate.
#[async_trait::async_trait]
pub trait PhoneConnection: Send + Sync {
    /// Device this handle was opened on.
    fn device(&self) -> &str;

    /// Write all bytes.
    async fn send(&self, bytes: &[u8]) -> LinkResult<()>;

    /// Return whatever arrives within `window`, possibly nothing.
    async fn recv(&self, window: Duration) -> LinkResult<Vec<u8>>;

    /// Bytes ready to read without blocking.
    async fn available_bytes(&self) -> LinkResult<usize>;

    /// Snapshot of all six control lines.
    async fn control_lines(&self) -> LinkResult<ControlLines>;

    async fn set_rts(&self, on: bool) -> LinkResult<()>;

    async fn set_dtr(&self, on: bool) -> LinkResult<()>;

    /// Release the device. Calling it twice is harmless.
    async fn close(&self) -> LinkResult<()>;

    fn is_open(&self) -> bool;

    async fn rts(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.rts)
    }

    async fn dtr(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.dtr)
    }

    async fn cts(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.cts)
    }

    async fn dsr(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.dsr)
    }

    async fn cd(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.dcd)
    }

    async fn ri(&self) -> LinkResult<bool> {
        Ok(self.control_lines().await?.ri)
    }
}

/// Opens connections and lists the devices worth probing.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Claim the device named in `params`. Fails with `ConnectionError` when
    /// it is busy, missing, or cannot take the requested settings.
    async fn open(&self, params: &ConnectionParameters) -> LinkResult<Arc<dyn PhoneConnection>>;

    /// Candidate device names for a port scan.
    fn candidate_devices(&self) -> Vec<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Text encoding
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// ISO-8859-1 encode. Characters above U+00FF become `?`.
pub fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u32 as u8 } else { b'?' })
        .collect()
}

/// ISO-8859-1 decode. Every byte maps to one char, so this cannot fail.
pub fn decode_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Traffic tracing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Format bytes as a hex dump (offset, hex, printable column).
pub fn hex_dump(data: &[u8]) -> String {
    let mut output = String::new();
    for (i, chunk) in data.chunks(16).enumerate() {
        output.push_str(&format!("{:08X}  ", i * 16));
        for (j, byte) in chunk.iter().enumerate() {
            output.push_str(&format!("{:02X} ", byte));
            if j == 7 {
                output.push(' ');
            }
        }
        for j in chunk.len()..16 {
            output.push_str("   ");
            if j == 7 {
                output.push(' ');
            }
        }
        output.push_str(" |");
        for byte in chunk {
            if byte.is_ascii_graphic() || *byte == b' ' {
                output.push(*byte as char);
            } else {
                output.push('.');
            }
        }
        output.push_str("|\n");
    }
    output
}

pub(crate) fn trace_traffic(device: &str, direction: &str, bytes: &[u8]) {
    if !bytes.is_empty() && log::log_enabled!(log::Level::Trace) {
        log::trace!("{} {} {} bytes\n{}", device, direction, bytes.len(), hex_dump(bytes));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  serialport backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;

/// Connection backed by an OS serial device.
pub struct SerialPortConnection {
    device: String,
    port: SharedPort,
    open: AtomicBool,
    // The OS cannot report output lines back, so they are tracked here.
    rts: AtomicBool,
    dtr: AtomicBool,
}

impl SerialPortConnection {
    fn new(device: String, port: Box<dyn SerialPort>) -> Self {
        Self {
            device,
            port: Arc::new(Mutex::new(Some(port))),
            open: AtomicBool::new(true),
            rts: AtomicBool::new(true),
            dtr: AtomicBool::new(true),
        }
    }

    /// Run `f` against the port on the blocking pool.
    async fn with_port<T, F>(&self, f: F) -> LinkResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn SerialPort) -> LinkResult<T> + Send + 'static,
    {
        let port = Arc::clone(&self.port);
        let device = self.device.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut guard = port
                .lock()
                .map_err(|_| LinkError::io("port mutex poisoned"))?;
            match guard.as_mut() {
                Some(p) => f(p.as_mut()),
                None => Err(LinkError::io("port is closed")),
            }
        })
        .await;
        match joined {
            Ok(res) => res.map_err(|e| e.with_port(device)),
            Err(e) => Err(LinkError::io(format!("blocking task failed: {}", e)).with_port(device)),
        }
    }
}

#[async_trait::async_trait]
impl PhoneConnection for SerialPortConnection {
    fn device(&self) -> &str {
        &self.device
    }

    async fn send(&self, bytes: &[u8]) -> LinkResult<()> {
        trace_traffic(&self.device, "TX", bytes);
        let data = bytes.to_vec();
        self.with_port(move |p| {
            p.write_all(&data)?;
            p.flush()?;
            Ok(())
        })
        .await
    }

    async fn recv(&self, window: Duration) -> LinkResult<Vec<u8>> {
        let data = self
            .with_port(move |p| {
                p.set_timeout(window)?;
                let mut buf = vec![0u8; 4096];
                match p.read(&mut buf) {
                    Ok(n) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        trace_traffic(&self.device, "RX", &data);
        Ok(data)
    }

    async fn available_bytes(&self) -> LinkResult<usize> {
        self.with_port(|p| Ok(p.bytes_to_read()? as usize)).await
    }

    async fn control_lines(&self) -> LinkResult<ControlLines> {
        let rts = self.rts.load(Ordering::SeqCst);
        let dtr = self.dtr.load(Ordering::SeqCst);
        self.with_port(move |p| {
            Ok(ControlLines {
                rts,
                dtr,
                cts: p.read_clear_to_send()?,
                dsr: p.read_data_set_ready()?,
                dcd: p.read_carrier_detect()?,
                ri: p.read_ring_indicator()?,
            })
        })
        .await
    }

    async fn set_rts(&self, on: bool) -> LinkResult<()> {
        self.with_port(move |p| Ok(p.write_request_to_send(on)?)).await?;
        self.rts.store(on, Ordering::SeqCst);
        Ok(())
    }

    async fn set_dtr(&self, on: bool) -> LinkResult<()> {
        self.with_port(move |p| Ok(p.write_data_terminal_ready(on)?)).await?;
        self.dtr.store(on, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> LinkResult<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let port = Arc::clone(&self.port);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = port.lock() {
                guard.take();
            }
        })
        .await;
        log::debug!("closed {}", self.device);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Opens [`SerialPortConnection`]s.
#[derive(Debug, Clone)]
pub struct SerialPortFactory {
    /// Timeout used for the initial open and any read not given its own
    /// window.
    pub read_timeout: Duration,
}

impl SerialPortFactory {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialPortFactory {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

fn to_serialport_settings(
    params: &ConnectionParameters,
) -> LinkResult<(
    serialport::DataBits,
    serialport::StopBits,
    serialport::Parity,
    serialport::FlowControl,
)> {
    let data_bits = match params.data_bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    };
    let stop_bits = match params.stop_bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
        StopBits::OnePointFive => {
            return Err(LinkError::connection("1.5 stop bits are not supported by this backend"))
        }
    };
    let parity = match params.parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Space | Parity::Mark => {
            return Err(LinkError::connection(format!(
                "{:?} parity is not supported by this backend",
                params.parity
            )))
        }
    };
    // With both bits set, hardware handshaking wins.
    let flow = if params.flow_control.hardware {
        serialport::FlowControl::Hardware
    } else if params.flow_control.software {
        serialport::FlowControl::Software
    } else {
        serialport::FlowControl::None
    };
    Ok((data_bits, stop_bits, parity, flow))
}

#[async_trait::async_trait]
impl ConnectionFactory for SerialPortFactory {
    async fn open(&self, params: &ConnectionParameters) -> LinkResult<Arc<dyn PhoneConnection>> {
        let (data_bits, stop_bits, parity, flow) =
            to_serialport_settings(params).map_err(|e| e.with_port(&params.device))?;
        let device = params.device.clone();
        let baud = params.baud_rate.value();
        let timeout = self.read_timeout;

        let path = device.clone();
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(path, baud)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .flow_control(flow)
                .timeout(timeout)
                .open()
        })
        .await
        .map_err(|e| LinkError::connection(format!("open task failed: {}", e)))?;

        let port = opened.map_err(|e| {
            LinkError::connection(format!("cannot open: {}", e)).with_port(&device)
        })?;
        log::info!("opened {} at {}", device, params.shorthand());
        Ok(Arc::new(SerialPortConnection::new(device, port)))
    }

    fn candidate_devices(&self) -> Vec<String> {
        crate::link::scanner::enumerate_candidates()
    }
}
