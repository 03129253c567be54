//! Port discovery.
//!
//! Lists candidate serial devices and probes each one for an answering
//! phone. Devices that never answer are left out of the report; they are
//! not errors.

use crate::link::commands::IdentityCommands;
use crate::link::connection::PhoneConnection;
use crate::link::exchange::{exchange, payload, RetryPolicy};
use crate::link::gate::GateGuard;
use crate::link::types::*;
use serde::{Deserialize, Serialize};
use std::time::Instant;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Candidate enumeration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rough hardware class of a device, guessed from its name or reported by
/// the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortKind {
    UsbSerial,
    Bluetooth,
    Native,
    Virtual,
    Unknown,
}

/// One device worth probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePort {
    pub name: String,
    pub kind: PortKind,
}

/// Classify a device name.
pub fn classify_port(port_name: &str) -> PortKind {
    let lower = port_name.to_lowercase();
    if lower.contains("usb") || lower.contains("acm") {
        PortKind::UsbSerial
    } else if lower.contains("bluetooth") || lower.contains("rfcomm") || lower.contains("bth") {
        PortKind::Bluetooth
    } else if lower.contains("pts") || lower.contains("pty") || lower.contains("pseudo") {
        PortKind::Virtual
    } else if lower.starts_with("com") || lower.starts_with("/dev/ttys") {
        PortKind::Native
    } else {
        PortKind::Unknown
    }
}

/// Conventional device names for this platform, used when the OS listing
/// is unavailable.
#[cfg(target_os = "windows")]
pub fn fallback_candidates() -> Vec<String> {
    (1..=16).map(|i| format!("COM{}", i)).collect()
}

#[cfg(not(target_os = "windows"))]
pub fn fallback_candidates() -> Vec<String> {
    let mut ports = Vec::new();
    for i in 0..8 {
        ports.push(format!("/dev/ttyACM{}", i));
    }
    for i in 0..8 {
        ports.push(format!("/dev/ttyUSB{}", i));
    }
    for i in 0..4 {
        ports.push(format!("/dev/rfcomm{}", i));
    }
    for i in 0..4 {
        ports.push(format!("/dev/ttyS{}", i));
    }
    ports
}

/// Devices reported by the OS, with their kind.
pub fn list_ports() -> Vec<CandidatePort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| {
                let kind = match &p.port_type {
                    serialport::SerialPortType::UsbPort(_) => PortKind::UsbSerial,
                    serialport::SerialPortType::BluetoothPort => PortKind::Bluetooth,
                    serialport::SerialPortType::PciPort => PortKind::Native,
                    serialport::SerialPortType::Unknown => classify_port(&p.port_name),
                };
                CandidatePort {
                    name: p.port_name,
                    kind,
                }
            })
            .collect(),
        Err(e) => {
            log::warn!("listing serial ports failed: {}", e);
            Vec::new()
        }
    }
}

/// Candidate device names, most phone-like first.
pub fn enumerate_candidates() -> Vec<String> {
    let mut ports = list_ports();
    if ports.is_empty() {
        ports = fallback_candidates()
            .into_iter()
            .map(|name| CandidatePort {
                kind: classify_port(&name),
                name,
            })
            .collect();
    }
    // Stable: keeps OS order within a kind.
    ports.sort_by_key(|p| p.kind);
    ports.into_iter().map(|p| p.name).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Probe
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull the number out of a `+CNUM` payload (`"<alpha>","<number>",<type>`).
pub fn subscriber_number(payload: &str) -> String {
    regex::Regex::new(r#""[^"]*"\s*,\s*"([^"]*)""#)
        .ok()
        .and_then(|re| re.captures(payload).and_then(|c| c.get(1)))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| payload.trim().to_string())
}

async fn query(conn: &dyn PhoneConnection, command: &str, policy: &RetryPolicy) -> Option<String> {
    let reply = exchange(conn, command, policy).await;
    let text = reply.into_result().ok()?;
    payload(command, &text)
}

/// Identify one open device. `None` when it does not answer.
pub async fn identify(
    conn: &dyn PhoneConnection,
    commands: &IdentityCommands,
    policy: &RetryPolicy,
) -> Option<PortMetadata> {
    let reply = exchange(conn, &commands.identify, policy).await;
    if !reply.is_answered() {
        return None;
    }
    Some(PortMetadata {
        firmware: query(conn, &commands.firmware, policy).await,
        phone_type: query(conn, &commands.phone_type, policy).await,
        imei: query(conn, &commands.imei, policy).await,
        subscriber_number: query(conn, &commands.subscriber, policy)
            .await
            .map(|p| subscriber_number(&p)),
    })
}

/// Probe every candidate while holding the gate. Each device is opened with
/// `params` (device swapped in), identified, and closed before the next;
/// `progress` fires once per candidate whatever the outcome.
pub async fn scan(
    guard: &mut GateGuard,
    params: &ConnectionParameters,
    candidates: &[String],
    commands: &IdentityCommands,
    policy: &RetryPolicy,
    progress: &(dyn Fn(ScanProgress) + Send + Sync),
) -> ScanReport {
    let started = Instant::now();
    let mut report = ScanReport {
        scanned: candidates.len(),
        ..Default::default()
    };

    for (i, device) in candidates.iter().enumerate() {
        let answered = match guard.connect(&params.for_device(device.as_str())).await {
            Ok(conn) => match identify(conn.as_ref(), commands, policy).await {
                Some(meta) => {
                    log::info!("phone answered on {}", device);
                    report.active.push(device.clone());
                    report.metadata.insert(device.clone(), meta);
                    true
                }
                None => false,
            },
            Err(e) => {
                log::debug!("skipping {}: {}", device, e);
                false
            }
        };
        guard.release().await;
        progress(ScanProgress {
            device: device.clone(),
            index: i + 1,
            total: candidates.len(),
            answered,
        });
    }

    report.scan_time_ms = started.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_port() {
        assert_eq!(classify_port("/dev/ttyACM0"), PortKind::UsbSerial);
        assert_eq!(classify_port("/dev/ttyUSB1"), PortKind::UsbSerial);
        assert_eq!(classify_port("/dev/rfcomm0"), PortKind::Bluetooth);
        assert_eq!(classify_port("/dev/pts/3"), PortKind::Virtual);
        assert_eq!(classify_port("COM3"), PortKind::Native);
        assert_eq!(classify_port("/dev/weird"), PortKind::Unknown);
    }

    #[test]
    fn test_kind_ordering_prefers_phones() {
        assert!(PortKind::UsbSerial < PortKind::Bluetooth);
        assert!(PortKind::Bluetooth < PortKind::Native);
    }

    #[test]
    fn test_fallback_candidates_not_empty() {
        assert!(!fallback_candidates().is_empty());
    }

    #[test]
    fn test_subscriber_number() {
        assert_eq!(subscriber_number("\"\",\"+4712345678\",145"), "+4712345678");
        assert_eq!(subscriber_number("12345"), "12345");
    }
}
