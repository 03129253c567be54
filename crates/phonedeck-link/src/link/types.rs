//! Shared types for the phone link crate.
//!
//! Covers connection parameters, live (user-editable) settings, control
//! line state, and per-port scan metadata.

use crate::link::error::{LinkError, LinkResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port Configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Supported baud rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    Baud1200,
    Baud2400,
    Baud4800,
    Baud9600,
    Baud19200,
    Baud38400,
    Baud57600,
    Baud115200,
    Baud230400,
    Baud460800,
    Baud500000,
    Baud576000,
    Baud921600,
    Baud1000000,
    Baud1152000,
    Baud1500000,
    Baud2000000,
    Baud2500000,
    Baud3000000,
    Baud3500000,
    Baud4000000,
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::Baud115200
    }
}

impl BaudRate {
    pub const ALL: [BaudRate; 21] = [
        Self::Baud1200,
        Self::Baud2400,
        Self::Baud4800,
        Self::Baud9600,
        Self::Baud19200,
        Self::Baud38400,
        Self::Baud57600,
        Self::Baud115200,
        Self::Baud230400,
        Self::Baud460800,
        Self::Baud500000,
        Self::Baud576000,
        Self::Baud921600,
        Self::Baud1000000,
        Self::Baud1152000,
        Self::Baud1500000,
        Self::Baud2000000,
        Self::Baud2500000,
        Self::Baud3000000,
        Self::Baud3500000,
        Self::Baud4000000,
    ];

    /// Numeric value of the baud rate.
    pub fn value(&self) -> u32 {
        match self {
            Self::Baud1200 => 1200,
            Self::Baud2400 => 2400,
            Self::Baud4800 => 4800,
            Self::Baud9600 => 9600,
            Self::Baud19200 => 19200,
            Self::Baud38400 => 38400,
            Self::Baud57600 => 57600,
            Self::Baud115200 => 115200,
            Self::Baud230400 => 230400,
            Self::Baud460800 => 460800,
            Self::Baud500000 => 500000,
            Self::Baud576000 => 576000,
            Self::Baud921600 => 921600,
            Self::Baud1000000 => 1000000,
            Self::Baud1152000 => 1152000,
            Self::Baud1500000 => 1500000,
            Self::Baud2000000 => 2000000,
            Self::Baud2500000 => 2500000,
            Self::Baud3000000 => 3000000,
            Self::Baud3500000 => 3500000,
            Self::Baud4000000 => 4000000,
        }
    }

    /// Look up a rate in the allowed set.
    pub fn from_value(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.value() == v)
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = LinkError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        Self::from_value(v).ok_or_else(|| LinkError::invalid(format!("unsupported baud rate {}", v)))
    }
}

impl From<BaudRate> for u32 {
    fn from(b: BaudRate) -> u32 {
        b.value()
    }
}

impl std::fmt::Display for BaudRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataBits {
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
}

impl Default for DataBits {
    fn default() -> Self {
        Self::Eight
    }
}

impl DataBits {
    pub fn value(&self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    pub fn from_value(v: u8) -> Option<Self> {
        match v {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        Self::One
    }
}

impl StopBits {
    pub fn label(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        }
    }

    /// Parse the label shown in the settings form ("1", "1.5", "2").
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "1" => Some(Self::One),
            "1.5" => Some(Self::OnePointFive),
            "2" => Some(Self::Two),
            _ => None,
        }
    }
}

/// Parity checking mode, ordered by its form ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Parity {
    None,
    Even,
    Odd,
    Space,
    Mark,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

impl Parity {
    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "N",
            Self::Even => "E",
            Self::Odd => "O",
            Self::Space => "S",
            Self::Mark => "M",
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Even => 1,
            Self::Odd => 2,
            Self::Space => 3,
            Self::Mark => 4,
        }
    }

    pub fn from_ordinal(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Even),
            2 => Some(Self::Odd),
            3 => Some(Self::Space),
            4 => Some(Self::Mark),
            _ => None,
        }
    }
}

/// Flow control bitmask: bit 0 is XON/XOFF, bit 1 is RTS/CTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowControl {
    pub software: bool,
    pub hardware: bool,
}

impl FlowControl {
    pub const SOFTWARE_BIT: u8 = 0b01;
    pub const HARDWARE_BIT: u8 = 0b10;

    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits > (Self::SOFTWARE_BIT | Self::HARDWARE_BIT) {
            return None;
        }
        Some(Self {
            software: bits & Self::SOFTWARE_BIT != 0,
            hardware: bits & Self::HARDWARE_BIT != 0,
        })
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0;
        if self.software {
            bits |= Self::SOFTWARE_BIT;
        }
        if self.hardware {
            bits |= Self::HARDWARE_BIT;
        }
        bits
    }
}

/// Immutable connection parameter snapshot for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParameters {
    /// Device name (e.g. `COM3`, `/dev/ttyACM0`).
    pub device: String,

    #[serde(default)]
    pub baud_rate: BaudRate,

    #[serde(default)]
    pub data_bits: DataBits,

    #[serde(default)]
    pub stop_bits: StopBits,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default)]
    pub flow_control: FlowControl,
}

impl ConnectionParameters {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            baud_rate: BaudRate::default(),
            data_bits: DataBits::default(),
            stop_bits: StopBits::default(),
            parity: Parity::default(),
            flow_control: FlowControl::default(),
        }
    }

    /// Build parameters from raw form values, rejecting anything outside
    /// the allowed sets.
    pub fn from_raw(
        device: &str,
        baud: u32,
        data_bits: u8,
        stop_bits: &str,
        parity: u8,
        flow: u8,
    ) -> LinkResult<Self> {
        if device.trim().is_empty() {
            return Err(LinkError::invalid("no device selected"));
        }
        let baud_rate = BaudRate::try_from(baud)?;
        let data_bits = DataBits::from_value(data_bits)
            .ok_or_else(|| LinkError::invalid(format!("unsupported data bits {}", data_bits)))?;
        let stop_bits = StopBits::from_label(stop_bits)
            .ok_or_else(|| LinkError::invalid(format!("unsupported stop bits '{}'", stop_bits)))?;
        let parity = Parity::from_ordinal(parity)
            .ok_or_else(|| LinkError::invalid(format!("unsupported parity ordinal {}", parity)))?;
        let flow_control = FlowControl::from_bits(flow)
            .ok_or_else(|| LinkError::invalid(format!("unsupported flow control mask {}", flow)))?;
        Ok(Self {
            device: device.trim().to_string(),
            baud_rate,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        })
    }

    /// Same settings, different device. Used by the port scan.
    pub fn for_device(&self, device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..self.clone()
        }
    }

    /// Shorthand notation (e.g. "115200-8N1").
    pub fn shorthand(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.baud_rate.value(),
            self.data_bits.value(),
            self.parity.label(),
            self.stop_bits.label()
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Live settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// User-editable connection settings.
///
/// Background work never reads this directly; it receives the owned value
/// returned by [`LiveSettings::snapshot`] at dispatch time.
#[derive(Debug)]
pub struct LiveSettings {
    current: RwLock<ConnectionParameters>,
}

impl LiveSettings {
    pub fn new(initial: ConnectionParameters) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Owned copy of the settings as they are right now.
    pub fn snapshot(&self) -> ConnectionParameters {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply an edit from the settings form.
    pub fn update(&self, edit: impl FnOnce(&mut ConnectionParameters)) {
        match self.current.write() {
            Ok(mut guard) => edit(&mut guard),
            Err(poisoned) => edit(&mut poisoned.into_inner()),
        }
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self::new(ConnectionParameters::new(String::new()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Control lines
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// RS-232 control line state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlLines {
    /// Request To Send (host driven).
    pub rts: bool,
    /// Data Terminal Ready (host driven).
    pub dtr: bool,
    /// Clear To Send (phone driven).
    pub cts: bool,
    /// Data Set Ready (phone driven).
    pub dsr: bool,
    /// Data Carrier Detect (phone driven).
    pub dcd: bool,
    /// Ring Indicator (phone driven).
    pub ri: bool,
}

/// One sample taken by the line monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineStatus {
    pub device: String,
    pub lines: ControlLines,
    pub available_bytes: usize,
    pub sampled_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Port scan results
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identification data collected from a device that answered the scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMetadata {
    pub firmware: Option<String>,
    pub phone_type: Option<String>,
    pub imei: Option<String>,
    pub subscriber_number: Option<String>,
}

/// Result of one port scan. Always replaces the previous scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Devices that answered identification, in probe order.
    pub active: Vec<String>,
    /// Metadata keyed by device; only answering devices appear.
    pub metadata: BTreeMap<String, PortMetadata>,
    pub scanned: usize,
    pub scan_time_ms: u64,
}

impl ScanReport {
    pub fn is_active(&self, device: &str) -> bool {
        self.active.iter().any(|d| d == device)
    }
}

/// Progress tick emitted once per scanned candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub device: String,
    /// 1-based position of this candidate.
    pub index: usize,
    pub total: usize,
    pub answered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rate_value_roundtrip() {
        for rate in BaudRate::ALL {
            assert_eq!(BaudRate::from_value(rate.value()), Some(rate));
        }
        assert_eq!(BaudRate::from_value(14400), None);
    }

    #[test]
    fn test_baud_rate_serde_as_number() {
        let json = serde_json::to_string(&BaudRate::Baud921600).unwrap();
        assert_eq!(json, "921600");
        let back: BaudRate = serde_json::from_str("4000000").unwrap();
        assert_eq!(back, BaudRate::Baud4000000);
        assert!(serde_json::from_str::<BaudRate>("300").is_err());
    }

    #[test]
    fn test_parity_ordinals() {
        for v in 0..=4 {
            assert_eq!(Parity::from_ordinal(v).unwrap().ordinal(), v);
        }
        assert_eq!(Parity::from_ordinal(1), Some(Parity::Even));
        assert_eq!(Parity::from_ordinal(5), None);
    }

    #[test]
    fn test_flow_control_bits() {
        assert_eq!(FlowControl::from_bits(0), Some(FlowControl::none()));
        let both = FlowControl::from_bits(3).unwrap();
        assert!(both.software && both.hardware);
        assert_eq!(FlowControl::from_bits(2).unwrap().bits(), 2);
        assert_eq!(FlowControl::from_bits(4), None);
    }

    #[test]
    fn test_from_raw_valid() {
        let p = ConnectionParameters::from_raw("/dev/ttyACM0", 57600, 7, "1.5", 2, 1).unwrap();
        assert_eq!(p.baud_rate, BaudRate::Baud57600);
        assert_eq!(p.data_bits, DataBits::Seven);
        assert_eq!(p.stop_bits, StopBits::OnePointFive);
        assert_eq!(p.parity, Parity::Odd);
        assert!(p.flow_control.software);
        assert_eq!(p.shorthand(), "57600-7O1.5");
    }

    #[test]
    fn test_from_raw_rejects_out_of_set() {
        assert!(ConnectionParameters::from_raw("COM1", 14400, 8, "1", 0, 0).is_err());
        assert!(ConnectionParameters::from_raw("COM1", 9600, 9, "1", 0, 0).is_err());
        assert!(ConnectionParameters::from_raw("COM1", 9600, 8, "3", 0, 0).is_err());
        assert!(ConnectionParameters::from_raw("COM1", 9600, 8, "1", 7, 0).is_err());
        assert!(ConnectionParameters::from_raw("COM1", 9600, 8, "1", 0, 9).is_err());
        assert!(ConnectionParameters::from_raw("  ", 9600, 8, "1", 0, 0).is_err());
    }

    #[test]
    fn test_for_device_keeps_settings() {
        let p = ConnectionParameters::from_raw("COM1", 9600, 8, "2", 1, 2).unwrap();
        let q = p.for_device("COM4");
        assert_eq!(q.device, "COM4");
        assert_eq!(q.shorthand(), p.shorthand());
        assert_eq!(q.flow_control, p.flow_control);
    }

    #[test]
    fn test_live_settings_snapshot_is_detached() {
        let live = LiveSettings::new(ConnectionParameters::new("COM1"));
        let snap = live.snapshot();
        live.update(|p| {
            p.device = "COM9".to_string();
            p.baud_rate = BaudRate::Baud9600;
        });
        assert_eq!(snap.device, "COM1");
        assert_eq!(snap.baud_rate, BaudRate::Baud115200);
        assert_eq!(live.snapshot().device, "COM9");
    }

    #[test]
    fn test_serde_parameters_roundtrip() {
        let p = ConnectionParameters::from_raw("COM3", 460800, 8, "1", 0, 2).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"baudRate\":460800"));
        let back: ConnectionParameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_scan_report_is_active() {
        let report = ScanReport {
            active: vec!["COM3".to_string()],
            ..Default::default()
        };
        assert!(report.is_active("COM3"));
        assert!(!report.is_active("COM4"));
    }
}
