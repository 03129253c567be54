//! Signal strength decoding (`+CSQ: <rssi>,<ber>`).

use crate::link::connection::PhoneConnection;
use crate::link::exchange::{exchange, RetryPolicy};
use crate::link::error::LinkResult;
use serde::{Deserialize, Serialize};

/// Reported when the phone does not know its signal level.
pub const SIGNAL_UNKNOWN: u8 = 99;

/// Decoded signal report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalQuality {
    /// 0 (worst) to 31 (best), or [`SIGNAL_UNKNOWN`].
    pub rssi: u8,
    pub ber: u8,
    pub dbm: Option<i32>,
    pub description: String,
}

impl SignalQuality {
    pub fn unknown() -> Self {
        Self::from_rssi(SIGNAL_UNKNOWN, SIGNAL_UNKNOWN)
    }

    pub fn from_rssi(rssi: u8, ber: u8) -> Self {
        let rssi = if rssi <= 31 { rssi } else { SIGNAL_UNKNOWN };
        Self {
            rssi,
            ber,
            dbm: rssi_to_dbm(rssi),
            description: rssi_description(rssi).to_string(),
        }
    }

    pub fn is_known(&self) -> bool {
        self.rssi != SIGNAL_UNKNOWN
    }
}

/// Extract `(rssi, ber)` from a `+CSQ` reply.
pub fn parse_signal_quality(response: &str) -> Option<(u8, u8)> {
    let re = regex::Regex::new(r"\+CSQ:\s*(\d+)\s*,\s*(\d+)").ok()?;
    let caps = re.captures(response)?;
    let rssi = caps.get(1)?.as_str().parse::<u8>().ok()?;
    let ber = caps.get(2)?.as_str().parse::<u8>().ok()?;
    Some((rssi, ber))
}

/// RSSI step to dBm.
pub fn rssi_to_dbm(rssi: u8) -> Option<i32> {
    match rssi {
        0 => Some(-113),
        1 => Some(-111),
        v @ 2..=30 => Some(-109 + (v as i32 - 2) * 2),
        31 => Some(-51),
        _ => None,
    }
}

pub fn rssi_description(rssi: u8) -> &'static str {
    match rssi {
        0..=9 => "Marginal",
        10..=14 => "OK",
        15..=19 => "Good",
        20..=30 => "Excellent",
        31 => "Maximum",
        _ => "Unknown",
    }
}

/// Ask the phone for its signal level. Anything other than a well-formed
/// report (no answer, garbage, out-of-range) decodes as unknown; only a
/// link failure is an error.
pub async fn signal_power(
    conn: &dyn PhoneConnection,
    command: &str,
    policy: &RetryPolicy,
) -> LinkResult<SignalQuality> {
    let reply = exchange(conn, command, policy).await;
    let text = match reply.into_result() {
        Ok(t) => t,
        Err(e) if e.is_no_answer() => return Ok(SignalQuality::unknown()),
        Err(e) => return Err(e),
    };
    Ok(match parse_signal_quality(&text) {
        Some((rssi, ber)) => SignalQuality::from_rssi(rssi, ber),
        None => {
            log::debug!("{}: unreadable signal reply {:?}", conn.device(), text.trim());
            SignalQuality::unknown()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_quality() {
        assert_eq!(parse_signal_quality("+CSQ: 21,99\r\nOK"), Some((21, 99)));
        assert_eq!(parse_signal_quality("+CSQ:7, 0"), Some((7, 0)));
        assert_eq!(parse_signal_quality("ERROR"), None);
    }

    #[test]
    fn test_rssi_to_dbm() {
        assert_eq!(rssi_to_dbm(0), Some(-113));
        assert_eq!(rssi_to_dbm(2), Some(-109));
        assert_eq!(rssi_to_dbm(31), Some(-51));
        assert_eq!(rssi_to_dbm(99), None);
    }

    #[test]
    fn test_out_of_range_is_unknown() {
        let q = SignalQuality::from_rssi(45, 0);
        assert_eq!(q.rssi, SIGNAL_UNKNOWN);
        assert!(!q.is_known());
        assert_eq!(q.description, "Unknown");
        assert_eq!(SignalQuality::from_rssi(17, 0).description, "Good");
    }
}
