//! Alarm slots.

use crate::link::error::{LinkError, LinkResult};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One alarm slot. Date, time and days are editable before upload; two
/// alarms are the same alarm when they share a slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "AlarmFields")]
pub struct PhoneAlarm {
    slot: u32,
    pub date: String,
    pub time: String,
    /// Days-of-week string as the phone reports it (e.g. `1,2,3,4,5`).
    pub days: String,
}

impl PhoneAlarm {
    /// Slots are 1-based.
    pub fn new(
        slot: u32,
        date: impl Into<String>,
        time: impl Into<String>,
        days: impl Into<String>,
    ) -> LinkResult<Self> {
        if slot == 0 {
            return Err(LinkError::invalid("alarm slots start at 1"));
        }
        Ok(Self {
            slot,
            date: date.into(),
            time: time.into(),
            days: days.into(),
        })
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// Wire shape of [`PhoneAlarm`], checked through [`PhoneAlarm::new`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlarmFields {
    slot: u32,
    date: String,
    time: String,
    #[serde(default)]
    days: String,
}

impl TryFrom<AlarmFields> for PhoneAlarm {
    type Error = LinkError;

    fn try_from(f: AlarmFields) -> LinkResult<Self> {
        PhoneAlarm::new(f.slot, f.date, f.time, f.days)
    }
}

impl PartialEq for PhoneAlarm {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl Eq for PhoneAlarm {}

impl std::hash::Hash for PhoneAlarm {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

/// Parse `+CALA: <slot>,"<date>","<time>","<days>"`.
pub fn parse_alarm_line(line: &str) -> Option<PhoneAlarm> {
    let re = Regex::new(r#"^\+CALA:\s*(\d+)\s*,\s*"([^"]*)"\s*,\s*"([^"]*)"\s*(?:,\s*"([^"]*)")?"#)
        .ok()?;
    let caps = re.captures(line.trim())?;
    let slot = caps.get(1)?.as_str().parse::<u32>().ok()?;
    PhoneAlarm::new(
        slot,
        caps.get(2)?.as_str(),
        caps.get(3)?.as_str(),
        caps.get(4).map(|m| m.as_str()).unwrap_or(""),
    )
    .ok()
}

/// Parse an alarm listing, skipping malformed lines.
pub fn parse_alarm_list(reply: &str) -> Vec<PhoneAlarm> {
    reply
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("+CALA"))
        .filter_map(|l| {
            let parsed = parse_alarm_line(l);
            if parsed.is_none() {
                log::debug!("skipping malformed alarm line: {}", l);
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_checks_slot() {
        let alarm: PhoneAlarm =
            serde_json::from_str(r#"{"slot":2,"date":"","time":"06:30","days":"1,2"}"#).unwrap();
        assert_eq!(alarm.slot(), 2);
        assert_eq!(alarm.days, "1,2");
        assert!(serde_json::from_str::<PhoneAlarm>(r#"{"slot":0,"date":"","time":"06:30"}"#).is_err());
    }

    #[test]
    fn test_slot_zero_rejected() {
        assert!(PhoneAlarm::new(0, "", "07:00", "").is_err());
        assert_eq!(PhoneAlarm::new(1, "", "07:00", "").unwrap().slot(), 1);
    }

    #[test]
    fn test_identity_is_slot() {
        let a = PhoneAlarm::new(2, "24/01/01", "07:00", "1,2").unwrap();
        let mut b = a.clone();
        b.time = "08:30".to_string();
        b.days.clear();
        assert_eq!(a, b);
        assert_ne!(a, PhoneAlarm::new(3, "24/01/01", "07:00", "1,2").unwrap());
    }

    #[test]
    fn test_parse_alarm_list() {
        let reply = "+CALA: 1,\"24/03/01\",\"06:45\",\"1,2,3,4,5\"\r\n\
                     +CALA: x,\"\",\"\"\r\n\
                     +CALA: 2,\"\",\"09:00\"\r\n\
                     OK\r\n";
        let alarms = parse_alarm_list(reply);
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].days, "1,2,3,4,5");
        assert_eq!(alarms[1].slot(), 2);
        assert_eq!(alarms[1].days, "");
    }
}
