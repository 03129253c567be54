//! Phone elements: remote file-like items (pictures, ringtones, cards, …).

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One remote content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneElement {
    /// Opaque phone-side identifier.
    pub id: String,
    /// Short type code such as `JPEG` or `VCRD`.
    pub type_code: Option<String>,
    /// Display name as reported by the phone.
    pub name: String,
}

impl PhoneElement {
    pub fn new(id: impl Into<String>, type_code: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_code: type_code.map(str::to_string),
            name: name.into(),
        }
    }

    pub fn extension(&self) -> String {
        derive_extension(self.type_code.as_deref())
    }

    pub fn filename(&self) -> String {
        derive_filename(&self.name)
    }

    /// `<filename>.<extension>`, or just the filename when there is no
    /// extension.
    pub fn local_file_name(&self) -> String {
        let ext = self.extension();
        if ext.is_empty() {
            self.filename()
        } else {
            format!("{}.{}", self.filename(), ext)
        }
    }
}

/// Map a phone type code to a filesystem extension.
pub fn derive_extension(type_code: Option<&str>) -> String {
    let code = match type_code {
        Some(c) => c,
        None => return String::new(),
    };
    let mapped = match code {
        "FGIF" => "gif",
        "JPEG" => "jpg",
        "MIDI" => "mid",
        "VCRD" => "vcf",
        "VCAL" => "ics",
        "WBMP" => "wbm",
        "TIFF" => "tif",
        "PICT" => "pct",
        "SVGZ" => "svz",
        "AIFF" => "aif",
        "MPEG" => "mpg",
        "EMS_GR" => "emg",
        "ASG1" => "as1",
        "ASG2" => "as2",
        "EMS_AN" => "ema",
        "MJPG" => "mjp",
        "3GP2" | "3GPP" => "3gp",
        other => return other.to_lowercase(),
    };
    mapped.to_string()
}

/// Type code to announce for a local file, from its extension. Unknown
/// extensions are upper-cased verbatim.
pub fn type_code_for_extension(ext: &str) -> String {
    let lower = ext.trim_start_matches('.').to_lowercase();
    let code = match lower.as_str() {
        "gif" => "FGIF",
        "jpg" | "jpeg" => "JPEG",
        "mid" | "midi" => "MIDI",
        "vcf" => "VCRD",
        "ics" | "vcs" => "VCAL",
        "wbm" | "wbmp" => "WBMP",
        "tif" | "tiff" => "TIFF",
        "pct" => "PICT",
        "svz" => "SVGZ",
        "aif" | "aiff" => "AIFF",
        "mpg" | "mpeg" => "MPEG",
        "emg" => "EMS_GR",
        "as1" => "ASG1",
        "as2" => "ASG2",
        "ema" => "EMS_AN",
        "mjp" => "MJPG",
        "3gp" => "3GPP",
        _ => return lower.to_uppercase(),
    };
    code.to_string()
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`, one for one.
pub fn derive_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse one list line of the shape `+TAG: <id>,"<type>","<name>"`.
pub fn parse_element_line(line: &str) -> Option<PhoneElement> {
    let re = Regex::new(r#"^\+\w+:\s*([^,\s]+)\s*,\s*"([^"]*)"\s*,\s*"([^"]*)""#).ok()?;
    let caps = re.captures(line.trim())?;
    let type_code = caps.get(2)?.as_str();
    Some(PhoneElement {
        id: caps.get(1)?.as_str().trim_matches('"').to_string(),
        type_code: if type_code.is_empty() {
            None
        } else {
            Some(type_code.to_string())
        },
        name: caps.get(3)?.as_str().to_string(),
    })
}

/// Parse a list reply. Result codes and echo are ignored; malformed entry
/// lines are logged and skipped.
pub fn parse_element_list(reply: &str) -> Vec<PhoneElement> {
    let mut out = Vec::new();
    for line in reply.lines().map(str::trim).filter(|l| l.starts_with('+')) {
        match parse_element_line(line) {
            Some(el) => out.push(el),
            None => log::debug!("skipping malformed element line: {}", line),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_table() {
        let table = [
            ("FGIF", "gif"),
            ("JPEG", "jpg"),
            ("MIDI", "mid"),
            ("VCRD", "vcf"),
            ("VCAL", "ics"),
            ("WBMP", "wbm"),
            ("TIFF", "tif"),
            ("PICT", "pct"),
            ("SVGZ", "svz"),
            ("AIFF", "aif"),
            ("MPEG", "mpg"),
            ("EMS_GR", "emg"),
            ("ASG1", "as1"),
            ("ASG2", "as2"),
            ("EMS_AN", "ema"),
            ("MJPG", "mjp"),
            ("3GP2", "3gp"),
            ("3GPP", "3gp"),
        ];
        for (code, ext) in table {
            assert_eq!(derive_extension(Some(code)), ext, "code {}", code);
        }
    }

    #[test]
    fn test_extension_unknown_and_absent() {
        assert_eq!(derive_extension(Some("testString")), "teststring");
        assert_eq!(derive_extension(None), "");
    }

    #[test]
    fn test_filename_sanitising() {
        assert_eq!(derive_filename("a b.c,d"), "a_b_c_d");
        assert_eq!(derive_filename("v:w;x\"y'<z>?/"), "v_w_x_y__z___");
        assert_eq!(derive_filename("ok_name-1"), "ok_name-1");
    }

    #[test]
    fn test_filename_preserves_char_count() {
        let name = "Ölfeld 2.jpg";
        assert_eq!(derive_filename(name).chars().count(), name.chars().count());
    }

    #[test]
    fn test_type_code_for_extension() {
        assert_eq!(type_code_for_extension("jpg"), "JPEG");
        assert_eq!(type_code_for_extension(".MID"), "MIDI");
        assert_eq!(type_code_for_extension("png"), "PNG");
        assert_eq!(derive_extension(Some(&type_code_for_extension("vcf"))), "vcf");
    }

    #[test]
    fn test_local_file_name() {
        let el = PhoneElement::new("3", Some("JPEG"), "my cat");
        assert_eq!(el.local_file_name(), "my_cat.jpg");
        let bare = PhoneElement::new("4", None, "notes");
        assert_eq!(bare.local_file_name(), "notes");
    }

    #[test]
    fn test_parse_element_list_skips_malformed() {
        let reply = "AT+ELST=\"pictures\"\r\n\
                     +ELST: 1,\"JPEG\",\"Holiday\"\r\n\
                     +ELST: broken\r\n\
                     +ELST: 7,\"\",\"Untyped\"\r\n\
                     OK\r\n";
        let list = parse_element_list(reply);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], PhoneElement::new("1", Some("JPEG"), "Holiday"));
        assert_eq!(list[1].type_code, None);
        assert_eq!(list[1].id, "7");
    }
}
