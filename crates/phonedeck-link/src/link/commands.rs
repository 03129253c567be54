//! Command vocabulary.
//!
//! Every AT line the transport core sends comes from one [`CommandTable`].
//! Templates use `{placeholder}` substitution, so supporting another phone
//! family is a configuration change rather than a code change.

use crate::link::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Categories
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Kind of content stored on the phone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Pictures,
    Ringtones,
    Contacts,
    Todos,
    Events,
    Animations,
    Messages,
    Alarms,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Self::Pictures,
        Self::Ringtones,
        Self::Contacts,
        Self::Todos,
        Self::Events,
        Self::Animations,
        Self::Messages,
        Self::Alarms,
    ];

    /// Categories whose items are phone elements (files).
    pub const FILES: [Category; 6] = [
        Self::Pictures,
        Self::Ringtones,
        Self::Contacts,
        Self::Todos,
        Self::Events,
        Self::Animations,
    ];

    pub fn is_file_category(&self) -> bool {
        Self::FILES.contains(self)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pictures => "pictures",
            Self::Ringtones => "ringtones",
            Self::Contacts => "contacts",
            Self::Todos => "todos",
            Self::Events => "events",
            Self::Animations => "animations",
            Self::Messages => "messages",
            Self::Alarms => "alarms",
        };
        write!(f, "{}", s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Template groups
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Templates for one file-like category.
///
/// Placeholders: `{name}`, `{type}`, `{size}` for upload; `{id}` for
/// download and delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCommands {
    pub capability: String,
    pub list: String,
    pub upload: String,
    pub download: String,
    pub delete: String,
}

impl CategoryCommands {
    /// Default vendor templates for the given phone-side directory.
    pub fn for_directory(dir: &str) -> Self {
        Self {
            capability: format!("AT+ECAP=\"{}\"", dir),
            list: format!("AT+ELST=\"{}\"", dir),
            upload: format!("AT+EWRT=\"{}\",\"{{name}}\",\"{{type}}\",{{size}}", dir),
            download: "AT+EREAD={id}".to_string(),
            delete: "AT+EDEL={id}".to_string(),
        }
    }
}

/// Identification queries used by the port scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityCommands {
    #[serde(default = "default_identify")]
    pub identify: String,
    #[serde(default = "default_firmware")]
    pub firmware: String,
    #[serde(default = "default_phone_type")]
    pub phone_type: String,
    #[serde(default = "default_imei")]
    pub imei: String,
    #[serde(default = "default_subscriber")]
    pub subscriber: String,
}

fn default_identify() -> String {
    "AT".to_string()
}
fn default_firmware() -> String {
    "AT+CGMR".to_string()
}
fn default_phone_type() -> String {
    "AT+CGMM".to_string()
}
fn default_imei() -> String {
    "AT+CGSN".to_string()
}
fn default_subscriber() -> String {
    "AT+CNUM".to_string()
}

impl Default for IdentityCommands {
    fn default() -> Self {
        Self {
            identify: default_identify(),
            firmware: default_firmware(),
            phone_type: default_phone_type(),
            imei: default_imei(),
            subscriber: default_subscriber(),
        }
    }
}

/// Call control. `dial` takes `{mode}`, `{number}` and `{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialCommands {
    pub dial: String,
    pub hangup: String,
    pub answer: String,
    pub volume_up: String,
    pub volume_down: String,
    pub signal: String,
}

impl Default for DialCommands {
    fn default() -> Self {
        Self {
            dial: "ATD{mode}{number}{suffix}".to_string(),
            hangup: "ATH".to_string(),
            answer: "ATA".to_string(),
            volume_up: "AT+CKPD=\"U\"".to_string(),
            volume_down: "AT+CKPD=\"D\"".to_string(),
            signal: "AT+CSQ".to_string(),
        }
    }
}

/// SMS templates. `send` takes `{number}`; `read` and `delete` take `{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCommands {
    pub capability: String,
    pub list: String,
    pub read: String,
    pub send: String,
    pub delete: String,
}

impl Default for MessageCommands {
    fn default() -> Self {
        Self {
            capability: "AT+CPMS=?".to_string(),
            list: "AT+CMGL=\"ALL\"".to_string(),
            read: "AT+CMGR={id}".to_string(),
            send: "AT+CMGS=\"{number}\"".to_string(),
            delete: "AT+CMGD={id}".to_string(),
        }
    }
}

/// Alarm templates. `set` takes `{slot}`, `{date}`, `{time}`, `{days}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCommands {
    pub capability: String,
    pub list: String,
    pub set: String,
    pub delete: String,
}

impl Default for AlarmCommands {
    fn default() -> Self {
        Self {
            capability: "AT+CALA=?".to_string(),
            list: "AT+CALA?".to_string(),
            set: "AT+CALA={slot},\"{date}\",\"{time}\",\"{days}\"".to_string(),
            delete: "AT+CALD={slot}".to_string(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Command table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Complete command vocabulary for one phone family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTable {
    #[serde(default = "default_pictures")]
    pub pictures: CategoryCommands,
    #[serde(default = "default_ringtones")]
    pub ringtones: CategoryCommands,
    #[serde(default = "default_contacts")]
    pub contacts: CategoryCommands,
    #[serde(default = "default_todos")]
    pub todos: CategoryCommands,
    #[serde(default = "default_events")]
    pub events: CategoryCommands,
    #[serde(default = "default_animations")]
    pub animations: CategoryCommands,
    #[serde(default)]
    pub messages: MessageCommands,
    #[serde(default)]
    pub alarms: AlarmCommands,
    #[serde(default)]
    pub identity: IdentityCommands,
    #[serde(default)]
    pub call: DialCommands,
}

fn default_pictures() -> CategoryCommands {
    CategoryCommands::for_directory("pictures")
}
fn default_ringtones() -> CategoryCommands {
    CategoryCommands::for_directory("sounds")
}
fn default_contacts() -> CategoryCommands {
    CategoryCommands::for_directory("contacts")
}
fn default_todos() -> CategoryCommands {
    CategoryCommands::for_directory("todo")
}
fn default_events() -> CategoryCommands {
    CategoryCommands::for_directory("calendar")
}
fn default_animations() -> CategoryCommands {
    CategoryCommands::for_directory("animations")
}

impl Default for CommandTable {
    fn default() -> Self {
        Self {
            pictures: default_pictures(),
            ringtones: default_ringtones(),
            contacts: default_contacts(),
            todos: default_todos(),
            events: default_events(),
            animations: default_animations(),
            messages: MessageCommands::default(),
            alarms: AlarmCommands::default(),
            identity: IdentityCommands::default(),
            call: DialCommands::default(),
        }
    }
}

impl CommandTable {
    fn file_group(&self, category: Category) -> Option<&CategoryCommands> {
        match category {
            Category::Pictures => Some(&self.pictures),
            Category::Ringtones => Some(&self.ringtones),
            Category::Contacts => Some(&self.contacts),
            Category::Todos => Some(&self.todos),
            Category::Events => Some(&self.events),
            Category::Animations => Some(&self.animations),
            Category::Messages | Category::Alarms => None,
        }
    }

    /// Templates for a file category; messages and alarms have their own
    /// groups and are rejected here.
    pub fn files(&self, category: Category) -> LinkResult<&CategoryCommands> {
        self.file_group(category)
            .ok_or_else(|| LinkError::invalid(format!("{} is not a file category", category)))
    }

    pub fn capability(&self, category: Category) -> &str {
        match (category, self.file_group(category)) {
            (_, Some(group)) => &group.capability,
            (Category::Messages, None) => &self.messages.capability,
            (_, None) => &self.alarms.capability,
        }
    }

    pub fn list(&self, category: Category) -> &str {
        match (category, self.file_group(category)) {
            (_, Some(group)) => &group.list,
            (Category::Messages, None) => &self.messages.list,
            (_, None) => &self.alarms.list,
        }
    }
}

/// Substitute `{key}` placeholders in a template. Unknown placeholders are
/// left untouched.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_all() {
        let s = render("AT+CALA={slot},\"{date}\"", &[("slot", "2"), ("date", "24/01/01")]);
        assert_eq!(s, "AT+CALA=2,\"24/01/01\"");
    }

    #[test]
    fn test_render_leaves_unknown() {
        assert_eq!(render("ATD{number}{x}", &[("number", "555")]), "ATD555{x}");
    }

    #[test]
    fn test_default_file_templates() {
        let table = CommandTable::default();
        let pics = table.files(Category::Pictures).unwrap();
        assert_eq!(pics.list, "AT+ELST=\"pictures\"");
        let upload = render(&pics.upload, &[("name", "cat"), ("type", "JPEG"), ("size", "10")]);
        assert_eq!(upload, "AT+EWRT=\"pictures\",\"cat\",\"JPEG\",10");
        assert_eq!(table.list(Category::Ringtones), "AT+ELST=\"sounds\"");
    }

    #[test]
    fn test_non_file_categories() {
        let table = CommandTable::default();
        assert!(table.files(Category::Messages).is_err());
        assert_eq!(table.list(Category::Messages), "AT+CMGL=\"ALL\"");
        assert_eq!(table.list(Category::Alarms), "AT+CALA?");
        assert_eq!(table.capability(Category::Alarms), "AT+CALA=?");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{"identity":{"identify":"ATI"},"call":{"dial":"ATD{number};","hangup":"AT+CHUP","answer":"ATA","volumeUp":"AT+CLVL=9","volumeDown":"AT+CLVL=1","signal":"AT+CSQ"}}"#;
        let table: CommandTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.identity.identify, "ATI");
        assert_eq!(table.identity.imei, "AT+CGSN");
        assert_eq!(table.call.hangup, "AT+CHUP");
        assert_eq!(table.pictures, CategoryCommands::for_directory("pictures"));
    }

    #[test]
    fn test_file_category_flags() {
        assert!(Category::Events.is_file_category());
        assert!(!Category::Alarms.is_file_category());
        assert_eq!(Category::ALL.len(), 8);
    }
}
