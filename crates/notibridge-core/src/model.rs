//! Device and notification data model.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Android `Notification.FLAG_ONGOING_EVENT`.
pub const FLAG_ONGOING_EVENT: i64 = 0x2;
/// Android `Notification.FLAG_FOREGROUND_SERVICE`.
pub const FLAG_FOREGROUND_SERVICE: i64 = 0x40;
/// Android `Notification.FLAG_GROUP_SUMMARY`.
pub const FLAG_GROUP_SUMMARY: i64 = 0x200;

/// Returns the current time as unix milliseconds.
#[allow(clippy::cast_possible_truncation)]
pub fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A paired companion device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub uuid: String,
    #[serde(default)]
    pub hostname: String,
    /// Where the device's socket server listens (`ws://`, `wss://` or `tcp://`).
    pub endpoint: String,
    /// Bearer token issued by the device; `None` until authorized.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub last_used_at: i64,
}

const fn enabled_default() -> bool {
    true
}

impl Device {
    /// Create an enabled device stamped with the current time.
    pub fn new(
        uuid: impl Into<String>,
        hostname: impl Into<String>,
        endpoint: impl Into<String>,
        token: Option<String>,
    ) -> Self {
        let now = unix_timestamp_ms();
        Self {
            uuid: uuid.into(),
            hostname: hostname.into(),
            endpoint: endpoint.into(),
            token,
            enabled: true,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Whether the device holds a usable login token.
    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Lifecycle action carried by a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Init,
    Posted,
    Removed,
    /// Anything the device sends that this build does not know about.
    #[serde(other)]
    Unknown,
}

/// Identity key of a notification: `(packageName, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub package_name: String,
    pub id: String,
}

/// A mirrored notification.
///
/// Only identity, timestamp and the fields read by the built-in filter rules
/// are typed; everything else the device sends is kept in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default)]
    pub package_name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
    #[serde(default, alias = "postTime")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, alias = "isOngoing")]
    pub ongoing: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, alias = "isGroupSummary")]
    pub group_summary: bool,
    #[serde(default)]
    pub foreground_service: bool,
    #[serde(default)]
    pub flags: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Notification {
    /// Minimal notification, mostly useful for hosts and tests.
    pub fn new(package_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            id: id.into(),
            action: None,
            timestamp: 0,
            title: None,
            text: None,
            ongoing: false,
            priority: 0,
            category: None,
            group_summary: false,
            foreground_service: false,
            flags: 0,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }

    #[must_use]
    pub fn with_content(mut self, title: &str, text: &str) -> Self {
        self.title = Some(title.to_string());
        self.text = Some(text.to_string());
        self
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            package_name: self.package_name.clone(),
            id: self.id.clone(),
        }
    }

    pub fn matches_key(&self, key: &IdentityKey) -> bool {
        self.package_name == key.package_name && self.id == key.id
    }

    pub const fn is_ongoing(&self) -> bool {
        self.ongoing || self.flags & FLAG_ONGOING_EVENT != 0
    }

    pub const fn is_foreground_service(&self) -> bool {
        self.foreground_service || self.flags & FLAG_FOREGROUND_SERVICE != 0
    }

    pub const fn is_group_summary(&self) -> bool {
        self.group_summary || self.flags & FLAG_GROUP_SUMMARY != 0
    }

    /// True when neither title nor text carries visible characters.
    pub fn is_empty_content(&self) -> bool {
        let blank = |s: &Option<String>| s.as_deref().is_none_or(|v| v.trim().is_empty());
        blank(&self.title) && blank(&self.text)
    }
}

/// Android ids are ints, some device builds send them as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "notification id must be a string or number, got {other}"
        ))),
    }
}
