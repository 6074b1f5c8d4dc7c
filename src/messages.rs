use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ChatError;

const MAX_TOPIC_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Chat,
    Announcement,
    File,
    Notification,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Chat => "chat",
            MessageKind::Announcement => "announcement",
            MessageKind::File => "file",
            MessageKind::Notification => "notification",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(MessageKind::Chat),
            "announcement" => Some(MessageKind::Announcement),
            "file" => Some(MessageKind::File),
            "notification" => Some(MessageKind::Notification),
            _ => None,
        }
    }
}

/// A chat line, announcement, file share or notification as exchanged with
/// clients and peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub sender: String,
    /// Always on the wire; public messages carry `""`.
    #[serde(default, deserialize_with = "non_blank", serialize_with = "blank_if_none")]
    pub recipient: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub topic: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "non_blank",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_name: Option<String>,
    #[serde(default, deserialize_with = "unix_seconds")]
    pub timestamp: i64,
}

impl Message {
    fn new(kind: MessageKind, sender: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            sender: sender.into(),
            recipient: None,
            topic: None,
            content: None,
            file_url: None,
            file_name: None,
            timestamp: 0,
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(MessageKind::Chat, sender)
        }
    }

    pub fn notification(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::new(MessageKind::Notification, sender)
        }
    }

    pub fn file(
        sender: impl Into<String>,
        file_url: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            file_url: Some(file_url.into()),
            file_name: Some(file_name.into()),
            ..Self::new(MessageKind::File, sender)
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    #[must_use]
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn validate(&self) -> Result<(), ChatError> {
        if self.sender.trim().is_empty() {
            return Err(ChatError::Invalid("message needs a sender".to_string()));
        }
        match self.kind {
            MessageKind::File => {
                if is_blank(self.file_url.as_deref()) {
                    return Err(ChatError::Invalid("file messages need a fileUrl".to_string()));
                }
            }
            _ => {
                if is_blank(self.content.as_deref()) {
                    return Err(ChatError::Invalid(
                        "message content must not be empty".to_string(),
                    ));
                }
            }
        }
        if let Some(topic) = &self.topic {
            validate_topic(topic)?;
        }
        Ok(())
    }

    /// Gives the message an id if it has none and sets the node's clock.
    pub fn stamp(&mut self, now: i64) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        self.timestamp = now;
    }

    /// Whether a session of `username` subscribed to `topics` should see
    /// this message.
    pub fn is_visible_to(&self, username: Option<&str>, topics: &HashSet<String>) -> bool {
        let broadcast_kind = matches!(
            self.kind,
            MessageKind::Announcement | MessageKind::Notification
        );
        if broadcast_kind && self.topic.is_none() {
            return true;
        }
        let is_sender = username.is_some_and(|name| name == self.sender);
        if let Some(recipient) = &self.recipient {
            return is_sender || username == Some(recipient.as_str());
        }
        if let Some(topic) = &self.topic {
            return is_sender || topics.contains(topic);
        }
        true
    }

    pub fn encode(&self) -> Result<String, ChatError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(data: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(data)?)
    }
}

/// One console line: `#topic sender -> recipient: text`.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(topic) = &self.topic {
            write!(f, "#{topic} ")?;
        }
        f.write_str(&self.sender)?;
        if let Some(recipient) = &self.recipient {
            write!(f, " -> {recipient}")?;
        }
        match (self.kind, &self.file_name, &self.file_url) {
            (MessageKind::File, name, Some(url)) => {
                write!(f, ": [{}] {url}", name.as_deref().unwrap_or("file"))
            }
            _ => write!(f, ": {}", self.content.as_deref().unwrap_or_default()),
        }
    }
}

pub fn now() -> i64 {
    Utc::now().timestamp()
}

pub fn validate_topic(topic: &str) -> Result<&str, ChatError> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(ChatError::MissingTopic);
    }
    if topic.len() > MAX_TOPIC_LEN || topic.chars().any(char::is_whitespace) {
        return Err(ChatError::Invalid(format!("invalid topic {topic:?}")));
    }
    Ok(topic)
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|s| s.trim().is_empty())
}

#[allow(clippy::ref_option)]
fn blank_if_none<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value.as_deref().unwrap_or_default())
}

fn non_blank<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

// Browsers send `new Date()`, which serializes as an RFC 3339 string.
#[allow(clippy::cast_possible_truncation)]
fn unix_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(i64),
        Fractional(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(0),
        Some(Raw::Seconds(secs)) => Ok(secs),
        Some(Raw::Fractional(secs)) => Ok(secs as i64),
        Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|ts| ts.timestamp())
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_browser_payload() {
        let raw = r#"{
            "type": "chat",
            "sender": "alice",
            "recipient": "",
            "timestamp": "2024-05-01T12:00:00.000Z",
            "content": "hi bob"
        }"#;
        let msg = Message::decode(raw).unwrap();
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(msg.recipient, None);
        assert_eq!(msg.content.as_deref(), Some("hi bob"));
        assert_eq!(msg.timestamp, 1_714_564_800);
    }

    #[test]
    fn encodes_wire_names_and_skips_absent_fields() {
        let msg = Message::file("alice", "/uploads/a.gif", "cat.gif");
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["fileUrl"], "/uploads/a.gif");
        assert_eq!(json["fileName"], "cat.gif");
        assert!(json.get("content").is_none());
        assert!(json.get("topic").is_none());
    }

    #[test]
    fn public_messages_carry_an_empty_recipient() {
        let public = Message::chat("peer2", "hi all");
        let json: serde_json::Value = serde_json::from_str(&public.encode().unwrap()).unwrap();
        assert_eq!(json["recipient"], "");

        let direct = Message::chat("peer2", "hi bob").with_recipient("bob");
        let json: serde_json::Value = serde_json::from_str(&direct.encode().unwrap()).unwrap();
        assert_eq!(json["recipient"], "bob");

        let back = Message::decode(&public.encode().unwrap()).unwrap();
        assert_eq!(back.recipient, None);
    }

    #[test]
    fn rejects_unknown_kind_and_bad_timestamp() {
        assert!(Message::decode(r#"{"type":"shout","sender":"a","content":"x"}"#).is_err());
        assert!(
            Message::decode(r#"{"type":"chat","sender":"a","content":"x","timestamp":"soon"}"#)
                .is_err()
        );
    }

    #[test]
    fn empty_content_is_invalid() {
        let blank = Message::decode(r#"{"type":"chat","sender":"a","content":"   "}"#).unwrap();
        assert!(matches!(blank.validate(), Err(ChatError::Invalid(_))));

        let file = Message::decode(r#"{"type":"file","sender":"a"}"#).unwrap();
        assert!(file.validate().is_err());

        let anonymous = Message::chat("", "hello");
        assert!(anonymous.validate().is_err());

        let spaces = Message::chat("a", "   ");
        assert!(matches!(spaces.validate(), Err(ChatError::Invalid(_))));
        assert!(Message::file("a", "", "x.gif").validate().is_err());
        assert!(Message::file("a", " ", "x.gif").validate().is_err());

        assert!(Message::chat("a", "hello").validate().is_ok());
    }

    #[test]
    fn stamp_keeps_existing_id() {
        let mut msg = Message::chat("a", "hello");
        msg.stamp(10);
        let id = msg.id.clone();
        assert!(!id.is_empty());
        msg.stamp(20);
        assert_eq!(msg.id, id);
        assert_eq!(msg.timestamp, 20);
    }

    #[test]
    fn visibility_follows_recipient_then_topic() {
        let none = HashSet::new();
        let rust: HashSet<String> = ["rust".to_string()].into();

        let direct = Message::chat("alice", "psst").with_recipient("bob");
        assert!(direct.is_visible_to(Some("alice"), &none));
        assert!(direct.is_visible_to(Some("bob"), &none));
        assert!(!direct.is_visible_to(Some("carol"), &rust));
        assert!(!direct.is_visible_to(None, &none));

        let topical = Message::chat("alice", "borrowck").with_topic("rust");
        assert!(topical.is_visible_to(Some("alice"), &none));
        assert!(topical.is_visible_to(Some("bob"), &rust));
        assert!(!topical.is_visible_to(Some("carol"), &none));

        let open = Message::notification("node", "bob joined");
        assert!(open.is_visible_to(None, &none));
    }

    #[test]
    fn untopical_announcements_reach_everyone() {
        let none = HashSet::new();
        let rust: HashSet<String> = ["rust".to_string()].into();

        let mut notice = Message::chat("alice", "maintenance at noon").with_recipient("bob");
        notice.kind = MessageKind::Announcement;
        assert!(notice.is_visible_to(Some("carol"), &none));
        assert!(notice.is_visible_to(None, &none));

        let mut scoped = Message::chat("alice", "rust meetup").with_topic("rust");
        scoped.kind = MessageKind::Announcement;
        assert!(scoped.is_visible_to(Some("bob"), &rust));
        assert!(!scoped.is_visible_to(Some("carol"), &none));
    }

    #[test]
    fn renders_console_lines() {
        let topical = Message::chat("alice", "borrowck").with_topic("rust");
        assert_eq!(topical.to_string(), "#rust alice: borrowck");

        let direct = Message::chat("alice", "psst").with_recipient("bob");
        assert_eq!(direct.to_string(), "alice -> bob: psst");

        let file = Message::file("bob", "/uploads/x.gif", "cat.gif");
        assert_eq!(file.to_string(), "bob: [cat.gif] /uploads/x.gif");
    }

    #[test]
    fn topic_rules() {
        assert_eq!(validate_topic("  rust ").unwrap(), "rust");
        assert!(matches!(validate_topic(" "), Err(ChatError::MissingTopic)));
        assert!(validate_topic("two words").is_err());
        assert!(validate_topic(&"x".repeat(65)).is_err());
    }
}
