use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, registry::SessionId};

pub const MIN_USERNAME_CHARS: usize = 2;
pub const MIN_BODY_CHARS: usize = 2;
pub const MAX_BODY_CHARS: usize = 500;

/// A chat message accepted by the relay.
///
/// Built only through [`Message::new`] (or decoding, which validates the
/// same way), so every value in circulation satisfies the length limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    message_id: u64,
    username: String,
    body: String,
    #[serde(with = "timestamp_format")]
    timestamp: NaiveDateTime,
}

impl Message {
    /// Creates a message stamped with the current local time.
    pub fn new(
        message_id: u64,
        username: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let now = Local::now().naive_local();
        Self::with_timestamp(message_id, username, body, now)
    }

    /// Creates a message with an explicit timestamp, truncated to whole
    /// seconds to match the wire format.
    pub fn with_timestamp(
        message_id: u64,
        username: impl Into<String>,
        body: impl Into<String>,
        timestamp: NaiveDateTime,
    ) -> Result<Self, ValidationError> {
        let message = Self {
            message_id,
            username: username.into(),
            body: body.into(),
            timestamp: timestamp.trunc_subsecs(0),
        };
        message.validate()?;
        Ok(message)
    }

    pub fn id(&self) -> u64 {
        self.message_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        validate_username(&self.username)?;
        validate_body(&self.body)
    }
}

pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    let chars = username.trim().chars().count();
    if chars < MIN_USERNAME_CHARS {
        return Err(ValidationError::UsernameTooShort(chars));
    }
    Ok(())
}

pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    match body.chars().count() {
        n if n < MIN_BODY_CHARS => Err(ValidationError::BodyTooShort(n)),
        n if n > MAX_BODY_CHARS => Err(ValidationError::BodyTooLong(n)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { username: String },
    Chat { body: String },
    Quit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session_id: SessionId,
        username: String,
    },
    Roster {
        participants: Vec<String>,
    },
    Message(Message),
    Joined {
        username: String,
    },
    Left {
        username: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(kind: ErrorKind, message: impl ToString) -> Self {
        Self::Error {
            kind,
            message: message.to_string(),
        }
    }
}

/// Category carried by an error frame so clients can react without
/// parsing the human-readable text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Malformed,
    Validation,
    Protocol,
    ProtocolAbuse,
    DuplicateUsername,
    HandshakeTimeout,
    ShuttingDown,
}

mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(timestamp: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&timestamp.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_limits_are_inclusive() {
        assert_eq!(validate_body("a"), Err(ValidationError::BodyTooShort(1)));
        assert!(validate_body("ab").is_ok());
        assert!(validate_body(&"x".repeat(MAX_BODY_CHARS)).is_ok());
        assert_eq!(
            validate_body(&"x".repeat(MAX_BODY_CHARS + 1)),
            Err(ValidationError::BodyTooLong(MAX_BODY_CHARS + 1))
        );
    }

    #[test]
    fn body_length_counts_characters_not_bytes() {
        // 500 multi-byte characters are still within the limit.
        assert!(validate_body(&"é".repeat(MAX_BODY_CHARS)).is_ok());
    }

    #[test]
    fn username_is_trimmed_before_counting() {
        assert_eq!(
            validate_username(" a "),
            Err(ValidationError::UsernameTooShort(1))
        );
        assert!(validate_username("al").is_ok());
    }

    #[test]
    fn new_message_has_whole_second_timestamp() {
        use chrono::Timelike;

        let message = Message::new(1, "alice", "hello").expect("valid message");
        assert_eq!(message.timestamp().nanosecond(), 0);
    }

    #[test]
    fn control_frames_use_type_tag() {
        let quit = serde_json::to_string(&ClientFrame::Quit).unwrap();
        assert_eq!(quit, r#"{"type":"quit"}"#);

        let join: ClientFrame =
            serde_json::from_str(r#"{"type":"join","username":"alice"}"#).unwrap();
        assert_eq!(
            join,
            ClientFrame::Join {
                username: "alice".into()
            }
        );
    }

    #[test]
    fn message_frame_flattens_record_fields() {
        let timestamp =
            NaiveDateTime::parse_from_str("2024-05-01 12:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let message = Message::with_timestamp(7, "alice", "hi there", timestamp).unwrap();
        let value = serde_json::to_value(ServerFrame::Message(message)).unwrap();

        assert_eq!(value["type"], "message");
        assert_eq!(value["message_id"], 7);
        assert_eq!(value["username"], "alice");
        assert_eq!(value["body"], "hi there");
        assert_eq!(value["timestamp"], "2024-05-01 12:30:00");
    }
}
