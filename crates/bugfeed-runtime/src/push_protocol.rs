//! Wire format of the bug update push service.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Close code of an intentional, orderly shutdown. Anything else reconnects.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Something changed on `bug_id` at `when`.
    Update { bug_id: u64, when: DateTime<Utc> },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed push message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("push message `{command}` is missing `{field}`")]
    MissingField {
        command: String,
        field: &'static str,
    },
    #[error("push message has invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    command: String,
    #[serde(default)]
    bug: Option<u64>,
    #[serde(default)]
    when: Option<RawTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    EpochMillis(i64),
    Text(String),
}

impl RawTimestamp {
    fn resolve(self) -> Result<DateTime<Utc>, ProtocolError> {
        match self {
            Self::EpochMillis(millis) => Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| ProtocolError::InvalidTimestamp(millis.to_string())),
            Self::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .map(|time| time.with_timezone(&Utc))
                .map_err(|_| ProtocolError::InvalidTimestamp(text)),
        }
    }
}

/// Parses one inbound frame.
///
/// `Ok(None)` means a well-formed message with a command this client does not
/// act on.
pub fn parse_inbound_message(raw: &str) -> Result<Option<InboundMessage>, ProtocolError> {
    let message = serde_json::from_str::<RawInbound>(raw)?;
    if message.command != "update" {
        return Ok(None);
    }
    let bug_id = message.bug.ok_or_else(|| ProtocolError::MissingField {
        command: message.command.clone(),
        field: "bug",
    })?;
    let when = message
        .when
        .ok_or_else(|| ProtocolError::MissingField {
            command: message.command.clone(),
            field: "when",
        })?
        .resolve()?;
    Ok(Some(InboundMessage::Update { bug_id, when }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", content = "bugs", rename_all = "lowercase")]
pub enum OutboundCommand {
    Subscribe(Vec<u64>),
    Unsubscribe(Vec<u64>),
}

impl OutboundCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
        }
    }

    pub fn bug_ids(&self) -> &[u64] {
        match self {
            Self::Subscribe(ids) | Self::Unsubscribe(ids) => ids,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "command": self.as_str(),
            "bugs": self.bug_ids(),
        })
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use super::{parse_inbound_message, InboundMessage, OutboundCommand, ProtocolError};

    #[test]
    fn unit_parse_update_accepts_rfc3339_and_epoch_millis() {
        let text = parse_inbound_message(
            r#"{"command":"update","bug":42,"when":"2014-09-12T10:00:00Z"}"#,
        )
        .expect("parse")
        .expect("update");
        let expected = Utc
            .with_ymd_and_hms(2014, 9, 12, 10, 0, 0)
            .single()
            .expect("time");
        assert_eq!(
            text,
            InboundMessage::Update {
                bug_id: 42,
                when: expected
            }
        );

        let millis = parse_inbound_message(&format!(
            r#"{{"command":"update","bug":42,"when":{}}}"#,
            expected.timestamp_millis()
        ))
        .expect("parse")
        .expect("update");
        assert_eq!(millis, text);
    }

    #[test]
    fn functional_unknown_commands_are_ignored() {
        assert_eq!(
            parse_inbound_message(r#"{"command":"version","version":2}"#).expect("parse"),
            None
        );
    }

    #[test]
    fn regression_malformed_updates_are_errors() {
        assert!(matches!(
            parse_inbound_message("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            parse_inbound_message(r#"{"command":"update","when":"2014-09-12T10:00:00Z"}"#),
            Err(ProtocolError::MissingField { field: "bug", .. })
        ));
        assert!(matches!(
            parse_inbound_message(r#"{"command":"update","bug":1,"when":"yesterday"}"#),
            Err(ProtocolError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn unit_outbound_commands_render_wire_shape() {
        let subscribe = OutboundCommand::Subscribe(vec![10, 20]);
        assert_eq!(
            subscribe.to_value(),
            json!({"command": "subscribe", "bugs": [10, 20]})
        );
        assert_eq!(
            serde_json::to_value(&subscribe).expect("serialize"),
            subscribe.to_value()
        );
        let unsubscribe = OutboundCommand::Unsubscribe(vec![7]);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&unsubscribe.to_json()).expect("json"),
            json!({"command": "unsubscribe", "bugs": [7]})
        );
    }
}
