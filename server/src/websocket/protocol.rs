//! Live channel message handling.
//!
//! Frames are JSON: clients send `LiveRequest`s, the server answers and
//! notifies with `LiveMessage`s, both tagged with a snake_case `type`.

use chartsync_engine::protocol::LiveRequest;
use chartsync_engine::LiveMessage;

/// Reply to one text frame from a client.
pub fn reply_to(text: &str) -> LiveMessage {
    match serde_json::from_str::<LiveRequest>(text) {
        Ok(LiveRequest::Ping) => LiveMessage::Pong,
        Err(e) => LiveMessage::Error {
            message: format!("Invalid message format: {e}"),
        },
    }
}

/// Encode a message as a text frame.
pub fn encode(message: &LiveMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize live message");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartsync_engine::Checkpoint;

    #[test]
    fn test_ping_gets_pong() {
        assert_eq!(reply_to(r#"{"type": "ping"}"#), LiveMessage::Pong);
        assert_eq!(encode(&LiveMessage::Pong).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_unknown_request_gets_error() {
        match reply_to(r#"{"type": "pull"}"#) {
            LiveMessage::Error { message } => assert!(message.starts_with("Invalid message format")),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(matches!(reply_to("not json"), LiveMessage::Error { .. }));
    }

    #[test]
    fn test_changes_available_frame() {
        let text = encode(&LiveMessage::ChangesAvailable {
            collection: "records".into(),
            checkpoint: Checkpoint(42),
        })
        .unwrap();
        assert!(text.contains(r#""type":"changes_available""#));
        assert!(text.contains(r#""checkpoint":42"#));
    }
}
