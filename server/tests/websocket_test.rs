//! Protocol tests for the live notification channel.

use chartsync_engine::protocol::LiveRequest;
use chartsync_engine::{Checkpoint, LiveMessage};

fn changes(collection: &str, seq: u64) -> LiveMessage {
    LiveMessage::ChangesAvailable {
        collection: collection.to_string(),
        checkpoint: Checkpoint(seq),
    }
}

#[cfg(test)]
mod websocket_protocol_tests {
    use super::*;

    #[test]
    fn test_ping_request_format() {
        let json = serde_json::to_string(&LiveRequest::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);

        let parsed: LiveRequest = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(parsed, LiveRequest::Ping);
    }

    #[test]
    fn test_unknown_request_rejected() {
        assert!(serde_json::from_str::<LiveRequest>(r#"{"type": "push"}"#).is_err());
        assert!(serde_json::from_str::<LiveRequest>(r#"{"since": 1}"#).is_err());
    }

    #[test]
    fn test_changes_available_format() {
        let json = serde_json::to_value(changes("records", 128)).unwrap();
        assert_eq!(json["type"], "changes_available");
        assert_eq!(json["collection"], "records");
        assert_eq!(json["checkpoint"], 128);
    }

    #[test]
    fn test_server_messages_round_trip() {
        let messages = vec![
            changes("records", 1),
            LiveMessage::Pong,
            LiveMessage::Error {
                message: "Invalid message format".into(),
            },
        ];
        for message in messages {
            let text = serde_json::to_string(&message).unwrap();
            let parsed: LiveMessage = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn test_notifications_carry_increasing_checkpoints() {
        let frames: Vec<String> = [3, 9, 27]
            .into_iter()
            .map(|seq| serde_json::to_string(&changes("records", seq)).unwrap())
            .collect();

        let checkpoints: Vec<Checkpoint> = frames
            .iter()
            .filter_map(|text| match serde_json::from_str(text).unwrap() {
                LiveMessage::ChangesAvailable { checkpoint, .. } => Some(checkpoint),
                _ => None,
            })
            .collect();
        assert!(checkpoints.windows(2).all(|w| w[0] < w[1]));
    }
}
