use axum::extract::ws::{Message, WebSocket};
use formcollab_common::protocol::ws::{
    ClientMessage, ServerMessage, CURRENT_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use serde_json::json;

use crate::error::{ErrorCode, RelayError};

/// Picks the protocol version for a session from the `join` frame. Clients
/// that omit it speak the current version; the previous one stays accepted.
pub fn negotiate_version(requested: Option<&str>) -> Result<&'static str, RelayError> {
    let Some(requested) = requested else {
        return Ok(CURRENT_PROTOCOL_VERSION);
    };
    SUPPORTED_PROTOCOL_VERSIONS.iter().copied().find(|version| *version == requested).ok_or_else(|| {
        RelayError::new(
            ErrorCode::UpgradeRequired,
            format!("unsupported protocol version: {requested}"),
        )
        .with_details(json!({
            "requested_version": requested,
            "supported_versions": SUPPORTED_PROTOCOL_VERSIONS,
            "current_version": CURRENT_PROTOCOL_VERSION,
        }))
    })
}

pub fn decode_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

pub fn encode_message(message: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

pub async fn send_ws_message(socket: &mut WebSocket, message: &ServerMessage) -> Result<(), ()> {
    let encoded = encode_message(message).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// `error` frame carrying the same code and retry hint as the HTTP envelope.
pub fn error_frame(error: &RelayError) -> ServerMessage {
    ServerMessage::error(error.code().as_str(), error.message(), error.code().retryable())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    #[test]
    fn decode_rejects_unknown_frame_types() {
        assert!(decode_message(r#"{"type":"yjs_update","doc_id":"x"}"#).is_err());
        assert!(decode_message("not json").is_err());
        assert_eq!(decode_message(r#"{"type":"leave"}"#).expect("leave decodes"), ClientMessage::Leave);
    }

    #[test]
    fn error_frame_mirrors_relay_error() {
        let frame = error_frame(&RelayError::new(ErrorCode::RoomClosed, "room is gone"));
        let encoded: Value =
            serde_json::from_str(&encode_message(&frame).expect("frame encodes")).expect("valid json");
        assert_eq!(encoded["type"], "error");
        assert_eq!(encoded["code"], "ROOM_CLOSED");
        assert_eq!(encoded["message"], "room is gone");
        assert_eq!(encoded["retryable"], false);
    }

    #[test]
    fn missing_version_means_current() {
        assert_eq!(negotiate_version(None).expect("default version"), CURRENT_PROTOCOL_VERSION);
        assert_eq!(negotiate_version(Some("formcollab.v0")).expect("previous version"), "formcollab.v0");
    }

    #[test]
    fn unknown_versions_require_an_upgrade() {
        for requested in ["formcollab.v99", "formcollab.v1-beta", "formcollab.v", ""] {
            let error = negotiate_version(Some(requested)).expect_err("version should be refused");
            assert_eq!(error.code(), ErrorCode::UpgradeRequired, "input {requested:?}");
        }
    }

    #[tokio::test]
    async fn upgrade_error_lists_supported_versions() {
        let error = negotiate_version(Some("formcollab.v99")).expect_err("v99 should be refused");
        let response = axum::response::IntoResponse::into_response(error);
        assert_eq!(response.status(), axum::http::StatusCode::UPGRADE_REQUIRED);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let parsed: Value = serde_json::from_slice(&body).expect("body should be valid json");
        assert_eq!(parsed["error"]["details"]["requested_version"], "formcollab.v99");
        assert_eq!(parsed["error"]["details"]["supported_versions"], json!(SUPPORTED_PROTOCOL_VERSIONS));
    }
}
