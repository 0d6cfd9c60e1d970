use crate::error::ErrorBody;
use crate::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// What an agent announces about itself right after the relay connects.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMetadata {
    pub home_directory: PathBuf,
    pub platform: String,
    #[serde(default)]
    pub http_port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlFrame {
    AgentMetadata(AgentMetadata),
    Ping,
    Pong,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub id: String,
    #[serde(flatten)]
    pub operation: Operation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl RelayResponse {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorBody> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid relay request: {source}")]
    InvalidRequest {
        id: Option<String>,
        #[source]
        source: serde_json::Error,
    },
    #[error("unrecognized relay frame")]
    Unrecognized,
}

/// Any message carried on the relay socket.
#[derive(Clone, Debug, PartialEq)]
pub enum RelayFrame {
    Control(ControlFrame),
    Request(RelayRequest),
    Response(RelayResponse),
}

impl RelayFrame {
    /// Classifies a text message by shape: control frames carry `type`,
    /// requests carry `operation`, anything else with an `id` is a response.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").is_some() {
            return Ok(RelayFrame::Control(serde_json::from_value(value)?));
        }
        if value.get("operation").is_some() {
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map(ToString::to_string);
            return serde_json::from_value(value)
                .map(RelayFrame::Request)
                .map_err(|source| FrameError::InvalidRequest { id, source });
        }
        if value.get("id").is_some() {
            return Ok(RelayFrame::Response(serde_json::from_value(value)?));
        }
        Err(FrameError::Unrecognized)
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        match self {
            RelayFrame::Control(frame) => serde_json::to_string(frame),
            RelayFrame::Request(request) => serde_json::to_string(request),
            RelayFrame::Response(response) => serde_json::to_string(response),
        }
    }
}

impl From<ControlFrame> for RelayFrame {
    fn from(frame: ControlFrame) -> Self {
        RelayFrame::Control(frame)
    }
}

impl From<RelayRequest> for RelayFrame {
    fn from(request: RelayRequest) -> Self {
        RelayFrame::Request(request)
    }
}

impl From<RelayResponse> for RelayFrame {
    fn from(response: RelayResponse) -> Self {
        RelayFrame::Response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::operation::ReadArgs;
    use serde_json::json;

    #[test]
    fn metadata_announcement_shape() {
        let frame = RelayFrame::from(ControlFrame::AgentMetadata(AgentMetadata {
            home_directory: "/home/alice".into(),
            platform: "linux".into(),
            http_port: Some(7717),
        }));
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "agent-metadata",
                "homeDirectory": "/home/alice",
                "platform": "linux",
                "httpPort": 7717
            })
        );
    }

    #[test]
    fn request_arguments_sit_next_to_id() {
        let text = r#"{"id":"r-1","operation":"fs.read","path":"/etc/hosts"}"#;
        let frame = RelayFrame::parse(text).unwrap();
        assert_eq!(
            frame,
            RelayFrame::Request(RelayRequest {
                id: "r-1".into(),
                operation: Operation::Read(ReadArgs {
                    path: "/etc/hosts".into(),
                    max_bytes: None,
                }),
            })
        );
    }

    #[test]
    fn invalid_request_keeps_its_id() {
        let err = RelayFrame::parse(r#"{"id":"r-2","operation":"fs.nope"}"#).unwrap_err();
        match err {
            FrameError::InvalidRequest { id, .. } => assert_eq!(id.as_deref(), Some("r-2")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn error_response_becomes_err() {
        let frame = RelayFrame::parse(
            r#"{"id":"r-3","error":{"code":"permission-denied","message":"no","reason":"safe-mode-readonly"}}"#,
        )
        .unwrap();
        let RelayFrame::Response(response) = frame else {
            panic!("expected response");
        };
        let err = response.into_result().unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);
        assert_eq!(err.reason.as_deref(), Some("safe-mode-readonly"));
    }

    #[test]
    fn keepalive_frames_parse() {
        assert_eq!(
            RelayFrame::parse(r#"{"type":"ping"}"#).unwrap(),
            RelayFrame::Control(ControlFrame::Ping)
        );
        assert!(matches!(
            RelayFrame::parse(r#"{"hello":1}"#),
            Err(FrameError::Unrecognized)
        ));
    }
}
