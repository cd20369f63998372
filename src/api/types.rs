// HTTP and duplex wire types
// Request/response bodies plus the messages exchanged on the duplex relay

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::models::{GenerationRequest, ReviewAction, Run};
use crate::ForgeError;

/// Body of `POST /api/generations`
pub type CreateGenerationRequest = GenerationRequest;

/// A run summary plus whether this request put it on the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    #[serde(flatten)]
    pub run: Run,
    pub queued: bool,
}

/// Query for `GET /api/generations`
#[derive(Debug, Clone, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

pub const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPage {
    pub data: Vec<Run>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

/// Body of `POST /api/generations/:id/review`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub stage: String,
    pub action: ReviewAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewAccepted {
    pub run_id: String,
    pub stage: String,
    pub action: ReviewAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Client-to-server messages on the duplex relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum DuplexRequest {
    Subscribe {
        run_id: String,
    },
    Approve {
        run_id: String,
        stage: String,
    },
    Reject {
        run_id: String,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
    Edit {
        run_id: String,
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_data: Option<Value>,
    },
    Ping,
}

/// Server-to-client messages on the duplex relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DuplexMessage {
    #[serde(rename = "connected")]
    Connected { timestamp: DateTime<Utc> },

    #[serde(rename = "subscribed")]
    Subscribed { run_id: String },

    #[serde(rename = "interrupt:request")]
    InterruptRequest {
        run_id: String,
        stage: String,
        data: Value,
    },

    #[serde(rename = "interrupt:resumed")]
    InterruptResumed { run_id: String, stage: String },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
}

impl DuplexMessage {
    pub fn error(message: impl Into<String>) -> Self {
        DuplexMessage::Error {
            message: message.into(),
        }
    }
}

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Maps crate errors onto HTTP responses
#[derive(Debug)]
pub struct ApiError(pub ForgeError);

impl From<ForgeError> for ApiError {
    fn from(err: ForgeError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ForgeError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ForgeError::Forbidden(_) => StatusCode::FORBIDDEN,
            ForgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ForgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ForgeError::Duplicate(_) => StatusCode::CONFLICT,
            ForgeError::QueueClosed | ForgeError::ChannelSubscribe(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ForgeError::ChannelPublish(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("❌ Internal error: {}", self.0);
            "internal server error".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplex_request_wire_format() {
        let parsed: DuplexRequest = serde_json::from_value(json!({
            "action": "reject",
            "run_id": "r1",
            "stage": "outline_review",
            "feedback": "too short"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            DuplexRequest::Reject {
                run_id: "r1".into(),
                stage: "outline_review".into(),
                feedback: Some("too short".into()),
            }
        );
        let ping: DuplexRequest = serde_json::from_str(r#"{"action":"ping"}"#).unwrap();
        assert_eq!(ping, DuplexRequest::Ping);
    }

    #[test]
    fn test_interrupt_request_uses_colon_tag() {
        let message = DuplexMessage::InterruptRequest {
            run_id: "r1".into(),
            stage: "edit_review".into(),
            data: json!("draft"),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "interrupt:request");
        assert_eq!(value["data"], "draft");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(ForgeError::Forbidden("x".into())).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError(ForgeError::InvalidInput("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(ForgeError::Duplicate("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError(ForgeError::ChannelSubscribe("x".into())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError(ForgeError::Internal("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
