use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Unauthorized,
    SessionNotFound,
    SessionTerminated,
    SessionBusy,
    BackendUnavailable,
    ApprovalNotFound,
    NoActiveStream,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agentd:error:invalid_request",
            Self::Unauthorized => "urn:agentd:error:unauthorized",
            Self::SessionNotFound => "urn:agentd:error:session_not_found",
            Self::SessionTerminated => "urn:agentd:error:session_terminated",
            Self::SessionBusy => "urn:agentd:error:session_busy",
            Self::BackendUnavailable => "urn:agentd:error:backend_unavailable",
            Self::ApprovalNotFound => "urn:agentd:error:approval_not_found",
            Self::NoActiveStream => "urn:agentd:error:no_active_stream",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Unauthorized => "Unauthorized",
            Self::SessionNotFound => "Session Not Found",
            Self::SessionTerminated => "Session Terminated",
            Self::SessionBusy => "Session Busy",
            Self::BackendUnavailable => "Backend Unavailable",
            Self::ApprovalNotFound => "Approval Not Found",
            Self::NoActiveStream => "No Active Stream",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthorized => 401,
            Self::SessionNotFound => 404,
            Self::SessionTerminated => 410,
            Self::SessionBusy => 409,
            Self::BackendUnavailable => 400,
            Self::ApprovalNotFound => 404,
            Self::NoActiveStream => 404,
        }
    }
}

/// RFC 7807 problem details body returned by the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("session terminated: {session_id}")]
    SessionTerminated { session_id: String },
    #[error("session busy: {session_id}")]
    SessionBusy { session_id: String },
    #[error("backend unavailable: {backend}")]
    BackendUnavailable { backend: String },
    #[error("approval not found: {tool_use_id}")]
    ApprovalNotFound {
        session_id: String,
        tool_use_id: String,
    },
    /// The session exists but has nothing to replay.
    #[error("no active stream for session: {session_id}")]
    NoActiveStream { session_id: String },
}

impl EngineError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Unauthorized { .. } => ErrorType::Unauthorized,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SessionTerminated { .. } => ErrorType::SessionTerminated,
            Self::SessionBusy { .. } => ErrorType::SessionBusy,
            Self::BackendUnavailable { .. } => ErrorType::BackendUnavailable,
            Self::ApprovalNotFound { .. } => ErrorType::ApprovalNotFound,
            Self::NoActiveStream { .. } => ErrorType::NoActiveStream,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::Unauthorized { .. } => {}
            Self::SessionNotFound { session_id }
            | Self::SessionTerminated { session_id }
            | Self::SessionBusy { session_id }
            | Self::NoActiveStream { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::BackendUnavailable { backend } => {
                extensions.insert("backend".to_string(), Value::String(backend.clone()));
            }
            Self::ApprovalNotFound {
                session_id,
                tool_use_id,
            } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
                extensions.insert("toolUseId".to_string(), Value::String(tool_use_id.clone()));
            }
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<EngineError> for ProblemDetails {
    fn from(value: EngineError) -> Self {
        value.to_problem_details()
    }
}

impl From<&EngineError> for ProblemDetails {
    fn from(value: &EngineError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_session_id() {
        let err = EngineError::SessionNotFound {
            session_id: "s1".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 404);
        assert_eq!(problem.type_, "urn:agentd:error:session_not_found");
        assert_eq!(problem.extensions.get("sessionId"), Some(&Value::String("s1".into())));

        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "urn:agentd:error:session_not_found");
        assert_eq!(json["sessionId"], "s1");
    }

    #[test]
    fn busy_and_terminated_are_distinct_statuses() {
        let busy = EngineError::SessionBusy {
            session_id: "s".into(),
        };
        let gone = EngineError::SessionTerminated {
            session_id: "s".into(),
        };
        assert_eq!(busy.error_type().status_code(), 409);
        assert_eq!(gone.error_type().status_code(), 410);
    }
}
