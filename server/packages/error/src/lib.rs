use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    RemoteUnavailable,
    TransientNetwork,
    ProviderError,
    AuthorizationExpired,
    AuthorizationTimeout,
    PollingFailed,
    AuthorizationDenied,
    MissingUserId,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-gateway:error:invalid_request",
            Self::RemoteUnavailable => "urn:chat-gateway:error:remote_unavailable",
            Self::TransientNetwork => "urn:chat-gateway:error:transient_network",
            Self::ProviderError => "urn:chat-gateway:error:provider_error",
            Self::AuthorizationExpired => "urn:chat-gateway:error:authorization_expired",
            Self::AuthorizationTimeout => "urn:chat-gateway:error:authorization_timeout",
            Self::PollingFailed => "urn:chat-gateway:error:polling_failed",
            Self::AuthorizationDenied => "urn:chat-gateway:error:authorization_denied",
            Self::MissingUserId => "urn:chat-gateway:error:missing_user_id",
            Self::StreamError => "urn:chat-gateway:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::RemoteUnavailable => "Remote Unavailable",
            Self::TransientNetwork => "Transient Network Failure",
            Self::ProviderError => "Identity Provider Error",
            Self::AuthorizationExpired => "Authorization Expired",
            Self::AuthorizationTimeout => "Authorization Timeout",
            Self::PollingFailed => "Polling Failed",
            Self::AuthorizationDenied => "Authorization Denied",
            Self::MissingUserId => "Missing User Id",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::RemoteUnavailable => 502,
            Self::TransientNetwork => 503,
            Self::ProviderError => 502,
            Self::AuthorizationExpired => 403,
            Self::AuthorizationTimeout => 408,
            Self::PollingFailed => 502,
            Self::AuthorizationDenied => 403,
            Self::MissingUserId => 400,
            Self::StreamError => 502,
        }
    }
}

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
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("remote execution service unavailable for agent {agent}")]
    RemoteUnavailable {
        agent: String,
        detail: Option<String>,
    },
    #[error("transient network failure: {message}")]
    TransientNetwork { message: String },
    #[error("identity provider rejected the authorization request ({status})")]
    ProviderError { status: u16, body: String },
    #[error("backchannel authorization request expired")]
    AuthorizationExpired,
    #[error("backchannel authorization timed out after {attempts} attempts")]
    AuthorizationTimeout { attempts: u32 },
    #[error("backchannel token polling failed: {message}")]
    PollingFailed { message: String },
    #[error("authorization denied: {reason}")]
    AuthorizationDenied { reason: String },
    #[error("no user id could be derived from the call context or payload")]
    MissingUserId,
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::RemoteUnavailable { .. } => ErrorType::RemoteUnavailable,
            Self::TransientNetwork { .. } => ErrorType::TransientNetwork,
            Self::ProviderError { .. } => ErrorType::ProviderError,
            Self::AuthorizationExpired => ErrorType::AuthorizationExpired,
            Self::AuthorizationTimeout { .. } => ErrorType::AuthorizationTimeout,
            Self::PollingFailed { .. } => ErrorType::PollingFailed,
            Self::AuthorizationDenied { .. } => ErrorType::AuthorizationDenied,
            Self::MissingUserId => ErrorType::MissingUserId,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    /// True when a retry with backoff may succeed. HTTP status errors carry
    /// an application-level response body and are never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork { .. })
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::RemoteUnavailable { agent, detail } => {
                extensions.insert("agent".to_string(), Value::String(agent.clone()));
                if let Some(detail) = detail {
                    extensions.insert("remoteDetail".to_string(), Value::String(detail.clone()));
                }
            }
            Self::ProviderError { status, body } => {
                extensions.insert(
                    "providerStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
                extensions.insert("providerBody".to_string(), Value::String(body.clone()));
            }
            Self::AuthorizationTimeout { attempts } => {
                extensions.insert(
                    "attempts".to_string(),
                    Value::Number(serde_json::Number::from(*attempts)),
                );
            }
            Self::AuthorizationDenied { reason } => {
                extensions.insert("reason".to_string(), Value::String(reason.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problem_details_carry_taxonomy_fields() {
        let err = GatewayError::ProviderError {
            status: 400,
            body: "{\"error\":\"invalid_client\"}".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(problem.type_, "urn:chat-gateway:error:provider_error");
        assert_eq!(
            problem.extensions.get("providerStatus"),
            Some(&Value::Number(serde_json::Number::from(400u16)))
        );
    }

    #[test]
    fn denial_reason_is_an_extension() {
        let err = GatewayError::AuthorizationDenied {
            reason: "the user denied the request".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 403);
        assert_eq!(
            problem.extensions.get("reason"),
            Some(&Value::String("the user denied the request".to_string()))
        );
    }

    #[test]
    fn only_network_failures_are_transient() {
        assert!(GatewayError::TransientNetwork {
            message: "connection reset".to_string()
        }
        .is_transient());
        assert!(!GatewayError::RemoteUnavailable {
            agent: "shopper".to_string(),
            detail: None,
        }
        .is_transient());
    }
}
