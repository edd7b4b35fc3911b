//! CIBA provider client: authorization initiation and bounded token polling.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use chat_gateway_error::GatewayError;

pub const CIBA_GRANT_TYPE: &str = "urn:openid:params:grant-type:ciba";

const DEFAULT_SCOPE: &str = "openid";
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct CibaConfig {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    pub audience: Option<String>,
    pub scope: String,
    pub max_poll_attempts: u32,
    /// Explicit endpoint overrides for providers whose backchannel paths do
    /// not follow the default issuer-derived shape.
    pub authorize_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
}

impl CibaConfig {
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            audience: None,
            scope: DEFAULT_SCOPE.to_string(),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            authorize_endpoint: None,
            token_endpoint: None,
        }
    }
}

/// Backchannel endpoint pair, resolved once when the client is built rather
/// than re-derived per call.
#[derive(Debug, Clone)]
pub struct ProviderEndpoints {
    pub authorize_url: String,
    pub token_url: String,
}

impl ProviderEndpoints {
    pub fn for_config(config: &CibaConfig) -> Self {
        let issuer = config.issuer.trim_end_matches('/');
        Self {
            authorize_url: config
                .authorize_endpoint
                .clone()
                .unwrap_or_else(|| format!("{issuer}/bc-authorize")),
            token_url: config
                .token_endpoint
                .clone()
                .unwrap_or_else(|| format!("{issuer}/oauth/token")),
        }
    }
}

/// Immutable per-attempt handle returned by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct BackchannelAuthRequest {
    pub auth_req_id: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    fn has_tokens(&self) -> bool {
        self.access_token.is_some() || self.id_token.is_some()
    }
}

/// Terminal outcome of a poll loop. Denial is a domain result, not an error.
#[derive(Debug)]
pub enum PollOutcome {
    Approved(TokenResponse),
    Denied,
}

#[derive(Debug, Clone)]
pub struct CibaClient {
    http_client: reqwest::Client,
    config: CibaConfig,
    endpoints: ProviderEndpoints,
}

impl CibaClient {
    pub fn new(config: CibaConfig) -> Self {
        let endpoints = ProviderEndpoints::for_config(&config);
        Self {
            http_client: reqwest::Client::new(),
            config,
            endpoints,
        }
    }

    pub fn config(&self) -> &CibaConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    /// Issue the provider's backchannel-authorize call. The binding message
    /// is what the user sees on the approving device.
    pub async fn initiate(
        &self,
        user_id: &str,
        binding_message: &str,
    ) -> Result<BackchannelAuthRequest, GatewayError> {
        let mut form = vec![
            ("scope", self.config.scope.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("login_hint", user_id),
            ("binding_message", binding_message),
        ];
        if let Some(audience) = self.config.audience.as_deref() {
            form.push(("audience", audience));
        }

        let response = self
            .http_client
            .post(&self.endpoints.authorize_url)
            .form(&form)
            .send()
            .await
            .map_err(|err| GatewayError::TransientNetwork {
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ProviderError {
                status: status.as_u16(),
                body,
            });
        }

        let request: BackchannelAuthRequest =
            response
                .json()
                .await
                .map_err(|err| GatewayError::ProviderError {
                    status: status.as_u16(),
                    body: format!("malformed authorize response: {err}"),
                })?;
        debug!(
            auth_req_id = %request.auth_req_id,
            expires_in = request.expires_in,
            interval = request.interval,
            "backchannel authorization initiated"
        );
        Ok(request)
    }

    /// Poll the token endpoint until the request resolves, the attempt budget
    /// runs out, or the provider reports a terminal error. No wait before the
    /// first attempt; `interval` between attempts.
    pub async fn poll(
        &self,
        auth_req_id: &str,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<PollOutcome, GatewayError> {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(interval).await;
            }

            let response = match self.token_request(auth_req_id).await {
                Ok(response) => response,
                Err(err) if attempt == max_attempts => {
                    return Err(GatewayError::PollingFailed {
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    // Network hiccups on non-final attempts are swallowed.
                    warn!(attempt, error = %err, "token poll attempt failed, continuing");
                    continue;
                }
            };

            let status = response.status();
            let body: Value = match response.json().await {
                Ok(body) => body,
                Err(err) if attempt == max_attempts => {
                    return Err(GatewayError::PollingFailed {
                        message: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(attempt, error = %err, "unreadable token response, continuing");
                    continue;
                }
            };

            if status.is_success() {
                let tokens: TokenResponse =
                    serde_json::from_value(body.clone()).unwrap_or_default();
                if tokens.has_tokens() {
                    debug!(attempt, "backchannel authorization approved");
                    return Ok(PollOutcome::Approved(tokens));
                }
            }

            let error_code = body.get("error").and_then(Value::as_str).unwrap_or("");
            match error_code {
                "authorization_pending" => continue,
                "access_denied" => {
                    debug!(attempt, "backchannel authorization denied by user");
                    return Ok(PollOutcome::Denied);
                }
                "expired_token" => return Err(GatewayError::AuthorizationExpired),
                other => {
                    let description = body
                        .get("error_description")
                        .and_then(Value::as_str)
                        .unwrap_or(other);
                    return Err(GatewayError::PollingFailed {
                        message: description.to_string(),
                    });
                }
            }
        }
        Err(GatewayError::AuthorizationTimeout {
            attempts: max_attempts,
        })
    }

    async fn token_request(&self, auth_req_id: &str) -> Result<reqwest::Response, reqwest::Error> {
        let form = [
            ("grant_type", CIBA_GRANT_TYPE),
            ("auth_req_id", auth_req_id),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        self.http_client
            .post(&self.endpoints.token_url)
            .form(&form)
            .send()
            .await
    }
}
