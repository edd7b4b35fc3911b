//! Wraps protected actions in the backchannel approval flow.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use chat_gateway_error::GatewayError;

use crate::binding::{binding_message_for, derive_user_id};
use crate::ciba::{CibaClient, PollOutcome};
use crate::state::{AuthorizationStatus, SharedAuthorizationState};

const NOTICE_SENT_TTL_MS: u64 = 8_000;
const NOTICE_PROCESSING_TTL_MS: u64 = 5_000;

/// Advisory, short-lived progress text tied to a phase transition. The
/// receiver owns the expiry timer; the coordinator never schedules removal.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusNotice {
    pub text: String,
    pub auto_remove_ms: u64,
}

pub struct AuthorizationCoordinator {
    state: SharedAuthorizationState,
    ciba: CibaClient,
    notices: Option<mpsc::UnboundedSender<StatusNotice>>,
}

impl AuthorizationCoordinator {
    pub fn new(state: SharedAuthorizationState, ciba: CibaClient) -> Self {
        Self {
            state,
            ciba,
            notices: None,
        }
    }

    /// Route phase-transition notices to the given sender.
    pub fn with_notices(mut self, notices: mpsc::UnboundedSender<StatusNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    pub fn state(&self) -> &SharedAuthorizationState {
        &self.state
    }

    /// Run `action` only after the user approves it out-of-band.
    ///
    /// The shared state tracks every phase so an independent poller can
    /// render progress. After approval the state stays `approved` until the
    /// action itself finishes, success or failure, and only then resets to
    /// idle; "approved, still executing" and "finished" stay distinguishable.
    /// Denial and every polling failure resolve to `denied` without invoking
    /// the action.
    pub async fn with_backchannel_authorization<F, Fut, T>(
        &self,
        context_user: Option<&str>,
        payload: &Value,
        action: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        // A previous attempt's terminal state always passes back through idle
        // before this one starts.
        if self.state.get().status.is_terminal() {
            self.state.reset();
        }

        let user_id = match derive_user_id(context_user, payload) {
            Ok(user_id) => user_id,
            Err(err) => {
                self.state
                    .set(AuthorizationStatus::Denied, Some(err.to_string()));
                return Err(err);
            }
        };
        let message = binding_message_for(payload);

        // If this future is dropped mid-flight, the guard resolves the shared
        // state to denied so pollers never observe a pending state forever.
        let mut abort_guard = AbortGuard::armed(&self.state);

        self.state
            .set(AuthorizationStatus::Requested, Some(message.clone()));
        self.notify("Approval request sent to your device", NOTICE_SENT_TTL_MS);

        let request = match self.ciba.initiate(&user_id, &message).await {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "backchannel initiation failed");
                abort_guard.disarm();
                self.state
                    .set(AuthorizationStatus::Denied, Some(err.to_string()));
                return Err(GatewayError::AuthorizationDenied {
                    reason: err.to_string(),
                });
            }
        };

        self.state
            .set(AuthorizationStatus::Pending, Some(message.clone()));

        let outcome = self
            .ciba
            .poll(
                &request.auth_req_id,
                Duration::from_secs(request.interval),
                self.ciba.config().max_poll_attempts,
            )
            .await;
        abort_guard.disarm();

        match outcome {
            Ok(PollOutcome::Approved(_tokens)) => {
                debug!(user_id, "authorization approved, executing action");
                self.state.set(
                    AuthorizationStatus::Approved,
                    Some("Authorization approved".to_string()),
                );
                self.notify("Approved, processing your request", NOTICE_PROCESSING_TTL_MS);

                let result = action(user_id).await;
                // Reset only after the action completes, never before.
                self.state.reset();
                result
            }
            Ok(PollOutcome::Denied) => {
                let reason = "the user denied the request".to_string();
                self.state
                    .set(AuthorizationStatus::Denied, Some(reason.clone()));
                Err(GatewayError::AuthorizationDenied { reason })
            }
            Err(err) => {
                warn!(error = %err, "backchannel polling failed");
                self.state
                    .set(AuthorizationStatus::Denied, Some(err.to_string()));
                Err(GatewayError::AuthorizationDenied {
                    reason: err.to_string(),
                })
            }
        }
    }

    fn notify(&self, text: &str, auto_remove_ms: u64) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(StatusNotice {
                text: text.to_string(),
                auto_remove_ms,
            });
        }
    }
}

struct AbortGuard {
    state: SharedAuthorizationState,
    armed: bool,
}

impl AbortGuard {
    fn armed(state: &SharedAuthorizationState) -> Self {
        Self {
            state: state.clone(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let snapshot = self.state.get();
        if matches!(
            snapshot.status,
            AuthorizationStatus::Requested | AuthorizationStatus::Pending
        ) {
            self.state.set(
                AuthorizationStatus::Denied,
                Some("authorization attempt aborted".to_string()),
            );
        }
    }
}
