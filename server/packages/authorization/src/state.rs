//! Process-wide authorization state.
//!
//! Readers poll this concurrently while the in-flight authorization attempt
//! writes it, so every mutation replaces the whole value in one swap; no
//! reader can observe a half-updated status/message pair. The monotonic
//! version makes update ordering observable in tests.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Idle,
    Requested,
    Pending,
    Approved,
    Denied,
}

impl AuthorizationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Denied)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AuthorizationState {
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub version: u64,
    pub updated_at: i64,
}

impl Default for AuthorizationState {
    fn default() -> Self {
        Self {
            status: AuthorizationStatus::Idle,
            message: None,
            version: 0,
            updated_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Handle to the single process-wide value. Cloning shares the state.
#[derive(Debug, Clone, Default)]
pub struct SharedAuthorizationState {
    inner: Arc<Mutex<AuthorizationState>>,
}

impl SharedAuthorizationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AuthorizationState {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the whole value in one swap.
    pub fn set(&self, status: AuthorizationStatus, message: Option<String>) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = AuthorizationState {
            status,
            message,
            version: guard.version + 1,
            updated_at: Utc::now().timestamp_millis(),
        };
        *guard = next;
    }

    /// Explicit reset back to idle after a terminal state.
    pub fn reset(&self) {
        self.set(AuthorizationStatus::Idle, None);
    }
}
