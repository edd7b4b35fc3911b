//! Backchannel Authorization Coordinator.
//!
//! Drives the CIBA (OpenID Client-Initiated Backchannel Authentication) flow:
//! a protected action is suspended while the user approves or denies it on a
//! separate device, with bounded polling against the identity provider and a
//! process-wide authorization state that independent pollers can observe.

pub mod binding;
pub mod ciba;
pub mod coordinator;
pub mod state;

pub use binding::{binding_message_for, derive_user_id};
pub use ciba::{BackchannelAuthRequest, CibaClient, CibaConfig, PollOutcome, ProviderEndpoints};
pub use coordinator::{AuthorizationCoordinator, StatusNotice};
pub use state::{AuthorizationState, AuthorizationStatus, SharedAuthorizationState};
