//! Miniserver boundary (consumed interface).
//!
//! The controller's wire protocol is owned by an external client; this
//! module only fixes the contract the bridge depends on: keyed state
//! updates delivered to registered listeners, a command channel with an
//! explicit accept/reject outcome, and one-shot reads of cached values
//! and secured device details (camera credentials, stream URLs).

use crate::error::{BridgeError, Result};

/// Stable identifier of a control, sub-control, mood or zone.
///
/// Miniserver UUIDs are opaque strings
/// (e.g. `"0f86a2fe-0378-3e15-ffff403fb0c34b9e"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uuid(pub String);

impl Uuid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uuid {
    fn from(s: &str) -> Self {
        Uuid(s.to_string())
    }
}

/// Value carried by a state update.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Number(f64),
    Text(String),
}

/// A keyed state change pushed by the controller.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub key: Uuid,
    pub value: StateValue,
}

/// Result of a command sent to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The controller acknowledged the command.
    Accepted,
    /// The controller refused the command with the given status code.
    Rejected(u16),
}

impl CommandOutcome {
    /// Convert a rejection into a typed error, for callers that treat a
    /// refused command as a failure.
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Accepted => Ok(()),
            Self::Rejected(code) => Err(BridgeError::CommandRejected(code)),
        }
    }
}

/// Listener invoked for each state update on a subscribed key.
pub type StateListener = Box<dyn Fn(&StateUpdate) + Send + Sync>;

/// The event-source contract of the Miniserver client.
///
/// Implemented outside this crate by the actual protocol client; tests use
/// in-memory fakes. All methods are callable from any thread.
pub trait MiniserverLink: Send + Sync {
    /// Register a listener for updates on one state UUID.
    fn register_listener(&self, key: &Uuid, listener: StateListener);

    /// Send an action string to a control (e.g. `"on"`, `"setValue/42"`).
    fn send_command(&self, key: &Uuid, action: &str) -> Result<CommandOutcome>;

    /// Most recent cached value for a state UUID, if one has been seen.
    fn cached_value(&self, key: &Uuid) -> Option<StateValue>;

    /// One-shot retrieval of a control's secured details JSON blob
    /// (intercom credentials, camera stream URL).
    fn secured_details(&self, key: &Uuid) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_outcome_maps_to_error() {
        let err = CommandOutcome::Rejected(403).into_result().unwrap_err();
        assert!(matches!(err, BridgeError::CommandRejected(403)));
    }

    #[test]
    fn accepted_outcome_is_ok() {
        assert!(CommandOutcome::Accepted.into_result().is_ok());
    }
}
