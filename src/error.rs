//! Custom error types for the application.
//!
//! This module defines the primary error type, `RigError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of a behavior rig,
//! from configuration problems caught before any hardware is touched to
//! mid-trial device failures that end a session.
//!
//! ## Error classes
//!
//! - **`Config` / `Configuration`**: file-level parse errors (wrapped from
//!   `figment`) and semantic errors in settings that parse fine but are
//!   logically wrong (e.g. an enabled capability with no serial port set).
//!   Both are fatal and raised pre-flight, before any connection attempt.
//! - **`Connection`**: the serial link to the behavior controller could not
//!   be brought up. The two failure modes are distinguished because they
//!   need different remediation: `OpenFailed` means the port itself would
//!   not open, while `Unresponsive` means the link opened but the device
//!   never answered (the green-light-but-dead state), which is fixed by
//!   power-cycling the USB connection.
//! - **`Calibration`**: automatic reward calibration was selected but the
//!   stored curve is stale or missing. Fatal pre-flight: running trials
//!   with a wrong reward volume is a correctness problem, not a
//!   recoverable one.
//! - **`ProtocolConstruction`**: a compiled trial program violates the
//!   state-graph invariants. This is a programmer error in a protocol
//!   implementation and should be caught by tests, not handled at runtime.
//! - **`DeviceRuntime`**: the link failed mid-trial. Fatal to the session;
//!   the partially-run trial is discarded rather than persisted.
//!
//! Missing synchronization pulses are deliberately *not* an error variant:
//! they are logged as warnings by the session runner and never abort data
//! collection.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type RigResult<T> = std::result::Result<T, RigError>;

/// How the connection to the behavior controller failed.
#[derive(Error, Debug)]
pub enum ConnectionFailure {
    #[error("could not open serial port '{port}': {reason}")]
    OpenFailed { port: String, reason: String },

    #[error(
        "the communication with the behavior controller is established but the device is not \
         responsive. This is usually indicated by the device with a green light. Please unplug \
         the controller USB cable from the computer and plug it back in to start the task."
    )]
    Unresponsive,
}

#[derive(Error, Debug)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionFailure),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Protocol construction error: {0}")]
    ProtocolConstruction(String),

    #[error("Device runtime error: {0}")]
    DeviceRuntime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RigError {
    /// Whether this error must abort before any hardware is touched.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            RigError::Configuration(_) | RigError::Config(_) | RigError::Calibration(_)
        )
    }
}

impl From<figment::Error> for RigError {
    fn from(value: figment::Error) -> Self {
        RigError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresponsive_error_carries_remediation() {
        let err = RigError::from(ConnectionFailure::Unresponsive);
        let msg = err.to_string();
        assert!(msg.contains("green light"));
        assert!(msg.contains("unplug"));
    }

    #[test]
    fn preflight_classification() {
        assert!(RigError::Configuration("missing port".into()).is_preflight());
        assert!(RigError::Calibration("stale".into()).is_preflight());
        assert!(!RigError::DeviceRuntime("link lost".into()).is_preflight());
        assert!(!RigError::from(ConnectionFailure::Unresponsive).is_preflight());
    }
}
