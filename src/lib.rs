//! Controller for wheel-based behavioral neuroscience rigs.
//!
//! The crate drives one rig: a serial behavior controller executing
//! per-trial state machines, a rotary encoder on the running wheel, a
//! solenoid reward valve, a light-threshold sensor on the stimulus
//! display, and audio cues. A session brings the hardware up in a fixed
//! order, runs trials compiled fresh from a [`protocol::Protocol`]
//! implementation, appends each completed trial to an on-disk JSON-lines
//! log, and tears everything down in reverse.
//!
//! The serial link to real hardware is behind the `instrument_serial`
//! feature; everything else runs against in-process test doubles, which
//! is also how the test suite exercises whole sessions.

pub mod calibration;
pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod peripherals;
pub mod protocol;
pub mod session;

pub use capability::{CapabilityId, HardwareFactories, Rig};
pub use config::RigConfig;
pub use error::{RigError, RigResult};
pub use session::runner::{Collaborators, SessionRunner, SessionSummary};
