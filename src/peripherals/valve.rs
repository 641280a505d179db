//! Reward valve driver.
//!
//! The valve is an output channel of the behavior controller; during
//! trials it is driven by protocol output actions, and outside trials it
//! can be pulsed directly for flushing and calibration checks. The handle
//! carries the calibration curve so reward volumes translate to open
//! times in one place.

use crate::calibration::CalibrationCurve;
use crate::device::Controller;
use crate::error::RigResult;
use std::time::Duration;

/// Controller output channel of the reward valve.
pub const VALVE_CHANNEL: &str = "Valve1";

pub const VALVE_OPEN: u8 = 255;
pub const VALVE_CLOSED: u8 = 0;

/// Default flush duration in seconds.
const FLUSH_SECS: f64 = 1.0;

pub struct Valve {
    curve: CalibrationCurve,
}

impl Valve {
    pub fn new(curve: CalibrationCurve) -> Self {
        Self { curve }
    }

    pub fn curve(&self) -> &CalibrationCurve {
        &self.curve
    }

    /// Valve-open duration (seconds) delivering `volume_ul`.
    pub fn time_for_volume(&self, volume_ul: f64) -> f64 {
        self.curve.time_for_volume(volume_ul)
    }

    /// Open the valve for a fixed duration via manual override, outside
    /// any running protocol.
    pub async fn open_for(&self, controller: &Controller, secs: f64) -> RigResult<()> {
        controller.manual_override(VALVE_CHANNEL, VALVE_OPEN).await?;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        controller.manual_override(VALVE_CHANNEL, VALVE_CLOSED).await
    }

    /// Flush the line.
    pub async fn flush(&self, controller: &Controller) -> RigResult<()> {
        self.open_for(controller, FLUSH_SECS).await
    }
}
