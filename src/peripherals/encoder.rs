//! Rotary encoder module: position thresholds and closed-loop tracking.
//!
//! The encoder module sits on its own serial port and raises named events
//! through the behavior controller when the wheel crosses programmed
//! position thresholds. Thresholds are rebuilt whenever the encoder's zero
//! position or trial context changes; `reset_position` and
//! `set_thresholds` must be called together at the start of closed-loop
//! tracking (a caller contract, not a runtime check).

use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// The encoder firmware always expects this many enable flags, no matter
/// how many thresholds are actually set.
pub const FIRMWARE_THRESHOLD_SLOTS: usize = 8;

/// Event-name prefix the controller assigns to threshold crossings.
pub const THRESHOLD_EVENT_PREFIX: &str = "RotaryEncoder1_";

/// Degrees between consecutive thresholds.
const THRESHOLD_SPACING_DEG: f64 = 1.0;

/// Module command bytes (encoder firmware serial interface).
pub const CMD_SET_ZERO_POSITION: u8 = b'Z';

/// Wire command re-arming threshold event transmission.
pub const CMD_ENABLE_THRESHOLDS: u8 = b'E';

/// Ordered set of encoder-position thresholds with their generated event
/// names and wire-order enable flags.
#[derive(Debug, Clone)]
pub struct ThresholdSet {
    thresholds: Vec<f64>,
}

impl ThresholdSet {
    /// Evenly-spaced thresholds starting at the reward-triggering
    /// position, in degrees of forward wheel rotation.
    pub fn for_position(position_at_reward: f64, count: usize) -> Self {
        let thresholds = (0..count)
            .map(|i| position_at_reward + i as f64 * THRESHOLD_SPACING_DEG)
            .collect();
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }

    /// Deterministic event name for threshold `i` (0-based; events are
    /// numbered from 1 on the wire).
    pub fn event_name(&self, i: usize) -> String {
        format!("{THRESHOLD_EVENT_PREFIX}{}", i + 1)
    }

    pub fn event_names(&self) -> Vec<String> {
        (0..self.thresholds.len()).map(|i| self.event_name(i)).collect()
    }

    /// Enable flags in the order the firmware expects: padded to
    /// [`FIRMWARE_THRESHOLD_SLOTS`] entries and then reversed.
    ///
    /// The reversal is a firmware quirk; it has been verified against
    /// hardware and must be preserved exactly. Do not "fix" the ordering
    /// without validating against the encoder module.
    pub fn enable_flags_wire_order(&self) -> Vec<bool> {
        let mut flags = vec![true; self.thresholds.len()];
        while flags.len() < FIRMWARE_THRESHOLD_SLOTS {
            flags.push(false);
        }
        flags.reverse();
        flags
    }
}

/// Link to the encoder module over its own serial port.
///
/// # Contract
/// - positions are degrees, positive in the direction of forward running
/// - `program_thresholds` takes flags already in wire order
#[async_trait]
pub trait EncoderLink: Send + Sync {
    async fn set_zero_position(&mut self) -> RigResult<()>;
    async fn set_position(&mut self, degrees: f64) -> RigResult<()>;
    async fn program_thresholds(
        &mut self,
        thresholds: &[f64],
        enable_flags_wire_order: &[bool],
    ) -> RigResult<()>;
    async fn enable_event_transmission(&mut self) -> RigResult<()>;
    /// Continuous position streaming interferes with point reads.
    async fn disable_stream(&mut self) -> RigResult<()>;
    /// Wrap point 0 disables wrapping so turns need not be counted.
    async fn set_wrap_point(&mut self, wrap: u16) -> RigResult<()>;
    async fn current_position(&mut self) -> RigResult<f64>;
    async fn close(&mut self) -> RigResult<()>;
}

/// Handle owning the encoder link and the current threshold set.
pub struct RotaryEncoderHandle {
    threshold_set: ThresholdSet,
    link: Mutex<Option<Box<dyn EncoderLink>>>,
}

impl RotaryEncoderHandle {
    pub fn new(position_at_reward: f64, threshold_count: usize) -> Self {
        Self {
            threshold_set: ThresholdSet::for_position(position_at_reward, threshold_count),
            link: Mutex::new(None),
        }
    }

    pub fn threshold_set(&self) -> &ThresholdSet {
        &self.threshold_set
    }

    /// Event raised when the wheel reaches the reward zone.
    pub fn reward_event(&self) -> String {
        self.threshold_set.event_name(0)
    }

    /// Attach and configure the link: zero the position, program the
    /// thresholds, enable event transmission, disable wrapping.
    pub async fn connect(&self, mut link: Box<dyn EncoderLink>) -> RigResult<()> {
        // Point reads don't work while the module is streaming.
        link.disable_stream().await?;
        link.set_zero_position().await?;
        link.program_thresholds(
            self.threshold_set.thresholds(),
            &self.threshold_set.enable_flags_wire_order(),
        )
        .await?;
        link.enable_event_transmission().await?;
        link.set_wrap_point(0).await?;
        *self.link.lock().await = Some(link);
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    /// Zero the encoder. Call together with [`set_thresholds`] whenever a
    /// new trial begins closed-loop tracking.
    ///
    /// [`set_thresholds`]: Self::set_thresholds
    pub async fn reset_position(&self) -> RigResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("rotary encoder is not connected".into()))?;
        link.set_position(0.0).await?;
        link.set_zero_position().await
    }

    /// Reprogram the current threshold set relative to the (freshly reset)
    /// zero position.
    pub async fn set_thresholds(&self) -> RigResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("rotary encoder is not connected".into()))?;
        link.program_thresholds(
            self.threshold_set.thresholds(),
            &self.threshold_set.enable_flags_wire_order(),
        )
        .await
    }

    pub async fn current_position(&self) -> RigResult<f64> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("rotary encoder is not connected".into()))?;
        link.current_position().await
    }

    pub async fn close(&self) -> RigResult<()> {
        if let Some(mut link) = self.link.lock().await.take() {
            link.close().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Mock link
// =============================================================================

#[derive(Debug, Default)]
struct MockEncoderState {
    position: f64,
    zeroed: u32,
    programmed: Vec<(Vec<f64>, Vec<bool>)>,
    streaming_disabled: bool,
    events_enabled: bool,
    wrap_point: Option<u16>,
    closed: bool,
}

/// Shared-state test double; clones observe the same link.
#[derive(Debug, Clone, Default)]
pub struct MockEncoderLink {
    state: Arc<StdMutex<MockEncoderState>>,
}

impl MockEncoderLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the simulated wheel.
    pub fn turn_to(&self, degrees: f64) {
        self.state.lock().expect("mock lock").position = degrees;
    }

    pub fn programmed_thresholds(&self) -> Vec<(Vec<f64>, Vec<bool>)> {
        self.state.lock().expect("mock lock").programmed.clone()
    }

    pub fn zero_count(&self) -> u32 {
        self.state.lock().expect("mock lock").zeroed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("mock lock").closed
    }
}

#[async_trait]
impl EncoderLink for MockEncoderLink {
    async fn set_zero_position(&mut self) -> RigResult<()> {
        let mut state = self.state.lock().expect("mock lock");
        state.position = 0.0;
        state.zeroed += 1;
        Ok(())
    }

    async fn set_position(&mut self, degrees: f64) -> RigResult<()> {
        self.state.lock().expect("mock lock").position = degrees;
        Ok(())
    }

    async fn program_thresholds(
        &mut self,
        thresholds: &[f64],
        enable_flags_wire_order: &[bool],
    ) -> RigResult<()> {
        self.state
            .lock()
            .expect("mock lock")
            .programmed
            .push((thresholds.to_vec(), enable_flags_wire_order.to_vec()));
        Ok(())
    }

    async fn enable_event_transmission(&mut self) -> RigResult<()> {
        self.state.lock().expect("mock lock").events_enabled = true;
        Ok(())
    }

    async fn disable_stream(&mut self) -> RigResult<()> {
        self.state.lock().expect("mock lock").streaming_disabled = true;
        Ok(())
    }

    async fn set_wrap_point(&mut self, wrap: u16) -> RigResult<()> {
        self.state.lock().expect("mock lock").wrap_point = Some(wrap);
        Ok(())
    }

    async fn current_position(&mut self) -> RigResult<f64> {
        Ok(self.state.lock().expect("mock lock").position)
    }

    async fn close(&mut self) -> RigResult<()> {
        self.state.lock().expect("mock lock").closed = true;
        Ok(())
    }
}
