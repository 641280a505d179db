//! The virtual-corridor running task.
//!
//! The animal runs on a wheel through a virtual corridor shown on the
//! stimulus display. Each trial draws a wall stimulus; reaching the
//! reward zone (an encoder threshold crossing) delivers water when the
//! drawn stimulus is the rewarded one, and nothing otherwise. A trial
//! ends after the reward and its hold period, or when the trial clock
//! runs out with the animal short of the zone.

use crate::config::TaskConfig;
use crate::device::softcode::SoftEvent;
use crate::device::transport::{RawTrialData, SOFT_CODE_CHANNEL};
use crate::error::{RigError, RigResult};
use crate::peripherals::valve::{VALVE_CHANNEL, VALVE_CLOSED, VALVE_OPEN};
use crate::protocol::{
    global_timer_end, ActionMap, CompiledProtocol, OutputAction, Outcome, Protocol, State,
    StateMachineBuilder, TrialContext, TrialParams, EXIT, GLOBAL_TIMER_TRIGGER, TIMER_ELAPSED,
};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Logical action the session must map to a loaded serial message that
/// zeroes the wheel position counter.
pub const ACTION_ENCODER_RESET: &str = "rotary_encoder_reset";

/// Session-clock timer bounding the whole trial.
const TIMER_TRIAL: u8 = 1;
/// Hold period in the reward zone after the valve closes.
const TIMER_REWARD_ZONE: u8 = 2;

/// Valve dwell after closing, long enough for the solenoid to seat.
const VALVE_SETTLE_SECS: f64 = 0.001;

pub struct CorridorProtocol {
    task: TaskConfig,
    /// Device event raised when the wheel reaches the reward zone.
    reward_event: String,
}

impl CorridorProtocol {
    pub fn new(task: TaskConfig, reward_event: String) -> Self {
        Self { task, reward_event }
    }

    /// Draw the trial's stimulus: the rewarded one with the configured
    /// probability, otherwise uniformly among the rest.
    fn draw_stimulus(&self) -> (Option<String>, bool) {
        let rewarded_stimulus = match &self.task.rewarded_stimulus {
            Some(s) => s.clone(),
            None => return (None, false),
        };
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.task.reward_probability) {
            return (Some(rewarded_stimulus), true);
        }
        let others: Vec<&String> = self
            .task
            .stimuli
            .iter()
            .filter(|s| **s != rewarded_stimulus)
            .collect();
        match others.choose(&mut rng) {
            Some(other) => (Some((*other).clone()), false),
            // nothing to draw against, every trial shows the rewarded wall
            None => (Some(rewarded_stimulus), true),
        }
    }
}

#[async_trait]
impl Protocol for CorridorProtocol {
    fn name(&self) -> &str {
        "corridor"
    }

    async fn prepare(&mut self, ctx: &mut TrialContext<'_>) -> RigResult<TrialParams> {
        let (stimulus, rewarded) = self.draw_stimulus();
        if let Some(stimulus) = &stimulus {
            ctx.view.select_stimulus(stimulus)?;
        }
        // reset and threshold programming go together at the start of
        // closed-loop tracking
        ctx.encoder.reset_position().await?;
        ctx.encoder.set_thresholds().await?;
        debug!(trial = ctx.trial_index, ?stimulus, rewarded, "trial prepared");
        Ok(TrialParams {
            reward_amount_ul: self.task.reward_amount_ul,
            stimulus,
            rewarded,
            extra: serde_json::Value::Null,
        })
    }

    fn compile(&self, params: &TrialParams, actions: &ActionMap) -> RigResult<CompiledProtocol> {
        let encoder_reset = actions.get(ACTION_ENCODER_RESET).cloned().ok_or_else(|| {
            RigError::ProtocolConstruction(format!(
                "required action '{ACTION_ENCODER_RESET}' is not mapped"
            ))
        })?;
        let frame_secs = 1.0 / self.task.screen_refresh_hz;
        let valve_value = if params.rewarded { VALVE_OPEN } else { VALVE_CLOSED };

        let mut builder = StateMachineBuilder::new();
        builder.set_global_timer(TIMER_TRIAL, self.task.max_trial_time_secs);
        builder.set_global_timer(TIMER_REWARD_ZONE, self.task.reward_zone_time_secs);
        builder
            .add_state(
                State::new("trial_start")
                    .timer(0.0)
                    .output(OutputAction::new(GLOBAL_TIMER_TRIGGER, TIMER_TRIAL))
                    .on(TIMER_ELAPSED, "reset_rotary_encoder"),
            )
            .add_state(
                State::new("reset_rotary_encoder")
                    .timer(0.0)
                    .output(encoder_reset)
                    .on(TIMER_ELAPSED, "play_tone"),
            )
            .add_state(
                State::new("play_tone")
                    .timer(0.0)
                    .output(OutputAction::new(
                        SOFT_CODE_CHANNEL,
                        SoftEvent::PlayTone.code(),
                    ))
                    .on(TIMER_ELAPSED, "trigger_display"),
            )
            .add_state(
                State::new("trigger_display")
                    .timer(0.0)
                    .output(OutputAction::new(
                        SOFT_CODE_CHANNEL,
                        SoftEvent::AdvanceDisplay.code(),
                    ))
                    .on(TIMER_ELAPSED, "transition"),
            )
            // closed-loop frame tick: redraw until the reward zone is
            // reached or a session timer fires
            .add_state(
                State::new("transition")
                    .timer(frame_secs)
                    .on(self.reward_event.as_str(), "reward_on")
                    .on(global_timer_end(TIMER_TRIAL), EXIT)
                    .on(global_timer_end(TIMER_REWARD_ZONE), "trigger_iti")
                    .on(TIMER_ELAPSED, "trigger_display"),
            )
            .add_state(
                State::new("reward_on")
                    .timer(self.task.solenoid_open_secs)
                    .output(OutputAction::new(VALVE_CHANNEL, valve_value))
                    .output(OutputAction::new(GLOBAL_TIMER_TRIGGER, TIMER_REWARD_ZONE))
                    .on(TIMER_ELAPSED, "reward_off"),
            )
            .add_state(
                State::new("reward_off")
                    .timer(VALVE_SETTLE_SECS)
                    .output(OutputAction::new(VALVE_CHANNEL, VALVE_CLOSED))
                    .on(TIMER_ELAPSED, "trigger_display"),
            )
            .add_state(
                State::new("trigger_iti")
                    .timer(0.0)
                    .output(OutputAction::new(
                        SOFT_CODE_CHANNEL,
                        SoftEvent::InterTrialInterval.code(),
                    ))
                    .on(TIMER_ELAPSED, "iti"),
            )
            .add_state(
                State::new("iti")
                    .timer(self.task.iti_secs)
                    .on(TIMER_ELAPSED, EXIT),
            );
        builder.build()
    }

    fn trial_completed(&self, params: &TrialParams, raw: &RawTrialData) -> Outcome {
        if raw.has_event(&self.reward_event) {
            if params.rewarded {
                Outcome::Correct
            } else {
                Outcome::Error
            }
        } else {
            Outcome::NoResponse
        }
    }
}
