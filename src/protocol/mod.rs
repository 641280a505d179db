//! Declarative trial protocols.
//!
//! A trial is described as a directed graph of named states. Each state
//! carries a non-negative timer, zero or more output actions fired once on
//! entry, and a transition table keyed by event name. The reserved
//! [`TIMER_ELAPSED`] event fires when the state timer runs out, and the
//! reserved [`EXIT`] target ends the trial. The behavior controller
//! executes the graph autonomously; the host only compiles it, sends it,
//! and waits for the terminal state.
//!
//! [`StateMachineBuilder`] enforces the graph invariants at construction
//! time: a malformed protocol is a programmer error surfaced by
//! [`build`](StateMachineBuilder::build) (and by tests), never a runtime
//! condition the executor needs to handle. The per-experiment seam is the
//! [`Protocol`] trait; [`corridor`] is the concrete instantiation shipped
//! with this crate.

pub mod corridor;

use crate::device::transport::RawTrialData;
use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Reserved event name raised when a state's timer elapses.
pub const TIMER_ELAPSED: &str = "Tup";

/// Reserved transition target that terminates the trial.
pub const EXIT: &str = "exit";

/// Event name raised when global timer `index` expires.
pub fn global_timer_end(index: u8) -> String {
    format!("GlobalTimer{index}_End")
}

/// Output channel that arms a global timer on state entry.
pub const GLOBAL_TIMER_TRIGGER: &str = "GlobalTimerTrig";

/// One hardware output fired on state entry: a channel name and a value.
/// Values are evaluated once at entry and never interpolated; time-varying
/// behavior is expressed as a sequence of short states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputAction {
    pub channel: String,
    pub value: u8,
}

impl OutputAction {
    pub fn new(channel: impl Into<String>, value: u8) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

/// Named output actions registered on the device connection (serial
/// messages, softcodes) that protocols reference by name.
pub type ActionMap = HashMap<String, OutputAction>;

/// A single state being assembled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    /// Seconds; exactly 0 means "evaluate transitions immediately", used
    /// for zero-latency bookkeeping states.
    pub timer_secs: f64,
    pub outputs: Vec<OutputAction>,
    /// Event name to next-state name (or [`EXIT`]).
    pub transitions: BTreeMap<String, String>,
}

impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timer_secs: 0.0,
            outputs: Vec::new(),
            transitions: BTreeMap::new(),
        }
    }

    pub fn timer(mut self, secs: f64) -> Self {
        self.timer_secs = secs;
        self
    }

    pub fn output(mut self, action: OutputAction) -> Self {
        self.outputs.push(action);
        self
    }

    pub fn on(mut self, event: impl Into<String>, target: impl Into<String>) -> Self {
        self.transitions.insert(event.into(), target.into());
        self
    }
}

/// A session-wide timer armed by an output action and raising
/// `GlobalTimerN_End` when it expires, independent of the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalTimer {
    pub index: u8,
    pub secs: f64,
}

/// A validated, immutable trial program ready for transmission.
///
/// Built fresh every trial from the current trial parameters, owned by the
/// trial that built it, and discarded after execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledProtocol {
    states: Vec<State>,
    global_timers: Vec<GlobalTimer>,
}

impl CompiledProtocol {
    /// The initial state is the first one added.
    pub fn initial_state(&self) -> &State {
        &self.states[0]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn global_timers(&self) -> &[GlobalTimer] {
        &self.global_timers
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }
}

/// Builder enforcing the trial-graph invariants.
///
/// Invariants checked by [`build`](Self::build):
/// - at least one state; state names unique; timers finite and non-negative
/// - every transition target is a defined state or [`EXIT`]
/// - every state has at least one outgoing transition
/// - every state is reachable from the initial state
/// - [`EXIT`] is reachable from every state (no dead ends)
#[derive(Debug, Default)]
pub struct StateMachineBuilder {
    states: Vec<State>,
    global_timers: Vec<GlobalTimer>,
}

impl StateMachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm-able session timer; raises `GlobalTimerN_End` once triggered
    /// and expired.
    pub fn set_global_timer(&mut self, index: u8, secs: f64) -> &mut Self {
        self.global_timers.push(GlobalTimer { index, secs });
        self
    }

    /// Append a state. The first state added is the initial state.
    pub fn add_state(&mut self, state: State) -> &mut Self {
        self.states.push(state);
        self
    }

    pub fn build(self) -> RigResult<CompiledProtocol> {
        if self.states.is_empty() {
            return Err(construction_error("a protocol needs at least one state"));
        }

        let timer_events: HashSet<String> = self
            .global_timers
            .iter()
            .map(|t| global_timer_end(t.index))
            .collect();

        let mut names = HashSet::new();
        for state in &self.states {
            if state.name == EXIT {
                return Err(construction_error("'exit' is a reserved target name"));
            }
            if !names.insert(state.name.as_str()) {
                return Err(construction_error(&format!(
                    "duplicate state name '{}'",
                    state.name
                )));
            }
            if !state.timer_secs.is_finite() || state.timer_secs < 0.0 {
                return Err(construction_error(&format!(
                    "state '{}' has an invalid timer {}",
                    state.name, state.timer_secs
                )));
            }
            if state.transitions.is_empty() {
                return Err(construction_error(&format!(
                    "state '{}' has no outgoing transition and could never be left",
                    state.name
                )));
            }
            for (event, target) in &state.transitions {
                if target != EXIT && !self.states.iter().any(|s| &s.name == target) {
                    return Err(construction_error(&format!(
                        "state '{}' transitions on '{}' to undefined state '{}'",
                        state.name, event, target
                    )));
                }
                if event.starts_with("GlobalTimer") && !timer_events.contains(event) {
                    return Err(construction_error(&format!(
                        "state '{}' waits on '{}' but no such global timer is set",
                        state.name, event
                    )));
                }
            }
        }

        let protocol = CompiledProtocol {
            states: self.states,
            global_timers: self.global_timers,
        };
        check_reachability(&protocol)?;
        Ok(protocol)
    }
}

fn construction_error(message: &str) -> RigError {
    RigError::ProtocolConstruction(message.to_string())
}

/// Forward reachability from the initial state, and co-reachability of
/// exit from every state.
fn check_reachability(protocol: &CompiledProtocol) -> RigResult<()> {
    let index_of: HashMap<&str, usize> = protocol
        .states
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    // forward pass
    let mut seen = vec![false; protocol.states.len()];
    let mut queue = VecDeque::from([0usize]);
    seen[0] = true;
    while let Some(i) = queue.pop_front() {
        for target in protocol.states[i].transitions.values() {
            if let Some(&j) = index_of.get(target.as_str()) {
                if !seen[j] {
                    seen[j] = true;
                    queue.push_back(j);
                }
            }
        }
    }
    if let Some(i) = seen.iter().position(|s| !s) {
        return Err(construction_error(&format!(
            "state '{}' is unreachable from the initial state",
            protocol.states[i].name
        )));
    }

    // backward pass from exit
    let mut reaches_exit = vec![false; protocol.states.len()];
    let mut frontier: Vec<usize> = protocol
        .states
        .iter()
        .enumerate()
        .filter(|(_, s)| s.transitions.values().any(|t| t == EXIT))
        .map(|(i, _)| i)
        .collect();
    for &i in &frontier {
        reaches_exit[i] = true;
    }
    while let Some(i) = frontier.pop() {
        let name = protocol.states[i].name.clone();
        for (j, state) in protocol.states.iter().enumerate() {
            if !reaches_exit[j] && state.transitions.values().any(|t| *t == name) {
                reaches_exit[j] = true;
                frontier.push(j);
            }
        }
    }
    if let Some(i) = reaches_exit.iter().position(|s| !s) {
        return Err(construction_error(&format!(
            "exit is not reachable from state '{}'",
            protocol.states[i].name
        )));
    }
    Ok(())
}

/// Protocol-specific trial parameters. The common fields drive reward
/// delivery and bookkeeping; anything else goes into `extra` and is
/// persisted verbatim with the trial record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialParams {
    pub reward_amount_ul: f64,
    pub stimulus: Option<String>,
    /// Whether this trial's stimulus carries a reward
    pub rewarded: bool,
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Outcome flag derived from the raw trial data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Correct,
    Error,
    NoResponse,
}

/// Everything a protocol may consult while preparing the next trial.
pub struct TrialContext<'a> {
    pub trial_index: usize,
    /// Prior trial records; protocols may pick parameters from history.
    pub records: &'a [crate::session::TrialRecord],
    pub encoder: &'a crate::peripherals::encoder::RotaryEncoderHandle,
    pub view: &'a dyn crate::session::collaborators::CorridorView,
    pub task: &'a crate::config::TaskConfig,
}

/// The per-experiment instantiation seam of the trial compiler pattern.
///
/// One implementation per experiment; all share the compiled-graph data
/// shape. `prepare` runs before each trial (it draws parameters and arms
/// closed-loop tracking), `compile` turns parameters into a fresh graph,
/// and `trial_completed` reduces the raw device data to an outcome flag.
/// Optional branches (reward vs. omission, stimulus variants) must be
/// selected between at compile time by parameter, never by mutating an
/// already-sent graph.
#[async_trait]
pub trait Protocol: Send {
    /// Human-readable protocol name recorded in the session metadata.
    fn name(&self) -> &str;

    async fn prepare(&mut self, ctx: &mut TrialContext<'_>) -> RigResult<TrialParams>;

    fn compile(&self, params: &TrialParams, actions: &ActionMap) -> RigResult<CompiledProtocol>;

    fn trial_completed(&self, params: &TrialParams, raw: &RawTrialData) -> Outcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_chain() -> StateMachineBuilder {
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(State::new("start").timer(0.0).on(TIMER_ELAPSED, "open"))
            .add_state(
                State::new("open")
                    .timer(0.1)
                    .output(OutputAction::new("Valve1", 255))
                    .on(TIMER_ELAPSED, "close"),
            )
            .add_state(
                State::new("close")
                    .timer(0.4)
                    .output(OutputAction::new("Valve1", 0))
                    .on(TIMER_ELAPSED, EXIT),
            );
        builder
    }

    #[test]
    fn valid_chain_builds() {
        let protocol = pulse_chain().build().unwrap();
        assert_eq!(protocol.initial_state().name, "start");
        assert_eq!(protocol.states().len(), 3);
        let total: f64 = protocol.states().iter().map(|s| s.timer_secs).sum();
        assert!((total - 0.5).abs() < 1e-12);
    }

    #[test]
    fn undefined_target_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder.add_state(State::new("a").on(TIMER_ELAPSED, "nowhere"));
        let err = builder.build().unwrap_err();
        assert!(matches!(err, RigError::ProtocolConstruction(_)));
    }

    #[test]
    fn state_without_transitions_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(State::new("a").on(TIMER_ELAPSED, "b"))
            .add_state(State::new("b").timer(1.0));
        assert!(builder.build().is_err());
    }

    #[test]
    fn unreachable_state_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(State::new("a").on(TIMER_ELAPSED, EXIT))
            .add_state(State::new("orphan").on(TIMER_ELAPSED, EXIT));
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn dead_end_cycle_rejected() {
        // a -> b -> a with no path to exit
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(State::new("a").on(TIMER_ELAPSED, "b"))
            .add_state(State::new("b").on(TIMER_ELAPSED, "a"));
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[test]
    fn negative_timer_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder.add_state(State::new("a").timer(-1.0).on(TIMER_ELAPSED, EXIT));
        assert!(builder.build().is_err());
    }

    #[test]
    fn unarmed_global_timer_event_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder.add_state(
            State::new("a")
                .timer(0.1)
                .on(global_timer_end(1), EXIT)
                .on(TIMER_ELAPSED, "a"),
        );
        assert!(builder.build().is_err());
    }

    #[test]
    fn armed_global_timer_event_accepted() {
        let mut builder = StateMachineBuilder::new();
        builder.set_global_timer(1, 5.0);
        builder.add_state(
            State::new("loop")
                .timer(0.1)
                .output(OutputAction::new(GLOBAL_TIMER_TRIGGER, 1))
                .on(global_timer_end(1), EXIT)
                .on(TIMER_ELAPSED, "loop"),
        );
        assert!(builder.build().is_ok());
    }

    #[test]
    fn duplicate_state_name_rejected() {
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(State::new("a").on(TIMER_ELAPSED, EXIT))
            .add_state(State::new("a").on(TIMER_ELAPSED, EXIT));
        assert!(builder.build().is_err());
    }
}
