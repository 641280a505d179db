//! Behavioral contract of the link to the behavior controller.
//!
//! The wire-level byte protocol is firmware territory and deliberately not
//! specified here; [`Transport`] captures only what the rest of the crate
//! relies on: send a compiled program, block until the device reports a
//! terminal state, and hand back the per-trial event log. The serial
//! implementation lives behind the `instrument_serial` feature;
//! [`MockTransport`] is the test double used everywhere else.

use crate::error::{ConnectionFailure, RigError, RigResult};
use crate::protocol::{
    global_timer_end, CompiledProtocol, EXIT, GLOBAL_TIMER_TRIGGER, TIMER_ELAPSED,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Channel name of the out-of-band soft-event output action.
pub const SOFT_CODE_CHANNEL: &str = "SoftCode";

/// Peripheral modules addressable through the controller's serial relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SerialModule {
    RotaryEncoder,
    SoundCard,
}

impl SerialModule {
    /// Output channel carrying messages to this module.
    pub fn channel(&self) -> &'static str {
        match self {
            SerialModule::RotaryEncoder => "Serial1",
            SerialModule::SoundCard => "Serial3",
        }
    }
}

/// One state occupancy reported by the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateOccurrence {
    pub name: String,
    pub entry_secs: f64,
    pub exit_secs: f64,
}

/// One discrete event reported by the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOccurrence {
    pub name: String,
    pub time_secs: f64,
}

/// Raw per-trial event log harvested after the terminal state.
/// Timestamps are in seconds on the device clock, relative to trial start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTrialData {
    pub trial_start_secs: f64,
    pub trial_end_secs: f64,
    pub states: Vec<StateOccurrence>,
    pub events: Vec<EventOccurrence>,
}

impl RawTrialData {
    /// All event timestamps whose name contains `channel` (sync lines and
    /// input ports are matched by substring, e.g. "BNC1" matches
    /// "BNC1High" and "BNC1Low").
    pub fn events_on(&self, channel: &str) -> Vec<f64> {
        self.events
            .iter()
            .filter(|e| e.name.contains(channel))
            .map(|e| e.time_secs)
            .collect()
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.name == name)
    }

    /// Total time spent inside states, i.e. the trial's state-machine
    /// elapsed time.
    pub fn total_state_secs(&self) -> f64 {
        self.states.iter().map(|s| s.exit_secs - s.entry_secs).sum()
    }
}

/// Async contract the controller connection is built on.
///
/// # Contract
/// - `open` establishes the physical link; callers retry it, the transport
///   does not retry internally
/// - `run_program` parks the caller until the last sent program reaches a
///   terminal state or the link fails; mid-trial failures surface as
///   [`RigError::DeviceRuntime`]
/// - `take_soft_events` yields the out-of-band notification channel once;
///   raw codes are decoded by the softcode layer
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&mut self) -> RigResult<()>;

    /// Store a serial-relay message under `index` for later use as an
    /// output action.
    async fn load_serial_message(
        &mut self,
        module: SerialModule,
        index: u8,
        payload: Vec<u8>,
    ) -> RigResult<()>;

    async fn send_program(&mut self, program: &CompiledProtocol) -> RigResult<()>;

    async fn run_program(&mut self) -> RigResult<RawTrialData>;

    /// Drive an output channel directly, outside any protocol.
    async fn manual_override(&mut self, channel: &str, value: u8) -> RigResult<()>;

    /// Returns false when the attached firmware cannot control the
    /// indicator.
    async fn set_status_led(&mut self, enabled: bool) -> RigResult<bool>;

    /// Out-of-band soft-event byte stream; `None` once taken.
    fn take_soft_events(&mut self) -> Option<mpsc::UnboundedReceiver<u8>>;

    async fn close(&mut self) -> RigResult<()>;
}

// =============================================================================
// Mock transport
// =============================================================================

#[derive(Debug, Default)]
struct MockInner {
    opened: bool,
    closed: bool,
    /// Remaining `open` calls that fail before one succeeds
    open_failures_left: u32,
    /// Open failures present as device-unresponsive instead of port errors
    unresponsive: bool,
    status_led_supported: bool,
    status_led: Option<bool>,
    program: Option<CompiledProtocol>,
    serial_messages: HashMap<(SerialModule, u8), Vec<u8>>,
    overrides: Vec<(String, u8)>,
    /// Per-trial scripted device events, consumed one list per run
    scripted_events: VecDeque<Vec<String>>,
    /// Which sync lines this rig "has attached"
    sync_lines: Vec<&'static str>,
    /// Fail the nth run_program call (0-based) with a runtime error
    fail_run_at: Option<usize>,
    runs: usize,
}

/// Synthetic behavior controller.
///
/// Executes a sent program by walking the graph: timer transitions fire at
/// their nominal times, armed global timers expire on schedule, and
/// scripted events (e.g. an encoder threshold crossing) fire while a state
/// that handles them is active. The walk is instantaneous in wall-clock
/// terms; timestamps in the returned [`RawTrialData`] are simulated device
/// time. Clones share state so tests can keep a handle for inspection
/// while the connection owns another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
    soft_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<u8>>>>,
    soft_tx: Arc<Mutex<Option<mpsc::UnboundedSender<u8>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let mock = Self::default();
        {
            let mut inner = mock.inner.lock().expect("mock lock");
            inner.status_led_supported = true;
            inner.sync_lines = vec!["BNC1", "BNC2", "Port1"];
        }
        *mock.soft_tx.lock().expect("mock lock") = Some(tx);
        *mock.soft_rx.lock().expect("mock lock") = Some(rx);
        mock
    }

    /// Fail the next `count` open attempts as port-open errors.
    pub fn with_open_failures(self, count: u32) -> Self {
        self.inner.lock().expect("mock lock").open_failures_left = count;
        self
    }

    /// Open failures present as the green-light-but-dead state.
    pub fn with_unresponsive_device(self) -> Self {
        let mut inner = self.inner.lock().expect("mock lock");
        inner.unresponsive = true;
        inner.open_failures_left = u32::MAX;
        drop(inner);
        self
    }

    /// Simulate firmware without status-indicator support.
    pub fn without_status_led(self) -> Self {
        self.inner.lock().expect("mock lock").status_led_supported = false;
        self
    }

    /// Restrict which sync lines emit pulses (default: all three).
    pub fn with_sync_lines(self, lines: Vec<&'static str>) -> Self {
        self.inner.lock().expect("mock lock").sync_lines = lines;
        self
    }

    /// Fail the nth `run_program` call (0-based) with a link error.
    pub fn failing_run_at(self, run: usize) -> Self {
        self.inner.lock().expect("mock lock").fail_run_at = Some(run);
        self
    }

    /// Queue device events for one upcoming trial (consumed in order, one
    /// list per run). Events fire while a state handling them is active.
    pub fn push_trial_events(&self, events: Vec<&str>) {
        self.inner
            .lock()
            .expect("mock lock")
            .scripted_events
            .push_back(events.into_iter().map(String::from).collect());
    }

    /// Channel/value pairs driven via `manual_override`.
    pub fn overrides(&self) -> Vec<(String, u8)> {
        self.inner.lock().expect("mock lock").overrides.clone()
    }

    /// Payload stored for a serial-relay message slot.
    pub fn serial_message(&self, module: SerialModule, index: u8) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .expect("mock lock")
            .serial_messages
            .get(&(module, index))
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("mock lock").closed
    }

    pub fn runs(&self) -> usize {
        self.inner.lock().expect("mock lock").runs
    }

    fn simulate(
        program: &CompiledProtocol,
        mut scripted: Vec<String>,
        sync_lines: &[&'static str],
        soft_tx: Option<&mpsc::UnboundedSender<u8>>,
    ) -> RigResult<RawTrialData> {
        const MAX_STEPS: usize = 100_000;

        let mut raw = RawTrialData::default();
        let mut armed_timers: HashMap<u8, f64> = HashMap::new();
        let mut clock = 0.0_f64;
        let mut current = program.initial_state().name.clone();

        for line in sync_lines {
            raw.events.push(EventOccurrence {
                name: format!("{line}High"),
                time_secs: 0.001,
            });
        }

        for step in 0..=MAX_STEPS {
            if step == MAX_STEPS {
                return Err(RigError::DeviceRuntime(
                    "simulated program exceeded the step budget without exiting".into(),
                ));
            }
            let state = program
                .state(&current)
                .ok_or_else(|| RigError::DeviceRuntime(format!("unknown state '{current}'")))?;

            let entry = clock;
            for action in &state.outputs {
                if action.channel == GLOBAL_TIMER_TRIGGER {
                    if let Some(timer) = program
                        .global_timers()
                        .iter()
                        .find(|t| t.index == action.value)
                    {
                        armed_timers.insert(timer.index, entry + timer.secs);
                    }
                }
                if action.channel == SOFT_CODE_CHANNEL {
                    if let Some(tx) = soft_tx {
                        let _ = tx.send(action.value);
                    }
                }
            }

            let timer_deadline = entry + state.timer_secs;

            // earliest applicable event wins; scripted events take priority
            // at equal times so tests behave deterministically
            let mut fired: Option<(String, f64)> = None;

            if let Some(pos) = scripted
                .iter()
                .position(|e| state.transitions.contains_key(e))
            {
                let name = scripted.remove(pos);
                fired = Some((name, entry + state.timer_secs * 0.5));
            }

            for (&index, &end) in &armed_timers {
                let event = global_timer_end(index);
                if state.transitions.contains_key(&event) && end <= timer_deadline {
                    let candidate_time = end.max(entry);
                    if fired.as_ref().map_or(true, |(_, t)| candidate_time < *t) {
                        fired = Some((event, candidate_time));
                    }
                }
            }

            let (event, time) = match fired {
                Some(hit) => hit,
                None if state.transitions.contains_key(TIMER_ELAPSED) => {
                    (TIMER_ELAPSED.to_string(), timer_deadline)
                }
                None => {
                    return Err(RigError::DeviceRuntime(format!(
                        "state '{current}' has no applicable transition in simulation"
                    )))
                }
            };

            raw.states.push(StateOccurrence {
                name: current.clone(),
                entry_secs: entry,
                exit_secs: time,
            });
            raw.events.push(EventOccurrence {
                name: event.clone(),
                time_secs: time,
            });
            clock = time;

            let target = &state.transitions[&event];
            if target == EXIT {
                break;
            }
            current = target.clone();
        }

        raw.trial_end_secs = clock;
        Ok(raw)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> RigResult<()> {
        let mut inner = self.inner.lock().expect("mock lock");
        if inner.open_failures_left > 0 {
            inner.open_failures_left -= 1;
            return Err(if inner.unresponsive {
                ConnectionFailure::Unresponsive.into()
            } else {
                ConnectionFailure::OpenFailed {
                    port: "mock".into(),
                    reason: "simulated open failure".into(),
                }
                .into()
            });
        }
        inner.opened = true;
        Ok(())
    }

    async fn load_serial_message(
        &mut self,
        module: SerialModule,
        index: u8,
        payload: Vec<u8>,
    ) -> RigResult<()> {
        self.inner
            .lock()
            .expect("mock lock")
            .serial_messages
            .insert((module, index), payload);
        Ok(())
    }

    async fn send_program(&mut self, program: &CompiledProtocol) -> RigResult<()> {
        self.inner.lock().expect("mock lock").program = Some(program.clone());
        Ok(())
    }

    async fn run_program(&mut self) -> RigResult<RawTrialData> {
        let (program, scripted, sync_lines) = {
            let mut inner = self.inner.lock().expect("mock lock");
            let run = inner.runs;
            inner.runs += 1;
            if inner.fail_run_at == Some(run) {
                return Err(RigError::DeviceRuntime(
                    "simulated link failure while the program was running".into(),
                ));
            }
            let program = inner.program.clone().ok_or_else(|| {
                RigError::DeviceRuntime("run_program called before send_program".into())
            })?;
            let scripted = inner.scripted_events.pop_front().unwrap_or_default();
            (program, scripted, inner.sync_lines.clone())
        };
        let soft_tx = self.soft_tx.lock().expect("mock lock").clone();
        Self::simulate(&program, scripted, &sync_lines, soft_tx.as_ref())
    }

    async fn manual_override(&mut self, channel: &str, value: u8) -> RigResult<()> {
        self.inner
            .lock()
            .expect("mock lock")
            .overrides
            .push((channel.to_string(), value));
        Ok(())
    }

    async fn set_status_led(&mut self, enabled: bool) -> RigResult<bool> {
        let mut inner = self.inner.lock().expect("mock lock");
        if inner.status_led_supported {
            inner.status_led = Some(enabled);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn take_soft_events(&mut self) -> Option<mpsc::UnboundedReceiver<u8>> {
        self.soft_rx.lock().expect("mock lock").take()
    }

    async fn close(&mut self) -> RigResult<()> {
        // dropping the sender ends any attached soft-event consumer
        *self.soft_tx.lock().expect("mock lock") = None;
        let mut inner = self.inner.lock().expect("mock lock");
        inner.closed = true;
        inner.opened = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OutputAction, State, StateMachineBuilder};

    fn pulse_program() -> CompiledProtocol {
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
        builder.build().expect("valid program")
    }

    #[tokio::test]
    async fn simulated_chain_elapses_the_summed_timers() {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();
        mock.send_program(&pulse_program()).await.unwrap();
        let raw = mock.run_program().await.unwrap();
        assert_eq!(raw.states.len(), 3);
        assert!((raw.total_state_secs() - 0.5).abs() < 1e-9);
        assert!((raw.trial_end_secs - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sync_lines_emit_pulses_by_default() {
        let mut mock = MockTransport::new();
        mock.send_program(&pulse_program()).await.unwrap();
        let raw = mock.run_program().await.unwrap();
        assert!(!raw.events_on("BNC1").is_empty());
        assert!(!raw.events_on("BNC2").is_empty());
        assert!(!raw.events_on("Port1").is_empty());
    }

    #[tokio::test]
    async fn missing_sync_lines_emit_nothing() {
        let mut mock = MockTransport::new().with_sync_lines(vec!["BNC1"]);
        mock.send_program(&pulse_program()).await.unwrap();
        let raw = mock.run_program().await.unwrap();
        assert!(!raw.events_on("BNC1").is_empty());
        assert!(raw.events_on("Port1").is_empty());
    }

    #[tokio::test]
    async fn global_timer_breaks_a_tup_loop() {
        let mut builder = StateMachineBuilder::new();
        builder.set_global_timer(1, 1.0);
        builder
            .add_state(
                State::new("arm")
                    .timer(0.0)
                    .output(OutputAction::new(GLOBAL_TIMER_TRIGGER, 1))
                    .on(TIMER_ELAPSED, "spin"),
            )
            .add_state(
                State::new("spin")
                    .timer(0.1)
                    .on(TIMER_ELAPSED, "spin")
                    .on(global_timer_end(1), EXIT),
            );
        let program = builder.build().unwrap();

        let mut mock = MockTransport::new();
        mock.send_program(&program).await.unwrap();
        let raw = mock.run_program().await.unwrap();
        assert!((raw.trial_end_secs - 1.0).abs() < 1e-9);
        assert!(raw.has_event(&global_timer_end(1)));
    }

    #[tokio::test]
    async fn scripted_event_takes_the_branch() {
        let mut builder = StateMachineBuilder::new();
        builder
            .add_state(
                State::new("wait")
                    .timer(10.0)
                    .on("RotaryEncoder1_1", "hit")
                    .on(TIMER_ELAPSED, EXIT),
            )
            .add_state(State::new("hit").timer(0.0).on(TIMER_ELAPSED, EXIT));
        let program = builder.build().unwrap();

        let mut mock = MockTransport::new();
        mock.push_trial_events(vec!["RotaryEncoder1_1"]);
        mock.send_program(&program).await.unwrap();
        let raw = mock.run_program().await.unwrap();
        assert!(raw.has_event("RotaryEncoder1_1"));
        assert!(raw.states.iter().any(|s| s.name == "hit"));
        // fired halfway through the waiting state's timer
        assert!((raw.trial_end_secs - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn soft_codes_are_delivered_out_of_band() {
        let mut builder = StateMachineBuilder::new();
        builder.add_state(
            State::new("ping")
                .timer(0.0)
                .output(OutputAction::new(SOFT_CODE_CHANNEL, 6))
                .on(TIMER_ELAPSED, EXIT),
        );
        let program = builder.build().unwrap();

        let mut mock = MockTransport::new();
        let mut rx = mock.take_soft_events().expect("receiver available once");
        assert!(mock.take_soft_events().is_none());
        mock.send_program(&program).await.unwrap();
        mock.run_program().await.unwrap();
        assert_eq!(rx.recv().await, Some(6));
    }

    #[tokio::test]
    async fn run_without_program_is_a_runtime_error() {
        let mut mock = MockTransport::new();
        let err = mock.run_program().await.unwrap_err();
        assert!(matches!(err, RigError::DeviceRuntime(_)));
    }
}
