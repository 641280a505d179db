//! The trial loop.
//!
//! A runner owns a started rig and one protocol and drives trials until
//! the configured count is reached, the operator requests a stop, or the
//! device link fails. Lifecycle:
//!
//! ```text
//! Idle -> Running <-> Paused
//!            |
//!            v
//!        Stopping -> Terminated
//! ```
//!
//! Operator control is filesystem markers checked at every trial
//! boundary, including before the first trial. Ctrl-C does not kill the
//! process; it touches the stop marker so the trial in flight still
//! completes and persists.

use crate::capability::Rig;
use crate::device::softcode::SoftEventHandler;
use crate::device::transport::{RawTrialData, SerialModule};
use crate::error::RigResult;
use crate::peripherals::encoder::{CMD_ENABLE_THRESHOLDS, CMD_SET_ZERO_POSITION};
use crate::protocol::corridor::ACTION_ENCODER_RESET;
use crate::protocol::{ActionMap, Outcome, OutputAction, Protocol, TrialContext};
use crate::session::collaborators::{
    finalize_best_effort, register_best_effort, CameraTrigger, CorridorView, SessionRegistry,
};
use crate::session::{
    SessionInfo, SessionPaths, SessionSettings, SessionStatus, SessionTotals, TrialRecord,
    TrialStore,
};
use chrono::Utc;
use std::fs::File;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Poll interval for the pause marker.
const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Grace period at the trial boundary for soft codes still queued in the
/// pump, so a late wheel sample lands in the trial that produced it.
const SOFT_EVENT_SETTLE: Duration = Duration::from_millis(20);

/// Sync lines expected to pulse during a trial.
const SYNC_LINES: [&str; 3] = ["BNC1", "BNC2", "Port1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Terminated,
}

/// What a finished session amounted to.
#[derive(Debug)]
pub struct SessionSummary {
    pub status: SessionStatus,
    pub trials_completed: usize,
    pub paths: SessionPaths,
}

/// External collaborators injected into the runner.
pub struct Collaborators {
    pub view: Arc<dyn CorridorView>,
    pub camera: Arc<dyn CameraTrigger>,
    pub registry: Arc<dyn SessionRegistry>,
}

pub struct SessionRunner {
    rig: Rig,
    protocol: Box<dyn Protocol>,
    collaborators: Collaborators,
    info: SessionInfo,
    paths: SessionPaths,
    settings: SessionSettings,
    actions: ActionMap,
    state: RunState,
    soft_pump: Option<JoinHandle<()>>,
    /// Wheel positions sampled by the soft-event pump, drained per trial.
    position_log: Arc<StdMutex<Vec<f64>>>,
}

impl SessionRunner {
    /// Bring up the hardware, then create the session directory and write
    /// the settings snapshot. Hardware comes first so a rig that cannot
    /// start leaves no empty session directory behind.
    pub async fn start(
        mut rig: Rig,
        protocol: Box<dyn Protocol>,
        collaborators: Collaborators,
        subject: &str,
    ) -> RigResult<Self> {
        rig.start().await?;

        let mut info = SessionInfo::new(subject);
        let paths = match SessionPaths::create(
            &rig.config().hardware.data_root,
            subject,
            info.started_at.date_naive(),
        ) {
            Ok(paths) => paths,
            Err(e) => {
                rig.stop().await;
                return Err(e);
            }
        };
        info.session_number = paths.ordinal();
        let settings = SessionSettings::new(info.clone(), rig.config().clone());
        if let Err(e) = settings.write(&paths) {
            rig.stop().await;
            return Err(e);
        }

        let mut runner = Self {
            rig,
            protocol,
            collaborators,
            info,
            paths,
            settings,
            actions: ActionMap::new(),
            state: RunState::Idle,
            soft_pump: None,
            position_log: Arc::new(StdMutex::new(Vec::new())),
        };
        if let Err(e) = runner.wire_device().await {
            runner.rig.stop().await;
            return Err(e);
        }
        Ok(runner)
    }

    /// Load serial-relay messages and attach the soft-event pump.
    async fn wire_device(&mut self) -> RigResult<()> {
        let controller = self.rig.controller()?;
        let reset_index = controller
            .define_output_message(
                SerialModule::RotaryEncoder,
                vec![CMD_SET_ZERO_POSITION, CMD_ENABLE_THRESHOLDS],
            )
            .await?;
        self.actions.insert(
            ACTION_ENCODER_RESET.to_string(),
            OutputAction::new(SerialModule::RotaryEncoder.channel(), reset_index),
        );

        if let Some(rx) = controller.take_soft_events().await {
            let handler = SoftEventHandler::new(
                Arc::clone(self.rig.audio()),
                Arc::clone(self.rig.sounds()),
                Arc::clone(&self.collaborators.view),
                Arc::clone(&self.collaborators.camera),
                Arc::clone(self.rig.encoder()),
            );
            self.position_log = handler.positions();
            self.soft_pump = Some(handler.spawn(rx));
        }
        Ok(())
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn set_state(&mut self, to: RunState) {
        if self.state != to {
            info!(from = ?self.state, to = ?to, "session state");
            self.state = to;
        }
    }

    /// Run trials to completion and tear everything down. The rig is
    /// stopped and the settings snapshot finalized on every path out,
    /// including device failure.
    pub async fn run(mut self) -> RigResult<SessionSummary> {
        let sigint = spawn_sigint_marker(self.paths.stop_marker());
        register_best_effort(self.collaborators.registry.as_ref(), &self.info).await;

        let delay = self.rig.config().task.session_delay_secs;
        if delay > 0.0 {
            info!(delay_secs = delay, "waiting before the first trial");
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        self.set_state(RunState::Running);
        let ntrials = self.rig.config().task.ntrials;
        let mut records: Vec<TrialRecord> = Vec::new();
        let mut status = SessionStatus::Complete;
        let mut store = match TrialStore::open(&self.paths) {
            Ok(store) => store,
            Err(e) => {
                sigint.abort();
                self.finish(SessionStatus::Failed, &[]).await;
                return Err(e);
            }
        };

        for trial_index in 0..ntrials {
            if self.hold_at_boundary().await {
                status = SessionStatus::Stopped;
                break;
            }

            match self.run_trial(trial_index, &records).await {
                Ok(record) => {
                    if let Err(e) = store.append(&record) {
                        error!(trial_index, error = %e, "could not persist the trial record");
                        sigint.abort();
                        self.finish(SessionStatus::Failed, &records).await;
                        return Err(e);
                    }
                    records.push(record);
                    let totals = SessionTotals::from_records(&records);
                    let last = &records[records.len() - 1];
                    info!(
                        trial_index,
                        outcome = ?last.outcome,
                        trial_secs = last.raw.trial_end_secs - last.raw.trial_start_secs,
                        total_reward_ul = totals.reward_ul,
                        "trial finished"
                    );
                }
                Err(e) => {
                    error!(trial_index, error = %e, "trial failed, ending the session");
                    status = SessionStatus::Failed;
                    break;
                }
            }
        }

        sigint.abort();
        let trials_completed = records.len();
        self.finish(status, &records).await;
        Ok(SessionSummary {
            status,
            trials_completed,
            paths: self.paths,
        })
    }

    /// Honor stop and pause markers between trials. Returns true when the
    /// session should stop.
    async fn hold_at_boundary(&mut self) -> bool {
        if self.paths.take_stop_request() {
            info!("stop requested, ending at the trial boundary");
            return true;
        }
        if self.paths.pause_requested() {
            self.set_state(RunState::Paused);
            info!("paused; remove the pause marker to resume");
            while self.paths.pause_requested() {
                if self.paths.take_stop_request() {
                    info!("stop requested while paused");
                    return true;
                }
                tokio::time::sleep(PAUSE_POLL).await;
            }
            self.set_state(RunState::Running);
            info!("resumed");
        }
        false
    }

    async fn run_trial(
        &mut self,
        trial_index: usize,
        records: &[TrialRecord],
    ) -> RigResult<TrialRecord> {
        let started_at = Utc::now();
        let params = {
            let mut ctx = TrialContext {
                trial_index,
                records,
                encoder: self.rig.encoder().as_ref(),
                view: self.collaborators.view.as_ref(),
                task: &self.rig.config().task,
            };
            self.protocol.prepare(&mut ctx).await?
        };
        let compiled = self.protocol.compile(&params, &self.actions)?;

        let controller = self.rig.controller()?;
        controller.send_program(&compiled).await?;
        let raw = controller.run_program().await?;

        check_sync_pulses(&raw);

        let outcome = self.protocol.trial_completed(&params, &raw);
        let reward_ul = match outcome {
            Outcome::Correct => params.reward_amount_ul,
            Outcome::Error | Outcome::NoResponse => 0.0,
        };
        let valve_open_secs = self.rig.valve()?.time_for_volume(params.reward_amount_ul);
        // let the pump dispatch codes still in flight from this trial
        tokio::time::sleep(SOFT_EVENT_SETTLE).await;
        let position_samples = {
            let mut log = self.position_log.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *log)
        };
        Ok(TrialRecord {
            trial_index,
            started_at,
            params,
            outcome,
            reward_ul,
            valve_open_secs,
            position_samples,
            raw,
        })
    }

    async fn finish(&mut self, status: SessionStatus, records: &[TrialRecord]) {
        self.set_state(RunState::Stopping);
        let totals = SessionTotals::from_records(records);
        if let Err(e) = self.settings.finalize(&self.paths, status, totals) {
            error!(error = %e, "could not finalize the settings snapshot");
        }
        finalize_best_effort(
            self.collaborators.registry.as_ref(),
            &self.info,
            totals.trials_completed,
        )
        .await;
        self.rig.stop().await;
        if let Some(pump) = self.soft_pump.take() {
            // the transport is closed, so the pump drains and ends
            let _ = pump.await;
        }
        self.set_state(RunState::Terminated);
        info!(
            ?status,
            trials_completed = totals.trials_completed,
            total_reward_ul = totals.reward_ul,
            "session ended"
        );
    }
}

/// Pulse-presence check on the recording sync lines. Missing pulses are
/// an operator problem (a cable, a dark screen), never a reason to drop
/// data, so this only warns.
fn check_sync_pulses(raw: &RawTrialData) {
    for line in SYNC_LINES {
        if raw.events_on(line).is_empty() {
            warn!(line, "no synchronization pulses detected; check the cabling");
        }
    }
}

/// Ctrl-C is translated into a stop request so the trial in flight still
/// completes and persists before the session ends.
fn spawn_sigint_marker(marker: std::path::PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, requesting a clean stop");
            if let Err(e) = File::create(&marker) {
                error!(error = %e, "could not create the stop marker");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HardwareFactories;
    use crate::config::{test_config, RigConfig};
    use crate::device::transport::MockTransport;
    use crate::peripherals::encoder::MockEncoderLink;
    use crate::peripherals::frame2ttl::MockLightSensorLink;
    use crate::peripherals::sound::NullAudio;
    use crate::protocol::corridor::CorridorProtocol;
    use crate::session::collaborators::{NullCameraTrigger, NullCorridor, NullRegistry};
    use crate::session::read_trial_records;
    use tempfile::TempDir;

    struct Fixture {
        transport: MockTransport,
        config: RigConfig,
        _data_dir: TempDir,
    }

    fn fixture(tag: &str, ntrials: usize) -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.hardware.data_root = data_dir.path().to_path_buf();
        config.hardware.controller.port = Some(format!("runner-{tag}-ctrl"));
        config.hardware.rotary_encoder.port = Some(format!("runner-{tag}-enc"));
        config.hardware.light_sensor.port = Some(format!("runner-{tag}-f2t"));
        config.task.ntrials = ntrials;
        config.task.iti_secs = 0.1;
        config.task.max_trial_time_secs = 2.0;
        config.task.reward_zone_time_secs = 0.2;
        Fixture {
            transport: MockTransport::new(),
            config,
            _data_dir: data_dir,
        }
    }

    fn rig_for(fixture: &Fixture) -> Rig {
        let transport = fixture.transport.clone();
        Rig::new(
            fixture.config.clone(),
            HardwareFactories {
                transport: Box::new(move |_| Box::new(transport.clone())),
                encoder_link: Box::new(move |_| Box::new(MockEncoderLink::new())),
                light_sensor_link: Box::new(move |_| Box::new(MockLightSensorLink::new())),
                audio: Arc::new(NullAudio),
            },
        )
    }

    fn protocol_for(fixture: &Fixture) -> Box<dyn Protocol> {
        Box::new(CorridorProtocol::new(
            fixture.config.task.clone(),
            "RotaryEncoder1_1".to_string(),
        ))
    }

    fn collaborators() -> Collaborators {
        Collaborators {
            view: Arc::new(NullCorridor::default()),
            camera: Arc::new(NullCameraTrigger),
            registry: Arc::new(NullRegistry),
        }
    }

    async fn start_runner(fixture: &Fixture) -> SessionRunner {
        SessionRunner::start(
            rig_for(fixture),
            protocol_for(fixture),
            collaborators(),
            "M001",
        )
        .await
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn completes_the_configured_trial_count() {
        let fixture = fixture("complete", 3);
        for _ in 0..3 {
            fixture.transport.push_trial_events(vec!["RotaryEncoder1_1"]);
        }
        let runner = start_runner(&fixture).await;
        let paths = runner.paths().clone();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.status, SessionStatus::Complete);
        assert_eq!(summary.trials_completed, 3);
        let records = read_trial_records(&paths).unwrap();
        assert_eq!(
            records.iter().map(|r| r.trial_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(records.iter().all(|r| r.raw.trial_end_secs > 0.0));
        assert!(fixture.transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn preexisting_stop_marker_yields_zero_trials() {
        let fixture = fixture("prestop", 5);
        let runner = start_runner(&fixture).await;
        File::create(runner.paths().stop_marker()).unwrap();
        let paths = runner.paths().clone();
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.status, SessionStatus::Stopped);
        assert_eq!(summary.trials_completed, 0);
        assert_eq!(fixture.transport.runs(), 0);
        // the snapshot is still finalized
        let text = std::fs::read_to_string(paths.settings_file()).unwrap();
        let settings: SessionSettings = serde_json::from_str(&text).unwrap();
        assert_eq!(settings.status, SessionStatus::Stopped);
        assert!(settings.ended_at.is_some());
        // observing the request consumed the marker
        assert!(!paths.stop_marker().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_boundary_without_losing_trials() {
        let fixture = fixture("pause", 2);
        let runner = start_runner(&fixture).await;
        let pause = runner.paths().pause_marker();
        File::create(&pause).unwrap();

        let unpause = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            std::fs::remove_file(&pause).unwrap();
        });
        let summary = runner.run().await.unwrap();
        unpause.await.unwrap();

        assert_eq!(summary.status, SessionStatus::Complete);
        assert_eq!(summary.trials_completed, 2);
        let records = read_trial_records(&summary.paths).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_finalizes_as_failed() {
        let fixture = fixture("devfail", 4);
        // second trial dies mid-run
        let transport = fixture.transport.clone().failing_run_at(1);
        let mut fixture = fixture;
        fixture.transport = transport;
        let runner = start_runner(&fixture).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.status, SessionStatus::Failed);
        assert_eq!(summary.trials_completed, 1);
        let records = read_trial_records(&summary.paths).unwrap();
        assert_eq!(records.len(), 1);
        // the rig still shut down
        assert!(fixture.transport.is_closed());
    }
}
