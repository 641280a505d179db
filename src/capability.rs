//! Hardware capability lifecycle.
//!
//! A rig is a bundle of capabilities brought up in a fixed order before a
//! session and torn down in reverse afterwards. Startup is fail-fast:
//! the first capability that cannot start aborts the bring-up, and
//! whatever had already started is unwound. Teardown never fails; a
//! capability that refuses to stop is logged and skipped so the rest of
//! the rig still shuts down.
//!
//! The reward valve starts before the encoder so that a stale calibration
//! aborts the session before the wheel hardware is touched at all.

use crate::calibration::CalibrationCurve;
use crate::config::RigConfig;
use crate::device::transport::Transport;
use crate::device::Controller;
use crate::error::{RigError, RigResult};
use crate::peripherals::encoder::{EncoderLink, RotaryEncoderHandle};
use crate::peripherals::frame2ttl::{Frame2Ttl, LightSensorLink};
use crate::peripherals::sound::{AudioSink, SoundBank};
use crate::peripherals::valve::Valve;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// The capabilities a rig can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityId {
    LightSensor,
    BehaviorController,
    RewardValve,
    RotaryEncoder,
    Sound,
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CapabilityId::LightSensor => "light sensor",
            CapabilityId::BehaviorController => "behavior controller",
            CapabilityId::RewardValve => "reward valve",
            CapabilityId::RotaryEncoder => "rotary encoder",
            CapabilityId::Sound => "sound output",
        };
        f.write_str(label)
    }
}

/// Bring-up order. Teardown runs the started subset in reverse, so sound
/// is silenced before any hardware link closes.
pub const START_ORDER: [CapabilityId; 5] = [
    CapabilityId::LightSensor,
    CapabilityId::BehaviorController,
    CapabilityId::RewardValve,
    CapabilityId::RotaryEncoder,
    CapabilityId::Sound,
];

/// Constructors for the hardware links, injected so sessions run
/// identically against serial hardware and test doubles.
pub struct HardwareFactories {
    pub transport: Box<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>,
    pub encoder_link: Box<dyn Fn(&str) -> Box<dyn EncoderLink> + Send + Sync>,
    pub light_sensor_link: Box<dyn Fn(&str) -> Box<dyn LightSensorLink> + Send + Sync>,
    pub audio: Arc<dyn AudioSink>,
}

/// One rig's hardware, with its lifecycle state.
pub struct Rig {
    config: RigConfig,
    factories: HardwareFactories,
    controller: Option<Arc<Controller>>,
    encoder: Arc<RotaryEncoderHandle>,
    light_sensor: Frame2Ttl,
    valve: Option<Valve>,
    sounds: Arc<SoundBank>,
    started: Vec<CapabilityId>,
}

impl Rig {
    pub fn new(config: RigConfig, factories: HardwareFactories) -> Self {
        let encoder = Arc::new(RotaryEncoderHandle::new(
            config.position_at_reward(),
            config.hardware.rotary_encoder.threshold_count,
        ));
        let light_sensor = Frame2Ttl::new(
            config.hardware.light_sensor.light_threshold,
            config.hardware.light_sensor.dark_threshold,
        );
        let sounds = Arc::new(SoundBank::from_config(&config.hardware.sound));
        Self {
            config,
            factories,
            controller: None,
            encoder,
            light_sensor,
            valve: None,
            sounds,
            started: Vec::new(),
        }
    }

    pub fn config(&self) -> &RigConfig {
        &self.config
    }

    /// Available after a successful [`Rig::start`].
    pub fn controller(&self) -> RigResult<&Arc<Controller>> {
        self.controller
            .as_ref()
            .ok_or_else(|| RigError::DeviceRuntime("behavior controller not started".into()))
    }

    pub fn encoder(&self) -> &Arc<RotaryEncoderHandle> {
        &self.encoder
    }

    pub fn valve(&self) -> RigResult<&Valve> {
        self.valve
            .as_ref()
            .ok_or_else(|| RigError::DeviceRuntime("reward valve not started".into()))
    }

    pub fn sounds(&self) -> &Arc<SoundBank> {
        &self.sounds
    }

    pub fn audio(&self) -> &Arc<dyn AudioSink> {
        &self.factories.audio
    }

    /// Capabilities currently up, in start order.
    pub fn started(&self) -> &[CapabilityId] {
        &self.started
    }

    /// Validate the configuration, then start every fitted capability in
    /// [`START_ORDER`]. On any failure the already-started subset is
    /// unwound before the error is returned.
    pub async fn start(&mut self) -> RigResult<()> {
        self.config.validate()?;
        for id in START_ORDER {
            if let Err(e) = self.start_one(id).await {
                warn!(capability = %id, error = %e, "capability failed to start, unwinding");
                self.stop().await;
                return Err(e);
            }
        }
        info!("all capabilities started");
        Ok(())
    }

    async fn start_one(&mut self, id: CapabilityId) -> RigResult<()> {
        match id {
            CapabilityId::LightSensor => {
                if !self.config.hardware.light_sensor.enabled {
                    info!("light sensor not fitted, skipping");
                    return Ok(());
                }
                let port = self.required_port(
                    self.config.hardware.light_sensor.port.clone(),
                    "hardware.light_sensor.port",
                )?;
                let link = (self.factories.light_sensor_link)(&port);
                self.light_sensor.connect(link).await?;
            }
            CapabilityId::BehaviorController => {
                let port = self.required_port(
                    self.config.hardware.controller.port.clone(),
                    "hardware.controller.port",
                )?;
                let transport = &self.factories.transport;
                let controller = Controller::acquire(&port, |p| transport(p)).await?;
                // the enclosure light would leak into the corridor display
                controller.set_status_indicator(false).await?;
                self.controller = Some(controller);
            }
            CapabilityId::RewardValve => {
                let curve = CalibrationCurve::from_config(&self.config.hardware.valve)?;
                curve.validate()?;
                self.valve = Some(Valve::new(curve));
            }
            CapabilityId::RotaryEncoder => {
                let port = self.required_port(
                    self.config.hardware.rotary_encoder.port.clone(),
                    "hardware.rotary_encoder.port",
                )?;
                let link = (self.factories.encoder_link)(&port);
                self.encoder.connect(link).await?;
            }
            CapabilityId::Sound => {
                // probes the sink and silences anything left playing
                self.factories.audio.stop()?;
            }
        }
        info!(capability = %id, "capability started");
        self.started.push(id);
        Ok(())
    }

    /// Stop everything that started, in reverse order. Errors are logged
    /// and never propagated; teardown always runs to completion.
    pub async fn stop(&mut self) {
        while let Some(id) = self.started.pop() {
            let outcome = match id {
                CapabilityId::LightSensor => self.light_sensor.close().await,
                CapabilityId::BehaviorController => match self.controller.take() {
                    Some(controller) => {
                        if let Err(e) = controller.set_status_indicator(true).await {
                            warn!(error = %e, "could not restore the status indicator");
                        }
                        controller.close().await
                    }
                    None => Ok(()),
                },
                CapabilityId::RewardValve => {
                    self.valve = None;
                    Ok(())
                }
                CapabilityId::RotaryEncoder => self.encoder.close().await,
                CapabilityId::Sound => self.factories.audio.stop(),
            };
            match outcome {
                Ok(()) => info!(capability = %id, "capability stopped"),
                Err(e) => warn!(capability = %id, error = %e, "capability failed to stop"),
            }
        }
    }

    fn required_port(&self, port: Option<String>, key: &str) -> RigResult<String> {
        port.ok_or_else(|| {
            RigError::Configuration(format!(
                "the value for {key} is not set; please provide a valid port name"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::device::transport::MockTransport;
    use crate::peripherals::encoder::MockEncoderLink;
    use crate::peripherals::frame2ttl::MockLightSensorLink;
    use crate::peripherals::sound::{AudioSink, NullAudio, Waveform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingAudio {
        stops: AtomicUsize,
    }

    impl AudioSink for CountingAudio {
        fn play(&self, _waveform: &Waveform) -> RigResult<()> {
            Ok(())
        }

        fn stop(&self) -> RigResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn factories(
        transport: MockTransport,
        encoder: MockEncoderLink,
        sensor: MockLightSensorLink,
    ) -> HardwareFactories {
        HardwareFactories {
            transport: Box::new(move |_| Box::new(transport.clone())),
            encoder_link: Box::new(move |_| Box::new(encoder.clone())),
            light_sensor_link: Box::new(move |_| Box::new(sensor.clone())),
            audio: Arc::new(NullAudio),
        }
    }

    fn unique_ports(config: &mut RigConfig, tag: &str) {
        config.hardware.controller.port = Some(format!("cap-{tag}-ctrl"));
        config.hardware.rotary_encoder.port = Some(format!("cap-{tag}-enc"));
        config.hardware.light_sensor.port = Some(format!("cap-{tag}-f2t"));
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let mut config = test_config();
        unique_ports(&mut config, "order");
        let transport = MockTransport::new();
        let encoder = MockEncoderLink::new();
        let sensor = MockLightSensorLink::new();
        let mut rig = Rig::new(config, factories(transport.clone(), encoder.clone(), sensor.clone()));

        rig.start().await.unwrap();
        assert_eq!(rig.started(), &START_ORDER);
        assert_eq!(sensor.thresholds(), Some((41, 81)));
        assert!(!encoder.programmed_thresholds().is_empty());

        rig.stop().await;
        assert!(rig.started().is_empty());
        assert!(transport.is_closed());
        assert!(encoder.is_closed());
        assert!(sensor.is_closed());
    }

    #[tokio::test]
    async fn sound_is_silenced_at_both_ends_of_the_lifecycle() {
        let mut config = test_config();
        unique_ports(&mut config, "sound");
        let audio = Arc::new(CountingAudio::default());
        let mut rig = Rig::new(
            config,
            HardwareFactories {
                transport: Box::new(|_| Box::new(MockTransport::new())),
                encoder_link: Box::new(|_| Box::new(MockEncoderLink::new())),
                light_sensor_link: Box::new(|_| Box::new(MockLightSensorLink::new())),
                audio: audio.clone(),
            },
        );

        rig.start().await.unwrap();
        assert!(rig.started().contains(&CapabilityId::Sound));
        assert_eq!(audio.stops.load(Ordering::SeqCst), 1);

        rig.stop().await;
        assert_eq!(audio.stops.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_light_sensor_is_skipped() {
        let mut config = test_config();
        unique_ports(&mut config, "nosensor");
        config.hardware.light_sensor.enabled = false;
        config.hardware.light_sensor.port = None;
        let sensor = MockLightSensorLink::new();
        let mut rig = Rig::new(
            config,
            factories(MockTransport::new(), MockEncoderLink::new(), sensor.clone()),
        );
        rig.start().await.unwrap();
        assert!(!rig.started().contains(&CapabilityId::LightSensor));
        assert!(sensor.thresholds().is_none());
        rig.stop().await;
    }

    #[tokio::test]
    async fn stale_calibration_aborts_before_the_encoder_starts() {
        let mut config = test_config();
        unique_ports(&mut config, "stale");
        config.hardware.valve.automatic_calibration = true;
        config.hardware.valve.calibration_weights_ul = vec![1.0, 2.0, 3.0];
        config.hardware.valve.calibration_open_times_ms = vec![10.0, 20.0, 30.0];
        config.hardware.valve.calibration_date = None;
        let transport = MockTransport::new();
        let encoder = MockEncoderLink::new();
        let mut rig = Rig::new(
            config,
            factories(transport.clone(), encoder.clone(), MockLightSensorLink::new()),
        );

        let err = rig.start().await.unwrap_err();
        assert!(matches!(err, RigError::Calibration(_)));
        // unwound: nothing left started, encoder never touched
        assert!(rig.started().is_empty());
        assert!(encoder.programmed_thresholds().is_empty());
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn controller_failure_unwinds_the_light_sensor() {
        let mut config = test_config();
        unique_ports(&mut config, "ctrlfail");
        let sensor = MockLightSensorLink::new();
        let transport = MockTransport::new().with_open_failures(2);
        let mut rig = Rig::new(
            config,
            factories(transport, MockEncoderLink::new(), sensor.clone()),
        );

        let err = rig.start().await.unwrap_err();
        assert!(matches!(err, RigError::Connection(_)));
        assert!(sensor.is_closed());
        assert!(rig.started().is_empty());
    }
}
