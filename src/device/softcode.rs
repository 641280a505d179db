//! Out-of-band soft events.
//!
//! Besides driving wired outputs, a running protocol can emit small
//! numeric codes over the `SoftCode` channel. These are the device's way
//! of asking the host to do something no output line can: play or stop a
//! sound, advance the corridor display, trigger the camera, or sample the
//! wheel position. Each display tick samples the wheel, logs the reading,
//! and feeds it to the corridor before the frame steps. The pump task
//! dispatches each code as it arrives; handlers must return promptly so a
//! code is acted on within roughly one display frame of the state entry
//! that emitted it.

use crate::error::RigResult;
use crate::peripherals::encoder::RotaryEncoderHandle;
use crate::peripherals::sound::{AudioSink, SoundBank};
use crate::session::collaborators::{CameraTrigger, CorridorView};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// Host-side actions a protocol can request mid-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SoftEvent {
    StopSound = 1,
    PlayTone = 2,
    PlayNoise = 3,
    TriggerCamera = 4,
    AdvanceDisplay = 5,
    StoreEncoderPosition = 6,
    InterTrialInterval = 7,
}

impl SoftEvent {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(SoftEvent::StopSound),
            2 => Some(SoftEvent::PlayTone),
            3 => Some(SoftEvent::PlayNoise),
            4 => Some(SoftEvent::TriggerCamera),
            5 => Some(SoftEvent::AdvanceDisplay),
            6 => Some(SoftEvent::StoreEncoderPosition),
            7 => Some(SoftEvent::InterTrialInterval),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Dispatches decoded soft events to the host-side collaborators.
pub struct SoftEventHandler {
    audio: Arc<dyn AudioSink>,
    sounds: Arc<SoundBank>,
    view: Arc<dyn CorridorView>,
    camera: Arc<dyn CameraTrigger>,
    encoder: Arc<RotaryEncoderHandle>,
    /// Wheel positions sampled on request during the session, in degrees.
    positions: Arc<StdMutex<Vec<f64>>>,
}

impl SoftEventHandler {
    pub fn new(
        audio: Arc<dyn AudioSink>,
        sounds: Arc<SoundBank>,
        view: Arc<dyn CorridorView>,
        camera: Arc<dyn CameraTrigger>,
        encoder: Arc<RotaryEncoderHandle>,
    ) -> Self {
        Self {
            audio,
            sounds,
            view,
            camera,
            encoder,
            positions: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Shared handle to the sampled wheel positions.
    pub fn positions(&self) -> Arc<StdMutex<Vec<f64>>> {
        Arc::clone(&self.positions)
    }

    /// Consume the raw code stream in a background task. The task ends
    /// when the transport closes its sender side.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<u8>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(code) = rx.recv().await {
                match SoftEvent::from_code(code) {
                    Some(event) => self.handle(event).await,
                    None => warn!(code, "unknown soft code ignored"),
                }
            }
            trace!("soft event stream closed");
        })
    }

    async fn handle(&self, event: SoftEvent) {
        trace!(?event, "soft event");
        let outcome = match event {
            SoftEvent::StopSound => self.audio.stop(),
            SoftEvent::PlayTone => self.audio.play(&self.sounds.go_tone),
            SoftEvent::PlayNoise => self.audio.play(&self.sounds.noise),
            SoftEvent::TriggerCamera => self.camera.trigger(),
            // closed loop: the wheel reading drives the frame about to draw
            SoftEvent::AdvanceDisplay => match self.sample_position().await {
                Ok(position) => self
                    .view
                    .set_position(position)
                    .and_then(|()| self.view.advance()),
                Err(e) => Err(e),
            },
            SoftEvent::StoreEncoderPosition => self.sample_position().await.map(|_| ()),
            SoftEvent::InterTrialInterval => self.view.show_gray(),
        };
        if let Err(e) = outcome {
            // A failed host action must not stall the trial in progress.
            error!(?event, error = %e, "soft event handler failed");
        }
    }

    /// Read the wheel and append the reading to the position log.
    async fn sample_position(&self) -> RigResult<f64> {
        let position = self.encoder.current_position().await?;
        self.positions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(position);
        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SoundConfig;
    use crate::peripherals::encoder::MockEncoderLink;
    use crate::peripherals::sound::NullAudio;
    use crate::session::collaborators::{NullCameraTrigger, NullCorridor};

    async fn handler_with_encoder() -> (SoftEventHandler, MockEncoderLink, Arc<NullCorridor>) {
        let bank = SoundBank::from_config(&SoundConfig {
            samplerate_hz: 8_000,
            go_tone_hz: 440.0,
            go_tone_secs: 0.01,
            noise_secs: 0.01,
        });
        let encoder = Arc::new(RotaryEncoderHandle::new(1440.0, 4));
        let link = MockEncoderLink::new();
        encoder.connect(Box::new(link.clone())).await.expect("mock connect");
        let view = Arc::new(NullCorridor::default());
        let handler = SoftEventHandler::new(
            Arc::new(NullAudio),
            Arc::new(bank),
            view.clone(),
            Arc::new(NullCameraTrigger),
            encoder,
        );
        (handler, link, view)
    }

    #[test]
    fn codes_round_trip() {
        for code in 1..=7u8 {
            assert_eq!(SoftEvent::from_code(code).map(SoftEvent::code), Some(code));
        }
        assert!(SoftEvent::from_code(0).is_none());
        assert!(SoftEvent::from_code(8).is_none());
    }

    #[tokio::test]
    async fn position_samples_accumulate_in_order() {
        let (handler, link, _view) = handler_with_encoder().await;
        let positions = handler.positions();

        link.turn_to(90.0);
        handler.handle(SoftEvent::StoreEncoderPosition).await;
        link.turn_to(180.0);
        handler.handle(SoftEvent::StoreEncoderPosition).await;

        assert_eq!(*positions.lock().unwrap(), vec![90.0, 180.0]);
    }

    #[tokio::test]
    async fn display_ticks_sample_the_wheel_and_feed_the_view() {
        let (handler, link, view) = handler_with_encoder().await;
        let positions = handler.positions();

        link.turn_to(33.0);
        handler.handle(SoftEvent::AdvanceDisplay).await;

        // the reading is logged and reaches the view before the frame steps
        assert_eq!(*positions.lock().unwrap(), vec![33.0]);
        assert_eq!(view.last_position(), Some(33.0));
        assert_eq!(view.advance_count(), 1);
    }

    #[tokio::test]
    async fn unknown_codes_do_not_stop_the_pump() {
        let (handler, link, _view) = handler_with_encoder().await;
        let positions = handler.positions();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = handler.spawn(rx);

        tx.send(200).unwrap();
        link.turn_to(45.0);
        tx.send(SoftEvent::StoreEncoderPosition.code()).unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(*positions.lock().unwrap(), vec![45.0]);
    }
}
