//! Light-threshold sensor (screen-to-TTL converter).
//!
//! A photodiode fixed to a corner of the stimulus screen; it emits TTL
//! pulses on the visual sync line whenever the patch luminance crosses the
//! programmed light/dark thresholds, letting external recording systems
//! align to actual frame updates. The host only programs the thresholds
//! at startup; pulses themselves show up in the trial event log.

use crate::error::{RigError, RigResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};

/// Link to the sensor over its own serial port.
#[async_trait]
pub trait LightSensorLink: Send + Sync {
    async fn set_thresholds(&mut self, light: i32, dark: i32) -> RigResult<()>;
    async fn close(&mut self) -> RigResult<()>;
}

/// Handle owning the sensor link and its threshold pair.
pub struct Frame2Ttl {
    light_threshold: i32,
    dark_threshold: i32,
    link: Option<Box<dyn LightSensorLink>>,
}

impl Frame2Ttl {
    pub fn new(light_threshold: i32, dark_threshold: i32) -> Self {
        Self {
            light_threshold,
            dark_threshold,
            link: None,
        }
    }

    /// Attach the link and program the thresholds. On a programming
    /// failure the link is closed so the port is released.
    pub async fn connect(&mut self, mut link: Box<dyn LightSensorLink>) -> RigResult<()> {
        match link
            .set_thresholds(self.light_threshold, self.dark_threshold)
            .await
        {
            Ok(()) => {
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                let _ = link.close().await;
                Err(e)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub async fn close(&mut self) -> RigResult<()> {
        if let Some(mut link) = self.link.take() {
            link.close().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Mock link
// =============================================================================

#[derive(Debug, Default)]
struct MockSensorState {
    thresholds: Option<(i32, i32)>,
    closed: bool,
    fail_set: bool,
}

/// Shared-state test double; clones observe the same link.
#[derive(Debug, Clone, Default)]
pub struct MockLightSensorLink {
    state: Arc<StdMutex<MockSensorState>>,
}

impl MockLightSensorLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let link = Self::default();
        link.state.lock().expect("mock lock").fail_set = true;
        link
    }

    pub fn thresholds(&self) -> Option<(i32, i32)> {
        self.state.lock().expect("mock lock").thresholds
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("mock lock").closed
    }
}

#[async_trait]
impl LightSensorLink for MockLightSensorLink {
    async fn set_thresholds(&mut self, light: i32, dark: i32) -> RigResult<()> {
        let mut state = self.state.lock().expect("mock lock");
        if state.fail_set {
            return Err(RigError::DeviceRuntime(
                "light sensor did not acknowledge thresholds".into(),
            ));
        }
        state.thresholds = Some((light, dark));
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        self.state.lock().expect("mock lock").closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_programs_thresholds() {
        let mock = MockLightSensorLink::new();
        let mut sensor = Frame2Ttl::new(41, 81);
        sensor.connect(Box::new(mock.clone())).await.unwrap();
        assert!(sensor.is_connected());
        assert_eq!(mock.thresholds(), Some((41, 81)));
    }

    #[test]
    fn failed_programming_releases_the_port() {
        tokio_test::block_on(async {
            let mock = MockLightSensorLink::failing();
            let mut sensor = Frame2Ttl::new(41, 81);
            assert!(sensor.connect(Box::new(mock.clone())).await.is_err());
            assert!(!sensor.is_connected());
            assert!(mock.is_closed());
        });
    }
}
