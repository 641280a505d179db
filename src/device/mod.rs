//! Connection to the behavior controller.
//!
//! One [`Controller`] exists per serial port, process-wide: a second
//! `acquire` for the same port returns a handle to the already-open
//! connection instead of fighting over the device. Opening retries once,
//! because these controllers intermittently enumerate but refuse the
//! first handshake after a host reboot.

pub mod softcode;
pub mod transport;

#[cfg(feature = "instrument_serial")]
pub mod serial;

use crate::error::{ConnectionFailure, RigError, RigResult};
use crate::protocol::CompiledProtocol;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use transport::{RawTrialData, SerialModule, Transport};

/// Delay before the single reconnect attempt.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// First serial-relay message slot handed out by
/// [`Controller::define_output_message`]. Slot 0 is reserved by firmware.
const FIRST_MESSAGE_INDEX: u8 = 1;

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<Controller>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Open connection to one behavior controller.
///
/// All methods take `&self`; the transport sits behind an async mutex, so
/// concurrent callers serialize on the wire exactly as the single serial
/// line would force anyway.
pub struct Controller {
    port: String,
    transport: Mutex<Box<dyn Transport>>,
    next_message_index: Mutex<u8>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Acquire the connection for `port`, opening it if this is the first
    /// request. `factory` builds the transport for a fresh connection and
    /// is not called when an existing handle is reused.
    ///
    /// A failed open is retried exactly once after [`RETRY_DELAY`]; a
    /// device that enumerates but stays silent surfaces as
    /// [`ConnectionFailure::Unresponsive`], whose message tells the
    /// operator to power-cycle the USB link.
    pub async fn acquire<F>(port: &str, factory: F) -> RigResult<Arc<Controller>>
    where
        F: FnOnce(&str) -> Box<dyn Transport>,
    {
        let mut registry = REGISTRY.lock().await;
        if let Some(existing) = registry.get(port) {
            debug!(port, "reusing existing controller connection");
            return Ok(Arc::clone(existing));
        }

        let mut transport = factory(port);
        if let Err(first) = transport.open().await {
            warn!(port, error = %first, "controller open failed, retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            if let Err(second) = transport.open().await {
                return Err(annotate_open_failure(port, second));
            }
        }
        info!(port, "controller connected");

        let controller = Arc::new(Controller {
            port: port.to_string(),
            transport: Mutex::new(transport),
            next_message_index: Mutex::new(FIRST_MESSAGE_INDEX),
        });
        registry.insert(port.to_string(), Arc::clone(&controller));
        Ok(controller)
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Store `payload` as a serial-relay message and return the slot index
    /// to reference it from protocol output actions. Indices are handed
    /// out monotonically per connection.
    pub async fn define_output_message(
        &self,
        module: SerialModule,
        payload: Vec<u8>,
    ) -> RigResult<u8> {
        let index = {
            let mut next = self.next_message_index.lock().await;
            let index = *next;
            *next = next.checked_add(1).ok_or_else(|| {
                RigError::DeviceRuntime("serial message slots exhausted".into())
            })?;
            index
        };
        self.transport
            .lock()
            .await
            .load_serial_message(module, index, payload)
            .await?;
        Ok(index)
    }

    pub async fn send_program(&self, program: &CompiledProtocol) -> RigResult<()> {
        self.transport.lock().await.send_program(program).await
    }

    /// Run the last sent program to its terminal state and harvest the
    /// trial's event log. Holds the wire for the duration of the trial.
    pub async fn run_program(&self) -> RigResult<RawTrialData> {
        self.transport.lock().await.run_program().await
    }

    /// Drive an output channel directly, outside any running protocol.
    pub async fn manual_override(&self, channel: &str, value: u8) -> RigResult<()> {
        self.transport.lock().await.manual_override(channel, value).await
    }

    /// Turn the enclosure status indicator on or off. Firmware without
    /// indicator control is tolerated with a warning; sessions proceed
    /// with the light as-is.
    pub async fn set_status_indicator(&self, enabled: bool) -> RigResult<()> {
        let supported = self.transport.lock().await.set_status_led(enabled).await?;
        if !supported {
            warn!(
                port = %self.port,
                "this controller's firmware cannot switch the status indicator"
            );
        }
        Ok(())
    }

    /// Out-of-band soft-event byte stream; available once per connection.
    pub async fn take_soft_events(&self) -> Option<mpsc::UnboundedReceiver<u8>> {
        self.transport.lock().await.take_soft_events()
    }

    /// Close the link and release the registry entry, so a later
    /// `acquire` for the same port opens a fresh connection.
    pub async fn close(&self) -> RigResult<()> {
        let mut registry = REGISTRY.lock().await;
        registry.remove(&self.port);
        drop(registry);
        self.transport.lock().await.close().await
    }
}

fn annotate_open_failure(port: &str, error: RigError) -> RigError {
    match error {
        RigError::Connection(failure) => RigError::Connection(failure),
        other => RigError::Connection(ConnectionFailure::OpenFailed {
            port: port.to_string(),
            reason: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use transport::MockTransport;

    fn factory_for(mock: &MockTransport) -> impl FnOnce(&str) -> Box<dyn Transport> {
        let mock = mock.clone();
        move |_: &str| Box::new(mock) as Box<dyn Transport>
    }

    #[tokio::test]
    #[serial]
    async fn same_port_yields_the_same_connection() {
        let mock = MockTransport::new();
        let a = Controller::acquire("registry-port-a", factory_for(&mock))
            .await
            .unwrap();
        // second factory is never invoked
        let b = Controller::acquire("registry-port-a", |_| unreachable!())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn distinct_ports_get_distinct_connections() {
        let a = Controller::acquire("registry-port-b", factory_for(&MockTransport::new()))
            .await
            .unwrap();
        let b = Controller::acquire("registry-port-c", factory_for(&MockTransport::new()))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn close_releases_the_port_for_reacquisition() {
        let first = MockTransport::new();
        let a = Controller::acquire("registry-port-d", factory_for(&first))
            .await
            .unwrap();
        a.close().await.unwrap();
        assert!(first.is_closed());

        let second = MockTransport::new();
        let b = Controller::acquire("registry-port-d", factory_for(&second))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        b.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[serial]
    async fn one_transient_failure_is_retried() {
        let mock = MockTransport::new().with_open_failures(1);
        let controller = Controller::acquire("registry-port-e", factory_for(&mock))
            .await
            .unwrap();
        controller.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[serial]
    async fn two_failures_surface_the_connection_error() {
        let mock = MockTransport::new().with_open_failures(2);
        let err = Controller::acquire("registry-port-f", factory_for(&mock))
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Connection(_)));
        // a failed acquire leaves no registry entry behind
        let retryable = MockTransport::new();
        let ok = Controller::acquire("registry-port-f", factory_for(&retryable))
            .await
            .unwrap();
        ok.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[serial]
    async fn unresponsive_device_names_the_remedy() {
        let mock = MockTransport::new().with_unresponsive_device();
        let err = Controller::acquire("registry-port-g", factory_for(&mock))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("USB"), "got: {message}");
    }

    #[tokio::test]
    #[serial]
    async fn message_slots_are_handed_out_monotonically() {
        let mock = MockTransport::new();
        let controller = Controller::acquire("registry-port-h", factory_for(&mock))
            .await
            .unwrap();
        let first = controller
            .define_output_message(SerialModule::RotaryEncoder, vec![b'Z'])
            .await
            .unwrap();
        let second = controller
            .define_output_message(SerialModule::SoundCard, vec![2])
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(
            mock.serial_message(SerialModule::RotaryEncoder, 1),
            Some(vec![b'Z'])
        );
        controller.close().await.unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn unsupported_status_indicator_is_tolerated() {
        let mock = MockTransport::new().without_status_led();
        let controller = Controller::acquire("registry-port-i", factory_for(&mock))
            .await
            .unwrap();
        controller.set_status_indicator(false).await.unwrap();
        controller.close().await.unwrap();
    }
}
