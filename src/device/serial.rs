//! Serial transport to real controller hardware.
//!
//! Framing is the controller firmware's command set: single ASCII command
//! bytes from the host, length-prefixed JSON documents for structured
//! payloads, and tagged frames from the device while a program runs. The
//! handshake exchange distinguishes "port would not open" from "device
//! enumerated but is not answering", which need different operator
//! remediation.

use crate::error::{ConnectionFailure, RigError, RigResult};
use crate::protocol::CompiledProtocol;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, trace};

use super::transport::{RawTrialData, SerialModule, Transport};

const BAUD_RATE: u32 = 115_200;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

const CMD_HANDSHAKE: u8 = b'6';
const HANDSHAKE_REPLY: u8 = b'5';
const CMD_LOAD_MESSAGE: u8 = b'L';
const CMD_SEND_PROGRAM: u8 = b'P';
const CMD_RUN_PROGRAM: u8 = b'R';
const CMD_OVERRIDE: u8 = b'O';
const CMD_STATUS_LED: u8 = b':';
const CMD_DISCONNECT: u8 = b'Z';

/// Frame tags the device emits while a program runs.
const TAG_SOFT_CODE: u8 = 0x01;
const TAG_TRIAL_DATA: u8 = 0x02;

fn module_id(module: SerialModule) -> u8 {
    match module {
        SerialModule::RotaryEncoder => 1,
        SerialModule::SoundCard => 3,
    }
}

pub struct SerialTransport {
    port: String,
    stream: Option<SerialStream>,
    soft_tx: Option<mpsc::UnboundedSender<u8>>,
    soft_rx: Option<mpsc::UnboundedReceiver<u8>>,
}

impl SerialTransport {
    pub fn new(port: &str) -> Self {
        let (soft_tx, soft_rx) = mpsc::unbounded_channel();
        Self {
            port: port.to_string(),
            stream: None,
            soft_tx: Some(soft_tx),
            soft_rx: Some(soft_rx),
        }
    }

    fn stream(&mut self) -> RigResult<&mut SerialStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("serial link is not open".into()))
    }

    async fn write_document<T: serde::Serialize>(&mut self, command: u8, doc: &T) -> RigResult<()> {
        let json = serde_json::to_vec(doc)?;
        let len = u32::try_from(json.len())
            .map_err(|_| RigError::DeviceRuntime("document exceeds the frame size".into()))?;
        let stream = self.stream()?;
        stream.write_all(&[command]).await?;
        stream.write_all(&len.to_le_bytes()).await?;
        stream.write_all(&json).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_document(stream: &mut SerialStream) -> RigResult<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let mut buf = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> RigResult<()> {
        let mut stream = tokio_serial::new(&self.port, BAUD_RATE)
            .open_native_async()
            .map_err(|e| ConnectionFailure::OpenFailed {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;

        stream
            .write_all(&[CMD_HANDSHAKE])
            .await
            .map_err(|e| ConnectionFailure::OpenFailed {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;
        let mut reply = [0u8; 1];
        let answered = tokio::time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut reply)).await;
        match answered {
            Ok(Ok(_)) if reply[0] == HANDSHAKE_REPLY => {
                debug!(port = %self.port, "handshake complete");
                self.stream = Some(stream);
                Ok(())
            }
            // the port opened but the device is not talking
            _ => Err(ConnectionFailure::Unresponsive.into()),
        }
    }

    async fn load_serial_message(
        &mut self,
        module: SerialModule,
        index: u8,
        payload: Vec<u8>,
    ) -> RigResult<()> {
        let len = u8::try_from(payload.len())
            .map_err(|_| RigError::DeviceRuntime("serial message payload too long".into()))?;
        let stream = self.stream()?;
        stream
            .write_all(&[CMD_LOAD_MESSAGE, module_id(module), index, len])
            .await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn send_program(&mut self, program: &CompiledProtocol) -> RigResult<()> {
        self.write_document(CMD_SEND_PROGRAM, program).await
    }

    async fn run_program(&mut self) -> RigResult<RawTrialData> {
        let soft_tx = self.soft_tx.clone();
        let stream = self.stream()?;
        stream.write_all(&[CMD_RUN_PROGRAM]).await?;
        stream.flush().await?;

        // tagged frames until the trial-data frame closes the run
        loop {
            let mut tag = [0u8; 1];
            stream.read_exact(&mut tag).await?;
            match tag[0] {
                TAG_SOFT_CODE => {
                    let mut code = [0u8; 1];
                    stream.read_exact(&mut code).await?;
                    trace!(code = code[0], "soft code frame");
                    if let Some(tx) = &soft_tx {
                        let _ = tx.send(code[0]);
                    }
                }
                TAG_TRIAL_DATA => {
                    let doc = Self::read_document(stream).await?;
                    return Ok(serde_json::from_slice(&doc)?);
                }
                other => {
                    return Err(RigError::DeviceRuntime(format!(
                        "unexpected frame tag 0x{other:02x} from the controller"
                    )))
                }
            }
        }
    }

    async fn manual_override(&mut self, channel: &str, value: u8) -> RigResult<()> {
        let len = u8::try_from(channel.len())
            .map_err(|_| RigError::DeviceRuntime("channel name too long".into()))?;
        let stream = self.stream()?;
        stream.write_all(&[CMD_OVERRIDE, len]).await?;
        stream.write_all(channel.as_bytes()).await?;
        stream.write_all(&[value]).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn set_status_led(&mut self, enabled: bool) -> RigResult<bool> {
        let stream = self.stream()?;
        stream.write_all(&[CMD_STATUS_LED, u8::from(enabled)]).await?;
        stream.flush().await?;
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await?;
        Ok(ack[0] == 1)
    }

    fn take_soft_events(&mut self) -> Option<mpsc::UnboundedReceiver<u8>> {
        self.soft_rx.take()
    }

    async fn close(&mut self) -> RigResult<()> {
        // dropping the sender ends any attached soft-event consumer
        self.soft_tx = None;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(&[CMD_DISCONNECT]).await;
            let _ = stream.flush().await;
        }
        Ok(())
    }
}

// =============================================================================
// Peripheral links
// =============================================================================

async fn open_peripheral(port: &str) -> RigResult<SerialStream> {
    tokio_serial::new(port, BAUD_RATE)
        .open_native_async()
        .map_err(|e| {
            ConnectionFailure::OpenFailed {
                port: port.to_string(),
                reason: e.to_string(),
            }
            .into()
        })
}

/// Rotary encoder module on its own serial port. Positions on the wire
/// are integer degrees.
pub struct SerialEncoderLink {
    port: String,
    stream: Option<SerialStream>,
}

const ENC_CMD_ZERO: u8 = b'Z';
const ENC_CMD_SET_POSITION: u8 = b'P';
const ENC_CMD_THRESHOLDS: u8 = b'T';
const ENC_CMD_ENABLE_EVENTS: u8 = b'E';
const ENC_CMD_STREAM: u8 = b'S';
const ENC_CMD_WRAP: u8 = b'W';
const ENC_CMD_QUERY: u8 = b'Q';

impl SerialEncoderLink {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            stream: None,
        }
    }

    async fn stream(&mut self) -> RigResult<&mut SerialStream> {
        if self.stream.is_none() {
            self.stream = Some(open_peripheral(&self.port).await?);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("encoder link is not open".into()))
    }
}

#[async_trait]
impl crate::peripherals::encoder::EncoderLink for SerialEncoderLink {
    async fn set_zero_position(&mut self) -> RigResult<()> {
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_ZERO]).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn set_position(&mut self, degrees: f64) -> RigResult<()> {
        let ticks = degrees.round() as i32;
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_SET_POSITION]).await?;
        stream.write_all(&ticks.to_le_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn program_thresholds(
        &mut self,
        thresholds: &[f64],
        enable_flags_wire_order: &[bool],
    ) -> RigResult<()> {
        let count = u8::try_from(thresholds.len())
            .map_err(|_| RigError::DeviceRuntime("too many encoder thresholds".into()))?;
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_THRESHOLDS, count]).await?;
        for threshold in thresholds {
            let ticks = threshold.round() as i32;
            stream.write_all(&ticks.to_le_bytes()).await?;
        }
        for &flag in enable_flags_wire_order {
            stream.write_all(&[u8::from(flag)]).await?;
        }
        stream.flush().await?;
        Ok(())
    }

    async fn enable_event_transmission(&mut self) -> RigResult<()> {
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_ENABLE_EVENTS]).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn disable_stream(&mut self) -> RigResult<()> {
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_STREAM, 0]).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn set_wrap_point(&mut self, wrap: u16) -> RigResult<()> {
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_WRAP]).await?;
        stream.write_all(&wrap.to_le_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn current_position(&mut self) -> RigResult<f64> {
        let stream = self.stream().await?;
        stream.write_all(&[ENC_CMD_QUERY]).await?;
        stream.flush().await?;
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await?;
        Ok(f64::from(i32::from_le_bytes(buf)))
    }

    async fn close(&mut self) -> RigResult<()> {
        self.stream = None;
        Ok(())
    }
}

/// Light-threshold sensor on its own serial port.
pub struct SerialLightSensorLink {
    port: String,
    stream: Option<SerialStream>,
}

const SENSOR_CMD_THRESHOLDS: u8 = b'T';

impl SerialLightSensorLink {
    pub fn new(port: &str) -> Self {
        Self {
            port: port.to_string(),
            stream: None,
        }
    }
}

#[async_trait]
impl crate::peripherals::frame2ttl::LightSensorLink for SerialLightSensorLink {
    async fn set_thresholds(&mut self, light: i32, dark: i32) -> RigResult<()> {
        if self.stream.is_none() {
            self.stream = Some(open_peripheral(&self.port).await?);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| RigError::DeviceRuntime("light sensor link is not open".into()))?;
        stream.write_all(&[SENSOR_CMD_THRESHOLDS]).await?;
        stream.write_all(&light.to_le_bytes()).await?;
        stream.write_all(&dark.to_le_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> RigResult<()> {
        self.stream = None;
        Ok(())
    }
}
