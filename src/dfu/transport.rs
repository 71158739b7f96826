//! Transport layer.
//!
//! A [`DfuTransport`] moves raw control point frames between a host and the
//! core. The [`TransportRegistry`] holds every enabled transport, brings
//! them up and down together and pumps their frames through a
//! [`ControlPoint`].

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use serialport::SerialPort;
use tracing::{debug, info, warn};

use super::config::{DFU_BAUD_RATE, SERIAL_READ_TIMEOUT};
use super::control_point::ControlPoint;
use super::error::{DfuError, DfuResult};
use super::flash::FlashDriver;
use super::handler::RequestHandler;
use super::slip::{self, SlipDecoder};
use crate::traits::SignatureVerifier;

/// A link carrying control point frames.
#[cfg_attr(test, automock)]
pub trait DfuTransport: Send {
    /// Bring the link up.
    fn init(&mut self) -> DfuResult<()>;

    /// Tear the link down.
    fn close(&mut self) -> DfuResult<()>;

    /// Send one outbound frame.
    fn send(&mut self, frame: &[u8]) -> DfuResult<()>;

    /// Next complete inbound frame, if one is available.
    fn poll(&mut self) -> DfuResult<Option<Vec<u8>>>;
}

// ============================================================================
// SLIP over a byte stream
// ============================================================================

/// SLIP-framed transport over any byte stream.
pub struct SlipTransport<P> {
    name: String,
    port: P,
    decoder: SlipDecoder,
    frames: VecDeque<Vec<u8>>,
    open: bool,
}

impl<P: Read + Write + Send> SlipTransport<P> {
    pub fn new(name: &str, port: P) -> Self {
        Self {
            name: name.to_string(),
            port,
            decoder: SlipDecoder::new(),
            frames: VecDeque::new(),
            open: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn ensure_open(&self) -> DfuResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DfuError::TransportClosed {
                name: self.name.clone(),
            })
        }
    }
}

impl<P: Read + Write + Send> DfuTransport for SlipTransport<P> {
    fn init(&mut self) -> DfuResult<()> {
        self.decoder.reset();
        self.frames.clear();
        self.open = true;
        debug!(transport = %self.name, "transport up");
        Ok(())
    }

    fn close(&mut self) -> DfuResult<()> {
        self.open = false;
        self.frames.clear();
        debug!(transport = %self.name, "transport down");
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> DfuResult<()> {
        self.ensure_open()?;
        self.port.write_all(&slip::encode(frame))?;
        self.port.flush()?;
        Ok(())
    }

    fn poll(&mut self) -> DfuResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        if let Some(frame) = self.frames.pop_front() {
            return Ok(Some(frame));
        }

        let mut buf = [0u8; 256];
        let n = match self.port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => 0,
            Err(e) => return Err(DfuError::Io(e)),
        };

        for result in self.decoder.feed_all(&buf[..n]) {
            match result {
                Ok(frame) => self.frames.push_back(frame),
                Err(e) => warn!(transport = %self.name, error = %e, "dropping bad frame"),
            }
        }
        Ok(self.frames.pop_front())
    }
}

// ============================================================================
// Serial port
// ============================================================================

/// SLIP transport over a serial port.
pub type SerialTransport = SlipTransport<Box<dyn SerialPort>>;

impl SlipTransport<Box<dyn SerialPort>> {
    /// Open a serial port at the DFU baud rate.
    pub fn open_serial(port_name: &str) -> DfuResult<Self> {
        Self::open_serial_with_baud(port_name, DFU_BAUD_RATE)
    }

    /// Open a serial port with a specific baud rate.
    ///
    /// Retries for a while when the port exists but its driver is not ready,
    /// which happens right after USB re-enumeration.
    pub fn open_serial_with_baud(port_name: &str, baud_rate: u32) -> DfuResult<Self> {
        let normalized_name = normalize_port_name(port_name);

        const MAX_OPEN_RETRIES: u32 = 10;
        const RETRY_DELAY_MS: u64 = 200;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match serialport::new(&normalized_name, baud_rate)
                .timeout(SERIAL_READ_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(port) => {
                    info!(port = %normalized_name, baud_rate, "serial port opened");
                    return Ok(Self::new(&normalized_name, port));
                }
                Err(e) => e,
            };

            let err_str = err.to_string().to_lowercase();
            let is_transient = err_str.contains("not functioning")
                || err_str.contains("temporarily unavailable")
                || err_str.contains("interrupted");

            if is_transient && attempt < MAX_OPEN_RETRIES {
                debug!(attempt, error = %err, "serial port not ready, retrying");
                std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                continue;
            }

            return Err(match err.kind() {
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    DfuError::PortPermissionDenied {
                        port: port_name.to_string(),
                    }
                }
                serialport::ErrorKind::NoDevice
                | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    DfuError::PortNotFound {
                        port: port_name.to_string(),
                    }
                }
                _ if err_str.contains("busy") || err_str.contains("in use") => {
                    DfuError::PortBusy {
                        port: port_name.to_string(),
                    }
                }
                _ => DfuError::Serial(err),
            });
        }
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. so opening does not wait for carrier detect
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need the \\.\ prefix
        if let Some(n) = name.strip_prefix("COM").and_then(|n| n.parse::<u32>().ok()) {
            if n > 9 {
                return format!("\\\\.\\{}", name);
            }
        }
    }

    name.to_string()
}

// ============================================================================
// Registry
// ============================================================================

/// The set of enabled transports.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<(String, Box<dyn DfuTransport>)>,
    control_point: ControlPoint,
    active: bool,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, transport: Box<dyn DfuTransport>) {
        debug!(transport = name, "transport registered");
        self.transports.push((name.to_string(), transport));
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Bring every transport up and record the activation in the settings.
    ///
    /// If one fails, the ones already up are closed again.
    pub fn init_all<F: FlashDriver, V: SignatureVerifier>(
        &mut self,
        handler: &mut RequestHandler<F, V>,
    ) -> DfuResult<()> {
        for index in 0..self.transports.len() {
            let (name, transport) = &mut self.transports[index];
            if let Err(e) = transport.init() {
                warn!(transport = %name, error = %e, "transport failed to start");
                for (name, transport) in self.transports[..index].iter_mut() {
                    if let Err(e) = transport.close() {
                        warn!(transport = %name, error = %e, "transport failed to close");
                    }
                }
                return Err(e);
            }
        }

        self.active = true;
        self.control_point = ControlPoint::new();
        handler.set_transport_activated(true)?;
        info!(count = self.transports.len(), "transports started");
        Ok(())
    }

    /// Close every transport. All are attempted; the first failure is returned.
    pub fn close_all(&mut self) -> DfuResult<()> {
        let mut first_error = None;
        for (name, transport) in self.transports.iter_mut() {
            if let Err(e) = transport.close() {
                warn!(transport = %name, error = %e, "transport failed to close");
                first_error.get_or_insert(e);
            }
        }
        self.active = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Pump every pending inbound frame through the control point.
    ///
    /// Returns the number of frames handled.
    pub fn service<F: FlashDriver, V: SignatureVerifier>(
        &mut self,
        handler: &mut RequestHandler<F, V>,
    ) -> DfuResult<usize> {
        let mut handled = 0;
        for (name, transport) in self.transports.iter_mut() {
            while let Some(frame) = transport.poll()? {
                handled += 1;
                if let Some(response) = self.control_point.on_frame(handler, &frame) {
                    transport.send(&response)?;
                    handler.on_response_sent();
                }
                if let Some(notification) = self.control_point.drive(handler) {
                    debug!(transport = %name, "receipt notification");
                    transport.send(&notification)?;
                }
            }
        }
        Ok(handled)
    }

    /// Close the transports once the handler wants a reset.
    /// Returns true when the caller should reset now.
    pub fn finish_if_reset<F: FlashDriver, V: SignatureVerifier>(
        &mut self,
        handler: &RequestHandler<F, V>,
    ) -> DfuResult<bool> {
        if !handler.reset_requested() {
            return Ok(false);
        }
        info!("update complete, closing transports for reset");
        self.close_all()?;
        Ok(true)
    }
}
