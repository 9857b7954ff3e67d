use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{SerialPort, SerialPortType};

use crate::event_loop::{Pollable, Readiness};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout while waiting for {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("Timeout error")]
    Timeout,

    #[error("Port {port} not found")]
    PortNotFound { port: String },

    #[error("Operation not supported by this transport")]
    Unsupported,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// USB identity of an enumerated port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub port: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

/// Firmware image handed to a transport, split into the phases a
/// programming cycle goes through.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareUpload<'a> {
    /// Sent to make the running firmware reboot into programming mode.
    pub reboot: &'a [u8],
    /// Sent once the target signals it is ready to receive a bitstream.
    pub prepare: &'a [u8],
    pub bitstream: &'a [u8],
}

/// Byte pipe to an instrument.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Discards pending input and output.
    fn purge(&mut self) -> Result<(), TransportError>;

    fn bytes_to_read(&mut self) -> Result<usize, TransportError>;

    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Programs new firmware into the instrument.
    fn upload_firmware(&mut self, _upload: &FirmwareUpload<'_>) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    /// Fills `buf` completely or fails once `timeout` has elapsed.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let started = Instant::now();
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(TransportError::Timeout) => {}
                Err(e) => return Err(e),
            }
            if filled < buf.len() && started.elapsed() >= timeout {
                return Err(TransportError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                });
            }
        }
        Ok(())
    }
}

/// Enumerates and opens ports of one transport family.
pub trait Connector {
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError>;

    fn open(&self, port: &PortInfo) -> Result<Box<dyn Transport>, TransportError>;
}

/// Opens `port`, retrying a bounded number of times with a pause in between.
pub fn open_with_retries(
    connector: &dyn Connector,
    port: &PortInfo,
    retries: u32,
    backoff: Duration,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut attempt = 0;
    loop {
        match connector.open(port) {
            Ok(transport) => return Ok(transport),
            Err(e) if attempt < retries => {
                attempt += 1;
                log::debug!("Opening {} failed ({}), retry {}/{}", port.port, e, attempt, retries);
                thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct SerialConnector {
    baud_rate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10);

    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BAUD_RATE, Self::DEFAULT_TIMEOUT)
    }
}

impl Connector for SerialConnector {
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        let ports = serialport::available_ports()?
            .into_iter()
            .filter_map(|p| match p.port_type {
                SerialPortType::UsbPort(usb) => Some(PortInfo {
                    port: p.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    serial_number: usb.serial_number,
                    product: usb.product,
                }),
                _ => None,
            })
            .collect();
        Ok(ports)
    }

    fn open(&self, port: &PortInfo) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(&port.port, self.baud_rate, self.timeout)?))
    }
}

#[derive(Debug)]
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port: &str, baud_rate: u32, timeout: Duration) -> Result<Self, TransportError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate).timeout(timeout).open()?;
        let mut transport = Self { serial };
        transport.purge()?;
        Ok(transport)
    }

    /// A second handle on the same port, for registering with the multiplexer.
    pub fn readiness_handle(&self) -> Result<Box<dyn Pollable>, TransportError> {
        Ok(Box::new(SerialReadiness {
            serial: self.serial.try_clone()?,
        }))
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Err(TransportError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.serial.write_all(buf)?;
        Ok(())
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        Ok(self.serial.bytes_to_read()? as usize)
    }
}

struct SerialReadiness {
    serial: Box<dyn SerialPort>,
}

impl Pollable for SerialReadiness {
    fn poll_ready(&mut self, interest: Readiness) -> std::io::Result<Readiness> {
        let mut ready = Readiness::empty();
        match self.serial.bytes_to_read() {
            Ok(n) if n > 0 && interest.contains(Readiness::IN) => ready |= Readiness::IN,
            Ok(_) => {}
            Err(_) => ready |= Readiness::ERR,
        }
        if interest.contains(Readiness::OUT) {
            ready |= Readiness::OUT;
        }
        Ok(ready)
    }
}
