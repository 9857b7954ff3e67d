//! Software stand-in for the SIGMA FPGA command interface.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use super::api::SigmaDriver;
use super::protocol::{ReadRegister, WriteRegister, CHUNK_SIZE, MODE_TRIGGERED, NEXT_REG};
use crate::transport::{Connector, FirmwareUpload, PortInfo, Transport, TransportError};

#[derive(Debug, Default)]
pub struct SigmaHw {
    addr: u8,
    data_low: u8,
    memrow_bytes: Vec<u8>,
    memrow: usize,
    dram_reads: usize,
    output: VecDeque<u8>,
    pub mode: u8,
    pub test: u8,
    pub triggered: bool,
    pub raw_triggerpos: u32,
    pub raw_stoppos: u32,
    /// DRAM contents, one row per entry; missing rows read as zeros.
    pub rows: Vec<Vec<u8>>,
    /// Bitstream length of every firmware upload.
    pub firmware_uploads: Vec<usize>,
    /// Every data byte written, with its register address.
    pub register_writes: Vec<(u8, u8)>,
}

impl SigmaHw {
    fn command(&mut self, byte: u8) {
        let operand = byte & 0xf;
        match byte >> 4 {
            0 => {
                self.addr = (self.addr & 0xf0) | operand;
                self.memrow_bytes.clear();
            }
            1 => self.addr = (self.addr & 0x0f) | (operand << 4),
            2 => self.data_low = operand,
            3 => self.write((operand << 4) | self.data_low),
            4 => {
                let value = self.read(self.addr);
                self.output.push_back(value);
                if operand & NEXT_REG != 0 {
                    self.addr = self.addr.wrapping_add(1);
                }
            }
            10 | 11 => {
                let row = self.rows.get(self.memrow + self.dram_reads).cloned();
                self.output.extend(row.unwrap_or_else(|| vec![0; CHUNK_SIZE]));
                self.dram_reads += 1;
            }
            _ => {}
        }
    }

    fn write(&mut self, value: u8) {
        self.register_writes.push((self.addr, value));
        match self.addr {
            a if a == WriteRegister::Mode as u8 => self.mode = value,
            a if a == WriteRegister::Test as u8 => self.test = value,
            a if a == WriteRegister::MemRow as u8 => {
                self.memrow_bytes.push(value);
                if let [high, low] = self.memrow_bytes[..] {
                    self.memrow = usize::from(u16::from_be_bytes([high, low]));
                    self.dram_reads = 0;
                }
            }
            _ => {}
        }
    }

    fn read(&self, reg: u8) -> u8 {
        let triggerpos = self.raw_triggerpos.to_le_bytes();
        let stoppos = self.raw_stoppos.to_le_bytes();
        match reg {
            r if r == ReadRegister::Id as u8 => 0xa6,
            1..=3 => triggerpos[usize::from(reg - 1)],
            4..=6 => stoppos[usize::from(reg - 4)],
            r if r == ReadRegister::Mode as u8 => {
                if self.triggered {
                    MODE_TRIGGERED
                } else {
                    0
                }
            }
            r if r == ReadRegister::Test as u8 => self.test,
            _ => 0,
        }
    }
}

/// Handle on a shared [`SigmaHw`]; every opened transport talks to the
/// same hardware.
#[derive(Debug, Default, Clone)]
pub struct SigmaEmulator(pub Rc<RefCell<SigmaHw>>);

impl Transport for SigmaEmulator {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut hw = self.0.borrow_mut();
        if hw.output.is_empty() {
            return Err(TransportError::Timeout);
        }
        let n = buf.len().min(hw.output.len());
        for (dst, src) in buf.iter_mut().zip(hw.output.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        let mut hw = self.0.borrow_mut();
        for &byte in buf {
            hw.command(byte);
        }
        Ok(())
    }

    fn purge(&mut self) -> Result<(), TransportError> {
        self.0.borrow_mut().output.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<usize, TransportError> {
        Ok(self.0.borrow().output.len())
    }

    fn upload_firmware(&mut self, upload: &FirmwareUpload<'_>) -> Result<(), TransportError> {
        let mut hw = self.0.borrow_mut();
        hw.firmware_uploads.push(upload.bitstream.len());
        hw.output.clear();
        // Programming leaves some noise in the receive buffer.
        hw.output.extend([0xff, 0x00, 0xff]);
        Ok(())
    }
}

pub struct EmulatorConnector {
    pub ports: Vec<PortInfo>,
    pub hw: SigmaEmulator,
}

impl Connector for EmulatorConnector {
    fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError> {
        Ok(self.ports.clone())
    }

    fn open(&self, _port: &PortInfo) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(self.hw.clone()))
    }
}

pub fn sigma_port(port: &str, serial: &str) -> PortInfo {
    PortInfo {
        port: port.to_string(),
        vid: SigmaDriver::USB_VENDOR,
        pid: SigmaDriver::USB_PRODUCT,
        serial_number: Some(serial.to_string()),
        product: Some("SIGMA".to_string()),
    }
}
