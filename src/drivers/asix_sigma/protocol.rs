//! Register level access to the SIGMA FPGA.
//!
//! Each command byte carries an opcode in its high nibble and a 4 bit
//! operand in its low nibble, so register addresses and data bytes always
//! travel as two commands.

use std::time::Duration;

use super::trigger::TriggerLut;
use crate::transport::{Transport, TransportError};

pub const REG_ADDR_LOW: u8 = 0 << 4;
pub const REG_ADDR_HIGH: u8 = 1 << 4;
pub const REG_DATA_LOW: u8 = 2 << 4;
pub const REG_DATA_HIGH_WRITE: u8 = 3 << 4;
pub const REG_READ_ADDR: u8 = 4 << 4;
pub const REG_DRAM_WAIT_ACK: u8 = 5 << 4;
/// Copies one DRAM row into one of the two cache blocks.
pub const REG_DRAM_BLOCK: u8 = 6 << 4;
pub const REG_DRAM_BLOCK_BEGIN: u8 = 8 << 4;
/// Streams one cache block back to the host.
pub const REG_DRAM_BLOCK_DATA: u8 = 10 << 4;

/// Operand of [`REG_READ_ADDR`] that advances the address after the read.
pub const NEXT_REG: u8 = 1;

pub const LEDSEL0: u8 = 6;
pub const LEDSEL1: u8 = 7;

/// Bytes per DRAM row: 64 clusters of a timestamp and 7 events.
pub const CHUNK_SIZE: usize = 1024;
pub const CLUSTERS_PER_CHUNK: usize = 64;
pub const CLUSTER_SIZE: usize = 16;
pub const EVENTS_PER_CLUSTER: usize = 7;
/// Stop positions advance by this much per DRAM row.
pub const POSITIONS_PER_CHUNK: u32 = 512;
/// The sample memory is full once this many rows are in use.
pub const MAX_CHUNKS: usize = 32767;

pub const IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Forces the FPGA to reboot.
pub const SUICIDE: [u8; 8] = [0x84, 0x84, 0x88, 0x84, 0x88, 0x84, 0x88, 0x84];

/// Prepares the FPGA for a bitstream.
pub const INIT_ARRAY: [u8; 9] = [0x03, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];

/// Reads the ID register, then writes and reads back 0x55 and 0xaa through
/// the test register, then enters logic analyzer mode.
#[rustfmt::skip]
pub const LOGIC_MODE_START: [u8; 12] = [
    0x00, 0x40, 0x0f, 0x25, 0x35, 0x40,
    0x2a, 0x3a, 0x40, 0x03, 0x20, 0x38,
];

/// Answer to [`LOGIC_MODE_START`] from a correctly configured FPGA.
pub const LOGIC_MODE_REPLY: [u8; 3] = [0xa6, 0x55, 0xaa];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriteRegister {
    ClockSelect = 0,
    TriggerSelect0 = 1,
    TriggerSelect1 = 2,
    Mode = 3,
    MemRow = 4,
    PostTrigger = 5,
    TriggerOption = 6,
    PinView = 7,
    Test = 15,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadRegister {
    Id = 0,
    TriggerPosLow = 1,
    TriggerPosHigh = 2,
    TriggerPosUp = 3,
    StopPosLow = 4,
    StopPosHigh = 5,
    StopPosUp = 6,
    Mode = 7,
    PinChangeLow = 8,
    PinChangeHigh = 9,
    BlockLastTsLow = 10,
    BlockLastTsHigh = 11,
    PinView = 12,
    Test = 15,
}

/// Bit of the mode register telling that the trigger has fired.
pub const MODE_TRIGGERED: u8 = 0x20;

pub const MODE_START: u8 = 0x0d;
pub const MODE_STOP: u8 = 0x11;
pub const MODE_SDRAM_READ: u8 = 0x02;

/// Trigger output driven by the trigger event, output enabled.
pub const TRIGGER_OPTION_DEFAULT: [u8; 2] = [1 << 3, 1 << 6];

pub fn encode_write(reg: WriteRegister, data: &[u8]) -> Vec<u8> {
    let reg = reg as u8;
    let mut buf = Vec::with_capacity(2 + data.len() * 2);
    buf.push(REG_ADDR_LOW | (reg & 0xf));
    buf.push(REG_ADDR_HIGH | (reg >> 4));
    for byte in data {
        buf.push(REG_DATA_LOW | (byte & 0xf));
        buf.push(REG_DATA_HIGH_WRITE | (byte >> 4));
    }
    buf
}

pub fn write_register(
    conn: &mut dyn Transport,
    reg: WriteRegister,
    data: &[u8],
) -> Result<(), TransportError> {
    conn.write_all(&encode_write(reg, data))
}

pub fn set_register(conn: &mut dyn Transport, reg: WriteRegister, value: u8) -> Result<(), TransportError> {
    write_register(conn, reg, &[value])
}

pub fn read_register(conn: &mut dyn Transport, reg: ReadRegister, data: &mut [u8]) -> Result<(), TransportError> {
    let reg = reg as u8;
    conn.write_all(&[REG_ADDR_LOW | (reg & 0xf), REG_ADDR_HIGH | (reg >> 4), REG_READ_ADDR])?;
    conn.read_exact_timeout(data, IO_TIMEOUT)
}

pub fn get_register(conn: &mut dyn Transport, reg: ReadRegister) -> Result<u8, TransportError> {
    let mut value = [0u8; 1];
    read_register(conn, reg, &mut value)?;
    Ok(value[0])
}

/// Hardware trigger and stop position in sample memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Positions {
    pub triggerpos: u32,
    pub stoppos: u32,
}

impl Positions {
    /// DRAM rows holding valid data.
    pub fn num_chunks(&self) -> usize {
        self.stoppos.div_ceil(POSITIONS_PER_CHUNK) as usize
    }
}

/// Vendor correction applied to raw positions.
fn adjust_position(raw: u32) -> u32 {
    let pos = raw.wrapping_sub(1);
    if pos & 0x1ff == 0x1ff {
        pos.wrapping_sub(64)
    } else {
        pos
    }
}

pub fn read_pos(conn: &mut dyn Transport) -> Result<Positions, TransportError> {
    let mut cmd = [REG_READ_ADDR | NEXT_REG; 7];
    cmd[0] = REG_ADDR_LOW | ReadRegister::TriggerPosLow as u8;
    conn.write_all(&cmd)?;

    let mut result = [0u8; 6];
    conn.read_exact_timeout(&mut result, IO_TIMEOUT)?;
    let triggerpos = u32::from_le_bytes([result[0], result[1], result[2], 0]);
    let stoppos = u32::from_le_bytes([result[3], result[4], result[5], 0]);

    Ok(Positions {
        triggerpos: adjust_position(triggerpos),
        stoppos: adjust_position(stoppos),
    })
}

/// Command sequence streaming `numchunks` rows through the two cache
/// blocks in alternation.
pub fn encode_dram_read(numchunks: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + numchunks * 3);
    buf.push(REG_DRAM_BLOCK);
    buf.push(REG_DRAM_WAIT_ACK);
    for i in 0..numchunks {
        let last = i + 1 == numchunks;
        if !last {
            buf.push(REG_DRAM_BLOCK | ((((i + 1) % 2) as u8) << 4));
        }
        buf.push(REG_DRAM_BLOCK_DATA | (((i % 2) as u8) << 4));
        if !last {
            buf.push(REG_DRAM_WAIT_ACK);
        }
    }
    buf
}

/// Reads `buf.len() / CHUNK_SIZE` rows starting at `startchunk`.
pub fn read_dram(conn: &mut dyn Transport, startchunk: u16, buf: &mut [u8]) -> Result<(), TransportError> {
    let numchunks = buf.len() / CHUNK_SIZE;
    if numchunks == 0 {
        return Ok(());
    }
    write_register(conn, WriteRegister::MemRow, &startchunk.to_be_bytes())?;
    conn.write_all(&encode_dram_read(numchunks))?;
    conn.read_exact_timeout(&mut buf[..numchunks * CHUNK_SIZE], IO_TIMEOUT)
}

/// Uploads a compiled trigger table, one transposed row per LUT address,
/// followed by the trigger parameters.
pub fn write_trigger_lut(conn: &mut dyn Transport, lut: &TriggerLut) -> Result<(), TransportError> {
    for (i, row) in lut.select_rows().iter().enumerate() {
        write_register(conn, WriteRegister::TriggerSelect0, row)?;
        set_register(conn, WriteRegister::TriggerSelect1, 0x30 | i as u8)?;
    }
    write_register(conn, WriteRegister::TriggerSelect0, &lut.params.to_bytes())
}
