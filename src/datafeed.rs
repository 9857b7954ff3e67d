use std::collections::HashMap;
use std::time::SystemTime;

use crate::config::ConfigPair;
use crate::device::DeviceKey;
use crate::error::{Error, Result};

pub const FEED_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub feed_version: u32,
    pub start_time: SystemTime,
}

impl Header {
    pub fn now() -> Self {
        Self {
            feed_version: FEED_VERSION,
            start_time: SystemTime::now(),
        }
    }
}

/// Logic samples, `unitsize` bytes per sample, little endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logic<'a> {
    pub unitsize: usize,
    pub data: &'a [u8],
}

impl Logic<'_> {
    pub fn num_samples(&self) -> usize {
        if self.unitsize == 0 {
            0
        } else {
            self.data.len() / self.unitsize
        }
    }

    /// Sample `i` as an integer with probe 0 in bit 0.
    pub fn sample(&self, i: usize) -> Option<u64> {
        let start = i.checked_mul(self.unitsize)?;
        let bytes = self.data.get(start..start + self.unitsize)?;
        Some(
            bytes
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }
}

/// Measured quantity of an analog packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mq {
    Voltage,
    Current,
    Resistance,
    Capacitance,
    Temperature,
    Frequency,
    DutyCycle,
    Continuity,
    PulseWidth,
    Conductance,
    Power,
    Gain,
    SoundPressureLevel,
    CarbonMonoxide,
    RelativeHumidity,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Farad,
    Kelvin,
    Celsius,
    Fahrenheit,
    Hertz,
    Percentage,
    Boolean,
    Second,
    Siemens,
    DecibelMw,
    DecibelVolt,
    Unitless,
    DecibelSpl,
    Concentration,
    RevolutionsPerMinute,
    VoltAmpere,
    Watt,
    WattHour,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MqFlags: u32 {
        const AC = 0x01;
        const DC = 0x02;
        const RMS = 0x04;
        const DIODE = 0x08;
        const HOLD = 0x10;
        const MAX = 0x20;
        const MIN = 0x40;
        const AUTORANGE = 0x80;
        const RELATIVE = 0x100;
        const SPL_FREQ_WEIGHT_A = 0x200;
        const SPL_FREQ_WEIGHT_C = 0x400;
        const SPL_FREQ_WEIGHT_Z = 0x800;
        const SPL_FREQ_WEIGHT_FLAT = 0x1000;
        const SPL_TIME_WEIGHT_S = 0x2000;
        const SPL_TIME_WEIGHT_F = 0x4000;
        const SPL_LAT = 0x8000;
        const SPL_PCT_OVER_ALARM = 0x10000;
        const DURATION = 0x20000;
        const AVG = 0x40000;
    }
}

/// Analog samples; `data` holds `num_samples` values per listed probe,
/// interleaved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Analog<'a> {
    pub probes: &'a [usize],
    pub num_samples: usize,
    pub mq: Mq,
    pub unit: Unit,
    pub mq_flags: MqFlags,
    pub data: &'a [f32],
}

/// One datafeed event. Payloads borrow from the sender and are only valid
/// during the consumer call; copy them to keep them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet<'a> {
    Header(Header),
    End,
    Meta(&'a [ConfigPair]),
    Trigger,
    Logic(Logic<'a>),
    Analog(Analog<'a>),
    FrameBegin,
    FrameEnd,
}

impl Packet<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Header(_) => "HEADER",
            Self::End => "END",
            Self::Meta(_) => "META",
            Self::Trigger => "TRIGGER",
            Self::Logic(_) => "LOGIC",
            Self::Analog(_) => "ANALOG",
            Self::FrameBegin => "FRAME_BEGIN",
            Self::FrameEnd => "FRAME_END",
        }
    }
}

pub type Consumer = Box<dyn FnMut(&DeviceKey, &Packet<'_>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Ended,
}

/// Fans packets out to every registered consumer, in registration order.
///
/// The bus also keeps per-device ordering honest: a stream starts with
/// exactly one header and nothing follows its end.
#[derive(Default)]
pub struct Datafeed {
    consumers: Vec<Consumer>,
    streams: HashMap<DeviceKey, StreamState>,
}

impl Datafeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_consumer(&mut self, consumer: impl FnMut(&DeviceKey, &Packet<'_>) + 'static) {
        self.consumers.push(Box::new(consumer));
    }

    pub fn remove_consumers(&mut self) {
        self.consumers.clear();
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_streaming(&self, dev: &DeviceKey) -> bool {
        self.streams.get(dev) == Some(&StreamState::Streaming)
    }

    pub fn send(&mut self, dev: &DeviceKey, packet: &Packet<'_>) -> Result<()> {
        let state = self.streams.get(dev).copied();
        match (packet, state) {
            (Packet::Header(_), Some(StreamState::Streaming)) => {
                return Err(Error::bug(format!("{dev}: second header in one acquisition")));
            }
            (Packet::Header(_), _) => {
                self.streams.insert(*dev, StreamState::Streaming);
            }
            (_, Some(StreamState::Streaming)) => {
                if matches!(packet, Packet::End) {
                    self.streams.insert(*dev, StreamState::Ended);
                }
            }
            _ => {
                return Err(Error::bug(format!(
                    "{dev}: {} packet outside of an acquisition",
                    packet.name()
                )));
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            dump(dev, packet);
        }
        for consumer in &mut self.consumers {
            consumer(dev, packet);
        }
        Ok(())
    }
}

fn dump(dev: &DeviceKey, packet: &Packet<'_>) {
    match packet {
        Packet::Header(h) => log::debug!("{}: bus: received HEADER (feed version {})", dev, h.feed_version),
        Packet::Logic(l) => log::debug!(
            "{}: bus: received LOGIC packet ({} bytes, unitsize {})",
            dev,
            l.data.len(),
            l.unitsize
        ),
        Packet::Analog(a) => log::debug!("{}: bus: received ANALOG packet ({} samples)", dev, a.num_samples),
        Packet::Meta(m) => log::debug!("{}: bus: received META packet ({} items)", dev, m.len()),
        other => log::debug!("{}: bus: received {} packet", dev, other.name()),
    }
}
