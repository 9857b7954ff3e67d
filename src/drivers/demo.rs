//! Demo driver: a virtual device generating logic patterns and analog
//! square waves at a configurable samplerate.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ConfigKey, ConfigList, ConfigPair, ConfigValue};
use crate::datafeed::{Analog, Datafeed, Logic, Mq, MqFlags, Packet, Unit};
use crate::device::{DevRef, DeviceInstance, DeviceKey, DeviceStatus, Probe, ProbeGroup, ProbeKind};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::event_loop::{SourceAction, SourceId};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicPattern {
    /// Spells "sigrok" across 8 probes, scrolling one sample per step.
    Sigrok,
    Random,
    Incremental,
    AllLow,
    AllHigh,
}

impl LogicPattern {
    const ALL: [Self; 5] = [Self::Sigrok, Self::Random, Self::Incremental, Self::AllLow, Self::AllHigh];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sigrok => "sigrok",
            Self::Random => "random",
            Self::Incremental => "incremental",
            Self::AllLow => "all-low",
            Self::AllHigh => "all-high",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogPattern {
    Square,
}

impl AnalogPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "square",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        (name == "square").then_some(Self::Square)
    }
}

#[rustfmt::skip]
const PATTERN_SIGROK: [u8; 64] = [
    0x4c, 0x92, 0x92, 0x92, 0x64, 0x00, 0x00, 0x00,
    0x82, 0xfe, 0xfe, 0x82, 0x00, 0x00, 0x00, 0x00,
    0x7c, 0x82, 0x82, 0x92, 0x74, 0x00, 0x00, 0x00,
    0xfe, 0x12, 0x12, 0x32, 0xcc, 0x00, 0x00, 0x00,
    0x7c, 0x82, 0x82, 0x82, 0x7c, 0x00, 0x00, 0x00,
    0xfe, 0x10, 0x28, 0x44, 0x82, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xbe, 0xbe, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// One analog probe's waveform, replayed from the start of the buffer in
/// every packet.
#[derive(Debug, Clone)]
struct AnalogGenerator {
    probe: [usize; 1],
    group: String,
    pattern: AnalogPattern,
    data: Vec<f32>,
    num_samples: usize,
}

impl AnalogGenerator {
    fn new(probe: usize, group: &str) -> Self {
        let mut generator = Self {
            probe: [probe],
            group: group.to_string(),
            pattern: AnalogPattern::Square,
            data: Vec::new(),
            num_samples: 0,
        };
        generator.set_pattern(AnalogPattern::Square);
        generator
    }

    fn set_pattern(&mut self, pattern: AnalogPattern) {
        self.pattern = pattern;
        match pattern {
            AnalogPattern::Square => {
                let len = DemoDriver::ANALOG_BUFSIZE / std::mem::size_of::<f32>();
                let mut value = 5.0_f32;
                let mut last_end = 0;
                self.data.clear();
                for i in 0..len {
                    if i % 5 == 0 {
                        value = -value;
                    }
                    if i % 10 == 0 {
                        last_end = i.saturating_sub(1);
                    }
                    self.data.push(value);
                }
                // Whole periods only, so consecutive packets join seamlessly.
                self.num_samples = last_end;
            }
        }
    }
}

#[derive(Debug)]
struct Run {
    source: Option<SourceId>,
    started: Instant,
    samples_sent: u64,
}

#[derive(Debug)]
struct DemoState {
    samplerate: u64,
    limit_samples: u64,
    limit_msec: u64,
    num_logic_probes: usize,
    unitsize: usize,
    logic_pattern: LogicPattern,
    logic_data: Vec<u8>,
    step: u64,
    rng: StdRng,
    analog: Vec<AnalogGenerator>,
    run: Option<Run>,
}

impl DemoState {
    fn tick(&mut self, key: &DeviceKey, feed: &mut Datafeed) -> SourceAction {
        let Some(mut run) = self.run.take() else {
            return SourceAction::Remove;
        };

        let mut to_send = self.samples_owed(&run);
        while to_send > 0 {
            let mut now = to_send.min(self.logic_chunk());
            if let Some(shortest) = self.analog.iter().map(|g| g.num_samples as u64).min() {
                now = now.min(shortest);
            }
            if now == 0 {
                break;
            }

            if self.num_logic_probes > 0 {
                let unitsize = self.unitsize;
                let data = self.generate_logic(now as usize);
                send(feed, key, &Packet::Logic(Logic { unitsize, data }));
            }
            for generator in &self.analog {
                let n = now as usize;
                send(
                    feed,
                    key,
                    &Packet::Analog(Analog {
                        probes: &generator.probe,
                        num_samples: n,
                        mq: Mq::Voltage,
                        unit: Unit::Volt,
                        mq_flags: MqFlags::empty(),
                        data: &generator.data[..n],
                    }),
                );
            }
            to_send -= now;
            run.samples_sent += now;
        }

        if self.limit_reached(&run) {
            log::info!("{}: requested limit reached after {} samples", key, run.samples_sent);
            send(feed, key, &Packet::End);
            return SourceAction::Remove;
        }
        self.run = Some(run);
        SourceAction::Continue
    }

    fn new(num_logic_probes: usize, analog: Vec<AnalogGenerator>) -> Self {
        Self {
            samplerate: DemoDriver::DEFAULT_SAMPLERATE,
            limit_samples: 0,
            limit_msec: 0,
            num_logic_probes,
            unitsize: num_logic_probes.div_ceil(8),
            logic_pattern: LogicPattern::Sigrok,
            logic_data: vec![0; DemoDriver::LOGIC_BUFSIZE],
            step: 0,
            rng: StdRng::from_entropy(),
            analog,
            run: None,
        }
    }

    fn set_logic_pattern(&mut self, pattern: LogicPattern) {
        self.logic_pattern = pattern;
        match pattern {
            LogicPattern::AllLow => self.logic_data.fill(0x00),
            LogicPattern::AllHigh => self.logic_data.fill(0xff),
            _ => {}
        }
    }

    /// Samples per logic packet.
    fn logic_chunk(&self) -> u64 {
        (DemoDriver::LOGIC_BUFSIZE / self.unitsize.max(1)) as u64
    }

    fn generate_logic(&mut self, samples: usize) -> &[u8] {
        let size = samples * self.unitsize;
        let unitsize = self.unitsize;
        match self.logic_pattern {
            LogicPattern::Sigrok => {
                for sample in self.logic_data[..size].chunks_exact_mut(unitsize) {
                    for (j, byte) in sample.iter_mut().enumerate() {
                        let idx = (self.step as usize + j) % PATTERN_SIGROK.len();
                        *byte = !(PATTERN_SIGROK[idx] >> 1);
                    }
                    self.step += 1;
                }
            }
            LogicPattern::Random => self.rng.fill(&mut self.logic_data[..size]),
            LogicPattern::Incremental => {
                for sample in self.logic_data[..size].chunks_exact_mut(unitsize) {
                    sample.fill(self.step as u8);
                    self.step += 1;
                }
            }
            LogicPattern::AllLow | LogicPattern::AllHigh => {}
        }
        &self.logic_data[..size]
    }

    /// How many samples the elapsed time entitles us to send, bounded by
    /// the configured limits.
    fn samples_owed(&self, run: &Run) -> u64 {
        let mut elapsed = run.started.elapsed();
        if self.limit_msec > 0 {
            elapsed = elapsed.min(Duration::from_millis(self.limit_msec));
        }
        let expected = (elapsed.as_micros() * u128::from(self.samplerate) / 1_000_000) as u64;
        let mut owed = expected.saturating_sub(run.samples_sent);
        if self.limit_samples > 0 {
            owed = owed.min(self.limit_samples.saturating_sub(run.samples_sent));
        }
        owed
    }

    fn limit_reached(&self, run: &Run) -> bool {
        (self.limit_samples > 0 && run.samples_sent >= self.limit_samples)
            || (self.limit_msec > 0 && run.started.elapsed() >= Duration::from_millis(self.limit_msec))
    }
}

pub struct DemoDriver;

impl DemoDriver {
    pub const NAME: &'static str = "demo";
    pub const DEFAULT_NUM_LOGIC_PROBES: usize = 8;
    pub const DEFAULT_NUM_ANALOG_PROBES: usize = 4;
    pub const DEFAULT_SAMPLERATE: u64 = 200_000;
    pub const LOGIC_BUFSIZE: usize = 4096;
    pub const ANALOG_BUFSIZE: usize = 4096;
    pub const POLL_INTERVAL: Duration = Duration::from_millis(40);

    const SCAN_OPTIONS: [ConfigKey; 2] = [ConfigKey::NumLogicProbes, ConfigKey::NumAnalogProbes];
    const DEVICE_OPTIONS: [ConfigKey; 6] = [
        ConfigKey::LogicAnalyzer,
        ConfigKey::DemoDev,
        ConfigKey::Samplerate,
        ConfigKey::PatternMode,
        ConfigKey::LimitSamples,
        ConfigKey::LimitMsec,
    ];
    const SAMPLERATE_MIN: u64 = 1;
    const SAMPLERATE_MAX: u64 = 1_000_000_000;
    const SAMPLERATE_STEP: u64 = 1;

    pub fn new() -> Self {
        Self
    }

    fn probe_count(value: &ConfigValue) -> Result<usize> {
        usize::try_from(value.as_i32()?).map_err(|_| Error::arg("probe count must not be negative"))
    }

    /// Timer callback: sends whatever the elapsed time calls for.
    /// Timer callback. The state is detached from the device while packets
    /// go out, so consumers may borrow the device.
    fn prepare_data(dev: &DevRef, feed: &mut Datafeed) -> SourceAction {
        let (key, state) = {
            let mut dev = dev.borrow_mut();
            (dev.key(), dev.take_private::<DemoState>())
        };
        let mut state = match state {
            Ok(state) => state,
            Err(e) => {
                log::error!("{}: {}", key, e);
                return SourceAction::Remove;
            }
        };
        let action = state.tick(&key, feed);
        dev.borrow_mut().set_private(*state);
        action
    }
}

impl Default for DemoDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn send(feed: &mut Datafeed, key: &DeviceKey, packet: &Packet<'_>) {
    if let Err(e) = feed.send(key, packet) {
        log::warn!("{}: dropping {} packet: {}", key, packet.name(), e);
    }
}

impl Driver for DemoDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn long_name(&self) -> &'static str {
        "Demo driver and pattern generator"
    }

    fn scan(&self, options: &[ConfigPair]) -> Result<Vec<DeviceInstance>> {
        let mut num_logic = Self::DEFAULT_NUM_LOGIC_PROBES;
        let mut num_analog = Self::DEFAULT_NUM_ANALOG_PROBES;
        for option in options {
            match option.key {
                ConfigKey::NumLogicProbes => num_logic = Self::probe_count(&option.value)?,
                ConfigKey::NumAnalogProbes => num_analog = Self::probe_count(&option.value)?,
                _ => {}
            }
        }

        let mut dev = DeviceInstance::new(0, DeviceStatus::Inactive, "", "Demo device", "");
        for i in 0..num_logic {
            dev.add_probe(Probe::new(i, ProbeKind::Logic, true, &format!("D{i}")));
        }
        dev.add_probe_group(ProbeGroup::new("Logic", (0..num_logic).collect()));

        let mut generators = Vec::with_capacity(num_analog);
        for i in 0..num_analog {
            let index = num_logic + i;
            let name = format!("A{i}");
            dev.add_probe(Probe::new(index, ProbeKind::Analog, true, &name));
            dev.add_probe_group(ProbeGroup::new(&name, vec![index]));
            generators.push(AnalogGenerator::new(index, &name));
        }

        dev.set_private(DemoState::new(num_logic, generators));
        Ok(vec![dev])
    }

    fn dev_open(&self, dev: &mut DeviceInstance) -> Result<()> {
        dev.status = DeviceStatus::Active;
        Ok(())
    }

    fn dev_close(&self, dev: &mut DeviceInstance) -> Result<()> {
        dev.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn config_get(&self, key: ConfigKey, dev: Option<&DeviceInstance>, group: Option<&str>) -> Result<ConfigValue> {
        let state = dev.ok_or(Error::NotApplicable)?.private::<DemoState>()?;
        let value = match key {
            ConfigKey::Samplerate => ConfigValue::Uint64(state.samplerate),
            ConfigKey::LimitSamples => ConfigValue::Uint64(state.limit_samples),
            ConfigKey::LimitMsec => ConfigValue::Uint64(state.limit_msec),
            ConfigKey::PatternMode => match group.and_then(|g| state.analog.iter().find(|a| a.group == g)) {
                Some(generator) => ConfigValue::from(generator.pattern.as_str()),
                None => ConfigValue::from(state.logic_pattern.as_str()),
            },
            ConfigKey::NumLogicProbes => ConfigValue::Int32(state.num_logic_probes as i32),
            ConfigKey::NumAnalogProbes => ConfigValue::Int32(state.analog.len() as i32),
            _ => return Err(Error::NotApplicable),
        };
        Ok(value)
    }

    fn config_set(&self, key: ConfigKey, value: &ConfigValue, dev: &mut DeviceInstance, group: Option<&str>) -> Result<()> {
        if !dev.is_active() {
            return Err(Error::DeviceClosed);
        }
        let state = dev.private_mut::<DemoState>()?;
        match key {
            ConfigKey::Samplerate => {
                let rate = value.as_u64()?;
                if !(Self::SAMPLERATE_MIN..=Self::SAMPLERATE_MAX).contains(&rate) {
                    return Err(Error::OutOfRange(format!("samplerate {rate} Hz")));
                }
                log::debug!("Setting samplerate to {}", rate);
                state.samplerate = rate;
            }
            ConfigKey::LimitSamples => {
                state.limit_msec = 0;
                state.limit_samples = value.as_u64()?;
                log::debug!("Setting sample limit to {}", state.limit_samples);
            }
            ConfigKey::LimitMsec => {
                state.limit_samples = 0;
                state.limit_msec = value.as_u64()?;
                log::debug!("Setting time limit to {}ms", state.limit_msec);
            }
            ConfigKey::PatternMode => {
                let name = value.as_str()?;
                if let Some(pattern) = LogicPattern::from_name(name) {
                    log::debug!("Setting logic pattern to {}", name);
                    state.set_logic_pattern(pattern);
                } else if let Some(pattern) = AnalogPattern::from_name(name) {
                    log::debug!("Setting analog pattern to {}", name);
                    for generator in &mut state.analog {
                        if group.is_none_or(|g| g == generator.group) {
                            generator.set_pattern(pattern);
                        }
                    }
                } else {
                    return Err(Error::Arg(format!("unknown pattern {name}")));
                }
            }
            _ => return Err(Error::NotApplicable),
        }
        Ok(())
    }

    fn config_list(&self, key: ConfigKey, dev: Option<&DeviceInstance>, group: Option<&str>) -> Result<ConfigList> {
        match key {
            ConfigKey::ScanOptions => Ok(ConfigList::Keys(Self::SCAN_OPTIONS.to_vec())),
            ConfigKey::DeviceOptions => Ok(ConfigList::Keys(Self::DEVICE_OPTIONS.to_vec())),
            ConfigKey::Samplerate => Ok(ConfigList::SamplerateSteps {
                min: Self::SAMPLERATE_MIN,
                max: Self::SAMPLERATE_MAX,
                step: Self::SAMPLERATE_STEP,
            }),
            ConfigKey::PatternMode => {
                let analog_group = match (dev, group) {
                    (Some(dev), Some(name)) => dev.private::<DemoState>()?.analog.iter().any(|g| g.group == name),
                    _ => false,
                };
                let names = if analog_group {
                    vec![AnalogPattern::Square.as_str().to_string()]
                } else {
                    LogicPattern::ALL.iter().map(|p| p.as_str().to_string()).collect()
                };
                Ok(ConfigList::Strings(names))
            }
            _ => Err(Error::NotApplicable),
        }
    }

    fn acquisition_start(&self, dev: &DevRef, session: &mut Session) -> Result<()> {
        let key = {
            let dev = dev.borrow();
            if !dev.is_active() {
                return Err(Error::DeviceClosed);
            }
            dev.key()
        };
        session.send_header(&key)?;

        let cb_dev = dev.clone();
        let source = session.add_timer_source(Self::POLL_INTERVAL, move |feed, _| {
            Self::prepare_data(&cb_dev, feed)
        });
        let mut dev = dev.borrow_mut();
        let state = dev.private_mut::<DemoState>()?;
        state.step = 0;
        state.run = Some(Run {
            source: Some(source),
            started: Instant::now(),
            samples_sent: 0,
        });
        Ok(())
    }

    fn acquisition_stop(&self, dev: &DevRef, session: &mut Session) -> Result<()> {
        let (key, run) = {
            let mut dev = dev.borrow_mut();
            let key = dev.key();
            (key, dev.private_mut::<DemoState>()?.run.take())
        };
        if let Some(run) = run {
            if let Some(source) = run.source {
                session.remove_source(source);
            }
            session.send(&key, &Packet::End)?;
        }
        Ok(())
    }
}
