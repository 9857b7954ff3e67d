use std::cell::RefCell;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::{Duration, Instant};

use super::decode::{self, trigger_cluster, ChunkDecoder, ChunkLimits, StopClip};
use super::firmware::{self, Firmware};
use super::protocol::{
    self, get_register, read_dram, read_pos, set_register, write_register, write_trigger_lut, Positions,
    ReadRegister, WriteRegister, CHUNK_SIZE, INIT_ARRAY, LEDSEL0, LEDSEL1, LOGIC_MODE_REPLY, LOGIC_MODE_START,
    MAX_CHUNKS, MODE_SDRAM_READ, MODE_START, MODE_STOP, MODE_TRIGGERED, POSITIONS_PER_CHUNK, SUICIDE,
    TRIGGER_OPTION_DEFAULT,
};
use super::trigger::{SigmaTrigger, TriggerLut};
use crate::config::{ConfigKey, ConfigList, ConfigPair, ConfigValue};
use crate::datafeed::{Datafeed, Packet};
use crate::device::{DevRef, DeviceInstance, DeviceKey, DeviceStatus, Probe, ProbeKind};
use crate::driver::{ContextConfig, Driver};
use crate::error::{Error, Result};
use crate::event_loop::{SourceAction, SourceId};
use crate::session::Session;
use crate::transport::{open_with_retries, Connector, FirmwareUpload, PortInfo, SerialConnector, Transport, TransportError};

/// Firmware family, chosen by samplerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Mhz50,
    Mhz100,
    Mhz200,
}

impl Tier {
    fn for_samplerate(samplerate: u64) -> Self {
        if samplerate <= 50_000_000 {
            Self::Mhz50
        } else if samplerate == 100_000_000 {
            Self::Mhz100
        } else {
            Self::Mhz200
        }
    }

    fn firmware(self) -> Firmware {
        match self {
            Self::Mhz50 => Firmware::Mhz50,
            Self::Mhz100 => Firmware::Mhz100,
            Self::Mhz200 => Firmware::Mhz200,
        }
    }

    fn num_probes(self) -> usize {
        match self {
            Self::Mhz50 => 16,
            Self::Mhz100 => 8,
            Self::Mhz200 => 4,
        }
    }

    fn samples_per_event(self) -> usize {
        16 / self.num_probes()
    }
}

struct Download {
    positions: Positions,
    trigger_chunk: Option<usize>,
    chunks_downloaded: usize,
    decoder: ChunkDecoder,
    buf: Vec<u8>,
}

enum Phase {
    Capture,
    Download(Download),
}

struct Run {
    source: Option<SourceId>,
    started: Instant,
    /// Capture duration; 0 captures until memory is full or a stop request.
    capture_msec: u64,
    limit_samples: u64,
    tier: Tier,
    trigger: SigmaTrigger,
    phase: Phase,
}

impl Run {
    /// Halts sampling and prepares reading back the sample memory.
    fn enter_download(&mut self, conn: &mut dyn Transport) -> Result<()> {
        set_register(conn, WriteRegister::Mode, MODE_STOP)?;
        set_register(conn, WriteRegister::Mode, MODE_SDRAM_READ)?;

        let positions = read_pos(conn)?;
        let modestatus = get_register(conn, ReadRegister::Mode)?;
        let trigger_chunk =
            (modestatus & MODE_TRIGGERED != 0).then_some((positions.triggerpos / POSITIONS_PER_CHUNK) as usize);
        log::debug!(
            "Capture stopped: stoppos {}, triggerpos {}, trigger chunk {:?}",
            positions.stoppos,
            positions.triggerpos,
            trigger_chunk
        );

        let decoder = ChunkDecoder::new(self.tier.samples_per_event(), self.tier.num_probes())
            .with_trigger(self.trigger, self.trigger.is_set())
            .with_sample_limit(self.limit_samples);
        self.phase = Phase::Download(Download {
            positions,
            trigger_chunk,
            chunks_downloaded: 0,
            decoder,
            buf: Vec::new(),
        });
        Ok(())
    }

    fn poll(&mut self, conn: &mut dyn Transport, key: &DeviceKey, feed: &mut Datafeed) -> Result<SourceAction> {
        if matches!(self.phase, Phase::Capture) {
            let positions = read_pos(conn)?;
            let running_msec = self.started.elapsed().as_millis() as u64;
            let time_up = self.capture_msec > 0 && running_msec >= self.capture_msec;
            if time_up || positions.num_chunks() >= MAX_CHUNKS {
                log::info!("{}: capture finished after {} ms", key, running_msec);
                self.enter_download(conn)?;
            }
            return Ok(SourceAction::Continue);
        }
        let Phase::Download(download) = &mut self.phase else {
            return Err(Error::bug("sample download without a capture"));
        };

        let _span = tracing::info_span!("sample_download", device = %key, chunk = download.chunks_downloaded).entered();
        let numchunks = download.positions.num_chunks();
        if download.chunks_downloaded >= numchunks || download.decoder.is_done() {
            log::info!(
                "{}: download complete, {} samples",
                key,
                download.decoder.samples_emitted()
            );
            feed.send(key, &Packet::End)?;
            return Ok(SourceAction::Remove);
        }

        let newchunks = SigmaDriver::CHUNKS_PER_READ.min(numchunks - download.chunks_downloaded);
        log::info!(
            "{}: downloading sample data: {:.0} %",
            key,
            100.0 * download.chunks_downloaded as f64 / numchunks as f64
        );

        download.buf.clear();
        download.buf.try_reserve_exact(newchunks * CHUNK_SIZE)?;
        download.buf.resize(newchunks * CHUNK_SIZE, 0);
        let startchunk = u16::try_from(download.chunks_downloaded)
            .map_err(|_| Error::bug("chunk index beyond sample memory"))?;
        read_dram(conn, startchunk, &mut download.buf)?;

        if download.chunks_downloaded == 0 {
            download.decoder.start(&download.buf);
        }

        let spe = self.tier.samples_per_event();
        for chunk in decode::chunks(&download.buf) {
            // The last row may be valid only in part.
            let stop_offset = (download.positions.stoppos % POSITIONS_PER_CHUNK) as u16;
            let stop = (download.chunks_downloaded + 1 == numchunks && stop_offset > 0).then(|| StopClip {
                base: download.decoder.lastts(),
                offset: stop_offset,
            });
            let limits = ChunkLimits {
                trigger_cluster: (download.trigger_chunk == Some(download.chunks_downloaded))
                    .then(|| trigger_cluster(download.positions.triggerpos, spe)),
                stop,
            };

            let mut sent = Ok(());
            download.decoder.decode_chunk(chunk, limits, &mut |packet: &Packet<'_>| {
                if sent.is_ok() {
                    sent = feed.send(key, packet);
                }
            })?;
            sent?;
            download.chunks_downloaded += 1;
        }
        Ok(SourceAction::Continue)
    }
}

struct SigmaState {
    port: PortInfo,
    samplerate: u64,
    /// Firmware currently loaded, if any.
    tier: Option<Tier>,
    limit_msec: u64,
    limit_samples: u64,
    capture_ratio: u64,
    run: Option<Run>,
}

impl SigmaState {
    fn new(port: PortInfo) -> Self {
        Self {
            port,
            samplerate: 0,
            tier: None,
            limit_msec: 0,
            limit_samples: 0,
            capture_ratio: SigmaDriver::DEFAULT_CAPTURE_RATIO,
            run: None,
        }
    }

    /// Switches samplerate, loading another firmware when the tier changes.
    fn set_samplerate(&mut self, conn: &mut dyn Transport, samplerate: u64, firmware_dir: &Path) -> Result<()> {
        if !SigmaDriver::SAMPLERATES.contains(&samplerate) {
            return Err(Error::OutOfRange(format!("samplerate {samplerate} Hz is not supported")));
        }
        let tier = Tier::for_samplerate(samplerate);
        if self.tier != Some(tier) {
            upload_firmware(conn, tier.firmware(), firmware_dir)?;
            self.tier = Some(tier);
        }
        self.samplerate = samplerate;
        Ok(())
    }

    fn capture_msec(&self) -> u64 {
        if self.limit_samples > 0 && self.samplerate > 0 {
            self.limit_samples.saturating_mul(1000).div_ceil(self.samplerate)
        } else {
            self.limit_msec
        }
    }

    /// Programs trigger, clock and post-trigger time, then starts sampling.
    fn arm(&self, conn: &mut dyn Transport, tier: Tier, trigger: &SigmaTrigger) -> Result<(), TransportError> {
        // Trigger programming mode.
        set_register(conn, WriteRegister::TriggerSelect1, 0x20)?;

        let triggerselect = match tier {
            Tier::Mhz50 => {
                write_trigger_lut(conn, &TriggerLut::basic(trigger))?;
                (1 << LEDSEL1) | (1 << LEDSEL0)
            }
            Tier::Mhz100 | Tier::Mhz200 => {
                set_register(conn, WriteRegister::TriggerSelect1, 0x81)?;
                let edges = trigger.risingmask | trigger.fallingmask;
                let pin = (0u8..8).find(|pin| edges & (1 << pin) != 0).unwrap_or(0);
                let mut select = (1 << LEDSEL1) | pin;
                if trigger.fallingmask != 0 {
                    select |= 1 << 3;
                }
                select
            }
        };

        write_register(conn, WriteRegister::TriggerOption, &TRIGGER_OPTION_DEFAULT)?;
        set_register(conn, WriteRegister::TriggerSelect1, triggerselect)?;

        match tier {
            Tier::Mhz200 => set_register(conn, WriteRegister::ClockSelect, 0xf0)?,
            Tier::Mhz100 => set_register(conn, WriteRegister::ClockSelect, 0x00)?,
            Tier::Mhz50 => {
                // async, fraction, two bytes of disabled probes
                let fraction = (50_000_000 / self.samplerate - 1) as u8;
                write_register(conn, WriteRegister::ClockSelect, &[0, fraction, 0, 0])?;
            }
        }

        set_register(conn, WriteRegister::PostTrigger, (self.capture_ratio * 255 / 100) as u8)?;
        set_register(conn, WriteRegister::Mode, MODE_START)
    }
}

fn upload_firmware(conn: &mut dyn Transport, firmware: Firmware, dir: &Path) -> Result<()> {
    let _span = tracing::info_span!("firmware_upload", file = firmware.file_name()).entered();
    let bitstream = firmware::load(dir, firmware)?;
    let reboot = SUICIDE.repeat(4);

    log::info!("Uploading firmware file '{}'", firmware.file_name());
    conn.upload_firmware(&FirmwareUpload {
        reboot: &reboot,
        prepare: &INIT_ARRAY,
        bitstream: &bitstream,
    })?;
    conn.purge()?;

    // Discard garbage left over from programming.
    let mut pins = [0u8; 1];
    for _ in 0..SigmaDriver::MAX_GARBAGE_BYTES {
        if !matches!(conn.read(&mut pins), Ok(1)) {
            break;
        }
    }

    conn.write_all(&LOGIC_MODE_START)?;
    let mut reply = [0u8; 3];
    conn.read_exact_timeout(&mut reply, protocol::IO_TIMEOUT)?;
    if reply != LOGIC_MODE_REPLY {
        return Err(TransportError::Protocol(format!("configuration failed, invalid reply {reply:02x?}")).into());
    }
    log::info!("Firmware uploaded");
    Ok(())
}

fn parse_serial(serial: &str) -> Option<u32> {
    let serial = serial.trim();
    let digits = serial.strip_prefix("0x").unwrap_or(serial);
    u32::from_str_radix(digits, 16).ok()
}

/// Driver for the ASIX SIGMA and SIGMA2 16 channel logic analyzers.
pub struct SigmaDriver {
    connector: Box<dyn Connector>,
    config: RefCell<ContextConfig>,
}

impl SigmaDriver {
    pub const NAME: &'static str = "asix-sigma";
    pub const USB_VENDOR: u16 = 0xa600;
    pub const USB_PRODUCT: u16 = 0xa000;
    /// Serial numbers of SIGMA and SIGMA2 units.
    pub const SERIALS: RangeInclusive<u32> = 0xa601_0000..=0xa602_ffff;
    pub const NUM_PROBES: usize = 16;
    pub const SAMPLERATES: [u64; 10] = [
        200_000,
        250_000,
        500_000,
        1_000_000,
        5_000_000,
        10_000_000,
        25_000_000,
        50_000_000,
        100_000_000,
        200_000_000,
    ];
    pub const DEFAULT_SAMPLERATE: u64 = 200_000;
    pub const DEFAULT_CAPTURE_RATIO: u64 = 50;
    pub const TRIGGER_TYPE: &'static str = "rf10";
    pub const POLL_INTERVAL: Duration = Duration::from_millis(10);
    pub const CHUNKS_PER_READ: usize = 32;
    const MAX_GARBAGE_BYTES: usize = 4096;

    const DEVICE_OPTIONS: [ConfigKey; 6] = [
        ConfigKey::LogicAnalyzer,
        ConfigKey::Samplerate,
        ConfigKey::CaptureRatio,
        ConfigKey::LimitMsec,
        ConfigKey::LimitSamples,
        ConfigKey::TriggerType,
    ];

    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            config: RefCell::new(ContextConfig::default()),
        }
    }

    fn firmware_dir(&self) -> std::path::PathBuf {
        self.config.borrow().firmware_dir.clone()
    }

    /// Timer callback. The run and the transport are detached from the
    /// device while packets go out, so consumers may borrow the device.
    fn receive_data(dev: &DevRef, feed: &mut Datafeed) -> SourceAction {
        let (key, detached) = {
            let mut dev = dev.borrow_mut();
            let key = dev.key();
            let run = dev.private_mut::<SigmaState>().map(|state| state.run.take());
            let detached = match run {
                Ok(Some(run)) => match dev.take_conn() {
                    Some(conn) => Ok(Some((run, conn))),
                    None => Err(Error::DeviceClosed),
                },
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };
            (key, detached)
        };

        let result = match detached {
            Ok(Some((mut run, mut conn))) => {
                let action = run.poll(conn.as_mut(), &key, feed);
                let mut dev = dev.borrow_mut();
                dev.set_conn(conn);
                match (action, dev.private_mut::<SigmaState>()) {
                    (Ok(SourceAction::Continue), Ok(state)) => {
                        state.run = Some(run);
                        Ok(SourceAction::Continue)
                    }
                    (Ok(SourceAction::Continue), Err(e)) | (Err(e), _) => Err(e),
                    (Ok(SourceAction::Remove), _) => Ok(SourceAction::Remove),
                }
            }
            Ok(None) => Ok(SourceAction::Remove),
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            log::error!("{}: acquisition aborted: {}", key, e);
            if feed.is_streaming(&key) {
                if let Err(e) = feed.send(&key, &Packet::End) {
                    log::warn!("{}: dropping END packet: {}", key, e);
                }
            }
            SourceAction::Remove
        })
    }
}

impl Default for SigmaDriver {
    fn default() -> Self {
        Self::new(Box::new(SerialConnector::default()))
    }
}

impl Driver for SigmaDriver {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn long_name(&self) -> &'static str {
        "ASIX SIGMA/SIGMA2"
    }

    fn init(&self, config: &ContextConfig) -> Result<()> {
        *self.config.borrow_mut() = config.clone();
        Ok(())
    }

    fn scan(&self, _options: &[ConfigPair]) -> Result<Vec<DeviceInstance>> {
        let config = self.config.borrow().clone();
        let mut devices = Vec::new();

        for port in self.connector.list_ports()? {
            if port.vid != Self::USB_VENDOR || port.pid != Self::USB_PRODUCT {
                continue;
            }
            let serial_txt = port.serial_number.clone().unwrap_or_default();
            if !parse_serial(&serial_txt).is_some_and(|s| Self::SERIALS.contains(&s)) {
                log::warn!(
                    "{}: only SIGMA and SIGMA2 are supported, ignoring serial '{}'",
                    port.port,
                    serial_txt
                );
                continue;
            }

            match open_with_retries(self.connector.as_ref(), &port, config.scan_retries, config.scan_backoff) {
                Ok(mut conn) => {
                    if let Err(e) = conn.close() {
                        log::debug!("{}: closing after handshake failed: {}", port.port, e);
                    }
                }
                Err(e) => {
                    log::warn!("{}: skipping, handshake failed: {}", port.port, e);
                    continue;
                }
            }

            log::info!("Found ASIX SIGMA - Serial: {}", serial_txt);
            let mut dev = DeviceInstance::new(0, DeviceStatus::Inactive, "ASIX", "SIGMA", "");
            for index in 0..Self::NUM_PROBES {
                dev.add_probe(Probe::new(index, ProbeKind::Logic, true, &(index + 1).to_string()));
            }
            dev.set_private(SigmaState::new(port));
            devices.push(dev);
        }
        Ok(devices)
    }

    fn dev_open(&self, dev: &mut DeviceInstance) -> Result<()> {
        let port = dev.private::<SigmaState>()?.port.clone();
        let conn = self.connector.open(&port)?;
        dev.set_conn(conn);
        dev.status = DeviceStatus::Active;
        Ok(())
    }

    fn dev_close(&self, dev: &mut DeviceInstance) -> Result<()> {
        if let Some(mut conn) = dev.take_conn() {
            conn.close()?;
        }
        dev.status = DeviceStatus::Inactive;
        Ok(())
    }

    fn config_get(&self, key: ConfigKey, dev: Option<&DeviceInstance>, _group: Option<&str>) -> Result<ConfigValue> {
        let state = move || -> Result<&SigmaState> {
            dev.ok_or(Error::NotApplicable)?.private::<SigmaState>()
        };
        match key {
            ConfigKey::Samplerate => Ok(ConfigValue::Uint64(state()?.samplerate)),
            ConfigKey::CaptureRatio => Ok(ConfigValue::Uint64(state()?.capture_ratio)),
            ConfigKey::LimitMsec => Ok(ConfigValue::Uint64(state()?.limit_msec)),
            ConfigKey::LimitSamples => Ok(ConfigValue::Uint64(state()?.limit_samples)),
            _ => Err(Error::NotApplicable),
        }
    }

    fn config_set(&self, key: ConfigKey, value: &ConfigValue, dev: &mut DeviceInstance, _group: Option<&str>) -> Result<()> {
        if !dev.is_active() {
            return Err(Error::DeviceClosed);
        }
        match key {
            ConfigKey::Samplerate => {
                let samplerate = value.as_u64()?;
                let firmware_dir = self.firmware_dir();
                let (conn, state) = dev.conn_and_private_mut::<SigmaState>()?;
                state.set_samplerate(conn, samplerate, &firmware_dir)
            }
            ConfigKey::LimitMsec => {
                let limit = value.as_u64()?;
                if limit == 0 {
                    return Err(Error::arg("limit_time must be greater than 0"));
                }
                let state = dev.private_mut::<SigmaState>()?;
                state.limit_msec = limit;
                state.limit_samples = 0;
                Ok(())
            }
            ConfigKey::LimitSamples => {
                let limit = value.as_u64()?;
                let state = dev.private_mut::<SigmaState>()?;
                state.limit_samples = limit;
                state.limit_msec = 0;
                Ok(())
            }
            ConfigKey::CaptureRatio => {
                let ratio = value.as_u64()?;
                if ratio > 100 {
                    return Err(Error::OutOfRange(format!("capture ratio {ratio} is not within 0..=100")));
                }
                dev.private_mut::<SigmaState>()?.capture_ratio = ratio;
                Ok(())
            }
            _ => Err(Error::NotApplicable),
        }
    }

    fn config_list(&self, key: ConfigKey, _dev: Option<&DeviceInstance>, _group: Option<&str>) -> Result<ConfigList> {
        match key {
            ConfigKey::DeviceOptions => Ok(ConfigList::Keys(Self::DEVICE_OPTIONS.to_vec())),
            ConfigKey::Samplerate => Ok(ConfigList::Samplerates(Self::SAMPLERATES.to_vec())),
            ConfigKey::TriggerType => Ok(ConfigList::TriggerTypes(Self::TRIGGER_TYPE.to_string())),
            _ => Err(Error::NotApplicable),
        }
    }

    fn acquisition_start(&self, dev: &DevRef, session: &mut Session) -> Result<()> {
        let key = {
            let mut dev = dev.borrow_mut();
            if !dev.is_active() {
                return Err(Error::DeviceClosed);
            }
            let key = dev.key();
            let specs: Vec<(usize, String)> = dev
                .enabled_probes()
                .filter_map(|p| p.trigger().map(|t| (p.index, t.to_string())))
                .collect();
            let firmware_dir = self.firmware_dir();

            let (conn, state) = dev.conn_and_private_mut::<SigmaState>()?;
            if state.tier.is_none() {
                state.set_samplerate(conn, Self::DEFAULT_SAMPLERATE, &firmware_dir)?;
            }
            let tier = state
                .tier
                .ok_or_else(|| Error::bug("no firmware loaded after setting the samplerate"))?;
            let trigger = SigmaTrigger::configure(specs.iter().map(|(i, s)| (*i, s.as_str())), tier != Tier::Mhz50)?;

            state.arm(conn, tier, &trigger)?;
            log::info!(
                "{}: capturing at {} Hz, {} probes",
                key,
                state.samplerate,
                tier.num_probes()
            );
            state.run = Some(Run {
                source: None,
                started: Instant::now(),
                capture_msec: state.capture_msec(),
                limit_samples: state.limit_samples,
                tier,
                trigger,
                phase: Phase::Capture,
            });
            key
        };

        session.send_header(&key)?;
        let cb_dev = dev.clone();
        let source = session.add_timer_source(Self::POLL_INTERVAL, move |feed, _| {
            Self::receive_data(&cb_dev, feed)
        });
        if let Some(run) = dev.borrow_mut().private_mut::<SigmaState>()?.run.as_mut() {
            run.source = Some(source);
        }
        Ok(())
    }

    /// Stops sampling; the data is then read back and the end packet sent
    /// by the already registered source.
    fn acquisition_stop(&self, dev: &DevRef, session: &mut Session) -> Result<()> {
        let (key, failed) = {
            let mut dev = dev.borrow_mut();
            let key = dev.key();
            let (conn, state) = match dev.conn_and_private_mut::<SigmaState>() {
                Ok(parts) => parts,
                Err(Error::DeviceClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let Some(run) = state.run.as_mut() else {
                return Ok(());
            };
            if !matches!(run.phase, Phase::Capture) {
                return Ok(());
            }

            log::info!("{}: stop requested, downloading captured data", key);
            match run.enter_download(conn) {
                Ok(()) => return Ok(()),
                Err(e) => (key, (state.run.take().and_then(|run| run.source), e)),
            }
        };

        let (source, e) = failed;
        if let Some(source) = source {
            session.remove_source(source);
        }
        session.send(&key, &Packet::End)?;
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::PathBuf;
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use super::super::decode::testdata::chunk;
    use super::super::emulator::{sigma_port, EmulatorConnector, SigmaEmulator};
    use super::*;
    use crate::driver::{config_get, config_set, Context};
    use crate::transport::mock::FlakyConnector;

    fn firmware_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sampleflow-sigma-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        for fw in [Firmware::Mhz50, Firmware::Mhz100, Firmware::Mhz200] {
            fs::write(dir.join(fw.file_name()), [0xde, 0xad, 0xbe, 0xef]).unwrap();
        }
        dir
    }

    fn context(connector: Box<dyn Connector>, tag: &str) -> Context {
        let config = ContextConfig::default()
            .with_firmware_dir(firmware_dir(tag))
            .with_scan_retries(1, Duration::ZERO);
        let mut ctx = Context::with_config(config);
        ctx.register(SigmaDriver::new(connector)).unwrap();
        ctx.init_driver(SigmaDriver::NAME).unwrap();
        ctx
    }

    fn open_sigma(hw: &SigmaEmulator, tag: &str) -> (Context, DevRef) {
        let connector = EmulatorConnector {
            ports: vec![sigma_port("/dev/sigma0", "A6010001")],
            hw: hw.clone(),
        };
        let mut ctx = context(Box::new(connector), tag);
        let dev = ctx.scan(SigmaDriver::NAME, &[]).remove(0);
        ctx.dev_open(&dev).unwrap();
        (ctx, dev)
    }

    /// Three rows holding exactly 1024 samples up to the stop position.
    fn load_capture(hw: &SigmaEmulator) {
        let rows = [
            (0..64).map(|i| (100 + i, [i; 7])).collect::<Vec<_>>(),
            (0..64).map(|i| (164 + i, [i; 7])).collect(),
            // Eight cluster widths apart: one padding sample per cluster.
            (0..16).map(|i| (235 + 8 * i, [0xff00; 7])).collect(),
        ];
        let mut state = hw.0.borrow_mut();
        state.rows = rows.iter().map(|clusters| chunk(clusters, 400)).collect();
        // 1152 once corrected: three rows, 128 positions into the last one.
        state.raw_stoppos = 1153;
    }

    #[derive(Default)]
    struct Feed {
        kinds: Vec<&'static str>,
        samples: usize,
        samples_before_trigger: Option<usize>,
    }

    fn record(session: &mut Session) -> Rc<RefCell<Feed>> {
        let feed = Rc::new(RefCell::new(Feed::default()));
        let sink = feed.clone();
        session.add_consumer(move |_, packet| {
            let mut f = sink.borrow_mut();
            match packet {
                Packet::Logic(logic) => {
                    assert_eq!(logic.unitsize, 2);
                    f.samples += logic.num_samples();
                }
                Packet::Trigger => f.samples_before_trigger = Some(f.samples),
                _ => {}
            }
            f.kinds.push(packet.name());
        });
        feed
    }

    #[test]
    fn test_scan_filters_devices() {
        let hw = SigmaEmulator::default();
        let mut other = sigma_port("/dev/ttyUSB1", "A6010002");
        other.vid = 0x0403;
        let connector = EmulatorConnector {
            ports: vec![
                other,
                sigma_port("/dev/sigma-old", "A6000001"),
                sigma_port("/dev/sigma0", "A6020001"),
            ],
            hw,
        };
        let mut ctx = context(Box::new(connector), "scan");
        let found = ctx.scan(SigmaDriver::NAME, &[]);
        assert_eq!(found.len(), 1);
        let dev = found[0].borrow();
        assert_eq!(dev.vendor, "ASIX");
        assert_eq!(dev.model, "SIGMA");
        assert_eq!(dev.status, DeviceStatus::Inactive);
        assert_eq!(dev.probes().len(), 16);
        assert_eq!(dev.probe(0).unwrap().name, "1");
        assert_eq!(dev.probe(15).unwrap().name, "16");
    }

    #[test]
    fn test_scan_skips_failed_handshake() {
        let connector = FlakyConnector {
            ports: vec![sigma_port("/dev/sigma0", "A6010001")],
            failures_left: RefCell::new(5),
        };
        let mut ctx = context(Box::new(connector), "flaky");
        assert!(ctx.scan(SigmaDriver::NAME, &[]).is_empty());
    }

    #[test]
    fn test_firmware_reloaded_only_on_tier_change() {
        let hw = SigmaEmulator::default();
        let (ctx, dev) = open_sigma(&hw, "tiers");
        let driver = ctx.driver(SigmaDriver::NAME).unwrap();
        let mut dev = dev.borrow_mut();

        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(1_000_000), None).unwrap();
        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(50_000_000), None).unwrap();
        assert_eq!(hw.0.borrow().firmware_uploads.len(), 1);

        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(100_000_000), None).unwrap();
        config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(200_000_000), None).unwrap();
        assert_eq!(hw.0.borrow().firmware_uploads.len(), 3);
        // Four bytes of image, sixteen bit-bang bytes each.
        assert_eq!(hw.0.borrow().firmware_uploads[0], 64);

        let rate = config_get(driver.as_ref(), ConfigKey::Samplerate, Some(&*dev), None).unwrap();
        assert_eq!(rate, ConfigValue::Uint64(200_000_000));
    }

    #[test]
    fn test_config_errors_leave_state_unchanged() {
        let hw = SigmaEmulator::default();
        let (ctx, dev) = open_sigma(&hw, "errors");
        let driver = ctx.driver(SigmaDriver::NAME).unwrap();
        let mut dev = dev.borrow_mut();

        let err = config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(123), None).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
        assert!(hw.0.borrow().firmware_uploads.is_empty());

        let err = config_set(&mut dev, ConfigKey::CaptureRatio, &ConfigValue::Uint64(101), None).unwrap_err();
        assert!(matches!(err, Error::OutOfRange(_)));
        let ratio = config_get(driver.as_ref(), ConfigKey::CaptureRatio, Some(&*dev), None).unwrap();
        assert_eq!(ratio, ConfigValue::Uint64(50));

        let err = config_set(&mut dev, ConfigKey::LimitMsec, &ConfigValue::Uint64(0), None).unwrap_err();
        assert!(matches!(err, Error::Arg(_)));

        let err = config_set(&mut dev, ConfigKey::PatternMode, &ConfigValue::from("random"), None).unwrap_err();
        assert!(err.is_not_applicable());
    }

    #[test]
    fn test_config_set_on_closed_device() {
        let hw = SigmaEmulator::default();
        let (ctx, dev) = open_sigma(&hw, "closed");
        ctx.dev_close(&dev).unwrap();
        let err = config_set(&mut dev.borrow_mut(), ConfigKey::LimitMsec, &ConfigValue::Uint64(10), None).unwrap_err();
        assert!(matches!(err, Error::DeviceClosed));
    }

    #[test]
    fn test_config_list() {
        let driver = SigmaDriver::new(Box::new(EmulatorConnector {
            ports: Vec::new(),
            hw: SigmaEmulator::default(),
        }));
        let list = driver.config_list(ConfigKey::DeviceOptions, None, None).unwrap();
        assert!(list.contains_key(ConfigKey::CaptureRatio));
        assert_eq!(
            driver.config_list(ConfigKey::TriggerType, None, None).unwrap(),
            ConfigList::TriggerTypes("rf10".to_string())
        );
        assert_eq!(
            driver.config_list(ConfigKey::Samplerate, None, None).unwrap(),
            ConfigList::Samplerates(SigmaDriver::SAMPLERATES.to_vec())
        );
    }

    #[test]
    fn test_acquisition_with_sample_limit() {
        let hw = SigmaEmulator::default();
        load_capture(&hw);
        let (ctx, dev) = open_sigma(&hw, "e2e");
        config_set(&mut dev.borrow_mut(), ConfigKey::LimitSamples, &ConfigValue::Uint64(1024), None).unwrap();

        let mut session = ctx.new_session();
        session.add_device(dev).unwrap();
        let feed = record(&mut session);
        session.start().unwrap();
        session.run().unwrap();

        let feed = feed.borrow();
        assert_eq!(feed.kinds.first(), Some(&"HEADER"));
        assert_eq!(feed.kinds.last(), Some(&"END"));
        assert_eq!(feed.kinds.iter().filter(|k| **k == "END").count(), 1);
        assert_eq!(feed.samples, 1024);
        assert_eq!(feed.samples_before_trigger, None);

        let hw = hw.0.borrow();
        assert_eq!(hw.firmware_uploads.len(), 1);
        // 200 kHz: clock fraction 249, post trigger at 50 %.
        assert!(hw.register_writes.contains(&(WriteRegister::ClockSelect as u8, 249)));
        assert!(hw.register_writes.contains(&(WriteRegister::PostTrigger as u8, 127)));
        assert_eq!(hw.mode, MODE_SDRAM_READ);
    }

    #[test]
    fn test_trigger_packet_placed_at_edge() {
        let hw = SigmaEmulator::default();
        load_capture(&hw);
        {
            let mut state = hw.0.borrow_mut();
            let mut clusters: Vec<(u16, [u16; 7])> = (0..64).map(|i| (100 + i, [0; 7])).collect();
            clusters[10].1 = [0, 0, 0, 1, 1, 1, 1];
            for cluster in &mut clusters[11..] {
                cluster.1 = [1; 7];
            }
            state.rows[0] = chunk(&clusters, 400);
            state.triggered = true;
            state.raw_triggerpos = 77;
        }
        let (ctx, dev) = open_sigma(&hw, "trigger");
        {
            let mut dev = dev.borrow_mut();
            dev.set_probe_trigger(0, Some("r")).unwrap();
            config_set(&mut dev, ConfigKey::LimitSamples, &ConfigValue::Uint64(1024), None).unwrap();
        }

        let mut session = ctx.new_session();
        session.add_device(dev).unwrap();
        let feed = record(&mut session);
        session.start().unwrap();
        session.run().unwrap();

        let feed = feed.borrow();
        assert_eq!(feed.samples_before_trigger, Some(73));
        assert_eq!(feed.samples, 1024);
        assert_eq!(feed.kinds.iter().filter(|k| **k == "TRIGGER").count(), 1);
    }

    #[test]
    fn test_stop_downloads_before_end() {
        let hw = SigmaEmulator::default();
        load_capture(&hw);
        let (ctx, dev) = open_sigma(&hw, "stop");

        let mut session = ctx.new_session();
        session.add_device(dev).unwrap();
        let feed = record(&mut session);
        session.start().unwrap();
        session.stop().unwrap();
        assert_eq!(session.source_count(), 1);
        session.run().unwrap();

        let feed = feed.borrow();
        assert_eq!(feed.kinds.iter().filter(|k| **k == "END").count(), 1);
        assert_eq!(feed.kinds.last(), Some(&"END"));
        assert_eq!(feed.samples, 1024);
    }

    #[test]
    fn test_fast_mode_rejects_level_trigger() {
        let hw = SigmaEmulator::default();
        let (ctx, dev) = open_sigma(&hw, "fast");
        {
            let mut dev = dev.borrow_mut();
            config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(200_000_000), None).unwrap();
            dev.set_probe_trigger(1, Some("1")).unwrap();
        }
        let mut session = ctx.new_session();
        session.add_device(dev).unwrap();
        let feed = record(&mut session);
        assert!(matches!(session.start(), Err(Error::Trigger(_))));
        assert!(feed.borrow().kinds.is_empty());
    }

    fn arm_writes(samplerate: u64, probe: usize, spec: &str, tag: &str) -> Vec<(u8, u8)> {
        let hw = SigmaEmulator::default();
        let (ctx, dev) = open_sigma(&hw, tag);
        {
            let mut dev = dev.borrow_mut();
            config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(samplerate), None).unwrap();
            dev.set_probe_trigger(probe, Some(spec)).unwrap();
        }
        hw.0.borrow_mut().register_writes.clear();

        let mut session = ctx.new_session();
        session.add_device(dev).unwrap();
        session.start().unwrap();
        let writes = hw.0.borrow().register_writes.clone();
        writes
    }

    #[test]
    fn test_arm_at_200mhz_falling_edge() {
        let writes = arm_writes(200_000_000, 2, "f", "arm200");
        let expected: Vec<(u8, u8)> = vec![
            (WriteRegister::TriggerSelect1 as u8, 0x20),
            (WriteRegister::TriggerSelect1 as u8, 0x81),
            (WriteRegister::TriggerOption as u8, 0x08),
            (WriteRegister::TriggerOption as u8, 0x40),
            // LED select, falling flag, pin 2
            (WriteRegister::TriggerSelect1 as u8, 0x8a),
            (WriteRegister::ClockSelect as u8, 0xf0),
            (WriteRegister::PostTrigger as u8, 127),
            (WriteRegister::Mode as u8, MODE_START),
        ];
        assert_eq!(writes, expected);
    }

    #[test]
    fn test_arm_at_100mhz_rising_edge() {
        let writes = arm_writes(100_000_000, 3, "r", "arm100");
        let expected: Vec<(u8, u8)> = vec![
            (WriteRegister::TriggerSelect1 as u8, 0x20),
            (WriteRegister::TriggerSelect1 as u8, 0x81),
            (WriteRegister::TriggerOption as u8, 0x08),
            (WriteRegister::TriggerOption as u8, 0x40),
            (WriteRegister::TriggerSelect1 as u8, 0x83),
            (WriteRegister::ClockSelect as u8, 0x00),
            (WriteRegister::PostTrigger as u8, 127),
            (WriteRegister::Mode as u8, MODE_START),
        ];
        assert_eq!(writes, expected);
    }

    #[test]
    fn test_tier_firmware_files() {
        assert_eq!(Tier::for_samplerate(1_000_000).firmware().file_name(), "asix-sigma-50.fw");
        assert_eq!(Tier::for_samplerate(50_000_000).firmware().file_name(), "asix-sigma-50.fw");
        assert_eq!(Tier::for_samplerate(100_000_000).firmware().file_name(), "asix-sigma-100.fw");
        assert_eq!(Tier::for_samplerate(200_000_000).firmware().file_name(), "asix-sigma-200.fw");
    }

    #[test]
    fn test_capture_msec_saturates() {
        let mut state = SigmaState::new(sigma_port("/dev/sigma0", "A6010001"));
        state.samplerate = 200_000;
        state.limit_samples = 1024;
        assert_eq!(state.capture_msec(), 6);
        state.limit_samples = u64::MAX / 100;
        assert_eq!(state.capture_msec(), u64::MAX.div_ceil(200_000));
    }

    #[test]
    fn test_config_get_without_device() {
        let driver = SigmaDriver::new(Box::new(EmulatorConnector {
            ports: Vec::new(),
            hw: SigmaEmulator::default(),
        }));
        for key in [ConfigKey::Samplerate, ConfigKey::CaptureRatio, ConfigKey::LimitSamples] {
            let err = driver.config_get(key, None, None).unwrap_err();
            assert!(err.is_not_applicable(), "{key}: {err}");
        }
    }

    #[test]
    fn test_consumer_may_borrow_device() {
        let hw = SigmaEmulator::default();
        load_capture(&hw);
        let (ctx, dev) = open_sigma(&hw, "borrow");
        config_set(&mut dev.borrow_mut(), ConfigKey::LimitSamples, &ConfigValue::Uint64(1024), None).unwrap();

        let mut session = ctx.new_session();
        session.add_device(dev.clone()).unwrap();
        let busy = Rc::new(RefCell::new(Vec::new()));
        let (sink, seen_dev) = (busy.clone(), dev.clone());
        session.add_consumer(move |_, packet| {
            if seen_dev.try_borrow_mut().is_err() {
                sink.borrow_mut().push(packet.name());
            }
        });
        let feed = record(&mut session);
        session.start().unwrap();
        session.run().unwrap();

        assert!(busy.borrow().is_empty(), "device borrowed during {:?}", busy.borrow());
        assert_eq!(feed.borrow().samples, 1024);
        // Transport and state are back on the device.
        let dev = dev.borrow();
        assert!(dev.has_conn());
        assert!(dev.private::<SigmaState>().unwrap().run.is_none());
    }

    /// Collects the names of the spans created while it is the default.
    #[derive(Clone, Default)]
    struct SpanNames(Arc<Mutex<Vec<&'static str>>>);

    impl SpanNames {
        fn contains(&self, name: &str) -> bool {
            self.0.lock().map(|names| names.contains(&name)).unwrap_or(false)
        }
    }

    impl tracing::Subscriber for SpanNames {
        fn enabled(&self, _: &tracing::Metadata<'_>) -> bool {
            true
        }

        fn new_span(&self, attrs: &tracing::span::Attributes<'_>) -> tracing::span::Id {
            let mut names = self.0.lock().unwrap();
            names.push(attrs.metadata().name());
            tracing::span::Id::from_u64(names.len() as u64)
        }

        fn record(&self, _: &tracing::span::Id, _: &tracing::span::Record<'_>) {}

        fn record_follows_from(&self, _: &tracing::span::Id, _: &tracing::span::Id) {}

        fn event(&self, _: &tracing::Event<'_>) {}

        fn enter(&self, _: &tracing::span::Id) {}

        fn exit(&self, _: &tracing::span::Id) {}
    }

    #[test]
    fn test_upload_and_download_spans() {
        let hw = SigmaEmulator::default();
        load_capture(&hw);
        let (ctx, dev) = open_sigma(&hw, "spans");
        config_set(&mut dev.borrow_mut(), ConfigKey::LimitSamples, &ConfigValue::Uint64(1024), None).unwrap();
        let spans = SpanNames::default();

        tracing::subscriber::with_default(spans.clone(), || {
            let mut session = ctx.new_session();
            session.add_device(dev).unwrap();
            session.start().unwrap();
            session.run().unwrap();
        });

        assert!(spans.contains("firmware_upload"));
        assert!(spans.contains("sample_download"));
    }

    #[test]
    fn test_parse_serial() {
        assert_eq!(parse_serial("A6010001"), Some(0xa601_0001));
        assert_eq!(parse_serial("0xa602ffff"), Some(0xa602_ffff));
        assert_eq!(parse_serial("sigma"), None);
    }
}
