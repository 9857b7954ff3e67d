use std::fmt;

use crate::error::{Error, Result};

/// Configuration and capability identifiers shared by all drivers.
///
/// Keys are grouped by numeric range: device classes (10000), scan options
/// (20000), device options (30000), special keys (40000) and acquisition
/// limits (50000).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ConfigKey {
    LogicAnalyzer = 10000,
    Oscilloscope,
    Multimeter,
    DemoDev,
    SoundLevelMeter,
    Thermometer,
    Hygrometer,
    EnergyMeter,
    Demodulator,

    Conn = 20000,
    SerialComm,

    Samplerate = 30000,
    CaptureRatio,
    PatternMode,
    Rle,
    TriggerSlope,
    TriggerSource,
    HorizTriggerPos,
    BufferSize,
    Timebase,
    Filter,
    VDiv,
    Coupling,
    TriggerType,
    SampleInterval,
    NumTimebase,
    NumVDiv,
    SplWeightFreq,
    SplWeightTime,
    SplMeasurementRange,
    HoldMax,
    HoldMin,
    VoltageThreshold,
    ExternalClock,
    Swap,
    CenterFrequency,
    NumLogicProbes,
    NumAnalogProbes,

    ScanOptions = 40000,
    DeviceOptions,
    SessionFile,
    CaptureFile,
    CaptureUnitsize,
    PowerOff,
    DataSource,

    LimitMsec = 50000,
    LimitSamples,
    LimitFrames,
    Continuous,
    Datalog,
}

impl ConfigKey {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Catalogue entry for this key, if the key carries a value.
    pub fn info(self) -> Option<&'static ConfigInfo> {
        CONFIG_INFO.iter().find(|info| info.key == self)
    }

    pub fn is_device_class(self) -> bool {
        (10000..20000).contains(&self.code())
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.info() {
            Some(info) => f.write_str(info.id),
            None => write!(f, "{self:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Uint64,
    String,
    Bool,
    Float,
    RationalPeriod,
    RationalVolt,
    Uint64Range,
    DoubleRange,
    Int32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigInfo {
    pub key: ConfigKey,
    pub data_type: DataType,
    /// Short machine-readable identifier, e.g. `samplerate`.
    pub id: &'static str,
    pub name: &'static str,
}

impl ConfigInfo {
    const fn new(key: ConfigKey, data_type: DataType, id: &'static str, name: &'static str) -> Self {
        Self {
            key,
            data_type,
            id,
            name,
        }
    }

    pub fn by_id(id: &str) -> Option<&'static Self> {
        CONFIG_INFO.iter().find(|info| info.id == id)
    }

    pub fn all() -> &'static [Self] {
        CONFIG_INFO
    }
}

static CONFIG_INFO: &[ConfigInfo] = &[
    ConfigInfo::new(ConfigKey::Conn, DataType::String, "conn", "Connection"),
    ConfigInfo::new(ConfigKey::SerialComm, DataType::String, "serialcomm", "Serial communication"),
    ConfigInfo::new(ConfigKey::Samplerate, DataType::Uint64, "samplerate", "Sample rate"),
    ConfigInfo::new(ConfigKey::CaptureRatio, DataType::Uint64, "captureratio", "Pre-trigger capture ratio"),
    ConfigInfo::new(ConfigKey::PatternMode, DataType::String, "pattern", "Pattern generator mode"),
    ConfigInfo::new(ConfigKey::TriggerType, DataType::String, "triggertype", "Trigger types"),
    ConfigInfo::new(ConfigKey::ExternalClock, DataType::Bool, "external_clock", "External clock mode"),
    ConfigInfo::new(ConfigKey::Swap, DataType::Bool, "swap", "Swap channel order"),
    ConfigInfo::new(ConfigKey::Rle, DataType::Bool, "rle", "Run Length Encoding"),
    ConfigInfo::new(ConfigKey::TriggerSlope, DataType::Uint64, "triggerslope", "Trigger slope"),
    ConfigInfo::new(ConfigKey::TriggerSource, DataType::String, "triggersource", "Trigger source"),
    ConfigInfo::new(ConfigKey::HorizTriggerPos, DataType::Float, "horiz_triggerpos", "Horizontal trigger position"),
    ConfigInfo::new(ConfigKey::BufferSize, DataType::Uint64, "buffersize", "Buffer size"),
    ConfigInfo::new(ConfigKey::Timebase, DataType::RationalPeriod, "timebase", "Time base"),
    ConfigInfo::new(ConfigKey::Filter, DataType::String, "filter", "Filter targets"),
    ConfigInfo::new(ConfigKey::VDiv, DataType::RationalVolt, "vdiv", "Volts/div"),
    ConfigInfo::new(ConfigKey::Coupling, DataType::String, "coupling", "Coupling"),
    ConfigInfo::new(ConfigKey::Datalog, DataType::Bool, "datalog", "Datalog"),
    ConfigInfo::new(ConfigKey::SplWeightFreq, DataType::String, "spl_weight_freq", "Sound pressure level frequency weighting"),
    ConfigInfo::new(ConfigKey::SplWeightTime, DataType::String, "spl_weight_time", "Sound pressure level time weighting"),
    ConfigInfo::new(ConfigKey::HoldMax, DataType::Bool, "hold_max", "Hold max"),
    ConfigInfo::new(ConfigKey::HoldMin, DataType::Bool, "hold_min", "Hold min"),
    ConfigInfo::new(ConfigKey::SplMeasurementRange, DataType::Uint64Range, "spl_meas_range", "Sound pressure level measurement range"),
    ConfigInfo::new(ConfigKey::VoltageThreshold, DataType::DoubleRange, "voltage_threshold", "Voltage threshold"),
    ConfigInfo::new(ConfigKey::PowerOff, DataType::Bool, "power_off", "Power off"),
    ConfigInfo::new(ConfigKey::DataSource, DataType::String, "data_source", "Data source"),
    ConfigInfo::new(ConfigKey::NumLogicProbes, DataType::Int32, "logic_probes", "Number of logic probes"),
    ConfigInfo::new(ConfigKey::NumAnalogProbes, DataType::Int32, "analog_probes", "Number of analog probes"),
    ConfigInfo::new(ConfigKey::LimitMsec, DataType::Uint64, "limit_time", "Time limit"),
    ConfigInfo::new(ConfigKey::LimitSamples, DataType::Uint64, "limit_samples", "Sample limit"),
    ConfigInfo::new(ConfigKey::LimitFrames, DataType::Uint64, "limit_frames", "Frame limit"),
    ConfigInfo::new(ConfigKey::Continuous, DataType::Bool, "continuous", "Continuous sampling"),
];

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    String(String),
    Uint64(u64),
    Bool(bool),
    Float(f64),
    /// Numerator and denominator, used for periods and voltages.
    Rational(u64, u64),
    Uint64Range(u64, u64),
    DoubleRange(f64, f64),
    Int32(i32),
}

impl ConfigValue {
    /// Whether this value can be stored under a key of the given type.
    pub fn fits(&self, data_type: DataType) -> bool {
        matches!(
            (self, data_type),
            (Self::String(_), DataType::String)
                | (Self::Uint64(_), DataType::Uint64)
                | (Self::Bool(_), DataType::Bool)
                | (Self::Float(_), DataType::Float)
                | (Self::Rational(..), DataType::RationalPeriod | DataType::RationalVolt)
                | (Self::Uint64Range(..), DataType::Uint64Range)
                | (Self::DoubleRange(..), DataType::DoubleRange)
                | (Self::Int32(_), DataType::Int32)
        )
    }

    /// Rejects values whose type does not match the catalogue entry of `key`.
    pub fn check_for(&self, key: ConfigKey) -> Result<()> {
        match key.info() {
            Some(info) if self.fits(info.data_type) => Ok(()),
            Some(info) => Err(Error::Arg(format!(
                "{} expects {:?}, got {:?}",
                info.id, info.data_type, self
            ))),
            None => Err(Error::Arg(format!("{key:?} does not take a value"))),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Self::Uint64(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected unsigned integer, got {other:?}"))),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Self::Int32(v) => Ok(*v),
            other => Err(Error::Arg(format!("expected integer, got {other:?}"))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(Error::Arg(format!("expected string, got {other:?}"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(Error::Arg(format!("expected boolean, got {other:?}"))),
        }
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        Self::Uint64(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

/// A key with its value, as used for scan options and meta packets.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigPair {
    pub key: ConfigKey,
    pub value: ConfigValue,
}

impl ConfigPair {
    pub fn new(key: ConfigKey, value: impl Into<ConfigValue>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

/// Answer to a `config_list` query.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigList {
    Keys(Vec<ConfigKey>),
    Samplerates(Vec<u64>),
    SamplerateSteps { min: u64, max: u64, step: u64 },
    Strings(Vec<String>),
    /// Trigger characters accepted in probe trigger specs, e.g. `rf10`.
    TriggerTypes(String),
}

impl ConfigList {
    pub fn contains_key(&self, key: ConfigKey) -> bool {
        matches!(self, Self::Keys(keys) if keys.contains(&key))
    }
}
