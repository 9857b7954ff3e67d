use std::env;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use crate::config::{ConfigKey, ConfigList, ConfigPair, ConfigValue};
use crate::device::{DevRef, DeviceInstance, DeviceStatus};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::session::Session;

/// Contract every instrument family implements.
///
/// Config calls answer [`Error::NotApplicable`] for keys the driver does
/// not handle; the defaults do exactly that. `group` names one of the
/// device's probe groups, `None` addresses the whole device.
pub trait Driver {
    fn name(&self) -> &'static str;

    fn long_name(&self) -> &'static str;

    /// Called once per context before the first scan.
    fn init(&self, _config: &ContextConfig) -> Result<()> {
        Ok(())
    }

    /// Looks for devices. Only newly found instances are returned; the
    /// context assigns their indices and attaches the driver.
    fn scan(&self, options: &[ConfigPair]) -> Result<Vec<DeviceInstance>>;

    fn dev_open(&self, dev: &mut DeviceInstance) -> Result<()>;

    /// Must be a no-op on a device that is not active.
    fn dev_close(&self, dev: &mut DeviceInstance) -> Result<()>;

    fn config_get(
        &self,
        _key: ConfigKey,
        _dev: Option<&DeviceInstance>,
        _group: Option<&str>,
    ) -> Result<ConfigValue> {
        Err(Error::NotApplicable)
    }

    fn config_set(
        &self,
        _key: ConfigKey,
        _value: &ConfigValue,
        _dev: &mut DeviceInstance,
        _group: Option<&str>,
    ) -> Result<()> {
        Err(Error::NotApplicable)
    }

    fn config_list(
        &self,
        _key: ConfigKey,
        _dev: Option<&DeviceInstance>,
        _group: Option<&str>,
    ) -> Result<ConfigList> {
        Err(Error::NotApplicable)
    }

    /// Arms the device, sends the header and registers event sources.
    /// Must not block.
    fn acquisition_start(&self, dev: &DevRef, session: &mut Session) -> Result<()>;

    /// Requests the end of an acquisition. The driver emits exactly one end
    /// packet, possibly several loop iterations later.
    fn acquisition_stop(&self, dev: &DevRef, session: &mut Session) -> Result<()>;
}

/// Runtime settings shared by all drivers of a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub firmware_dir: PathBuf,
    /// Extra attempts when a candidate fails its handshake during scan.
    pub scan_retries: u32,
    pub scan_backoff: Duration,
    pub poll_interval: Duration,
}

impl ContextConfig {
    pub const DEFAULT_FIRMWARE_DIR: &'static str = "/usr/share/sigrok-firmware";
    pub const FIRMWARE_DIR_ENV: &'static str = "SAMPLEFLOW_FIRMWARE_DIR";
    pub const DEFAULT_SCAN_RETRIES: u32 = 3;
    pub const DEFAULT_SCAN_BACKOFF: Duration = Duration::from_millis(100);

    /// Defaults, with the firmware directory taken from the environment if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(dir) = env::var_os(Self::FIRMWARE_DIR_ENV) {
            config.firmware_dir = PathBuf::from(dir);
        }
        config
    }

    pub fn with_firmware_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.firmware_dir = dir.into();
        self
    }

    pub fn with_scan_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.scan_retries = retries;
        self.scan_backoff = backoff;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            firmware_dir: PathBuf::from(Self::DEFAULT_FIRMWARE_DIR),
            scan_retries: Self::DEFAULT_SCAN_RETRIES,
            scan_backoff: Self::DEFAULT_SCAN_BACKOFF,
            poll_interval: EventLoop::<()>::DEFAULT_POLL_INTERVAL,
        }
    }
}

struct DriverEntry {
    driver: Rc<dyn Driver>,
    initialized: bool,
    instances: Vec<DevRef>,
}

/// Driver manager: owns the registered drivers and the devices each of
/// them discovered.
pub struct Context {
    config: ContextConfig,
    drivers: Vec<DriverEntry>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_config(ContextConfig::default())
    }

    pub fn with_config(config: ContextConfig) -> Self {
        Self {
            config,
            drivers: Vec::new(),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// A session whose multiplexer uses this context's poll interval.
    pub fn new_session(&self) -> Session {
        Session::with_poll_interval(self.config.poll_interval)
    }

    pub fn register(&mut self, driver: impl Driver + 'static) -> Result<()> {
        if self.drivers.iter().any(|e| e.driver.name() == driver.name()) {
            return Err(Error::Arg(format!("driver {} already registered", driver.name())));
        }
        self.drivers.push(DriverEntry {
            driver: Rc::new(driver),
            initialized: false,
            instances: Vec::new(),
        });
        Ok(())
    }

    /// Registered drivers, in registration order.
    pub fn drivers(&self) -> impl Iterator<Item = &dyn Driver> {
        self.drivers.iter().map(|e| e.driver.as_ref())
    }

    pub fn driver(&self, name: &str) -> Option<Rc<dyn Driver>> {
        self.entry(name).map(|e| e.driver.clone())
    }

    fn entry(&self, name: &str) -> Option<&DriverEntry> {
        self.drivers.iter().find(|e| e.driver.name() == name)
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut DriverEntry> {
        self.drivers
            .iter_mut()
            .find(|e| e.driver.name() == name)
            .ok_or_else(|| Error::Arg(format!("unknown driver {name}")))
    }

    pub fn init_driver(&mut self, name: &str) -> Result<()> {
        let config = self.config.clone();
        let entry = self.entry_mut(name)?;
        if entry.initialized {
            return Err(Error::Arg(format!("driver {name} already initialized")));
        }
        log::debug!("Initializing driver '{}'", name);
        entry.driver.init(&config)?;
        entry.initialized = true;
        Ok(())
    }

    /// Scans for devices. Any failure is logged and yields an empty list.
    pub fn scan(&mut self, name: &str, options: &[ConfigPair]) -> Vec<DevRef> {
        let entry = match self.entry_mut(name) {
            Ok(entry) => entry,
            Err(e) => {
                log::error!("Cannot scan: {}", e);
                return Vec::new();
            }
        };
        if !entry.initialized {
            log::error!("Driver '{}' was not initialized, can't scan", name);
            return Vec::new();
        }

        let _span = tracing::debug_span!("scan", driver = name).entered();
        let found = match entry.driver.scan(options) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Scan of driver '{}' failed: {}", name, e);
                return Vec::new();
            }
        };
        log::info!("Scan of '{}' found {} devices", name, found.len());

        let mut admitted = Vec::with_capacity(found.len());
        for mut dev in found {
            dev.index = entry.instances.len();
            dev.attach_driver(entry.driver.clone());
            let dev = dev.into_ref();
            entry.instances.push(dev.clone());
            admitted.push(dev);
        }
        admitted
    }

    pub fn dev_list(&self, name: &str) -> &[DevRef] {
        self.entry(name).map_or(&[], |e| e.instances.as_slice())
    }

    pub fn dev_open(&self, dev: &DevRef) -> Result<()> {
        let driver = dev
            .borrow()
            .driver()
            .ok_or_else(|| Error::arg("virtual devices cannot be opened"))?;
        let mut dev = dev.borrow_mut();
        if dev.status == DeviceStatus::Active {
            return Err(Error::arg("device is already open"));
        }
        driver.dev_open(&mut dev)
    }

    pub fn dev_close(&self, dev: &DevRef) -> Result<()> {
        let Some(driver) = dev.borrow().driver() else {
            return Ok(());
        };
        let mut dev = dev.borrow_mut();
        if dev.status != DeviceStatus::Active {
            return Ok(());
        }
        driver.dev_close(&mut dev)
    }

    /// Closes and forgets every device of the driver.
    pub fn dev_clear(&mut self, name: &str) -> Result<()> {
        let entry = self.entry_mut(name)?;
        for dev in entry.instances.drain(..) {
            let mut dev = dev.borrow_mut();
            if dev.status == DeviceStatus::Active {
                if let Err(e) = entry.driver.dev_close(&mut dev) {
                    log::warn!("Closing {} during clear failed: {}", dev.key(), e);
                }
            }
            dev.clear_private();
            if let Some(mut conn) = dev.take_conn() {
                if let Err(e) = conn.close() {
                    log::warn!("Releasing transport of {} failed: {}", dev.key(), e);
                }
            }
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let names: Vec<&'static str> = self.drivers.iter().map(|e| e.driver.name()).collect();
        for name in names {
            if let Err(e) = self.dev_clear(name) {
                log::warn!("Clearing devices of '{}' failed: {}", name, e);
            }
        }
    }
}

pub fn config_get(
    driver: &dyn Driver,
    key: ConfigKey,
    dev: Option<&DeviceInstance>,
    group: Option<&str>,
) -> Result<ConfigValue> {
    check_group(dev, group)?;
    driver.config_get(key, dev, group)
}

/// Validates the value against the key's declared type before handing it
/// to the device's driver.
pub fn config_set(
    dev: &mut DeviceInstance,
    key: ConfigKey,
    value: &ConfigValue,
    group: Option<&str>,
) -> Result<()> {
    let driver = dev
        .driver()
        .ok_or_else(|| Error::arg("virtual devices have no configuration"))?;
    check_group(Some(dev), group)?;
    value.check_for(key)?;
    driver.config_set(key, value, dev, group)
}

pub fn config_list(
    driver: &dyn Driver,
    key: ConfigKey,
    dev: Option<&DeviceInstance>,
    group: Option<&str>,
) -> Result<ConfigList> {
    check_group(dev, group)?;
    driver.config_list(key, dev, group)
}

fn check_group(dev: Option<&DeviceInstance>, group: Option<&str>) -> Result<()> {
    match (dev, group) {
        (Some(dev), Some(name)) if dev.probe_group(name).is_none() => Err(Error::ProbeGroup),
        _ => Ok(()),
    }
}

/// Whether the device's driver lists `key` among its device options.
/// Errors are reported separately, see [`has_capability`] for the lenient form.
pub fn capability(dev: &DeviceInstance, key: ConfigKey) -> Result<bool> {
    let Some(driver) = dev.driver() else {
        return Ok(false);
    };
    match driver.config_list(ConfigKey::DeviceOptions, Some(dev), None) {
        Ok(list) => Ok(list.contains_key(key)),
        Err(e) if e.is_not_applicable() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Like [`capability`], but a failed query also answers `false`.
pub fn has_capability(dev: &DeviceInstance, key: ConfigKey) -> bool {
    capability(dev, key).unwrap_or_else(|e| {
        log::debug!("Capability query for {} failed: {}", key, e);
        false
    })
}
