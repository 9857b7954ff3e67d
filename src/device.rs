use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Shared handle to a device. Everything runs on the multiplexer's thread,
/// so a `RefCell` is all the synchronisation needed.
pub type DevRef = Rc<RefCell<DeviceInstance>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Logic,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub index: usize,
    pub kind: ProbeKind,
    pub enabled: bool,
    pub name: String,
    trigger: Option<String>,
}

impl Probe {
    pub fn new(index: usize, kind: ProbeKind, enabled: bool, name: &str) -> Self {
        Self {
            index,
            kind,
            enabled,
            name: name.to_string(),
            trigger: None,
        }
    }

    /// Trigger spec, one character per condition (`0`, `1`, `r`, `f`, ...).
    pub fn trigger(&self) -> Option<&str> {
        self.trigger.as_deref()
    }
}

/// Named subset of a device's probes, addressed by probe index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeGroup {
    pub name: String,
    pub probes: Vec<usize>,
}

impl ProbeGroup {
    pub fn new(name: &str, probes: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            probes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    NotFound,
    Initializing,
    Inactive,
    Active,
    Stopping,
}

/// Identifies a device towards datafeed consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub driver: &'static str,
    pub index: usize,
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.driver, self.index)
    }
}

pub struct DeviceInstance {
    pub index: usize,
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: String,
    probes: Vec<Probe>,
    probe_groups: Vec<ProbeGroup>,
    conn: Option<Box<dyn Transport>>,
    private: Option<Box<dyn Any>>,
    driver: Option<Rc<dyn Driver>>,
}

impl DeviceInstance {
    pub fn new(index: usize, status: DeviceStatus, vendor: &str, model: &str, version: &str) -> Self {
        Self {
            index,
            status,
            vendor: vendor.to_string(),
            model: model.to_string(),
            version: version.to_string(),
            probes: Vec::new(),
            probe_groups: Vec::new(),
            conn: None,
            private: None,
            driver: None,
        }
    }

    pub fn into_ref(self) -> DevRef {
        Rc::new(RefCell::new(self))
    }

    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            driver: self.driver.as_ref().map_or("virtual", |d| d.name()),
            index: self.index,
        }
    }

    /// The owning driver, `None` for virtual devices.
    pub fn driver(&self) -> Option<Rc<dyn Driver>> {
        self.driver.clone()
    }

    pub(crate) fn attach_driver(&mut self, driver: Rc<dyn Driver>) {
        self.driver = Some(driver);
    }

    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }

    pub fn add_probe(&mut self, probe: Probe) {
        self.probes.push(probe);
    }

    pub fn add_probe_group(&mut self, group: ProbeGroup) {
        self.probe_groups.push(group);
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn probe(&self, index: usize) -> Option<&Probe> {
        self.probes.iter().find(|p| p.index == index)
    }

    pub fn enabled_probes(&self) -> impl Iterator<Item = &Probe> {
        self.probes.iter().filter(|p| p.enabled)
    }

    pub fn probe_groups(&self) -> &[ProbeGroup] {
        &self.probe_groups
    }

    pub fn probe_group(&self, name: &str) -> Option<&ProbeGroup> {
        self.probe_groups.iter().find(|g| g.name == name)
    }

    fn probe_mut(&mut self, index: usize) -> Result<&mut Probe> {
        self.probes
            .iter_mut()
            .find(|p| p.index == index)
            .ok_or_else(|| Error::Arg(format!("no probe with index {index}")))
    }

    pub fn set_probe_name(&mut self, index: usize, name: &str) -> Result<()> {
        self.probe_mut(index)?.name = name.to_string();
        Ok(())
    }

    pub fn set_probe_enabled(&mut self, index: usize, enabled: bool) -> Result<()> {
        self.probe_mut(index)?.enabled = enabled;
        Ok(())
    }

    /// Replaces the trigger spec of a probe; `None` removes it.
    pub fn set_probe_trigger(&mut self, index: usize, trigger: Option<&str>) -> Result<()> {
        self.probe_mut(index)?.trigger = trigger.map(str::to_string);
        Ok(())
    }

    pub fn set_conn(&mut self, conn: Box<dyn Transport>) {
        self.conn = Some(conn);
    }

    pub fn take_conn(&mut self) -> Option<Box<dyn Transport>> {
        self.conn.take()
    }

    pub fn has_conn(&self) -> bool {
        self.conn.is_some()
    }

    pub fn set_private<T: Any>(&mut self, state: T) {
        self.private = Some(Box::new(state));
    }

    pub fn clear_private(&mut self) {
        self.private = None;
    }

    pub fn private<T: Any>(&self) -> Result<&T> {
        self.private
            .as_ref()
            .and_then(|p| p.downcast_ref::<T>())
            .ok_or_else(|| Error::bug("driver state missing or of unexpected type"))
    }

    pub fn private_mut<T: Any>(&mut self) -> Result<&mut T> {
        self.private
            .as_mut()
            .and_then(|p| p.downcast_mut::<T>())
            .ok_or_else(|| Error::bug("driver state missing or of unexpected type"))
    }

    /// Moves the driver state out of the device; [`Self::set_private`] puts
    /// it back. A state of another type is left in place.
    pub fn take_private<T: Any>(&mut self) -> Result<Box<T>> {
        let state = self
            .private
            .take()
            .ok_or_else(|| Error::bug("driver state missing"))?;
        state.downcast::<T>().map_err(|state| {
            self.private = Some(state);
            Error::bug("driver state of unexpected type")
        })
    }

    /// Borrows the transport and the driver state at the same time.
    pub fn conn_and_private_mut<T: Any>(&mut self) -> Result<(&mut dyn Transport, &mut T)> {
        let conn = self.conn.as_deref_mut().ok_or(Error::DeviceClosed)?;
        let state = self
            .private
            .as_mut()
            .and_then(|p| p.downcast_mut::<T>())
            .ok_or_else(|| Error::bug("driver state missing or of unexpected type"))?;
        Ok((conn, state))
    }
}

impl fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("index", &self.index)
            .field("status", &self.status)
            .field("vendor", &self.vendor)
            .field("model", &self.model)
            .field("version", &self.version)
            .field("probes", &self.probes)
            .field("driver", &self.driver.as_ref().map(|d| d.name()))
            .finish_non_exhaustive()
    }
}
