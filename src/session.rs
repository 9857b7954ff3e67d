use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::datafeed::{Datafeed, Header, Packet};
use crate::device::{DevRef, DeviceKey};
use crate::error::{Error, Result};
use crate::event_loop::{EventLoop, Pollable, Readiness, SourceAction, SourceId};

/// Requests an asynchronous stop of a running session, e.g. from inside a
/// datafeed consumer.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Rc<Cell<bool>>);

impl StopHandle {
    pub fn request_stop(&self) {
        self.0.set(true);
    }

    fn take(&self) -> bool {
        self.0.replace(false)
    }
}

/// Devices taking part in an acquisition, together with the multiplexer
/// that drives them and the bus their packets go out on.
pub struct Session {
    devices: Vec<DevRef>,
    event_loop: EventLoop<Datafeed>,
    datafeed: Datafeed,
    running: bool,
    stop: StopHandle,
}

impl Session {
    pub fn new() -> Self {
        Self::with_poll_interval(EventLoop::<Datafeed>::DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            devices: Vec::new(),
            event_loop: EventLoop::new(poll_interval),
            datafeed: Datafeed::new(),
            running: false,
            stop: StopHandle::default(),
        }
    }

    /// Adds a device. If the session is already running, acquisition on the
    /// new device starts right away.
    pub fn add_device(&mut self, dev: DevRef) -> Result<()> {
        if self.devices.iter().any(|d| Rc::ptr_eq(d, &dev)) {
            return Err(Error::arg("device already part of the session"));
        }
        self.devices.push(dev.clone());

        let driver = dev.borrow().driver();
        if let (true, Some(driver)) = (self.running, driver) {
            if let Err(e) = driver.acquisition_start(&dev, self) {
                log::error!("Failed to start acquisition of device in running session: {}", e);
                self.devices.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn devices(&self) -> &[DevRef] {
        &self.devices
    }

    pub fn remove_devices(&mut self) {
        self.devices.clear();
    }

    /// Registers a packet consumer. Drivers release their device borrows
    /// before sending, so a consumer may borrow any session device.
    pub fn add_consumer(&mut self, consumer: impl FnMut(&DeviceKey, &Packet<'_>) + 'static) {
        self.datafeed.add_consumer(consumer);
    }

    pub fn remove_consumers(&mut self) {
        self.datafeed.remove_consumers();
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Starts acquisition on every device, stopping at the first failure.
    pub fn start(&mut self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::arg("session has no devices"));
        }
        log::info!("Starting session with {} devices", self.devices.len());

        for dev in self.devices.clone() {
            let Some(driver) = dev.borrow().driver() else {
                continue;
            };
            driver.acquisition_start(&dev, self)?;
        }
        self.running = true;
        Ok(())
    }

    /// Runs the multiplexer until every source has deregistered.
    pub fn run(&mut self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::arg("session has no devices"));
        }
        log::info!("Running session");
        let mut result = Ok(());
        while !self.event_loop.is_empty() {
            self.iteration(true);
            if self.stop.take() {
                log::debug!("Stop requested");
                if let Err(e) = self.stop() {
                    result = Err(e);
                }
            }
        }
        self.running = false;
        result
    }

    /// One multiplexer round; see [`EventLoop::iteration`].
    pub fn iteration(&mut self, block: bool) -> usize {
        self.event_loop.iteration(&mut self.datafeed, block)
    }

    /// Asks every device to stop. Devices with a multi-phase shutdown keep
    /// their sources until `run` has drained them.
    pub fn stop(&mut self) -> Result<()> {
        log::info!("Stopping session");
        let mut result = Ok(());
        for dev in self.devices.clone() {
            let Some(driver) = dev.borrow().driver() else {
                continue;
            };
            if let Err(e) = driver.acquisition_stop(&dev, self) {
                log::error!("Stopping {} failed: {}", dev.borrow().key(), e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    pub fn add_timer_source(
        &mut self,
        timeout: Duration,
        callback: impl FnMut(&mut Datafeed, Readiness) -> SourceAction + 'static,
    ) -> SourceId {
        self.event_loop.add_timer(timeout, callback)
    }

    pub fn add_io_source(
        &mut self,
        handle: Box<dyn Pollable>,
        interest: Readiness,
        timeout: Option<Duration>,
        callback: impl FnMut(&mut Datafeed, Readiness) -> SourceAction + 'static,
    ) -> SourceId {
        self.event_loop.add_io(handle, interest, timeout, callback)
    }

    pub fn remove_source(&mut self, id: SourceId) -> bool {
        self.event_loop.remove(id)
    }

    pub fn source_count(&self) -> usize {
        self.event_loop.len()
    }

    pub fn send(&mut self, dev: &DeviceKey, packet: &Packet<'_>) -> Result<()> {
        self.datafeed.send(dev, packet)
    }

    /// Sends the standard header: feed version and the current time.
    pub fn send_header(&mut self, dev: &DeviceKey) -> Result<()> {
        self.send(dev, &Packet::Header(Header::now()))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
