//! # Sampleflow RS
//!
//! An acquisition driver runtime for logic analyzers, oscilloscopes, multimeters
//! and other measurement instruments.
//!
//! Drivers present heterogeneous hardware through one contract: discover devices,
//! configure them through typed options, start a capture and stream typed sample
//! packets to any number of consumers, all driven from a single-threaded event loop.
//!
//! ## Features
//!
//! - **Driver contract**: scan, open, configure and acquire through [`Driver`]
//! - **Capability registry**: every option key with its type, id and description
//! - **Event loop**: timer and readiness sources that never block the caller
//! - **Datafeed bus**: Header-first, End-last ordered packets per device
//! - **ASIX SIGMA driver**: firmware upload, hardware triggers and chunk decoding
//! - **Demo driver**: pattern generator needing no hardware
//! - **DataFrame output**: captured logic samples as a `polars` table
//!
//! ## Examples
//!
//! ### Capture from the demo driver
//!
//! ```rust
//! use sampleflow_rs::config::{ConfigKey, ConfigValue};
//! use sampleflow_rs::driver::{config_set, Context};
//! use sampleflow_rs::drivers::demo::DemoDriver;
//! use sampleflow_rs::LogicCapture;
//!
//! let mut ctx = Context::new();
//! ctx.register(DemoDriver::new())?;
//! ctx.init_driver(DemoDriver::NAME)?;
//!
//! let dev = ctx.scan(DemoDriver::NAME, &[]).remove(0);
//! ctx.dev_open(&dev)?;
//! config_set(&mut dev.borrow_mut(), ConfigKey::LimitSamples, &ConfigValue::Uint64(1000), None)?;
//!
//! let mut session = ctx.new_session();
//! session.add_device(dev.clone())?;
//! let capture = LogicCapture::attach(&mut session, dev.borrow().key());
//! session.start()?;
//! session.run()?;
//!
//! let df = capture.to_dataframe(dev.borrow().probes())?;
//! println!("Captured {} samples", df.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### ASIX SIGMA
//!
//! ```rust,no_run
//! use sampleflow_rs::config::{ConfigKey, ConfigValue};
//! use sampleflow_rs::driver::{config_set, Context, ContextConfig};
//! use sampleflow_rs::drivers::asix_sigma::SigmaDriver;
//!
//! let mut ctx = Context::with_config(ContextConfig::from_env());
//! ctx.register(SigmaDriver::default())?;
//! ctx.init_driver(SigmaDriver::NAME)?;
//!
//! for dev in ctx.scan(SigmaDriver::NAME, &[]) {
//!     ctx.dev_open(&dev)?;
//!     let mut dev = dev.borrow_mut();
//!     config_set(&mut dev, ConfigKey::Samplerate, &ConfigValue::Uint64(50_000_000), None)?;
//!     // Trigger on a rising edge of the first probe.
//!     dev.set_probe_trigger(0, Some("r"))?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod collect;
pub mod config;
pub mod datafeed;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod event_loop;
pub mod session;
pub mod transport;

// Re-export the main types for convenience
pub use collect::LogicCapture;

pub use config::{ConfigKey, ConfigList, ConfigPair, ConfigValue};

pub use datafeed::{Datafeed, Packet};

pub use device::{DevRef, DeviceInstance, DeviceKey, DeviceStatus, Probe, ProbeGroup, ProbeKind};

pub use driver::{Context, ContextConfig, Driver};

pub use error::{Error, Result};

pub use session::{Session, StopHandle};
