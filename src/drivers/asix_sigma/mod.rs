//! ASIX SIGMA / SIGMA2 logic analyzer.

mod api;
pub mod decode;
#[cfg(test)]
mod emulator;
pub mod firmware;
pub mod protocol;
pub mod trigger;

pub use api::SigmaDriver;
pub use trigger::{SigmaTrigger, TriggerError};
