//! Instrument drivers shipped with the crate.

pub mod asix_sigma;
pub mod demo;
