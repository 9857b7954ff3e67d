use std::collections::TryReserveError;

use crate::drivers::asix_sigma::TriggerError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    Arg(String),

    #[error("Device closed but should be open")]
    DeviceClosed,

    /// Returned by config calls for keys a driver does not handle. Callers
    /// should treat it as a regular answer, see [`Error::is_not_applicable`].
    #[error("Not applicable")]
    NotApplicable,

    #[error("Internal error: {0}")]
    Bug(String),

    #[error("Memory allocation failed: {0}")]
    Alloc(#[from] TryReserveError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Value out of range: {0}")]
    OutOfRange(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("No probe group specified")]
    ProbeGroup,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid trigger: {0}")]
    Trigger(#[from] TriggerError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Self::NotApplicable)
    }

    /// Short, stable description of the error class, without details.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Arg(_) | Self::Trigger(_) => "invalid argument",
            Self::DeviceClosed => "device closed but should be open",
            Self::NotApplicable => "not applicable",
            Self::Bug(_) => "internal error",
            Self::Alloc(_) => "memory allocation error",
            Self::Transport(_) | Self::Io(_) => "generic/unspecified error",
            Self::OutOfRange(_) => "value out of range",
            Self::Timeout => "timeout occurred",
            Self::ProbeGroup => "no probe group specified",
        }
    }

    pub(crate) fn arg(msg: impl Into<String>) -> Self {
        Self::Arg(msg.into())
    }

    pub(crate) fn bug(msg: impl Into<String>) -> Self {
        Self::Bug(msg.into())
    }
}
