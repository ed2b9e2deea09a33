use thiserror::Error;

use crate::config::{PinMode, PinNumberingScheme};

pub type Result<T> = std::result::Result<T, GpioError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpioError {
    #[error("Invalid pin {0} for the {1} numbering scheme")]
    InvalidPin(u32, PinNumberingScheme),
    #[error("Pin {0} is already open")]
    AlreadyOpen(u32),
    #[error("Pin {0} is not open")]
    NotOpen(u32),
    #[error("Pin {pin} does not support {mode} mode")]
    UnsupportedMode { pin: u32, mode: PinMode },
    #[error("Pin {0} is not configured for this operation")]
    NotConfigured(u32),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Controller has been disposed")]
    Disposed,
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl GpioError {
    /// Rewrites a backend-side (logical) pin number into the caller's numbering.
    pub(crate) fn renumber(self, pin: u32) -> Self {
        match self {
            GpioError::InvalidPin(_, scheme) => GpioError::InvalidPin(pin, scheme),
            GpioError::UnsupportedMode { mode, .. } => GpioError::UnsupportedMode { pin, mode },
            GpioError::NotConfigured(_) => GpioError::NotConfigured(pin),
            other => other,
        }
    }
}
