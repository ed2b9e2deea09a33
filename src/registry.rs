use rustc_hash::FxHashMap;

use crate::config::PinMode;
use crate::error::{GpioError, Result};
use crate::gpio::SubscriptionHandle;

/// Registry record for one open pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPin {
    pub logical: u32,
    pub mode: PinMode,
    pub(crate) subscription: Option<SubscriptionHandle>,
}

impl OpenPin {
    pub fn new(logical: u32, mode: PinMode) -> Self {
        Self {
            logical,
            mode,
            subscription: None,
        }
    }
}

/// Open pins keyed by their number in the owning controller's scheme.
///
/// Range validation is left to the caller, since the valid pin space is a
/// property of the backend.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: FxHashMap<u32, OpenPin>,
}

impl PinRegistry {
    /// Fails with `AlreadyOpen` when `pin`, or another number resolving to
    /// the same logical line, is already open.
    pub fn open(&mut self, pin: u32, entry: OpenPin) -> Result<()> {
        if self.pins.contains_key(&pin) || self.is_line_open(entry.logical) {
            return Err(GpioError::AlreadyOpen(pin));
        }
        self.pins.insert(pin, entry);
        Ok(())
    }

    /// Fails with `NotOpen` when the pin is not open.
    pub fn close(&mut self, pin: u32) -> Result<OpenPin> {
        self.pins.remove(&pin).ok_or(GpioError::NotOpen(pin))
    }

    pub fn is_open(&self, pin: u32) -> bool {
        self.pins.contains_key(&pin)
    }

    /// Whether any open pin resolves to `logical`.
    pub fn is_line_open(&self, logical: u32) -> bool {
        self.pins.values().any(|entry| entry.logical == logical)
    }

    pub fn get(&self, pin: u32) -> Result<&OpenPin> {
        self.pins.get(&pin).ok_or(GpioError::NotOpen(pin))
    }

    pub(crate) fn get_mut(&mut self, pin: u32) -> Result<&mut OpenPin> {
        self.pins.get_mut(&pin).ok_or(GpioError::NotOpen(pin))
    }

    pub fn get_mode(&self, pin: u32) -> Result<PinMode> {
        self.get(pin).map(|entry| entry.mode)
    }

    /// Returns the mode that was replaced.
    pub fn set_mode(&mut self, pin: u32, mode: PinMode) -> Result<PinMode> {
        let entry = self.get_mut(pin)?;
        Ok(std::mem::replace(&mut entry.mode, mode))
    }

    pub fn open_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.pins.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    pub fn drain(&mut self) -> Vec<(u32, OpenPin)> {
        self.pins.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}
