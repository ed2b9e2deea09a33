use std::fmt;
use std::ops::Not;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{PinEventTypes, PinMode};
use crate::error::Result;
use crate::events::EventSink;

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PinValue {
    #[default]
    Low,
    High,
}

impl PinValue {
    pub fn is_high(self) -> bool {
        self == PinValue::High
    }

    /// Edge produced by a transition from `self` to `next`, if any.
    pub fn edge_to(self, next: PinValue) -> Option<PinEventTypes> {
        match (self, next) {
            (PinValue::Low, PinValue::High) => Some(PinEventTypes::Rising),
            (PinValue::High, PinValue::Low) => Some(PinEventTypes::Falling),
            _ => None,
        }
    }
}

impl From<bool> for PinValue {
    fn from(high: bool) -> Self {
        if high { PinValue::High } else { PinValue::Low }
    }
}

impl From<PinValue> for u8 {
    fn from(value: PinValue) -> Self {
        match value {
            PinValue::Low => 0,
            PinValue::High => 1,
        }
    }
}

impl Not for PinValue {
    type Output = PinValue;

    fn not(self) -> Self::Output {
        match self {
            PinValue::Low => PinValue::High,
            PinValue::High => PinValue::Low,
        }
    }
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinValue::Low => f.write_str("low"),
            PinValue::High => f.write_str("high"),
        }
    }
}

/// A pin number and value, used by the batch read and write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinValuePair {
    pub pin_number: u32,
    pub value: PinValue,
}

impl PinValuePair {
    pub fn new(pin_number: u32, value: PinValue) -> Self {
        Self { pin_number, value }
    }
}

/// An edge observed on an input pin. `pin_number` is in the controller's numbering scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinValueChangedEvent {
    pub pin_number: u32,
    pub change_type: PinEventTypes,
    pub timestamp_ms: u64,
}

/// Backend-issued token for an edge subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub pin: u32,
    pub id: u64,
}

/// Capability contract every pin driver satisfies. All pin numbers are logical.
///
/// Implementations serialize access to a single pin internally; calls for
/// different pins may run concurrently.
pub trait GpioBackend: Send + Sync {
    fn pin_count(&self) -> u32;
    fn is_valid_pin(&self, pin: u32) -> bool;
    fn board_to_logical(&self, board_pin: u32) -> Option<u32>;
    /// Number of pins reachable through the board layout.
    fn board_pin_count(&self) -> u32;

    fn supports_mode(&self, pin: u32, mode: PinMode) -> bool;
    fn configure(&self, pin: u32, mode: PinMode) -> Result<()>;
    fn release(&self, pin: u32) -> Result<()>;

    fn read_value(&self, pin: u32) -> Result<PinValue>;
    fn write_value(&self, pin: u32, value: PinValue) -> Result<()>;

    fn subscribe(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        sink: EventSink,
    ) -> Result<SubscriptionHandle>;
    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()>;
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
