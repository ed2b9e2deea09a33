use std::{collections::HashSet, fmt, fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::GpioError;
use crate::layout::PinLayout;

const DEFAULT_PIN_COUNT: u32 = 28;
const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 32;
const DEFAULT_BROADCAST_CAPACITY: usize = 64;

/// Numbering scheme used to interpret every pin argument of a controller.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PinNumberingScheme {
    /// The SoC's own GPIO numbering, as found in the datasheet.
    #[default]
    Logical,
    /// The physical pin position on the board header.
    Board,
}

impl fmt::Display for PinNumberingScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinNumberingScheme::Logical => f.write_str("logical"),
            PinNumberingScheme::Board => f.write_str("board"),
        }
    }
}

#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PinMode {
    Input,
    Output,
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinMode::Input => f.write_str("input"),
            PinMode::Output => f.write_str("output"),
        }
    }
}

/// Edge filter for subscriptions, and the edge kind carried by an event.
#[derive(Debug, Hash, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PinEventTypes {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl PinEventTypes {
    /// Whether an observed edge passes this filter.
    pub fn matches(self, observed: PinEventTypes) -> bool {
        match self {
            PinEventTypes::None => false,
            PinEventTypes::Rising => observed == PinEventTypes::Rising,
            PinEventTypes::Falling => observed == PinEventTypes::Falling,
            PinEventTypes::Both => {
                matches!(observed, PinEventTypes::Rising | PinEventTypes::Falling)
            }
        }
    }
}

fn default_modes() -> HashSet<PinMode> {
    HashSet::from([PinMode::Input, PinMode::Output])
}

fn default_chip() -> String {
    "/dev/gpiochip0".to_string()
}

/// Per-pin hardware description, keyed by logical pin number in [`ControllerConfig::pins`].
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PinConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_chip")]
    pub chip: String,
    pub line: u32,
    #[serde(default = "default_modes")]
    pub modes: HashSet<PinMode>,
    #[serde(default)]
    pub debounce_ms: u64,
}

impl PinConfig {
    pub fn new(line: u32) -> Self {
        Self {
            name: String::new(),
            chip: default_chip(),
            line,
            modes: default_modes(),
            debounce_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub numbering_scheme: PinNumberingScheme,
    pub pin_count: u32,
    pub board_layout: PinLayout,
    pub pins: FxHashMap<u32, PinConfig>,
    pub event_history_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            numbering_scheme: PinNumberingScheme::Logical,
            pin_count: DEFAULT_PIN_COUNT,
            board_layout: PinLayout::raspberry_pi(),
            pins: FxHashMap::default(),
            event_history_capacity: DEFAULT_EVENT_HISTORY_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl ControllerConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, GpioError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| GpioError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| GpioError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Whether `logical` is addressable under this configuration.
    pub fn contains_pin(&self, logical: u32) -> bool {
        if self.pins.is_empty() {
            logical < self.pin_count
        } else {
            self.pins.contains_key(&logical)
        }
    }

    pub fn validate(&self) -> Result<(), GpioError> {
        if self.broadcast_capacity == 0 {
            return Err(GpioError::Config(
                "broadcast_capacity must be greater than zero".into(),
            ));
        }
        if self.event_history_capacity == 0 {
            return Err(GpioError::Config(
                "event_history_capacity must be greater than zero".into(),
            ));
        }
        if let Some((board, logical)) = self
            .board_layout
            .iter()
            .find(|(_, logical)| !self.contains_pin(*logical))
        {
            return Err(GpioError::Config(format!(
                "board pin {board} maps to unknown logical pin {logical}"
            )));
        }
        let mut targets = FxHashMap::default();
        for (board, logical) in self.board_layout.iter() {
            if let Some(other) = targets.insert(logical, board) {
                return Err(GpioError::Config(format!(
                    "board pins {other} and {board} both map to logical pin {logical}"
                )));
            }
        }
        if let Some((logical, _)) = self.pins.iter().find(|(_, pin)| pin.modes.is_empty()) {
            return Err(GpioError::Config(format!(
                "pin {logical} must support at least one mode"
            )));
        }
        Ok(())
    }
}
