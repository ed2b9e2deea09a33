//! Digital I/O controller over a numbered pin space.
//!
//! A [`GpioController`] validates requests against its pin registry and
//! delegates them to a [`GpioBackend`]: the in-memory [`SimulatedBackend`],
//! or [`LibgpiodBackend`] with the `hardware-gpio` feature. Edge events
//! reach callbacks and waiters through the controller's dispatch thread.
//!
//! ```
//! use std::sync::Arc;
//! use gpioctl::{GpioController, PinMode, PinValue, SimulatedBackend};
//!
//! let controller = GpioController::new(Arc::new(SimulatedBackend::new(28)));
//! controller.open_pin_with_mode(17, PinMode::Output)?;
//! controller.write(17, PinValue::High)?;
//! assert_eq!(controller.read(17)?, PinValue::High);
//! controller.close_pin(17)?;
//! # Ok::<(), gpioctl::GpioError>(())
//! ```

pub mod backend;
mod config;
mod controller;
mod error;
mod events;
mod gpio;
mod layout;
mod registry;
mod wait;

pub use config::{ControllerConfig, PinConfig, PinEventTypes, PinMode, PinNumberingScheme};
pub use controller::{EventStream, GpioController};
pub use error::{GpioError, Result};
pub use events::{CallbackHandle, EventSink, PinChangeEventHandler};
pub use gpio::{GpioBackend, PinValue, PinValueChangedEvent, PinValuePair, SubscriptionHandle};
pub use layout::PinLayout;
pub use registry::{OpenPin, PinRegistry};
pub use wait::{CancellationToken, WaitForEventResult};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
pub use backend::{SimulatedBackend, default_backend};
