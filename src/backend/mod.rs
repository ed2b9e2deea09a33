#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod simulated;

use std::sync::Arc;

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::gpio::GpioBackend;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use simulated::SimulatedBackend;

/// Backend best suited to the enabled features: the character-device driver
/// with `hardware-gpio`, the in-memory simulation otherwise.
pub fn default_backend(config: &ControllerConfig) -> Result<Arc<dyn GpioBackend>> {
    #[cfg(feature = "hardware-gpio")]
    {
        Ok(Arc::new(LibgpiodBackend::new(config)?))
    }
    #[cfg(not(feature = "hardware-gpio"))]
    {
        Ok(Arc::new(SimulatedBackend::from_config(config)))
    }
}
