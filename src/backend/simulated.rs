use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::config::{ControllerConfig, PinConfig, PinEventTypes, PinMode, PinNumberingScheme};
use crate::error::{GpioError, Result};
use crate::events::EventSink;
use crate::gpio::{GpioBackend, PinValue, SubscriptionHandle};
use crate::layout::PinLayout;

/// In-memory backend. Output pins keep their last written level, and input
/// levels are set from the outside with [`SimulatedBackend::drive`].
pub struct SimulatedBackend {
    pin_count: u32,
    layout: PinLayout,
    profiles: FxHashMap<u32, PinConfig>,
    pins: RwLock<FxHashMap<u32, Mutex<SimulatedPin>>>, // keyed by logical pin
    subscriptions: Mutex<FxHashMap<u64, u32>>,
    next_subscription: AtomicU64,
}

#[derive(Default)]
struct SimulatedPin {
    mode: Option<PinMode>,
    level: PinValue,
    listener: Option<Listener>,
    last_event: Option<Instant>,
}

struct Listener {
    id: u64,
    event_types: PinEventTypes,
    sink: EventSink,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

impl SimulatedBackend {
    /// `pin_count` unrestricted pins behind the Raspberry Pi header layout.
    pub fn new(pin_count: u32) -> Self {
        Self {
            pin_count,
            layout: PinLayout::raspberry_pi(),
            profiles: FxHashMap::default(),
            pins: RwLock::new(FxHashMap::default()),
            subscriptions: Mutex::new(FxHashMap::default()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Pin profiles restrict the valid pins, their modes and debounce.
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            layout: config.board_layout.clone(),
            profiles: config.pins.clone(),
            ..Self::new(config.pin_count)
        }
    }

    pub fn with_layout(mut self, layout: PinLayout) -> Self {
        self.layout = layout;
        self
    }

    fn check_pin(&self, pin: u32) -> Result<()> {
        if self.is_valid_pin(pin) {
            Ok(())
        } else {
            Err(GpioError::InvalidPin(pin, PinNumberingScheme::Logical))
        }
    }

    fn debounce(&self, pin: u32) -> Duration {
        self.profiles
            .get(&pin)
            .map_or(Duration::ZERO, |p| Duration::from_millis(p.debounce_ms))
    }

    /// Sets the externally applied level of an input pin, emitting the edge
    /// to a matching subscription.
    pub fn drive(&self, pin: u32, value: PinValue) -> Result<()> {
        self.check_pin(pin)?;
        if !self.pins.read().contains_key(&pin) {
            self.pins.write().entry(pin).or_default();
        }

        let pins = self.pins.read();
        let Some(entry) = pins.get(&pin) else {
            return Err(GpioError::NotConfigured(pin));
        };
        let mut state = entry.lock();

        if state.mode == Some(PinMode::Output) {
            return Err(GpioError::InvalidOperation(format!(
                "pin {pin} is configured as output and cannot be driven externally"
            )));
        }

        let previous = std::mem::replace(&mut state.level, value);
        let Some(edge) = previous.edge_to(value) else {
            return Ok(());
        };
        let Some(listener) = state.listener.as_ref() else {
            return Ok(());
        };
        if !listener.event_types.matches(edge) {
            return Ok(());
        }

        let now = Instant::now();
        let debounce = self.debounce(pin);
        let allow = state
            .last_event
            .map(|t| now.duration_since(t) >= debounce)
            .unwrap_or(true);
        if allow {
            listener.sink.emit_now(edge);
            state.last_event = Some(now);
        } else {
            debug!("debounced {edge:?} edge on pin {pin}");
        }
        Ok(())
    }

    /// Reports a fault to the pin's subscriber, if any.
    pub fn inject_fault(&self, pin: u32, reason: &str) {
        let pins = self.pins.read();
        if let Some(listener) = pins.get(&pin).and_then(|p| {
            p.lock()
                .listener
                .as_ref()
                .map(|l| l.sink.clone())
        }) {
            listener.fault(reason);
        }
    }

    pub fn level(&self, pin: u32) -> Option<PinValue> {
        self.pins.read().get(&pin).map(|p| p.lock().level)
    }

    pub fn mode(&self, pin: u32) -> Option<PinMode> {
        self.pins.read().get(&pin).and_then(|p| p.lock().mode)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    fn drop_listener(&self, state: &mut SimulatedPin) {
        if let Some(listener) = state.listener.take() {
            self.subscriptions.lock().remove(&listener.id);
        }
    }
}

impl GpioBackend for SimulatedBackend {
    fn pin_count(&self) -> u32 {
        self.pin_count
    }

    fn is_valid_pin(&self, pin: u32) -> bool {
        if self.profiles.is_empty() {
            pin < self.pin_count
        } else {
            self.profiles.contains_key(&pin)
        }
    }

    fn board_to_logical(&self, board_pin: u32) -> Option<u32> {
        self.layout
            .to_logical(board_pin)
            .filter(|logical| self.is_valid_pin(*logical))
    }

    fn board_pin_count(&self) -> u32 {
        self.layout.len() as u32
    }

    fn supports_mode(&self, pin: u32, mode: PinMode) -> bool {
        self.is_valid_pin(pin)
            && self
                .profiles
                .get(&pin)
                .map_or(true, |profile| profile.modes.contains(&mode))
    }

    fn configure(&self, pin: u32, mode: PinMode) -> Result<()> {
        self.check_pin(pin)?;
        if !self.supports_mode(pin, mode) {
            return Err(GpioError::UnsupportedMode { pin, mode });
        }

        let mut pins = self.pins.write();
        let mut state = pins.entry(pin).or_default().lock();
        if mode == PinMode::Output {
            self.drop_listener(&mut state);
        }
        state.mode = Some(mode);
        Ok(())
    }

    fn release(&self, pin: u32) -> Result<()> {
        if let Some(entry) = self.pins.write().remove(&pin) {
            self.drop_listener(&mut entry.lock());
        }
        Ok(())
    }

    fn read_value(&self, pin: u32) -> Result<PinValue> {
        let pins = self.pins.read();
        let state = pins
            .get(&pin)
            .ok_or(GpioError::NotConfigured(pin))?
            .lock();
        match state.mode {
            Some(_) => Ok(state.level),
            None => Err(GpioError::NotConfigured(pin)),
        }
    }

    fn write_value(&self, pin: u32, value: PinValue) -> Result<()> {
        let pins = self.pins.read();
        let mut state = pins
            .get(&pin)
            .ok_or(GpioError::NotConfigured(pin))?
            .lock();
        if state.mode != Some(PinMode::Output) {
            return Err(GpioError::NotConfigured(pin));
        }
        state.level = value;
        Ok(())
    }

    fn subscribe(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        sink: EventSink,
    ) -> Result<SubscriptionHandle> {
        let pins = self.pins.read();
        let mut state = pins
            .get(&pin)
            .ok_or(GpioError::NotConfigured(pin))?
            .lock();
        if state.mode != Some(PinMode::Input) {
            return Err(GpioError::NotConfigured(pin));
        }

        self.drop_listener(&mut state);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        state.listener = Some(Listener {
            id,
            event_types,
            sink,
        });
        state.last_event = None;
        self.subscriptions.lock().insert(id, pin);
        Ok(SubscriptionHandle { pin, id })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        if self.subscriptions.lock().remove(&handle.id).is_none() {
            return Ok(());
        }
        let pins = self.pins.read();
        if let Some(entry) = pins.get(&handle.pin) {
            let mut state = entry.lock();
            if state.listener.as_ref().is_some_and(|l| l.id == handle.id) {
                state.listener = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchMessage;
    use tokio::sync::mpsc;

    fn sink(pin: u32) -> (EventSink, mpsc::UnboundedReceiver<DispatchMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(pin, 1, tx), rx)
    }

    fn edges(rx: &mut mpsc::UnboundedReceiver<DispatchMessage>) -> Vec<PinEventTypes> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let DispatchMessage::Edge { event, .. } = message {
                out.push(event.change_type);
            }
        }
        out
    }

    #[test]
    fn unconfigured_pins_reject_io() {
        let backend = SimulatedBackend::new(8);
        assert_eq!(backend.read_value(3), Err(GpioError::NotConfigured(3)));
        assert_eq!(
            backend.write_value(3, PinValue::High),
            Err(GpioError::NotConfigured(3))
        );
        assert_eq!(
            backend.configure(8, PinMode::Input),
            Err(GpioError::InvalidPin(8, PinNumberingScheme::Logical))
        );
    }

    #[test]
    fn input_pins_reject_writes() {
        let backend = SimulatedBackend::new(8);
        backend.configure(2, PinMode::Input).unwrap();
        assert_eq!(
            backend.write_value(2, PinValue::High),
            Err(GpioError::NotConfigured(2))
        );
        backend.drive(2, PinValue::High).unwrap();
        assert_eq!(backend.read_value(2), Ok(PinValue::High));
    }

    #[test]
    fn configure_is_idempotent() {
        let backend = SimulatedBackend::new(8);
        backend.configure(1, PinMode::Output).unwrap();
        backend.write_value(1, PinValue::High).unwrap();
        backend.configure(1, PinMode::Output).unwrap();
        assert_eq!(backend.read_value(1), Ok(PinValue::High));
    }

    #[test]
    fn profiles_restrict_modes() {
        let mut config = ControllerConfig::default();
        let mut button = PinConfig::new(4);
        button.modes = [PinMode::Input].into();
        config.pins.insert(4, button);
        let backend = SimulatedBackend::from_config(&config);

        assert!(backend.supports_mode(4, PinMode::Input));
        assert!(!backend.supports_mode(4, PinMode::Output));
        assert!(!backend.is_valid_pin(5));
        assert_eq!(
            backend.configure(4, PinMode::Output),
            Err(GpioError::UnsupportedMode {
                pin: 4,
                mode: PinMode::Output
            })
        );
    }

    #[test]
    fn drive_emits_matching_edges_only() {
        let backend = SimulatedBackend::new(8);
        backend.configure(6, PinMode::Input).unwrap();
        let (sink, mut rx) = sink(6);
        let handle = backend
            .subscribe(6, PinEventTypes::Rising, sink)
            .unwrap();

        backend.drive(6, PinValue::High).unwrap();
        backend.drive(6, PinValue::High).unwrap();
        backend.drive(6, PinValue::Low).unwrap();
        backend.drive(6, PinValue::High).unwrap();
        assert_eq!(edges(&mut rx), vec![PinEventTypes::Rising, PinEventTypes::Rising]);

        backend.unsubscribe(handle).unwrap();
        assert_eq!(backend.subscription_count(), 0);
        backend.drive(6, PinValue::Low).unwrap();
        assert!(edges(&mut rx).is_empty());
    }

    #[test]
    fn debounce_suppresses_fast_edges() {
        let mut config = ControllerConfig::default();
        let mut button = PinConfig::new(4);
        button.debounce_ms = 10_000;
        config.pins.insert(4, button);
        let backend = SimulatedBackend::from_config(&config);

        backend.configure(4, PinMode::Input).unwrap();
        let (sink, mut rx) = sink(4);
        backend.subscribe(4, PinEventTypes::Both, sink).unwrap();

        backend.drive(4, PinValue::High).unwrap();
        backend.drive(4, PinValue::Low).unwrap();
        backend.drive(4, PinValue::High).unwrap();
        assert_eq!(edges(&mut rx), vec![PinEventTypes::Rising]);
    }

    #[test]
    fn switching_to_output_drops_subscription() {
        let backend = SimulatedBackend::new(8);
        backend.configure(5, PinMode::Input).unwrap();
        let (sink, _rx) = sink(5);
        backend.subscribe(5, PinEventTypes::Both, sink).unwrap();
        assert_eq!(backend.subscription_count(), 1);

        backend.configure(5, PinMode::Output).unwrap();
        assert_eq!(backend.subscription_count(), 0);
        assert!(backend.drive(5, PinValue::High).is_err());

        backend.release(5).unwrap();
        assert_eq!(backend.mode(5), None);
    }
}
