use log::{debug, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::backend::default_backend;
use crate::config::{ControllerConfig, PinEventTypes, PinMode, PinNumberingScheme};
use crate::error::{GpioError, Result};
use crate::events::{CallbackHandle, EventDispatcher, Subscriber, Subscription};
use crate::gpio::{GpioBackend, PinValue, PinValueChangedEvent, PinValuePair};
use crate::registry::{OpenPin, PinRegistry};
use crate::wait::{CancellationToken, EventWaiter, WaitForEventResult};

pub type EventStream = Pin<Box<dyn Stream<Item = PinValueChangedEvent> + Send>>;

struct ControllerState {
    registry: PinRegistry,
    backend: Option<Arc<dyn GpioBackend>>,
}

impl ControllerState {
    fn backend(&self) -> Result<Arc<dyn GpioBackend>> {
        self.backend.clone().ok_or(GpioError::Disposed)
    }
}

/// Entry point for pin I/O. Pin numbers passed to any method are read under
/// the numbering scheme fixed at construction.
pub struct GpioController {
    scheme: PinNumberingScheme,
    state: RwLock<ControllerState>,
    dispatcher: EventDispatcher,
}

/// Waiter subscription that is removed from the table however the wait ends.
struct ArmedWait<'a> {
    dispatcher: &'a EventDispatcher,
    pin: u32,
    subscription: Arc<Subscription>,
    waiter: Arc<EventWaiter>,
}

impl Drop for ArmedWait<'_> {
    fn drop(&mut self) {
        if let Some(subscription) = self.dispatcher.remove(self.pin, self.subscription.id) {
            subscription.retire();
        }
    }
}

impl GpioController {
    /// Controller using the logical numbering scheme.
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self::with_numbering_scheme(PinNumberingScheme::Logical, backend)
    }

    pub fn with_numbering_scheme(scheme: PinNumberingScheme, backend: Arc<dyn GpioBackend>) -> Self {
        let config = ControllerConfig {
            numbering_scheme: scheme,
            ..ControllerConfig::default()
        };
        Self::with_config(&config, backend)
    }

    pub fn with_config(config: &ControllerConfig, backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            scheme: config.numbering_scheme,
            state: RwLock::new(ControllerState {
                registry: PinRegistry::default(),
                backend: Some(backend),
            }),
            dispatcher: EventDispatcher::new(
                config.event_history_capacity,
                config.broadcast_capacity,
            ),
        }
    }

    /// Builds the controller on the default backend for the enabled features.
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        config.validate()?;
        let backend = default_backend(config)?;
        Ok(Self::with_config(config, backend))
    }

    /// Scheme fixed at construction. Fails with `Disposed` like every other
    /// operation once the controller is disposed.
    pub fn numbering_scheme(&self) -> Result<PinNumberingScheme> {
        self.read_state()?;
        Ok(self.scheme)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, ControllerState>> {
        let state = self.state.read();
        if state.backend.is_none() {
            return Err(GpioError::Disposed);
        }
        Ok(state)
    }

    fn resolve(&self, backend: &dyn GpioBackend, pin: u32) -> Result<u32> {
        let logical = match self.scheme {
            PinNumberingScheme::Logical => Some(pin),
            PinNumberingScheme::Board => backend.board_to_logical(pin),
        };
        logical
            .filter(|logical| backend.is_valid_pin(*logical))
            .ok_or(GpioError::InvalidPin(pin, self.scheme))
    }

    /// Number of pins addressable under this controller's scheme.
    pub fn pin_count(&self) -> Result<u32> {
        let backend = self.read_state()?.backend()?;
        Ok(match self.scheme {
            PinNumberingScheme::Logical => backend.pin_count(),
            PinNumberingScheme::Board => backend.board_pin_count(),
        })
    }

    /// Opens a pin as an input.
    pub fn open_pin(&self, pin: u32) -> Result<()> {
        self.open_pin_with_mode(pin, PinMode::Input)
    }

    pub fn open_pin_with_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        let mut state = self.state.write();
        let backend = state.backend()?;
        let logical = self.resolve(backend.as_ref(), pin)?;

        // two board positions may share a line; the line itself is the resource
        if state.registry.is_open(pin) || state.registry.is_line_open(logical) {
            return Err(GpioError::AlreadyOpen(pin));
        }
        if !backend.supports_mode(logical, mode) {
            return Err(GpioError::UnsupportedMode { pin, mode });
        }

        backend
            .configure(logical, mode)
            .map_err(|e| e.renumber(pin))?;

        let mut entry = OpenPin::new(logical, mode);
        self.dispatcher.track_pin(pin);
        if mode == PinMode::Input {
            match backend.subscribe(logical, PinEventTypes::Both, self.dispatcher.sink(pin)) {
                Ok(handle) => entry.subscription = Some(handle),
                Err(e) => {
                    self.dispatcher.detach_pin(pin);
                    if let Err(release) = backend.release(logical) {
                        warn!("failed to release pin {pin} after subscribe error: {release}");
                    }
                    return Err(e.renumber(pin));
                }
            }
        }

        state.registry.open(pin, entry)?;
        info!("opened pin {pin} as {mode}");
        Ok(())
    }

    /// Fails with `NotOpen` when the pin is not open.
    pub fn close_pin(&self, pin: u32) -> Result<()> {
        let (result, detached) = {
            let mut state = self.state.write();
            let backend = state.backend()?;
            let entry = state.registry.close(pin)?;

            let unsubscribed = entry
                .subscription
                .map_or(Ok(()), |handle| backend.unsubscribe(handle));
            let released = backend.release(entry.logical);
            (
                unsubscribed.and(released).map_err(|e| e.renumber(pin)),
                self.dispatcher.detach_pin(pin),
            )
        };

        // outside the state lock: retiring waits for in-flight callbacks
        EventDispatcher::retire(detached);
        info!("closed pin {pin}");
        result
    }

    pub fn is_pin_open(&self, pin: u32) -> Result<bool> {
        Ok(self.read_state()?.registry.is_open(pin))
    }

    pub fn open_pins(&self) -> Result<Vec<u32>> {
        Ok(self.read_state()?.registry.open_pins())
    }

    pub fn is_pin_mode_supported(&self, pin: u32, mode: PinMode) -> Result<bool> {
        let backend = self.read_state()?.backend()?;
        let logical = self.resolve(backend.as_ref(), pin)?;
        Ok(backend.supports_mode(logical, mode))
    }

    pub fn get_pin_mode(&self, pin: u32) -> Result<PinMode> {
        self.read_state()?.registry.get_mode(pin)
    }

    /// Switching an input to output drops every edge subscription on the pin;
    /// pending waits end as cancelled.
    pub fn set_pin_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        let mut detached = Vec::new();
        let result = self.apply_pin_mode(pin, mode, &mut detached);
        EventDispatcher::retire(detached);
        result
    }

    fn apply_pin_mode(
        &self,
        pin: u32,
        mode: PinMode,
        detached: &mut Vec<Arc<Subscription>>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let backend = state.backend()?;
        let entry = state.registry.get_mut(pin)?;

        if !backend.supports_mode(entry.logical, mode) {
            return Err(GpioError::UnsupportedMode { pin, mode });
        }

        let leaving_input = entry.mode == PinMode::Input && mode == PinMode::Output;
        if let Err(e) = self.switch_line(backend.as_ref(), pin, entry, mode) {
            self.restore_line(backend.as_ref(), pin, entry);
            return Err(e.renumber(pin));
        }
        // callbacks and waits go only once the line really is an output
        if leaving_input {
            detached.extend(self.dispatcher.detach_subscriptions(pin));
        }

        let previous = state.registry.set_mode(pin, mode)?;
        if previous != mode {
            info!("pin {pin} switched from {previous} to {mode}");
        }
        Ok(())
    }

    fn switch_line(
        &self,
        backend: &dyn GpioBackend,
        pin: u32,
        entry: &mut OpenPin,
        mode: PinMode,
    ) -> Result<()> {
        if mode == PinMode::Output {
            if let Some(handle) = entry.subscription.take() {
                backend.unsubscribe(handle)?;
            }
        }
        backend.configure(entry.logical, mode)?;
        if mode == PinMode::Input && entry.subscription.is_none() {
            let handle =
                backend.subscribe(entry.logical, PinEventTypes::Both, self.dispatcher.sink(pin))?;
            entry.subscription = Some(handle);
        }
        Ok(())
    }

    /// Puts the line back in the mode the registry still records after a
    /// failed switch.
    fn restore_line(&self, backend: &dyn GpioBackend, pin: u32, entry: &mut OpenPin) {
        let mut restored = backend.configure(entry.logical, entry.mode);
        if restored.is_ok() && entry.mode == PinMode::Input && entry.subscription.is_none() {
            restored = backend
                .subscribe(entry.logical, PinEventTypes::Both, self.dispatcher.sink(pin))
                .map(|handle| entry.subscription = Some(handle));
        }
        if let Err(e) = restored {
            warn!("failed to restore pin {pin} as {}: {e}", entry.mode);
        }
    }

    /// On an output pin this returns the last written value.
    pub fn read(&self, pin: u32) -> Result<PinValue> {
        let state = self.read_state()?;
        let backend = state.backend()?;
        let entry = state.registry.get(pin)?;

        let value = backend
            .read_value(entry.logical)
            .map_err(|e| e.renumber(pin))?;
        debug!("read {value} from pin {pin}");
        Ok(value)
    }

    pub fn write(&self, pin: u32, value: PinValue) -> Result<()> {
        let state = self.read_state()?;
        let backend = state.backend()?;
        let entry = state.registry.get(pin)?;

        if entry.mode == PinMode::Input {
            return Err(GpioError::InvalidOperation(format!(
                "pin {pin} is an input and cannot be written"
            )));
        }

        backend
            .write_value(entry.logical, value)
            .map_err(|e| e.renumber(pin))?;
        debug!("wrote {value} to pin {pin}");
        Ok(())
    }

    /// Fills in the value of every pair, stopping at the first failure.
    pub fn read_many(&self, pairs: &mut [PinValuePair]) -> Result<()> {
        for pair in pairs.iter_mut() {
            pair.value = self.read(pair.pin_number)?;
        }
        Ok(())
    }

    pub fn write_many(&self, pairs: &[PinValuePair]) -> Result<()> {
        for pair in pairs {
            self.write(pair.pin_number, pair.value)?;
        }
        Ok(())
    }

    fn check_event_target(
        &self,
        state: &ControllerState,
        pin: u32,
        event_types: PinEventTypes,
    ) -> Result<()> {
        if event_types == PinEventTypes::None {
            return Err(GpioError::InvalidOperation(
                "at least one event type is required".into(),
            ));
        }
        if state.registry.get_mode(pin)? != PinMode::Input {
            return Err(GpioError::InvalidOperation(format!(
                "pin {pin} must be an input to raise edge events"
            )));
        }
        Ok(())
    }

    /// Callbacks run on the controller's dispatch thread, in registration
    /// order for any one event.
    pub fn register_callback<F>(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        callback: F,
    ) -> Result<CallbackHandle>
    where
        F: Fn(&PinValueChangedEvent) + Send + Sync + 'static,
    {
        let state = self.read_state()?;
        self.check_event_target(&state, pin, event_types)?;

        let subscription =
            self.dispatcher
                .add(pin, event_types, Subscriber::Callback(Arc::new(callback)));
        debug!("registered callback {} on pin {pin}", subscription.id);
        Ok(CallbackHandle {
            pin_number: pin,
            id: subscription.id,
        })
    }

    /// Once this returns the callback will not run again. Unknown handles are ignored.
    pub fn unregister_callback(&self, pin: u32, handle: CallbackHandle) -> Result<()> {
        let removed = {
            let state = self.read_state()?;
            state.registry.get(pin)?;
            self.dispatcher.remove(pin, handle.id)
        };

        match removed {
            Some(subscription) => {
                subscription.retire();
                debug!("unregistered callback {} on pin {pin}", handle.id);
            }
            None => debug!("callback {} is not registered on pin {pin}", handle.id),
        }
        Ok(())
    }

    fn arm_waiter(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        cancellation: Option<&CancellationToken>,
    ) -> Result<ArmedWait<'_>> {
        let waiter = Arc::new(EventWaiter::default());
        let subscription = {
            let state = self.read_state()?;
            self.check_event_target(&state, pin, event_types)?;
            self.dispatcher
                .add(pin, event_types, Subscriber::Waiter(waiter.clone()))
        };
        if let Some(token) = cancellation {
            token.register(&waiter);
        }

        Ok(ArmedWait {
            dispatcher: &self.dispatcher,
            pin,
            subscription,
            waiter,
        })
    }

    /// Blocks until a matching edge arrives or `timeout` elapses.
    pub fn wait_for_event(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        timeout: Duration,
    ) -> Result<WaitForEventResult> {
        self.wait_for_event_with(pin, event_types, None, Some(timeout))
    }

    /// Blocks until a matching edge arrives or `token` is cancelled.
    pub fn wait_for_event_with_cancellation(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        token: &CancellationToken,
    ) -> Result<WaitForEventResult> {
        self.wait_for_event_with(pin, event_types, Some(token), None)
    }

    /// Blocks until an edge, cancellation or the timeout, whichever comes
    /// first. A backend fault while waiting is returned as an error.
    ///
    /// Must not be called from a registered callback: the dispatch thread
    /// would be blocked and could not deliver the awaited edge.
    pub fn wait_for_event_with(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        cancellation: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<WaitForEventResult> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let armed = self.arm_waiter(pin, event_types, cancellation)?;
        let completion = armed.waiter.wait(deadline);
        drop(armed);
        completion.into_result()
    }

    /// Async form of [`GpioController::wait_for_event_with`]. Dropping the
    /// future removes the wait's subscription.
    pub async fn wait_for_event_async(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        cancellation: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<WaitForEventResult> {
        let deadline = timeout.and_then(|t| tokio::time::Instant::now().checked_add(t));
        let armed = self.arm_waiter(pin, event_types, cancellation)?;
        let completion = armed.waiter.wait_async(deadline).await;
        drop(armed);
        completion.into_result()
    }

    /// Callbacks and waits currently registered on a pin.
    pub fn subscriber_count(&self, pin: u32) -> Result<usize> {
        let _state = self.read_state()?;
        Ok(self.dispatcher.subscriber_count(pin))
    }

    /// Up to `limit` most recent edges on an open pin, oldest first.
    pub fn events(&self, pin: u32, limit: Option<usize>) -> Result<Vec<PinValueChangedEvent>> {
        let state = self.read_state()?;
        state.registry.get(pin)?;
        Ok(self.dispatcher.events(pin, limit))
    }

    pub fn last_event(&self, pin: u32) -> Result<Option<PinValueChangedEvent>> {
        let state = self.read_state()?;
        state.registry.get(pin)?;
        Ok(self.dispatcher.last_event(pin))
    }

    pub fn subscribe_events(&self) -> Result<broadcast::Receiver<PinValueChangedEvent>> {
        let _state = self.read_state()?;
        Ok(self.dispatcher.subscribe())
    }

    /// Every dispatched edge, optionally restricted to one pin. Lagging
    /// consumers skip the events they missed.
    pub fn event_stream(&self, pin_filter: Option<u32>) -> Result<EventStream> {
        let rx = self.subscribe_events()?;
        let stream = BroadcastStream::new(rx).filter_map(move |event| match event {
            Ok(event) if pin_filter.is_none_or(|pin| pin == event.pin_number) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!("event stream lagged by {n} events");
                None
            }
        });
        Ok(Box::pin(stream))
    }

    /// Closes every pin, ends all subscriptions and waits, and drops the
    /// backend. Later calls are no-ops; every other operation then fails
    /// with `Disposed`.
    pub fn dispose(&self) -> Result<()> {
        let (backend, drained, detached) = {
            let mut state = self.state.write();
            let Some(backend) = state.backend.take() else {
                return Ok(());
            };
            (backend, state.registry.drain(), self.dispatcher.detach_all())
        };

        let mut outcome = Ok(());
        for (pin, entry) in drained {
            let unsubscribed = entry
                .subscription
                .map_or(Ok(()), |handle| backend.unsubscribe(handle));
            if let Err(e) = unsubscribed.and(backend.release(entry.logical)) {
                warn!("failed to release pin {pin} during dispose: {e}");
                if outcome.is_ok() {
                    outcome = Err(e.renumber(pin));
                }
            }
        }

        EventDispatcher::retire(detached);
        self.dispatcher.shutdown();
        drop(backend);
        info!("controller disposed");
        outcome
    }
}

impl Drop for GpioController {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("dispose on drop failed: {e}");
        }
    }
}
