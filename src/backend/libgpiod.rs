use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{JoinHandle, yield_now};
use std::time::Duration;

use libgpiod::{chip::Chip, line, line::EventClock, request};
use parking_lot::{FairMutex, Mutex, RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use crate::config::{ControllerConfig, PinConfig, PinEventTypes, PinMode, PinNumberingScheme};
use crate::error::{GpioError, Result};
use crate::events::EventSink;
use crate::gpio::{GpioBackend, PinValue, SubscriptionHandle};
use crate::layout::PinLayout;

const LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY: usize = 64;
const LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS: Duration = Duration::from_millis(10);

/// Linux GPIO character-device backend. Each configured pin holds its own
/// line request on the chip named in its [`PinConfig`].
pub struct LibgpiodBackend {
    profiles: FxHashMap<u32, PinConfig>,
    layout: PinLayout,
    lines: RwLock<FxHashMap<u32, RwLock<LineHandle>>>, // keyed by logical pin
    subscriptions: Mutex<FxHashMap<u64, u32>>,
    next_subscription: AtomicU64,
}

struct LineHandle {
    offset: u32,
    mode: PinMode,
    debounce_ms: u64,
    gpiod_handle: Arc<FairMutex<GpiodHandle>>,
    listener: Option<EdgeListener>, // drop in reverse order
}

impl LineHandle {
    fn reconfigure(&self, edges: Option<PinEventTypes>) -> Result<()> {
        let line_settings = LibgpiodBackend::make_line_settings(self.mode, edges, self.debounce_ms)?;
        let line_cfg = LibgpiodBackend::make_line_config(self.offset, line_settings)?;
        self.gpiod_handle
            .lock()
            .request
            .reconfigure_lines(&line_cfg)
            .map_err(|e| GpioError::Backend(format!("reconfigure lines: {e}")))?;
        Ok(())
    }

    fn take_listener(&mut self, subscriptions: &Mutex<FxHashMap<u64, u32>>) -> Option<EdgeListener> {
        let listener = self.listener.take()?;
        subscriptions.lock().remove(&listener.id);
        Some(listener)
    }
}

struct GpiodHandle {
    request: request::Request,
}

impl GpiodHandle {
    fn new(chip: &str, line_cfg: &line::Config) -> Result<Self> {
        let chip = Self::open_chip(chip)?;
        let request = Self::request_lines(&chip, line_cfg)?;
        Ok(Self { request })
    }

    fn open_chip(path: &str) -> Result<Chip> {
        let p = PathBuf::from(path);
        Chip::open(&p).map_err(|e| GpioError::Backend(format!("open chip {path}: {e}")))
    }

    fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request> {
        let mut req_cfg = request::Config::new()
            .map_err(|e| GpioError::Backend(format!("request config: {e}")))?;
        req_cfg
            .set_consumer(env!("CARGO_PKG_NAME"))
            .map_err(|e| GpioError::Backend(format!("request consumer: {e}")))?;
        chip.request_lines(Some(&req_cfg), line_cfg)
            .map_err(|e| GpioError::Backend(format!("request lines: {e}")))
    }
}

struct EdgeListener {
    id: u64,
    event_types: PinEventTypes,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EdgeListener {
    fn new(
        id: u64,
        event_types: PinEventTypes,
        gpiod_handle: Arc<FairMutex<GpiodHandle>>,
        sink: EventSink,
    ) -> Result<Self> {
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let mut buffer = request::Buffer::new(LIBGPIOD_BACKEND_EVENT_BUFFER_CAPACITY)
            .map_err(|e| GpioError::Backend(format!("event buffer: {e}")))?;

        let handle = std::thread::spawn(move || {
            let pin = sink.pin_number();
            let mut faulted = false;
            let mut report = |message: String| {
                warn!("{message}");
                if !faulted {
                    sink.fault(message);
                    faulted = true;
                }
            };

            while !cancel_flag.load(Ordering::Relaxed) {
                let hdl = gpiod_handle.lock();
                let req = &hdl.request;

                let has_event =
                    match req.wait_edge_events(Some(LIBGPIOD_BACKEND_EVENT_WAIT_TIMEOUT_MS)) {
                        Ok(v) => v,
                        Err(e) => {
                            drop(hdl);
                            report(format!("wait edge events error for pin {pin}: {e}"));
                            yield_now();
                            continue;
                        }
                    };
                if !has_event {
                    continue;
                }

                let events = match req.read_edge_events(&mut buffer) {
                    Ok(evts) => evts,
                    Err(e) => {
                        drop(hdl);
                        report(format!("read edge events error for pin {pin}: {e}"));
                        yield_now();
                        continue;
                    }
                };
                for evt in events {
                    let evt = match evt {
                        Ok(e) => e,
                        Err(_) => continue,
                    };
                    let edge = match evt.event_type() {
                        Ok(line::EdgeKind::Rising) => PinEventTypes::Rising,
                        Ok(line::EdgeKind::Falling) => PinEventTypes::Falling,
                        Err(_) => continue,
                    };
                    if event_types.matches(edge) {
                        sink.emit(edge, evt.timestamp().as_millis() as u64);
                    }
                }
            }
        });

        Ok(Self {
            id,
            event_types,
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for EdgeListener {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    pub fn new(config: &ControllerConfig) -> Result<Self> {
        if config.pins.is_empty() {
            return Err(GpioError::Config(
                "libgpiod backend requires at least one entry in 'pins'".into(),
            ));
        }
        Ok(Self {
            profiles: config.pins.clone(),
            layout: config.board_layout.clone(),
            lines: RwLock::new(FxHashMap::default()),
            subscriptions: Mutex::new(FxHashMap::default()),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn profile(&self, pin: u32) -> Result<&PinConfig> {
        self.profiles
            .get(&pin)
            .ok_or(GpioError::InvalidPin(pin, PinNumberingScheme::Logical))
    }

    fn make_line_settings(
        mode: PinMode,
        edges: Option<PinEventTypes>,
        debounce_ms: u64,
    ) -> Result<line::Settings> {
        let mut ls = line::Settings::new()
            .map_err(|e| GpioError::Backend(format!("libgpiod settings: {e}")))?;

        match mode {
            PinMode::Output => {
                ls.set_direction(line::Direction::Output)
                    .map_err(|e| GpioError::Backend(format!("set direction: {e}")))?;
                ls.set_drive(line::Drive::PushPull)
                    .map_err(|e| GpioError::Backend(format!("set drive: {e}")))?;
            }
            PinMode::Input => {
                ls.set_direction(line::Direction::Input)
                    .map_err(|e| GpioError::Backend(format!("set direction: {e}")))?;
                ls.set_bias(None)
                    .map_err(|e| GpioError::Backend(format!("set bias: {e}")))?;
            }
        }

        let edge = match edges {
            None | Some(PinEventTypes::None) => None,
            Some(PinEventTypes::Rising) => Some(line::Edge::Rising),
            Some(PinEventTypes::Falling) => Some(line::Edge::Falling),
            Some(PinEventTypes::Both) => Some(line::Edge::Both),
        };
        if mode == PinMode::Input && edge.is_some() {
            ls.set_edge_detection(edge)
                .map_err(|e| GpioError::Backend(format!("set edge detection: {e}")))?;
            ls.set_event_clock(EventClock::Realtime)
                .map_err(|e| GpioError::Backend(format!("set event clock: {e}")))?;
            ls.set_debounce_period(Duration::from_millis(debounce_ms));
        }

        Ok(ls)
    }

    fn make_line_config(offset: u32, settings: line::Settings) -> Result<line::Config> {
        let mut cfg =
            line::Config::new().map_err(|e| GpioError::Backend(format!("line config: {e}")))?;
        cfg.add_line_settings(&[offset], settings)
            .map_err(|e| GpioError::Backend(format!("line config add settings: {e}")))?;
        Ok(cfg)
    }
}

impl GpioBackend for LibgpiodBackend {
    fn pin_count(&self) -> u32 {
        self.profiles.keys().max().map_or(0, |max| max + 1)
    }

    fn is_valid_pin(&self, pin: u32) -> bool {
        self.profiles.contains_key(&pin)
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
        self.profiles
            .get(&pin)
            .is_some_and(|profile| profile.modes.contains(&mode))
    }

    fn configure(&self, pin: u32, mode: PinMode) -> Result<()> {
        let profile = self.profile(pin)?;
        if !profile.modes.contains(&mode) {
            return Err(GpioError::UnsupportedMode { pin, mode });
        }

        let lines = self.lines.upgradable_read();
        match lines.get(&pin) {
            Some(handle) => {
                let mut handle = handle.write();

                // drop listener before the line stops being an input
                if mode == PinMode::Output {
                    drop(handle.take_listener(&self.subscriptions));
                }
                let previous = std::mem::replace(&mut handle.mode, mode);
                let edges = handle.listener.as_ref().map(|l| l.event_types);
                if let Err(e) = handle.reconfigure(edges) {
                    handle.mode = previous;
                    return Err(e);
                }
            }
            None => {
                // the upgradable read is exclusive, so the handle can be built
                // before taking the write lock
                let line_settings = Self::make_line_settings(mode, None, profile.debounce_ms)?;
                let line_cfg = Self::make_line_config(profile.line, line_settings)?;
                let gpiod_handle = GpiodHandle::new(&profile.chip, &line_cfg)?;

                let handle = RwLock::new(LineHandle {
                    offset: profile.line,
                    mode,
                    debounce_ms: profile.debounce_ms,
                    gpiod_handle: Arc::new(FairMutex::new(gpiod_handle)),
                    listener: None,
                });

                let mut lines = RwLockUpgradableReadGuard::upgrade(lines);
                lines.insert(pin, handle);
            }
        }
        debug!("configured line for pin {pin} as {mode}");

        Ok(())
    }

    fn release(&self, pin: u32) -> Result<()> {
        let removed = self.lines.write().remove(&pin);
        if let Some(handle) = removed {
            let mut handle = handle.into_inner();
            drop(handle.take_listener(&self.subscriptions));
            debug!("released line for pin {pin}");
        }
        Ok(())
    }

    fn read_value(&self, pin: u32) -> Result<PinValue> {
        let lines = self.lines.read();
        let handle = lines.get(&pin).ok_or(GpioError::NotConfigured(pin))?.read();

        let value = handle
            .gpiod_handle
            .lock()
            .request
            .value(handle.offset)
            .map_err(|e| GpioError::Backend(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => PinValue::Low,
            line::Value::Active => PinValue::High,
        })
    }

    fn write_value(&self, pin: u32, value: PinValue) -> Result<()> {
        let lines = self.lines.read();
        let handle = lines.get(&pin).ok_or(GpioError::NotConfigured(pin))?.read();

        if handle.mode != PinMode::Output {
            return Err(GpioError::NotConfigured(pin));
        }

        let offset = handle.offset;
        handle
            .gpiod_handle
            .lock()
            .request
            .set_value(
                offset,
                match value {
                    PinValue::Low => line::Value::InActive,
                    PinValue::High => line::Value::Active,
                },
            )
            .map_err(|e| GpioError::Backend(format!("set value: {e}")))?;
        Ok(())
    }

    fn subscribe(
        &self,
        pin: u32,
        event_types: PinEventTypes,
        sink: EventSink,
    ) -> Result<SubscriptionHandle> {
        let lines = self.lines.read();
        let mut handle = lines.get(&pin).ok_or(GpioError::NotConfigured(pin))?.write();
        if handle.mode != PinMode::Input {
            return Err(GpioError::NotConfigured(pin));
        }

        drop(handle.take_listener(&self.subscriptions));
        handle.reconfigure(Some(event_types))?;

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let listener = EdgeListener::new(id, event_types, handle.gpiod_handle.clone(), sink)?;
        handle.listener = Some(listener);
        self.subscriptions.lock().insert(id, pin);
        debug!("edge listener {id} started for pin {pin}");

        Ok(SubscriptionHandle { pin, id })
    }

    fn unsubscribe(&self, subscription: SubscriptionHandle) -> Result<()> {
        if self.subscriptions.lock().remove(&subscription.id).is_none() {
            return Ok(());
        }

        let lines = self.lines.read();
        let Some(handle) = lines.get(&subscription.pin) else {
            return Ok(());
        };
        let mut handle = handle.write();
        if handle
            .listener
            .as_ref()
            .is_some_and(|l| l.id == subscription.id)
        {
            drop(handle.listener.take());
            handle.reconfigure(None)?;
            debug!("edge listener {} stopped for pin {}", subscription.id, subscription.pin);
        }
        Ok(())
    }
}
