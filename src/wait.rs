use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{GpioError, Result};
use crate::gpio::PinValueChangedEvent;

/// Outcome of a wait that ended without a backend fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitForEventResult {
    EventOccurred(PinValueChangedEvent),
    TimedOut,
    Cancelled,
}

impl WaitForEventResult {
    pub fn is_event(&self) -> bool {
        matches!(self, WaitForEventResult::EventOccurred(_))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, WaitForEventResult::TimedOut)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitForEventResult::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitCompletion {
    Event(PinValueChangedEvent),
    TimedOut,
    Cancelled,
    Fault(String),
}

impl WaitCompletion {
    pub(crate) fn into_result(self) -> Result<WaitForEventResult> {
        match self {
            WaitCompletion::Event(event) => Ok(WaitForEventResult::EventOccurred(event)),
            WaitCompletion::TimedOut => Ok(WaitForEventResult::TimedOut),
            WaitCompletion::Cancelled => Ok(WaitForEventResult::Cancelled),
            WaitCompletion::Fault(reason) => Err(GpioError::Backend(reason)),
        }
    }
}

/// One-shot rendezvous between a waiting caller and whoever completes it.
///
/// The first `complete` wins; later ones are ignored, so a wait reports
/// exactly one outcome.
#[derive(Default)]
pub(crate) struct EventWaiter {
    state: Mutex<Option<WaitCompletion>>,
    ready: Condvar,
    notify: Notify,
}

impl EventWaiter {
    pub(crate) fn complete(&self, completion: WaitCompletion) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_some() {
                return false;
            }
            *state = Some(completion);
        }
        self.ready.notify_all();
        self.notify.notify_one();
        true
    }

    fn outcome(&self) -> Option<WaitCompletion> {
        self.state.lock().clone()
    }

    pub(crate) fn wait(&self, deadline: Option<Instant>) -> WaitCompletion {
        let mut state = self.state.lock();
        loop {
            if let Some(done) = state.as_ref() {
                return done.clone();
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() && state.is_none() {
                        *state = Some(WaitCompletion::TimedOut);
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    pub(crate) async fn wait_async(&self, deadline: Option<tokio::time::Instant>) -> WaitCompletion {
        loop {
            let notified = self.notify.notified();
            if let Some(done) = self.outcome() {
                return done;
            }
            tokio::select! {
                _ = notified => {}
                _ = deadline_elapsed(deadline) => {
                    self.complete(WaitCompletion::TimedOut);
                }
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Weak<EventWaiter>>>,
}

/// Cooperative cancellation signal shared between a waiting caller and the
/// party that wants it to stop. Clones observe the same signal.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters = std::mem::take(&mut *self.inner.waiters.lock());
        for waiter in waiters.iter().filter_map(Weak::upgrade) {
            waiter.complete(WaitCompletion::Cancelled);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn register(&self, waiter: &Arc<EventWaiter>) {
        let mut waiters = self.inner.waiters.lock();
        if self.is_cancelled() {
            drop(waiters);
            waiter.complete(WaitCompletion::Cancelled);
            return;
        }
        waiters.retain(|w| w.strong_count() > 0);
        waiters.push(Arc::downgrade(waiter));
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PinEventTypes;
    use std::time::Duration;

    fn event() -> PinValueChangedEvent {
        PinValueChangedEvent {
            pin_number: 4,
            change_type: PinEventTypes::Rising,
            timestamp_ms: 1,
        }
    }

    #[test]
    fn first_completion_wins() {
        let waiter = EventWaiter::default();
        assert!(waiter.complete(WaitCompletion::Event(event())));
        assert!(!waiter.complete(WaitCompletion::Cancelled));
        assert_eq!(waiter.wait(None), WaitCompletion::Event(event()));
    }

    #[test]
    fn deadline_produces_timeout() {
        let waiter = EventWaiter::default();
        let start = Instant::now();
        let outcome = waiter.wait(Some(start + Duration::from_millis(30)));
        assert_eq!(outcome, WaitCompletion::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(30));
        // a late event cannot overwrite the timeout
        assert!(!waiter.complete(WaitCompletion::Event(event())));
    }

    #[test]
    fn cancelled_token_completes_late_registrations() {
        let token = CancellationToken::new();
        token.cancel();
        let waiter = Arc::new(EventWaiter::default());
        token.register(&waiter);
        assert_eq!(waiter.wait(None), WaitCompletion::Cancelled);
    }

    #[test]
    fn cancel_wakes_blocked_waiter() {
        let token = CancellationToken::new();
        let waiter = Arc::new(EventWaiter::default());
        token.register(&waiter);

        let canceller = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });

        assert_eq!(waiter.wait(None), WaitCompletion::Cancelled);
        handle.join().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn fault_maps_to_backend_error() {
        let result = WaitCompletion::Fault("line vanished".into()).into_result();
        assert_eq!(result, Err(GpioError::Backend("line vanished".into())));
    }

    #[tokio::test]
    async fn async_wait_times_out() {
        let waiter = EventWaiter::default();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(20);
        assert_eq!(waiter.wait_async(Some(deadline)).await, WaitCompletion::TimedOut);
    }
}
