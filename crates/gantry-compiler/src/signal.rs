use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// A close-once broadcast barrier.
///
/// One side closes the signal exactly once; any number of waiters observe
/// the close, including waiters that arrive afterwards. Used both per
/// package fingerprint (closed when that package's compile succeeds) and as
/// the run-wide kill switch.
#[derive(Clone, Default)]
pub struct Signal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    closed: Mutex<bool>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal, waking every waiter. Idempotent.
    pub fn close(&self) {
        let mut closed = self
            .inner
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *closed = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self
            .inner
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait up to `timeout` for the close. Returns whether the signal is
    /// closed when the wait ends.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self
            .inner
            .closed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _result) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |closed| !*closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}
