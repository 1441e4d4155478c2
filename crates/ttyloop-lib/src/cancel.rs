//! Cooperative cancellation for queued requests.
//!
//! A [`CancellationToken`] is handed to [`SerialStream::read_async`] and
//! friends. Cancelling it completes every request registered on it with
//! [`Error::Canceled`]; the I/O loop only removes those requests from its
//! queues lazily.
//!
//! [`SerialStream::read_async`]: crate::SerialStream::read_async
//! [`Error::Canceled`]: crate::Error::Canceled

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::util::lock;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    /// Set for deadline tokens, so dropping the last clone can let the
    /// timer forget the deadline.
    timer: Option<Arc<Timer>>,
}

#[derive(Default)]
struct State {
    cancelled: bool,
    expired: bool,
    next_id: u64,
    callbacks: Vec<(u64, Callback)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a token that expires on its own once `timeout` has elapsed.
    ///
    /// Requests cancelled by expiry surface as [`Error::TimedOut`] rather than
    /// [`Error::Canceled`]. Deadlines are kept by one shared timer thread,
    /// which only holds weak references: dropping every clone of the token
    /// disarms it.
    ///
    /// [`Error::TimedOut`]: crate::Error::TimedOut
    /// [`Error::Canceled`]: crate::Error::Canceled
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_timeout_on(Timer::global(), timeout)
    }

    pub(crate) fn with_timeout_on(timer: &Arc<Timer>, timeout: Duration) -> Self {
        let token = CancellationToken {
            inner: Arc::new(Inner {
                state: Mutex::default(),
                timer: Some(timer.clone()),
            }),
        };

        timer.schedule(Instant::now() + timeout, Arc::downgrade(&token.inner));
        token
    }

    pub fn cancel(&self) {
        self.inner.fire(false);
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).cancelled
    }

    /// True if the token was cancelled by its deadline rather than by
    /// [`cancel`](Self::cancel).
    pub fn is_expired(&self) -> bool {
        lock(&self.inner.state).expired
    }

    pub(crate) fn expire(&self) {
        self.inner.fire(true);
    }

    /// Runs `callback` once when the token is cancelled, or right away if it
    /// already is. Dropping the returned registration detaches the callback.
    pub(crate) fn register(&self, callback: impl FnOnce() + Send + 'static) -> Registration {
        let mut state = lock(&self.inner.state);

        if state.cancelled {
            drop(state);
            callback();
            return Registration { token: Weak::new(), id: 0 };
        }

        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.push((id, Box::new(callback)));

        Registration {
            token: Arc::downgrade(&self.inner),
            id,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("expired", &state.expired)
            .finish()
    }
}

impl Inner {
    fn fire(&self, expired: bool) {
        let callbacks = {
            let mut state = lock(&self.state);
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.expired = expired;
            mem::take(&mut state.callbacks)
        };

        // callbacks complete requests, which drops their registrations and
        // takes the state lock again, so run them unlocked
        for (_, callback) in callbacks {
            callback();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = &self.timer {
            timer.forget();
        }
    }
}

struct Deadline {
    at: Instant,
    token: Weak<Inner>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at)
    }
}

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<Deadline>>,
    running: bool,
}

/// Expires deadline tokens.
///
/// The thread is started by the first deadline and exits as soon as no live
/// token is waiting on it.
#[derive(Default)]
pub(crate) struct Timer {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

impl Timer {
    pub fn global() -> &'static Arc<Timer> {
        static TIMER: OnceLock<Arc<Timer>> = OnceLock::new();
        TIMER.get_or_init(Arc::default)
    }

    fn schedule(self: &Arc<Self>, at: Instant, token: Weak<Inner>) {
        let mut state = lock(&self.state);
        state.deadlines.push(Reverse(Deadline { at, token }));

        if !state.running {
            let timer = self.clone();
            match thread::Builder::new()
                .name("serial-timer".to_owned())
                .spawn(move || timer.run())
            {
                Ok(_) => state.running = true,
                Err(error) => log::error!("failed to start deadline timer: {error}"),
            }
        }

        self.wakeup.notify_one();
    }

    /// Wakes the timer so it can drop deadlines whose token is gone.
    fn forget(&self) {
        let _state = lock(&self.state);
        self.wakeup.notify_one();
    }

    fn run(&self) {
        let mut state = lock(&self.state);

        loop {
            state.deadlines.retain(|Reverse(deadline)| deadline.token.strong_count() > 0);

            let now = Instant::now();
            let mut expired = Vec::new();

            while state.deadlines.peek().is_some_and(|Reverse(deadline)| deadline.at <= now) {
                if let Some(Reverse(deadline)) = state.deadlines.pop() {
                    expired.extend(deadline.token.upgrade());
                }
            }

            if !expired.is_empty() {
                // firing runs request callbacks, and the last clone of a
                // token may drop here, which takes the timer lock
                drop(state);
                for inner in expired {
                    inner.fire(true);
                }
                state = lock(&self.state);
                continue;
            }

            let Some(next) = state.deadlines.peek().map(|Reverse(deadline)| deadline.at) else {
                state.running = false;
                return;
            };

            let wait = next.saturating_duration_since(now);
            state = self
                .wakeup
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        !state.running && state.deadlines.is_empty()
    }
}

pub(crate) struct Registration {
    token: Weak<Inner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(inner) = self.token.upgrade() else { return };
        lock(&inner.state).callbacks.retain(|(id, _)| *id != self.id);
    }
}
