use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::util::lock;

/// A value that is latched at most once and handed to a single waiter,
/// either a blocking caller or a future.
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    completed: AtomicBool,
}

enum Slot<T> {
    Pending(Option<Waker>),
    Ready(T),
    Taken,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Completion {
            slot: Mutex::new(Slot::Pending(None)),
            ready: Condvar::new(),
            completed: AtomicBool::new(false),
        }
    }

    /// Latches `value`. Returns false, dropping `value`, if something was
    /// latched before.
    pub fn complete(&self, value: T) -> bool {
        let waker = {
            let mut slot = lock(&self.slot);
            let Slot::Pending(waker) = &mut *slot else { return false };
            let waker = waker.take();
            *slot = Slot::Ready(value);
            self.completed.store(true, Ordering::Release);
            waker
        };

        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }

        true
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Blocks until the value is latched and takes it. Returns `None` if
    /// `timeout` elapses first, or if the value was already taken.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slot = lock(&self.slot);

        loop {
            match mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(value) => return Some(value),
                Slot::Taken => return None,
                pending @ Slot::Pending(_) => *slot = pending,
            }

            slot = match deadline {
                None => self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Future-side counterpart of [`wait`](Self::wait).
    pub fn poll_take(&self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let mut slot = lock(&self.slot);

        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Ready(value) => Poll::Ready(Some(value)),
            Slot::Taken => Poll::Ready(None),
            Slot::Pending(_) => {
                *slot = Slot::Pending(Some(cx.waker().clone()));
                Poll::Pending
            }
        }
    }
}
