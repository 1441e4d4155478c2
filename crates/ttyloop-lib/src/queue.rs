use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::request::{IoRequest, Operation};
use crate::util::lock;

/// FIFO of pending requests.
///
/// Any thread may enqueue; only the I/O loop (and disposal) takes requests
/// off the front. The lock is private to the queue and is never held while
/// another engine lock is taken.
pub struct RequestQueue<Op: Operation> {
    requests: Mutex<VecDeque<Arc<IoRequest<Op>>>>,
}

impl<Op: Operation> RequestQueue<Op> {
    pub fn new() -> Self {
        RequestQueue { requests: Mutex::new(VecDeque::new()) }
    }

    pub fn enqueue(&self, request: Arc<IoRequest<Op>>) {
        lock(&self.requests).push_back(request);
    }

    /// Returns the oldest request that is still live, discarding completed
    /// or cancelled requests in front of it.
    pub fn peek_front(&self) -> Option<Arc<IoRequest<Op>>> {
        let mut requests = lock(&self.requests);

        while let Some(front) = requests.front() {
            if !front.is_completed() {
                return Some(front.clone());
            }
            requests.pop_front();
        }

        None
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.requests).is_empty()
    }

    /// Sweeps completed and cancelled requests out of the queue, wherever they
    /// sit, so a cancelled request is released even while an older live
    /// request is still at the front. Live requests keep their order.
    pub fn remove_completed(&self) -> usize {
        let mut requests = lock(&self.requests);
        let before = requests.len();
        requests.retain(|request| !request.is_completed());
        before - requests.len()
    }

    /// Pops `request` if it is still at the front.
    pub fn dequeue(&self, request: &Arc<IoRequest<Op>>) {
        let mut requests = lock(&self.requests);
        if requests.front().is_some_and(|front| Arc::ptr_eq(front, request)) {
            requests.pop_front();
        }
    }

    pub fn drain(&self) -> Vec<Arc<IoRequest<Op>>> {
        lock(&self.requests).drain(..).collect()
    }

    /// Number of requests that are not yet completed.
    pub fn live_len(&self) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| !request.is_completed())
            .count()
    }
}
