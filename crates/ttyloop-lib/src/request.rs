use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::cancel::{CancellationToken, Registration};
use crate::completion::Completion;
use crate::error::Error;
use crate::util::lock;

pub type Outcome<T> = Result<T, Error>;

/// What a queued request asks the I/O loop to do.
pub trait Operation: Send + Sync + 'static {
    type Output: Send + Unpin + 'static;
}

/// Reads up to `len` bytes. Completes with the bytes actually read.
pub struct ReadOp {
    len: usize,
}

/// Writes all of `data`. `written` only ever grows, and only the I/O loop
/// advances it.
pub struct WriteOp {
    data: Vec<u8>,
    written: AtomicUsize,
}

impl Operation for ReadOp {
    type Output = Vec<u8>;
}

impl Operation for WriteOp {
    type Output = ();
}

impl ReadOp {
    pub fn new(len: usize) -> Self {
        ReadOp { len }
    }
}

impl WriteOp {
    pub fn new(data: Vec<u8>) -> Self {
        WriteOp { data, written: AtomicUsize::new(0) }
    }
}

/// One pending read or write.
///
/// Created per call, owned by its queue until completed. The outcome is
/// latched exactly once: the loop, a cancellation callback and disposal may
/// all race to complete a request and the first one wins.
pub struct IoRequest<Op: Operation> {
    op: Op,
    completion: Completion<Outcome<Op::Output>>,
    registration: Mutex<Option<Registration>>,
    cancellations: Arc<AtomicBool>,
}

impl<Op: Operation> IoRequest<Op> {
    /// `cancellations` is the stream-wide flag raised when this request is
    /// cancelled, telling the loop to sweep its queues.
    pub fn new(op: Op, cancel: &CancellationToken, cancellations: Arc<AtomicBool>) -> Arc<Self> {
        let request = Arc::new(IoRequest {
            op,
            completion: Completion::new(),
            registration: Mutex::new(None),
            cancellations,
        });

        let weak = Arc::downgrade(&request);
        let registration = cancel.register(move || {
            if let Some(request) = weak.upgrade() {
                request.cancel();
            }
        });

        // already-cancelled tokens complete the request inside register()
        if !request.is_completed() {
            *lock(&request.registration) = Some(registration);
        }

        request
    }

    pub fn complete(&self, outcome: Outcome<Op::Output>) -> bool {
        if !self.completion.complete(outcome) {
            return false;
        }

        drop(lock(&self.registration).take());
        true
    }

    pub fn cancel(&self) -> bool {
        if !self.complete(Err(Error::Canceled)) {
            return false;
        }

        self.cancellations.store(true, Ordering::Release);
        true
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_completed()
    }

    pub fn wait(&self, timeout: Option<Duration>) -> Option<Outcome<Op::Output>> {
        self.completion.wait(timeout)
    }

    pub fn poll_outcome(&self, cx: &mut Context<'_>) -> Poll<Option<Outcome<Op::Output>>> {
        self.completion.poll_take(cx)
    }
}

impl IoRequest<ReadOp> {
    pub fn len(&self) -> usize {
        self.op.len
    }
}

impl IoRequest<WriteOp> {
    pub fn remaining(&self) -> &[u8] {
        &self.op.data[self.op.written.load(Ordering::Acquire)..]
    }

    /// Drops the first `n` bytes of the remaining view after a transfer.
    pub fn process_bytes(&self, n: usize) {
        let n = n.min(self.remaining().len());
        self.op.written.fetch_add(n, Ordering::AcqRel);
    }

    pub fn len(&self) -> usize {
        self.op.data.len()
    }
}
