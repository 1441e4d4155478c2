//! The background loop serving one open device.
//!
//! Exactly one loop runs per stream at a time, and it is the only code that
//! transfers bytes or pops requests off the queues. It services at most one
//! read and one write per iteration, so idle detection, new-data and
//! pin-change notification keep a steady cadence under load.

use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use derive_more::Display;

use crate::device::{Device, Interest, Signals};
use crate::error::{duplicate_io_error, is_transient, Error};
use crate::event::{SerialData, SerialEvent};
use crate::request::{IoRequest, ReadOp, WriteOp};
use crate::stream::Shared;

#[derive(Debug, Display)]
enum Exit {
    #[display(fmt = "idle")]
    Idle,
    #[display(fmt = "stream closed")]
    Closed,
    #[display(fmt = "device failed")]
    Failed,
}

pub(crate) fn run<D: Device>(shared: Arc<Shared<D>>, device: Arc<D>, generation: usize) {
    log::debug!("serial io loop {generation} started");

    let mut io_loop = IoLoop {
        shared,
        device,
        idle_since: None,
        last_signals: None,
        eof_reported: false,
        scratch: Vec::new(),
    };

    let exit = loop {
        if let ControlFlow::Break(exit) = io_loop.iterate() {
            break exit;
        }
    };

    log::debug!("serial io loop {generation} stopped: {exit}");
}

struct IoLoop<D: Device> {
    shared: Arc<Shared<D>>,
    device: Arc<D>,
    idle_since: Option<Instant>,
    /// `None` until a pin subscriber exists, so a new subscriber only hears
    /// about changes made after it subscribed.
    last_signals: Option<Signals>,
    eof_reported: bool,
    scratch: Vec<u8>,
}

impl<D: Device> IoLoop<D> {
    fn iterate(&mut self) -> ControlFlow<Exit> {
        let shared = Arc::clone(&self.shared);

        if shared.finished.load(Ordering::Acquire) {
            return ControlFlow::Break(Exit::Closed);
        }

        if shared.cancellations.swap(false, Ordering::AcqRel) {
            let swept = shared.reads.remove_completed() + shared.writes.remove_completed();
            log::trace!("swept {swept} cancelled requests");
        }

        let read = shared.reads.peek_front();
        let write = shared.writes.peek_front();

        if read.is_none() && write.is_none() {
            if !shared.notifier.has_handlers() {
                return self.idle_tick();
            }

            // subscribers only: nothing to transfer, keep watching
            self.idle_since = None;
            thread::sleep(shared.options.idle_sleep);
        } else {
            self.idle_since = None;
            if let ControlFlow::Break(exit) = self.service_io(read, write) {
                return ControlFlow::Break(exit);
            }
        }

        self.check_bytes_available();
        self.check_pins();

        ControlFlow::Continue(())
    }

    fn idle_tick(&mut self) -> ControlFlow<Exit> {
        let options = &self.shared.options;
        let idle_since = *self.idle_since.get_or_insert_with(Instant::now);

        if idle_since.elapsed() < options.idle_timeout {
            thread::sleep(options.idle_sleep);
            return ControlFlow::Continue(());
        }

        if self.shared.stop_if_idle() {
            return ControlFlow::Break(Exit::Idle);
        }

        // work showed up while we were deciding to stop
        self.idle_since = None;
        ControlFlow::Continue(())
    }

    fn service_io(
        &mut self,
        read: Option<Arc<IoRequest<ReadOp>>>,
        write: Option<Arc<IoRequest<WriteOp>>>,
    ) -> ControlFlow<Exit> {
        let interest = Interest {
            read: read.is_some(),
            write: write.is_some(),
        };

        let readiness = match self.device.poll(interest, self.shared.options.poll_timeout) {
            Ok(readiness) => readiness,
            Err(error) => {
                log::error!("serial device poll failed: {error}");
                self.shared.detach_loop();
                self.shared.fail_pending(|| Error::Io(duplicate_io_error(&error)));
                return ControlFlow::Break(Exit::Failed);
            }
        };

        if readiness.is_fatal() {
            log::error!("serial device reported {readiness:?}");
            self.shared.detach_loop();
            self.shared.fail_pending(|| Error::DeviceFailed);
            return ControlFlow::Break(Exit::Failed);
        }

        if let Some(request) = read.filter(|_| readiness.readable) {
            self.service_read(&request);
        }

        if let Some(request) = write.filter(|_| readiness.writable) {
            self.service_write(&request);
        }

        ControlFlow::Continue(())
    }

    fn service_read(&mut self, request: &Arc<IoRequest<ReadOp>>) {
        let len = request.len();
        self.scratch.resize(len, 0);

        match self.device.read(&mut self.scratch[..len]) {
            Ok(0) => {
                // the request stays queued, more data may come
                log::trace!("zero-byte read, device at end of stream or hung up");
                if !self.eof_reported {
                    self.eof_reported = true;
                    self.shared.notifier.notify(SerialEvent::Data(SerialData::Eof));
                }
            }
            Ok(n) => {
                log::trace!("read {n} bytes");
                self.eof_reported = false;
                self.shared.total_bytes_read.fetch_add(n as u64, Ordering::AcqRel);

                if !request.complete(Ok(self.scratch[..n].to_vec())) {
                    log::debug!("dropping {n} bytes read for a cancelled request");
                }

                self.shared.reads.dequeue(request);
            }
            Err(error) if is_transient(&error) => {}
            Err(error) => {
                log::warn!("serial read failed: {error}");
                request.complete(Err(Error::Io(error)));
                self.shared.reads.dequeue(request);
            }
        }
    }

    fn service_write(&mut self, request: &Arc<IoRequest<WriteOp>>) {
        match self.device.write(request.remaining()) {
            Ok(n) => {
                log::trace!("wrote {n} bytes of a {} byte request", request.len());
                request.process_bytes(n);

                if request.remaining().is_empty() {
                    request.complete(Ok(()));
                    self.shared.writes.dequeue(request);
                }
            }
            Err(error) if is_transient(&error) => {}
            Err(error) => {
                log::warn!("serial write failed: {error}");
                request.complete(Err(Error::Io(error)));
                self.shared.writes.dequeue(request);
            }
        }
    }

    fn check_bytes_available(&mut self) {
        let buffered = self.device.bytes_to_read().unwrap_or(0);
        let available = self.shared.total_bytes_read.load(Ordering::Acquire) + u64::from(buffered);
        let last = self.shared.last_bytes_available.swap(available, Ordering::AcqRel);

        if available > last {
            self.shared.notifier.notify(SerialEvent::Data(SerialData::Chars));
        }
    }

    fn check_pins(&mut self) {
        if !self.shared.notifier.has_pin_handlers() {
            self.last_signals = None;
            return;
        }

        let Ok(signals) = self.device.signals() else { return };

        if let Some(previous) = self.last_signals.replace(signals) {
            for change in signals.changes(previous) {
                self.shared.notifier.notify(SerialEvent::Pin(change));
            }
        }
    }
}
