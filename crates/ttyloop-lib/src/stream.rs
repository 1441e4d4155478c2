use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::ready;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::cancel::CancellationToken;
use crate::device::{Device, Signals};
use crate::error::{Error, OpenError};
use crate::event::{Notifier, PinChange, SerialData, Subscription};
use crate::io_loop;
use crate::queue::RequestQueue;
use crate::request::{IoRequest, Operation, Outcome, ReadOp, WriteOp};
use crate::settings::StreamOptions;
use crate::util::lock;

#[cfg(unix)]
use crate::device::tty::TtyDevice;
#[cfg(unix)]
use crate::settings::PortSettings;

/// An open serial device and the I/O loop serving it.
///
/// All methods take `&self`; share the stream between threads with an
/// `Arc`. Dropping the stream closes it.
pub struct SerialStream<D: Device> {
    shared: Arc<Shared<D>>,
}

/// State shared between callers and the I/O loop thread.
pub(crate) struct Shared<D: Device> {
    pub device: Mutex<Option<Arc<D>>>,
    pub reads: RequestQueue<ReadOp>,
    pub writes: RequestQueue<WriteOp>,
    /// Raised by cancelled requests, cleared by the loop when it sweeps.
    pub cancellations: Arc<AtomicBool>,
    pub finished: AtomicBool,
    /// Start/stop lock: the running loop's handle, `None` while stopped.
    pub io_loop: Mutex<Option<JoinHandle<()>>>,
    pub notifier: Notifier,
    pub options: StreamOptions,
    /// Survive loop restarts so a restarted loop doesn't report old data.
    pub total_bytes_read: AtomicU64,
    pub last_bytes_available: AtomicU64,
    pub loop_starts: AtomicUsize,
}

impl<D: Device> Shared<D> {
    /// Starts the I/O loop unless one is already recorded.
    pub fn ensure_loop_running(self: &Arc<Self>) -> Result<(), Error> {
        let mut io_loop = lock(&self.io_loop);

        if io_loop.is_some() {
            return Ok(());
        }

        if self.finished.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }

        let Some(device) = lock(&self.device).clone() else {
            return Err(Error::NotOpen);
        };

        let generation = self.loop_starts.fetch_add(1, Ordering::Relaxed) + 1;
        let shared = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("serial-io".to_owned())
            .spawn(move || io_loop::run(shared, device, generation))?;

        *io_loop = Some(handle);
        Ok(())
    }

    /// Called by an idle loop. Stops it only if, under the start/stop lock,
    /// there is still nothing queued and nobody subscribed.
    pub fn stop_if_idle(&self) -> bool {
        let mut io_loop = lock(&self.io_loop);

        if self.notifier.has_handlers() || !self.reads.is_empty() || !self.writes.is_empty() {
            return false;
        }

        io_loop.take();
        true
    }

    /// Called by a loop that is exiting after a fatal device error.
    pub fn detach_loop(&self) {
        lock(&self.io_loop).take();
    }

    /// Completes everything queued in either direction with `error()`.
    pub fn fail_pending(&self, error: impl Fn() -> Error) {
        for request in self.reads.drain() {
            request.complete(Err(error()));
        }

        for request in self.writes.drain() {
            request.complete(Err(error()));
        }
    }

    fn submit<Op: Operation>(
        self: &Arc<Self>,
        queue: &RequestQueue<Op>,
        op: Op,
        cancel: &CancellationToken,
    ) -> Result<Arc<IoRequest<Op>>, Error> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Error::NotOpen);
        }

        let request = IoRequest::new(op, cancel, self.cancellations.clone());
        queue.enqueue(request.clone());

        if let Err(error) = self.ensure_loop_running() {
            request.complete(Err(error));
        }

        Ok(request)
    }
}

#[cfg(unix)]
impl SerialStream<TtyDevice> {
    pub fn open(path: &str, settings: &PortSettings) -> Result<Self, OpenError> {
        Self::open_with_options(path, settings, StreamOptions::default())
    }

    pub fn open_with_options(
        path: &str,
        settings: &PortSettings,
        options: StreamOptions,
    ) -> Result<Self, OpenError> {
        let device = TtyDevice::open(path, settings)?;
        Self::with_device(device, options)
    }
}

impl<D: Device> SerialStream<D> {
    /// Wraps an already open device. The I/O loop starts with the first
    /// request or subscription.
    pub fn with_device(device: D, options: StreamOptions) -> Result<Self, OpenError> {
        let notifier = Notifier::start()?;

        Ok(SerialStream {
            shared: Arc::new(Shared {
                device: Mutex::new(Some(Arc::new(device))),
                reads: RequestQueue::new(),
                writes: RequestQueue::new(),
                cancellations: Arc::new(AtomicBool::new(false)),
                finished: AtomicBool::new(false),
                io_loop: Mutex::new(None),
                notifier,
                options,
                total_bytes_read: AtomicU64::new(0),
                last_bytes_available: AtomicU64::new(0),
                loop_starts: AtomicUsize::new(0),
            }),
        })
    }

    /// Reads at least one byte into `buf`, blocking until data arrives or
    /// `timeout` elapses.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        if buf.is_empty() {
            return self.ensure_open().map(|()| 0);
        }

        let cancel = CancellationToken::new();
        let request = self.shared.submit(&self.shared.reads, ReadOp::new(buf.len()), &cancel)?;
        let data = wait_for(&request, &cancel, timeout)?;

        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Writes all of `buf`, blocking until the last byte is handed to the
    /// device or `timeout` elapses.
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        if buf.is_empty() {
            return self.ensure_open();
        }

        let cancel = CancellationToken::new();
        let request = self.shared.submit(&self.shared.writes, WriteOp::new(buf.to_vec()), &cancel)?;
        wait_for(&request, &cancel, timeout)
    }

    /// Queues a read right away and returns a future for its completion.
    ///
    /// Cancelling `cancel` completes the read with [`Error::Canceled`], or
    /// [`Error::TimedOut`] if the token expired. Dropping the future before it
    /// completes cancels the read.
    pub fn read_async<'a>(&'a self, buf: &'a mut [u8], cancel: &CancellationToken) -> ReadFuture<'a> {
        let inner = if buf.is_empty() {
            RequestFuture::ready(self.ensure_open().map(|()| Vec::new()), cancel)
        } else {
            RequestFuture::submitted(
                self.shared.submit(&self.shared.reads, ReadOp::new(buf.len()), cancel),
                cancel,
            )
        };

        ReadFuture { buf, inner }
    }

    /// Queues a write right away and returns a future for its completion.
    /// See [`read_async`](Self::read_async) for cancellation.
    pub fn write_async(&self, buf: &[u8], cancel: &CancellationToken) -> WriteFuture {
        let inner = if buf.is_empty() {
            RequestFuture::ready(self.ensure_open(), cancel)
        } else {
            RequestFuture::submitted(
                self.shared.submit(&self.shared.writes, WriteOp::new(buf.to_vec()), cancel),
                cancel,
            )
        };

        WriteFuture { inner }
    }

    /// Calls `handler` on the dispatcher thread whenever data arrives or a
    /// read hits end of stream. Starts the I/O loop.
    pub fn on_data_received(
        &self,
        handler: impl Fn(SerialData) + Send + Sync + 'static,
    ) -> Result<Subscription, Error> {
        self.ensure_open()?;
        let subscription = self.shared.notifier.subscribe_data(Arc::new(handler));
        self.shared.ensure_loop_running()?;
        Ok(subscription)
    }

    /// Calls `handler` on the dispatcher thread for each modem line that
    /// changes. Starts the I/O loop.
    pub fn on_pin_changed(
        &self,
        handler: impl Fn(PinChange) + Send + Sync + 'static,
    ) -> Result<Subscription, Error> {
        self.ensure_open()?;
        let subscription = self.shared.notifier.subscribe_pins(Arc::new(handler));
        self.shared.ensure_loop_running()?;
        Ok(subscription)
    }

    /// Stops the I/O loop, fails every queued request with
    /// [`Error::NotOpen`] and releases the device. Safe to call twice.
    pub fn close(&self) {
        let shared = &self.shared;

        if shared.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        // join outside the lock: an idle loop takes it to stop itself
        let io_loop = lock(&shared.io_loop).take();
        if let Some(handle) = io_loop {
            if handle.join().is_err() {
                log::error!("serial io loop panicked");
            }
        }

        shared.fail_pending(|| Error::NotOpen);
        shared.notifier.close();
        lock(&shared.device).take();

        log::debug!("serial stream closed");
    }

    pub fn is_open(&self) -> bool {
        !self.shared.finished.load(Ordering::Acquire)
    }

    pub fn is_io_loop_running(&self) -> bool {
        lock(&self.shared.io_loop).is_some()
    }

    /// Reads queued and not yet completed.
    pub fn pending_reads(&self) -> usize {
        self.shared.reads.live_len()
    }

    /// Writes queued and not yet completed.
    pub fn pending_writes(&self) -> usize {
        self.shared.writes.live_len()
    }

    pub(crate) fn loop_starts(&self) -> usize {
        self.shared.loop_starts.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::NotOpen)
        }
    }

    fn device(&self) -> Result<Arc<D>, Error> {
        lock(&self.shared.device).clone().ok_or(Error::NotOpen)
    }

    pub fn baud_rate(&self) -> Result<u32, Error> {
        Ok(self.device()?.baud_rate()?)
    }

    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<(), Error> {
        Ok(self.device()?.set_baud_rate(baud_rate)?)
    }

    pub fn data_bits(&self) -> Result<DataBits, Error> {
        Ok(self.device()?.data_bits()?)
    }

    pub fn set_data_bits(&self, data_bits: DataBits) -> Result<(), Error> {
        Ok(self.device()?.set_data_bits(data_bits)?)
    }

    pub fn parity(&self) -> Result<Parity, Error> {
        Ok(self.device()?.parity()?)
    }

    pub fn set_parity(&self, parity: Parity) -> Result<(), Error> {
        Ok(self.device()?.set_parity(parity)?)
    }

    pub fn stop_bits(&self) -> Result<StopBits, Error> {
        Ok(self.device()?.stop_bits()?)
    }

    pub fn set_stop_bits(&self, stop_bits: StopBits) -> Result<(), Error> {
        Ok(self.device()?.set_stop_bits(stop_bits)?)
    }

    pub fn flow_control(&self) -> Result<FlowControl, Error> {
        Ok(self.device()?.flow_control()?)
    }

    pub fn set_flow_control(&self, flow_control: FlowControl) -> Result<(), Error> {
        Ok(self.device()?.set_flow_control(flow_control)?)
    }

    pub fn set_dtr(&self, level: bool) -> Result<(), Error> {
        Ok(self.device()?.set_dtr(level)?)
    }

    pub fn set_rts(&self, level: bool) -> Result<(), Error> {
        Ok(self.device()?.set_rts(level)?)
    }

    pub fn set_break(&self, on: bool) -> Result<(), Error> {
        Ok(self.device()?.set_break(on)?)
    }

    pub fn cts_holding(&self) -> Result<bool, Error> {
        Ok(self.device()?.signals()?.contains(Signals::CTS))
    }

    pub fn dsr_holding(&self) -> Result<bool, Error> {
        Ok(self.device()?.signals()?.contains(Signals::DSR))
    }

    pub fn cd_holding(&self) -> Result<bool, Error> {
        Ok(self.device()?.signals()?.contains(Signals::DCD))
    }

    pub fn bytes_to_read(&self) -> Result<u32, Error> {
        Ok(self.device()?.bytes_to_read()?)
    }

    pub fn bytes_to_write(&self) -> Result<u32, Error> {
        Ok(self.device()?.bytes_to_write()?)
    }

    pub fn discard_in_buffer(&self) -> Result<(), Error> {
        Ok(self.device()?.discard(ClearBuffer::Input)?)
    }

    pub fn discard_out_buffer(&self) -> Result<(), Error> {
        Ok(self.device()?.discard(ClearBuffer::Output)?)
    }

    /// Waits for the driver to transmit what it has been given. Writes still
    /// queued in the stream are not included.
    pub fn flush(&self) -> Result<(), Error> {
        Ok(self.device()?.drain()?)
    }
}

impl<D: Device> Drop for SerialStream<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: Device> io::Read for &SerialStream<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(SerialStream::read(*self, buf, self.shared.options.read_timeout)?)
    }
}

impl<D: Device> io::Write for &SerialStream<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        SerialStream::write(*self, buf, self.shared.options.write_timeout)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(SerialStream::flush(*self)?)
    }
}

/// Waits for `request`. On timeout the request is cancelled through its own
/// token, and whichever outcome got latched first is returned.
fn wait_for<Op: Operation>(
    request: &IoRequest<Op>,
    cancel: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<Op::Output, Error> {
    let outcome = match request.wait(timeout) {
        Some(outcome) => outcome,
        None => {
            cancel.expire();
            request.wait(Some(Duration::ZERO)).unwrap_or(Err(Error::Canceled))
        }
    };

    translate_cancel(outcome, cancel)
}

fn translate_cancel<T>(outcome: Outcome<T>, cancel: &CancellationToken) -> Outcome<T> {
    match outcome {
        Err(Error::Canceled) if cancel.is_expired() => Err(Error::TimedOut),
        outcome => outcome,
    }
}

enum State<Op: Operation> {
    Submitted(Arc<IoRequest<Op>>),
    Ready(Outcome<Op::Output>),
    Done,
}

struct RequestFuture<Op: Operation> {
    state: State<Op>,
    cancel: CancellationToken,
}

impl<Op: Operation> RequestFuture<Op> {
    fn submitted(request: Result<Arc<IoRequest<Op>>, Error>, cancel: &CancellationToken) -> Self {
        let state = match request {
            Ok(request) => State::Submitted(request),
            Err(error) => State::Ready(Err(error)),
        };

        RequestFuture { state, cancel: cancel.clone() }
    }

    fn ready(outcome: Outcome<Op::Output>, cancel: &CancellationToken) -> Self {
        RequestFuture { state: State::Ready(outcome), cancel: cancel.clone() }
    }
}

impl<Op: Operation> Future for RequestFuture<Op> {
    type Output = Outcome<Op::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let outcome = match mem::replace(&mut this.state, State::Done) {
            State::Submitted(request) => match request.poll_outcome(cx) {
                Poll::Pending => {
                    this.state = State::Submitted(request);
                    return Poll::Pending;
                }
                Poll::Ready(outcome) => outcome.unwrap_or(Err(Error::Canceled)),
            },
            State::Ready(outcome) => outcome,
            State::Done => Err(Error::Canceled),
        };

        Poll::Ready(translate_cancel(outcome, &this.cancel))
    }
}

impl<Op: Operation> Drop for RequestFuture<Op> {
    fn drop(&mut self) {
        if let State::Submitted(request) = &self.state {
            request.cancel();
        }
    }
}

/// Future returned by [`SerialStream::read_async`].
#[must_use = "futures do nothing unless polled, and dropping this one cancels the read"]
pub struct ReadFuture<'a> {
    buf: &'a mut [u8],
    inner: RequestFuture<ReadOp>,
}

impl Future for ReadFuture<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let data = ready!(Pin::new(&mut this.inner).poll(cx))?;
        this.buf[..data.len()].copy_from_slice(&data);
        Poll::Ready(Ok(data.len()))
    }
}

/// Future returned by [`SerialStream::write_async`].
#[must_use = "futures do nothing unless polled, and dropping this one cancels the write"]
pub struct WriteFuture {
    inner: RequestFuture<WriteOp>,
}

impl Future for WriteFuture {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().inner).poll(cx)
    }
}
