use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::cancel::Timer;
use crate::device::{Device, Interest, Readiness, Signals};
use crate::util::lock;
use crate::{CancellationToken, Error, PinChange, SerialData, SerialStream, StreamOptions};

enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Fail(ErrorKind),
}

struct MockState {
    reads: VecDeque<ReadStep>,
    /// Most bytes accepted per write call.
    write_chunk: Option<usize>,
    write_blocked: bool,
    written: Vec<u8>,
    write_calls: usize,
    poll_error: Option<ErrorKind>,
    report_error: bool,
    signals: Signals,
    signal_reads: usize,
    baud_rate: u32,
    break_on: bool,
    discarded: Vec<ClearBuffer>,
}

#[derive(Clone)]
struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    fn new() -> Self {
        MockDevice {
            state: Arc::new(Mutex::new(MockState {
                reads: VecDeque::new(),
                write_chunk: None,
                write_blocked: false,
                written: Vec::new(),
                write_calls: 0,
                poll_error: None,
                report_error: false,
                signals: Signals::NONE,
                signal_reads: 0,
                baud_rate: 9600,
                break_on: false,
                discarded: Vec::new(),
            })),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        lock(&self.state)
    }

    fn push(&self, step: ReadStep) {
        self.state().reads.push_back(step);
    }
}

impl Device for MockDevice {
    fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let readiness = {
            let state = self.state();

            if let Some(kind) = state.poll_error {
                return Err(io::Error::new(kind, "scripted poll failure"));
            }

            Readiness {
                readable: interest.read && !state.reads.is_empty(),
                writable: interest.write && !state.write_blocked,
                error: state.report_error,
                invalid: false,
            }
        };

        if !readiness.readable && !readiness.writable && !readiness.error {
            thread::sleep(timeout);
        }

        Ok(readiness)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();

        match state.reads.pop_front() {
            None => Err(ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Fail(kind)) => Err(io::Error::new(kind, "scripted read failure")),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    state.reads.push_front(ReadStep::Data(data.split_off(n)));
                }
                Ok(n)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();

        if state.write_blocked {
            return Err(ErrorKind::WouldBlock.into());
        }

        let n = state.write_chunk.map_or(buf.len(), |chunk| chunk.min(buf.len()));
        state.written.extend_from_slice(&buf[..n]);
        state.write_calls += 1;
        Ok(n)
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        let buffered = self
            .state()
            .reads
            .iter()
            .map(|step| match step {
                ReadStep::Data(data) => data.len(),
                _ => 0,
            })
            .sum::<usize>();

        Ok(buffered as u32)
    }

    fn bytes_to_write(&self) -> io::Result<u32> {
        Ok(0)
    }

    fn signals(&self) -> io::Result<Signals> {
        let mut state = self.state();
        state.signal_reads += 1;
        Ok(state.signals)
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.state().baud_rate)
    }

    fn set_baud_rate(&self, baud_rate: u32) -> serialport::Result<()> {
        self.state().baud_rate = baud_rate;
        Ok(())
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        Ok(DataBits::Eight)
    }

    fn set_data_bits(&self, _: DataBits) -> serialport::Result<()> {
        Ok(())
    }

    fn parity(&self) -> serialport::Result<Parity> {
        Ok(Parity::None)
    }

    fn set_parity(&self, _: Parity) -> serialport::Result<()> {
        Ok(())
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        Ok(StopBits::One)
    }

    fn set_stop_bits(&self, _: StopBits) -> serialport::Result<()> {
        Ok(())
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        Ok(FlowControl::None)
    }

    fn set_flow_control(&self, _: FlowControl) -> serialport::Result<()> {
        Ok(())
    }

    fn set_dtr(&self, _: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn set_rts(&self, _: bool) -> serialport::Result<()> {
        Ok(())
    }

    fn set_break(&self, on: bool) -> serialport::Result<()> {
        self.state().break_on = on;
        Ok(())
    }

    fn discard(&self, buffer: ClearBuffer) -> serialport::Result<()> {
        self.state().discarded.push(buffer);
        Ok(())
    }

    fn drain(&self) -> io::Result<()> {
        Ok(())
    }
}

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn options() -> StreamOptions {
    StreamOptions {
        idle_timeout: Duration::from_millis(100),
        ..StreamOptions::default()
    }
}

fn open(options: StreamOptions) -> (SerialStream<MockDevice>, MockDevice) {
    let mock = MockDevice::new();
    let stream = SerialStream::with_device(mock.clone(), options).unwrap();
    (stream, mock)
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = seen.clone();
        move |event| lock(&seen).push(event)
    };
    (seen, handler)
}

#[test]
fn reads_complete_in_submission_order() {
    let (stream, mock) = open(options());
    let cancel = CancellationToken::new();
    let (mut a, mut b, mut c) = ([0u8; 4], [0u8; 4], [0u8; 4]);

    let first = stream.read_async(&mut a, &cancel);
    let second = stream.read_async(&mut b, &cancel);
    let third = stream.read_async(&mut c, &cancel);

    mock.push(ReadStep::Data(b"one".to_vec()));
    mock.push(ReadStep::Data(b"two".to_vec()));
    mock.push(ReadStep::Data(b"six".to_vec()));

    let (first, second, third) = block_on(futures::future::join3(first, second, third));

    assert_eq!(first.unwrap(), 3);
    assert_eq!(second.unwrap(), 3);
    assert_eq!(third.unwrap(), 3);
    assert_eq!(&a[..3], b"one");
    assert_eq!(&b[..3], b"two");
    assert_eq!(&c[..3], b"six");
}

#[test]
fn partial_writes_complete_after_last_byte() {
    let (stream, mock) = open(options());
    mock.state().write_chunk = Some(4);

    stream.write(b"0123456789", TIMEOUT).unwrap();

    let state = mock.state();
    assert_eq!(state.written, b"0123456789");
    assert_eq!(state.write_calls, 3);
}

#[test]
fn writes_complete_in_submission_order() {
    let (stream, mock) = open(options());
    mock.state().write_blocked = true;

    let cancel = CancellationToken::new();
    let first = stream.write_async(b"abc", &cancel);
    let second = stream.write_async(b"def", &cancel);
    assert_eq!(stream.pending_writes(), 2);

    mock.state().write_blocked = false;
    let (first, second) = block_on(futures::future::join(first, second));

    first.unwrap();
    second.unwrap();
    assert_eq!(mock.state().written, b"abcdef");
}

#[test]
fn idle_loop_stops_and_restarts() {
    let (stream, mock) = open(options());
    assert!(!stream.is_io_loop_running());

    mock.push(ReadStep::Data(vec![1]));
    let mut buf = [0u8; 1];
    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 1);
    assert!(stream.is_io_loop_running());

    assert!(wait_until(|| !stream.is_io_loop_running()));
    assert_eq!(stream.loop_starts(), 1);

    mock.push(ReadStep::Data(vec![2]));
    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 1);
    assert_eq!(buf, [2]);
    assert_eq!(stream.loop_starts(), 2);
}

#[test]
fn idle_stop_with_default_timeout() {
    let (stream, mock) = open(StreamOptions::default());

    mock.push(ReadStep::Data(vec![1]));
    stream.read(&mut [0u8; 1], TIMEOUT).unwrap();

    thread::sleep(Duration::from_millis(1500));
    assert!(stream.is_io_loop_running());

    thread::sleep(Duration::from_millis(1500));
    assert!(!stream.is_io_loop_running());
}

#[test]
fn new_work_resets_idle_timer() {
    let (stream, mock) = open(StreamOptions {
        idle_timeout: Duration::from_millis(200),
        ..StreamOptions::default()
    });

    for byte in 0..5 {
        mock.push(ReadStep::Data(vec![byte]));
        stream.read(&mut [0u8; 1], TIMEOUT).unwrap();
        thread::sleep(Duration::from_millis(100));
    }

    assert_eq!(stream.loop_starts(), 1);
}

#[test]
fn eof_is_reported_once_per_episode() {
    let (stream, mock) = open(options());
    let (events, handler) = recorder();
    let _subscription = stream.on_data_received(handler).unwrap();

    mock.push(ReadStep::Eof);
    mock.push(ReadStep::Eof);
    mock.push(ReadStep::Eof);
    mock.push(ReadStep::Data(b"hello".to_vec()));

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");

    assert!(wait_until(|| lock(&events).contains(&SerialData::Eof)));
    thread::sleep(Duration::from_millis(50));

    let eofs = lock(&events).iter().filter(|event| **event == SerialData::Eof).count();
    assert_eq!(eofs, 1);
}

#[test]
fn buffered_data_notifies_without_reads() {
    let (stream, mock) = open(options());
    let (events, handler) = recorder();
    let _subscription = stream.on_data_received(handler).unwrap();

    mock.push(ReadStep::Data(b"unread".to_vec()));

    assert!(wait_until(|| lock(&events).contains(&SerialData::Chars)));
    assert_eq!(stream.pending_reads(), 0);
}

#[test]
fn data_handler_can_read_from_stream() {
    let (stream, mock) = open(options());
    let stream = Arc::new(stream);
    let weak = Arc::downgrade(&stream);

    let handled = Arc::new(AtomicBool::new(false));
    let (results, record) = recorder();

    let _subscription = stream
        .on_data_received(move |data| {
            if data != SerialData::Chars || handled.swap(true, Ordering::SeqCst) {
                return;
            }

            let Some(stream) = weak.upgrade() else { return };
            let mut buf = [0u8; 8];
            let read = stream.read(&mut buf, TIMEOUT).ok();
            record((read, thread::current().name().map(str::to_owned)));
        })
        .unwrap();

    mock.push(ReadStep::Data(b"abc".to_vec()));

    assert!(wait_until(|| !lock(&results).is_empty()));
    assert_eq!(*lock(&results), [(Some(3), Some("serial-events".to_owned()))]);
}

#[test]
fn close_fails_every_pending_request() {
    let (stream, mock) = open(options());
    let stream = Arc::new(stream);
    mock.state().write_blocked = true;

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let stream = stream.clone();
            thread::spawn(move || stream.read(&mut [0u8; 8], None).map(drop))
        })
        .collect();

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let stream = stream.clone();
            thread::spawn(move || stream.write(b"stuck", None))
        })
        .collect();

    assert!(wait_until(|| stream.pending_reads() == 3 && stream.pending_writes() == 2));

    stream.close();

    for handle in readers.into_iter().chain(writers) {
        assert!(matches!(handle.join().unwrap(), Err(Error::NotOpen)));
    }

    assert!(!stream.is_open());
    assert!(!stream.is_io_loop_running());
}

#[test]
fn read_timeout_leaves_nothing_queued() {
    let (stream, _mock) = open(options());
    let started = Instant::now();

    let result = stream.read(&mut [0u8; 8], Some(Duration::from_millis(50)));

    assert!(matches!(result, Err(Error::TimedOut)));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(stream.pending_reads(), 0);
}

#[test]
fn token_deadline_surfaces_as_timeout() {
    let (stream, _mock) = open(options());
    let cancel = CancellationToken::with_timeout(Duration::from_millis(30));

    let mut buf = [0u8; 8];
    let result = block_on(stream.read_async(&mut buf, &cancel));

    assert!(matches!(result, Err(Error::TimedOut)));
}

#[test]
fn completed_deadline_reads_leave_no_timer_work() {
    let (stream, mock) = open(options());
    let timer = Arc::new(Timer::default());

    for byte in 0..50 {
        mock.push(ReadStep::Data(vec![byte]));

        let cancel = CancellationToken::with_timeout_on(&timer, Duration::from_secs(30));
        let mut buf = [0u8; 1];
        assert_eq!(block_on(stream.read_async(&mut buf, &cancel)).unwrap(), 1);
        assert_eq!(buf, [byte]);
    }

    assert!(wait_until(|| timer.is_idle()));
}

#[test]
fn cancelled_request_is_skipped() {
    let (stream, mock) = open(options());
    let first_token = CancellationToken::new();
    let second_token = CancellationToken::new();
    let (mut a, mut b) = ([0u8; 4], [0u8; 4]);

    let first = stream.read_async(&mut a, &first_token);
    let second = stream.read_async(&mut b, &second_token);

    first_token.cancel();
    assert_eq!(stream.pending_reads(), 1);

    mock.push(ReadStep::Data(b"live".to_vec()));

    assert!(matches!(block_on(first), Err(Error::Canceled)));
    assert_eq!(block_on(second).unwrap(), 4);
    assert_eq!(&b, b"live");
}

#[test]
fn dropping_future_cancels_request() {
    let (stream, _mock) = open(options());
    let cancel = CancellationToken::new();
    let mut buf = [0u8; 4];

    let future = stream.read_async(&mut buf, &cancel);
    assert_eq!(stream.pending_reads(), 1);

    drop(future);
    assert_eq!(stream.pending_reads(), 0);
}

#[test]
fn pin_changes_raise_one_event_per_line() {
    let (stream, mock) = open(options());
    let (events, handler) = recorder();
    let _subscription = stream.on_pin_changed(handler).unwrap();

    // let the loop take its first snapshot
    assert!(wait_until(|| mock.state().signal_reads >= 2));

    mock.state().signals = Signals::CTS | Signals::DSR;

    assert!(wait_until(|| lock(&events).len() == 2));
    thread::sleep(Duration::from_millis(50));

    let events = lock(&events);
    assert_eq!(events.len(), 2);
    assert!(events.contains(&PinChange::CtsChanged));
    assert!(events.contains(&PinChange::DsrChanged));
}

#[test]
fn failed_read_only_affects_its_request() {
    let (stream, mock) = open(options());
    mock.push(ReadStep::Fail(ErrorKind::Other));
    mock.push(ReadStep::Data(b"ok".to_vec()));

    let mut buf = [0u8; 8];
    let failed = stream.read(&mut buf, TIMEOUT);
    assert!(matches!(failed, Err(Error::Io(ref error)) if error.kind() == ErrorKind::Other));

    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 2);
    assert_eq!(&buf[..2], b"ok");
    assert_eq!(stream.loop_starts(), 1);
}

#[test]
fn would_block_is_retried() {
    let (stream, mock) = open(options());
    mock.push(ReadStep::Fail(ErrorKind::WouldBlock));
    mock.push(ReadStep::Data(b"late".to_vec()));

    let mut buf = [0u8; 8];
    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 4);
}

#[test]
fn poll_error_fails_pending_and_stops_loop() {
    let (stream, mock) = open(options());
    mock.state().poll_error = Some(ErrorKind::PermissionDenied);

    let cancel = CancellationToken::new();
    let mut buf = [0u8; 4];
    let read = block_on(stream.read_async(&mut buf, &cancel));
    let write = block_on(stream.write_async(b"data", &cancel));

    for result in [read.map(drop), write] {
        assert!(matches!(result, Err(Error::Io(ref error)) if error.kind() == ErrorKind::PermissionDenied));
    }

    assert!(wait_until(|| !stream.is_io_loop_running()));

    // the next request starts a fresh loop
    let starts = stream.loop_starts();
    mock.state().poll_error = None;
    mock.push(ReadStep::Data(vec![7]));

    assert_eq!(stream.read(&mut buf, TIMEOUT).unwrap(), 1);
    assert_eq!(stream.loop_starts(), starts + 1);
}

#[test]
fn error_readiness_fails_pending_with_device_failed() {
    let (stream, mock) = open(options());
    mock.state().report_error = true;

    let result = stream.read(&mut [0u8; 4], TIMEOUT);

    assert!(matches!(result, Err(Error::DeviceFailed)));
    assert!(wait_until(|| !stream.is_io_loop_running()));
}

#[test]
fn closed_stream_rejects_calls() {
    let (stream, _mock) = open(options());
    stream.close();

    let cancel = CancellationToken::new();
    let mut buf = [0u8; 4];

    assert!(matches!(stream.read(&mut buf, TIMEOUT), Err(Error::NotOpen)));
    assert!(matches!(stream.write(b"x", TIMEOUT), Err(Error::NotOpen)));
    assert!(matches!(block_on(stream.read_async(&mut buf, &cancel)), Err(Error::NotOpen)));
    assert!(matches!(block_on(stream.write_async(b"x", &cancel)), Err(Error::NotOpen)));
    assert!(matches!(stream.on_data_received(|_| {}), Err(Error::NotOpen)));
    assert!(matches!(stream.baud_rate(), Err(Error::NotOpen)));
    assert!(!stream.is_io_loop_running());
}

#[test]
fn close_twice_is_harmless() {
    let (stream, mock) = open(options());
    mock.push(ReadStep::Data(vec![1]));
    stream.read(&mut [0u8; 1], TIMEOUT).unwrap();

    stream.close();
    stream.close();

    assert!(!stream.is_open());
}

#[test]
fn std_io_traits_go_through_queues() {
    let (stream, mock) = open(StreamOptions {
        read_timeout: TIMEOUT,
        ..options()
    });
    mock.push(ReadStep::Data(b"pong".to_vec()));

    (&stream).write_all(b"ping").unwrap();
    io::Write::flush(&mut &stream).unwrap();

    let mut buf = [0u8; 4];
    (&stream).read_exact(&mut buf).unwrap();

    assert_eq!(&buf, b"pong");
    assert_eq!(mock.state().written, b"ping");
}

#[test]
fn timeout_maps_to_io_error_kind() {
    let (stream, _mock) = open(StreamOptions {
        read_timeout: Some(Duration::from_millis(20)),
        ..options()
    });

    let error = io::Read::read(&mut &stream, &mut [0u8; 4]).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::TimedOut);
}

#[test]
fn configuration_passes_through() {
    let (stream, mock) = open(options());

    stream.set_baud_rate(115_200).unwrap();
    stream.set_break(true).unwrap();
    stream.discard_in_buffer().unwrap();
    mock.state().signals = Signals::DCD;

    assert_eq!(stream.baud_rate().unwrap(), 115_200);
    assert!(mock.state().break_on);
    assert!(matches!(mock.state().discarded[..], [ClearBuffer::Input]));
    assert!(stream.cd_holding().unwrap());
    assert!(!stream.cts_holding().unwrap());
}
