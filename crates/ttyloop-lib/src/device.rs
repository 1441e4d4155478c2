//! The device primitives the I/O loop drives.

#[cfg(unix)]
pub mod tty;

use std::io;
use std::time::Duration;

use derive_more::{BitAnd, BitOr, BitXor};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::event::PinChange;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// The device reported an error condition.
    pub error: bool,
    /// The descriptor is not open.
    pub invalid: bool,
}

impl Readiness {
    pub fn is_fatal(&self) -> bool {
        self.error || self.invalid
    }
}

/// Snapshot of the modem status lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BitAnd, BitOr, BitXor)]
pub struct Signals(u8);

impl Signals {
    pub const NONE: Signals = Signals(0);
    pub const CTS: Signals = Signals(1 << 0);
    pub const DSR: Signals = Signals(1 << 1);
    pub const DCD: Signals = Signals(1 << 2);
    pub const RING: Signals = Signals(1 << 3);

    pub fn contains(self, other: Signals) -> bool {
        self & other == other
    }

    pub fn is_empty(self) -> bool {
        self == Signals::NONE
    }

    /// Sets or clears `signal`.
    pub fn with(self, signal: Signals, level: bool) -> Signals {
        if level {
            self | signal
        } else {
            Signals(self.0 & !signal.0)
        }
    }

    /// One pin change per line that differs from `previous`.
    pub fn changes(self, previous: Signals) -> impl Iterator<Item = PinChange> {
        let changed = self ^ previous;

        [
            (Signals::CTS, PinChange::CtsChanged),
            (Signals::DSR, PinChange::DsrChanged),
            (Signals::DCD, PinChange::CdChanged),
            (Signals::RING, PinChange::Ring),
        ]
        .into_iter()
        .filter(move |(signal, _)| changed.contains(*signal))
        .map(|(_, change)| change)
    }
}

/// An open serial device.
///
/// `poll`, `read`, `write`, `bytes_to_read` and `signals` are only ever
/// called from the I/O loop thread. `read` and `write` must not block: when
/// nothing can be transferred they fail with [`io::ErrorKind::WouldBlock`].
///
/// The configuration methods are called from whichever thread uses the
/// stream and are not coordinated with in-flight I/O.
pub trait Device: Send + Sync + 'static {
    fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness>;
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Bytes received by the driver and not read yet.
    fn bytes_to_read(&self) -> io::Result<u32>;
    /// Bytes handed to the driver and not transmitted yet.
    fn bytes_to_write(&self) -> io::Result<u32>;
    fn signals(&self) -> io::Result<Signals>;

    fn baud_rate(&self) -> serialport::Result<u32>;
    fn set_baud_rate(&self, baud_rate: u32) -> serialport::Result<()>;
    fn data_bits(&self) -> serialport::Result<DataBits>;
    fn set_data_bits(&self, data_bits: DataBits) -> serialport::Result<()>;
    fn parity(&self) -> serialport::Result<Parity>;
    fn set_parity(&self, parity: Parity) -> serialport::Result<()>;
    fn stop_bits(&self) -> serialport::Result<StopBits>;
    fn set_stop_bits(&self, stop_bits: StopBits) -> serialport::Result<()>;
    fn flow_control(&self) -> serialport::Result<FlowControl>;
    fn set_flow_control(&self, flow_control: FlowControl) -> serialport::Result<()>;
    fn set_dtr(&self, level: bool) -> serialport::Result<()>;
    fn set_rts(&self, level: bool) -> serialport::Result<()>;
    fn set_break(&self, on: bool) -> serialport::Result<()>;
    fn discard(&self, buffer: ClearBuffer) -> serialport::Result<()>;
    /// Blocks until everything handed to the driver has been transmitted.
    fn drain(&self) -> io::Result<()>;
}
