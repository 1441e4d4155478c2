//! A polling I/O loop and request-queue engine for Unix serial devices.
//!
//! Every open [`SerialStream`] owns a device handle and, while there is work
//! to do, one background thread (the I/O loop) that is the only place device
//! reads and writes happen. Callers on any thread enqueue read and write
//! requests; the loop services them strictly in FIFO order, one transfer per
//! readiness event, and raises data-received and pin-changed notifications on
//! a separate dispatcher thread. The loop stops itself after a period of
//! idleness and is restarted by the next request or subscription.
//!
//! ```no_run
//! use std::time::Duration;
//! use ttyloop_lib::{PortSettings, SerialStream};
//!
//! let stream = SerialStream::open("/dev/ttyUSB0", &PortSettings::default().baud_rate(115_200))?;
//! stream.write(b"AT\r\n", Some(Duration::from_secs(1)))?;
//!
//! let mut reply = [0u8; 64];
//! let n = stream.read(&mut reply, Some(Duration::from_secs(1)))?;
//! println!("{:?}", String::from_utf8_lossy(&reply[..n]));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cancel;
pub mod device;
pub mod error;
pub mod event;
pub mod settings;
pub mod stream;

mod completion;
mod io_loop;
mod queue;
mod request;
mod util;

#[cfg(test)]
mod tests;

pub use cancel::CancellationToken;
pub use device::{Device, Interest, Readiness, Signals};
pub use error::{Error, OpenError};
pub use event::{PinChange, SerialData, Subscription};
pub use settings::{PortSettings, StreamOptions};
pub use stream::{ReadFuture, SerialStream, WriteFuture};

#[cfg(unix)]
pub use device::tty::TtyDevice;

pub use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPortInfo, StopBits};

/// Lists the serial ports present on this system.
pub fn available_ports() -> serialport::Result<Vec<SerialPortInfo>> {
    serialport::available_ports()
}
