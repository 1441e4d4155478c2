use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::termios;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits, TTYPort};

use crate::device::{Device, Interest, Readiness, Signals};
use crate::error::OpenError;
use crate::settings::PortSettings;
use crate::util::lock;

/// A Unix tty opened through serialport.
///
/// Transfers and readiness go straight to the non-blocking descriptor.
/// serialport's configuration and modem-line calls need `&mut`, so the port
/// itself sits behind a mutex.
pub struct TtyDevice {
    fd: RawFd,
    port: Mutex<TTYPort>,
}

impl TtyDevice {
    pub fn open(path: &str, settings: &PortSettings) -> Result<TtyDevice, OpenError> {
        let mut port = settings.builder(path).open_native()?;

        if let Some(level) = settings.dtr {
            port.write_data_terminal_ready(level)?;
        }

        if let Some(level) = settings.rts {
            port.write_request_to_send(level)?;
        }

        let fd = port.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;

        log::debug!("opened {path} at {} baud", settings.baud_rate);

        Ok(TtyDevice { fd, port: Mutex::new(port) })
    }
}

impl Device for TtyDevice {
    fn poll(&self, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
        let mut events = PollFlags::empty();
        if interest.read {
            events |= PollFlags::POLLIN;
        }
        if interest.write {
            events |= PollFlags::POLLOUT;
        }

        let mut fds = [PollFd::new(self.fd, events)];
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => Ok(Readiness::default()),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                Ok(Readiness {
                    // a hangup reads as zero bytes on every poll until the
                    // pending read is cancelled or the stream closed
                    readable: revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP),
                    writable: revents.contains(PollFlags::POLLOUT),
                    error: revents.contains(PollFlags::POLLERR),
                    invalid: revents.contains(PollFlags::POLLNVAL),
                })
            }
            Err(errno) => Err(errno.into()),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(nix::unistd::read(self.fd, buf)?)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(nix::unistd::write(self.fd, buf)?)
    }

    fn bytes_to_read(&self) -> io::Result<u32> {
        Ok(lock(&self.port).bytes_to_read()?)
    }

    fn bytes_to_write(&self) -> io::Result<u32> {
        Ok(lock(&self.port).bytes_to_write()?)
    }

    fn signals(&self) -> io::Result<Signals> {
        let mut port = lock(&self.port);

        Ok(Signals::NONE
            .with(Signals::CTS, port.read_clear_to_send()?)
            .with(Signals::DSR, port.read_data_set_ready()?)
            .with(Signals::DCD, port.read_carrier_detect()?)
            .with(Signals::RING, port.read_ring_indicator()?))
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        lock(&self.port).baud_rate()
    }

    fn set_baud_rate(&self, baud_rate: u32) -> serialport::Result<()> {
        lock(&self.port).set_baud_rate(baud_rate)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        lock(&self.port).data_bits()
    }

    fn set_data_bits(&self, data_bits: DataBits) -> serialport::Result<()> {
        lock(&self.port).set_data_bits(data_bits)
    }

    fn parity(&self) -> serialport::Result<Parity> {
        lock(&self.port).parity()
    }

    fn set_parity(&self, parity: Parity) -> serialport::Result<()> {
        lock(&self.port).set_parity(parity)
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        lock(&self.port).stop_bits()
    }

    fn set_stop_bits(&self, stop_bits: StopBits) -> serialport::Result<()> {
        lock(&self.port).set_stop_bits(stop_bits)
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        lock(&self.port).flow_control()
    }

    fn set_flow_control(&self, flow_control: FlowControl) -> serialport::Result<()> {
        lock(&self.port).set_flow_control(flow_control)
    }

    fn set_dtr(&self, level: bool) -> serialport::Result<()> {
        lock(&self.port).write_data_terminal_ready(level)
    }

    fn set_rts(&self, level: bool) -> serialport::Result<()> {
        lock(&self.port).write_request_to_send(level)
    }

    fn set_break(&self, on: bool) -> serialport::Result<()> {
        let port = lock(&self.port);
        if on {
            port.set_break()
        } else {
            port.clear_break()
        }
    }

    fn discard(&self, buffer: ClearBuffer) -> serialport::Result<()> {
        lock(&self.port).clear(buffer)
    }

    fn drain(&self) -> io::Result<()> {
        Ok(termios::tcdrain(self.fd)?)
    }
}
