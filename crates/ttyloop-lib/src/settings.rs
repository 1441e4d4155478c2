use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPortBuilder, StopBits};

/// How long the I/O loop may sit with nothing to do before it stops itself.
pub const IO_LOOP_IDLE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on a single readiness wait.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(1);
/// Sleep between idle iterations.
pub const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Line settings applied when a port is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Level to drive DTR to after opening; left alone when `None`.
    pub dtr: Option<bool>,
    /// Level to drive RTS to after opening; left alone when `None`.
    pub rts: Option<bool>,
}

impl Default for PortSettings {
    fn default() -> Self {
        PortSettings {
            baud_rate: 9600,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            dtr: None,
            rts: None,
        }
    }
}

impl PortSettings {
    pub fn baud_rate(self, baud_rate: u32) -> Self {
        PortSettings { baud_rate, ..self }
    }

    pub fn data_bits(self, data_bits: DataBits) -> Self {
        PortSettings { data_bits, ..self }
    }

    pub fn parity(self, parity: Parity) -> Self {
        PortSettings { parity, ..self }
    }

    pub fn stop_bits(self, stop_bits: StopBits) -> Self {
        PortSettings { stop_bits, ..self }
    }

    pub fn flow_control(self, flow_control: FlowControl) -> Self {
        PortSettings { flow_control, ..self }
    }

    pub fn dtr(self, level: bool) -> Self {
        PortSettings { dtr: Some(level), ..self }
    }

    pub fn rts(self, level: bool) -> Self {
        PortSettings { rts: Some(level), ..self }
    }

    pub(crate) fn builder(&self, path: &str) -> SerialPortBuilder {
        serialport::new(path, self.baud_rate)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .flow_control(self.flow_control)
    }
}

/// Tuning for a stream's I/O loop and the timeouts used by its
/// `io::Read`/`io::Write` impls.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub idle_timeout: Duration,
    pub poll_timeout: Duration,
    pub idle_sleep: Duration,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            idle_timeout: IO_LOOP_IDLE_TIMEOUT,
            poll_timeout: POLL_TIMEOUT,
            idle_sleep: IDLE_SLEEP,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
