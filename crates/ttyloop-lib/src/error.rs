use std::io;

use thiserror::Error;

/// Outcome of a failed read, write or configuration call.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("port error: {0}")]
    Port(#[from] serialport::Error),
    #[error("serial device reported an error condition")]
    DeviceFailed,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation canceled")]
    Canceled,
    #[error("serial port is not open")]
    NotOpen,
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("opening serial port: {0}")]
    Port(#[from] serialport::Error),
    #[error("configuring serial port: {0}")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(error: Error) -> io::Error {
        match error {
            Error::Io(error) => error,
            Error::Port(error) => error.into(),
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, error),
            Error::Canceled => io::Error::new(io::ErrorKind::Interrupted, error),
            Error::NotOpen => io::Error::new(io::ErrorKind::NotConnected, error),
            Error::DeviceFailed => io::Error::new(io::ErrorKind::BrokenPipe, error),
        }
    }
}

/// io::Error is not Clone; a fatal error has to be handed to every pending
/// request, so rebuild it from its os code or kind and message.
pub(crate) fn duplicate_io_error(error: &io::Error) -> io::Error {
    match error.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(error.kind(), error.to_string()),
    }
}

/// Would-block and interrupted transfers are retried on the next iteration.
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
