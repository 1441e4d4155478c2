use std::io::{self, Write};

use console::{Term, style};
use serialport::{SerialPortType, DataBits, FlowControl, Parity, StopBits};
use structopt::StructOpt;
use thiserror::Error;

use ttyloop_lib::{OpenError, PortSettings, SerialStream, TtyDevice};

/// Port selection and line settings shared by every command that opens a
/// port.
#[derive(StructOpt)]
pub struct PortOpt {
    /// Serial port path, defaults to the first USB serial port found
    port: Option<String>,
    #[structopt(long, default_value = "115200")]
    baud: u32,
    /// 5, 6, 7 or 8
    #[structopt(long, default_value = "8", parse(try_from_str = parse_data_bits))]
    data_bits: DataBits,
    /// none, odd or even
    #[structopt(long, default_value = "none", parse(try_from_str = parse_parity))]
    parity: Parity,
    /// 1 or 2
    #[structopt(long, default_value = "1", parse(try_from_str = parse_stop_bits))]
    stop_bits: StopBits,
    /// none, software or hardware
    #[structopt(long, default_value = "none", parse(try_from_str = parse_flow_control))]
    flow_control: FlowControl,
}

impl PortOpt {
    fn settings(&self) -> PortSettings {
        PortSettings::default()
            .baud_rate(self.baud)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .flow_control(self.flow_control)
    }
}

#[derive(Error, Debug)]
pub enum FindError {
    #[error("Error enumerating serial ports: {0}")]
    Port(#[from] serialport::Error),
    #[error("Can't find a serial port, make sure the device is plugged in or pass a path")]
    NoPort,
}

#[derive(Error, Debug)]
pub enum OpenPortError {
    #[error(transparent)]
    Find(#[from] FindError),
    #[error("opening {0}: {1}")]
    Open(String, #[source] OpenError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn open(term: &mut Term, opt: &PortOpt) -> Result<SerialStream<TtyDevice>, OpenPortError> {
    let path = match &opt.port {
        Some(path) => path.clone(),
        None => find()?,
    };

    let stream = SerialStream::open(&path, &opt.settings())
        .map_err(|error| OpenPortError::Open(path.clone(), error))?;

    writeln!(term, "Opened {} at {} baud",
        style(&path).green(),
        style(opt.baud).bold())?;

    Ok(stream)
}

pub fn find() -> Result<String, FindError> {
    match find_serialport() {
        Ok(Some(path)) => { return Ok(path); }
        Ok(None) => {}
        Err(error) => {
            log::error!("error enumerating serial ports: {error}");
        }
    }

    #[cfg(target_os = "linux")]
    match find_devtmpfs() {
        Ok(Some(path)) => { return Ok(path); }
        Ok(None) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            log::error!("error enumerating /dev/serial/by-id: {error}");
        }
    }

    Err(FindError::NoPort)
}

/// Finds a USB serial port using the serialport crate. Relies on udev on
/// Linux, which isn't always available (containers, Flatpak).
fn find_serialport() -> Result<Option<String>, serialport::Error> {
    for port in ttyloop_lib::available_ports()? {
        if let SerialPortType::UsbPort(_) = &port.port_type {
            return Ok(Some(port.port_name));
        }
    }

    Ok(None)
}

/// Fallback for when udev can't tell us anything
#[cfg(target_os = "linux")]
fn find_devtmpfs() -> Result<Option<String>, io::Error> {
    let mut names = Vec::new();

    for entry in std::fs::read_dir("/dev/serial/by-id")? {
        let entry = entry?;

        if !entry.file_name().to_str().is_some_and(|name| name.starts_with("usb-")) {
            continue;
        }

        let path = entry.path().canonicalize()?;

        let Some(path) = path.to_str().map(str::to_owned) else {
            continue;
        };

        names.push(path);
    }

    // read_dir order is arbitrary, keep the pick stable
    names.sort();
    Ok(names.into_iter().next())
}

fn parse_data_bits(value: &str) -> Result<DataBits, String> {
    match value {
        "5" => Ok(DataBits::Five),
        "6" => Ok(DataBits::Six),
        "7" => Ok(DataBits::Seven),
        "8" => Ok(DataBits::Eight),
        _ => Err(format!("invalid data bits: {value}")),
    }
}

fn parse_parity(value: &str) -> Result<Parity, String> {
    match value {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("invalid parity: {value}")),
    }
}

fn parse_stop_bits(value: &str) -> Result<StopBits, String> {
    match value {
        "1" => Ok(StopBits::One),
        "2" => Ok(StopBits::Two),
        _ => Err(format!("invalid stop bits: {value}")),
    }
}

fn parse_flow_control(value: &str) -> Result<FlowControl, String> {
    match value {
        "none" => Ok(FlowControl::None),
        "software" => Ok(FlowControl::Software),
        "hardware" => Ok(FlowControl::Hardware),
        _ => Err(format!("invalid flow control: {value}")),
    }
}
