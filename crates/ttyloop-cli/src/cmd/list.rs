use std::io::{self, Write};
use std::process::ExitCode;

use console::{Term, style};
use serialport::SerialPortType;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ListError {
    #[error("enumerating serial ports: {0}")]
    Port(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn run() -> Result<ExitCode, ListError> {
    let mut term = Term::stdout();
    let ports = ttyloop_lib::available_ports()?;

    if ports.is_empty() {
        writeln!(term, "No serial ports found")?;
        return Ok(ExitCode::SUCCESS);
    }

    for port in ports {
        let kind = match &port.port_type {
            SerialPortType::UsbPort(usb) => {
                let product = usb.product.as_deref().unwrap_or("unknown product");
                format!("usb {:04x}:{:04x} {product}", usb.vid, usb.pid)
            }
            SerialPortType::PciPort => "pci".to_owned(),
            SerialPortType::BluetoothPort => "bluetooth".to_owned(),
            SerialPortType::Unknown => "unknown".to_owned(),
        };

        writeln!(term, "{}  {}", style(&port.port_name).green(), style(kind).dim())?;
    }

    Ok(ExitCode::SUCCESS)
}
