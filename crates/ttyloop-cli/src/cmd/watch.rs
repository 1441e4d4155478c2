use std::io::{self, Write};
use std::process::ExitCode;

use console::{Term, style};
use structopt::StructOpt;
use thiserror::Error;
use tokio::sync::mpsc;
use ttyloop_lib::{PinChange, SerialData, SerialStream, TtyDevice};

use crate::device::{self, PortOpt};

#[derive(StructOpt)]
pub struct WatchOpt {
    #[structopt(flatten)]
    port: PortOpt,
}

#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Open(#[from] device::OpenPortError),
    #[error(transparent)]
    Serial(#[from] ttyloop_lib::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Event {
    Data(SerialData),
    Pin(PinChange),
}

pub async fn run(args: WatchOpt) -> Result<ExitCode, WatchError> {
    let mut term = Term::stdout();

    let serial = device::open(&mut term, &args.port)?;
    writeln!(term, "{}", style("Watching, press any key to stop").dim())?;

    let (tx, mut rx) = mpsc::unbounded_channel();

    let _data = serial.on_data_received({
        let tx = tx.clone();
        move |data| { let _ = tx.send(Event::Data(data)); }
    })?;

    let _pins = serial.on_pin_changed(move |change| {
        let _ = tx.send(Event::Pin(change));
    })?;

    let mut key = tokio::task::spawn_blocking({
        let term = term.clone();
        move || term.read_key()
    });

    loop {
        tokio::select! {
            _ = &mut key => break,
            event = rx.recv() => match event {
                Some(event) => report(&mut term, &serial, event)?,
                None => break,
            },
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn report(term: &mut Term, serial: &SerialStream<TtyDevice>, event: Event) -> Result<(), WatchError> {
    match event {
        Event::Data(SerialData::Chars) => {
            writeln!(term, "{} {} bytes buffered",
                style("data").cyan(),
                serial.bytes_to_read()?)?;
        }
        Event::Data(SerialData::Eof) => {
            writeln!(term, "{} end of stream", style("data").cyan())?;
        }
        Event::Pin(change) => {
            writeln!(term, "{} {change} (CTS={} DSR={} CD={})",
                style("pin").yellow(),
                level(serial.cts_holding()?),
                level(serial.dsr_holding()?),
                level(serial.cd_holding()?))?;
        }
    }

    Ok(())
}

fn level(high: bool) -> u8 {
    u8::from(high)
}
