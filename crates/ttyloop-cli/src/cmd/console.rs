use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use console::{Term, style};
use structopt::StructOpt;
use terminal::KeyReader;
use thiserror::Error;
use ttyloop_lib::{CancellationToken, SerialStream, TtyDevice};

use crate::device::{self, PortOpt};

mod terminal;

#[derive(StructOpt)]
pub struct ConsoleOpt {
    #[structopt(flatten)]
    port: PortOpt,
}

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error(transparent)]
    Open(#[from] device::OpenPortError),
    #[error(transparent)]
    Serial(#[from] ttyloop_lib::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub async fn run(args: ConsoleOpt) -> Result<ExitCode, ConsoleError> {
    let mut term = Term::stdout();

    let serial = Arc::new(device::open(&mut term, &args.port)?);
    writeln!(term, "{}", style("Press Ctrl-] to exit").dim())?;

    let cancel = CancellationToken::new();
    let output = tokio::spawn({
        let serial = serial.clone();
        let cancel = cancel.clone();
        async move { copy_output(&serial, &cancel).await }
    });

    let mut keys = KeyReader::new(term);

    // send initial newline to get prompt to show:
    serial.write_async(b"\r", &cancel).await?;

    let result = copy_input(&serial, &mut keys, &cancel).await;

    cancel.cancel();
    let output = output.await.map_err(io::Error::other)?;
    serial.close();

    result?;
    output?;

    Ok(ExitCode::SUCCESS)
}

async fn copy_input(
    serial: &SerialStream<TtyDevice>,
    keys: &mut KeyReader,
    cancel: &CancellationToken,
) -> Result<(), ConsoleError> {
    while let Some(key) = keys.next().await {
        let bytes = key?;

        if bytes == [terminal::ESCAPE] {
            break;
        }

        serial.write_async(&bytes, cancel).await?;
    }

    Ok(())
}

async fn copy_output(
    serial: &SerialStream<TtyDevice>,
    cancel: &CancellationToken,
) -> Result<(), ConsoleError> {
    let mut buf = [0u8; 256];
    let mut stdout = io::stdout();

    loop {
        match serial.read_async(&mut buf, cancel).await {
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
            Err(ttyloop_lib::Error::Canceled) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
    }
}
