use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use console::{Term, style};
use structopt::StructOpt;
use thiserror::Error;
use ttyloop_lib::CancellationToken;

use crate::device::{self, PortOpt};

#[derive(StructOpt)]
pub struct SendOpt {
    #[structopt(flatten)]
    port: PortOpt,
    /// Text to send
    #[structopt(long, short)]
    data: String,
    /// Give up if the write hasn't gone out after this long
    #[structopt(long, default_value = "1000")]
    timeout_ms: u64,
    /// Send the text as is, without a trailing CR LF
    #[structopt(long)]
    no_newline: bool,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error(transparent)]
    Open(#[from] device::OpenPortError),
    #[error("writing to serial port: {0}")]
    Serial(#[from] ttyloop_lib::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub async fn run(args: SendOpt) -> Result<ExitCode, SendError> {
    let mut term = Term::stdout();

    let serial = device::open(&mut term, &args.port)?;

    let mut line = args.data.into_bytes();
    if !args.no_newline {
        line.extend_from_slice(b"\r\n");
    }

    let deadline = CancellationToken::with_timeout(Duration::from_millis(args.timeout_ms));
    serial.write_async(&line, &deadline).await?;
    serial.flush()?;

    writeln!(term, "Sent {} bytes", style(line.len()).bold())?;
    Ok(ExitCode::SUCCESS)
}
