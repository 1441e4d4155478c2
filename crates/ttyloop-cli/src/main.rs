use std::process::ExitCode;

use console::{Term, style};
use log::LevelFilter;
use structopt::StructOpt;
use thiserror::Error;

mod cmd;
mod device;

#[derive(StructOpt)]
pub struct Opt {
    #[structopt(subcommand)]
    cmd: Cmd,
}

#[derive(StructOpt)]
pub enum Cmd {
    /// List serial ports
    List,
    /// Interactive terminal, Ctrl-] exits
    Console(cmd::console::ConsoleOpt),
    /// Print data and modem line notifications until a key is pressed
    Watch(cmd::watch::WatchOpt),
    /// Write a line to a serial port
    Send(cmd::send::SendOpt),
}

#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    List(#[from] cmd::list::ListError),
    #[error(transparent)]
    Console(#[from] cmd::console::ConsoleError),
    #[error(transparent)]
    Watch(#[from] cmd::watch::WatchError),
    #[error(transparent)]
    Send(#[from] cmd::send::SendError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let opt = Opt::from_args();

    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .filter(Some("serialport"), LevelFilter::Warn)
        .parse_default_env()
        .init();

    match run(opt).await {
        Ok(code) => code,
        Err(error) => {
            let term = Term::stdout();
            let _ = term.write_line(&format!("{} {}",
                style("error:").red().bold(),
                style(&format!("{error}")).bold()));

            ExitCode::FAILURE
        }
    }
}

async fn run(opt: Opt) -> Result<ExitCode, RunError> {
    match opt.cmd {
        Cmd::List => Ok(cmd::list::run()?),
        Cmd::Console(args) => Ok(cmd::console::run(args).await?),
        Cmd::Watch(args) => Ok(cmd::watch::run(args).await?),
        Cmd::Send(args) => Ok(cmd::send::run(args).await?),
    }
}
