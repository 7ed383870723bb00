use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chanprims_session::SessionConfig;
use clap::{Args, Subcommand};

use crate::exit::{io_error, session_error, CliResult};
use crate::output::OutputFormat;

pub mod negotiate;
pub mod run;
pub mod stress;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay a sequence of channel operations against one connection.
    Run(RunArgs),
    /// Allocate channels from many threads and check for duplicates.
    Stress(StressArgs),
    /// Show the channel limit two peers would agree on.
    Negotiate(NegotiateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, format),
        Command::Stress(args) => stress::run(args, format),
        Command::Negotiate(args) => negotiate::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Connection settings shared by commands that build a session manager.
#[derive(Args, Debug)]
pub struct ConnectionArgs {
    /// Channel limit for the connection (0 = no limit). Overrides --config.
    #[arg(long, env = "CHANPRIMS_CHANNEL_MAX")]
    pub channel_max: Option<u16>,
    /// Channels to hold for protocol use (comma-separated). Overrides --config.
    #[arg(long, value_delimiter = ',')]
    pub reserve: Option<Vec<u16>>,
    /// JSON session config file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl ConnectionArgs {
    /// Build the session config: file first, then flag overrides.
    pub fn session_config(&self) -> CliResult<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|err| io_error(&format!("read {}", path.display()), err))?;
                SessionConfig::from_json(&bytes)
                    .map_err(|err| session_error("invalid config", err))?
            }
            None => SessionConfig::default(),
        };

        if let Some(channel_max) = self.channel_max {
            config.channel_max = channel_max;
        }
        if let Some(reserve) = &self.reserve {
            config.reserved_channels = reserve.clone();
        }
        Ok(config)
    }
}

/// One scripted channel operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Open a session on the lowest free channel.
    Next,
    /// Open a session on an explicit channel.
    Take(i64),
    /// Close the session on a channel; unknown channels are ignored.
    Release(i64),
    /// Close a session on a channel; unknown channels are an error.
    Close(i64),
    /// Close every session.
    CloseAll,
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "next" => return Ok(Op::Next),
            "close-all" => return Ok(Op::CloseAll),
            _ => {}
        }

        let (name, arg) = s
            .split_once(':')
            .ok_or_else(|| format!("unknown operation '{s}'"))?;
        let channel: i64 = arg
            .parse()
            .map_err(|_| format!("invalid channel '{arg}' in '{s}'"))?;

        match name {
            "take" => Ok(Op::Take(channel)),
            "release" => Ok(Op::Release(channel)),
            "close" => Ok(Op::Close(channel)),
            _ => Err(format!("unknown operation '{name}'")),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Next => write!(f, "next"),
            Op::Take(channel) => write!(f, "take:{channel}"),
            Op::Release(channel) => write!(f, "release:{channel}"),
            Op::Close(channel) => write!(f, "close:{channel}"),
            Op::CloseAll => write!(f, "close-all"),
        }
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,
    /// Stop at the first failing operation.
    #[arg(long)]
    pub strict: bool,
    /// Operations: next, take:<n>, release:<n>, close:<n>, close-all.
    #[arg(required = true, value_name = "OP")]
    pub ops: Vec<Op>,
}

#[derive(Args, Debug)]
pub struct StressArgs {
    #[command(flatten)]
    pub connection: ConnectionArgs,
    /// Number of concurrent threads.
    #[arg(long, default_value = "8")]
    pub threads: usize,
    /// Channels each thread opens.
    #[arg(long, default_value = "64")]
    pub per_thread: usize,
    /// Close and reopen every channel once after the first pass.
    #[arg(long)]
    pub churn: bool,
}

#[derive(Args, Debug)]
pub struct NegotiateArgs {
    /// Client's proposed channel limit (0 = no limit).
    #[arg(long)]
    pub client: u16,
    /// Server's proposed channel limit (0 = no limit).
    #[arg(long)]
    pub server: u16,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
