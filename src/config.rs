use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::proxy::RELAY_TIMEOUT;
use crate::rules::RoutingMode;

/// Expose a UNIX-socket HTTP API through an allowlist of METHOD~path rules.
#[derive(Debug, Parser)]
#[command(name = "veil", version)]
pub struct Cli {
    /// Existing socket to protect
    pub target_socket: PathBuf,

    /// Socket to create for callers (an existing file there is replaced)
    pub exposed_socket: PathBuf,

    /// File with one METHOD~path rule per line
    pub access_rules: PathBuf,

    /// How requests without a matching rule are answered
    #[arg(long, value_enum, default_value_t = RoutingMode::Method)]
    pub routing: RoutingMode,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub target_socket: PathBuf,
    pub exposed_socket: PathBuf,
    pub rules_file: PathBuf,
    pub routing: RoutingMode,
    pub relay_timeout: Duration,
}

impl Config {
    /// Parses the process arguments.
    ///
    /// The error also covers `-h`; callers print it and exit non-zero.
    pub fn load() -> Result<Self, clap::Error> {
        Self::parse_from(std::env::args_os())
    }

    pub fn parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(args).map(Self::from)
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            target_socket: cli.target_socket,
            exposed_socket: cli.exposed_socket,
            rules_file: cli.access_rules,
            routing: cli.routing,
            relay_timeout: RELAY_TIMEOUT,
        }
    }
}
