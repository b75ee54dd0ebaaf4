use std::path::PathBuf;

use crate::logging::LogArgs;

/// Command-line arguments for the server binary. Flag names and shorthands mirror the original
/// transport's `server.cpp`; `--log.level`/`--log.format` and `--verbose` are additions from the
/// ambient logging stack.
#[derive(Debug, clap::Parser)]
#[command(name = "dicl-server", version, about = "Remote page-cache server")]
pub struct Args {
    /// TCP port the bootstrap listener binds to.
    #[arg(short = 't', long = "tcp-port")]
    pub tcp_port: u16,

    /// RDMA device port to use.
    #[arg(short = 'i', long = "ib-port", default_value_t = 1)]
    pub ib_port: u8,

    /// Mount point holding the persistent log and index pools (and, in non-RDMA mode, the
    /// fallback data path).
    #[arg(short = 'p', long = "path")]
    pub path: PathBuf,

    /// Enable RDMA transport. Without this flag the server still starts its persistence layer
    /// but does not bring up a provider (useful for index/log-only testing).
    #[arg(short = 'r', long = "rdma", default_value_t = false)]
    pub rdma: bool,

    /// Shorthand for `--log.level=debug`.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    pub verbose: bool,

    #[command(flatten)]
    pub log: LogArgs,
}

impl Args {
    pub fn effective_log_level(&self) -> crate::logging::LogLevel {
        if self.verbose {
            crate::logging::LogLevel::Debug
        } else {
            self.log.level
        }
    }
}
