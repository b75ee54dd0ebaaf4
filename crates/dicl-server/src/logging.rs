//! Structured logging setup, modeled on the shared `flow_cli_common::init_logging` helper this
//! server's dependency tree otherwise relies on directly: a `LogArgs` clap group with
//! `--log.level`/`--log.format`, defaulting to JSON off a terminal and colored text on one.

#[derive(Debug, clap::Args)]
pub struct LogArgs {
    /// Log verbosity: trace|debug|info|warn|error.
    #[arg(long = "log.level", default_value_t = LogLevel::Info, ignore_case = true, value_enum, global = true)]
    pub level: LogLevel,

    /// Log output format. Defaults to color on a terminal, json otherwise.
    #[arg(long = "log.format", value_enum, global = true)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
    Color,
}

fn default_format() -> LogFormat {
    if atty::is(atty::Stream::Stderr) {
        LogFormat::Color
    } else {
        LogFormat::Json
    }
}

/// Initializes the global `tracing` subscriber. Panics if called more than once.
pub fn init_logging(args: &LogArgs) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(args.level.to_string())
        .with_thread_ids(false)
        .with_target(false);

    match args.format.unwrap_or_else(default_format) {
        LogFormat::Json => {
            builder.json().flatten_event(true).init();
        }
        LogFormat::Text => {
            builder.compact().with_ansi(false).init();
        }
        LogFormat::Color => {
            builder.compact().with_ansi(true).init();
        }
    }
}
