use std::borrow::Cow;
use std::path::PathBuf;

use anyhow::Context as AnyhowContext;
use clap::{Parser, Subcommand};
use flexi_logger::{FileSpec, LevelFilter, LogSpecification, Logger, LoggerHandle, WriteMode};

use apktrail::utils::ensure_dir_exists;
use apktrail::{Context, DefaultContext};

mod analyze;
use analyze::Analyze;

mod cache;
use cache::Cache;

mod fetch;
use fetch::Fetch;

mod index;
use index::Index;

mod local;
use local::Local;

mod printer;

mod strings;
use strings::Strings;

mod utils;

const SIMPLE_VERSION_STRING: &str = include!(concat!(env!("OUT_DIR"), "/simple_version_string"));
const VERSION_STRING: &str = include!(concat!(env!("OUT_DIR"), "/version_string"));

#[derive(Parser)]
#[command(name = "apktrail")]
#[command(version(SIMPLE_VERSION_STRING))]
#[command(long_version(VERSION_STRING))]
struct Cli {
    /// `-e`, `--log-stderr`: log to `stderr` instead of a file
    #[arg(short = 'e', long, help = "Log to stderr instead of a file", action = clap::ArgAction::SetTrue, default_value_t = false)]
    log_stderr: bool,

    /// `-f`, `--log-file`: log file location, defaults to
    /// `$APKTRAIL_HOME/apktrail_out/log`
    #[arg(short = 'f', long, help = "Send log output to the given file")]
    log_file: Option<PathBuf>,

    /// `-s`, `--log-spec`: a raw [flexi_logger](https://docs.rs/flexi_logger/latest/flexi_logger/struct.LogSpecification.html) spec
    #[arg(short = 's', long, help = "Log spec for flexi_logger")]
    log_spec: Option<String>,

    /// `-l`, `--log-level`: log verbosity
    ///
    /// | Value | Log Level |
    /// | ----- | --------- |
    /// | **0** | **Warn** |
    /// | 1 | Info |
    /// | 2 | Debug |
    /// | 3 | Trace |
    #[arg(
        short = 'l',
        long,
        help = "Set the log level, 0 = warn, 1 = info, etc",
        long_help = None,
        default_value_t = 0
    )]
    log_level: u8,

    /// `-c`, `--config`: use this file instead of `$APKTRAIL_HOME/apktrail.toml`
    #[arg(short = 'c', long, help = "Read settings from the given file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the full version string and exit
    #[command()]
    Version,

    /// Fetch and analyze the indexed builds of a package
    #[command()]
    Analyze(Analyze),

    /// Analyze APK files that are already on disk
    #[command()]
    Local(Local),

    /// Dump the decoded strings or indicators of a single APK
    #[command()]
    Strings(Strings),

    /// Download a single artifact into the cache
    #[command()]
    Fetch(Fetch),

    /// Manage the index of known builds
    #[command()]
    Index(Index),

    /// Maintain the artifact cache
    #[command()]
    Cache(Cache),
}

impl Cli {
    fn configure_loggers(&self, ctx: &dyn Context) -> anyhow::Result<LoggerHandle> {
        let log_spec = match &self.log_spec {
            Some(s) => {
                LogSpecification::parse(s).with_context(|| format!("parsing log spec {}", s))?
            }
            None => {
                if self.log_level > 0 {
                    let lvl = match self.log_level {
                        1 => LevelFilter::Info,
                        2 => LevelFilter::Debug,
                        _ => LevelFilter::Trace,
                    };
                    LogSpecification::builder()
                        .module("apktrail", lvl)
                        .module("apktrail_cli", lvl)
                        .build()
                } else {
                    LogSpecification::env_or_parse("warn")
                        .with_context(|| "getting log spec from env")?
                }
            }
        };

        let mut logger = Logger::with(log_spec);

        if !self.log_stderr {
            let path = match &self.log_file {
                Some(v) if v.is_absolute() => Some(Cow::Borrowed(v)),
                Some(v) => Some(Cow::Owned(std::env::current_dir()?.join(v))),
                None => ctx.get_output_dir_child("log").map(Cow::Owned).ok(),
            };

            if let Some(p) = &path {
                if let Some(parent) = p.parent() {
                    ensure_dir_exists(parent)
                        .with_context(|| format!("creating log directory {}", parent.display()))?;
                }
                logger = logger
                    .log_to_file(
                        FileSpec::try_from(p.as_ref()).with_context(|| "creating filespec")?,
                    )
                    .append()
                    .write_mode(WriteMode::BufferAndFlush);
            }
        }

        logger.start().with_context(|| "starting logger")
    }

    fn context(&self) -> DefaultContext {
        match &self.config {
            Some(path) => DefaultContext::with_config_file(path.clone()),
            None => DefaultContext::new(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = &cli.command {
        println!("{}", VERSION_STRING);
        return Ok(());
    }

    let ctx = cli.context();

    let log_handle = cli.configure_loggers(&ctx)?;

    let res = match &cli.command {
        Commands::Analyze(c) => c.run(&ctx),
        Commands::Local(c) => c.run(&ctx),
        Commands::Strings(c) => c.run(&ctx),
        Commands::Fetch(c) => c.run(&ctx),
        Commands::Index(c) => c.run(&ctx),
        Commands::Cache(c) => c.run(&ctx),

        Commands::Version => unreachable!(),
    };

    if let Err(e) = &res {
        log::error!("{:#}", e);
    }
    log_handle.flush();
    res
}
