use clap::{self, Args};

use apktrail::pipeline::PackageRequest;
use apktrail::{Context, SessionId};

use crate::printer::{print_report, PrintMonitor};
use crate::utils::{get_runtime, parse_metadata, task_canceller, write_json};

#[derive(Args)]
pub struct Analyze {
    /// Package name, such as `com.example.app`
    package: String,

    /// First scan date to consider, `YYYY-MM-DD`
    #[arg(short = 'S', long)]
    start: String,

    /// Last scan date to consider, `YYYY-MM-DD`
    #[arg(short = 'E', long)]
    end: String,

    /// How many builds to sample, capped by `processing.max_versions`
    #[arg(short = 'n', long)]
    versions: Option<usize>,

    /// Session id to run under, generated if not given
    #[arg(long)]
    session: Option<String>,

    /// Download credential, overrides the configured key
    #[arg(long)]
    api_key: Option<String>,

    /// `key=value` pairs stored with the session
    #[arg(short = 'm', long = "meta")]
    metadata: Vec<String>,

    #[arg(
        short,
        long,
        help = "Print the report as JSON",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    json: bool,

    #[arg(
        short,
        long,
        help = "Don't print progress",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    quiet: bool,
}

impl Analyze {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let (settings, rt) = get_runtime(ctx)?;
        let credential = match &self.api_key {
            Some(v) => v.clone(),
            None => settings.api_key(ctx)?,
        };

        let req = PackageRequest {
            session: self
                .session
                .as_deref()
                .map_or_else(SessionId::generate, SessionId::from),
            package: self.package.clone(),
            start_date: self.start.clone(),
            end_date: self.end.clone(),
            desired_versions: self.versions,
            credential,
            metadata: parse_metadata(&self.metadata)?,
        };

        let (_signals, check) = task_canceller()?;
        let monitor = PrintMonitor::new(self.quiet);
        let res = rt.analyze_package(&req, &check, &monitor);
        rt.shutdown();
        let report = res?;

        if self.json {
            write_json(&report)
        } else {
            print_report(&report);
            Ok(())
        }
    }
}
