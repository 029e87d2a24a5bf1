use std::path::PathBuf;

use anyhow::bail;
use clap::{self, Args};

use apktrail::{Context, SessionId};

use crate::printer::{print_report, PrintMonitor};
use crate::utils::{get_runtime, parse_metadata, task_canceller, write_json};

#[derive(Args)]
pub struct Local {
    /// APK files, analyzed and reported in the given order
    #[arg(required = true)]
    paths: Vec<PathBuf>,

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

impl Local {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        for p in &self.paths {
            if !p.is_file() {
                bail!("{} is not a file", p.display());
            }
        }
        let (_, rt) = get_runtime(ctx)?;
        let (_signals, check) = task_canceller()?;
        let monitor = PrintMonitor::new(self.quiet);

        let res = rt.analyze_local(
            &SessionId::generate(),
            parse_metadata(&self.metadata)?,
            &self.paths,
            &check,
            &monitor,
        );
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
