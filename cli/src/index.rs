use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::Context as AnyhowContext;
use clap::{self, Args, Subcommand};

use apktrail::db::ApkIndex;
use apktrail::pipeline::{end_of_day, open_index};
use apktrail::Context;

use crate::utils::write_json;

#[derive(Args)]
pub struct Index {
    #[command(subcommand)]
    command: IndexCommand,
}

#[derive(Subcommand)]
enum IndexCommand {
    /// Import a CSV listing of builds, use `-` for stdin
    #[command()]
    Import(Import),

    /// Print the number of indexed builds
    #[command()]
    Count,

    /// List the builds of a package scanned within a date range
    #[command()]
    Find(Find),
}

#[derive(Args)]
struct Import {
    /// CSV with at least `sha256` and `pkg_name` columns
    csv: PathBuf,
}

#[derive(Args)]
struct Find {
    package: String,

    /// `YYYY-MM-DD`
    #[arg(short = 'S', long)]
    start: String,

    /// `YYYY-MM-DD`
    #[arg(short = 'E', long)]
    end: String,

    #[arg(
        short,
        long,
        help = "Print as JSON",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    json: bool,
}

impl Index {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let settings = ctx.get_settings()?;
        let pool = open_index(ctx, &settings)?;
        let index = ApkIndex::new(&pool);

        let res = match &self.command {
            IndexCommand::Import(c) => c.run(&index),
            IndexCommand::Count => {
                println!("{}", index.count()?);
                Ok(())
            }
            IndexCommand::Find(c) => c.run(&index),
        };
        pool.shutdown_all();
        res
    }
}

impl Import {
    fn run(&self, index: &ApkIndex) -> anyhow::Result<()> {
        let stats = if self.csv.as_os_str() == "-" {
            index.import_csv(io::stdin().lock())?
        } else {
            let f = File::open(&self.csv)
                .with_context(|| format!("opening {}", self.csv.display()))?;
            index.import_csv(BufReader::new(f))?
        };
        println!(
            "{} rows read, {} added, {} unusable",
            stats.rows, stats.inserted, stats.skipped
        );
        Ok(())
    }
}

impl Find {
    fn run(&self, index: &ApkIndex) -> anyhow::Result<()> {
        let start = end_of_day(&self.start)?;
        let end = end_of_day(&self.end)?;
        let found = index.find_versions(&self.package, &start, &end)?;
        if self.json {
            return write_json(&found);
        }
        for rec in found {
            println!("{} {} {}", rec.vercode, rec.sha256, rec.vt_scan_date);
        }
        Ok(())
    }
}
