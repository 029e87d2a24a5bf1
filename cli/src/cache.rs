use std::time::Duration;

use anyhow::bail;
use clap::{self, Args, Subcommand};

use apktrail::archive::validate_cache;
use apktrail::cache::STALE_STAGING_AGE;
use apktrail::{Context, ContentCache};

#[derive(Args)]
pub struct Cache {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Move cached archives that fail to open into the quarantine directory
    #[command()]
    Validate,

    /// Check that cached artifacts still hash to their names
    #[command()]
    Verify(Verify),

    /// Delete leftovers from interrupted downloads
    #[command()]
    Clean(Clean),
}

#[derive(Args)]
struct Clean {
    /// Only delete files last written at least this many seconds ago
    #[arg(long)]
    older_than: Option<u64>,
}

#[derive(Args)]
struct Verify {
    /// Hashes to check
    #[arg(required = true)]
    hashes: Vec<String>,
}

impl Cache {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        let cache = ContentCache::new(ctx.get_apk_cache_dir()?);
        match &self.command {
            CacheCommand::Validate => {
                let report = validate_cache(cache.dir(), &ctx.get_quarantine_dir()?)?;
                for p in &report.quarantined {
                    println!("quarantined {}", p.display());
                }
                println!(
                    "{} checked, {} quarantined",
                    report.checked,
                    report.quarantined.len()
                );
            }
            CacheCommand::Verify(c) => c.run(&cache)?,
            CacheCommand::Clean(c) => {
                let min_age = c
                    .older_than
                    .map(Duration::from_secs)
                    .unwrap_or(STALE_STAGING_AGE);
                println!("removed {} partial downloads", cache.clean_staging(min_age)?);
            }
        }
        Ok(())
    }
}

impl Verify {
    fn run(&self, cache: &ContentCache) -> anyhow::Result<()> {
        let mut bad = 0;
        for hash in &self.hashes {
            if !cache.contains(hash) {
                println!("{} missing", hash);
                bad += 1;
            } else if cache.verify(hash)? {
                println!("{} ok", hash);
            } else {
                println!("{} MISMATCH", hash);
                bad += 1;
            }
        }
        if bad > 0 {
            bail!("{} of {} artifacts missing or corrupt", bad, self.hashes.len());
        }
        Ok(())
    }
}
