use anyhow::bail;
use clap::{self, Args};

use apktrail::download::{DownloadEvent, HttpArtifactSource};
use apktrail::pipeline::open_index;
use apktrail::tasks::FnMonitor;
use apktrail::utils::is_sha256_hex;
use apktrail::{Context, Downloader, FetchTask};

use crate::utils::task_canceller;

#[derive(Args)]
pub struct Fetch {
    /// SHA-256 of the artifact
    sha256: String,

    /// Download credential, overrides the configured key
    #[arg(long)]
    api_key: Option<String>,

    #[arg(
        short,
        long,
        help = "Don't print progress",
        action = clap::ArgAction::SetTrue,
        default_value_t = false,
    )]
    quiet: bool,
}

impl Fetch {
    pub fn run(&self, ctx: &dyn Context) -> anyhow::Result<()> {
        if !is_sha256_hex(&self.sha256) {
            bail!("{} is not a SHA-256 hex digest", self.sha256);
        }
        let hash = self.sha256.to_ascii_lowercase();

        let settings = ctx.get_settings()?;
        let credential = match &self.api_key {
            Some(v) => v.clone(),
            None => settings.api_key(ctx)?,
        };

        let pool = open_index(ctx, &settings)?;
        let known = apktrail::db::ApkIndex::new(&pool).get(&hash)?;
        pool.shutdown_all();
        let (package_name, version_label, scan_timestamp) = match known {
            Some(rec) => (rec.pkg_name, rec.vercode, rec.vt_scan_date),
            None => {
                log::info!("{} is not in the index", hash);
                Default::default()
            }
        };

        let source =
            HttpArtifactSource::new(&settings.download_endpoint, settings.download.request_timeout)?;
        let downloader = Downloader::new(source, settings.download.downloader_options());
        let task = FetchTask {
            content_hash: hash,
            package_name,
            version_label,
            scan_timestamp,
            credential,
            destination: ctx.get_apk_cache_dir()?,
            max_attempts_per_cycle: settings.download.max_attempts,
            cycles: settings.download.cycles,
        };

        let quiet = self.quiet;
        let monitor = FnMonitor(move |evt: DownloadEvent| {
            if quiet {
                return;
            }
            match evt {
                DownloadEvent::Attempt {
                    cycle, attempt, ..
                } => eprintln!("cycle {} attempt {}", cycle + 1, attempt + 1),
                DownloadEvent::AttemptFailed { reason, .. } => eprintln!("  {}", reason),
                DownloadEvent::BackingOff { delay, .. } => eprintln!("waiting {:?}", delay),
                _ => {}
            }
        });

        let (_signals, check) = task_canceller()?;
        let path = downloader.fetch(&task, &check, &monitor)?;
        println!("{}", path.display());
        Ok(())
    }
}
