use itertools::Itertools;

use apktrail::download::DownloadEvent;
use apktrail::pipeline::{Event, Report, VersionReport};
use apktrail::tasks::EventMonitor;

/// Writes session progress to stderr so reports on stdout stay parseable
pub struct PrintMonitor {
    pub quiet: bool,
}

impl PrintMonitor {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl EventMonitor<Event> for PrintMonitor {
    fn on_event(&self, event: Event) {
        if let Event::Download(DownloadEvent::Attempt { hash, cycle, attempt }) = &event {
            log::trace!("{} cycle {} attempt {}", hash, cycle, attempt);
        }
        if self.quiet {
            return;
        }
        match event {
            Event::SessionStarted { session } => eprintln!("session {}", session),
            Event::VersionsSelected {
                package,
                found,
                selected,
            } => eprintln!("{}: {} builds indexed, analyzing {}", package, found, selected),
            Event::Download(DownloadEvent::CacheHit { hash }) => eprintln!("cached    {}", hash),
            Event::Download(DownloadEvent::Stored { hash, bytes }) => {
                eprintln!("fetched   {} ({} bytes)", hash, bytes)
            }
            Event::Download(DownloadEvent::AttemptFailed { hash, reason }) => {
                log::debug!("attempt for {} failed: {}", hash, reason)
            }
            Event::Download(DownloadEvent::BackingOff { hash, delay }) => {
                eprintln!("waiting {:?} before retrying {}", delay, hash)
            }
            Event::Download(_) => {}
            Event::FetchFailed { sha256, reason } => eprintln!("failed    {}: {}", sha256, reason),
            Event::Decoding { path } => log::debug!("decoding {}", path.display()),
            Event::Decoded {
                path,
                strings,
                indicators,
            } => eprintln!(
                "decoded   {} ({} strings, {} indicators)",
                path.display(),
                strings,
                indicators
            ),
            Event::DecodeFailed { path, reason } => {
                eprintln!("unusable  {}: {}", path.display(), reason)
            }
            Event::Quarantined { from, to } => {
                eprintln!("moved {} to {}", from.display(), to.display())
            }
            Event::SessionFinished { session, ok } => {
                eprintln!("session {} {}", session, if ok { "done" } else { "failed" })
            }
        }
    }
}

fn print_version(version: &VersionReport) {
    let sha = version.sha256.as_deref().unwrap_or("-");
    let date = version.scan_date.as_deref().unwrap_or("-");
    println!("{} {} {}", version.label, sha, date);
    if version.skipped_images > 0 {
        println!("  ({} unreadable bytecode images)", version.skipped_images);
    }

    for (domain, group) in &version
        .indicators
        .iter()
        .sorted_by(|a, b| a.indicator.domain.cmp(&b.indicator.domain))
        .chunk_by(|it| it.indicator.domain.clone())
    {
        let group = group.collect::<Vec<_>>();
        let labels = group
            .iter()
            .filter_map(|it| it.label.as_deref())
            .unique()
            .join(", ");
        if labels.is_empty() {
            println!("  {}", domain);
        } else {
            println!("  {} [{}]", domain, labels);
        }
        for it in group {
            println!("    {}", it.indicator.url);
        }
    }
}

pub fn print_report(report: &Report) {
    match &report.package {
        Some(pkg) => println!(
            "{}: {} of {} builds analyzed",
            pkg,
            report.versions.len(),
            report.candidates
        ),
        None => println!("{} of {} files analyzed", report.versions.len(), report.candidates),
    }

    for version in &report.versions {
        print_version(version);
    }

    if !report.failed.is_empty() {
        println!("failed:");
        for it in &report.failed {
            let sha = it.sha256.as_deref().unwrap_or("-");
            match &it.quarantined {
                Some(to) => println!("  {} {} {} (moved to {})", it.label, sha, it.reason, to.display()),
                None => println!("  {} {} {}", it.label, sha, it.reason),
            }
        }
    }
}
