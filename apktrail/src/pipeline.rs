//! Session level orchestration.
//!
//! A session is admitted, its candidate builds are looked up in the index,
//! fetched strictly one at a time on a helper thread, and decoded on a fixed
//! pool of workers that each take one artifact from start to finish.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use crossbeam::thread;
use once_cell::sync::Lazy;
use rayon::{ThreadPool, ThreadPoolBuilder};
use regex::Regex;
use serde::Serialize;

use crate::admission::{AdmissionController, SessionId, SessionMetadata};
use crate::archive::quarantine_file;
use crate::config::Settings;
use crate::db::{ApkIndex, ApkRecord, SqliteConnector};
use crate::download::{
    ArtifactSource, DownloadEvent, Downloader, FetchError, FetchTask, HttpArtifactSource,
};
use crate::extract::{extract_indicators, Highlighter, Indicator};
use crate::manifest::{ArtifactManifest, ManifestEntry};
use crate::pool::ConnectionPool;
use crate::strings::{string_source, SourceError, StringSource};
use crate::tasks::{
    cancelable_recv, cancelable_send, CancelCheck, CancellationRegistry, EventMonitor, FnMonitor,
    WorkerId,
};
use crate::utils::{ensure_dir_exists, path_label};
use crate::{Context, Error, Result};

pub const INDEX_FILE_NAME: &str = "apk_index.sqlite";

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("valid date regex"));

/// Turn a `YYYY-MM-DD` date into the last instant of that day in the
/// index's timestamp format
pub fn end_of_day(date: &str) -> Result<String> {
    let date = date.trim();
    let invalid = || Error::Generic(format!("invalid date {date:?}, expected YYYY-MM-DD"));
    let caps = DATE_RE.captures(date).ok_or_else(invalid)?;
    let month: u32 = caps[2].parse().map_err(|_| invalid())?;
    let day: u32 = caps[3].parse().map_err(|_| invalid())?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return Err(invalid());
    }
    Ok(format!("{date} 23:59:59.999999"))
}

/// Open the build index named by `settings`, or the project default, and
/// pool connections to it
pub fn open_index(
    ctx: &dyn Context,
    settings: &Settings,
) -> Result<ConnectionPool<SqliteConnector>> {
    let db_path = match &settings.database.path {
        Some(v) => v.clone(),
        None => ctx.get_sqlite_dir()?.join(INDEX_FILE_NAME),
    };
    let connector = SqliteConnector::open(&db_path, settings.database.busy_timeout_ms)?;
    Ok(ConnectionPool::new(connector, settings.database.max_connections))
}

/// Pick at most roughly `desired` builds from `records`, which must be
/// oldest first.
///
/// The newest build is always kept. The older ones are sampled at an even
/// stride starting from the oldest, so the result can run a little over
/// `desired` when the stride doesn't divide evenly.
pub fn select_versions<T: Clone>(records: &[T], desired: usize) -> Vec<T> {
    let Some((latest, older)) = records.split_last() else {
        return Vec::new();
    };
    if desired <= 1 {
        return vec![latest.clone()];
    }
    let step = usize::max(1, older.len() / (desired - 1));
    let mut picked = older.iter().step_by(step).cloned().collect::<Vec<T>>();
    picked.push(latest.clone());
    picked
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Decode workers
    pub worker_threads: usize,
    /// Upper bound on versions analyzed per package
    pub max_versions: usize,
    pub max_attempts_per_cycle: u32,
    pub cycles: u32,
}

impl Options {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worker_threads: settings.processing.effective_workers(),
            max_versions: settings.processing.max_versions,
            max_attempts_per_cycle: settings.download.max_attempts,
            cycles: settings.download.cycles,
        }
    }
}

/// Progress of a session
#[derive(Debug, Clone)]
pub enum Event {
    SessionStarted { session: SessionId },
    VersionsSelected { package: String, found: usize, selected: usize },
    Download(DownloadEvent),
    FetchFailed { sha256: String, reason: String },
    Decoding { path: PathBuf },
    Decoded { path: PathBuf, strings: usize, indicators: usize },
    DecodeFailed { path: PathBuf, reason: String },
    Quarantined { from: PathBuf, to: PathBuf },
    SessionFinished { session: SessionId, ok: bool },
}

/// An indicator and the highlight label it matched, if any
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    #[serde(flatten)]
    pub indicator: Indicator,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionReport {
    /// Version code for indexed builds, file stem for local files
    pub label: String,
    pub sha256: Option<String>,
    pub scan_date: Option<String>,
    pub path: PathBuf,
    pub strings: usize,
    pub skipped_images: usize,
    pub indicators: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedArtifact {
    pub label: String,
    pub sha256: Option<String>,
    pub reason: String,
    /// Where the artifact went if it was moved out of the cache
    pub quarantined: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub session: SessionId,
    pub package: Option<String>,
    /// Builds known before selection
    pub candidates: usize,
    /// Successful versions, oldest first
    pub versions: Vec<VersionReport>,
    pub failed: Vec<FailedArtifact>,
}

impl Report {
    fn new(session: &SessionId, package: Option<&str>, candidates: usize) -> Self {
        Self {
            session: session.clone(),
            package: package.map(String::from),
            candidates,
            versions: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// One package analysis
#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub session: SessionId,
    pub package: String,
    /// `YYYY-MM-DD`, inclusive
    pub start_date: String,
    /// `YYYY-MM-DD`, inclusive
    pub end_date: String,
    /// Capped by [Options::max_versions]
    pub desired_versions: Option<usize>,
    pub credential: String,
    pub metadata: SessionMetadata,
}

struct Job {
    index: usize,
    label: String,
    sha256: Option<String>,
    scan_date: Option<String>,
    path: PathBuf,
    /// Move the file aside if it turns out to be corrupt
    quarantine: bool,
}

impl Job {
    fn failed(&self, reason: String, quarantined: Option<PathBuf>) -> FailedArtifact {
        FailedArtifact {
            label: self.label.clone(),
            sha256: self.sha256.clone(),
            reason,
            quarantined,
        }
    }
}

enum Done {
    Version(usize, VersionReport),
    Failed(usize, FailedArtifact),
}

impl Done {
    fn index(&self) -> usize {
        match self {
            Self::Version(i, _) | Self::Failed(i, _) => *i,
        }
    }
}

/// Components a [Runtime] is assembled from
pub struct Parts<S> {
    pub admission: AdmissionController,
    pub pool: ConnectionPool<SqliteConnector>,
    pub downloader: Downloader<S>,
    pub decoder: Box<dyn StringSource>,
    pub highlighter: Highlighter,
    pub cache_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub opts: Options,
}

/// All process wide state the pipeline needs, created once at startup and
/// shared by reference with every request
pub struct Runtime<S = HttpArtifactSource> {
    admission: AdmissionController,
    cancellations: CancellationRegistry,
    pool: ConnectionPool<SqliteConnector>,
    downloader: Downloader<S>,
    decoder: Box<dyn StringSource>,
    highlighter: Highlighter,
    cache_dir: PathBuf,
    quarantine_dir: PathBuf,
    opts: Options,
    worker_pool: ThreadPool,
    /// Serializes read-merge-write cycles on the shared manifest file
    manifest_lock: Mutex<()>,
}

impl Runtime<HttpArtifactSource> {
    /// Build the runtime described by `settings`, with directories taken
    /// from `ctx`
    pub fn from_context(ctx: &dyn Context, settings: &Settings) -> Result<Self> {
        let admission = match settings.sessions.max_concurrent {
            Some(n) => AdmissionController::new(n, settings.sessions.timeout),
            None => AdmissionController::from_host(settings.sessions.timeout),
        };

        let source = HttpArtifactSource::new(
            &settings.download_endpoint,
            settings.download.request_timeout,
        )?;

        Self::new(Parts {
            admission,
            pool: open_index(ctx, settings)?,
            downloader: Downloader::new(source, settings.download.downloader_options()),
            decoder: string_source(ctx, &settings.processing)?,
            highlighter: Highlighter::new(settings.highlights.clone()),
            cache_dir: ctx.get_apk_cache_dir()?,
            quarantine_dir: ctx.get_quarantine_dir()?,
            opts: Options::from_settings(settings),
        })
    }
}

impl<S: ArtifactSource> Runtime<S> {
    pub fn new(parts: Parts<S>) -> Result<Self> {
        let worker_pool = ThreadPoolBuilder::new()
            .num_threads(parts.opts.worker_threads.max(1))
            .thread_name(|i| format!("apktrail-decode-{i}"))
            .build()
            .map_err(|e| Error::Generic(format!("failed to build worker pool: {e}")))?;
        ensure_dir_exists(&parts.cache_dir)?;

        Ok(Self {
            admission: parts.admission,
            cancellations: CancellationRegistry::new(),
            pool: parts.pool,
            downloader: parts.downloader,
            decoder: parts.decoder,
            highlighter: parts.highlighter,
            cache_dir: parts.cache_dir,
            quarantine_dir: parts.quarantine_dir,
            opts: parts.opts,
            worker_pool,
            manifest_lock: Mutex::new(()),
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn pool(&self) -> &ConnectionPool<SqliteConnector> {
        &self.pool
    }

    pub fn index(&self) -> ApkIndex<'_> {
        ApkIndex::new(&self.pool)
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Ask the worker running `session` to stop
    pub fn cancel(&self, session: &SessionId) -> bool {
        self.cancellations.cancel(session)
    }

    /// Evict sessions past the timeout and tell any worker still running
    /// them to stop
    pub fn sweep(&self, now: SystemTime) -> Vec<SessionId> {
        let stale = self.admission.sweep_stale(now);
        for id in &stale {
            self.cancellations.cancel(id);
        }
        stale
    }

    /// Close every pooled connection. No session may be running.
    pub fn shutdown(&self) {
        self.pool.shutdown_all();
    }

    /// Look up, fetch and decode the builds of one package
    pub fn analyze_package(
        &self,
        req: &PackageRequest,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
    ) -> Result<Report> {
        let start = end_of_day(&req.start_date)?;
        let end = end_of_day(&req.end_date)?;

        self.run_session(&req.session, req.metadata.clone(), cancel, monitor, |check| {
            let records = self.index().find_versions(&req.package, &start, &end)?;
            let desired = req
                .desired_versions
                .map_or(self.opts.max_versions, |it| it.min(self.opts.max_versions));
            let selected = select_versions(&records, desired);
            log::info!(
                "session {}: {} of {} builds of {} selected",
                req.session,
                selected.len(),
                records.len(),
                req.package
            );
            monitor.on_event(Event::VersionsSelected {
                package: req.package.clone(),
                found: records.len(),
                selected: selected.len(),
            });

            let mut report = Report::new(&req.session, Some(req.package.as_str()), records.len());
            if selected.is_empty() {
                log::warn!("no builds of {} in {} to {}", req.package, start, end);
                return Ok(report);
            }

            let done = self.run_batch(check, monitor, |jobs, done| {
                self.fetch_all(req, &selected, check, monitor, jobs, done)
            })?;
            report.fill(done);
            Ok(report)
        })
    }

    /// Decode APK files that are already on disk. Each file is one version
    /// labelled by its file stem, in the given order.
    pub fn analyze_local(
        &self,
        session: &SessionId,
        metadata: SessionMetadata,
        paths: &[PathBuf],
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
    ) -> Result<Report> {
        self.run_session(session, metadata, cancel, monitor, |check| {
            let mut report = Report::new(session, None, paths.len());
            let done = self.run_batch(check, monitor, |jobs, _| {
                for (index, path) in paths.iter().enumerate() {
                    let job = Job {
                        index,
                        label: path_label(path),
                        sha256: None,
                        scan_date: None,
                        path: path.clone(),
                        quarantine: false,
                    };
                    if !cancelable_send(check, job, jobs)? {
                        break;
                    }
                }
                Ok(())
            })?;
            report.fill(done);
            Ok(report)
        })
    }

    /// Admit `session`, claim it for the calling thread, and run `body` with
    /// a cancel check that fires on either the registry or `cancel`
    fn run_session<R, F>(
        &self,
        session: &SessionId,
        metadata: SessionMetadata,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
        body: F,
    ) -> Result<R>
    where
        F: FnOnce(&dyn CancelCheck) -> Result<R>,
    {
        let swept = self.sweep(SystemTime::now());
        if !swept.is_empty() {
            log::info!("evicted {} stale sessions", swept.len());
        }

        let _admitted = self.admission.admit(session, metadata)?;
        let me = WorkerId::current();
        self.cancellations.assign(session, me);
        log::info!("session {} started on {}", session, me);
        monitor.on_event(Event::SessionStarted {
            session: session.clone(),
        });

        let res = {
            let check = self.cancellations.check_for(session, me, cancel);
            body(&check)
        };

        self.cancellations.complete(session, me);
        self.cancellations.release(session, me);
        match &res {
            Ok(_) => log::info!("session {} finished", session),
            Err(Error::Cancelled) => log::info!("session {} cancelled", session),
            Err(e) => log::error!("session {} failed: {}", session, e),
        }
        monitor.on_event(Event::SessionFinished {
            session: session.clone(),
            ok: res.is_ok(),
        });
        res
    }

    /// Run `produce` on a helper thread feeding jobs to the decode workers
    /// and gather what they finish, in no particular order
    fn run_batch<P>(
        &self,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
        produce: P,
    ) -> Result<Vec<Done>>
    where
        P: FnOnce(&Sender<Job>, &Sender<Done>) -> Result<()> + Send,
    {
        let (job_tx, job_rx) = bounded::<Job>(self.opts.worker_threads.max(1) * 2);
        let (done_tx, done_rx) = unbounded::<Done>();

        let produced = thread::scope(|scope| {
            let done_tx = &done_tx;
            let producer = scope.spawn(move |_| {
                let res = produce(&job_tx, done_tx);
                drop(job_tx);
                res
            });
            self.decode_all(&job_rx, done_tx, cancel, monitor);
            producer.join().expect("joining producer thread")
        })
        .expect("making batch scope");

        drop(done_tx);
        let done = done_rx.try_iter().collect::<Vec<Done>>();
        produced?;
        cancel.bail_if_cancelled()?;
        Ok(done)
    }

    /// Fetch the selected builds one after another so a cancellation is seen
    /// between artifacts, then record the selection in the manifest
    fn fetch_all(
        &self,
        req: &PackageRequest,
        selected: &[ApkRecord],
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
        jobs: &Sender<Job>,
        done: &Sender<Done>,
    ) -> Result<()> {
        let forward = FnMonitor(|evt: DownloadEvent| monitor.on_event(Event::Download(evt)));

        for (index, rec) in selected.iter().enumerate() {
            cancel.bail_if_cancelled()?;
            let task = FetchTask {
                content_hash: rec.sha256.clone(),
                package_name: req.package.clone(),
                version_label: rec.vercode.clone(),
                scan_timestamp: rec.vt_scan_date.clone(),
                credential: req.credential.clone(),
                destination: self.cache_dir.clone(),
                max_attempts_per_cycle: self.opts.max_attempts_per_cycle,
                cycles: self.opts.cycles,
            };

            let path = match self.downloader.fetch(&task, cancel, &forward) {
                Ok(v) => v,
                Err(FetchError::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    log::warn!(
                        "session {}: skipping {} {}: {}",
                        req.session,
                        req.package,
                        rec.vercode,
                        e
                    );
                    monitor.on_event(Event::FetchFailed {
                        sha256: rec.sha256.clone(),
                        reason: e.to_string(),
                    });
                    let failed = FailedArtifact {
                        label: rec.vercode.clone(),
                        sha256: Some(rec.sha256.clone()),
                        reason: e.to_string(),
                        quarantined: None,
                    };
                    let _ = done.send(Done::Failed(index, failed));
                    continue;
                }
            };

            let job = Job {
                index,
                label: rec.vercode.clone(),
                sha256: Some(rec.sha256.clone()),
                scan_date: Some(rec.vt_scan_date.clone()),
                path,
                quarantine: true,
            };
            if !cancelable_send(cancel, job, jobs)? {
                break;
            }
        }

        let mut manifest = ArtifactManifest::new();
        manifest.set(
            &req.package,
            selected
                .iter()
                .map(|rec| ManifestEntry {
                    sha256: rec.sha256.clone(),
                    vercode: rec.vercode.clone(),
                    vtscandate: rec.vt_scan_date.clone(),
                })
                .collect(),
        );
        let _guard = self.manifest_lock.lock().expect("manifest lock poisoned");
        manifest.update_file(&ArtifactManifest::path_in(&self.cache_dir))?;
        Ok(())
    }

    fn decode_all(
        &self,
        jobs: &Receiver<Job>,
        done: &Sender<Done>,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
    ) {
        self.worker_pool.broadcast(|_| {
            while let Ok(Some(job)) = cancelable_recv(cancel, jobs) {
                match self.decode_one(job, cancel, monitor) {
                    Some(res) => {
                        let _ = done.send(res);
                    }
                    None => break,
                }
            }
        });
    }

    /// Returns None if cancelled mid decode
    fn decode_one(
        &self,
        job: Job,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<Event>,
    ) -> Option<Done> {
        log::trace!("{} decoding {}", WorkerId::current(), job.path.display());
        monitor.on_event(Event::Decoding {
            path: job.path.clone(),
        });

        let err = match self.decoder.strings(&job.path, cancel) {
            Ok(found) => {
                let indicators = self.findings(&found.strings);
                monitor.on_event(Event::Decoded {
                    path: job.path.clone(),
                    strings: found.strings.len(),
                    indicators: indicators.len(),
                });
                let version = VersionReport {
                    label: job.label,
                    sha256: job.sha256,
                    scan_date: job.scan_date,
                    path: job.path,
                    strings: found.strings.len(),
                    skipped_images: found.skipped_images,
                    indicators,
                };
                return Some(Done::Version(job.index, version));
            }
            Err(SourceError::Cancelled) => return None,
            Err(e) => e,
        };

        let reason = err.to_string();
        log::warn!("failed to decode {}: {}", job.path.display(), reason);
        monitor.on_event(Event::DecodeFailed {
            path: job.path.clone(),
            reason: reason.clone(),
        });

        let quarantined = match err {
            SourceError::Archive(_) if job.quarantine => {
                match quarantine_file(&job.path, &self.quarantine_dir) {
                    Ok(to) => {
                        monitor.on_event(Event::Quarantined {
                            from: job.path.clone(),
                            to: to.clone(),
                        });
                        Some(to)
                    }
                    Err(e) => {
                        log::error!("failed to quarantine {}: {}", job.path.display(), e);
                        None
                    }
                }
            }
            _ => None,
        };
        Some(Done::Failed(job.index, job.failed(reason, quarantined)))
    }

    fn findings(&self, strings: &[String]) -> Vec<Finding> {
        extract_indicators(strings.iter().map(String::as_str))
            .into_iter()
            .map(|indicator| {
                let label = self.highlighter.classify(&indicator).map(String::from);
                Finding { indicator, label }
            })
            .collect()
    }
}

impl Report {
    fn fill(&mut self, mut done: Vec<Done>) {
        done.sort_by_key(Done::index);
        for it in done {
            match it {
                Done::Version(_, v) => self.versions.push(v),
                Done::Failed(_, f) => self.failed.push(f),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::admission::DEFAULT_SESSION_TIMEOUT;
    use crate::download::{DownloaderOptions, SourceResponse};
    use crate::extract::HighlightRule;
    use crate::strings::BuiltinDecoder;
    use crate::tasks::{NeverCancel, NoopMonitor, TaskCanceller};
    use crate::testing::{
        apk_record, tmp_context, tmp_dir, zip_bytes, DexBuilder, MockSource, TestContext, TmpDir,
    };

    use std::collections::HashMap;
    use std::fs;
    use std::io::Cursor;
    use std::time::Duration;

    use rstest::*;

    const PKG: &str = "com.example.app";

    #[rstest]
    #[case::empty(0, 12, vec![])]
    #[case::fewer_than_desired(3, 12, vec![0, 1, 2])]
    #[case::only_latest(5, 1, vec![4])]
    #[case::zero_desired(5, 0, vec![4])]
    #[case::even_stride(10, 4, vec![0, 3, 6, 9])]
    #[case::uneven_stride(11, 4, vec![0, 3, 6, 9, 10])]
    #[case::exact(4, 4, vec![0, 1, 2, 3])]
    fn test_select_versions(
        #[case] n: usize,
        #[case] desired: usize,
        #[case] expected: Vec<usize>,
    ) {
        let records = (0..n).collect::<Vec<usize>>();
        assert_eq!(select_versions(&records, desired), expected);
    }

    #[rstest]
    #[case("2021-03-04", Some("2021-03-04 23:59:59.999999"))]
    #[case(" 2021-12-31 ", Some("2021-12-31 23:59:59.999999"))]
    #[case("2021-13-01", None)]
    #[case("2021-00-10", None)]
    #[case("2021-1-1", None)]
    #[case("yesterday", None)]
    fn test_end_of_day(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(end_of_day(input).ok().as_deref(), expected);
    }

    /// A stored zip big enough to pass the minimum size check
    fn apk_with_urls(urls: &[&str]) -> Vec<u8> {
        let padding = "p".repeat(1200);
        let mut strings = urls.iter().map(|it| it.to_string()).collect::<Vec<String>>();
        strings.push(padding);
        let dex = DexBuilder::new().strings(strings).build();
        zip_bytes(&[("classes.dex", dex.as_slice())])
    }

    fn source_serving(bodies: HashMap<String, Vec<u8>>) -> MockSource {
        let mut source = MockSource::new();
        source.expect_get().returning(move |_, hash| {
            Ok(match bodies.get(hash) {
                Some(body) => SourceResponse {
                    status: 200,
                    body: Box::new(Cursor::new(body.clone())),
                },
                None => SourceResponse {
                    status: 404,
                    body: Box::new(Cursor::new(Vec::new())),
                },
            })
        });
        source
    }

    fn runtime(tmp: &TmpDir, source: MockSource, capacity: usize) -> Runtime<MockSource> {
        let base = tmp.get_path();
        let connector = SqliteConnector::open(&base.join("index.sqlite"), 1000).unwrap();
        let rt = Runtime::new(Parts {
            admission: AdmissionController::new(capacity, DEFAULT_SESSION_TIMEOUT),
            pool: ConnectionPool::new(connector, 4),
            downloader: Downloader::new(
                source,
                DownloaderOptions {
                    backoff: Duration::ZERO,
                    ..Default::default()
                },
            ),
            decoder: Box::new(BuiltinDecoder::default()),
            highlighter: Highlighter::new(vec![
                HighlightRule::new("example", "first-party").unwrap(),
                HighlightRule::new("ads", "advertising").unwrap(),
            ]),
            cache_dir: base.join("apk_cache"),
            quarantine_dir: base.join("trash"),
            opts: Options {
                worker_threads: 2,
                max_versions: 12,
                max_attempts_per_cycle: 2,
                cycles: 1,
            },
        })
        .unwrap();
        rt.index()
            .insert_records(&[
                apk_record(1, PKG, "1", "2020-01-01 10:00:00"),
                apk_record(2, PKG, "2", "2020-06-01 10:00:00"),
                apk_record(3, PKG, "3", "2021-01-01 10:00:00"),
                apk_record(9, "com.other", "1", "2020-06-01 10:00:00"),
            ])
            .unwrap();
        rt
    }

    fn sha(n: u64) -> String {
        format!("{:064x}", n)
    }

    fn request(session: &str) -> PackageRequest {
        PackageRequest {
            session: SessionId::from(session),
            package: PKG.into(),
            start_date: "2019-12-31".into(),
            end_date: "2021-01-01".into(),
            desired_versions: None,
            credential: "key".into(),
            metadata: SessionMetadata::new(),
        }
    }

    #[rstest]
    fn test_open_index_locations(tmp_context: TestContext) {
        let mut settings = Settings::default();
        let pool = open_index(&tmp_context, &settings).unwrap();
        assert_eq!(ApkIndex::new(&pool).count().unwrap(), 0);
        pool.shutdown_all();
        assert!(tmp_context
            .get_sqlite_dir()
            .unwrap()
            .join(INDEX_FILE_NAME)
            .is_file());

        let custom = tmp_context.get_base_dir().join("elsewhere/builds.sqlite");
        settings.database.path = Some(custom.clone());
        let pool = open_index(&tmp_context, &settings).unwrap();
        assert_eq!(pool.capacity(), settings.database.max_connections);
        pool.shutdown_all();
        assert!(custom.is_file());
    }

    #[rstest]
    fn test_analyze_package(tmp_dir: TmpDir) {
        let mut bodies = HashMap::new();
        bodies.insert(sha(1), apk_with_urls(&["https://api.example.com/v1"]));
        bodies.insert(
            sha(2),
            apk_with_urls(&["https://api.example.com/v2", "http://ads.tracker.co.uk/x"]),
        );
        bodies.insert(sha(3), apk_with_urls(&["plain string"]));
        let rt = runtime(&tmp_dir, source_serving(bodies), 2);

        let report = rt
            .analyze_package(&request("s1"), &NeverCancel, &NoopMonitor)
            .unwrap();

        assert_eq!(report.candidates, 3);
        assert!(report.failed.is_empty());
        let labels = report.versions.iter().map(|v| v.label.as_str()).collect::<Vec<_>>();
        assert_eq!(labels, ["1", "2", "3"]);

        let v2 = &report.versions[1];
        assert_eq!(v2.sha256.as_deref(), Some(sha(2).as_str()));
        assert_eq!(v2.indicators.len(), 2);
        assert_eq!(v2.indicators[0].label.as_deref(), Some("first-party"));
        assert_eq!(v2.indicators[1].indicator.domain, "tracker.co.uk");
        assert_eq!(v2.indicators[1].label.as_deref(), Some("advertising"));
        assert!(report.versions[2].indicators.is_empty());

        let manifest = ArtifactManifest::load(&ArtifactManifest::path_in(
            &tmp_dir.get_path().join("apk_cache"),
        ))
        .unwrap();
        assert_eq!(manifest.get(PKG).unwrap().len(), 3);

        assert_eq!(rt.admission().active(), 0);
        assert_eq!(rt.cancellations().status(&SessionId::from("s1")), None);
    }

    #[rstest]
    fn test_concurrent_sessions_keep_manifest_entries(tmp_dir: TmpDir) {
        let mut bodies = HashMap::new();
        for n in [1, 2, 3, 9] {
            bodies.insert(sha(n), apk_with_urls(&[]));
        }
        let rt = runtime(&tmp_dir, source_serving(bodies), 2);
        let manifest_path = ArtifactManifest::path_in(&tmp_dir.get_path().join("apk_cache"));

        for round in 0..4 {
            if manifest_path.exists() {
                fs::remove_file(&manifest_path).unwrap();
            }
            let mut first = request(&format!("main-{round}"));
            first.desired_versions = Some(3);
            let mut second = request(&format!("other-{round}"));
            second.package = "com.other".into();

            thread::scope(|s| {
                let a = s.spawn(|_| rt.analyze_package(&first, &NeverCancel, &NoopMonitor));
                let b = s.spawn(|_| rt.analyze_package(&second, &NeverCancel, &NoopMonitor));
                assert_eq!(a.join().unwrap().unwrap().versions.len(), 3);
                assert_eq!(b.join().unwrap().unwrap().versions.len(), 1);
            })
            .unwrap();

            let manifest = ArtifactManifest::load(&manifest_path).unwrap();
            assert_eq!(manifest.get(PKG).map(|it| it.len()), Some(3));
            assert_eq!(manifest.get("com.other").map(|it| it.len()), Some(1));
        }
    }

    #[rstest]
    fn test_cached_builds_skip_network(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source.expect_get().times(0);
        let rt = runtime(&tmp_dir, source, 2);

        let cache = tmp_dir.get_path().join("apk_cache");
        for n in 1..=3 {
            fs::write(cache.join(format!("{}.apk", sha(n))), apk_with_urls(&[])).unwrap();
        }

        let report = rt
            .analyze_package(&request("s1"), &NeverCancel, &NoopMonitor)
            .unwrap();
        assert_eq!(report.versions.len(), 3);
    }

    #[rstest]
    fn test_failures_do_not_stop_batch(tmp_dir: TmpDir) {
        let mut bodies = HashMap::new();
        bodies.insert(sha(1), apk_with_urls(&["https://a.example.com"]));
        // Large enough to be stored but not a zip
        bodies.insert(sha(3), vec![b'Z'; 2000]);
        let rt = runtime(&tmp_dir, source_serving(bodies), 2);

        let report = rt
            .analyze_package(&request("s1"), &NeverCancel, &NoopMonitor)
            .unwrap();

        assert_eq!(report.versions.len(), 1);
        assert_eq!(report.failed.len(), 2);

        let exhausted = &report.failed[0];
        assert_eq!(exhausted.label, "2");
        assert!(exhausted.quarantined.is_none());

        let corrupt = &report.failed[1];
        assert_eq!(corrupt.label, "3");
        let moved = corrupt.quarantined.as_ref().unwrap();
        assert!(moved.starts_with(tmp_dir.get_path().join("trash")));
        assert!(moved.exists());
        assert!(!tmp_dir
            .get_path()
            .join("apk_cache")
            .join(format!("{}.apk", sha(3)))
            .exists());
    }

    #[rstest]
    fn test_capacity_exceeded(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source.expect_get().times(0);
        let rt = runtime(&tmp_dir, source, 1);
        rt.admission()
            .register(&SessionId::from("busy"), SessionMetadata::new())
            .unwrap();

        let err = rt
            .analyze_package(&request("s1"), &NeverCancel, &NoopMonitor)
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(1)));
        assert!(err.is_resource_exhausted());
    }

    #[rstest]
    fn test_invalid_dates_not_admitted(tmp_dir: TmpDir) {
        let rt = runtime(&tmp_dir, MockSource::new(), 1);
        let mut req = request("s1");
        req.end_date = "2021/01/01".into();
        assert!(rt.analyze_package(&req, &NeverCancel, &NoopMonitor).is_err());
        assert_eq!(rt.admission().active(), 0);
    }

    #[rstest]
    fn test_cancelled_session(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source.expect_get().times(0);
        let rt = runtime(&tmp_dir, source, 2);

        let (canceller, check) = TaskCanceller::new();
        canceller.cancel();
        let res = rt.analyze_package(&request("s1"), &check, &NoopMonitor);
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(rt.admission().active(), 0);
    }

    #[rstest]
    fn test_registry_cancel_stops_fetching(tmp_dir: TmpDir) {
        let session = SessionId::from("s1");
        let rt = runtime(&tmp_dir, source_serving(HashMap::new()), 2);
        // Cancel through the registry as soon as the first download starts
        let monitor = FnMonitor(|evt: Event| {
            if let Event::Download(DownloadEvent::Attempt { .. }) = evt {
                rt.cancel(&session);
            }
        });
        let res = rt.analyze_package(&request("s1"), &NeverCancel, &monitor);
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(rt.cancellations().status(&session), None);
    }

    #[rstest]
    fn test_analyze_local(tmp_dir: TmpDir) {
        let rt = runtime(&tmp_dir, MockSource::new(), 2);
        let good = tmp_dir.create_file_bytes(
            "uploads/first.apk",
            &apk_with_urls(&["https://cdn.example.org/a"]),
        );
        let bad = tmp_dir.create_file_bytes("uploads/second.apk", b"garbage");

        let report = rt
            .analyze_local(
                &SessionId::from("local"),
                SessionMetadata::new(),
                &[good, bad.clone()],
                &NeverCancel,
                &NoopMonitor,
            )
            .unwrap();

        assert_eq!(report.versions.len(), 1);
        assert_eq!(report.versions[0].label, "first");
        assert_eq!(report.versions[0].indicators[0].indicator.host, "cdn.example.org");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].label, "second");
        assert!(report.failed[0].quarantined.is_none());
        assert!(bad.exists());
    }
}
