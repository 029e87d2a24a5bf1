use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{ContentCache, StagedArtifact};
use crate::tasks::{cancelable_sleep, CancelCheck, EventMonitor};

pub const DEFAULT_ENDPOINT: &str = "https://androzoo.uni.lu/api/download";

/// Bodies at or below this size are error pages, not artifacts
pub const MIN_ARTIFACT_SIZE: u64 = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;
pub const DEFAULT_CYCLES: u32 = 4;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(200);

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("download of {hash} exhausted after {attempts} attempts")]
    Exhausted { hash: String, attempts: u32 },

    #[error("download cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Cache(crate::Error),
}

impl From<crate::Error> for FetchError {
    fn from(value: crate::Error) -> Self {
        match value {
            crate::Error::Cancelled => Self::Cancelled,
            e => Self::Cache(e),
        }
    }
}

impl From<io::Error> for FetchError {
    fn from(value: io::Error) -> Self {
        Self::Cache(value.into())
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<FetchError> for crate::Error {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::Cancelled => Self::Cancelled,
            FetchError::Cache(e) => e,
            e => Self::Generic(e.to_string()),
        }
    }
}

/// One artifact to retrieve
#[derive(Debug, Clone)]
pub struct FetchTask {
    pub content_hash: String,
    pub package_name: String,
    pub version_label: String,
    pub scan_timestamp: String,
    pub credential: String,
    pub destination: PathBuf,
    pub max_attempts_per_cycle: u32,
    pub cycles: u32,
}

/// A response from an [ArtifactSource]. The body is read lazily.
pub struct SourceResponse {
    pub status: u16,
    pub body: Box<dyn Read + Send>,
}

/// Where artifacts come from
pub trait ArtifactSource: Send + Sync {
    /// Issue a single request for the artifact. Transport failures are
    /// returned as errors, HTTP failures as a non 200 status.
    fn get(&self, credential: &str, content_hash: &str) -> Result<SourceResponse, FetchError>;
}

/// Fetches `GET <endpoint>?apikey=<credential>&sha256=<hash>`
pub struct HttpArtifactSource {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpArtifactSource {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("apktrail/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn get(&self, credential: &str, content_hash: &str) -> Result<SourceResponse, FetchError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("apikey", credential), ("sha256", content_hash)])
            .send()?;
        Ok(SourceResponse {
            status: resp.status().as_u16(),
            body: Box::new(resp),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    CacheHit { hash: String },
    Attempt { hash: String, cycle: u32, attempt: u32 },
    AttemptFailed { hash: String, reason: String },
    BackingOff { hash: String, delay: Duration },
    Stored { hash: String, bytes: u64 },
    Exhausted { hash: String },
}

#[derive(Debug, Clone, Copy)]
pub struct DownloaderOptions {
    /// Sleep between retry cycles
    pub backoff: Duration,
    /// Bodies must be strictly larger than this
    pub min_size: u64,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            min_size: MIN_ARTIFACT_SIZE,
        }
    }
}

enum Outcome {
    Stored(PathBuf, u64),
    Rejected(String),
}

/// Cache aware fetcher with bounded retries.
///
/// Safe to call concurrently for different hashes. Concurrent calls for the
/// same hash both download, and the last atomic rename wins.
pub struct Downloader<S> {
    source: S,
    opts: DownloaderOptions,
}

impl<S: ArtifactSource> Downloader<S> {
    pub fn new(source: S, opts: DownloaderOptions) -> Self {
        Self { source, opts }
    }

    pub fn options(&self) -> &DownloaderOptions {
        &self.opts
    }

    /// Return the cached path for the task's artifact, downloading it first
    /// if needed.
    pub fn fetch(
        &self,
        task: &FetchTask,
        cancel: &dyn CancelCheck,
        monitor: &dyn EventMonitor<DownloadEvent>,
    ) -> Result<PathBuf, FetchError> {
        let hash = task.content_hash.as_str();
        let cache = ContentCache::new(&task.destination);

        if let Some(path) = cache.lookup(hash)? {
            log::trace!("cache hit for {}", hash);
            monitor.on_event(DownloadEvent::CacheHit { hash: hash.into() });
            return Ok(path);
        }
        cache.ensure_dir()?;

        let mut attempts = 0;
        for cycle in 0..task.cycles {
            for attempt in 0..task.max_attempts_per_cycle {
                cancel.bail_if_cancelled()?;
                attempts += 1;
                monitor.on_event(DownloadEvent::Attempt {
                    hash: hash.into(),
                    cycle,
                    attempt,
                });

                let reason = match self.attempt(&cache, task, cancel) {
                    Ok(Outcome::Stored(path, bytes)) => {
                        log::debug!(
                            "stored {} ({} {}) after {} attempts",
                            hash,
                            task.package_name,
                            task.version_label,
                            attempts
                        );
                        monitor.on_event(DownloadEvent::Stored {
                            hash: hash.into(),
                            bytes,
                        });
                        return Ok(path);
                    }
                    Ok(Outcome::Rejected(reason)) => reason,
                    Err(FetchError::Transport(reason)) => reason,
                    Err(e) => return Err(e),
                };
                log::trace!("attempt {} for {} failed: {}", attempts, hash, reason);
                monitor.on_event(DownloadEvent::AttemptFailed {
                    hash: hash.into(),
                    reason,
                });
            }

            if cycle + 1 < task.cycles {
                log::warn!(
                    "cycle {} for {} failed, backing off for {:?}",
                    cycle + 1,
                    hash,
                    self.opts.backoff
                );
                monitor.on_event(DownloadEvent::BackingOff {
                    hash: hash.into(),
                    delay: self.opts.backoff,
                });
                cancelable_sleep(cancel, self.opts.backoff)?;
            }
        }

        log::error!("giving up on {} after {} attempts", hash, attempts);
        monitor.on_event(DownloadEvent::Exhausted { hash: hash.into() });
        Err(FetchError::Exhausted {
            hash: hash.into(),
            attempts,
        })
    }

    fn attempt(
        &self,
        cache: &ContentCache,
        task: &FetchTask,
        cancel: &dyn CancelCheck,
    ) -> Result<Outcome, FetchError> {
        let mut resp = self.source.get(&task.credential, &task.content_hash)?;
        if resp.status != 200 {
            return Ok(Outcome::Rejected(format!("HTTP {}", resp.status)));
        }

        let mut staged = cache.stage()?;
        stream_body(&mut resp.body, &mut staged, cancel)?;

        let size = staged.len();
        if size <= self.opts.min_size {
            // Dropping the staged file removes it
            return Ok(Outcome::Rejected(format!("body too small ({size} bytes)")));
        }
        let path = staged.commit(cache, &task.content_hash)?;
        Ok(Outcome::Stored(path, size))
    }
}

/// Copy the body in chunks, checking for cancellation between them. Read
/// failures are transport errors, write failures are not.
fn stream_body(
    body: &mut dyn Read,
    into: &mut StagedArtifact,
    cancel: &dyn CancelCheck,
) -> Result<(), FetchError> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        cancel.bail_if_cancelled()?;
        let n = match body.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FetchError::Transport(e.to_string())),
        };
        into.write_all(&buf[..n])?;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tasks::{FnMonitor, NeverCancel, NoopMonitor, TaskCanceller};
    use crate::testing::{response, tmp_dir, MockSource, TmpDir};

    use mockall::Sequence;
    use rstest::*;
    use std::sync::Mutex;

    const HASH: &str = "6F2B4C0E8B3A2D1C9E0F7A6B5C4D3E2F1A0B9C8D7E6F5A4B3C2D1E0F9A8B7C6D";

    fn task(dir: &TmpDir, attempts: u32, cycles: u32) -> FetchTask {
        FetchTask {
            content_hash: HASH.into(),
            package_name: "com.example.app".into(),
            version_label: "42".into(),
            scan_timestamp: "2021-03-04 05:06:07".into(),
            credential: "secret".into(),
            destination: dir.get_path().join("apk_cache"),
            max_attempts_per_cycle: attempts,
            cycles,
        }
    }

    fn no_backoff() -> DownloaderOptions {
        DownloaderOptions {
            backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    #[rstest]
    fn test_retry_then_success(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        let mut seq = Sequence::new();
        source
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(response(503, 0)));
        source
            .expect_get()
            .withf(|cred, hash| cred == "secret" && hash == HASH)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(response(200, 2000)));

        let dl = Downloader::new(source, no_backoff());
        let task = task(&tmp_dir, 3, 2);
        let path = dl.fetch(&task, &NeverCancel, &NoopMonitor).unwrap();

        assert_eq!(path, task.destination.join(format!("{HASH}.apk")));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2000);
        assert!(ContentCache::new(&task.destination).contains(HASH));
    }

    #[rstest]
    fn test_small_bodies_exhaust(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source
            .expect_get()
            .times(6)
            .returning(|_, _| Ok(response(200, 10)));

        let events = Mutex::new(Vec::new());
        let monitor = FnMonitor(|evt: DownloadEvent| events.lock().unwrap().push(evt));

        let dl = Downloader::new(source, no_backoff());
        let task = task(&tmp_dir, 3, 2);
        let res = dl.fetch(&task, &NeverCancel, &monitor);
        assert!(matches!(res, Err(FetchError::Exhausted { attempts: 6, .. })));

        let events = events.into_inner().unwrap();
        let backoffs = events
            .iter()
            .filter(|it| matches!(it, DownloadEvent::BackingOff { .. }))
            .count();
        assert_eq!(backoffs, 1);
        assert_eq!(events.last(), Some(&DownloadEvent::Exhausted { hash: HASH.into() }));

        // No partial or staged files left behind
        let leftovers = std::fs::read_dir(&task.destination)
            .unwrap()
            .filter_map(|it| it.ok())
            .filter(|it| it.file_name() != "CACHEDIR.TAG")
            .count();
        assert_eq!(leftovers, 0);
    }

    #[rstest]
    fn test_exactly_min_size_rejected(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(response(200, MIN_ARTIFACT_SIZE as usize)));
        let dl = Downloader::new(source, no_backoff());
        let res = dl.fetch(&task(&tmp_dir, 1, 1), &NeverCancel, &NoopMonitor);
        assert!(matches!(res, Err(FetchError::Exhausted { attempts: 1, .. })));
    }

    #[rstest]
    fn test_cached_second_fetch(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source
            .expect_get()
            .times(1)
            .returning(|_, _| Ok(response(200, 4096)));

        let dl = Downloader::new(source, no_backoff());
        let task = task(&tmp_dir, 2, 2);
        let first = dl.fetch(&task, &NeverCancel, &NoopMonitor).unwrap();

        let hits = Mutex::new(0);
        let monitor = FnMonitor(|evt: DownloadEvent| {
            if let DownloadEvent::CacheHit { .. } = evt {
                *hits.lock().unwrap() += 1;
            }
        });
        let second = dl.fetch(&task, &NeverCancel, &monitor).unwrap();
        assert_eq!(first, second);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[rstest]
    fn test_transport_errors_count_as_attempts(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        let mut seq = Sequence::new();
        source
            .expect_get()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(FetchError::Transport("connection reset".into())));
        source
            .expect_get()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(response(200, 1001)));

        let dl = Downloader::new(source, no_backoff());
        assert!(dl
            .fetch(&task(&tmp_dir, 3, 1), &NeverCancel, &NoopMonitor)
            .is_ok());
    }

    #[rstest]
    fn test_cancelled_before_request(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        source.expect_get().times(0);

        let (canceller, check) = TaskCanceller::new();
        canceller.cancel();
        let dl = Downloader::new(source, no_backoff());
        let res = dl.fetch(&task(&tmp_dir, 3, 2), &check, &NoopMonitor);
        assert!(matches!(res, Err(FetchError::Cancelled)));
    }

    #[rstest]
    fn test_cancel_interrupts_backoff(tmp_dir: TmpDir) {
        let mut source = MockSource::new();
        let (canceller, check) = TaskCanceller::new();
        source.expect_get().times(1).returning(move |_, _| {
            canceller.cancel();
            Ok(response(404, 0))
        });

        let dl = Downloader::new(
            source,
            DownloaderOptions {
                backoff: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        let res = dl.fetch(&task(&tmp_dir, 1, 2), &check, &NoopMonitor);
        assert!(matches!(res, Err(FetchError::Cancelled)));
    }

    #[rstest]
    fn test_invalid_hash(tmp_dir: TmpDir) {
        let source = MockSource::new();
        let dl = Downloader::new(source, no_backoff());
        let mut task = task(&tmp_dir, 1, 1);
        task.content_hash = "../../../etc/passwd".into();
        let res = dl.fetch(&task, &NeverCancel, &NoopMonitor);
        assert!(matches!(
            res,
            Err(FetchError::Cache(crate::Error::InvalidHash(_)))
        ));
    }
}
