use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Used when the host can't be inspected
pub const DEFAULT_CAPACITY: usize = 5;
pub const MAX_CAPACITY: usize = 20;
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1800);

/// Memory set aside for each concurrent session, in bytes
pub const SESSION_MEMORY_BUDGET: u64 = 3 * (1 << 30) / 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new id, unique within this process
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|it| it.as_nanos())
            .unwrap_or_default();
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{:x}-{:x}-{:x}", nanos, std::process::id(), seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

pub type SessionMetadata = BTreeMap<String, String>;

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub started: SystemTime,
    pub metadata: SessionMetadata,
}

/// What could be learned about the host's resources
#[derive(Debug, Clone, Copy, Default)]
pub struct HostResources {
    pub cpus: Option<usize>,
    pub available_memory: Option<u64>,
}

impl HostResources {
    pub fn detect() -> Self {
        Self {
            cpus: std::thread::available_parallelism().ok().map(|it| it.get()),
            available_memory: available_memory(),
        }
    }

    /// One session per spare core and per [SESSION_MEMORY_BUDGET] of free
    /// memory, whichever is smaller, clamped to `[1, MAX_CAPACITY]`.
    pub fn session_capacity(&self) -> usize {
        match (self.cpus, self.available_memory) {
            (Some(cpus), Some(mem)) => {
                let by_cpu = cpus.saturating_sub(1);
                let by_mem = (mem / SESSION_MEMORY_BUDGET) as usize;
                by_cpu.min(by_mem).clamp(1, MAX_CAPACITY)
            }
            _ => DEFAULT_CAPACITY,
        }
    }
}

#[cfg(target_os = "linux")]
fn available_memory() -> Option<u64> {
    meminfo_available().or_else(|| {
        // SAFETY: sysconf has no preconditions
        let (pages, size) = unsafe {
            (
                libc::sysconf(libc::_SC_AVPHYS_PAGES),
                libc::sysconf(libc::_SC_PAGESIZE),
            )
        };
        if pages <= 0 || size <= 0 {
            None
        } else {
            Some(pages as u64 * size as u64)
        }
    })
}

#[cfg(target_os = "linux")]
fn meminfo_available() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_available(&content)
}

#[cfg(not(target_os = "linux"))]
fn available_memory() -> Option<u64> {
    None
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_available(content: &str) -> Option<u64> {
    let line = content.lines().find(|it| it.starts_with("MemAvailable:"))?;
    let kb = line
        .trim_start_matches("MemAvailable:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(kb * 1024)
}

/// Process wide gate on concurrently active analysis sessions.
///
/// Checking for capacity and registering happen under one lock so concurrent
/// callers can never push the count past [AdmissionController::capacity].
pub struct AdmissionController {
    capacity: usize,
    timeout: Duration,
    sessions: Mutex<HashMap<SessionId, SessionInfo>>,
}

impl AdmissionController {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Size the controller from the host's resources
    pub fn from_host(timeout: Duration) -> Self {
        let host = HostResources::detect();
        let capacity = host.session_capacity();
        log::debug!("host resources {:?}, session capacity {}", host, capacity);
        Self::new(capacity, timeout)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    pub fn has_capacity(&self) -> bool {
        self.lock().len() < self.capacity
    }

    pub fn is_registered(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    /// Admit a session if there is room, all in one step
    pub fn register(&self, id: &SessionId, metadata: SessionMetadata) -> Result<()> {
        self.register_at(id, metadata, SystemTime::now())
    }

    pub fn register_at(
        &self,
        id: &SessionId,
        metadata: SessionMetadata,
        started: SystemTime,
    ) -> Result<()> {
        let mut sessions = self.lock();
        if sessions.contains_key(id) {
            return Err(Error::DuplicateSession(id.to_string()));
        }
        if sessions.len() >= self.capacity {
            log::warn!(
                "rejecting session {}: {} of {} slots in use",
                id,
                sessions.len(),
                self.capacity
            );
            return Err(Error::CapacityExceeded(self.capacity));
        }
        sessions.insert(id.clone(), SessionInfo { started, metadata });
        log::info!("admitted session {} ({}/{})", id, sessions.len(), self.capacity);
        Ok(())
    }

    /// Register and get a guard that removes the session when dropped
    pub fn admit(&self, id: &SessionId, metadata: SessionMetadata) -> Result<SessionGuard<'_>> {
        self.register(id, metadata)?;
        Ok(SessionGuard {
            controller: self,
            id: id.clone(),
        })
    }

    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            log::debug!("session {} removed", id);
        }
        removed
    }

    /// Remove every session older than the timeout, returning their ids
    pub fn sweep_stale(&self, now: SystemTime) -> Vec<SessionId> {
        let mut sessions = self.lock();
        let stale = sessions
            .iter()
            .filter(|(_, info)| now.duration_since(info.started).unwrap_or_default() > self.timeout)
            .map(|(id, _)| id.clone())
            .collect::<Vec<SessionId>>();
        for id in &stale {
            log::warn!("evicting stale session {}", id);
            sessions.remove(id);
        }
        stale
    }

    pub fn sessions(&self) -> Vec<(SessionId, SessionInfo)> {
        self.lock()
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionInfo>> {
        self.sessions.lock().expect("session registry poisoned")
    }
}

/// Keeps a session admitted for as long as it's alive
pub struct SessionGuard<'a> {
    controller: &'a AdmissionController,
    id: SessionId,
}

impl<'a> SessionGuard<'a> {
    pub fn id(&self) -> &SessionId {
        &self.id
    }
}

impl<'a> Drop for SessionGuard<'a> {
    fn drop(&mut self) {
        self.controller.remove(&self.id);
    }
}
