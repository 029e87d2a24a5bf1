use std::collections::HashMap;
use std::sync::Mutex;

use crate::admission::SessionId;

use super::{CancelCheck, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    CancelRequested,
    Completed,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    status: SessionStatus,
    owner: WorkerId,
}

/// Tracks which worker may act for each session and whether it has been
/// asked to stop.
///
/// A session has at most one owner. Assigning a new owner supersedes the
/// previous one, which will see [CancellationRegistry::should_cancel] return
/// true on its next poll.
#[derive(Default)]
pub struct CancellationRegistry {
    claims: Mutex<HashMap<SessionId, Claim>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `identity` the sole worker for `session` and mark it running
    pub fn assign(&self, session: &SessionId, identity: WorkerId) {
        let mut claims = self.claims.lock().expect("cancellation registry poisoned");
        let prev = claims.insert(
            session.clone(),
            Claim {
                status: SessionStatus::Running,
                owner: identity,
            },
        );
        if let Some(prev) = prev.filter(|it| it.owner != identity) {
            log::debug!(
                "session {} reassigned from {} to {}",
                session,
                prev.owner,
                identity
            );
        }
    }

    /// Whether `current` should stop working on `session`.
    ///
    /// Sessions with no claim yet are still starting up and keep going.
    pub fn should_cancel(&self, session: &SessionId, current: WorkerId) -> bool {
        let claims = self.claims.lock().expect("cancellation registry poisoned");
        match claims.get(session) {
            None => false,
            Some(claim) => match claim.status {
                SessionStatus::Running => claim.owner != current,
                SessionStatus::CancelRequested | SessionStatus::Completed => true,
            },
        }
    }

    /// Request that the running worker for `session` stop. Returns false if
    /// the session had nothing running.
    pub fn cancel(&self, session: &SessionId) -> bool {
        let mut claims = self.claims.lock().expect("cancellation registry poisoned");
        match claims.get_mut(session) {
            Some(claim) if claim.status == SessionStatus::Running => {
                log::info!("cancel requested for session {}", session);
                claim.status = SessionStatus::CancelRequested;
                true
            }
            _ => false,
        }
    }

    /// Mark the session finished. Ignored unless `identity` still owns it.
    pub fn complete(&self, session: &SessionId, identity: WorkerId) {
        let mut claims = self.claims.lock().expect("cancellation registry poisoned");
        if let Some(claim) = claims.get_mut(session) {
            if claim.owner == identity {
                claim.status = SessionStatus::Completed;
            }
        }
    }

    pub fn status(&self, session: &SessionId) -> Option<SessionStatus> {
        let claims = self.claims.lock().expect("cancellation registry poisoned");
        claims.get(session).map(|it| it.status)
    }

    /// Drop the claim if `identity` still owns it. A worker that was
    /// superseded leaves the new owner's claim alone.
    pub fn release(&self, session: &SessionId, identity: WorkerId) -> bool {
        let mut claims = self.claims.lock().expect("cancellation registry poisoned");
        match claims.get(session) {
            Some(claim) if claim.owner == identity => {
                claims.remove(session);
                true
            }
            _ => false,
        }
    }

    /// Drop all state for the session
    pub fn forget(&self, session: &SessionId) {
        let mut claims = self.claims.lock().expect("cancellation registry poisoned");
        claims.remove(session);
    }

    /// A [CancelCheck] for `identity` working on `session`, which also fires
    /// when `outer` does
    pub fn check_for<'a>(
        &'a self,
        session: &SessionId,
        identity: WorkerId,
        outer: &'a dyn CancelCheck,
    ) -> SessionCancelCheck<'a> {
        SessionCancelCheck {
            registry: self,
            session: session.clone(),
            identity,
            outer,
        }
    }
}

pub struct SessionCancelCheck<'a> {
    registry: &'a CancellationRegistry,
    session: SessionId,
    identity: WorkerId,
    outer: &'a dyn CancelCheck,
}

impl<'a> CancelCheck for SessionCancelCheck<'a> {
    fn was_cancelled(&self) -> bool {
        self.outer.was_cancelled() || self.registry.should_cancel(&self.session, self.identity)
    }
}
