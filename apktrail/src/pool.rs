use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::tasks::WorkerId;
use crate::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 20;

/// Creates the connections held by a [ConnectionPool]
pub trait ConnectionFactory: Send + Sync {
    type Connection: Send;

    fn connect(&self) -> Result<Self::Connection>;

    /// Called on shutdown for each connection nobody else holds
    fn close(&self, conn: Self::Connection) {
        drop(conn)
    }
}

/// A shared handle to one pooled connection
pub struct PooledConnection<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for PooledConnection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> PooledConnection<C> {
    fn new(conn: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection
    pub fn with<R, F: FnOnce(&mut C) -> R>(&self, f: F) -> R {
        let mut guard = self.inner.lock().expect("pooled connection poisoned");
        f(&mut guard)
    }

    /// Whether both handles refer to the same underlying connection
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct PoolState<C> {
    free: Vec<PooledConnection<C>>,
    checked_out: HashMap<WorkerId, PooledConnection<C>>,
}

/// Fixed capacity pool of connections reserved per worker.
///
/// A worker holds at most one connection; acquiring again returns the one it
/// already holds. When every connection is reserved, acquiring from a new
/// worker fails immediately with [Error::PoolExhausted] rather than waiting.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    capacity: usize,
    state: Mutex<PoolState<F::Connection>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                free: Vec::new(),
                checked_out: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Connections created and not currently reserved
    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().checked_out.len()
    }

    pub fn acquire(&self, identity: WorkerId) -> Result<PooledConnection<F::Connection>> {
        self.acquire_inner(identity).map(|(conn, _)| conn)
    }

    fn acquire_inner(
        &self,
        identity: WorkerId,
    ) -> Result<(PooledConnection<F::Connection>, bool)> {
        let mut state = self.lock();

        if let Some(conn) = state.checked_out.get(&identity) {
            return Ok((conn.clone(), false));
        }

        let conn = match state.free.pop() {
            Some(conn) => conn,
            None if state.checked_out.len() < self.capacity => {
                log::trace!(
                    "opening pooled connection {} of {}",
                    state.checked_out.len() + 1,
                    self.capacity
                );
                PooledConnection::new(self.factory.connect()?)
            }
            None => {
                log::warn!("connection pool exhausted ({} in use)", self.capacity);
                return Err(Error::PoolExhausted(self.capacity));
            }
        };

        state.checked_out.insert(identity, conn.clone());
        Ok((conn, true))
    }

    /// Return the worker's connection to the free list. No-op if the worker
    /// holds nothing.
    pub fn release(&self, identity: WorkerId) {
        let mut state = self.lock();
        if let Some(conn) = state.checked_out.remove(&identity) {
            state.free.push(conn);
        }
    }

    /// Acquire for the calling thread, releasing when the returned guard is
    /// dropped. Nested checkouts on one thread share the connection and only
    /// the outermost releases it.
    pub fn checkout(&self) -> Result<Checkout<'_, F>> {
        let identity = WorkerId::current();
        let (conn, fresh) = self.acquire_inner(identity)?;
        Ok(Checkout {
            pool: self,
            identity,
            conn,
            fresh,
        })
    }

    /// Close every connection and forget all reservations.
    ///
    /// Callers must make sure nothing is acquiring or releasing concurrently.
    /// Handles still held elsewhere stay usable until dropped.
    pub fn shutdown_all(&self) {
        let (free, checked_out) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.free),
                std::mem::take(&mut state.checked_out),
            )
        };
        let mut closed = 0;
        for conn in free.into_iter().chain(checked_out.into_values()) {
            if let Ok(inner) = Arc::try_unwrap(conn.inner) {
                if let Ok(conn) = inner.into_inner() {
                    self.factory.close(conn);
                    closed += 1;
                }
            }
        }
        log::debug!("connection pool shut down, closed {} connections", closed);
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().expect("connection pool poisoned")
    }
}

pub struct Checkout<'a, F: ConnectionFactory> {
    pool: &'a ConnectionPool<F>,
    identity: WorkerId,
    conn: PooledConnection<F::Connection>,
    fresh: bool,
}

impl<'a, F: ConnectionFactory> Deref for Checkout<'a, F> {
    type Target = PooledConnection<F::Connection>;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl<'a, F: ConnectionFactory> Drop for Checkout<'a, F> {
    fn drop(&mut self) {
        if self.fresh {
            self.pool.release(self.identity);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam::thread;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rstest::*;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl ConnectionFactory for CountingFactory {
        type Connection = usize;

        fn connect(&self) -> Result<usize> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _conn: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FailingFactory;

    impl ConnectionFactory for FailingFactory {
        type Connection = ();

        fn connect(&self) -> Result<()> {
            Err(Error::new_generic("database is locked"))
        }
    }

    #[fixture]
    fn pool() -> ConnectionPool<CountingFactory> {
        ConnectionPool::new(CountingFactory::default(), 3)
    }

    #[rstest]
    fn test_exhaustion(pool: ConnectionPool<CountingFactory>) {
        for _ in 0..3 {
            pool.acquire(WorkerId::unique()).unwrap();
        }
        assert_eq!(pool.outstanding(), 3);
        let res = pool.acquire(WorkerId::unique());
        assert!(matches!(res, Err(Error::PoolExhausted(3))));
        assert_eq!(pool.factory().opened.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    fn test_reacquire_is_idempotent(pool: ConnectionPool<CountingFactory>) {
        let holder = WorkerId::unique();
        let other = WorkerId::unique();
        pool.acquire(other).unwrap();
        pool.release(other);
        assert_eq!(pool.free_count(), 1);

        let first = pool.acquire(holder).unwrap();
        assert_eq!(pool.free_count(), 0);
        let again = pool.acquire(holder).unwrap();
        assert!(first.same_as(&again));
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.factory().opened.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_release_reuses(pool: ConnectionPool<CountingFactory>) {
        let a = WorkerId::unique();
        let b = WorkerId::unique();
        let conn_a = pool.acquire(a).unwrap();
        pool.release(a);
        // Releasing twice, or releasing a stranger, is a no-op
        pool.release(a);
        pool.release(WorkerId::unique());
        assert_eq!(pool.free_count(), 1);

        let conn_b = pool.acquire(b).unwrap();
        assert!(conn_a.same_as(&conn_b));
        assert_eq!(conn_b.with(|it| *it), 0);
        assert_eq!(pool.factory().opened.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn test_connect_failure_reserves_nothing() {
        let pool = ConnectionPool::new(FailingFactory, 2);
        assert!(pool.acquire(WorkerId::unique()).is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[rstest]
    fn test_checkout_guard(pool: ConnectionPool<CountingFactory>) {
        {
            let outer = pool.checkout().unwrap();
            {
                let inner = pool.checkout().unwrap();
                assert!(inner.same_as(&outer));
            }
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.free_count(), 1);
    }

    #[rstest]
    fn test_shutdown_all(pool: ConnectionPool<CountingFactory>) {
        pool.acquire(WorkerId::unique()).unwrap();
        let held = pool.acquire(WorkerId::unique()).unwrap();
        let a = WorkerId::unique();
        pool.acquire(a).unwrap();
        pool.release(a);
        assert_eq!(pool.free_count(), 1);

        pool.shutdown_all();
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.outstanding(), 0);
        // The handle still held here can't be closed out from under us
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 2);
        drop(held);
    }

    #[rstest]
    fn test_concurrent_acquire(pool: ConnectionPool<CountingFactory>) {
        let ok = thread::scope(|scope| {
            let handles = (0..12)
                .map(|_| scope.spawn(|_| pool.acquire(WorkerId::current()).is_ok()))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        })
        .unwrap();
        assert_eq!(ok, 3);
        assert_eq!(pool.factory().opened.load(Ordering::SeqCst), 3);
    }
}
