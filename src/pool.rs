use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::address::{Address, Route};
use crate::call::Call;
use crate::connection::{CallReference, ConnState, Connection};
use crate::task::TaskRunner;

/// A shared registry of idle and in-use connections.
///
/// Create one and reuse it across clients; connections to the same
/// endpoints are shared when their addresses are equal.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    max_idle: usize,
    keep_alive: Duration,
    task_runner: TaskRunner,
    state: Mutex<PoolState>,
}

struct PoolState {
    connections: Vec<Arc<Connection>>,
    cleanup_scheduled: bool,
}

impl ConnectionPool {
    /// A pool that keeps up to `max_idle` idle connections, each for at
    /// most `keep_alive`, using the process-default task runner.
    pub fn new(max_idle: usize, keep_alive: Duration) -> ConnectionPool {
        ConnectionPool::with_task_runner(max_idle, keep_alive, TaskRunner::global().clone())
    }

    /// A pool with an explicit task runner driving its cleanup.
    pub fn with_task_runner(
        max_idle: usize,
        keep_alive: Duration,
        task_runner: TaskRunner,
    ) -> ConnectionPool {
        ConnectionPool {
            shared: Arc::new(PoolShared {
                max_idle,
                keep_alive,
                task_runner,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    cleanup_scheduled: false,
                }),
            }),
        }
    }

    /// Total connections currently held, in use or idle.
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().unwrap().connections.len()
    }

    /// Connections currently carrying no calls.
    pub fn idle_connection_count(&self) -> usize {
        let snapshot = self.snapshot();
        snapshot
            .iter()
            .filter(|c| c.state().calls.is_empty())
            .count()
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.shared.state.lock().unwrap().connections.clone()
    }

    fn remove(&self, connection: &Arc<Connection>) {
        let mut state = self.shared.state.lock().unwrap();
        state.connections.retain(|c| !Arc::ptr_eq(c, connection));
    }

    /// Attach `call` to a pooled connection eligible for `address`, if one
    /// exists. With `require_multiplexed`, only an HTTP/2 connection will
    /// do; `routes` enables cross-host coalescing when known.
    pub(crate) fn acquire(
        &self,
        address: &Address,
        call: &Call,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> Option<Arc<Connection>> {
        for connection in self.snapshot() {
            let mut st = connection.state();
            if require_multiplexed && !connection.is_multiplexed() {
                continue;
            }
            if !connection.is_eligible(&st, address, routes) {
                continue;
            }
            st.calls.push(CallReference::new(call));
            drop(st);
            trace!("reuse pooled connection for {}:{}", address.host(), address.port());
            return Some(connection);
        }
        None
    }

    /// Add a freshly dialed connection. The caller has already attached
    /// itself to it.
    pub(crate) fn put(&self, connection: Arc<Connection>) {
        debug_assert!(
            !connection.no_new_exchanges(),
            "refusing exchanges before ever entering the pool"
        );
        {
            let mut state = self.shared.state.lock().unwrap();
            debug!("pooling connection over {:?}", connection.route());
            state.connections.push(connection);
        }
        self.schedule_cleanup();
    }

    /// The last call just left `connection`. Called with the connection's
    /// state lock held. Returns true when the caller must close the socket
    /// because the connection was removed instead of idled.
    pub(crate) fn connection_became_idle(
        &self,
        connection: &Arc<Connection>,
        st: &mut ConnState,
    ) -> bool {
        if st.no_new_exchanges || self.shared.max_idle == 0 {
            self.remove(connection);
            true
        } else {
            st.idle_since = Instant::now();
            self.schedule_cleanup();
            false
        }
    }

    /// Close and remove every connection not carrying a call. Connections
    /// still in use are marked so they are evicted as soon as they drain.
    pub fn evict_all(&self) {
        for connection in self.snapshot() {
            let is_idle = {
                let mut st = connection.state();
                st.no_new_exchanges = true;
                st.calls.is_empty()
            };
            if is_idle {
                self.remove(&connection);
                connection.close();
            }
        }
    }

    fn schedule_cleanup(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.cleanup_scheduled {
                return;
            }
            state.cleanup_scheduled = true;
        }

        let weak = Arc::downgrade(&self.shared);
        self.shared
            .task_runner
            .schedule("connection pool cleanup", Duration::ZERO, move || {
                cleanup_task(&weak)
            });
    }

    /// One cleanup pass. Returns the delay until the next pass should run,
    /// or `None` when there is nothing left to watch.
    pub(crate) fn cleanup(&self, now: Instant) -> Option<Duration> {
        let keep_alive = self.shared.keep_alive;

        let mut in_use_count = 0usize;
        let mut idle_count = 0usize;
        let mut longest_idle: Option<Arc<Connection>> = None;
        let mut longest_idle_for = Duration::ZERO;

        for connection in self.snapshot() {
            let mut st = connection.state();

            self.prune_leaked_calls(&connection, &mut st, now);

            if !st.calls.is_empty() {
                in_use_count += 1;
                continue;
            }

            idle_count += 1;
            let idle_for = now.saturating_duration_since(st.idle_since);
            if longest_idle.is_none() || idle_for > longest_idle_for {
                longest_idle_for = idle_for;
                drop(st);
                longest_idle = Some(connection);
            }
        }

        match longest_idle {
            Some(connection)
                if longest_idle_for >= keep_alive || idle_count > self.shared.max_idle =>
            {
                // Re-verify under the lock: the connection may have been
                // reacquired, or released again later, since the snapshot.
                let still_evictable = {
                    let mut st = connection.state();
                    if st.calls.is_empty() && st.idle_since + longest_idle_for == now {
                        st.no_new_exchanges = true;
                        true
                    } else {
                        false
                    }
                };
                if still_evictable {
                    debug!(
                        "evicting connection idle for {:?} over {:?}",
                        longest_idle_for,
                        connection.route()
                    );
                    self.remove(&connection);
                    connection.close();
                }
                // Run again immediately to catch cascades.
                Some(Duration::ZERO)
            }
            Some(_) => Some(keep_alive - longest_idle_for),
            None if in_use_count > 0 => Some(keep_alive),
            None => None,
        }
    }

    /// Drop references to calls that were reclaimed without ending their
    /// exchange, reporting each as a leak. A connection that carried a
    /// leaked call is poisoned and scheduled for immediate eviction.
    fn prune_leaked_calls(&self, connection: &Arc<Connection>, st: &mut ConnState, now: Instant) {
        let before = st.calls.len();
        st.calls.retain(|reference| {
            if reference.call.strong_count() > 0 {
                return true;
            }
            error!(
                "connection to {:?} was leaked: a call was abandoned without \
                 closing its response body. Acquired at:\n{}",
                connection.route(),
                reference.acquired_at
            );
            false
        });

        if st.calls.len() < before {
            st.no_new_exchanges = true;
            if st.calls.is_empty() {
                // Backdate so the eviction check treats it as expired now.
                st.idle_since = now
                    .checked_sub(self.shared.keep_alive)
                    .unwrap_or(st.idle_since);
            }
        }
    }
}

fn cleanup_task(weak: &Weak<PoolShared>) -> Option<Duration> {
    let shared = weak.upgrade()?;
    let pool = ConnectionPool { shared };
    match pool.cleanup(Instant::now()) {
        Some(delay) => Some(delay),
        None => {
            // Nothing to watch. Unless a connection raced in, stop; the
            // next `put` schedules a fresh task.
            let mut state = pool.shared.state.lock().unwrap();
            if state.connections.is_empty() {
                state.cleanup_scheduled = false;
                None
            } else {
                Some(pool.shared.keep_alive)
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .field("max_idle", &self.shared.max_idle)
            .field("keep_alive", &self.shared.keep_alive)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_call, test_connection, TestHarness};

    const KEEP_ALIVE: Duration = Duration::from_secs(5);

    fn pool(max_idle: usize) -> ConnectionPool {
        ConnectionPool::with_task_runner(max_idle, KEEP_ALIVE, TaskRunner::new())
    }

    /// Insert directly, without `put`'s cleanup scheduling, so the tests
    /// drive every cleanup pass themselves.
    fn insert(pool: &ConnectionPool, connection: Arc<Connection>) {
        pool.shared
            .state
            .lock()
            .unwrap()
            .connections
            .push(connection);
    }

    fn idle_for(connection: &Arc<Connection>, now: Instant, idle: Duration) {
        connection.state().idle_since = now - idle;
    }

    #[test]
    fn cleanup_evicts_longest_idle_then_reschedules() {
        let _ = env_logger::try_init();
        let harness = TestHarness::new();
        let pool = pool(2);
        let now = Instant::now();

        let a = test_connection(&harness, "a.example");
        let b = test_connection(&harness, "b.example");
        let c = test_connection(&harness, "c.example");
        for conn in [&a, &b, &c] {
            insert(&pool, conn.clone());
        }
        idle_for(&a, now, Duration::from_secs(4));
        idle_for(&b, now, Duration::from_secs(3));
        idle_for(&c, now, Duration::from_secs(1));

        // Three idle > max_idle: the oldest goes, and the pass asks to be
        // re-run immediately.
        assert_eq!(pool.cleanup(now), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 2);
        assert!(a.no_new_exchanges());

        // Two idle fits: next wakeup when the now-oldest expires.
        assert_eq!(pool.cleanup(now), Some(KEEP_ALIVE - Duration::from_secs(3)));
        assert_eq!(pool.connection_count(), 2);
    }

    #[test]
    fn cleanup_evicts_expired_connection() {
        let harness = TestHarness::new();
        let pool = pool(5);
        let now = Instant::now();

        let a = test_connection(&harness, "a.example");
        insert(&pool, a.clone());
        idle_for(&a, now, KEEP_ALIVE);

        assert_eq!(pool.cleanup(now), Some(Duration::ZERO));
        assert_eq!(pool.connection_count(), 0);
        assert!(harness.closed_transports() >= 1);
    }

    #[test]
    fn cleanup_delay_tracks_most_idle_connection() {
        let harness = TestHarness::new();
        let pool = pool(5);
        let now = Instant::now();

        let a = test_connection(&harness, "a.example");
        insert(&pool, a.clone());

        idle_for(&a, now, Duration::from_secs(1));
        assert_eq!(pool.cleanup(now), Some(Duration::from_secs(4)));

        idle_for(&a, now, Duration::from_secs(3));
        assert_eq!(pool.cleanup(now), Some(Duration::from_secs(2)));
    }

    #[test]
    fn cleanup_with_only_in_use_returns_keep_alive() {
        let harness = TestHarness::new();
        let pool = pool(5);
        let call = test_call(&harness, "http://a.example/");

        let a = test_connection(&harness, "a.example");
        a.state().calls.push(CallReference::new(&call));
        insert(&pool, a);

        assert_eq!(pool.cleanup(Instant::now()), Some(KEEP_ALIVE));
    }

    #[test]
    fn cleanup_with_empty_pool_stops() {
        let pool = pool(5);
        assert_eq!(pool.cleanup(Instant::now()), None);
    }

    #[test]
    fn leaked_call_is_pruned_and_connection_poisoned() {
        let _ = env_logger::try_init();
        let harness = TestHarness::new();
        let pool = pool(5);
        let now = Instant::now();

        let a = test_connection(&harness, "a.example");
        {
            let call = test_call(&harness, "http://a.example/");
            a.state().calls.push(CallReference::new(&call));
            // The call is dropped here without ever finishing.
        }
        insert(&pool, a.clone());

        assert_eq!(pool.cleanup(now), Some(Duration::ZERO));
        assert!(a.no_new_exchanges());
        assert_eq!(pool.connection_count(), 0, "backdated and evicted");
    }

    #[test]
    fn evict_all_spares_connections_in_use() {
        let harness = TestHarness::new();
        let pool = pool(5);
        let call = test_call(&harness, "http://busy.example/");

        let busy = test_connection(&harness, "busy.example");
        busy.state().calls.push(CallReference::new(&call));
        let idle = test_connection(&harness, "idle.example");
        insert(&pool, busy.clone());
        insert(&pool, idle);

        pool.evict_all();

        assert_eq!(pool.connection_count(), 1);
        assert!(busy.no_new_exchanges(), "drained connections die next");
        drop(call);
    }

    #[test]
    fn acquire_matches_address_and_flags() {
        let harness = TestHarness::new();
        let pool = pool(5);
        let call = test_call(&harness, "http://a.example/");

        let a = test_connection(&harness, "a.example");
        insert(&pool, a.clone());

        assert!(
            pool.acquire(&harness.address("b.example"), &call, None, false)
                .is_none(),
            "host mismatch"
        );
        assert!(
            pool.acquire(&harness.address("a.example"), &call, None, true)
                .is_none(),
            "not multiplexed"
        );

        let hit = pool
            .acquire(&harness.address("a.example"), &call, None, false)
            .expect("eligible connection");
        assert!(Arc::ptr_eq(&hit, &a));
        assert_eq!(a.state().calls.len(), 1);

        // An HTTP/1.1 connection carries one exchange at a time.
        assert!(
            pool.acquire(&harness.address("a.example"), &call, None, false)
                .is_none()
        );

        a.set_no_new_exchanges();
        a.state().calls.clear();
        assert!(
            pool.acquire(&harness.address("a.example"), &call, None, false)
                .is_none(),
            "no_new_exchanges refuses acquisition"
        );
    }
}
