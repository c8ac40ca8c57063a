use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use log::trace;

use crate::call::{AsyncCall, Call};

const DEFAULT_MAX_REQUESTS: usize = 64;
const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

/// Schedules asynchronous calls onto worker threads, bounding how many run
/// at once overall and per host. Synchronous calls are only counted.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    max_requests: usize,
    max_requests_per_host: usize,
    state: Mutex<DispatchState>,
    idle_callback: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

struct DispatchState {
    ready: VecDeque<AsyncCall>,
    running_async: usize,
    running_sync: usize,
    running_per_host: HashMap<String, usize>,
}

impl Dispatcher {
    /// A dispatcher with the default limits.
    pub fn new() -> Dispatcher {
        Dispatcher::with_limits(DEFAULT_MAX_REQUESTS, DEFAULT_MAX_REQUESTS_PER_HOST)
    }

    /// A dispatcher running at most `max_requests` calls, and at most
    /// `max_requests_per_host` to any single host, concurrently.
    pub fn with_limits(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                max_requests,
                max_requests_per_host,
                state: Mutex::new(DispatchState {
                    ready: VecDeque::new(),
                    running_async: 0,
                    running_sync: 0,
                    running_per_host: HashMap::new(),
                }),
                idle_callback: Mutex::new(None),
            }),
        }
    }

    /// Invoke `callback` whenever the dispatcher becomes idle: no running
    /// and no queued calls.
    pub fn set_idle_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.idle_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Calls currently executing, synchronous and asynchronous.
    pub fn running_calls_count(&self) -> usize {
        let st = self.inner.state.lock().unwrap();
        st.running_async + st.running_sync
    }

    /// Asynchronous calls waiting for a worker slot.
    pub fn queued_calls_count(&self) -> usize {
        self.inner.state.lock().unwrap().ready.len()
    }

    pub(crate) fn executed(&self, call: &Call) {
        trace!("executing call to {}", call.request().url());
        self.inner.state.lock().unwrap().running_sync += 1;
    }

    pub(crate) fn finished_sync(&self, _call: &Call) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.running_sync -= 1;
        }
        self.maybe_idle();
    }

    pub(crate) fn enqueue(&self, call: AsyncCall) {
        trace!("enqueueing call to {}", call.call().request().url());
        self.inner.state.lock().unwrap().ready.push_back(call);
        self.promote_and_execute();
    }

    /// Move ready calls into the running set as capacity allows, and spawn
    /// a worker for each.
    fn promote_and_execute(&self) {
        let mut executable = Vec::new();
        {
            let mut st = self.inner.state.lock().unwrap();
            let mut index = 0;
            while index < st.ready.len() {
                if st.running_async >= self.inner.max_requests {
                    break;
                }
                let host = st.ready[index].host();
                let host_running = st.running_per_host.get(&host).copied().unwrap_or(0);
                if host_running >= self.inner.max_requests_per_host {
                    index += 1;
                    continue;
                }
                let call = st.ready.remove(index).expect("index in bounds");
                st.running_async += 1;
                *st.running_per_host.entry(host).or_insert(0) += 1;
                executable.push(call);
            }
        }

        for call in executable {
            let dispatcher = self.clone();
            let host = call.host();
            thread::Builder::new()
                .name("carrier Dispatcher".into())
                .spawn(move || {
                    call.run();
                    dispatcher.finished_async(&host);
                })
                .expect("failed to spawn dispatcher worker");
        }
    }

    fn finished_async(&self, host: &str) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.running_async -= 1;
            if let Some(count) = st.running_per_host.get_mut(host) {
                *count -= 1;
                if *count == 0 {
                    st.running_per_host.remove(host);
                }
            }
        }
        self.promote_and_execute();
        self.maybe_idle();
    }

    fn maybe_idle(&self) {
        let idle = {
            let st = self.inner.state.lock().unwrap();
            st.running_async == 0 && st.running_sync == 0 && st.ready.is_empty()
        };
        if idle {
            if let Some(callback) = &*self.inner.idle_callback.lock().unwrap() {
                callback();
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Dispatcher {
        Dispatcher::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("Dispatcher")
            .field("running", &(st.running_async + st.running_sync))
            .field("queued", &st.ready.len())
            .field("max_requests", &self.inner.max_requests)
            .field("max_requests_per_host", &self.inner.max_requests_per_host)
            .finish()
    }
}
