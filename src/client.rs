use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderValue};
use url::Url;

use crate::address::{Address, RouteDatabase};
use crate::cache::CacheStore;
use crate::call::Call;
use crate::cookie::{CookieJar, NoCookies};
use crate::dispatcher::Dispatcher;
use crate::events::{EventListener, NoEvents};
use crate::interceptor::Interceptor;
use crate::pool::ConnectionPool;
use crate::request::Request;
use crate::response::Response;
use crate::task::TaskRunner;
use crate::transport::{Connector, Protocol, Proxy, Resolve, SystemResolver};

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_IDLE: usize = 5;

/// The engine's entry point: configuration plus the shared machinery
/// (dispatcher, connection pool, cache) calls run on.
///
/// A `Client` is cheap to clone and should be reused; each clone shares the
/// same pool and dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

struct ClientRef {
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    connector: Arc<dyn Connector>,
    dns: Arc<dyn Resolve>,
    proxies: Vec<Proxy>,
    protocols: Vec<Protocol>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn CacheStore>>,
    events: Arc<dyn EventListener>,
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    task_runner: TaskRunner,
    route_database: Arc<RouteDatabase>,
    default_headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    call_timeout: Option<Duration>,
    timeouts: Timeouts,
    follow_redirects: bool,
    retry_on_connection_failure: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Timeouts {
    pub(crate) connect: Option<Duration>,
    pub(crate) read: Option<Duration>,
    pub(crate) write: Option<Duration>,
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a call for `request`. Nothing happens until the call is
    /// executed or enqueued.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request, false)
    }

    /// Create a websocket upgrade call: network interceptors are skipped
    /// and a `101` response is surfaced with an empty body.
    pub fn new_web_socket_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request, true)
    }

    /// Execute `request` synchronously on the current thread.
    pub fn execute(&self, request: Request) -> crate::Result<Response> {
        self.new_call(request).execute()
    }

    /// The dispatcher running this client's asynchronous calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The connection pool this client draws from.
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub(crate) fn cookie_jar(&self) -> &Arc<dyn CookieJar> {
        &self.inner.cookie_jar
    }

    pub(crate) fn cache(&self) -> &Option<Arc<dyn CacheStore>> {
        &self.inner.cache
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventListener> {
        &self.inner.events
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn task_runner(&self) -> &TaskRunner {
        &self.inner.task_runner
    }

    pub(crate) fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_database
    }

    pub(crate) fn default_headers(&self) -> &HeaderMap {
        &self.inner.default_headers
    }

    pub(crate) fn user_agent(&self) -> &Option<HeaderValue> {
        &self.inner.user_agent
    }

    pub(crate) fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    pub(crate) fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    pub(crate) fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    pub(crate) fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    /// The address `url` resolves to under this client's configuration.
    pub(crate) fn address_for(&self, url: &Url) -> crate::Result<Address> {
        Address::new(
            url,
            self.inner.dns.clone(),
            self.inner.connector.clone(),
            self.inner.proxies.clone(),
            self.inner.protocols.clone(),
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Client");
        self.inner.fmt_fields(&mut builder);
        builder.finish()
    }
}

impl ClientRef {
    fn fmt_fields(&self, f: &mut fmt::DebugStruct<'_, '_>) {
        // Only print fields whose output carries signal.
        if !self.interceptors.is_empty() {
            f.field("interceptors", &self.interceptors.len());
        }
        if !self.network_interceptors.is_empty() {
            f.field("network_interceptors", &self.network_interceptors.len());
        }
        if !self.proxies.is_empty() {
            f.field("proxies", &self.proxies);
        }
        if self.cache.is_some() {
            f.field("cache", &true);
        }
        if let Some(ref d) = self.call_timeout {
            f.field("timeout", d);
        }
        if !self.follow_redirects {
            f.field("follow_redirects", &false);
        }
        f.field("default_headers", &self.default_headers);
    }
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    connector: Option<Arc<dyn Connector>>,
    dns: Arc<dyn Resolve>,
    proxies: Vec<Proxy>,
    protocols: Vec<Protocol>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn CacheStore>>,
    events: Arc<dyn EventListener>,
    dispatcher: Option<Dispatcher>,
    pool: Option<ConnectionPool>,
    task_runner: Option<TaskRunner>,
    default_headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    error: Option<crate::Error>,
    call_timeout: Option<Duration>,
    timeouts: Timeouts,
    keep_alive: Duration,
    max_idle_connections: usize,
    follow_redirects: bool,
    retry_on_connection_failure: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                interceptors: Vec::new(),
                network_interceptors: Vec::new(),
                connector: None,
                dns: Arc::new(SystemResolver),
                proxies: Vec::new(),
                protocols: vec![Protocol::Http11, Protocol::H2],
                cookie_jar: Arc::new(NoCookies),
                cache: None,
                events: Arc::new(NoEvents),
                dispatcher: None,
                pool: None,
                task_runner: None,
                default_headers: HeaderMap::new(),
                user_agent: None,
                error: None,
                call_timeout: None,
                timeouts: Timeouts::default(),
                keep_alive: DEFAULT_KEEP_ALIVE,
                max_idle_connections: DEFAULT_MAX_IDLE,
                follow_redirects: true,
                retry_on_connection_failure: true,
            },
        }
    }

    /// Add an application interceptor: runs once per call, before retries
    /// and redirects.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.config.interceptors.push(interceptor);
        self
    }

    /// Add a network interceptor: runs once per attempt with a live
    /// exchange on the chain. Skipped for websocket calls.
    pub fn network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> ClientBuilder {
        self.config.network_interceptors.push(interceptor);
        self
    }

    /// The connector that dials routes. Required.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> ClientBuilder {
        self.config.connector = Some(connector);
        self
    }

    /// Override the DNS resolver.
    pub fn dns(mut self, dns: Arc<dyn Resolve>) -> ClientBuilder {
        self.config.dns = dns;
        self
    }

    /// Add a proxy to try, in order, before a direct connection.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.config.proxies.push(proxy);
        self
    }

    /// The protocols to advertise when dialing, in preference order.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> ClientBuilder {
        self.config.protocols = protocols;
        self
    }

    /// Provide a cookie jar consulted on every attempt.
    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> ClientBuilder {
        self.config.cookie_jar = jar;
        self
    }

    /// Provide a response cache.
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> ClientBuilder {
        self.config.cache = Some(cache);
        self
    }

    /// Receive lifecycle events for every call.
    pub fn event_listener(mut self, events: Arc<dyn EventListener>) -> ClientBuilder {
        self.config.events = events;
        self
    }

    /// Use a specific dispatcher, e.g. to share limits across clients.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> ClientBuilder {
        self.config.dispatcher = Some(dispatcher);
        self
    }

    /// Use a specific connection pool, e.g. to share it across clients.
    pub fn connection_pool(mut self, pool: ConnectionPool) -> ClientBuilder {
        self.config.pool = Some(pool);
        self
    }

    /// Use a specific task runner for timeouts and pool maintenance.
    pub fn task_runner(mut self, task_runner: TaskRunner) -> ClientBuilder {
        self.config.task_runner = Some(task_runner);
        self
    }

    /// Sets the default headers for every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        self.config.default_headers = headers;
        self
    }

    /// Sets the `User-Agent` header to be used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => self.config.user_agent = Some(value),
            Err(e) => self.config.error = Some(crate::Error::builder(e.into())),
        }
        self
    }

    /// Enables a total timeout for each call, from `execute` to the last
    /// body byte.
    pub fn timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Set a timeout for only the connect phase.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeouts.connect = Some(timeout);
        self
    }

    /// Set a timeout for individual reads from the transport.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeouts.read = Some(timeout);
        self
    }

    /// Set a timeout for individual writes to the transport.
    pub fn write_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.config.timeouts.write = Some(timeout);
        self
    }

    /// How long idle connections are kept for reuse.
    pub fn keep_alive(mut self, keep_alive: Duration) -> ClientBuilder {
        self.config.keep_alive = keep_alive;
        self
    }

    /// How many idle connections the pool retains.
    pub fn max_idle_connections(mut self, max_idle: usize) -> ClientBuilder {
        self.config.max_idle_connections = max_idle;
        self
    }

    /// Whether redirect responses are followed automatically.
    pub fn follow_redirects(mut self, follow: bool) -> ClientBuilder {
        self.config.follow_redirects = follow;
        self
    }

    /// Whether to retry when a connection fails and another route remains.
    pub fn retry_on_connection_failure(mut self, retry: bool) -> ClientBuilder {
        self.config.retry_on_connection_failure = retry;
        self
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// Fails when no connector was provided or a configuration value was
    /// invalid.
    pub fn build(self) -> crate::Result<Client> {
        let config = self.config;
        if let Some(error) = config.error {
            return Err(error);
        }
        let connector = config
            .connector
            .ok_or_else(|| crate::Error::builder("a connector is required"))?;
        let task_runner = config
            .task_runner
            .unwrap_or_else(|| TaskRunner::global().clone());
        let pool = config.pool.unwrap_or_else(|| {
            ConnectionPool::with_task_runner(
                config.max_idle_connections,
                config.keep_alive,
                task_runner.clone(),
            )
        });

        Ok(Client {
            inner: Arc::new(ClientRef {
                interceptors: config.interceptors,
                network_interceptors: config.network_interceptors,
                connector,
                dns: config.dns,
                proxies: config.proxies,
                protocols: config.protocols,
                cookie_jar: config.cookie_jar,
                cache: config.cache,
                events: config.events,
                dispatcher: config.dispatcher.unwrap_or_default(),
                pool,
                task_runner,
                route_database: Arc::new(RouteDatabase::default()),
                default_headers: config.default_headers,
                user_agent: config.user_agent,
                call_timeout: config.call_timeout,
                timeouts: config.timeouts,
                follow_redirects: config.follow_redirects,
                retry_on_connection_failure: config.retry_on_connection_failure,
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("default_headers", &self.config.default_headers)
            .field("follow_redirects", &self.config.follow_redirects)
            .finish()
    }
}
