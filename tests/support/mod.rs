//! A scripted server side for engine tests: a connector, transport and
//! codec that replay canned exchanges without any sockets.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};

use carrier::{
    BodySink, BodySource, CacheStore, CacheWriteHandle, Call, Client, ClientBuilder, Codec,
    ConnectionShutdown, Connector, Dialed, Protocol, Request, Resolve, Response, ResponseBody,
    ResponseHead, Route, TaskRunner, Transport,
};

/// One canned request/response turn.
#[derive(Clone)]
pub struct ScriptedExchange {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    early_reply: bool,
    shutdown_on_read: bool,
    interim_100: bool,
    stall_ms: u64,
}

/// Start scripting a reply with `status`.
pub fn reply(status: u16) -> ScriptedExchange {
    ScriptedExchange {
        status,
        headers: Vec::new(),
        body: Vec::new(),
        early_reply: false,
        shutdown_on_read: false,
        interim_100: false,
        stall_ms: 0,
    }
}

/// Script a connection shutdown instead of a response.
pub fn shutdown() -> ScriptedExchange {
    let mut exchange = reply(0);
    exchange.shutdown_on_read = true;
    exchange
}

impl ScriptedExchange {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Answer an `Expect: 100-continue` request before its body.
    pub fn early_reply(mut self) -> Self {
        self.early_reply = true;
        self
    }

    /// Send an interim `100` head before the real one.
    pub fn interim_100(mut self) -> Self {
        self.interim_100 = true;
        self
    }

    /// Delay the response head by `ms` milliseconds.
    pub fn stall(mut self, ms: u64) -> Self {
        self.stall_ms = ms;
        self
    }

    fn head(&self) -> ResponseHead {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            headers.append(
                name.parse::<HeaderName>().expect("scripted header name"),
                HeaderValue::from_str(value).expect("scripted header value"),
            );
        }
        ResponseHead {
            status: StatusCode::from_u16(self.status).expect("scripted status"),
            version: Version::HTTP_11,
            headers,
        }
    }
}

/// A request as the scripted server saw it.
#[derive(Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    body: Arc<Mutex<Vec<u8>>>,
}

impl RecordedRequest {
    pub fn body(&self) -> Vec<u8> {
        self.body.lock().unwrap().clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }
}

struct ServerInner {
    script: Mutex<VecDeque<ScriptedExchange>>,
    requests: Mutex<Vec<RecordedRequest>>,
    dials: AtomicUsize,
}

/// The scripted peer every test client talks to.
#[derive(Clone)]
pub struct FakeServer {
    inner: Arc<ServerInner>,
}

impl FakeServer {
    pub fn new() -> FakeServer {
        FakeServer {
            inner: Arc::new(ServerInner {
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                dials: AtomicUsize::new(0),
            }),
        }
    }

    pub fn enqueue(&self, exchange: ScriptedExchange) {
        self.inner.script.lock().unwrap().push_back(exchange);
    }

    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().unwrap().clone()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.inner.clone(),
        })
    }

    /// A client builder wired to this server, with no real DNS and its own
    /// task runner.
    pub fn client_builder(&self) -> ClientBuilder {
        Client::builder()
            .connector(self.connector())
            .dns(Arc::new(FakeDns))
            .task_runner(TaskRunner::new())
    }

    pub fn client(&self) -> Client {
        self.client_builder().build().expect("test client")
    }
}

pub struct FakeDns;

impl Resolve for FakeDns {
    fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        Ok(vec!["127.0.0.1".parse().unwrap()])
    }
}

struct FakeConnector {
    server: Arc<ServerInner>,
}

impl Connector for FakeConnector {
    fn connect(&self, _route: &Route, _call: &Call) -> carrier::Result<Dialed> {
        self.server.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Dialed {
            transport: Box::new(FakeTransport {
                server: self.server.clone(),
                broken: Arc::new(AtomicBool::new(false)),
            }),
            protocol: Protocol::Http11,
            handshake: None,
        })
    }
}

struct FakeTransport {
    server: Arc<ServerInner>,
    broken: Arc<AtomicBool>,
}

impl Transport for FakeTransport {
    fn new_codec(&self) -> carrier::Result<Box<dyn Codec>> {
        Ok(Box::new(FakeCodec {
            server: self.server.clone(),
            broken: self.broken.clone(),
            state: Mutex::new(CodecState {
                exchange: None,
                interim_sent: false,
            }),
        }))
    }

    fn is_healthy(&self) -> bool {
        !self.broken.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

struct CodecState {
    exchange: Option<ScriptedExchange>,
    interim_sent: bool,
}

struct FakeCodec {
    server: Arc<ServerInner>,
    broken: Arc<AtomicBool>,
    state: Mutex<CodecState>,
}

impl FakeCodec {
    fn current(&self) -> io::Result<ScriptedExchange> {
        let mut state = self.state.lock().unwrap();
        if state.exchange.is_none() {
            state.exchange = self.server.script.lock().unwrap().pop_front();
        }
        state
            .exchange
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted"))
    }
}

impl Codec for FakeCodec {
    fn write_request_headers(&self, request: &Request) -> io::Result<()> {
        self.server.requests.lock().unwrap().push(RecordedRequest {
            method: request.method().to_string(),
            path: request.url().path().to_string(),
            headers: request.headers().clone(),
            body: Arc::new(Mutex::new(Vec::new())),
        });
        Ok(())
    }

    fn flush_request(&self) -> io::Result<()> {
        Ok(())
    }

    fn create_request_body(
        &self,
        _request: &Request,
        _duplex: bool,
    ) -> io::Result<Box<dyn BodySink>> {
        let target = self
            .server
            .requests
            .lock()
            .unwrap()
            .last()
            .expect("headers written before body")
            .body
            .clone();
        Ok(Box::new(RecordingSink { target }))
    }

    fn finish_request(&self) -> io::Result<()> {
        Ok(())
    }

    fn read_response_headers(&self, expect_continue: bool) -> io::Result<Option<ResponseHead>> {
        let exchange = self.current()?;

        if exchange.stall_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(exchange.stall_ms));
        }

        if exchange.shutdown_on_read {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                ConnectionShutdown,
            ));
        }

        if expect_continue {
            if exchange.early_reply {
                return Ok(Some(exchange.head()));
            }
            // The scripted server wants the body; 100 was "sent".
            return Ok(None);
        }

        if exchange.interim_100 {
            let mut state = self.state.lock().unwrap();
            if !state.interim_sent {
                state.interim_sent = true;
                return Ok(Some(ResponseHead {
                    status: StatusCode::CONTINUE,
                    version: Version::HTTP_11,
                    headers: HeaderMap::new(),
                }));
            }
        }

        Ok(Some(exchange.head()))
    }

    fn open_response_body(&self, _response: &Response) -> io::Result<Box<dyn BodySource>> {
        let exchange = self.current()?;
        Ok(Box::new(ScriptedBody {
            cursor: io::Cursor::new(exchange.body),
        }))
    }

    fn is_multiplexed(&self) -> bool {
        false
    }

    fn cancel(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

struct RecordingSink {
    target: Arc<Mutex<Vec<u8>>>,
}

impl Write for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.target.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BodySink for RecordingSink {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ScriptedBody {
    cursor: io::Cursor<Vec<u8>>,
}

impl Read for ScriptedBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl BodySource for ScriptedBody {
    fn content_length(&self) -> Option<u64> {
        let total = self.cursor.get_ref().len() as u64;
        Some(total.saturating_sub(self.cursor.position()))
    }
}

/// An in-memory `CacheStore` for cache interceptor tests.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<MemoryCacheInner>,
}

struct MemoryCacheInner {
    entries: Mutex<HashMap<String, Entry>>,
    conditional_hits: AtomicUsize,
}

#[derive(Clone)]
struct Entry {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    sent_at: SystemTime,
    received_at: SystemTime,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache {
            inner: Arc::new(MemoryCacheInner {
                entries: Mutex::new(HashMap::new()),
                conditional_hits: AtomicUsize::new(0),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }

    pub fn conditional_hits(&self) -> usize {
        self.inner.conditional_hits.load(Ordering::SeqCst)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.inner.entries.lock().unwrap().contains_key(url)
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, request: &Request) -> Option<Response> {
        if request.method() != Method::GET {
            return None;
        }
        let entries = self.inner.entries.lock().unwrap();
        let entry = entries.get(request.url().as_str())?;
        Some(
            Response::builder()
                .status(entry.status)
                .headers(entry.headers.clone())
                .request(request.clone())
                .sent_at(entry.sent_at)
                .received_at(entry.received_at)
                .body(ResponseBody::bytes_body(entry.body.clone()))
                .build(),
        )
    }

    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriteHandle>> {
        if response.request().method() != Method::GET {
            return None;
        }
        Some(Box::new(MemoryWrite {
            cache: self.clone(),
            key: response.request().url().to_string(),
            entry: Entry {
                status: response.status(),
                headers: response.headers().clone(),
                body: Vec::new(),
                sent_at: response.sent_at(),
                received_at: response.received_at(),
            },
        }))
    }

    fn remove(&self, request: &Request) {
        self.inner
            .entries
            .lock()
            .unwrap()
            .remove(request.url().as_str());
    }

    fn update(&self, _cached: &Response, network: &Response) {
        let mut entries = self.inner.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(network.url().as_str()) {
            entry.headers = network.headers().clone();
            entry.sent_at = network.sent_at();
            entry.received_at = network.received_at();
        }
    }

    fn track_conditional_hit(&self) {
        self.inner.conditional_hits.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryWrite {
    cache: MemoryCache,
    key: String,
    entry: Entry,
}

impl CacheWriteHandle for MemoryWrite {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.entry.body.extend_from_slice(data);
        Ok(())
    }

    fn commit(self: Box<Self>) {
        self.cache
            .inner
            .entries
            .lock()
            .unwrap()
            .insert(self.key.clone(), self.entry.clone());
    }

    fn abort(self: Box<Self>) {}
}

/// Records which events fired, in order, for assertions.
#[derive(Clone)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingEvents {
    pub fn new() -> RecordingEvents {
        RecordingEvents {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().iter().any(|n| n == name)
    }

    fn record(&self, name: &str) {
        self.events.lock().unwrap().push(name.to_string());
    }
}

impl carrier::EventListener for RecordingEvents {
    fn call_start(&self, _call: &Call) {
        self.record("call_start");
    }

    fn call_end(&self, _call: &Call) {
        self.record("call_end");
    }

    fn call_failed(&self, _call: &Call, _error: &carrier::Error) {
        self.record("call_failed");
    }

    fn canceled(&self, _call: &Call) {
        self.record("canceled");
    }

    fn connection_acquired(&self, _call: &Call, _connection: &carrier::Connection) {
        self.record("connection_acquired");
    }

    fn connection_released(&self, _call: &Call, _connection: &carrier::Connection) {
        self.record("connection_released");
    }

    fn cache_hit(&self, _call: &Call, _response: &Response) {
        self.record("cache_hit");
    }

    fn cache_miss(&self, _call: &Call) {
        self.record("cache_miss");
    }

    fn cache_conditional_hit(&self, _call: &Call, _response: &Response) {
        self.record("cache_conditional_hit");
    }

    fn satisfaction_failure(&self, _call: &Call, _response: &Response) {
        self.record("satisfaction_failure");
    }

    fn response_headers_start(&self, _call: &Call) {
        self.record("response_headers_start");
    }

    fn response_headers_end(&self, _call: &Call, _response: &Response) {
        self.record("response_headers_end");
    }
}
