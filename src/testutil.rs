//! Shared fakes for unit tests: a client wired to collaborators that never
//! touch the network.

use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http::Method;
use url::Url;

use crate::address::{Address, Route};
use crate::call::Call;
use crate::client::Client;
use crate::codec::Codec;
use crate::connection::Connection;
use crate::request::Request;
use crate::task::TaskRunner;
use crate::transport::{Connector, Dialed, Protocol, Proxy, Resolve, Transport};

pub(crate) struct TestHarness {
    client: Client,
    closed: Arc<AtomicUsize>,
}

impl TestHarness {
    pub(crate) fn new() -> TestHarness {
        let client = Client::builder()
            .connector(Arc::new(NoDial))
            .dns(Arc::new(TestDns))
            .task_runner(TaskRunner::new())
            .build()
            .expect("test client");
        TestHarness {
            client,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// The address `host` resolves to under the harness client; equal for
    /// equal hosts, sharing collaborator identity with the client.
    pub(crate) fn address(&self, host: &str) -> Address {
        let url: Url = format!("http://{host}/").parse().expect("test url");
        self.client.address_for(&url).expect("test address")
    }

    pub(crate) fn transport(&self) -> Box<dyn Transport> {
        Box::new(FakeTransport {
            closed: self.closed.clone(),
        })
    }

    /// How many fake transports have had their socket closed.
    pub(crate) fn closed_transports(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

pub(crate) fn test_connection(harness: &TestHarness, host: &str) -> Arc<Connection> {
    let address = harness.address(host);
    let route = Route::new(address, Proxy::Direct, "10.0.0.1:80".parse().unwrap());
    Connection::new(
        route,
        Dialed {
            transport: harness.transport(),
            protocol: Protocol::Http11,
            handshake: None,
        },
    )
}

pub(crate) fn test_call(harness: &TestHarness, url: &str) -> Call {
    let request = Request::new(Method::GET, url.parse().expect("test url"));
    harness.client.new_call(request)
}

struct TestDns;

impl Resolve for TestDns {
    fn resolve(&self, _host: &str) -> io::Result<Vec<IpAddr>> {
        Ok(vec!["10.0.0.1".parse().unwrap()])
    }
}

struct NoDial;

impl Connector for NoDial {
    fn connect(&self, _route: &Route, _call: &Call) -> crate::Result<Dialed> {
        Err(crate::Error::connect("the test harness never dials"))
    }
}

struct FakeTransport {
    closed: Arc<AtomicUsize>,
}

impl Transport for FakeTransport {
    fn new_codec(&self) -> crate::Result<Box<dyn Codec>> {
        Err(crate::Error::contract("the test transport has no codec"))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn cancel(&self) {}

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}
