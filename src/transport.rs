use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::address::Route;
use crate::call::Call;
use crate::codec::Codec;

/// The application protocol negotiated for a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// HTTP/1.1: one exchange at a time per connection.
    Http11,
    /// HTTP/2: concurrent streams multiplexed over one connection.
    H2,
}

impl Protocol {
    /// Whether connections speaking this protocol carry concurrent streams.
    pub fn is_multiplexed(self) -> bool {
        matches!(self, Protocol::H2)
    }

    /// The corresponding `http::Version`.
    pub fn as_http_version(self) -> http::Version {
        match self {
            Protocol::Http11 => http::Version::HTTP_11,
            Protocol::H2 => http::Version::HTTP_2,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
        })
    }
}

/// A record of the TLS handshake that secured a connection.
#[derive(Clone, Debug)]
pub struct Handshake {
    tls_version: String,
    cipher_suite: String,
}

impl Handshake {
    /// Record a handshake.
    pub fn new(tls_version: impl Into<String>, cipher_suite: impl Into<String>) -> Handshake {
        Handshake {
            tls_version: tls_version.into(),
            cipher_suite: cipher_suite.into(),
        }
    }

    /// The negotiated TLS version, e.g. `TLSv1.3`.
    pub fn tls_version(&self) -> &str {
        &self.tls_version
    }

    /// The negotiated cipher suite.
    pub fn cipher_suite(&self) -> &str {
        &self.cipher_suite
    }
}

/// Resolves a hostname to an ordered list of IP addresses.
pub trait Resolve: Send + Sync {
    /// The IPs to dial for `host`, in preference order.
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// A resolver backed by the operating system's `getaddrinfo`.
#[derive(Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // The port is irrelevant, ToSocketAddrs just demands one.
        let addrs = (host, 0u16).to_socket_addrs()?;
        Ok(addrs.map(|a| a.ip()).collect())
    }
}

/// The product of a successful dial: a live transport plus what was
/// negotiated on the way up.
pub struct Dialed {
    /// The established transport.
    pub transport: Box<dyn Transport>,
    /// The negotiated application protocol.
    pub protocol: Protocol,
    /// The TLS handshake, when the route was secured.
    pub handshake: Option<Handshake>,
}

impl fmt::Debug for Dialed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Dialed")
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Dials routes: TCP connect, optional proxy tunnel, optional TLS upgrade,
/// protocol negotiation. Implementations should poll `call.is_canceled()`
/// at blocking boundaries and abort promptly when it reports true.
pub trait Connector: Send + Sync {
    /// Establish a transport over `route` on behalf of `call`.
    fn connect(&self, route: &Route, call: &Call) -> crate::Result<Dialed>;
}

/// An established, framed connection to a peer. One transport backs one
/// [`Connection`](crate::Connection); codecs created from it perform the
/// per-exchange framing.
pub trait Transport: Send + Sync {
    /// Create a codec for a single request/response exchange.
    fn new_codec(&self) -> crate::Result<Box<dyn Codec>>;

    /// Whether the transport can currently carry a new exchange: socket
    /// open, not shut down, no pending protocol state.
    fn is_healthy(&self) -> bool;

    /// Abort everything in flight. Safe to invoke from any thread.
    fn cancel(&self);

    /// Close the underlying socket. The terminal step of eviction.
    fn close(&self);
}

/// Where a socket is pointed: directly at the origin or through a proxy.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect straight to the origin server.
    Direct,
    /// Tunnel through an HTTP proxy.
    Http {
        /// Proxy hostname.
        host: String,
        /// Proxy port.
        port: u16,
    },
}

impl Proxy {
    /// The socket addresses to dial for this proxy choice, given the origin
    /// endpoint's resolved IPs.
    pub(crate) fn socket_addrs(&self, origin_port: u16, ips: &[IpAddr]) -> Vec<SocketAddr> {
        match self {
            Proxy::Direct => ips.iter().map(|ip| SocketAddr::new(*ip, origin_port)).collect(),
            Proxy::Http { port, .. } => ips.iter().map(|ip| SocketAddr::new(*ip, *port)).collect(),
        }
    }

    /// The hostname DNS must resolve for this proxy choice.
    pub(crate) fn dns_host<'a>(&'a self, origin_host: &'a str) -> &'a str {
        match self {
            Proxy::Direct => origin_host,
            Proxy::Http { host, .. } => host,
        }
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("direct"),
            Proxy::Http { host, port } => write!(f, "http://{host}:{port}"),
        }
    }
}
