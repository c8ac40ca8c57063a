use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::debug;
use url::Url;

use crate::transport::{Connector, Protocol, Proxy, Resolve};

/// The endpoint and transport configuration a request resolves to.
///
/// Two requests may share a pooled connection only when their addresses are
/// equal: same endpoint, same collaborators (resolver, connector), same
/// proxy candidates, same protocols. Collaborator identity is pointer
/// identity, the way the engine's configuration shares them.
#[derive(Clone)]
pub struct Address {
    host: String,
    port: u16,
    is_tls: bool,
    dns: Arc<dyn Resolve>,
    connector: Arc<dyn Connector>,
    proxies: Vec<Proxy>,
    protocols: Vec<Protocol>,
}

impl Address {
    pub(crate) fn new(
        url: &Url,
        dns: Arc<dyn Resolve>,
        connector: Arc<dyn Connector>,
        proxies: Vec<Proxy>,
        protocols: Vec<Protocol>,
    ) -> crate::Result<Address> {
        let host = url
            .host_str()
            .ok_or_else(|| crate::Error::builder("URL lacks a host").with_url(url.clone()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| crate::Error::builder("URL lacks a port").with_url(url.clone()))?;
        Ok(Address {
            host,
            port,
            is_tls: url.scheme() == "https",
            dns,
            connector,
            proxies,
            protocols,
        })
    }

    /// The endpoint hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The endpoint port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether connections to this address are secured.
    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    /// The protocols advertised when dialing, in preference order.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub(crate) fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Equality of everything except the endpoint host. Connections may be
    /// coalesced across hosts only when this holds.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        self.port == other.port
            && self.is_tls == other.is_tls
            && Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.connector, &other.connector)
            && self.proxies == other.proxies
            && self.protocols == other.protocols
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.host == other.host && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.is_tls.hash(state);
        (Arc::as_ptr(&self.dns) as *const () as usize).hash(state);
        (Arc::as_ptr(&self.connector) as *const () as usize).hash(state);
        self.proxies.hash(state);
        self.protocols.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.is_tls)
            .finish()
    }
}

/// A concrete path to an address: which proxy, which resolved socket
/// address. A connection remembers the route it was dialed over.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Address, proxy: Proxy, socket_addr: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_addr,
        }
    }

    /// The address this route leads to.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The proxy this route goes through.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The resolved socket address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} via {} ({})",
            self.address.host(),
            self.address.port(),
            self.proxy,
            self.socket_addr
        )
    }
}

/// Remembers routes that failed to connect, so reroutes prefer paths that
/// have not misbehaved recently.
#[derive(Default)]
pub(crate) struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    /// Record a dial failure on `route`.
    pub(crate) fn failed(&self, route: &Route) {
        self.failed.lock().unwrap().insert(route.clone());
    }

    /// Record that `route` connected; it is no longer suspect.
    pub(crate) fn connected(&self, route: &Route) {
        self.failed.lock().unwrap().remove(route);
    }

    pub(crate) fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().unwrap().contains(route)
    }
}

/// Enumerates candidate routes for an address: each configured proxy in
/// order, fanned out over the IPs DNS yields for it. Recently failed routes
/// are postponed to the very end.
pub(crate) struct RouteSelector {
    address: Address,
    route_database: Arc<RouteDatabase>,
    next_proxy_index: usize,
    postponed: Vec<Route>,
}

impl RouteSelector {
    pub(crate) fn new(address: Address, route_database: Arc<RouteDatabase>) -> RouteSelector {
        RouteSelector {
            address,
            route_database,
            next_proxy_index: 0,
            postponed: Vec::new(),
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.next_proxy_index < self.proxy_count() || !self.postponed.is_empty()
    }

    fn proxy_count(&self) -> usize {
        self.address.proxies.len().max(1)
    }

    fn proxy_at(&self, index: usize) -> Proxy {
        self.address
            .proxies
            .get(index)
            .cloned()
            .unwrap_or(Proxy::Direct)
    }

    /// The next batch of routes to attempt, in order.
    pub(crate) fn next(&mut self) -> crate::Result<Vec<Route>> {
        while self.next_proxy_index < self.proxy_count() {
            let proxy = self.proxy_at(self.next_proxy_index);
            self.next_proxy_index += 1;

            let dns_host = proxy.dns_host(self.address.host());
            let ips = self
                .address
                .dns
                .resolve(dns_host)
                .map_err(crate::Error::connect)?;
            if ips.is_empty() {
                debug!("no addresses for {dns_host} via {proxy}");
                continue;
            }

            let mut fresh = Vec::with_capacity(ips.len());
            for socket_addr in proxy.socket_addrs(self.address.port(), &ips) {
                let route = Route::new(self.address.clone(), proxy.clone(), socket_addr);
                if self.route_database.should_postpone(&route) {
                    self.postponed.push(route);
                } else {
                    fresh.push(route);
                }
            }
            if !fresh.is_empty() {
                return Ok(fresh);
            }
        }

        if !self.postponed.is_empty() {
            return Ok(std::mem::take(&mut self.postponed));
        }

        Err(crate::Error::connect("exhausted all routes"))
    }
}
