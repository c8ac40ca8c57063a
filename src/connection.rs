use std::backtrace::Backtrace;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::address::{Address, Route};
use crate::call::{Call, CallInner};
use crate::codec::Codec;
use crate::error::Error;
use crate::transport::{Dialed, Handshake, Protocol, Proxy, Transport};

// An HTTP/2 peer advertises its own stream limit through the codec; this
// only bounds how many calls the pool will pile onto one connection.
const MAX_MULTIPLEXED_EXCHANGES: usize = 32;

/// A live transport to a peer, owned by the pool and borrowed by exchanges.
///
/// State transitions are one-way: once `no_new_exchanges` is set the
/// connection never accepts another exchange, and once removed from the
/// pool it is never re-added.
pub struct Connection {
    route: Route,
    protocol: Protocol,
    handshake: Option<Handshake>,
    transport: Box<dyn Transport>,
    state: Mutex<ConnState>,
}

pub(crate) struct ConnState {
    /// The calls currently carried by this connection. Weak: an abandoned
    /// call shows up here as a dead reference, which cleanup reports as a
    /// leak using the captured acquisition backtrace.
    pub(crate) calls: Vec<CallReference>,
    pub(crate) no_new_exchanges: bool,
    pub(crate) idle_since: Instant,
    pub(crate) successes: u64,
}

pub(crate) struct CallReference {
    pub(crate) call: Weak<CallInner>,
    pub(crate) acquired_at: Backtrace,
}

impl CallReference {
    pub(crate) fn new(call: &Call) -> CallReference {
        CallReference {
            call: call.downgrade(),
            acquired_at: Backtrace::capture(),
        }
    }
}

impl Connection {
    pub(crate) fn new(route: Route, dialed: Dialed) -> Arc<Connection> {
        Arc::new(Connection {
            route,
            protocol: dialed.protocol,
            handshake: dialed.handshake,
            transport: dialed.transport,
            state: Mutex::new(ConnState {
                calls: Vec::new(),
                no_new_exchanges: false,
                idle_since: Instant::now(),
                successes: 0,
            }),
        })
    }

    /// The route this connection was dialed over.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The negotiated application protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The TLS handshake, when the route was secured.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Whether this connection carries concurrent exchanges.
    pub fn is_multiplexed(&self) -> bool {
        self.protocol.is_multiplexed()
    }

    /// Exchanges completed on this connection so far.
    pub fn successes(&self) -> u64 {
        self.state().successes
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn new_codec(&self) -> crate::Result<Box<dyn Codec>> {
        self.transport.new_codec()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.transport.is_healthy()
    }

    /// Refuse further exchanges. Existing exchanges run to completion.
    pub(crate) fn set_no_new_exchanges(&self) {
        self.state().no_new_exchanges = true;
    }

    pub(crate) fn no_new_exchanges(&self) -> bool {
        self.state().no_new_exchanges
    }

    pub(crate) fn note_success(&self) {
        self.state().successes += 1;
    }

    /// React to an exchange-level failure. HTTP/1.1 transports cannot be
    /// trusted after a failed exchange; multiplexed ones survive stream
    /// failures but not a shutdown of the whole session.
    pub(crate) fn note_failure(&self, error: &Error) {
        if !self.is_multiplexed() || error.is_connection_shutdown() {
            self.set_no_new_exchanges();
        }
    }

    /// Abort in-flight exchanges from any thread.
    pub(crate) fn cancel(&self) {
        self.transport.cancel();
    }

    /// Close the socket. Only the pool (or a never-pooled owner) does this.
    pub(crate) fn close(&self) {
        self.transport.close();
    }

    fn allocation_limit(&self) -> usize {
        if self.is_multiplexed() {
            MAX_MULTIPLEXED_EXCHANGES
        } else {
            1
        }
    }

    /// Whether this connection may carry a new exchange to `address`.
    /// Called with this connection's state lock held.
    ///
    /// Cross-host coalescing trusts the connector to have verified the
    /// dialed peer for every host it serves; the pool only checks that the
    /// candidate resolves to the same endpoint over a direct route.
    pub(crate) fn is_eligible(
        &self,
        st: &ConnState,
        address: &Address,
        routes: Option<&[Route]>,
    ) -> bool {
        if st.no_new_exchanges || st.calls.len() >= self.allocation_limit() {
            return false;
        }

        if !self.route.address().equals_non_host(address) {
            return false;
        }

        if self.route.address().host() == address.host() {
            return true;
        }

        // Host differs: HTTP/2 coalescing. Permitted only when a candidate
        // route hits the exact same endpoint without a proxy in between.
        if !self.is_multiplexed() {
            return false;
        }
        let routes = match routes {
            Some(routes) => routes,
            None => return false,
        };
        routes.iter().any(|candidate| {
            *candidate.proxy() == Proxy::Direct
                && *self.route.proxy() == Proxy::Direct
                && candidate.socket_addr() == self.route.socket_addr()
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Connection")
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .field("calls", &st.calls.len())
            .field("no_new_exchanges", &st.no_new_exchanges)
            .finish()
    }
}
