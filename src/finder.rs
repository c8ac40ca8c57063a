use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::address::{Address, Route, RouteDatabase, RouteSelector};
use crate::call::Call;
use crate::connection::{CallReference, Connection};
use crate::error::Error;
use crate::pool::ConnectionPool;

/// Obtains a usable connection for each call attempt, preferring reuse over
/// the pool and the pool over a fresh dial.
pub(crate) struct ExchangeFinder {
    pool: ConnectionPool,
    address: Address,
    route_database: Arc<RouteDatabase>,
    route_selector: Option<RouteSelector>,
    /// Routes from the current selection not yet dialed.
    pending_routes: VecDeque<Route>,
}

impl ExchangeFinder {
    pub(crate) fn new(
        pool: ConnectionPool,
        address: Address,
        route_database: Arc<RouteDatabase>,
    ) -> ExchangeFinder {
        ExchangeFinder {
            pool,
            address,
            route_database,
            route_selector: None,
            pending_routes: VecDeque::new(),
        }
    }

    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    /// Whether another route remains untried after a failure.
    pub(crate) fn retry_after_failure(&self) -> bool {
        !self.pending_routes.is_empty()
            || self.route_selector.as_ref().map_or(true, |s| s.has_next())
    }

    /// A healthy connection the call may run an exchange on. The call is
    /// attached to the connection before this returns.
    pub(crate) fn find(&mut self, call: &Call) -> crate::Result<Arc<Connection>> {
        loop {
            let connection = self.find_connection(call)?;
            if !connection.no_new_exchanges() && connection.is_healthy() {
                return Ok(connection);
            }
            // Unhealthy: poison it so nobody else picks it up, detach, and
            // keep looking.
            debug!("discarding unhealthy connection over {:?}", connection.route());
            connection.set_no_new_exchanges();
            call.release_connection();
        }
    }

    fn find_connection(&mut self, call: &Call) -> crate::Result<Arc<Connection>> {
        if call.is_canceled() {
            return Err(Error::canceled());
        }

        // 1. The connection the call already holds, if it still fits.
        if let Some(connection) = call.connection() {
            let reusable = {
                let st = connection.state();
                !st.no_new_exchanges
                    && connection.route().address().host() == self.address.host()
                    && connection.route().address().equals_non_host(&self.address)
            };
            if reusable {
                trace!("reusing held connection over {:?}", connection.route());
                return Ok(connection);
            }
            call.release_connection();
        }

        // 2. The pool, before spending anything on route resolution.
        if let Some(connection) = self.pool.acquire(&self.address, call, None, false) {
            call.set_connection(connection.clone());
            call.events().connection_acquired(call, &connection);
            return Ok(connection);
        }

        // 3. Resolve routes, then ask the pool again; with routes in hand a
        // multiplexed connection to another host on the same endpoint can
        // be coalesced onto.
        let routes = self.ensure_routes()?;
        if let Some(connection) = self.pool.acquire(&self.address, call, Some(&routes), false) {
            call.set_connection(connection.clone());
            call.events().connection_acquired(call, &connection);
            return Ok(connection);
        }

        // 4. Dial candidate routes in order until one connects.
        let mut first_error: Option<Error> = None;
        while let Some(route) = self.pending_routes.pop_front() {
            if call.is_canceled() {
                return Err(Error::canceled());
            }
            match self.address.connector().connect(&route, call) {
                Ok(dialed) => {
                    self.route_database.connected(&route);
                    let connection = Connection::new(route, dialed);

                    // While this dial was in flight another call may have
                    // published a multiplexed connection to the same
                    // endpoint; prefer theirs and discard ours.
                    if connection.is_multiplexed() {
                        let coalesce = std::slice::from_ref(connection.route());
                        if let Some(existing) =
                            self.pool.acquire(&self.address, call, Some(coalesce), true)
                        {
                            debug!(
                                "discarding redundant connection over {:?}",
                                connection.route()
                            );
                            connection.close();
                            call.set_connection(existing.clone());
                            call.events().connection_acquired(call, &existing);
                            return Ok(existing);
                        }
                    }

                    connection.state().calls.push(CallReference::new(call));
                    self.pool.put(connection.clone());
                    call.set_connection(connection.clone());
                    call.events().connection_acquired(call, &connection);
                    return Ok(connection);
                }
                Err(e) => {
                    debug!("failed to connect over {:?}: {}", route, e);
                    self.route_database.failed(&route);
                    first_error = Some(match first_error {
                        None => e,
                        Some(first) => first.with_suppressed(e),
                    });
                }
            }
        }

        Err(first_error.unwrap_or_else(|| Error::connect("exhausted all routes")))
    }

    fn ensure_routes(&mut self) -> crate::Result<Vec<Route>> {
        if self.pending_routes.is_empty() {
            let selector = self.route_selector.get_or_insert_with(|| {
                RouteSelector::new(self.address.clone(), self.route_database.clone())
            });
            self.pending_routes = selector.next()?.into();
        }
        Ok(self.pending_routes.iter().cloned().collect())
    }
}
