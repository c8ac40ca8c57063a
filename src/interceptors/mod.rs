//! The built-in interceptor stack, in the order it runs: retry and
//! follow-up, header bridging, caching, connect, and the terminal stage
//! that drives the wire exchange.

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;
