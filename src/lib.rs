#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

//! # carrier
//!
//! An HTTP/1.1 and HTTP/2 call execution engine: the machinery that turns
//! a prepared request into a response.
//!
//! - An ordered, re-entrant [interceptor](Interceptor) pipeline
//! - [Connection pooling](ConnectionPool) with keep-alive eviction,
//!   HTTP/2 connection coalescing, and leak detection
//! - Call [cancellation](Call::cancel) from any thread, and call timeouts
//! - An RFC 7234 response cache behind a pluggable [store](CacheStore)
//!
//! `carrier` deliberately owns no wire bytes. DNS, dialing, TLS, and the
//! HTTP framing itself live behind the [`Resolve`], [`Connector`] and
//! [`Codec`] collaborator traits the embedder provides; the engine
//! contributes everything between the application and those seams.
//!
//! ## Executing a call
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use carrier::{Client, Connector, Dialed, Request};
//!
//! struct MyConnector;
//!
//! impl Connector for MyConnector {
//!     fn connect(&self, _route: &carrier::Route, _call: &carrier::Call) -> carrier::Result<Dialed> {
//!         // Dial the route's socket address, negotiate TLS and a
//!         // protocol, and return the framed transport.
//!         unimplemented!()
//!     }
//! }
//!
//! fn main() -> carrier::Result<()> {
//!     let client = Client::builder()
//!         .connector(Arc::new(MyConnector))
//!         .build()?;
//!
//!     let request = Request::get("https://example.com/".parse().unwrap()).build()?;
//!     let response = client.new_call(request).execute()?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! **NOTE**: create one [`Client`] and reuse it; every call placed through
//! it shares the same connection pool and dispatcher.

mod address;
mod cache;
mod call;
mod client;
mod codec;
mod connection;
mod cookie;
mod dispatcher;
mod error;
mod events;
mod exchange;
mod finder;
mod interceptor;
mod interceptors;
mod pool;
mod request;
mod response;
mod task;
#[cfg(test)]
pub(crate) mod testutil;
mod transport;

pub use crate::address::{Address, Route};
pub use crate::cache::{CacheControl, CacheStore, CacheStrategy, CacheWriteHandle};
pub use crate::call::Call;
pub use crate::client::{Client, ClientBuilder};
pub use crate::codec::{BodySink, BodySource, Codec, ResponseHead};
pub use crate::connection::Connection;
pub use crate::cookie::{CookieJar, NoCookies};
pub use crate::dispatcher::Dispatcher;
pub use crate::error::{BoxError, ConnectionShutdown, Error, Result, TimedOut};
pub use crate::events::{EventListener, NoEvents};
pub use crate::exchange::{Exchange, RequestSink};
pub use crate::interceptor::{Chain, Interceptor};
pub use crate::pool::ConnectionPool;
pub use crate::request::{Body, Request, RequestBody, RequestBuilder};
pub use crate::response::{Response, ResponseBody, ResponseBuilder};
pub use crate::task::{TaskHandle, TaskRunner};
pub use crate::transport::{
    Connector, Dialed, Handshake, Protocol, Proxy, Resolve, SystemResolver, Transport,
};
