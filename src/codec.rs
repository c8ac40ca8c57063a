use std::io::{Read, Write};

use http::header::HeaderMap;
use http::{StatusCode, Version};

use crate::request::Request;
use crate::response::Response;

/// The response status line and headers, before a body is attached.
#[derive(Debug)]
pub struct ResponseHead {
    /// The response status code.
    pub status: StatusCode,
    /// The protocol version the response was framed with.
    pub version: Version,
    /// The response headers.
    pub headers: HeaderMap,
}

/// A protocol-specific reader/writer for HTTP frames on an open transport.
///
/// One codec serves exactly one request/response exchange. Implementations
/// encode the byte-level framing (HTTP/1.1 or HTTP/2); the engine never
/// touches wire bytes itself.
///
/// Codecs must be internally synchronized: a duplex exchange writes the
/// request body from one thread while another reads the response.
pub trait Codec: Send + Sync {
    /// Encode and stage the request line and headers.
    fn write_request_headers(&self, request: &Request) -> std::io::Result<()>;

    /// Flush everything staged so far to the socket.
    fn flush_request(&self) -> std::io::Result<()>;

    /// Open the sink the request body is written into. `duplex` sinks stay
    /// writable after the response starts arriving.
    fn create_request_body(&self, request: &Request, duplex: bool)
        -> std::io::Result<Box<dyn BodySink>>;

    /// Signal that no further request bytes will be written.
    fn finish_request(&self) -> std::io::Result<()>;

    /// Read the next response status line and headers.
    ///
    /// With `expect_continue` set, returns `Ok(None)` when the server
    /// signalled that the request body should be transmitted (either an
    /// explicit `100 Continue` or the codec's own timeout policy); returns
    /// an early head otherwise.
    fn read_response_headers(&self, expect_continue: bool)
        -> std::io::Result<Option<ResponseHead>>;

    /// Open the streaming body of `response`.
    fn open_response_body(&self, response: &Response) -> std::io::Result<Box<dyn BodySource>>;

    /// Whether this codec multiplexes concurrent exchanges (HTTP/2).
    fn is_multiplexed(&self) -> bool;

    /// Abort this exchange: fail in-flight reads and writes promptly. For a
    /// multiplexed codec this resets one stream; for HTTP/1.1 it tears down
    /// the socket.
    fn cancel(&self);
}

/// The writable half of a request body stream.
pub trait BodySink: Write + Send {
    /// Complete the stream. Further writes are an error.
    fn close(&mut self) -> std::io::Result<()>;
}

/// The readable half of a response body stream. EOF marks a complete body.
pub trait BodySource: Read + Send {
    /// Remaining length when the framing advertises one.
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// Release the stream. Reading past `close` is an error.
    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
