use std::fmt;
use std::io::{self, Read};
use std::time::SystemTime;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName};
use http::{StatusCode, Version};
use url::Url;

use crate::codec::BodySource;
use crate::request::Request;
use crate::transport::Handshake;

/// A response to an executed call.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    request: Request,
    body: Option<ResponseBody>,
    sent_at: SystemTime,
    received_at: SystemTime,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
}

impl Response {
    /// Start building a response.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    /// Get the `StatusCode` of this response.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this response.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the first value of the named header, as a string.
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The request that produced this response.
    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The final URL of this response.
    #[inline]
    pub fn url(&self) -> &Url {
        self.request.url()
    }

    /// When the request headers were transmitted.
    #[inline]
    pub fn sent_at(&self) -> SystemTime {
        self.sent_at
    }

    /// When the response headers were received.
    #[inline]
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// The TLS handshake of the connection that carried this response.
    #[inline]
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The raw network response, when this response was served or validated
    /// by the cache. Its body is never readable.
    #[inline]
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The cached response this response was validated against, if any. Its
    /// body is never readable.
    #[inline]
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The redirect response that preceded this one, if any.
    #[inline]
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub(crate) fn set_prior_response(&mut self, prior: Response) {
        self.prior_response = Some(Box::new(prior.stripped()));
    }

    /// The advertised `Content-Length`, if present and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.header(&http::header::CONTENT_LENGTH)?.trim().parse().ok()
    }

    /// Take the body out of this response, leaving `None` behind.
    pub fn body_mut(&mut self) -> &mut Option<ResponseBody> {
        &mut self.body
    }

    /// Consume the response and return its body.
    pub fn into_body(self) -> Option<ResponseBody> {
        self.body
    }

    /// Read the full body into memory.
    pub fn bytes(self) -> crate::Result<Bytes> {
        match self.body {
            Some(body) => body.bytes(),
            None => Ok(Bytes::new()),
        }
    }

    /// Turn a `4xx` or `5xx` status into an error, closing the body.
    pub fn error_for_status(self) -> crate::Result<Response> {
        let status = self.status;
        if status.is_client_error() || status.is_server_error() {
            let url = self.url().clone();
            self.close();
            Err(crate::Error::status_code(url, status))
        } else {
            Ok(self)
        }
    }

    /// Close the response body without reading it.
    pub fn close(mut self) {
        if let Some(body) = self.body.take() {
            body.close();
        }
    }

    /// A copy of this response without body or linked responses, used when
    /// retaining it as a `network_response`, `cache_response` or
    /// `prior_response`.
    pub(crate) fn stripped(&self) -> Response {
        Response {
            status: self.status,
            version: self.version,
            headers: self.headers.clone(),
            request: self.request.clone(),
            body: None,
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake.clone(),
            network_response: None,
            cache_response: None,
            prior_response: None,
        }
    }

    /// Rebuild this response, keeping the body.
    pub fn to_builder(mut self) -> ResponseBuilder {
        ResponseBuilder {
            status: Some(self.status),
            version: self.version,
            headers: std::mem::take(&mut self.headers),
            request: Some(self.request.clone()),
            body: self.body.take(),
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake.take(),
            network_response: self.network_response.take(),
            cache_response: self.cache_response.take(),
            prior_response: self.prior_response.take(),
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url().as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

/// A builder for `Response`.
pub struct ResponseBuilder {
    status: Option<StatusCode>,
    version: Version,
    headers: HeaderMap,
    request: Option<Request>,
    body: Option<ResponseBody>,
    sent_at: SystemTime,
    received_at: SystemTime,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
}

impl ResponseBuilder {
    pub(crate) fn new() -> ResponseBuilder {
        ResponseBuilder {
            status: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            request: None,
            body: None,
            sent_at: SystemTime::UNIX_EPOCH,
            received_at: SystemTime::UNIX_EPOCH,
            handshake: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
        }
    }

    /// Set the status code.
    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the HTTP version.
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Replace all headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Append a header. Invalid values are silently dropped.
    pub fn header<V>(mut self, name: HeaderName, value: V) -> Self
    where
        V: TryInto<http::header::HeaderValue>,
    {
        if let Ok(value) = value.try_into() {
            self.headers.append(name, value);
        }
        self
    }

    /// Set the request this response answers.
    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Record when the request headers were transmitted.
    pub fn sent_at(mut self, at: SystemTime) -> Self {
        self.sent_at = at;
        self
    }

    /// Record when the response headers arrived.
    pub fn received_at(mut self, at: SystemTime) -> Self {
        self.received_at = at;
        self
    }

    /// Record the TLS handshake of the carrying connection.
    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Attach the raw network response, stripped of its body.
    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Attach the cached response, stripped of its body.
    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Attach the redirect response that preceded this one.
    pub fn prior_response(mut self, response: Option<Response>) -> Self {
        self.prior_response = response.map(|r| Box::new(r.stripped()));
        self
    }

    /// Build the `Response`.
    ///
    /// # Panics
    ///
    /// Panics if status or request are unset; both are always provided by
    /// the engine before a response escapes it.
    pub fn build(self) -> Response {
        Response {
            status: self.status.expect("status is required"),
            version: self.version,
            headers: self.headers,
            request: self.request.expect("request is required"),
            body: self.body,
            sent_at: self.sent_at,
            received_at: self.received_at,
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
        }
    }
}

impl fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("status", &self.status)
            .finish()
    }
}

/// A streaming response body.
///
/// The body must be read or closed for the connection that carried it to be
/// reusable; dropping it unread counts as an early close.
pub struct ResponseBody {
    source: Box<dyn BodySource>,
}

impl ResponseBody {
    /// Wrap a codec-provided source.
    pub fn new(source: Box<dyn BodySource>) -> ResponseBody {
        ResponseBody { source }
    }

    /// A body over an in-memory chunk of bytes.
    pub fn bytes_body(bytes: impl Into<Bytes>) -> ResponseBody {
        ResponseBody {
            source: Box::new(BytesSource(io::Cursor::new(bytes.into()))),
        }
    }

    /// An empty body.
    pub fn empty() -> ResponseBody {
        ResponseBody::bytes_body(Bytes::new())
    }

    /// The number of bytes remaining, when the source knows it.
    pub fn content_length(&self) -> Option<u64> {
        self.source.content_length()
    }

    /// Read the remaining bytes into memory.
    pub fn bytes(mut self) -> crate::Result<Bytes> {
        let mut buf = Vec::new();
        match self.source.read_to_end(&mut buf) {
            Ok(_) => {
                self.close();
                Ok(buf.into())
            }
            Err(e) => {
                self.close();
                Err(crate::Error::from_body_io(e))
            }
        }
    }

    /// Close the body, releasing the underlying stream.
    pub fn close(mut self) {
        let _ = self.source.close();
    }

    pub(crate) fn into_source(self) -> Box<dyn BodySource> {
        self.source
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.source.read(buf)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length())
            .finish()
    }
}

struct BytesSource(io::Cursor<Bytes>);

impl Read for BytesSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl BodySource for BytesSource {
    fn content_length(&self) -> Option<u64> {
        let total = self.0.get_ref().len() as u64;
        Some(total.saturating_sub(self.0.position()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request() -> Request {
        Request::new(Method::GET, "http://example.com/".parse().unwrap())
    }

    #[test]
    fn bytes_body_roundtrip() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .request(request())
            .body(ResponseBody::bytes_body("hello"))
            .build();
        assert_eq!(response.bytes().unwrap(), Bytes::from("hello"));
    }

    #[test]
    fn stripped_drops_body_and_links() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .request(request())
            .body(ResponseBody::bytes_body("hello"))
            .build();
        let stripped = response.stripped();
        assert!(stripped.body.is_none());
        assert_eq!(stripped.status(), StatusCode::OK);
    }

    #[test]
    fn content_length_parses_header() {
        let response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(http::header::CONTENT_LENGTH, "5")
            .request(request())
            .build();
        assert_eq!(response.content_length(), Some(5));
    }
}
