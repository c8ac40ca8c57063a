use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::exchange::RequestSink;

/// A request which can be executed with `Client::new_call`.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
}

/// A builder to construct the properties of a `Request`.
#[must_use = "RequestBuilder does nothing until you call build"]
pub struct RequestBuilder {
    method: Method,
    url: crate::Result<Url>,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Starts building a `GET` request for the given URL.
    pub fn get(url: Url) -> RequestBuilder {
        RequestBuilder::new(Method::GET, Ok(url))
    }

    /// Starts building a request with the given method and URL.
    pub fn builder(method: Method, url: Url) -> RequestBuilder {
        RequestBuilder::new(method, Ok(url))
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
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

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Replace the body.
    #[inline]
    pub fn set_body(&mut self, body: Option<Body>) {
        self.body = body;
    }

    /// Get the per-request timeout override, if any.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns a builder initialized with this request's properties.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Ok(self.url.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
            timeout: self.timeout,
        }
    }
}

impl RequestBuilder {
    pub(crate) fn new(method: Method, url: crate::Result<Url>) -> RequestBuilder {
        RequestBuilder {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Add a header to this request.
    pub fn header<V>(mut self, name: HeaderName, value: V) -> RequestBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.headers.append(name, value);
            }
            Err(e) => {
                if self.url.is_ok() {
                    self.url = Err(crate::Error::builder(e.into()));
                }
            }
        }
        self
    }

    /// Replace all headers of this request.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        self.headers = headers;
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Body>) -> RequestBuilder {
        self.body = Some(body.into());
        self
    }

    /// Enables a per-request timeout, overriding the client default.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        self.timeout = Some(timeout);
        self
    }

    /// Build the `Request`.
    pub fn build(self) -> crate::Result<Request> {
        let url = self.url?;
        match url.scheme() {
            "http" | "https" => {}
            _ => return Err(crate::Error::builder("unsupported URL scheme").with_url(url)),
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
            timeout: self.timeout,
        })
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish()
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .finish()
    }
}

/// A request body.
///
/// The engine pulls bytes from the body through [`RequestBody::write_to`]
/// once the codec has a sink ready, so bodies may be replayed on retries and
/// redirects unless they report themselves one-shot.
#[derive(Clone)]
pub struct Body {
    inner: Arc<dyn RequestBody>,
}

/// A producer of request body bytes.
pub trait RequestBody: Send + Sync {
    /// The number of bytes `write_to` will produce, when known up front.
    fn content_length(&self) -> Option<u64> {
        None
    }

    /// A duplex body streams after the response headers have been received;
    /// the engine hands the sink over via [`RequestBody::hand_off`] instead
    /// of calling `write_to`.
    fn is_duplex(&self) -> bool {
        false
    }

    /// One-shot bodies cannot be replayed for retries or redirects.
    fn is_one_shot(&self) -> bool {
        false
    }

    /// Write the whole body to `sink`. The engine closes the sink afterward.
    fn write_to(&self, sink: &mut RequestSink) -> crate::Result<()>;

    /// Take ownership of the sink for deferred writing. Only invoked when
    /// [`RequestBody::is_duplex`] reports true; closing (or dropping) the
    /// sink finishes the request stream.
    fn hand_off(&self, sink: RequestSink) {
        drop(sink);
    }
}

impl Body {
    /// Wrap a custom body implementation.
    pub fn new(inner: Arc<dyn RequestBody>) -> Body {
        Body { inner }
    }

    /// A body backed by a contiguous chunk of bytes, replayable for retries.
    pub fn bytes(bytes: impl Into<Bytes>) -> Body {
        Body {
            inner: Arc::new(ByteBody(bytes.into())),
        }
    }

    /// The number of bytes this body will produce, when known.
    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    /// Whether this body streams concurrently with the response.
    pub fn is_duplex(&self) -> bool {
        self.inner.is_duplex()
    }

    /// Whether this body can only be transmitted once.
    pub fn is_one_shot(&self) -> bool {
        self.inner.is_one_shot()
    }

    pub(crate) fn write_to(&self, sink: &mut RequestSink) -> crate::Result<()> {
        self.inner.write_to(sink)
    }

    pub(crate) fn hand_off(&self, sink: RequestSink) {
        self.inner.hand_off(sink)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Body")
            .field("content_length", &self.content_length())
            .field("duplex", &self.is_duplex())
            .finish()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Body {
        Body::bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(vec: Vec<u8>) -> Body {
        Body::bytes(vec)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Body {
        Body::bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Body {
        Body::bytes(s)
    }
}

struct ByteBody(Bytes);

impl RequestBody for ByteBody {
    fn content_length(&self) -> Option<u64> {
        Some(self.0.len() as u64)
    }

    fn write_to(&self, sink: &mut RequestSink) -> crate::Result<()> {
        use std::io::Write;
        sink.write_all(&self.0)
            .map_err(|e| crate::Error::from_io(e))
    }
}
