use std::{error::Error as StdError, fmt, io};

use http::StatusCode;
use url::Url;

/// A `Result` alias where the `Err` case is `carrier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The errors that may occur while executing a call.
///
/// Note: Errors may include the full URL used to make the request. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
    suppressed: Vec<Error>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
                suppressed: Vec::new(),
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn canceled() -> Error {
        Error::new(Kind::Canceled, None::<Error>)
    }

    pub(crate) fn timeout<E: Into<BoxError>>(source: Option<E>) -> Error {
        Error::new(Kind::Timeout, Some(TimedOut)).with_source_opt(source)
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn contract<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Contract, Some(e))
    }

    pub(crate) fn status_code(url: Url, status: StatusCode) -> Error {
        Error::new(Kind::Status(status), None::<Error>).with_url(url)
    }

    fn with_source_opt<E: Into<BoxError>>(mut self, source: Option<E>) -> Error {
        if let Some(source) = source {
            // The marker stays reachable through `source()`, the real failure
            // becomes the primary cause.
            let marker = self.inner.source.take();
            let mut source: BoxError = source.into();
            if let Some(marker) = marker {
                source = Box::new(Chained {
                    primary: source,
                    secondary: marker,
                });
            }
            self.inner.source = Some(source);
        }
        self
    }

    /// Classify an I/O failure observed while talking to the peer.
    pub(crate) fn from_io(e: io::Error) -> Error {
        Self::classify_io(e, Kind::Request)
    }

    /// Like [`Error::from_io`], for failures on a body stream.
    pub(crate) fn from_body_io(e: io::Error) -> Error {
        Self::classify_io(e, Kind::Body)
    }

    fn classify_io(e: io::Error, fallback: Kind) -> Error {
        if e.get_ref().map(|r| r.is::<ConnectionShutdown>()).unwrap_or(false) {
            return Error::new(Kind::ConnectionShutdown, Some(e));
        }
        if e.get_ref().map(|r| r.is::<Error>()).unwrap_or(false) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<Error>() {
                    return *err;
                }
            }
            unreachable!("io::Error::get_ref was Some(_)");
        }
        Error::new(fallback, Some(e))
    }

    /// Wrap this error into an `io::Error` so it can travel through `Read`
    /// and `Write` seams without losing its kind.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Add a URL related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related URL from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Attach a secondary failure that was observed while this error was
    /// already propagating.
    pub(crate) fn with_suppressed(mut self, e: Error) -> Self {
        self.inner.suppressed.push(e);
        self
    }

    /// Secondary failures attached to this error.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Returns true if the error came from a builder misuse.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is related to connecting (DNS, dial, TLS).
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error occurred while transmitting the request.
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if the error is related to a request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the peer violated the HTTP protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the connection was shut down before the request was
    /// transmitted. Such failures are transparently retryable.
    pub fn is_connection_shutdown(&self) -> bool {
        if matches!(self.inner.kind, Kind::ConnectionShutdown) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if err.is::<ConnectionShutdown>() {
                return true;
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is a programmer-facing contract violation,
    /// such as executing the same call twice.
    pub fn is_contract(&self) -> bool {
        matches!(self.inner.kind, Kind::Contract)
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("carrier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", url);
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        if !self.inner.suppressed.is_empty() {
            builder.field("suppressed", &self.inner.suppressed);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Canceled => f.write_str("call canceled")?,
            Kind::Timeout => f.write_str("call timed out")?,
            Kind::Connect => f.write_str("error connecting")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Protocol => f.write_str("protocol violation")?,
            Kind::ConnectionShutdown => f.write_str("connection shut down")?,
            Kind::Contract => f.write_str("contract violation")?,
            Kind::Status(ref code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Canceled,
    Timeout,
    Connect,
    Request,
    Body,
    Protocol,
    ConnectionShutdown,
    Contract,
    Status(StatusCode),
}

/// A primary cause carrying a secondary one behind it in the source chain.
struct Chained {
    primary: BoxError,
    secondary: BoxError,
}

impl fmt::Debug for Chained {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.primary, f)
    }
}

impl fmt::Display for Chained {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.primary, f)
    }
}

impl StdError for Chained {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.secondary)
    }
}

/// Marker for interrupted I/O caused by a fired call timeout.
#[derive(Debug)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("timeout")
    }
}

impl StdError for TimedOut {}

/// Marker reported by codecs when the peer shut the connection down before
/// any request bytes were transmitted.
#[derive(Debug)]
pub struct ConnectionShutdown;

impl fmt::Display for ConnectionShutdown {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("connection shutdown")
    }
}

impl StdError for ConnectionShutdown {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Request, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn roundtrip_io_error() {
        let orig = Error::request("orig");
        let io = orig.into_io();
        let err = Error::from_io(io);
        // It should have pulled out the original, not nested it.
        assert!(err.is_request());
        assert!(!err.is_body());
    }

    #[test]
    fn shutdown_io_error_is_classified() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, ConnectionShutdown);
        let err = Error::from_io(io);
        assert!(err.is_connection_shutdown());
    }

    #[test]
    fn is_timeout() {
        let err = Error::timeout(None::<Error>);
        assert!(err.is_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::request(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn timeout_keeps_cause() {
        let cause = Error::request("broken pipe");
        let err = Error::timeout(Some(cause));
        assert!(err.is_timeout());
        let source = err.source().expect("cause retained");
        assert!(source.to_string().contains("broken pipe"));
    }

    #[test]
    fn suppressed_failures_are_attached() {
        let primary = Error::connect("no route to host");
        let err = primary.with_suppressed(Error::request("second route"));
        assert_eq!(err.suppressed().len(), 1);
    }
}
