use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::call::Call;
use crate::codec::{BodySink, BodySource, Codec, ResponseHead};
use crate::connection::Connection;
use crate::error::Error;
use crate::request::Request;
use crate::response::{Response, ResponseBody};

/// A one-shot binding of a call to a codec on a specific connection, for a
/// single request/response turn.
///
/// The exchange owns the failure bookkeeping: any I/O error crossing it is
/// classified, recorded against the connection, and reported to the call
/// when a body stream ends.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    call: Call,
    connection: Arc<Connection>,
    codec: Box<dyn Codec>,
    has_failure: AtomicBool,
}

impl Exchange {
    pub(crate) fn new(call: Call, connection: Arc<Connection>, codec: Box<dyn Codec>) -> Exchange {
        Exchange {
            inner: Arc::new(ExchangeInner {
                call,
                connection,
                codec,
                has_failure: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn ptr_eq(a: &Exchange, b: &Exchange) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// The connection carrying this exchange.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub(crate) fn call(&self) -> &Call {
        &self.inner.call
    }

    /// Whether any operation on this exchange has failed.
    pub fn has_failure(&self) -> bool {
        self.inner.has_failure.load(Ordering::Acquire)
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.inner.connection.is_multiplexed()
    }

    /// Prevent the connection from carrying any further exchanges.
    pub(crate) fn no_new_exchanges_on_connection(&self) {
        self.inner.connection.set_no_new_exchanges();
    }

    /// Abort the exchange. Safe from any thread.
    pub(crate) fn cancel(&self) {
        self.inner.codec.cancel();
    }

    fn note_failure(&self, error: Error) -> Error {
        self.inner.has_failure.store(true, Ordering::Release);
        self.inner.connection.note_failure(&error);
        error
    }

    pub(crate) fn write_request_headers(&self, request: &Request) -> crate::Result<()> {
        self.inner
            .codec
            .write_request_headers(request)
            .map_err(|e| self.note_failure(Error::from_io(e)))
    }

    pub(crate) fn flush_request(&self) -> crate::Result<()> {
        self.inner
            .codec
            .flush_request()
            .map_err(|e| self.note_failure(Error::from_io(e)))
    }

    pub(crate) fn finish_request(&self) -> crate::Result<()> {
        self.inner
            .codec
            .finish_request()
            .map_err(|e| self.note_failure(Error::from_io(e)))
    }

    pub(crate) fn create_request_sink(
        &self,
        request: &Request,
        duplex: bool,
    ) -> crate::Result<RequestSink> {
        let sink = self
            .inner
            .codec
            .create_request_body(request, duplex)
            .map_err(|e| self.note_failure(Error::from_io(e)))?;
        Ok(RequestSink {
            exchange: self.clone(),
            sink,
            completed: false,
            bytes_written: 0,
        })
    }

    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> crate::Result<Option<ResponseHead>> {
        self.inner
            .codec
            .read_response_headers(expect_continue)
            .map_err(|e| self.note_failure(Error::from_io(e)))
    }

    pub(crate) fn open_response_body(&self, response: &Response) -> crate::Result<ResponseBody> {
        let source = self
            .inner
            .codec
            .open_response_body(response)
            .map_err(|e| self.note_failure(Error::from_io(e)))?;
        Ok(ResponseBody::new(Box::new(ResponseStream {
            exchange: self.clone(),
            source,
            completed: false,
        })))
    }

    /// Mark the request stream finished without a body having been written.
    pub(crate) fn no_request_body(&self) {
        self.inner.call.message_done(self, true, false, None);
    }

    /// Mark the response stream finished without a readable body, as on a
    /// protocol upgrade where the stream leaves HTTP.
    pub(crate) fn no_response_body(&self) {
        self.inner.call.message_done(self, false, true, None);
    }

    fn request_complete(&self, error: Option<Error>) -> Option<Error> {
        self.inner.call.message_done(self, true, false, error)
    }

    fn response_complete(&self, error: Option<Error>) -> Option<Error> {
        self.inner.call.message_done(self, false, true, error)
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("connection", &self.inner.connection)
            .field("has_failure", &self.has_failure())
            .finish()
    }
}

/// The writable request body stream of an exchange.
///
/// Closing (or dropping) the sink finishes the request stream and reports
/// it to the call. For duplex bodies the sink outlives the wire turn-around
/// and may be written from any thread.
pub struct RequestSink {
    exchange: Exchange,
    sink: Box<dyn BodySink>,
    completed: bool,
    bytes_written: u64,
}

impl RequestSink {
    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Complete the request stream.
    pub fn close(mut self) -> crate::Result<()> {
        self.finish(false)
    }

    fn finish(&mut self, from_drop: bool) -> crate::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        match self.sink.close() {
            Ok(()) => match self.exchange.request_complete(None) {
                None => Ok(()),
                Some(e) => Err(e),
            },
            Err(e) => {
                let error = self.exchange.note_failure(Error::from_io(e));
                let error = self
                    .exchange
                    .request_complete(Some(error))
                    .expect("error propagates through message_done");
                if from_drop {
                    log::debug!("request sink failed to close: {error}");
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }
}

impl Write for RequestSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.completed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "request stream closed"));
        }
        match self.sink.write(buf) {
            Ok(n) => {
                self.bytes_written += n as u64;
                Ok(n)
            }
            Err(e) => {
                let error = self.exchange.note_failure(Error::from_io(e));
                Err(error.into_io())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl Drop for RequestSink {
    fn drop(&mut self) {
        let _ = self.finish(true);
    }
}

impl fmt::Debug for RequestSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("bytes_written", &self.bytes_written)
            .field("completed", &self.completed)
            .finish()
    }
}

/// The readable response body stream of an exchange. EOF, failure, or close
/// each report completion to the call exactly once.
struct ResponseStream {
    exchange: Exchange,
    source: Box<dyn BodySource>,
    completed: bool,
}

impl Read for ResponseStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.completed {
            return Ok(0);
        }

        // A canceled call fails its body read even if bytes are available;
        // the stream was aborted and the connection will not be reused.
        if self.exchange.call().is_canceled() {
            self.completed = true;
            self.exchange.no_new_exchanges_on_connection();
            let _ = self.source.close();
            let error = self
                .exchange
                .response_complete(Some(Error::canceled()))
                .expect("error propagates through message_done");
            return Err(error.into_io());
        }

        match self.source.read(buf) {
            Ok(0) => {
                self.completed = true;
                self.exchange.response_complete(None);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.completed = true;
                let error = self.exchange.note_failure(Error::from_io(e));
                let error = self
                    .exchange
                    .response_complete(Some(error))
                    .expect("error propagates through message_done");
                Err(error.into_io())
            }
        }
    }
}

impl BodySource for ResponseStream {
    fn content_length(&self) -> Option<u64> {
        self.source.content_length()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        // Closing with bytes still owed makes the connection unreusable.
        self.exchange.no_new_exchanges_on_connection();
        let result = self.source.close();
        self.exchange.response_complete(None);
        result
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        let _ = BodySource::close(self);
    }
}
