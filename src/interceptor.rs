use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::call::Call;
use crate::error::Error;
use crate::exchange::Exchange;
use crate::request::Request;
use crate::response::Response;

/// Observes and potentially transforms a call's request and response.
///
/// Application interceptors run once per call, before any retry or redirect
/// logic. Network interceptors run once per attempt, with a live
/// [`Exchange`] available on the chain. An interceptor must invoke
/// [`Chain::proceed`] exactly once, unless it short-circuits by returning a
/// response of its own without touching the network.
pub trait Interceptor: Send + Sync {
    /// Observe `chain.request()`, call [`Chain::proceed`], and return the
    /// response, possibly transformed.
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response>;
}

impl<F> Interceptor for F
where
    F: Fn(&mut Chain) -> crate::Result<Response> + Send + Sync,
{
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        self(chain)
    }
}

/// A position in the interceptor pipeline.
///
/// Each `proceed` hands a fresh chain, advanced by one position, to the
/// next interceptor. Re-entrant stages (retry, redirects) call `proceed`
/// repeatedly from their own position, driving the stages below them once
/// per attempt.
pub struct Chain {
    call: Call,
    interceptors: Arc<[Arc<dyn Interceptor>]>,
    index: usize,
    exchange: Option<Exchange>,
    request: Request,
    timeouts: crate::client::Timeouts,
    proceed_count: u32,
}

impl Chain {
    pub(crate) fn new(
        call: Call,
        interceptors: Arc<[Arc<dyn Interceptor>]>,
        index: usize,
        exchange: Option<Exchange>,
        request: Request,
    ) -> Chain {
        let timeouts = call.client().timeouts();
        Chain {
            call,
            interceptors,
            index,
            exchange,
            request,
            timeouts,
            proceed_count: 0,
        }
    }

    /// The configured connect-phase timeout.
    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        self.timeouts.connect
    }

    /// The configured per-read timeout.
    pub fn read_timeout(&self) -> Option<std::time::Duration> {
        self.timeouts.read
    }

    /// The configured per-write timeout.
    pub fn write_timeout(&self) -> Option<std::time::Duration> {
        self.timeouts.write
    }

    /// The call this chain is executing.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// The request as transformed by the stages above this one.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The live exchange. Present only between the connect stage and the
    /// terminal stage.
    pub fn exchange(&self) -> Option<&Exchange> {
        self.exchange.as_ref()
    }

    pub(crate) fn set_exchange(&mut self, exchange: Exchange) {
        self.exchange = Some(exchange);
    }

    /// Run the remainder of the pipeline on `request`.
    pub fn proceed(&mut self, request: Request) -> crate::Result<Response> {
        if self.index >= self.interceptors.len() {
            return Err(Error::contract("proceeded past the terminal stage"));
        }

        self.proceed_count += 1;

        if self.exchange.is_some() {
            if !same_endpoint(self.request.url(), request.url()) {
                return Err(Error::contract(format!(
                    "network interceptor at index {} must retain the same host and port",
                    self.index
                )));
            }
            if self.proceed_count > 1 {
                return Err(Error::contract(format!(
                    "network interceptor at index {} must call proceed() exactly once",
                    self.index
                )));
            }
            let received_zero_body = self
                .request
                .body()
                .map_or(false, |b| b.content_length() == Some(0));
            let forwards_body = request
                .body()
                .map_or(false, |b| b.content_length() != Some(0));
            if received_zero_body && forwards_body {
                return Err(Error::contract(format!(
                    "network interceptor at index {} received a zero-length body \
                     but proceeded with a body-bearing request",
                    self.index
                )));
            }
        }

        let interceptor = self.interceptors[self.index].clone();
        let mut next = Chain {
            call: self.call.clone_handle(),
            interceptors: self.interceptors.clone(),
            index: self.index + 1,
            exchange: self.exchange.clone(),
            request,
            timeouts: self.timeouts,
            proceed_count: 0,
        };

        let response = interceptor.intercept(&mut next)?;

        // Once the exchange exists, every stage below must have driven the
        // wire exactly once; a skipped proceed would leave it dangling.
        if self.exchange.is_some()
            && self.index + 1 < self.interceptors.len()
            && next.proceed_count != 1
        {
            return Err(Error::contract(format!(
                "network interceptor at index {} must call proceed() exactly once",
                self.index
            )));
        }

        Ok(response)
    }
}

fn same_endpoint(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("request", &self.request)
            .field("has_exchange", &self.exchange.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    use crate::response::ResponseBody;
    use crate::testutil::TestHarness;

    fn canned(chain: &Chain, status: StatusCode) -> Response {
        Response::builder()
            .status(status)
            .request(chain.request().clone())
            .body(ResponseBody::empty())
            .build()
    }

    #[test]
    fn short_circuit_without_proceed() {
        let harness = TestHarness::new();
        let call = crate::testutil::test_call(&harness, "http://a.example/");

        let stack: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(|chain: &mut Chain| -> crate::Result<Response> {
                Ok(canned(chain, StatusCode::NO_CONTENT))
            }),
            Arc::new(|_: &mut Chain| -> crate::Result<Response> {
                panic!("must not be reached")
            }),
        ];
        let mut chain = Chain::new(
            call.clone_handle(),
            stack.into(),
            0,
            None,
            call.request().clone(),
        );
        let response = chain.proceed(call.request().clone()).unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[test]
    fn each_stage_sees_the_upstream_request() {
        let harness = TestHarness::new();
        let call = crate::testutil::test_call(&harness, "http://a.example/");

        let stack: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(|chain: &mut Chain| -> crate::Result<Response> {
                let mut request = chain.request().clone();
                request
                    .headers_mut()
                    .insert("x-tagged", "yes".parse::<http::header::HeaderValue>().unwrap());
                chain.proceed(request)
            }),
            Arc::new(|chain: &mut Chain| -> crate::Result<Response> {
                assert_eq!(
                    chain.request().header(&"x-tagged".parse().unwrap()),
                    Some("yes")
                );
                Ok(canned(chain, StatusCode::OK))
            }),
        ];
        let mut chain = Chain::new(
            call.clone_handle(),
            stack.into(),
            0,
            None,
            call.request().clone(),
        );
        assert!(chain.proceed(call.request().clone()).is_ok());
    }

    #[test]
    fn proceeding_past_the_terminal_stage_is_a_contract_error() {
        let harness = TestHarness::new();
        let call = crate::testutil::test_call(&harness, "http://a.example/");

        let stack: Vec<Arc<dyn Interceptor>> = Vec::new();
        let mut chain = Chain::new(
            call.clone_handle(),
            stack.into(),
            0,
            None,
            call.request().clone(),
        );
        let err = chain.proceed(call.request().clone()).unwrap_err();
        assert!(err.is_contract());
    }
}
