use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION, RETRY_AFTER, TRANSFER_ENCODING};
use http::Method;
use log::debug;

use crate::call::Call;
use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;

/// How many follow-ups (redirects plus retried statuses) a single call will
/// chase before giving up. Matches the limit common across browsers.
const MAX_FOLLOW_UPS: u32 = 20;

/// Recovers from transport failures by rerouting, and follows redirects and
/// retryable statuses, re-entering the chain once per attempt.
pub(crate) struct RetryAndFollowUp;

impl RetryAndFollowUp {
    pub(crate) fn new() -> RetryAndFollowUp {
        RetryAndFollowUp
    }

    /// Whether the failed attempt may be transparently retried.
    fn recover(&self, call: &Call, request: &Request, error: &Error) -> bool {
        if !call.client().retry_on_connection_failure() {
            return false;
        }
        if error.is_canceled()
            || error.is_timeout()
            || error.is_protocol()
            || error.is_contract()
            || error.is_builder()
        {
            return false;
        }
        // A connection shutdown means nothing was transmitted; anything
        // else may have sent a one-shot body we cannot replay.
        if error.is_connection_shutdown() {
            return true;
        }
        if let Some(body) = request.body() {
            if body.is_one_shot() {
                return false;
            }
        }
        if error.is_connect() || error.is_request() || error.is_body() {
            return call.retry_after_failure();
        }
        false
    }

    /// The next request to issue for `response`, or `None` when `response`
    /// is final.
    fn follow_up_request(
        &self,
        call: &Call,
        response: &Response,
    ) -> crate::Result<Option<Request>> {
        match response.status().as_u16() {
            307 | 308 => {
                // Redirecting with a method the server told us to preserve
                // is only safe for requests without side effects.
                let method = response.request().method();
                if method != Method::GET && method != Method::HEAD {
                    return Ok(None);
                }
                Ok(self.build_redirect_request(call, response))
            }
            300..=303 => Ok(self.build_redirect_request(call, response)),
            401 | 407 => {
                // Challenges are the embedder's concern; surface them.
                Ok(None)
            }
            408 => {
                if !call.client().retry_on_connection_failure() {
                    return Ok(None);
                }
                if let Some(body) = response.request().body() {
                    if body.is_one_shot() {
                        return Ok(None);
                    }
                }
                if response
                    .prior_response()
                    .map(|p| p.status().as_u16() == 408)
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                if retry_after_seconds(response).unwrap_or(0) > 0 {
                    return Ok(None);
                }
                Ok(Some(response.request().clone()))
            }
            503 => {
                if response
                    .prior_response()
                    .map(|p| p.status().as_u16() == 503)
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                if retry_after_seconds(response) == Some(0) {
                    return Ok(Some(response.request().clone()));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn build_redirect_request(&self, call: &Call, response: &Response) -> Option<Request> {
        if !call.client().follow_redirects() {
            return None;
        }
        let location = response.header(&LOCATION)?;
        let next_url = response.url().join(location).ok()?;
        if !matches!(next_url.scheme(), "http" | "https") {
            return None;
        }

        let mut request = response.request().clone();
        let status = response.status().as_u16();
        let method = request.method().clone();

        // Most redirects of a mutating request are followed as a GET of the
        // new location; 307 and 308 preserve the method (checked above).
        if (300..=303).contains(&status) && method != Method::GET && method != Method::HEAD {
            *request.method_mut() = Method::GET;
            request.set_body(None);
            request.headers_mut().remove(CONTENT_LENGTH);
            request.headers_mut().remove(CONTENT_TYPE);
            request.headers_mut().remove(TRANSFER_ENCODING);
        }

        // Don't leak credentials across hosts.
        let cross_host = next_url.host_str() != response.url().host_str()
            || next_url.port_or_known_default() != response.url().port_or_known_default()
            || next_url.scheme() != response.url().scheme();
        if cross_host {
            request.headers_mut().remove(AUTHORIZATION);
            request.headers_mut().remove(COOKIE);
        }

        *request.url_mut() = next_url;
        Some(request)
    }
}

impl Interceptor for RetryAndFollowUp {
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        let call = chain.call().clone_handle();
        let mut request = chain.request().clone();
        let mut follow_up_count = 0u32;
        let mut prior_response: Option<Response> = None;
        let mut recovered_failures: Vec<Error> = Vec::new();

        loop {
            call.prepare_finder(&request)?;

            if call.is_canceled() {
                return Err(Error::canceled().with_url(request.url().clone()));
            }

            let response = match chain.proceed(request.clone()) {
                Ok(response) => response,
                Err(e) => {
                    call.exit_network_zone();
                    if !self.recover(&call, &request, &e) {
                        let mut error = e;
                        for suppressed in recovered_failures.drain(..) {
                            error = error.with_suppressed(suppressed);
                        }
                        return Err(error);
                    }
                    debug!("recovered from {e}; retrying {}", request.url());
                    recovered_failures.push(e);
                    continue;
                }
            };

            let mut response = response;
            if let Some(prior) = prior_response.take() {
                response.set_prior_response(prior);
            }

            let follow_up = self.follow_up_request(&call, &response)?;
            let Some(next_request) = follow_up else {
                if call.is_web_socket() {
                    call.timeout_early_exit();
                }
                return Ok(response);
            };

            if let Some(body) = next_request.body() {
                if body.is_one_shot() {
                    return Ok(response);
                }
            }

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(
                    Error::request(format!("too many follow-up requests: {follow_up_count}"))
                        .with_url(response.url().clone()),
                );
            }

            debug!(
                "following up {} -> {}",
                response.status(),
                next_request.url()
            );
            if let Some(body) = response.body_mut().take() {
                body.close();
            }
            call.exit_network_zone();

            prior_response = Some(response);
            request = next_request;
        }
    }
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
    response
        .header(&RETRY_AFTER)
        .and_then(|v| v.trim().parse().ok())
}
