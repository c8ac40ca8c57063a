use std::time::SystemTime;

use http::header::{CONNECTION, EXPECT};
use http::{Method, StatusCode};

use crate::codec::ResponseHead;
use crate::error::Error;
use crate::exchange::Exchange;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::{Response, ResponseBody};

/// The terminal stage: writes the request over the codec, reads the
/// response, and wires up the streaming body.
///
/// An interim `100` received without a matching `Expect` is discarded and
/// the next head is read; exactly one such discard is performed.
pub(crate) struct CallServerStage;

impl Interceptor for CallServerStage {
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        let exchange = chain
            .exchange()
            .cloned()
            .ok_or_else(|| Error::contract("the terminal stage requires an exchange"))?;
        let call = chain.call().clone_handle();
        let request = chain.request().clone();

        let sent_at = SystemTime::now();
        let mut early_head: Option<ResponseHead> = None;

        let send_result = send_request(&exchange, &request, &mut early_head);
        let send_error = match send_result {
            Ok(()) => None,
            // A shutdown means nothing was transmitted; rethrow unchanged
            // without attempting a response read, so retry can react.
            Err(e) if e.is_connection_shutdown() => return Err(e),
            Err(e) => Some(e),
        };

        call.events().response_headers_start(&call);
        let read_result = read_response(&exchange, &call, &request, sent_at, early_head);

        match (send_error, read_result) {
            (None, Ok(response)) => Ok(response),
            // The transmission failure wins only when reading succeeded.
            (Some(send), Ok(response)) => {
                response.close();
                Err(send)
            }
            (Some(send), Err(read)) => Err(read.with_suppressed(send)),
            (None, Err(read)) => Err(read),
        }
    }
}

fn permits_request_body(method: &Method) -> bool {
    method != Method::GET && method != Method::HEAD
}

fn send_request(
    exchange: &Exchange,
    request: &Request,
    early_head: &mut Option<ResponseHead>,
) -> crate::Result<()> {
    exchange.write_request_headers(request)?;

    let body = request.body().cloned();
    match body {
        Some(body) if permits_request_body(request.method()) => {
            let expects_continue = request
                .header(&EXPECT)
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);

            let mut write_body = true;
            if expects_continue {
                exchange.flush_request()?;
                *early_head = exchange.read_response_headers(true)?;
                if early_head.is_some() {
                    // The server answered before the body. It is never
                    // transmitted, and an HTTP/1.1 connection is left with
                    // an unmet expectation it may not have drained.
                    write_body = false;
                    exchange.no_request_body();
                    if !exchange.is_multiplexed() {
                        exchange.no_new_exchanges_on_connection();
                    }
                }
            }

            if write_body {
                if body.is_duplex() {
                    exchange.flush_request()?;
                    let sink = exchange.create_request_sink(request, true)?;
                    body.hand_off(sink);
                } else {
                    let mut sink = exchange.create_request_sink(request, false)?;
                    body.write_to(&mut sink)?;
                    sink.close()?;
                }
            }

            if !body.is_duplex() {
                exchange.finish_request()?;
            }
        }
        _ => {
            exchange.no_request_body();
            exchange.finish_request()?;
        }
    }

    Ok(())
}

fn read_response(
    exchange: &Exchange,
    call: &crate::Call,
    request: &Request,
    sent_at: SystemTime,
    early_head: Option<ResponseHead>,
) -> crate::Result<Response> {
    let mut head = match early_head {
        Some(head) => head,
        None => exchange
            .read_response_headers(false)?
            .ok_or_else(|| Error::protocol("expected a response"))?,
    };

    if head.status == StatusCode::CONTINUE {
        head = exchange
            .read_response_headers(false)?
            .ok_or_else(|| Error::protocol("expected a response after an interim 100"))?;
    }

    let received_at = SystemTime::now();
    let response = Response::builder()
        .status(head.status)
        .version(head.version)
        .headers(head.headers)
        .request(request.clone())
        .sent_at(sent_at)
        .received_at(received_at)
        .handshake(exchange.connection().handshake().cloned())
        .build();
    call.events().response_headers_end(call, &response);

    let response = if response.status() == StatusCode::SWITCHING_PROTOCOLS && call.is_web_socket()
    {
        // The upgrade consumed the stream; the socket now belongs to the
        // websocket, and this connection is finished as far as HTTP goes.
        exchange.no_new_exchanges_on_connection();
        exchange.no_response_body();
        response.to_builder().body(ResponseBody::empty()).build()
    } else {
        let body = exchange.open_response_body(&response)?;
        response.to_builder().body(body).build()
    };

    if wants_close(request.header(&CONNECTION)) || wants_close(response.header(&CONNECTION)) {
        exchange.no_new_exchanges_on_connection();
    }

    let status = response.status().as_u16();
    if status == 204 || status == 205 {
        let advertised = response.content_length().unwrap_or(0);
        if advertised > 0 {
            exchange.no_new_exchanges_on_connection();
            response.close();
            return Err(Error::protocol(format!(
                "HTTP {status} had non-zero Content-Length: {advertised}"
            )));
        }
    }

    Ok(response)
}

fn wants_close(header: Option<&str>) -> bool {
    header
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false)
}
