use std::io::Read;
use std::sync::Arc;
use std::time::SystemTime;

use http::header::{HeaderMap, HeaderName, WARNING};
use http::{Method, StatusCode, Version};
use log::{debug, trace};

use crate::cache::{is_cacheable, CacheStore, CacheStrategy, CacheWriteHandle};
use crate::codec::BodySource;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::{Response, ResponseBody};

/// How many trailing body bytes an abandoned cache write will drain from
/// the network trying to complete the entry before giving up.
const DRAIN_LIMIT: u64 = 64 * 1024;

/// Serves responses from the cache and writes network responses into it,
/// revalidating stale entries with conditional requests.
pub(crate) struct CacheInterceptor {
    cache: Option<Arc<dyn CacheStore>>,
}

impl CacheInterceptor {
    pub(crate) fn new(cache: Option<Arc<dyn CacheStore>>) -> CacheInterceptor {
        CacheInterceptor { cache }
    }

    fn finish_network(
        &self,
        request: &Request,
        mut response: Response,
    ) -> crate::Result<Response> {
        let Some(cache) = &self.cache else {
            return Ok(response);
        };

        if invalidates_cache(request.method()) {
            if response.status().is_success() {
                cache.remove(request);
            }
            return Ok(response);
        }

        if is_cacheable(&response, request) && response.body_mut().is_some() {
            if let Some(handle) = cache.put(&response) {
                trace!("caching response for {}", response.url());
                response = tee_into_cache(response, handle);
            }
        }
        Ok(response)
    }
}

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        let call = chain.call().clone_handle();
        let request = chain.request().clone();
        let now = SystemTime::now();

        let candidate = self.cache.as_ref().and_then(|c| c.get(&request));
        let strategy = CacheStrategy::compute(now, &request, candidate);
        if let Some(cache) = &self.cache {
            cache.track_response(&strategy);
        }
        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;

        match (network_request, cache_response) {
            // Required a cached response and had none: unsatisfiable.
            (None, None) => {
                let response = Response::builder()
                    .status(StatusCode::GATEWAY_TIMEOUT)
                    .version(Version::HTTP_11)
                    .request(request)
                    .sent_at(now)
                    .received_at(now)
                    .body(ResponseBody::empty())
                    .build();
                call.events().satisfaction_failure(&call, &response);
                Ok(response)
            }

            // Fresh enough: no network at all.
            (None, Some(cached)) => {
                let stripped = cached.stripped();
                let response = cached.to_builder().cache_response(Some(stripped)).build();
                call.events().cache_hit(&call, &response);
                Ok(response)
            }

            // Conditional revalidation.
            (Some(network_request), Some(cached)) => {
                let network_response = match chain.proceed(network_request.clone()) {
                    Ok(response) => response,
                    Err(e) => {
                        cached.close();
                        return Err(e);
                    }
                };

                if network_response.status() == StatusCode::NOT_MODIFIED {
                    debug!("conditional cache hit for {}", request.url());
                    let merged_headers =
                        combine_headers(cached.headers(), network_response.headers());
                    let cached_stripped = cached.stripped();
                    let network_stripped = network_response.stripped();
                    let merged = cached
                        .to_builder()
                        .headers(merged_headers)
                        .sent_at(network_response.sent_at())
                        .received_at(network_response.received_at())
                        .cache_response(Some(cached_stripped))
                        .network_response(Some(network_stripped))
                        .build();
                    network_response.close();

                    if let Some(cache) = &self.cache {
                        cache.track_conditional_hit();
                        cache.update(merged.cache_response().expect("attached above"), &merged);
                    }
                    call.events().cache_conditional_hit(&call, &merged);
                    call.events().cache_hit(&call, &merged);
                    return Ok(merged);
                }

                // The entry failed validation; the network response is the
                // fresh truth.
                let cached_stripped = cached.stripped();
                cached.close();
                let response = network_response
                    .to_builder()
                    .cache_response(Some(cached_stripped))
                    .build();
                self.finish_network(&network_request, response)
            }

            // Plain network.
            (Some(network_request), None) => {
                if self.cache.is_some() {
                    call.events().cache_miss(&call);
                }
                let network_response = chain.proceed(network_request.clone())?;
                self.finish_network(&network_request, network_response)
            }
        }
    }
}

fn invalidates_cache(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE" | "MOVE")
}

/// Combine cached and `304` headers per RFC 7234 §4.3.4: end-to-end headers
/// are refreshed from the network, content-specific ones stay with the body
/// they describe.
fn combine_headers(cached: &HeaderMap, network: &HeaderMap) -> HeaderMap {
    let mut result = HeaderMap::new();

    for (name, value) in cached.iter() {
        if name == WARNING
            && value
                .to_str()
                .map(|v| v.starts_with('1'))
                .unwrap_or(false)
        {
            // 1xx warnings describe the stale entry, not the merged one.
            continue;
        }
        if is_content_specific(name) || !is_end_to_end(name) || !network.contains_key(name) {
            result.append(name.clone(), value.clone());
        }
    }

    for (name, value) in network.iter() {
        if !is_content_specific(name) && is_end_to_end(name) {
            result.append(name.clone(), value.clone());
        }
    }

    result
}

fn is_content_specific(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "content-length" | "content-encoding" | "content-type"
    )
}

/// Whether a header is forwarded across caches and proxies unchanged, i.e.
/// not in the hop-by-hop set.
fn is_end_to_end(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn tee_into_cache(mut response: Response, handle: Box<dyn CacheWriteHandle>) -> Response {
    let Some(body) = response.body_mut().take() else {
        return response;
    };
    let source = body.into_source();
    *response.body_mut() = Some(ResponseBody::new(Box::new(CacheWritingSource {
        source,
        handle: Some(handle),
    })));
    response
}

/// Tees network body bytes into the cache while the application reads them.
/// EOF commits the entry; a failure or an early close that cannot be
/// drained within [`DRAIN_LIMIT`] aborts it.
struct CacheWritingSource {
    source: Box<dyn BodySource>,
    handle: Option<Box<dyn CacheWriteHandle>>,
}

impl Read for CacheWritingSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.source.read(buf) {
            Ok(0) => {
                if let Some(handle) = self.handle.take() {
                    handle.commit();
                }
                Ok(0)
            }
            Ok(n) => {
                if let Some(handle) = &mut self.handle {
                    if handle.write(&buf[..n]).is_err() {
                        // The cache is in trouble; serving continues.
                        if let Some(handle) = self.handle.take() {
                            handle.abort();
                        }
                    }
                }
                Ok(n)
            }
            Err(e) => {
                if let Some(handle) = self.handle.take() {
                    handle.abort();
                }
                Err(e)
            }
        }
    }
}

impl BodySource for CacheWritingSource {
    fn content_length(&self) -> Option<u64> {
        self.source.content_length()
    }

    fn close(&mut self) -> std::io::Result<()> {
        if let Some(mut handle) = self.handle.take() {
            // Bytes remain. Try to complete the entry from the network
            // within a bounded budget, otherwise give the write up.
            let mut drained: u64 = 0;
            let mut buf = [0u8; 8 * 1024];
            let mut handle = loop {
                if drained > DRAIN_LIMIT {
                    break Some(handle);
                }
                match self.source.read(&mut buf) {
                    Ok(0) => {
                        handle.commit();
                        break None;
                    }
                    Ok(n) => {
                        drained += n as u64;
                        if handle.write(&buf[..n]).is_err() {
                            break Some(handle);
                        }
                    }
                    Err(_) => break Some(handle),
                }
            };
            if let Some(handle) = handle.take() {
                debug!("abandoning cache write after draining {drained} bytes");
                handle.abort();
            }
        }
        self.source.close()
    }
}

impl Drop for CacheWritingSource {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::{CONTENT_TYPE, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn combine_refreshes_end_to_end_headers() {
        let cached = headers(&[
            ("content-type", "text/plain"),
            ("cache-control", "max-age=60"),
            ("x-extra", "cached"),
        ]);
        let network = headers(&[("cache-control", "max-age=120")]);

        let combined = combine_headers(&cached, &network);
        assert_eq!(combined.get("cache-control").unwrap(), "max-age=120");
        assert_eq!(combined.get("content-type").unwrap(), "text/plain");
        assert_eq!(combined.get("x-extra").unwrap(), "cached");
    }

    #[test]
    fn combine_keeps_content_specific_headers_from_cache() {
        let cached = headers(&[("content-length", "5"), ("content-encoding", "gzip")]);
        let network = headers(&[("content-length", "0"), ("etag", "\"v2\"")]);

        let combined = combine_headers(&cached, &network);
        assert_eq!(combined.get("content-length").unwrap(), "5");
        assert_eq!(combined.get("content-encoding").unwrap(), "gzip");
        assert_eq!(combined.get("etag").unwrap(), "\"v2\"");
    }

    #[test]
    fn combine_drops_hop_by_hop_and_stale_warnings() {
        let cached = headers(&[
            ("connection", "keep-alive"),
            ("warning", "110 - \"Response is stale\""),
            ("warning", "214 - \"Transformation applied\""),
        ]);
        let network = headers(&[("transfer-encoding", "chunked")]);

        let combined = combine_headers(&cached, &network);
        // Hop-by-hop headers survive from the cached side only.
        assert_eq!(combined.get("connection").unwrap(), "keep-alive");
        assert!(combined.get("transfer-encoding").is_none());
        let warnings: Vec<_> = combined.get_all("warning").iter().collect();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].to_str().unwrap().starts_with("214"));
    }

    #[test]
    fn content_type_is_content_specific() {
        assert!(is_content_specific(&CONTENT_TYPE));
        assert!(is_end_to_end(&CONTENT_TYPE));
    }
}
