use std::fmt;
use std::time::{Duration, SystemTime};

use http::header::{
    HeaderMap, CACHE_CONTROL, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, PRAGMA, WARNING,
};
use http::Method;

use crate::request::Request;
use crate::response::Response;

/// Storage for cached responses, keyed by request URL.
///
/// Implementations own the persistence format; the engine hands them whole
/// responses and streams network bodies through [`CacheWriteHandle`]s.
pub trait CacheStore: Send + Sync {
    /// The stored response for `request`, if any. The engine evaluates its
    /// freshness; stale entries should still be returned.
    fn get(&self, request: &Request) -> Option<Response>;

    /// Begin storing `response`. Returning `None` declines to cache it.
    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriteHandle>>;

    /// Drop the entry for `request`'s URL.
    fn remove(&self, request: &Request);

    /// Replace `cached`'s metadata with `network`'s after a validation hit.
    fn update(&self, cached: &Response, network: &Response);

    /// Statistics hook: a strategy was computed for a request.
    fn track_response(&self, strategy: &CacheStrategy) {
        let _ = strategy;
    }

    /// Statistics hook: a conditional request was answered `304`.
    fn track_conditional_hit(&self) {}
}

/// An in-progress cache write. The body streams in as the application reads
/// it from the network.
pub trait CacheWriteHandle: Send {
    /// Append body bytes to the pending entry.
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// The body arrived completely; persist the entry.
    fn commit(self: Box<Self>);

    /// The body was cut short; discard the entry.
    fn abort(self: Box<Self>);
}

/// The decision for one request against one cached candidate: which of the
/// network and the cache will serve it.
pub struct CacheStrategy {
    /// The request to send, `None` to satisfy from cache alone.
    pub network_request: Option<Request>,
    /// The cached response to serve or validate against, `None` when the
    /// cache cannot contribute.
    pub cache_response: Option<Response>,
}

impl CacheStrategy {
    /// Decide how to satisfy `request` given a stored `cached` candidate.
    ///
    /// When both fields of the result are `None` the request demanded
    /// `only-if-cached` satisfaction the cache cannot provide.
    pub fn compute(now: SystemTime, request: &Request, cached: Option<Response>) -> CacheStrategy {
        let strategy = Self::compute_candidate(now, request, cached);

        if strategy.network_request.is_some()
            && CacheControl::parse(request.headers()).only_if_cached
        {
            // The network is required but forbidden.
            if let Some(cached) = strategy.cache_response {
                cached.close();
            }
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }

        strategy
    }

    fn compute_candidate(
        now: SystemTime,
        request: &Request,
        cached: Option<Response>,
    ) -> CacheStrategy {
        let network = |cached: Option<Response>| {
            if let Some(cached) = cached {
                cached.close();
            }
            CacheStrategy {
                network_request: Some(request.clone()),
                cache_response: None,
            }
        };

        let Some(mut cached) = cached else {
            return network(None);
        };

        // A secured request cannot be served by an entry recorded without
        // its handshake.
        if request.url().scheme() == "https" && cached.handshake().is_none() {
            return network(Some(cached));
        }

        if !is_cacheable(&cached, request) {
            return network(Some(cached));
        }

        let request_cc = CacheControl::parse(request.headers());
        if request_cc.no_cache || has_conditions(request) {
            return network(Some(cached));
        }

        let cached_cc = CacheControl::parse(cached.headers());

        let age = response_age(now, &cached);
        let mut freshness = freshness_lifetime(&cached);
        if let Some(request_max_age) = request_cc.max_age {
            freshness = freshness.min(request_max_age);
        }
        let min_fresh = request_cc.min_fresh.unwrap_or(Duration::ZERO);
        let max_stale = if cached_cc.must_revalidate {
            Duration::ZERO
        } else {
            request_cc.max_stale.unwrap_or(Duration::ZERO)
        };

        if !cached_cc.no_cache && age + min_fresh < freshness + max_stale {
            if age + min_fresh >= freshness {
                cached.headers_mut().append(
                    WARNING,
                    http::header::HeaderValue::from_static("110 - \"Response is stale\""),
                );
            }
            if is_freshness_heuristic(&cached) && age > Duration::from_secs(24 * 60 * 60) {
                cached.headers_mut().append(
                    WARNING,
                    http::header::HeaderValue::from_static(
                        "113 - \"Heuristic expiration\"",
                    ),
                );
            }
            return CacheStrategy {
                network_request: None,
                cache_response: Some(cached),
            };
        }

        // Stale. Find a validator to revalidate with.
        let (condition_name, condition_value) = if let Some(etag) = cached.header(&ETAG) {
            (IF_NONE_MATCH, etag.to_string())
        } else if let Some(last_modified) = cached.header(&LAST_MODIFIED) {
            (IF_MODIFIED_SINCE, last_modified.to_string())
        } else if let Some(date) = cached.header(&DATE) {
            (IF_MODIFIED_SINCE, date.to_string())
        } else {
            return network(Some(cached));
        };

        let mut conditional = request.clone();
        if let Ok(value) = condition_value.parse() {
            conditional.headers_mut().insert(condition_name, value);
        }
        CacheStrategy {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }
}

impl fmt::Debug for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CacheStrategy")
            .field("network", &self.network_request.is_some())
            .field("cache", &self.cache_response.is_some())
            .finish()
    }
}

/// Whether `response` may be stored and later served for `request`.
pub(crate) fn is_cacheable(response: &Response, request: &Request) -> bool {
    // Only GET responses are worth the complexity of storing.
    if request.method() != Method::GET {
        return false;
    }
    let explicit_freshness = || {
        let cc = CacheControl::parse(response.headers());
        cc.max_age.is_some() || response.headers().contains_key(EXPIRES) || cc.public || cc.private
    };
    match response.status().as_u16() {
        200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
        302 | 307 => {
            if !explicit_freshness() {
                return false;
            }
        }
        _ => return false,
    }

    !CacheControl::parse(response.headers()).no_store
        && !CacheControl::parse(request.headers()).no_store
}

fn has_conditions(request: &Request) -> bool {
    request.headers().contains_key(IF_MODIFIED_SINCE)
        || request.headers().contains_key(IF_NONE_MATCH)
}

fn is_freshness_heuristic(cached: &Response) -> bool {
    CacheControl::parse(cached.headers()).max_age.is_none()
        && !cached.headers().contains_key(EXPIRES)
        && cached.headers().contains_key(LAST_MODIFIED)
}

fn parse_date(value: Option<&str>) -> Option<SystemTime> {
    value.and_then(|v| httpdate::parse_http_date(v).ok())
}

fn since(later: SystemTime, earlier: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// The current age of a cached response, per RFC 7234 §4.2.3.
fn response_age(now: SystemTime, cached: &Response) -> Duration {
    let served_date = parse_date(cached.header(&DATE));
    let received_at = cached.received_at();
    let sent_at = cached.sent_at();

    let apparent_age = served_date
        .map(|date| since(received_at, date))
        .unwrap_or(Duration::ZERO);
    let age_header = cached
        .header(&http::header::AGE)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::ZERO);

    let received_age = apparent_age.max(age_header);
    let response_duration = since(received_at, sent_at);
    let resident_duration = since(now, received_at);
    received_age + response_duration + resident_duration
}

/// How long a cached response stays fresh, per RFC 7234 §4.2.1 with the
/// ten-percent heuristic for responses carrying only `Last-Modified`.
fn freshness_lifetime(cached: &Response) -> Duration {
    let cc = CacheControl::parse(cached.headers());
    if let Some(max_age) = cc.max_age {
        return max_age;
    }

    let served_date = parse_date(cached.header(&DATE));
    if let Some(expires) = parse_date(cached.header(&EXPIRES)) {
        let served = served_date.unwrap_or_else(|| cached.received_at());
        return since(expires, served);
    }

    if let Some(last_modified) = parse_date(cached.header(&LAST_MODIFIED)) {
        if cached.request().url().query().is_none() {
            let served = served_date.unwrap_or_else(|| cached.sent_at());
            return since(served, last_modified) / 10;
        }
    }

    Duration::ZERO
}

/// The `Cache-Control` directives the engine evaluates.
#[derive(Debug, Default, Clone)]
pub struct CacheControl {
    /// `no-cache`: revalidate before serving a stored response.
    pub no_cache: bool,
    /// `no-store`: never store this exchange.
    pub no_store: bool,
    /// `only-if-cached`: fail rather than touch the network.
    pub only_if_cached: bool,
    /// `must-revalidate`: staleness overrides are not honored.
    pub must_revalidate: bool,
    /// `public`: explicitly cacheable.
    pub public: bool,
    /// `private`: cacheable only by a private cache.
    pub private: bool,
    /// `max-age`: the freshness lifetime.
    pub max_age: Option<Duration>,
    /// `max-stale`: staleness the requester tolerates.
    pub max_stale: Option<Duration>,
    /// `min-fresh`: freshness margin the requester demands.
    pub min_fresh: Option<Duration>,
}

impl CacheControl {
    /// Parse every `Cache-Control` header in `headers`, plus the legacy
    /// `Pragma: no-cache`.
    pub fn parse(headers: &HeaderMap) -> CacheControl {
        let mut cc = CacheControl::default();

        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let mut parts = directive.trim().splitn(2, '=');
                let name = parts.next().unwrap_or("").trim();
                let argument = parts
                    .next()
                    .map(|a| a.trim().trim_matches('"'))
                    .unwrap_or("");
                match name.to_ascii_lowercase().as_str() {
                    "no-cache" => cc.no_cache = true,
                    "no-store" => cc.no_store = true,
                    "only-if-cached" => cc.only_if_cached = true,
                    "must-revalidate" => cc.must_revalidate = true,
                    "public" => cc.public = true,
                    "private" => cc.private = true,
                    "max-age" => cc.max_age = parse_seconds(argument),
                    "max-stale" => {
                        cc.max_stale = if argument.is_empty() {
                            Some(Duration::from_secs(u32::MAX as u64))
                        } else {
                            parse_seconds(argument)
                        }
                    }
                    "min-fresh" => cc.min_fresh = parse_seconds(argument),
                    _ => {}
                }
            }
        }

        for value in headers.get_all(PRAGMA) {
            if value
                .to_str()
                .map(|v| v.eq_ignore_ascii_case("no-cache"))
                .unwrap_or(false)
            {
                cc.no_cache = true;
            }
        }

        cc
    }
}

fn parse_seconds(argument: &str) -> Option<Duration> {
    argument.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;
    use http::{Method, StatusCode};

    use crate::response::ResponseBody;
    use crate::transport::Handshake;

    fn request(url: &str) -> Request {
        Request::new(Method::GET, url.parse().unwrap())
    }

    fn cached(now: SystemTime, age: Duration, headers: &[(&str, String)]) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .request(request("http://example.com/doc"))
            .sent_at(now - age)
            .received_at(now - age)
            .body(ResponseBody::bytes_body("cached"));
        builder = builder.header(DATE, httpdate::fmt_http_date(now - age));
        for (name, value) in headers {
            let name: http::header::HeaderName = name.parse().unwrap();
            builder = builder.header(name, HeaderValue::from_str(value).unwrap());
        }
        builder.build()
    }

    #[test]
    fn parses_directives() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, max-age=120, max-stale"),
        );
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache);
        assert_eq!(cc.max_age, Some(Duration::from_secs(120)));
        assert!(cc.max_stale.unwrap() > Duration::from_secs(1_000_000));
    }

    #[test]
    fn fresh_response_is_served_from_cache() {
        let now = SystemTime::now();
        let cached = cached(
            now,
            Duration::from_secs(10),
            &[("cache-control", "max-age=60".to_string())],
        );
        let strategy = CacheStrategy::compute(now, &request("http://example.com/doc"), Some(cached));
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn expired_response_with_etag_revalidates() {
        let now = SystemTime::now();
        let cached = cached(
            now,
            Duration::from_secs(120),
            &[
                ("cache-control", "max-age=60".to_string()),
                ("etag", "\"v1\"".to_string()),
            ],
        );
        let strategy = CacheStrategy::compute(now, &request("http://example.com/doc"), Some(cached));
        let conditional = strategy.network_request.expect("conditional request");
        assert_eq!(conditional.header(&IF_NONE_MATCH), Some("\"v1\""));
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn expired_response_without_validator_goes_to_network() {
        let now = SystemTime::now();
        let cached = cached(now, Duration::from_secs(120), &[]);
        // Strip the Date header so no validator remains at all.
        let mut cached = cached;
        cached.headers_mut().remove(DATE);
        let strategy = CacheStrategy::compute(now, &request("http://example.com/doc"), Some(cached));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn only_if_cached_without_candidate_is_unsatisfiable() {
        let now = SystemTime::now();
        let mut req = request("http://example.com/doc");
        req.headers_mut().insert(
            CACHE_CONTROL,
            HeaderValue::from_static("only-if-cached"),
        );
        let strategy = CacheStrategy::compute(now, &req, None);
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_none());
    }

    #[test]
    fn https_entry_without_handshake_is_unusable() {
        let now = SystemTime::now();
        let mut entry = Response::builder()
            .status(StatusCode::OK)
            .request(request("https://example.com/doc"))
            .sent_at(now)
            .received_at(now)
            .header(CACHE_CONTROL, HeaderValue::from_static("max-age=600"))
            .body(ResponseBody::bytes_body("cached"))
            .build();
        let req = request("https://example.com/doc");

        let strategy = CacheStrategy::compute(now, &req, Some(entry));
        assert!(strategy.network_request.is_some());
        assert!(strategy.cache_response.is_none());

        entry = Response::builder()
            .status(StatusCode::OK)
            .request(request("https://example.com/doc"))
            .sent_at(now)
            .received_at(now)
            .header(CACHE_CONTROL, HeaderValue::from_static("max-age=600"))
            .handshake(Some(Handshake::new("TLSv1.3", "TLS_AES_128_GCM_SHA256")))
            .body(ResponseBody::bytes_body("cached"))
            .build();
        let strategy = CacheStrategy::compute(now, &req, Some(entry));
        assert!(strategy.network_request.is_none());
        assert!(strategy.cache_response.is_some());
    }

    #[test]
    fn stale_but_acceptable_response_is_warned() {
        let now = SystemTime::now();
        let cached = cached(
            now,
            Duration::from_secs(90),
            &[("cache-control", "max-age=60".to_string())],
        );
        let mut req = request("http://example.com/doc");
        req.headers_mut().insert(
            CACHE_CONTROL,
            HeaderValue::from_static("max-stale=120"),
        );
        let strategy = CacheStrategy::compute(now, &req, Some(cached));
        let served = strategy.cache_response.expect("served stale");
        assert!(served
            .headers()
            .get_all(WARNING)
            .iter()
            .any(|w| w.to_str().unwrap().starts_with("110")));
    }
}
