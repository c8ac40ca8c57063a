use std::sync::Arc;

use http::header::{
    HeaderMap, HeaderValue, CONNECTION, CONTENT_LENGTH, COOKIE, HOST, SET_COOKIE,
    TRANSFER_ENCODING, USER_AGENT,
};

use crate::cookie::CookieJar;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

static DEFAULT_USER_AGENT: &str = concat!("carrier/", env!("CARGO_PKG_VERSION"));

/// Bridges application requests onto the wire: fills in the headers HTTP
/// requires (`Host`, body framing), the client's defaults, and cookies.
pub(crate) struct BridgeInterceptor {
    default_headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    cookie_jar: Arc<dyn CookieJar>,
}

impl BridgeInterceptor {
    pub(crate) fn new(
        default_headers: HeaderMap,
        user_agent: Option<HeaderValue>,
        cookie_jar: Arc<dyn CookieJar>,
    ) -> BridgeInterceptor {
        BridgeInterceptor {
            default_headers,
            user_agent,
            cookie_jar,
        }
    }
}

impl Interceptor for BridgeInterceptor {
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        let user_request = chain.request().clone();
        let mut request = user_request.clone();
        let url = request.url().clone();

        if let Some(body) = request.body() {
            match body.content_length() {
                Some(length) => {
                    let value = HeaderValue::from_str(&length.to_string())
                        .expect("a decimal is a valid header value");
                    request.headers_mut().insert(CONTENT_LENGTH, value);
                    request.headers_mut().remove(TRANSFER_ENCODING);
                }
                None => {
                    request
                        .headers_mut()
                        .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                    request.headers_mut().remove(CONTENT_LENGTH);
                }
            }
        }

        if !request.headers().contains_key(HOST) {
            let host = match url.port() {
                Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
                None => url.host_str().unwrap_or_default().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&host) {
                request.headers_mut().insert(HOST, value);
            }
        }

        if !request.headers().contains_key(CONNECTION) {
            request
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        if !request.headers().contains_key(USER_AGENT) {
            let agent = self
                .user_agent
                .clone()
                .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_USER_AGENT));
            request.headers_mut().insert(USER_AGENT, agent);
        }

        for (name, value) in self.default_headers.iter() {
            if !request.headers().contains_key(name) {
                request.headers_mut().insert(name, value.clone());
            }
        }

        if let Some(cookies) = self.cookie_jar.cookies(&url) {
            request.headers_mut().insert(COOKIE, cookies);
        }

        let response = chain.proceed(request)?;

        {
            let mut set_cookies = response.headers().get_all(SET_COOKIE).iter();
            self.cookie_jar.set_cookies(&url, &mut set_cookies);
        }

        // Surface the application's request, not the bridged one.
        Ok(response.to_builder().request(user_request).build())
    }
}
