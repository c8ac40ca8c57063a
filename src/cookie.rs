use http::header::HeaderValue;
use url::Url;

/// Provides cookies for requests and receives them from responses.
///
/// The engine asks the jar once per attempt while bridging headers, and
/// reports every `Set-Cookie` it sees on the way back.
pub trait CookieJar: Send + Sync {
    /// The `Cookie` header value for a request to `url`, if any.
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;

    /// Store the `Set-Cookie` values of a response from `url`.
    fn set_cookies(&self, url: &Url, cookies: &mut dyn Iterator<Item = &HeaderValue>);
}

/// A jar that holds nothing and remembers nothing.
#[derive(Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        None
    }

    fn set_cookies(&self, _url: &Url, _cookies: &mut dyn Iterator<Item = &HeaderValue>) {}
}
