use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// Materializes the exchange for this attempt: finds (or dials) a healthy
/// connection, binds a codec to the call, and exposes the result to every
/// stage below.
pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: &mut Chain) -> crate::Result<Response> {
        let exchange = chain.call().init_exchange()?;
        chain.set_exchange(exchange);
        let request = chain.request().clone();
        chain.proceed(request)
    }
}
