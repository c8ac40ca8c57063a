use crate::call::Call;
use crate::connection::Connection;
use crate::error::Error;
use crate::response::Response;

/// Listener for the quantitative events of a call's lifetime.
///
/// All methods default to no-ops; implement the ones of interest. Methods
/// are invoked on whichever thread drives the call at that moment and must
/// not block.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    /// A call was started via `execute` or `enqueue`.
    fn call_start(&self, call: &Call) {}

    /// A call finished successfully. Terminal.
    fn call_end(&self, call: &Call) {}

    /// A call failed permanently. Terminal.
    fn call_failed(&self, call: &Call, error: &Error) {}

    /// `cancel` was invoked on the call.
    fn canceled(&self, call: &Call) {}

    /// The call was bound to a connection, pooled or newly dialed.
    fn connection_acquired(&self, call: &Call, connection: &Connection) {}

    /// The call released its connection.
    fn connection_released(&self, call: &Call, connection: &Connection) {}

    /// A cached response satisfied the call without touching the network.
    fn cache_hit(&self, call: &Call, response: &Response) {}

    /// The cache held nothing usable; the call went to the network.
    fn cache_miss(&self, call: &Call) {}

    /// A conditional request was answered with `304 Not Modified`.
    fn cache_conditional_hit(&self, call: &Call, response: &Response) {}

    /// The call required a cached response (`only-if-cached`) but none was
    /// usable; a synthetic `504` was returned.
    fn satisfaction_failure(&self, call: &Call, response: &Response) {}

    /// The engine is about to read response headers.
    fn response_headers_start(&self, call: &Call) {}

    /// Response headers arrived.
    fn response_headers_end(&self, call: &Call, response: &Response) {}
}

/// The default listener: ignores everything.
#[derive(Debug, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}
