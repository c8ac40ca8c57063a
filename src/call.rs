use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::debug;

use crate::client::Client;
use crate::connection::Connection;
use crate::error::Error;
use crate::events::EventListener;
use crate::exchange::Exchange;
use crate::finder::ExchangeFinder;
use crate::interceptor::{Chain, Interceptor};
use crate::interceptors::bridge::BridgeInterceptor;
use crate::interceptors::cache::CacheInterceptor;
use crate::interceptors::call_server::CallServerStage;
use crate::interceptors::connect::ConnectInterceptor;
use crate::interceptors::retry::RetryAndFollowUp;
use crate::request::Request;
use crate::response::Response;
use crate::task::{TaskHandle, TaskRunner};

/// A prepared, one-shot request/response operation.
///
/// A call may be executed synchronously with [`execute`](Call::execute) or
/// asynchronously with [`enqueue`](Call::enqueue), exactly once either way.
/// It can be canceled from any thread at any point; an in-flight exchange
/// is aborted and the failure surfaces as a canceled error.
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

pub(crate) struct CallInner {
    client: Client,
    request: Request,
    for_web_socket: bool,
    executed: AtomicBool,
    canceled: AtomicBool,
    timeout: CallTimeout,
    finder: Mutex<Option<ExchangeFinder>>,
    state: Mutex<CallState>,
}

struct CallState {
    connection: Option<Arc<Connection>>,
    exchange: Option<Exchange>,
    /// True from exchange creation until the request stream completes.
    request_body_open: bool,
    /// True from exchange creation until the response stream completes.
    response_body_open: bool,
    /// True until the interceptor chain has returned for the last time.
    expect_more_exchanges: bool,
    done: bool,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request, for_web_socket: bool) -> Call {
        let timeout = CallTimeout::new(
            request.timeout().or(client.call_timeout()),
            client.task_runner().clone(),
        );
        Call {
            inner: Arc::new(CallInner {
                client,
                request,
                for_web_socket,
                executed: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
                timeout,
                finder: Mutex::new(None),
                state: Mutex::new(CallState {
                    connection: None,
                    exchange: None,
                    request_body_open: false,
                    response_body_open: false,
                    expect_more_exchanges: true,
                    done: false,
                }),
            }),
        }
    }

    /// The original request this call was created for.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Whether `execute` or `enqueue` has been invoked.
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::Acquire)
    }

    /// Whether the call was canceled. Readable from any thread.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// The effective call timeout: the request's override or the client
    /// default.
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout.duration
    }

    pub(crate) fn is_web_socket(&self) -> bool {
        self.inner.for_web_socket
    }

    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    pub(crate) fn events(&self) -> &Arc<dyn EventListener> {
        self.inner.client.events()
    }

    pub(crate) fn downgrade(&self) -> Weak<CallInner> {
        Arc::downgrade(&self.inner)
    }

    /// Execute the call on the current thread, blocking until the response
    /// headers (and for buffered bodies, the body) are available.
    pub fn execute(&self) -> crate::Result<Response> {
        if self.inner.executed.swap(true, Ordering::AcqRel) {
            return Err(Error::contract("call already executed"));
        }
        self.inner.timeout.enter(self);
        self.events().call_start(self);
        self.client().dispatcher().executed(self);
        let result = self.run();
        self.client().dispatcher().finished_sync(self);
        result
    }

    /// Hand the call to the dispatcher; `callback` is invoked on a worker
    /// thread with the outcome.
    pub fn enqueue<F>(&self, callback: F)
    where
        F: FnOnce(crate::Result<Response>) + Send + 'static,
    {
        if self.inner.executed.swap(true, Ordering::AcqRel) {
            callback(Err(Error::contract("call already executed")));
            return;
        }
        self.events().call_start(self);
        self.client().dispatcher().enqueue(AsyncCall {
            call: self.clone_handle(),
            callback: Box::new(callback),
        });
    }

    /// Cancel the call. Idempotent, safe from any thread.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::AcqRel) {
            return;
        }
        let (exchange, connection) = {
            let st = self.inner.state.lock().unwrap();
            (st.exchange.clone(), st.connection.clone())
        };
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
        if let Some(connection) = connection {
            connection.cancel();
        }
        self.events().canceled(self);
    }

    /// Disarm the call timeout early. WebSocket and duplex calls invoke
    /// this once their setup completes, since their streams legitimately
    /// outlive any reasonable call deadline.
    pub fn timeout_early_exit(&self) {
        self.inner.timeout.early_exit();
    }

    pub(crate) fn clone_handle(&self) -> Call {
        Call {
            inner: self.inner.clone(),
        }
    }

    fn run(&self) -> crate::Result<Response> {
        let client = self.client();
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
        interceptors.extend(client.interceptors().iter().cloned());
        interceptors.push(Arc::new(RetryAndFollowUp::new()));
        interceptors.push(Arc::new(BridgeInterceptor::new(
            client.default_headers().clone(),
            client.user_agent().clone(),
            client.cookie_jar().clone(),
        )));
        interceptors.push(Arc::new(CacheInterceptor::new(client.cache().clone())));
        interceptors.push(Arc::new(ConnectInterceptor));
        if !self.inner.for_web_socket {
            interceptors.extend(client.network_interceptors().iter().cloned());
        }
        interceptors.push(Arc::new(CallServerStage));

        let mut chain = Chain::new(
            self.clone_handle(),
            interceptors.into(),
            0,
            None,
            self.request().clone(),
        );

        match chain.proceed(self.request().clone()) {
            Ok(response) => {
                if self.is_canceled() {
                    response.close();
                    let error = self
                        .no_more_exchanges(Some(Error::canceled()))
                        .expect("error propagates");
                    return Err(error);
                }
                let _ = self.no_more_exchanges(None);
                Ok(response)
            }
            Err(e) => {
                let error = self.no_more_exchanges(Some(e)).expect("error propagates");
                Err(error)
            }
        }
    }

    /// Create the exchange for the current attempt. Invoked by the connect
    /// stage once per attempt.
    pub(crate) fn init_exchange(&self) -> crate::Result<Exchange> {
        {
            let st = self.inner.state.lock().unwrap();
            if !st.expect_more_exchanges {
                return Err(Error::contract("call has already released its resources"));
            }
            if st.exchange.is_some() || st.request_body_open || st.response_body_open {
                return Err(Error::contract(
                    "cannot start a new exchange while the previous one is still open",
                ));
            }
        }
        if self.is_canceled() {
            return Err(Error::canceled());
        }

        let connection = {
            let mut finder = self.inner.finder.lock().unwrap();
            let finder = finder
                .as_mut()
                .ok_or_else(|| Error::contract("exchange finder was not prepared"))?;
            finder.find(self)?
        };
        let codec = connection.new_codec()?;
        let exchange = Exchange::new(self.clone_handle(), connection, codec);

        let mut st = self.inner.state.lock().unwrap();
        st.exchange = Some(exchange.clone());
        st.request_body_open = true;
        st.response_body_open = true;
        Ok(exchange)
    }

    /// Prepare route finding for an attempt against `request`'s endpoint.
    /// Route state survives across retries to the same endpoint so that a
    /// reroute advances rather than restarts.
    pub(crate) fn prepare_finder(&self, request: &Request) -> crate::Result<()> {
        let address = self.client().address_for(request.url())?;
        let mut finder = self.inner.finder.lock().unwrap();
        let reusable = matches!(&*finder, Some(f) if *f.address() == address);
        if !reusable {
            *finder = Some(ExchangeFinder::new(
                self.client().pool().clone(),
                address,
                self.client().route_database().clone(),
            ));
        }
        Ok(())
    }

    /// Whether the finder has another route to offer after a failure.
    pub(crate) fn retry_after_failure(&self) -> bool {
        let finder = self.inner.finder.lock().unwrap();
        finder.as_ref().map(|f| f.retry_after_failure()).unwrap_or(false)
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.state.lock().unwrap().connection.clone()
    }

    pub(crate) fn set_connection(&self, connection: Arc<Connection>) {
        let mut st = self.inner.state.lock().unwrap();
        debug_assert!(st.connection.is_none(), "connection already attached");
        st.connection = Some(connection);
    }

    /// Detach and abort the current exchange between attempts, clearing the
    /// stream-open bits it left behind.
    pub(crate) fn exit_network_zone(&self) {
        let exchange = {
            let mut st = self.inner.state.lock().unwrap();
            let exchange = st.exchange.take();
            if exchange.is_some() {
                st.request_body_open = false;
                st.response_body_open = false;
            }
            exchange
        };
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
    }

    /// A body stream of `exchange` finished, successfully or not. Returns
    /// the error to surface, wrapped with timeout context when the call
    /// completed because its timeout fired.
    pub(crate) fn message_done(
        &self,
        exchange: &Exchange,
        request_done: bool,
        response_done: bool,
        error: Option<Error>,
    ) -> Option<Error> {
        let mut exchange_finished = false;
        let became_done;
        {
            let mut st = self.inner.state.lock().unwrap();
            match &st.exchange {
                Some(current) if Exchange::ptr_eq(current, exchange) => {}
                // The exchange was detached; its streams no longer affect
                // this call.
                _ => return error,
            }
            if request_done {
                st.request_body_open = false;
            }
            if response_done {
                st.response_body_open = false;
            }
            if !st.request_body_open && !st.response_body_open {
                st.exchange = None;
                exchange_finished = true;
            }
            became_done = !st.request_body_open
                && !st.response_body_open
                && !st.expect_more_exchanges
                && !st.done;
            if became_done {
                st.done = true;
            }
        }

        if exchange_finished && !exchange.has_failure() {
            exchange.connection().note_success();
        }
        if became_done {
            return self.call_done(error);
        }
        error
    }

    /// The interceptor chain will not run again for this call.
    pub(crate) fn no_more_exchanges(&self, error: Option<Error>) -> Option<Error> {
        let became_done;
        {
            let mut st = self.inner.state.lock().unwrap();
            if !st.expect_more_exchanges {
                return error;
            }
            st.expect_more_exchanges = false;
            became_done =
                !st.request_body_open && !st.response_body_open && !st.done;
            if became_done {
                st.done = true;
            }
        }
        if became_done {
            return self.call_done(error);
        }
        error
    }

    /// Terminal bookkeeping, run exactly once per call.
    fn call_done(&self, error: Option<Error>) -> Option<Error> {
        self.release_connection();

        let timed_out = self.inner.timeout.exit();
        let error = if timed_out {
            debug!("call to {} timed out", self.request().url());
            Some(Error::timeout(error))
        } else {
            error
        };

        match &error {
            Some(e) => self.events().call_failed(self, e),
            None => self.events().call_end(self),
        }
        error
    }

    /// Remove this call from its connection; if that leaves the connection
    /// idle, let the pool decide whether it survives.
    pub(crate) fn release_connection(&self) {
        let connection = {
            let mut st = self.inner.state.lock().unwrap();
            st.connection.take()
        };
        let Some(connection) = connection else { return };

        let close_socket = {
            let mut cs = connection.state();
            let weak = self.downgrade();
            cs.calls.retain(|r| !Weak::ptr_eq(&r.call, &weak));
            if cs.calls.is_empty() {
                self.client()
                    .pool()
                    .connection_became_idle(&connection, &mut cs)
            } else {
                false
            }
        };
        if close_socket {
            connection.close();
        }
        self.events().connection_released(self, &connection);
    }
}

impl Clone for Call {
    /// Returns a fresh, unexecuted call to the same original request.
    fn clone(&self) -> Call {
        Call::new(
            self.inner.client.clone(),
            self.inner.request.clone(),
            self.inner.for_web_socket,
        )
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Call")
            .field("request", &self.inner.request)
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// A call handed to the dispatcher by `enqueue`.
pub(crate) struct AsyncCall {
    call: Call,
    callback: Box<dyn FnOnce(crate::Result<Response>) + Send>,
}

impl AsyncCall {
    pub(crate) fn call(&self) -> &Call {
        &self.call
    }

    /// The endpoint host, used for the dispatcher's per-host cap.
    pub(crate) fn host(&self) -> String {
        self.call
            .request()
            .url()
            .host_str()
            .unwrap_or_default()
            .to_string()
    }

    pub(crate) fn run(self) {
        self.call.inner.timeout.enter(&self.call);
        let result = self.call.run();
        (self.callback)(result);
    }
}

struct CallTimeout {
    duration: Option<Duration>,
    task_runner: TaskRunner,
    handle: Mutex<Option<TaskHandle>>,
    fired: AtomicBool,
    early_exited: AtomicBool,
}

impl CallTimeout {
    fn new(duration: Option<Duration>, task_runner: TaskRunner) -> CallTimeout {
        CallTimeout {
            duration,
            task_runner,
            handle: Mutex::new(None),
            fired: AtomicBool::new(false),
            early_exited: AtomicBool::new(false),
        }
    }

    fn enter(&self, call: &Call) {
        let Some(duration) = self.duration else { return };
        let weak = call.downgrade();
        let handle = self.task_runner.schedule("call timeout", duration, move || {
            if let Some(inner) = weak.upgrade() {
                let call = Call { inner };
                call.inner.timeout.fired.store(true, Ordering::Release);
                call.cancel();
            }
            None
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Disarm; reports whether the timeout fired while armed.
    fn exit(&self) -> bool {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.cancel();
        }
        self.fired.load(Ordering::Acquire) && !self.early_exited.load(Ordering::Acquire)
    }

    fn early_exit(&self) {
        self.early_exited.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.cancel();
        }
    }
}
