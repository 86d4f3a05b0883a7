//! A call: one request and all the follow-ups and retries needed to
//! satisfy it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::client::ClientInner;
use crate::connect::connection::{CallMarker, Connection};
use crate::connect::exchange::Exchange;
use crate::connect::finder::ExchangeFinder;
use crate::connect::planner::{PlannerContext, RoutePlanner};
use crate::connect::Route;
use crate::error::Error;
use crate::event::EventListenerRef;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;
use crate::task::TaskQueue;

/// A started or startable request. Calls execute once: synchronously
/// via [`Call::execute`] or asynchronously via [`Call::enqueue`].
///
/// A call may be canceled from any thread; other methods belong to the
/// thread driving the call.
#[derive(Clone)]
pub struct Call {
    pub(crate) engine: Arc<CallEngine>,
}

impl Call {
    pub fn request(&self) -> &Request {
        &self.engine.original_request
    }

    /// Runs the request on the calling thread, returning its response.
    pub fn execute(&self) -> crate::Result<Response> {
        self.engine.client.dispatcher.executed(self.clone());
        let result = self.engine.execute_blocking();
        self.engine.client.dispatcher.finished(&self.engine);
        result
    }

    /// Schedules the request on the dispatcher; `callback` receives the
    /// outcome exactly once.
    pub fn enqueue<C: Callback>(&self, callback: C) {
        self.engine
            .client
            .dispatcher
            .enqueue(self.clone(), Box::new(callback));
    }

    /// Cancels the call. Idempotent and safe from any thread; in-flight
    /// I/O fails promptly.
    pub fn cancel(&self) {
        self.engine.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.engine.is_canceled()
    }

    pub fn is_executed(&self) -> bool {
        self.engine.executed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("url", &self.engine.original_request.url())
            .finish()
    }
}

/// Receives the outcome of an asynchronous call.
pub trait Callback: Send + 'static {
    fn on_response(self: Box<Self>, call: Call, response: Response);
    fn on_failure(self: Box<Self>, call: Call, error: Error);
}

/// Adapts a closure into a [`Callback`].
pub fn callback<F>(f: F) -> impl Callback
where
    F: FnOnce(Call, crate::Result<Response>) + Send + 'static,
{
    struct FnCallback<F>(F);
    impl<F> Callback for FnCallback<F>
    where
        F: FnOnce(Call, crate::Result<Response>) + Send + 'static,
    {
        fn on_response(self: Box<Self>, call: Call, response: Response) {
            (self.0)(call, Ok(response));
        }
        fn on_failure(self: Box<Self>, call: Call, error: Error) {
            (self.0)(call, Err(error));
        }
    }
    FnCallback(f)
}

/// The machinery behind a call, shared with the interceptor chain.
pub(crate) struct CallEngine {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) original_request: Request,
    pub(crate) executed: AtomicBool,
    canceled: Arc<AtomicBool>,
    timed_out: AtomicBool,
    request_body_started: AtomicBool,
    marker: Arc<CallMarker>,
    planner: Mutex<Option<Arc<RoutePlanner>>>,
    exchange: Mutex<Option<Arc<Exchange>>>,
    /// A connection a finished exchange left behind for follow-ups.
    reusable_connection: Mutex<Option<Arc<Connection>>>,
}

impl CallEngine {
    pub(crate) fn new(client: Arc<ClientInner>, request: Request) -> Arc<CallEngine> {
        let label = request.url().redact();
        Arc::new(CallEngine {
            client,
            original_request: request,
            executed: AtomicBool::new(false),
            canceled: Arc::new(AtomicBool::new(false)),
            timed_out: AtomicBool::new(false),
            request_body_started: AtomicBool::new(false),
            marker: Arc::new(CallMarker { label }),
            planner: Mutex::new(None),
            exchange: Mutex::new(None),
            reusable_connection: Mutex::new(None),
        })
    }

    pub(crate) fn client(&self) -> &Arc<ClientInner> {
        &self.client
    }

    pub(crate) fn listener(&self) -> &EventListenerRef {
        &self.client.event_listener
    }

    pub(crate) fn host(&self) -> String {
        self.original_request.url().host().to_string()
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    pub(crate) fn check_canceled(&self) -> crate::Result<()> {
        if self.is_canceled() {
            Err(Error::new_canceled())
        } else {
            Ok(())
        }
    }

    pub(crate) fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("canceling {}", self.original_request.url().redact());
        if let Some(exchange) = self.exchange.lock().unwrap().as_ref() {
            exchange.cancel();
        }
        self.client
            .event_listener
            .canceled(&self.original_request.url().to_string());
    }

    /// Drives the interceptor chain to completion.
    pub(crate) fn execute_blocking(self: &Arc<Self>) -> crate::Result<Response> {
        if self.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::new_already_executed());
        }
        let url = self.original_request.url().to_string();
        self.client.event_listener.call_start(&url);

        let watchdog = self.start_call_timeout();
        let interceptors = self.build_interceptors();
        let chain = Chain::new(self, &interceptors, self.original_request.clone());
        let result = chain.run();
        if let Some(queue) = watchdog {
            queue.shutdown();
        }

        let result = self.map_failure(result);
        match &result {
            Ok(_) => self.client.event_listener.call_end(&url),
            Err(e) => {
                self.finish_exchange(false);
                self.client.event_listener.call_failed(&url, e);
            }
        }
        result
    }

    fn build_interceptors(&self) -> Vec<Arc<dyn Interceptor>> {
        let client = &self.client;
        let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(
            client.interceptors.len() + client.network_interceptors.len() + 5,
        );
        interceptors.extend(client.interceptors.iter().cloned());
        interceptors.push(Arc::new(crate::interceptor::retry::RetryAndFollowUpInterceptor));
        interceptors.push(Arc::new(crate::interceptor::bridge::BridgeInterceptor));
        interceptors.push(Arc::new(crate::interceptor::cache::CacheInterceptor));
        interceptors.extend(client.network_interceptors.iter().cloned());
        interceptors.push(Arc::new(crate::interceptor::connect::ConnectInterceptor));
        interceptors.push(Arc::new(crate::interceptor::call_server::CallServerInterceptor));
        interceptors
    }

    fn start_call_timeout(self: &Arc<Self>) -> Option<TaskQueue> {
        let timeout = self.client.call_timeout?;
        let queue = self.client.task_runner.new_queue();
        let weak = Arc::downgrade(self);
        queue.execute(
            "call timeout",
            timeout.as_nanos() as u64,
            true,
            move || {
                if let Some(engine) = weak.upgrade() {
                    debug!("call timed out: {}", engine.original_request.url().redact());
                    engine.timed_out.store(true, Ordering::SeqCst);
                    engine.cancel();
                }
            },
        );
        Some(queue)
    }

    fn map_failure(&self, result: crate::Result<Response>) -> crate::Result<Response> {
        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                if self.timed_out.load(Ordering::SeqCst) {
                    return Err(Error::new_timeout().with(e));
                }
                if self.is_canceled() && !e.is_canceled() {
                    return Err(Error::new_canceled().with(e));
                }
                Err(e)
            }
        }
    }

    /// Called by the retry interceptor before each attempt: makes sure a
    /// route planner exists for the request's address.
    pub(crate) fn prepare_to_connect(self: &Arc<Self>, request: &Request) -> crate::Result<()> {
        let address = self.client.address_for(request.url())?;
        let mut planner_slot = self.planner.lock().unwrap();
        let reuse = matches!(*planner_slot, Some(ref p) if p.address().same_address(&address));
        if !reuse {
            trace!("planning routes for {}", address.host());
            let context = PlannerContext {
                pool: self.client.pool.clone(),
                task_runner: self.client.task_runner.clone(),
                listener: self.client.event_listener.clone(),
                connect_timeout: self.client.connect_timeout,
                fast_fallback: self.client.fast_fallback,
                h2_settings: self.client.h2_settings(),
                ping_interval: self.client.ping_interval,
                extensive_health_checks: request.method() != http::Method::GET,
            };
            *planner_slot = Some(Arc::new(RoutePlanner::new(
                address,
                context,
                self.client.route_database.clone(),
                self.marker.clone(),
            )));
        }
        if let Some(connection) = self.reusable_connection.lock().unwrap().take() {
            if let Some(ref planner) = *planner_slot {
                planner.set_call_connection(Some(connection));
            }
        }
        Ok(())
    }

    pub(crate) fn has_more_routes(&self) -> bool {
        self.planner
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.has_next())
            .unwrap_or(false)
    }

    pub(crate) fn current_route(&self) -> Option<Route> {
        self.exchange
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.connection().route().clone())
    }

    /// Marks the current connection unfit for coalesced hosts (421).
    pub(crate) fn refuse_coalescing(&self) {
        if let Some(exchange) = self.exchange.lock().unwrap().as_ref() {
            exchange.connection().no_coalesced_connections();
            exchange.connection().no_new_exchanges();
        }
    }

    /// Acquires a connection and installs a fresh exchange.
    pub(crate) fn init_exchange(self: &Arc<Self>, _request: &Request) -> crate::Result<()> {
        self.check_canceled()?;
        let planner = self
            .planner
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new_protocol("connect before route planning"))?;
        let finder = ExchangeFinder::new(
            planner,
            self.client.fast_fallback,
            self.canceled.clone(),
        );
        let connection = finder.find(false)?;
        self.client
            .event_listener
            .connection_acquired(connection.id());
        let exchange = Arc::new(Exchange::new(
            connection,
            self.marker.clone(),
            self.client.pool.clone(),
            self.client.event_listener.clone(),
            self.client.read_timeout,
            self.client.write_timeout,
        )?);
        *self.exchange.lock().unwrap() = Some(exchange);
        Ok(())
    }

    pub(crate) fn current_exchange(&self) -> crate::Result<Arc<Exchange>> {
        self.exchange
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::new_protocol("no exchange for this call"))
    }

    /// Detaches and releases the current exchange, remembering its
    /// connection for a possible follow-up.
    pub(crate) fn finish_exchange(&self, success: bool) {
        let exchange = self.exchange.lock().unwrap().take();
        if let Some(exchange) = exchange {
            let connection = exchange.connection().clone();
            if success && !connection.is_no_new_exchanges() {
                *self.reusable_connection.lock().unwrap() = Some(connection);
            }
            exchange.release(success, self.client.task_runner.nano_time());
        }
    }

    pub(crate) fn note_request_body_started(&self) {
        self.request_body_started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_body_started(&self) -> bool {
        self.request_body_started.load(Ordering::SeqCst)
    }

    pub(crate) fn nano_time_fn(&self) -> Box<dyn Fn() -> u64 + Send> {
        let runner = self.client.task_runner.clone();
        Box::new(move || runner.nano_time())
    }

    pub(crate) fn execute_on_runner<F>(&self, name: &str, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.client
            .task_runner
            .new_queue()
            .execute(name.to_string(), 0, true, f);
    }
}

impl fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallEngine")
            .field("url", &self.original_request.url())
            .finish()
    }
}
