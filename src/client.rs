//! The client: configuration and the entry point for calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthenticatorRef, NoAuthenticator};
use crate::cache::Cache;
use crate::call::{Call, CallEngine};
use crate::connect::address::Address;
use crate::connect::planner::{ConnectPlan, PlannerContext};
use crate::connect::pool::{AddressPolicy, ConnectionPool};
use crate::connect::route::{RouteDatabase, RouteSelector};
use crate::cookie::{CookieJarRef, NoCookies};
use crate::dispatcher::Dispatcher;
use crate::dns::{DnsRef, SystemDns};
use crate::error::Error;
use crate::event::{EventListenerRef, NoEvents};
use crate::interceptor::Interceptor;
use crate::protocol::Protocol;
use crate::proto::h2::settings::{self, Settings};
use crate::proxy::{NoProxy, Proxy, ProxySelectorRef};
use crate::request::Request;
use crate::task::TaskRunner;
use crate::tls::{ConnectionSpec, TlsConnectorRef};
use crate::url::HttpUrl;

/// Everything configurable about a [`Client`]. Fields left at their
/// defaults match mainstream client behavior.
pub struct Config {
    /// Bound on the entire call, follow-ups included. `None` is
    /// unbounded.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// HTTP/2 and WebSocket keep-alive ping cadence. `None` disables.
    pub ping_interval: Option<Duration>,
    pub retry_on_connection_failure: bool,
    pub follow_redirects: bool,
    /// Follow redirects that switch between http and https.
    pub follow_ssl_redirects: bool,
    /// Protocols to offer, in preference order.
    pub protocols: Vec<Protocol>,
    pub connection_specs: Vec<ConnectionSpec>,
    pub max_requests: usize,
    pub max_requests_per_host: usize,
    pub max_idle_connections: usize,
    pub keep_alive_duration: Duration,
    /// Race connects across address families (RFC 8305).
    pub fast_fallback: bool,
    /// Our HTTP/2 `SETTINGS_MAX_CONCURRENT_STREAMS`, advisory for peers.
    pub max_concurrent_streams: Option<u32>,
    pub user_agent: String,
    pub interceptors: Vec<Arc<dyn Interceptor>>,
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub dns: DnsRef,
    pub tls: Option<TlsConnectorRef>,
    pub proxy_selector: ProxySelectorRef,
    /// An explicit proxy overriding the selector.
    pub proxy: Option<Proxy>,
    pub authenticator: AuthenticatorRef,
    pub proxy_authenticator: AuthenticatorRef,
    pub cookie_jar: CookieJarRef,
    pub cache: Option<Arc<Cache>>,
    pub event_listener: EventListenerRef,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            call_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            ping_interval: None,
            retry_on_connection_failure: true,
            follow_redirects: true,
            follow_ssl_redirects: true,
            protocols: vec![Protocol::H2, Protocol::Http11],
            connection_specs: vec![ConnectionSpec::modern_tls(), ConnectionSpec::cleartext()],
            max_requests: 64,
            max_requests_per_host: 5,
            max_idle_connections: 5,
            keep_alive_duration: Duration::from_secs(5 * 60),
            fast_fallback: true,
            max_concurrent_streams: None,
            user_agent: concat!("courier/", env!("CARGO_PKG_VERSION")).to_string(),
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            dns: Arc::new(SystemDns),
            tls: None,
            proxy_selector: Arc::new(NoProxy),
            proxy: None,
            authenticator: Arc::new(NoAuthenticator),
            proxy_authenticator: Arc::new(NoAuthenticator),
            cookie_jar: Arc::new(NoCookies),
            cache: None,
            event_listener: Arc::new(NoEvents),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("protocols", &self.protocols)
            .field("fast_fallback", &self.fast_fallback)
            .finish()
    }
}

/// An HTTP client: a shared pool of connections, a dispatcher, and the
/// configuration every call inherits.
///
/// Clients are intended to be created once and shared; cloning is cheap.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) ping_interval: Option<Duration>,
    pub(crate) retry_on_connection_failure: bool,
    pub(crate) follow_redirects: bool,
    pub(crate) follow_ssl_redirects: bool,
    pub(crate) fast_fallback: bool,
    pub(crate) protocols: Arc<Vec<Protocol>>,
    pub(crate) connection_specs: Arc<Vec<ConnectionSpec>>,
    pub(crate) max_concurrent_streams: Option<u32>,
    pub(crate) user_agent: String,
    pub(crate) interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub(crate) dns: DnsRef,
    pub(crate) tls: Option<TlsConnectorRef>,
    pub(crate) proxy_selector: ProxySelectorRef,
    pub(crate) proxy: Option<Proxy>,
    pub(crate) authenticator: AuthenticatorRef,
    pub(crate) proxy_authenticator: AuthenticatorRef,
    pub(crate) cookie_jar: CookieJarRef,
    pub(crate) cache: Option<Arc<Cache>>,
    pub(crate) event_listener: EventListenerRef,
    pub(crate) task_runner: TaskRunner,
    pub(crate) pool: ConnectionPool,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) route_database: Arc<RouteDatabase>,
}

impl Client {
    /// Builds a client, validating the configuration before any network
    /// activity.
    pub fn new(config: Config) -> crate::Result<Client> {
        validate(&config)?;
        let task_runner = TaskRunner::global().clone();
        let pool = ConnectionPool::new(
            task_runner.clone(),
            config.max_idle_connections,
            config.keep_alive_duration.as_nanos() as u64,
        );
        let dispatcher = Dispatcher::new(
            task_runner.clone(),
            config.max_requests,
            config.max_requests_per_host,
        );
        Ok(Client {
            inner: Arc::new(ClientInner {
                call_timeout: config.call_timeout,
                connect_timeout: config.connect_timeout,
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                ping_interval: config.ping_interval,
                retry_on_connection_failure: config.retry_on_connection_failure,
                follow_redirects: config.follow_redirects,
                follow_ssl_redirects: config.follow_ssl_redirects,
                fast_fallback: config.fast_fallback,
                protocols: Arc::new(config.protocols),
                connection_specs: Arc::new(config.connection_specs),
                max_concurrent_streams: config.max_concurrent_streams,
                user_agent: config.user_agent,
                interceptors: config.interceptors,
                network_interceptors: config.network_interceptors,
                dns: config.dns,
                tls: config.tls,
                proxy_selector: config.proxy_selector,
                proxy: config.proxy,
                authenticator: config.authenticator,
                proxy_authenticator: config.proxy_authenticator,
                cookie_jar: config.cookie_jar,
                cache: config.cache,
                event_listener: config.event_listener,
                task_runner,
                pool,
                dispatcher,
                route_database: Arc::new(RouteDatabase::default()),
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }

    /// Prepares `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call {
            engine: CallEngine::new(self.inner.clone(), request),
        }
    }

    /// Cancels every queued and in-flight call on this client.
    pub fn cancel_all(&self) {
        self.inner.dispatcher.cancel_all();
    }

    /// Runs `callback` whenever the dispatcher drains to idle.
    pub fn set_dispatcher_idle_callback(&self, callback: Option<Box<dyn Fn() + Send + Sync>>) {
        self.inner.dispatcher.set_idle_callback(callback);
    }

    pub fn cache(&self) -> Option<&Arc<Cache>> {
        self.inner.cache.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.pool.connection_count()
    }

    pub fn idle_connection_count(&self) -> usize {
        self.inner.pool.idle_connection_count()
    }

    /// Closes idle connections now.
    pub fn evict_all_connections(&self) {
        self.inner.pool.evict_all();
    }

    pub fn queued_calls_count(&self) -> usize {
        self.inner.dispatcher.queued_calls_count()
    }

    pub fn running_calls_count(&self) -> usize {
        self.inner.dispatcher.running_calls_count()
    }

    /// Maintains a minimum of open connections to `url`'s origin.
    pub fn set_address_policy(&self, url: &str, policy: AddressPolicy) -> crate::Result<()> {
        let url = HttpUrl::parse(url)?;
        let address = self.inner.address_for(&url)?;
        let inner = self.inner.clone();
        let connect = Arc::new(move |address: &Address| inner.connect_for_policy(address));
        self.inner.pool.set_policy(address, policy, connect);
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ClientInner {
    pub(crate) fn address_for(&self, url: &HttpUrl) -> crate::Result<Address> {
        if url.is_https() && self.tls.is_none() {
            return Err(Error::new_config(
                "an https request requires a TLS connector",
            ));
        }
        let tls = if url.is_https() {
            self.tls.clone()
        } else {
            None
        };
        Ok(Address::new(
            url,
            self.dns.clone(),
            tls,
            self.protocols.clone(),
            self.connection_specs.clone(),
            self.proxy_selector.clone(),
            self.proxy.clone(),
        ))
    }

    /// Our side of the HTTP/2 settings exchange.
    pub(crate) fn h2_settings(&self) -> Settings {
        let mut h2_settings = Settings::new();
        h2_settings.set(settings::ENABLE_PUSH, 0);
        if let Some(streams) = self.max_concurrent_streams {
            h2_settings.set(settings::MAX_CONCURRENT_STREAMS, streams);
        }
        h2_settings
    }

    /// Connects once for a pool policy's opener task.
    fn connect_for_policy(
        self: &Arc<Self>,
        address: &Address,
    ) -> crate::Result<Arc<crate::connect::connection::Connection>> {
        let context = PlannerContext {
            pool: self.pool.clone(),
            task_runner: self.task_runner.clone(),
            listener: self.event_listener.clone(),
            connect_timeout: self.connect_timeout,
            fast_fallback: self.fast_fallback,
            h2_settings: self.h2_settings(),
            ping_interval: self.ping_interval,
            extensive_health_checks: false,
        };
        let mut selector = RouteSelector::new(
            address.clone(),
            self.route_database.clone(),
            self.event_listener.clone(),
            false,
        );
        let mut first_error: Option<Error> = None;
        while selector.has_next() {
            let mut selection = selector.next()?;
            while let Some(route) = selection.next() {
                let plan = ConnectPlan::for_policy(
                    route,
                    context.clone(),
                    self.route_database.clone(),
                );
                match plan.connect() {
                    Ok(connection) => return Ok(connection),
                    Err(e) => {
                        first_error = Some(match first_error {
                            Some(primary) => primary.with_suppressed(e),
                            None => e,
                        })
                    }
                }
            }
        }
        Err(first_error.unwrap_or_else(|| Error::new_connect("no routes for policy")))
    }
}

fn validate(config: &Config) -> crate::Result<()> {
    if config.protocols.is_empty() {
        return Err(Error::new_config("protocols must not be empty"));
    }
    let prior_knowledge = config
        .protocols
        .contains(&Protocol::H2PriorKnowledge);
    if prior_knowledge && config.protocols.len() > 1 {
        return Err(Error::new_config(
            "h2 prior knowledge cannot be mixed with other protocols",
        ));
    }
    if !prior_knowledge && !config.protocols.contains(&Protocol::Http11) {
        return Err(Error::new_config("protocols must include http/1.1"));
    }
    if config.max_requests == 0 || config.max_requests_per_host == 0 {
        return Err(Error::new_config("dispatcher caps must be positive"));
    }
    if config.keep_alive_duration.is_zero() {
        return Err(Error::new_config("keep-alive duration must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let client = Client::new(Config::default()).unwrap();
        assert_eq!(client.connection_count(), 0);
    }

    #[test]
    fn validation_rules() {
        let mut config = Config::default();
        config.protocols = vec![];
        assert!(Client::new(config).is_err());

        let mut config = Config::default();
        config.protocols = vec![Protocol::H2];
        assert!(Client::new(config).is_err());

        let mut config = Config::default();
        config.protocols = vec![Protocol::H2PriorKnowledge];
        assert!(Client::new(config).is_ok());

        let mut config = Config::default();
        config.protocols = vec![Protocol::H2PriorKnowledge, Protocol::Http11];
        assert!(Client::new(config).is_err());

        let mut config = Config::default();
        config.max_requests = 0;
        assert!(Client::new(config).is_err());
    }

    #[test]
    fn https_without_tls_rejected_at_call_setup() {
        let client = Client::new(Config::default()).unwrap();
        let request = Request::get("https://example.com/").unwrap();
        let err = client
            .inner
            .address_for(request.url())
            .expect_err("https needs tls");
        assert!(err.is_user());
    }
}
