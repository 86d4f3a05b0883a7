//! Observability hooks for the lifecycle of a call.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Error;
use crate::proxy::Proxy;

/// Receives events from a single call. All methods default to no-ops.
///
/// Events for one call arrive in lifecycle order; events for different
/// calls may interleave.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    fn call_start(&self, url: &str) {}

    fn dns_start(&self, hostname: &str) {}
    fn dns_end(&self, hostname: &str, addresses: usize) {}

    fn connect_start(&self, address: SocketAddr, proxy: &Proxy) {}
    fn connect_end(&self, address: SocketAddr) {}
    fn connect_failed(&self, address: SocketAddr, error: &Error) {}

    fn connection_acquired(&self, connection_id: u64) {}
    fn connection_released(&self, connection_id: u64) {}

    fn request_headers_end(&self, url: &str) {}
    fn request_body_end(&self, byte_count: u64) {}
    fn response_headers_end(&self, code: u16) {}
    fn response_body_end(&self, byte_count: u64) {}

    fn cache_hit(&self, url: &str) {}
    fn cache_miss(&self, url: &str) {}
    fn cache_conditional_hit(&self, url: &str) {}

    fn call_end(&self, url: &str) {}
    fn call_failed(&self, url: &str, error: &Error) {}
    fn canceled(&self, url: &str) {}
}

impl fmt::Debug for dyn EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EventListener")
    }
}

/// The default listener: observes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}

pub type EventListenerRef = Arc<dyn EventListener>;
