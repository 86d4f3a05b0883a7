//! The interceptor chain.
//!
//! A call travels a fixed pipeline: application interceptors, retry and
//! follow-up, the bridge, the cache, network interceptors, connect, and
//! finally the call server that talks to the wire. Each stage either
//! answers locally or forwards a (possibly modified) request to the
//! rest of the chain.

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

use std::fmt;
use std::sync::Arc;

use crate::call::CallEngine;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

/// Observes and optionally rewrites calls.
///
/// Implementations must call [`Chain::proceed`] at most once.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response>;
}

impl<F> Interceptor for F
where
    F: Fn(Chain<'_>) -> crate::Result<Response> + Send + Sync,
{
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        self(chain)
    }
}

/// A step in the pipeline, holding the request as it currently stands.
pub struct Chain<'a> {
    pub(crate) engine: &'a Arc<CallEngine>,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        engine: &'a Arc<CallEngine>,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
    ) -> Chain<'a> {
        Chain {
            engine,
            interceptors,
            index: 0,
            request,
        }
    }

    /// The request this stage received.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// True once the owning call was canceled.
    pub fn is_canceled(&self) -> bool {
        self.engine.is_canceled()
    }

    /// Forwards `request` to the rest of the chain.
    pub fn proceed(&self, request: Request) -> crate::Result<Response> {
        self.engine.check_canceled()?;
        let interceptor = self
            .interceptors
            .get(self.index)
            .ok_or_else(|| Error::new_protocol("interceptor chain exhausted"))?;
        let next = Chain {
            engine: self.engine,
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
        };
        interceptor.intercept(next)
    }

    /// Runs this chain from its current position with its own request.
    pub(crate) fn run(self) -> crate::Result<Response> {
        let request = self.request.clone();
        self.proceed(request)
    }
}

impl fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("url", &self.request.url())
            .finish()
    }
}
