//! Opens the network exchange for a request.

use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

/// Acquires a connection (pooled, deferred, or freshly dialed) through
/// the exchange finder and installs the exchange on the call.
pub(crate) struct ConnectInterceptor;

impl Interceptor for ConnectInterceptor {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        let request = chain.request().clone();
        chain.engine.init_exchange(&request)?;
        chain.proceed(request)
    }
}
