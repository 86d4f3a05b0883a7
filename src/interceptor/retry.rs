//! Recovery from failures and follow-up requests: redirects,
//! authentication challenges, and retryable status codes.

use http::Method;
use log::debug;

use crate::error::Error;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;

/// How many follow-ups (redirects plus auth retries) one call may make.
/// Chrome follows 21; Firefox, curl, and wget follow 20.
const MAX_FOLLOW_UPS: u32 = 20;

pub(crate) struct RetryAndFollowUpInterceptor;

impl Interceptor for RetryAndFollowUpInterceptor {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        let engine = chain.engine;
        let mut request = chain.request().clone();
        let mut follow_up_count = 0u32;
        let mut prior_response: Option<Response> = None;

        loop {
            engine.prepare_to_connect(&request)?;

            let mut response = match chain.proceed(request.clone()) {
                Ok(response) => response,
                Err(e) => {
                    if !self.recover(&e, &chain, &request) {
                        return Err(e);
                    }
                    debug!("recovering from {}; retrying {}", e, request.url().redact());
                    continue;
                }
            };

            if let Some(prior) = prior_response.take() {
                let mut links = response;
                let body = links.take_body();
                response = links
                    .to_builder()
                    .links_from(&mut links)
                    .prior_response(Some(prior))
                    .body(body)
                    .build()?;
            }

            let follow_up = self.follow_up_request(&response, &chain)?;
            let follow_up = match follow_up {
                Some(follow_up) => follow_up,
                // Done; the response body releases the exchange at EOF.
                None => return Ok(response),
            };

            if let Some(body) = follow_up.body() {
                if body.is_one_shot() {
                    // The body is spent; surface what we have.
                    return Ok(response);
                }
            }

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(Error::new_too_many_follow_ups(follow_up_count));
            }

            // The stale body must drain before its connection can serve
            // the follow-up.
            drain_body(&mut response);
            prior_response = Some(response.stripped());
            request = follow_up;
        }
    }
}

impl RetryAndFollowUpInterceptor {
    /// Whether `error` permits replaying the request on another
    /// connection or route.
    fn recover(&self, error: &Error, chain: &Chain<'_>, request: &Request) -> bool {
        let engine = chain.engine;
        engine.finish_exchange(false);

        if !engine.client().retry_on_connection_failure {
            return false;
        }
        if engine.is_canceled() || error.is_canceled() {
            return false;
        }
        // A one-shot body that reached the wire cannot be replayed.
        if engine.request_body_started()
            && request.body().map(|b| b.is_one_shot()).unwrap_or(false)
        {
            return false;
        }
        if !error_is_recoverable(error, engine.request_body_started()) {
            return false;
        }
        // Nowhere left to go?
        engine.has_more_routes()
    }

    /// Decides the follow-up request demanded by `response`, if any.
    fn follow_up_request(
        &self,
        response: &Response,
        chain: &Chain<'_>,
    ) -> crate::Result<Option<Request>> {
        let engine = chain.engine;
        let client = engine.client();
        let request = response.request().clone();
        let route = engine.current_route();

        match response.code() {
            407 => {
                let proxied = route
                    .as_ref()
                    .map(|r| !r.proxy().is_direct())
                    .unwrap_or(false);
                if !proxied {
                    return Err(Error::new_protocol(
                        "received 407 from a direct connection",
                    ));
                }
                Ok(client
                    .proxy_authenticator
                    .authenticate(route.as_ref(), response))
            }
            401 => Ok(client.authenticator.authenticate(route.as_ref(), response)),
            300 | 301 | 302 | 303 | 307 | 308 => {
                self.build_redirect_request(response, &request, chain)
            }
            408 => {
                if !client.retry_on_connection_failure {
                    return Ok(None);
                }
                if request.body().map(|b| b.is_one_shot()).unwrap_or(false) {
                    return Ok(None);
                }
                // Consecutive timeouts mean the server is struggling.
                if matches!(response.prior_response().map(|p| p.code()), Some(408)) {
                    return Ok(None);
                }
                if retry_after_seconds(response).unwrap_or(0) > 0 {
                    return Ok(None);
                }
                Ok(Some(request))
            }
            503 => {
                if matches!(response.prior_response().map(|p| p.code()), Some(503)) {
                    return Ok(None);
                }
                // Only an explicit immediate Retry-After invites a retry.
                if retry_after_seconds(response) == Some(0) {
                    return Ok(Some(request));
                }
                Ok(None)
            }
            421 => {
                // Misdirected: this coalesced connection does not serve
                // the host after all. Retry on a fresh one.
                if request.body().map(|b| b.is_one_shot()).unwrap_or(false) {
                    return Ok(None);
                }
                engine.refuse_coalescing();
                Ok(Some(request))
            }
            _ => Ok(None),
        }
    }

    fn build_redirect_request(
        &self,
        response: &Response,
        request: &Request,
        chain: &Chain<'_>,
    ) -> crate::Result<Option<Request>> {
        let client = chain.engine.client();
        if !client.follow_redirects {
            return Ok(None);
        }
        let location = match response.header("Location") {
            Some(location) => location,
            None => return Ok(None),
        };
        let target = match request.url().resolve(location) {
            Some(target) => target,
            // Redirects to non-HTTP schemes are surfaced, not followed.
            None => return Ok(None),
        };

        let crossed_scheme = target.scheme() != request.url().scheme();
        if crossed_scheme && !client.follow_ssl_redirects {
            return Ok(None);
        }

        let mut builder = request.to_builder().parsed_url(target.clone());

        // 307 and 308 promise to preserve the method and body. For the
        // rest the body may already be consumed, so it is dropped while
        // the method is kept.
        let maintain_body = matches!(response.code(), 307 | 308);
        if !maintain_body && request.body().is_some() {
            let method = request.method().clone();
            builder = builder.method(keep_or_simplify_method(&method), None)?;
            builder = builder
                .remove_header("Content-Type")
                .remove_header("Content-Length")
                .remove_header("Transfer-Encoding");
        }

        // Credentials do not travel to another host.
        if target.host() != request.url().host() {
            builder = builder.remove_header("Authorization");
        }

        Ok(Some(builder.build()?))
    }
}

/// Methods that cannot exist without a body degrade to GET when the
/// body is dropped; everything else is preserved.
fn keep_or_simplify_method(method: &Method) -> Method {
    if crate::request::requires_request_body(method) {
        Method::GET
    } else {
        method.clone()
    }
}

fn error_is_recoverable(error: &Error, request_sent: bool) -> bool {
    if error.is_stream_reset() {
        // REFUSED_STREAM guarantees no processing happened.
        return error.h2_error_code().is_retryable();
    }
    if error.is_protocol() || error.is_tls() {
        return false;
    }
    if error.is_timeout() {
        // A timeout before sending anything is always replayable; after
        // that the server may already be acting on the request.
        return !request_sent;
    }
    error.is_connect() || error.is_io() || error.is_incomplete_message()
}

/// Exhausts a follow-up's stale body so its connection can be reused;
/// oversized bodies are abandoned with their connection.
fn drain_body(response: &mut Response) {
    const DRAIN_LIMIT: u64 = 1024 * 1024;
    if let Some(body) = response.take_body() {
        use std::io::Read;
        let mut sink = std::io::sink();
        let _ = std::io::copy(&mut body.take(DRAIN_LIMIT), &mut sink);
    }
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
    response
        .header("Retry-After")
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_simplification() {
        assert_eq!(keep_or_simplify_method(&Method::POST), Method::GET);
        assert_eq!(keep_or_simplify_method(&Method::PUT), Method::GET);
        assert_eq!(keep_or_simplify_method(&Method::DELETE), Method::DELETE);
    }

    #[test]
    fn protocol_errors_not_recoverable() {
        assert!(!error_is_recoverable(
            &Error::new_protocol("bad frame"),
            false
        ));
        assert!(!error_is_recoverable(&Error::new_tls("untrusted"), false));
        assert!(error_is_recoverable(
            &Error::new_connect("connection refused"),
            false
        ));
    }

    #[test]
    fn refused_stream_recoverable() {
        let err = Error::new_stream_reset(crate::proto::h2::ErrorCode::RefusedStream);
        assert!(error_is_recoverable(&err, true));
        let err = Error::new_stream_reset(crate::proto::h2::ErrorCode::Cancel);
        assert!(!error_is_recoverable(&err, true));
    }
}
