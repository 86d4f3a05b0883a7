//! An HTTP response.

use std::fmt;

use http::StatusCode;

use crate::body::ResponseBody;
use crate::cache_control::CacheControl;
use crate::error::Error;
use crate::headers::{Headers, HeadersBuilder};
use crate::protocol::Protocol;
use crate::request::Request;
use crate::tls::Handshake;

/// An HTTP response.
///
/// `cache_response`, `network_response`, and `prior_response` link to the
/// responses that produced this one; their bodies are stripped.
pub struct Response {
    request: Request,
    protocol: Protocol,
    code: StatusCode,
    message: String,
    handshake: Option<Handshake>,
    headers: Headers,
    body: Option<ResponseBody>,
    trailers: Option<Headers>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: u64,
    received_response_at_millis: u64,
}

impl Response {
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder::new()
    }

    /// The request that yielded this response. May differ from the
    /// application's original request if follow-ups occurred.
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn code(&self) -> u16 {
        self.code.as_u16()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_successful(&self) -> bool {
        self.code.is_success()
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.code(), 300 | 301 | 302 | 303 | 307 | 308)
    }

    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut ResponseBody> {
        self.body.as_mut()
    }

    /// Consumes the response, returning its body.
    pub fn into_body(self) -> ResponseBody {
        self.body.unwrap_or_else(ResponseBody::empty)
    }

    pub(crate) fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// Trailers, available only after the body has been fully consumed.
    pub fn trailers(&mut self) -> crate::Result<Headers> {
        if let Some(ref t) = self.trailers {
            return Ok(t.clone());
        }
        match self.body {
            Some(ref mut body) => body.trailers(),
            None => Ok(Headers::new()),
        }
    }

    /// The response served from cache, if the cache participated.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The raw network response, if the network was consulted.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The response that triggered the follow-up producing this one.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Wall-clock millis when the originating request left.
    pub fn sent_request_at_millis(&self) -> u64 {
        self.sent_request_at_millis
    }

    /// Wall-clock millis when the response headers were received.
    pub fn received_response_at_millis(&self) -> u64 {
        self.received_response_at_millis
    }

    /// The `WWW-Authenticate` or `Proxy-Authenticate` challenges.
    pub fn challenges(&self) -> Vec<String> {
        let name = match self.code() {
            401 => "WWW-Authenticate",
            407 => "Proxy-Authenticate",
            _ => return Vec::new(),
        };
        self.headers.values(name).iter().map(|s| s.to_string()).collect()
    }

    /// Copies this response without its one-owner body, for linking.
    pub(crate) fn stripped(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            code: self.code,
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.clone(),
            body: None,
            trailers: self.trailers.clone(),
            cache_response: None,
            network_response: None,
            prior_response: None,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    pub(crate) fn to_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request.clone()),
            protocol: self.protocol,
            code: Some(self.code),
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.to_builder(),
            body: None,
            trailers: self.trailers.clone(),
            cache_response: None,
            network_response: None,
            prior_response: None,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("code", &self.code())
            .field("message", &self.message)
            .field("url", &self.request.url())
            .finish()
    }
}

/// Builds a [`Response`].
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Protocol,
    code: Option<StatusCode>,
    message: String,
    handshake: Option<Handshake>,
    headers: HeadersBuilder,
    body: Option<ResponseBody>,
    trailers: Option<Headers>,
    cache_response: Option<Box<Response>>,
    network_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: u64,
    received_response_at_millis: u64,
}

impl ResponseBuilder {
    pub fn new() -> ResponseBuilder {
        ResponseBuilder {
            request: None,
            protocol: Protocol::Http11,
            code: None,
            message: String::new(),
            handshake: None,
            headers: Headers::lenient_builder(),
            body: None,
            trailers: None,
            cache_response: None,
            network_response: None,
            prior_response: None,
            sent_request_at_millis: 0,
            received_response_at_millis: 0,
        }
    }

    pub fn request(mut self, request: Request) -> ResponseBuilder {
        self.request = Some(request);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> ResponseBuilder {
        self.protocol = protocol;
        self
    }

    pub fn code(mut self, code: u16) -> ResponseBuilder {
        self.code = StatusCode::from_u16(code).ok();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> ResponseBuilder {
        self.message = message.into();
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> ResponseBuilder {
        self.handshake = handshake;
        self
    }

    pub fn headers(mut self, headers: Headers) -> ResponseBuilder {
        self.headers = headers.to_builder();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> crate::Result<ResponseBuilder> {
        self.headers = self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> ResponseBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    pub fn body(mut self, body: Option<ResponseBody>) -> ResponseBuilder {
        self.body = body;
        self
    }

    pub fn trailers(mut self, trailers: Headers) -> ResponseBuilder {
        self.trailers = Some(trailers);
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.cache_response = response.map(Box::new);
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.network_response = response.map(Box::new);
        self
    }

    pub fn prior_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.prior_response = response.map(Box::new);
        self
    }

    /// Moves the cache/network/prior links out of `source` into this
    /// builder; used when a stage rebuilds a response it received.
    pub(crate) fn links_from(mut self, source: &mut Response) -> ResponseBuilder {
        self.cache_response = source.cache_response.take();
        self.network_response = source.network_response.take();
        self.prior_response = source.prior_response.take();
        self
    }

    pub fn sent_request_at_millis(mut self, millis: u64) -> ResponseBuilder {
        self.sent_request_at_millis = millis;
        self
    }

    pub fn received_response_at_millis(mut self, millis: u64) -> ResponseBuilder {
        self.received_response_at_millis = millis;
        self
    }

    pub fn build(self) -> crate::Result<Response> {
        let request = self
            .request
            .ok_or_else(|| Error::new_config("response has no request"))?;
        let code = self
            .code
            .ok_or_else(|| Error::new_config("response has no status code"))?;
        Ok(Response {
            request,
            protocol: self.protocol,
            code,
            message: self.message,
            handshake: self.handshake,
            headers: self.headers.build(),
            body: self.body,
            trailers: self.trailers,
            cache_response: self.cache_response,
            network_response: self.network_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        })
    }
}

impl fmt::Debug for ResponseBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBuilder")
            .field("code", &self.code)
            .finish()
    }
}

impl Default for ResponseBuilder {
    fn default() -> ResponseBuilder {
        ResponseBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request() -> Request {
        Request::get("http://example.com/").unwrap()
    }

    #[test]
    fn build_and_read() {
        let response = Response::builder()
            .request(request())
            .code(200)
            .message("OK")
            .body(Some(ResponseBody::from_bytes(None, Bytes::from("hi"))))
            .build()
            .unwrap();
        assert_eq!(response.code(), 200);
        assert!(response.is_successful());
        assert_eq!(response.into_body().string().unwrap(), "hi");
    }

    #[test]
    fn redirect_codes() {
        for code in [300, 301, 302, 303, 307, 308] {
            let r = Response::builder()
                .request(request())
                .code(code)
                .build()
                .unwrap();
            assert!(r.is_redirect(), "{}", code);
        }
        let r = Response::builder().request(request()).code(304).build().unwrap();
        assert!(!r.is_redirect());
    }

    #[test]
    fn challenges_for_401() {
        let response = Response::builder()
            .request(request())
            .code(401)
            .header("WWW-Authenticate", "Basic realm=\"x\"")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(response.challenges(), vec!["Basic realm=\"x\""]);
    }

    #[test]
    fn missing_code_is_rejected() {
        assert!(Response::builder().request(request()).build().is_err());
    }
}
