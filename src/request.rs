//! An HTTP request.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::body::Body;
use crate::cache_control::CacheControl;
use crate::error::Error;
use crate::headers::{Headers, HeadersBuilder};
use crate::url::HttpUrl;

/// Caller-attached metadata keyed by explicit type id.
#[derive(Clone, Default)]
pub(crate) struct TagMap {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TagMap {
    fn insert<T: Send + Sync + 'static>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

/// An immutable HTTP request. Instances are cheap to clone and share.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: HttpUrl,
    headers: Headers,
    body: Option<Body>,
    tags: TagMap,
    cache_url_override: Option<HttpUrl>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// A GET of `url`.
    pub fn get(url: &str) -> crate::Result<Request> {
        RequestBuilder::new().url(url)?.build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &HttpUrl {
        &self.url
    }

    /// The URL used for cache keying; differs from [`Request::url`] only
    /// when overridden by the caller.
    pub fn cache_url(&self) -> &HttpUrl {
        self.cache_url_override.as_ref().unwrap_or(&self.url)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// The metadata value of type `T`, if one was attached.
    pub fn tag<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.tags.get::<T>()
    }

    /// Parsed `Cache-Control` directives of this request.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Returns a builder that copies this request.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Some(self.url.clone()),
            headers: self.headers.to_builder(),
            body: self.body.clone(),
            tags: self.tags.clone(),
            cache_url_override: self.cache_url_override.clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Builds a [`Request`].
pub struct RequestBuilder {
    method: Method,
    url: Option<HttpUrl>,
    headers: HeadersBuilder,
    body: Option<Body>,
    tags: TagMap,
    cache_url_override: Option<HttpUrl>,
}

impl RequestBuilder {
    pub fn new() -> RequestBuilder {
        RequestBuilder {
            method: Method::GET,
            url: None,
            headers: Headers::builder(),
            body: None,
            tags: TagMap::default(),
            cache_url_override: None,
        }
    }

    pub fn url(mut self, url: &str) -> crate::Result<RequestBuilder> {
        self.url = Some(HttpUrl::parse(url)?);
        Ok(self)
    }

    pub fn parsed_url(mut self, url: HttpUrl) -> RequestBuilder {
        self.url = Some(url);
        self
    }

    /// Sets the method and body together; body rules follow RFC 7231
    /// (e.g. POST requires a body, GET forbids one).
    pub fn method(mut self, method: Method, body: Option<Body>) -> crate::Result<RequestBuilder> {
        if body.is_some() && !permits_request_body(&method) {
            return Err(Error::new_config(format!(
                "method {} must not have a request body",
                method
            )));
        }
        if body.is_none() && requires_request_body(&method) {
            return Err(Error::new_config(format!(
                "method {} must have a request body",
                method
            )));
        }
        self.method = method;
        self.body = body;
        Ok(self)
    }

    pub fn get(self) -> crate::Result<RequestBuilder> {
        self.method(Method::GET, None)
    }

    pub fn head(self) -> crate::Result<RequestBuilder> {
        self.method(Method::HEAD, None)
    }

    pub fn post(self, body: Body) -> crate::Result<RequestBuilder> {
        self.method(Method::POST, Some(body))
    }

    pub fn put(self, body: Body) -> crate::Result<RequestBuilder> {
        self.method(Method::PUT, Some(body))
    }

    pub fn delete(self) -> crate::Result<RequestBuilder> {
        self.method(Method::DELETE, None)
    }

    pub fn header(mut self, name: &str, value: &str) -> crate::Result<RequestBuilder> {
        self.headers = self.headers.set(name, value)?;
        Ok(self)
    }

    pub fn add_header(mut self, name: &str, value: &str) -> crate::Result<RequestBuilder> {
        self.headers = self.headers.add(name, value)?;
        Ok(self)
    }

    pub fn remove_header(mut self, name: &str) -> RequestBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> RequestBuilder {
        self.headers = headers.to_builder();
        self
    }

    /// Sets `Cache-Control` directives, replacing any present.
    pub fn cache_control(self, cache_control: &CacheControl) -> crate::Result<RequestBuilder> {
        let value = cache_control.header_value();
        if value.is_empty() {
            Ok(self.remove_header("Cache-Control"))
        } else {
            self.header("Cache-Control", &value)
        }
    }

    /// Overrides the URL used for cache lookups and stores.
    pub fn cache_url(mut self, url: HttpUrl) -> RequestBuilder {
        self.cache_url_override = Some(url);
        self
    }

    /// Attaches metadata retrievable via [`Request::tag`]. Replaces any
    /// existing tag of the same type.
    pub fn tag<T: Send + Sync + 'static>(mut self, value: T) -> RequestBuilder {
        self.tags.insert(value);
        self
    }

    pub fn build(self) -> crate::Result<Request> {
        let url = self
            .url
            .ok_or_else(|| Error::new_config("request has no URL"))?;
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers.build(),
            body: self.body,
            tags: self.tags,
            cache_url_override: self.cache_url_override,
        })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish()
    }
}

impl Default for RequestBuilder {
    fn default() -> RequestBuilder {
        RequestBuilder::new()
    }
}

pub(crate) fn permits_request_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

pub(crate) fn requires_request_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// True when a response to `method` may be cached.
pub(crate) fn invalidates_cache(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_defaults() {
        let request = Request::get("http://example.com/a").unwrap();
        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.url().to_string(), "http://example.com/a");
        assert!(request.body().is_none());
    }

    #[test]
    fn body_rules() {
        let builder = Request::builder().url("http://x.test/").unwrap();
        assert!(builder.method(Method::GET, Some(Body::bytes(None, "x"))).is_err());
        let builder = Request::builder().url("http://x.test/").unwrap();
        assert!(builder.method(Method::POST, None).is_err());
    }

    #[test]
    fn tags_by_type() {
        #[derive(Clone, PartialEq, Debug)]
        struct TraceId(u64);

        let request = Request::builder()
            .url("http://x.test/")
            .unwrap()
            .tag(TraceId(7))
            .build()
            .unwrap();
        assert_eq!(request.tag::<TraceId>(), Some(&TraceId(7)));
        assert!(request.tag::<String>().is_none());
    }

    #[test]
    fn cache_url_override() {
        let request = Request::builder()
            .url("http://x.test/live")
            .unwrap()
            .cache_url(HttpUrl::parse("http://x.test/canonical").unwrap())
            .build()
            .unwrap();
        assert_eq!(request.cache_url().encoded_path(), "/canonical");
        assert_eq!(request.url().encoded_path(), "/live");
    }
}
