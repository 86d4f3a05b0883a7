#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # courier
//!
//! courier is an embeddable HTTP client for Rust.
//!
//! ## Features
//!
//! - HTTP/1.1 and HTTP/2, over plaintext and TLS (TLS plugs in via a
//!   connector trait with ALPN)
//! - Connection pooling with multiplexing, coalescing, and fast
//!   fallback across address families
//! - Response caching per RFC 7234, journaled on disk
//! - Redirects, retries, and reactive authentication
//! - WebSockets (RFC 6455) with optional permessage-deflate
//!
//! Calls run synchronously on the calling thread via
//! [`Call::execute`], or asynchronously through the dispatcher via
//! [`Call::enqueue`]. Background work (pool maintenance, pings, cache
//! compaction, WebSocket writers) runs on a shared task runner of
//! daemon threads.
//!
//! ```no_run
//! # fn run() -> courier::Result<()> {
//! let client = courier::Client::new(courier::Config::default())?;
//! let request = courier::Request::get("http://example.com/")?;
//! let response = client.new_call(request).execute()?;
//! println!("{}", response.into_body().string()?);
//! # Ok(())
//! # }
//! ```

pub use http::Method;

pub use crate::auth::{basic_credential, Authenticator, NoAuthenticator};
pub use crate::body::{Body, RequestBody, ResponseBody};
pub use crate::cache::Cache;
pub use crate::cache_control::CacheControl;
pub use crate::call::{callback, Call, Callback};
pub use crate::client::{Client, Config};
pub use crate::connect::{Address, AddressPolicy, Route, RouteTarget};
pub use crate::cookie::{Cookie, CookieJar, InMemoryCookieJar, NoCookies};
pub use crate::dns::{Dns, SystemDns};
pub use crate::error::{Error, Result};
pub use crate::event::{EventListener, NoEvents};
pub use crate::headers::{Headers, HeadersBuilder};
pub use crate::media_type::MediaType;
pub use crate::protocol::Protocol;
pub use crate::proxy::{NoProxy, Proxy, ProxySelector};
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Response, ResponseBuilder};
pub use crate::task::{CountDownLatch, Task, TaskQueue, TaskRunner};
pub use crate::tls::{ConnectionSpec, Handshake, TlsConnector, TlsStream};
pub use crate::url::{HttpUrl, PublicSuffixDatabase};
pub use crate::ws::{web_socket_url, WebSocket, WebSocketListener};

pub mod auth;
mod body;
pub mod cache;
mod cache_control;
mod call;
mod client;
mod connect;
pub mod cookie;
mod dispatcher;
pub mod dns;
mod error;
pub mod event;
mod headers;
pub mod interceptor;
mod media_type;
mod protocol;
mod proto;
pub mod proxy;
mod request;
mod response;
mod task;
pub mod tls;
mod transport;
mod url;
pub mod ws;

pub use crate::interceptor::{Chain, Interceptor};
