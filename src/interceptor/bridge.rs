//! The bridge from application requests to network requests: it fills
//! in mechanical headers on the way out and undoes transparent
//! compression on the way back.

use std::io::{self, Read};

use flate2::read::GzDecoder;

use crate::body::{BodySource, ResponseBody};
use crate::cookie::Cookie;
use crate::headers::Headers;
use crate::interceptor::{Chain, Interceptor};
use crate::response::Response;

pub(crate) struct BridgeInterceptor;

impl Interceptor for BridgeInterceptor {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        let user_request = chain.request().clone();
        let client = chain.engine.client();
        let url = user_request.url().clone();

        let mut builder = user_request.to_builder();

        if let Some(body) = user_request.body() {
            if let Some(content_type) = body.content_type() {
                if user_request.header("Content-Type").is_none() {
                    builder = builder.header("Content-Type", &content_type)?;
                }
            }
            match body.content_length() {
                Some(length) => {
                    let mut buffer = itoa::Buffer::new();
                    builder = builder
                        .header("Content-Length", buffer.format(length))?
                        .remove_header("Transfer-Encoding");
                }
                None => {
                    builder = builder
                        .header("Transfer-Encoding", "chunked")?
                        .remove_header("Content-Length");
                }
            }
        }

        if user_request.header("Host").is_none() {
            builder = builder.header("Host", &url.host_header())?;
        }
        if user_request.header("Connection").is_none() {
            builder = builder.header("Connection", "Keep-Alive")?;
        }

        // Offer gzip unless the caller negotiates encodings itself, and
        // remember that the decoding duty is ours.
        let transparent_gzip = user_request.header("Accept-Encoding").is_none()
            && user_request.header("Range").is_none();
        if transparent_gzip {
            builder = builder.header("Accept-Encoding", "gzip")?;
        }

        let cookies = client.cookie_jar.load(&url);
        if !cookies.is_empty() {
            let header = cookies
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            builder = builder.header("Cookie", &header)?;
        }

        if user_request.header("User-Agent").is_none() {
            builder = builder.header("User-Agent", &client.user_agent)?;
        }

        let mut response = chain.proceed(builder.build()?)?;

        receive_cookies(&*client.cookie_jar, &url, response.headers());

        let gzipped = transparent_gzip
            && response
                .header("Content-Encoding")
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
            && has_body(&response);

        let body = response.take_body();
        let content_type = response.header("Content-Type").map(String::from);
        let mut builder = response
            .to_builder()
            .request(user_request)
            .links_from(&mut response);
        if gzipped {
            builder = builder
                .remove_header("Content-Encoding")
                .remove_header("Content-Length");
            let inner = body.unwrap_or_else(ResponseBody::empty);
            builder = builder.body(Some(ResponseBody::new(
                content_type,
                None,
                Box::new(GzipSource {
                    inner: GzDecoder::new(inner),
                }),
            )));
        } else {
            builder = builder.body(body);
        }
        builder.build()
    }
}

/// Whether the response status permits a message body.
fn has_body(response: &Response) -> bool {
    !matches!(response.code(), 204 | 304) && response.code() >= 200
}

fn receive_cookies(jar: &dyn crate::cookie::CookieJar, url: &crate::url::HttpUrl, headers: &Headers) {
    let cookies: Vec<Cookie> = headers
        .values("Set-Cookie")
        .iter()
        .filter_map(|value| Cookie::parse(url, value))
        .collect();
    if !cookies.is_empty() {
        jar.save(url, cookies);
    }
}

/// Decompresses a gzip response body as it is read.
struct GzipSource {
    inner: GzDecoder<ResponseBody>,
}

impl Read for GzipSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl BodySource for GzipSource {
    fn trailers(&mut self) -> crate::Result<Headers> {
        self.inner.get_mut().trailers()
    }
}
