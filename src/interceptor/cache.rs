//! Serves responses from the cache and updates it from the network,
//! per RFC 7234.

use std::io::{self, Read};

use log::debug;

use crate::body::{BodySource, ResponseBody};
use crate::cache::{self, CacheStrategy, CacheWriter};
use crate::headers::Headers;
use crate::interceptor::{Chain, Interceptor};
use crate::protocol::Protocol;
use crate::request::invalidates_cache;
use crate::response::Response;

pub(crate) struct CacheInterceptor;

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        let engine = chain.engine;
        let client = engine.client();
        let request = chain.request().clone();
        let cache = client.cache.as_ref();

        let candidate = cache.and_then(|c| c.get(&request));
        let (cached, sequence) = match candidate {
            Some((response, sequence)) => (Some(response), sequence),
            None => (None, 0),
        };

        let now = cache::now_millis();
        let strategy = CacheStrategy::compute(now, &request, cached);
        if let Some(c) = cache {
            c.track_response(&strategy);
        }
        let CacheStrategy {
            network_request,
            cache_response,
        } = strategy;

        match (network_request, cache_response) {
            // Forbidden from the network and nothing usable on disk.
            (None, None) => {
                engine.listener().cache_miss(&request.url().to_string());
                Response::builder()
                    .request(request)
                    .protocol(Protocol::Http11)
                    .code(504)
                    .message("Unsatisfiable Request (only-if-cached)")
                    .body(Some(ResponseBody::empty()))
                    .sent_request_at_millis(now)
                    .received_response_at_millis(now)
                    .build()
            }

            // Fresh enough: no network at all.
            (None, Some(mut cached)) => {
                engine.listener().cache_hit(&request.url().to_string());
                let stripped = cached.stripped();
                let body = cached.take_body();
                cached
                    .to_builder()
                    .body(body)
                    .cache_response(Some(stripped))
                    .build()
            }

            (Some(network_request), cached) => {
                let network_response = match chain.proceed(network_request) {
                    Ok(response) => response,
                    Err(e) => {
                        // The cached candidate cannot rescue a failed
                        // revalidation; surface the failure.
                        return Err(e);
                    }
                };

                if let Some(mut cached) = cached {
                    if network_response.code() == 304 {
                        debug!("conditional hit for {}", request.url().redact());
                        engine
                            .listener()
                            .cache_conditional_hit(&request.url().to_string());
                        let merged =
                            cache::combine_headers(cached.headers(), network_response.headers());
                        let cached_stripped = cached.stripped();
                        let network_stripped = network_response.stripped();
                        let body = cached.take_body();
                        let merged_response = cached
                            .to_builder()
                            .headers(merged)
                            .request(request.clone())
                            .sent_request_at_millis(network_response.sent_request_at_millis())
                            .received_response_at_millis(
                                network_response.received_response_at_millis(),
                            )
                            .cache_response(Some(cached_stripped))
                            .network_response(Some(network_stripped))
                            .body(body)
                            .build()?;

                        if let Some(c) = cache {
                            c.track_conditional_hit();
                            c.update(sequence, &merged_response);
                        }
                        return Ok(merged_response);
                    }
                    // The entry lost; its body is dropped.
                    drop(cached.take_body());
                }

                self.cache_network_response(&chain, request, network_response)
            }
        }
    }
}

impl CacheInterceptor {
    /// Stores a cacheable network response, streaming its body into the
    /// cache as the application consumes it.
    fn cache_network_response(
        &self,
        chain: &Chain<'_>,
        request: crate::request::Request,
        mut network_response: Response,
    ) -> crate::Result<Response> {
        let client = chain.engine.client();
        let cache = match client.cache.as_ref() {
            Some(cache) => cache,
            None => return Ok(network_response),
        };

        if invalidates_cache(request.method()) && network_response.code() < 400 {
            cache.invalidate(&request);
            return Ok(network_response);
        }

        if !cache::is_cacheable(&network_response, &request) {
            return Ok(network_response);
        }

        let writer = match cache.put(&network_response) {
            Some(writer) => writer,
            None => return Ok(network_response),
        };

        let body = network_response.take_body();
        let content_type = network_response
            .header("Content-Type")
            .map(String::from);
        let content_length = body.as_ref().and_then(|b| b.content_length());
        let inner = body.unwrap_or_else(ResponseBody::empty);
        let teed = ResponseBody::new(
            content_type,
            content_length,
            Box::new(TeeSource {
                inner,
                writer: Some(writer),
            }),
        );
        let mut network_response = network_response;
        network_response
            .to_builder()
            .links_from(&mut network_response)
            .body(Some(teed))
            .build()
    }
}

/// Copies body bytes into the cache as they stream by; the entry
/// publishes only if the body completes.
struct TeeSource {
    inner: ResponseBody,
    writer: Option<CacheWriter>,
}

impl Read for TeeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.read(buf) {
            Ok(0) => {
                if let Some(writer) = self.writer.take() {
                    writer.commit();
                }
                Ok(0)
            }
            Ok(n) => {
                if let Some(ref mut writer) = self.writer {
                    if let Err(e) = writer.write(&buf[..n]) {
                        // Cache trouble never fails the call.
                        debug!("cache write failed, aborting entry: {}", e);
                        if let Some(writer) = self.writer.take() {
                            writer.abort();
                        }
                    }
                }
                Ok(n)
            }
            Err(e) => {
                if let Some(writer) = self.writer.take() {
                    writer.abort();
                }
                Err(e)
            }
        }
    }
}

impl BodySource for TeeSource {
    fn trailers(&mut self) -> crate::Result<Headers> {
        self.inner.trailers()
    }
}
