//! The last interceptor: writes the request to the server and reads the
//! response off the wire.

use std::io::{self, Read};

use http::Method;
use log::debug;

use crate::body::{BodySource, ResponseBody};
use crate::connect::exchange::Exchange;
use crate::error::Error;
use crate::headers::Headers;
use crate::interceptor::{Chain, Interceptor};
use crate::request::permits_request_body;
use crate::response::Response;

use std::sync::Arc;

pub(crate) struct CallServerInterceptor;

impl Interceptor for CallServerInterceptor {
    fn intercept(&self, chain: Chain<'_>) -> crate::Result<Response> {
        let engine = chain.engine;
        let request = chain.request().clone();
        let exchange = engine.current_exchange()?;

        let sent_request_at = crate::cache::now_millis();
        exchange.write_request_headers(&request)?;

        let mut early_head = None;
        let send_body = request.body().is_some() && permits_request_body(request.method());
        if send_body {
            let body = request.body().expect("checked above");

            // "Expect: 100-continue" defers the body until the server
            // asks for it; anything but a 100 skips transmission.
            let expects_continue = request
                .header("Expect")
                .map(|v| v.eq_ignore_ascii_case("100-continue"))
                .unwrap_or(false);
            if expects_continue {
                exchange.flush_request()?;
                early_head = exchange.read_response_headers(true)?;
            }

            if early_head.is_none() {
                engine.note_request_body_started();
                if body.is_duplex() {
                    // Duplex writes interleave with response reads, which
                    // only multiplexed streams support. The body streams
                    // from a background task while this thread reads.
                    if !exchange.connection().is_multiplexed() {
                        return Err(Error::new_duplex_not_supported());
                    }
                    let mut sink = exchange.create_request_body(body.content_length())?;
                    let body = body.clone();
                    engine.execute_on_runner("duplex request body", move || {
                        if body.write_to(&mut sink).is_ok() {
                            let _ = sink.close();
                        }
                    });
                } else {
                    let mut sink = exchange.create_request_body(body.content_length())?;
                    body.write_to(&mut sink).map_err(Error::new_body_write)?;
                    sink.close().map_err(Error::new_body_write)?;
                }
            } else {
                debug!("server replied before the request body was sent");
            }
        }
        exchange.finish_request()?;

        let head = match early_head {
            Some(head) => head,
            None => exchange
                .read_response_headers(false)?
                .ok_or_else(|| Error::new_protocol("expected a response head"))?,
        };
        let received_response_at = crate::cache::now_millis();

        let code = head.code;
        let mut response_builder = Response::builder()
            .request(request.clone())
            .protocol(exchange.connection().protocol())
            .code(code)
            .message(head.message.clone())
            .headers(head.headers.clone())
            .handshake(exchange.connection().handshake().cloned())
            .sent_request_at_millis(sent_request_at)
            .received_response_at_millis(received_response_at);

        let empty_body = code == 101 || !may_have_body(code, request.method());
        if code == 101 {
            // Upgrades carry no message body in the HTTP sense.
            response_builder = response_builder.body(Some(ResponseBody::empty()));
        } else {
            let (content_length, source) =
                exchange.open_response_body(&head, request.method())?;
            if (code == 204 || code == 205) && content_length.unwrap_or(0) > 0 {
                return Err(Error::new_protocol(format!(
                    "HTTP {} had non-zero Content-Length: {:?}",
                    code, content_length
                )));
            }
            let content_type = head.headers.get("Content-Type").map(String::from);
            response_builder = response_builder.body(Some(ResponseBody::new(
                content_type,
                content_length,
                Box::new(ExchangeSource {
                    inner: source,
                    exchange: exchange.clone(),
                    nano_time: engine.nano_time_fn(),
                    // A bodiless response never streams; nothing remains
                    // for the source to complete.
                    complete: empty_body,
                }),
            )));
        }

        // "Connection: close" in either direction retires the carrier.
        if request.headers().contains_value("Connection", "close")
            || head.headers.contains_value("Connection", "close")
        {
            exchange.connection().no_new_exchanges();
        }

        if empty_body {
            // Nothing will stream; the connection frees up right away.
            exchange.release(true, (engine.nano_time_fn())());
        }

        response_builder.build()
    }
}

fn may_have_body(code: u16, method: &Method) -> bool {
    *method != Method::HEAD && !matches!(code, 100..=199 | 204 | 304)
}

/// Streams the response body, releasing the exchange at EOF so the
/// connection returns to the pool exactly once.
struct ExchangeSource {
    inner: Box<dyn BodySource>,
    exchange: Arc<Exchange>,
    nano_time: Box<dyn Fn() -> u64 + Send>,
    complete: bool,
}

impl Read for ExchangeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.complete {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(0) => {
                self.complete = true;
                self.exchange.release(true, (self.nano_time)());
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.complete = true;
                let wrapped = Error::new_body(e.to_string());
                self.exchange.track_failure(&wrapped);
                self.exchange.release(false, (self.nano_time)());
                Err(e)
            }
        }
    }
}

impl BodySource for ExchangeSource {
    fn trailers(&mut self) -> crate::Result<Headers> {
        self.exchange.trailers()
    }
}

impl Drop for ExchangeSource {
    fn drop(&mut self) {
        if !self.complete {
            // Abandoned mid-body: tear the stream down so the peer stops
            // sending, then give up the reservation.
            self.exchange.cancel();
            self.exchange.connection().no_new_exchanges();
            self.exchange.release(false, (self.nano_time)());
        }
    }
}
