//! Reactive authentication for 401 and 407 responses.

use std::fmt;
use std::sync::Arc;

use crate::connect::Route;
use crate::request::Request;
use crate::response::Response;

/// Answers authentication challenges from origin servers (401) and
/// proxies (407).
///
/// Returning `None` declines the challenge and surfaces the response
/// unchanged; returning a request retries with credentials attached.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Option<Request>;
}

impl fmt::Debug for dyn Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Authenticator")
    }
}

/// Declines every challenge.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Option<Request> {
        None
    }
}

/// Formats a `Basic` credential per RFC 7617.
pub fn basic_credential(username: &str, password: &str) -> String {
    use base64::Engine;
    let raw = format!("{}:{}", username, password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
    )
}

pub type AuthenticatorRef = Arc<dyn Authenticator>;

#[cfg(test)]
mod tests {
    use super::basic_credential;

    #[test]
    fn basic_credential_rfc7617_example() {
        assert_eq!(
            basic_credential("Aladdin", "open sesame"),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
        );
    }
}
