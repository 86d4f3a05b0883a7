//! Wire protocol implementations.

pub(crate) mod h1;
pub(crate) mod h2;

use crate::headers::Headers;
use crate::protocol::Protocol;

/// A parsed status line and header block, protocol-agnostic.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) protocol: Protocol,
    pub(crate) code: u16,
    pub(crate) message: String,
    pub(crate) headers: Headers,
}
