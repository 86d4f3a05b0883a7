//! The connection engine: addresses, routes, the pool, planning, and
//! fast-fallback acquisition.

pub(crate) mod address;
pub(crate) mod connection;
pub(crate) mod exchange;
pub(crate) mod finder;
pub(crate) mod planner;
pub(crate) mod pool;
pub(crate) mod route;

pub use address::Address;
pub use pool::AddressPolicy;
pub use route::{Route, RouteTarget};
