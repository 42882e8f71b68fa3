//! Transport plumbing for the dispatch core: the dialer abstraction,
//! destination-rewriting dialer wrappers, and the pre-established
//! connection pool that keeps warm upstream sessions ready for proxy
//! outbounds.

pub mod dialer;
pub mod nat64;
pub mod pool;

pub use dialer::{DialError, Dialer, FnDialer, IoStream, TcpDialer};
pub use nat64::Nat64Dialer;
pub use pool::{ConnectionPool, PoolError, PooledConn};
