//! # fkv Async Client
//!
//! Purpose: Send length-framed requests to a key-value store over TCP, one
//! in-flight request per connection, with deadlines and endpoint failover.
//!
//! ## Design Principles
//! 1. **Actor per Connection**: One Tokio task owns each socket; `submit` and
//!    `shutdown` are messages, so connection state needs no locks.
//! 2. **Exactly-Once Completion**: A per-request flag decides which of the
//!    pipeline, the deadline, or a shutdown completes the request.
//! 3. **Ordered Failover**: Endpoints are dialed in list order, and only
//!    before any request byte has been written.
//! 4. **Lease-Tracked Teardown**: Every spawned task holds a lease on its
//!    connection so `close` can wait for all of them.

mod config;
mod connection;
mod guard;
mod pool;
mod request;

pub use config::{ConnectionOptions, PoolConfig};
pub use connection::Connection;
pub use guard::{Lease, LifetimeGuard};
pub use pool::{resolve_endpoints, ConnectionPool};
pub use request::{Request, ResponseHandler};

pub use fkv_common::{TransportError, TransportResult};
