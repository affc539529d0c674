//! Network layer: the per-fixture connection client, the outgoing rate
//! limiter, and the multicast discovery service.

pub mod connection;
pub mod discovery;
pub mod ratelimit;

pub use connection::Client;
pub use connection::ConnectionError;
pub use connection::ConnectionState;
pub use discovery::DiscoveryError;
pub use ratelimit::RateLimiter;
