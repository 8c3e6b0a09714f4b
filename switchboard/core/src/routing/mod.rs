//! Protocol Selection Support
//!
//! State the manager consults when choosing a protocol for a send.
//!
//! # Architecture
//!
//! ```text
//! send(envelope, target, preferred)
//!          |
//!          v
//! +------------------+
//! |    RouteTable    |  <-- target address -> preferred protocol
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  CircuitBreaker  |  <-- one per protocol, skips failing transports
//! +--------+---------+
//!          |
//!          v
//!   ProtocolAdapter::send
//! ```

pub mod breaker;
pub mod route_table;

#[cfg(test)]
pub mod test_utils;

pub use breaker::*;
pub use route_table::*;
