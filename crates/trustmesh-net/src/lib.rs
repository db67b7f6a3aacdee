//! Trustmesh networking primitives.
//!
//! - [`udp`]: socket construction shared by every agent
//! - [`clock`]: the microsecond clock embedded in probe payloads
//! - [`trace`]: TTL-sweep trace engine behind a probe transport trait
//! - [`icmp`]: raw-socket ICMP implementation of that transport

pub mod clock;
pub mod icmp;
pub mod trace;
pub mod udp;
