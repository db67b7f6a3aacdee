//! ribd library surface, split out so the services are testable
//! without a running daemon.

pub mod adstore;
pub mod certstore;
pub mod config;
pub mod linkstate;
pub mod pathcomputer;
pub mod rib;
pub mod traceprobe;
