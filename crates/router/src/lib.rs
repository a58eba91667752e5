//! Cluster ingress router
//!
//! Resolves hostnames to backend targets through wildcard descent, answers
//! DNS for routed names, redirects plain HTTP and reverse proxies HTTPS with
//! per-host certificates from ACME or the backend's certificate authority.
//! Targets that stay quiet are idled by a periodic sweep and woken again on
//! their next request.

pub mod backend;
pub mod cache;
pub mod certs;
pub mod common;
pub mod idle;
pub mod router;
pub mod server;
pub mod storage;
pub mod telemetry;

// Re-export common types at crate root
pub use common::error;
pub use error::{Result, RouterError};
pub use router::Router;
pub use server::config::RouterConfig;
pub use server::{ListenAddrs, RouterServer};
