//! # hearth-core
//!
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use perfmon;
pub use pnet;
pub use proto;
pub use stats;
pub use tokio;
pub use tokio_stream;
pub use tracing;
pub use unix_udp_sock;

pub use crate::server::Server;

pub mod config;
pub mod error;
pub mod handler;
pub mod hook;
pub mod metrics;
pub mod prelude;
pub mod server;

/// Register a plugin with the server
pub trait Register<T> {
    /// add plugin to one of the server's plugin lists in the implementation of
    /// this method
    fn register(self, srv: &mut Server<T>);
}
