//! uamon - monitored item sampling and subscription synchronization.
//!
//! The server side samples node values on shared interval timers and runs
//! every change through a per-item deadband filter and bounded queue. The
//! client side keeps a locally declared set of monitored items in sync with
//! a server through batched, partially failing service calls.

pub mod client;
pub mod config;
pub mod monitoring;
pub mod sampling;
pub mod server;
pub mod service;
pub mod store;
pub mod types;
