//! Server side: subscriptions and the in-process subscription service.

mod local;
mod subscription;

pub use local::*;
pub use subscription::*;
