//! Per-item monitoring pipeline: change filter, bounded queue and the item itself.

mod diagnostics;
mod filter;
mod item;
mod queue;

pub use diagnostics::*;
pub use filter::*;
pub use item::*;
pub use queue::*;
