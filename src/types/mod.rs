//! Protocol value model shared by the server engine and the client.

mod monitoring;
mod node;
mod status;
mod variant;

pub use monitoring::*;
pub use node::*;
pub use status::*;
pub use variant::*;
