//! Application message kinds and their dispatch.
//!
//! Frames only carry a type tag and an opaque body. `MessageRegistry` maps tags
//! to decode/encode functions and `MessageRouter` maps them to typed handlers;
//! both are populated by the application before the server starts.

pub use builtin::{Chat, NetStat};
pub use registry::{AnyMessage, Message, MessageRegistry};
pub use router::MessageRouter;

mod builtin;
mod registry;
mod router;
