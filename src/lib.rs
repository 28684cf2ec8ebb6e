pub mod message;
pub mod network;
pub mod service;
pub mod utils;

pub use message::{Chat, Message, MessageRouter, NetStat};
pub use network::{ByteAccumulator, Frame, FrameCodec};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConnectionServer, FrameHandler, Node,
    ServerConfig, ServerHandle, Shutdown,
};
pub use utils::ObjectPool;
