pub use app_error::{AppError, AppResult};
pub use config::{
    BufferConfig, NetworkConfig, PoolConfig, RuntimeConfig, ServerConfig, SessionConfig,
    ENV_PREFIX,
};
pub use handle::ServerHandle;
pub use handler::FrameHandler;
pub use node::Node;
pub use server::ConnectionServer;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod handle;
mod handler;
mod node;
mod server;
mod session_task;
mod shutdown;
mod tracing_config;
