use tokio::{runtime, signal};
use tracing::{error, info};

use crate::service::{ConnectionServer, FrameHandler};
use crate::{AppResult, ServerConfig};

/// One server process: owns the runtime and runs a [`ConnectionServer`] on
/// it until Ctrl-C.
pub struct Node<H> {
    config: ServerConfig,
    handler: H,
}

impl<H: FrameHandler> Node<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Node { config, handler }
    }

    pub fn start(self) -> AppResult<()> {
        let worker_threads = self.config.runtime.worker_threads();
        let rt = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("stonenet-worker")
            .enable_all()
            .build()?;
        info!(worker_threads, "runtime started");

        let result = rt.block_on(async move {
            let server = ConnectionServer::bind(self.config, self.handler).await?;
            server
                .run(async {
                    if let Err(err) = signal::ctrl_c().await {
                        error!(cause = %err, "failed to listen for ctrl-c");
                    }
                })
                .await
        });
        if let Err(err) = &result {
            error!(cause = %err, "server exited with error");
        }
        info!("node shutdown complete");
        result
    }
}
