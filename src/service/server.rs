use std::future::{self, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::message::NetStat;
use crate::network::Session;
use crate::service::session_task::{SessionReceiver, SessionSender};
use crate::service::{FrameHandler, ServerHandle};
use crate::{AppError, AppResult, ServerConfig, Shutdown};

/// Longest pause between two failed accepts.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(64);

/// Accepts TCP clients and runs a receive task and a send task for each.
///
/// Decoded frames go to `H`; replies and broadcasts go through the
/// [`ServerHandle`] returned by [`ConnectionServer::handle`].
#[derive(Debug)]
pub struct ConnectionServer<H> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    server: ServerHandle,
    handler: Arc<H>,
    shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl<H: FrameHandler> ConnectionServer<H> {
    pub async fn bind(config: ServerConfig, handler: H) -> AppResult<Self> {
        config.validate()?;
        let listen_address = config.listen_address();
        let listener = match TcpListener::bind(&listen_address).await {
            Ok(listener) => listener,
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    listen_address, err
                );
                error!(error_msg);
                return Err(AppError::IllegalStateError(error_msg));
            }
        };
        info!("tcp server binding to {} for listening", listener.local_addr()?);
        Ok(Self::from_listener(listener, config, handler))
    }

    /// Serve on an already bound listener.
    pub fn from_listener(listener: TcpListener, config: ServerConfig, handler: H) -> Self {
        let limit_connections = Arc::new(Semaphore::new(config.network.max_connection));
        let server = ServerHandle::new(config);
        let shutdown = server.subscribe_shutdown();
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        ConnectionServer {
            listener,
            limit_connections,
            server,
            handler: Arc::new(handler),
            shutdown,
            shutdown_complete_tx,
            shutdown_complete_rx,
        }
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        self.server.clone()
    }

    /// Spawn the server on the current runtime. Stop it with
    /// [`ServerHandle::stop`]; the join handle resolves once every session
    /// has been torn down.
    pub fn start(self) -> (ServerHandle, JoinHandle<AppResult<()>>) {
        let server = self.handle();
        let join = tokio::spawn(self.run(future::pending::<()>()));
        (server, join)
    }

    /// Accept clients until `shutdown_signal` resolves or the server is
    /// stopped through its handle.
    ///
    /// Shutdown sequence:
    /// 1. the accept loop is dropped, no new client gets in
    /// 2. every session is disconnected, which wakes both of its tasks
    /// 3. each task drops its `shutdown_complete_tx` clone on exit
    /// 4. once the last clone is gone `run` returns
    pub async fn run(self, shutdown_signal: impl Future) -> AppResult<()> {
        let ConnectionServer {
            listener,
            limit_connections,
            server,
            handler,
            mut shutdown,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
        } = self;

        if let Some(idle_timeout) = server.config().session.idle_timeout() {
            let reap_interval = Duration::from_millis(server.config().session.reap_interval_ms);
            tokio::spawn(reap_idle_sessions(
                server.clone(),
                server.subscribe_shutdown(),
                idle_timeout,
                reap_interval,
                shutdown_complete_tx.clone(),
            ));
        }

        tokio::select! {
            _ = accept_loop(&listener, &limit_connections, &server, &handler, &shutdown_complete_tx) => {}
            _ = shutdown_signal => {
                info!("get shutdown signal");
            }
            _ = shutdown.recv() => {
                info!("server stop requested");
            }
        }

        server.stop();
        let closed = server.disconnect_all();
        info!(closed, "closed all sessions");

        drop(listener);
        drop(shutdown_complete_tx);
        trace!("waiting for session tasks to finish...");
        let _ = shutdown_complete_rx.recv().await;
        info!("tcp server shutdown complete");
        Ok(())
    }
}

/// Accept forever. Errors are logged and retried, only cancellation ends it.
async fn accept_loop<H: FrameHandler>(
    listener: &TcpListener,
    limit_connections: &Arc<Semaphore>,
    server: &ServerHandle,
    handler: &Arc<H>,
    shutdown_complete_tx: &mpsc::Sender<()>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        // the semaphore is never closed
        let Ok(permit) = limit_connections.clone().acquire_owned().await else {
            return;
        };

        match listener.accept().await {
            Ok((socket, peer_addr)) => {
                backoff = Duration::from_secs(1);
                if let Err(err) = spawn_session(
                    socket,
                    peer_addr,
                    permit,
                    server,
                    handler,
                    shutdown_complete_tx,
                ) {
                    warn!(%peer_addr, cause = %err, "failed to set up session");
                }
            }
            Err(err) => {
                error!(cause = %err, "accept tcp connection error, retry in {:?}", backoff);
                drop(permit);
                time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_ACCEPT_BACKOFF);
            }
        }
    }
}

fn spawn_session<H: FrameHandler>(
    socket: TcpStream,
    peer_addr: SocketAddr,
    permit: OwnedSemaphorePermit,
    server: &ServerHandle,
    handler: &Arc<H>,
    shutdown_complete_tx: &mpsc::Sender<()>,
) -> AppResult<()> {
    socket.set_nodelay(true)?;
    let session_id = Uuid::new_v4().to_string();
    let (reader, writer) = socket.into_split();
    let (outbound_tx, outbound_rx) = async_channel::unbounded();

    let session = Arc::new(Session::new(
        session_id.clone(),
        peer_addr,
        outbound_tx,
        server.tick(),
    ));
    let receiver_close = session.close_signal();
    let sender_close = session.close_signal();
    server.sessions().add(session.clone())?;
    debug!(session_id, %peer_addr, clients = server.session_count(), "accepted connection");

    let sender = SessionSender {
        session: session.clone(),
        writer,
        outbound: outbound_rx,
        server: server.clone(),
        close_signal: sender_close,
        _shutdown_complete_tx: shutdown_complete_tx.clone(),
    };
    let receiver = SessionReceiver {
        session,
        reader,
        accumulator: server.allocate_accumulator(),
        server: server.clone(),
        handler: handler.clone(),
        close_signal: receiver_close,
        _permit: permit,
        _shutdown_complete_tx: shutdown_complete_tx.clone(),
    };
    tokio::spawn(sender.run());
    tokio::spawn(receiver.run());

    if server.config().session.announce {
        let announcement = NetStat {
            id: session_id.clone(),
            ip_address: String::new(),
        };
        server.send_unicast(&session_id, &announcement)?;
    }
    Ok(())
}

async fn reap_idle_sessions(
    server: ServerHandle,
    mut shutdown: Shutdown,
    idle_timeout: Duration,
    reap_interval: Duration,
    _shutdown_complete_tx: mpsc::Sender<()>,
) {
    let mut interval = time::interval(reap_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.recv() => {
                debug!("idle reaper received shutdown signal");
                return;
            }
        }
        let evicted = server.disconnect_idle(idle_timeout);
        if evicted > 0 {
            info!(evicted, "disconnected idle sessions");
        }
    }
}
