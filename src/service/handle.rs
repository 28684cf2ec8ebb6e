use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::network::{ByteAccumulator, ConnectionTable, FrameCodec, Session};
use crate::utils::ObjectPool;
use crate::{AppError, AppResult, ServerConfig, Shutdown};

/// State shared by the accept loop, every session task and every handle.
#[derive(Debug)]
struct ServerShared {
    config: ServerConfig,
    codec: FrameCodec,
    sessions: ConnectionTable,
    accumulator_pool: ObjectPool<ByteAccumulator>,
    send_buffer_pool: ObjectPool<BytesMut>,
    notify_shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
    epoch: Instant,
}

/// Cheap, cloneable access to a running server.
///
/// Handed to message handlers so they can reply, broadcast or drop sessions.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Server state without a listener. `ConnectionServer` builds its handle
    /// with this; on its own it is useful to drive handlers in tests.
    pub fn new(config: ServerConfig) -> Self {
        let initial_buffer_size = config.buffer.initial_buffer_size;
        let send_buffer_capacity = config.pool.send_buffer_capacity;
        let (notify_shutdown, _) = broadcast::channel(1);
        ServerHandle {
            shared: Arc::new(ServerShared {
                codec: FrameCodec::new(config.buffer.max_frame_size),
                sessions: ConnectionTable::new(),
                accumulator_pool: ObjectPool::new(config.pool.accumulator_pool_size, move || {
                    ByteAccumulator::with_capacity(initial_buffer_size)
                }),
                send_buffer_pool: ObjectPool::new(config.pool.send_buffer_pool_size, move || {
                    BytesMut::with_capacity(send_buffer_capacity)
                }),
                notify_shutdown,
                stopped: AtomicBool::new(false),
                epoch: Instant::now(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.shared.codec
    }

    pub fn sessions(&self) -> &ConnectionTable {
        &self.shared.sessions
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.shared.sessions.try_get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn accumulator_pool(&self) -> &ObjectPool<ByteAccumulator> {
        &self.shared.accumulator_pool
    }

    pub fn send_buffer_pool(&self) -> &ObjectPool<BytesMut> {
        &self.shared.send_buffer_pool
    }

    /// Milliseconds since the server was created.
    pub fn tick(&self) -> u64 {
        self.shared.epoch.elapsed().as_millis() as u64
    }

    pub fn send_unicast<M: Message>(&self, session_id: &str, message: &M) -> AppResult<()> {
        let body = message.encode_body()?;
        self.send_frame(session_id, M::TYPE_TAG, &body)
    }

    /// Encode one frame and queue it on `session_id`'s send loop.
    ///
    /// An unknown id is reported as `UnknownSession` and nothing is written.
    pub fn send_frame(&self, session_id: &str, type_tag: &str, body: &str) -> AppResult<()> {
        let Some(session) = self.shared.sessions.try_get(session_id) else {
            warn!(session_id, type_tag, "invalid session id, unicast dropped");
            return Err(AppError::UnknownSession(session_id.to_string()));
        };

        let mut buffer = self.allocate_send_buffer();
        if let Err(err) = self.shared.codec.encode_frame(type_tag, body, &mut buffer) {
            self.free_send_buffer(buffer);
            return Err(err);
        }
        self.enqueue(&session, buffer)
    }

    pub fn broadcast<M: Message>(&self, message: &M) -> AppResult<usize> {
        let body = message.encode_body()?;
        self.broadcast_frame(M::TYPE_TAG, &body)
    }

    /// Queue one frame on every live session.
    ///
    /// The frame is encoded once and copied per session. A session that is
    /// closing just misses it. Returns how many sessions it was queued on.
    pub fn broadcast_frame(&self, type_tag: &str, body: &str) -> AppResult<usize> {
        let mut encoded = self.allocate_send_buffer();
        if let Err(err) = self.shared.codec.encode_frame(type_tag, body, &mut encoded) {
            self.free_send_buffer(encoded);
            return Err(err);
        }

        let mut queued = 0;
        self.shared.sessions.for_each(|session| {
            let mut buffer = self.allocate_send_buffer();
            buffer.extend_from_slice(&encoded);
            match self.enqueue(session, buffer) {
                Ok(()) => queued += 1,
                Err(err) => debug!(session_id = session.id(), cause = %err, "broadcast skipped session"),
            }
        });
        self.free_send_buffer(encoded);
        Ok(queued)
    }

    /// Remove the session and stop its I/O tasks, which then release the
    /// socket. Only the first call for an id does anything.
    pub fn disconnect(&self, session_id: &str) -> bool {
        let Some(session) = self.shared.sessions.remove(session_id) else {
            return false;
        };
        session.close();
        info!(
            session_id,
            remote = %session.remote_address(),
            clients = self.shared.sessions.len(),
            "session disconnected"
        );
        true
    }

    pub fn disconnect_all(&self) -> usize {
        let mut closed = 0;
        self.shared.sessions.for_each(|session| {
            if self.disconnect(session.id()) {
                closed += 1;
            }
        });
        closed
    }

    /// Disconnect every session that has not sent a byte for `idle_timeout`.
    pub fn disconnect_idle(&self, idle_timeout: Duration) -> usize {
        let now = self.tick();
        let timeout = idle_timeout.as_millis() as u64;
        let mut evicted = 0;
        self.shared.sessions.for_each(|session| {
            if now.saturating_sub(session.last_seen()) >= timeout && self.disconnect(session.id())
            {
                evicted += 1;
            }
        });
        evicted
    }

    /// Ask the server to stop accepting and tear down every session.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.shared.notify_shutdown.send(());
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn subscribe_shutdown(&self) -> Shutdown {
        Shutdown::new(self.shared.notify_shutdown.subscribe())
    }

    pub(crate) fn allocate_accumulator(&self) -> ByteAccumulator {
        let mut accumulator = self.shared.accumulator_pool.allocate();
        accumulator.clear();
        accumulator
    }

    /// Return an accumulator to the pool. One that grew past the initial
    /// size is swapped for a fresh one so the pool never pins large buffers.
    pub(crate) fn free_accumulator(&self, mut accumulator: ByteAccumulator) {
        let initial_buffer_size = self.shared.config.buffer.initial_buffer_size;
        if accumulator.capacity() > initial_buffer_size {
            accumulator = ByteAccumulator::with_capacity(initial_buffer_size);
        } else {
            accumulator.clear();
        }
        self.shared.accumulator_pool.free(accumulator);
    }

    fn allocate_send_buffer(&self) -> BytesMut {
        let mut buffer = self.shared.send_buffer_pool.allocate();
        buffer.clear();
        buffer
    }

    pub(crate) fn free_send_buffer(&self, mut buffer: BytesMut) {
        let send_buffer_capacity = self.shared.config.pool.send_buffer_capacity;
        if buffer.capacity() > send_buffer_capacity {
            buffer = BytesMut::with_capacity(send_buffer_capacity);
        } else {
            buffer.clear();
        }
        self.shared.send_buffer_pool.free(buffer);
    }

    fn enqueue(&self, session: &Session, buffer: BytesMut) -> AppResult<()> {
        session.enqueue(buffer).map_err(|buffer| {
            self.free_send_buffer(buffer);
            AppError::SessionClosed(session.id().to_string())
        })
    }
}
