use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::BytesMut;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::Shutdown;

/// Traffic counters of one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    frames_sent: AtomicU64,
}

impl SessionStats {
    pub fn record_read(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_frame_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

/// Shared state of one live client connection.
///
/// The socket halves and the inbound accumulator are not in here: they are
/// owned by the session's receive and send tasks, so no two tasks ever touch
/// them. Everything reachable through the connection table is either
/// immutable or synchronized.
#[derive(Debug)]
pub struct Session {
    id: String,
    peer_addr: SocketAddr,
    /// defaults to the peer address, replaced by the address the client announces
    remote_address: RwLock<String>,
    /// milliseconds since server start at the last inbound read
    last_seen: AtomicU64,
    outbound: async_channel::Sender<BytesMut>,
    close_tx: broadcast::Sender<()>,
    closed: AtomicBool,
    stats: SessionStats,
}

impl Session {
    pub fn new(
        id: String,
        peer_addr: SocketAddr,
        outbound: async_channel::Sender<BytesMut>,
        tick: u64,
    ) -> Self {
        let (close_tx, _) = broadcast::channel(1);
        Session {
            id,
            peer_addr,
            remote_address: RwLock::new(peer_addr.to_string()),
            last_seen: AtomicU64::new(tick),
            outbound,
            close_tx,
            closed: AtomicBool::new(false),
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn remote_address(&self) -> String {
        self.remote_address.read().clone()
    }

    pub fn set_remote_address(&self, address: impl Into<String>) {
        *self.remote_address.write() = address.into();
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub fn touch(&self, tick: u64) {
        self.last_seen.fetch_max(tick, Ordering::Relaxed);
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to this session's close signal.
    ///
    /// Subscribers created after `close` never fire, so the I/O tasks
    /// subscribe before they are spawned.
    pub fn close_signal(&self) -> Shutdown {
        Shutdown::new(self.close_tx.subscribe())
    }

    /// Queue an encoded frame for the send loop.
    ///
    /// Hands the buffer back when the session is already closing so the
    /// caller can return it to its pool.
    pub fn enqueue(&self, buffer: BytesMut) -> Result<(), BytesMut> {
        if self.is_closed() {
            return Err(buffer);
        }
        self.outbound.try_send(buffer).map_err(|e| e.into_inner())
    }

    /// Signal both I/O tasks to stop. Returns `false` if already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.outbound.close();
        let _ = self.close_tx.send(());
        true
    }
}
