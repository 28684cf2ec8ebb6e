use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, trace, warn};

use crate::message::{Message, NetStat};
use crate::network::{ByteAccumulator, Frame, Session};
use crate::service::{FrameHandler, ServerHandle};
use crate::{AppError, AppResult, Shutdown};

/// Receive half of a session: reads the socket, reassembles frames and
/// dispatches them one after another.
pub(crate) struct SessionReceiver<H> {
    pub(crate) session: Arc<Session>,
    pub(crate) reader: OwnedReadHalf,
    pub(crate) accumulator: ByteAccumulator,
    pub(crate) server: ServerHandle,
    pub(crate) handler: Arc<H>,
    pub(crate) close_signal: Shutdown,
    // released when the session ends, letting the accept loop take another client
    pub(crate) _permit: OwnedSemaphorePermit,
    pub(crate) _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<H: FrameHandler> SessionReceiver<H> {
    /// Drive the session until the peer goes away, a fatal error happens or
    /// the session is closed from elsewhere. Tears the session down on exit.
    pub(crate) async fn run(mut self) {
        let session_id = self.session.id().to_string();
        if let Err(err) = self.receive_loop().await {
            if err.is_fatal_to_session() {
                info!(session_id, cause = %err, "closing session");
            } else {
                warn!(session_id, cause = %err, "session ended");
            }
        }
        self.server.disconnect(&session_id);

        let SessionReceiver {
            accumulator,
            server,
            ..
        } = self;
        server.free_accumulator(accumulator);
    }

    async fn receive_loop(&mut self) -> AppResult<()> {
        loop {
            if self.session.is_closed() {
                return Ok(());
            }
            if self.accumulator.writable_len() == 0 {
                self.make_room()?;
            }

            let n = tokio::select! {
                res = self.reader.read(self.accumulator.writable_mut()) => res?,
                _ = self.close_signal.recv() => {
                    debug!(session_id = self.session.id(), "receive loop got close signal");
                    return Ok(());
                }
            };

            if n == 0 {
                // peer closed; clean only when no frame was cut in half
                return if self.accumulator.is_empty() {
                    debug!(session_id = self.session.id(), "peer closed connection");
                    Ok(())
                } else {
                    Err(AppError::DetailedIoError(
                        "connection reset by peer while sending a frame".to_string(),
                    ))
                };
            }

            self.accumulator.commit(n);
            self.session.touch(self.server.tick());
            self.session.stats().record_read(n);

            self.drain_frames().await?;
        }
    }

    /// Extract and dispatch every complete frame currently buffered.
    async fn drain_frames(&mut self) -> AppResult<()> {
        let codec = *self.server.codec();
        while let Some(frame) = codec.try_extract_frame(&mut self.accumulator)? {
            self.session.stats().record_frame_received();
            trace!(
                session_id = self.session.id(),
                type_tag = %frame.type_tag,
                body_len = frame.body.len(),
                "frame decoded"
            );
            self.dispatch(frame).await?;
            if self.session.is_closed() {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, frame: Frame) -> AppResult<()> {
        let session_id = self.session.id();
        let result = if self.server.config().session.announce && frame.type_tag == NetStat::TYPE_TAG
        {
            match self.on_net_stat(&frame) {
                Ok(()) if self.handler.observes_announcements() => {
                    self.handler
                        .on_frame_decoded(&self.server, session_id, frame)
                        .await
                }
                other => other,
            }
        } else {
            self.handler
                .on_frame_decoded(&self.server, session_id, frame)
                .await
        };

        match result {
            Err(err) if !err.is_fatal_to_session() => {
                warn!(session_id, cause = %err, "frame handler failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Answer to the announcement sent on accept.
    fn on_net_stat(&self, frame: &Frame) -> AppResult<()> {
        let stat = NetStat::decode_body(&frame.body)?;
        // A session may only relabel itself. Naming another live session's
        // id is refused rather than applied to that session.
        if stat.id != self.session.id() {
            return Err(AppError::UnknownSession(stat.id));
        }
        if !stat.ip_address.is_empty() {
            self.session.set_remote_address(stat.ip_address);
        }
        info!(
            session_id = self.session.id(),
            remote = %self.session.remote_address(),
            clients = self.server.session_count(),
            "client connected"
        );
        Ok(())
    }

    /// Free up writable space: double the buffer, or compact it once the
    /// configured ceiling is reached.
    fn make_room(&mut self) -> AppResult<()> {
        let capacity = self.accumulator.capacity();
        let max_buffer_size = self.server.config().buffer.max_buffer_size;
        let mut target = capacity.saturating_mul(2).max(1);
        if max_buffer_size != 0 {
            target = target.min(max_buffer_size);
        }

        if target > capacity {
            return self.accumulator.grow(target);
        }
        if self.accumulator.front() > 0 {
            self.accumulator.read(0);
            return Ok(());
        }
        Err(AppError::MalformedProtocol(format!(
            "buffered data exceeds max buffer size {}",
            max_buffer_size
        )))
    }
}

/// Send half of a session: writes queued frames in order.
pub(crate) struct SessionSender {
    pub(crate) session: Arc<Session>,
    pub(crate) writer: OwnedWriteHalf,
    pub(crate) outbound: async_channel::Receiver<BytesMut>,
    pub(crate) server: ServerHandle,
    pub(crate) close_signal: Shutdown,
    pub(crate) _shutdown_complete_tx: mpsc::Sender<()>,
}

impl SessionSender {
    pub(crate) async fn run(mut self) {
        let session_id = self.session.id().to_string();
        if let Err(err) = self.send_loop().await {
            info!(session_id, cause = %err, "write failed, closing session");
            self.server.disconnect(&session_id);
        }

        // whatever is still queued is not going out
        self.outbound.close();
        while let Ok(buffer) = self.outbound.try_recv() {
            self.server.free_send_buffer(buffer);
        }
        if let Err(err) = self.writer.shutdown().await {
            trace!(session_id, cause = %err, "shutdown write half");
        }
        debug!(session_id, "send loop exited");
    }

    async fn send_loop(&mut self) -> AppResult<()> {
        loop {
            let buffer = tokio::select! {
                res = self.outbound.recv() => match res {
                    Ok(buffer) => buffer,
                    // queue closed by disconnect
                    Err(_) => return Ok(()),
                },
                _ = self.close_signal.recv() => return Ok(()),
            };

            let len = buffer.len();
            let result = self.writer.write_all(&buffer).await;
            self.server.free_send_buffer(buffer);
            result.map_err(|e| AppError::DetailedIoError(format!("write frame error: {}", e)))?;
            self.session.stats().record_frame_sent(len);
        }
    }
}
