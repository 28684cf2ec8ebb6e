use std::future::Future;

use crate::network::Frame;
use crate::service::ServerHandle;
use crate::AppResult;

/// Receives every frame decoded on any session.
///
/// Frames of one session are delivered strictly in arrival order: the receive
/// loop awaits the returned future before extracting the next frame, so a
/// slow handler stalls only its own session. Replies go through `server`.
///
/// Errors for which `AppError::is_fatal_to_session` holds close the session;
/// any other error is logged and the session keeps going.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame_decoded(
        &self,
        server: &ServerHandle,
        session_id: &str,
        frame: Frame,
    ) -> impl Future<Output = AppResult<()>> + Send;

    /// Whether announcement replies (`MsgNetStat`) are passed on after the
    /// server has recorded them. They are only consumed by default.
    fn observes_announcements(&self) -> bool {
        false
    }
}
