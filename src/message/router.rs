use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;

use tracing::trace;

use super::{AnyMessage, Message, MessageRegistry, NetStat};
use crate::network::Frame;
use crate::service::{FrameHandler, ServerHandle};
use crate::{AppError, AppResult};

type HandlerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
type ErasedHandler = Box<dyn Fn(ServerHandle, String, AnyMessage) -> HandlerFuture + Send + Sync>;

/// Dispatches decoded frames to typed handlers, one per message kind.
///
/// ```ignore
/// let router = MessageRouter::new().route(|server: ServerHandle, session_id, chat: Chat| async move {
///     server.broadcast(&chat)?;
///     Ok(())
/// });
/// ```
///
/// A frame whose tag has no route ends the session that sent it.
#[derive(Default)]
pub struct MessageRouter {
    registry: MessageRegistry,
    routes: HashMap<&'static str, ErasedHandler>,
}

impl Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .finish()
    }
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `M` and the handler receiving it. A later route for the same
    /// kind replaces the earlier one.
    pub fn route<M, F, Fut>(mut self, handler: F) -> Self
    where
        M: Message,
        F: Fn(ServerHandle, String, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        self.registry.register::<M>();
        let erased: ErasedHandler = Box::new(move |server, session_id, message| {
            match message.downcast::<M>() {
                Ok(message) => Box::pin(handler(server, session_id, message)),
                Err(other) => {
                    let error = AppError::IllegalStateError(format!(
                        "route for {} got a {}",
                        M::TYPE_TAG,
                        other.type_tag()
                    ));
                    Box::pin(async move { Err(error) })
                }
            }
        });
        self.routes.insert(M::TYPE_TAG, erased);
        self
    }

    pub fn has_route(&self, type_tag: &str) -> bool {
        self.routes.contains_key(type_tag)
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }
}

impl FrameHandler for MessageRouter {
    async fn on_frame_decoded(
        &self,
        server: &ServerHandle,
        session_id: &str,
        frame: Frame,
    ) -> AppResult<()> {
        let handler = self
            .routes
            .get(frame.type_tag.as_str())
            .ok_or_else(|| AppError::UnknownMessageType(frame.type_tag.clone()))?;
        let message = self.registry.decode_frame(&frame)?;
        trace!(session_id, type_tag = message.type_tag(), "routing message");
        handler(server.clone(), session_id.to_string(), message).await
    }

    fn observes_announcements(&self) -> bool {
        self.has_route(NetStat::TYPE_TAG)
    }
}
