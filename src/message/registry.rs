use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::network::Frame;
use crate::{AppError, AppResult};

/// An application message kind carried in a frame.
///
/// The type tag names the kind on the wire; the body is the JSON text of the
/// value. The server itself never looks inside bodies.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_TAG: &'static str;

    fn encode_body(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Bodies that do not parse are protocol errors: the peer speaks a
    /// different version of the message set.
    fn decode_body(body: &str) -> AppResult<Self> {
        serde_json::from_str(body).map_err(|e| {
            AppError::MalformedProtocol(format!("can not decode {}: {}", Self::TYPE_TAG, e))
        })
    }

    fn to_frame(&self) -> AppResult<Frame> {
        Ok(Frame::new(Self::TYPE_TAG, self.encode_body()?))
    }
}

/// A decoded message whose concrete kind is only known by its tag.
pub struct AnyMessage {
    type_tag: &'static str,
    value: Box<dyn Any + Send>,
}

impl Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

impl AnyMessage {
    pub fn new<M: Message>(message: M) -> Self {
        AnyMessage {
            type_tag: M::TYPE_TAG,
            value: Box::new(message),
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    pub fn is<M: Message>(&self) -> bool {
        self.value.is::<M>()
    }

    /// Recover the concrete value, or get `self` back on a kind mismatch.
    pub fn downcast<M: Message>(self) -> Result<M, AnyMessage> {
        let type_tag = self.type_tag;
        self.value
            .downcast::<M>()
            .map(|message| *message)
            .map_err(|value| AnyMessage { type_tag, value })
    }
}

type DecodeFn = fn(&str) -> AppResult<AnyMessage>;
type EncodeFn = fn(&AnyMessage) -> AppResult<String>;

#[derive(Clone, Copy)]
struct MessageKind {
    decode: DecodeFn,
    encode: EncodeFn,
}

fn decode_erased<M: Message>(body: &str) -> AppResult<AnyMessage> {
    Ok(AnyMessage::new(M::decode_body(body)?))
}

fn encode_erased<M: Message>(message: &AnyMessage) -> AppResult<String> {
    message
        .value
        .downcast_ref::<M>()
        .ok_or_else(|| {
            AppError::IllegalStateError(format!(
                "message tagged {} is not a {}",
                message.type_tag,
                M::TYPE_TAG
            ))
        })?
        .encode_body()
}

/// Type tag to decode/encode functions, filled in by the application at
/// startup.
#[derive(Default, Clone)]
pub struct MessageRegistry {
    kinds: HashMap<&'static str, MessageKind>,
}

impl Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.kinds.keys()).finish()
    }
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same kind twice is harmless.
    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.kinds.insert(
            M::TYPE_TAG,
            MessageKind {
                decode: decode_erased::<M>,
                encode: encode_erased::<M>,
            },
        );
        self
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.kinds.contains_key(type_tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }

    pub fn decode(&self, type_tag: &str, body: &str) -> AppResult<AnyMessage> {
        let kind = self
            .kinds
            .get(type_tag)
            .ok_or_else(|| AppError::UnknownMessageType(type_tag.to_string()))?;
        (kind.decode)(body)
    }

    pub fn decode_frame(&self, frame: &Frame) -> AppResult<AnyMessage> {
        self.decode(&frame.type_tag, &frame.body)
    }

    pub fn encode_any(&self, message: &AnyMessage) -> AppResult<Frame> {
        let kind = self
            .kinds
            .get(message.type_tag)
            .ok_or_else(|| AppError::UnknownMessageType(message.type_tag.to_string()))?;
        Ok(Frame::new(message.type_tag, (kind.encode)(message)?))
    }

    pub fn encode<M: Message>(&self, message: &M) -> AppResult<Frame> {
        if !self.contains(M::TYPE_TAG) {
            return Err(AppError::UnknownMessageType(M::TYPE_TAG.to_string()));
        }
        message.to_frame()
    }
}
