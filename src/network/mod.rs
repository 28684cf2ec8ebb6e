//! Network Module Implementation
//!
//! Byte-level plumbing shared by every connection:
//! - `ByteAccumulator`: per-session receive buffer reassembling partial reads
//! - `FrameCodec`: `[magic][length][type tag][body]` framing
//! - `Session`: shared state of one live connection
//! - `ConnectionTable`: concurrent registry of live sessions
//!
//! The loops driving sessions live in `service::server`.

pub use accumulator::{ByteAccumulator, DEFAULT_BUFFER_SIZE};
pub use connection_table::ConnectionTable;
pub use frame::{Frame, FrameCodec, FrameHeader, HEADER_SIZE, LENGTH_PREFIX_SIZE, MAGIC_CODE};
pub use session::{Session, SessionStats};

mod accumulator;
mod connection_table;
mod frame;
mod session;
