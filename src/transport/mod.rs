//! Transport layer for client ↔ guest agent communication.
//!
//! Provides the `Transport` trait (a raw byte channel), the JSON framing in
//! [`codec`], and the message types in [`protocol`].
//! `UnixSocketTransport` talks to the agent socket QEMU exposes on the host.

pub mod codec;
pub mod protocol;
#[cfg(test)]
pub(crate) mod scripted;
pub mod unix_socket;

pub use codec::{Frame, FrameBuffer};
pub use protocol::{Reply, Request};
pub use unix_socket::UnixSocketTransport;

use std::time::Duration;

use crate::error::QgaResult;

/// Abstraction over the byte channel to the agent.
///
/// Blocking, one exchange at a time. Implementations own at most one live
/// connection.
pub trait Transport: Send {
    /// Open the channel. A no-op when already connected.
    fn connect(&mut self) -> QgaResult<()>;

    /// Release the channel. Never fails, and does nothing when not connected.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Write all of `bytes` within the configured deadline.
    fn send(&mut self, bytes: &[u8]) -> QgaResult<()>;

    /// Read one chunk. An empty chunk means the peer closed the stream;
    /// deadline expiry is an error.
    fn receive_chunk(&mut self) -> QgaResult<Vec<u8>>;

    /// Read one chunk, waiting at most `wait`. `None` means nothing arrived
    /// in time; the regular deadline applies again afterwards.
    fn poll_chunk(&mut self, wait: Duration) -> QgaResult<Option<Vec<u8>>>;
}
