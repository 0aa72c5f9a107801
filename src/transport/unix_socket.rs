//! Unix socket transport to the guest agent.
//!
//! QEMU exposes the agent's virtio-serial port as a host-side Unix stream
//! socket. This transport owns at most one connection to it, applies the
//! configured deadline to every read and write, and closes the stream on
//! disconnect or drop.

use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, Span};

use super::Transport;
use crate::config::ClientConfig;
use crate::error::{QgaError, QgaResult};

/// Blocking transport over a Unix stream socket.
#[derive(Debug)]
pub struct UnixSocketTransport {
    path: PathBuf,
    timeout: Duration,
    recv_buffer_size: usize,
    stream: Option<UnixStream>,
    span: Span,
}

impl UnixSocketTransport {
    /// `timeout` bounds every single read and write and must be non-zero.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration, recv_buffer_size: usize) -> Self {
        Self {
            path: path.into(),
            timeout,
            recv_buffer_size: recv_buffer_size.max(1),
            stream: None,
            span: Span::none(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            &config.socket_path,
            config.io_timeout(),
            config.recv_buffer_size,
        )
    }

    /// Emit this transport's events under `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stream(&mut self) -> QgaResult<&mut UnixStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| QgaError::connection("Not connected to QGA socket"))
    }

    fn read_once(stream: &mut UnixStream, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

impl Transport for UnixSocketTransport {
    fn connect(&mut self) -> QgaResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.path).map_err(|e| {
            QgaError::io(
                format!("Failed to connect to {}: {e}", self.path.display()),
                e,
            )
        })?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| QgaError::io(format!("Failed to set socket timeout: {e}"), e))?;

        info!(parent: &self.span, socket = %self.path.display(), "Connected to QGA");
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone; closing is all that matters here.
            let _ = stream.shutdown(Shutdown::Both);
            info!(parent: &self.span, "Disconnected from QGA");
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn send(&mut self, bytes: &[u8]) -> QgaResult<()> {
        let stream = self.stream()?;
        // write_all retries short writes and EINTR; each write is bounded by the deadline.
        stream
            .write_all(bytes)
            .and_then(|()| stream.flush())
            .map_err(|e| {
                if is_timeout(&e) {
                    QgaError::io("Timeout sending command", e)
                } else {
                    QgaError::io(format!("Failed to send command: {e}"), e)
                }
            })?;
        debug!(parent: &self.span, len = bytes.len(), "Sent request bytes");
        Ok(())
    }

    fn receive_chunk(&mut self) -> QgaResult<Vec<u8>> {
        let mut buf = vec![0u8; self.recv_buffer_size];
        let stream = self.stream()?;
        let n = Self::read_once(stream, &mut buf).map_err(|e| {
            if is_timeout(&e) {
                QgaError::io("Timeout waiting for response", e)
            } else {
                QgaError::io(format!("Failed to receive response: {e}"), e)
            }
        })?;
        buf.truncate(n);
        debug!(parent: &self.span, len = n, "Received chunk");
        Ok(buf)
    }

    fn poll_chunk(&mut self, wait: Duration) -> QgaResult<Option<Vec<u8>>> {
        let timeout = self.timeout;
        let mut buf = vec![0u8; self.recv_buffer_size];
        let stream = self.stream()?;

        stream
            .set_read_timeout(Some(wait.max(Duration::from_millis(1))))
            .map_err(|e| QgaError::io(format!("Failed to set socket timeout: {e}"), e))?;
        let read = Self::read_once(stream, &mut buf);
        let restored = stream.set_read_timeout(Some(timeout));

        let chunk = match read {
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
            Err(e) if is_timeout(&e) => None,
            Err(e) => {
                return Err(QgaError::io(format!("Failed to receive response: {e}"), e));
            }
        };
        restored.map_err(|e| QgaError::io(format!("Failed to restore socket timeout: {e}"), e))?;
        Ok(chunk)
    }
}

impl Drop for UnixSocketTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}
