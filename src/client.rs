//! Request/reply dispatch to the guest agent.
//!
//! `AgentClient` owns one transport and runs exactly one request/reply
//! exchange at a time: encode, send, read until the codec reports a
//! complete or malformed reply, classify. It never retries.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info_span, warn, Span};

use crate::config::{ClientConfig, PollConfig};
use crate::error::{QgaError, QgaResult};
use crate::transport::codec::{self, Frame, FrameBuffer};
use crate::transport::{Reply, Request, Transport, UnixSocketTransport};

/// When the client opens its connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectPolicy {
    /// Connect on the first call if not connected yet.
    #[default]
    Lazy,
    /// Calls fail unless `connect()` (or `session()`) was used first.
    Explicit,
}

/// Client for one guest agent connection.
pub struct AgentClient<T: Transport> {
    transport: T,
    policy: ConnectPolicy,
    settle_timeout: Duration,
    poll: PollConfig,
    span: Span,
}

impl AgentClient<UnixSocketTransport> {
    /// Client for the socket named in `config`, logging under a `qga` span.
    pub fn from_config(config: &ClientConfig) -> Self {
        let span = info_span!("qga", socket = %config.socket_path.display());
        let transport = UnixSocketTransport::from_config(config).with_span(span.clone());
        Self::new(transport)
            .with_settle_timeout(config.settle_timeout())
            .with_poll_config(PollConfig::from_config(config))
            .with_span(span)
    }
}

impl<T: Transport> AgentClient<T> {
    pub fn new(transport: T) -> Self {
        let defaults = ClientConfig::default();
        Self {
            transport,
            policy: ConnectPolicy::default(),
            settle_timeout: defaults.settle_timeout(),
            poll: PollConfig::from_config(&defaults),
            span: Span::none(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ConnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long to wait for more bytes once a reply looks terminated.
    #[must_use]
    pub fn with_settle_timeout(mut self, settle_timeout: Duration) -> Self {
        self.settle_timeout = settle_timeout;
        self
    }

    #[must_use]
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Emit this client's events under `span`.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub const fn poll_config(&self) -> PollConfig {
        self.poll
    }

    pub(crate) const fn span(&self) -> &Span {
        &self.span
    }

    pub fn connect(&mut self) -> QgaResult<()> {
        self.transport.connect()
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Connect and return a guard that disconnects when dropped, whichever
    /// way the scope is left.
    pub fn session(&mut self) -> QgaResult<Session<'_, T>> {
        self.connect()?;
        Ok(Session { client: self })
    }

    fn ensure_connected(&mut self) -> QgaResult<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        match self.policy {
            ConnectPolicy::Lazy => self.transport.connect(),
            ConnectPolicy::Explicit => Err(QgaError::connection("Not connected to QGA socket")),
        }
    }

    /// Run `command` and return the agent's `return` payload.
    pub fn call(&mut self, command: &str, arguments: Option<Value>) -> QgaResult<Value> {
        let request = Request::new(command, arguments)?;
        self.dispatch(&request)
    }

    /// Send one prepared request and wait for its reply.
    pub fn dispatch(&mut self, request: &Request) -> QgaResult<Value> {
        self.send_request(request)?;

        // A failed exchange leaves the stream out of step with the agent;
        // the next call starts over on a fresh connection.
        let value = match self.read_reply(FrameBuffer::new()) {
            Ok(value) => value,
            Err(e) => {
                self.transport.disconnect();
                return Err(e);
            }
        };
        self.classify(request, value)
    }

    /// Send a command the agent may not answer because it takes the guest
    /// (and itself) down. Silence or a hang-up once the request is out
    /// counts as success; an error reply is still reported.
    pub fn call_unacknowledged(&mut self, command: &str, arguments: Option<Value>) -> QgaResult<()> {
        let request = Request::new(command, arguments)?;
        self.send_request(&request)?;

        let chunk = match self.transport.poll_chunk(self.settle_timeout) {
            Ok(Some(chunk)) if !chunk.is_empty() => chunk,
            Ok(_) | Err(_) => {
                debug!(parent: &self.span, command, "No reply, agent went away");
                self.transport.disconnect();
                return Ok(());
            }
        };

        let mut buffer = FrameBuffer::new();
        let value = match buffer.accumulate(&chunk) {
            Frame::Complete(value) => Ok(value),
            Frame::Incomplete => self.read_reply(buffer),
            Frame::Malformed(e) => Err(buffer.malformed(&e)),
        };
        match value {
            Ok(value) => self.classify(&request, value).map(drop),
            Err(e) => {
                self.transport.disconnect();
                Err(e)
            }
        }
    }

    fn send_request(&mut self, request: &Request) -> QgaResult<()> {
        self.ensure_connected()?;
        let bytes = codec::encode(request)?;
        debug!(parent: &self.span, command = request.command(), "Sending command");
        if let Err(e) = self.transport.send(&bytes) {
            self.transport.disconnect();
            return Err(e);
        }
        Ok(())
    }

    /// Read until `buffer` holds a complete reply.
    fn read_reply(&mut self, mut buffer: FrameBuffer) -> QgaResult<Value> {
        loop {
            let chunk = if buffer.looks_terminated() {
                // Agents do not always flush a trailing newline; if nothing
                // follows shortly, what we have is the whole reply.
                match self.transport.poll_chunk(self.settle_timeout)? {
                    Some(chunk) => chunk,
                    None => {
                        debug!(parent: &self.span, len = buffer.len(), "Reply settled");
                        return buffer.finish();
                    }
                }
            } else {
                self.transport.receive_chunk()?
            };

            if chunk.is_empty() {
                if buffer.is_empty() {
                    return Err(QgaError::connection(
                        "Agent closed the connection before replying",
                    ));
                }
                return buffer.finish();
            }

            match buffer.accumulate(&chunk) {
                Frame::Complete(value) => {
                    debug!(parent: &self.span, reply = %value, "Received response");
                    return Ok(value);
                }
                Frame::Incomplete => {}
                Frame::Malformed(e) => return Err(buffer.malformed(&e)),
            }
        }
    }

    fn classify(&self, request: &Request, value: Value) -> QgaResult<Value> {
        match codec::decode(value)? {
            Reply::Success(value) => Ok(value),
            Reply::Failure { class, desc } => {
                warn!(
                    parent: &self.span,
                    command = request.command(),
                    class = class.as_deref().unwrap_or("unknown"),
                    desc = %desc,
                    "Agent returned an error"
                );
                Err(QgaError::protocol(format!("{}: {desc}", request.command())))
            }
        }
    }

    /// Check that the agent answers `guest-ping`.
    pub fn ping(&mut self) -> QgaResult<bool> {
        self.call("guest-ping", None)?;
        Ok(true)
    }
}

impl<T: Transport> Drop for AgentClient<T> {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

/// A connected client that disconnects when it goes out of scope.
pub struct Session<'a, T: Transport> {
    client: &'a mut AgentClient<T>,
}

impl<T: Transport> Deref for Session<'_, T> {
    type Target = AgentClient<T>;

    fn deref(&self) -> &Self::Target {
        self.client
    }
}

impl<T: Transport> DerefMut for Session<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client
    }
}

impl<T: Transport> Drop for Session<'_, T> {
    fn drop(&mut self) {
        self.client.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::scripted::{Delivery, ScriptedTransport};
    use serde_json::json;

    #[test]
    fn ping_succeeds_on_empty_return() {
        let transport = ScriptedTransport::replying(json!({"return": {}}));
        let sent = transport.sent.clone();
        let mut client = AgentClient::new(transport);

        assert_eq!(client.call("guest-ping", Some(json!({}))).unwrap(), json!({}));
        assert!(client.ping().unwrap());
        assert_eq!(sent.lock().unwrap()[0], json!({"execute": "guest-ping"}));
    }

    #[test]
    fn agent_error_becomes_protocol_error() {
        let transport =
            ScriptedTransport::replying(json!({"error": {"class": "GenericError", "desc": "command not found"}}));
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-bogus", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("command not found"));
        // The stream is still in step, so the connection stays up.
        assert!(client.is_connected());
    }

    #[test]
    fn both_keys_is_protocol_error() {
        let transport =
            ScriptedTransport::replying(json!({"return": {}, "error": {"desc": "x"}}));
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-ping", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn chunked_reply_matches_whole_reply() {
        let wire = "{\"return\": {\"host-name\": \"vm-01\"}}\n";
        for split in 1..wire.len() {
            let (head, tail) = wire.split_at(split);
            let (head, tail) = (head.to_owned(), tail.to_owned());
            let transport = ScriptedTransport::new(move |_| {
                vec![Delivery::text(&head), Delivery::text(&tail)]
            });
            let mut client = AgentClient::new(transport);

            let value = client.call("guest-get-host-name", None).unwrap();
            assert_eq!(value, json!({"host-name": "vm-01"}), "split at {split}");
        }
    }

    #[test]
    fn reply_split_after_inner_brace() {
        let transport = ScriptedTransport::new(|_| {
            vec![Delivery::text("{\"return\": {}"), Delivery::text("}"), Delivery::Stall]
        });
        let mut client = AgentClient::new(transport);
        assert_eq!(client.call("guest-ping", None).unwrap(), json!({}));
    }

    #[test]
    fn truncated_reply_is_protocol_error_and_disconnects() {
        // Looks terminated (ends with a brace) but the agent goes quiet.
        let transport = ScriptedTransport::new(|_| {
            vec![Delivery::text("{\"return\": {\"a\": {}"), Delivery::Stall]
        });
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-info", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("{\"return\": {\"a\": {}"));
        assert!(!client.is_connected());
    }

    #[test]
    fn garbage_reply_is_protocol_error() {
        let transport = ScriptedTransport::new(|_| vec![Delivery::text("<html>\n")]);
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-ping", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("<html>"));
    }

    #[test]
    fn close_before_reply_is_connection_error() {
        let transport = ScriptedTransport::new(|_| vec![Delivery::Close]);
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-ping", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(!client.is_connected());
    }

    #[test]
    fn close_mid_reply_is_protocol_error_and_disconnects() {
        let transport =
            ScriptedTransport::new(|_| vec![Delivery::text("{\"return\": {"), Delivery::Close]);
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-info", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("incomplete reply"));
        assert!(!client.is_connected());
    }

    #[test]
    fn close_during_settle_read_finishes_buffer() {
        // Ends in a brace, so the close is picked up by the settle read.
        let transport =
            ScriptedTransport::new(|_| vec![Delivery::text("{\"return\": {}"), Delivery::Close]);
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-ping", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(err.to_string().contains("incomplete reply"));
        assert!(!client.is_connected());
    }

    #[test]
    fn close_after_complete_reply_is_not_an_error() {
        let transport =
            ScriptedTransport::new(|_| vec![Delivery::text("{\"return\": {}}"), Delivery::Close]);
        let mut client = AgentClient::new(transport);

        assert_eq!(client.call("guest-ping", None).unwrap(), json!({}));
    }

    #[test]
    fn stall_is_connection_error_and_next_call_reconnects() {
        let mut first = true;
        let transport = ScriptedTransport::new(move |_| {
            if std::mem::take(&mut first) {
                vec![Delivery::Stall]
            } else {
                vec![Delivery::reply(&json!({"return": {}}))]
            }
        });
        let connects = transport.connects.clone();
        let mut client = AgentClient::new(transport);

        let err = client.call("guest-ping", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(client.ping().unwrap());
        assert_eq!(*connects.lock().unwrap(), 2);
    }

    #[test]
    fn refused_connection_is_connection_error() {
        let mut client = AgentClient::new(ScriptedTransport::refusing());
        let err = client.ping().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[test]
    fn explicit_policy_requires_connect() {
        let transport = ScriptedTransport::replying(json!({"return": {}}));
        let mut client = AgentClient::new(transport).with_policy(ConnectPolicy::Explicit);

        let err = client.ping().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        client.connect().unwrap();
        assert!(client.ping().unwrap());
    }

    #[test]
    fn session_disconnects_on_every_exit() {
        let transport = ScriptedTransport::replying(json!({"error": {"desc": "nope"}}));
        let mut client = AgentClient::new(transport);

        let result = (|| -> QgaResult<bool> {
            let mut session = client.session()?;
            assert!(session.is_connected());
            session.ping()
        })();
        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut client = AgentClient::new(ScriptedTransport::replying(json!({"return": {}})));
        client.disconnect();
        client.disconnect();
        client.connect().unwrap();
        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
    }
}
