//! In-memory transport for tests: a closure plays the agent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use super::Transport;
use crate::error::{QgaError, QgaResult};

/// What the fake agent puts on the wire after a request.
#[derive(Debug, Clone)]
pub enum Delivery {
    Chunk(Vec<u8>),
    /// Nothing arrives before any deadline.
    Stall,
    /// Orderly close.
    Close,
}

impl Delivery {
    pub fn text(s: &str) -> Self {
        Self::Chunk(s.as_bytes().to_vec())
    }

    /// A full reply line for `value`.
    pub fn reply(value: &Value) -> Self {
        Self::text(&format!("{value}\n"))
    }
}

type Handler = Box<dyn FnMut(&Value) -> Vec<Delivery> + Send>;

pub struct ScriptedTransport {
    handler: Handler,
    pending: VecDeque<Delivery>,
    connected: bool,
    refuse_connect: bool,
    pub sent: Arc<Mutex<Vec<Value>>>,
    pub connects: Arc<Mutex<usize>>,
}

impl ScriptedTransport {
    pub fn new(handler: impl FnMut(&Value) -> Vec<Delivery> + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            pending: VecDeque::new(),
            connected: false,
            refuse_connect: false,
            sent: Arc::default(),
            connects: Arc::default(),
        }
    }

    /// Every request gets the same reply.
    pub fn replying(value: Value) -> Self {
        Self::new(move |_| vec![Delivery::reply(&value)])
    }

    pub fn refusing() -> Self {
        let mut transport = Self::new(|_| Vec::new());
        transport.refuse_connect = true;
        transport
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self) -> QgaResult<()> {
        if self.refuse_connect {
            return Err(QgaError::connection("Connection refused"));
        }
        if !self.connected {
            self.connected = true;
            *self.connects.lock().unwrap() += 1;
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn send(&mut self, bytes: &[u8]) -> QgaResult<()> {
        if !self.connected {
            return Err(QgaError::connection("Not connected to QGA socket"));
        }
        assert_eq!(bytes.last(), Some(&b'\n'), "request must end with a terminator");
        let request: Value = serde_json::from_slice(bytes).expect("request is valid JSON");
        self.pending.extend((self.handler)(&request));
        self.sent.lock().unwrap().push(request);
        Ok(())
    }

    fn receive_chunk(&mut self) -> QgaResult<Vec<u8>> {
        match self.pending.pop_front() {
            Some(Delivery::Chunk(bytes)) => Ok(bytes),
            Some(Delivery::Close) => Ok(Vec::new()),
            Some(Delivery::Stall) | None => Err(QgaError::connection("Timeout waiting for response")),
        }
    }

    fn poll_chunk(&mut self, _wait: Duration) -> QgaResult<Option<Vec<u8>>> {
        match self.pending.pop_front() {
            Some(Delivery::Chunk(bytes)) => Ok(Some(bytes)),
            Some(Delivery::Close) => Ok(Some(Vec::new())),
            Some(Delivery::Stall) | None => Ok(None),
        }
    }
}
