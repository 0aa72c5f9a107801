//! Agent protocol message types.
//!
//! One JSON document per message, no length prefix:
//! `{"execute": <command>, "arguments": {..}}` out,
//! `{"return": <value>}` or `{"error": {"class": .., "desc": ..}}` back.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{QgaError, QgaResult};

/// Byte that ends every request on the wire.
pub const TERMINATOR: u8 = b'\n';

/// A command addressed to the agent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Map<String, Value>>,
}

impl Request {
    /// Build a request. `arguments` must be a JSON object; an empty object
    /// is left off the wire, same as `None`.
    pub fn new(command: impl Into<String>, arguments: Option<Value>) -> QgaResult<Self> {
        let command = command.into();
        let arguments = match arguments {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) if map.is_empty() => None,
            Some(Value::Object(map)) => Some(map),
            Some(other) => {
                return Err(QgaError::protocol(format!(
                    "arguments for {command} must be a JSON object, got {other}"
                )))
            }
        };
        Ok(Self {
            execute: command,
            arguments,
        })
    }

    pub fn command(&self) -> &str {
        &self.execute
    }

    pub const fn arguments(&self) -> Option<&Map<String, Value>> {
        self.arguments.as_ref()
    }
}

/// A decoded reply: exactly one of `return` or `error` was present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(Value),
    Failure {
        /// QMP error class, e.g. `GenericError`.
        class: Option<String>,
        desc: String,
    },
}
