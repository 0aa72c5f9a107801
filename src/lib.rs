//! QEMU Guest Agent client library
//!
//! This crate talks to a QEMU Guest Agent over its host-side Unix socket:
//! - Newline-delimited JSON request/reply framing over a blocking stream
//! - Command dispatch with agent errors surfaced as typed failures
//! - Guest process execution with bounded status polling
//! - Typed wrappers for the common `guest-*` commands

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod guest;
pub mod transport;

pub use client::{AgentClient, ConnectPolicy, Session};
pub use config::{ClientConfig, PollConfig};
pub use error::{ErrorKind, QgaError, QgaResult};
pub use exec::{ExecOutput, ExecPoller, ExecRequest};
