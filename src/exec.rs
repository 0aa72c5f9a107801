//! Remote command execution: launch, poll, collect.
//!
//! `guest-exec` only starts a process and hands back its pid. The poller
//! turns that into a synchronous run by querying `guest-exec-status` until
//! the process has exited or the poll budget is spent, then decodes the
//! base64 stdout/stderr the agent captured.

use std::thread;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn, Span};

use crate::client::AgentClient;
use crate::config::PollConfig;
use crate::error::{QgaError, QgaResult};
use crate::transport::Transport;

/// A command to run in the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program path followed by its arguments.
    pub argv: Vec<String>,
    /// Bytes fed to the program's stdin.
    pub input: Option<Vec<u8>>,
    /// `KEY=VALUE` entries for the program's environment.
    pub env: Option<Vec<String>>,
    /// Ask the agent to capture stdout/stderr.
    pub capture_output: bool,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            input: None,
            env: None,
            capture_output: true,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = Some(env);
        self
    }

    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    fn to_arguments(&self) -> QgaResult<Value> {
        let (path, args) = self
            .argv
            .split_first()
            .ok_or_else(|| QgaError::protocol("empty command"))?;

        let launch = LaunchArgs {
            path,
            arg: args,
            input_data: self
                .input
                .as_deref()
                .filter(|bytes| !bytes.is_empty())
                .map(|bytes| BASE64.encode(bytes)),
            env: self.env.as_deref(),
            capture_output: self.capture_output,
        };
        serde_json::to_value(&launch)
            .map_err(|e| QgaError::protocol(format!("failed to encode guest-exec arguments: {e}")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct LaunchArgs<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    arg: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    input_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a [String]>,
    capture_output: bool,
}

#[derive(Deserialize)]
struct Launched {
    pid: i64,
}

/// Pid of a process started by `guest-exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecHandle(pub i64);

/// Reply of `guest-exec-status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecStatus {
    #[serde(default)]
    pub exited: bool,
    #[serde(default)]
    pub exitcode: Option<i64>,
    #[serde(default)]
    pub signal: Option<i64>,
    /// Base64 stdout.
    #[serde(default)]
    pub out_data: Option<String>,
    /// Base64 stderr.
    #[serde(default)]
    pub err_data: Option<String>,
    #[serde(default)]
    pub out_truncated: bool,
    #[serde(default)]
    pub err_truncated: bool,
}

/// Outcome of a command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    /// Exit code, or -1 when the agent did not report one.
    pub exitcode: i64,
    pub stdout: String,
    pub stderr: String,
    pub exited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i64>,
}

/// Where a run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Idle,
    Launching,
    Running(ExecHandle),
    Exited,
    TimedOut,
    Failed,
}

/// Drives one remote command through launch, polling and collection.
///
/// Holds the client mutably for its whole lifetime, so nothing else can
/// use the connection between polls.
pub struct ExecPoller<'c, T: Transport> {
    client: &'c mut AgentClient<T>,
    config: PollConfig,
    state: ExecState,
    span: Span,
}

impl<'c, T: Transport> ExecPoller<'c, T> {
    pub fn new(client: &'c mut AgentClient<T>) -> Self {
        let config = client.poll_config();
        let span = client.span().clone();
        Self {
            client,
            config,
            state: ExecState::Idle,
            span,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PollConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub const fn state(&self) -> ExecState {
        self.state
    }

    /// Start `request` in the guest and return its pid.
    pub fn launch(&mut self, request: &ExecRequest) -> QgaResult<ExecHandle> {
        self.state = ExecState::Launching;
        let result = request
            .to_arguments()
            .and_then(|arguments| self.client.call("guest-exec", Some(arguments)))
            .and_then(|reply| {
                serde_json::from_value::<Launched>(reply).map_err(|e| {
                    QgaError::protocol(format!("guest-exec reply carries no pid: {e}"))
                })
            });

        match result {
            Ok(launched) => {
                let handle = ExecHandle(launched.pid);
                self.state = ExecState::Running(handle);
                Ok(handle)
            }
            Err(e) => {
                self.state = ExecState::Failed;
                Err(e)
            }
        }
    }

    /// Query the status of a launched process once.
    pub fn poll_once(&mut self, handle: ExecHandle) -> QgaResult<ExecStatus> {
        let result = self
            .client
            .call("guest-exec-status", Some(json!({ "pid": handle.0 })))
            .and_then(|reply| {
                serde_json::from_value::<ExecStatus>(reply).map_err(|e| {
                    QgaError::protocol(format!("invalid guest-exec-status reply: {e}"))
                })
            });
        if result.is_err() {
            self.state = ExecState::Failed;
        }
        result
    }

    /// Launch `request` and poll until it exits or the budget runs out.
    pub fn run_to_completion(&mut self, request: &ExecRequest) -> QgaResult<ExecOutput> {
        let handle = self.launch(request)?;
        info!(
            parent: &self.span,
            command = %request.argv.join(" "),
            pid = handle.0,
            "Executing command"
        );

        let mut attempts: u32 = 0;
        while attempts < self.config.max_polls {
            if attempts > 0 {
                thread::sleep(self.config.interval);
            }
            let status = self.poll_once(handle)?;
            attempts += 1;

            if status.exited {
                self.state = ExecState::Exited;
                let output = self.collect(status);
                info!(
                    parent: &self.span,
                    pid = handle.0,
                    exitcode = output.exitcode,
                    polls = attempts,
                    "Command completed"
                );
                return Ok(output);
            }
            debug!(parent: &self.span, pid = handle.0, attempt = attempts, "Command still running");
        }

        self.state = ExecState::TimedOut;
        let waited = self.config.interval.saturating_mul(attempts);
        Err(QgaError::timeout(format!(
            "Command execution timeout after {} seconds ({attempts} polls, pid {})",
            waited.as_secs_f64(),
            handle.0
        )))
    }

    fn collect(&self, status: ExecStatus) -> ExecOutput {
        if status.out_truncated || status.err_truncated {
            warn!(
                parent: &self.span,
                stdout = status.out_truncated,
                stderr = status.err_truncated,
                "Agent truncated captured output"
            );
        }
        ExecOutput {
            exitcode: status.exitcode.unwrap_or(-1),
            stdout: self.decode_output(status.out_data.as_deref(), "stdout"),
            stderr: self.decode_output(status.err_data.as_deref(), "stderr"),
            exited: true,
            signal: status.signal,
        }
    }

    /// Garbled output degrades to an empty string so the exit code survives.
    fn decode_output(&self, data: Option<&str>, stream: &'static str) -> String {
        let Some(data) = data else {
            return String::new();
        };
        let decoded = BASE64
            .decode(data)
            .map_err(|e| e.to_string())
            .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()));
        match decoded {
            Ok(text) => text,
            Err(error) => {
                warn!(parent: &self.span, stream, %error, "Failed to decode output");
                String::new()
            }
        }
    }
}

impl<T: Transport> AgentClient<T> {
    /// Start a command without waiting for it.
    pub fn exec(&mut self, request: &ExecRequest) -> QgaResult<ExecHandle> {
        ExecPoller::new(self).launch(request)
    }

    pub fn exec_status(&mut self, handle: ExecHandle) -> QgaResult<ExecStatus> {
        ExecPoller::new(self).poll_once(handle)
    }

    /// Run a command to completion with this client's poll settings.
    pub fn run_command(&mut self, request: &ExecRequest) -> QgaResult<ExecOutput> {
        ExecPoller::new(self).run_to_completion(request)
    }
}
