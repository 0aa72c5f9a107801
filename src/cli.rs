//! Command-line front end.
//!
//! Parses arguments, runs one agent operation inside a connection session
//! and renders the result as text or JSON. Rendering is kept separate from
//! printing so handlers can be exercised without a terminal.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::client::AgentClient;
use crate::config::ClientConfig;
use crate::error::{ErrorKind, QgaError, QgaResult};
use crate::exec::ExecRequest;
use crate::guest::ShutdownMode;
use crate::transport::Transport;

/// Longest SSH key shown in full by `ssh-keys list`.
const KEY_DISPLAY_LEN: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "qga")]
#[command(about = "QEMU Guest Agent CLI")]
pub struct Args {
    /// Path to QGA Unix socket (default: /tmp/qga.sock)
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Socket timeout in seconds (default: 30)
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// JSON client configuration file (default: $QGA_CLIENT_CONFIG)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Test connectivity to guest agent
    Ping,
    /// Get guest agent information
    Info,
    /// Get operating system information
    Osinfo,
    /// Get guest hostname
    Hostname,
    /// Get logged-in users
    Users,
    /// Get guest timezone
    Timezone,
    /// Execute command in guest
    Exec {
        /// Show exit code
        #[arg(short = 'e', long)]
        show_exitcode: bool,
        /// Command and arguments to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
    /// Set user password
    SetPassword {
        username: String,
        password: String,
        /// Password is already crypted
        #[arg(long)]
        crypted: bool,
    },
    /// Get network interface information
    Network,
    /// Get filesystem information
    Fsinfo,
    /// Freeze guest filesystems
    Fsfreeze {
        /// Only freeze this mountpoint (repeatable)
        #[arg(long = "mountpoint")]
        mountpoints: Vec<String>,
    },
    /// Thaw guest filesystems
    Fsthaw,
    /// Get filesystem freeze status
    FsfreezeStatus,
    /// Manage SSH authorized keys
    SshKeys {
        action: SshAction,
        username: String,
        /// SSH public key (for add/remove)
        #[arg(long)]
        key: Option<String>,
        /// Reset all keys when adding (add only)
        #[arg(long)]
        reset: bool,
    },
    /// Read file from guest
    FileRead { path: String },
    /// Write file to guest
    FileWrite { path: String, content: String },
    /// Shut down or reboot the guest
    Shutdown {
        #[arg(long, value_enum, default_value_t = ModeArg::Powerdown)]
        mode: ModeArg,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SshAction {
    List,
    Add,
    Remove,
}

/// `--mode` values for `shutdown`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeArg {
    Powerdown,
    Reboot,
    Halt,
}

impl From<ModeArg> for ShutdownMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Powerdown => Self::Powerdown,
            ModeArg::Reboot => Self::Reboot,
            ModeArg::Halt => Self::Halt,
        }
    }
}

impl Args {
    /// Configuration file (or `QGA_CLIENT_CONFIG`), then `QGA_SOCKET` /
    /// `QGA_TIMEOUT`, then command-line flags.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)?,
            None => ClientConfig::from_env()?,
        };
        config.apply_env_overrides()?;
        if let Some(socket) = &self.socket {
            config.socket_path.clone_from(socket);
        }
        if let Some(timeout) = self.timeout {
            config.timeout_seconds = timeout;
        }
        config.validate()?;
        Ok(config)
    }
}

/// What a command prints and the process exit code.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Rendered {
    pub stdout: String,
    pub stderr: String,
    pub code: u8,
}

impl Rendered {
    fn text(lines: &[String]) -> Self {
        let mut stdout = lines.join("\n");
        stdout.push('\n');
        Self {
            stdout,
            ..Self::default()
        }
    }

    fn json<S: Serialize>(value: &S) -> QgaResult<Self> {
        let mut stdout = serde_json::to_string_pretty(value)
            .map_err(|e| QgaError::protocol(format!("failed to render JSON: {e}")))?;
        stdout.push('\n');
        Ok(Self {
            stdout,
            ..Self::default()
        })
    }

    fn usage_error(message: &str) -> Self {
        Self {
            stderr: format!("Error: {message}\n"),
            code: 1,
            ..Self::default()
        }
    }
}

/// Map a remote exit code onto a process exit status.
fn exit_status(exitcode: i64) -> u8 {
    if exitcode < 0 {
        1
    } else {
        u8::try_from(exitcode).unwrap_or(u8::MAX)
    }
}

fn or_na(value: Option<&String>) -> &str {
    value.map_or("N/A", String::as_str)
}

/// Run the parsed command against the agent and print its output.
pub fn run(args: &Args, config: &ClientConfig) -> ExitCode {
    let mut client = AgentClient::from_config(config);
    let result = client
        .session()
        .and_then(|mut session| execute(&mut *session, &args.command, args.json));

    match result {
        Ok(rendered) => {
            print!("{}", rendered.stdout);
            eprint!("{}", rendered.stderr);
            ExitCode::from(rendered.code)
        }
        Err(e) => {
            eprintln!("{}", describe_error(&e));
            ExitCode::FAILURE
        }
    }
}

pub fn describe_error(err: &QgaError) -> String {
    match err.kind() {
        ErrorKind::Connection => {
            format!("{err}\n\nIs the QEMU VM running with QGA enabled?")
        }
        ErrorKind::Protocol | ErrorKind::Timeout => err.to_string(),
    }
}

/// Run one command and render its result.
#[allow(clippy::too_many_lines)]
pub fn execute<T: Transport>(
    client: &mut AgentClient<T>,
    command: &Command,
    json: bool,
) -> QgaResult<Rendered> {
    match command {
        Command::Ping => {
            client.ping()?;
            Ok(Rendered::text(&["✓ Guest agent is responding".into()]))
        }
        Command::Info => {
            let info = client.info()?;
            if json {
                return Rendered::json(&info);
            }
            let mut lines = vec![
                format!("QGA Version: {}", info.version),
                String::new(),
                format!("Supported Commands ({}):", info.supported_commands.len()),
            ];
            lines.extend(info.supported_commands.iter().map(|cmd| {
                let status = if cmd.enabled { "✓" } else { "✗" };
                format!("  {status} {}", cmd.name)
            }));
            Ok(Rendered::text(&lines))
        }
        Command::Osinfo => {
            let os = client.osinfo()?;
            if json {
                return Rendered::json(&os);
            }
            Ok(Rendered::text(&[
                format!("OS Name: {}", or_na(os.name.as_ref())),
                format!("Version: {}", or_na(os.version.as_ref())),
                format!("Kernel Version: {}", or_na(os.kernel_version.as_ref())),
                format!("Kernel Release: {}", or_na(os.kernel_release.as_ref())),
                format!("Machine: {}", or_na(os.machine.as_ref())),
                format!("ID: {}", or_na(os.id.as_ref())),
            ]))
        }
        Command::Hostname => {
            let hostname = client.hostname()?;
            if json {
                return Rendered::json(&hostname);
            }
            Ok(Rendered::text(&[hostname]))
        }
        Command::Users => {
            let users = client.users()?;
            if json {
                return Rendered::json(&users);
            }
            if users.is_empty() {
                return Ok(Rendered::text(&["No users currently logged in".into()]));
            }
            let mut lines = vec![format!("Logged-in Users ({}):", users.len())];
            lines.extend(
                users
                    .iter()
                    .map(|u| format!("  - {} (login time: {})", u.user, u.login_time)),
            );
            Ok(Rendered::text(&lines))
        }
        Command::Timezone => {
            let tz = client.timezone()?;
            if json {
                return Rendered::json(&tz);
            }
            Ok(Rendered::text(&[
                format!("Timezone: {}", or_na(tz.zone.as_ref())),
                format!("Offset: {} seconds", tz.offset),
            ]))
        }
        Command::Exec { show_exitcode, cmd } => {
            let output = client.run_command(&ExecRequest::new(cmd.iter().cloned()))?;
            let code = exit_status(output.exitcode);
            if json {
                return Rendered::json(&output).map(|r| Rendered { code, ..r });
            }
            let mut stdout = output.stdout;
            if *show_exitcode {
                stdout.push_str(&format!("\nExit code: {}\n", output.exitcode));
            }
            Ok(Rendered {
                stdout,
                stderr: output.stderr,
                code,
            })
        }
        Command::SetPassword {
            username,
            password,
            crypted,
        } => {
            client.set_user_password(username, password, *crypted)?;
            Ok(Rendered::text(&[format!(
                "✓ Password updated for user: {username}"
            )]))
        }
        Command::Network => {
            let interfaces = client.network_interfaces()?;
            if json {
                return Rendered::json(&interfaces);
            }
            let mut lines = vec![format!("Network Interfaces ({}):", interfaces.len())];
            for iface in &interfaces {
                lines.push(String::new());
                lines.push(format!("  {}:", iface.name));
                lines.push(format!(
                    "    Hardware Address: {}",
                    or_na(iface.hardware_address.as_ref())
                ));
                if !iface.ip_addresses.is_empty() {
                    lines.push("    IP Addresses:".into());
                    lines.extend(iface.ip_addresses.iter().map(|ip| {
                        format!("      - {} ({})", ip.ip_address, ip.ip_address_type)
                    }));
                }
            }
            Ok(Rendered::text(&lines))
        }
        Command::Fsinfo => {
            let filesystems = client.fsinfo()?;
            if json {
                return Rendered::json(&filesystems);
            }
            let mut lines = vec![format!("Filesystems ({}):", filesystems.len())];
            for fs in &filesystems {
                let disks: Vec<&str> = fs.disk.iter().map(|d| or_na(d.dev.as_ref())).collect();
                lines.push(String::new());
                lines.push(format!("  {}:", fs.mountpoint));
                lines.push(format!("    Type: {}", fs.fs_type));
                lines.push(format!("    Disk: {}", disks.join(", ")));
            }
            Ok(Rendered::text(&lines))
        }
        Command::Fsfreeze { mountpoints } => {
            let count = client.fsfreeze(Some(mountpoints.as_slice()))?;
            if json {
                return Rendered::json(&count);
            }
            Ok(Rendered::text(&[format!("✓ Froze {count} filesystem(s)")]))
        }
        Command::Fsthaw => {
            let count = client.fsthaw()?;
            if json {
                return Rendered::json(&count);
            }
            Ok(Rendered::text(&[format!("✓ Thawed {count} filesystem(s)")]))
        }
        Command::FsfreezeStatus => {
            let status = client.fsfreeze_status()?;
            if json {
                return Rendered::json(&status);
            }
            Ok(Rendered::text(&[status]))
        }
        Command::SshKeys {
            action,
            username,
            key,
            reset,
        } => ssh_keys(client, *action, username, key.as_deref(), *reset, json),
        Command::FileRead { path } => {
            let contents = client.read_file(path)?;
            let text = String::from_utf8_lossy(&contents).into_owned();
            if json {
                return Rendered::json(&text);
            }
            Ok(Rendered {
                stdout: text,
                ..Rendered::default()
            })
        }
        Command::FileWrite { path, content } => {
            let written = client.write_file(path, content.as_bytes())?;
            Ok(Rendered::text(&[format!("✓ Wrote {written} bytes to {path}")]))
        }
        Command::Shutdown { mode } => {
            let mode = ShutdownMode::from(*mode);
            client.shutdown(mode)?;
            Ok(Rendered::text(&[format!("✓ Initiated guest {mode}")]))
        }
    }
}

fn ssh_keys<T: Transport>(
    client: &mut AgentClient<T>,
    action: SshAction,
    username: &str,
    key: Option<&str>,
    reset: bool,
    json: bool,
) -> QgaResult<Rendered> {
    match (action, key) {
        (SshAction::List, _) => {
            let keys = client.ssh_get_authorized_keys(username)?;
            if json {
                return Rendered::json(&keys);
            }
            let mut lines = vec![format!("SSH Keys for {username} ({}):", keys.len())];
            lines.extend(keys.iter().enumerate().map(|(i, key)| {
                if key.chars().count() > KEY_DISPLAY_LEN {
                    let short: String = key.chars().take(KEY_DISPLAY_LEN).collect();
                    format!("{}. {short}...", i + 1)
                } else {
                    format!("{}. {key}", i + 1)
                }
            }));
            Ok(Rendered::text(&lines))
        }
        (SshAction::Add, Some(key)) => {
            client.ssh_add_authorized_keys(username, &[key.to_owned()], reset)?;
            Ok(Rendered::text(&[format!("✓ Added SSH key for user: {username}")]))
        }
        (SshAction::Remove, Some(key)) => {
            client.ssh_remove_authorized_keys(username, &[key.to_owned()])?;
            Ok(Rendered::text(&[format!("✓ Removed SSH key for user: {username}")]))
        }
        (SshAction::Add, None) => Ok(Rendered::usage_error("--key required for add action")),
        (SshAction::Remove, None) => Ok(Rendered::usage_error("--key required for remove action")),
    }
}
