//! Guest operations that map one-to-one onto agent commands.
//!
//! Each method is a single `call` plus typed decoding of the `return`
//! payload. Binary payloads (passwords, file contents) travel base64
//! encoded and are converted here.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::AgentClient;
use crate::error::{QgaError, QgaResult};
use crate::transport::Transport;

/// Bytes requested per `guest-file-read`.
pub const FILE_READ_CHUNK: usize = 4096;

fn parse<D: DeserializeOwned>(command: &str, value: Value) -> QgaResult<D> {
    serde_json::from_value(value)
        .map_err(|e| QgaError::protocol(format!("unexpected {command} reply: {e}")))
}

/// Reply of `guest-info`. Unlike most agent replies its keys use underscores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub version: String,
    #[serde(default)]
    pub supported_commands: Vec<SupportedCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupportedCommand {
    pub name: String,
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub success_response: bool,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub pretty_name: Option<String>,
    pub version: Option<String>,
    pub version_id: Option<String>,
    pub kernel_version: Option<String>,
    pub kernel_release: Option<String>,
    pub machine: Option<String>,
    pub variant: Option<String>,
    pub variant_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct HostName {
    host_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestUser {
    pub user: String,
    /// Seconds since the epoch.
    pub login_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timezone {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Offset from UTC in seconds.
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpAddress {
    pub ip_address: String,
    /// `ipv4` or `ipv6`.
    pub ip_address_type: String,
    pub prefix: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FsInfo {
    pub name: String,
    pub mountpoint: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub disk: Vec<FsDisk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FsDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    pub bus_type: String,
}

#[derive(Deserialize)]
struct AuthorizedKeys {
    keys: Vec<AuthorizedKey>,
}

/// Agents list keys as plain strings; some builds wrap each in `{"key": ..}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum AuthorizedKey {
    Plain(String),
    Wrapped { key: String },
}

impl From<AuthorizedKey> for String {
    fn from(key: AuthorizedKey) -> Self {
        match key {
            AuthorizedKey::Plain(key) | AuthorizedKey::Wrapped { key } => key,
        }
    }
}

/// Handle of a file opened in the guest.
///
/// Not `Clone`: [`AgentClient::file_close`] consumes it, so a handle is
/// closed at most once and cannot be used afterwards.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct FileHandle(i64);

impl FileHandle {
    pub const fn id(&self) -> i64 {
        self.0
    }
}

/// One `guest-file-read` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileReadReply {
    #[serde(default)]
    buf_b64: Option<String>,
    #[serde(default)]
    eof: bool,
}

#[derive(Deserialize)]
struct FileWriteReply {
    count: u64,
}

/// How `guest-shutdown` takes the guest down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownMode {
    #[default]
    Powerdown,
    Reboot,
    Halt,
}

impl ShutdownMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Powerdown => "powerdown",
            Self::Reboot => "reboot",
            Self::Halt => "halt",
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T: Transport> AgentClient<T> {
    /// Agent version and the commands it supports.
    pub fn info(&mut self) -> QgaResult<AgentInfo> {
        let value = self.call("guest-info", None)?;
        parse("guest-info", value)
    }

    pub fn osinfo(&mut self) -> QgaResult<OsInfo> {
        let value = self.call("guest-get-osinfo", None)?;
        parse("guest-get-osinfo", value)
    }

    pub fn hostname(&mut self) -> QgaResult<String> {
        let value = self.call("guest-get-host-name", None)?;
        parse::<HostName>("guest-get-host-name", value).map(|h| h.host_name)
    }

    /// Users currently logged in to the guest.
    pub fn users(&mut self) -> QgaResult<Vec<GuestUser>> {
        let value = self.call("guest-get-users", None)?;
        parse("guest-get-users", value)
    }

    pub fn timezone(&mut self) -> QgaResult<Timezone> {
        let value = self.call("guest-get-timezone", None)?;
        parse("guest-get-timezone", value)
    }

    pub fn network_interfaces(&mut self) -> QgaResult<Vec<NetworkInterface>> {
        let value = self.call("guest-network-get-interfaces", None)?;
        parse("guest-network-get-interfaces", value)
    }

    pub fn fsinfo(&mut self) -> QgaResult<Vec<FsInfo>> {
        let value = self.call("guest-get-fsinfo", None)?;
        parse("guest-get-fsinfo", value)
    }

    /// Freeze all filesystems, or only `mountpoints` when given.
    /// Returns the number of filesystems frozen.
    pub fn fsfreeze(&mut self, mountpoints: Option<&[String]>) -> QgaResult<u64> {
        let value = match mountpoints {
            Some(mountpoints) if !mountpoints.is_empty() => self.call(
                "guest-fsfreeze-freeze-list",
                Some(json!({ "mountpoints": mountpoints })),
            )?,
            _ => self.call("guest-fsfreeze-freeze", None)?,
        };
        parse("guest-fsfreeze-freeze", value)
    }

    /// Returns the number of filesystems thawed.
    pub fn fsthaw(&mut self) -> QgaResult<u64> {
        let value = self.call("guest-fsfreeze-thaw", None)?;
        parse("guest-fsfreeze-thaw", value)
    }

    /// `frozen` or `thawed`.
    pub fn fsfreeze_status(&mut self) -> QgaResult<String> {
        let value = self.call("guest-fsfreeze-status", None)?;
        parse("guest-fsfreeze-status", value)
    }

    pub fn set_user_password(
        &mut self,
        username: &str,
        password: &str,
        crypted: bool,
    ) -> QgaResult<()> {
        self.call(
            "guest-set-user-password",
            Some(json!({
                "username": username,
                "password": BASE64.encode(password),
                "crypted": crypted,
            })),
        )?;
        info!(parent: self.span(), user = username, "Password changed");
        Ok(())
    }

    pub fn ssh_get_authorized_keys(&mut self, username: &str) -> QgaResult<Vec<String>> {
        let value = self.call(
            "guest-ssh-get-authorized-keys",
            Some(json!({ "username": username })),
        )?;
        parse::<AuthorizedKeys>("guest-ssh-get-authorized-keys", value)
            .map(|k| k.keys.into_iter().map(String::from).collect())
    }

    /// Add keys; with `reset` the given keys replace all existing ones.
    pub fn ssh_add_authorized_keys(
        &mut self,
        username: &str,
        keys: &[String],
        reset: bool,
    ) -> QgaResult<()> {
        self.call(
            "guest-ssh-add-authorized-keys",
            Some(json!({ "username": username, "keys": keys, "reset": reset })),
        )?;
        info!(parent: self.span(), user = username, count = keys.len(), "Added SSH keys");
        Ok(())
    }

    pub fn ssh_remove_authorized_keys(&mut self, username: &str, keys: &[String]) -> QgaResult<()> {
        self.call(
            "guest-ssh-remove-authorized-keys",
            Some(json!({ "username": username, "keys": keys })),
        )?;
        info!(parent: self.span(), user = username, count = keys.len(), "Removed SSH keys");
        Ok(())
    }

    /// Open `path` in the guest; `mode` is an fopen mode such as `r` or `w+`.
    pub fn file_open(&mut self, path: &str, mode: &str) -> QgaResult<FileHandle> {
        let value = self.call("guest-file-open", Some(json!({ "path": path, "mode": mode })))?;
        parse("guest-file-open", value).map(FileHandle)
    }

    pub fn file_read(&mut self, handle: &FileHandle, count: usize) -> QgaResult<FileChunk> {
        let value = self.call(
            "guest-file-read",
            Some(json!({ "handle": handle.0, "count": count })),
        )?;
        let reply: FileReadReply = parse("guest-file-read", value)?;
        let data = match reply.buf_b64 {
            Some(encoded) => BASE64.decode(encoded).map_err(|e| {
                QgaError::protocol(format!("guest-file-read returned invalid base64: {e}"))
            })?,
            None => Vec::new(),
        };
        Ok(FileChunk {
            data,
            eof: reply.eof,
        })
    }

    /// Returns the number of bytes the agent wrote.
    pub fn file_write(&mut self, handle: &FileHandle, data: &[u8]) -> QgaResult<u64> {
        let value = self.call(
            "guest-file-write",
            Some(json!({ "handle": handle.0, "buf-b64": BASE64.encode(data) })),
        )?;
        parse::<FileWriteReply>("guest-file-write", value).map(|w| w.count)
    }

    pub fn file_close(&mut self, handle: FileHandle) -> QgaResult<()> {
        self.call("guest-file-close", Some(json!({ "handle": handle.0 })))?;
        Ok(())
    }

    /// Read a whole guest file. The handle is closed on every path; a
    /// failed read is reported in preference to a failed close.
    pub fn read_file(&mut self, path: &str) -> QgaResult<Vec<u8>> {
        let handle = self.file_open(path, "r")?;
        let mut contents = Vec::new();
        let read = loop {
            match self.file_read(&handle, FILE_READ_CHUNK) {
                Ok(chunk) => {
                    let done = chunk.eof || chunk.data.is_empty();
                    contents.extend_from_slice(&chunk.data);
                    if done {
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.finish_file(handle, read).map(|()| contents)
    }

    /// Create or truncate a guest file and write `data` to it.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> QgaResult<u64> {
        let handle = self.file_open(path, "w")?;
        let written = self.file_write_all(&handle, data);
        match written {
            Ok(count) => self.finish_file(handle, Ok(())).map(|()| count),
            Err(e) => self.finish_file(handle, Err(e)).map(|()| 0),
        }
    }

    /// Keep writing until the agent has taken every byte.
    fn file_write_all(&mut self, handle: &FileHandle, data: &[u8]) -> QgaResult<u64> {
        let mut written = 0;
        while written < data.len() {
            let remaining = data.len() - written;
            let count = self.file_write(handle, &data[written..])?;
            let count = usize::try_from(count).map_or(remaining, |c| c.min(remaining));
            if count == 0 {
                return Err(QgaError::protocol(format!(
                    "guest-file-write made no progress with {remaining} bytes left"
                )));
            }
            written += count;
        }
        Ok(u64::try_from(written).unwrap_or(u64::MAX))
    }

    fn finish_file(&mut self, handle: FileHandle, transfer: QgaResult<()>) -> QgaResult<()> {
        let id = handle.0;
        let closed = self.file_close(handle);
        match (transfer, closed) {
            (Err(e), Err(close_err)) => {
                warn!(parent: self.span(), handle = id, error = %close_err, "Failed to close guest file");
                Err(e)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Ask the guest to power down, reboot or halt.
    ///
    /// The agent does not reply when the shutdown goes ahead.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> QgaResult<()> {
        self.call_unacknowledged("guest-shutdown", Some(json!({ "mode": mode.as_str() })))?;
        info!(parent: self.span(), %mode, "Initiated guest shutdown");
        Ok(())
    }
}
