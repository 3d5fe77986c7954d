//! Endpoint directories and their JSON descriptors.
//!
//! An endpoint is a filesystem directory holding the rendezvous FIFO
//! (`request`), the optional command FIFO (`control`), the JSON descriptor
//! (`info`), and one data FIFO per attached client. Bare endpoint names are
//! expanded under [`DEFAULT_BASE_DIR`]; absolute paths override the base.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::errors::{PipeError, Result};

/// Base directory for endpoints addressed by bare name.
///
/// Usually memory-backed, so endpoints do not survive a reboot. Callers that
/// need a different base pass an absolute location instead of a bare name.
pub const DEFAULT_BASE_DIR: &str = "/run/mpa/";

/// Longest allowed endpoint directory path, trailing slash included.
pub const MAX_DIR_LEN: usize = 64;

/// Longest allowed endpoint or client name.
pub const MAX_NAME_LEN: usize = 32;

/// Default per-client kernel FIFO capacity in bytes.
pub const DEFAULT_PIPE_SIZE: u32 = 1024 * 1024;

/// Name of the rendezvous FIFO inside an endpoint directory.
pub(crate) const REQUEST_NAME: &str = "request";
/// Name of the command FIFO inside an endpoint directory.
pub(crate) const CONTROL_NAME: &str = "control";
/// Name of the JSON descriptor inside an endpoint directory.
pub(crate) const INFO_NAME: &str = "info";

/// Expand a short endpoint name to a canonical directory path ending in `/`.
///
/// Accepts a bare name (`imu0`), a bare name with trailing slash, or an
/// absolute path. Anything longer than [`MAX_DIR_LEN`] fails.
pub fn expand_location(name: &str) -> Result<String> {
    if name.is_empty() {
        return Err(PipeError::InvalidArg);
    }
    let mut dir = if name.starts_with('/') {
        name.to_string()
    } else {
        let bare = name.trim_end_matches('/');
        if bare.is_empty() || bare.contains('/') {
            error!("'{}' is not a bare endpoint name or absolute path", name);
            return Err(PipeError::InvalidArg);
        }
        format!("{}{}", DEFAULT_BASE_DIR, bare)
    };
    if !dir.ends_with('/') {
        dir.push('/');
    }
    if dir.len() >= MAX_DIR_LEN {
        error!("expanded location '{}' exceeds {} bytes", dir, MAX_DIR_LEN);
        return Err(PipeError::InvalidArg);
    }
    Ok(dir)
}

/// Create every missing directory up to the last `/` of `path`.
///
/// Anything after the final slash is treated as a file name and never
/// created. Existing directories are success.
pub fn create_dirs(path: &str) -> Result<()> {
    let dir = match path.rfind('/') {
        Some(i) => &path[..=i],
        None => return Ok(()),
    };
    if dir == "/" || dir.is_empty() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o777);
    builder.create(dir).map_err(|e| {
        error!("failed to create directory {}: {}", dir, e);
        PipeError::FileIo
    })
}

/// Best-effort post-order removal of a directory tree.
pub fn remove_recursive(path: &str) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("failed to remove {}: {}", path, e);
        }
    }
}

/// True if an endpoint's rendezvous FIFO is present at this location.
pub fn exists(name: &str) -> bool {
    let dir = match expand_location(name) {
        Ok(d) => d,
        Err(_) => return false,
    };
    fs::metadata(format!("{}{}", dir, REQUEST_NAME))
        .map(|m| m.file_type().is_fifo())
        .unwrap_or(false)
}

/// True if the endpoint exists and its descriptor's `type` field matches.
pub fn is_type(name: &str, type_name: &str) -> bool {
    if !exists(name) {
        return false;
    }
    match read_info(name) {
        Ok(info) => info.type_name == type_name,
        Err(_) => false,
    }
}

/// The JSON descriptor published at `<endpoint>/info`.
///
/// The six mandatory fields are typed; vendor-specific keys survive a
/// read-modify-write cycle through `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Short endpoint name, e.g. `imu0`.
    pub name: String,
    /// Absolute endpoint directory, ending in `/`. Filled in at create.
    #[serde(default)]
    pub location: String,
    /// Free-form payload type tag, e.g. `imu_data_t` or `camera`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Name of the publishing process.
    pub server_name: String,
    /// Default kernel FIFO capacity for new clients, bytes.
    pub size_bytes: u32,
    /// Process id of the publisher. Filled in at create.
    #[serde(default)]
    pub server_pid: i32,
    /// Commands the server's control channel recognizes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_commands: Option<Vec<String>>,
    /// Vendor-specific keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl EndpointInfo {
    /// Descriptor for a new endpoint. `location` and `server_pid` are filled
    /// in by the server at create time.
    pub fn new(name: &str, type_name: &str, server_name: &str, size_bytes: u32) -> EndpointInfo {
        EndpointInfo {
            name: name.to_string(),
            location: String::new(),
            type_name: type_name.to_string(),
            server_name: server_name.to_string(),
            size_bytes,
            server_pid: 0,
            available_commands: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Advertise the commands the control channel understands.
    pub fn set_available_commands(&mut self, commands: &[&str]) {
        self.available_commands = Some(commands.iter().map(|c| c.to_string()).collect());
    }
}

fn info_path(dir: &str) -> String {
    format!("{}{}", dir, INFO_NAME)
}

/// Read and parse the descriptor of an endpoint (bare name or location).
pub fn read_info(name: &str) -> Result<EndpointInfo> {
    let dir = expand_location(name)?;
    let bytes = fs::read(info_path(&dir)).map_err(|_| PipeError::InfoNotAvailable)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error!("failed to parse {}info: {}", dir, e);
        PipeError::InfoNotAvailable
    })
}

/// Read the descriptor as a raw JSON document, for callers that need
/// vendor-specific fields beyond [`EndpointInfo`].
pub fn read_info_document(name: &str) -> Result<serde_json::Value> {
    let dir = expand_location(name)?;
    let bytes = fs::read(info_path(&dir)).map_err(|_| PipeError::InfoNotAvailable)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        error!("failed to parse {}info: {}", dir, e);
        PipeError::InfoNotAvailable
    })
}

/// Serialize the descriptor to `<location>info`, world-readable.
pub(crate) fn write_info(info: &EndpointInfo) -> Result<()> {
    let path = info_path(&info.location);
    let json = serde_json::to_vec_pretty(info).map_err(|e| {
        error!("failed to serialize descriptor for {}: {}", info.name, e);
        PipeError::Other
    })?;
    fs::write(&path, json).map_err(|e| {
        error!("failed to write {}: {}", path, e);
        PipeError::FileIo
    })?;
    let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o666));
    Ok(())
}

fn pid_alive(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None).is_ok()
}

/// Remove a dead server's endpoint tree on its behalf.
///
/// Refuses to touch the tree while the advertised server pid is still alive;
/// a live server owns its own files.
pub(crate) fn sweep_endpoint(dir: &str) {
    if let Ok(bytes) = fs::read(info_path(dir)) {
        if let Ok(info) = serde_json::from_slice::<EndpointInfo>(&bytes) {
            if pid_alive(info.server_pid) {
                warn!(
                    "not sweeping {}: server pid {} is still alive",
                    dir, info.server_pid
                );
                return;
            }
        }
    }
    warn!("sweeping stale endpoint {}", dir);
    remove_recursive(dir);
}

/// Stop the server publishing an endpoint.
///
/// Reads the server pid from the descriptor, sends it SIGINT, polls for exit
/// for up to `timeout_s` seconds (floored at 0.1), escalates to SIGKILL, and
/// sweeps whatever is left of the endpoint tree. Returns `true` if an
/// endpoint existed and was cleaned up (stopping its server when one was
/// still alive), `false` if there was nothing to do.
pub fn stop_server(name: &str, timeout_s: f32) -> Result<bool> {
    let dir = expand_location(name)?;
    let timeout = Duration::from_secs_f32(timeout_s.max(0.1));

    let info = match read_info(&dir) {
        Ok(info) => info,
        Err(_) => {
            if Path::new(&dir).exists() {
                remove_recursive(&dir);
                return Ok(true);
            }
            return Ok(false);
        }
    };
    if !pid_alive(info.server_pid) {
        // The server crashed and left its tree behind.
        remove_recursive(&dir);
        return Ok(true);
    }

    let pid = Pid::from_raw(info.server_pid);
    if let Err(e) = kill(pid, Signal::SIGINT) {
        error!("failed to interrupt pid {}: {}", info.server_pid, e);
        return Err(PipeError::Other);
    }
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !pid_alive(info.server_pid) {
            remove_recursive(&dir);
            return Ok(true);
        }
        thread::sleep(Duration::from_millis(100));
    }

    warn!(
        "server pid {} ignored SIGINT for {:?}, killing it",
        info.server_pid, timeout
    );
    let _ = kill(pid, Signal::SIGKILL);
    thread::sleep(Duration::from_millis(100));
    remove_recursive(&dir);
    Ok(true)
}
