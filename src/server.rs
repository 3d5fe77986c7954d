//! Server connection engine.
//!
//! A server claims one of [`crate::MAX_CHANNELS`] channels, publishes an
//! endpoint directory, and listens on the rendezvous FIFO for client handles.
//! Each attached client gets its own data FIFO with its own kernel buffer;
//! fan-out writes are non-blocking and capacity-checked, so a stalled client
//! only ever loses its own records.
//!
//! Locking is split by concern: the channel entry lock covers lifecycle
//! transitions (create, close), each client slot has its own lock covering
//! steady-state writes, and the two are never held together with another
//! slot's.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::endpoint::{self, EndpointInfo, CONTROL_NAME, REQUEST_NAME};
use crate::errors::{PipeError, Result};
use crate::frames::{
    classify_encoded_frame, image_format, CameraMeta, EncodedFrameKind, PointCloudMeta,
    RECORD_MAGIC,
};
use crate::sys::{self, ReadOutcome, TaskHandle, Waker};
use crate::MAX_CHANNELS;

/// Client slots per server channel.
pub const MAX_CLIENTS: usize = 16;

/// Default kernel capacity of the control FIFO.
pub const DEFAULT_CONTROL_PIPE_SIZE: usize = 64 * 1024;
/// Default read-buffer size of the control reader.
pub const DEFAULT_CONTROL_BUF_SIZE: usize = 1024;

const REQUEST_BUF_SIZE: usize = 256;
const OPEN_RETRIES: u32 = 500;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const MIN_PIPE_SIZE: u32 = 4096;
const MAX_PIPE_SIZE: u32 = 256 * 1024 * 1024;

bitflags! {
    /// Server channel configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ServerFlags: u32 {
        /// Create and read the `control` FIFO.
        const EN_CONTROL_PIPE = 1 << 0;
        /// Legacy: used to publish `info` as a FIFO as well. Accepted, warned
        /// about, otherwise ignored.
        const EN_INFO_PIPE = 1 << 1;
        /// Narrate connection-state transitions at debug level.
        const EN_DEBUG_PRINTS = 1 << 2;
    }
}

/// Connect/disconnect notification: channel, client slot id, client name.
pub type ClientCb = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;
/// Control command notification: channel, raw command bytes.
pub type ControlCb = Arc<dyn Fn(usize, &[u8]) + Send + Sync>;

struct Callbacks {
    connect: Option<ClientCb>,
    disconnect: Option<ClientCb>,
    control: Option<ControlCb>,
}

impl Callbacks {
    const fn none() -> Callbacks {
        Callbacks {
            connect: None,
            disconnect: None,
            control: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Unused,
    Initialized,
    Connected,
    Disconnected,
}

struct ClientSlot {
    state: ClientState,
    name: String,
    path: String,
    fd: Option<OwnedFd>,
    /// Achieved kernel buffer capacity; the ceiling for back-pressure checks.
    pipe_size: usize,
    /// Encoded video only: whether P-frames may be delivered.
    accepting_p: bool,
}

impl ClientSlot {
    const fn empty() -> ClientSlot {
        ClientSlot {
            state: ClientState::Unused,
            name: String::new(),
            path: String::new(),
            fd: None,
            pipe_size: 0,
            accepting_p: false,
        }
    }

    fn attached(&self) -> bool {
        matches!(self.state, ClientState::Initialized | ClientState::Connected)
    }
}

struct VideoCache {
    meta: CameraMeta,
    header: Vec<u8>,
}

struct ServerShared {
    ch: usize,
    running: AtomicBool,
    debug: bool,
    dir: String,
    pipe_size: u32,
    request_fd: OwnedFd,
    request_waker: Waker,
    control_fd: Option<OwnedFd>,
    control_waker: Waker,
    control_buf_size: usize,
    clients: [Mutex<ClientSlot>; MAX_CLIENTS],
    video: Mutex<Option<VideoCache>>,
}

struct Entry {
    shared: Option<Arc<ServerShared>>,
    request_task: Option<TaskHandle>,
    control_task: Option<TaskHandle>,
    control_pipe_size: usize,
    control_buf_size: usize,
}

impl Entry {
    const fn new() -> Entry {
        Entry {
            shared: None,
            request_task: None,
            control_task: None,
            control_pipe_size: DEFAULT_CONTROL_PIPE_SIZE,
            control_buf_size: DEFAULT_CONTROL_BUF_SIZE,
        }
    }
}

static CHANNELS: [Mutex<Entry>; MAX_CHANNELS] =
    [const { Mutex::new(Entry::new()) }; MAX_CHANNELS];

static CALLBACKS: [Mutex<Callbacks>; MAX_CHANNELS] =
    [const { Mutex::new(Callbacks::none()) }; MAX_CHANNELS];

/// Endpoint directories currently claimed by a channel, for duplicate refusal.
static ACTIVE_DIRS: Mutex<Vec<(usize, String)>> = Mutex::new(Vec::new());

static SIGPIPE_ONCE: Once = Once::new();

/// A dead client's FIFO write raises SIGPIPE; ignoring it process-wide turns
/// that into an EPIPE error the fan-out path handles.
fn ignore_sigpipe() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    SIGPIPE_ONCE.call_once(|| {
        let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        if let Err(e) = unsafe { sigaction(Signal::SIGPIPE, &action) } {
            warn!("failed to ignore SIGPIPE: {}", e);
        }
    });
}

fn entry(ch: usize) -> Result<&'static Mutex<Entry>> {
    CHANNELS.get(ch).ok_or(PipeError::ChannelOob)
}

fn shared(ch: usize) -> Result<Arc<ServerShared>> {
    entry(ch)?
        .lock()
        .shared
        .clone()
        .ok_or(PipeError::InvalidArg)
}

/// Override the control channel's kernel capacity and read-buffer size.
///
/// Must be called before [`create`]; the sizes reset to their defaults when
/// the channel closes.
pub fn set_control_sizes(ch: usize, pipe_size: usize, read_buf_size: usize) -> Result<()> {
    let mut guard = entry(ch)?.lock();
    if guard.shared.is_some() {
        error!("control sizes must be set before create on channel {}", ch);
        return Err(PipeError::InvalidArg);
    }
    if pipe_size == 0 || read_buf_size == 0 {
        return Err(PipeError::InvalidArg);
    }
    guard.control_pipe_size = pipe_size;
    guard.control_buf_size = read_buf_size;
    Ok(())
}

/// Register a handler invoked from the rendezvous reader whenever a client
/// attaches (or re-attaches). Survives until [`close`].
pub fn set_connect_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, usize, &str) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().connect = Some(Arc::new(f));
    Ok(())
}

/// Register a handler invoked when a client's FIFO write fails and the slot
/// transitions to disconnected.
pub fn set_disconnect_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, usize, &str) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().disconnect = Some(Arc::new(f));
    Ok(())
}

/// Register the handler for bytes arriving on the control FIFO.
pub fn set_control_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, &[u8]) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().control = Some(Arc::new(f));
    Ok(())
}

/// Publish a new endpoint and start accepting clients.
///
/// Validates the endpoint name, expands its location, clamps the per-client
/// FIFO capacity into [4 KiB, 256 MiB], writes the JSON descriptor, opens the
/// rendezvous FIFO (and control FIFO if enabled) read+write, and spawns the
/// reader threads.
pub fn create(ch: usize, mut info: EndpointInfo, flags: ServerFlags) -> Result<()> {
    let mut guard = entry(ch)?.lock();
    if guard.shared.is_some() {
        error!("server channel {} is already in use", ch);
        return Err(PipeError::InvalidArg);
    }

    if info.name.is_empty() || info.name.contains('/') || info.name == "unknown" {
        error!("'{}' is not a valid endpoint name", info.name);
        return Err(PipeError::InvalidArg);
    }
    let loc_src = if info.location.is_empty() {
        info.name.clone()
    } else {
        info.location.clone()
    };
    let dir = endpoint::expand_location(&loc_src)?;

    {
        let mut dirs = ACTIVE_DIRS.lock();
        if dirs.iter().any(|(other, d)| *other != ch && *d == dir) {
            error!("endpoint {} is already published by another channel", dir);
            return Err(PipeError::InvalidArg);
        }
        dirs.push((ch, dir.clone()));
    }

    if info.size_bytes < MIN_PIPE_SIZE {
        warn!(
            "pipe size {} below the {} byte floor, using {}",
            info.size_bytes,
            MIN_PIPE_SIZE,
            endpoint::DEFAULT_PIPE_SIZE
        );
        info.size_bytes = endpoint::DEFAULT_PIPE_SIZE;
    } else if info.size_bytes > MAX_PIPE_SIZE {
        warn!(
            "pipe size {} above the {} byte ceiling, clamping",
            info.size_bytes, MAX_PIPE_SIZE
        );
        info.size_bytes = MAX_PIPE_SIZE;
    }
    info.location = dir.clone();
    info.server_pid = std::process::id() as i32;

    ignore_sigpipe();
    if flags.contains(ServerFlags::EN_INFO_PIPE) {
        warn!("EN_INFO_PIPE is deprecated and has no effect");
    }

    let control_pipe_size = guard.control_pipe_size;
    let control_buf_size = guard.control_buf_size;
    let build = || -> Result<Arc<ServerShared>> {
        endpoint::create_dirs(&dir)?;
        endpoint::write_info(&info)?;

        let request_path = format!("{}{}", dir, REQUEST_NAME);
        sys::make_fifo(&request_path).map_err(|e| {
            error!("failed to create {}: {}", request_path, e);
            PipeError::FileIo
        })?;
        let request_fd = sys::open_fifo_rw(&request_path).map_err(|e| {
            error!("failed to open {}: {}", request_path, e);
            PipeError::FileIo
        })?;

        let control_fd = if flags.contains(ServerFlags::EN_CONTROL_PIPE) {
            let control_path = format!("{}{}", dir, CONTROL_NAME);
            sys::make_fifo(&control_path).map_err(|e| {
                error!("failed to create {}: {}", control_path, e);
                PipeError::FileIo
            })?;
            let fd = sys::open_fifo_rw(&control_path).map_err(|e| {
                error!("failed to open {}: {}", control_path, e);
                PipeError::FileIo
            })?;
            sys::set_pipe_size(fd.as_fd(), control_pipe_size);
            Some(fd)
        } else {
            None
        };

        Ok(Arc::new(ServerShared {
            ch,
            running: AtomicBool::new(true),
            debug: flags.contains(ServerFlags::EN_DEBUG_PRINTS),
            dir: dir.clone(),
            pipe_size: info.size_bytes,
            request_fd,
            request_waker: Waker::new().map_err(|_| PipeError::FileIo)?,
            control_fd,
            control_waker: Waker::new().map_err(|_| PipeError::FileIo)?,
            control_buf_size,
            clients: std::array::from_fn(|_| Mutex::new(ClientSlot::empty())),
            video: Mutex::new(None),
        }))
    };

    let shared = match build() {
        Ok(shared) => shared,
        Err(e) => {
            ACTIVE_DIRS.lock().retain(|(other, _)| *other != ch);
            endpoint::remove_recursive(&dir);
            return Err(e);
        }
    };

    let spawn = || -> Result<(TaskHandle, Option<TaskHandle>)> {
        let task_shared = shared.clone();
        let request_task = TaskHandle::spawn(format!("pipebus-srv{}", ch), move || {
            request_loop(task_shared)
        })
        .map_err(|e| {
            error!("failed to spawn rendezvous reader: {}", e);
            PipeError::Other
        })?;
        if shared.control_fd.is_none() {
            return Ok((request_task, None));
        }
        let task_shared = shared.clone();
        match TaskHandle::spawn(format!("pipebus-ctl{}", ch), move || {
            control_loop(task_shared)
        }) {
            Ok(t) => Ok((request_task, Some(t))),
            Err(e) => {
                error!("failed to spawn control reader: {}", e);
                shared.running.store(false, Ordering::Release);
                shared.request_waker.wake();
                request_task.join_timeout(JOIN_TIMEOUT);
                Err(PipeError::Other)
            }
        }
    };
    let (request_task, control_task) = match spawn() {
        Ok(tasks) => tasks,
        Err(e) => {
            ACTIVE_DIRS.lock().retain(|(other, _)| *other != ch);
            endpoint::remove_recursive(&dir);
            return Err(e);
        }
    };
    guard.request_task = Some(request_task);
    guard.control_task = control_task;

    info!("server channel {} publishing endpoint {}", ch, shared.dir);
    guard.shared = Some(shared);
    Ok(())
}

fn request_loop(shared: Arc<ServerShared>) {
    let mut buf = [0u8; REQUEST_BUF_SIZE];
    while shared.running.load(Ordering::Acquire) {
        match sys::read_cancellable(shared.request_fd.as_fd(), &shared.request_waker, &mut buf) {
            Ok(ReadOutcome::Cancelled) => continue,
            Ok(ReadOutcome::Data(0)) => continue,
            Ok(ReadOutcome::Data(n)) => {
                // Requests from racing clients can coalesce into one read;
                // each handle is NUL-terminated, so split on the NULs.
                for token in buf[..n].split(|b| *b == 0) {
                    if !token.is_empty() {
                        handle_request(&shared, token);
                    }
                }
            }
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("channel {}: rendezvous read failed: {}", shared.ch, e);
                }
                return;
            }
        }
    }
}

fn handle_request(shared: &Arc<ServerShared>, raw: &[u8]) {
    let end = raw
        .iter()
        .position(|b| *b < 0x20 || *b == 0x7f)
        .unwrap_or(raw.len());
    let name = String::from_utf8_lossy(&raw[..end]).into_owned();
    if name.is_empty() {
        warn!("channel {}: ignoring empty connection request", shared.ch);
        return;
    }
    if shared.debug {
        debug!("channel {}: connection request from '{}'", shared.ch, name);
    }

    // A known handle re-attaches to its old slot; otherwise take the first
    // unused one.
    let mut id = None;
    for (i, slot) in shared.clients.iter().enumerate() {
        let s = slot.lock();
        if s.state != ClientState::Unused && s.name == name {
            id = Some(i);
            break;
        }
    }
    if id.is_none() {
        for (i, slot) in shared.clients.iter().enumerate() {
            if slot.lock().state == ClientState::Unused {
                id = Some(i);
                break;
            }
        }
    }
    let Some(id) = id else {
        error!(
            "channel {}: client table is full, rejecting '{}'",
            shared.ch, name
        );
        return;
    };

    {
        let mut slot = shared.clients[id].lock();
        if let Err(e) = add_client_locked(shared, &mut slot, id, &name) {
            error!(
                "channel {}: failed to attach client '{}': {}",
                shared.ch, name, e
            );
            return;
        }
    }

    let cb = CALLBACKS[shared.ch].lock().connect.clone();
    if let Some(cb) = cb {
        cb(shared.ch, id, &name);
    }
}

fn add_client_locked(
    shared: &Arc<ServerShared>,
    slot: &mut ClientSlot,
    id: usize,
    name: &str,
) -> Result<()> {
    let path = format!("{}{}", shared.dir, name);
    sys::make_fifo(&path).map_err(|e| {
        error!("failed to create {}: {}", path, e);
        PipeError::FileIo
    })?;
    // The client may still be racing towards its open of the read end.
    let fd = sys::open_fifo_write_retry(&path, OPEN_RETRIES, OPEN_RETRY_DELAY).map_err(|e| {
        error!("client '{}' never opened {}: {}", name, path, e);
        let _ = std::fs::remove_file(&path);
        PipeError::Timeout
    })?;
    let actual = sys::set_pipe_size(fd.as_fd(), shared.pipe_size as usize);

    slot.name = name.to_string();
    slot.path = path;
    slot.pipe_size = actual;
    slot.accepting_p = false;
    slot.state = ClientState::Initialized;

    // Late joiners to an encoded video stream need the codec header before
    // anything else lands in their FIFO.
    if let Some(cache) = shared.video.lock().as_ref() {
        let meta = cache.meta;
        if let Err(e) = sys::write_vectored(fd.as_fd(), &[meta.as_bytes(), &cache.header]) {
            warn!(
                "channel {}: failed to replay video header to '{}': {}",
                shared.ch, name, e
            );
        }
    }
    slot.fd = Some(fd);

    info!(
        "channel {}: client '{}' attached to slot {} (pipe {} bytes)",
        shared.ch, name, id, actual
    );
    Ok(())
}

fn disconnect_locked(slot: &mut ClientSlot) {
    slot.state = ClientState::Disconnected;
    slot.fd = None;
    slot.accepting_p = false;
    if !slot.path.is_empty() {
        let _ = std::fs::remove_file(&slot.path);
    }
}

fn fan_out(
    shared: &Arc<ServerShared>,
    bufs: &[&[u8]],
    video_kind: Option<EncodedFrameKind>,
) -> Result<()> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    let mut disconnected: Vec<(usize, String)> = Vec::new();

    for id in 0..MAX_CLIENTS {
        let mut slot = shared.clients[id].lock();
        if !slot.attached() {
            continue;
        }
        // Every header starts a new sequence; the flag drops even for clients
        // whose copy of the header gets dropped below.
        if video_kind == Some(EncodedFrameKind::Header) {
            slot.accepting_p = false;
        }
        if video_kind == Some(EncodedFrameKind::Predicted) && !slot.accepting_p {
            continue;
        }
        enum Attempt {
            Wrote(usize),
            NoSpace,
            Failed(std::io::Error),
        }

        // The fd borrow stays inside this block so the failure arms below can
        // mutate the slot.
        let attempt = {
            let Some(fd) = slot.fd.as_ref() else { continue };
            match sys::bytes_queued(fd.as_fd()) {
                Err(e) => Attempt::Failed(e),
                Ok(queued) if total > slot.pipe_size.saturating_sub(queued) => Attempt::NoSpace,
                Ok(_) => match sys::write_vectored(fd.as_fd(), bufs) {
                    Ok(n) => Attempt::Wrote(n),
                    Err(e) => Attempt::Failed(e),
                },
            }
        };

        match attempt {
            Attempt::Wrote(n) if n == total => {
                slot.state = ClientState::Connected;
                if video_kind == Some(EncodedFrameKind::Intra) {
                    slot.accepting_p = true;
                }
            }
            Attempt::Wrote(n) => {
                warn!(
                    "channel {}: partial write ({} of {} bytes) to '{}', record dropped",
                    shared.ch, n, total, slot.name
                );
            }
            Attempt::NoSpace => {
                if shared.debug {
                    debug!(
                        "channel {}: dropping {} bytes for backed-up client '{}'",
                        shared.ch, total, slot.name
                    );
                }
            }
            Attempt::Failed(e) if e.raw_os_error() == Some(libc::EAGAIN) => {
                if shared.debug {
                    debug!(
                        "channel {}: pipe full for client '{}', record dropped",
                        shared.ch, slot.name
                    );
                }
            }
            Attempt::Failed(e) => {
                warn!(
                    "channel {}: write to '{}' failed: {}, disconnecting",
                    shared.ch, slot.name, e
                );
                disconnect_locked(&mut slot);
                disconnected.push((id, slot.name.clone()));
            }
        }
    }

    if !disconnected.is_empty() {
        let cb = CALLBACKS[shared.ch].lock().disconnect.clone();
        if let Some(cb) = cb {
            for (id, name) in &disconnected {
                cb(shared.ch, *id, name);
            }
        }
    }
    Ok(())
}

/// Fan a raw record out to every attached client.
pub fn write(ch: usize, data: &[u8]) -> Result<()> {
    let shared = shared(ch)?;
    if data.is_empty() {
        return Err(PipeError::InvalidArg);
    }
    fan_out(&shared, &[data], None)
}

/// Fan a camera frame out to every attached client.
///
/// For H264/H265 streams the frame is classified and sequenced: headers are
/// cached for late joiners and reset the P-frame gate, I-frames open it,
/// P-frames only reach clients whose gate is open. Unclassifiable frames are
/// dropped with a warning.
pub fn write_camera(ch: usize, meta: &CameraMeta, frame: &[u8]) -> Result<()> {
    let shared = shared(ch)?;
    let mut meta = *meta;
    meta.magic_number = RECORD_MAGIC;
    if meta.payload_len() != frame.len() {
        let size = meta.size_bytes;
        error!(
            "channel {}: metadata says {} bytes but frame has {}",
            ch,
            size,
            frame.len()
        );
        return Err(PipeError::InvalidArg);
    }

    let format = meta.format;
    if format == image_format::H264 || format == image_format::H265 {
        match classify_encoded_frame(format, frame) {
            Some(EncodedFrameKind::Header) => {
                // Cache must not be held across fan-out: the rendezvous
                // reader takes it while holding a slot lock.
                *shared.video.lock() = Some(VideoCache {
                    meta,
                    header: frame.to_vec(),
                });
                fan_out(&shared, &[meta.as_bytes(), frame], Some(EncodedFrameKind::Header))
            }
            Some(kind) => fan_out(&shared, &[meta.as_bytes(), frame], Some(kind)),
            None => Ok(()),
        }
    } else {
        fan_out(&shared, &[meta.as_bytes(), frame], None)
    }
}

/// Fan a stereo pair out to every attached client: metadata, then the left
/// image, then the right. `size_bytes` covers both halves.
pub fn write_stereo_camera(
    ch: usize,
    meta: &CameraMeta,
    left: &[u8],
    right: &[u8],
) -> Result<()> {
    let shared = shared(ch)?;
    let mut meta = *meta;
    meta.magic_number = RECORD_MAGIC;
    if left.len() != right.len() || meta.payload_len() != left.len() + right.len() {
        let size = meta.size_bytes;
        error!(
            "channel {}: stereo halves of {} and {} bytes do not match metadata size {}",
            ch,
            left.len(),
            right.len(),
            size
        );
        return Err(PipeError::InvalidArg);
    }
    fan_out(&shared, &[meta.as_bytes(), left, right], None)
}

/// Fan a point cloud out to every attached client.
pub fn write_point_cloud(ch: usize, meta: &PointCloudMeta, points: &[u8]) -> Result<()> {
    let shared = shared(ch)?;
    let mut meta = *meta;
    meta.magic_number = RECORD_MAGIC;
    if meta.payload_len()? != points.len() {
        error!(
            "channel {}: point cloud payload of {} bytes does not match metadata",
            ch,
            points.len()
        );
        return Err(PipeError::InvalidArg);
    }
    fan_out(&shared, &[meta.as_bytes(), points], None)
}

fn control_loop(shared: Arc<ServerShared>) {
    let Some(fd) = shared.control_fd.as_ref() else {
        return;
    };
    let mut buf = vec![0u8; shared.control_buf_size];
    while shared.running.load(Ordering::Acquire) {
        match sys::read_cancellable(fd.as_fd(), &shared.control_waker, &mut buf) {
            Ok(ReadOutcome::Cancelled) => continue,
            Ok(ReadOutcome::Data(0)) => continue,
            Ok(ReadOutcome::Data(n)) => {
                if shared.debug {
                    debug!("channel {}: {} control bytes", shared.ch, n);
                }
                let cb = CALLBACKS[shared.ch].lock().control.clone();
                if let Some(cb) = cb {
                    cb(shared.ch, &buf[..n]);
                }
            }
            Err(e) => {
                if shared.running.load(Ordering::Acquire) {
                    error!("channel {}: control read failed: {}", shared.ch, e);
                }
                return;
            }
        }
    }
}

/// Number of currently attached clients.
pub fn num_clients(ch: usize) -> Result<usize> {
    let shared = shared(ch)?;
    Ok(shared
        .clients
        .iter()
        .filter(|s| s.lock().attached())
        .count())
}

/// Name registered at a client slot, if the slot has ever been used.
pub fn client_name(ch: usize, id: usize) -> Result<Option<String>> {
    let shared = shared(ch)?;
    let slot = shared.clients.get(id).ok_or(PipeError::InvalidArg)?.lock();
    if slot.state == ClientState::Unused {
        Ok(None)
    } else {
        Ok(Some(slot.name.clone()))
    }
}

/// Names of all currently attached clients.
pub fn client_names(ch: usize) -> Result<Vec<String>> {
    let shared = shared(ch)?;
    Ok(shared
        .clients
        .iter()
        .filter_map(|s| {
            let s = s.lock();
            s.attached().then(|| s.name.clone())
        })
        .collect())
}

/// Tear an endpoint down.
///
/// Stops and joins the reader threads (1 s deadline each), closes every
/// client FIFO, removes the endpoint tree, clears the callbacks, and releases
/// the channel claim. Closing an unclaimed channel is a no-op.
pub fn close(ch: usize) -> Result<()> {
    let mut guard = entry(ch)?.lock();
    let Some(shared) = guard.shared.take() else {
        return Ok(());
    };

    shared.running.store(false, Ordering::Release);
    *CALLBACKS[ch].lock() = Callbacks::none();
    shared.request_waker.wake();
    shared.control_waker.wake();
    if let Some(task) = guard.request_task.take() {
        task.join_timeout(JOIN_TIMEOUT);
    }
    if let Some(task) = guard.control_task.take() {
        task.join_timeout(JOIN_TIMEOUT);
    }

    for slot in shared.clients.iter() {
        let mut s = slot.lock();
        *s = ClientSlot::empty();
    }
    endpoint::remove_recursive(&shared.dir);
    ACTIVE_DIRS.lock().retain(|(other, _)| *other != ch);
    guard.control_pipe_size = DEFAULT_CONTROL_PIPE_SIZE;
    guard.control_buf_size = DEFAULT_CONTROL_BUF_SIZE;

    info!("server channel {} closed", ch);
    Ok(())
}

/// Close every claimed server channel.
pub fn close_all() {
    for ch in 0..MAX_CHANNELS {
        let _ = close(ch);
    }
}
