//! Client attach engine.
//!
//! A client claims one of [`crate::MAX_CHANNELS`] slots, performs the
//! rendezvous handshake (write the desired handle into `request`, then open
//! the data FIFO the server creates for it), and usually runs a background
//! helper thread that parses the stream and dispatches typed callbacks. On
//! read failure the helper closes up and, unless auto-reconnect is disabled,
//! keeps retrying the handshake until the server comes back.

use std::fs;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use zerocopy::FromBytes;

use crate::endpoint::{self, EndpointInfo, CONTROL_NAME, MAX_NAME_LEN, REQUEST_NAME};
use crate::errors::{PipeError, Result};
use crate::frames::{CameraMeta, PointCloudMeta, RECORD_MAGIC};
use crate::sys::{self, ReadOutcome, TaskHandle, Waker};
use crate::MAX_CHANNELS;

/// Highest suffix digit tried when resolving a name collision.
pub const MAX_NAME_INDEX: u32 = 8;

const OPEN_RETRIES: u32 = 500;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Bound on partial reads while assembling one metadata record or payload.
const MAX_PARTIAL_READS: u32 = 10;

bitflags! {
    /// Client slot configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        /// Run a helper thread feeding the simple (raw bytes) callback.
        const EN_SIMPLE_HELPER = 1 << 0;
        /// Run a helper thread parsing camera metadata + payload.
        const EN_CAMERA_HELPER = 1 << 1;
        /// Run a helper thread parsing point-cloud metadata + payload.
        const EN_POINT_CLOUD_HELPER = 1 << 2;
        /// Attach once; never retry after a disconnect.
        const DISABLE_AUTO_RECONNECT = 1 << 3;
        /// Claim the slot but defer the handshake until [`resume`].
        const START_PAUSED = 1 << 4;
        /// Narrate connection-state transitions at debug level.
        const EN_DEBUG_PRINTS = 1 << 5;
    }
}

/// Raw-stream callback: channel, bytes read.
pub type SimpleCb = Arc<dyn Fn(usize, &[u8]) + Send + Sync>;
/// Camera callback: channel, metadata, payload.
pub type CameraCb = Arc<dyn Fn(usize, &CameraMeta, &[u8]) + Send + Sync>;
/// Point-cloud callback: channel, metadata, payload.
pub type PointCloudCb = Arc<dyn Fn(usize, &PointCloudMeta, &[u8]) + Send + Sync>;
/// Connect/disconnect notification: channel.
pub type EventCb = Arc<dyn Fn(usize) + Send + Sync>;

struct Callbacks {
    simple: Option<SimpleCb>,
    camera: Option<CameraCb>,
    point_cloud: Option<PointCloudCb>,
    connect: Option<EventCb>,
    disconnect: Option<EventCb>,
}

impl Callbacks {
    const fn none() -> Callbacks {
        Callbacks {
            simple: None,
            camera: None,
            point_cloud: None,
            connect: None,
            disconnect: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HelperMode {
    Simple,
    Camera,
    PointCloud,
}

struct Conn {
    /// Arc so the helper can read without pinning the connection lock.
    data_fd: Option<Arc<OwnedFd>>,
    ctrl_fd: Option<OwnedFd>,
    handle: String,
    data_path: String,
}

struct ClientShared {
    ch: usize,
    running: AtomicBool,
    flags: ClientFlags,
    debug: bool,
    dir: String,
    base_name: String,
    buf_len: usize,
    conn: Mutex<Conn>,
    waker: Waker,
}

struct Entry {
    shared: Option<Arc<ClientShared>>,
    helper: Option<TaskHandle>,
    paused: bool,
}

impl Entry {
    const fn new() -> Entry {
        Entry {
            shared: None,
            helper: None,
            paused: false,
        }
    }
}

static CHANNELS: [Mutex<Entry>; MAX_CHANNELS] =
    [const { Mutex::new(Entry::new()) }; MAX_CHANNELS];

static CALLBACKS: [Mutex<Callbacks>; MAX_CHANNELS] =
    [const { Mutex::new(Callbacks::none()) }; MAX_CHANNELS];

/// Helper thread SCHED_FIFO priorities, settable before the helper spawns.
static PRIORITIES: [Mutex<Option<i32>>; MAX_CHANNELS] =
    [const { Mutex::new(None) }; MAX_CHANNELS];

fn entry(ch: usize) -> Result<&'static Mutex<Entry>> {
    CHANNELS.get(ch).ok_or(PipeError::ChannelOob)
}

fn shared(ch: usize) -> Result<Arc<ClientShared>> {
    entry(ch)?
        .lock()
        .shared
        .clone()
        .ok_or(PipeError::NotConnected)
}

fn helper_mode(flags: ClientFlags) -> Result<Option<HelperMode>> {
    let mut mode = None;
    let mut count = 0;
    if flags.contains(ClientFlags::EN_SIMPLE_HELPER) {
        mode = Some(HelperMode::Simple);
        count += 1;
    }
    if flags.contains(ClientFlags::EN_CAMERA_HELPER) {
        mode = Some(HelperMode::Camera);
        count += 1;
    }
    if flags.contains(ClientFlags::EN_POINT_CLOUD_HELPER) {
        mode = Some(HelperMode::PointCloud);
        count += 1;
    }
    if count > 1 {
        error!("helper modes are mutually exclusive");
        return Err(PipeError::InvalidArg);
    }
    Ok(mode)
}

fn auto_reconnect(flags: ClientFlags) -> bool {
    helper_mode(flags).ok().flatten().is_some()
        && !flags.contains(ClientFlags::DISABLE_AUTO_RECONNECT)
}

/// Register the raw-stream callback. Survives until [`close`].
pub fn set_simple_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, &[u8]) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().simple = Some(Arc::new(f));
    Ok(())
}

/// Register the camera-frame callback.
pub fn set_camera_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, &CameraMeta, &[u8]) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().camera = Some(Arc::new(f));
    Ok(())
}

/// Register the point-cloud callback.
pub fn set_point_cloud_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize, &PointCloudMeta, &[u8]) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().point_cloud = Some(Arc::new(f));
    Ok(())
}

/// Register the connect notification.
pub fn set_connect_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().connect = Some(Arc::new(f));
    Ok(())
}

/// Register the disconnect notification.
pub fn set_disconnect_cb<F>(ch: usize, f: F) -> Result<()>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    CALLBACKS[ch].lock().disconnect = Some(Arc::new(f));
    Ok(())
}

/// Ask for the helper thread to run at a SCHED_FIFO priority.
///
/// Takes effect the next time a helper spawns; failure to apply it there is
/// logged and ignored.
pub fn set_helper_priority(ch: usize, priority: i32) -> Result<()> {
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    *PRIORITIES[ch].lock() = Some(priority);
    Ok(())
}

/// Claim a client slot and attach to an endpoint.
///
/// `name_or_location` is a bare endpoint name or an absolute endpoint
/// directory; `client_name` is the handle this client registers under (a
/// collision suffix digit is appended during the handshake, so one spare byte
/// is reserved). Unless [`ClientFlags::START_PAUSED`] is set this continues
/// straight into [`resume`].
pub fn open(
    ch: usize,
    name_or_location: &str,
    client_name: &str,
    flags: ClientFlags,
    buf_len: usize,
) -> Result<()> {
    if ch >= MAX_CHANNELS {
        return Err(PipeError::ChannelOob);
    }
    let mode = helper_mode(flags)?;
    if client_name.is_empty() || client_name.contains('/') {
        error!("'{}' is not a valid client name", client_name);
        return Err(PipeError::InvalidArg);
    }
    if client_name.len() >= MAX_NAME_LEN - 1 {
        error!(
            "client name '{}' leaves no room for a collision suffix",
            client_name
        );
        return Err(PipeError::InvalidArg);
    }
    if mode.is_some() && buf_len == 0 {
        error!("helper modes need a non-zero buffer length");
        return Err(PipeError::InvalidArg);
    }
    let dir = endpoint::expand_location(name_or_location)?;

    {
        let mut guard = entry(ch)?.lock();
        if guard.shared.is_some() {
            error!("client channel {} is already in use", ch);
            return Err(PipeError::InvalidArg);
        }
        guard.shared = Some(Arc::new(ClientShared {
            ch,
            running: AtomicBool::new(false),
            flags,
            debug: flags.contains(ClientFlags::EN_DEBUG_PRINTS),
            dir,
            base_name: client_name.to_string(),
            buf_len,
            conn: Mutex::new(Conn {
                data_fd: None,
                ctrl_fd: None,
                handle: String::new(),
                data_path: String::new(),
            }),
            waker: Waker::new().map_err(|_| PipeError::FileIo)?,
        }));
        guard.paused = true;
    }

    if flags.contains(ClientFlags::START_PAUSED) {
        return Ok(());
    }
    match resume(ch) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Leave the slot unclaimed on a failed synchronous attach.
            let mut guard = entry(ch)?.lock();
            guard.shared = None;
            guard.helper = None;
            guard.paused = false;
            Err(e)
        }
    }
}

/// Start (or restart) network activity on a paused slot.
///
/// Without a helper mode this performs one synchronous handshake and returns
/// its result. With a helper mode and auto-reconnect the handshake moves into
/// the helper thread and this returns immediately.
pub fn resume(ch: usize) -> Result<()> {
    let shared = {
        let guard = entry(ch)?.lock();
        let shared = guard.shared.clone().ok_or(PipeError::NotConnected)?;
        if !guard.paused {
            return Ok(());
        }
        shared
    };
    let mode = helper_mode(shared.flags)?;
    let reconnect = auto_reconnect(shared.flags);
    if !reconnect {
        attach(&shared)?;
        fire_event(ch, |c| c.connect.clone());
    }

    let mut guard = entry(ch)?.lock();
    if guard.shared.is_none() {
        return Err(PipeError::NotConnected);
    }
    if let Some(mode) = mode {
        shared.running.store(true, Ordering::Release);
        shared.waker.clear();
        let task_shared = shared.clone();
        guard.helper = Some(
            TaskHandle::spawn(format!("pipebus-cli{}", ch), move || {
                helper_loop(task_shared, mode, reconnect)
            })
            .map_err(|e| {
                error!("failed to spawn helper thread: {}", e);
                PipeError::Other
            })?,
        );
    }
    guard.paused = false;
    Ok(())
}

/// The rendezvous handshake.
fn attach(shared: &Arc<ClientShared>) -> Result<()> {
    let request_path = format!("{}{}", shared.dir, REQUEST_NAME);
    if !Path::new(&request_path).exists() {
        return Err(PipeError::ServerNotAvailable);
    }

    let mut conn = shared.conn.lock();
    if conn.data_fd.is_some() {
        return Ok(());
    }

    // A reconnecting client keeps its old handle so the server returns it to
    // the same slot; a fresh one probes for the first free suffix.
    let handle = if conn.handle.is_empty() {
        let mut found = None;
        for i in 0..MAX_NAME_INDEX {
            let candidate = format!("{}{}", shared.base_name, i);
            if !Path::new(&format!("{}{}", shared.dir, candidate)).exists() {
                found = Some(candidate);
                break;
            }
        }
        match found {
            Some(h) => h,
            None => {
                error!(
                    "all {} name suffixes for '{}' are taken",
                    MAX_NAME_INDEX, shared.base_name
                );
                return Err(PipeError::ReachedMaxNameIndex);
            }
        }
    } else {
        conn.handle.clone()
    };

    let request_fd = match sys::open_fifo_write(&request_path) {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
            // FIFO with no reader behind it: the server died without cleanup.
            endpoint::sweep_endpoint(&shared.dir);
            return Err(PipeError::ServerNotAvailable);
        }
        Err(e) => {
            error!("failed to open {}: {}", request_path, e);
            return Err(PipeError::FileIo);
        }
    };
    sys::write_vectored(request_fd.as_fd(), &[handle.as_bytes(), &[0u8]]).map_err(|e| {
        error!("failed to write connection request: {}", e);
        PipeError::FileIo
    })?;
    drop(request_fd);

    let control_path = format!("{}{}", shared.dir, CONTROL_NAME);
    let ctrl_fd = match sys::open_fifo_write(&control_path) {
        Ok(fd) => Some(fd),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => None,
        Err(e) => {
            error!("failed to open {}: {}", control_path, e);
            return Err(PipeError::FileIo);
        }
    };

    let data_path = format!("{}{}", shared.dir, handle);
    let data_fd = sys::open_fifo_read_retry(&data_path, OPEN_RETRIES, OPEN_RETRY_DELAY)
        .map_err(|e| {
            error!("server never created {}: {}", data_path, e);
            PipeError::Timeout
        })?;

    conn.handle = handle;
    conn.data_path = data_path;
    conn.data_fd = Some(Arc::new(data_fd));
    conn.ctrl_fd = ctrl_fd;
    if shared.debug {
        debug!(
            "channel {}: attached to {} as '{}'",
            shared.ch, shared.dir, conn.handle
        );
    }
    Ok(())
}

fn fire_event<F>(ch: usize, pick: F)
where
    F: Fn(&Callbacks) -> Option<EventCb>,
{
    let cb = pick(&CALLBACKS[ch].lock());
    if let Some(cb) = cb {
        cb(ch);
    }
}

enum Step {
    Ok,
    Cancelled,
    Disconnected,
    Resync,
}

enum Exact {
    Filled,
    Cancelled,
    Disconnected,
    Short,
}

fn read_exact(shared: &ClientShared, fd: &OwnedFd, buf: &mut [u8]) -> Exact {
    let mut filled = 0;
    let mut reads = 0;
    while filled < buf.len() {
        if reads >= MAX_PARTIAL_READS {
            warn!(
                "channel {}: gave up after {} partial reads ({} of {} bytes)",
                shared.ch,
                reads,
                filled,
                buf.len()
            );
            return Exact::Short;
        }
        match sys::read_cancellable(fd.as_fd(), &shared.waker, &mut buf[filled..]) {
            Ok(ReadOutcome::Cancelled) => return Exact::Cancelled,
            Ok(ReadOutcome::Data(0)) => return Exact::Disconnected,
            Ok(ReadOutcome::Data(n)) => {
                filled += n;
                reads += 1;
            }
            Err(_) => return Exact::Disconnected,
        }
    }
    Exact::Filled
}

fn read_simple(shared: &ClientShared, fd: &OwnedFd, buf: &mut [u8]) -> Step {
    match sys::read_cancellable(fd.as_fd(), &shared.waker, buf) {
        Ok(ReadOutcome::Cancelled) => Step::Cancelled,
        Ok(ReadOutcome::Data(0)) => Step::Disconnected,
        Ok(ReadOutcome::Data(n)) => {
            let cb = CALLBACKS[shared.ch].lock().simple.clone();
            if let Some(cb) = cb {
                cb(shared.ch, &buf[..n]);
            }
            Step::Ok
        }
        Err(_) => Step::Disconnected,
    }
}

fn read_camera(shared: &ClientShared, fd: &OwnedFd, scratch: &mut Vec<u8>) -> Step {
    let mut meta_buf = [0u8; std::mem::size_of::<CameraMeta>()];
    match read_exact(shared, fd, &mut meta_buf) {
        Exact::Filled => {}
        Exact::Cancelled => return Step::Cancelled,
        Exact::Disconnected => return Step::Disconnected,
        Exact::Short => {
            sys::drain(fd.as_fd());
            return Step::Resync;
        }
    }
    let Ok(meta) = CameraMeta::read_from_bytes(&meta_buf[..]) else {
        return Step::Resync;
    };
    let magic = meta.magic_number;
    if magic != RECORD_MAGIC {
        warn!(
            "channel {}: bad camera magic 0x{:08x}, flushing",
            shared.ch, magic
        );
        sys::drain(fd.as_fd());
        return Step::Resync;
    }
    let size = meta.payload_len();
    if size == 0 || size > meta.max_reasonable_size() {
        warn!(
            "channel {}: implausible frame size {} for {}x{}, flushing",
            shared.ch,
            size,
            { meta.width },
            { meta.height }
        );
        sys::drain(fd.as_fd());
        return Step::Resync;
    }
    if scratch.len() < size {
        scratch.resize(size, 0);
    }
    match read_exact(shared, fd, &mut scratch[..size]) {
        Exact::Filled => {}
        Exact::Cancelled => return Step::Cancelled,
        Exact::Disconnected => return Step::Disconnected,
        Exact::Short => {
            sys::drain(fd.as_fd());
            return Step::Resync;
        }
    }
    let cb = CALLBACKS[shared.ch].lock().camera.clone();
    if let Some(cb) = cb {
        cb(shared.ch, &meta, &scratch[..size]);
    }
    Step::Ok
}

fn read_point_cloud(shared: &ClientShared, fd: &OwnedFd, scratch: &mut Vec<u8>) -> Step {
    let mut meta_buf = [0u8; std::mem::size_of::<PointCloudMeta>()];
    match read_exact(shared, fd, &mut meta_buf) {
        Exact::Filled => {}
        Exact::Cancelled => return Step::Cancelled,
        Exact::Disconnected => return Step::Disconnected,
        Exact::Short => {
            sys::drain(fd.as_fd());
            return Step::Resync;
        }
    }
    let Ok(meta) = PointCloudMeta::read_from_bytes(&meta_buf[..]) else {
        return Step::Resync;
    };
    let magic = meta.magic_number;
    if magic != RECORD_MAGIC {
        warn!(
            "channel {}: bad point cloud magic 0x{:08x}, flushing",
            shared.ch, magic
        );
        sys::drain(fd.as_fd());
        return Step::Resync;
    }
    let size = match meta.payload_len() {
        Ok(size) => size,
        Err(_) => {
            sys::drain(fd.as_fd());
            return Step::Resync;
        }
    };
    if size > 0 {
        if scratch.len() < size {
            scratch.resize(size, 0);
        }
        match read_exact(shared, fd, &mut scratch[..size]) {
            Exact::Filled => {}
            Exact::Cancelled => return Step::Cancelled,
            Exact::Disconnected => return Step::Disconnected,
            Exact::Short => {
                sys::drain(fd.as_fd());
                return Step::Resync;
            }
        }
    }
    let cb = CALLBACKS[shared.ch].lock().point_cloud.clone();
    if let Some(cb) = cb {
        cb(shared.ch, &meta, &scratch[..size]);
    }
    Step::Ok
}

fn detach(shared: &ClientShared) {
    let mut conn = shared.conn.lock();
    conn.data_fd = None;
    conn.ctrl_fd = None;
}

/// Sleep between reconnect attempts, staying responsive to cancellation.
fn reconnect_sleep(shared: &ClientShared) {
    let chunk = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < RECONNECT_DELAY {
        if !shared.running.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(chunk);
        slept += chunk;
    }
}

fn helper_loop(shared: Arc<ClientShared>, mode: HelperMode, reconnect: bool) {
    if let Some(priority) = *PRIORITIES[shared.ch].lock() {
        let _ = crate::process::set_realtime_priority(priority);
    }
    let mut buf = vec![0u8; shared.buf_len];

    while shared.running.load(Ordering::Acquire) {
        let fd = shared.conn.lock().data_fd.clone();
        let fd = match fd {
            Some(fd) => fd,
            None => {
                if !reconnect {
                    break;
                }
                match attach(&shared) {
                    Ok(()) => {
                        fire_event(shared.ch, |c| c.connect.clone());
                        continue;
                    }
                    Err(_) => {
                        reconnect_sleep(&shared);
                        continue;
                    }
                }
            }
        };

        let step = match mode {
            HelperMode::Simple => read_simple(&shared, &fd, &mut buf),
            HelperMode::Camera => read_camera(&shared, &fd, &mut buf),
            HelperMode::PointCloud => read_point_cloud(&shared, &fd, &mut buf),
        };
        match step {
            Step::Ok | Step::Resync => {}
            Step::Cancelled => continue,
            Step::Disconnected => {
                if shared.debug {
                    debug!("channel {}: server went away", shared.ch);
                }
                detach(&shared);
                fire_event(shared.ch, |c| c.disconnect.clone());
                if !reconnect {
                    break;
                }
            }
        }
    }
}

/// Stop the helper and drop the connection, keeping the claim, callbacks, and
/// handle so [`resume`] can pick up where it left off.
///
/// Safe to call from inside a helper callback: the join is skipped and the
/// helper unwinds on its own.
pub fn pause(ch: usize) -> Result<()> {
    let mut guard = entry(ch)?.lock();
    let Some(shared) = guard.shared.clone() else {
        return Err(PipeError::InvalidArg);
    };
    if guard.paused {
        return Ok(());
    }

    shared.running.store(false, Ordering::Release);
    shared.waker.wake();
    if let Some(task) = guard.helper.take() {
        if task.thread_id() == thread::current().id() {
            // pause() from within a callback: the helper unwinds to its loop
            // head and exits there; joining ourselves would deadlock.
        } else {
            task.join_timeout(JOIN_TIMEOUT);
        }
    }

    {
        let mut conn = shared.conn.lock();
        conn.data_fd = None;
        conn.ctrl_fd = None;
        if !conn.data_path.is_empty() {
            let _ = fs::remove_file(&conn.data_path);
        }
    }
    guard.paused = true;
    if shared.debug {
        debug!("channel {}: paused", ch);
    }
    Ok(())
}

/// Release the slot entirely: pause, clear the callbacks, zero the state.
pub fn close(ch: usize) -> Result<()> {
    let mut guard = entry(ch)?.lock();
    let Some(shared) = guard.shared.take() else {
        return Ok(());
    };

    shared.running.store(false, Ordering::Release);
    shared.waker.wake();
    if let Some(task) = guard.helper.take() {
        if task.thread_id() == thread::current().id() {
            // close() from within a callback; the helper exits on its own.
        } else {
            task.join_timeout(JOIN_TIMEOUT);
        }
    }

    {
        let mut conn = shared.conn.lock();
        conn.data_fd = None;
        conn.ctrl_fd = None;
        if !conn.data_path.is_empty() {
            let _ = fs::remove_file(&conn.data_path);
        }
    }
    *CALLBACKS[ch].lock() = Callbacks::none();
    *PRIORITIES[ch].lock() = None;
    guard.paused = false;
    info!("client channel {} closed", ch);
    Ok(())
}

/// Close every claimed client slot.
pub fn close_all() {
    for ch in 0..MAX_CHANNELS {
        let _ = close(ch);
    }
}

/// True while the slot holds an open data FIFO.
pub fn is_connected(ch: usize) -> bool {
    match shared(ch) {
        Ok(shared) => shared.conn.lock().data_fd.is_some(),
        Err(_) => false,
    }
}

/// Handle this client registered under, once attached.
pub fn client_handle(ch: usize) -> Result<String> {
    let shared = shared(ch)?;
    let conn = shared.conn.lock();
    if conn.handle.is_empty() {
        Err(PipeError::NotConnected)
    } else {
        Ok(conn.handle.clone())
    }
}

/// Descriptor of the endpoint this slot points at.
pub fn get_info(ch: usize) -> Result<EndpointInfo> {
    let shared = shared(ch)?;
    endpoint::read_info(&shared.dir)
}

/// One non-blocking read from the data FIFO, for slots opened without a
/// helper mode. Returns 0 when nothing is queued.
pub fn read(ch: usize, buf: &mut [u8]) -> Result<usize> {
    let shared = shared(ch)?;
    let fd = shared
        .conn
        .lock()
        .data_fd
        .clone()
        .ok_or(PipeError::NotConnected)?;
    let mut total = 0;
    while total < buf.len() {
        match sys::bytes_queued(fd.as_fd()) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => return Err(PipeError::FileIo),
        }
        match sys::read_cancellable(fd.as_fd(), &shared.waker, &mut buf[total..]) {
            Ok(ReadOutcome::Cancelled) => break,
            Ok(ReadOutcome::Data(0)) => break,
            Ok(ReadOutcome::Data(n)) => total += n,
            Err(_) => return Err(PipeError::FileIo),
        }
    }
    Ok(total)
}

/// Discard everything queued in the data FIFO.
pub fn flush(ch: usize) -> Result<()> {
    let shared = shared(ch)?;
    let fd = shared
        .conn
        .lock()
        .data_fd
        .clone()
        .ok_or(PipeError::NotConnected)?;
    sys::drain(fd.as_fd());
    Ok(())
}

/// Send raw command bytes to the server's control FIFO.
pub fn send_control_cmd(ch: usize, cmd: &[u8]) -> Result<()> {
    if cmd.is_empty() {
        return Err(PipeError::InvalidArg);
    }
    let shared = shared(ch)?;
    let mut conn = shared.conn.lock();
    if conn.ctrl_fd.is_none() {
        // The control FIFO may have appeared after we attached.
        let control_path = format!("{}{}", shared.dir, CONTROL_NAME);
        match sys::open_fifo_write(&control_path) {
            Ok(fd) => conn.ctrl_fd = Some(fd),
            Err(_) => return Err(PipeError::CtrlNotAvailable),
        }
    }
    let result = match conn.ctrl_fd.as_ref() {
        Some(fd) => sys::write_vectored(fd.as_fd(), &[cmd]),
        None => return Err(PipeError::CtrlNotAvailable),
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("channel {}: control write failed: {}", ch, e);
            conn.ctrl_fd = None;
            Err(PipeError::FileIo)
        }
    }
}

/// Send a command string plus the customary trailing NUL.
pub fn send_control_cmd_str(ch: usize, cmd: &str) -> Result<()> {
    let mut bytes = Vec::with_capacity(cmd.len() + 1);
    bytes.extend_from_slice(cmd.as_bytes());
    bytes.push(0);
    send_control_cmd(ch, &bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_validates_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = format!("{}/ep/", tmp.path().to_str().unwrap());

        assert_eq!(
            open(12, &dir, "", ClientFlags::empty(), 64),
            Err(PipeError::InvalidArg)
        );
        assert_eq!(
            open(12, &dir, "a/b", ClientFlags::empty(), 64),
            Err(PipeError::InvalidArg)
        );
        let long = "x".repeat(MAX_NAME_LEN - 1);
        assert_eq!(
            open(12, &dir, &long, ClientFlags::empty(), 64),
            Err(PipeError::InvalidArg)
        );
        assert_eq!(
            open(
                12,
                &dir,
                "c",
                ClientFlags::EN_SIMPLE_HELPER | ClientFlags::EN_CAMERA_HELPER,
                64
            ),
            Err(PipeError::InvalidArg)
        );
        assert_eq!(
            open(12, &dir, "c", ClientFlags::EN_SIMPLE_HELPER, 0),
            Err(PipeError::InvalidArg)
        );
        assert_eq!(
            open(MAX_CHANNELS, &dir, "c", ClientFlags::empty(), 64),
            Err(PipeError::ChannelOob)
        );
    }

    #[test]
    fn open_without_server_fails_and_releases_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = format!("{}/none/", tmp.path().to_str().unwrap());
        for _ in 0..2 {
            // Both attempts see the missing server, not a busy slot.
            assert_eq!(
                open(13, &dir, "probe", ClientFlags::empty(), 64),
                Err(PipeError::ServerNotAvailable)
            );
        }
        assert!(!is_connected(13));
    }

    #[test]
    fn paused_open_claims_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = format!("{}/none/", tmp.path().to_str().unwrap());
        open(
            14,
            &dir,
            "probe",
            ClientFlags::EN_SIMPLE_HELPER | ClientFlags::START_PAUSED,
            64,
        )
        .unwrap();
        // Claimed but not attached yet.
        assert!(!is_connected(14));
        assert_eq!(
            open(14, &dir, "probe", ClientFlags::START_PAUSED, 64),
            Err(PipeError::InvalidArg)
        );
        close(14).unwrap();
        // The claim is gone after close.
        open(
            14,
            &dir,
            "probe",
            ClientFlags::EN_SIMPLE_HELPER | ClientFlags::START_PAUSED,
            64,
        )
        .unwrap();
        close(14).unwrap();
    }

    #[test]
    fn control_ops_need_connection() {
        assert_eq!(send_control_cmd(15, b"x"), Err(PipeError::NotConnected));
        assert_eq!(flush(15), Err(PipeError::NotConnected));
        assert!(client_handle(15).is_err());
    }
}
