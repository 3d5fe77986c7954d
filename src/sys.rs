//! Raw FIFO plumbing.
//!
//! Everything that talks to the kernel lives here: FIFO creation, non-blocking
//! opens with bounded retry, kernel pipe-buffer sizing, capacity queries, and
//! cancellable blocking reads. Reader threads block in `poll(2)` on their data
//! fd plus a self-pipe [`Waker`]; writing a byte to the waker interrupts the
//! poll, which keeps cancellation latency at syscall-wakeup scale.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use libc::{c_int, c_void, size_t};
use log::warn;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::stat::Mode;
use nix::unistd;

/// Kernel buffer size used when every sizing strategy has failed.
pub(crate) const FALLBACK_PIPE_SIZE: usize = 1024 * 1024;

fn cstring(path: &str) -> io::Result<CString> {
    CString::new(path.as_bytes()).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

fn open_raw(path: &str, flags: c_int) -> io::Result<OwnedFd> {
    let c_path = cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create a FIFO node with permissive mode. An existing node is success.
pub(crate) fn make_fifo(path: &str) -> io::Result<()> {
    let mode = Mode::from_bits_truncate(0o666);
    match unistd::mkfifo(Path::new(path), mode) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Open a FIFO for reading without blocking on a missing writer.
pub(crate) fn open_fifo_read(path: &str) -> io::Result<OwnedFd> {
    open_raw(path, libc::O_RDONLY | libc::O_NONBLOCK)
}

/// Open a FIFO read+write.
///
/// The server opens its rendezvous and control FIFOs this way even though it
/// never writes them; holding the write end keeps the kernel from reporting
/// end-of-file while no client has the FIFO open.
pub(crate) fn open_fifo_rw(path: &str) -> io::Result<OwnedFd> {
    open_raw(path, libc::O_RDWR | libc::O_NONBLOCK)
}

/// Open a FIFO write-only, non-blocking, without retrying.
///
/// Fails with `ENXIO` while no reader has the FIFO open.
pub(crate) fn open_fifo_write(path: &str) -> io::Result<OwnedFd> {
    open_raw(path, libc::O_WRONLY | libc::O_NONBLOCK)
}

/// Open a FIFO write-only, retrying while the reader end has not appeared.
///
/// Covers the race between the server creating a data FIFO and the client
/// opening its read end.
pub(crate) fn open_fifo_write_retry(
    path: &str,
    attempts: u32,
    delay: Duration,
) -> io::Result<OwnedFd> {
    let mut last = io::Error::from_raw_os_error(libc::ENXIO);
    for _ in 0..attempts {
        match open_fifo_write(path) {
            Ok(fd) => return Ok(fd),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENXIO) | Some(libc::ENOENT) => {
                    last = e;
                    thread::sleep(delay);
                }
                _ => return Err(e),
            },
        }
    }
    Err(last)
}

/// Open a FIFO for reading, retrying while the node has not appeared.
pub(crate) fn open_fifo_read_retry(
    path: &str,
    attempts: u32,
    delay: Duration,
) -> io::Result<OwnedFd> {
    let mut last = io::Error::from_raw_os_error(libc::ENOENT);
    for _ in 0..attempts {
        match open_fifo_read(path) {
            Ok(fd) => return Ok(fd),
            Err(e) => match e.raw_os_error() {
                Some(libc::ENOENT) => {
                    last = e;
                    thread::sleep(delay);
                }
                _ => return Err(e),
            },
        }
    }
    Err(last)
}

/// System-advertised upper bound for an unprivileged `F_SETPIPE_SZ`.
pub(crate) fn pipe_max_size() -> usize {
    match std::fs::read_to_string("/proc/sys/fs/pipe-max-size") {
        Ok(s) => s.trim().parse().unwrap_or(FALLBACK_PIPE_SIZE),
        Err(_) => FALLBACK_PIPE_SIZE,
    }
}

/// Set the kernel buffer capacity of a pipe and report what was achieved.
///
/// If the kernel rejects the requested size the call falls back to the
/// system-advertised maximum, then to [`FALLBACK_PIPE_SIZE`]. The returned
/// value is re-queried with `F_GETPIPE_SZ` and is authoritative for
/// back-pressure accounting.
pub(crate) fn set_pipe_size(fd: BorrowedFd<'_>, requested: usize) -> usize {
    let raw = fd.as_raw_fd();
    let mut rc = unsafe { libc::fcntl(raw, libc::F_SETPIPE_SZ, requested as c_int) };
    if rc < 0 {
        let max = pipe_max_size().min(requested);
        warn!(
            "F_SETPIPE_SZ({}) failed: {}, retrying with {}",
            requested,
            io::Error::last_os_error(),
            max
        );
        rc = unsafe { libc::fcntl(raw, libc::F_SETPIPE_SZ, max as c_int) };
        if rc < 0 {
            rc = unsafe { libc::fcntl(raw, libc::F_SETPIPE_SZ, FALLBACK_PIPE_SIZE as c_int) };
        }
    }
    let queried = unsafe { libc::fcntl(raw, libc::F_GETPIPE_SZ) };
    if queried > 0 {
        queried as usize
    } else if rc > 0 {
        rc as usize
    } else {
        FALLBACK_PIPE_SIZE
    }
}

/// Bytes currently queued in a pipe's kernel buffer.
pub(crate) fn bytes_queued(fd: BorrowedFd<'_>) -> io::Result<usize> {
    let mut n: c_int = 0;
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), libc::FIONREAD as _, &mut n) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write several buffers as one contiguous record.
pub(crate) fn write_vectored(fd: BorrowedFd<'_>, bufs: &[&[u8]]) -> io::Result<usize> {
    let iovecs: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut c_void,
            iov_len: b.len() as size_t,
        })
        .collect();
    let rc = unsafe { libc::writev(fd.as_raw_fd(), iovecs.as_ptr(), iovecs.len() as c_int) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

fn read_once(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::read(
            fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len() as size_t,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

/// Read and discard whatever is currently queued in the pipe.
pub(crate) fn drain(fd: BorrowedFd<'_>) {
    let mut scratch = [0u8; 4096];
    loop {
        match read_once(fd, &mut scratch) {
            Ok(0) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

/// Self-pipe used to interrupt a reader blocked in `poll`.
#[derive(Debug)]
pub(crate) struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let (read, write) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        Ok(Waker { read, write })
    }

    /// Interrupt the reader. Safe to call from any thread, any number of times.
    pub(crate) fn wake(&self) {
        let byte = [1u8];
        let _ = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr() as *const c_void, 1) };
    }

    /// Discard pending wake bytes so a previous cancellation does not trip the
    /// next read loop.
    pub(crate) fn clear(&self) {
        drain(self.read.as_fd());
    }
}

/// Outcome of a cancellable read.
pub(crate) enum ReadOutcome {
    /// Bytes arrived; zero means the writer side is gone.
    Data(usize),
    /// The waker fired before data arrived.
    Cancelled,
}

/// Block until the fd is readable or the waker fires, then read.
pub(crate) fn read_cancellable(
    fd: BorrowedFd<'_>,
    waker: &Waker,
    buf: &mut [u8],
) -> io::Result<ReadOutcome> {
    loop {
        let mut fds = [
            PollFd::new(fd, PollFlags::POLLIN),
            PollFd::new(waker.read.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
        if fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN))
        {
            waker.clear();
            return Ok(ReadOutcome::Cancelled);
        }
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            match read_once(fd, buf) {
                Ok(n) => return Ok(ReadOutcome::Data(n)),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => continue,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// A joinable background task with a bounded join.
///
/// The `done` receiver disconnects when the task body returns, which gives
/// [`TaskHandle::join_timeout`] a deadline without platform-specific timed
/// joins.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    thread_id: ThreadId,
}

impl TaskHandle {
    pub(crate) fn spawn<F>(name: String, body: F) -> io::Result<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, done) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(name).spawn(move || {
            body();
            drop(tx);
        })?;
        let thread_id = handle.thread().id();
        Ok(TaskHandle {
            handle,
            done,
            thread_id,
        })
    }

    pub(crate) fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Join with a deadline. Returns false (and detaches the thread) if the
    /// task did not finish in time.
    pub(crate) fn join_timeout(self, timeout: Duration) -> bool {
        match self.done.recv_timeout(timeout) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    "timed out joining thread {:?} after {:?}",
                    self.handle.thread().name(),
                    timeout
                );
                false
            }
            // Disconnection means the body returned; the join below is quick.
            _ => {
                let _ = self.handle.join();
                true
            }
        }
    }
}
