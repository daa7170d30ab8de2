// PSP PROXY — TRANSPORT LAYER
// One trait, three backends: a TCP socket, a termios serial line, and a SPI
// flash emulator carrying ring buffers. The engine only ever sees the trait.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{ProxyError, Result};

pub mod flash;
pub mod serial;
pub mod tcp;

/// Outcome of a bounded wait for readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Data can be read (or the link reported a state change worth a read).
    Ready,
    /// The wait elapsed with nothing to read.
    TimedOut,
}

/// Byte-stream transport between the host and the stub.
///
/// All methods report failures as errors instead of panicking; a failed
/// `read`/`write` means the link is lost for good.
pub trait Transport {
    /// Bytes available for a non-blocking read. May conservatively return 0.
    fn peek(&mut self) -> usize;

    /// Non-blocking read. `Ok(0)` means no data right now; short reads are
    /// fine. An error means the connection is gone.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Blocking write of the whole buffer, or a fatal error.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Block up to `ms` milliseconds until data could be read.
    fn poll(&mut self, ms: u32) -> Result<PollOutcome>;

    /// Handle that unblocks a concurrent `poll` from another thread or a
    /// signal handler. `None` where the backend cannot support it; callers
    /// must not assume cancellation is available.
    fn interrupter(&self) -> Option<Interrupter>;
}

/// Wakes a blocked `poll` by writing to the transport's self-pipe. The
/// interrupted poll surfaces as a transport error on the polling thread.
pub struct Interrupter {
    fd: RawFd,
}

impl Interrupter {
    pub fn interrupt(&self) {
        // Best effort; the pipe is non-blocking and a full pipe already
        // guarantees a pending wakeup.
        unsafe { libc::write(self.fd, b"x".as_ptr() as *const libc::c_void, 1) };
    }
}

impl Drop for Interrupter {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Self-pipe used by the fd-based transports to make `poll` interruptible.
pub(crate) struct SelfPipe {
    rd: RawFd,
    wr: RawFd,
}

impl SelfPipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SelfPipe { rd: fds[0], wr: fds[1] })
    }

    pub(crate) fn interrupter(&self) -> Option<Interrupter> {
        let fd = unsafe { libc::fcntl(self.wr, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return None;
        }
        Some(Interrupter { fd })
    }

    fn drain(&self) {
        let mut ab = [0u8; 16];
        while unsafe { libc::read(self.rd, ab.as_mut_ptr() as *mut libc::c_void, ab.len()) } > 0 {}
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.rd);
            libc::close(self.wr);
        }
    }
}

/// poll(2) on a single descriptor plus the self-pipe. An interrupt drains the
/// pipe and surfaces as a transport error, failing the outstanding request.
pub(crate) fn poll_readable(fd: RawFd, pipe: &SelfPipe, ms: u32) -> Result<PollOutcome> {
    let mut fds = [
        libc::pollfd { fd, events: libc::POLLIN | libc::POLLHUP | libc::POLLERR, revents: 0 },
        libc::pollfd { fd: pipe.rd, events: libc::POLLIN, revents: 0 },
    ];
    let timeout = ms.min(i32::MAX as u32) as i32;
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        if rc == 0 {
            return Ok(PollOutcome::TimedOut);
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if fds[1].revents != 0 {
            pipe.drain();
            return Err(io::Error::new(io::ErrorKind::Interrupted, "poll interrupted").into());
        }
        return Ok(PollOutcome::Ready);
    }
}

/// FIONREAD on a descriptor; 0 when the ioctl fails.
pub(crate) fn fionread(fd: RawFd) -> usize {
    let mut avail: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail) };
    if rc != 0 || avail < 0 {
        return 0;
    }
    avail as usize
}

/// Open a transport for a `scheme://details` device URI.
pub fn create(device: &str) -> Result<Box<dyn Transport>> {
    let (scheme, details) = device
        .split_once("://")
        .ok_or_else(|| ProxyError::InvalidDeviceUri(device.to_string()))?;
    match scheme {
        "tcp" => Ok(Box::new(tcp::TcpTransport::open(details)?)),
        "serial" => Ok(Box::new(serial::SerialTransport::open(details)?)),
        "em100tcp" => Ok(Box::new(flash::FlashRbTransport::open(details)?)),
        _ => Err(ProxyError::NoSuchProvider(scheme.to_string())),
    }
}
