// PSP PROXY — SERIAL TRANSPORT
// Device URI: serial://<path>:<baud>:<databits>:<parity [n|o|e]>:<stopbits>.
// The tty runs raw (no canonical mode, echo or signals; VMIN=0, VTIME=0).
// The descriptor stays O_NONBLOCK for its whole life; write() loops on
// poll(POLLOUT), so the observable contract is still "the whole packet is
// out or the call failed".

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use log::debug;

use crate::error::{ProxyError, Result};
use crate::transport::{fionread, poll_readable, Interrupter, PollOutcome, SelfPipe, Transport};

/// Baud rates the stub side is known to run at.
const BAUD_TABLE: [(u32, libc::speed_t); 5] = [
    (9600, libc::B9600),
    (19200, libc::B19200),
    (38400, libc::B38400),
    (57600, libc::B57600),
    (115200, libc::B115200),
];

struct SerialParams {
    path: String,
    speed: libc::speed_t,
    csize: libc::tcflag_t,
    parity: libc::tcflag_t,
    stop: libc::tcflag_t,
}

fn parse_details(details: &str) -> Result<SerialParams> {
    let bad = || ProxyError::InvalidDeviceUri(format!("serial://{details}"));

    let parts: Vec<&str> = details.split(':').collect();
    if parts.len() != 5 {
        return Err(bad());
    }
    let baud: u32 = parts[1].parse().map_err(|_| bad())?;
    let speed = BAUD_TABLE
        .iter()
        .find(|(b, _)| *b == baud)
        .map(|(_, s)| *s)
        .ok_or_else(bad)?;
    let csize = match parts[2] {
        "5" => libc::CS5,
        "6" => libc::CS6,
        "7" => libc::CS7,
        "8" => libc::CS8,
        _ => return Err(bad()),
    };
    let parity = match parts[3] {
        "n" => 0,
        "o" => libc::PARENB | libc::PARODD,
        "e" => libc::PARENB,
        _ => return Err(bad()),
    };
    let stop = match parts[4] {
        "1" => 0,
        "2" => libc::CSTOPB,
        _ => return Err(bad()),
    };
    Ok(SerialParams { path: parts[0].to_string(), speed, csize, parity, stop })
}

pub struct SerialTransport {
    fd: RawFd,
    pipe: SelfPipe,
}

impl SerialTransport {
    pub fn open(details: &str) -> Result<Self> {
        let params = parse_details(details)?;

        let path = CString::new(params.path.as_str())
            .map_err(|_| ProxyError::InvalidDeviceUri(format!("serial://{details}")))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let xport = SerialTransport { fd, pipe: SelfPipe::new().map_err(ProxyError::Transport)? };
        xport.configure(&params)?;
        debug!("serial transport on {} configured", params.path);
        Ok(xport)
    }

    fn configure(&self, params: &SerialParams) -> Result<()> {
        let mut tio: libc::termios = unsafe { std::mem::zeroed() };
        if unsafe { libc::tcgetattr(self.fd, &mut tio) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        // Raw line discipline: no input mangling, no output processing, no
        // canonical mode / echo / signal characters.
        tio.c_iflag = 0;
        tio.c_oflag = 0;
        tio.c_lflag = 0;
        tio.c_cflag = libc::CREAD | libc::CLOCAL | params.csize | params.parity | params.stop;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;

        unsafe {
            if libc::cfsetispeed(&mut tio, params.speed) != 0
                || libc::cfsetospeed(&mut tio, params.speed) != 0
            {
                return Err(io::Error::last_os_error().into());
            }
            if libc::tcflush(self.fd, libc::TCIOFLUSH) != 0 {
                return Err(io::Error::last_os_error().into());
            }
            if libc::tcsetattr(self.fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error().into());
            }
            let flags = libc::fcntl(self.fd, libc::F_GETFL);
            if flags < 0 || libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Block until the tty accepts more output bytes.
    fn wait_writable(&self) -> Result<()> {
        let mut fds =
            [libc::pollfd { fd: self.fd, events: libc::POLLOUT | libc::POLLERR, revents: 0 }];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, -1) };
            if rc > 0 {
                if fds[0].revents & libc::POLLERR != 0 {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tty error").into());
                }
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        }
    }
}

impl Transport for SerialTransport {
    fn peek(&mut self) -> usize {
        fionread(self.fd)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc > 0 {
            return Ok(rc as usize);
        }
        if rc == 0 {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "tty hung up").into());
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        Err(err.into())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let mut rest = buf;
        while !rest.is_empty() {
            let rc = unsafe {
                libc::write(self.fd, rest.as_ptr() as *const libc::c_void, rest.len())
            };
            if rc > 0 {
                rest = &rest[rc as usize..];
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => self.wait_writable()?,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn poll(&mut self, ms: u32) -> Result<PollOutcome> {
        poll_readable(self.fd, &self.pipe, ms)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        self.pipe.interrupter()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
