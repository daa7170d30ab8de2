// PSP PROXY — TCP TRANSPORT
// Device URI: tcp://<host>:<port>. Nagle is disabled so a PDU leaves the
// host as soon as its footer is written.

use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;

use crate::error::{ProxyError, Result};
use crate::transport::{fionread, poll_readable, Interrupter, PollOutcome, SelfPipe, Transport};

pub struct TcpTransport {
    stream: TcpStream,
    pipe: SelfPipe,
}

impl TcpTransport {
    /// `details` is the URI remainder, `<host>:<port>`.
    pub fn open(details: &str) -> Result<Self> {
        let (host, port) = details
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::InvalidDeviceUri(format!("tcp://{details}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::InvalidDeviceUri(format!("tcp://{details}")))?;

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(ProxyError::Transport)?
            .collect::<Vec<_>>();
        let stream = TcpStream::connect(&addrs[..]).map_err(ProxyError::Transport)?;
        stream.set_nodelay(true).map_err(ProxyError::Transport)?;
        debug!("tcp transport connected to {host}:{port}");

        Ok(TcpTransport { stream, pipe: SelfPipe::new().map_err(ProxyError::Transport)? })
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Transport for TcpTransport {
    fn peek(&mut self) -> usize {
        fionread(self.fd())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc > 0 {
            return Ok(rc as usize);
        }
        if rc == 0 {
            // Orderly shutdown by the peer: the link is gone.
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer closed the connection",
            )
            .into());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        Err(err.into())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(ProxyError::Transport)
    }

    fn poll(&mut self, ms: u32) -> Result<PollOutcome> {
        poll_readable(self.fd(), &self.pipe, ms)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        self.pipe.interrupter()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn rejects_malformed_uris() {
        assert!(matches!(TcpTransport::open("nohost"), Err(ProxyError::InvalidDeviceUri(_))));
        assert!(matches!(TcpTransport::open("host:notaport"), Err(ProxyError::InvalidDeviceUri(_))));
    }

    #[test]
    fn loopback_roundtrip_and_peek() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut xport = TcpTransport::open(&format!("127.0.0.1:{port}")).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        xport.write(b"ping").unwrap();
        let mut ab = [0u8; 4];
        peer.read_exact(&mut ab).unwrap();
        assert_eq!(&ab, b"ping");

        peer.write_all(b"pong").unwrap();
        assert_eq!(xport.poll(1000).unwrap(), PollOutcome::Ready);
        assert!(xport.peek() > 0);
        let mut ab = [0u8; 16];
        let n = xport.read(&mut ab).unwrap();
        assert_eq!(&ab[..n], b"pong");

        // Nothing queued: the non-blocking read reports no data.
        assert_eq!(xport.read(&mut ab).unwrap(), 0);
    }

    #[test]
    fn peer_close_fails_the_read() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut xport = TcpTransport::open(&format!("127.0.0.1:{port}")).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        assert_eq!(xport.poll(1000).unwrap(), PollOutcome::Ready);
        let mut ab = [0u8; 4];
        assert!(xport.read(&mut ab).is_err());
    }
}
