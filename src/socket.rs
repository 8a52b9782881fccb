//! Non-blocking socket handle (§4.3).
//!
//! Every operation returns a tri-state [`Outcome`]: `Done` (completed),
//! `Pending` (would block — caller arms the matching interest and waits for
//! readiness), or an error. The reactor never calls these itself; it only
//! delivers readiness, the owning [`crate::object::ActiveObject`] decides
//! when to call them.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket as StdUdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{CoreError, SocketErrorSnafu};
use snafu::ResultExt;

/// Result of a single non-blocking I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation completed, transferring `n` bytes (0 for control
    /// operations such as `connect`/`accept` completing).
    Done(usize),
    /// The operation would have blocked; the caller should arm the
    /// corresponding interest and wait for a readiness event.
    Pending,
}

fn classify(result: io::Result<usize>) -> Result<Outcome, CoreError> {
    match result {
        Ok(n) => Ok(Outcome::Done(n)),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Outcome::Pending),
        Err(e) => Err(e).context(SocketErrorSnafu),
    }
}

fn nix_errno_as_io_error(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e.as_errno().map(|errno| errno as i32).unwrap_or(libc::EIO))
}

fn set_nonblocking(fd: RawFd) -> Result<(), CoreError> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(nix_errno_as_io_error)
        .context(SocketErrorSnafu)?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflags))
        .map_err(nix_errno_as_io_error)
        .context(SocketErrorSnafu)?;
    Ok(())
}

/// A connected (or connecting) non-blocking TCP stream.
pub struct TcpSocket {
    stream: TcpStream,
    pending_recv: bool,
    pending_send: bool,
}

impl TcpSocket {
    pub fn connect_nonblocking(addr: SocketAddr) -> Result<(Self, Outcome), CoreError> {
        let domain = if addr.is_ipv4() {
            nix::sys::socket::AddressFamily::Inet
        } else {
            nix::sys::socket::AddressFamily::Inet6
        };
        let fd = nix::sys::socket::socket(
            domain,
            nix::sys::socket::SockType::Stream,
            nix::sys::socket::SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(nix_errno_as_io_error)
        .context(SocketErrorSnafu)?;
        use std::os::unix::io::FromRawFd;
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        // `std::net::TcpStream` has no non-blocking-connect constructor, so
        // the connect itself is issued against the raw fd created above.
        let sockaddr =
            nix::sys::socket::SockAddr::new_inet(nix::sys::socket::InetAddr::from_std(&addr));
        let outcome = match nix::sys::socket::connect(fd, &sockaddr) {
            Ok(()) => Outcome::Done(0),
            Err(nix::Error::Sys(nix::errno::Errno::EINPROGRESS)) => Outcome::Pending,
            Err(e) => return Err(nix_errno_as_io_error(e)).context(SocketErrorSnafu),
        };
        Ok((
            TcpSocket {
                stream,
                pending_recv: false,
                pending_send: false,
            },
            outcome,
        ))
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, CoreError> {
        set_nonblocking(stream.as_raw_fd())?;
        Ok(TcpSocket {
            stream,
            pending_recv: false,
            pending_send: false,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn has_pending_recv(&self) -> bool {
        self.pending_recv
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending_send
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Result<Outcome, CoreError> {
        let outcome = classify((&self.stream).read(buf))?;
        self.pending_recv = outcome == Outcome::Pending;
        Ok(outcome)
    }

    pub fn send(&mut self, buf: &[u8]) -> Result<Outcome, CoreError> {
        let outcome = classify((&self.stream).write(buf))?;
        self.pending_send = outcome == Outcome::Pending;
        Ok(outcome)
    }
}

/// A non-blocking TCP listening socket.
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr) -> Result<Self, CoreError> {
        let listener = TcpListener::bind(addr).context(SocketErrorSnafu)?;
        listener.set_nonblocking(true).context(SocketErrorSnafu)?;
        Ok(TcpAcceptor { listener })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn accept(&mut self) -> Result<(Outcome, Option<(TcpSocket, SocketAddr)>), CoreError> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                let sock = TcpSocket::from_stream(stream)?;
                Ok((Outcome::Done(0), Some((sock, addr))))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((Outcome::Pending, None)),
            Err(e) => Err(e).context(SocketErrorSnafu),
        }
    }
}

/// A non-blocking UDP socket.
pub struct UdpSocket {
    sock: StdUdpSocket,
    pending_recv: bool,
    pending_send: bool,
}

impl UdpSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self, CoreError> {
        let sock = StdUdpSocket::bind(addr).context(SocketErrorSnafu)?;
        sock.set_nonblocking(true).context(SocketErrorSnafu)?;
        Ok(UdpSocket {
            sock,
            pending_recv: false,
            pending_send: false,
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    pub fn has_pending_recv(&self) -> bool {
        self.pending_recv
    }

    pub fn has_pending_send(&self) -> bool {
        self.pending_send
    }

    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(Outcome, Option<SocketAddr>), CoreError> {
        match self.sock.recv_from(buf) {
            Ok((n, addr)) => {
                self.pending_recv = false;
                Ok((Outcome::Done(n), Some(addr)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.pending_recv = true;
                Ok((Outcome::Pending, None))
            }
            Err(e) => Err(e).context(SocketErrorSnafu),
        }
    }

    pub fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<Outcome, CoreError> {
        let outcome = classify(self.sock.send_to(buf, addr))?;
        self.pending_send = outcome == Outcome::Pending;
        Ok(outcome)
    }
}

/// Owning handle to one of the three socket flavors a slot may hold.
pub enum Socket {
    Tcp(TcpSocket),
    Acceptor(TcpAcceptor),
    Udp(UdpSocket),
}

impl Socket {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.raw_fd(),
            Socket::Acceptor(s) => s.raw_fd(),
            Socket::Udp(s) => s.raw_fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn recv_on_fresh_connection_pair_is_pending_until_data_arrives() {
        let listener = TcpAcceptor::bind(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            0,
        )))
        .unwrap();
        let addr = {
            let std_listener = &listener.listener;
            std_listener.local_addr().unwrap()
        };
        let (mut client, outcome) = TcpSocket::connect_nonblocking(addr).unwrap();
        assert_matches!(outcome, Outcome::Done(_) | Outcome::Pending);

        // Give the kernel a moment to complete the loopback handshake.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut listener = listener;
        let (accept_outcome, accepted) = loop {
            let r = listener.accept().unwrap();
            if r.1.is_some() || r.0 == Outcome::Pending {
                break r;
            }
        };
        if let Some((mut server_sock, _)) = accepted {
            let mut buf = [0u8; 16];
            let r = server_sock.recv(&mut buf).unwrap();
            assert_eq!(r, Outcome::Pending);
            assert!(server_sock.has_pending_recv());

            let w = client.send(b"hi").unwrap();
            assert_matches!(w, Outcome::Done(_) | Outcome::Pending);
        } else {
            assert_eq!(accept_outcome, Outcome::Pending);
        }
    }
}
