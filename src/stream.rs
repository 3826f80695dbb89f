//! Non-blocking stream used by relay sessions and health probes: a TCP
//! socket with optional rustls on top and byte buffers on both sides.
//! The owner drives it from readiness events and watches the buffers.

use std::{
    io::{Read, Write},
    net::SocketAddr,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use nix::{
    errno::Errno,
    sys::socket::{
        connect, getsockopt, socket, sockopt, AddressFamily, SockFlag, SockType, SockaddrStorage,
    },
};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

pub struct NetStream {
    fd: OwnedFd,
    tls: Option<Connection>,
    pub rbuf: Vec<u8>,
    pub wbuf: Vec<u8>,
    pub eof: bool,
    connecting: bool,
}

impl NetStream {
    /// Begin a non-blocking outbound connection.
    pub fn connect(addr: SocketAddr) -> Result<NetStream> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let sa = SockaddrStorage::from(addr);
        match connect(fd.as_raw_fd(), &sa) {
            Ok(()) | Err(Errno::EINPROGRESS) => {}
            Err(e) => return Err(e).context("connect"),
        }
        Ok(NetStream {
            fd,
            tls: None,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            eof: false,
            connecting: true,
        })
    }

    /// Wrap an accepted, already-connected socket.
    pub fn from_accepted(fd: OwnedFd) -> NetStream {
        NetStream {
            fd,
            tls: None,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            eof: false,
            connecting: false,
        }
    }

    pub fn start_server_tls(&mut self, config: Arc<ServerConfig>) -> Result<()> {
        let conn = ServerConnection::new(config).context("tls accept setup")?;
        self.tls = Some(Connection::Server(conn));
        Ok(())
    }

    pub fn start_client_tls(
        &mut self,
        config: Arc<ClientConfig>,
        name: rustls::pki_types::ServerName<'static>,
    ) -> Result<()> {
        let conn = ClientConnection::new(config, name).context("tls connect setup")?;
        self.tls = Some(Connection::Client(conn));
        Ok(())
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub fn connecting(&self) -> bool {
        self.connecting
    }

    /// Resolve a pending non-blocking connect after a writable event.
    pub fn connect_done(&mut self) -> Result<()> {
        self.connecting = false;
        let err = getsockopt(&self.fd, sockopt::SocketError)?;
        if err != 0 {
            return Err(anyhow!(std::io::Error::from_raw_os_error(err)));
        }
        Ok(())
    }

    pub fn handshaking(&self) -> bool {
        self.tls.as_ref().map_or(false, |c| c.is_handshaking())
    }

    /// Whether the poller should watch for writability.
    pub fn wants_write(&self) -> bool {
        if self.connecting {
            return true;
        }
        if !self.wbuf.is_empty() {
            return true;
        }
        self.tls.as_ref().map_or(false, |c| c.wants_write())
    }

    /// Pull socket bytes into `rbuf` (decrypting when TLS is active).
    /// Returns the number of new plaintext bytes.
    pub fn do_read(&mut self) -> Result<usize> {
        let before = self.rbuf.len();
        match &mut self.tls {
            None => loop {
                let mut buf = [0u8; 16384];
                match nix::unistd::read(self.fd.as_fd(), &mut buf) {
                    Ok(0) => {
                        self.eof = true;
                        break;
                    }
                    Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECONNRESET) => {
                        self.eof = true;
                        break;
                    }
                    Err(e) => return Err(e).context("read"),
                }
            },
            Some(conn) => {
                let mut sock = SockIo(self.fd.as_fd());
                loop {
                    match conn.read_tls(&mut sock) {
                        Ok(0) => {
                            self.eof = true;
                            break;
                        }
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                            self.eof = true;
                            break;
                        }
                        Err(e) => return Err(e).context("tls read"),
                    }
                    conn.process_new_packets()
                        .map_err(|e| anyhow!("tls error: {e}"))?;
                }
                let mut buf = [0u8; 16384];
                loop {
                    match conn.reader().read(&mut buf) {
                        Ok(0) => {
                            self.eof = true;
                            break;
                        }
                        Ok(n) => self.rbuf.extend_from_slice(&buf[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            self.eof = true;
                            break;
                        }
                        Err(e) => return Err(anyhow!("tls plaintext read: {e}")),
                    }
                }
            }
        }
        Ok(self.rbuf.len() - before)
    }

    /// Push `wbuf` (and pending TLS records) toward the socket.
    pub fn do_write(&mut self) -> Result<()> {
        match &mut self.tls {
            None => {
                while !self.wbuf.is_empty() {
                    match nix::unistd::write(self.fd.as_fd(), &self.wbuf) {
                        Ok(0) => break,
                        Ok(n) => {
                            self.wbuf.drain(..n);
                        }
                        Err(Errno::EAGAIN) => break,
                        Err(Errno::EINTR) => continue,
                        Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                            self.eof = true;
                            self.wbuf.clear();
                            break;
                        }
                        Err(e) => return Err(e).context("write"),
                    }
                }
            }
            Some(conn) => {
                if !conn.is_handshaking() && !self.wbuf.is_empty() {
                    match conn.writer().write(&self.wbuf) {
                        Ok(n) => {
                            self.wbuf.drain(..n);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(anyhow!("tls buffer write: {e}")),
                    }
                }
                let mut sock = SockIo(self.fd.as_fd());
                while conn.wants_write() {
                    match conn.write_tls(&mut sock) {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e)
                            if matches!(
                                e.kind(),
                                std::io::ErrorKind::BrokenPipe
                                    | std::io::ErrorKind::ConnectionReset
                            ) =>
                        {
                            self.eof = true;
                            break;
                        }
                        Err(e) => return Err(anyhow!("tls write: {e}")),
                    }
                }
            }
        }
        Ok(())
    }

    pub fn queue(&mut self, bytes: &[u8]) {
        self.wbuf.extend_from_slice(bytes);
    }

    /// Send a TLS close_notify (no-op without TLS).
    pub fn send_close_notify(&mut self) {
        if let Some(conn) = &mut self.tls {
            conn.send_close_notify();
        }
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        let _ = nix::sys::socket::setsockopt(&self.fd, sockopt::TcpNoDelay, &on);
    }

    pub fn set_buffer_sizes(&self, rcv: Option<usize>, snd: Option<usize>) {
        if let Some(n) = rcv {
            let _ = nix::sys::socket::setsockopt(&self.fd, sockopt::RcvBuf, &n);
        }
        if let Some(n) = snd {
            let _ = nix::sys::socket::setsockopt(&self.fd, sockopt::SndBuf, &n);
        }
    }
}

impl AsFd for NetStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NetStream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

/// io::Read/Write over a borrowed fd for rustls record pumping.
struct SockIo<'a>(BorrowedFd<'a>);

impl Read for SockIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        nix::unistd::read(self.0, buf).map_err(std::io::Error::from)
    }
}

impl Write for SockIo<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        nix::unistd::write(self.0, buf).map_err(std::io::Error::from)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
