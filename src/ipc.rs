//! Length-framed message channel between privsep processes.
//!
//! Every frame is a fixed 16-byte little-endian header followed by a
//! bincode payload and, optionally, one file descriptor carried as
//! SCM_RIGHTS ancillary data on the same sendmsg call. Delivery is
//! strictly FIFO per channel; a frame whose length exceeds the per-type
//! ceiling is a protocol violation and the receiver must terminate.

use std::{
    collections::VecDeque,
    io::{IoSlice, IoSliceMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
    os::unix::net::UnixStream,
};

use nix::{
    errno::Errno,
    sys::socket::{
        recvmsg, sendmsg, shutdown, socketpair, AddressFamily, ControlMessage,
        ControlMessageOwned, MsgFlags, Shutdown, SockFlag, SockType,
    },
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Wire size of the frame header.
pub const HEADER_SIZE: usize = 16;

/// Payload ceiling for ordinary control traffic.
const MAX_CTL_PAYLOAD: usize = 16 * 1024;
/// Payload ceiling for config entities carrying PEM blobs.
const MAX_BLOB_PAYLOAD: usize = 60 * 1024;
/// Payload ceiling for CA key-op requests and replies.
const MAX_KEYOP_PAYLOAD: usize = 4 * 1024;

const FLAG_FD: u16 = 0x0001;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("channel closed by peer")]
    Closed,
    #[error("ipc protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("ipc codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl From<Errno> for IpcError {
    fn from(e: Errno) -> Self {
        IpcError::Io(e.into())
    }
}

/// Message types carried on the channels. The numeric values are the
/// wire encoding and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    // configuration distribution
    CfgTable = 1,
    CfgHost = 2,
    CfgRdr = 3,
    CfgProto = 4,
    CfgRule = 5,
    CfgRelay = 6,
    CfgKeypair = 7,
    CfgPeer = 8,
    CfgDone = 9,
    // lifecycle
    CtlStart = 16,
    CtlShutdown = 17,
    CtlReset = 18,
    CtlReload = 19,
    CtlOk = 20,
    CtlFail = 21,
    CtlEnd = 22,
    // control socket queries
    ShowSummary = 32,
    ShowHosts = 33,
    ShowRelays = 34,
    ShowSessions = 35,
    ShowRedirects = 36,
    HostEnable = 37,
    HostDisable = 38,
    TableEnable = 39,
    TableDisable = 40,
    LogVerbose = 41,
    LogBrief = 42,
    Monitor = 43,
    // key operations
    CaPrivEnc = 48,
    CaPrivDec = 49,
    CaResp = 50,
    // privileged services
    BindAny = 56,
    BindAnyResp = 57,
    ScriptExec = 58,
    ScriptDone = 59,
    // state publication
    HostStatus = 64,
    SessionPublish = 65,
}

impl MsgType {
    pub fn from_wire(v: u32) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            1 => CfgTable,
            2 => CfgHost,
            3 => CfgRdr,
            4 => CfgProto,
            5 => CfgRule,
            6 => CfgRelay,
            7 => CfgKeypair,
            8 => CfgPeer,
            9 => CfgDone,
            16 => CtlStart,
            17 => CtlShutdown,
            18 => CtlReset,
            19 => CtlReload,
            20 => CtlOk,
            21 => CtlFail,
            22 => CtlEnd,
            32 => ShowSummary,
            33 => ShowHosts,
            34 => ShowRelays,
            35 => ShowSessions,
            36 => ShowRedirects,
            37 => HostEnable,
            38 => HostDisable,
            39 => TableEnable,
            40 => TableDisable,
            41 => LogVerbose,
            42 => LogBrief,
            43 => Monitor,
            48 => CaPrivEnc,
            49 => CaPrivDec,
            50 => CaResp,
            56 => BindAny,
            57 => BindAnyResp,
            58 => ScriptExec,
            59 => ScriptDone,
            64 => HostStatus,
            65 => SessionPublish,
            _ => return None,
        })
    }

    fn max_payload(self) -> usize {
        use MsgType::*;
        match self {
            CfgRelay | CfgProto | CfgTable | CfgKeypair => MAX_BLOB_PAYLOAD,
            CaPrivEnc | CaPrivDec | CaResp => MAX_KEYOP_PAYLOAD,
            _ => MAX_CTL_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub typ: MsgType,
    pub len: u16,
    pub flags: u16,
    pub peer_id: u32,
    pub pid: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&(self.typ as u32).to_le_bytes());
        buf[4..6].copy_from_slice(&self.len.to_le_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..12].copy_from_slice(&self.peer_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, IpcError> {
        let raw = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let typ = MsgType::from_wire(raw)
            .ok_or_else(|| IpcError::Protocol(format!("unknown message type {raw}")))?;
        let len = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if (len as usize) < HEADER_SIZE {
            return Err(IpcError::Protocol(format!("runt frame, len {len}")));
        }
        if len as usize - HEADER_SIZE > typ.max_payload() {
            return Err(IpcError::Protocol(format!(
                "oversize {typ:?} frame, len {len}"
            )));
        }
        Ok(Header {
            typ,
            len,
            flags: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            peer_id: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            pid: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// A received message. The payload excludes the header; the fd slot is
/// populated when the sender attached a descriptor to this frame.
#[derive(Debug)]
pub struct Imsg {
    pub hdr: Header,
    pub payload: Vec<u8>,
    pub fd: Option<OwnedFd>,
}

impl Imsg {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, IpcError> {
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn take_fd(&mut self) -> Result<OwnedFd, IpcError> {
        self.fd
            .take()
            .ok_or_else(|| IpcError::Protocol(format!("{:?} frame without fd", self.hdr.typ)))
    }
}

struct PendingWrite {
    data: Vec<u8>,
    off: usize,
    fd: Option<OwnedFd>,
}

/// One endpoint of a duplex message channel.
pub struct Channel {
    fd: OwnedFd,
    rbuf: Vec<u8>,
    rfds: VecDeque<OwnedFd>,
    wqueue: VecDeque<PendingWrite>,
}

impl Channel {
    /// A connected pair of non-blocking channel endpoints.
    pub fn pair() -> Result<(Channel, Channel), IpcError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )?;
        Ok((Channel::from_fd(a), Channel::from_fd(b)))
    }

    pub fn from_fd(fd: OwnedFd) -> Channel {
        Channel {
            fd,
            rbuf: Vec::new(),
            rfds: VecDeque::new(),
            wqueue: VecDeque::new(),
        }
    }

    pub fn from_stream(stream: UnixStream) -> Channel {
        Channel::from_fd(OwnedFd::from(stream))
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), IpcError> {
        set_nonblocking(self.fd.as_raw_fd(), nonblocking)?;
        Ok(())
    }

    /// Forcefully shut down the socket without consuming the channel.
    pub fn shutdown(&self) {
        let _ = shutdown(self.fd.as_raw_fd(), Shutdown::Both);
    }

    fn compose<T: Serialize>(
        typ: MsgType,
        peer_id: u32,
        flags: u16,
        payload: &T,
    ) -> Result<Vec<u8>, IpcError> {
        let body = bincode::serialize(payload)?;
        if body.len() > typ.max_payload() {
            return Err(IpcError::Protocol(format!(
                "{typ:?} payload {} exceeds ceiling",
                body.len()
            )));
        }
        let hdr = Header {
            typ,
            len: (HEADER_SIZE + body.len()) as u16,
            flags,
            peer_id,
            pid: std::process::id(),
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&hdr.encode());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn send<T: Serialize>(
        &mut self,
        typ: MsgType,
        peer_id: u32,
        payload: &T,
    ) -> Result<(), IpcError> {
        let frame = Self::compose(typ, peer_id, 0, payload)?;
        self.enqueue(frame, None)
    }

    /// Send an already-serialised payload, e.g. when fanning the same
    /// frame out to several peers or forwarding a record verbatim.
    pub fn send_raw(&mut self, typ: MsgType, peer_id: u32, payload: &[u8]) -> Result<(), IpcError> {
        if payload.len() > typ.max_payload() {
            return Err(IpcError::Protocol(format!(
                "{typ:?} payload {} exceeds ceiling",
                payload.len()
            )));
        }
        let hdr = Header {
            typ,
            len: (HEADER_SIZE + payload.len()) as u16,
            flags: 0,
            peer_id,
            pid: std::process::id(),
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&hdr.encode());
        frame.extend_from_slice(payload);
        self.enqueue(frame, None)
    }

    pub fn send_with_fd<T: Serialize>(
        &mut self,
        typ: MsgType,
        peer_id: u32,
        payload: &T,
        fd: OwnedFd,
    ) -> Result<(), IpcError> {
        let frame = Self::compose(typ, peer_id, FLAG_FD, payload)?;
        self.enqueue(frame, Some(fd))
    }

    fn enqueue(&mut self, data: Vec<u8>, fd: Option<OwnedFd>) -> Result<(), IpcError> {
        self.wqueue.push_back(PendingWrite { data, off: 0, fd });
        self.flush()?;
        Ok(())
    }

    /// Drain the write queue as far as the socket allows. Returns true
    /// while frames remain queued (caller keeps EPOLLOUT interest).
    pub fn flush(&mut self) -> Result<bool, IpcError> {
        while let Some(front) = self.wqueue.front_mut() {
            let iov = [IoSlice::new(&front.data[front.off..])];
            // The fd rides with the first byte of its frame.
            let res = match (front.off, front.fd.as_ref()) {
                (0, Some(fd)) => {
                    let fds = [fd.as_raw_fd()];
                    let cmsg = [ControlMessage::ScmRights(&fds)];
                    sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                }
                _ => sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
            };
            match res {
                Ok(n) => {
                    if n > 0 {
                        front.fd = None;
                    }
                    front.off += n;
                    if front.off >= front.data.len() {
                        self.wqueue.pop_front();
                    }
                }
                Err(Errno::EAGAIN) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(IpcError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    pub fn has_pending(&self) -> bool {
        !self.wqueue.is_empty()
    }

    /// Next complete message, reading from the socket as needed. Returns
    /// Ok(None) when the socket would block before a full frame is
    /// available (never on a blocking socket).
    pub fn recv(&mut self) -> Result<Option<Imsg>, IpcError> {
        loop {
            if let Some(msg) = self.take_message()? {
                return Ok(Some(msg));
            }
            match self.fill()? {
                0 => return Ok(None),
                _ => continue,
            }
        }
    }

    /// Parse one message out of the receive buffer, if complete.
    fn take_message(&mut self) -> Result<Option<Imsg>, IpcError> {
        if self.rbuf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let hdr = Header::decode(&self.rbuf[..HEADER_SIZE])?;
        let total = hdr.len as usize;
        if self.rbuf.len() < total {
            return Ok(None);
        }
        let payload = self.rbuf[HEADER_SIZE..total].to_vec();
        self.rbuf.drain(..total);
        let fd = if hdr.flags & FLAG_FD != 0 {
            match self.rfds.pop_front() {
                Some(fd) => Some(fd),
                None => {
                    return Err(IpcError::Protocol(format!(
                        "{:?} frame promised an fd that never arrived",
                        hdr.typ
                    )))
                }
            }
        } else {
            None
        };
        Ok(Some(Imsg { hdr, payload, fd }))
    }

    /// One read from the socket into the receive buffer. Returns the
    /// number of bytes absorbed; 0 means the read would block.
    fn fill(&mut self) -> Result<usize, IpcError> {
        let mut buf = [0u8; 65536];
        let mut cmsg = nix::cmsg_space!([RawFd; 8]);
        let (n, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN) => return Ok(0),
                Err(Errno::EINTR) => return Ok(0),
                Err(Errno::ECONNRESET) => return Err(IpcError::Closed),
                Err(e) => return Err(e.into()),
            };
            let mut fds = Vec::new();
            for c in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(raw) = c {
                    for fd in raw {
                        fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                    }
                }
            }
            (msg.bytes, fds)
        };
        if n == 0 {
            return Err(IpcError::Closed);
        }
        self.rbuf.extend_from_slice(&buf[..n]);
        self.rfds.extend(fds);
        Ok(n)
    }
}

/// Toggle O_NONBLOCK on any descriptor.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if libc::fcntl(fd, libc::F_SETFL, flags) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::write;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[test]
    fn roundtrip() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let ping = Ping {
            seq: 7,
            note: "hello".into(),
        };
        a.send(MsgType::CtlOk, 42, &ping).unwrap();
        let msg = b.recv().unwrap().unwrap();
        assert_eq!(msg.hdr.typ, MsgType::CtlOk);
        assert_eq!(msg.hdr.peer_id, 42);
        assert_eq!(msg.hdr.pid, std::process::id());
        assert_eq!(msg.decode::<Ping>().unwrap(), ping);
        assert!(msg.fd.is_none());
    }

    #[test]
    fn reassembles_arbitrary_splits() {
        // Any re-chunking of the byte stream must yield the same message
        // sequence on the receiving side.
        let mut stream = Vec::new();
        for seq in 0..5u32 {
            let frame = Channel::compose(
                MsgType::HostStatus,
                seq,
                0,
                &Ping {
                    seq,
                    note: "x".repeat(seq as usize * 31),
                },
            )
            .unwrap();
            stream.extend_from_slice(&frame);
        }

        for chunk in [1usize, 3, 7, 16, 64] {
            let (a, mut b) = Channel::pair().unwrap();
            for piece in stream.chunks(chunk) {
                write(a.fd.as_fd(), piece).unwrap();
            }
            for seq in 0..5u32 {
                let msg = b.recv().unwrap().unwrap();
                assert_eq!(msg.hdr.peer_id, seq, "chunk size {chunk}");
                assert_eq!(msg.decode::<Ping>().unwrap().seq, seq);
            }
            assert!(b.recv().unwrap().is_none());
        }
    }

    #[test]
    fn passes_fd_with_frame() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let (x, y) = Channel::pair().unwrap();
        drop(y);
        a.send_with_fd(MsgType::CfgPeer, 1, &3u32, x.fd).unwrap();
        a.send(MsgType::CfgDone, 0, &()).unwrap();

        let mut first = b.recv().unwrap().unwrap();
        assert_eq!(first.hdr.typ, MsgType::CfgPeer);
        first.take_fd().unwrap();
        let second = b.recv().unwrap().unwrap();
        assert_eq!(second.hdr.typ, MsgType::CfgDone);
        assert!(second.fd.is_none());
    }

    #[test]
    fn oversize_frame_is_fatal() {
        let (a, mut b) = Channel::pair().unwrap();
        let hdr = Header {
            typ: MsgType::CtlOk,
            len: u16::MAX,
            flags: 0,
            peer_id: 0,
            pid: 0,
        };
        write(a.fd.as_fd(), &hdr.encode()).unwrap();
        match b.recv() {
            Err(IpcError::Protocol(_)) => {}
            other => panic!("expected protocol violation, got {other:?}"),
        }
    }

    #[test]
    fn oversize_payload_refused_at_sender() {
        let (mut a, _b) = Channel::pair().unwrap();
        let blob = vec![0u8; MAX_KEYOP_PAYLOAD + 1];
        assert!(matches!(
            a.send(MsgType::CaResp, 0, &blob),
            Err(IpcError::Protocol(_))
        ));
    }

    #[test]
    fn eagain_queues_and_flushes() {
        let (mut a, mut b) = Channel::pair().unwrap();
        let payload = Ping {
            seq: 1,
            note: "y".repeat(8000),
        };
        // Fill the socket buffer until writes start queuing.
        let mut sent = 0u32;
        while !a.has_pending() {
            a.send(MsgType::SessionPublish, sent, &payload).unwrap();
            sent += 1;
            if sent > 10_000 {
                panic!("socket buffer never filled");
            }
        }
        // Drain the reader side and keep flushing; every frame must come
        // out in order.
        let mut got = 0u32;
        loop {
            while let Some(msg) = b.recv().unwrap() {
                assert_eq!(msg.hdr.peer_id, got);
                got += 1;
            }
            if !a.flush().unwrap() && got == sent {
                break;
            }
        }
    }
}
