//! Control socket: a unix stream listener owned by the parent, speaking
//! the same frame format as the worker channels. Queries stream typed
//! records terminated by CTL_END; mutating commands need a privileged
//! peer and answer CTL_OK or CTL_FAIL.

use std::{
    collections::HashMap,
    net::SocketAddr,
    os::unix::fs::PermissionsExt,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use nix::sys::socket::{getsockopt, sockopt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ipc::{Channel, Imsg, IpcError, MsgType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: u32,
    pub name: String,
    pub table: String,
    pub state: String,
    pub weight: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRecord {
    pub id: u32,
    pub name: String,
    pub listen: SocketAddr,
    pub flags: String,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdrRecord {
    pub id: u32,
    pub name: String,
    pub listen: SocketAddr,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub kind: String,
    pub id: u32,
    pub name: String,
    pub status: String,
}

pub struct CtlConn {
    pub chan: Channel,
    pub uid: u32,
    pub monitor: bool,
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    conns: HashMap<u32, CtlConn>,
    next_id: u32,
}

impl ControlServer {
    pub fn bind(path: &Path) -> Result<ControlServer> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .with_context(|| format!("control socket {}", path.display()))?;
        listener.set_nonblocking(true)?;
        // owner and group may drive the daemon
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660));
        Ok(ControlServer {
            listener,
            path: path.to_path_buf(),
            conns: HashMap::new(),
            next_id: 0,
        })
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Accept every pending connection; returns the new ids for poller
    /// registration.
    pub fn accept(&mut self) -> Vec<u32> {
        let mut fresh = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let uid = getsockopt(&stream, sockopt::PeerCredentials)
                        .map(|cred| cred.uid())
                        .unwrap_or(u32::MAX);
                    self.next_id = self.next_id.wrapping_add(1).max(1);
                    let id = self.next_id;
                    self.conns.insert(
                        id,
                        CtlConn {
                            chan: Channel::from_stream(stream),
                            uid,
                            monitor: false,
                        },
                    );
                    debug!(conn = id, uid, "control connection");
                    fresh.push(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(%e, "control accept failed");
                    break;
                }
            }
        }
        fresh
    }

    pub fn conn(&self, id: u32) -> Option<&CtlConn> {
        self.conns.get(&id)
    }

    pub fn conn_mut(&mut self, id: u32) -> Option<&mut CtlConn> {
        self.conns.get_mut(&id)
    }

    /// Whether the peer may run mutating commands.
    pub fn privileged(&self, id: u32) -> bool {
        self.conns
            .get(&id)
            .map_or(false, |c| c.uid == 0 || c.uid == nix::unistd::geteuid().as_raw())
    }

    pub fn recv(&mut self, id: u32) -> Result<Option<Imsg>, IpcError> {
        match self.conns.get_mut(&id) {
            Some(conn) => conn.chan.recv(),
            None => Ok(None),
        }
    }

    pub fn send<T: Serialize>(&mut self, id: u32, typ: MsgType, payload: &T) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if let Err(e) = conn.chan.send(typ, 0, payload) {
                debug!(conn = id, %e, "control send failed");
            }
        }
    }

    pub fn send_raw(&mut self, id: u32, typ: MsgType, payload: &[u8]) {
        if let Some(conn) = self.conns.get_mut(&id) {
            if let Err(e) = conn.chan.send_raw(typ, 0, payload) {
                debug!(conn = id, %e, "control send failed");
            }
        }
    }

    pub fn ok(&mut self, id: u32) {
        self.send(id, MsgType::CtlOk, &());
    }

    pub fn fail(&mut self, id: u32) {
        self.send(id, MsgType::CtlFail, &());
    }

    pub fn end(&mut self, id: u32) {
        self.send(id, MsgType::CtlEnd, &());
    }

    pub fn set_monitor(&mut self, id: u32, on: bool) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.monitor = on;
        }
    }

    pub fn conn_ids(&self) -> Vec<u32> {
        self.conns.keys().copied().collect()
    }

    pub fn monitor_ids(&self) -> Vec<u32> {
        self.conns
            .iter()
            .filter(|(_, c)| c.monitor)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn drop_conn(&mut self, id: u32) -> Option<CtlConn> {
        debug!(conn = id, "control connection closed");
        self.conns.remove(&id)
    }

    pub fn flush(&mut self, id: u32) -> bool {
        self.conns
            .get_mut(&id)
            .map_or(false, |c| c.chan.flush().unwrap_or(false))
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn accepts_and_frames_commands() {
        let dir = std::env::temp_dir().join(format!("shunt-ctl-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let mut server = ControlServer::bind(&dir).unwrap();

        let client = UnixStream::connect(&dir).unwrap();
        client.set_nonblocking(true).unwrap();
        let mut client_chan = Channel::from_stream(client);
        client_chan.send(MsgType::ShowHosts, 0, &()).unwrap();

        let ids = server.accept();
        assert_eq!(ids.len(), 1);
        let id = ids[0];
        // the connecting test process is the daemon owner
        assert!(server.privileged(id));

        let msg = loop {
            if let Some(msg) = server.recv(id).unwrap() {
                break msg;
            }
        };
        assert_eq!(msg.hdr.typ, MsgType::ShowHosts);

        server.send(
            id,
            MsgType::ShowHosts,
            &HostRecord {
                id: 1,
                name: "10.0.0.1:80".into(),
                table: "webpool".into(),
                state: "up".into(),
                weight: 1,
            },
        );
        server.end(id);

        let record = loop {
            if let Some(msg) = client_chan.recv().unwrap() {
                break msg;
            }
        };
        let host: HostRecord = record.decode().unwrap();
        assert_eq!(host.table, "webpool");
        let end = loop {
            if let Some(msg) = client_chan.recv().unwrap() {
                break msg;
            }
        };
        assert_eq!(end.hdr.typ, MsgType::CtlEnd);
    }
}
