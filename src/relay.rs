//! Relay worker: terminates client connections, applies L7 policy, and
//! forwards to checked backends. Sessions are pairs of non-blocking
//! streams pumped by readiness events; HTTP protocols run the rule
//! engine at every message head. Private keys stay in the CA process;
//! TLS handshakes sign through the paired CA channel.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd},
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use nix::{
    errno::Errno,
    sys::socket::{accept4, recvfrom, sendto, MsgFlags, SockFlag, SockaddrStorage},
};
use std::os::fd::FromRawFd;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    ca::{CaClient, RemoteKey},
    config::{
        Direction, ForwardMode, GlobalConf, HostState, HostStatusMsg, Objid, ProtoKind,
        RelayConf, Table,
    },
    event::{self, Event, Poller},
    http::{canned_response, HttpDesc, HttpOut},
    ipc::{Channel, MsgType},
    kv::NameTable,
    parent::{BindAnyMsg, SockReq},
    privsep::{self, CtlEvent, WorkerCtx, WorkerProc},
    rules::{self, ProtoRuntime, SessionMeta},
    stream::NetStream,
    tls,
};

/// Descriptors held back so the daemon can always talk to the parent
/// and accept the control plane.
const FD_RESERVE: u64 = 8;
/// Stop reading a side when the opposite write buffer backs up past
/// this; resume below it.
const WATERMARK: usize = 64 * 1024;

const TOK_PARENT: u64 = 0;
const TOK_SIGNAL: u64 = 1;

const KIND_LISTENER: u64 = 1;
const KIND_UDP: u64 = 2;
const KIND_CLIENT: u64 = 3;
const KIND_BACKEND: u64 = 4;
const KIND_SESS_TIMER: u64 = 5;
const KIND_CONN_TIMER: u64 = 6;
const KIND_UDP_TIMER: u64 = 7;

fn tok(kind: u64, id: u32) -> u64 {
    (kind << 32) | id as u64
}

fn tok_kind(token: u64) -> (u64, u32) {
    (token >> 32, token as u32)
}

/// Live session snapshot streamed for `SHOW SESSIONS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub sid: u32,
    pub relay: String,
    pub client: SocketAddr,
    pub backend: Option<SocketAddr>,
    pub state: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessState {
    Frontend,
    Connecting,
    Established,
}

struct Session {
    sid: u32,
    relay_id: Objid,
    client: NetStream,
    backend: Option<NetStream>,
    state: SessState,
    proto: Option<Rc<ProtoRuntime>>,
    request: HttpDesc,
    response: HttpDesc,
    is_http: bool,
    meta: SessionMeta,
    tags: HashSet<u32>,
    hash_bytes: Vec<u8>,
    sel_table: Option<Objid>,
    backend_addr: Option<SocketAddr>,
    /// Head+body bytes produced before the backend existed.
    pending_backend: Vec<u8>,
    /// Set at the first request head; the owning event handler
    /// performs the connect once the rule pass is done.
    want_backend: bool,
    bytes_in: u64,
    bytes_out: u64,
    closing: bool,
}

struct Listener {
    fd: OwnedFd,
    relay_id: Objid,
}

// UDP flows keep a connected datagram socket per client.
struct UdpSession {
    relay_id: Objid,
    client: SocketAddr,
    sock: OwnedFd,
}

pub struct Relay {
    ctx: WorkerCtx,
    parent: Channel,
    ca: Option<Arc<CaClient>>,
    names: Rc<RefCell<NameTable>>,
    protos: HashMap<Objid, Rc<ProtoRuntime>>,
    server_tls: HashMap<Objid, Arc<rustls::ServerConfig>>,
    client_tls: HashMap<Objid, Arc<rustls::ClientConfig>>,
    listeners: HashMap<Objid, Listener>,
    udp_listeners: HashMap<Objid, OwnedFd>,
    sessions: HashMap<u32, Session>,
    udp_sessions: HashMap<u32, UdpSession>,
    udp_by_peer: HashMap<(Objid, SocketAddr), u32>,
    host_states: HashMap<Objid, HostState>,
    rr_counters: HashMap<Objid, usize>,
    hash_seed: ahash::RandomState,
    next_sid: u32,
    fd_limit: u64,
    accept_paused: bool,
}

impl Relay {
    fn relay_conf(&self, id: Objid) -> Option<&RelayConf> {
        self.ctx.store.relays.iter().find(|r| r.id == id)
    }

    fn fds_in_use(&self) -> u64 {
        let session_fds = self
            .sessions
            .values()
            .map(|s| 1 + s.backend.is_some() as u64)
            .sum::<u64>();
        session_fds
            + self.udp_sessions.len() as u64
            + self.listeners.len() as u64
            + self.udp_listeners.len() as u64
            + 8
    }

    fn can_accept(&self) -> bool {
        can_accept(self.fds_in_use(), FD_RESERVE, self.fd_limit)
    }

    // --- config install --------------------------------------------------

    fn apply_config(&mut self, poller: &mut Poller) -> Result<()> {
        self.protos.clear();
        for proto in self.ctx.store.protos.clone() {
            let rt = ProtoRuntime::compile(proto, &self.ctx.store.rules, self.names.clone())?;
            self.protos.insert(rt.proto.id, rt);
        }

        self.server_tls.clear();
        self.client_tls.clear();
        for relay in self.ctx.store.relays.clone() {
            if relay.flags.ssl || relay.flags.ssl_inspect {
                let (Some(cert), Some(algo), Some(ca)) =
                    (relay.cert_pem.as_ref(), relay.key_algo, self.ca.as_ref())
                else {
                    warn!(relay = %relay.name, "tls relay without cert or ca channel");
                    continue;
                };
                let key = RemoteKey::new(relay.id, algo, ca.clone());
                match tls::server_config(cert, key) {
                    Ok(config) => {
                        self.server_tls.insert(relay.id, config);
                    }
                    Err(e) => warn!(relay = %relay.name, %e, "server tls setup failed"),
                }
            }
            if relay.flags.ssl_client || relay.flags.ssl_inspect {
                match tls::client_config(relay.ca_cert_pem.as_deref()) {
                    Ok(config) => {
                        self.client_tls.insert(relay.id, config);
                    }
                    Err(e) => warn!(relay = %relay.name, %e, "client tls setup failed"),
                }
            }
        }

        if self.ctx.started {
            self.sync_listeners(poller)?;
        }
        Ok(())
    }

    /// Ask the parent for listener sockets we miss and retire the ones
    /// whose relay disappeared.
    fn sync_listeners(&mut self, poller: &mut Poller) -> Result<()> {
        let live: HashSet<Objid> = self.ctx.store.relays.iter().map(|r| r.id).collect();
        let dead: Vec<Objid> = self
            .listeners
            .keys()
            .chain(self.udp_listeners.keys())
            .filter(|id| !live.contains(id))
            .copied()
            .collect();
        for id in dead {
            if let Some(listener) = self.listeners.remove(&id) {
                let _ = poller.delete(&listener.fd);
                debug!(relay = id, "listener retired");
            }
            if let Some(fd) = self.udp_listeners.remove(&id) {
                let _ = poller.delete(&fd);
                debug!(relay = id, "udp listener retired");
            }
        }

        for relay in &self.ctx.store.relays {
            let have = if relay.flags.udp {
                self.udp_listeners.contains_key(&relay.id)
            } else {
                self.listeners.contains_key(&relay.id)
            };
            if have {
                continue;
            }
            let req = if relay.flags.udp {
                SockReq::UdpListen(relay.listen)
            } else {
                SockReq::TcpListen(relay.listen)
            };
            self.parent.send(
                MsgType::BindAny,
                relay.id,
                &BindAnyMsg {
                    req_id: relay.id,
                    req,
                },
            )?;
        }
        Ok(())
    }

    fn install_listener(&mut self, poller: &mut Poller, relay_id: Objid, fd: OwnedFd) -> Result<()> {
        let Some(relay) = self.relay_conf(relay_id) else {
            return Ok(());
        };
        let is_udp = relay.flags.udp;
        let name = relay.name.clone();
        let listen = relay.listen;
        set_nonblocking(&fd)?;
        if is_udp {
            poller.add(&fd, tok(KIND_UDP, relay_id), true, false)?;
            self.udp_listeners.insert(relay_id, fd);
            info!(relay = %name, listen = %listen, "udp relay listening");
        } else {
            poller.add(&fd, tok(KIND_LISTENER, relay_id), true, false)?;
            self.listeners.insert(relay_id, Listener { fd, relay_id });
            info!(relay = %name, listen = %listen, "relay listening");
        }
        Ok(())
    }

    // --- backend selection -----------------------------------------------

    fn eligible_hosts<'a>(&self, table: &'a Table) -> Vec<&'a crate::config::HostConf> {
        table
            .hosts
            .iter()
            .filter(|h| {
                matches!(
                    self.host_states.get(&h.id).copied().unwrap_or(HostState::Unknown),
                    HostState::Up
                )
            })
            .collect()
    }

    /// Pick a backend for a session: the rule-bound table first, then
    /// the relay's forward targets in order; only Up hosts count.
    fn select_backend(
        &mut self,
        relay_id: Objid,
        sel_table: Option<Objid>,
        client: SocketAddr,
        hash_bytes: &[u8],
    ) -> Option<(Objid, SocketAddr)> {
        let relay = self.relay_conf(relay_id)?.clone();
        let mut candidates: Vec<(Objid, ForwardMode)> = Vec::new();
        if let Some(id) = sel_table {
            let mode = relay
                .targets
                .iter()
                .find(|t| t.table_id == id)
                .map(|t| t.mode)
                .unwrap_or_default();
            candidates.push((id, mode));
        }
        for target in &relay.targets {
            if Some(target.table_id) != sel_table {
                candidates.push((target.table_id, target.mode));
            }
        }

        for (table_id, mode) in candidates {
            let Some(table) = self.ctx.store.table(table_id) else { continue };
            if table.conf.disabled {
                continue;
            }
            let hosts = self.eligible_hosts(table);
            if hosts.is_empty() {
                continue;
            }
            let addr = match mode {
                ForwardMode::Roundrobin => {
                    let counter = self.rr_counters.entry(table_id).or_insert(0);
                    let host = hosts[*counter % hosts.len()];
                    *counter = counter.wrapping_add(1);
                    host.addr
                }
                ForwardMode::SourceHash => {
                    self.pick_weighted(&hosts, &addr_bytes(&client))
                }
                ForwardMode::Loadbalance => {
                    let mut input = addr_bytes(&client);
                    input.extend_from_slice(hash_bytes);
                    self.pick_weighted(&hosts, &input)
                }
                ForwardMode::Hash => self.pick_weighted(&hosts, hash_bytes),
            };
            return Some((table_id, addr));
        }
        None
    }

    fn pick_weighted(&self, hosts: &[&crate::config::HostConf], input: &[u8]) -> SocketAddr {
        use std::hash::{BuildHasher, Hasher};
        let mut hasher = self.hash_seed.build_hasher();
        hasher.write(input);
        let h = hasher.finish();
        let total: u64 = hosts.iter().map(|h| h.weight as u64).sum();
        let mut slot = h % total.max(1);
        for host in hosts {
            if slot < host.weight as u64 {
                return host.addr;
            }
            slot -= host.weight as u64;
        }
        hosts[0].addr
    }

    // --- tcp sessions ----------------------------------------------------

    fn accept(&mut self, poller: &mut Poller, relay_id: Objid) -> Result<()> {
        loop {
            if !self.can_accept() {
                self.pause_accept(poller);
                return Ok(());
            }
            let Some(listener) = self.listeners.get(&relay_id) else { return Ok(()) };
            let fd = match accept4(
                listener.fd.as_raw_fd(),
                SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            ) {
                Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNABORTED) => continue,
                Err(e) => return Err(e).context("accept"),
            };
            let client_addr = nix::sys::socket::getpeername::<SockaddrStorage>(fd.as_raw_fd())
                .ok()
                .and_then(|sa| sockaddr_to_std(&sa))
                .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
            self.start_session(poller, relay_id, fd, client_addr)?;
        }
    }

    fn start_session(
        &mut self,
        poller: &mut Poller,
        relay_id: Objid,
        fd: OwnedFd,
        client_addr: SocketAddr,
    ) -> Result<()> {
        let Some(relay) = self.relay_conf(relay_id).cloned() else { return Ok(()) };
        let sid = self.alloc_sid();
        let mut client = NetStream::from_accepted(fd);

        let proto = relay.proto_id.and_then(|id| self.protos.get(&id)).cloned();
        let is_http = proto
            .as_ref()
            .map_or(false, |p| p.proto.kind == ProtoKind::Http);
        if let Some(p) = proto.as_ref() {
            if p.proto.tcp_nodelay {
                client.set_tcp_nodelay(true);
            }
            client.set_buffer_sizes(p.proto.rcvbuf, p.proto.sndbuf);
        }

        if relay.flags.ssl || relay.flags.ssl_inspect {
            let Some(config) = self.server_tls.get(&relay.id) else {
                debug!(relay = %relay.name, "no tls config, dropping client");
                return Ok(());
            };
            client.start_server_tls(config.clone())?;
        }

        poller.add(&client, tok(KIND_CLIENT, sid), true, client.wants_write())?;
        poller.arm_in(
            tok(KIND_SESS_TIMER, sid),
            Duration::from_secs(relay.session_timeout),
        );

        let meta = SessionMeta {
            id: sid as u64,
            client: client_addr,
            listen: relay.listen,
            relay_name: relay.name.clone(),
            timeout: relay.session_timeout,
        };
        debug!(sid, relay = %relay.name, client = %client_addr, "session accepted");

        let mut session = Session {
            sid,
            relay_id,
            client,
            backend: None,
            state: SessState::Frontend,
            proto,
            request: HttpDesc::new(Direction::Request),
            response: HttpDesc::new(Direction::Response),
            is_http,
            meta,
            tags: HashSet::new(),
            hash_bytes: Vec::new(),
            sel_table: None,
            backend_addr: None,
            pending_backend: Vec::new(),
            want_backend: false,
            bytes_in: 0,
            bytes_out: 0,
            closing: false,
        };

        // plain tcp forwarding connects immediately; http waits for the
        // first request head so rules can steer the choice
        if !session.is_http {
            self.connect_backend(poller, &mut session)?;
        }
        self.update_interest(poller, &mut session)?;
        self.sessions.insert(sid, session);
        Ok(())
    }

    fn alloc_sid(&mut self) -> u32 {
        loop {
            self.next_sid = self.next_sid.wrapping_add(1).max(1);
            if !self.sessions.contains_key(&self.next_sid)
                && !self.udp_sessions.contains_key(&self.next_sid)
            {
                return self.next_sid;
            }
        }
    }

    fn connect_backend(&mut self, poller: &mut Poller, session: &mut Session) -> Result<()> {
        let selected = self.select_backend(
            session.relay_id,
            session.sel_table,
            session.meta.client,
            &session.hash_bytes,
        );
        let Some((_table, addr)) = selected else {
            debug!(sid = session.sid, "no backend available");
            if session.is_http {
                session.client.queue(&canned_response(503, "Service Unavailable"));
                let _ = session.client.do_write();
            }
            session.closing = true;
            return Ok(());
        };

        let relay = self.relay_conf(session.relay_id).cloned();
        let mut backend = NetStream::connect(addr)?;
        if let Some(relay) = &relay {
            if relay.flags.ssl_client || relay.flags.ssl_inspect {
                if let Some(config) = self.client_tls.get(&relay.id) {
                    backend.start_client_tls(config.clone(), tls::backend_server_name(addr))?;
                }
            }
            poller.arm_in(
                tok(KIND_CONN_TIMER, session.sid),
                Duration::from_millis(relay.connect_timeout_ms),
            );
        }
        if let Some(p) = session.proto.as_ref() {
            if p.proto.tcp_nodelay {
                backend.set_tcp_nodelay(true);
            }
        }
        if !session.pending_backend.is_empty() {
            backend.queue(&std::mem::take(&mut session.pending_backend));
        }
        poller.add(&backend, tok(KIND_BACKEND, session.sid), true, true)?;
        session.backend = Some(backend);
        session.backend_addr = Some(addr);
        session.state = SessState::Connecting;
        debug!(sid = session.sid, backend = %addr, "backend connecting");
        Ok(())
    }

    fn session_io(
        &mut self,
        poller: &mut Poller,
        sid: u32,
        backend_side: bool,
        writable: bool,
    ) -> Result<()> {
        let Some(mut session) = self.sessions.remove(&sid) else { return Ok(()) };
        let mut result = self.drive_session(poller, &mut session, backend_side, writable);
        if result.is_ok() && session.want_backend && session.backend.is_none() && !session.closing
        {
            session.want_backend = false;
            result = self.connect_backend(poller, &mut session);
        }
        let closed = match result {
            Ok(()) => self.session_finished(&session),
            Err(e) => {
                debug!(sid, %e, "session error");
                true
            }
        };
        if closed {
            self.teardown(poller, session);
        } else {
            self.update_interest(poller, &mut session)?;
            poller.arm_in(
                tok(KIND_SESS_TIMER, sid),
                Duration::from_secs(session.meta.timeout),
            );
            self.sessions.insert(sid, session);
        }
        Ok(())
    }

    fn drive_session(
        &mut self,
        poller: &mut Poller,
        session: &mut Session,
        backend_side: bool,
        writable: bool,
    ) -> Result<()> {
        if backend_side {
            let Some(backend) = session.backend.as_mut() else { return Ok(()) };
            if backend.connecting() && writable {
                backend.connect_done().map_err(|e| {
                    anyhow!("backend connect: {e}")
                })?;
                session.state = SessState::Established;
                poller.disarm(tok(KIND_CONN_TIMER, session.sid));
                debug!(sid = session.sid, "backend established");
            }
            backend.do_write()?;
            let _ = backend.do_read()?;
        } else {
            session.client.do_write()?;
            let _ = session.client.do_read()?;
        }
        self.pump(session)
    }

    /// Move bytes between the two sides, through the protocol engine
    /// for http relays.
    fn pump(&mut self, session: &mut Session) -> Result<()> {
        if session.is_http {
            self.pump_http(session)?;
        } else {
            // transparent tcp splice with watermarks
            let backend_room = session
                .backend
                .as_ref()
                .map_or(false, |b| b.wbuf.len() < WATERMARK);
            if backend_room && !session.client.rbuf.is_empty() {
                let bytes: Vec<u8> = std::mem::take(&mut session.client.rbuf);
                session.bytes_in += bytes.len() as u64;
                if let Some(backend) = session.backend.as_mut() {
                    backend.queue(&bytes);
                    backend.do_write()?;
                }
            }
            if let Some(backend) = session.backend.as_mut() {
                if !backend.rbuf.is_empty() && session.client.wbuf.len() < WATERMARK {
                    let bytes: Vec<u8> = std::mem::take(&mut backend.rbuf);
                    session.bytes_out += bytes.len() as u64;
                    session.client.queue(&bytes);
                    session.client.do_write()?;
                }
            }
        }
        Ok(())
    }

    fn pump_http(&mut self, session: &mut Session) -> Result<()> {
        // request direction: client -> backend. The parser pauses at
        // every message head, so loop until it stops producing events.
        loop {
            let mut events = Vec::new();
            let mut input = std::mem::take(&mut session.client.rbuf);
            session
                .request
                .parse(&mut input, &mut events)
                .map_err(|e| anyhow!("request parse: {e}"))?;
            session.client.rbuf = input;
            if session.client.eof {
                session.request.stream_eof(&mut events);
            }
            if events.is_empty() {
                break;
            }
            for ev in events {
                match ev {
                    HttpOut::Heads => {
                        if self.run_rules(session, Direction::Request)? {
                            return Err(anyhow!("session blocked by rule"));
                        }
                        let head = session.request.serialize_head();
                        session.bytes_in += head.len() as u64;
                        match session.backend.as_mut() {
                            Some(backend) => backend.queue(&head),
                            None => {
                                session.pending_backend.extend_from_slice(&head);
                                session.want_backend = true;
                            }
                        }
                    }
                    HttpOut::Data(bytes) => {
                        session.bytes_in += bytes.len() as u64;
                        match session.backend.as_mut() {
                            Some(backend) => backend.queue(&bytes),
                            None => session.pending_backend.extend_from_slice(&bytes),
                        }
                    }
                    HttpOut::Done => {}
                }
            }
        }

        // response direction: backend -> client
        loop {
            let mut events = Vec::new();
            if let Some(backend) = session.backend.as_mut() {
                let mut input = std::mem::take(&mut backend.rbuf);
                session
                    .response
                    .parse(&mut input, &mut events)
                    .map_err(|e| anyhow!("response parse: {e}"))?;
                backend.rbuf = input;
                if backend.eof {
                    session.response.stream_eof(&mut events);
                }
            }
            if events.is_empty() {
                break;
            }
            for ev in events {
                match ev {
                    HttpOut::Heads => {
                        if self.run_rules(session, Direction::Response)? {
                            return Err(anyhow!("session blocked by rule"));
                        }
                        let head = session.response.serialize_head();
                        session.bytes_out += head.len() as u64;
                        session.client.queue(&head);
                    }
                    HttpOut::Data(bytes) => {
                        session.bytes_out += bytes.len() as u64;
                        session.client.queue(&bytes);
                    }
                    HttpOut::Done => {}
                }
            }
        }

        if let Some(backend) = session.backend.as_mut() {
            backend.do_write()?;
        }
        session.client.do_write()?;
        Ok(())
    }

    /// Run protocol rules for one direction. Returns true if the
    /// session must be blocked.
    fn run_rules(&mut self, session: &mut Session, dir: Direction) -> Result<bool> {
        let Some(proto) = session.proto.clone() else { return Ok(false) };
        let desc = match dir {
            Direction::Request => &mut session.request,
            Direction::Response => &mut session.response,
        };
        let outcome = rules::eval(&proto, dir, desc, &session.meta, &mut session.tags);
        for line in &outcome.log {
            info!(sid = session.sid, relay = %session.meta.relay_name, "{line}");
        }
        if !outcome.hash_input.is_empty() {
            session.hash_bytes.extend_from_slice(&outcome.hash_input);
        }
        if outcome.table.is_some() {
            session.sel_table = outcome.table;
        }
        if outcome.block {
            let label = outcome
                .label
                .and_then(|id| proto.label_name(id))
                .unwrap_or_default();
            info!(sid = session.sid, relay = %session.meta.relay_name, label = %label,
                "session blocked");
            return Ok(true);
        }
        Ok(false)
    }

    fn session_finished(&self, session: &Session) -> bool {
        if session.closing {
            return session.client.wbuf.is_empty();
        }
        let backend_wbuf_empty = session
            .backend
            .as_ref()
            .map_or(true, |b| b.wbuf.is_empty());
        let backend_eof = session.backend.as_ref().map_or(false, |b| b.eof);
        // close once a side is gone and everything owed to the other
        // side has been flushed
        (session.client.eof && backend_wbuf_empty)
            || (backend_eof && session.client.wbuf.is_empty())
    }

    fn update_interest(&self, poller: &mut Poller, session: &mut Session) -> Result<()> {
        let backend_backed_up = session
            .backend
            .as_ref()
            .map_or(false, |b| b.wbuf.len() >= WATERMARK);
        let client_read = !session.client.eof && !backend_backed_up && !session.closing;
        poller.modify(
            &session.client,
            tok(KIND_CLIENT, session.sid),
            client_read,
            session.client.wants_write(),
        )?;
        if let Some(backend) = session.backend.as_ref() {
            let client_backed_up = session.client.wbuf.len() >= WATERMARK;
            poller.modify(
                backend,
                tok(KIND_BACKEND, session.sid),
                !backend.eof && !client_backed_up,
                backend.wants_write() || backend.connecting(),
            )?;
        }
        Ok(())
    }

    fn teardown(&mut self, poller: &mut Poller, mut session: Session) {
        session.client.send_close_notify();
        let _ = session.client.do_write();
        let _ = poller.delete(&session.client);
        if let Some(backend) = session.backend.as_ref() {
            let _ = poller.delete(backend);
        }
        poller.disarm(tok(KIND_SESS_TIMER, session.sid));
        poller.disarm(tok(KIND_CONN_TIMER, session.sid));
        debug!(
            sid = session.sid,
            bytes_in = session.bytes_in,
            bytes_out = session.bytes_out,
            "session closed"
        );
        if self.accept_paused && self.can_accept() {
            self.resume_accept(poller);
        }
    }

    fn pause_accept(&mut self, poller: &mut Poller) {
        if self.accept_paused {
            return;
        }
        warn!("descriptor reserve reached, pausing accept");
        for listener in self.listeners.values() {
            let _ = poller.modify(
                &listener.fd,
                tok(KIND_LISTENER, listener.relay_id),
                false,
                false,
            );
        }
        self.accept_paused = true;
    }

    fn resume_accept(&mut self, poller: &mut Poller) {
        for listener in self.listeners.values() {
            let _ = poller.modify(
                &listener.fd,
                tok(KIND_LISTENER, listener.relay_id),
                true,
                false,
            );
        }
        self.accept_paused = false;
    }

    // --- udp -------------------------------------------------------------

    fn udp_input(&mut self, poller: &mut Poller, relay_id: Objid) -> Result<()> {
        let Some(listener) = self.udp_listeners.get(&relay_id) else { return Ok(()) };
        let raw = listener.as_raw_fd();
        let mut buf = [0u8; 65536];
        loop {
            let (n, from) = match recvfrom::<SockaddrStorage>(raw, &mut buf) {
                Ok((n, Some(sa))) => match sockaddr_to_std(&sa) {
                    Some(addr) => (n, addr),
                    None => continue,
                },
                Ok((_, None)) => continue,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("udp recv"),
            };
            let datagram = &buf[..n];
            let sid = match self.udp_by_peer.get(&(relay_id, from)) {
                Some(&sid) => sid,
                None => match self.udp_flow_start(poller, relay_id, from)? {
                    Some(sid) => sid,
                    None => continue,
                },
            };
            if let Some(flow) = self.udp_sessions.get(&sid) {
                match nix::unistd::write(&flow.sock, datagram) {
                    Ok(_) => {}
                    Err(Errno::EAGAIN) => {}
                    Err(e) => debug!(sid, %e, "udp forward failed"),
                }
                poller.arm_in(tok(KIND_UDP_TIMER, sid), Duration::from_secs(60));
            }
        }
        Ok(())
    }

    fn udp_flow_start(
        &mut self,
        poller: &mut Poller,
        relay_id: Objid,
        client: SocketAddr,
    ) -> Result<Option<u32>> {
        if !self.can_accept() {
            return Ok(None);
        }
        let Some((_, backend)) =
            self.select_backend(relay_id, None, client, &addr_bytes(&client))
        else {
            return Ok(None);
        };
        let family = match backend {
            SocketAddr::V4(_) => nix::sys::socket::AddressFamily::Inet,
            SocketAddr::V6(_) => nix::sys::socket::AddressFamily::Inet6,
        };
        let sock = nix::sys::socket::socket(
            family,
            nix::sys::socket::SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        nix::sys::socket::connect(sock.as_raw_fd(), &SockaddrStorage::from(backend))?;
        let sid = self.alloc_sid();
        poller.add(&sock, tok(KIND_BACKEND, sid), true, false)?;
        poller.arm_in(tok(KIND_UDP_TIMER, sid), Duration::from_secs(60));
        self.udp_by_peer.insert((relay_id, client), sid);
        self.udp_sessions.insert(
            sid,
            UdpSession {
                relay_id,
                client,
                sock,
            },
        );
        debug!(sid, %client, %backend, "udp flow started");
        Ok(Some(sid))
    }

    fn udp_backend_input(&mut self, sid: u32) -> Result<()> {
        let Some(flow) = self.udp_sessions.get(&sid) else { return Ok(()) };
        let Some(listener) = self.udp_listeners.get(&flow.relay_id) else { return Ok(()) };
        let mut buf = [0u8; 65536];
        loop {
            match nix::unistd::read(&flow.sock, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let sa = SockaddrStorage::from(flow.client);
                    let _ = sendto(listener.as_raw_fd(), &buf[..n], &sa, MsgFlags::empty());
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    debug!(sid, %e, "udp backend read failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn udp_expire(&mut self, poller: &mut Poller, sid: u32) {
        if let Some(flow) = self.udp_sessions.remove(&sid) {
            let _ = poller.delete(&flow.sock);
            self.udp_by_peer.remove(&(flow.relay_id, flow.client));
            debug!(sid, "udp flow expired");
        }
    }

    // --- reporting -------------------------------------------------------

    fn publish_sessions(&mut self, req_id: u32) -> Result<()> {
        let records: Vec<SessionRecord> = self
            .sessions
            .values()
            .map(|s| SessionRecord {
                sid: s.sid,
                relay: s.meta.relay_name.clone(),
                client: s.meta.client,
                backend: s.backend_addr,
                state: format!("{:?}", s.state).to_ascii_lowercase(),
                bytes_in: s.bytes_in,
                bytes_out: s.bytes_out,
            })
            .collect();
        for record in records {
            self.parent
                .send(MsgType::SessionPublish, req_id, &record)?;
        }
        self.parent.send(MsgType::CtlEnd, req_id, &())?;
        Ok(())
    }
}

fn addr_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

fn sockaddr_to_std(sa: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin) = sa.as_sockaddr_in() {
        return Some(SocketAddr::V4(std::net::SocketAddrV4::new(
            sin.ip(),
            sin.port(),
        )));
    }
    if let Some(sin6) = sa.as_sockaddr_in6() {
        return Some(SocketAddr::V6(std::net::SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    None
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    crate::ipc::set_nonblocking(fd.as_raw_fd(), true)?;
    Ok(())
}

/// Accept only while enough descriptors remain for housekeeping.
pub fn can_accept(in_use: u64, reserve: u64, limit: u64) -> bool {
    in_use + reserve + 2 <= limit
}

pub fn run(worker: WorkerProc, opts: &GlobalConf) -> Result<()> {
    let fd_limit = privsep::raise_nofile().unwrap_or(1024);
    privsep::drop_privileges(opts)?;
    privsep::ignore_sigpipe()?;

    let mut poller = Poller::new()?;
    let mut sfd = event::signal_fd(&[
        nix::sys::signal::Signal::SIGTERM,
        nix::sys::signal::Signal::SIGINT,
        nix::sys::signal::Signal::SIGHUP,
    ])?;
    poller.add(&worker.chan, TOK_PARENT, true, false)?;
    poller.add(&sfd, TOK_SIGNAL, true, false)?;

    let mut rng = rand::thread_rng();
    let mut relay = Relay {
        ctx: WorkerCtx::new(worker.role, worker.instance),
        parent: worker.chan,
        ca: None,
        names: Rc::new(RefCell::new(NameTable::new())),
        protos: HashMap::new(),
        server_tls: HashMap::new(),
        client_tls: HashMap::new(),
        listeners: HashMap::new(),
        udp_listeners: HashMap::new(),
        sessions: HashMap::new(),
        udp_sessions: HashMap::new(),
        udp_by_peer: HashMap::new(),
        host_states: HashMap::new(),
        rr_counters: HashMap::new(),
        hash_seed: ahash::RandomState::with_seeds(
            rng.gen(),
            rng.gen(),
            rng.gen(),
            rng.gen(),
        ),
        next_sid: 0,
        fd_limit,
        accept_paused: false,
    };
    let mut events = Vec::new();

    info!(instance = worker.instance, "relay ready");
    loop {
        poller.wait(&mut events)?;
        let round: Vec<Event> = events.clone();
        for ev in round {
            match ev {
                Event::Io { token: TOK_SIGNAL, .. } => {
                    while let Ok(Some(sig)) = sfd.read_signal() {
                        if matches!(sig.ssi_signo as i32, libc::SIGTERM | libc::SIGINT) {
                            return Ok(());
                        }
                    }
                }
                Event::Io { token: TOK_PARENT, writable, .. } => {
                    if writable {
                        relay.parent.flush()?;
                    }
                    loop {
                        let msg = match relay.parent.recv() {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        };
                        match relay.ctx.dispatch(&mut relay.parent, msg) {
                            Ok(CtlEvent::Apply(_)) => relay.apply_config(&mut poller)?,
                            Ok(CtlEvent::Start) => relay.sync_listeners(&mut poller)?,
                            Ok(CtlEvent::None) => {}
                            Ok(CtlEvent::Shutdown) => return Ok(()),
                            Ok(CtlEvent::Peer(fd, _)) => {
                                relay.ca = Some(CaClient::new(fd)?);
                                // tls configs depend on the ca channel
                                relay.apply_config(&mut poller)?;
                            }
                            Ok(CtlEvent::Service(mut msg)) => match msg.hdr.typ {
                                MsgType::HostStatus => {
                                    let status: HostStatusMsg = msg
                                        .decode()
                                        .map_err(|e| anyhow!(e.to_string()))?;
                                    relay.host_states.insert(status.host_id, status.state);
                                }
                                MsgType::ShowSessions => {
                                    relay.publish_sessions(msg.hdr.peer_id)?;
                                }
                                MsgType::BindAnyResp => {
                                    let fd = msg
                                        .take_fd()
                                        .map_err(|e| anyhow!(e.to_string()))?;
                                    let relay_id = msg.hdr.peer_id;
                                    relay.install_listener(&mut poller, relay_id, fd)?;
                                }
                                other => warn!(?other, "unhandled message in relay"),
                            },
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        }
                    }
                    poller.modify(&relay.parent, TOK_PARENT, true, relay.parent.has_pending())?;
                }
                Event::Io { token, writable, .. } => {
                    let (kind, id) = tok_kind(token);
                    match kind {
                        KIND_LISTENER => relay.accept(&mut poller, id)?,
                        KIND_UDP => relay.udp_input(&mut poller, id)?,
                        KIND_CLIENT => relay.session_io(&mut poller, id, false, writable)?,
                        KIND_BACKEND => {
                            if relay.udp_sessions.contains_key(&id) {
                                relay.udp_backend_input(id)?;
                            } else {
                                relay.session_io(&mut poller, id, true, writable)?;
                            }
                        }
                        _ => {}
                    }
                }
                Event::Timer { token } => {
                    let (kind, id) = tok_kind(token);
                    match kind {
                        KIND_SESS_TIMER => {
                            if let Some(session) = relay.sessions.remove(&id) {
                                debug!(sid = id, "session timed out");
                                relay.teardown(&mut poller, session);
                            }
                        }
                        KIND_CONN_TIMER => {
                            if let Some(session) = relay.sessions.remove(&id) {
                                debug!(sid = id, "backend connect timed out");
                                relay.teardown(&mut poller, session);
                            }
                        }
                        KIND_UDP_TIMER => relay.udp_expire(&mut poller, id),
                        _ => {}
                    }
                }
            }
        }
        poller.modify(&relay.parent, TOK_PARENT, true, relay.parent.has_pending())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse, ResetScope, Shadow};
    use crate::privsep::Role;

    const CFG: &str = r#"{
        "tables": [
            { "name": "webpool", "check": { "kind": "tcp" },
              "hosts": ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"] },
            { "name": "fallback", "check": { "kind": "tcp" },
              "hosts": ["10.0.9.1:80"] }
        ],
        "relays": [
            { "name": "www", "listen": "127.0.0.1:8080",
              "forward": [ { "table": "webpool", "mode": "roundrobin" },
                           { "table": "fallback", "mode": "roundrobin" } ] }
        ]
    }"#;

    fn test_relay() -> Relay {
        let cfg = parse(CFG).unwrap();
        let (parent, _peer) = Channel::pair().unwrap();
        let mut ctx = WorkerCtx::new(Role::Relay, 0);
        let mut shadow = Shadow::new(ResetScope::All);
        for t in &cfg.tables {
            shadow.add_table(t.conf.clone());
            for h in &t.hosts {
                shadow.add_host(h.clone()).unwrap();
            }
        }
        shadow.relays = cfg.relays.clone();
        ctx.store.apply(shadow);
        std::mem::forget(_peer);
        Relay {
            ctx,
            parent,
            ca: None,
            names: Rc::new(RefCell::new(NameTable::new())),
            protos: HashMap::new(),
            server_tls: HashMap::new(),
            client_tls: HashMap::new(),
            listeners: HashMap::new(),
            udp_listeners: HashMap::new(),
            sessions: HashMap::new(),
            udp_sessions: HashMap::new(),
            udp_by_peer: HashMap::new(),
            host_states: HashMap::new(),
            rr_counters: HashMap::new(),
            hash_seed: ahash::RandomState::with_seeds(1, 2, 3, 4),
            next_sid: 0,
            fd_limit: 1024,
            accept_paused: false,
        }
    }

    fn mark_all_up(relay: &mut Relay) {
        let ids: Vec<Objid> = relay
            .ctx
            .store
            .tables
            .iter()
            .flat_map(|t| t.hosts.iter().map(|h| h.id))
            .collect();
        for id in ids {
            relay.host_states.insert(id, HostState::Up);
        }
    }

    #[test]
    fn roundrobin_cycles_in_order() {
        let mut relay = test_relay();
        mark_all_up(&mut relay);
        let relay_id = relay.ctx.store.relays[0].id;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();

        let expected: Vec<SocketAddr> = ["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        let picks: Vec<SocketAddr> = (0..10)
            .map(|_| relay.select_backend(relay_id, None, client, &[]).unwrap().1)
            .collect();
        for (i, addr) in picks.iter().enumerate() {
            assert_eq!(*addr, expected[i % 3], "pick {i}");
        }
    }

    #[test]
    fn failover_skips_down_host() {
        let mut relay = test_relay();
        mark_all_up(&mut relay);
        let relay_id = relay.ctx.store.relays[0].id;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();

        for _ in 0..3 {
            relay.select_backend(relay_id, None, client, &[]).unwrap();
        }
        // host B goes down after the third request
        let b = relay.ctx.store.tables[0].hosts[1].id;
        relay.host_states.insert(b, HostState::Down);

        let a: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let c: SocketAddr = "10.0.0.3:80".parse().unwrap();
        let picks: Vec<SocketAddr> = (0..7)
            .map(|_| relay.select_backend(relay_id, None, client, &[]).unwrap().1)
            .collect();
        assert!(picks.iter().all(|p| *p == a || *p == c));
        assert!(picks.windows(2).all(|w| w[0] != w[1]), "alternates: {picks:?}");
    }

    #[test]
    fn no_up_hosts_yields_none() {
        let mut relay = test_relay();
        let relay_id = relay.ctx.store.relays[0].id;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        assert!(relay.select_backend(relay_id, None, client, &[]).is_none());
    }

    #[test]
    fn falls_back_to_next_table() {
        let mut relay = test_relay();
        let relay_id = relay.ctx.store.relays[0].id;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        // only the fallback table has an up host
        let fb = relay.ctx.store.tables[1].hosts[0].id;
        relay.host_states.insert(fb, HostState::Up);
        let (_, addr) = relay.select_backend(relay_id, None, client, &[]).unwrap();
        assert_eq!(addr, "10.0.9.1:80".parse().unwrap());
    }

    #[test]
    fn source_hash_is_stable_per_client() {
        let mut relay = test_relay();
        mark_all_up(&mut relay);
        let relay_id = relay.ctx.store.relays[0].id;
        // switch the first target to source-hash
        relay.ctx.store.relays[0].targets[0].mode = ForwardMode::SourceHash;

        let client: SocketAddr = "192.0.2.77:40000".parse().unwrap();
        let first = relay.select_backend(relay_id, None, client, &[]).unwrap().1;
        for _ in 0..10 {
            assert_eq!(
                relay.select_backend(relay_id, None, client, &[]).unwrap().1,
                first
            );
        }
    }

    #[test]
    fn hash_mode_keyed_by_rule_input() {
        let mut relay = test_relay();
        mark_all_up(&mut relay);
        let relay_id = relay.ctx.store.relays[0].id;
        relay.ctx.store.relays[0].targets[0].mode = ForwardMode::Hash;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();

        let a = relay
            .select_backend(relay_id, None, client, b"session-cookie-1")
            .unwrap()
            .1;
        for _ in 0..5 {
            assert_eq!(
                relay
                    .select_backend(relay_id, None, client, b"session-cookie-1")
                    .unwrap()
                    .1,
                a
            );
        }
    }

    #[test]
    fn rule_bound_table_takes_precedence() {
        let mut relay = test_relay();
        mark_all_up(&mut relay);
        let relay_id = relay.ctx.store.relays[0].id;
        let fallback_id = relay.ctx.store.tables[1].conf.id;
        let client: SocketAddr = "192.0.2.1:40000".parse().unwrap();
        let (table, addr) = relay
            .select_backend(relay_id, Some(fallback_id), client, &[])
            .unwrap();
        assert_eq!(table, fallback_id);
        assert_eq!(addr, "10.0.9.1:80".parse().unwrap());
    }

    #[test]
    fn accept_honors_descriptor_reserve() {
        assert!(can_accept(100, FD_RESERVE, 1024));
        assert!(!can_accept(1024 - FD_RESERVE - 1, FD_RESERVE, 1024));
        assert!(can_accept(1024 - FD_RESERVE - 2, FD_RESERVE, 1024));
    }
}
