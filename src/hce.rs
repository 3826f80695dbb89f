//! Host check engine: jittered per-host probe timers, one probe state
//! machine per host, and the retry-hysteresis host state machine.
//! Transitions (and only transitions) are published to the parent and
//! the packet-filter engine.

use std::{
    collections::HashMap,
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use globset::GlobMatcher;
use md5::{Digest, Md5};
use nix::{
    errno::Errno,
    sys::socket::{recvfrom, sendto, MsgFlags, SockaddrStorage},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use tracing::{debug, info, warn};

use crate::{
    config::{
        CheckConf, CheckKind, DigestAlgo, GlobalConf, HostConf, HostState, HostStatusMsg, Objid,
        Table,
    },
    event::{self, Event, Poller},
    ipc::{Channel, MsgType},
    kv::compile_glob,
    privsep::{self, CtlEvent, WorkerCtx, WorkerProc},
    stream::NetStream,
    tls,
};

const RECV_LIMIT: usize = 8 * 1024;
const HTTP_RECV_LIMIT: usize = 64 * 1024;

/// Script check request, HCE to parent (only the parent may exec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptExecMsg {
    pub host_id: Objid,
    pub path: String,
    pub host: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDoneMsg {
    pub host_id: Objid,
    pub code: i32,
}

// --- host state machine --------------------------------------------------

#[derive(Debug)]
pub struct HostRt {
    pub conf: HostConf,
    pub state: HostState,
    pub up_cnt: u32,
    pub down_cnt: u32,
}

impl HostRt {
    pub fn new(conf: HostConf) -> HostRt {
        HostRt {
            conf,
            state: HostState::Unknown,
            up_cnt: 0,
            down_cnt: 0,
        }
    }

    /// Feed one probe result; `retry` consecutive results in the same
    /// direction flip the state. Returns the new state on a transition.
    pub fn probe_result(&mut self, ok: bool, retry: u32) -> Option<HostState> {
        let retry = retry.max(1);
        match (self.state, ok) {
            (HostState::Disabled, _) => None,
            (HostState::Up, true) => {
                self.down_cnt = 0;
                None
            }
            (HostState::Up, false) => {
                self.down_cnt += 1;
                (self.down_cnt >= retry).then(|| self.transition(HostState::Down))
            }
            (_, true) => {
                self.down_cnt = 0;
                self.up_cnt += 1;
                (self.up_cnt >= retry).then(|| self.transition(HostState::Up))
            }
            (_, false) => {
                self.up_cnt = 0;
                if self.state == HostState::Unknown {
                    self.down_cnt += 1;
                    (self.down_cnt >= retry).then(|| self.transition(HostState::Down))
                } else {
                    None
                }
            }
        }
    }

    fn transition(&mut self, to: HostState) -> HostState {
        self.state = to;
        self.up_cnt = 0;
        self.down_cnt = 0;
        to
    }
}

// --- probe evaluation helpers --------------------------------------------

/// Build the HTTP request a check sends.
pub fn http_check_request(path: &str, host: &str) -> Vec<u8> {
    format!("GET {path} HTTP/1.0\r\nHost: {host}\r\nConnection: close\r\n\r\n").into_bytes()
}

/// Validate an HTTP check response against the expected status and
/// optional body digest.
pub fn http_check_eval(check: &CheckConf, response: &[u8]) -> bool {
    let head_end = match response.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => pos,
        None => return false,
    };
    let head = &response[..head_end];
    let body = &response[head_end + 4..];
    let status_line = head.split(|&b| b == b'\r').next().unwrap_or(&[]);
    let text = String::from_utf8_lossy(status_line);
    let code: u16 = match text.split_ascii_whitespace().nth(1).map(str::parse) {
        Some(Ok(code)) => code,
        _ => return false,
    };
    if code != check.expect_status.unwrap_or(200) {
        return false;
    }
    if let Some((algo, want)) = &check.digest {
        let got = match algo {
            DigestAlgo::Md5 => hex(&Md5::digest(body)),
            DigestAlgo::Sha1 => hex(&Sha1::digest(body)),
        };
        if !got.eq_ignore_ascii_case(want) {
            return false;
        }
    }
    true
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// --- icmp ----------------------------------------------------------------

/// RFC 1071 internet checksum.
pub fn inet_cksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for pair in data.chunks(2) {
        let word = match pair {
            [a, b] => u16::from_be_bytes([*a, *b]),
            [a] => u16::from_be_bytes([*a, 0]),
            _ => 0,
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// ICMP echo request; the v6 checksum is filled in by the kernel.
pub fn icmp_echo(v6: bool, ident: u16, seq: u16) -> Vec<u8> {
    let mut pkt = vec![0u8; 8 + 8];
    pkt[0] = if v6 { 128 } else { 8 };
    pkt[4..6].copy_from_slice(&ident.to_be_bytes());
    pkt[6..8].copy_from_slice(&seq.to_be_bytes());
    pkt[8..16].copy_from_slice(b"shuntchk");
    if !v6 {
        let sum = inet_cksum(&pkt);
        pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    pkt
}

/// Extract (ident, seq) from an echo reply, skipping the IPv4 header
/// when the raw socket delivers one.
pub fn icmp_reply(v6: bool, data: &[u8]) -> Option<(u16, u16)> {
    let payload = if v6 {
        data
    } else {
        let ihl = ((*data.first()? & 0x0f) as usize) * 4;
        data.get(ihl..)?
    };
    let expected_type = if v6 { 129 } else { 0 };
    if payload.first() != Some(&expected_type) || payload.len() < 8 {
        return None;
    }
    Some((
        u16::from_be_bytes([payload[4], payload[5]]),
        u16::from_be_bytes([payload[6], payload[7]]),
    ))
}

// --- the engine ----------------------------------------------------------

enum ProbeIo {
    Stream(NetStream),
    Icmp { seq: u16 },
    Script,
}

struct Probe {
    host_id: Objid,
    table_id: Objid,
    kind: CheckKind,
    io: ProbeIo,
    expect: Option<GlobMatcher>,
    tcp_only: bool,
}

const TOK_PARENT: u64 = 0;
const TOK_SIGNAL: u64 = 1;
const TOK_PFE: u64 = 2;
const TOK_ICMP4: u64 = 3;
const TOK_ICMP6: u64 = 4;

const KIND_PROBE: u64 = 3;
const KIND_DEADLINE: u64 = 4;
const KIND_INTERVAL: u64 = 5;

fn tok(kind: u64, id: Objid) -> u64 {
    (kind << 32) | id as u64
}

fn tok_kind(token: u64) -> (u64, Objid) {
    (token >> 32, token as u32)
}

pub struct Hce {
    ctx: WorkerCtx,
    parent: Channel,
    pfe: Option<Channel>,
    hosts: HashMap<Objid, HostRt>,
    probes: HashMap<Objid, Probe>,
    icmp_flight: HashMap<u16, Objid>,
    icmp4: Option<OwnedFd>,
    icmp6: Option<OwnedFd>,
    icmp_seq: u16,
    ident: u16,
    client_tls: Arc<rustls::ClientConfig>,
}

impl Hce {
    fn table_of(&self, host_id: Objid) -> Option<&Table> {
        let table_id = self.hosts.get(&host_id)?.conf.table_id;
        self.ctx.store.table(table_id)
    }

    /// Rebuild host runtime state after a config swap, carrying health
    /// state over for hosts that survived (same table id and address).
    fn rebuild_hosts(&mut self, poller: &mut Poller) {
        let mut old = std::mem::take(&mut self.hosts);
        for table in &self.ctx.store.tables {
            for conf in &table.hosts {
                let carried = old
                    .iter()
                    .find(|(_, rt)| {
                        rt.conf.table_id == conf.table_id && rt.conf.addr == conf.addr
                    })
                    .map(|(id, _)| *id);
                let mut rt = match carried.and_then(|id| old.remove(&id)) {
                    Some(mut prev) => {
                        prev.conf = conf.clone();
                        prev
                    }
                    None => HostRt::new(conf.clone()),
                };
                if table.conf.disabled {
                    rt.state = HostState::Disabled;
                }
                self.hosts.insert(conf.id, rt);
            }
        }
        // cancel probes and timers of hosts that went away
        for (id, _) in old {
            self.cancel_probe(poller, id);
            poller.disarm(tok(KIND_INTERVAL, id));
        }
    }

    fn schedule_all(&mut self, poller: &mut Poller) {
        let ids: Vec<Objid> = self.hosts.keys().copied().collect();
        let count = ids.len().max(1) as u64;
        for (idx, id) in ids.into_iter().enumerate() {
            let Some(table) = self.table_of(id) else { continue };
            if table.conf.check.kind == CheckKind::Icmp && self.icmp_sock_for(id).is_none() {
                continue;
            }
            let interval_ms = table.conf.interval as u64 * 1000;
            let splay = interval_ms * idx as u64 / count;
            let jitter = rand::thread_rng().gen_range(0..250);
            poller.arm_in(
                tok(KIND_INTERVAL, id),
                Duration::from_millis(splay + jitter),
            );
        }
    }

    fn reschedule(&mut self, poller: &mut Poller, host_id: Objid) {
        if let Some(table) = self.table_of(host_id) {
            let interval_ms = table.conf.interval as u64 * 1000;
            let jitter = rand::thread_rng().gen_range(0..500);
            poller.arm_in(
                tok(KIND_INTERVAL, host_id),
                Duration::from_millis(interval_ms + jitter),
            );
        }
    }

    fn icmp_sock_for(&self, host_id: Objid) -> Option<&OwnedFd> {
        match self.hosts.get(&host_id)?.conf.addr {
            SocketAddr::V4(_) => self.icmp4.as_ref(),
            SocketAddr::V6(_) => self.icmp6.as_ref(),
        }
    }

    fn launch(&mut self, poller: &mut Poller, host_id: Objid) -> Result<()> {
        let Some(rt) = self.hosts.get(&host_id) else { return Ok(()) };
        let (state, host_addr, host_name, table_id) = (
            rt.state,
            rt.conf.addr,
            rt.conf.name.clone(),
            rt.conf.table_id,
        );
        if state == HostState::Disabled || self.probes.contains_key(&host_id) {
            self.reschedule(poller, host_id);
            return Ok(());
        }
        let Some(table) = self.table_of(host_id) else { return Ok(()) };
        let check = table.conf.check.clone();
        let timeout_ms = table.conf.timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let addr = {
            let mut addr = host_addr;
            if let Some(port) = check.port {
                addr.set_port(port);
            }
            addr
        };

        let probe = match check.kind {
            CheckKind::Icmp => {
                let v6 = matches!(addr, SocketAddr::V6(_));
                self.icmp_seq = self.icmp_seq.wrapping_add(1);
                let seq = self.icmp_seq;
                let Some(sock) = self.icmp_sock_for(host_id) else {
                    return Ok(());
                };
                let pkt = icmp_echo(v6, self.ident, seq);
                let sa = SockaddrStorage::from(addr);
                match sendto(sock.as_raw_fd(), &pkt, &sa, MsgFlags::empty()) {
                    Ok(_) => {}
                    Err(e) => {
                        debug!(host = host_id, %e, "icmp send failed");
                        self.finish(poller, host_id, false)?;
                        return Ok(());
                    }
                }
                self.icmp_flight.insert(seq, host_id);
                Probe {
                    host_id,
                    table_id,
                    kind: CheckKind::Icmp,
                    io: ProbeIo::Icmp { seq },
                    expect: None,
                    tcp_only: false,
                }
            }
            CheckKind::Script => {
                let msg = ScriptExecMsg {
                    host_id,
                    path: check.path.clone().unwrap_or_default(),
                    host: host_name,
                    timeout_ms,
                };
                self.parent.send(MsgType::ScriptExec, host_id, &msg)?;
                Probe {
                    host_id,
                    table_id,
                    kind: CheckKind::Script,
                    io: ProbeIo::Script,
                    expect: None,
                    tcp_only: false,
                }
            }
            CheckKind::Tcp | CheckKind::Http | CheckKind::SendExpect => {
                let stream = match NetStream::connect(addr) {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(host = host_id, %e, "probe connect failed");
                        self.finish(poller, host_id, false)?;
                        return Ok(());
                    }
                };
                poller.add(&stream, tok(KIND_PROBE, host_id), true, true)?;
                let expect = match &check.expect {
                    Some(pattern) => Some(compile_glob(pattern)?),
                    None => None,
                };
                Probe {
                    host_id,
                    table_id,
                    kind: check.kind,
                    io: ProbeIo::Stream(stream),
                    expect,
                    tcp_only: check.kind == CheckKind::Tcp && !check.tls,
                }
            }
        };

        // scripts are killed by the parent; give the reply some slack
        let deadline = match check.kind {
            CheckKind::Script => timeout * 2,
            _ => timeout,
        };
        poller.arm_in(tok(KIND_DEADLINE, host_id), deadline);
        self.probes.insert(host_id, probe);
        Ok(())
    }

    fn probe_io(&mut self, poller: &mut Poller, host_id: Objid, writable: bool) -> Result<()> {
        let Some(probe) = self.probes.get_mut(&host_id) else { return Ok(()) };
        let ProbeIo::Stream(stream) = &mut probe.io else { return Ok(()) };
        let Some(table) = self
            .ctx
            .store
            .table(probe.table_id)
        else {
            return Ok(());
        };
        let check = &table.conf.check;

        if stream.connecting() && writable {
            if let Err(e) = stream.connect_done() {
                debug!(host = host_id, %e, "probe connect refused");
                return self.finish(poller, host_id, false);
            }
            if probe.tcp_only {
                return self.finish(poller, host_id, true);
            }
            if check.tls {
                stream.start_client_tls(
                    self.client_tls.clone(),
                    tls::backend_server_name(self.hosts[&host_id].conf.addr),
                )?;
            }
            match check.kind {
                CheckKind::Http => {
                    let host = self.hosts[&host_id].conf.addr.ip().to_string();
                    let req =
                        http_check_request(check.path.as_deref().unwrap_or("/"), &host);
                    stream.queue(&req);
                }
                CheckKind::SendExpect => {
                    if let Some(send) = &check.send {
                        stream.queue(send.as_bytes());
                    }
                }
                _ => {}
            }
        }

        stream.do_write()?;
        let _ = stream.do_read()?;

        let done = match probe.kind {
            CheckKind::SendExpect => {
                let text = String::from_utf8_lossy(&stream.rbuf);
                let matched = probe
                    .expect
                    .as_ref()
                    .map_or(false, |m| m.is_match(text.as_ref()));
                if matched {
                    Some(true)
                } else if stream.eof || stream.rbuf.len() >= RECV_LIMIT {
                    Some(false)
                } else {
                    None
                }
            }
            CheckKind::Http => {
                if stream.eof || stream.rbuf.len() >= HTTP_RECV_LIMIT {
                    Some(http_check_eval(check, &stream.rbuf))
                } else {
                    None
                }
            }
            // tls-wrapped tcp check: success once the handshake finished
            CheckKind::Tcp => {
                if !stream.handshaking() && stream.is_tls() {
                    Some(true)
                } else if stream.eof {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        };

        match done {
            Some(ok) => self.finish(poller, host_id, ok),
            None => {
                let interest_w = stream.wants_write();
                poller.modify(stream, tok(KIND_PROBE, host_id), true, interest_w)?;
                Ok(())
            }
        }
    }

    fn cancel_probe(&mut self, poller: &mut Poller, host_id: Objid) {
        if let Some(probe) = self.probes.remove(&host_id) {
            match probe.io {
                ProbeIo::Stream(stream) => {
                    let _ = poller.delete(&stream);
                }
                ProbeIo::Icmp { seq } => {
                    self.icmp_flight.remove(&seq);
                }
                ProbeIo::Script => {}
            }
        }
        poller.disarm(tok(KIND_DEADLINE, host_id));
    }

    /// Conclude a probe, run the state machine, publish a transition.
    fn finish(&mut self, poller: &mut Poller, host_id: Objid, ok: bool) -> Result<()> {
        self.cancel_probe(poller, host_id);
        let retry = self
            .table_of(host_id)
            .map(|t| t.conf.retry)
            .unwrap_or(1);
        if let Some(rt) = self.hosts.get_mut(&host_id) {
            if let Some(state) = rt.probe_result(ok, retry) {
                let msg = HostStatusMsg {
                    host_id,
                    table_id: rt.conf.table_id,
                    state,
                };
                info!(host = %rt.conf.name, state = %state, "host transition");
                self.publish(&msg)?;
            }
        }
        self.reschedule(poller, host_id);
        Ok(())
    }

    fn publish(&mut self, msg: &HostStatusMsg) -> Result<()> {
        self.parent.send(MsgType::HostStatus, msg.host_id, msg)?;
        if let Some(pfe) = self.pfe.as_mut() {
            pfe.send(MsgType::HostStatus, msg.host_id, msg)?;
        }
        Ok(())
    }

    /// Refresh write interest after a round of work; sends can originate
    /// from timer handlers, outside the channels' own event arms.
    fn maintain_interest(&self, poller: &Poller) -> Result<()> {
        poller.modify(&self.parent, TOK_PARENT, true, self.parent.has_pending())?;
        if let Some(pfe) = self.pfe.as_ref() {
            poller.modify(pfe, TOK_PFE, true, pfe.has_pending())?;
        }
        Ok(())
    }

    fn icmp_readable(&mut self, poller: &mut Poller, v6: bool) -> Result<()> {
        let Some(fd) = (if v6 { self.icmp6.as_ref() } else { self.icmp4.as_ref() }) else {
            return Ok(());
        };
        let raw = fd.as_raw_fd();
        let mut finished = Vec::new();
        let mut buf = [0u8; 1500];
        loop {
            match recvfrom::<SockaddrStorage>(raw, &mut buf) {
                Ok((n, _)) => {
                    if let Some((ident, seq)) = icmp_reply(v6, &buf[..n]) {
                        if ident != self.ident {
                            continue;
                        }
                        if let Some(host_id) = self.icmp_flight.remove(&seq) {
                            finished.push(host_id);
                        }
                    }
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e).context("icmp recv"),
            }
        }
        for host_id in finished {
            self.finish(poller, host_id, true)?;
        }
        Ok(())
    }

    fn set_host_state(
        &mut self,
        poller: &mut Poller,
        host_id: Objid,
        state: HostState,
    ) -> Result<()> {
        self.cancel_probe(poller, host_id);
        let Some(rt) = self.hosts.get_mut(&host_id) else { return Ok(()) };
        rt.state = state;
        rt.up_cnt = 0;
        rt.down_cnt = 0;
        let msg = HostStatusMsg {
            host_id,
            table_id: rt.conf.table_id,
            state,
        };
        self.publish(&msg)?;
        if state == HostState::Disabled {
            poller.disarm(tok(KIND_INTERVAL, host_id));
        } else if self.ctx.started {
            poller.arm_in(tok(KIND_INTERVAL, host_id), Duration::from_millis(1));
        }
        Ok(())
    }
}

pub fn run(worker: WorkerProc, opts: &GlobalConf) -> Result<()> {
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

    let mut hce = Hce {
        ctx: WorkerCtx::new(worker.role, worker.instance),
        parent: worker.chan,
        pfe: None,
        hosts: HashMap::new(),
        probes: HashMap::new(),
        icmp_flight: HashMap::new(),
        icmp4: None,
        icmp6: None,
        icmp_seq: 0,
        ident: std::process::id() as u16,
        client_tls: tls::client_config(None)?,
    };
    let mut events = Vec::new();

    info!("hce ready");
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
                        hce.parent.flush()?;
                    }
                    loop {
                        let msg = match hce.parent.recv() {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        };
                        match hce.ctx.dispatch(&mut hce.parent, msg) {
                            Ok(CtlEvent::Apply(_)) => hce.rebuild_hosts(&mut poller),
                            Ok(CtlEvent::Start) => {
                                request_icmp_sockets(&mut hce)?;
                                hce.schedule_all(&mut poller);
                            }
                            Ok(CtlEvent::None) => {}
                            Ok(CtlEvent::Shutdown) => return Ok(()),
                            Ok(CtlEvent::Peer(fd, _)) => {
                                let chan = Channel::from_fd(fd);
                                chan.set_nonblocking(true)?;
                                poller.add(&chan, TOK_PFE, true, false)?;
                                hce.pfe = Some(chan);
                            }
                            Ok(CtlEvent::Service(mut msg)) => {
                                handle_service(&mut hce, &mut poller, &mut msg)?;
                            }
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        }
                    }
                    poller.modify(&hce.parent, TOK_PARENT, true, hce.parent.has_pending())?;
                }
                Event::Io { token: TOK_PFE, writable, .. } => {
                    if let Some(pfe) = hce.pfe.as_mut() {
                        if writable {
                            pfe.flush()?;
                        }
                        loop {
                            match pfe.recv() {
                                Ok(Some(msg)) => {
                                    warn!(?msg.hdr.typ, "unexpected message from pfe")
                                }
                                Ok(None) => break,
                                Err(e) => privsep::fatal_ipc(worker.role, &e),
                            }
                        }
                    }
                }
                Event::Io { token: TOK_ICMP4, .. } => hce.icmp_readable(&mut poller, false)?,
                Event::Io { token: TOK_ICMP6, .. } => hce.icmp_readable(&mut poller, true)?,
                Event::Io { token, writable, .. } => {
                    let (kind, id) = tok_kind(token);
                    if kind == KIND_PROBE {
                        hce.probe_io(&mut poller, id, writable)?;
                    }
                }
                Event::Timer { token } => {
                    let (kind, id) = tok_kind(token);
                    match kind {
                        KIND_INTERVAL => hce.launch(&mut poller, id)?,
                        KIND_DEADLINE => {
                            debug!(host = id, "probe timed out");
                            hce.finish(&mut poller, id, false)?;
                        }
                        _ => {}
                    }
                }
            }
        }
        hce.maintain_interest(&poller)?;
    }
}

fn handle_service(hce: &mut Hce, poller: &mut Poller, msg: &mut crate::ipc::Imsg) -> Result<()> {
    match msg.hdr.typ {
        MsgType::ScriptDone => {
            let done: ScriptDoneMsg = msg.decode().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            if hce.probes.contains_key(&done.host_id) {
                hce.finish(poller, done.host_id, done.code == 0)?;
            }
        }
        MsgType::BindAnyResp => {
            let fd = msg.take_fd().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            // peer_id distinguishes the address family of the socket
            if msg.hdr.peer_id == 6 {
                poller.add(&fd, TOK_ICMP6, true, false)?;
                hce.icmp6 = Some(fd);
            } else {
                poller.add(&fd, TOK_ICMP4, true, false)?;
                hce.icmp4 = Some(fd);
            }
            if hce.ctx.started {
                hce.schedule_all(poller);
            }
        }
        MsgType::HostEnable => {
            let host_id: Objid = msg.decode().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            hce.set_host_state(poller, host_id, HostState::Unknown)?;
        }
        MsgType::HostDisable => {
            let host_id: Objid = msg.decode().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            hce.set_host_state(poller, host_id, HostState::Disabled)?;
        }
        MsgType::TableEnable | MsgType::TableDisable => {
            let table_id: Objid = msg.decode().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let state = if msg.hdr.typ == MsgType::TableEnable {
                HostState::Unknown
            } else {
                HostState::Disabled
            };
            let ids: Vec<Objid> = hce
                .hosts
                .values()
                .filter(|rt| rt.conf.table_id == table_id)
                .map(|rt| rt.conf.id)
                .collect();
            for id in ids {
                hce.set_host_state(poller, id, state)?;
            }
        }
        other => warn!(?other, "unhandled message in hce"),
    }
    Ok(())
}

fn request_icmp_sockets(hce: &mut Hce) -> Result<()> {
    let needs: Vec<bool> = hce
        .ctx
        .store
        .tables
        .iter()
        .filter(|t| t.conf.check.kind == CheckKind::Icmp)
        .flat_map(|t| t.hosts.iter())
        .map(|h| matches!(h.addr, SocketAddr::V6(_)))
        .collect();
    if needs.iter().any(|&v6| !v6) && hce.icmp4.is_none() {
        hce.parent.send(
            MsgType::BindAny,
            4,
            &crate::parent::BindAnyMsg {
                req_id: 4,
                req: crate::parent::SockReq::Icmp4,
            },
        )?;
    }
    if needs.iter().any(|&v6| v6) && hce.icmp6.is_none() {
        hce.parent.send(
            MsgType::BindAny,
            6,
            &crate::parent::BindAnyMsg {
                req_id: 6,
                req: crate::parent::SockReq::Icmp6,
            },
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConf;

    fn host() -> HostRt {
        HostRt::new(HostConf {
            id: 1,
            table_id: 1,
            name: "10.0.0.1:80".into(),
            addr: "10.0.0.1:80".parse().unwrap(),
            weight: 1,
        })
    }

    #[test]
    fn comes_up_after_retry_successes() {
        let mut rt = host();
        assert_eq!(rt.probe_result(true, 3), None);
        assert_eq!(rt.probe_result(true, 3), None);
        assert_eq!(rt.probe_result(true, 3), Some(HostState::Up));
        assert_eq!(rt.state, HostState::Up);
    }

    #[test]
    fn up_state_has_hysteresis() {
        let mut rt = host();
        rt.state = HostState::Up;
        // fewer than retry consecutive failures never take the host down
        for _ in 0..10 {
            assert_eq!(rt.probe_result(false, 3), None);
            assert_eq!(rt.probe_result(false, 3), None);
            assert_eq!(rt.probe_result(true, 3), None);
            assert_eq!(rt.state, HostState::Up);
        }
        assert_eq!(rt.probe_result(false, 3), None);
        assert_eq!(rt.probe_result(false, 3), None);
        assert_eq!(rt.probe_result(false, 3), Some(HostState::Down));
    }

    #[test]
    fn script_scenario_publishes_exactly_two_transitions() {
        // retry=3: three zero exits bring the host up, three non-zero
        // exits take it down; exactly two transitions in total
        let mut rt = host();
        let mut transitions = Vec::new();
        for ok in [true, true, true, false, false, false] {
            if let Some(state) = rt.probe_result(ok, 3) {
                transitions.push(state);
            }
        }
        assert_eq!(transitions, vec![HostState::Up, HostState::Down]);
    }

    #[test]
    fn disabled_hosts_ignore_probes() {
        let mut rt = host();
        rt.state = HostState::Disabled;
        for ok in [true, true, true, false, false, false] {
            assert_eq!(rt.probe_result(ok, 1), None);
        }
    }

    #[test]
    fn retry_one_flips_immediately() {
        let mut rt = host();
        assert_eq!(rt.probe_result(true, 1), Some(HostState::Up));
        assert_eq!(rt.probe_result(false, 1), Some(HostState::Down));
    }

    #[test]
    fn http_eval_checks_status_and_digest() {
        let body = b"healthy\n";
        let md5_hex = hex(&Md5::digest(body));
        let mut check = CheckConf {
            kind: CheckKind::Http,
            path: Some("/health".into()),
            expect_status: Some(200),
            digest: Some((DigestAlgo::Md5, md5_hex)),
            send: None,
            expect: None,
            tls: false,
            port: None,
        };
        let response = format!(
            "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\nhealthy\n",
            body.len()
        );
        assert!(http_check_eval(&check, response.as_bytes()));

        let bad = response.replace("200 OK", "500 ERR");
        assert!(!http_check_eval(&check, bad.as_bytes()));

        check.digest = Some((DigestAlgo::Sha1, hex(&Sha1::digest(b"other"))));
        assert!(!http_check_eval(&check, response.as_bytes()));
    }

    #[test]
    fn icmp_echo_checksum_verifies() {
        let pkt = icmp_echo(false, 0x1234, 7);
        assert_eq!(inet_cksum(&pkt), 0);
        // a reply is the same packet with type 0, arriving behind an
        // IPv4 header
        let mut reply = vec![0x45u8];
        reply.extend_from_slice(&[0u8; 19]);
        let mut inner = pkt.clone();
        inner[0] = 0;
        reply.extend_from_slice(&inner);
        assert_eq!(icmp_reply(false, &reply), Some((0x1234, 7)));
        assert_eq!(icmp_reply(true, &inner), None);
    }
}
