//! The privileged parent: owns the configuration file and the control
//! socket, holds the only fork/exec and privileged-socket rights,
//! brokers config distribution and reload, and supervises the worker
//! set. It never touches client data.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        socket::{
            bind, listen, socket, socketpair, sockopt, AddressFamily, Backlog, SockFlag,
            SockType, SockaddrStorage,
        },
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Gid, Pid, Uid, User},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::{
    ca,
    config::{
        self, Config, HostState, HostStatusMsg, KeyAlgo, KeyPairMsg, Objid, ResetScope,
    },
    control::{ControlServer, HostRecord, RdrRecord, RelayRecord, SummaryRecord},
    event::{self, Event, Poller},
    hce::{ScriptDoneMsg, ScriptExecMsg},
    ipc::{Channel, Imsg, MsgType},
    privsep::{ChildProc, Role, WorkerProc},
    tls,
};

/// Privileged socket request served by the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SockReq {
    TcpListen(SocketAddr),
    UdpListen(SocketAddr),
    Icmp4,
    Icmp6,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindAnyMsg {
    pub req_id: u32,
    pub req: SockReq,
}

const TOK_SIGNAL: u64 = 0;
const TOK_CTL_LISTENER: u64 = 1;
const TOK_GRACE: u64 = 2;

const KIND_CHILD: u64 = 2;
const KIND_CTL_CONN: u64 = 3;
const KIND_SCRIPT: u64 = 4;

fn tok(kind: u64, id: u32) -> u64 {
    (kind << 32) | id as u64
}

fn tok_kind(token: u64) -> (u64, u32) {
    (token >> 32, token as u32)
}

/// The ordered frame stream of one config distribution: a reset, the
/// entities the scope covers, and the barrier. Keypairs are appended
/// separately for CA processes only.
pub fn config_frames(cfg: &Config, scope: ResetScope) -> Vec<(MsgType, Vec<u8>)> {
    let mut frames = Vec::new();
    frames.push((MsgType::CtlReset, bincode::serialize(&scope).unwrap()));
    if scope.covers_tables() {
        for table in &cfg.tables {
            frames.push((MsgType::CfgTable, bincode::serialize(&table.conf).unwrap()));
            for host in &table.hosts {
                frames.push((MsgType::CfgHost, bincode::serialize(host).unwrap()));
            }
        }
    } else if scope == ResetScope::Hosts {
        for table in &cfg.tables {
            for host in &table.hosts {
                frames.push((MsgType::CfgHost, bincode::serialize(host).unwrap()));
            }
        }
    }
    if scope.covers_rules() {
        for proto in &cfg.protos {
            frames.push((MsgType::CfgProto, bincode::serialize(proto).unwrap()));
        }
        for rule in &cfg.rules {
            frames.push((MsgType::CfgRule, bincode::serialize(rule).unwrap()));
        }
    }
    if scope.covers_relays() {
        for relay in &cfg.relays {
            frames.push((MsgType::CfgRelay, bincode::serialize(relay).unwrap()));
        }
    }
    if scope == ResetScope::All {
        for rdr in &cfg.rdrs {
            frames.push((MsgType::CfgRdr, bincode::serialize(rdr).unwrap()));
        }
    }
    frames.push((MsgType::CfgDone, bincode::serialize(&()).unwrap()));
    frames
}

struct Child {
    role: Role,
    instance: u32,
    pid: Pid,
    chan: Channel,
    alive: bool,
}

struct ScriptJob {
    host_id: Objid,
}

struct Parent {
    cfg: Config,
    cfg_path: PathBuf,
    macros: Vec<(String, String)>,
    children: Vec<Child>,
    control: ControlServer,
    started: bool,
    /// Children whose CFG_DONE ack is outstanding; reloads are refused
    /// while non-empty.
    barrier: HashSet<usize>,
    barrier_targets: Vec<usize>,
    reload_conn: Option<u32>,
    host_states: HashMap<Objid, HostState>,
    scripts: HashMap<i32, ScriptJob>,
    session_queries: HashMap<u32, (u32, u32)>,
    next_query: u32,
    unpriv: Option<(Uid, Gid)>,
    shutting_down: bool,
}

impl Parent {
    fn reload_pending(&self) -> u32 {
        self.barrier.len() as u32
    }

    fn child_index(&self, role: Role, instance: u32) -> Option<usize> {
        self.children
            .iter()
            .position(|c| c.role == role && c.instance == instance && c.alive)
    }

    // --- peer channel wiring --------------------------------------------

    fn connect_peers(&mut self, prefork: u32) -> Result<()> {
        if let (Some(hce), Some(pfe)) =
            (self.child_index(Role::Hce, 0), self.child_index(Role::Pfe, 0))
        {
            self.connect_pair(hce, pfe)?;
        }
        for i in 0..prefork {
            if let (Some(relay), Some(ca)) =
                (self.child_index(Role::Relay, i), self.child_index(Role::Ca, i))
            {
                self.connect_pair(relay, ca)?;
            }
        }
        Ok(())
    }

    /// Create a socketpair and hand one end to each child.
    fn connect_pair(&mut self, a: usize, b: usize) -> Result<()> {
        let (fd_a, fd_b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        let peer_b = self.children[b].instance;
        let peer_a = self.children[a].instance;
        self.children[a]
            .chan
            .send_with_fd(MsgType::CfgPeer, peer_b, &(), fd_a)?;
        self.children[b]
            .chan
            .send_with_fd(MsgType::CfgPeer, peer_a, &(), fd_b)?;
        debug!(
            a = %self.children[a].role,
            b = %self.children[b].role,
            "peer channel connected"
        );
        Ok(())
    }

    // --- key material ----------------------------------------------------

    /// Load certificates into the config and derive key algorithms.
    /// Private key bytes are parsed for the algorithm only and scrubbed
    /// right away.
    fn load_certs(cfg: &mut Config) -> Result<()> {
        for relay in &mut cfg.relays {
            if let Some(path) = &relay.cert_file {
                relay.cert_pem =
                    Some(std::fs::read(path).with_context(|| format!("cert {}", path.display()))?);
            }
            if let Some(path) = &relay.ca_cert_file {
                relay.ca_cert_pem = Some(
                    std::fs::read(path).with_context(|| format!("ca cert {}", path.display()))?,
                );
            }
            if let Some(path) = &relay.key_file {
                let mut pem =
                    std::fs::read(path).with_context(|| format!("key {}", path.display()))?;
                let der = tls::load_private_key(&pem)?;
                let key = rustls::crypto::ring::sign::any_supported_type(&der)
                    .map_err(|e| anyhow!("unsupported key {}: {e}", path.display()))?;
                relay.key_algo = Some(match key.algorithm() {
                    rustls::SignatureAlgorithm::RSA => KeyAlgo::Rsa,
                    rustls::SignatureAlgorithm::ED25519 => KeyAlgo::Ed25519,
                    _ => KeyAlgo::Ecdsa,
                });
                pem.zeroize();
            }
        }
        Ok(())
    }

    /// Key PEMs are read at distribution time and scrubbed immediately
    /// after the frames are queued.
    fn load_keypairs(&self) -> Result<Vec<KeyPairMsg>> {
        let mut keypairs = Vec::new();
        for relay in &self.cfg.relays {
            if let Some(path) = &relay.key_file {
                let pem =
                    std::fs::read(path).with_context(|| format!("key {}", path.display()))?;
                keypairs.push(KeyPairMsg {
                    objid: relay.id,
                    key_pem: pem,
                });
            }
        }
        Ok(keypairs)
    }

    // --- distribution and reload ----------------------------------------

    fn distribute(&mut self, scope: ResetScope, only: Option<usize>) -> Result<()> {
        let frames = config_frames(&self.cfg, scope);
        let mut keypairs = if scope.covers_relays() {
            self.load_keypairs()?
        } else {
            Vec::new()
        };

        let targets: Vec<usize> = match only {
            Some(idx) => vec![idx],
            None => (0..self.children.len())
                .filter(|&i| self.children[i].alive)
                .collect(),
        };
        for &idx in &targets {
            let role = self.children[idx].role;
            let chan = &mut self.children[idx].chan;
            for (i, (typ, payload)) in frames.iter().enumerate() {
                if i == frames.len() - 1 && role == Role::Ca {
                    for kp in &keypairs {
                        chan.send(MsgType::CfgKeypair, kp.objid, kp)?;
                    }
                }
                chan.send_raw(*typ, 0, payload)?;
            }
            if self.barrier.insert(idx) {
                self.barrier_targets.push(idx);
            }
        }
        for kp in &mut keypairs {
            kp.key_pem.zeroize();
        }
        info!(?scope, pending = self.reload_pending(), "configuration distributed");
        Ok(())
    }

    fn reload(&mut self, scope: ResetScope, conn: Option<u32>) {
        if self.reload_pending() > 0 {
            warn!("reload already in progress, request rejected");
            if let Some(id) = conn {
                self.control.fail(id);
            }
            return;
        }
        let result = config::load(&self.cfg_path, &self.macros).and_then(|mut new| {
            Self::load_certs(&mut new)
                .map_err(|e| config::ConfigError::Semantic(e.to_string()))?;
            new.inherit_table_ids(&self.cfg);
            Ok(new)
        });
        match result {
            Ok(new) => {
                info!(path = %self.cfg_path.display(), "configuration reloaded");
                self.cfg = new;
                self.reload_conn = conn;
                if let Err(e) = self.distribute(scope, None) {
                    error!(%e, "config distribution failed");
                    self.initiate_shutdown(None);
                }
            }
            Err(e) => {
                // the old config stays live
                warn!(%e, "reload failed, keeping previous configuration");
                if let Some(id) = conn {
                    self.control.fail(id);
                }
            }
        }
    }

    fn child_acked(&mut self, idx: usize) {
        if !self.barrier.remove(&idx) {
            return;
        }
        if !self.barrier.is_empty() {
            return;
        }
        // barrier passed: release the targets
        let targets = std::mem::take(&mut self.barrier_targets);
        for idx in targets {
            if let Some(child) = self.children.get_mut(idx) {
                if child.alive {
                    let _ = child.chan.send(MsgType::CtlStart, 0, &());
                }
            }
        }
        self.started = true;
        info!("workers started");
        if let Some(conn) = self.reload_conn.take() {
            self.control.ok(conn);
        }
    }

    // --- privileged services ---------------------------------------------

    fn serve_bindany(&mut self, idx: usize, msg: &Imsg) -> Result<()> {
        let req: BindAnyMsg = msg.decode().map_err(|e| anyhow!(e.to_string()))?;
        let role = self.children[idx].role;
        let sock = match (&req.req, role) {
            (SockReq::TcpListen(addr), Role::Relay) => {
                self.check_listen_addr(*addr)?;
                let fd = socket(
                    family_of(*addr),
                    SockType::Stream,
                    SockFlag::SOCK_CLOEXEC,
                    None,
                )?;
                nix::sys::socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
                bind(fd.as_raw_fd(), &SockaddrStorage::from(*addr))?;
                listen(&fd, Backlog::new(128).unwrap_or(Backlog::MAXCONN))?;
                fd
            }
            (SockReq::UdpListen(addr), Role::Relay) => {
                self.check_listen_addr(*addr)?;
                let fd = socket(
                    family_of(*addr),
                    SockType::Datagram,
                    SockFlag::SOCK_CLOEXEC,
                    None,
                )?;
                nix::sys::socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
                bind(fd.as_raw_fd(), &SockaddrStorage::from(*addr))?;
                fd
            }
            (SockReq::Icmp4, Role::Hce) => raw_icmp_socket(false)?,
            (SockReq::Icmp6, Role::Hce) => raw_icmp_socket(true)?,
            (other, role) => {
                warn!(?other, %role, "refused privileged socket request");
                return Err(anyhow!("unauthorized socket request"));
            }
        };
        self.children[idx]
            .chan
            .send_with_fd(MsgType::BindAnyResp, req.req_id, &(), sock)?;
        Ok(())
    }

    fn check_listen_addr(&self, addr: SocketAddr) -> Result<()> {
        if self.cfg.relays.iter().any(|r| r.listen == addr) {
            Ok(())
        } else {
            Err(anyhow!("bind request for unconfigured address {addr}"))
        }
    }

    fn exec_script(&mut self, poller: &mut Poller, idx: usize, msg: &Imsg) -> Result<()> {
        let req: ScriptExecMsg = msg.decode().map_err(|e| anyhow!(e.to_string()))?;
        let mut cmd = Command::new(&req.path);
        cmd.arg(&req.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some((uid, gid)) = self.unpriv {
            unsafe {
                cmd.pre_exec(move || {
                    nix::unistd::setgid(gid).map_err(std::io::Error::from)?;
                    nix::unistd::setuid(uid).map_err(std::io::Error::from)?;
                    Ok(())
                });
            }
        }
        match cmd.spawn() {
            Ok(child) => {
                let pid = child.id() as i32;
                // the SIGCHLD handler reaps and reports; drop the handle
                std::mem::forget(child);
                self.scripts.insert(pid, ScriptJob { host_id: req.host_id });
                poller.arm_in(
                    tok(KIND_SCRIPT, pid as u32),
                    Duration::from_millis(req.timeout_ms),
                );
                debug!(pid, script = %req.path, host = %req.host, "check script started");
            }
            Err(e) => {
                debug!(script = %req.path, %e, "check script failed to start");
                self.script_done(idx, req.host_id, 127)?;
            }
        }
        Ok(())
    }

    fn script_done(&mut self, hce_idx: usize, host_id: Objid, code: i32) -> Result<()> {
        self.children[hce_idx].chan.send(
            MsgType::ScriptDone,
            host_id,
            &ScriptDoneMsg { host_id, code },
        )?;
        Ok(())
    }

    // --- child supervision -----------------------------------------------

    fn reap(&mut self, poller: &mut Poller) -> Result<()> {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => self.reaped(poller, pid, code)?,
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.reaped(poller, pid, 128 + sig as i32)?
                }
                Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e).context("waitpid"),
            }
        }
    }

    fn reaped(&mut self, poller: &mut Poller, pid: Pid, code: i32) -> Result<()> {
        if let Some(job) = self.scripts.remove(&pid.as_raw()) {
            poller.disarm(tok(KIND_SCRIPT, pid.as_raw() as u32));
            if let Some(hce) = self.child_index(Role::Hce, 0) {
                self.script_done(hce, job.host_id, code)?;
            }
            return Ok(());
        }

        let Some(idx) = self.children.iter().position(|c| c.pid == pid) else {
            return Ok(());
        };
        let (role, instance) = (self.children[idx].role, self.children[idx].instance);
        self.children[idx].alive = false;
        self.barrier.remove(&idx);
        if self.shutting_down {
            debug!(%role, instance, "worker exited");
            return Ok(());
        }
        if role == Role::Ca {
            // key workers are respawned; a failed handshake is the only
            // visible effect
            warn!(instance, code, "ca worker died, respawning");
            self.respawn_ca(poller, instance)?;
            return Ok(());
        }
        error!(%role, instance, code, "critical worker died");
        self.initiate_shutdown(Some(poller));
        Ok(())
    }

    fn respawn_ca(&mut self, poller: &mut Poller, instance: u32) -> Result<()> {
        let (parent_end, child_end) = Channel::pair()?;
        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                drop(child_end);
                let idx = self.children.len();
                poller.add(&parent_end, tok(KIND_CHILD, idx as u32), true, false)?;
                self.children.push(Child {
                    role: Role::Ca,
                    instance,
                    pid: child,
                    chan: parent_end,
                    alive: true,
                });
                if let Some(relay) = self.child_index(Role::Relay, instance) {
                    self.connect_pair(relay, idx)?;
                }
                self.distribute(ResetScope::All, Some(idx))?;
                Ok(())
            }
            ForkResult::Child => {
                drop(parent_end);
                // close our copies of the parent's descriptors; the
                // parent's own references stay intact
                for sibling in &self.children {
                    let _ = nix::unistd::close(sibling.chan.as_raw_fd());
                }
                let _ = nix::unistd::close(self.control.listener().as_raw_fd());
                crate::privsep::set_title(Role::Ca, instance);
                let worker = WorkerProc {
                    role: Role::Ca,
                    instance,
                    chan: child_end,
                };
                let code = match ca::run(worker, &self.cfg.opts) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(%e, "ca worker failed");
                        1
                    }
                };
                std::process::exit(code);
            }
        }
    }

    fn initiate_shutdown(&mut self, poller: Option<&mut Poller>) {
        if self.shutting_down {
            return;
        }
        info!("shutting down");
        self.shutting_down = true;
        for child in self.children.iter_mut().filter(|c| c.alive) {
            let _ = child.chan.send(MsgType::CtlShutdown, 0, &());
        }
        if let Some(poller) = poller {
            poller.arm_in(TOK_GRACE, Duration::from_secs(3));
        }
    }

    fn all_children_dead(&self) -> bool {
        self.children.iter().all(|c| !c.alive)
    }

    // --- state fan-out ---------------------------------------------------

    fn host_status(&mut self, msg: &Imsg) -> Result<()> {
        let status: HostStatusMsg = msg.decode().map_err(|e| anyhow!(e.to_string()))?;
        self.host_states.insert(status.host_id, status.state);
        let payload = msg.payload.clone();
        for child in self
            .children
            .iter_mut()
            .filter(|c| c.alive && c.role == Role::Relay)
        {
            child
                .chan
                .send_raw(MsgType::HostStatus, status.host_id, &payload)?;
        }
        for conn in self.control.monitor_ids() {
            self.control
                .send_raw(conn, MsgType::HostStatus, &payload);
        }
        Ok(())
    }

    // --- control commands ------------------------------------------------

    fn control_command(&mut self, conn: u32, msg: Imsg) -> Result<()> {
        let privileged = self.control.privileged(conn);
        match msg.hdr.typ {
            MsgType::ShowSummary => self.show_summary(conn),
            MsgType::ShowHosts => self.show_hosts(conn),
            MsgType::ShowRelays => self.show_relays(conn),
            MsgType::ShowRedirects => self.show_redirects(conn),
            MsgType::ShowSessions => self.show_sessions(conn)?,
            MsgType::Monitor => {
                self.control.set_monitor(conn, true);
                self.control.ok(conn);
            }
            _ if !privileged => {
                warn!(conn, "unauthorized control command");
                self.control.fail(conn);
            }
            MsgType::CtlReload => {
                let scope = msg.decode().unwrap_or(ResetScope::All);
                self.reload(scope, Some(conn));
            }
            MsgType::CtlReset => {
                let scope = msg.decode().unwrap_or(ResetScope::All);
                if self.reload_pending() > 0 {
                    self.control.fail(conn);
                } else {
                    self.distribute(scope, None)?;
                    self.control.ok(conn);
                }
            }
            MsgType::HostEnable | MsgType::HostDisable | MsgType::TableEnable
            | MsgType::TableDisable => {
                let id: Objid = match msg.decode() {
                    Ok(id) => id,
                    Err(_) => {
                        self.control.fail(conn);
                        return Ok(());
                    }
                };
                match self.child_index(Role::Hce, 0) {
                    Some(hce) => {
                        self.children[hce].chan.send_raw(msg.hdr.typ, id, &msg.payload)?;
                        self.control.ok(conn);
                    }
                    None => self.control.fail(conn),
                }
            }
            MsgType::LogVerbose | MsgType::LogBrief => {
                crate::logger::set_verbose(msg.hdr.typ == MsgType::LogVerbose);
                for child in self.children.iter_mut().filter(|c| c.alive) {
                    child.chan.send_raw(msg.hdr.typ, 0, &[])?;
                }
                self.control.ok(conn);
            }
            other => {
                debug!(?other, "unknown control command");
                self.control.fail(conn);
            }
        }
        Ok(())
    }

    fn show_summary(&mut self, conn: u32) {
        let mut records = Vec::new();
        for relay in &self.cfg.relays {
            records.push(SummaryRecord {
                kind: "relay".into(),
                id: relay.id,
                name: relay.name.clone(),
                status: "active".into(),
            });
        }
        for table in &self.cfg.tables {
            let up = table
                .hosts
                .iter()
                .filter(|h| self.host_states.get(&h.id) == Some(&HostState::Up))
                .count();
            records.push(SummaryRecord {
                kind: "table".into(),
                id: table.conf.id,
                name: table.conf.name.clone(),
                status: format!("{up}/{} hosts up", table.hosts.len()),
            });
        }
        for rdr in &self.cfg.rdrs {
            records.push(SummaryRecord {
                kind: "redirect".into(),
                id: rdr.id,
                name: rdr.name.clone(),
                status: "active".into(),
            });
        }
        for record in records {
            self.control.send(conn, MsgType::ShowSummary, &record);
        }
        self.control.end(conn);
    }

    fn show_hosts(&mut self, conn: u32) {
        let mut records = Vec::new();
        for table in &self.cfg.tables {
            for host in &table.hosts {
                let state = self
                    .host_states
                    .get(&host.id)
                    .copied()
                    .unwrap_or(HostState::Unknown);
                records.push(HostRecord {
                    id: host.id,
                    name: host.name.clone(),
                    table: table.conf.name.clone(),
                    state: state.to_string(),
                    weight: host.weight,
                });
            }
        }
        for record in records {
            self.control.send(conn, MsgType::ShowHosts, &record);
        }
        self.control.end(conn);
    }

    fn show_relays(&mut self, conn: u32) {
        let mut records = Vec::new();
        for relay in &self.cfg.relays {
            let mut flags = Vec::new();
            for (on, name) in [
                (relay.flags.ssl, "ssl"),
                (relay.flags.ssl_client, "ssl-client"),
                (relay.flags.ssl_inspect, "ssl-inspect"),
                (relay.flags.udp, "udp"),
                (relay.flags.needpf, "needpf"),
            ] {
                if on {
                    flags.push(name);
                }
            }
            records.push(RelayRecord {
                id: relay.id,
                name: relay.name.clone(),
                listen: relay.listen,
                flags: flags.join(","),
                protocol: relay
                    .proto_id
                    .and_then(|id| self.cfg.protos.iter().find(|p| p.id == id))
                    .map(|p| p.name.clone()),
            });
        }
        for record in records {
            self.control.send(conn, MsgType::ShowRelays, &record);
        }
        self.control.end(conn);
    }

    fn show_redirects(&mut self, conn: u32) {
        let mut records = Vec::new();
        for rdr in &self.cfg.rdrs {
            records.push(RdrRecord {
                id: rdr.id,
                name: rdr.name.clone(),
                listen: rdr.listen,
                table: self
                    .cfg
                    .table(rdr.table_id)
                    .map(|t| t.conf.name.clone())
                    .unwrap_or_default(),
            });
        }
        for record in records {
            self.control.send(conn, MsgType::ShowRedirects, &record);
        }
        self.control.end(conn);
    }

    /// Sessions live in the relay workers; fan the query out and stream
    /// the records back as they arrive.
    fn show_sessions(&mut self, conn: u32) -> Result<()> {
        self.next_query = self.next_query.wrapping_add(1).max(1);
        let query = self.next_query;
        let mut relays = 0;
        for child in self
            .children
            .iter_mut()
            .filter(|c| c.alive && c.role == Role::Relay)
        {
            child.chan.send(MsgType::ShowSessions, query, &())?;
            relays += 1;
        }
        if relays == 0 {
            self.control.end(conn);
        } else {
            self.session_queries.insert(query, (conn, relays));
        }
        Ok(())
    }

    // --- child messages --------------------------------------------------

    fn child_message(&mut self, poller: &mut Poller, idx: usize, msg: Imsg) -> Result<()> {
        match msg.hdr.typ {
            MsgType::CfgDone => self.child_acked(idx),
            MsgType::HostStatus => self.host_status(&msg)?,
            MsgType::ScriptExec => self.exec_script(poller, idx, &msg)?,
            MsgType::BindAny => {
                if let Err(e) = self.serve_bindany(idx, &msg) {
                    warn!(%e, "bindany request failed");
                }
            }
            MsgType::SessionPublish => {
                let query = msg.hdr.peer_id;
                if let Some(&(conn, _)) = self.session_queries.get(&query) {
                    self.control
                        .send_raw(conn, MsgType::SessionPublish, &msg.payload);
                }
            }
            MsgType::CtlEnd => {
                let query = msg.hdr.peer_id;
                if let Some((conn, pending)) = self.session_queries.get_mut(&query) {
                    *pending -= 1;
                    if *pending == 0 {
                        let conn = *conn;
                        self.session_queries.remove(&query);
                        self.control.end(conn);
                    }
                }
            }
            other => debug!(?other, child = idx, "unhandled child message"),
        }
        Ok(())
    }
}

fn family_of(addr: SocketAddr) -> AddressFamily {
    match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    }
}

fn raw_icmp_socket(v6: bool) -> Result<OwnedFd> {
    let (domain, proto) = if v6 {
        (libc::AF_INET6, libc::IPPROTO_ICMPV6)
    } else {
        (libc::AF_INET, libc::IPPROTO_ICMP)
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            proto,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("raw icmp socket");
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn run(
    cfg: Config,
    cfg_path: PathBuf,
    macros: Vec<(String, String)>,
    children: Vec<ChildProc>,
) -> Result<()> {
    crate::privsep::ignore_sigpipe()?;
    let mut poller = Poller::new()?;
    let mut sfd = event::signal_fd(&[
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGHUP,
        Signal::SIGCHLD,
    ])?;
    poller.add(&sfd, TOK_SIGNAL, true, false)?;

    let control = ControlServer::bind(&cfg.opts.control_socket)?;
    poller.add(control.listener(), TOK_CTL_LISTENER, true, false)?;

    let unpriv = if cfg.opts.disable_privdrop {
        None
    } else {
        User::from_name(&cfg.opts.user)
            .ok()
            .flatten()
            .map(|u| (u.uid, u.gid))
    };

    let prefork = cfg.opts.prefork;
    let mut parent = Parent {
        cfg,
        cfg_path,
        macros,
        children: Vec::new(),
        control,
        started: false,
        barrier: HashSet::new(),
        barrier_targets: Vec::new(),
        reload_conn: None,
        host_states: HashMap::new(),
        scripts: HashMap::new(),
        session_queries: HashMap::new(),
        next_query: 0,
        unpriv,
        shutting_down: false,
    };
    for (idx, child) in children.into_iter().enumerate() {
        poller.add(&child.chan, tok(KIND_CHILD, idx as u32), true, false)?;
        parent.children.push(Child {
            role: child.role,
            instance: child.instance,
            pid: child.pid,
            chan: child.chan,
            alive: true,
        });
    }

    parent.connect_peers(prefork)?;
    Parent::load_certs(&mut parent.cfg)?;
    parent.distribute(ResetScope::All, None)?;

    let mut events = Vec::new();
    loop {
        poller.wait(&mut events)?;
        let round: Vec<Event> = events.clone();
        for ev in round {
            match ev {
                Event::Io { token: TOK_SIGNAL, .. } => {
                    while let Ok(Some(sig)) = sfd.read_signal() {
                        match sig.ssi_signo as i32 {
                            libc::SIGHUP => {
                                info!("reload requested by SIGHUP");
                                parent.reload(ResetScope::All, None);
                            }
                            libc::SIGCHLD => parent.reap(&mut poller)?,
                            libc::SIGTERM | libc::SIGINT => {
                                parent.initiate_shutdown(Some(&mut poller))
                            }
                            _ => {}
                        }
                    }
                }
                Event::Io { token: TOK_CTL_LISTENER, .. } => {
                    for conn in parent.control.accept() {
                        if let Some(c) = parent.control.conn(conn) {
                            poller.add(&c.chan, tok(KIND_CTL_CONN, conn), true, false)?;
                        }
                    }
                }
                Event::Io { token, writable, .. } => {
                    let (kind, id) = tok_kind(token);
                    match kind {
                        KIND_CHILD => {
                            let idx = id as usize;
                            if writable {
                                if let Some(child) = parent.children.get_mut(idx) {
                                    let _ = child.chan.flush();
                                }
                            }
                            loop {
                                let recv = match parent.children.get_mut(idx) {
                                    Some(child) if child.alive => child.chan.recv(),
                                    _ => break,
                                };
                                match recv {
                                    Ok(Some(msg)) => {
                                        parent.child_message(&mut poller, idx, msg)?
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        // reaped via SIGCHLD; just stop reading
                                        debug!(idx, %e, "child channel error");
                                        break;
                                    }
                                }
                            }
                            if let Some(child) = parent.children.get(idx) {
                                if child.alive {
                                    let pending = child.chan.has_pending();
                                    poller.modify(
                                        &child.chan,
                                        tok(KIND_CHILD, id),
                                        true,
                                        pending,
                                    )?;
                                }
                            }
                        }
                        KIND_CTL_CONN => {
                            let mut closed = false;
                            loop {
                                match parent.control.recv(id) {
                                    Ok(Some(msg)) => parent.control_command(id, msg)?,
                                    Ok(None) => break,
                                    Err(_) => {
                                        closed = true;
                                        break;
                                    }
                                }
                            }
                            if closed {
                                if let Some(conn) = parent.control.drop_conn(id) {
                                    let _ = poller.delete(&conn.chan);
                                }
                            } else if let Some(conn) = parent.control.conn(id) {
                                let pending = conn.chan.has_pending();
                                poller.modify(
                                    &conn.chan,
                                    tok(KIND_CTL_CONN, id),
                                    true,
                                    pending,
                                )?;
                            }
                        }
                        _ => {}
                    }
                }
                Event::Timer { token: TOK_GRACE } => {
                    for child in parent.children.iter().filter(|c| c.alive) {
                        let _ = kill(child.pid, Signal::SIGKILL);
                    }
                    info!("shutdown grace period expired");
                    return Ok(());
                }
                Event::Timer { token } => {
                    let (kind, pid) = tok_kind(token);
                    if kind == KIND_SCRIPT && parent.scripts.contains_key(&(pid as i32)) {
                        debug!(pid, "check script timed out, killing");
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                }
            }
        }
        // sends happen from signal, timer, and cross-channel contexts;
        // refresh write interest once per round
        for (idx, child) in parent.children.iter().enumerate() {
            if child.alive {
                let _ = poller.modify(
                    &child.chan,
                    tok(KIND_CHILD, idx as u32),
                    true,
                    child.chan.has_pending(),
                );
            }
        }
        for id in parent.control.conn_ids() {
            if let Some(conn) = parent.control.conn(id) {
                let _ = poller.modify(
                    &conn.chan,
                    tok(KIND_CTL_CONN, id),
                    true,
                    conn.chan.has_pending(),
                );
            }
        }
        if parent.shutting_down && parent.all_children_dead() {
            info!("all workers exited");
            return Ok(());
        }
    }
}
