//! Privilege separation: role bookkeeping, forking the worker set, and
//! dropping privileges in children. The parent keeps root; every worker
//! chroots and switches to the unprivileged account before touching any
//! network input.

use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::{
    sys::{resource, signal},
    unistd::{self, fork, ForkResult, Pid, User},
};
use tracing::{debug, warn};

use crate::{
    config::{GlobalConf, KeyPairMsg, ResetScope, Shadow, Store},
    ipc::{Channel, Imsg, IpcError, MsgType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Pfe,
    Hce,
    Relay,
    Ca,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Pfe => "pfe",
            Role::Hce => "hce",
            Role::Relay => "relay",
            Role::Ca => "ca",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A worker from the parent's point of view.
pub struct ChildProc {
    pub role: Role,
    pub instance: u32,
    pub pid: Pid,
    pub chan: Channel,
}

/// This process, from the worker's point of view.
pub struct WorkerProc {
    pub role: Role,
    pub instance: u32,
    pub chan: Channel,
}

pub enum Forked {
    Parent(Vec<ChildProc>),
    Worker(WorkerProc),
}

/// Fork the full worker set: PFE, HCE, and `prefork` relay and CA
/// instances each, every one holding a fresh socketpair to the parent.
pub fn fork_children(prefork: u32) -> Result<Forked> {
    let mut plan = vec![(Role::Pfe, 0), (Role::Hce, 0)];
    for i in 0..prefork {
        plan.push((Role::Relay, i));
    }
    for i in 0..prefork {
        plan.push((Role::Ca, i));
    }

    let mut children: Vec<ChildProc> = Vec::new();
    for (role, instance) in plan {
        let (parent_end, child_end) = Channel::pair()?;
        match unsafe { fork() }.context("fork")? {
            ForkResult::Parent { child } => {
                drop(child_end);
                children.push(ChildProc {
                    role,
                    instance,
                    pid: child,
                    chan: parent_end,
                });
            }
            ForkResult::Child => {
                // Close every parent-side descriptor inherited so far.
                drop(parent_end);
                drop(children);
                set_title(role, instance);
                death_sig();
                return Ok(Forked::Worker(WorkerProc {
                    role,
                    instance,
                    chan: child_end,
                }));
            }
        }
    }
    Ok(Forked::Parent(children))
}

/// chroot and switch to the unprivileged account. Failure here is fatal
/// for the worker.
pub fn drop_privileges(opts: &GlobalConf) -> Result<()> {
    if opts.disable_privdrop {
        debug!("privilege drop disabled by configuration");
        return Ok(());
    }
    if !unistd::geteuid().is_root() {
        bail!("need root privileges");
    }

    let user = User::from_name(&opts.user)
        .context("user lookup")?
        .with_context(|| format!("unknown user {:?}", opts.user))?;

    let dir = match &opts.chroot {
        Some(dir) => dir.as_path(),
        None if user.dir.is_dir() => user.dir.as_path(),
        None => Path::new("/var/empty"),
    };
    unistd::chroot(dir).context("chroot")?;
    unistd::chdir("/").context("chdir")?;

    unistd::setgroups(&[user.gid]).context("setgroups")?;
    unistd::setresgid(user.gid, user.gid, user.gid).context("setresgid")?;
    unistd::setresuid(user.uid, user.uid, user.uid).context("setresuid")?;
    Ok(())
}

pub fn set_title(role: Role, instance: u32) {
    let title = match role {
        Role::Relay | Role::Ca => format!("shunt: {} {}", role.name(), instance),
        _ => format!("shunt: {}", role.name()),
    };
    if let Ok(name) = CString::new(title) {
        let _ = nix::sys::prctl::set_name(&name);
    }
}

/// Die with the parent rather than lingering on a dead supervisor.
fn death_sig() {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM, 0, 0, 0);
    }
}

pub fn ignore_sigpipe() -> Result<()> {
    unsafe {
        signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn)
            .context("sigpipe")?;
    }
    Ok(())
}

/// Raise the descriptor limit to the hard maximum; relays size their
/// accept reserve from the result.
pub fn raise_nofile() -> Result<u64> {
    let (_, hard) = resource::getrlimit(resource::Resource::RLIMIT_NOFILE)?;
    resource::setrlimit(resource::Resource::RLIMIT_NOFILE, hard, hard)?;
    Ok(hard)
}

/// What a worker's channel dispatcher tells the role loop to do next.
#[derive(Debug)]
pub enum CtlEvent {
    /// Frame consumed internally, nothing to do.
    None,
    /// A shadow config was swapped in with this scope.
    Apply(ResetScope),
    /// CTL_START barrier passed.
    Start,
    Shutdown,
    /// Peer channel descriptor from the parent; peer_id names the peer.
    Peer(OwnedFd, u32),
    /// Role-specific message the common dispatcher does not understand.
    Service(Imsg),
}

/// Config-barrier state shared by every worker role: CFG_* frames are
/// collected into a shadow area and swapped atomically at CFG_DONE,
/// which is also when the ack goes back to the parent.
pub struct WorkerCtx {
    pub role: Role,
    pub instance: u32,
    pub store: Store,
    pub keypairs: Vec<KeyPairMsg>,
    shadow: Option<Shadow>,
    shadow_keys: Vec<KeyPairMsg>,
    pub started: bool,
}

impl WorkerCtx {
    pub fn new(role: Role, instance: u32) -> WorkerCtx {
        WorkerCtx {
            role,
            instance,
            store: Store::default(),
            keypairs: Vec::new(),
            shadow: None,
            shadow_keys: Vec::new(),
            started: false,
        }
    }

    fn shadow_mut(&mut self) -> Result<&mut Shadow, IpcError> {
        self.shadow
            .as_mut()
            .ok_or_else(|| IpcError::Protocol("config frame outside reset".into()))
    }

    pub fn dispatch(&mut self, chan: &mut Channel, mut imsg: Imsg) -> Result<CtlEvent, IpcError> {
        match imsg.hdr.typ {
            MsgType::CtlReset => {
                let scope: ResetScope = imsg.decode()?;
                debug!(?scope, "entering config reset");
                self.shadow = Some(Shadow::new(scope));
                if scope.covers_relays() {
                    self.shadow_keys.clear();
                }
                Ok(CtlEvent::None)
            }
            MsgType::CfgTable => {
                let conf = imsg.decode()?;
                self.shadow_mut()?.add_table(conf);
                Ok(CtlEvent::None)
            }
            MsgType::CfgHost => {
                let host = imsg.decode()?;
                self.shadow_mut()?
                    .add_host(host)
                    .map_err(|e| IpcError::Protocol(e.to_string()))?;
                Ok(CtlEvent::None)
            }
            MsgType::CfgProto => {
                let proto = imsg.decode()?;
                self.shadow_mut()?.protos.push(proto);
                Ok(CtlEvent::None)
            }
            MsgType::CfgRule => {
                let rule = imsg.decode()?;
                self.shadow_mut()?.rules.push(rule);
                Ok(CtlEvent::None)
            }
            MsgType::CfgRelay => {
                let relay = imsg.decode()?;
                self.shadow_mut()?.relays.push(relay);
                Ok(CtlEvent::None)
            }
            MsgType::CfgRdr => {
                let rdr = imsg.decode()?;
                self.shadow_mut()?.rdrs.push(rdr);
                Ok(CtlEvent::None)
            }
            MsgType::CfgKeypair => {
                if self.role != Role::Ca {
                    return Err(IpcError::Protocol(
                        "private key sent to a non-ca process".into(),
                    ));
                }
                let keypair = imsg.decode()?;
                self.shadow_keys.push(keypair);
                Ok(CtlEvent::None)
            }
            MsgType::CfgDone => {
                let shadow = self
                    .shadow
                    .take()
                    .ok_or_else(|| IpcError::Protocol("CFG_DONE outside reset".into()))?;
                let scope = shadow.scope;
                self.store.apply(shadow);
                if scope.covers_relays() {
                    self.keypairs = std::mem::take(&mut self.shadow_keys);
                }
                chan.send(MsgType::CfgDone, self.instance, &())?;
                Ok(CtlEvent::Apply(scope))
            }
            MsgType::CtlStart => {
                self.started = true;
                Ok(CtlEvent::Start)
            }
            MsgType::CtlShutdown => Ok(CtlEvent::Shutdown),
            MsgType::LogVerbose => {
                crate::logger::set_verbose(true);
                Ok(CtlEvent::None)
            }
            MsgType::LogBrief => {
                crate::logger::set_verbose(false);
                Ok(CtlEvent::None)
            }
            MsgType::CfgPeer => {
                let peer_id = imsg.hdr.peer_id;
                let fd = imsg.take_fd()?;
                Ok(CtlEvent::Peer(fd, peer_id))
            }
            _ => Ok(CtlEvent::Service(imsg)),
        }
    }
}

/// Worker-side fatal-error policy: an IPC protocol violation or a closed
/// parent channel terminates the process.
pub fn fatal_ipc(role: Role, err: &IpcError) -> ! {
    match err {
        IpcError::Closed => warn!(%role, "parent channel closed, exiting"),
        other => warn!(%role, %other, "ipc protocol violation, exiting"),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse;

    const MINI: &str = r#"{
        "tables": [
            { "name": "t", "check": { "kind": "tcp" }, "hosts": ["127.0.0.1:9000"] }
        ],
        "relays": [
            { "name": "r", "listen": "127.0.0.1:8000",
              "forward": [ { "table": "t" } ] }
        ]
    }"#;

    /// Drive a full parent-style distribution through a real channel
    /// pair and collect the dispatcher's decisions.
    fn distribute(ctx: &mut WorkerCtx, scope: ResetScope) -> Vec<CtlEvent> {
        let cfg = parse(MINI).unwrap();
        let (mut parent_end, mut worker_end) = Channel::pair().unwrap();
        for (typ, payload) in crate::parent::config_frames(&cfg, scope) {
            parent_end.send_raw(typ, 0, &payload).unwrap();
        }
        let mut events = Vec::new();
        while let Some(msg) = worker_end.recv().unwrap() {
            events.push(ctx.dispatch(&mut worker_end, msg).unwrap());
        }
        events
    }

    #[test]
    fn shadow_swaps_at_cfg_done_only() {
        let mut ctx = WorkerCtx::new(Role::Relay, 0);
        let events = distribute(&mut ctx, ResetScope::All);
        assert_eq!(ctx.store.tables.len(), 1);
        assert_eq!(ctx.store.relays.len(), 1);
        assert!(matches!(
            events.last(),
            Some(CtlEvent::Apply(ResetScope::All))
        ));
    }

    #[test]
    fn rules_scope_keeps_tables() {
        let mut ctx = WorkerCtx::new(Role::Relay, 0);
        distribute(&mut ctx, ResetScope::All);
        distribute(&mut ctx, ResetScope::Rules);
        assert_eq!(ctx.store.tables.len(), 1);
        assert_eq!(ctx.store.relays.len(), 1);
    }

    #[test]
    fn cfg_frame_outside_reset_is_protocol_violation() {
        let (mut parent_end, mut worker_end) = Channel::pair().unwrap();
        let mut ctx = WorkerCtx::new(Role::Relay, 0);
        let cfg = parse(MINI).unwrap();
        parent_end
            .send(MsgType::CfgTable, 0, &cfg.tables[0].conf)
            .unwrap();
        let msg = worker_end.recv().unwrap().unwrap();
        assert!(matches!(
            ctx.dispatch(&mut worker_end, msg),
            Err(IpcError::Protocol(_))
        ));
    }

    #[test]
    fn keypair_to_non_ca_is_protocol_violation() {
        let (mut parent_end, mut worker_end) = Channel::pair().unwrap();
        let mut ctx = WorkerCtx::new(Role::Relay, 0);
        parent_end
            .send(MsgType::CtlReset, 0, &ResetScope::All)
            .unwrap();
        parent_end
            .send(
                MsgType::CfgKeypair,
                0,
                &KeyPairMsg {
                    objid: 1,
                    key_pem: b"secret".to_vec(),
                },
            )
            .unwrap();
        let reset = worker_end.recv().unwrap().unwrap();
        ctx.dispatch(&mut worker_end, reset).unwrap();
        let keypair = worker_end.recv().unwrap().unwrap();
        assert!(matches!(
            ctx.dispatch(&mut worker_end, keypair),
            Err(IpcError::Protocol(_))
        ));
    }
}
