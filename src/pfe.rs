//! Packet-filter engine: translates redirect configuration and host
//! state transitions into packet-filter programming. State is fully
//! reconciled after every config swap, so a reload converges no matter
//! what the kernel held before.

use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    config::{GlobalConf, HostState, HostStatusMsg, Objid, Store},
    event::{self, Event, Poller},
    ipc::{Channel, MsgType},
    pf::PacketFilter,
    privsep::{self, CtlEvent, WorkerCtx, WorkerProc},
};

const ANCHOR: &str = "shunt";

pub struct Pfe<F: PacketFilter> {
    filter: F,
    states: HashMap<Objid, HostState>,
}

impl<F: PacketFilter> Pfe<F> {
    pub fn new(filter: F) -> Pfe<F> {
        Pfe {
            filter,
            states: HashMap::new(),
        }
    }

    pub fn init(&mut self) -> Result<()> {
        self.filter.init(ANCHOR)
    }

    fn up_addrs(&self, store: &Store, table_id: Objid) -> Vec<std::net::SocketAddr> {
        store
            .table(table_id)
            .map(|t| {
                t.hosts
                    .iter()
                    .filter(|h| {
                        matches!(
                            self.states.get(&h.id).copied().unwrap_or(HostState::Unknown),
                            HostState::Up
                        )
                    })
                    .map(|h| h.addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Desired-vs-actual reconciliation of every table and redirect.
    pub fn reconcile(&mut self, store: &Store) -> Result<()> {
        for table in &store.tables {
            let addrs = self.up_addrs(store, table.conf.id);
            self.filter.sync_table(&table.conf.name, &addrs)?;
        }
        for rdr in &store.rdrs {
            let addrs = self.up_addrs(store, rdr.table_id);
            if addrs.is_empty() {
                self.filter.disable_redirect(&rdr.name)?;
            } else {
                self.filter.enable_redirect(rdr, &addrs)?;
            }
        }
        // forget hosts that no longer exist
        self.states
            .retain(|id, _| store.tables.iter().any(|t| t.hosts.iter().any(|h| h.id == *id)));
        Ok(())
    }

    /// Apply one host transition and resync its table.
    pub fn host_status(&mut self, store: &Store, msg: &HostStatusMsg) -> Result<()> {
        let prev = self
            .states
            .insert(msg.host_id, msg.state)
            .unwrap_or(HostState::Unknown);
        debug!(host = msg.host_id, from = %prev, to = %msg.state, "host transition");

        let addrs = self.up_addrs(store, msg.table_id);
        if let Some(table) = store.table(msg.table_id) {
            self.filter.sync_table(&table.conf.name, &addrs)?;
            if prev == HostState::Up && msg.state != HostState::Up {
                if let Some(host) = table.hosts.iter().find(|h| h.id == msg.host_id) {
                    self.filter.flush_states(&table.conf.name, host.addr)?;
                }
            }
        }
        for rdr in store.rdrs.iter().filter(|r| r.table_id == msg.table_id) {
            if addrs.is_empty() {
                self.filter.disable_redirect(&rdr.name)?;
            } else {
                self.filter.enable_redirect(rdr, &addrs)?;
            }
        }
        Ok(())
    }
}

const TOK_PARENT: u64 = 0;
const TOK_SIGNAL: u64 = 1;
const TOK_HCE: u64 = 2;

pub fn run<F: PacketFilter>(worker: WorkerProc, opts: &GlobalConf, filter: F) -> Result<()> {
    privsep::drop_privileges(opts)?;
    privsep::ignore_sigpipe()?;

    let mut poller = Poller::new()?;
    let mut sfd = event::signal_fd(&[
        nix::sys::signal::Signal::SIGTERM,
        nix::sys::signal::Signal::SIGINT,
        nix::sys::signal::Signal::SIGHUP,
    ])?;
    let mut parent = worker.chan;
    poller.add(&parent, TOK_PARENT, true, false)?;
    poller.add(&sfd, TOK_SIGNAL, true, false)?;

    let mut ctx = WorkerCtx::new(worker.role, worker.instance);
    let mut pfe = Pfe::new(filter);
    pfe.init()?;
    let mut hce_chan: Option<Channel> = None;
    let mut events = Vec::new();

    info!("pfe ready");
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
                        parent.flush()?;
                    }
                    loop {
                        let msg = match parent.recv() {
                            Ok(Some(msg)) => msg,
                            Ok(None) => break,
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        };
                        match ctx.dispatch(&mut parent, msg) {
                            Ok(CtlEvent::Apply(_)) => pfe.reconcile(&ctx.store)?,
                            Ok(CtlEvent::Start) | Ok(CtlEvent::None) => {}
                            Ok(CtlEvent::Shutdown) => return Ok(()),
                            Ok(CtlEvent::Peer(fd, _)) => {
                                let chan = Channel::from_fd(fd);
                                chan.set_nonblocking(true)?;
                                poller.add(&chan, TOK_HCE, true, false)?;
                                hce_chan = Some(chan);
                            }
                            Ok(CtlEvent::Service(msg)) => match msg.hdr.typ {
                                MsgType::HostStatus => {
                                    let status: HostStatusMsg = msg
                                        .decode()
                                        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                                    pfe.host_status(&ctx.store, &status)?;
                                }
                                other => warn!(?other, "unhandled message in pfe"),
                            },
                            Err(e) => privsep::fatal_ipc(worker.role, &e),
                        }
                    }
                    poller.modify(&parent, TOK_PARENT, true, parent.has_pending())?;
                }
                Event::Io { token: TOK_HCE, .. } => {
                    if let Some(chan) = hce_chan.as_mut() {
                        loop {
                            let msg = match chan.recv() {
                                Ok(Some(msg)) => msg,
                                Ok(None) => break,
                                Err(e) => privsep::fatal_ipc(worker.role, &e),
                            };
                            match msg.hdr.typ {
                                MsgType::HostStatus => {
                                    let status: HostStatusMsg = msg
                                        .decode()
                                        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
                                    pfe.host_status(&ctx.store, &status)?;
                                }
                                other => warn!(?other, "unexpected message on hce channel"),
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        poller.modify(&parent, TOK_PARENT, true, parent.has_pending())?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse, ResetScope, Shadow};
    use crate::pf::MemoryFilter;

    const CFG: &str = r#"{
        "tables": [
            { "name": "webpool", "check": { "kind": "tcp" },
              "hosts": ["10.0.0.1:80", "10.0.0.2:80"] }
        ],
        "redirects": [
            { "name": "www", "listen": "0.0.0.0:80", "table": "webpool" }
        ]
    }"#;

    fn store() -> Store {
        let cfg = parse(CFG).unwrap();
        let mut store = Store::default();
        let mut shadow = Shadow::new(ResetScope::All);
        for t in &cfg.tables {
            shadow.add_table(t.conf.clone());
            for h in &t.hosts {
                shadow.add_host(h.clone()).unwrap();
            }
        }
        shadow.rdrs = cfg.rdrs.clone();
        store.apply(shadow);
        store
    }

    #[test]
    fn reconcile_programs_only_up_hosts() {
        let store = store();
        let mut pfe = Pfe::new(MemoryFilter::default());
        pfe.init().unwrap();
        pfe.reconcile(&store).unwrap();
        assert!(pfe.filter.tables["webpool"].is_empty());
        assert!(pfe.filter.redirects.is_empty());

        let host = &store.tables[0].hosts[0];
        pfe.host_status(
            &store,
            &HostStatusMsg {
                host_id: host.id,
                table_id: host.table_id,
                state: HostState::Up,
            },
        )
        .unwrap();
        assert_eq!(pfe.filter.tables["webpool"], vec![host.addr]);
        assert_eq!(pfe.filter.redirects["www"], vec![host.addr]);
    }

    #[test]
    fn down_transition_flushes_states_and_redirect() {
        let store = store();
        let mut pfe = Pfe::new(MemoryFilter::default());
        pfe.init().unwrap();
        let host = &store.tables[0].hosts[0];
        for state in [HostState::Up, HostState::Down] {
            pfe.host_status(
                &store,
                &HostStatusMsg {
                    host_id: host.id,
                    table_id: host.table_id,
                    state,
                },
            )
            .unwrap();
        }
        assert!(pfe.filter.tables["webpool"].is_empty());
        assert!(pfe.filter.redirects.is_empty());
        assert_eq!(pfe.filter.flushed, vec![("webpool".to_string(), host.addr)]);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let store = store();
        let mut pfe = Pfe::new(MemoryFilter::default());
        pfe.init().unwrap();
        let host = &store.tables[0].hosts[1];
        pfe.host_status(
            &store,
            &HostStatusMsg {
                host_id: host.id,
                table_id: host.table_id,
                state: HostState::Up,
            },
        )
        .unwrap();
        pfe.reconcile(&store).unwrap();
        let first = pfe.filter.tables.clone();
        pfe.reconcile(&store).unwrap();
        assert_eq!(pfe.filter.tables, first);
        assert_eq!(pfe.filter.redirects["www"], vec![host.addr]);
    }
}
