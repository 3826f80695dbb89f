//! Opaque packet-filter API. The kernel side is not modelled here; the
//! engine drives this trait and the platform provides an
//! implementation. The default logs what it would program, which is
//! also what runs on hosts without a usable packet filter.

use std::collections::HashMap;
use std::net::SocketAddr;

use anyhow::Result;
use tracing::debug;

use crate::config::RdrConf;

pub trait PacketFilter {
    /// Prepare the anchor this daemon owns.
    fn init(&mut self, anchor: &str) -> Result<()>;
    /// Replace the address set of a named table.
    fn sync_table(&mut self, table: &str, addrs: &[SocketAddr]) -> Result<()>;
    /// Install (or refresh) a redirect rule pointing at the given
    /// translation addresses.
    fn enable_redirect(&mut self, rdr: &RdrConf, addrs: &[SocketAddr]) -> Result<()>;
    fn disable_redirect(&mut self, name: &str) -> Result<()>;
    /// Drop live states targeting an address that went away.
    fn flush_states(&mut self, table: &str, addr: SocketAddr) -> Result<()>;
}

/// Logging stand-in used when no packet filter is available.
#[derive(Debug, Default)]
pub struct NullFilter;

impl PacketFilter for NullFilter {
    fn init(&mut self, anchor: &str) -> Result<()> {
        debug!(anchor, "pf init");
        Ok(())
    }

    fn sync_table(&mut self, table: &str, addrs: &[SocketAddr]) -> Result<()> {
        debug!(table, count = addrs.len(), "pf table sync");
        Ok(())
    }

    fn enable_redirect(&mut self, rdr: &RdrConf, addrs: &[SocketAddr]) -> Result<()> {
        debug!(rdr = %rdr.name, count = addrs.len(), "pf redirect enable");
        Ok(())
    }

    fn disable_redirect(&mut self, name: &str) -> Result<()> {
        debug!(rdr = %name, "pf redirect disable");
        Ok(())
    }

    fn flush_states(&mut self, table: &str, addr: SocketAddr) -> Result<()> {
        debug!(table, %addr, "pf state flush");
        Ok(())
    }
}

/// In-memory double mirroring what the kernel would hold.
#[derive(Debug, Default)]
pub struct MemoryFilter {
    pub anchor: Option<String>,
    pub tables: HashMap<String, Vec<SocketAddr>>,
    pub redirects: HashMap<String, Vec<SocketAddr>>,
    pub flushed: Vec<(String, SocketAddr)>,
}

impl PacketFilter for MemoryFilter {
    fn init(&mut self, anchor: &str) -> Result<()> {
        self.anchor = Some(anchor.to_string());
        Ok(())
    }

    fn sync_table(&mut self, table: &str, addrs: &[SocketAddr]) -> Result<()> {
        self.tables.insert(table.to_string(), addrs.to_vec());
        Ok(())
    }

    fn enable_redirect(&mut self, rdr: &RdrConf, addrs: &[SocketAddr]) -> Result<()> {
        self.redirects.insert(rdr.name.clone(), addrs.to_vec());
        Ok(())
    }

    fn disable_redirect(&mut self, name: &str) -> Result<()> {
        self.redirects.remove(name);
        Ok(())
    }

    fn flush_states(&mut self, table: &str, addr: SocketAddr) -> Result<()> {
        self.flushed.push((table.to_string(), addr));
        Ok(())
    }
}
