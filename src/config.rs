//! Configuration model: the serde file format, the resolved runtime
//! entities distributed to workers over IPC, and the shadow-store
//! machinery workers use to swap configs atomically at reload.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Objid = u32;

pub const DEFAULT_PREFORK: u32 = 3;
pub const DEFAULT_USER: &str = "_shunt";
pub const DEFAULT_CONTROL_SOCKET: &str = "/var/run/shunt.sock";
pub const DEFAULT_CHECK_INTERVAL: u32 = 10;
pub const DEFAULT_CHECK_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_SESSION_TIMEOUT: u64 = 600;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Semantic(String),
}

fn invalid(msg: impl fmt::Display) -> ConfigError {
    ConfigError::Semantic(msg.to_string())
}

// --- file format ---------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    prefork: Option<u32>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    chroot: Option<PathBuf>,
    #[serde(default)]
    control_socket: Option<PathBuf>,
    #[serde(default)]
    interval: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    disable_privdrop: bool,
    #[serde(default)]
    tables: Vec<FileTable>,
    #[serde(default)]
    protocols: Vec<FileProto>,
    #[serde(default)]
    relays: Vec<FileRelay>,
    #[serde(default)]
    redirects: Vec<FileRdr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTable {
    name: String,
    check: CheckConf,
    #[serde(default)]
    interval: Option<u32>,
    #[serde(default = "default_retry")]
    retry: u32,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    disabled: bool,
    hosts: Vec<FileHost>,
}

fn default_retry() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FileHost {
    Bare(String),
    Full { address: String, #[serde(default = "default_weight")] weight: u16 },
}

fn default_weight() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProto {
    name: String,
    #[serde(default)]
    kind: ProtoKind,
    #[serde(default)]
    tcp_nodelay: bool,
    #[serde(default)]
    rcvbuf: Option<usize>,
    #[serde(default)]
    sndbuf: Option<usize>,
    #[serde(default)]
    rules: Vec<FileRule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRule {
    direction: Direction,
    action: RuleAction,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    tagged: Option<String>,
    #[serde(default)]
    table: Option<String>,
    /// Operand of append/set/remove/hash/log actions; match patterns
    /// below constrain when the rule applies.
    #[serde(default)]
    target: Option<FileTarget2>,
    #[serde(default)]
    cookie: Option<FileKv>,
    #[serde(default)]
    header: Option<FileKv>,
    #[serde(default)]
    query: Option<FileKv>,
    #[serde(default)]
    path: Option<FileKv>,
    #[serde(default)]
    url: Option<FileKv>,
    #[serde(default)]
    method: Option<FileKv>,
    #[serde(default)]
    state: Option<FileKv>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileKv {
    key: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTarget2 {
    #[serde(default = "default_target_type", rename = "type")]
    ktype: KeyType,
    key: String,
    #[serde(default)]
    value: Option<String>,
}

fn default_target_type() -> KeyType {
    KeyType::Header
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    name: String,
    listen: SocketAddr,
    #[serde(default)]
    ssl: bool,
    #[serde(default)]
    ssl_client: bool,
    #[serde(default)]
    ssl_inspect: bool,
    #[serde(default)]
    udp: bool,
    #[serde(default)]
    needpf: bool,
    #[serde(default)]
    protocol: Option<String>,
    forward: Vec<FileTarget>,
    #[serde(default)]
    session_timeout: Option<u64>,
    #[serde(default)]
    connect_timeout_ms: Option<u64>,
    #[serde(default)]
    cert_file: Option<PathBuf>,
    #[serde(default)]
    key_file: Option<PathBuf>,
    #[serde(default)]
    ca_cert_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTarget {
    table: String,
    #[serde(default)]
    mode: ForwardMode,
    #[serde(default)]
    check_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRdr {
    name: String,
    listen: SocketAddr,
    #[serde(default = "default_rdr_proto")]
    proto: String,
    table: String,
    #[serde(default)]
    sticky: bool,
}

fn default_rdr_proto() -> String {
    "tcp".to_string()
}

// --- runtime entities (also the IPC payloads) ----------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Icmp,
    Tcp,
    Http,
    SendExpect,
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgo {
    Md5,
    Sha1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConf {
    pub kind: CheckKind,
    /// HTTP request path, or the script path for script checks.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expect_status: Option<u16>,
    #[serde(default)]
    pub digest: Option<(DigestAlgo, String)>,
    #[serde(default)]
    pub send: Option<String>,
    #[serde(default)]
    pub expect: Option<String>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConf {
    pub id: Objid,
    pub name: String,
    pub check: CheckConf,
    pub interval: u32,
    pub retry: u32,
    pub timeout_ms: u64,
    pub disabled: bool,
}

impl TableConf {
    /// Structural identity across reloads: a table keeps its id when
    /// name, check method, and payloads are unchanged. Interval, retry,
    /// and the disabled flag are deliberately ignored.
    pub fn structurally_eq(&self, other: &TableConf) -> bool {
        self.name == other.name && self.check == other.check
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConf {
    pub id: Objid,
    pub table_id: Objid,
    pub name: String,
    pub addr: SocketAddr,
    pub weight: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Unknown,
    Up,
    Down,
    Disabled,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostState::Unknown => "unknown",
            HostState::Up => "up",
            HostState::Down => "down",
            HostState::Disabled => "disabled",
        })
    }
}

/// Host state transition, published by HCE to parent and PFE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatusMsg {
    pub host_id: Objid,
    pub table_id: Objid,
    pub state: HostState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub conf: TableConf,
    pub hosts: Vec<HostConf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtoKind {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtoConf {
    pub id: Objid,
    pub name: String,
    pub kind: ProtoKind,
    pub tcp_nodelay: bool,
    pub rcvbuf: Option<usize>,
    pub sndbuf: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Match,
    Pass,
    Block,
    Append,
    Set,
    Remove,
    Hash,
    Log,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Cookie,
    Header,
    Query,
    Path,
    Url,
    Method,
    State,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleKv {
    pub ktype: KeyType,
    pub key: String,
    pub value: Option<String>,
    pub globbing: bool,
    pub has_macro: bool,
}

/// Operand of a kv-mutating action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleTarget {
    pub ktype: KeyType,
    pub key: String,
    pub value: Option<String>,
    pub has_macro: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConf {
    pub id: Objid,
    pub proto_id: Objid,
    pub dir: Direction,
    pub action: RuleAction,
    pub label: Option<String>,
    pub tag: Option<String>,
    pub tagged: Option<String>,
    pub table_id: Option<Objid>,
    pub kvs: Vec<RuleKv>,
    pub target: Option<RuleTarget>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForwardMode {
    #[default]
    Roundrobin,
    SourceHash,
    Loadbalance,
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConf {
    pub table_id: Objid,
    pub mode: ForwardMode,
    pub check_port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFlags {
    pub ssl: bool,
    pub ssl_client: bool,
    pub ssl_inspect: bool,
    pub udp: bool,
    pub needpf: bool,
}

/// Public key algorithm of a relay keypair, derived by the parent when
/// it loads the key and needed by relays to offer signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgo {
    Rsa,
    Ecdsa,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConf {
    pub id: Objid,
    pub name: String,
    pub listen: SocketAddr,
    pub flags: RelayFlags,
    pub proto_id: Option<Objid>,
    pub targets: Vec<TargetConf>,
    pub session_timeout: u64,
    pub connect_timeout_ms: u64,
    pub key_algo: Option<KeyAlgo>,
    /// PEM blobs filled by the parent before distribution. The private
    /// key never appears here; it travels in a CfgKeypair frame to the
    /// CA processes only.
    pub cert_pem: Option<Vec<u8>>,
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Parent-side file locations, meaningless in workers.
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdrConf {
    pub id: Objid,
    pub name: String,
    pub listen: SocketAddr,
    pub proto: String,
    pub table_id: Objid,
    pub sticky: bool,
}

/// Private key material for one relay, parent to CA only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairMsg {
    pub objid: Objid,
    pub key_pem: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConf {
    pub prefork: u32,
    pub user: String,
    pub chroot: Option<PathBuf>,
    pub control_socket: PathBuf,
    pub interval: u32,
    pub timeout_ms: u64,
    pub disable_privdrop: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetScope {
    All,
    Relays,
    Hosts,
    Tables,
    Rules,
}

impl ResetScope {
    pub fn covers_tables(self) -> bool {
        matches!(self, ResetScope::All | ResetScope::Tables | ResetScope::Relays)
    }
    pub fn covers_hosts(self) -> bool {
        self.covers_tables() || self == ResetScope::Hosts
    }
    pub fn covers_rules(self) -> bool {
        matches!(self, ResetScope::All | ResetScope::Rules | ResetScope::Relays)
    }
    pub fn covers_relays(self) -> bool {
        matches!(self, ResetScope::All | ResetScope::Relays)
    }
}

// --- the assembled configuration -----------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub opts: GlobalConf,
    pub tables: Vec<Table>,
    pub protos: Vec<ProtoConf>,
    pub rules: Vec<RuleConf>,
    pub relays: Vec<RelayConf>,
    pub rdrs: Vec<RdrConf>,
}

impl Config {
    pub fn table(&self, id: Objid) -> Option<&Table> {
        self.tables.iter().find(|t| t.conf.id == id)
    }

    /// Carry table ids over from the previous configuration wherever the
    /// new table is structurally identical, rewriting every reference.
    pub fn inherit_table_ids(&mut self, old: &Config) {
        let mut remap: BTreeMap<Objid, Objid> = BTreeMap::new();
        for table in &mut self.tables {
            if let Some(prev) = old
                .tables
                .iter()
                .find(|o| o.conf.structurally_eq(&table.conf))
            {
                remap.insert(table.conf.id, prev.conf.id);
                table.conf.id = prev.conf.id;
                for host in &mut table.hosts {
                    host.table_id = prev.conf.id;
                }
            }
        }
        for relay in &mut self.relays {
            for target in &mut relay.targets {
                if let Some(&id) = remap.get(&target.table_id) {
                    target.table_id = id;
                }
            }
        }
        for rdr in &mut self.rdrs {
            if let Some(&id) = remap.get(&rdr.table_id) {
                rdr.table_id = id;
            }
        }
        for rule in &mut self.rules {
            if let Some(table_id) = rule.table_id {
                if let Some(&id) = remap.get(&table_id) {
                    rule.table_id = Some(id);
                }
            }
        }
    }
}

/// Apply `-D name=value` macros to the raw config text. `$name`
/// occurrences are replaced, longest names first.
pub fn substitute_macros(text: &str, macros: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = macros.iter().collect();
    sorted.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));
    let mut out = text.to_string();
    for (name, value) in sorted {
        out = out.replace(&format!("${name}"), value);
    }
    out
}

pub fn parse_macro(arg: &str) -> Result<(String, String), ConfigError> {
    match arg.split_once('=') {
        Some((name, value)) if !name.is_empty() => {
            Ok((name.to_string(), value.to_string()))
        }
        _ => Err(invalid(format!("bad macro definition {arg:?}"))),
    }
}

pub fn load(path: &Path, macros: &[(String, String)]) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    parse(&substitute_macros(&text, macros))
}

pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let file: FileConfig = serde_json::from_str(text)?;
    let mut ids = 1..;
    let mut next = move || -> Objid { ids.next().unwrap() };

    let opts = GlobalConf {
        prefork: file.prefork.unwrap_or(DEFAULT_PREFORK).clamp(1, 32),
        user: file.user.unwrap_or_else(|| DEFAULT_USER.to_string()),
        chroot: file.chroot,
        control_socket: file
            .control_socket
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET)),
        interval: file.interval.unwrap_or(DEFAULT_CHECK_INTERVAL).max(1),
        timeout_ms: file.timeout_ms.unwrap_or(DEFAULT_CHECK_TIMEOUT_MS).max(10),
        disable_privdrop: file.disable_privdrop,
    };

    let mut tables = Vec::new();
    for ft in file.tables {
        if tables
            .iter()
            .any(|t: &Table| t.conf.name == ft.name)
        {
            return Err(invalid(format!("duplicate table {:?}", ft.name)));
        }
        validate_check(&ft.name, &ft.check)?;
        let table_id = next();
        let mut hosts = Vec::new();
        for fh in ft.hosts {
            let (address, weight) = match fh {
                FileHost::Bare(address) => (address, 1),
                FileHost::Full { address, weight } => (address, weight),
            };
            let addr: SocketAddr = address
                .parse()
                .map_err(|_| invalid(format!("bad host address {address:?}")))?;
            hosts.push(HostConf {
                id: next(),
                table_id,
                name: address,
                addr,
                weight: weight.max(1),
            });
        }
        if hosts.is_empty() {
            return Err(invalid(format!("table {:?} has no hosts", ft.name)));
        }
        tables.push(Table {
            conf: TableConf {
                id: table_id,
                name: ft.name,
                check: ft.check,
                interval: ft.interval.unwrap_or(opts.interval).max(1),
                retry: ft.retry.max(1),
                timeout_ms: ft.timeout_ms.unwrap_or(opts.timeout_ms).max(10),
                disabled: ft.disabled,
            },
            hosts,
        });
    }

    let table_id = |tables: &[Table], name: &str| -> Result<Objid, ConfigError> {
        tables
            .iter()
            .find(|t| t.conf.name == name)
            .map(|t| t.conf.id)
            .ok_or_else(|| invalid(format!("unknown table {name:?}")))
    };

    let mut protos = Vec::new();
    let mut rules = Vec::new();
    for fp in file.protocols {
        if protos.iter().any(|p: &ProtoConf| p.name == fp.name) {
            return Err(invalid(format!("duplicate protocol {:?}", fp.name)));
        }
        let proto_id = next();
        for fr in fp.rules {
            let mut kvs = Vec::new();
            let mut push = |ktype: KeyType, fkv: Option<FileKv>| {
                if let Some(fkv) = fkv {
                    kvs.push(RuleKv {
                        globbing: crate::kv::has_glob(&fkv.key),
                        has_macro: fkv.value.as_deref().map_or(false, |v| v.contains('$')),
                        ktype,
                        key: fkv.key,
                        value: fkv.value,
                    });
                }
            };
            push(KeyType::Cookie, fr.cookie);
            push(KeyType::Header, fr.header);
            push(KeyType::Query, fr.query);
            push(KeyType::Path, fr.path);
            push(KeyType::Url, fr.url);
            push(KeyType::Method, fr.method);
            push(KeyType::State, fr.state);
            let target = fr.target.map(|t| RuleTarget {
                has_macro: t.value.as_deref().map_or(false, |v| v.contains('$')),
                ktype: t.ktype,
                key: t.key,
                value: t.value,
            });
            if matches!(
                fr.action,
                RuleAction::Append | RuleAction::Set | RuleAction::Remove
            ) && target.is_none()
            {
                return Err(invalid(format!(
                    "protocol {:?}: {:?} rule needs a target",
                    fp.name, fr.action
                )));
            }
            if matches!(fr.action, RuleAction::Hash | RuleAction::Log)
                && target.is_none()
                && kvs.is_empty()
            {
                return Err(invalid(format!(
                    "protocol {:?}: {:?} rule needs a target or key pattern",
                    fp.name, fr.action
                )));
            }
            let rule_table = match &fr.table {
                Some(name) => Some(table_id(&tables, name)?),
                None => None,
            };
            rules.push(RuleConf {
                id: next(),
                proto_id,
                dir: fr.direction,
                action: fr.action,
                label: fr.label,
                tag: fr.tag,
                tagged: fr.tagged,
                table_id: rule_table,
                kvs,
                target,
            });
        }
        protos.push(ProtoConf {
            id: proto_id,
            name: fp.name,
            kind: fp.kind,
            tcp_nodelay: fp.tcp_nodelay,
            rcvbuf: fp.rcvbuf,
            sndbuf: fp.sndbuf,
        });
    }

    let mut relays = Vec::new();
    for fr in file.relays {
        if relays.iter().any(|r: &RelayConf| r.name == fr.name) {
            return Err(invalid(format!("duplicate relay {:?}", fr.name)));
        }
        let proto_id = match &fr.protocol {
            Some(name) => Some(
                protos
                    .iter()
                    .find(|p| &p.name == name)
                    .map(|p| p.id)
                    .ok_or_else(|| invalid(format!("unknown protocol {name:?}")))?,
            ),
            None => None,
        };
        let mut targets = Vec::new();
        for ft in fr.forward {
            targets.push(TargetConf {
                table_id: table_id(&tables, &ft.table)?,
                mode: ft.mode,
                check_port: ft.check_port,
            });
        }
        if targets.is_empty() {
            return Err(invalid(format!("relay {:?} has no forward target", fr.name)));
        }
        if (fr.ssl || fr.ssl_inspect) && (fr.cert_file.is_none() || fr.key_file.is_none()) {
            return Err(invalid(format!(
                "relay {:?}: ssl requires cert_file and key_file",
                fr.name
            )));
        }
        if fr.udp && fr.ssl {
            return Err(invalid(format!("relay {:?}: udp excludes ssl", fr.name)));
        }
        relays.push(RelayConf {
            id: next(),
            name: fr.name,
            listen: fr.listen,
            flags: RelayFlags {
                ssl: fr.ssl,
                ssl_client: fr.ssl_client,
                ssl_inspect: fr.ssl_inspect,
                udp: fr.udp,
                needpf: fr.needpf,
            },
            proto_id,
            targets,
            session_timeout: fr.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT).max(1),
            connect_timeout_ms: fr
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS)
                .max(10),
            key_algo: None,
            cert_pem: None,
            ca_cert_pem: None,
            cert_file: fr.cert_file,
            key_file: fr.key_file,
            ca_cert_file: fr.ca_cert_file,
        });
    }

    let mut rdrs = Vec::new();
    for fr in file.redirects {
        if rdrs.iter().any(|r: &RdrConf| r.name == fr.name) {
            return Err(invalid(format!("duplicate redirect {:?}", fr.name)));
        }
        if fr.proto != "tcp" && fr.proto != "udp" {
            return Err(invalid(format!(
                "redirect {:?}: unknown proto {:?}",
                fr.name, fr.proto
            )));
        }
        rdrs.push(RdrConf {
            id: next(),
            name: fr.name,
            listen: fr.listen,
            proto: fr.proto,
            table_id: table_id(&tables, &fr.table)?,
            sticky: fr.sticky,
        });
    }

    if relays.is_empty() && rdrs.is_empty() {
        return Err(invalid("no relays and no redirects configured"));
    }

    Ok(Config {
        opts,
        tables,
        protos,
        rules,
        relays,
        rdrs,
    })
}

fn validate_check(table: &str, check: &CheckConf) -> Result<(), ConfigError> {
    match check.kind {
        CheckKind::Http => {
            if check.path.is_none() {
                return Err(invalid(format!("table {table:?}: http check needs a path")));
            }
            if let Some((_, hex)) = &check.digest {
                if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid(format!("table {table:?}: bad check digest")));
                }
            }
        }
        CheckKind::SendExpect => {
            if check.expect.is_none() {
                return Err(invalid(format!(
                    "table {table:?}: send-expect check needs an expect pattern"
                )));
            }
        }
        CheckKind::Script => {
            if check.path.is_none() {
                return Err(invalid(format!(
                    "table {table:?}: script check needs a path"
                )));
            }
        }
        CheckKind::Icmp | CheckKind::Tcp => {}
    }
    Ok(())
}

// --- worker-side shadow assembly -----------------------------------------

/// The categories a worker keeps live, replaced atomically at CfgDone.
#[derive(Debug, Default)]
pub struct Store {
    pub tables: Vec<Table>,
    pub protos: Vec<ProtoConf>,
    pub rules: Vec<RuleConf>,
    pub relays: Vec<RelayConf>,
    pub rdrs: Vec<RdrConf>,
}

/// Shadow area collecting CFG_* frames until the CfgDone barrier.
#[derive(Debug)]
pub struct Shadow {
    pub scope: ResetScope,
    pub tables: Vec<Table>,
    pub protos: Vec<ProtoConf>,
    pub rules: Vec<RuleConf>,
    pub relays: Vec<RelayConf>,
    pub rdrs: Vec<RdrConf>,
}

impl Shadow {
    pub fn new(scope: ResetScope) -> Shadow {
        Shadow {
            scope,
            tables: Vec::new(),
            protos: Vec::new(),
            rules: Vec::new(),
            relays: Vec::new(),
            rdrs: Vec::new(),
        }
    }

    pub fn add_table(&mut self, conf: TableConf) {
        self.tables.push(Table {
            conf,
            hosts: Vec::new(),
        });
    }

    pub fn add_host(&mut self, host: HostConf) -> Result<(), ConfigError> {
        if let Some(table) = self.tables.iter_mut().find(|t| t.conf.id == host.table_id) {
            table.hosts.push(host);
            return Ok(());
        }
        // A hosts-only reset re-sends hosts without their tables; carry
        // them grouped under placeholder tables until the swap merges
        // them into the live ones.
        if self.scope == ResetScope::Hosts {
            self.tables.push(Table {
                conf: TableConf {
                    id: host.table_id,
                    name: String::new(),
                    check: CheckConf {
                        kind: CheckKind::Tcp,
                        path: None,
                        expect_status: None,
                        digest: None,
                        send: None,
                        expect: None,
                        tls: false,
                        port: None,
                    },
                    interval: DEFAULT_CHECK_INTERVAL,
                    retry: 1,
                    timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
                    disabled: false,
                },
                hosts: vec![host],
            });
            return Ok(());
        }
        Err(invalid(format!(
            "host {} references unknown table",
            host.id
        )))
    }
}

impl Store {
    /// Swap in the categories the reset scope covers; untouched
    /// categories keep their current contents.
    pub fn apply(&mut self, shadow: Shadow) {
        let scope = shadow.scope;
        if scope.covers_tables() {
            self.tables = shadow.tables;
        } else if scope == ResetScope::Hosts {
            // Hosts arrive bare; merge them into the existing tables.
            for st in shadow.tables {
                if let Some(t) = self
                    .tables
                    .iter_mut()
                    .find(|t| t.conf.id == st.conf.id)
                {
                    t.hosts = st.hosts;
                }
            }
        }
        if scope.covers_rules() {
            self.protos = shadow.protos;
            self.rules = shadow.rules;
        }
        if scope.covers_relays() {
            self.relays = shadow.relays;
        }
        if scope == ResetScope::All {
            self.rdrs = shadow.rdrs;
        }
    }

    pub fn table(&self, id: Objid) -> Option<&Table> {
        self.tables.iter().find(|t| t.conf.id == id)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "prefork": 2,
        "user": "_shunt",
        "tables": [
            {
                "name": "webpool",
                "check": { "kind": "http", "path": "/", "expect_status": 200 },
                "interval": 10,
                "retry": 3,
                "hosts": ["10.0.0.1:8080", {"address": "10.0.0.2:8080", "weight": 2}]
            },
            {
                "name": "fallback",
                "check": { "kind": "tcp" },
                "hosts": ["10.0.1.1:8080"]
            }
        ],
        "protocols": [
            {
                "name": "web",
                "kind": "http",
                "tcp_nodelay": true,
                "rules": [
                    {
                        "direction": "request",
                        "action": "set",
                        "target": { "key": "X-Forwarded-By", "value": "$SERVER_ADDR" }
                    },
                    {
                        "direction": "request",
                        "action": "pass",
                        "header": { "key": "Host", "value": "*.example.com" }
                    }
                ]
            }
        ],
        "relays": [
            {
                "name": "www",
                "listen": "127.0.0.1:8080",
                "protocol": "web",
                "forward": [ { "table": "webpool", "mode": "roundrobin" },
                             { "table": "fallback" } ]
            }
        ],
        "redirects": [
            { "name": "dns", "listen": "127.0.0.1:53", "proto": "udp", "table": "fallback" }
        ]
    }"#;

    #[test]
    fn parses_sample() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.opts.prefork, 2);
        assert_eq!(cfg.tables.len(), 2);
        assert_eq!(cfg.tables[0].hosts.len(), 2);
        assert_eq!(cfg.tables[0].hosts[1].weight, 2);
        assert_eq!(cfg.relays[0].targets.len(), 2);
        assert_eq!(cfg.rdrs[0].proto, "udp");

        let rules: Vec<_> = cfg.rules.iter().collect();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].target.as_ref().unwrap().has_macro);
        assert!(rules[0].kvs.is_empty());
        assert!(rules[1].kvs[0].globbing);
        assert!(!rules[1].kvs[0].has_macro);
    }

    #[test]
    fn set_rule_without_target_is_rejected() {
        let text = SAMPLE.replace(
            "\"target\": { \"key\": \"X-Forwarded-By\", \"value\": \"$SERVER_ADDR\" }",
            "\"header\": { \"key\": \"X-Forwarded-By\" }",
        );
        assert!(matches!(parse(&text), Err(ConfigError::Semantic(_))));
    }

    #[test]
    fn macros_substitute_longest_first() {
        let macros = vec![
            ("addr".to_string(), "LOST".to_string()),
            ("addr4".to_string(), "127.0.0.1".to_string()),
        ];
        let out = substitute_macros("\"$addr4:80\"", &macros);
        assert_eq!(out, "\"127.0.0.1:80\"");
    }

    #[test]
    fn rejects_unknown_table_reference() {
        let text = SAMPLE.replace("\"table\": \"webpool\"", "\"table\": \"nope\"");
        assert!(matches!(parse(&text), Err(ConfigError::Semantic(_))));
    }

    #[test]
    fn rejects_ssl_without_keypair() {
        let text = SAMPLE.replace("\"protocol\": \"web\",", "\"protocol\": \"web\", \"ssl\": true,");
        assert!(matches!(parse(&text), Err(ConfigError::Semantic(_))));
    }

    #[test]
    fn findbyconf_preserves_ids_for_equal_tables() {
        let old = parse(SAMPLE).unwrap();
        // Same structure, different interval/retry: identity must hold.
        let text = SAMPLE
            .replace("\"interval\": 10", "\"interval\": 30")
            .replace("\"retry\": 3", "\"retry\": 5");
        let mut new = parse(&text).unwrap();
        new.inherit_table_ids(&old);
        assert_eq!(new.tables[0].conf.id, old.tables[0].conf.id);
        assert_eq!(new.tables[1].conf.id, old.tables[1].conf.id);
        assert_eq!(
            new.relays[0].targets[0].table_id,
            old.relays[0].targets[0].table_id
        );
        assert_eq!(new.rdrs[0].table_id, old.rdrs[0].table_id);
    }

    #[test]
    fn findbyconf_breaks_identity_on_check_change() {
        let old = parse(SAMPLE).unwrap();
        let text = SAMPLE.replace("\"path\": \"/\"", "\"path\": \"/health\"");
        let mut new = parse(&text).unwrap();
        new.inherit_table_ids(&old);
        assert_ne!(new.tables[0].conf.id, old.tables[0].conf.id);
        // The unchanged table still keeps its id.
        assert_eq!(new.tables[1].conf.id, old.tables[1].conf.id);
    }

    #[test]
    fn shadow_swap_respects_scope() {
        let cfg = parse(SAMPLE).unwrap();
        let mut store = Store::default();
        let mut shadow = Shadow::new(ResetScope::All);
        for t in &cfg.tables {
            shadow.add_table(t.conf.clone());
            for h in &t.hosts {
                shadow.add_host(h.clone()).unwrap();
            }
        }
        shadow.protos = cfg.protos.clone();
        shadow.rules = cfg.rules.clone();
        shadow.relays = cfg.relays.clone();
        shadow.rdrs = cfg.rdrs.clone();
        store.apply(shadow);
        assert_eq!(store.tables.len(), 2);
        assert_eq!(store.relays.len(), 1);

        // A rules-only reset must leave tables and relays untouched.
        let mut shadow = Shadow::new(ResetScope::Rules);
        shadow.protos = cfg.protos.clone();
        store.apply(shadow);
        assert_eq!(store.tables.len(), 2);
        assert_eq!(store.relays.len(), 1);
        assert!(store.rules.is_empty());
    }
}
