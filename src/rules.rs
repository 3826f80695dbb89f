//! Protocol rule engine. Rules are compiled once per config install
//! (globs built, label/tag names interned with a reference each) and
//! shared by sessions through `Rc`; a session keeps its rule set alive
//! across reloads until it ends, which is what makes reloads atomic
//! from the session's point of view.

use std::{cell::RefCell, collections::HashMap, collections::HashSet, net::SocketAddr, rc::Rc};

use anyhow::Result;
use globset::GlobMatcher;
use tracing::debug;

use crate::{
    config::{Direction, KeyType, Objid, ProtoConf, RuleAction, RuleConf, RuleTarget},
    http::HttpDesc,
    kv::{compile_glob, has_glob, NameTable},
};

/// Session facts available to macro expansion.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub id: u64,
    pub client: SocketAddr,
    pub listen: SocketAddr,
    pub relay_name: String,
    pub timeout: u64,
}

struct CompiledKv {
    ktype: KeyType,
    key: String,
    value: Option<String>,
    key_glob: Option<GlobMatcher>,
    value_glob: Option<GlobMatcher>,
}

pub struct CompiledRule {
    pub conf: RuleConf,
    kvs: Vec<CompiledKv>,
    pub label_id: Option<u32>,
    pub tag_id: Option<u32>,
    pub tagged_id: Option<u32>,
}

/// A protocol's compiled rule list. Holds one reference on every
/// interned label/tag for as long as any session uses it.
pub struct ProtoRuntime {
    pub proto: ProtoConf,
    pub rules: Vec<CompiledRule>,
    names: Rc<RefCell<NameTable>>,
}

impl ProtoRuntime {
    pub fn compile(
        proto: ProtoConf,
        rules: &[RuleConf],
        names: Rc<RefCell<NameTable>>,
    ) -> Result<Rc<ProtoRuntime>> {
        let mut compiled = Vec::new();
        for conf in rules.iter().filter(|r| r.proto_id == proto.id) {
            let mut kvs = Vec::new();
            for kv in &conf.kvs {
                let key_glob = if kv.globbing {
                    Some(compile_glob(&kv.key)?)
                } else {
                    None
                };
                let value_glob = match kv.value.as_deref().filter(|v| has_glob(v)) {
                    Some(pattern) => Some(
                        globset::GlobBuilder::new(pattern)
                            .literal_separator(false)
                            .build()?
                            .compile_matcher(),
                    ),
                    None => None,
                };
                kvs.push(CompiledKv {
                    ktype: kv.ktype,
                    key: kv.key.clone(),
                    value: kv.value.clone(),
                    key_glob,
                    value_glob,
                });
            }
            // rule_inherit: one reference per named label/tag
            let mut intern = |name: &Option<String>| {
                name.as_deref().map(|n| names.borrow_mut().ref_name(n))
            };
            let label_id = intern(&conf.label);
            let tag_id = intern(&conf.tag);
            let tagged_id = intern(&conf.tagged);
            compiled.push(CompiledRule {
                conf: conf.clone(),
                kvs,
                label_id,
                tag_id,
                tagged_id,
            });
        }
        Ok(Rc::new(ProtoRuntime {
            proto,
            rules: compiled,
            names,
        }))
    }

    pub fn label_name(&self, id: u32) -> Option<String> {
        self.names.borrow().name(id).map(str::to_string)
    }
}

impl Drop for ProtoRuntime {
    // rule_free: release the references taken at compile time
    fn drop(&mut self) {
        let mut names = self.names.borrow_mut();
        for rule in &self.rules {
            for id in [rule.label_id, rule.tag_id, rule.tagged_id].into_iter().flatten() {
                names.unref(id);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub block: bool,
    pub pass: bool,
    pub table: Option<Objid>,
    pub label: Option<u32>,
    pub log: Vec<String>,
    pub hash_input: Vec<u8>,
    pub tags_added: Vec<u32>,
}

/// Evaluate the rule list in order against one parsed message head.
/// First terminating action (pass or block) wins; everything before it
/// applies its side effects.
pub fn eval(
    rt: &ProtoRuntime,
    dir: Direction,
    desc: &mut HttpDesc,
    meta: &SessionMeta,
    tags: &mut HashSet<u32>,
) -> Outcome {
    let mut outcome = Outcome::default();
    for rule in rt.rules.iter().filter(|r| r.conf.dir == dir) {
        if let Some(tagged) = rule.tagged_id {
            if !tags.contains(&tagged) {
                continue;
            }
        }

        let mut matched: HashMap<KeyType, String> = HashMap::new();
        let mut ok = true;
        for kv in &rule.kvs {
            match match_kv(kv, desc, dir) {
                Some(value) => {
                    matched.insert(kv.ktype, value);
                }
                None => {
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }

        apply(rule, desc, meta, &matched, tags, &mut outcome);
        match rule.conf.action {
            RuleAction::Pass => {
                outcome.pass = true;
                break;
            }
            RuleAction::Block => {
                outcome.block = true;
                break;
            }
            _ => {}
        }
    }
    outcome
}

/// Match one key pattern; returns the matched value (empty string for
/// valueless keys) or None when the pattern does not apply.
fn match_kv(kv: &CompiledKv, desc: &HttpDesc, dir: Direction) -> Option<String> {
    let candidate: Option<String> = match kv.ktype {
        KeyType::Header | KeyType::Cookie | KeyType::Query => {
            let tree = match kv.ktype {
                KeyType::Header => &desc.headers,
                KeyType::Cookie => &desc.cookies,
                _ => &desc.query_kv,
            };
            let entry = match &kv.key_glob {
                Some(matcher) => tree.find_glob(matcher),
                None => tree.find(&kv.key),
            };
            match entry {
                Some((_, found)) => Some(found.value.clone().unwrap_or_default()),
                None => None,
            }
        }
        KeyType::Method => key_matches(kv, &desc.method).then(|| desc.method.clone()),
        KeyType::Path => key_matches(kv, &desc.path).then(|| desc.path.clone()),
        KeyType::Url => key_matches(kv, &desc.url).then(|| desc.url.clone()),
        KeyType::State => {
            let state = match dir {
                Direction::Request => "request",
                Direction::Response => "response",
            };
            key_matches(kv, state).then(|| state.to_string())
        }
    };
    let candidate = candidate?;

    // value constraint: for path patterns it applies to the query
    // string, everywhere else to the matched value
    if kv.value.is_some() {
        let subject = match kv.ktype {
            KeyType::Path => desc.query.clone().unwrap_or_default(),
            _ => candidate.clone(),
        };
        if !value_matches(kv, &subject) {
            return None;
        }
    }
    Some(candidate)
}

fn key_matches(kv: &CompiledKv, subject: &str) -> bool {
    match &kv.key_glob {
        Some(matcher) => matcher.is_match(subject),
        None => kv.key == subject,
    }
}

fn value_matches(kv: &CompiledKv, subject: &str) -> bool {
    match (&kv.value_glob, kv.value.as_deref()) {
        (Some(matcher), _) => matcher.is_match(subject),
        (None, Some(value)) => value == subject,
        (None, None) => true,
    }
}

fn apply(
    rule: &CompiledRule,
    desc: &mut HttpDesc,
    meta: &SessionMeta,
    matched: &HashMap<KeyType, String>,
    tags: &mut HashSet<u32>,
    outcome: &mut Outcome,
) {
    if let Some(table) = rule.conf.table_id {
        outcome.table = Some(table);
    }
    if let Some(label) = rule.label_id {
        outcome.label = Some(label);
    }
    if let Some(tag) = rule.tag_id {
        if tags.insert(tag) {
            outcome.tags_added.push(tag);
        }
    }

    let target = rule.conf.target.as_ref();
    match rule.conf.action {
        RuleAction::Append | RuleAction::Set | RuleAction::Remove => {
            if let Some(target) = target {
                let value = target
                    .value
                    .as_deref()
                    .map(|v| expand_macros(v, desc, meta, matched));
                mutate(desc, rule.conf.action, target, value.as_deref());
            }
        }
        RuleAction::Hash => {
            for part in hash_parts(desc, target, matched) {
                outcome.hash_input.extend_from_slice(part.as_bytes());
            }
        }
        RuleAction::Log => {
            for line in log_parts(desc, target, matched) {
                outcome.log.push(line);
            }
        }
        _ => {}
    }
}

fn mutate(desc: &mut HttpDesc, action: RuleAction, target: &RuleTarget, value: Option<&str>) {
    match target.ktype {
        KeyType::Header => match action {
            RuleAction::Append => {
                desc.headers.insert(&target.key, value);
            }
            RuleAction::Set => {
                desc.headers.set(&target.key, value);
            }
            RuleAction::Remove => {
                desc.headers.remove(&target.key);
            }
            _ => {}
        },
        KeyType::Cookie => {
            match action {
                RuleAction::Append => {
                    desc.cookies.insert(&target.key, value);
                }
                RuleAction::Set => {
                    desc.cookies.set(&target.key, value);
                }
                RuleAction::Remove => {
                    desc.cookies.remove(&target.key);
                }
                _ => {}
            }
            desc.mark_cookies_dirty();
        }
        KeyType::Query => {
            match action {
                RuleAction::Append => {
                    desc.query_kv.insert(&target.key, value);
                }
                RuleAction::Set => {
                    desc.query_kv.set(&target.key, value);
                }
                RuleAction::Remove => {
                    desc.query_kv.remove(&target.key);
                }
                _ => {}
            }
            desc.mark_query_dirty();
        }
        KeyType::Path => {
            if action == RuleAction::Set {
                desc.path = value.unwrap_or(&target.key).to_string();
            }
        }
        KeyType::Method => {
            if action == RuleAction::Set {
                desc.method = value.unwrap_or(&target.key).to_string();
            }
        }
        KeyType::Url | KeyType::State => {
            debug!(?target.ktype, "ignoring mutation of immutable key type");
        }
    }
}

fn matched_ordered(matched: &HashMap<KeyType, String>) -> Vec<(KeyType, &String)> {
    let mut pairs: Vec<_> = matched.iter().map(|(kt, v)| (*kt, v)).collect();
    pairs.sort_by_key(|(kt, _)| *kt);
    pairs
}

fn hash_parts(
    desc: &HttpDesc,
    target: Option<&RuleTarget>,
    matched: &HashMap<KeyType, String>,
) -> Vec<String> {
    match target {
        Some(target) => lookup_scalar(desc, target).into_iter().collect(),
        None => matched_ordered(matched)
            .into_iter()
            .map(|(_, v)| v.clone())
            .collect(),
    }
}

fn log_parts(
    desc: &HttpDesc,
    target: Option<&RuleTarget>,
    matched: &HashMap<KeyType, String>,
) -> Vec<String> {
    match target {
        Some(target) => lookup_scalar(desc, target)
            .map(|v| format!("{}: {}", target.key, v))
            .into_iter()
            .collect(),
        None => matched_ordered(matched)
            .into_iter()
            .map(|(kt, v)| format!("{kt:?}: {v}"))
            .collect(),
    }
}

fn lookup_scalar(desc: &HttpDesc, target: &RuleTarget) -> Option<String> {
    match target.ktype {
        KeyType::Header => desc
            .headers
            .find(&target.key)
            .and_then(|(_, kv)| kv.value.clone()),
        KeyType::Cookie => desc
            .cookies
            .find(&target.key)
            .and_then(|(_, kv)| kv.value.clone()),
        KeyType::Query => desc
            .query_kv
            .find(&target.key)
            .and_then(|(_, kv)| kv.value.clone()),
        KeyType::Path => Some(desc.path.clone()),
        KeyType::Url => Some(desc.url.clone()),
        KeyType::Method => Some(desc.method.clone()),
        KeyType::State => None,
    }
}

/// Just-in-time `$` macro expansion from session state and the values
/// matched by the current rule.
pub fn expand_macros(
    template: &str,
    desc: &HttpDesc,
    meta: &SessionMeta,
    matched: &HashMap<KeyType, String>,
) -> String {
    if !template.contains('$') {
        return template.to_string();
    }
    let host = desc
        .headers
        .find("Host")
        .and_then(|(_, kv)| kv.value.clone())
        .unwrap_or_default();
    let lookup = |kt: KeyType| matched.get(&kt).cloned().unwrap_or_default();

    // longest names first so $SERVER_ADDR is not eaten by a shorter token
    let pairs: [(&str, String); 13] = [
        ("$REMOTE_ADDR", meta.client.ip().to_string()),
        ("$REMOTE_PORT", meta.client.port().to_string()),
        ("$SERVER_ADDR", meta.listen.ip().to_string()),
        ("$SERVER_PORT", meta.listen.port().to_string()),
        ("$SERVER_NAME", meta.relay_name.clone()),
        ("$TIMEOUT", meta.timeout.to_string()),
        ("$HEADER", lookup(KeyType::Header)),
        ("$COOKIE", lookup(KeyType::Cookie)),
        ("$METHOD", desc.method.clone()),
        ("$QUERY", lookup(KeyType::Query)),
        ("$PATH", desc.path.clone()),
        ("$HOST", host),
        ("$URL", desc.url.clone()),
    ];
    let mut out = template.to_string();
    for (token, value) in pairs {
        if out.contains(token) {
            out = out.replace(token, &value);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse, ProtoKind};
    use crate::http::HttpOut;

    fn proto_with_rules(rules_json: &str) -> (Rc<ProtoRuntime>, Rc<RefCell<NameTable>>) {
        let text = format!(
            r#"{{
                "tables": [
                    {{ "name": "t", "check": {{ "kind": "tcp" }}, "hosts": ["127.0.0.1:9000"] }}
                ],
                "protocols": [
                    {{ "name": "web", "kind": "http", "rules": {rules_json} }}
                ],
                "relays": [
                    {{ "name": "r", "listen": "127.0.0.1:8000", "protocol": "web",
                      "forward": [ {{ "table": "t" }} ] }}
                ]
            }}"#
        );
        let cfg = parse(&text).unwrap();
        let names = Rc::new(RefCell::new(NameTable::new()));
        let rt = ProtoRuntime::compile(cfg.protos[0].clone(), &cfg.rules, names.clone()).unwrap();
        assert_eq!(rt.proto.kind, ProtoKind::Http);
        (rt, names)
    }

    fn request(raw: &[u8]) -> HttpDesc {
        let mut desc = HttpDesc::new(Direction::Request);
        let mut input = raw.to_vec();
        let mut out = Vec::new();
        desc.parse(&mut input, &mut out).unwrap();
        assert!(out.contains(&HttpOut::Heads));
        desc
    }

    fn meta() -> SessionMeta {
        SessionMeta {
            id: 1,
            client: "192.0.2.7:52000".parse().unwrap(),
            listen: "10.1.1.1:443".parse().unwrap(),
            relay_name: "www".into(),
            timeout: 600,
        }
    }

    // keep the request head un-terminated so kv state survives for
    // inspection (a blank line would reset the descriptor at Done)
    const HEAD: &[u8] = b"GET /api/v1?user=jane HTTP/1.1\r\nHost: api.example.com\r\nCookie: sid=abc\r\nContent-Length: 1\r\n\r\n";

    #[test]
    fn header_rewrite_with_matched_macro() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "set",
                  "header": { "key": "Host", "value": "*.example.com" },
                  "target": { "key": "X-Original-Host", "value": "$HEADER" } },
                { "direction": "request", "action": "pass" }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.pass && !outcome.block);
        let head = String::from_utf8(desc.serialize_head()).unwrap();
        assert!(head.contains("X-Original-Host: api.example.com\r\n"));
    }

    #[test]
    fn first_terminating_rule_wins() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "pass",
                  "header": { "key": "Host" } },
                { "direction": "request", "action": "block" }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.pass);
        assert!(!outcome.block);
    }

    #[test]
    fn non_terminal_side_effects_accumulate() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "set",
                  "target": { "key": "X-Relay", "value": "$SERVER_NAME" } },
                { "direction": "request", "action": "remove",
                  "target": { "key": "Cookie" } },
                { "direction": "request", "action": "block",
                  "path": { "key": "/admin*" } },
                { "direction": "request", "action": "pass" }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.pass);
        let head = String::from_utf8(desc.serialize_head()).unwrap();
        assert!(head.contains("X-Relay: www\r\n"));
        assert!(!head.contains("Cookie"));
    }

    #[test]
    fn block_on_glob_path() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "block",
                  "path": { "key": "/api/*" } }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.block);
    }

    #[test]
    fn value_constraint_is_case_sensitive() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "block",
                  "query": { "key": "user", "value": "Jane" } }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(!outcome.block, "value Jane must not match jane");
    }

    #[test]
    fn tagged_rules_require_the_tag() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "match", "tag": "api",
                  "path": { "key": "/api/*" } },
                { "direction": "request", "action": "block", "tagged": "web" },
                { "direction": "request", "action": "pass", "tagged": "api" }
            ]"#,
        );
        let mut desc = request(HEAD);
        let mut tags = HashSet::new();
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut tags);
        assert!(outcome.pass);
        assert!(!outcome.block);
        assert_eq!(outcome.tags_added.len(), 1);
    }

    #[test]
    fn hash_rule_feeds_session_hash() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "hash",
                  "target": { "type": "cookie", "key": "sid" } }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert_eq!(outcome.hash_input, b"abc");
    }

    #[test]
    fn rule_table_binding_selects_table() {
        let (rt, _) = proto_with_rules(
            r#"[
                { "direction": "request", "action": "match", "table": "t" }
            ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.table.is_some());
    }

    #[test]
    fn glob_and_exact_rule_lookup_agree() {
        for key in ["Host", "host"] {
            let (rt, _) = proto_with_rules(&format!(
                r#"[ {{ "direction": "request", "action": "block",
                       "header": {{ "key": "{key}" }} }} ]"#
            ));
            let mut desc = request(HEAD);
            let outcome =
                eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
            assert!(outcome.block, "exact key {key}");
        }
        let (rt, _) = proto_with_rules(
            r#"[ { "direction": "request", "action": "block",
                   "header": { "key": "HO*" } } ]"#,
        );
        let mut desc = request(HEAD);
        let outcome = eval(&rt, Direction::Request, &mut desc, &meta(), &mut HashSet::new());
        assert!(outcome.block, "glob key");
    }

    #[test]
    fn label_refcounts_follow_inherit_and_free() {
        let (rt1, names) = proto_with_rules(
            r#"[ { "direction": "request", "action": "block", "label": "denied" } ]"#,
        );
        let id = rt1.rules[0].label_id.unwrap();
        assert_eq!(names.borrow().count(id), 1);

        // a second runtime referencing the same label
        let cfg_rules = rt1.rules[0].conf.clone();
        let rt2 = ProtoRuntime::compile(rt1.proto.clone(), &[cfg_rules], names.clone()).unwrap();
        assert_eq!(names.borrow().count(id), 2);

        drop(rt2);
        assert_eq!(names.borrow().count(id), 1);
        assert_eq!(names.borrow().name(id), Some("denied"));

        drop(rt1);
        assert_eq!(names.borrow().count(id), 0);
        assert_eq!(names.borrow().name(id), None);
    }

    #[test]
    fn macros_expand_session_state() {
        let desc = request(HEAD);
        let expanded = expand_macros(
            "$REMOTE_ADDR:$REMOTE_PORT via $SERVER_NAME to $HOST$PATH",
            &desc,
            &meta(),
            &HashMap::new(),
        );
        assert_eq!(expanded, "192.0.2.7:52000 via www to api.example.com/api/v1");
    }
}
