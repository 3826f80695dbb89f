//! Key-value state for L7 sessions: an index-based arena of entries with
//! parent/child links (multi-valued keys hang off their first entry), a
//! tree index for exact lookup, a linear case-folded glob scan, and the
//! interned label/tag registry shared by the rule engine.

use std::collections::{BTreeMap, HashMap};

use globset::{GlobBuilder, GlobMatcher};

#[derive(Debug, Clone, Default)]
pub struct Kv {
    pub key: String,
    pub value: Option<String>,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// One kv collection (headers, cookies, or query parameters) of a
/// message direction. Entry order is preserved for re-serialisation.
#[derive(Debug, Default)]
pub struct KvTree {
    slots: Vec<Option<Kv>>,
    index: BTreeMap<String, usize>,
    order: Vec<usize>,
}

fn fold(key: &str) -> String {
    key.to_ascii_lowercase()
}

impl KvTree {
    pub fn new() -> KvTree {
        KvTree::default()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
        self.order.clear();
    }

    /// Insert a key-value pair. A repeated key becomes a child of the
    /// first entry so multi-valued lookups see every instance.
    pub fn insert(&mut self, key: &str, value: Option<&str>) -> usize {
        let folded = fold(key);
        let idx = self.slots.len();
        let parent = self.index.get(&folded).copied();
        self.slots.push(Some(Kv {
            key: key.to_string(),
            value: value.map(str::to_string),
            parent,
            children: Vec::new(),
        }));
        self.order.push(idx);
        match parent {
            Some(p) => {
                if let Some(kv) = self.slots[p].as_mut() {
                    kv.children.push(idx);
                }
            }
            None => {
                self.index.insert(folded, idx);
            }
        }
        idx
    }

    /// Exact (case-folded) lookup of the first entry for a key.
    pub fn find(&self, key: &str) -> Option<(usize, &Kv)> {
        let idx = *self.index.get(&fold(key))?;
        self.slots[idx].as_ref().map(|kv| (idx, kv))
    }

    /// Linear scan with a case-folded glob pattern. For keys without
    /// glob metacharacters this returns the same entry as `find`.
    pub fn find_glob(&self, matcher: &GlobMatcher) -> Option<(usize, &Kv)> {
        for &idx in &self.order {
            if let Some(kv) = self.slots[idx].as_ref() {
                if kv.parent.is_none() && matcher.is_match(&kv.key) {
                    return Some((idx, kv));
                }
            }
        }
        None
    }

    pub fn get(&self, idx: usize) -> Option<&Kv> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// The entry and all its children, in insertion order.
    pub fn values<'a>(&'a self, idx: usize) -> impl Iterator<Item = &'a Kv> + 'a {
        let children = self
            .get(idx)
            .map(|kv| kv.children.clone())
            .unwrap_or_default();
        std::iter::once(idx)
            .chain(children)
            .filter_map(move |i| self.get(i))
    }

    pub fn set_value(&mut self, idx: usize, value: Option<&str>) {
        if let Some(kv) = self.slots.get_mut(idx).and_then(Option::as_mut) {
            kv.value = value.map(str::to_string);
        }
    }

    /// Replace all instances of a key with a single value.
    pub fn set(&mut self, key: &str, value: Option<&str>) -> usize {
        self.remove(key);
        self.insert(key, value)
    }

    /// Delete an entry and its whole child subtree.
    pub fn delete(&mut self, idx: usize) {
        let Some(kv) = self.slots.get_mut(idx).and_then(Option::take) else {
            return;
        };
        for child in &kv.children {
            self.slots[*child] = None;
        }
        if kv.parent.is_none() {
            self.index.remove(&fold(&kv.key));
        } else if let Some(parent) = self
            .slots
            .get_mut(kv.parent.unwrap())
            .and_then(Option::as_mut)
        {
            parent.children.retain(|&c| c != idx);
        }
        self.order
            .retain(|&i| self.slots.get(i).map_or(false, Option::is_some));
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.find(key) {
            Some((idx, _)) => {
                self.delete(idx);
                true
            }
            None => false,
        }
    }

    /// Entries in arrival order (children included at their position).
    pub fn iter(&self) -> impl Iterator<Item = &Kv> {
        self.order
            .iter()
            .filter_map(move |&idx| self.slots[idx].as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// True when a rule key needs the glob scan path.
pub fn has_glob(key: &str) -> bool {
    key.contains(['*', '?', '['])
}

/// Case-folded fnmatch-style matcher for rule keys and expect patterns.
pub fn compile_glob(pattern: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(pattern)
        .case_insensitive(true)
        .literal_separator(false)
        .build()?
        .compile_matcher())
}

/// Interned label/tag names with reference counts. Ids are reused once
/// their count drops to zero.
#[derive(Debug, Default)]
pub struct NameTable {
    by_name: HashMap<String, u32>,
    entries: Vec<Option<NameEntry>>,
    free: Vec<u32>,
}

#[derive(Debug)]
struct NameEntry {
    name: String,
    refs: u32,
}

impl NameTable {
    pub fn new() -> NameTable {
        NameTable::default()
    }

    /// Intern a name (or bump its refcount) and return its id.
    pub fn ref_name(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.by_name.get(name) {
            let entry = self.entries[id as usize].as_mut().unwrap();
            entry.refs += 1;
            return id;
        }
        let entry = NameEntry {
            name: name.to_string(),
            refs: 1,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.entries[id as usize] = Some(entry);
                id
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn ref_id(&mut self, id: u32) {
        if let Some(entry) = self.entries.get_mut(id as usize).and_then(Option::as_mut) {
            entry.refs += 1;
        }
    }

    pub fn unref(&mut self, id: u32) {
        let Some(slot) = self.entries.get_mut(id as usize) else {
            return;
        };
        let Some(entry) = slot.as_mut() else { return };
        entry.refs -= 1;
        if entry.refs == 0 {
            self.by_name.remove(&entry.name);
            *slot = None;
            self.free.push(id);
        }
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .map(|e| e.name.as_str())
    }

    pub fn count(&self, id: u32) -> u32 {
        self.entries
            .get(id as usize)
            .and_then(Option::as_ref)
            .map_or(0, |e| e.refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_headers() -> KvTree {
        let mut t = KvTree::new();
        t.insert("Host", Some("api.example.com"));
        t.insert("Accept", Some("*/*"));
        t.insert("Set-Cookie", Some("a=1"));
        t.insert("Set-Cookie", Some("b=2"));
        t
    }

    #[test]
    fn exact_find_is_case_folded() {
        let t = tree_with_headers();
        let (_, kv) = t.find("host").unwrap();
        assert_eq!(kv.value.as_deref(), Some("api.example.com"));
        assert!(t.find("x-missing").is_none());
    }

    #[test]
    fn glob_and_exact_agree_without_metachars() {
        // For any key without glob metacharacters the two lookup paths
        // must return the same record.
        let t = tree_with_headers();
        for key in ["Host", "accept", "SET-COOKIE"] {
            assert!(!has_glob(key));
            let matcher = compile_glob(key).unwrap();
            let exact = t.find(key).map(|(i, _)| i);
            let scanned = t.find_glob(&matcher).map(|(i, _)| i);
            assert_eq!(exact, scanned, "key {key}");
        }
    }

    #[test]
    fn glob_scan_matches_patterns() {
        let t = tree_with_headers();
        let matcher = compile_glob("set-*").unwrap();
        let (idx, kv) = t.find_glob(&matcher).unwrap();
        assert_eq!(kv.key, "Set-Cookie");
        assert_eq!(t.values(idx).count(), 2);
    }

    #[test]
    fn repeated_keys_become_children() {
        let t = tree_with_headers();
        let (idx, _) = t.find("Set-Cookie").unwrap();
        let values: Vec<_> = t
            .values(idx)
            .map(|kv| kv.value.clone().unwrap())
            .collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn delete_collects_subtree() {
        let mut t = tree_with_headers();
        let (idx, _) = t.find("Set-Cookie").unwrap();
        t.delete(idx);
        assert!(t.find("Set-Cookie").is_none());
        assert_eq!(t.iter().count(), 2);
    }

    #[test]
    fn set_replaces_all_instances() {
        let mut t = tree_with_headers();
        t.set("Set-Cookie", Some("c=3"));
        let (idx, kv) = t.find("Set-Cookie").unwrap();
        assert_eq!(kv.value.as_deref(), Some("c=3"));
        assert_eq!(t.values(idx).count(), 1);
    }

    #[test]
    fn refcounts_balance() {
        let mut names = NameTable::new();
        let a = names.ref_name("app");
        let b = names.ref_name("blocked");
        names.ref_name("app");
        names.ref_id(a);
        assert_eq!(names.count(a), 3);
        assert_eq!(names.count(b), 1);

        names.unref(a);
        names.unref(a);
        assert_eq!(names.count(a), 1);
        assert_eq!(names.name(a), Some("app"));

        names.unref(a);
        assert_eq!(names.count(a), 0);
        assert_eq!(names.name(a), None);

        // Freed ids are reused and the old name is fully reclaimed.
        let c = names.ref_name("cache");
        assert_eq!(c, a);
        assert_eq!(names.name(c), Some("cache"));
        assert_eq!(names.count(b), 1);
    }
}
