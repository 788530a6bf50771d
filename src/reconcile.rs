//! Matching a fetched article listing against the local copy.
//!
//! Planning is pure: it pairs local and incoming items by key and decides
//! what to create and what to delete. Engines apply the plan themselves,
//! since applying may need I/O (attachment mirroring, avatar fetches).

use std::collections::{HashMap, HashSet};

/// How authoritative a listing is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    /// Complete snapshot; local items missing from it are deleted.
    Manifest,
    /// Rolling window; items that rolled off are kept.
    Feed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// `(local index, incoming index)` pairs with the same key.
    pub matched: Vec<(usize, usize)>,
    /// Incoming indices with no local counterpart.
    pub created: Vec<usize>,
    /// Local indices to delete. Always empty for feeds.
    pub deleted: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Pair `local` and `incoming` keys. Duplicate incoming keys keep the first
/// occurrence; duplicate local keys keep the first and, for manifests, the
/// rest are deleted.
pub fn plan<L, I>(local: &[L], incoming: &[I], kind: ListingKind) -> Plan
where
    L: AsRef<str>,
    I: AsRef<str>,
{
    let mut by_key: HashMap<&str, usize> = HashMap::with_capacity(local.len());
    for (idx, key) in local.iter().enumerate() {
        by_key.entry(key.as_ref()).or_insert(idx);
    }

    let mut out = Plan::default();
    let mut seen_incoming: HashSet<&str> = HashSet::with_capacity(incoming.len());
    let mut matched_local: HashSet<usize> = HashSet::new();
    for (idx, key) in incoming.iter().enumerate() {
        let key = key.as_ref();
        if !seen_incoming.insert(key) {
            continue;
        }
        match by_key.get(key) {
            Some(&local_idx) => {
                matched_local.insert(local_idx);
                out.matched.push((local_idx, idx));
            }
            None => out.created.push(idx),
        }
    }

    if kind == ListingKind::Manifest {
        out.deleted = (0..local.len())
            .filter(|idx| !matched_local.contains(idx))
            .collect();
    }
    out
}
