//! Per-run install state.

use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

pub const ROOT_DIR: &str = "bar/";
pub const META_DIR: &str = "bar/00_meta/";
pub const MANIFEST: &str = "bar/00_meta/00_manifest.json";
pub const RELATIONS: &str = "bar/00_meta/10_relations.json";
pub const ROLES: &str = "bar/00_meta/20_roles.json";
pub const EXT_ROLES: &str = "bar/00_meta/30_extroles.json";
pub const LINKS: &str = "bar/00_meta/70_links.json";
pub const ROOTPROPS: &str = "bar/00_meta/90_rootprops.xml";
pub const CONTENTS_DIR: &str = "bar/90_contents/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    pub name: &'static str,
    pub required: bool,
}

const fn entry(name: &'static str, required: bool) -> LedgerEntry {
    LedgerEntry { name, required }
}

/// Fixed top-level descriptor entries, in archive order.
pub const LEDGER: [LedgerEntry; 7] = [
    entry(MANIFEST, true),
    entry(RELATIONS, false),
    entry(ROLES, false),
    entry(EXT_ROLES, false),
    entry(LINKS, false),
    entry(ROOTPROPS, true),
    entry(CONTENTS_DIR, false),
];

#[derive(Clone, Debug)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            entries: LEDGER.to_vec(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// First required entry absent from `done`.
    pub fn first_missing(&self, done: &DoneSet) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|e| e.required && !done.contains(e.name))
            .map(|e| e.name)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

/// Insertion-ordered set of fully processed entry names. Only ever grows.
#[derive(Clone, Debug, Default)]
pub struct DoneSet {
    order: Vec<String>,
    seen: HashSet<String>,
}

impl DoneSet {
    /// Returns false if the name was already present.
    pub fn insert(&mut self, name: &str) -> bool {
        if !self.seen.insert(name.to_string()) {
            return false;
        }
        self.order.push(name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    pub fn last(&self) -> Option<&str> {
        self.order.last().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

/// One accepted install request and its run state.
#[derive(Clone, Debug)]
pub struct InstallJob {
    pub cell: String,
    pub box_name: String,
    pub box_id: Uuid,
    pub archive: PathBuf,
    pub request_key: Option<String>,
    pub total_entries: u64,
    pub ledger: Ledger,
    pub done: DoneSet,
    pub counter: u64,
}

impl InstallJob {
    pub fn new(
        cell: impl Into<String>,
        box_name: impl Into<String>,
        archive: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cell: cell.into(),
            box_name: box_name.into(),
            box_id: Uuid::new_v4(),
            archive: archive.into(),
            request_key: None,
            total_entries: 0,
            ledger: Ledger::new(),
            done: DoneSet::default(),
            counter: 0,
        }
    }

    pub fn with_box_id(mut self, box_id: Uuid) -> Self {
        self.box_id = box_id;
        self
    }

    pub fn with_request_key(mut self, key: Option<String>) -> Self {
        self.request_key = key;
        self
    }

    pub fn with_total_entries(mut self, total: u64) -> Self {
        self.total_entries = total;
        self
    }

    /// Record an entry whose effects have been applied.
    pub fn mark_done(&mut self, name: &str) -> bool {
        self.done.insert(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_set_keeps_insertion_order() {
        let mut done = DoneSet::default();
        assert!(done.insert(MANIFEST));
        assert!(done.insert(ROOTPROPS));
        assert!(!done.insert(MANIFEST));
        assert_eq!(done.iter().collect::<Vec<_>>(), vec![MANIFEST, ROOTPROPS]);
        assert_eq!(done.last(), Some(ROOTPROPS));
    }

    #[test]
    fn test_ledger_reports_missing_required() {
        let ledger = Ledger::new();
        let mut done = DoneSet::default();
        done.insert(MANIFEST);
        done.insert(ROLES);
        assert_eq!(ledger.first_missing(&done), Some(ROOTPROPS));
        done.insert(ROOTPROPS);
        assert_eq!(ledger.first_missing(&done), None);
        assert!(!ledger.contains("bar/00_meta/40_unknown.json"));
    }
}
