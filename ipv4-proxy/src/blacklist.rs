use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// Domain blacklist, replaced wholesale by control-plane broadcasts.
///
/// Readers always observe one consistent snapshot; lookups are lock-free.
#[derive(Default)]
pub struct Blacklist {
    entries: ArcSwap<HashSet<String>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, entries: HashSet<String>) {
        self.entries.store(Arc::new(entries));
    }

    /// Returns the matching entry: the domain itself when listed verbatim,
    /// otherwise the first listed substring the domain contains.
    pub fn lookup(&self, domain: &str) -> Option<String> {
        let entries = self.entries.load();

        if entries.contains(domain) {
            return Some(domain.to_owned());
        }

        entries.iter().find(|entry| domain.contains(entry.as_str())).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}
