//! Which backend owns which session

use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

use super::backend::BackendLink;
use crate::metrics::METRICS;

struct Entry {
    member: usize,
    link: Weak<BackendLink>,
}

/// Result of an affinity lookup
pub enum Affinity {
    /// The connection that created the session is still up
    Live(Arc<BackendLink>),
    /// That connection is gone; the session lives on this pool member
    Stale(usize),
}

/// bid -> backend connection
#[derive(Default)]
pub struct AffinityMap {
    entries: DashMap<String, Entry>,
}

impl AffinityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bid: &str, link: &Arc<BackendLink>) {
        trace!(bid, member = link.member(), "Pinning session");
        self.entries.insert(
            bid.to_owned(),
            Entry {
                member: link.member(),
                link: Arc::downgrade(link),
            },
        );
        METRICS.affinity_entries.set(self.entries.len() as i64);
    }

    pub fn remove(&self, bid: &str) {
        if self.entries.remove(bid).is_some() {
            trace!(bid, "Unpinning session");
            METRICS.affinity_entries.set(self.entries.len() as i64);
        }
    }

    pub fn lookup(&self, bid: &str) -> Option<Affinity> {
        let entry = self.entries.get(bid)?;
        let live = entry.link.upgrade().filter(|link| !link.is_closed());
        Some(match live {
            Some(link) => Affinity::Live(link),
            None => Affinity::Stale(entry.member),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
