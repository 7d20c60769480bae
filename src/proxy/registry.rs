use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// One live proxied connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: Uuid,
    /// Unix milliseconds; strictly increasing across the process.
    pub time: u64,
    pub listen_addr: String,
    pub domain: String,
    pub source_addr: String,
    pub target_addr: String,
}

/// Filter for [`LinkRegistry::list`]. Empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFilter {
    /// Exact match.
    #[serde(default)]
    pub listen_addr: Option<String>,
    /// Exact match.
    #[serde(default)]
    pub domain: Option<String>,
    /// Substring match.
    #[serde(default)]
    pub source_addr: Option<String>,
}

impl LinkFilter {
    fn matches(&self, link: &Link) -> bool {
        if let Some(listen) = &self.listen_addr {
            if &link.listen_addr != listen {
                return false;
            }
        }
        if let Some(domain) = &self.domain {
            if &link.domain != domain {
                return false;
            }
        }
        if let Some(source) = &self.source_addr {
            if !link.source_addr.contains(source.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Authoritative record of live connections. Pump tasks insert on open and
/// remove on exit; the management API copies under the lock on list.
#[derive(Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<Uuid, Link>>,
    last_stamp: AtomicU64,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and inserts a record for a freshly routed connection.
    pub fn open(
        &self,
        listen_addr: String,
        domain: String,
        source_addr: String,
        target_addr: String,
    ) -> Link {
        let link = Link {
            id: Uuid::new_v4(),
            time: self.stamp(),
            listen_addr,
            domain,
            source_addr,
            target_addr,
        };

        let previous = self.links.write().insert(link.id, link.clone());
        debug_assert!(previous.is_none(), "duplicate link id {}", link.id);
        link
    }

    /// Removes and returns the record; missing ids are a no-op.
    pub fn close(&self, id: &Uuid) -> Option<Link> {
        self.links.write().remove(id)
    }

    /// Copies matching records under the lock, oldest first.
    pub fn list(&self, filter: &LinkFilter) -> Vec<Link> {
        let mut out: Vec<Link> = self
            .links
            .read()
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        out.sort_by_key(|l| l.time);
        out
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }

    /// Wall-clock milliseconds, nudged forward so stamps never repeat even
    /// for connections opened within the same millisecond.
    fn stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}
