use std::collections::BTreeMap;

use crate::link::{ConnectionId, LinkId, LinkRef};

/// A link attached on a connection together with the address the broker
/// bound on it.
#[derive(Clone)]
pub struct LinkEntry {
    pub link: LinkRef,
    /// Bound source address (sender links).
    pub source: Option<String>,
    /// Bound target address (receiver links).
    pub target: Option<String>,
}

/// One client connection and the links currently active on it.
pub struct ConnectionSession {
    id: ConnectionId,
    remote_container: String,
    container: Option<String>,
    links: BTreeMap<LinkId, LinkEntry>,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId, remote_container: impl Into<String>) -> Self {
        Self {
            id,
            remote_container: remote_container.into(),
            container: None,
            links: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_container(&self) -> &str {
        &self.remote_container
    }

    /// Local container identity the connection was tagged with.
    pub fn container(&self) -> Option<&str> {
        self.container.as_deref()
    }

    pub fn set_container(&mut self, container: impl Into<String>) {
        self.container = Some(container.into());
    }

    pub fn attach(&mut self, entry: LinkEntry) {
        self.links.insert(entry.link.id(), entry);
    }

    pub fn detach(&mut self, link: LinkId) -> Option<LinkEntry> {
        self.links.remove(&link)
    }

    pub fn link(&self, link: LinkId) -> Option<&LinkEntry> {
        self.links.get(&link)
    }

    /// Active sender links, in attach order.
    pub fn sender_links(&self) -> impl Iterator<Item = &LinkEntry> {
        self.links.values().filter(|entry| entry.link.is_sender())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}
