//! Broker event handling.
//!
//! [`BrokerController`] is the coordination point the protocol engine calls
//! into. It keeps track of connections and their links, resolves addresses
//! to queues through the [`QueueRegistry`] and drives the queue operations.
//! All handlers are synchronous and never block; the caller delivers events
//! one at a time.

use std::collections::HashMap;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::config::Config;
use crate::console::Console;
use crate::error::BrokerError;
use crate::link::{ConnectionId, LinkId, LinkRef, Terminus};
use crate::message::{embedded_address, summarize, BrokerMessage};
use crate::registry::{QueueRegistry, Retention};
use crate::session::{ConnectionSession, LinkEntry};
use crate::settlement::{IgnoreSettlement, Outcome, SettlementHandler};

/// Container identity the broker presents to its peers.
pub const CONTAINER_ID: &str = "test-broker";

pub struct BrokerController {
    container_id: String,
    console: Console,
    queues: QueueRegistry,
    connections: HashMap<ConnectionId, ConnectionSession>,
    link_owners: HashMap<LinkId, ConnectionId>,
    settlement: Box<dyn SettlementHandler>,
}

impl BrokerController {
    pub fn new(console: Console, retention: Retention) -> Self {
        Self {
            container_id: CONTAINER_ID.to_string(),
            console,
            queues: QueueRegistry::new(console, retention),
            connections: HashMap::new(),
            link_owners: HashMap::new(),
            settlement: Box::new(IgnoreSettlement),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(Console::new(config.quiet, config.verbose), config.retention)
    }

    /// Replaces the delivery outcome strategy.
    pub fn with_settlement_handler(mut self, handler: impl SettlementHandler + 'static) -> Self {
        self.settlement = Box::new(handler);
        self
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn console(&self) -> Console {
        self.console
    }

    pub fn queues(&self) -> &QueueRegistry {
        &self.queues
    }

    pub fn session(&self, connection: ConnectionId) -> Option<&ConnectionSession> {
        self.connections.get(&connection)
    }

    pub fn on_start(&mut self, interface: SocketAddr) {
        self.console
            .notice(format_args!("Listening on '{}'", interface));
    }

    pub fn on_connection_opening(&mut self, connection: ConnectionId, remote_container: String) {
        let mut session = ConnectionSession::new(connection, remote_container);
        session.set_container(self.container_id.clone());
        self.connections.insert(connection, session);
    }

    pub fn on_connection_opened(&mut self, connection: ConnectionId) {
        if let Some(session) = self.connections.get(&connection) {
            self.console.notice(format_args!(
                "Opened connection from {}",
                session.remote_container()
            ));
        }
    }

    /// Binds the address of a newly attached link and returns it.
    ///
    /// Sender links get their requested source address, or a freshly
    /// generated one when the peer asked for a dynamic source, and become
    /// consumers of the matching queue. Receiver links get their requested
    /// target address, which may be absent.
    pub fn on_link_opening(
        &mut self,
        connection: ConnectionId,
        link: LinkRef,
        remote: Terminus,
    ) -> Result<Option<String>, BrokerError> {
        let session = self
            .connections
            .get_mut(&connection)
            .ok_or(BrokerError::UnknownConnection(connection))?;
        let id = link.id();

        let entry = if link.is_sender() {
            let address = if remote.dynamic {
                Uuid::new_v4().to_string()
            } else {
                remote.address.ok_or(BrokerError::UnresolvedAddress(id))?
            };

            self.queues
                .get_or_create(&address)
                .add_consumer(link.clone())?;

            LinkEntry {
                link,
                source: Some(address),
                target: None,
            }
        } else {
            LinkEntry {
                link,
                source: None,
                target: remote.address,
            }
        };

        let bound = entry.source.clone().or_else(|| entry.target.clone());
        session.attach(entry);
        self.link_owners.insert(id, connection);
        Ok(bound)
    }

    pub fn on_link_closing(&mut self, link: LinkId) {
        let Some(connection) = self.link_owners.remove(&link) else {
            return;
        };
        let Some(entry) = self
            .connections
            .get_mut(&connection)
            .and_then(|session| session.detach(link))
        else {
            return;
        };

        if entry.link.is_sender() {
            if let Some(address) = entry.source.as_deref() {
                self.remove_consumer(address, link);
            }
        }
    }

    pub fn on_connection_closing(&mut self, connection: ConnectionId) {
        self.remove_consumers(connection);
    }

    pub fn on_connection_closed(&mut self, connection: ConnectionId) {
        if let Some(session) = self.forget_connection(connection) {
            self.console.notice(format_args!(
                "Closed connection from {}",
                session.remote_container()
            ));
        }
    }

    pub fn on_disconnected(&mut self, connection: ConnectionId) {
        if let Some(session) = self.connections.get(&connection) {
            self.console.notice(format_args!(
                "Disconnected from {}",
                session.remote_container()
            ));
        }
        self.remove_consumers(connection);
        self.forget_connection(connection);
    }

    /// A consumer link has credit available.
    pub fn on_sendable(&mut self, link: LinkId) {
        let Some(address) = self.source_address(link) else {
            return;
        };
        self.queues.get_or_create(&address).forward_messages();
    }

    /// Stores a published message and forwards right away.
    ///
    /// The destination is the target address bound on the publishing link,
    /// falling back to the address carried in the message itself.
    pub fn on_message(&mut self, link: LinkId, message: BrokerMessage) -> Result<(), BrokerError> {
        let session = self
            .link_owners
            .get(&link)
            .and_then(|connection| self.connections.get(connection));
        let entry = session.and_then(|s| s.link(link));

        let origin = session
            .map(|s| s.remote_container().to_string())
            .unwrap_or_else(|| "unknown peer".to_string());

        let address = entry
            .and_then(|e| e.target.clone())
            .or_else(|| embedded_address(&message).map(str::to_string));

        let Some(address) = address else {
            self.console.warn(format_args!(
                "Dropped {} from {}: no destination address",
                summarize(&message),
                origin
            ));
            return Err(BrokerError::UnresolvedAddress(link));
        };

        let queue = self.queues.get_or_create(&address);
        queue.store_message(&origin, message);
        queue.forward_messages();
        Ok(())
    }

    /// Returns messages a consumer link took but never put on the wire and
    /// forwards them again, ahead of anything published since.
    pub fn on_requeue(&mut self, address: &str, messages: Vec<BrokerMessage>) {
        if messages.is_empty() {
            return;
        }
        let queue = self.queues.get_or_create(address);
        queue.requeue_front(messages);
        queue.forward_messages();
    }

    pub fn on_settled(&mut self, link: LinkId, outcome: Outcome) {
        self.settlement.on_settled(link, outcome);
    }

    fn source_address(&self, link: LinkId) -> Option<String> {
        let connection = self.link_owners.get(&link)?;
        let entry = self.connections.get(connection)?.link(link)?;
        if !entry.link.is_sender() {
            return None;
        }
        entry.source.clone()
    }

    /// Removes every active sender link of `connection` from its queue.
    fn remove_consumers(&mut self, connection: ConnectionId) {
        let Some(session) = self.connections.get(&connection) else {
            return;
        };
        let consumers: Vec<(LinkId, String)> = session
            .sender_links()
            .filter_map(|entry| Some((entry.link.id(), entry.source.clone()?)))
            .collect();

        for (link, address) in consumers {
            self.remove_consumer(&address, link);
        }
    }

    fn remove_consumer(&mut self, address: &str, link: LinkId) {
        if let Some(queue) = self.queues.get_mut(address) {
            queue.remove_consumer(link);
        }
        self.queues.release_if_idle(address);
    }

    fn forget_connection(&mut self, connection: ConnectionId) -> Option<ConnectionSession> {
        let session = self.connections.remove(&connection)?;
        self.link_owners.retain(|_, owner| *owner != connection);
        Some(session)
    }
}
