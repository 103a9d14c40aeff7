//! The broker core's view of protocol links.
//!
//! Links are owned by the protocol engine adapter. The core only holds
//! [`LinkRef`] handles and talks to them through the [`Link`] trait: it reads
//! the role and the available credit, and hands messages over with `send`.

use std::fmt;
use std::sync::Arc;

use crate::message::BrokerMessage;

/// Unique identifier of a link for the lifetime of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Unique identifier of a client connection for the lifetime of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Role of the broker's end of a link.
///
/// A `Sender` link delivers messages from a queue to a client (a consumer);
/// a `Receiver` link accepts messages published by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Sender,
    Receiver,
}

/// Source or target requested by the remote peer on attach.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Terminus {
    pub address: Option<String>,
    /// The peer asks the broker to assign the address.
    pub dynamic: bool,
}

impl Terminus {
    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            dynamic: false,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            address: None,
            dynamic: true,
        }
    }
}

/// A protocol link as seen by the broker core.
pub trait Link: Send + Sync {
    fn id(&self) -> LinkId;

    fn role(&self) -> LinkRole;

    /// How many more messages the link is currently willing to take.
    fn credit(&self) -> u32;

    /// Remote identity of the owning connection, used for logging.
    fn connection(&self) -> &str;

    /// Hands a message to the link. Consumes one unit of credit.
    fn send(&self, message: BrokerMessage);

    fn is_sender(&self) -> bool {
        self.role() == LinkRole::Sender
    }

    fn is_receiver(&self) -> bool {
        self.role() == LinkRole::Receiver
    }
}

pub type LinkRef = Arc<dyn Link>;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::message::message_id;

    /// In-memory link recording everything sent to it.
    pub(crate) struct TestLink {
        id: LinkId,
        role: LinkRole,
        connection: String,
        credit: AtomicU32,
        sent: Mutex<Vec<BrokerMessage>>,
    }

    impl TestLink {
        pub(crate) fn sender(id: u64, credit: u32) -> Arc<Self> {
            Self::new(id, LinkRole::Sender, credit)
        }

        pub(crate) fn receiver(id: u64) -> Arc<Self> {
            Self::new(id, LinkRole::Receiver, 0)
        }

        fn new(id: u64, role: LinkRole, credit: u32) -> Arc<Self> {
            Arc::new(Self {
                id: LinkId(id),
                role,
                connection: format!("client-{id}"),
                credit: AtomicU32::new(credit),
                sent: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn grant(&self, credit: u32) {
            self.credit.fetch_add(credit, Ordering::SeqCst);
        }

        /// Ids of the messages sent on this link, in send order.
        pub(crate) fn received(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| message_id(m).unwrap_or_default())
                .collect()
        }
    }

    impl Link for TestLink {
        fn id(&self) -> LinkId {
            self.id
        }

        fn role(&self) -> LinkRole {
            self.role
        }

        fn credit(&self) -> u32 {
            self.credit.load(Ordering::SeqCst)
        }

        fn connection(&self) -> &str {
            &self.connection
        }

        fn send(&self, message: BrokerMessage) {
            self.credit.fetch_sub(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push(message);
        }
    }
}
