use thiserror::Error;

use crate::link::{ConnectionId, LinkId};

/// Contract violations raised by the broker core.
///
/// These indicate a bug in the integration with the protocol engine rather
/// than a runtime condition. The caller refuses the offending link or drops
/// the offending message; the core never retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("link {0} is not a sender and cannot consume from a queue")]
    NotASender(LinkId),

    #[error("link {link} is already a consumer of queue '{address}'")]
    DuplicateConsumer { link: LinkId, address: String },

    #[error("link {0} has no resolvable address")]
    UnresolvedAddress(LinkId),

    #[error("connection {0} is not open")]
    UnknownConnection(ConnectionId),
}
