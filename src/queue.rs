//! Per-address queue: a FIFO message buffer plus an ordered set of
//! consumer links.
//!
//! Messages are forwarded under link credit. Each forwarding pass walks the
//! consumers in order, handing one message to every consumer that still has
//! credit, until the combined credit of the pass is used up or the buffer
//! runs dry. Afterwards the consumer order is rotated left by the number of
//! messages sent, so the next pass starts from a different consumer.

use std::collections::VecDeque;
use std::fmt;

use crate::console::Console;
use crate::error::BrokerError;
use crate::link::{LinkId, LinkRef};
use crate::message::{summarize, BrokerMessage};

pub struct Queue {
    address: String,
    messages: VecDeque<BrokerMessage>,
    consumers: VecDeque<LinkRef>,
    console: Console,
}

impl Queue {
    pub fn new(address: impl Into<String>, console: Console) -> Self {
        Self {
            address: address.into(),
            messages: VecDeque::new(),
            consumers: VecDeque::new(),
            console,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Attaches a consumer at the back of the consumer order.
    ///
    /// Only sender links can consume, and a link can be attached once.
    pub fn add_consumer(&mut self, link: LinkRef) -> Result<(), BrokerError> {
        if !link.is_sender() {
            return Err(BrokerError::NotASender(link.id()));
        }
        if self.has_consumer(link.id()) {
            return Err(BrokerError::DuplicateConsumer {
                link: link.id(),
                address: self.address.clone(),
            });
        }

        self.console.info(format_args!(
            "Added consumer for {} to {}",
            link.connection(),
            self
        ));
        self.consumers.push_back(link);
        Ok(())
    }

    /// Detaches a consumer. Removing a link that is not attached is a no-op,
    /// so a link closed explicitly and again by its connection teardown is
    /// only removed once.
    pub fn remove_consumer(&mut self, link: LinkId) -> bool {
        let Some(position) = self.consumers.iter().position(|c| c.id() == link) else {
            return false;
        };

        if let Some(removed) = self.consumers.remove(position) {
            self.console.info(format_args!(
                "Removed consumer for {} from {}",
                removed.connection(),
                self
            ));
        }
        true
    }

    /// Appends a message at the tail of the buffer.
    pub fn store_message(&mut self, origin: &str, message: BrokerMessage) {
        self.console.notice(format_args!(
            "Stored {} from {} on {}",
            summarize(&message),
            origin,
            self
        ));
        self.messages.push_back(message);
    }

    /// Puts messages that never reached a consumer's peer back at the head
    /// of the buffer, keeping their relative order.
    pub fn requeue_front(&mut self, messages: Vec<BrokerMessage>) {
        if messages.is_empty() {
            return;
        }
        self.console.notice(format_args!(
            "Returned {} undelivered message(s) to {}",
            messages.len(),
            self
        ));
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    /// Forwards buffered messages to consumers with credit and returns how
    /// many were sent.
    pub fn forward_messages(&mut self) -> usize {
        let credit: u64 = self.consumers.iter().map(|c| u64::from(c.credit())).sum();
        if credit == 0 {
            return 0;
        }

        let mut sent: u64 = 0;
        'passes: while sent < credit {
            let mut progressed = false;

            for consumer in &self.consumers {
                if consumer.credit() == 0 {
                    continue;
                }
                let Some(message) = self.messages.pop_front() else {
                    break 'passes;
                };

                let summary = summarize(&message);
                consumer.send(message);
                sent += 1;
                progressed = true;

                self.console.notice(format_args!(
                    "Forwarded {} on queue '{}' to {}",
                    summary,
                    self.address,
                    consumer.connection()
                ));
            }

            // A consumer that reports credit but never consumes it would
            // otherwise keep this loop spinning.
            if !progressed {
                break;
            }
        }

        let sent = sent as usize;
        if !self.consumers.is_empty() {
            let shift = sent % self.consumers.len();
            self.consumers.rotate_left(shift);
        }
        sent
    }

    pub fn has_consumer(&self, link: LinkId) -> bool {
        self.consumers.iter().any(|c| c.id() == link)
    }

    /// Consumer ids in their current forwarding order.
    pub fn consumer_ids(&self) -> Vec<LinkId> {
        self.consumers.iter().map(|c| c.id()).collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Buffered messages, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &BrokerMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// No consumers and no buffered messages.
    pub fn is_idle(&self) -> bool {
        self.consumers.is_empty() && self.messages.is_empty()
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue '{}'", self.address)
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("address", &self.address)
            .field("messages", &self.messages.len())
            .field("consumers", &self.consumer_ids())
            .finish()
    }
}
