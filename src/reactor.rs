//! Single-owner event loop for the broker core.
//!
//! Link and connection tasks never touch broker state directly. They post
//! [`Event`]s into a channel and one task owning the [`BrokerController`]
//! applies them in arrival order, so queue state needs no locking.

use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::BrokerController;
use crate::error::BrokerError;
use crate::link::{ConnectionId, LinkId, LinkRef, Terminus};
use crate::message::BrokerMessage;
use crate::settlement::Outcome;

/// Reply to a link attach: the address bound on the link.
pub type LinkReply = oneshot::Sender<Result<Option<String>, BrokerError>>;

pub enum Event {
    ListenerReady {
        interface: SocketAddr,
    },
    ConnectionOpening {
        connection: ConnectionId,
        remote_container: String,
    },
    ConnectionOpened {
        connection: ConnectionId,
    },
    ConnectionClosing {
        connection: ConnectionId,
    },
    ConnectionClosed {
        connection: ConnectionId,
    },
    Disconnected {
        connection: ConnectionId,
    },
    LinkOpening {
        connection: ConnectionId,
        link: LinkRef,
        remote: Terminus,
        reply: LinkReply,
    },
    LinkClosing {
        link: LinkId,
    },
    Sendable {
        link: LinkId,
    },
    Message {
        link: LinkId,
        message: BrokerMessage,
    },
    Settled {
        link: LinkId,
        outcome: Outcome,
    },
    /// Messages handed to a consumer link that never reached its peer.
    Requeue {
        address: String,
        messages: Vec<BrokerMessage>,
    },
}

pub type EventSender = mpsc::UnboundedSender<Event>;

pub struct Reactor {
    controller: BrokerController,
    events: mpsc::UnboundedReceiver<Event>,
}

impl Reactor {
    /// Starts the event loop on its own task.
    ///
    /// The loop ends once every [`EventSender`] is dropped and hands the
    /// controller back through the join handle.
    pub fn spawn(controller: BrokerController) -> (EventSender, JoinHandle<BrokerController>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reactor = Reactor {
            controller,
            events: rx,
        };
        (tx, tokio::spawn(reactor.run()))
    }

    async fn run(mut self) -> BrokerController {
        while let Some(event) = self.events.recv().await {
            dispatch(&mut self.controller, event);
        }
        debug!("Event channel closed, reactor stopping");
        self.controller
    }
}

/// Applies one event to the controller.
pub fn dispatch(controller: &mut BrokerController, event: Event) {
    match event {
        Event::ListenerReady { interface } => controller.on_start(interface),
        Event::ConnectionOpening {
            connection,
            remote_container,
        } => controller.on_connection_opening(connection, remote_container),
        Event::ConnectionOpened { connection } => controller.on_connection_opened(connection),
        Event::ConnectionClosing { connection } => controller.on_connection_closing(connection),
        Event::ConnectionClosed { connection } => controller.on_connection_closed(connection),
        Event::Disconnected { connection } => controller.on_disconnected(connection),
        Event::LinkOpening {
            connection,
            link,
            remote,
            reply,
        } => {
            let id = link.id();
            let result = controller.on_link_opening(connection, link, remote);
            if let Err(e) = &result {
                controller
                    .console()
                    .warn(format_args!("Refused link {} on connection {}: {}", id, connection, e));
            }
            // The attaching task may have given up already.
            let _ = reply.send(result);
        }
        Event::LinkClosing { link } => controller.on_link_closing(link),
        Event::Sendable { link } => controller.on_sendable(link),
        Event::Message { link, message } => {
            // The controller already warned about the dropped message.
            let _ = controller.on_message(link, message);
        }
        Event::Settled { link, outcome } => controller.on_settled(link, outcome),
        Event::Requeue { address, messages } => controller.on_requeue(&address, messages),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::Console;
    use crate::link::testing::TestLink;
    use crate::message::testing::message;
    use crate::registry::Retention;

    fn controller() -> BrokerController {
        BrokerController::new(Console::new(true, false), Retention::Retain)
    }

    #[tokio::test]
    async fn test_events_applied_in_order() {
        let (events, handle) = Reactor::spawn(controller());
        let connection = ConnectionId(1);
        let consumer = TestLink::sender(1, 2);

        events
            .send(Event::ConnectionOpening {
                connection,
                remote_container: "client".to_string(),
            })
            .unwrap();

        let (reply, bound) = oneshot::channel();
        events
            .send(Event::LinkOpening {
                connection,
                link: consumer.clone(),
                remote: Terminus::address("q"),
                reply,
            })
            .unwrap();
        assert_eq!(bound.await.unwrap().unwrap().as_deref(), Some("q"));

        let (reply, _bound) = oneshot::channel();
        events
            .send(Event::LinkOpening {
                connection,
                link: TestLink::receiver(2),
                remote: Terminus::address("q"),
                reply,
            })
            .unwrap();
        for id in ["m1", "m2", "m3"] {
            events
                .send(Event::Message {
                    link: LinkId(2),
                    message: message(id),
                })
                .unwrap();
        }
        drop(events);

        let controller = handle.await.unwrap();
        assert_eq!(consumer.received(), vec!["m1", "m2"]);
        assert_eq!(controller.queues().get("q").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeued_messages_precede_later_publishes() {
        let (events, handle) = Reactor::spawn(controller());
        events
            .send(Event::ConnectionOpening {
                connection: ConnectionId(1),
                remote_container: "client".to_string(),
            })
            .unwrap();
        let (reply, _bound) = oneshot::channel();
        events
            .send(Event::LinkOpening {
                connection: ConnectionId(1),
                link: TestLink::receiver(1),
                remote: Terminus::address("q"),
                reply,
            })
            .unwrap();
        events
            .send(Event::Message {
                link: LinkId(1),
                message: message("m3"),
            })
            .unwrap();
        events
            .send(Event::Requeue {
                address: "q".to_string(),
                messages: vec![message("m1"), message("m2")],
            })
            .unwrap();
        drop(events);

        let controller = handle.await.unwrap();
        let ids: Vec<String> = controller
            .queues()
            .get("q")
            .unwrap()
            .messages()
            .map(|m| crate::message::message_id(m).unwrap_or_default())
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_refused_link_reports_error() {
        let (events, handle) = Reactor::spawn(controller());
        let (reply, bound) = oneshot::channel();
        events
            .send(Event::LinkOpening {
                connection: ConnectionId(5),
                link: TestLink::sender(1, 0),
                remote: Terminus::address("q"),
                reply,
            })
            .unwrap();

        assert_eq!(
            bound.await.unwrap(),
            Err(BrokerError::UnknownConnection(ConnectionId(5)))
        );
        drop(events);
        handle.await.unwrap();
    }
}
