//! AMQP 1.0 server that accepts connections and feeds the broker core.
//!
//! Connections, sessions and links are driven by `fe2o3-amqp`. Every
//! lifecycle change is translated into an [`Event`] for the reactor; the
//! broker core answers by binding addresses and by handing messages to
//! [`AmqpLink`] handles, which the per-link tasks then put on the wire.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use fe2o3_amqp::acceptor::{ConnectionAcceptor, LinkAcceptor, LinkEndpoint, SessionAcceptor};
use fe2o3_amqp::link::{Receiver, Sender};
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::definitions::Role;
use fe2o3_amqp::types::messaging::{Body, Source, Target};
use fe2o3_amqp::types::performatives::Attach;
use fe2o3_amqp::types::primitives::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::Config;
use crate::controller::{BrokerController, CONTAINER_ID};
use crate::link::{ConnectionId, Link, LinkId, LinkRef, LinkRole, Terminus};
use crate::message::BrokerMessage;
use crate::reactor::{Event, EventSender, Reactor};
use crate::sasl::PermissiveSaslAcceptor;
use crate::settlement::Outcome;

const MAX_FRAME_SIZE: u32 = 1024 * 1024;
const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024;

/// How long a consumer link waits for peer credit before handing a message
/// back to its queue.
const CREDIT_WAIT: Duration = Duration::from_millis(100);
/// Pause before a stalled consumer link advertises credit again.
const STALL_RETRY: Duration = Duration::from_millis(250);

type Acceptor = LinkAcceptor<fn(Source) -> Option<Source>, fn(Target) -> Option<Target>>;

/// The test broker server.
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    /// Binds the listener on the configured `host:port`.
    pub async fn bind(config: Config) -> Result<Self> {
        let interface = config.interface();
        let listener = TcpListener::bind(&interface)
            .await
            .with_context(|| format!("failed to listen on '{interface}'"))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections with a controller built from the configuration.
    pub async fn run(self) -> Result<()> {
        let controller = BrokerController::from_config(&self.config);
        self.run_with(controller).await
    }

    /// Serves connections, routing every event through `controller`.
    pub async fn run_with(self, controller: BrokerController) -> Result<()> {
        let interface = self.local_addr()?;
        let (events, _reactor) = Reactor::spawn(controller);
        let broker = Broker {
            events,
            ids: Arc::new(IdAllocator::default()),
            link_window: self.config.link_window,
        };
        broker.post(Event::ListenerReady { interface });

        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(peer = %peer, "Connection accepted");

            let broker = broker.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, broker).await {
                    debug!(peer = %peer, error = ?e, "Connection ended");
                }
            });
        }
    }
}

#[derive(Default)]
struct IdAllocator {
    next_connection: AtomicU64,
    next_link: AtomicU64,
}

impl IdAllocator {
    fn connection(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn link(&self) -> LinkId {
        LinkId(self.next_link.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

/// Handle to the reactor shared by every connection task.
#[derive(Clone)]
struct Broker {
    events: EventSender,
    ids: Arc<IdAllocator>,
    link_window: u32,
}

impl Broker {
    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Reactor stopped, event dropped");
        }
    }

    /// Registers a link with the broker core and waits for its bound address.
    async fn open_link(
        &self,
        connection: ConnectionId,
        link: LinkRef,
        remote: Terminus,
    ) -> Result<Option<String>> {
        let (reply, bound) = oneshot::channel();
        self.post(Event::LinkOpening {
            connection,
            link,
            remote,
            reply,
        });
        let bound = bound.await.context("reactor stopped before answering")??;
        Ok(bound)
    }

    fn requeue(&self, address: &str, messages: Vec<BrokerMessage>) {
        if messages.is_empty() {
            return;
        }
        self.post(Event::Requeue {
            address: address.to_string(),
            messages,
        });
    }
}

/// Per-connection state handed to session tasks.
#[derive(Clone)]
struct ConnectionContext {
    id: ConnectionId,
    remote: String,
    broker: Broker,
}

/// Link handle given to the broker core.
///
/// A consumer link holds at most `window` messages that have been handed
/// over but not yet settled by the peer; the remaining window is the credit
/// the core sees. A link whose peer granted no credit in time is stalled
/// and reports none until it retries. Publisher links never advertise
/// credit.
pub struct AmqpLink {
    id: LinkId,
    role: LinkRole,
    connection: String,
    window: u32,
    in_flight: AtomicU32,
    stalled: AtomicBool,
    outbox: Option<mpsc::UnboundedSender<BrokerMessage>>,
}

impl AmqpLink {
    fn consumer(
        id: LinkId,
        connection: String,
        window: u32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            id,
            role: LinkRole::Sender,
            connection,
            window,
            in_flight: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            outbox: Some(tx),
        });
        (link, rx)
    }

    fn publisher(id: LinkId, connection: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            role: LinkRole::Receiver,
            connection,
            window: 0,
            in_flight: AtomicU32::new(0),
            stalled: AtomicBool::new(false),
            outbox: None,
        })
    }

    /// Returns one unit of window after a delivery completed.
    fn complete_one(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::Release);
    }

    /// Takes back every message still waiting in the outbox.
    fn reclaim(&self, outbox: &mut mpsc::UnboundedReceiver<BrokerMessage>) -> Vec<BrokerMessage> {
        let mut parked = Vec::new();
        while let Ok(message) = outbox.try_recv() {
            self.complete_one();
            parked.push(message);
        }
        parked
    }
}

impl Link for AmqpLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn role(&self) -> LinkRole {
        self.role
    }

    fn credit(&self) -> u32 {
        if self.stalled.load(Ordering::Acquire) {
            return 0;
        }
        match &self.outbox {
            Some(outbox) if !outbox.is_closed() => self
                .window
                .saturating_sub(self.in_flight.load(Ordering::Acquire)),
            _ => 0,
        }
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    fn send(&self, message: BrokerMessage) {
        let Some(outbox) = &self.outbox else {
            warn!(link = %self.id, "Message handed to a publisher link, dropped");
            return;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if outbox.send(message).is_err() {
            debug!(link = %self.id, "Link task gone, message dropped");
        }
    }
}

/// Handles a single TCP connection: SASL handshake, AMQP connection, and sessions.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, broker: Broker) -> Result<()> {
    let acceptor = ConnectionAcceptor::builder()
        .container_id(CONTAINER_ID)
        .max_frame_size(MAX_FRAME_SIZE)
        .sasl_acceptor(PermissiveSaslAcceptor)
        .build();

    let mut connection = acceptor.accept(stream).await?;

    let ctx = ConnectionContext {
        id: broker.ids.connection(),
        remote: peer.to_string(),
        broker,
    };
    ctx.broker.post(Event::ConnectionOpening {
        connection: ctx.id,
        remote_container: ctx.remote.clone(),
    });
    ctx.broker.post(Event::ConnectionOpened { connection: ctx.id });

    let session_acceptor = SessionAcceptor::new();
    while let Ok(mut session) = session_acceptor.accept(&mut connection).await {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_session(&mut session, &ctx).await {
                debug!(connection = %ctx.id, error = ?e, "Session ended");
            }
        });
    }

    ctx.broker.post(Event::ConnectionClosing { connection: ctx.id });
    match connection.close().await {
        Ok(()) => ctx.broker.post(Event::ConnectionClosed { connection: ctx.id }),
        Err(e) => {
            debug!(connection = %ctx.id, error = ?e, "Peer already disconnected");
            ctx.broker.post(Event::Disconnected { connection: ctx.id });
        }
    }
    Ok(())
}

/// Accepts incoming attaches on one session and starts a task per link.
async fn handle_session(
    session: &mut SessionHandle<mpsc::Receiver<Attach>>,
    ctx: &ConnectionContext,
) -> Result<()> {
    let link_acceptor: Acceptor = LinkAcceptor::builder()
        .max_message_size(MAX_MESSAGE_SIZE)
        .build();

    while let Some(attach) = session.next_incoming_attach().await {
        let id = ctx.broker.ids.link();
        // The attach role is the peer's: a receiving peer makes this a
        // consumer link, a sending peer a publisher link.
        let attached = match attach.role {
            Role::Receiver => attach_consumer(attach, id, ctx, session, &link_acceptor).await,
            Role::Sender => {
                let attach = with_delivery_count(attach);
                attach_publisher(attach, id, ctx, session, &link_acceptor).await
            }
        };
        if let Err(e) = attached {
            warn!(connection = %ctx.id, link = %id, error = %e, "Link not attached");
        }
    }

    Ok(())
}

/// Some clients omit `initial-delivery-count` on a sending attach, which
/// the link acceptor requires. Missing counts start at zero.
fn with_delivery_count(mut attach: Attach) -> Attach {
    if attach.initial_delivery_count.is_none() {
        debug!(link_name = %attach.name, "Attach without initial-delivery-count, assuming 0");
        attach.initial_delivery_count = Some(0);
    }
    attach
}

/// Resolves the source of a consumer link, then accepts it.
///
/// A dynamic source is answered with the generated address so the peer
/// learns where it is subscribed.
async fn attach_consumer(
    mut attach: Attach,
    id: LinkId,
    ctx: &ConnectionContext,
    session: &mut SessionHandle<mpsc::Receiver<Attach>>,
    acceptor: &Acceptor,
) -> Result<()> {
    let remote = attach
        .source
        .as_ref()
        .map(|source| Terminus {
            address: source.address.clone(),
            dynamic: source.dynamic,
        })
        .unwrap_or_default();

    let (link, outbox) = AmqpLink::consumer(id, ctx.remote.clone(), ctx.broker.link_window);
    let bound = ctx.broker.open_link(ctx.id, link.clone(), remote).await;

    if let Ok(address) = &bound {
        if let Some(source) = attach.source.as_mut() {
            source.address = address.clone();
            source.dynamic = false;
        }
    }

    let endpoint = match acceptor.accept_incoming_attach(attach, session).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            ctx.broker.post(Event::LinkClosing { link: id });
            return Err(anyhow!("failed to accept consumer link: {e:?}"));
        }
    };
    let LinkEndpoint::Sender(sender) = endpoint else {
        ctx.broker.post(Event::LinkClosing { link: id });
        bail!("peer receiver attached as a broker receiver");
    };

    match bound {
        Ok(Some(address)) => {
            debug!(link = %id, address = %address, "Consumer link attached");
            tokio::spawn(run_consumer(sender, link, address, outbox, ctx.broker.clone()));
            Ok(())
        }
        Ok(None) => {
            ctx.broker.post(Event::LinkClosing { link: id });
            let _ = sender.close().await;
            bail!("consumer link bound without an address")
        }
        Err(e) => {
            let _ = sender.close().await;
            Err(e)
        }
    }
}

/// Accepts a publisher link and binds its target address.
async fn attach_publisher(
    attach: Attach,
    id: LinkId,
    ctx: &ConnectionContext,
    session: &mut SessionHandle<mpsc::Receiver<Attach>>,
    acceptor: &Acceptor,
) -> Result<()> {
    let endpoint = acceptor
        .accept_incoming_attach(attach, session)
        .await
        .map_err(|e| anyhow!("failed to accept publisher link: {e:?}"))?;
    let LinkEndpoint::Receiver(receiver) = endpoint else {
        bail!("peer sender attached as a broker sender");
    };

    let target = receiver
        .target()
        .as_ref()
        .and_then(|t| t.address.clone());
    let link = AmqpLink::publisher(id, ctx.remote.clone());

    match ctx
        .broker
        .open_link(ctx.id, link, Terminus { address: target, dynamic: false })
        .await
    {
        Ok(address) => {
            debug!(link = %id, address = ?address, "Publisher link attached");
            tokio::spawn(run_publisher(receiver, id, ctx.broker.clone()));
            Ok(())
        }
        Err(e) => {
            let _ = receiver.close().await;
            Err(e)
        }
    }
}

/// Puts messages handed over by the broker core on the wire.
///
/// A message counts as delivered once its transfer is written. Anything
/// the link took but could not transfer, for lack of peer credit or
/// because the link ended, goes back to the head of its queue.
async fn run_consumer(
    mut sender: Sender,
    link: Arc<AmqpLink>,
    address: String,
    mut outbox: mpsc::UnboundedReceiver<BrokerMessage>,
    broker: Broker,
) {
    let id = link.id();
    broker.post(Event::Sendable { link: id });

    'link: loop {
        let message = tokio::select! {
            next = outbox.recv() => match next {
                Some(message) => message,
                None => break,
            },
            detach_err = sender.on_detach() => {
                debug!(link = %id, error = ?detach_err, "Link detached by peer");
                break;
            }
        };

        let delivery =
            match tokio::time::timeout(CREDIT_WAIT, sender.send_batchable(message.clone())).await {
                Ok(Ok(delivery)) => delivery,
                Ok(Err(e)) => {
                    debug!(link = %id, error = ?e, "Client disconnected");
                    link.complete_one();
                    broker.requeue(&address, vec![message]);
                    break;
                }
                Err(_) => {
                    link.set_stalled(true);
                    link.complete_one();
                    let mut parked = vec![message];
                    parked.extend(link.reclaim(&mut outbox));
                    debug!(link = %id, parked = parked.len(), "No credit from peer, link stalled");
                    broker.requeue(&address, parked);

                    loop {
                        tokio::select! {
                            next = outbox.recv() => match next {
                                Some(late) => {
                                    link.complete_one();
                                    broker.requeue(&address, vec![late]);
                                }
                                None => break 'link,
                            },
                            _ = tokio::time::sleep(STALL_RETRY) => break,
                            detach_err = sender.on_detach() => {
                                debug!(link = %id, error = ?detach_err, "Link detached by peer");
                                break 'link;
                            }
                        }
                    }

                    link.set_stalled(false);
                    broker.post(Event::Sendable { link: id });
                    continue;
                }
            };

        let outcome = tokio::select! {
            outcome = delivery => outcome,
            detach_err = sender.on_detach() => {
                debug!(link = %id, error = ?detach_err, "Link detached before settlement");
                link.complete_one();
                break;
            }
        };
        link.complete_one();
        match outcome {
            Ok(outcome) => {
                broker.post(Event::Settled { link: id, outcome: Outcome::from(&outcome) });
                broker.post(Event::Sendable { link: id });
            }
            Err(e) => {
                debug!(link = %id, error = ?e, "Delivery not settled");
                break;
            }
        }
    }

    // Stop advertising credit before the core learns the link is gone.
    outbox.close();
    broker.requeue(&address, link.reclaim(&mut outbox));
    broker.post(Event::LinkClosing { link: id });
    if let Err(e) = sender.close().await {
        debug!(link = %id, error = ?e, "Consumer link close");
    }
}

/// Accepts published deliveries and passes them to the broker core.
async fn run_publisher(mut receiver: Receiver, id: LinkId, broker: Broker) {
    while let Ok(delivery) = receiver.recv::<Body<Value>>().await {
        let message = delivery.message().clone();
        if let Err(e) = receiver.accept(&delivery).await {
            debug!(link = %id, error = ?e, "Failed to accept delivery");
            break;
        }
        broker.post(Event::Message { link: id, message });
    }

    debug!(link = %id, "Publisher link ended");
    broker.post(Event::LinkClosing { link: id });
    if let Err(e) = receiver.close().await {
        debug!(link = %id, error = ?e, "Publisher link close");
    }
}
