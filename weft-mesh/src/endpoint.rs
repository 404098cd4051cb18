//! The public endpoint API.
//!
//! An [`Endpoint`] is one process in the pub/sub mesh. It owns the
//! dispatcher task, listeners, and connectors; applications interact with it
//! through [`Endpoint::publish`], [`Endpoint::subscribe`], and the peering
//! calls.

use crate::connector::{spawn_connector, ConnectorCtx, ConnectorHandle};
use crate::dispatch::{spawn_dispatcher, Event, ProducerQueue};
use crate::queue::Spsc;
use crate::recorder::spawn_recorder;
use crate::transport::{self, LinkSettings};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use weft_core::item::PoolCounters;
use weft_core::{
    telemetry, Config, EndpointId, Error, ItemPool, ItemRef, ItemScope, Message, Result,
    StoreCommand, Topic,
};

struct Inner {
    id: EndpointId,
    config: Arc<Config>,
    events: mpsc::Sender<Event>,
    pool: ItemPool,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    connectors: Mutex<HashMap<String, ConnectorHandle>>,
    next_subscriber_id: AtomicU64,
}

/// One process participating in the pub/sub mesh.
///
/// Cloning is cheap and shares the underlying endpoint.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    /// Create an endpoint from a configuration and start its dispatcher.
    ///
    /// # Errors
    /// Returns an error if the logging sink cannot be created.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        telemetry::init(&config)?;
        let config = Arc::new(config);
        let id = EndpointId::generate();
        let pool = ItemPool::new(config.pool_capacity, config.pool_ceiling);
        let recorder = config
            .recording_directory
            .clone()
            .map(|dir| spawn_recorder(dir, config.output_generator_file_cap));
        let (events, _work) =
            spawn_dispatcher(id, Arc::clone(&config), pool.clone(), recorder);
        let (shutdown, _) = watch::channel(false);
        info!(endpoint = %id, "endpoint started");
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                events,
                pool,
                shutdown,
                closed: AtomicBool::new(false),
                connectors: Mutex::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        })
    }

    /// This endpoint's mesh-wide identifier.
    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    /// The effective configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Item-pool accounting, e.g. for the conservation check at shutdown.
    pub fn pool_counters(&self) -> PoolCounters {
        self.inner.pool.counters()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn enqueue(&self, event: Event) -> Result<()> {
        match self.inner.events.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Backpressure),
            Err(TrySendError::Closed(_)) => Err(Error::Shutdown),
        }
    }

    /// Accept inbound peerings on `host:port`. Port zero asks the OS for an
    /// ephemeral port; the bound port is returned either way.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn listen(&self, host: &str, port: u16) -> Result<u16> {
        self.ensure_open()?;
        let listener = TcpListener::bind((host, port)).await?;
        let bound = listener.local_addr()?.port();
        info!(endpoint = %self.inner.id, host, port = bound, "listening for peers");

        let inner = Arc::clone(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                debug!(%addr, "inbound connection");
                                tokio::spawn(accept_peer(Arc::clone(&inner), stream, addr));
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                            }
                        }
                    }
                }
            }
        });
        Ok(bound)
    }

    /// Establish and maintain a peering with a remote endpoint. The
    /// connector retries with exponential backoff and reports
    /// `peer_unavailable` on the statuses topic once the retry bound is
    /// exhausted; calling `peer` again restarts it.
    ///
    /// # Errors
    /// Returns an error if the address cannot be resolved or the endpoint is
    /// shutting down.
    pub async fn peer(&self, host: &str, port: u16) -> Result<()> {
        self.ensure_open()?;
        let mut addrs = tokio::net::lookup_host((host, port)).await?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::PeerUnavailable { addr: format!("{host}:{port}") })?;

        let ctx = ConnectorCtx {
            local: self.inner.id,
            settings: LinkSettings::from_config(&self.inner.config),
            retry_limit: self.inner.config.connect_retry_limit.max(1),
            handshake_deadline: self.inner.config.dead_after(),
            events: self.inner.events.clone(),
            shutdown: self.inner.shutdown.subscribe(),
        };
        let handle = spawn_connector(addr, ctx);
        let key = format!("{host}:{port}");
        if let Some(old) = self.inner.connectors.lock().insert(key, handle) {
            old.cancel();
        }
        Ok(())
    }

    /// Stop peering with a remote endpoint: cancel its connector and drain
    /// the link.
    ///
    /// # Errors
    /// Returns an error if the endpoint is shutting down.
    pub async fn unpeer(&self, host: &str, port: u16) -> Result<()> {
        self.ensure_open()?;
        let key = format!("{host}:{port}");
        match self.inner.connectors.lock().remove(&key) {
            Some(handle) => handle.cancel(),
            None => debug!(peer = %key, "unpeer for an unknown peer"),
        }
        Ok(())
    }

    /// Subscribe to all topics under the given prefixes.
    ///
    /// # Errors
    /// Returns [`Error::Backpressure`] if the control channel is saturated,
    /// or [`Error::Shutdown`] if the endpoint is terminating.
    pub fn subscribe<I>(&self, topics: I) -> Result<Subscriber>
    where
        I: IntoIterator<Item = Topic>,
    {
        self.ensure_open()?;
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let queue = Spsc::with_capacity(self.inner.config.queue_capacity);
        self.enqueue(Event::Subscribe {
            id,
            topics: topics.into_iter().collect(),
            queue: Arc::clone(&queue),
        })?;
        Ok(Subscriber { id, queue, events: self.inner.events.clone() })
    }

    /// Publish a data message.
    ///
    /// # Errors
    /// Returns [`Error::Backpressure`] when the publish lane is full; the
    /// caller decides whether to retry or drop.
    pub fn publish(&self, topic: Topic, payload: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.enqueue(Event::LocalPublish {
            message: Message::data(topic, payload),
            scope: ItemScope::Routable,
        })
    }

    /// Publish a store command.
    ///
    /// # Errors
    /// Same contract as [`Endpoint::publish`].
    pub fn publish_command(&self, topic: Topic, command: StoreCommand) -> Result<()> {
        self.ensure_open()?;
        self.enqueue(Event::LocalPublish {
            message: Message::command(topic, command),
            scope: ItemScope::Routable,
        })
    }

    /// Create a dedicated publisher for one topic, with its own bounded
    /// queue and send-rate estimate.
    ///
    /// # Errors
    /// Returns an error if the endpoint is terminating.
    pub fn make_publisher(&self, topic: Topic) -> Result<Publisher> {
        self.ensure_open()?;
        let ring = Spsc::with_capacity(self.inner.config.queue_capacity);
        let producer =
            Arc::new(ProducerQueue { topic: topic.clone(), ring: Arc::clone(&ring) });
        self.enqueue(Event::RegisterProducer(producer))?;
        Ok(Publisher { topic, ring })
    }

    /// Gracefully shut the endpoint down: stop connectors and listeners,
    /// send `fin` to every peer, and wait up to the configured deadline for
    /// links to drain. Idempotent.
    ///
    /// # Errors
    /// Currently infallible; the signature leaves room for drain errors.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(endpoint = %self.inner.id, "shutting down");
        for (_, handle) in self.inner.connectors.lock().drain() {
            handle.cancel();
        }
        let _ = self.inner.shutdown.send(true);

        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.events.send(Event::Shutdown { done: done_tx }).await.is_ok() {
            let grace = self.inner.config.shutdown_grace() + self.inner.config.tick() * 4;
            if tokio::time::timeout(grace, done_rx).await.is_err() {
                warn!("shutdown deadline passed before peers drained");
            }
        }
        let counters = self.inner.pool.counters();
        if counters.live > 0 {
            debug!(live = counters.live, "items still referenced at shutdown");
        }
        Ok(())
    }
}

async fn accept_peer(inner: Arc<Inner>, stream: tokio::net::TcpStream, addr: std::net::SocketAddr) {
    let mut stream = stream;
    let settings = LinkSettings::from_config(&inner.config);
    let deadline = inner.config.dead_after();
    match transport::handshake(&mut stream, inner.id, settings.credit_window, deadline).await {
        Ok((hs, decoder)) => {
            let (_handle, task) = transport::spawn_link(
                stream,
                &hs,
                addr,
                decoder,
                settings,
                inner.events.clone(),
                inner.shutdown.subscribe(),
            )
            .await;
            let _ = task.await;
        }
        Err(error) => {
            debug!(%addr, %error, "inbound handshake failed");
            let _ = inner.events.send(Event::EmitError(error)).await;
        }
    }
}

/// A handle to a subscription's item queue.
///
/// Dropping the subscriber unsubscribes and releases pending items.
pub struct Subscriber {
    id: u64,
    queue: Arc<Spsc<ItemRef>>,
    events: mpsc::Sender<Event>,
}

impl Subscriber {
    /// Await the next matching item. Returns `None` once the endpoint shut
    /// down and the queue drained.
    pub async fn recv(&self) -> Option<ItemRef> {
        self.queue.recv().await
    }

    /// Take one item without waiting.
    pub fn try_recv(&self) -> Option<ItemRef> {
        self.queue.pop()
    }

    /// Invoke `f` for each of up to `n` ready items; returns the count.
    pub fn consume<F: FnMut(ItemRef)>(&self, n: usize, f: F) -> usize {
        self.queue.consume(n, f)
    }

    /// Items currently waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Rolling delivery-rate estimate, items per second.
    pub fn rate(&self) -> f64 {
        self.queue.rate()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.events.try_send(Event::Unsubscribe { id: self.id });
        self.queue.close();
    }
}

/// A dedicated publisher bound to one topic.
///
/// `produce` is synchronous and never blocks the dispatcher; `false` means
/// the queue is full and the caller should yield before retrying.
pub struct Publisher {
    topic: Topic,
    ring: Arc<Spsc<Bytes>>,
}

impl Publisher {
    /// The topic this publisher emits on.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Enqueue one payload. Returns `false` when the queue is full or the
    /// endpoint is shutting down.
    pub fn produce(&self, payload: Bytes) -> bool {
        self.ring.produce(payload)
    }

    /// Await free queue space. Returns `false` if the endpoint shut down.
    pub async fn writable(&self) -> bool {
        self.ring.writable().await
    }

    /// Rolling send-rate estimate, items per second.
    pub fn rate(&self) -> f64 {
        self.ring.rate()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.ring.close();
    }
}
