//! The core dispatcher.
//!
//! A single task owns the routing table, the peer map, the local subscriber
//! registry, and the item pool. Everything reaches it through one event
//! channel: local publishes, decoded peer traffic, peer lifecycle changes,
//! and control operations. Items fan out to matching local subscriber queues
//! and to the next hops of matching remote destinations; backpressure from
//! one peer only stalls that peer's lane.

use crate::queue::Spsc;
use crate::recorder::RecorderMsg;
use crate::routing::{AdvertOutcome, RoutingTable};
use crate::status::{error_message, Status, StatusCode};
use crate::transport::{LinkCommand, LinkHandle};
use bytes::Bytes;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};
use weft_core::protocol::{NodeMessage, PathWithdrawal, SubscriptionAdvert};
use weft_core::{
    Config, EndpointId, Error, Filter, ItemOrigin, ItemPool, ItemRef, ItemScope, Message, Topic,
};

/// Commands a lane may hold back for a stalled peer before item forwards are
/// shed. Control traffic is never shed.
const LANE_PENDING_CAP: usize = 1024;

/// Everything that can happen to the dispatcher.
#[derive(Debug)]
pub(crate) enum Event {
    LocalPublish { message: Message, scope: ItemScope },
    Subscribe { id: u64, topics: Vec<Topic>, queue: Arc<Spsc<ItemRef>> },
    Unsubscribe { id: u64 },
    RegisterProducer(Arc<ProducerQueue>),
    PeerUp { handle: LinkHandle },
    PeerDown { peer: EndpointId, error: Option<Error> },
    InboundItem { from: EndpointId, item: NodeMessage },
    InboundAdvert { from: EndpointId, advert: SubscriptionAdvert },
    InboundWithdrawal { from: EndpointId, withdrawal: PathWithdrawal },
    EmitStatus(Status),
    EmitError(Error),
    Shutdown { done: oneshot::Sender<()> },
}

/// A publisher's ring, bound to one topic.
#[derive(Debug)]
pub(crate) struct ProducerQueue {
    pub topic: Topic,
    pub ring: Arc<Spsc<Bytes>>,
}

struct PeerLane {
    handle: LinkHandle,
    pending: VecDeque<LinkCommand>,
}

struct LocalSubscriber {
    id: u64,
    filter: Filter,
    queue: Arc<Spsc<ItemRef>>,
}

struct DrainState {
    done: oneshot::Sender<()>,
    deadline: Instant,
}

pub(crate) struct Dispatcher {
    id: EndpointId,
    config: Arc<Config>,
    pool: ItemPool,
    routing: RoutingTable,
    peers: HashMap<EndpointId, PeerLane>,
    subscribers: Vec<LocalSubscriber>,
    local_filter: Filter,
    producers: Vec<Arc<ProducerQueue>>,
    producer_cursor: usize,
    recorder: Option<mpsc::Sender<RecorderMsg>>,
    work: Arc<Notify>,
    drain: Option<DrainState>,
}

/// Spawn the dispatcher task. Returns the event channel and the shared
/// wakeup all producer rings notify.
pub(crate) fn spawn_dispatcher(
    id: EndpointId,
    config: Arc<Config>,
    pool: ItemPool,
    recorder: Option<mpsc::Sender<RecorderMsg>>,
) -> (mpsc::Sender<Event>, Arc<Notify>) {
    let capacity = (config.queue_capacity * 4).max(256);
    let (tx, rx) = mpsc::channel(capacity);
    let work = Arc::new(Notify::new());
    let dispatcher = Dispatcher::new(id, config, pool, recorder, Arc::clone(&work));
    tokio::spawn(dispatcher.run(rx));
    (tx, work)
}

impl Dispatcher {
    fn new(
        id: EndpointId,
        config: Arc<Config>,
        pool: ItemPool,
        recorder: Option<mpsc::Sender<RecorderMsg>>,
        work: Arc<Notify>,
    ) -> Self {
        let routing = RoutingTable::new(id, config.blacklist_age());
        Self {
            id,
            config,
            pool,
            routing,
            peers: HashMap::new(),
            subscribers: Vec::new(),
            local_filter: Filter::new(),
            producers: Vec::new(),
            producer_cursor: 0,
            recorder,
            work,
            drain: None,
        }
    }

    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let work = Arc::clone(&self.work);
        let mut ticker = tokio::time::interval(self.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut sweeper = tokio::time::interval(self.config.blacklist_sweep());
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event);
                    // Round-robin batching: take what is already queued, but
                    // no more than one batch before giving the queues a turn.
                    for _ in 1..self.config.batch_size.max(1) {
                        match events.try_recv() {
                            Ok(event) => self.handle_event(event),
                            Err(_) => break,
                        }
                    }
                }
                _ = work.notified() => {}
                _ = ticker.tick() => {}
                _ = sweeper.tick() => {
                    self.routing.sweep_blacklist(Instant::now());
                }
            }
            self.drain_producers();
            self.flush_lanes();
            if self.check_drain_complete() {
                break;
            }
        }
        debug!(endpoint = %self.id, "dispatcher stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::LocalPublish { message, scope } => self.publish_local(message, scope),
            Event::Subscribe { id, topics, queue } => {
                let filter = Filter::from_topics(topics.iter().cloned());
                self.subscribers.push(LocalSubscriber { id, filter, queue });
                // Internal topics are subscribable but never advertised, so
                // a change to them alone floods nothing.
                let advertised = self.advertised_filter();
                if self.local_filter.extend(topics) && self.advertised_filter() != advertised {
                    self.advertise_local();
                }
            }
            Event::Unsubscribe { id } => {
                if let Some(pos) = self.subscribers.iter().position(|s| s.id == id) {
                    let sub = self.subscribers.swap_remove(pos);
                    sub.queue.close();
                    let advertised = self.advertised_filter();
                    if self.local_filter.shrink(sub.filter.to_topics())
                        && self.advertised_filter() != advertised
                    {
                        self.advertise_local();
                    }
                }
            }
            Event::RegisterProducer(producer) => {
                producer.ring.attach_listener(Arc::clone(&self.work));
                self.producers.push(producer);
            }
            Event::PeerUp { handle } => self.peer_up(handle),
            Event::PeerDown { peer, error } => self.peer_down(peer, error),
            Event::InboundItem { from, item } => self.inbound_item(from, item),
            Event::InboundAdvert { from, advert } => self.inbound_advert(from, advert),
            Event::InboundWithdrawal { from, withdrawal } => {
                self.inbound_withdrawal(from, withdrawal);
            }
            Event::EmitStatus(status) => self.publish_status(status),
            Event::EmitError(error) => self.publish_error(&error),
            Event::Shutdown { done } => self.begin_shutdown(done),
        }
    }

    // -- publish paths -------------------------------------------------------

    fn publish_local(&mut self, message: Message, scope: ItemScope) {
        self.record(&message);
        match self.pool.acquire(message, self.config.initial_ttl, ItemOrigin::Local, scope) {
            Ok(item) => self.dispatch_item(&item, &[]),
            Err(_) => debug!("item pool exhausted, dropping local publish"),
        }
    }

    fn inbound_item(&mut self, from: EndpointId, msg: NodeMessage) {
        if msg.path.contains(&self.id) {
            trace!(%from, "dropping item that already visited this endpoint");
            return;
        }
        if !self.routing.is_direct(from) {
            return;
        }
        let NodeMessage { message, ttl, path } = msg;
        match self.pool.acquire(message, ttl, ItemOrigin::Peer(from), ItemScope::Routable) {
            Ok(item) => self.dispatch_item(&item, &path),
            Err(_) => debug!(%from, "item pool exhausted, dropping inbound item"),
        }
    }

    /// The forwarding rule. `in_path` is the traversal path the item arrived
    /// with; empty for local items.
    fn dispatch_item(&mut self, item: &ItemRef, in_path: &[EndpointId]) {
        let topic = item.topic();

        // Local fan-out first: every matching subscriber gets its own
        // reference.
        let mut shed = 0u32;
        for sub in &self.subscribers {
            if sub.filter.matches(topic) && !sub.queue.produce(item.clone()) {
                shed += 1;
            }
        }
        if shed > 0 {
            trace!(topic = %topic, shed, "subscriber queues full");
        }

        // Internal topics never leave the endpoint.
        if topic.is_internal() {
            return;
        }
        if item.scope() == ItemScope::LocalOnly {
            return;
        }
        if item.ttl() == 0 {
            trace!(topic = %topic, "ttl exhausted, not forwarding");
            return;
        }
        let origin_peer = item.origin().peer();
        if self.config.disable_forwarding && origin_peer.is_some() {
            return;
        }

        // Resolve matching destinations to their next hops, minus the origin
        // and anything already on the path.
        let mut hops: SmallVec<[EndpointId; 4]> = SmallVec::new();
        for dest in self.routing.destinations_matching(topic) {
            let Some(hop) = self.routing.next_hop(dest) else { continue };
            if Some(hop) == origin_peer || in_path.contains(&hop) || hops.contains(&hop) {
                continue;
            }
            hops.push(hop);
        }
        if hops.is_empty() {
            return;
        }

        let mut out_path = Vec::with_capacity(in_path.len() + 1);
        out_path.extend_from_slice(in_path);
        out_path.push(self.id);
        for hop in hops {
            let forward = NodeMessage {
                message: item.message().clone(),
                ttl: item.ttl() - 1,
                path: out_path.clone(),
            };
            self.lane_send(hop, LinkCommand::Forward(forward));
        }
    }

    // -- peer lifecycle ------------------------------------------------------

    fn peer_up(&mut self, handle: LinkHandle) {
        let peer = handle.peer;
        let addr = handle.addr;
        if self.drain.is_some() {
            let _ = handle.tx.try_send(LinkCommand::Fin);
            return;
        }
        if let Some(old) =
            self.peers.insert(peer, PeerLane { handle, pending: VecDeque::new() })
        {
            debug!(%peer, "replacing existing link to peer");
            let _ = old.handle.tx.try_send(LinkCommand::Fin);
        }
        self.routing.peer_connected(peer);
        self.publish_status(Status::new(
            StatusCode::PeerAdded,
            Some(peer),
            format!("peer connected via {addr}"),
        ));

        // Synchronize the newcomer: our own filter, then the full table.
        let version = self.routing.bump_version();
        let own = SubscriptionAdvert {
            origin: self.id,
            filter: self.advertised_filter(),
            version,
            path: Vec::new(),
        };
        self.lane_send(peer, LinkCommand::Advert(own));
        for advert in self.routing.snapshot_adverts() {
            if advert.origin == peer || advert.path.contains(&peer) {
                continue;
            }
            self.lane_send(peer, LinkCommand::Advert(advert));
        }
    }

    fn peer_down(&mut self, peer: EndpointId, error: Option<Error>) {
        if self.peers.remove(&peer).is_none() && !self.routing.is_direct(peer) {
            return;
        }
        let removed = self.routing.peer_disconnected(peer, Instant::now());
        let code = if error.is_some() { StatusCode::PeerLost } else { StatusCode::PeerRemoved };
        self.publish_status(Status::new(code, Some(peer), "peer disconnected"));
        if let Some(error) = &error {
            self.publish_error(error);
        }
        for dest in removed.iter().filter(|d| **d != peer) {
            self.publish_status(Status::new(
                StatusCode::EndpointUnreachable,
                Some(*dest),
                "no remaining route",
            ));
        }

        // Synthesize a withdrawal for everything that was routed via the
        // departed peer.
        if !removed.is_empty() && !self.peers.is_empty() {
            let withdrawal = PathWithdrawal {
                origin: self.id,
                version: self.routing.bump_version(),
                destinations: removed,
                path: Vec::new(),
            };
            let targets: Vec<EndpointId> = self.peers.keys().copied().collect();
            for target in targets {
                self.lane_send(target, LinkCommand::Withdraw(withdrawal.clone()));
            }
        }
    }

    // -- routing updates -----------------------------------------------------

    fn inbound_advert(&mut self, from: EndpointId, advert: SubscriptionAdvert) {
        let origin = advert.origin;
        match self.routing.handle_advert(from, &advert, Instant::now()) {
            Err(violation) => self.close_peer(from, violation),
            Ok(AdvertOutcome::Installed { newly_discovered, rebroadcast }) => {
                if newly_discovered {
                    self.publish_status(Status::new(
                        StatusCode::EndpointDiscovered,
                        Some(origin),
                        "learned a new endpoint",
                    ));
                    // Flood our own subscriptions so the newcomer learns the
                    // way back.
                    self.advertise_local();
                }
                let targets: Vec<EndpointId> = self
                    .peers
                    .keys()
                    .copied()
                    .filter(|p| {
                        *p != from && *p != rebroadcast.origin && !rebroadcast.path.contains(p)
                    })
                    .collect();
                for target in targets {
                    self.lane_send(target, LinkCommand::Advert(rebroadcast.clone()));
                }
            }
            Ok(_) => {}
        }
    }

    fn inbound_withdrawal(&mut self, from: EndpointId, withdrawal: PathWithdrawal) {
        match self.routing.handle_withdrawal(from, &withdrawal, Instant::now()) {
            Err(violation) => self.close_peer(from, violation),
            Ok(outcome) => {
                for dest in &outcome.removed {
                    self.publish_status(Status::new(
                        StatusCode::EndpointUnreachable,
                        Some(*dest),
                        "route withdrawn",
                    ));
                }
                if let Some(onward) = outcome.rebroadcast {
                    let targets: Vec<EndpointId> = self
                        .peers
                        .keys()
                        .copied()
                        .filter(|p| *p != from && *p != onward.origin && !onward.path.contains(p))
                        .collect();
                    for target in targets {
                        self.lane_send(target, LinkCommand::Withdraw(onward.clone()));
                    }
                }
            }
        }
    }

    fn close_peer(&mut self, peer: EndpointId, error: Error) {
        warn!(%peer, %error, "closing peer");
        self.publish_error(&error);
        if let Some(lane) = self.peers.get_mut(&peer) {
            lane.pending.push_back(LinkCommand::Fin);
        }
    }

    // -- local announcements -------------------------------------------------

    fn advertised_filter(&self) -> Vec<Topic> {
        self.local_filter.to_topics().into_iter().filter(|t| !t.is_internal()).collect()
    }

    fn advertise_local(&mut self) {
        let version = self.routing.bump_version();
        let advert = SubscriptionAdvert {
            origin: self.id,
            filter: self.advertised_filter(),
            version,
            path: Vec::new(),
        };
        if let Some(recorder) = &self.recorder {
            let _ = recorder.try_send(RecorderMsg::Topics(advert.filter.clone()));
        }
        let targets: Vec<EndpointId> = self.peers.keys().copied().collect();
        for target in targets {
            self.lane_send(target, LinkCommand::Advert(advert.clone()));
        }
    }

    // -- events on internal topics -------------------------------------------

    fn publish_status(&mut self, status: Status) {
        trace!(code = ?status.code, peer = ?status.peer, "status");
        let message = status.to_message();
        if let Ok(item) =
            self.pool.acquire(message, self.config.initial_ttl, ItemOrigin::Local, ItemScope::LocalOnly)
        {
            self.dispatch_item(&item, &[]);
        }
    }

    fn publish_error(&mut self, error: &Error) {
        let message = error_message(error);
        if let Ok(item) =
            self.pool.acquire(message, self.config.initial_ttl, ItemOrigin::Local, ItemScope::LocalOnly)
        {
            self.dispatch_item(&item, &[]);
        }
    }

    // -- lanes and producer rings --------------------------------------------

    fn lane_send(&mut self, peer: EndpointId, cmd: LinkCommand) {
        let Some(lane) = self.peers.get_mut(&peer) else { return };
        if lane.pending.is_empty() {
            match lane.handle.tx.try_send(cmd) {
                Ok(()) => return,
                Err(TrySendError::Full(cmd)) => lane.pending.push_back(cmd),
                Err(TrySendError::Closed(_)) => {}
            }
            return;
        }
        if lane.pending.len() >= LANE_PENDING_CAP {
            if matches!(cmd, LinkCommand::Forward(_)) {
                trace!(%peer, "lane saturated, shedding item forward");
                return;
            }
        }
        lane.pending.push_back(cmd);
    }

    fn flush_lanes(&mut self) {
        for lane in self.peers.values_mut() {
            while let Some(cmd) = lane.pending.pop_front() {
                match lane.handle.tx.try_send(cmd) {
                    Ok(()) => {}
                    Err(TrySendError::Full(cmd)) => {
                        lane.pending.push_front(cmd);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        lane.pending.clear();
                        break;
                    }
                }
            }
        }
    }

    fn drain_producers(&mut self) {
        if self.producers.is_empty() {
            return;
        }
        self.producers.retain(|p| !(p.ring.is_closed() && p.ring.is_empty()));
        let count = self.producers.len();
        if count == 0 {
            return;
        }
        let batch = self.config.batch_size.max(1);
        for i in 0..count {
            let index = (self.producer_cursor + i) % count;
            let producer = Arc::clone(&self.producers[index]);
            for _ in 0..batch {
                // Leave payloads in the ring while the pool has no headroom;
                // the producer sees sustained backpressure instead of loss.
                if self.pool.live() >= self.pool.ceiling() {
                    return;
                }
                let Some(payload) = producer.ring.pop() else { break };
                let message = Message::data(producer.topic.clone(), payload);
                self.record(&message);
                match self.pool.acquire(
                    message,
                    self.config.initial_ttl,
                    ItemOrigin::Local,
                    ItemScope::Routable,
                ) {
                    Ok(item) => self.dispatch_item(&item, &[]),
                    Err(_) => break,
                }
            }
        }
        self.producer_cursor = (self.producer_cursor + 1) % count;
    }

    fn record(&self, message: &Message) {
        if message.topic().is_internal() {
            return;
        }
        if let Some(recorder) = &self.recorder {
            let _ = recorder.try_send(RecorderMsg::Record(message.clone()));
        }
    }

    // -- shutdown ------------------------------------------------------------

    fn begin_shutdown(&mut self, done: oneshot::Sender<()>) {
        if self.drain.is_some() {
            let _ = done.send(());
            return;
        }
        debug!(endpoint = %self.id, peers = self.peers.len(), "graceful shutdown");
        for producer in &self.producers {
            producer.ring.close();
        }
        for lane in self.peers.values_mut() {
            lane.pending.push_back(LinkCommand::Fin);
        }
        self.drain =
            Some(DrainState { done, deadline: Instant::now() + self.config.shutdown_grace() });
    }

    fn check_drain_complete(&mut self) -> bool {
        let Some(state) = &self.drain else { return false };
        if !self.peers.is_empty() && Instant::now() < state.deadline {
            return false;
        }
        for sub in &self.subscribers {
            sub.queue.close();
        }
        let state = self.drain.take().expect("drain state present");
        let _ = state.done.send(());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::topic::well_known;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    struct Harness {
        dispatcher: Dispatcher,
    }

    impl Harness {
        fn new() -> Self {
            let config = Arc::new(Config::default());
            let pool = ItemPool::new(config.pool_capacity, config.pool_ceiling);
            let dispatcher = Dispatcher::new(
                EndpointId::generate(),
                config,
                pool,
                None,
                Arc::new(Notify::new()),
            );
            Self { dispatcher }
        }

        fn subscribe(&mut self, id: u64, topics: &[&str]) -> Arc<Spsc<ItemRef>> {
            let queue = Spsc::with_capacity(16);
            self.dispatcher.handle_event(Event::Subscribe {
                id,
                topics: topics.iter().map(|s| topic(s)).collect(),
                queue: Arc::clone(&queue),
            });
            queue
        }

        /// Register a fake peer and return the receiving end of its lane.
        fn add_peer(&mut self, peer: EndpointId) -> mpsc::Receiver<LinkCommand> {
            let (tx, rx) = mpsc::channel(64);
            let handle = LinkHandle {
                peer,
                addr: "127.0.0.1:0".parse().unwrap(),
                tx,
            };
            self.dispatcher.handle_event(Event::PeerUp { handle });
            rx
        }

        fn advertise(&mut self, from: EndpointId, origin: EndpointId, filter: &[&str], version: u64, path: &[EndpointId]) {
            self.dispatcher.handle_event(Event::InboundAdvert {
                from,
                advert: SubscriptionAdvert {
                    origin,
                    filter: filter.iter().map(|s| topic(s)).collect(),
                    version,
                    path: path.to_vec(),
                },
            });
        }

        fn drain_lane(rx: &mut mpsc::Receiver<LinkCommand>) -> Vec<LinkCommand> {
            let mut out = Vec::new();
            while let Ok(cmd) = rx.try_recv() {
                out.push(cmd);
            }
            out
        }

        fn forwards(cmds: &[LinkCommand]) -> Vec<&NodeMessage> {
            cmds.iter()
                .filter_map(|c| match c {
                    LinkCommand::Forward(msg) => Some(msg),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn loopback_publish_reaches_matching_subscriber() {
        let mut h = Harness::new();
        let queue = h.subscribe(1, &["a"]);
        let other = h.subscribe(2, &["b"]);

        h.dispatcher.handle_event(Event::LocalPublish {
            message: Message::data(topic("a/b"), Bytes::from_static(b"42")),
            scope: ItemScope::Routable,
        });

        let item = queue.pop().expect("subscriber receives the item");
        assert_eq!(item.topic().as_str(), "a/b");
        assert_eq!(item.message().payload(), Some(&Bytes::from_static(b"42")));
        assert!(queue.pop().is_none(), "exactly one delivery");
        assert!(other.pop().is_none(), "non-matching filter stays empty");
    }

    #[tokio::test]
    async fn items_forward_to_matching_peers_only() {
        let mut h = Harness::new();
        let sub_peer = EndpointId::generate();
        let other_peer = EndpointId::generate();
        let mut sub_rx = h.add_peer(sub_peer);
        let mut other_rx = h.add_peer(other_peer);
        h.advertise(sub_peer, sub_peer, &["x"], 1, &[]);
        h.advertise(other_peer, other_peer, &["y"], 1, &[]);
        let _ = Harness::drain_lane(&mut sub_rx);
        let _ = Harness::drain_lane(&mut other_rx);

        h.dispatcher.handle_event(Event::LocalPublish {
            message: Message::data(topic("x/1"), Bytes::from_static(b"v")),
            scope: ItemScope::Routable,
        });
        h.dispatcher.flush_lanes();

        let sub_cmds = Harness::drain_lane(&mut sub_rx);
        let forwards = Harness::forwards(&sub_cmds);
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].ttl, Config::default().initial_ttl - 1);
        assert_eq!(forwards[0].path, vec![h.dispatcher.id]);

        let other_cmds = Harness::drain_lane(&mut other_rx);
        assert!(Harness::forwards(&other_cmds).is_empty());
    }

    #[tokio::test]
    async fn internal_topics_never_reach_a_lane() {
        let mut h = Harness::new();
        let peer = EndpointId::generate();
        let mut rx = h.add_peer(peer);
        // A peer whose advertised filter names an internal topic outright.
        h.dispatcher.handle_event(Event::InboundAdvert {
            from: peer,
            advert: SubscriptionAdvert {
                origin: peer,
                filter: vec![well_known::STATUSES.clone()],
                version: 1,
                path: Vec::new(),
            },
        });
        let _ = Harness::drain_lane(&mut rx);

        let queue = Spsc::with_capacity(4);
        h.dispatcher.handle_event(Event::Subscribe {
            id: 1,
            topics: vec![well_known::STATUSES.clone()],
            queue: Arc::clone(&queue),
        });

        h.dispatcher.handle_event(Event::LocalPublish {
            message: Message::data(well_known::STATUSES.clone(), Bytes::from_static(b"s")),
            scope: ItemScope::Routable,
        });
        h.dispatcher.flush_lanes();

        assert!(queue.pop().is_some(), "local subscriber sees the internal item");
        let cmds = Harness::drain_lane(&mut rx);
        assert!(Harness::forwards(&cmds).is_empty(), "internal item stayed local");
    }

    #[tokio::test]
    async fn ttl_zero_is_dropped_before_forwarding() {
        let mut h = Harness::new();
        let peer = EndpointId::generate();
        let far = EndpointId::generate();
        let mut rx = h.add_peer(peer);
        h.advertise(peer, far, &["t"], 1, &[peer]);
        let _ = Harness::drain_lane(&mut rx);

        let local = h.subscribe(1, &["t"]);
        let source = EndpointId::generate();
        h.dispatcher.routing.peer_connected(source);
        h.dispatcher.handle_event(Event::InboundItem {
            from: source,
            item: NodeMessage {
                message: Message::data(topic("t"), Bytes::from_static(b"v")),
                ttl: 0,
                path: vec![source],
            },
        });
        h.dispatcher.flush_lanes();

        assert!(local.pop().is_some(), "local delivery still happens at ttl zero");
        let cmds = Harness::drain_lane(&mut rx);
        assert!(Harness::forwards(&cmds).is_empty(), "no forward at ttl zero");
    }

    #[tokio::test]
    async fn items_never_return_to_a_path_member() {
        let mut h = Harness::new();
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let mut rx_a = h.add_peer(a);
        let mut rx_b = h.add_peer(b);
        h.advertise(a, a, &["t"], 1, &[]);
        h.advertise(b, b, &["t"], 1, &[]);
        let _ = Harness::drain_lane(&mut rx_a);
        let _ = Harness::drain_lane(&mut rx_b);

        // An item from A whose path already includes B.
        h.dispatcher.handle_event(Event::InboundItem {
            from: a,
            item: NodeMessage {
                message: Message::data(topic("t"), Bytes::from_static(b"v")),
                ttl: 5,
                path: vec![b, a],
            },
        });
        h.dispatcher.flush_lanes();

        assert!(Harness::forwards(&Harness::drain_lane(&mut rx_a)).is_empty());
        assert!(Harness::forwards(&Harness::drain_lane(&mut rx_b)).is_empty());
    }

    #[tokio::test]
    async fn leaf_mode_does_not_relay() {
        let mut h = Harness::new();
        {
            let config = Arc::get_mut(&mut h.dispatcher.config).unwrap();
            config.disable_forwarding = true;
        }
        let a = EndpointId::generate();
        let b = EndpointId::generate();
        let _rx_a = h.add_peer(a);
        let mut rx_b = h.add_peer(b);
        h.advertise(a, a, &["t"], 1, &[]);
        h.advertise(b, b, &["t"], 1, &[]);
        let _ = Harness::drain_lane(&mut rx_b);

        let local = h.subscribe(1, &["t"]);
        h.dispatcher.handle_event(Event::InboundItem {
            from: a,
            item: NodeMessage {
                message: Message::data(topic("t"), Bytes::from_static(b"v")),
                ttl: 5,
                path: vec![a],
            },
        });
        h.dispatcher.flush_lanes();

        assert!(local.pop().is_some(), "leaf still delivers locally");
        assert!(Harness::forwards(&Harness::drain_lane(&mut rx_b)).is_empty());

        // Locally published items still go out.
        h.dispatcher.handle_event(Event::LocalPublish {
            message: Message::data(topic("t"), Bytes::from_static(b"w")),
            scope: ItemScope::Routable,
        });
        h.dispatcher.flush_lanes();
        assert_eq!(Harness::forwards(&Harness::drain_lane(&mut rx_b)).len(), 1);
    }

    #[tokio::test]
    async fn local_only_scope_stops_at_the_endpoint() {
        let mut h = Harness::new();
        let peer = EndpointId::generate();
        let mut rx = h.add_peer(peer);
        h.advertise(peer, peer, &["t"], 1, &[]);
        let _ = Harness::drain_lane(&mut rx);

        h.dispatcher.handle_event(Event::LocalPublish {
            message: Message::data(topic("t"), Bytes::from_static(b"v")),
            scope: ItemScope::LocalOnly,
        });
        h.dispatcher.flush_lanes();
        assert!(Harness::forwards(&Harness::drain_lane(&mut rx)).is_empty());
    }

    #[tokio::test]
    async fn peer_down_synthesizes_withdrawals() {
        let mut h = Harness::new();
        let gone = EndpointId::generate();
        let stays = EndpointId::generate();
        let far = EndpointId::generate();
        let _rx_gone = h.add_peer(gone);
        let mut rx_stays = h.add_peer(stays);
        h.advertise(gone, gone, &["a"], 1, &[]);
        h.advertise(gone, far, &["b"], 1, &[gone]);
        let _ = Harness::drain_lane(&mut rx_stays);

        h.dispatcher.handle_event(Event::PeerDown { peer: gone, error: None });
        h.dispatcher.flush_lanes();

        let cmds = Harness::drain_lane(&mut rx_stays);
        let withdrawal = cmds
            .iter()
            .find_map(|c| match c {
                LinkCommand::Withdraw(w) => Some(w),
                _ => None,
            })
            .expect("a withdrawal was flooded");
        assert_eq!(withdrawal.origin, h.dispatcher.id);
        assert!(withdrawal.destinations.contains(&gone));
        assert!(withdrawal.destinations.contains(&far));
        assert!(!h.dispatcher.routing.reachable(gone));
        assert!(!h.dispatcher.routing.reachable(far));
    }

    #[tokio::test]
    async fn subscriptions_flood_on_change_only() {
        let mut h = Harness::new();
        let peer = EndpointId::generate();
        let mut rx = h.add_peer(peer);
        let _ = Harness::drain_lane(&mut rx);

        let _q1 = h.subscribe(1, &["a"]);
        let cmds = Harness::drain_lane(&mut rx);
        assert!(
            cmds.iter().any(|c| matches!(c, LinkCommand::Advert(a) if a.origin == h.dispatcher.id)),
            "first subscription advertises"
        );

        // A duplicate subscription does not change the filter.
        let _q2 = h.subscribe(2, &["a"]);
        let cmds = Harness::drain_lane(&mut rx);
        assert!(cmds.is_empty(), "duplicate subscription is silent");
    }
}
