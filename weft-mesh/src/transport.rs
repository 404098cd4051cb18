//! Per-peer stream transport.
//!
//! Each direct peering runs as one task owning the socket. The task speaks
//! the frame protocol, enforces credit-based flow control on items, emits
//! heartbeats, detects sequence gaps and answers NACKs from a bounded
//! retransmit buffer, and drains gracefully on `fin`.
//!
//! Connection states: after the handshake a link starts in `Syncing`, where
//! both sides exchange their full filter and routing snapshot and inbound
//! items are buffered without consuming credit. Receipt of the peer's own
//! filter advertisement moves the link to `Running`. A `fin` from either
//! side, a dispatcher shutdown, or a transport error moves it to `Draining`
//! until buffers are flushed or the hard-close timer fires.

use crate::dispatch::Event;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use weft_core::protocol::{
    protocol_ident, CreditGrant, Frame, FrameDecoder, FrameEncoder, FrameType, GapReport,
    Handshake, NodeMessage, PathWithdrawal, SubscriptionAdvert,
};
use weft_core::{Config, EndpointId, Error, Result};

/// Commands from the dispatcher to a peer link.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    /// Forward an item to the peer. Consumes one credit.
    Forward(NodeMessage),
    /// Send a subscription advertisement.
    Advert(SubscriptionAdvert),
    /// Send a path withdrawal.
    Withdraw(PathWithdrawal),
    /// Begin a graceful drain.
    Fin,
}

/// The dispatcher's handle to one peer link.
#[derive(Debug, Clone)]
pub(crate) struct LinkHandle {
    pub peer: EndpointId,
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<LinkCommand>,
}

/// Timing and flow-control parameters, snapshot from the configuration.
#[derive(Debug, Clone)]
pub(crate) struct LinkSettings {
    pub tick: Duration,
    pub heartbeat_ticks: u32,
    pub dead_ticks: u32,
    pub nack_ticks: u32,
    pub hard_close_ticks: u32,
    pub credit_window: u32,
}

impl LinkSettings {
    pub fn from_config(config: &Config) -> Self {
        let tick = config.tick().max(Duration::from_millis(1));
        let hard_close_ticks =
            (config.shutdown_deadline / config.tick_interval.max(1)).max(1) as u32;
        Self {
            tick,
            heartbeat_ticks: config.heartbeat_interval.max(1),
            dead_ticks: config.heartbeat_interval.max(1) * config.connection_timeout.max(1),
            nack_ticks: config.nack_timeout.max(1),
            hard_close_ticks,
            credit_window: config.initial_credit_window.max(1),
        }
    }

    /// Capacity of the dispatcher-to-link command lane.
    pub fn lane_capacity(&self) -> usize {
        (self.credit_window as usize * 2).max(32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Syncing,
    Running,
    Draining,
}

/// Exchange `hello` frames on a fresh connection.
///
/// Returns the peer's handshake and the decoder holding any bytes that
/// arrived after it, for the link to keep using.
pub(crate) async fn handshake(
    stream: &mut TcpStream,
    local: EndpointId,
    credit_window: u32,
    deadline: Duration,
) -> Result<(Handshake, FrameDecoder)> {
    let ours = Handshake { ident: protocol_ident(), endpoint: local, credit_window };
    stream.write_all(&Frame::hello(&ours)?.encode()).await?;

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];
    let exchange = async {
        loop {
            if let Some(frame) = decoder.next_frame() {
                if frame.frame_type() != FrameType::Hello {
                    return Err(Error::protocol("expected hello as the first frame"));
                }
                return frame.decode_payload::<Handshake>();
            }
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Io { reason: "connection closed during handshake".into() });
            }
            decoder.decode_stream(&buf[..n])?;
        }
    };
    let theirs = tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| Error::Io { reason: "handshake timed out".into() })??;

    if theirs.ident != ours.ident {
        return Err(Error::PeerIncompatible { expected: ours.ident, actual: theirs.ident });
    }
    Ok((theirs, decoder))
}

/// Spawn the link task for a freshly handshaken connection and hand its
/// command lane back. `Event::PeerUp` is enqueued before the link starts,
/// so the dispatcher learns about the peer ahead of any traffic from it.
pub(crate) async fn spawn_link(
    stream: TcpStream,
    peer: &Handshake,
    addr: SocketAddr,
    decoder: FrameDecoder,
    settings: LinkSettings,
    events: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
) -> (LinkHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(settings.lane_capacity());
    let handle = LinkHandle { peer: peer.endpoint, addr, tx };
    let _ = events.send(Event::PeerUp { handle: handle.clone() }).await;
    let link = PeerLink {
        peer: peer.endpoint,
        settings,
        events,
        shutdown,
        encoder: FrameEncoder::new(),
        decoder,
        state: LinkState::Syncing,
        next_seq: 1,
        sent_unacked: VecDeque::new(),
        inflight: 0,
        their_window: peer.credit_window.max(1),
        parked: None,
        expected: 1,
        reorder: BTreeMap::new(),
        gap_ticks: 0,
        nack_sent: false,
        idle_ticks: 0,
        heartbeat_elapsed: 0,
        drain_ticks: 0,
        fin_sent: false,
        sync_buffer: Vec::new(),
    };
    let task = tokio::spawn(link.run(stream, rx));
    (handle, task)
}

struct PeerLink {
    peer: EndpointId,
    settings: LinkSettings,
    events: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    state: LinkState,
    /// Next outbound sequence number.
    next_seq: u64,
    /// Sequenced frames not yet acknowledged, oldest first. Serves NACKs.
    sent_unacked: VecDeque<Frame>,
    /// Unacked item frames; must stay below `their_window`.
    inflight: u32,
    their_window: u32,
    /// An item held back because the peer is out of credit.
    parked: Option<NodeMessage>,
    /// Next expected inbound sequence number.
    expected: u64,
    /// Out-of-order inbound frames awaiting the gap to close.
    reorder: BTreeMap<u64, Frame>,
    gap_ticks: u32,
    nack_sent: bool,
    idle_ticks: u32,
    heartbeat_elapsed: u32,
    drain_ticks: u32,
    fin_sent: bool,
    /// Items received while still syncing.
    sync_buffer: Vec<NodeMessage>,
}

impl PeerLink {
    async fn run(mut self, stream: TcpStream, mut rx: mpsc::Receiver<LinkCommand>) {
        let peer = self.peer;
        let events = self.events.clone();
        let error = match self.drive(stream, &mut rx).await {
            Ok(()) => {
                info!(%peer, "peer link closed");
                None
            }
            Err(e) => {
                warn!(%peer, error = %e, "peer link failed");
                Some(e)
            }
        };
        let _ = events.send(Event::PeerDown { peer, error }).await;
    }

    async fn drive(
        &mut self,
        stream: TcpStream,
        rx: &mut mpsc::Receiver<LinkCommand>,
    ) -> Result<()> {
        let (mut read, mut write) = stream.into_split();
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            self.flush_parked(&mut write).await?;
            let draining = self.state == LinkState::Draining;
            tokio::select! {
                cmd = rx.recv(), if self.parked.is_none() && !draining => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &mut write).await?,
                        None => self.begin_drain(&mut write).await?,
                    }
                }
                changed = shutdown.changed(), if !draining => {
                    // A closed shutdown channel means the endpoint is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        self.begin_drain(&mut write).await?;
                    }
                }
                result = read.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        if self.state == LinkState::Draining {
                            return Ok(());
                        }
                        return Err(Error::Io { reason: "connection closed by peer".into() });
                    }
                    self.decoder.decode_stream(&buf[..n])?;
                    while let Some(frame) = self.decoder.next_frame() {
                        if self.handle_frame(frame, &mut write).await? {
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    if self.on_tick(&mut write).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        cmd: LinkCommand,
        write: &mut OwnedWriteHalf,
    ) -> Result<()> {
        match cmd {
            LinkCommand::Forward(msg) => {
                if self.inflight >= self.their_window {
                    self.parked = Some(msg);
                    Ok(())
                } else {
                    self.send_item(msg, write).await
                }
            }
            LinkCommand::Advert(advert) => {
                let seq = self.take_seq();
                let frame = Frame::sub_update(seq, &advert)?;
                self.send_sequenced(frame, write).await
            }
            LinkCommand::Withdraw(withdrawal) => {
                let seq = self.take_seq();
                let frame = Frame::path_update(seq, &withdrawal)?;
                self.send_sequenced(frame, write).await
            }
            LinkCommand::Fin => self.begin_drain(write).await,
        }
    }

    async fn flush_parked(&mut self, write: &mut OwnedWriteHalf) -> Result<()> {
        if self.inflight < self.their_window {
            if let Some(msg) = self.parked.take() {
                self.send_item(msg, write).await?;
            }
        }
        Ok(())
    }

    async fn send_item(&mut self, msg: NodeMessage, write: &mut OwnedWriteHalf) -> Result<()> {
        let seq = self.take_seq();
        let frame = Frame::item(seq, &msg)?;
        self.inflight += 1;
        self.send_sequenced(frame, write).await
    }

    async fn send_sequenced(&mut self, frame: Frame, write: &mut OwnedWriteHalf) -> Result<()> {
        self.sent_unacked.push_back(frame.clone());
        self.write_frame(&frame, write).await
    }

    async fn write_frame(&mut self, frame: &Frame, write: &mut OwnedWriteHalf) -> Result<()> {
        trace!(peer = %self.peer, frame_type = ?frame.frame_type(), seq = frame.sequence(), "send");
        let bytes = self.encoder.encode(frame);
        write.write_all(&bytes).await?;
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Process one inbound frame. Returns `true` once the link is done.
    async fn handle_frame(&mut self, frame: Frame, write: &mut OwnedWriteHalf) -> Result<bool> {
        self.idle_ticks = 0;
        trace!(peer = %self.peer, frame_type = ?frame.frame_type(), seq = frame.sequence(), "recv");
        match frame.frame_type() {
            FrameType::Hello => Err(Error::protocol("unexpected hello after the handshake")),
            FrameType::Heartbeat => Ok(false),
            FrameType::Ack => {
                let grant: CreditGrant = frame.decode_payload()?;
                self.their_window = grant.window.max(1);
                while let Some(front) = self.sent_unacked.front() {
                    if front.sequence() > grant.acked {
                        break;
                    }
                    let acked = self.sent_unacked.pop_front().expect("front exists");
                    if acked.frame_type().consumes_credit() {
                        self.inflight = self.inflight.saturating_sub(1);
                    }
                }
                Ok(false)
            }
            FrameType::Nack => {
                let report: GapReport = frame.decode_payload()?;
                self.handle_nack(report, write).await?;
                Ok(false)
            }
            FrameType::Item | FrameType::SubUpdate | FrameType::PathUpdate | FrameType::Fin => {
                self.handle_sequenced(frame, write).await
            }
        }
    }

    async fn handle_sequenced(
        &mut self,
        frame: Frame,
        write: &mut OwnedWriteHalf,
    ) -> Result<bool> {
        let seq = frame.sequence();
        if seq < self.expected {
            // Duplicate from a retransmission; re-ack so the sender advances.
            self.send_ack(write).await?;
            return Ok(false);
        }
        if seq > self.expected {
            self.reorder.insert(seq, frame);
            return Ok(false);
        }

        let mut fin_seen = self.deliver(frame).await?;
        self.expected += 1;
        while let Some(next) = self.reorder.remove(&self.expected) {
            fin_seen |= self.deliver(next).await?;
            self.expected += 1;
        }
        if self.reorder.is_empty() {
            self.gap_ticks = 0;
            self.nack_sent = false;
        }
        self.send_ack(write).await?;

        if fin_seen {
            if !self.fin_sent {
                let seq = self.take_seq();
                self.write_frame(&Frame::fin(seq), write).await?;
                self.fin_sent = true;
            }
            debug!(peer = %self.peer, "peer finished, closing");
            return Ok(true);
        }
        Ok(false)
    }

    async fn deliver(&mut self, frame: Frame) -> Result<bool> {
        match frame.frame_type() {
            FrameType::Item => {
                let msg: NodeMessage = frame.decode_payload()?;
                if self.state == LinkState::Syncing {
                    self.sync_buffer.push(msg);
                } else {
                    let _ = self
                        .events
                        .send(Event::InboundItem { from: self.peer, item: msg })
                        .await;
                }
                Ok(false)
            }
            FrameType::SubUpdate => {
                let advert: SubscriptionAdvert = frame.decode_payload()?;
                if self.state == LinkState::Syncing && advert.origin == self.peer {
                    self.state = LinkState::Running;
                    debug!(peer = %self.peer, "filters exchanged, link running");
                    for item in self.sync_buffer.drain(..) {
                        let _ = self
                            .events
                            .send(Event::InboundItem { from: self.peer, item })
                            .await;
                    }
                }
                let _ = self
                    .events
                    .send(Event::InboundAdvert { from: self.peer, advert })
                    .await;
                Ok(false)
            }
            FrameType::PathUpdate => {
                let withdrawal: PathWithdrawal = frame.decode_payload()?;
                let _ = self
                    .events
                    .send(Event::InboundWithdrawal { from: self.peer, withdrawal })
                    .await;
                Ok(false)
            }
            FrameType::Fin => Ok(true),
            _ => Err(Error::protocol("unsequenced frame in the sequenced path")),
        }
    }

    async fn handle_nack(
        &mut self,
        report: GapReport,
        write: &mut OwnedWriteHalf,
    ) -> Result<()> {
        let start = report.missing_from;
        let buffered_from = self.sent_unacked.front().map(Frame::sequence);
        match buffered_from {
            Some(first) if first <= start => {}
            _ => return Err(Error::NackExhausted { sequence: start }),
        }
        debug!(peer = %self.peer, start, "resupplying after nack");
        let resend: Vec<Frame> =
            self.sent_unacked.iter().filter(|f| f.sequence() >= start).cloned().collect();
        for frame in &resend {
            self.write_frame(frame, write).await?;
        }
        Ok(())
    }

    async fn send_ack(&mut self, write: &mut OwnedWriteHalf) -> Result<()> {
        let grant =
            CreditGrant { acked: self.expected - 1, window: self.settings.credit_window };
        let frame = Frame::ack(&grant)?;
        self.write_frame(&frame, write).await
    }

    async fn begin_drain(&mut self, write: &mut OwnedWriteHalf) -> Result<()> {
        if self.state == LinkState::Draining {
            return Ok(());
        }
        debug!(peer = %self.peer, "draining peer link");
        self.state = LinkState::Draining;
        self.drain_ticks = 0;
        if !self.fin_sent {
            let seq = self.take_seq();
            self.send_sequenced(Frame::fin(seq), write).await?;
            self.fin_sent = true;
        }
        Ok(())
    }

    /// Advance timers. Returns `true` when a draining link may close.
    async fn on_tick(&mut self, write: &mut OwnedWriteHalf) -> Result<bool> {
        self.idle_ticks += 1;
        if self.idle_ticks >= self.settings.dead_ticks {
            return Err(Error::Io { reason: "peer heartbeat timeout".into() });
        }

        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.settings.heartbeat_ticks {
            self.heartbeat_elapsed = 0;
            self.write_frame(&Frame::heartbeat(), write).await?;
        }

        if !self.reorder.is_empty() && !self.nack_sent {
            self.gap_ticks += 1;
            if self.gap_ticks >= self.settings.nack_ticks {
                let report = GapReport { missing_from: self.expected };
                warn!(peer = %self.peer, missing_from = report.missing_from, "sequence gap, sending nack");
                let frame = Frame::nack(&report)?;
                self.write_frame(&frame, write).await?;
                self.nack_sent = true;
            }
        }

        if self.state == LinkState::Draining {
            self.drain_ticks += 1;
            if self.drain_ticks >= self.settings.hard_close_ticks {
                debug!(peer = %self.peer, "hard close after drain timeout");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = async { listener.accept().await.map(|(s, _)| s) };
        let (a, b) = tokio::join!(connect, accept);
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn handshake_exchanges_identities() {
        let (mut a, mut b) = socket_pair().await;
        let id_a = EndpointId::generate();
        let id_b = EndpointId::generate();
        let deadline = Duration::from_secs(2);

        let (ra, rb) = tokio::join!(
            handshake(&mut a, id_a, 8, deadline),
            handshake(&mut b, id_b, 16, deadline),
        );
        let (hs_b, _) = ra.unwrap();
        let (hs_a, _) = rb.unwrap();
        assert_eq!(hs_b.endpoint, id_b);
        assert_eq!(hs_a.endpoint, id_a);
        assert_eq!(hs_b.credit_window, 16);
        assert_eq!(hs_a.credit_window, 8);
    }

    #[tokio::test]
    async fn handshake_refuses_foreign_protocols() {
        let (mut a, mut b) = socket_pair().await;
        let deadline = Duration::from_secs(2);

        let foreign = Handshake {
            ident: "broker.v99".into(),
            endpoint: EndpointId::generate(),
            credit_window: 4,
        };
        let send_foreign = async {
            b.write_all(&Frame::hello(&foreign).unwrap().encode()).await.unwrap();
            // Keep the socket open long enough for the peer to answer.
            let mut scratch = [0u8; 1024];
            let _ = b.read(&mut scratch).await;
        };
        let (result, ()) = tokio::join!(
            handshake(&mut a, EndpointId::generate(), 8, deadline),
            send_foreign,
        );
        assert!(matches!(result, Err(Error::PeerIncompatible { .. })));
    }

    #[tokio::test]
    async fn handshake_rejects_garbage() {
        let (mut a, mut b) = socket_pair().await;
        let write_garbage = async {
            b.write_all(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
            let mut scratch = [0u8; 1024];
            let _ = b.read(&mut scratch).await;
        };
        let (result, ()) = tokio::join!(
            handshake(&mut a, EndpointId::generate(), 8, Duration::from_secs(2)),
            write_garbage,
        );
        assert!(matches!(result, Err(Error::ProtocolViolation { .. })));
    }
}
