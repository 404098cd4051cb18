//! Outbound peering: dial configured addresses with exponential backoff,
//! handshake, and keep the link alive until canceled.
//!
//! Backoff starts at one second, doubles up to a minute, and carries ±20 %
//! jitter. After the configured retry bound the connector reports the peer
//! unavailable on the statuses topic and stops; calling
//! [`crate::Endpoint::peer`] again restarts it.

use crate::dispatch::Event;
use crate::status::{Status, StatusCode};
use crate::transport::{self, LinkCommand, LinkSettings};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use weft_core::{EndpointId, Error};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.2;

/// Cancellation handle for one connector task.
#[derive(Debug)]
pub(crate) struct ConnectorHandle {
    cancel: watch::Sender<bool>,
}

impl ConnectorHandle {
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Everything a connector needs besides the target address.
#[derive(Clone)]
pub(crate) struct ConnectorCtx {
    pub local: EndpointId,
    pub settings: LinkSettings,
    pub retry_limit: u32,
    pub handshake_deadline: Duration,
    pub events: mpsc::Sender<Event>,
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) fn spawn_connector(addr: SocketAddr, ctx: ConnectorCtx) -> ConnectorHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(run(addr, ctx, cancel_rx));
    ConnectorHandle { cancel: cancel_tx }
}

async fn run(addr: SocketAddr, ctx: ConnectorCtx, mut cancel: watch::Receiver<bool>) {
    let mut shutdown = ctx.shutdown.clone();
    let mut failures = 0u32;
    let mut delay = BACKOFF_BASE;

    loop {
        let canceled = *cancel.borrow() || cancel.has_changed().is_err();
        let stopping = *shutdown.borrow() || shutdown.has_changed().is_err();
        if canceled || stopping {
            break;
        }

        match TcpStream::connect(addr).await {
            Ok(mut stream) => {
                match transport::handshake(
                    &mut stream,
                    ctx.local,
                    ctx.settings.credit_window,
                    ctx.handshake_deadline,
                )
                .await
                {
                    Ok((hs, decoder)) => {
                        failures = 0;
                        delay = BACKOFF_BASE;
                        info!(peer = %hs.endpoint, %addr, "peer connected");
                        let (handle, mut task) = transport::spawn_link(
                            stream,
                            &hs,
                            addr,
                            decoder,
                            ctx.settings.clone(),
                            ctx.events.clone(),
                            ctx.shutdown.clone(),
                        )
                        .await;
                        tokio::select! {
                            _ = &mut task => {}
                            _ = cancel.changed() => {
                                let _ = handle.tx.send(LinkCommand::Fin).await;
                                let _ = task.await;
                            }
                        }
                        // Transport errors resume retrying; the link already
                        // reported PeerDown to the dispatcher.
                        failures += 1;
                    }
                    Err(error @ Error::PeerIncompatible { .. }) => {
                        warn!(%addr, %error, "peer speaks a different protocol, giving up");
                        let _ = ctx.events.send(Event::EmitError(error)).await;
                        break;
                    }
                    Err(error) => {
                        debug!(%addr, %error, "handshake failed");
                        failures += 1;
                    }
                }
            }
            Err(error) => {
                failures += 1;
                debug!(%addr, %error, attempt = failures, "connect failed");
            }
        }

        if failures >= ctx.retry_limit {
            warn!(%addr, attempts = failures, "peer unavailable, stopping connector");
            let status = Status::new(StatusCode::PeerUnavailable, None, addr.to_string());
            let _ = ctx.events.send(Event::EmitStatus(status)).await;
            let _ = ctx
                .events
                .send(Event::EmitError(Error::PeerUnavailable { addr: addr.to_string() }))
                .await;
            break;
        }

        let wait = jittered(delay);
        delay = (delay * 2).min(BACKOFF_CAP);
        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            _ = cancel.changed() => break,
            _ = shutdown.changed() => break,
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let wait = jittered(Duration::from_secs(10));
            assert!(wait >= Duration::from_secs(8));
            assert!(wait <= Duration::from_secs(12));
        }
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let mut delay = BACKOFF_BASE;
        let mut schedule = Vec::new();
        for _ in 0..8 {
            schedule.push(delay);
            delay = (delay * 2).min(BACKOFF_CAP);
        }
        assert_eq!(schedule[0], Duration::from_secs(1));
        assert_eq!(schedule[5], Duration::from_secs(32));
        assert_eq!(schedule[7], Duration::from_secs(60));
    }
}
