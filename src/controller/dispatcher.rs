//! Event dispatch loop
//!
//! Exactly one event is processed to completion (or to a defer point) before
//! the next is dequeued; there is no concurrent reconciliation. Deferred
//! events are redelivered on a jittered exponential backoff, which keeps the
//! retry cadence out of the handlers themselves.

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::controller::charm::{Charm, CharmEvent, Disposition};
use crate::controller::error::BackoffConfig;
use crate::controller::store::StateStore;
use crate::health::HealthState;
use crate::pebble::Pebble;
use crate::resources::ClusterResources;

/// An event plus how many times it has been redelivered.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub event: CharmEvent,
    pub attempt: u32,
}

impl Envelope {
    pub fn new(event: CharmEvent) -> Self {
        Self { event, attempt: 0 }
    }
}

/// Create the event channel the dispatcher drains.
pub fn event_channel() -> (UnboundedSender<Envelope>, UnboundedReceiver<Envelope>) {
    unbounded_channel()
}

/// Drain the event queue until every sender is dropped.
///
/// Deferred events are re-enqueued from a timer task; the queue itself stays
/// single-consumer so event processing never overlaps.
pub async fn run<C, P, S>(
    charm: &mut Charm<C, P, S>,
    rx: &mut UnboundedReceiver<Envelope>,
    tx: UnboundedSender<Envelope>,
    backoff: BackoffConfig,
    health: Option<Arc<HealthState>>,
) where
    C: ClusterResources,
    P: Pebble,
    S: StateStore,
{
    while let Some(envelope) = rx.recv().await {
        let kind = envelope.event.kind();
        if let Some(health) = &health {
            health.record_event(kind);
        }
        match charm.handle(&envelope.event).await {
            Ok(Disposition::Completed) => {
                info!(event = kind, "event completed");
            }
            Ok(Disposition::Deferred) => {
                let delay = backoff.delay_for_attempt(envelope.attempt);
                warn!(
                    event = kind,
                    attempt = envelope.attempt,
                    delay_secs = delay.as_secs_f64(),
                    "event deferred, scheduling redelivery"
                );
                if let Some(health) = &health {
                    health.record_deferred(kind);
                }
                let tx = tx.clone();
                let redelivery = Envelope {
                    event: envelope.event,
                    attempt: envelope.attempt + 1,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // The receiver being gone means we are shutting down.
                    let _ = tx.send(redelivery);
                });
            }
            Err(e) => {
                // Unrecoverable for this event; redelivery would repeat the
                // same failure, so the event is dropped.
                error!(event = kind, error = %e, "event processing failed");
                if let Some(health) = &health {
                    health.record_error(kind);
                }
            }
        }
    }
}
