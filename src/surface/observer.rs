//! Change observer: turns raw mutation batches into coalesced change events.
//!
//! Each underlying callback may deliver several mutation records; they are
//! collapsed into a single [`ChangeEvent`]. A forwarder task owns the raw
//! receiver; dropping or disconnecting the [`Subscription`] aborts it.
//! Reconnecting is just `connect()` again, so state held by the caller (the
//! dedup cache in particular) survives a reconnect.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ListKind, MutationBatch, ObservationLayer, SurfaceNode};

/// Coalesced added/removed nodes from one underlying callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ListKind,
    pub added: Vec<SurfaceNode>,
    pub removed: Vec<SurfaceNode>,
}

/// Collapse one callback's mutation records into a single event.
///
/// Returns `None` when the batch added and removed nothing.
pub fn coalesce(kind: ListKind, batch: MutationBatch) -> Option<ChangeEvent> {
    let mut added = Vec::new();
    let mut removed = Vec::new();
    for mutation in batch {
        added.extend(mutation.added);
        removed.extend(mutation.removed);
    }
    if added.is_empty() && removed.is_empty() {
        return None;
    }
    Some(ChangeEvent {
        kind,
        added,
        removed,
    })
}

/// Connects to the observation layer's live lists.
#[derive(Clone)]
pub struct ChangeObserver {
    observation: Arc<dyn ObservationLayer>,
}

impl ChangeObserver {
    pub fn new(observation: Arc<dyn ObservationLayer>) -> Self {
        Self { observation }
    }

    /// Subscribe to a live list. `None` if the surface has no change source.
    pub fn connect(&self, kind: ListKind) -> Option<Subscription> {
        let Some(mut raw_rx) = self.observation.subscribe_list(kind) else {
            info!(?kind, "No change source available, caller must poll");
            return None;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(batch) = raw_rx.recv().await {
                let Some(event) = coalesce(kind, batch) else {
                    continue;
                };
                if tx.send(event).is_err() {
                    debug!(?kind, "Subscription receiver dropped, stopping forwarder");
                    break;
                }
            }
            debug!(?kind, "Change source closed");
        });

        debug!(?kind, "Subscribed to list changes");
        Some(Subscription {
            kind,
            rx,
            forwarder,
        })
    }
}

/// A live subscription to one list.
pub struct Subscription {
    kind: ListKind,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub fn kind(&self) -> ListKind {
        self.kind
    }

    /// Next coalesced event. `None` once the change source is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Tear down the subscription.
    pub fn disconnect(self) {
        debug!(kind = ?self.kind, "Disconnecting subscription");
        // Drop aborts the forwarder.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
