//! Replacement event fan-out
//!
//! When the fee bumper supersedes a variant, confirmation trackers must
//! switch to the new id and external observers may want to record the
//! new payload. Both consumers hang off the bus here: trackers through a
//! broadcast channel, callers through an ordered observer registry with
//! handle-based unsubscription.

use crate::chain::TxId;

use alloy_primitives::Bytes;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// A fee-bump replacement of the active variant for a nonce
#[derive(Debug, Clone)]
pub struct Replacement {
    pub nonce: u64,
    pub old_id: TxId,
    pub old_raw: Bytes,
    pub new_id: TxId,
    pub new_raw: Bytes,
}

/// Opaque handle returned by observer registration, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacementHandle(Uuid);

type ReplacementCallback = Box<dyn Fn(&Replacement) + Send + Sync>;

pub(crate) struct ReplacementBus {
    channel: broadcast::Sender<Replacement>,
    observers: Mutex<Vec<(Uuid, ReplacementCallback)>>,
}

impl ReplacementBus {
    pub fn new(capacity: usize) -> Self {
        let (channel, _) = broadcast::channel(capacity);
        Self {
            channel,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe a confirmation tracker to replacement events
    pub fn subscribe(&self) -> broadcast::Receiver<Replacement> {
        self.channel.subscribe()
    }

    /// Register an observer callback, invoked in registration order
    pub fn register(&self, callback: impl Fn(&Replacement) + Send + Sync + 'static) -> ReplacementHandle {
        let id = Uuid::new_v4();
        self.observers
            .lock()
            .expect("observer registry poisoned")
            .push((id, Box::new(callback)));
        ReplacementHandle(id)
    }

    /// Remove an observer; returns false if the handle was already gone
    pub fn unregister(&self, handle: ReplacementHandle) -> bool {
        let mut observers = self.observers.lock().expect("observer registry poisoned");
        let before = observers.len();
        observers.retain(|(id, _)| *id != handle.0);
        observers.len() < before
    }

    /// Publish a replacement to trackers and observers
    pub fn publish(&self, replacement: Replacement) {
        debug!(
            nonce = replacement.nonce,
            old_id = %replacement.old_id,
            new_id = %replacement.new_id,
            "publishing replacement"
        );

        // No receivers is fine, trackers come and go
        let _ = self.channel.send(replacement.clone());

        let observers = self.observers.lock().expect("observer registry poisoned");
        for (_, callback) in observers.iter() {
            callback(&replacement);
        }
    }
}
