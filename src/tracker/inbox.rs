//! Publish point for transforms produced off the tick thread
//!
//! Physics threads write the latest pose per visual into a shared concurrent
//! map; the tick thread drains it once at the start of every tick. Later
//! publishes for the same visual overwrite earlier ones, except that a
//! critical flag sticks until drained.

use std::sync::Arc;

use dashmap::DashMap;
use glam::{DVec3, Quat};

use super::{VisualId, WorldId};

/// Latest pose reported by physics for one visual
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformUpdate {
    pub visual: VisualId,
    pub world: WorldId,
    pub position: DVec3,
    pub orientation: Quat,
    /// State transition (e.g. sleep/wake) that must force a resync
    pub critical: bool,
}

/// Cloneable handle shared between physics threads and the tracker
#[derive(Debug, Clone, Default)]
pub struct TransformPublisher {
    pending: Arc<DashMap<VisualId, TransformUpdate>>,
}

impl TransformPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the newest pose; never blocks on the tick thread
    pub fn publish(&self, update: TransformUpdate) {
        self.pending
            .entry(update.visual)
            .and_modify(|existing| {
                let critical = existing.critical || update.critical;
                *existing = update;
                existing.critical = critical;
            })
            .or_insert(update);
    }

    pub fn publish_all<I>(&self, updates: I)
    where
        I: IntoIterator<Item = TransformUpdate>,
    {
        for update in updates {
            self.publish(update);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take everything published since the last drain
    pub fn drain(&self) -> Vec<TransformUpdate> {
        let keys: Vec<VisualId> = self.pending.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.pending.remove(&key).map(|(_, update)| update))
            .collect()
    }
}
