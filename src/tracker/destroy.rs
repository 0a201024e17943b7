//! Pending destroys from unregistered visuals
//!
//! Unregistering a visual queues its id for every observer that could see
//! it. Each tick the pending ids become DESTROY lane tasks. A large backlog
//! switches on the drain fast path, which pauses visibility passes and lets
//! the flush step send extra destroys.

use std::time::Duration;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, info};

use super::scheduler::DestroyTask;
use super::{ObserverId, Tick, VisualId};

/// Bulk unregister size that arms the mass-destroy boost
pub const MASS_DESTROY_BATCH: usize = 64;

/// Ticks the mass-destroy boost stays armed
pub const MASS_DESTROY_BOOST_TICKS: u32 = 2;

/// Ids waiting to be destroyed for one observer
#[derive(Debug, Clone)]
pub struct PendingDestroyState {
    ids: SmallVec<[VisualId; 4]>,
    first_unregister_tick: Tick,
}

impl PendingDestroyState {
    fn new(tick: Tick) -> Self {
        Self {
            ids: SmallVec::new(),
            first_unregister_tick: tick,
        }
    }

    pub fn ids(&self) -> &[VisualId] {
        &self.ids
    }

    pub fn first_unregister_tick(&self) -> Tick {
        self.first_unregister_tick
    }
}

/// Backlog metrics published after each refresh
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BacklogMetrics {
    pub pending_ids: usize,
    pub destroy_queue_depth: usize,
    pub fast_path_active: bool,
    pub oldest_destroy_age: Duration,
    pub mass_boost_ticks: u32,
}

#[derive(Debug)]
pub struct DestroyBacklog {
    pending: FxHashMap<ObserverId, PendingDestroyState>,
    threshold: usize,
    metrics: BacklogMetrics,
}

impl DestroyBacklog {
    pub fn new(threshold: usize) -> Self {
        Self {
            pending: FxHashMap::default(),
            threshold: threshold.max(1),
            metrics: BacklogMetrics::default(),
        }
    }

    pub fn set_threshold(&mut self, threshold: usize) {
        self.threshold = threshold.max(1);
    }

    /// Queue `id` for destruction on `observer`
    pub fn add(&mut self, observer: ObserverId, id: VisualId, tick: Tick) {
        let state = self
            .pending
            .entry(observer)
            .or_insert_with(|| PendingDestroyState::new(tick));
        if !state.ids.contains(&id) {
            state.ids.push(id);
        }
    }

    pub fn pending_for(&self, observer: ObserverId) -> Option<&PendingDestroyState> {
        self.pending.get(&observer)
    }

    pub fn pending_id_count(&self) -> usize {
        self.pending.values().map(|state| state.ids.len()).sum()
    }

    /// Turn every pending state into a destroy task
    ///
    /// Multi-id states become one bulk destroy that first prunes the
    /// observer's queued packets for those ids.
    pub fn take_tasks(&mut self) -> Vec<DestroyTask> {
        self.pending
            .drain()
            .filter(|(_, state)| !state.ids.is_empty())
            .map(|(observer, state)| DestroyTask {
                observer,
                prune_queue: state.ids.len() > 1,
                ids: state.ids,
                registered_tick: state.first_unregister_tick,
            })
            .collect()
    }

    pub fn arm_mass_boost(&mut self) {
        self.metrics.mass_boost_ticks = MASS_DESTROY_BOOST_TICKS;
    }

    pub fn mass_boost_active(&self) -> bool {
        self.metrics.mass_boost_ticks > 0
    }

    /// Count down the mass-destroy boost at the end of a tick
    pub fn end_tick(&mut self) {
        self.metrics.mass_boost_ticks = self.metrics.mass_boost_ticks.saturating_sub(1);
    }

    /// Recompute backlog metrics and the fast path flag
    pub fn refresh(&mut self, destroy_queue_depth: usize, oldest_destroy_age: Duration) -> BacklogMetrics {
        let pending_ids = self.pending_id_count();
        let active = pending_ids >= self.threshold || destroy_queue_depth >= self.threshold;
        if active != self.metrics.fast_path_active {
            if active {
                info!(
                    "Destroy drain fast path on: {} pending ids, {} queued destroys",
                    pending_ids, destroy_queue_depth
                );
            } else {
                debug!("Destroy drain fast path off");
            }
        }
        self.metrics.pending_ids = pending_ids;
        self.metrics.destroy_queue_depth = destroy_queue_depth;
        self.metrics.fast_path_active = active;
        self.metrics.oldest_destroy_age = oldest_destroy_age;
        self.metrics
    }

    pub fn is_fast_path_active(&self) -> bool {
        self.metrics.fast_path_active
    }

    pub fn metrics(&self) -> BacklogMetrics {
        self.metrics
    }

    pub fn remove_observer(&mut self, observer: ObserverId) -> Option<PendingDestroyState> {
        self.pending.remove(&observer)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.metrics = BacklogMetrics::default();
    }
}
