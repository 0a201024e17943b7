//! Interest management and network sync for tracked visuals
//!
//! [`NetworkEntityTracker`] owns every piece of per-tick state: the visual
//! registry and its spatial grid, per-observer interest state, the lane
//! scheduler, outbound packet queues and the token/tombstone services. The
//! host calls [`NetworkEntityTracker::tick`] once per simulation tick with
//! the connected observers; everything else happens inside that call.

pub mod destroy;
mod executor;
pub mod flush;
pub mod grid;
pub mod inbox;
pub mod load;
pub mod observer;
pub mod packet;
pub mod scheduler;
pub mod shedding;
pub mod tokens;
pub mod transform;
pub mod visibility;
pub mod visual;

use std::sync::Arc;
use std::time::Duration;

use glam::{DVec3, Quat};
use rustc_hash::FxHashSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::net::transport::{PacketFactory, PacketSink};

use destroy::{BacklogMetrics, MASS_DESTROY_BATCH};
use executor::{record_encode_failure, retire_visible, TickExecutor, TrackerCore};
use flush::FlushBudget;
use grid::GridStats;
use load::LoadMonitor;
use observer::ObserverTrackingState;
use packet::PacketPriority;
use scheduler::{Lane, MetadataTask, MonotonicClock, RenderNetworkBudgetScheduler, SchedulerSettings, TickClock, TickReport};
use shedding::{BacklogSnapshot, SheddingPolicy};
use tokens::Token;
use visual::{TrackedVisual, UpdateThresholds};

pub use executor::TrackerCounters;
pub use flush::{FlushStats, FlushTotals, PacketFlushProcessor};
pub use inbox::{TransformPublisher, TransformUpdate};
pub use visual::{LodLevel, VisualKind};

/// Stable integer id of a tracked visual
pub type VisualId = u32;

/// Observer (connected client) id
pub type ObserverId = Uuid;

pub type WorldId = Uuid;

/// Tracker tick counter, starts at 1 on the first tick
pub type Tick = u64;

// ============================================================================
// Inputs
// ============================================================================

/// Observer snapshot supplied by the host for one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverView {
    pub id: ObserverId,
    pub world: WorldId,
    pub position: DVec3,
    /// Round-trip latency, feeds the adaptive budget
    pub latency_ms: f64,
    pub online: bool,
}

impl ObserverView {
    pub fn new(id: ObserverId, world: WorldId, position: DVec3) -> Self {
        Self {
            id,
            world,
            position,
            latency_ms: 0.0,
            online: true,
        }
    }
}

/// Everything needed to start tracking a visual
#[derive(Debug, Clone)]
pub struct VisualRegistration {
    pub id: VisualId,
    pub kind: VisualKind,
    pub world: WorldId,
    pub position: DVec3,
    pub orientation: Quat,
    pub metadata: Vec<u8>,
}

impl VisualRegistration {
    pub fn new(id: VisualId, kind: VisualKind, world: WorldId, position: DVec3) -> Self {
        Self {
            id,
            kind,
            world,
            position,
            orientation: Quat::IDENTITY,
            metadata: Vec::new(),
        }
    }
}

// ============================================================================
// Outputs
// ============================================================================

/// What one [`NetworkEntityTracker::tick`] did
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome {
    pub tick: Tick,
    pub scheduler: TickReport,
    pub flush: FlushStats,
}

/// Point-in-time snapshot for metrics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackerStats {
    pub tick: Tick,
    pub visuals: usize,
    pub observers: usize,
    pub tombstones: usize,
    /// Sum of visible set sizes across observers
    pub visible_pairs: usize,
    pub queued_packets: usize,
    pub counters: TrackerCounters,
    pub scheduler: TickReport,
    /// Lane depths, indexed like [`Lane::ALL`]
    pub lane_depths: [usize; 4],
    pub scheduler_deferred_total: u64,
    pub coalesced_tasks: u64,
    pub oldest_queue_age: Duration,
    pub backlog: BacklogMetrics,
    /// Ticks since the oldest still-pending unregister
    pub destroy_backlog_age_ticks: u64,
    pub shedding_intensity: u8,
    pub flush: FlushStats,
    pub flush_totals: FlushTotals,
    pub grid: GridStats,
}

// ============================================================================
// Tracker
// ============================================================================

pub struct NetworkEntityTracker {
    config: TrackerConfig,
    factory: Arc<dyn PacketFactory>,
    core: TrackerCore,
    scheduler: RenderNetworkBudgetScheduler,
    flush: PacketFlushProcessor,
    load: LoadMonitor,
    publisher: TransformPublisher,
    shedding_policy: SheddingPolicy,
}

impl NetworkEntityTracker {
    pub fn new(config: TrackerConfig, factory: Arc<dyn PacketFactory>) -> Self {
        Self::with_clock(config, factory, Box::new(MonotonicClock::new()))
    }

    /// Tracker whose scheduler budget is measured with `clock`
    pub fn with_clock(config: TrackerConfig, factory: Arc<dyn PacketFactory>, clock: Box<dyn TickClock>) -> Self {
        let config = config.sanitized();
        Self {
            core: TrackerCore::new(&config),
            scheduler: RenderNetworkBudgetScheduler::with_clock(SchedulerSettings::from(&config), clock),
            flush: PacketFlushProcessor::new(),
            load: LoadMonitor::default(),
            publisher: TransformPublisher::new(),
            shedding_policy: SheddingPolicy::new(config.destroy_backlog_threshold),
            factory,
            config,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn current_tick(&self) -> Tick {
        self.core.tick
    }

    /// Handle physics threads publish transforms through
    pub fn publisher(&self) -> TransformPublisher {
        self.publisher.clone()
    }

    /// Feed the host's own tick duration into the adaptive budget
    pub fn record_host_tick(&mut self, duration: Duration) {
        self.load.record_tick(duration);
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Start tracking a visual; clears any tombstone on its id
    pub fn register(&mut self, registration: VisualRegistration) {
        let core = &mut self.core;
        let id = registration.id;
        core.tombstones.clear_tombstone(id);
        let cell = core.grid.cell_of(registration.position);
        let visual = TrackedVisual::new(
            id,
            registration.kind,
            registration.world,
            registration.position,
            registration.orientation,
            cell,
        )
        .with_metadata(registration.metadata);

        if let Some(previous) = core.visuals.insert(id, visual) {
            core.grid.remove(previous.cell, id);
            debug!("Visual {} re-registered", id);
        }
        core.grid.insert(cell, id);
    }

    pub fn register_batch<I>(&mut self, registrations: I) -> usize
    where
        I: IntoIterator<Item = VisualRegistration>,
    {
        let mut count = 0;
        for registration in registrations {
            self.register(registration);
            count += 1;
        }
        if count >= MASS_DESTROY_BATCH {
            info!("Registered {} visuals ({} tracked)", count, self.core.visuals.len());
        } else {
            debug!("Registered {} visuals", count);
        }
        count
    }

    pub fn unregister(&mut self, id: VisualId) -> bool {
        self.unregister_batch(&[id]) == 1
    }

    /// Stop tracking visuals and queue their destroys
    ///
    /// Each id's token is bumped so anything queued for the old version is
    /// dropped, and a tombstone keeps late physics updates from reviving
    /// it. Observers that could see an id get it in their destroy backlog.
    pub fn unregister_batch(&mut self, ids: &[VisualId]) -> usize {
        let core = &mut self.core;
        let tick = core.tick;
        let expires_at = tick + self.config.tombstone_ttl_ticks;
        let mut removed: Vec<VisualId> = Vec::with_capacity(ids.len());
        let mut invalidated = 0usize;

        for &id in ids {
            let Some(visual) = core.visuals.remove(&id) else {
                continue;
            };
            core.grid.remove(visual.cell, id);
            let token = core.tokens.bump(id);
            invalidated += self.scheduler.invalidate_visual(id, token);
            core.tombstones.mark(id, expires_at);
            removed.push(id);
        }
        if removed.is_empty() {
            return 0;
        }

        if removed.len() >= MASS_DESTROY_BATCH {
            // Set-based sweep instead of one pass per id
            let set: FxHashSet<VisualId> = removed.iter().copied().collect();
            for queue in core.queues.values_mut() {
                invalidated += queue.prune_before_bulk_destroy(&set);
            }
            for (observer, state) in core.observers.iter_mut() {
                let hits: Vec<VisualId> = state.visible_ids().filter(|id| set.contains(id)).collect();
                for id in hits {
                    state.remove_visible(id);
                    core.backlog.add(*observer, id, tick);
                }
            }
            core.backlog.arm_mass_boost();
            info!(
                "Mass unregister of {} visuals, destroy budget boost armed",
                removed.len()
            );
        } else {
            for &id in &removed {
                let token = core.tokens.current(id);
                for queue in core.queues.values_mut() {
                    invalidated += queue.invalidate_visual(id, token);
                }
                for (observer, state) in core.observers.iter_mut() {
                    if state.remove_visible(id) {
                        core.backlog.add(*observer, id, tick);
                    }
                }
            }
        }

        core.counters.dropped_packets += invalidated as u64;
        removed.len()
    }

    /// Overwrite a visual's pose; ignored while tombstoned or unknown
    pub fn update_state(
        &mut self,
        id: VisualId,
        world: WorldId,
        position: DVec3,
        orientation: Quat,
        critical: bool,
    ) -> bool {
        let core = &mut self.core;
        if core.tombstones.is_tombstoned(id, core.tick) {
            core.counters.ignored_updates += 1;
            return false;
        }
        let Some(visual) = core.visuals.get_mut(&id) else {
            core.counters.ignored_updates += 1;
            return false;
        };
        let cell = core.grid.cell_of(position);
        if cell != visual.cell {
            core.grid.move_between(visual.cell, cell, id);
            visual.cell = cell;
        }
        visual.set_pose(world, position, orientation, critical);
        true
    }

    /// Apply drained physics updates; returns how many were accepted
    pub fn apply_transform_updates<I>(&mut self, updates: I) -> usize
    where
        I: IntoIterator<Item = TransformUpdate>,
    {
        updates
            .into_iter()
            .filter(|u| self.update_state(u.visual, u.world, u.position, u.orientation, u.critical))
            .count()
    }

    /// Replace a visual's metadata payload
    pub fn update_metadata(&mut self, id: VisualId, payload: Vec<u8>, critical: bool) -> bool {
        match self.core.visuals.get_mut(&id) {
            Some(visual) => {
                visual.set_metadata(payload, critical);
                true
            }
            None => false,
        }
    }

    /// Resend the current metadata without changing it
    pub fn mark_metadata_dirty(&mut self, id: VisualId, critical: bool) -> bool {
        match self.core.visuals.get_mut(&id) {
            Some(visual) => {
                visual.mark_metadata_dirty(critical);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: VisualId) -> bool {
        self.core.visuals.contains_key(&id)
    }

    pub fn visual(&self, id: VisualId) -> Option<&TrackedVisual> {
        self.core.visuals.get(&id)
    }

    pub fn visual_count(&self) -> usize {
        self.core.visuals.len()
    }

    pub fn token(&self, id: VisualId) -> Token {
        self.core.tokens.current(id)
    }

    pub fn is_tombstoned(&mut self, id: VisualId) -> bool {
        let tick = self.core.tick;
        self.core.tombstones.is_tombstoned(id, tick)
    }

    pub fn observer_state(&self, id: ObserverId) -> Option<&ObserverTrackingState> {
        self.core.observers.get(&id)
    }

    pub fn observer_count(&self) -> usize {
        self.core.observers.len()
    }

    /// Packets waiting in an observer's outbound queue
    pub fn queued_packets(&self, id: ObserverId) -> usize {
        self.core.queues.get(&id).map_or(0, |queue| queue.len())
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Run one tracker tick for the given observers
    ///
    /// Observers missing from `observers` or marked offline lose their
    /// tracking state; their queued packets are dropped at flush.
    pub fn tick(&mut self, observers: &[ObserverView], sink: &mut dyn PacketSink) -> TickOutcome {
        let published = self.publisher.drain();
        if !published.is_empty() {
            self.apply_transform_updates(published);
        }

        let core = &mut self.core;
        core.tick += 1;
        let tick = core.tick;
        core.tombstones.prune_expired(tick);

        for visual in core.visuals.values_mut() {
            if let Err(e) = visual.begin_tick(self.factory.as_ref()) {
                record_encode_failure(&mut core.counters, visual.id, &e);
            }
        }

        // Destroy backlog into the DESTROY lane
        let queued_destroys = queued_destroy_packets(core);
        let backlog = core
            .backlog
            .refresh(self.scheduler.depth(Lane::Destroy) + queued_destroys, self.scheduler.oldest_destroy_age());
        let destroy_tasks = core.backlog.take_tasks();
        if !destroy_tasks.is_empty() {
            let lanes = self.scheduler.lanes();
            for task in destroy_tasks {
                lanes.enqueue_destroy(task);
            }
        }

        // Load shedding
        let shedding = self.shedding_policy.compute(&BacklogSnapshot {
            total_queue_depth: self.scheduler.total_depth(),
            metadata_depth: self.scheduler.depth(Lane::Metadata),
            destroy_depth: self.scheduler.depth(Lane::Destroy),
            pending_destroy_ids: backlog.pending_ids,
            destroy_fast_path: backlog.fast_path_active,
        });
        if shedding != core.shedding {
            if shedding.is_active() {
                info!(
                    "Load shedding intensity {} -> {}",
                    core.shedding.intensity, shedding.intensity
                );
            } else {
                info!("Load shedding off");
            }
            core.shedding = shedding;
            core.thresholds = UpdateThresholds::from_config(
                &self.config,
                shedding.mid_interval_multiplier,
                shedding.far_interval_multiplier,
            );
        }

        // Observer driver
        core.frames.clear();
        let radius = self.config.view_distance_cells();
        let lanes = self.scheduler.lanes();
        for view in observers.iter().filter(|view| view.online) {
            core.frames.insert(view.id, *view);
            let state = core.observers.entry(view.id).or_default();
            state.position = view.position;

            let chunk = core.grid.cell_of(view.position);
            if state.needs_rebuild(chunk, view.world, tick, self.config.full_recalc_interval_ticks) {
                let dropped =
                    state.rebuild_candidates(core.grid.ids_in_window(chunk, radius), chunk, view.world, tick);
                for id in dropped {
                    retire_visible(&mut core.queues, &mut core.counters, lanes, view.id, id, tick);
                }
            }
            if state.needs_visibility_pass() && !state.visibility_queued && !backlog.fast_path_active {
                lanes.enqueue_visibility(view.id);
                state.visibility_queued = true;
            }
            if !state.transform_queued {
                lanes.enqueue_metadata(MetadataTask::TransformSlice { observer: view.id });
                state.transform_queued = true;
            }
        }

        let departed: Vec<ObserverId> = core
            .observers
            .keys()
            .filter(|id| !core.frames.contains_key(id))
            .copied()
            .collect();
        for id in departed {
            core.observers.remove(&id);
            core.backlog.remove_observer(id);
            self.scheduler.remove_observer(id);
            debug!("Stopped tracking observer {}", id);
        }

        // Budgeted lane work
        let load = self
            .load
            .sample(observers.iter().filter(|view| view.online).map(|view| view.latency_ms));
        let mut executor = TickExecutor {
            core: &mut self.core,
            config: &self.config,
            factory: self.factory.as_ref(),
        };
        let report = self.scheduler.run_tick(&mut executor, load);

        // Flush
        let core = &mut self.core;
        let queued_destroys = queued_destroy_packets(core);
        let backlog = core
            .backlog
            .refresh(self.scheduler.depth(Lane::Destroy) + queued_destroys, self.scheduler.oldest_destroy_age());
        let online: FxHashSet<ObserverId> = core.frames.keys().copied().collect();
        let budget = FlushBudget::new(&self.config, backlog.fast_path_active, core.backlog.mass_boost_active());
        let flushed = self.flush.flush(&mut core.queues, &online, &core.tokens, budget, tick, sink);
        core.counters.dropped_packets += flushed.dropped_stale + flushed.dropped_offline;
        core.backlog.end_tick();

        TickOutcome {
            tick,
            scheduler: report,
            flush: flushed,
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Forget an observer: tracking state, queued packets, pending destroys
    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let core = &mut self.core;
        let tracked = core.observers.remove(&id).is_some();
        let dropped = core.queues.remove(&id).map_or(0, |mut queue| queue.clear());
        core.counters.dropped_packets += dropped as u64;
        core.frames.remove(&id);
        core.backlog.remove_observer(id);
        self.scheduler.remove_observer(id);
        if tracked {
            debug!("Removed observer {} ({} queued packets dropped)", id, dropped);
        }
        tracked
    }

    /// Drop every visual, observer and queued packet
    pub fn clear(&mut self) {
        let visuals = self.core.visuals.len();
        let observers = self.core.observers.len();
        self.core = TrackerCore::new(&self.config);
        self.scheduler.clear();
        self.flush.clear();
        self.load.clear();
        self.publisher.drain();
        info!("Tracker cleared ({} visuals, {} observers)", visuals, observers);
    }

    // ========================================================================
    // Stats
    // ========================================================================

    pub fn stats(&self) -> TrackerStats {
        let core = &self.core;
        let oldest_pending = core
            .observers
            .keys()
            .filter_map(|id| core.backlog.pending_for(*id))
            .map(|pending| pending.first_unregister_tick())
            .min();
        TrackerStats {
            tick: core.tick,
            visuals: core.visuals.len(),
            observers: core.observers.len(),
            tombstones: core.tombstones.len(),
            visible_pairs: core.observers.values().map(ObserverTrackingState::visible_len).sum(),
            queued_packets: core.queues.values().map(|queue| queue.len()).sum(),
            counters: core.counters,
            scheduler: *self.scheduler.last_report(),
            lane_depths: Lane::ALL.map(|lane| self.scheduler.depth(lane)),
            scheduler_deferred_total: self.scheduler.total_deferred(),
            coalesced_tasks: self.scheduler.coalesced_total(),
            oldest_queue_age: self.scheduler.oldest_queue_age(),
            backlog: core.backlog.metrics(),
            destroy_backlog_age_ticks: oldest_pending.map_or(0, |first| core.tick.saturating_sub(first)),
            shedding_intensity: core.shedding.intensity,
            flush: *self.flush.last(),
            flush_totals: *self.flush.totals(),
            grid: core.grid.stats(),
        }
    }
}

fn queued_destroy_packets(core: &TrackerCore) -> usize {
    core.queues
        .values()
        .map(|queue| queue.len_of(PacketPriority::Destroy))
        .sum()
}
