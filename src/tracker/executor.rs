//! Shared tick state and the scheduler task executor
//!
//! [`TrackerCore`] holds everything lane tasks touch. The scheduler itself
//! lives outside of it so a [`TickExecutor`] can borrow the core mutably
//! while the scheduler drives it.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use super::destroy::DestroyBacklog;
use super::grid::ChunkGridIndex;
use super::observer::ObserverTrackingState;
use super::packet::{ObserverPacketQueue, PacketPriority, PushOutcome, QueuedPacket};
use super::scheduler::{
    DestroyTask, LaneQueues, MetadataTask, SchedulerTask, SpawnTask, TaskExecutor, VisualUpdate,
};
use super::shedding::SheddingState;
use super::tokens::{VisualTokenService, VisualTombstoneService};
use super::visual::{TrackedVisual, UpdateThresholds};
use super::{transform, visibility, ObserverId, ObserverView, Tick, VisualId};
use crate::config::TrackerConfig;
use crate::net::protocol::EncodeError;
use crate::net::transport::{Packet, PacketFactory};

/// Monotonic counters accumulated over the tracker's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerCounters {
    /// Packets discarded: stale tokens, offline observers, rejected pushes
    pub dropped_packets: u64,
    /// Updates discarded before reaching a queue (shedding, exits)
    pub dropped_updates: u64,
    /// Teleports replaced by a newer one still queued
    pub coalesced_packets: u64,
    /// Tasks whose observer or visual was gone when they ran
    pub skipped_tasks: u64,
    /// Candidate or visible ids whose visual was already unregistered
    pub vanished_visuals: u64,
    pub encode_failures: u64,
    /// Moves at MID/FAR that NEAR rules would have sent
    pub lod_skipped_updates: u64,
    pub lod_skipped_metadata_updates: u64,
    pub transform_checks_skipped_due_budget: u64,
    /// Physics updates ignored because the visual was tombstoned or unknown
    pub ignored_updates: u64,
    pub spawns_queued: u64,
    pub destroys_queued: u64,
}

/// Per-tick state shared by the driver, lane tasks and flush
#[derive(Debug)]
pub(crate) struct TrackerCore {
    pub visuals: FxHashMap<VisualId, TrackedVisual>,
    pub grid: ChunkGridIndex,
    pub tokens: VisualTokenService,
    pub tombstones: VisualTombstoneService,
    pub observers: FxHashMap<ObserverId, ObserverTrackingState>,
    /// Observer views supplied for the current tick, online only
    pub frames: FxHashMap<ObserverId, ObserverView>,
    pub queues: FxHashMap<ObserverId, ObserverPacketQueue>,
    pub backlog: DestroyBacklog,
    pub counters: TrackerCounters,
    pub tick: Tick,
    pub shedding: SheddingState,
    pub thresholds: UpdateThresholds,
}

impl TrackerCore {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            visuals: FxHashMap::default(),
            grid: ChunkGridIndex::new(config.cell_size),
            tokens: VisualTokenService::new(),
            tombstones: VisualTombstoneService::new(),
            observers: FxHashMap::default(),
            frames: FxHashMap::default(),
            queues: FxHashMap::default(),
            backlog: DestroyBacklog::new(config.destroy_backlog_threshold),
            counters: TrackerCounters::default(),
            tick: 0,
            shedding: SheddingState::DISABLED,
            thresholds: UpdateThresholds::from_config(config, 1, 1),
        }
    }
}

/// Runs lane tasks against a borrowed [`TrackerCore`]
pub(crate) struct TickExecutor<'a> {
    pub core: &'a mut TrackerCore,
    pub config: &'a TrackerConfig,
    pub factory: &'a dyn PacketFactory,
}

impl TaskExecutor for TickExecutor<'_> {
    fn execute(&mut self, task: SchedulerTask, lanes: &mut LaneQueues) {
        match task {
            SchedulerTask::Spawn(task) => self.run_spawn(task),
            SchedulerTask::Destroy(task) => self.run_destroy(task),
            SchedulerTask::Visibility { observer } => {
                visibility::run_visibility_slice(self, observer, lanes);
            }
            SchedulerTask::Metadata(MetadataTask::TransformSlice { observer }) => {
                transform::run_transform_slice(self, observer, lanes);
            }
            SchedulerTask::Metadata(MetadataTask::Update(update)) => self.run_update(update),
        }
    }
}

impl TickExecutor<'_> {
    fn run_spawn(&mut self, task: SpawnTask) {
        let core = &mut *self.core;
        let still_visible = core
            .observers
            .get(&task.observer)
            .is_some_and(|state| state.is_visible(task.visual));
        if !still_visible {
            core.counters.skipped_tasks += 1;
            return;
        }
        if !core.tokens.is_current(task.visual, task.token) {
            core.counters.dropped_updates += 1;
            return;
        }
        // The client needs the current metadata together with the spawn
        let metadata = core
            .visuals
            .get(&task.visual)
            .map(|visual| visual.metadata())
            .filter(|payload| !payload.is_empty());
        let encoded = self
            .factory
            .spawn_packet(task.visual, task.kind, task.position, task.orientation)
            .and_then(|spawn| match metadata {
                Some(payload) => {
                    let metadata = self.factory.metadata_packet(task.visual, payload)?;
                    Ok(Packet::bundle(&[spawn, metadata]))
                }
                None => Ok(spawn),
            });
        let packet = match encoded {
            Ok(packet) => packet,
            Err(e) => {
                record_encode_failure(&mut core.counters, task.visual, &e);
                return;
            }
        };
        let bytes = self.factory.estimate_size(&packet);
        let entry = QueuedPacket::for_visual(packet, PacketPriority::Spawn, task.visual, task.token, bytes)
            .with_critical(true);
        if buffer_packet(&mut core.queues, &core.tokens, &mut core.counters, task.observer, entry) {
            core.counters.spawns_queued += 1;
        }
    }

    fn run_destroy(&mut self, task: DestroyTask) {
        let core = &mut *self.core;
        if !core.observers.contains_key(&task.observer) || task.ids.is_empty() {
            core.counters.skipped_tasks += 1;
            return;
        }
        if task.prune_queue {
            if let Some(queue) = core.queues.get_mut(&task.observer) {
                let ids: FxHashSet<VisualId> = task.ids.iter().copied().collect();
                core.counters.dropped_updates += queue.prune_before_bulk_destroy(&ids) as u64;
            }
        }
        let packet = match self.factory.destroy_packet(&task.ids) {
            Ok(packet) => packet,
            Err(e) => {
                record_encode_failure(&mut core.counters, task.ids[0], &e);
                return;
            }
        };
        let bytes = self.factory.estimate_size(&packet);
        let entry = QueuedPacket::destroy(packet, bytes, task.registered_tick);
        if buffer_packet(&mut core.queues, &core.tokens, &mut core.counters, task.observer, entry) {
            core.counters.destroys_queued += task.ids.len() as u64;
        }
    }

    fn run_update(&mut self, update: VisualUpdate) {
        let core = &mut *self.core;
        let still_visible = core
            .observers
            .get(&update.observer)
            .is_some_and(|state| state.is_visible(update.visual));
        if !still_visible {
            core.counters.skipped_tasks += 1;
            return;
        }
        let packet = match (update.transform, update.metadata) {
            (Some(transform), Some(metadata)) => Packet::bundle(&[transform, metadata]),
            (Some(packet), None) | (None, Some(packet)) => packet,
            (None, None) => return,
        };
        let bytes = self.factory.estimate_size(&packet);
        let entry = QueuedPacket::for_visual(packet, PacketPriority::Metadata, update.visual, update.token, bytes)
            .with_critical(update.critical);
        buffer_packet(&mut core.queues, &core.tokens, &mut core.counters, update.observer, entry);
    }
}

/// Push into the observer's outbound queue; false when rejected as stale
pub(crate) fn buffer_packet(
    queues: &mut FxHashMap<ObserverId, ObserverPacketQueue>,
    tokens: &VisualTokenService,
    counters: &mut TrackerCounters,
    observer: ObserverId,
    entry: QueuedPacket,
) -> bool {
    match queues.entry(observer).or_default().push(entry, tokens) {
        PushOutcome::Queued => true,
        PushOutcome::Coalesced => {
            counters.coalesced_packets += 1;
            true
        }
        PushOutcome::Rejected => {
            counters.dropped_packets += 1;
            false
        }
    }
}

/// A visual just left an observer's visible set
///
/// Pending spawn and update work for the pair is pruned and a DESTROY is
/// enqueued in its place.
pub(crate) fn retire_visible(
    queues: &mut FxHashMap<ObserverId, ObserverPacketQueue>,
    counters: &mut TrackerCounters,
    lanes: &mut LaneQueues,
    observer: ObserverId,
    visual: VisualId,
    tick: Tick,
) {
    let queued = queues.get_mut(&observer).map_or(0, |queue| queue.remove_visual(visual));
    let scheduled = lanes.remove_observer_visual(observer, visual);
    counters.dropped_updates += (queued + scheduled) as u64;
    lanes.enqueue_destroy(DestroyTask {
        observer,
        ids: smallvec::smallvec![visual],
        registered_tick: tick,
        prune_queue: false,
    });
}

pub(crate) fn record_encode_failure(counters: &mut TrackerCounters, visual: VisualId, error: &EncodeError) {
    counters.encode_failures += 1;
    warn!("Failed to encode packet for visual {}: {}", visual, error);
}
