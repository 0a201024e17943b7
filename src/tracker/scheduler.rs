//! Tick-bounded multi-lane work scheduler
//!
//! Four lanes share a nanosecond budget per tick:
//! - SPAWN and DESTROY (critical) always get the first half of the budget
//! - VISIBILITY and METADATA (secondary) get the other half scaled down by
//!   host load (tick duration and observer latency)
//!
//! Whatever global time is left after all four lanes ran goes back to SPAWN
//! then DESTROY. Work that does not fit is deferred to the next tick, never
//! dropped.

use std::collections::{BTreeMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{DVec3, Quat};
use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use super::tokens::Token;
use super::visual::VisualKind;
use super::{ObserverId, Tick, VisualId};
use crate::config::TrackerConfig;
use crate::net::transport::Packet;

// ============================================================================
// Clock
// ============================================================================

/// Nanosecond time source for budget accounting
pub trait TickClock: Send {
    fn now_nanos(&self) -> u64;
}

/// Wall clock anchored at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock that only moves when told to; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl TickClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Spawn,
    Destroy,
    Visibility,
    Metadata,
}

impl Lane {
    pub const ALL: [Lane; 4] = [Lane::Spawn, Lane::Destroy, Lane::Visibility, Lane::Metadata];

    pub fn name(&self) -> &'static str {
        match self {
            Lane::Spawn => "spawn",
            Lane::Destroy => "destroy",
            Lane::Visibility => "visibility",
            Lane::Metadata => "metadata",
        }
    }
}

/// Deferred spawn; pose and token are captured when the visual entered view
#[derive(Debug, Clone)]
pub struct SpawnTask {
    pub observer: ObserverId,
    pub visual: VisualId,
    pub kind: VisualKind,
    pub token: Token,
    pub position: DVec3,
    pub orientation: Quat,
}

/// Destroy of one or more visuals for one observer
#[derive(Debug, Clone)]
pub struct DestroyTask {
    pub observer: ObserverId,
    pub ids: SmallVec<[VisualId; 4]>,
    pub registered_tick: Tick,
    /// Prune the observer's queue for these ids before enqueueing
    pub prune_queue: bool,
}

/// Stand-alone transform and/or metadata packets for one visual
#[derive(Debug, Clone)]
pub struct VisualUpdate {
    pub observer: ObserverId,
    pub visual: VisualId,
    pub token: Token,
    pub transform: Option<Packet>,
    pub metadata: Option<Packet>,
    pub critical: bool,
}

impl VisualUpdate {
    /// Fold a newer update into this one, newest packet per slot wins
    fn absorb(&mut self, newer: VisualUpdate) {
        self.token = newer.token;
        if newer.transform.is_some() {
            self.transform = newer.transform;
        }
        if newer.metadata.is_some() {
            self.metadata = newer.metadata;
        }
        self.critical |= newer.critical;
    }
}

/// METADATA lane payloads
#[derive(Debug, Clone)]
pub enum MetadataTask {
    /// Run the transform pass for an observer
    TransformSlice { observer: ObserverId },
    Update(VisualUpdate),
}

/// Coalescing key for the METADATA lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKey {
    Transform(ObserverId),
    Visual(ObserverId, VisualId),
}

impl MetadataTask {
    pub fn key(&self) -> MetadataKey {
        match self {
            MetadataTask::TransformSlice { observer } => MetadataKey::Transform(*observer),
            MetadataTask::Update(update) => MetadataKey::Visual(update.observer, update.visual),
        }
    }

    pub fn observer(&self) -> ObserverId {
        match self {
            MetadataTask::TransformSlice { observer } => *observer,
            MetadataTask::Update(update) => update.observer,
        }
    }
}

/// Unit of work handed to the executor
#[derive(Debug, Clone)]
pub enum SchedulerTask {
    Spawn(SpawnTask),
    Destroy(DestroyTask),
    Visibility { observer: ObserverId },
    Metadata(MetadataTask),
}

/// Runs tasks popped by the scheduler; may enqueue follow-up work
pub trait TaskExecutor {
    fn execute(&mut self, task: SchedulerTask, lanes: &mut LaneQueues);
}

// ============================================================================
// Coalescing Queue
// ============================================================================

/// FIFO keyed queue where re-inserting a pending key keeps its position
///
/// Backed by an ordered map of sequence numbers plus a key index, so pops
/// are ordered and lookups by key are O(1).
#[derive(Debug)]
pub struct CoalescingQueue<K, V> {
    order: BTreeMap<u64, K>,
    entries: HashMap<K, (u64, V), FxBuildHasher>,
    next_seq: u64,
}

impl<K: Copy + Eq + Hash, V> CoalescingQueue<K, V> {
    pub fn new() -> Self {
        Self {
            order: BTreeMap::new(),
            entries: HashMap::with_hasher(FxBuildHasher),
            next_seq: 0,
        }
    }

    /// Insert at the tail, or merge into the pending entry; true when merged
    pub fn push_with<F>(&mut self, key: K, value: V, merge: F) -> bool
    where
        F: FnOnce(&mut V, V),
    {
        if let Some((_, existing)) = self.entries.get_mut(&key) {
            merge(existing, value);
            return true;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key);
        self.entries.insert(key, (seq, value));
        false
    }

    pub fn pop_front(&mut self) -> Option<(K, V)> {
        while let Some((_, key)) = self.order.pop_first() {
            if let Some((_, value)) = self.entries.remove(&key) {
                return Some((key, value));
            }
        }
        None
    }

    pub fn front(&self) -> Option<&V> {
        let (_, key) = self.order.first_key_value()?;
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(_, value)| value)
    }

    /// Keep entries matching `keep`; returns how many were removed
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let before = self.entries.len();
        let order = &mut self.order;
        self.entries.retain(|key, (seq, value)| {
            let kept = keep(key, value);
            if !kept {
                order.remove(seq);
            }
            kept
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

impl<K: Copy + Eq + Hash, V> Default for CoalescingQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Lanes
// ============================================================================

#[derive(Debug, Clone)]
struct Stamped<T> {
    enqueued_nanos: u64,
    task: T,
}

/// The four lane queues; handed to executors so tasks can enqueue follow-ups
#[derive(Debug, Default)]
pub struct LaneQueues {
    spawn: VecDeque<Stamped<SpawnTask>>,
    destroy: VecDeque<Stamped<DestroyTask>>,
    visibility: VecDeque<Stamped<ObserverId>>,
    metadata: CoalescingQueue<MetadataKey, Stamped<MetadataTask>>,
    /// Timestamp applied to newly enqueued tasks
    stamp: u64,
    coalesced_total: u64,
}

impl LaneQueues {
    pub fn enqueue_spawn(&mut self, task: SpawnTask) {
        self.spawn.push_back(Stamped {
            enqueued_nanos: self.stamp,
            task,
        });
    }

    pub fn enqueue_destroy(&mut self, task: DestroyTask) {
        self.destroy.push_back(Stamped {
            enqueued_nanos: self.stamp,
            task,
        });
    }

    pub fn enqueue_visibility(&mut self, observer: ObserverId) {
        self.visibility.push_back(Stamped {
            enqueued_nanos: self.stamp,
            task: observer,
        });
    }

    /// Enqueue or coalesce; true when an older pending entry absorbed it
    pub fn enqueue_metadata(&mut self, task: MetadataTask) -> bool {
        let key = task.key();
        let stamped = Stamped {
            enqueued_nanos: self.stamp,
            task,
        };
        let merged = self.metadata.push_with(key, stamped, |pending, newer| {
            match (&mut pending.task, newer.task) {
                (MetadataTask::Update(current), MetadataTask::Update(update)) => current.absorb(update),
                (slot, task) => *slot = task,
            }
        });
        if merged {
            self.coalesced_total += 1;
        }
        merged
    }

    fn pop(&mut self, lane: Lane) -> Option<SchedulerTask> {
        match lane {
            Lane::Spawn => self.spawn.pop_front().map(|s| SchedulerTask::Spawn(s.task)),
            Lane::Destroy => self.destroy.pop_front().map(|s| SchedulerTask::Destroy(s.task)),
            Lane::Visibility => self
                .visibility
                .pop_front()
                .map(|s| SchedulerTask::Visibility { observer: s.task }),
            Lane::Metadata => self
                .metadata
                .pop_front()
                .map(|(_, s)| SchedulerTask::Metadata(s.task)),
        }
    }

    pub fn depth(&self, lane: Lane) -> usize {
        match lane {
            Lane::Spawn => self.spawn.len(),
            Lane::Destroy => self.destroy.len(),
            Lane::Visibility => self.visibility.len(),
            Lane::Metadata => self.metadata.len(),
        }
    }

    pub fn total_depth(&self) -> usize {
        Lane::ALL.iter().map(|lane| self.depth(*lane)).sum()
    }

    pub fn coalesced_total(&self) -> u64 {
        self.coalesced_total
    }

    /// Pending coalesced entry for a key, if any
    pub fn pending_metadata(&self, key: &MetadataKey) -> Option<&MetadataTask> {
        self.metadata.get(key).map(|stamped| &stamped.task)
    }

    /// Drop spawn and update tasks for `visual` captured with an older token
    pub fn invalidate_visual(&mut self, visual: VisualId, current: Token) -> usize {
        let before = self.spawn.len();
        self.spawn
            .retain(|s| !(s.task.visual == visual && s.task.token != current));
        let mut removed = before - self.spawn.len();
        removed += self.metadata.retain(|_, s| match &s.task {
            MetadataTask::Update(update) => !(update.visual == visual && update.token != current),
            MetadataTask::TransformSlice { .. } => true,
        });
        removed
    }

    /// Drop pending spawn and update work for one observer/visual pair
    pub fn remove_observer_visual(&mut self, observer: ObserverId, visual: VisualId) -> usize {
        let before = self.spawn.len();
        self.spawn
            .retain(|s| !(s.task.observer == observer && s.task.visual == visual));
        let mut removed = before - self.spawn.len();
        removed += self
            .metadata
            .retain(|key, _| *key != MetadataKey::Visual(observer, visual));
        removed
    }

    /// Drop every task addressed to `observer`
    pub fn remove_observer(&mut self, observer: ObserverId) -> usize {
        let before = self.spawn.len() + self.destroy.len() + self.visibility.len();
        self.spawn.retain(|s| s.task.observer != observer);
        self.destroy.retain(|s| s.task.observer != observer);
        self.visibility.retain(|s| s.task != observer);
        let mut removed = before - (self.spawn.len() + self.destroy.len() + self.visibility.len());
        removed += self.metadata.retain(|_, s| s.task.observer() != observer);
        removed
    }

    fn oldest_enqueued(&self, lanes: &[Lane]) -> Option<u64> {
        lanes
            .iter()
            .filter_map(|lane| match lane {
                Lane::Spawn => self.spawn.front().map(|s| s.enqueued_nanos),
                Lane::Destroy => self.destroy.front().map(|s| s.enqueued_nanos),
                Lane::Visibility => self.visibility.front().map(|s| s.enqueued_nanos),
                Lane::Metadata => self.metadata.front().map(|s| s.enqueued_nanos),
            })
            .min()
    }

    pub fn clear(&mut self) {
        self.spawn.clear();
        self.destroy.clear();
        self.visibility.clear();
        self.metadata.clear();
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Budget knobs, copied out of [`TrackerConfig`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub max_work_nanos: u64,
    pub secondary_min_scale: f64,
    pub tick_duration_soft: Duration,
    pub tick_duration_hard: Duration,
    pub latency_soft_ms: f64,
    pub latency_hard_ms: f64,
}

impl From<&TrackerConfig> for SchedulerSettings {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            max_work_nanos: config.max_work_nanos_per_tick,
            secondary_min_scale: config.secondary_min_scale,
            tick_duration_soft: config.tick_duration_soft,
            tick_duration_hard: config.tick_duration_hard,
            latency_soft_ms: config.latency_soft_ms,
            latency_hard_ms: config.latency_hard_ms,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

/// Host load observed before a scheduler tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadSample {
    /// Rolling average of host tick duration; zero when unknown
    pub average_tick: Duration,
    /// Mean observer round-trip latency; zero when unknown
    pub average_latency_ms: f64,
}

/// How one tick's budget was divided
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BudgetSplit {
    pub total_nanos: u64,
    pub critical_nanos: u64,
    pub secondary_nanos: u64,
    pub secondary_scale: f64,
}

/// Result of one [`RenderNetworkBudgetScheduler::run_tick`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    pub split: BudgetSplit,
    pub work_nanos: u64,
    /// Tasks executed per lane, indexed like [`Lane::ALL`]
    pub executed: [usize; 4],
    /// Tasks still queued after the tick
    pub deferred: usize,
}

pub struct RenderNetworkBudgetScheduler {
    settings: SchedulerSettings,
    clock: Box<dyn TickClock>,
    lanes: LaneQueues,
    last_report: TickReport,
    total_deferred: u64,
}

impl RenderNetworkBudgetScheduler {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self::with_clock(settings, Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(settings: SchedulerSettings, clock: Box<dyn TickClock>) -> Self {
        Self {
            settings,
            clock,
            lanes: LaneQueues::default(),
            last_report: TickReport::default(),
            total_deferred: 0,
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: SchedulerSettings) {
        self.settings = settings;
    }

    /// Lane access for enqueueing outside of `run_tick`
    pub fn lanes(&mut self) -> &mut LaneQueues {
        self.lanes.stamp = self.clock.now_nanos();
        &mut self.lanes
    }

    pub fn lanes_ref(&self) -> &LaneQueues {
        &self.lanes
    }

    /// Scale applied to the secondary half of the budget
    ///
    /// Each signal maps linearly from 1.0 at its soft threshold down to the
    /// configured minimum at its hard threshold; the lower of the two wins.
    pub fn secondary_scale(&self, load: LoadSample) -> f64 {
        let min_scale = self.settings.secondary_min_scale;
        let tick_scale = interpolate_scale(
            load.average_tick.as_secs_f64(),
            self.settings.tick_duration_soft.as_secs_f64(),
            self.settings.tick_duration_hard.as_secs_f64(),
            min_scale,
        );
        let latency_scale = interpolate_scale(
            load.average_latency_ms,
            self.settings.latency_soft_ms,
            self.settings.latency_hard_ms,
            min_scale,
        );
        tick_scale.min(latency_scale)
    }

    pub fn budget_split(&self, load: LoadSample) -> BudgetSplit {
        let total = self.settings.max_work_nanos;
        let critical = total / 2;
        let scale = self.secondary_scale(load);
        BudgetSplit {
            total_nanos: total,
            critical_nanos: critical,
            secondary_nanos: ((total - critical) as f64 * scale) as u64,
            secondary_scale: scale,
        }
    }

    /// Execute queued work within this tick's budget
    pub fn run_tick<E>(&mut self, executor: &mut E, load: LoadSample) -> TickReport
    where
        E: TaskExecutor + ?Sized,
    {
        let tick_start = self.clock.now_nanos();
        let split = self.budget_split(load);
        let total = split.total_nanos;
        let mut report = TickReport {
            split,
            ..TickReport::default()
        };

        let mut critical_used = 0;
        critical_used += self.run_lane(Lane::Spawn, split.critical_nanos, tick_start, executor, &mut report);
        self.run_lane(
            Lane::Destroy,
            split.critical_nanos.saturating_sub(critical_used),
            tick_start,
            executor,
            &mut report,
        );

        let mut secondary_used = 0;
        secondary_used += self.run_lane(Lane::Visibility, split.secondary_nanos, tick_start, executor, &mut report);
        self.run_lane(
            Lane::Metadata,
            split.secondary_nanos.saturating_sub(secondary_used),
            tick_start,
            executor,
            &mut report,
        );

        // Return unused global time to the critical lanes
        let remaining = total.saturating_sub(self.clock.now_nanos().saturating_sub(tick_start));
        if remaining > 0 {
            self.run_lane(Lane::Spawn, remaining, tick_start, executor, &mut report);
        }
        let remaining = total.saturating_sub(self.clock.now_nanos().saturating_sub(tick_start));
        if remaining > 0 {
            self.run_lane(Lane::Destroy, remaining, tick_start, executor, &mut report);
        }

        report.work_nanos = self.clock.now_nanos().saturating_sub(tick_start);
        report.deferred = self.lanes.total_depth();
        self.total_deferred += report.deferred as u64;
        self.last_report = report;
        report
    }

    fn run_lane<E>(
        &mut self,
        lane: Lane,
        lane_budget: u64,
        tick_start: u64,
        executor: &mut E,
        report: &mut TickReport,
    ) -> u64
    where
        E: TaskExecutor + ?Sized,
    {
        if lane_budget == 0 {
            return 0;
        }
        let slot = lane as usize;
        let mut used = 0u64;
        loop {
            let started = self.clock.now_nanos();
            if started.saturating_sub(tick_start) >= self.settings.max_work_nanos || used >= lane_budget {
                break;
            }
            let Some(task) = self.lanes.pop(lane) else {
                break;
            };
            self.lanes.stamp = started;
            executor.execute(task, &mut self.lanes);
            used += self.clock.now_nanos().saturating_sub(started);
            report.executed[slot] += 1;
        }
        used
    }

    pub fn last_report(&self) -> &TickReport {
        &self.last_report
    }

    pub fn total_deferred(&self) -> u64 {
        self.total_deferred
    }

    pub fn coalesced_total(&self) -> u64 {
        self.lanes.coalesced_total()
    }

    pub fn depth(&self, lane: Lane) -> usize {
        self.lanes.depth(lane)
    }

    pub fn total_depth(&self) -> usize {
        self.lanes.total_depth()
    }

    /// Age of the oldest queued task in any lane
    pub fn oldest_queue_age(&self) -> Duration {
        self.age_of(self.lanes.oldest_enqueued(&Lane::ALL))
    }

    /// Age of the oldest queued destroy
    pub fn oldest_destroy_age(&self) -> Duration {
        self.age_of(self.lanes.oldest_enqueued(&[Lane::Destroy]))
    }

    fn age_of(&self, enqueued: Option<u64>) -> Duration {
        enqueued
            .map(|at| Duration::from_nanos(self.clock.now_nanos().saturating_sub(at)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn invalidate_visual(&mut self, visual: VisualId, current: Token) -> usize {
        self.lanes.invalidate_visual(visual, current)
    }

    pub fn remove_observer_visual(&mut self, observer: ObserverId, visual: VisualId) -> usize {
        self.lanes.remove_observer_visual(observer, visual)
    }

    pub fn remove_observer(&mut self, observer: ObserverId) -> usize {
        self.lanes.remove_observer(observer)
    }

    pub fn clear(&mut self) {
        self.lanes.clear();
        self.last_report = TickReport::default();
        self.total_deferred = 0;
    }
}

/// Linear falloff from 1.0 at `soft` to `min_scale` at `hard`
fn interpolate_scale(value: f64, soft: f64, hard: f64, min_scale: f64) -> f64 {
    if !value.is_finite() || value <= soft {
        return 1.0;
    }
    if value >= hard || hard <= soft {
        return min_scale;
    }
    let t = (value - soft) / (hard - soft);
    1.0 - t * (1.0 - min_scale)
}
