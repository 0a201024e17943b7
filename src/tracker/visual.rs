//! Per-visual transform state and LOD sync baselines
//!
//! A [`TrackedVisual`] holds the latest pose published by physics plus one
//! baseline per LOD tier recording what observers at that tier were last
//! sent. Update decisions compare the live pose against a tier baseline and
//! only advance the baseline for components actually sent.

use glam::{DVec3, Quat};
use serde::{Deserialize, Serialize};

use super::grid::CellKey;
use super::{Tick, VisualId, WorldId};
use crate::config::TrackerConfig;
use crate::net::protocol::EncodeError;
use crate::net::transport::{Packet, PacketFactory};

// ============================================================================
// Value Types
// ============================================================================

/// Host-defined visual type, forwarded verbatim in spawn packets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisualKind(pub u16);

/// Distance tier controlling update cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LodLevel {
    Near = 0,
    Mid = 1,
    Far = 2,
}

impl LodLevel {
    /// Classify a squared distance; both boundaries are inclusive on the nearer tier
    #[inline]
    pub fn classify(distance_sq: f64, mid_distance_sq: f64, far_distance_sq: f64) -> Self {
        if distance_sq <= mid_distance_sq {
            LodLevel::Near
        } else if distance_sq <= far_distance_sq {
            LodLevel::Mid
        } else {
            LodLevel::Far
        }
    }
}

/// What one evaluation decided to send
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateDecision {
    pub position: bool,
    pub transform: bool,
    /// The transform was sent because a resync was pending
    pub forced: bool,
}

impl UpdateDecision {
    pub const NONE: Self = Self {
        position: false,
        transform: false,
        forced: false,
    };

    pub fn is_none(&self) -> bool {
        !self.position && !self.transform
    }
}

/// Thresholds for one tier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierThresholds {
    pub position_sq: f32,
    pub rotation_dot: f32,
    /// Minimum ticks between sends (ignored for NEAR)
    pub interval_ticks: u32,
}

/// Thresholds for all tiers with shedding already applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateThresholds {
    pub near: TierThresholds,
    pub mid: TierThresholds,
    pub far: TierThresholds,
}

impl UpdateThresholds {
    pub fn from_config(config: &TrackerConfig, mid_multiplier: u32, far_multiplier: u32) -> Self {
        Self {
            near: TierThresholds {
                position_sq: config.near_position_threshold_sq,
                rotation_dot: config.near_rotation_threshold_dot,
                interval_ticks: 1,
            },
            mid: TierThresholds {
                position_sq: config.mid_position_threshold_sq,
                rotation_dot: config.mid_rotation_threshold_dot,
                interval_ticks: config.mid_update_interval_ticks.saturating_mul(mid_multiplier.max(1)),
            },
            far: TierThresholds {
                position_sq: config.far_position_threshold_sq,
                rotation_dot: config.far_rotation_threshold_dot,
                interval_ticks: config.far_update_interval_ticks.saturating_mul(far_multiplier.max(1)),
            },
        }
    }
}

/// Metadata packet materialized for the current tick
#[derive(Debug, Clone)]
pub struct PendingMetadata {
    pub packet: Packet,
    pub critical: bool,
}

#[derive(Debug, Clone, Copy)]
struct SyncBaseline {
    position: DVec3,
    orientation: Quat,
}

// ============================================================================
// Tracked Visual
// ============================================================================

/// Registry entry for one network-visible object
#[derive(Debug)]
pub struct TrackedVisual {
    pub id: VisualId,
    pub kind: VisualKind,
    pub world: WorldId,
    position: DVec3,
    orientation: Quat,
    /// Grid cell the visual is currently bucketed in
    pub(crate) cell: CellKey,

    near: SyncBaseline,
    mid: SyncBaseline,
    far: SyncBaseline,
    last_mid_send: Option<Tick>,
    last_far_send: Option<Tick>,

    metadata: Vec<u8>,
    metadata_dirty: bool,
    critical_metadata_dirty: bool,
    force_transform_resync: bool,

    // Per-tick caches, cleared by `begin_tick`
    cached_position: Option<Packet>,
    cached_transform: Option<Packet>,
    cached_metadata: Option<PendingMetadata>,
    /// First decision per tier this tick, shared by every observer at that tier
    tier_memo: [Option<(Tick, UpdateDecision)>; 3],
}

impl TrackedVisual {
    /// New visual whose baselines all equal the initial pose
    pub fn new(
        id: VisualId,
        kind: VisualKind,
        world: WorldId,
        position: DVec3,
        orientation: Quat,
        cell: CellKey,
    ) -> Self {
        let baseline = SyncBaseline {
            position,
            orientation,
        };
        Self {
            id,
            kind,
            world,
            position,
            orientation,
            cell,
            near: baseline,
            mid: baseline,
            far: baseline,
            last_mid_send: None,
            last_far_send: None,
            metadata: Vec::new(),
            metadata_dirty: false,
            critical_metadata_dirty: false,
            force_transform_resync: false,
            cached_position: None,
            cached_transform: None,
            cached_metadata: None,
            tier_memo: [None; 3],
        }
    }

    /// Initial metadata; travels with the spawn, so it is not marked dirty
    pub fn with_metadata(mut self, payload: Vec<u8>) -> Self {
        self.metadata = payload;
        self
    }

    pub fn position(&self) -> DVec3 {
        self.position
    }

    pub fn orientation(&self) -> Quat {
        self.orientation
    }

    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }

    pub fn is_metadata_dirty(&self) -> bool {
        self.metadata_dirty
    }

    pub fn is_resync_forced(&self) -> bool {
        self.force_transform_resync
    }

    /// Overwrite the live pose; a critical update forces the next transform
    pub fn set_pose(&mut self, world: WorldId, position: DVec3, orientation: Quat, critical: bool) {
        self.world = world;
        self.position = position;
        self.orientation = orientation;
        if critical {
            self.mark_metadata_dirty(true);
        }
    }

    /// Replace the metadata payload and schedule it for delivery
    pub fn set_metadata(&mut self, payload: Vec<u8>, critical: bool) {
        self.metadata = payload;
        self.mark_metadata_dirty(critical);
    }

    /// Critical changes also force a transform resync
    pub fn mark_metadata_dirty(&mut self, critical: bool) {
        self.metadata_dirty = true;
        if critical {
            self.critical_metadata_dirty = true;
            self.force_transform_resync = true;
        }
    }

    /// Reset per-tick caches and materialize pending metadata once
    pub fn begin_tick(&mut self, factory: &dyn PacketFactory) -> Result<(), EncodeError> {
        self.cached_position = None;
        self.cached_transform = None;
        self.cached_metadata = None;

        if !self.metadata_dirty {
            return Ok(());
        }
        let critical = self.critical_metadata_dirty;
        self.metadata_dirty = false;
        self.critical_metadata_dirty = false;
        let packet = factory.metadata_packet(self.id, &self.metadata)?;
        self.cached_metadata = Some(PendingMetadata { packet, critical });
        Ok(())
    }

    /// Metadata materialized this tick, if any
    pub fn pending_metadata(&self) -> Option<&PendingMetadata> {
        self.cached_metadata.as_ref()
    }

    /// Position packet for the current pose, built once per tick
    pub fn position_packet(&mut self, factory: &dyn PacketFactory) -> Result<Packet, EncodeError> {
        if let Some(packet) = &self.cached_position {
            return Ok(packet.clone());
        }
        let packet = factory.position_packet(self.id, self.position, self.orientation)?;
        self.cached_position = Some(packet.clone());
        Ok(packet)
    }

    /// Transform packet for the current orientation, built once per tick
    pub fn transform_packet(&mut self, factory: &dyn PacketFactory) -> Result<Packet, EncodeError> {
        if let Some(packet) = &self.cached_transform {
            return Ok(packet.clone());
        }
        let packet = factory.transform_packet(self.id, self.orientation)?;
        self.cached_transform = Some(packet.clone());
        Ok(packet)
    }

    // ========================================================================
    // Update Policy
    // ========================================================================

    /// Decide what to send at `lod` and advance the matching baselines
    ///
    /// Calling again without an intervening pose change yields no update.
    pub fn prepare_update(&mut self, lod: LodLevel, tick: Tick, thresholds: &UpdateThresholds) -> UpdateDecision {
        match lod {
            LodLevel::Near => self.prepare_near(&thresholds.near),
            LodLevel::Mid => self.prepare_tiered(LodLevel::Mid, tick, &thresholds.mid),
            LodLevel::Far => self.prepare_tiered(LodLevel::Far, tick, &thresholds.far),
        }
    }

    /// Like [`prepare_update`](Self::prepare_update) but evaluated once per tier per tick
    pub fn resolve_update(&mut self, lod: LodLevel, tick: Tick, thresholds: &UpdateThresholds) -> UpdateDecision {
        let slot = lod as usize;
        if let Some((memo_tick, decision)) = self.tier_memo[slot] {
            if memo_tick == tick {
                return decision;
            }
        }
        let decision = self.prepare_update(lod, tick, thresholds);
        self.tier_memo[slot] = Some((tick, decision));
        decision
    }

    /// Whether NEAR rules would currently send something
    pub fn has_significant_near_change(&self, thresholds: &TierThresholds) -> bool {
        position_changed(&self.near, self.position, thresholds.position_sq)
            || rotation_changed(&self.near, self.orientation, thresholds.rotation_dot)
    }

    fn prepare_near(&mut self, thresholds: &TierThresholds) -> UpdateDecision {
        let send_position = position_changed(&self.near, self.position, thresholds.position_sq);
        let rotated = rotation_changed(&self.near, self.orientation, thresholds.rotation_dot);
        let forced = self.force_transform_resync;
        let send_transform = rotated || forced;

        if !send_position && !send_transform {
            return UpdateDecision::NONE;
        }
        if send_position {
            self.near.position = self.position;
        }
        if send_transform {
            self.near.orientation = self.orientation;
            self.force_transform_resync = false;
        }
        UpdateDecision {
            position: send_position,
            transform: send_transform,
            forced,
        }
    }

    fn prepare_tiered(&mut self, lod: LodLevel, tick: Tick, thresholds: &TierThresholds) -> UpdateDecision {
        let (baseline, last_send) = match lod {
            LodLevel::Far => (&mut self.far, &mut self.last_far_send),
            _ => (&mut self.mid, &mut self.last_mid_send),
        };
        let moved = position_changed(baseline, self.position, thresholds.position_sq);
        let rotated = rotation_changed(baseline, self.orientation, thresholds.rotation_dot);
        let forced = self.force_transform_resync;
        let interval_reached = match *last_send {
            None => true,
            Some(last) => tick.saturating_sub(last) >= u64::from(thresholds.interval_ticks),
        };

        let send_position = moved && interval_reached;
        let send_transform = forced || rotated || interval_reached;
        if !send_position && !send_transform {
            return UpdateDecision::NONE;
        }

        if send_position {
            baseline.position = self.position;
        }
        if send_transform {
            baseline.orientation = self.orientation;
            self.force_transform_resync = false;
        }
        *last_send = Some(tick);

        UpdateDecision {
            position: send_position,
            transform: send_transform,
            forced,
        }
    }
}

#[inline]
fn position_changed(baseline: &SyncBaseline, position: DVec3, threshold_sq: f32) -> bool {
    position.distance_squared(baseline.position) > f64::from(threshold_sq)
}

#[inline]
fn rotation_changed(baseline: &SyncBaseline, orientation: Quat, threshold_dot: f32) -> bool {
    orientation.dot(baseline.orientation).abs() < threshold_dot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::BincodePacketFactory;
    use uuid::Uuid;

    fn visual_at(position: DVec3) -> TrackedVisual {
        TrackedVisual::new(1, VisualKind(0), Uuid::nil(), position, Quat::IDENTITY, (0, 0))
    }

    fn thresholds() -> UpdateThresholds {
        UpdateThresholds::from_config(&TrackerConfig::default(), 1, 1)
    }

    #[test]
    fn test_classify_boundaries() {
        assert_eq!(LodLevel::classify(576.0, 576.0, 3136.0), LodLevel::Near);
        assert_eq!(LodLevel::classify(576.1, 576.0, 3136.0), LodLevel::Mid);
        assert_eq!(LodLevel::classify(3136.0, 576.0, 3136.0), LodLevel::Mid);
        assert_eq!(LodLevel::classify(3136.1, 576.0, 3136.0), LodLevel::Far);
    }

    #[test]
    fn test_prepare_update_is_idempotent() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();
        visual.set_pose(Uuid::nil(), DVec3::new(1.0, 0.0, 0.0), Quat::IDENTITY, false);

        let first = visual.prepare_update(LodLevel::Near, 1, &thresholds);
        assert!(first.position);

        let second = visual.prepare_update(LodLevel::Near, 1, &thresholds);
        assert!(second.is_none(), "Second call without mutation should send nothing");
    }

    #[test]
    fn test_near_rotation_threshold() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();

        // |dot| = cos(0.5 rad / 2) ~ 0.97, well above 0.3
        visual.set_pose(Uuid::nil(), DVec3::ZERO, Quat::from_rotation_y(0.5), false);
        assert!(visual.prepare_update(LodLevel::Near, 1, &thresholds).is_none());

        // |dot| = cos(3.0 / 2) ~ 0.07, below 0.3
        visual.set_pose(Uuid::nil(), DVec3::ZERO, Quat::from_rotation_y(3.0), false);
        let decision = visual.prepare_update(LodLevel::Near, 2, &thresholds);
        assert!(decision.transform);
        assert!(!decision.position);
    }

    #[test]
    fn test_only_sent_components_advance_baseline() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();

        visual.set_pose(Uuid::nil(), DVec3::new(0.0, 0.0, 2.0), Quat::IDENTITY, false);
        let decision = visual.prepare_update(LodLevel::Near, 1, &thresholds);
        assert!(decision.position && !decision.transform);

        // MID baseline never saw the move, so MID still reports it once its interval allows
        let mid = visual.prepare_update(LodLevel::Mid, 1, &thresholds);
        assert!(mid.position);
    }

    #[test]
    fn test_mid_interval_gates_position() {
        let mut visual = visual_at(DVec3::ZERO);
        let config = TrackerConfig {
            mid_update_interval_ticks: 5,
            ..TrackerConfig::default()
        };
        let thresholds = UpdateThresholds::from_config(&config, 1, 1);

        let mut position_sends = 0;
        for tick in 1..=5u64 {
            // 0.1 units per tick: above the 0.04 MID threshold every tick
            visual.set_pose(Uuid::nil(), DVec3::new(0.1 * tick as f64, 0.0, 0.0), Quat::IDENTITY, false);
            if visual.prepare_update(LodLevel::Mid, tick, &thresholds).position {
                position_sends += 1;
            }
        }
        assert_eq!(position_sends, 1, "Interval of 5 allows one position send in 5 ticks");
    }

    #[test]
    fn test_mid_sub_threshold_motion_sends_no_position() {
        let mut visual = visual_at(DVec3::ZERO);
        let config = TrackerConfig {
            mid_update_interval_ticks: 5,
            ..TrackerConfig::default()
        };
        let thresholds = UpdateThresholds::from_config(&config, 1, 1);

        let mut position_sends = 0;
        for tick in 1..=5u64 {
            visual.set_pose(Uuid::nil(), DVec3::new(0.001 * tick as f64, 0.0, 0.0), Quat::IDENTITY, false);
            if visual.prepare_update(LodLevel::Mid, tick, &thresholds).position {
                position_sends += 1;
            }
        }
        assert!(position_sends <= 1);
    }

    #[test]
    fn test_interval_keeps_stationary_visual_consistent() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();

        // Never sent at FAR: interval counts as reached
        let first = visual.prepare_update(LodLevel::Far, 10, &thresholds);
        assert!(first.transform && !first.position);

        assert!(visual.prepare_update(LodLevel::Far, 11, &thresholds).is_none());
        assert!(visual.prepare_update(LodLevel::Far, 14, &thresholds).transform);
    }

    #[test]
    fn test_critical_metadata_forces_resync() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();
        visual.set_metadata(vec![1, 2, 3], true);
        assert!(visual.is_resync_forced());

        let decision = visual.prepare_update(LodLevel::Near, 1, &thresholds);
        assert!(decision.transform && decision.forced);
        assert!(!visual.is_resync_forced(), "First consuming tier clears the flag");
    }

    #[test]
    fn test_critical_pose_forces_resync() {
        let mut visual = visual_at(DVec3::ZERO);
        visual.set_pose(Uuid::nil(), DVec3::ZERO, Quat::IDENTITY, true);
        assert!(visual.is_resync_forced());
        assert!(visual.is_metadata_dirty());
    }

    #[test]
    fn test_begin_tick_materializes_metadata_once() {
        let factory = BincodePacketFactory::new();
        let mut visual = visual_at(DVec3::ZERO);
        visual.set_metadata(vec![7; 4], false);

        visual.begin_tick(&factory).unwrap();
        let pending = visual.pending_metadata().cloned().unwrap();
        assert!(!pending.critical);
        assert!(!visual.is_metadata_dirty());

        visual.begin_tick(&factory).unwrap();
        assert!(visual.pending_metadata().is_none(), "Cache is cleared next tick");
    }

    #[test]
    fn test_resolve_update_shares_decision_within_tick() {
        let mut visual = visual_at(DVec3::ZERO);
        let thresholds = thresholds();
        visual.set_pose(Uuid::nil(), DVec3::new(3.0, 0.0, 0.0), Quat::IDENTITY, false);

        let first = visual.resolve_update(LodLevel::Near, 4, &thresholds);
        let second = visual.resolve_update(LodLevel::Near, 4, &thresholds);
        assert_eq!(first, second);
        assert!(second.position);

        assert!(visual.resolve_update(LodLevel::Near, 5, &thresholds).is_none());
    }

    #[test]
    fn test_packets_cached_per_tick() {
        let factory = BincodePacketFactory::new();
        let mut visual = visual_at(DVec3::ONE);
        let a = visual.position_packet(&factory).unwrap();
        visual.set_pose(Uuid::nil(), DVec3::ZERO, Quat::IDENTITY, false);
        let b = visual.position_packet(&factory).unwrap();
        assert_eq!(a, b, "Same tick reuses the cached packet");

        visual.begin_tick(&factory).unwrap();
        let c = visual.position_packet(&factory).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_shedding_multiplies_intervals() {
        let thresholds = UpdateThresholds::from_config(&TrackerConfig::default(), 3, 4);
        assert_eq!(thresholds.mid.interval_ticks, 6);
        assert_eq!(thresholds.far.interval_ticks, 16);
    }
}
