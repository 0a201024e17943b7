//! Budgeted transform pass
//!
//! Re-checks visible visuals for one observer in a stable order, resuming
//! from the previous slice. Each check re-confirms range, picks the LOD tier
//! and turns the visual's update decision into queued packets:
//! - a position change goes out as a TELEPORT that carries any transform
//!   and metadata for the same tick with it
//! - otherwise transform and metadata are coalesced into one METADATA lane
//!   update per visual

use smallvec::SmallVec;
use tracing::trace;

use super::executor::{buffer_packet, record_encode_failure, retire_visible, TickExecutor, TrackerCore};
use super::packet::{PacketPriority, QueuedPacket};
use super::scheduler::{LaneQueues, MetadataTask, VisualUpdate};
use super::visual::LodLevel;
use super::ObserverId;
use crate::net::transport::Packet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformSliceResult {
    pub checked: usize,
    pub teleports: usize,
    pub updates: usize,
    pub exited: usize,
    /// Visible entries left unchecked because the budget ran out
    pub skipped_due_budget: usize,
}

pub(crate) fn run_transform_slice(
    exec: &mut TickExecutor<'_>,
    observer: ObserverId,
    lanes: &mut LaneQueues,
) -> TransformSliceResult {
    let config = exec.config;
    let factory = exec.factory;
    let budget = config.max_transform_checks_per_observer_per_tick;
    let view_sq = config.view_distance_sq();
    let mid_sq = config.mid_distance_sq();
    let far_sq = config.far_distance_sq();
    let TrackerCore {
        visuals,
        observers,
        frames,
        queues,
        tokens,
        counters,
        tick,
        shedding,
        thresholds,
        ..
    } = &mut *exec.core;
    let tick = *tick;

    let mut result = TransformSliceResult::default();
    let (Some(frame), Some(state)) = (frames.get(&observer), observers.get_mut(&observer)) else {
        counters.skipped_tasks += 1;
        return result;
    };
    state.transform_queued = false;

    // The cursor wraps; one slice never visits an id twice
    let limit = budget.min(state.visible_len());
    let covers_all = limit == state.visible_len();
    while result.checked < limit {
        let Some(id) = state.next_visible() else {
            break;
        };
        result.checked += 1;

        let Some(visual) = visuals.get_mut(&id) else {
            state.remove_visible(id);
            counters.vanished_visuals += 1;
            continue;
        };
        // Promoted this tick; its spawn already carries the current pose
        if state.promoted_at(id) == Some(tick) {
            continue;
        }

        let distance_sq = visual.position().distance_squared(frame.position);
        if visual.world != frame.world || distance_sq > view_sq {
            state.remove_visible(id);
            retire_visible(queues, counters, lanes, observer, id, tick);
            result.exited += 1;
            continue;
        }

        let lod = LodLevel::classify(distance_sq, mid_sq, far_sq);
        let decision = visual.resolve_update(lod, tick, thresholds);
        if !decision.position && lod != LodLevel::Near && visual.has_significant_near_change(&thresholds.near) {
            counters.lod_skipped_updates += 1;
        }

        let token = tokens.current(id);
        let metadata = visual.pending_metadata().cloned();
        let mut transform = None;
        if decision.transform {
            match visual.transform_packet(factory) {
                Ok(packet) => transform = Some(packet),
                Err(e) => record_encode_failure(counters, id, &e),
            }
        }

        let mut metadata_bundled = false;
        if decision.position {
            match visual.position_packet(factory) {
                Ok(position) => {
                    let mut parts: SmallVec<[Packet; 3]> = SmallVec::new();
                    parts.push(position);
                    if let Some(packet) = transform.take() {
                        parts.push(packet);
                    }
                    if let Some(pending) = &metadata {
                        parts.push(pending.packet.clone());
                        metadata_bundled = true;
                    }
                    let packet = if parts.len() == 1 {
                        parts.swap_remove(0)
                    } else {
                        Packet::bundle(&parts)
                    };
                    let bytes = factory.estimate_size(&packet);
                    let critical = decision.forced || metadata.as_ref().is_some_and(|m| m.critical);
                    let entry = QueuedPacket::for_visual(packet, PacketPriority::Teleport, id, token, bytes)
                        .with_critical(critical);
                    if buffer_packet(queues, tokens, counters, observer, entry) {
                        result.teleports += 1;
                    }
                }
                Err(e) => record_encode_failure(counters, id, &e),
            }
        }

        let mut critical = decision.forced;
        let mut metadata_packet = None;
        if let Some(pending) = metadata.filter(|_| !metadata_bundled) {
            if lod == LodLevel::Far && !config.far_allow_metadata_updates {
                counters.lod_skipped_metadata_updates += 1;
            } else if shedding.should_drop_metadata(pending.critical, lod == LodLevel::Near, id, tick) {
                counters.dropped_updates += 1;
                if lod != LodLevel::Near {
                    counters.lod_skipped_metadata_updates += 1;
                }
            } else {
                critical |= pending.critical;
                metadata_packet = Some(pending.packet);
            }
        }

        if transform.is_some() || metadata_packet.is_some() {
            lanes.enqueue_metadata(MetadataTask::Update(VisualUpdate {
                observer,
                visual: id,
                token,
                transform,
                metadata: metadata_packet,
                critical,
            }));
            result.updates += 1;
        }
    }

    // Zero when the slice stopped exactly at the end of the list
    if !covers_all {
        result.skipped_due_budget = state.remaining_visible_checks();
    }
    counters.transform_checks_skipped_due_budget += result.skipped_due_budget as u64;
    trace!(
        "Transform slice for {}: {} checked, {} teleports, {} updates",
        observer,
        result.checked,
        result.teleports,
        result.updates
    );
    result
}
