//! Per-observer interest state
//!
//! Candidates come from the grid window around the observer. The visible
//! set is the distance-confirmed subset. Two cursors let the visibility and
//! transform passes resume where they stopped on the previous tick.

use glam::DVec3;
use rustc_hash::{FxHashMap, FxHashSet};

use super::grid::CellKey;
use super::{Tick, VisualId, WorldId};

#[derive(Debug, Default)]
pub struct ObserverTrackingState {
    chunk: Option<CellKey>,
    world: Option<WorldId>,
    /// Position sampled at the last driver pass
    pub(crate) position: DVec3,
    last_full_recalc: Option<Tick>,

    candidates: Vec<VisualId>,
    candidate_set: FxHashSet<VisualId>,
    candidate_cursor: usize,

    /// Visible id -> tick it was promoted
    visible: FxHashMap<VisualId, Tick>,
    /// Stable iteration order; may hold ids that left `visible` until compacted
    visible_order: Vec<VisualId>,
    in_order: FxHashSet<VisualId>,
    order_dirty: bool,
    visible_cursor: usize,

    visibility_dirty: bool,
    pub(crate) visibility_queued: bool,
    pub(crate) transform_queued: bool,
}

impl ObserverTrackingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn world(&self) -> Option<WorldId> {
        self.world
    }

    pub fn chunk(&self) -> Option<CellKey> {
        self.chunk
    }

    /// First tick, moved cell, changed world or periodic safety net
    pub fn needs_rebuild(&self, chunk: CellKey, world: WorldId, tick: Tick, interval: u32) -> bool {
        match self.last_full_recalc {
            None => true,
            Some(last) => {
                self.chunk != Some(chunk)
                    || self.world != Some(world)
                    || tick.saturating_sub(last) >= u64::from(interval)
            }
        }
    }

    /// Replace the candidate list and return visible ids that fell out of it
    pub fn rebuild_candidates<I>(&mut self, ids: I, chunk: CellKey, world: WorldId, tick: Tick) -> Vec<VisualId>
    where
        I: IntoIterator<Item = VisualId>,
    {
        self.candidates.clear();
        self.candidate_set.clear();
        for id in ids {
            if self.candidate_set.insert(id) {
                self.candidates.push(id);
            }
        }
        self.chunk = Some(chunk);
        self.world = Some(world);
        self.last_full_recalc = Some(tick);

        let dropped: Vec<VisualId> = self
            .visible
            .keys()
            .copied()
            .filter(|id| !self.candidate_set.contains(id))
            .collect();
        for id in &dropped {
            self.remove_visible(*id);
        }
        self.mark_visibility_dirty();
        dropped
    }

    pub fn candidates(&self) -> &[VisualId] {
        &self.candidates
    }

    pub fn is_candidate(&self, id: VisualId) -> bool {
        self.candidate_set.contains(&id)
    }

    /// Restart the candidate scan from the beginning
    pub fn mark_visibility_dirty(&mut self) {
        self.visibility_dirty = true;
        self.candidate_cursor = 0;
    }

    pub fn needs_visibility_pass(&self) -> bool {
        self.visibility_dirty
    }

    pub fn mark_visibility_pass_complete(&mut self) {
        self.visibility_dirty = false;
        self.candidate_cursor = 0;
    }

    /// Candidates the visibility pass has not reached yet
    pub fn candidates_remaining(&self) -> usize {
        self.candidates.len().saturating_sub(self.candidate_cursor)
    }

    pub fn next_candidate(&mut self) -> Option<VisualId> {
        let id = self.candidates.get(self.candidate_cursor).copied()?;
        self.candidate_cursor += 1;
        Some(id)
    }

    // ========================================================================
    // Visible Set
    // ========================================================================

    pub fn is_visible(&self, id: VisualId) -> bool {
        self.visible.contains_key(&id)
    }

    pub fn visible_len(&self) -> usize {
        self.visible.len()
    }

    pub fn visible_ids(&self) -> impl Iterator<Item = VisualId> + '_ {
        self.visible.keys().copied()
    }

    pub fn promoted_at(&self, id: VisualId) -> Option<Tick> {
        self.visible.get(&id).copied()
    }

    /// Add a candidate to the visible set; false if already visible or not a candidate
    pub fn add_visible(&mut self, id: VisualId, tick: Tick) -> bool {
        if !self.candidate_set.contains(&id) || self.visible.contains_key(&id) {
            return false;
        }
        self.visible.insert(id, tick);
        if self.in_order.insert(id) {
            self.visible_order.push(id);
        }
        true
    }

    pub fn remove_visible(&mut self, id: VisualId) -> bool {
        let removed = self.visible.remove(&id).is_some();
        if removed {
            self.order_dirty = true;
        }
        removed
    }

    /// Empty the visible set, returning what was in it
    pub fn clear_visible(&mut self) -> Vec<VisualId> {
        let drained: Vec<VisualId> = self.visible.drain().map(|(id, _)| id).collect();
        self.visible_order.clear();
        self.in_order.clear();
        self.order_dirty = false;
        self.visible_cursor = 0;
        drained
    }

    /// Next visible id in stable order, wrapping to the start after the last
    ///
    /// Returns None only when nothing is visible. Callers bound a pass by
    /// [`visible_len`](Self::visible_len) so no id is visited twice.
    pub fn next_visible(&mut self) -> Option<VisualId> {
        if self.visible.is_empty() {
            self.visible_cursor = 0;
            return None;
        }
        // Second round only runs after wrapping
        for _ in 0..2 {
            if self.visible_cursor >= self.visible_order.len() {
                self.visible_cursor = 0;
            }
            if self.visible_cursor == 0 && self.order_dirty {
                self.visible_order.retain(|id| self.visible.contains_key(id));
                self.in_order.retain(|id| self.visible.contains_key(id));
                self.order_dirty = false;
            }
            while let Some(&id) = self.visible_order.get(self.visible_cursor) {
                self.visible_cursor += 1;
                if self.visible.contains_key(&id) {
                    return Some(id);
                }
            }
        }
        None
    }

    /// Visible entries the transform pass has not reached yet
    pub fn remaining_visible_checks(&self) -> usize {
        self.visible_order
            .get(self.visible_cursor..)
            .map(|rest| rest.iter().filter(|id| self.visible.contains_key(id)).count())
            .unwrap_or(0)
    }

    /// `visible` is a subset of `candidates`
    pub fn is_consistent(&self) -> bool {
        self.visible.keys().all(|id| self.candidate_set.contains(id))
    }
}
