//! Per-observer outbound packet queue
//!
//! One FIFO per priority, drained DESTROY, SPAWN, TELEPORT, METADATA.
//! Entries remember the token of the visual they describe so stale work can
//! be pruned early or dropped at flush.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use super::tokens::{Token, VisualTokenService};
use super::{Tick, VisualId};
use crate::net::transport::Packet;

/// Drain priority, lowest value first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketPriority {
    Destroy = 0,
    Spawn = 1,
    Teleport = 2,
    Metadata = 3,
}

impl PacketPriority {
    pub const DRAIN_ORDER: [PacketPriority; 4] = [
        PacketPriority::Destroy,
        PacketPriority::Spawn,
        PacketPriority::Teleport,
        PacketPriority::Metadata,
    ];
}

/// A packet waiting for the flush step
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    pub packet: Packet,
    pub priority: PacketPriority,
    /// Visual this packet describes; None for destroys
    pub visual: Option<VisualId>,
    /// Token captured at enqueue; None bypasses the staleness check
    pub token: Option<Token>,
    pub estimated_bytes: usize,
    /// Tick the destroy was registered (latency metric)
    pub destroy_registered_tick: Option<Tick>,
    /// A newer entry for the same visual replaces this one
    pub coalescible: bool,
    pub critical: bool,
}

impl QueuedPacket {
    pub fn destroy(packet: Packet, estimated_bytes: usize, registered_tick: Tick) -> Self {
        Self {
            packet,
            priority: PacketPriority::Destroy,
            visual: None,
            token: None,
            estimated_bytes,
            destroy_registered_tick: Some(registered_tick),
            coalescible: false,
            critical: true,
        }
    }

    pub fn for_visual(
        packet: Packet,
        priority: PacketPriority,
        visual: VisualId,
        token: Token,
        estimated_bytes: usize,
    ) -> Self {
        Self {
            packet,
            priority,
            visual: Some(visual),
            token: Some(token),
            estimated_bytes,
            destroy_registered_tick: None,
            coalescible: priority == PacketPriority::Teleport,
            critical: false,
        }
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// Whether the entry still matches its visual's current version
    pub fn is_current(&self, tokens: &VisualTokenService) -> bool {
        match (self.visual, self.token) {
            (Some(id), Some(token)) => tokens.is_current(id, token),
            _ => true,
        }
    }
}

/// Outcome of [`ObserverPacketQueue::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Replaced an older coalescible entry for the same visual
    Coalesced,
    /// Token already stale; nothing queued
    Rejected,
}

#[derive(Debug, Default)]
pub struct ObserverPacketQueue {
    lanes: [VecDeque<QueuedPacket>; 4],
}

impl ObserverPacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueuedPacket, tokens: &VisualTokenService) -> PushOutcome {
        if !entry.is_current(tokens) {
            return PushOutcome::Rejected;
        }
        let lane = &mut self.lanes[entry.priority as usize];
        let mut outcome = PushOutcome::Queued;
        if entry.coalescible {
            if let Some(visual) = entry.visual {
                let before = lane.len();
                lane.retain(|queued| !(queued.coalescible && queued.visual == Some(visual)));
                if lane.len() != before {
                    outcome = PushOutcome::Coalesced;
                }
            }
        }
        lane.push_back(entry);
        outcome
    }

    /// First entry in drain order
    pub fn front(&self) -> Option<&QueuedPacket> {
        self.lanes.iter().find_map(|lane| lane.front())
    }

    pub fn pop_front(&mut self) -> Option<QueuedPacket> {
        self.lanes.iter_mut().find_map(|lane| lane.pop_front())
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn len_of(&self, priority: PacketPriority) -> usize {
        self.lanes[priority as usize].len()
    }

    /// Drop non-destroy entries for `visual` captured with an older token
    pub fn invalidate_visual(&mut self, visual: VisualId, current: Token) -> usize {
        self.retain_visual_entries(|entry| {
            !(entry.visual == Some(visual) && entry.token.is_some_and(|token| token != current))
        })
    }

    /// Drop every non-destroy entry for `visual`
    pub fn remove_visual(&mut self, visual: VisualId) -> usize {
        self.retain_visual_entries(|entry| entry.visual != Some(visual))
    }

    /// Drop non-destroy entries for any id in `ids` ahead of a bulk destroy
    pub fn prune_before_bulk_destroy(&mut self, ids: &FxHashSet<VisualId>) -> usize {
        self.retain_visual_entries(|entry| entry.visual.map_or(true, |id| !ids.contains(&id)))
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.len();
        for lane in &mut self.lanes {
            lane.clear();
        }
        dropped
    }

    fn retain_visual_entries<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&QueuedPacket) -> bool,
    {
        let mut removed = 0;
        for priority in [PacketPriority::Spawn, PacketPriority::Teleport, PacketPriority::Metadata] {
            let lane = &mut self.lanes[priority as usize];
            let before = lane.len();
            lane.retain(|entry| keep(entry));
            removed += before - lane.len();
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> Packet {
        Packet::frame(vec![byte])
    }

    fn entry(priority: PacketPriority, visual: VisualId, token: Token) -> QueuedPacket {
        QueuedPacket::for_visual(frame(visual as u8), priority, visual, token, 1)
    }

    #[test]
    fn test_drain_order_by_priority() {
        let tokens = VisualTokenService::new();
        let mut queue = ObserverPacketQueue::new();
        queue.push(entry(PacketPriority::Metadata, 1, 0), &tokens);
        queue.push(entry(PacketPriority::Spawn, 2, 0), &tokens);
        queue.push(QueuedPacket::destroy(frame(9), 1, 0), &tokens);
        queue.push(entry(PacketPriority::Teleport, 3, 0), &tokens);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_front()).map(|e| e.priority).collect();
        assert_eq!(order, PacketPriority::DRAIN_ORDER.to_vec());
    }

    #[test]
    fn test_teleport_coalesces_per_visual() {
        let tokens = VisualTokenService::new();
        let mut queue = ObserverPacketQueue::new();
        assert_eq!(queue.push(entry(PacketPriority::Teleport, 1, 0), &tokens), PushOutcome::Queued);
        queue.push(entry(PacketPriority::Teleport, 2, 0), &tokens);
        assert_eq!(queue.push(entry(PacketPriority::Teleport, 1, 0), &tokens), PushOutcome::Coalesced);

        assert_eq!(queue.len_of(PacketPriority::Teleport), 2);
        assert_eq!(queue.pop_front().and_then(|e| e.visual), Some(2));
    }

    #[test]
    fn test_push_rejects_stale_token() {
        let mut tokens = VisualTokenService::new();
        tokens.bump(4);
        let mut queue = ObserverPacketQueue::new();
        assert_eq!(queue.push(entry(PacketPriority::Spawn, 4, 0), &tokens), PushOutcome::Rejected);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_invalidate_keeps_current_and_destroys() {
        let tokens = VisualTokenService::new();
        let mut queue = ObserverPacketQueue::new();
        queue.push(entry(PacketPriority::Spawn, 1, 0), &tokens);
        queue.push(entry(PacketPriority::Metadata, 1, 0), &tokens);
        queue.push(QueuedPacket::destroy(frame(0), 1, 0), &tokens);

        assert_eq!(queue.invalidate_visual(1, 0), 0, "Current token entries survive");
        assert_eq!(queue.invalidate_visual(1, 1), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front().map(|e| e.priority), Some(PacketPriority::Destroy));
    }

    #[test]
    fn test_prune_before_bulk_destroy() {
        let tokens = VisualTokenService::new();
        let mut queue = ObserverPacketQueue::new();
        for id in 0..4 {
            queue.push(entry(PacketPriority::Metadata, id, 0), &tokens);
        }
        let ids: FxHashSet<VisualId> = [1, 3].into_iter().collect();

        assert_eq!(queue.prune_before_bulk_destroy(&ids), 2);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear_reports_count() {
        let tokens = VisualTokenService::new();
        let mut queue = ObserverPacketQueue::new();
        queue.push(entry(PacketPriority::Spawn, 1, 0), &tokens);
        queue.push(entry(PacketPriority::Spawn, 2, 0), &tokens);
        assert_eq!(queue.clear(), 2);
        assert!(queue.front().is_none());
    }
}
