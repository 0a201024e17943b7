//! Transport seam between the tracker and whatever delivers bytes
//!
//! The tracker never encodes or sends anything itself. It asks a
//! [`PacketFactory`] for opaque packets and hands each observer's drained
//! batch to a [`PacketSink`] once per tick.

use std::sync::Arc;

use glam::{DVec3, Quat};
use smallvec::SmallVec;

use crate::net::protocol::EncodeError;
use crate::tracker::{ObserverId, VisualId, VisualKind};

// ============================================================================
// Packet
// ============================================================================

/// Opaque, cheaply clonable outbound packet
///
/// A bundle keeps several encoded frames together so the flush step can
/// budget and deliver them as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Frame(Arc<[u8]>),
    Bundle(Arc<[Arc<[u8]>]>),
}

impl Packet {
    pub fn frame(bytes: Vec<u8>) -> Self {
        Packet::Frame(Arc::from(bytes))
    }

    /// Combine packets into one unit, flattening nested bundles
    pub fn bundle(parts: &[Packet]) -> Self {
        let mut frames: SmallVec<[Arc<[u8]>; 4]> = SmallVec::new();
        for part in parts {
            match part {
                Packet::Frame(bytes) => frames.push(bytes.clone()),
                Packet::Bundle(inner) => frames.extend(inner.iter().cloned()),
            }
        }
        Packet::Bundle(frames.into_vec().into())
    }

    /// Encoded frames in send order
    pub fn frames(&self) -> impl Iterator<Item = &[u8]> {
        let (single, many): (Option<&Arc<[u8]>>, &[Arc<[u8]>]) = match self {
            Packet::Frame(bytes) => (Some(bytes), &[]),
            Packet::Bundle(frames) => (None, frames),
        };
        single.into_iter().chain(many.iter()).map(|bytes| &bytes[..])
    }

    pub fn frame_count(&self) -> usize {
        match self {
            Packet::Frame(_) => 1,
            Packet::Bundle(frames) => frames.len(),
        }
    }

    /// Total encoded length of all frames
    pub fn encoded_len(&self) -> usize {
        self.frames().map(<[u8]>::len).sum()
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Builds wire packets for visual lifecycle events
pub trait PacketFactory: Send + Sync {
    fn spawn_packet(
        &self,
        id: VisualId,
        kind: VisualKind,
        position: DVec3,
        orientation: Quat,
    ) -> Result<Packet, EncodeError>;

    /// One packet removing every listed visual
    fn destroy_packet(&self, ids: &[VisualId]) -> Result<Packet, EncodeError>;

    fn position_packet(
        &self,
        id: VisualId,
        position: DVec3,
        orientation: Quat,
    ) -> Result<Packet, EncodeError>;

    fn transform_packet(&self, id: VisualId, orientation: Quat) -> Result<Packet, EncodeError>;

    fn metadata_packet(&self, id: VisualId, payload: &[u8]) -> Result<Packet, EncodeError>;

    /// Bytes charged against the per-observer budget
    fn estimate_size(&self, packet: &Packet) -> usize {
        packet.encoded_len()
    }
}

/// Receives one ordered batch per observer per tick
pub trait PacketSink {
    fn send_batch(&mut self, observer: ObserverId, packets: &[Packet]);
}

/// Sink that keeps every batch in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub batches: Vec<(ObserverId, Vec<Packet>)>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All packets delivered to one observer, across batches
    pub fn packets_for(&self, observer: ObserverId) -> Vec<Packet> {
        self.batches
            .iter()
            .filter(|(id, _)| *id == observer)
            .flat_map(|(_, packets)| packets.iter().cloned())
            .collect()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }
}

impl PacketSink for RecordingSink {
    fn send_batch(&mut self, observer: ObserverId, packets: &[Packet]) {
        self.batches.push((observer, packets.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_flattens_nested() {
        let a = Packet::frame(vec![1, 2]);
        let b = Packet::frame(vec![3]);
        let inner = Packet::bundle(&[a.clone(), b]);
        let outer = Packet::bundle(&[inner, a]);

        assert_eq!(outer.frame_count(), 3);
        assert_eq!(outer.encoded_len(), 5);
        let flat: Vec<u8> = outer.frames().flat_map(|f| f.iter().copied()).collect();
        assert_eq!(flat, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn test_recording_sink_filters_by_observer() {
        let mut sink = RecordingSink::new();
        let first = uuid::Uuid::new_v4();
        let second = uuid::Uuid::new_v4();
        sink.send_batch(first, &[Packet::frame(vec![0])]);
        sink.send_batch(second, &[Packet::frame(vec![1]), Packet::frame(vec![2])]);
        sink.send_batch(first, &[Packet::frame(vec![3])]);

        assert_eq!(sink.packets_for(first).len(), 2);
        assert_eq!(sink.packets_for(second).len(), 2);
    }
}
