use glam::{DVec3, Quat};
use serde::{Deserialize, Serialize};

use crate::net::transport::{Packet, PacketFactory};
use crate::tracker::{VisualId, VisualKind};

/// Messages from server to observers describing visual lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VisualMessage {
    /// A visual entered the observer's view
    Spawn {
        id: VisualId,
        kind: VisualKind,
        position: DVec3,
        orientation: Quat,
    },
    /// Visuals left the view or were removed
    Destroy { ids: Vec<VisualId> },
    /// Teleport to an absolute pose
    Position {
        id: VisualId,
        position: DVec3,
        orientation: Quat,
    },
    /// Orientation-only update
    Transform { id: VisualId, orientation: Quat },
    /// Host-defined metadata blob
    Metadata { id: VisualId, payload: Vec<u8> },
}

/// Serialize a message to bytes using bincode
/// Uses legacy config for fixed-size integers (simple for non-Rust clients)
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, EncodeError> {
    bincode::serde::encode_to_vec(message, bincode::config::legacy())
        .map_err(|e| EncodeError(e.to_string()))
}

/// Deserialize a message from bytes using bincode
/// Uses legacy config for fixed-size integers (simple for non-Rust clients)
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, DecodeError> {
    bincode::serde::decode_from_slice(data, bincode::config::legacy())
        .map(|(msg, _)| msg)
        .map_err(|e| DecodeError(e.to_string()))
}

#[derive(Debug, thiserror::Error)]
#[error("Encode error: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, thiserror::Error)]
#[error("Decode error: {0}")]
pub struct DecodeError(pub String);

/// Reference factory encoding one [`VisualMessage`] per frame
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodePacketFactory;

impl BincodePacketFactory {
    pub fn new() -> Self {
        Self
    }

    fn frame(message: &VisualMessage) -> Result<Packet, EncodeError> {
        encode(message).map(Packet::frame)
    }
}

impl PacketFactory for BincodePacketFactory {
    fn spawn_packet(
        &self,
        id: VisualId,
        kind: VisualKind,
        position: DVec3,
        orientation: Quat,
    ) -> Result<Packet, EncodeError> {
        Self::frame(&VisualMessage::Spawn {
            id,
            kind,
            position,
            orientation,
        })
    }

    fn destroy_packet(&self, ids: &[VisualId]) -> Result<Packet, EncodeError> {
        Self::frame(&VisualMessage::Destroy { ids: ids.to_vec() })
    }

    fn position_packet(
        &self,
        id: VisualId,
        position: DVec3,
        orientation: Quat,
    ) -> Result<Packet, EncodeError> {
        Self::frame(&VisualMessage::Position {
            id,
            position,
            orientation,
        })
    }

    fn transform_packet(&self, id: VisualId, orientation: Quat) -> Result<Packet, EncodeError> {
        Self::frame(&VisualMessage::Transform { id, orientation })
    }

    fn metadata_packet(&self, id: VisualId, payload: &[u8]) -> Result<Packet, EncodeError> {
        Self::frame(&VisualMessage::Metadata {
            id,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_message_decodes() {
        let factory = BincodePacketFactory::new();
        let packet = factory
            .spawn_packet(7, VisualKind(3), DVec3::new(1.0, 2.0, 3.0), Quat::IDENTITY)
            .unwrap();

        let frame = packet.frames().next().unwrap();
        let decoded: VisualMessage = decode(frame).unwrap();
        assert_eq!(
            decoded,
            VisualMessage::Spawn {
                id: 7,
                kind: VisualKind(3),
                position: DVec3::new(1.0, 2.0, 3.0),
                orientation: Quat::IDENTITY,
            }
        );
    }

    #[test]
    fn test_destroy_packet_carries_all_ids() {
        let factory = BincodePacketFactory::new();
        let packet = factory.destroy_packet(&[1, 2, 3]).unwrap();
        let decoded: VisualMessage = decode(packet.frames().next().unwrap()).unwrap();
        assert_eq!(decoded, VisualMessage::Destroy { ids: vec![1, 2, 3] });
    }

    #[test]
    fn test_estimate_size_matches_encoding() {
        let factory = BincodePacketFactory::new();
        let packet = factory.metadata_packet(1, &[0u8; 32]).unwrap();
        // 4 byte variant tag + 4 byte id + 8 byte length prefix + payload
        assert_eq!(factory.estimate_size(&packet), 4 + 4 + 8 + 32);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<VisualMessage, _> = decode(&[0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }
}
