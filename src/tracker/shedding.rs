//! Load shedding levels
//!
//! Intensity 0 is normal operation. Each level stretches MID/FAR update
//! intervals and thins out non-critical MID/FAR metadata.

/// Highest intensity; anything above maps to it
pub const MAX_INTENSITY: u8 = 4;

/// Multipliers applied while shedding at a given intensity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheddingState {
    pub intensity: u8,
    pub mid_interval_multiplier: u32,
    pub far_interval_multiplier: u32,
    /// Keep one non-critical MID/FAR metadata update in this many
    pub metadata_drop_modulo: u32,
}

impl SheddingState {
    pub const DISABLED: SheddingState = SheddingState {
        intensity: 0,
        mid_interval_multiplier: 1,
        far_interval_multiplier: 1,
        metadata_drop_modulo: 1,
    };

    pub fn for_intensity(intensity: u8) -> Self {
        let (mid, far, modulo) = match intensity {
            0 => return Self::DISABLED,
            1 => (2, 2, 2),
            2 => (2, 3, 3),
            3 => (3, 4, 4),
            _ => (4, 6, 6),
        };
        Self {
            intensity: intensity.min(MAX_INTENSITY),
            mid_interval_multiplier: mid,
            far_interval_multiplier: far,
            metadata_drop_modulo: modulo,
        }
    }

    pub fn is_active(&self) -> bool {
        self.intensity > 0
    }

    /// Whether a metadata update for `visual` is shed this tick
    ///
    /// Critical and NEAR updates are never shed. The hash spreads the kept
    /// updates across visuals so no single visual starves.
    pub fn should_drop_metadata(&self, critical: bool, near: bool, visual: u32, tick: u64) -> bool {
        if critical || near || self.metadata_drop_modulo <= 1 {
            return false;
        }
        spread_hash(visual, tick) % u64::from(self.metadata_drop_modulo) != 0
    }
}

impl Default for SheddingState {
    fn default() -> Self {
        Self::DISABLED
    }
}

/// Backlog figures that drive the intensity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogSnapshot {
    pub total_queue_depth: usize,
    pub metadata_depth: usize,
    pub destroy_depth: usize,
    pub pending_destroy_ids: usize,
    pub destroy_fast_path: bool,
}

/// Maps backlog pressure to a [`SheddingState`]
#[derive(Debug, Clone, Copy)]
pub struct SheddingPolicy {
    threshold: usize,
}

impl SheddingPolicy {
    pub fn new(backlog_threshold: usize) -> Self {
        Self {
            threshold: backlog_threshold.max(1),
        }
    }

    pub fn compute(&self, backlog: &BacklogSnapshot) -> SheddingState {
        let mut intensity: u8 = 0;
        if backlog.total_queue_depth > self.threshold {
            intensity += 1;
        }
        if backlog.metadata_depth > self.threshold / 2 {
            intensity += 1;
        }
        if backlog.destroy_depth + backlog.pending_destroy_ids > self.threshold {
            intensity += 1;
        }
        if backlog.destroy_fast_path {
            intensity += 2;
        }
        SheddingState::for_intensity(intensity.min(MAX_INTENSITY))
    }
}

/// Cheap integer mix of (visual, tick)
#[inline]
fn spread_hash(visual: u32, tick: u64) -> u64 {
    let mut h = (u64::from(visual) << 32) ^ tick;
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h
}
