use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Tracker Defaults
// ============================================================================

/// Default cell edge of the candidate grid (world units)
pub const DEFAULT_CELL_SIZE: f64 = 16.0;

/// Default observer view distance (world units)
pub const DEFAULT_VIEW_DISTANCE: f64 = 64.0;

/// Smallest scheduler budget accepted after clamping (0.1 ms)
pub const MIN_SCHEDULER_WORK_NANOS: u64 = 100_000;

/// Bounds for the adaptive secondary-lane scale
pub const MIN_SECONDARY_SCALE: f64 = 0.05;
pub const MAX_SECONDARY_SCALE: f64 = 1.0;

/// Error returned when a loaded configuration is unusable
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be at least {min}")]
    BelowMinimum { field: &'static str, min: String },
    #[error("{field} must not be below {other}")]
    OutOfOrder {
        field: &'static str,
        other: &'static str,
    },
    #[error("{field} must be a finite number")]
    NotFinite { field: &'static str },
}

/// Tuning knobs for the visual tracker
///
/// Every knob is clamped by [`TrackerConfig::sanitized`] so the tick loop
/// never sees a non-positive budget.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Observer view radius (world units)
    pub view_distance: f64,
    /// Candidate grid cell edge (world units)
    pub cell_size: f64,

    /// NEAR tier: squared displacement that triggers a position packet
    pub near_position_threshold_sq: f32,
    /// NEAR tier: |dot| below which orientation counts as changed
    pub near_rotation_threshold_dot: f32,
    pub mid_position_threshold_sq: f32,
    pub mid_rotation_threshold_dot: f32,
    pub far_position_threshold_sq: f32,
    pub far_rotation_threshold_dot: f32,

    /// Distance where MID begins (NEAR is `<=` this)
    pub mid_distance: f64,
    /// Distance where FAR begins (MID is `<=` this)
    pub far_distance: f64,
    /// Minimum ticks between MID sends
    pub mid_update_interval_ticks: u32,
    /// Minimum ticks between FAR sends
    pub far_update_interval_ticks: u32,
    /// Allow stand-alone metadata packets at FAR tier
    pub far_allow_metadata_updates: bool,

    pub max_visibility_updates_per_observer_per_tick: usize,
    pub max_transform_checks_per_observer_per_tick: usize,
    /// Ticks between forced candidate rebuilds
    pub full_recalc_interval_ticks: u32,
    pub max_packets_per_observer_per_tick: usize,
    pub max_bytes_per_observer_per_tick: usize,

    /// Pending destroy count that switches on the drain fast path
    pub destroy_backlog_threshold: usize,
    /// Extra packet allowance per observer while draining destroys
    pub destroy_drain_extra_packets_per_observer_per_tick: usize,
    /// Ticks an unregistered id stays tombstoned
    pub tombstone_ttl_ticks: u64,

    /// Scheduler work budget per tick
    pub max_work_nanos_per_tick: u64,
    pub secondary_min_scale: f64,
    pub tick_duration_soft: Duration,
    pub tick_duration_hard: Duration,
    pub latency_soft_ms: f64,
    pub latency_hard_ms: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            view_distance: DEFAULT_VIEW_DISTANCE,
            cell_size: DEFAULT_CELL_SIZE,
            near_position_threshold_sq: 0.0001,
            near_rotation_threshold_dot: 0.3,
            mid_position_threshold_sq: 0.0016,
            mid_rotation_threshold_dot: 0.2,
            far_position_threshold_sq: 0.0081,
            far_rotation_threshold_dot: 0.1,
            mid_distance: 24.0,
            far_distance: 56.0,
            mid_update_interval_ticks: 2,
            far_update_interval_ticks: 4,
            far_allow_metadata_updates: false,
            max_visibility_updates_per_observer_per_tick: 256,
            max_transform_checks_per_observer_per_tick: 256,
            full_recalc_interval_ticks: 20,
            max_packets_per_observer_per_tick: 256,
            max_bytes_per_observer_per_tick: 98_304,
            destroy_backlog_threshold: 512,
            destroy_drain_extra_packets_per_observer_per_tick: 128,
            tombstone_ttl_ticks: 40,
            max_work_nanos_per_tick: 2_000_000,
            secondary_min_scale: 0.25,
            // 19.2 and 17.0 ticks per second
            tick_duration_soft: Duration::from_micros(52_083),
            tick_duration_hard: Duration::from_micros(58_824),
            latency_soft_ms: 120.0,
            latency_hard_ms: 220.0,
        }
    }
}

impl TrackerConfig {
    /// Load tracker knobs from `TRACKER_*` environment variables
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        read_env("TRACKER_VIEW_DISTANCE", &mut config.view_distance);
        read_env("TRACKER_CELL_SIZE", &mut config.cell_size);
        read_env("TRACKER_NEAR_POS_THRESHOLD_SQ", &mut config.near_position_threshold_sq);
        read_env("TRACKER_NEAR_ROT_THRESHOLD_DOT", &mut config.near_rotation_threshold_dot);
        read_env("TRACKER_MID_POS_THRESHOLD_SQ", &mut config.mid_position_threshold_sq);
        read_env("TRACKER_MID_ROT_THRESHOLD_DOT", &mut config.mid_rotation_threshold_dot);
        read_env("TRACKER_FAR_POS_THRESHOLD_SQ", &mut config.far_position_threshold_sq);
        read_env("TRACKER_FAR_ROT_THRESHOLD_DOT", &mut config.far_rotation_threshold_dot);
        read_env("TRACKER_MID_DISTANCE", &mut config.mid_distance);
        read_env("TRACKER_FAR_DISTANCE", &mut config.far_distance);
        read_env("TRACKER_MID_INTERVAL_TICKS", &mut config.mid_update_interval_ticks);
        read_env("TRACKER_FAR_INTERVAL_TICKS", &mut config.far_update_interval_ticks);
        read_env("TRACKER_FAR_ALLOW_METADATA", &mut config.far_allow_metadata_updates);
        read_env(
            "TRACKER_MAX_VISIBILITY_PER_TICK",
            &mut config.max_visibility_updates_per_observer_per_tick,
        );
        read_env(
            "TRACKER_MAX_TRANSFORM_PER_TICK",
            &mut config.max_transform_checks_per_observer_per_tick,
        );
        read_env("TRACKER_FULL_RECALC_TICKS", &mut config.full_recalc_interval_ticks);
        read_env("TRACKER_MAX_PACKETS_PER_TICK", &mut config.max_packets_per_observer_per_tick);
        read_env("TRACKER_MAX_BYTES_PER_TICK", &mut config.max_bytes_per_observer_per_tick);
        read_env("TRACKER_DESTROY_BACKLOG_THRESHOLD", &mut config.destroy_backlog_threshold);
        read_env(
            "TRACKER_DESTROY_DRAIN_EXTRA",
            &mut config.destroy_drain_extra_packets_per_observer_per_tick,
        );
        read_env("TRACKER_TOMBSTONE_TTL_TICKS", &mut config.tombstone_ttl_ticks);
        read_env("TRACKER_MAX_WORK_NANOS", &mut config.max_work_nanos_per_tick);
        read_env("TRACKER_SECONDARY_MIN_SCALE", &mut config.secondary_min_scale);
        read_env("TRACKER_LATENCY_SOFT_MS", &mut config.latency_soft_ms);
        read_env("TRACKER_LATENCY_HARD_MS", &mut config.latency_hard_ms);

        let mut soft_micros = config.tick_duration_soft.as_micros() as u64;
        let mut hard_micros = config.tick_duration_hard.as_micros() as u64;
        read_env("TRACKER_TICK_SOFT_MICROS", &mut soft_micros);
        read_env("TRACKER_TICK_HARD_MICROS", &mut hard_micros);
        config.tick_duration_soft = Duration::from_micros(soft_micros);
        config.tick_duration_hard = Duration::from_micros(hard_micros);

        config.sanitized()
    }

    /// Clamp every knob into its safe range
    ///
    /// Budgets become at least 1, intervals at least 1 tick, the scheduler
    /// budget at least 0.1 ms and hard thresholds never precede soft ones.
    pub fn sanitized(mut self) -> Self {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            self.cell_size = DEFAULT_CELL_SIZE;
        }
        if !self.view_distance.is_finite() || self.view_distance < 0.0 {
            self.view_distance = DEFAULT_VIEW_DISTANCE;
        }
        self.mid_distance = self.mid_distance.max(0.0);
        self.far_distance = self.far_distance.max(self.mid_distance);

        self.mid_update_interval_ticks = self.mid_update_interval_ticks.max(1);
        self.far_update_interval_ticks = self.far_update_interval_ticks.max(1);
        self.full_recalc_interval_ticks = self.full_recalc_interval_ticks.max(1);

        self.max_visibility_updates_per_observer_per_tick =
            self.max_visibility_updates_per_observer_per_tick.max(1);
        self.max_transform_checks_per_observer_per_tick =
            self.max_transform_checks_per_observer_per_tick.max(1);
        self.max_packets_per_observer_per_tick = self.max_packets_per_observer_per_tick.max(1);
        self.max_bytes_per_observer_per_tick = self.max_bytes_per_observer_per_tick.max(1);
        self.destroy_backlog_threshold = self.destroy_backlog_threshold.max(1);
        self.tombstone_ttl_ticks = self.tombstone_ttl_ticks.max(1);

        self.max_work_nanos_per_tick = self.max_work_nanos_per_tick.max(MIN_SCHEDULER_WORK_NANOS);
        if !self.secondary_min_scale.is_finite() {
            self.secondary_min_scale = MAX_SECONDARY_SCALE;
        }
        self.secondary_min_scale = self
            .secondary_min_scale
            .clamp(MIN_SECONDARY_SCALE, MAX_SECONDARY_SCALE);

        if self.tick_duration_hard < self.tick_duration_soft {
            self.tick_duration_hard = self.tick_duration_soft;
        }
        self.latency_soft_ms = self.latency_soft_ms.max(0.0);
        if self.latency_hard_ms < self.latency_soft_ms {
            self.latency_hard_ms = self.latency_soft_ms;
        }
        self
    }

    /// Check invariants without modifying anything
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.view_distance.is_finite() {
            return Err(ConfigError::NotFinite { field: "view_distance" });
        }
        if !(self.cell_size > 0.0) {
            return Err(ConfigError::BelowMinimum {
                field: "cell_size",
                min: "a positive value".to_string(),
            });
        }
        if self.far_distance < self.mid_distance {
            return Err(ConfigError::OutOfOrder {
                field: "far_distance",
                other: "mid_distance",
            });
        }
        if self.max_work_nanos_per_tick < MIN_SCHEDULER_WORK_NANOS {
            return Err(ConfigError::BelowMinimum {
                field: "max_work_nanos_per_tick",
                min: MIN_SCHEDULER_WORK_NANOS.to_string(),
            });
        }
        if self.tick_duration_hard < self.tick_duration_soft {
            return Err(ConfigError::OutOfOrder {
                field: "tick_duration_hard",
                other: "tick_duration_soft",
            });
        }
        if self.latency_hard_ms < self.latency_soft_ms {
            return Err(ConfigError::OutOfOrder {
                field: "latency_hard_ms",
                other: "latency_soft_ms",
            });
        }
        let budgets = [
            ("max_visibility_updates_per_observer_per_tick", self.max_visibility_updates_per_observer_per_tick),
            ("max_transform_checks_per_observer_per_tick", self.max_transform_checks_per_observer_per_tick),
            ("max_packets_per_observer_per_tick", self.max_packets_per_observer_per_tick),
            ("max_bytes_per_observer_per_tick", self.max_bytes_per_observer_per_tick),
        ];
        for (field, value) in budgets {
            if value == 0 {
                return Err(ConfigError::BelowMinimum {
                    field,
                    min: "1".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn view_distance_sq(&self) -> f64 {
        self.view_distance * self.view_distance
    }

    pub fn mid_distance_sq(&self) -> f64 {
        self.mid_distance * self.mid_distance
    }

    pub fn far_distance_sq(&self) -> f64 {
        self.far_distance * self.far_distance
    }

    /// View radius expressed in whole grid cells
    pub fn view_distance_cells(&self) -> i32 {
        (self.view_distance / self.cell_size).ceil() as i32
    }
}

/// Demo server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Simulation tick rate (Hz)
    pub tick_rate: u32,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
    /// Number of synthetic visuals spawned by the demo
    pub demo_visuals: usize,
    /// Number of synthetic observers
    pub demo_observers: usize,
    /// Radius of the square the demo scatters bodies over
    pub world_half_extent: f64,
    pub tracker: TrackerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            metrics_port: 9090,
            demo_visuals: 2_000,
            demo_observers: 32,
            world_half_extent: 256.0,
            tracker: TrackerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(rate) = std::env::var("TICK_RATE") {
            if let Ok(parsed) = rate.parse::<u32>() {
                if parsed > 0 && parsed <= 1000 {
                    config.tick_rate = parsed;
                } else {
                    tracing::warn!("TICK_RATE must be 1-1000, using default");
                }
            } else {
                tracing::warn!("Invalid TICK_RATE '{}', using default", rate);
            }
        }

        read_env("METRICS_PORT", &mut config.metrics_port);
        read_env("DEMO_VISUALS", &mut config.demo_visuals);
        read_env("DEMO_OBSERVERS", &mut config.demo_observers);
        read_env("DEMO_WORLD_HALF_EXTENT", &mut config.world_half_extent);

        config.tracker = TrackerConfig::load_or_default();
        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::BelowMinimum {
                field: "tick_rate",
                min: "1".to_string(),
            });
        }
        if !self.world_half_extent.is_finite() {
            return Err(ConfigError::NotFinite { field: "world_half_extent" });
        }
        self.tracker.validate()
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }
}

/// Overwrite `target` with a parsed env var, warning on garbage
fn read_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.trim().parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Invalid {} '{}', using default", key, raw),
        }
    }
}
