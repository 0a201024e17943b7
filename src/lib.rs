//! Visual Sync Server Library
//!
//! Interest management and network sync scheduling for visual entities.
//! Decides which visuals each observer sees, what changed about them and
//! when the resulting packets go out, all under per-tick budgets.
//!
//! # Features
//!
//! - `metrics_extended` - Per-lane depths and destroy latency on the Prometheus endpoint (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod tracker;
