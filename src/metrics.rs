//! Prometheus-compatible metrics endpoint
//!
//! Exposes tracker metrics in Prometheus format for Grafana dashboards.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::tracker::TrackerStats;

/// Rolling tick samples kept for percentiles
const TICK_HISTORY: usize = 1000;

/// Metrics registry for the tracker
#[derive(Debug)]
pub struct Metrics {
    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,
    pub budget_usage_percent: AtomicU64,

    // Registry
    pub visuals: AtomicU64,
    pub observers: AtomicU64,
    pub tombstones: AtomicU64,
    pub visible_pairs: AtomicU64,
    pub queued_packets: AtomicU64,

    // Flush
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_deferred: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub avg_packets_per_observer_x100: AtomicU64,
    pub peak_packets_per_observer: AtomicU64,

    // Update policy
    pub updates_dropped: AtomicU64,
    pub coalesced_packets: AtomicU64,
    pub coalesced_tasks: AtomicU64,
    pub lod_skipped_updates: AtomicU64,
    pub lod_skipped_metadata: AtomicU64,
    pub transform_checks_skipped: AtomicU64,
    pub ignored_updates: AtomicU64,
    pub skipped_tasks: AtomicU64,
    pub encode_failures: AtomicU64,

    // Scheduler
    pub scheduler_work_us: AtomicU64,
    pub scheduler_deferred: AtomicU64,
    pub secondary_scale_x100: AtomicU64,
    pub oldest_queue_age_us: AtomicU64,
    pub lane_depth_spawn: AtomicU64,
    pub lane_depth_destroy: AtomicU64,
    pub lane_depth_visibility: AtomicU64,
    pub lane_depth_metadata: AtomicU64,

    // Destroy backlog and shedding
    pub destroy_fast_path: AtomicU64,
    pub pending_destroy_ids: AtomicU64,
    pub mass_boost_ticks: AtomicU64,
    pub destroy_backlog_age_ticks: AtomicU64,
    pub destroy_latency_avg_ticks_x100: AtomicU64,
    pub destroy_latency_peak_ticks: AtomicU64,
    pub shedding_intensity: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling tick times for percentile calculation (VecDeque for O(1) pop_front)
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            budget_usage_percent: AtomicU64::new(0),
            visuals: AtomicU64::new(0),
            observers: AtomicU64::new(0),
            tombstones: AtomicU64::new(0),
            visible_pairs: AtomicU64::new(0),
            queued_packets: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_deferred: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            avg_packets_per_observer_x100: AtomicU64::new(0),
            peak_packets_per_observer: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
            coalesced_packets: AtomicU64::new(0),
            coalesced_tasks: AtomicU64::new(0),
            lod_skipped_updates: AtomicU64::new(0),
            lod_skipped_metadata: AtomicU64::new(0),
            transform_checks_skipped: AtomicU64::new(0),
            ignored_updates: AtomicU64::new(0),
            skipped_tasks: AtomicU64::new(0),
            encode_failures: AtomicU64::new(0),
            scheduler_work_us: AtomicU64::new(0),
            scheduler_deferred: AtomicU64::new(0),
            secondary_scale_x100: AtomicU64::new(100),
            oldest_queue_age_us: AtomicU64::new(0),
            lane_depth_spawn: AtomicU64::new(0),
            lane_depth_destroy: AtomicU64::new(0),
            lane_depth_visibility: AtomicU64::new(0),
            lane_depth_metadata: AtomicU64::new(0),
            destroy_fast_path: AtomicU64::new(0),
            pending_destroy_ids: AtomicU64::new(0),
            mass_boost_ticks: AtomicU64::new(0),
            destroy_backlog_age_ticks: AtomicU64::new(0),
            destroy_latency_avg_ticks_x100: AtomicU64::new(0),
            destroy_latency_peak_ticks: AtomicU64::new(0),
            shedding_intensity: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration, budget: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);
        if !budget.is_zero() {
            let percent = duration.as_secs_f64() / budget.as_secs_f64() * 100.0;
            self.budget_usage_percent.store(percent.round() as u64, Ordering::Relaxed);
        }

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us.store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Publish a tracker snapshot
    pub fn record_stats(&self, stats: &TrackerStats) {
        let set = |gauge: &AtomicU64, value: u64| gauge.store(value, Ordering::Relaxed);
        let counters = &stats.counters;
        let totals = &stats.flush_totals;

        set(&self.visuals, stats.visuals as u64);
        set(&self.observers, stats.observers as u64);
        set(&self.tombstones, stats.tombstones as u64);
        set(&self.visible_pairs, stats.visible_pairs as u64);
        set(&self.queued_packets, stats.queued_packets as u64);

        set(&self.packets_sent, totals.packets_sent);
        set(&self.bytes_sent, totals.bytes_sent);
        set(&self.packets_deferred, totals.deferred_packets);
        set(&self.packets_dropped, counters.dropped_packets);
        set(&self.avg_packets_per_observer_x100, (totals.avg_packets_per_observer * 100.0) as u64);
        set(&self.peak_packets_per_observer, totals.peak_packets_per_observer as u64);

        set(&self.updates_dropped, counters.dropped_updates);
        set(&self.coalesced_packets, counters.coalesced_packets);
        set(&self.coalesced_tasks, stats.coalesced_tasks);
        set(&self.lod_skipped_updates, counters.lod_skipped_updates);
        set(&self.lod_skipped_metadata, counters.lod_skipped_metadata_updates);
        set(&self.transform_checks_skipped, counters.transform_checks_skipped_due_budget);
        set(&self.ignored_updates, counters.ignored_updates);
        set(&self.skipped_tasks, counters.skipped_tasks);
        set(&self.encode_failures, counters.encode_failures);

        set(&self.scheduler_work_us, stats.scheduler.work_nanos / 1_000);
        set(&self.scheduler_deferred, stats.scheduler.deferred as u64);
        set(&self.secondary_scale_x100, (stats.scheduler.split.secondary_scale * 100.0) as u64);
        set(&self.oldest_queue_age_us, stats.oldest_queue_age.as_micros() as u64);
        let [spawn, destroy, visibility, metadata] = stats.lane_depths;
        set(&self.lane_depth_spawn, spawn as u64);
        set(&self.lane_depth_destroy, destroy as u64);
        set(&self.lane_depth_visibility, visibility as u64);
        set(&self.lane_depth_metadata, metadata as u64);

        set(&self.destroy_fast_path, u64::from(stats.backlog.fast_path_active));
        set(&self.pending_destroy_ids, stats.backlog.pending_ids as u64);
        set(&self.mass_boost_ticks, u64::from(stats.backlog.mass_boost_ticks));
        set(&self.destroy_backlog_age_ticks, stats.destroy_backlog_age_ticks);
        set(
            &self.destroy_latency_avg_ticks_x100,
            (totals.average_destroy_latency_ticks() * 100.0) as u64,
        );
        set(&self.destroy_latency_peak_ticks, totals.destroy_latency_peak_ticks);
        set(&self.shedding_intensity, u64::from(stats.shedding_intensity));
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Tick metrics
        metric!("visual_sync_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("visual_sync_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("visual_sync_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("visual_sync_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("visual_sync_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("visual_sync_budget_usage_percent", "Tick budget usage percentage", "gauge",
            self.budget_usage_percent.load(Ordering::Relaxed));

        // Registry
        metric!("visual_sync_visuals", "Tracked visuals", "gauge",
            self.visuals.load(Ordering::Relaxed));
        metric!("visual_sync_observers", "Tracked observers", "gauge",
            self.observers.load(Ordering::Relaxed));
        metric!("visual_sync_tombstones", "Open tombstone windows", "gauge",
            self.tombstones.load(Ordering::Relaxed));
        metric!("visual_sync_visible_pairs", "Observer/visual pairs currently visible", "gauge",
            self.visible_pairs.load(Ordering::Relaxed));
        metric!("visual_sync_queued_packets", "Packets waiting in observer queues", "gauge",
            self.queued_packets.load(Ordering::Relaxed));

        // Flush
        metric!("visual_sync_packets_sent_total", "Packets delivered to the sink", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("visual_sync_bytes_sent_total", "Estimated bytes delivered to the sink", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("visual_sync_packets_deferred_total", "Packets left queued after a flush", "counter",
            self.packets_deferred.load(Ordering::Relaxed));
        metric!("visual_sync_packets_dropped_total", "Stale, offline or rejected packets", "counter",
            self.packets_dropped.load(Ordering::Relaxed));
        metric!("visual_sync_packets_per_observer_avg", "Average packets per observer per flush", "gauge",
            self.avg_packets_per_observer_x100.load(Ordering::Relaxed) as f64 / 100.0);
        metric!("visual_sync_packets_per_observer_peak", "Peak packets to one observer in a flush", "gauge",
            self.peak_packets_per_observer.load(Ordering::Relaxed));

        // Update policy
        metric!("visual_sync_updates_dropped_total", "Updates discarded before queueing", "counter",
            self.updates_dropped.load(Ordering::Relaxed));
        metric!("visual_sync_coalesced_packets_total", "Teleports replaced while queued", "counter",
            self.coalesced_packets.load(Ordering::Relaxed));
        metric!("visual_sync_coalesced_tasks_total", "Metadata lane tasks merged", "counter",
            self.coalesced_tasks.load(Ordering::Relaxed));
        metric!("visual_sync_lod_skipped_updates_total", "Moves held back by MID/FAR tiers", "counter",
            self.lod_skipped_updates.load(Ordering::Relaxed));
        metric!("visual_sync_lod_skipped_metadata_total", "Metadata held back by MID/FAR tiers", "counter",
            self.lod_skipped_metadata.load(Ordering::Relaxed));
        metric!("visual_sync_transform_checks_skipped_total", "Visible checks deferred by budget", "counter",
            self.transform_checks_skipped.load(Ordering::Relaxed));
        metric!("visual_sync_ignored_updates_total", "Physics updates for tombstoned or unknown visuals", "counter",
            self.ignored_updates.load(Ordering::Relaxed));
        metric!("visual_sync_skipped_tasks_total", "Lane tasks whose target was gone", "counter",
            self.skipped_tasks.load(Ordering::Relaxed));
        metric!("visual_sync_encode_failures_total", "Packet encode failures", "counter",
            self.encode_failures.load(Ordering::Relaxed));

        // Scheduler
        metric!("visual_sync_scheduler_work_microseconds", "Lane work in the last tick", "gauge",
            self.scheduler_work_us.load(Ordering::Relaxed));
        metric!("visual_sync_scheduler_deferred", "Lane tasks deferred in the last tick", "gauge",
            self.scheduler_deferred.load(Ordering::Relaxed));
        metric!("visual_sync_secondary_scale", "Adaptive scale of the secondary budget", "gauge",
            self.secondary_scale_x100.load(Ordering::Relaxed) as f64 / 100.0);
        metric!("visual_sync_oldest_queue_age_microseconds", "Age of the oldest queued lane task", "gauge",
            self.oldest_queue_age_us.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            for (lane, depth) in [
                ("spawn", &self.lane_depth_spawn),
                ("destroy", &self.lane_depth_destroy),
                ("visibility", &self.lane_depth_visibility),
                ("metadata", &self.lane_depth_metadata),
            ] {
                output.push_str(&format!(
                    "visual_sync_lane_depth{{lane=\"{}\"}} {}\n",
                    lane,
                    depth.load(Ordering::Relaxed)
                ));
            }
            metric!("visual_sync_destroy_latency_avg_ticks", "Average ticks from destroy registration to send", "gauge",
                self.destroy_latency_avg_ticks_x100.load(Ordering::Relaxed) as f64 / 100.0);
            metric!("visual_sync_destroy_latency_peak_ticks", "Peak ticks from destroy registration to send", "gauge",
                self.destroy_latency_peak_ticks.load(Ordering::Relaxed));
        }

        // Destroy backlog and shedding
        metric!("visual_sync_destroy_fast_path", "Destroy drain fast path active (0/1)", "gauge",
            self.destroy_fast_path.load(Ordering::Relaxed));
        metric!("visual_sync_pending_destroy_ids", "Unregistered ids waiting for destroy tasks", "gauge",
            self.pending_destroy_ids.load(Ordering::Relaxed));
        metric!("visual_sync_mass_boost_ticks", "Remaining mass-destroy boost ticks", "gauge",
            self.mass_boost_ticks.load(Ordering::Relaxed));
        metric!("visual_sync_destroy_backlog_age_ticks", "Age of the oldest pending unregister", "gauge",
            self.destroy_backlog_age_ticks.load(Ordering::Relaxed));
        metric!("visual_sync_shedding_intensity", "Load shedding intensity (0-4)", "gauge",
            self.shedding_intensity.load(Ordering::Relaxed));
        metric!("visual_sync_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        let load = |gauge: &AtomicU64| gauge.load(Ordering::Relaxed);
        serde_json::json!({
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "budget_percent": load(&self.budget_usage_percent),
            },
            "registry": {
                "visuals": load(&self.visuals),
                "observers": load(&self.observers),
                "tombstones": load(&self.tombstones),
                "visible_pairs": load(&self.visible_pairs),
                "queued_packets": load(&self.queued_packets),
            },
            "flush": {
                "packets_sent": load(&self.packets_sent),
                "bytes_sent": load(&self.bytes_sent),
                "packets_deferred": load(&self.packets_deferred),
                "packets_dropped": load(&self.packets_dropped),
                "peak_packets_per_observer": load(&self.peak_packets_per_observer),
            },
            "scheduler": {
                "work_us": load(&self.scheduler_work_us),
                "deferred": load(&self.scheduler_deferred),
                "secondary_scale": load(&self.secondary_scale_x100) as f64 / 100.0,
                "lane_depths": {
                    "spawn": load(&self.lane_depth_spawn),
                    "destroy": load(&self.lane_depth_destroy),
                    "visibility": load(&self.lane_depth_visibility),
                    "metadata": load(&self.lane_depth_metadata),
                },
            },
            "backlog": {
                "fast_path": load(&self.destroy_fast_path) == 1,
                "pending_destroy_ids": load(&self.pending_destroy_ids),
                "mass_boost_ticks": load(&self.mass_boost_ticks),
                "shedding_intensity": load(&self.shedding_intensity),
            },
            "uptime_seconds": self.uptime_seconds(),
        })
        .to_string()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(&mut socket, &metrics).await {
                debug!("Metrics connection {} failed: {}", peer, e);
            }
        });
    }
}

/// Answer a single HTTP request on `socket`
pub async fn handle_connection<S>(socket: &mut S, metrics: &Metrics) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = [0u8; 1024];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }
    let request = String::from_utf8_lossy(&buffer[..n]);

    let response = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        http_ok("application/json", &metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        http_ok("text/plain; version=0.0.4", &metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        http_ok("text/plain", "OK")
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    socket.write_all(response.as_bytes()).await
}

fn http_ok(content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerCounters;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.visuals.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10), Duration::from_millis(50));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert!(metrics.tick_time_p99_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_budget_usage() {
        let metrics = Metrics::new();
        metrics.record_tick_time(Duration::from_millis(25), Duration::from_millis(50));
        assert_eq!(metrics.budget_usage_percent.load(Ordering::Relaxed), 50);
    }

    #[test]
    fn test_record_stats() {
        let metrics = Metrics::new();
        let stats = TrackerStats {
            visuals: 12,
            observers: 3,
            lane_depths: [1, 2, 3, 4],
            counters: TrackerCounters {
                dropped_packets: 7,
                ..TrackerCounters::default()
            },
            shedding_intensity: 2,
            ..TrackerStats::default()
        };
        metrics.record_stats(&stats);

        assert_eq!(metrics.visuals.load(Ordering::Relaxed), 12);
        assert_eq!(metrics.observers.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.lane_depth_metadata.load(Ordering::Relaxed), 4);
        assert_eq!(metrics.packets_dropped.load(Ordering::Relaxed), 7);
        assert_eq!(metrics.shedding_intensity.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.visuals.store(50, Ordering::Relaxed);
        metrics.observers.store(5, Ordering::Relaxed);

        let output = metrics.to_prometheus();

        assert!(output.contains("visual_sync_visuals 50"));
        assert!(output.contains("visual_sync_observers 5"));
        assert!(output.contains("visual_sync_secondary_scale 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        metrics.visuals.store(100, Ordering::Relaxed);

        let parsed: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(parsed["registry"]["visuals"], 100);
        assert_eq!(parsed["backlog"]["fast_path"], false);
    }

    #[test]
    fn test_health_endpoint() {
        let metrics = Metrics::new();
        let mut socket = tokio_test::io::Builder::new()
            .read(b"GET /health HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK")
            .build();

        tokio_test::block_on(handle_connection(&mut socket, &metrics)).unwrap();
    }

    #[test]
    fn test_unknown_path_is_404() {
        let metrics = Metrics::new();
        let mut socket = tokio_test::io::Builder::new()
            .read(b"POST /nope HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .build();

        tokio_test::block_on(handle_connection(&mut socket, &metrics)).unwrap();
    }
}
