//! Per-observer packet drain
//!
//! Once per tick every observer's queue is drained in priority order under
//! a packet and byte budget and handed to the sink as a single batch.
//! Destroys may run past the packet budget while a destroy burst (drain fast
//! path or mass-destroy boost) is active. Whatever is left stays queued for
//! the next tick.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use super::packet::{ObserverPacketQueue, PacketPriority};
use super::tokens::VisualTokenService;
use super::{ObserverId, Tick};
use crate::config::TrackerConfig;
use crate::net::transport::{Packet, PacketSink};

/// Minimum extra packets granted per observer by the mass-destroy boost
const MASS_BOOST_MIN_EXTRA_PACKETS: usize = 16;

/// Budgets for one flush, derived from config and burst state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushBudget {
    pub max_packets: usize,
    /// Packet cap including destroy burst extras
    pub max_packets_with_burst: usize,
    pub max_bytes: usize,
    /// Byte cap applied to destroys while the mass boost is active
    pub destroy_max_bytes: usize,
    pub destroy_burst: bool,
}

impl FlushBudget {
    pub fn new(config: &TrackerConfig, fast_path: bool, mass_boost: bool) -> Self {
        let max_packets = unlimited_if_zero(config.max_packets_per_observer_per_tick);
        let max_bytes = unlimited_if_zero(config.max_bytes_per_observer_per_tick);

        let mut with_burst = max_packets;
        if fast_path && max_packets != usize::MAX {
            with_burst = with_burst.saturating_add(config.destroy_drain_extra_packets_per_observer_per_tick);
        }
        if mass_boost && with_burst != usize::MAX {
            with_burst = with_burst.saturating_add((with_burst / 2).max(MASS_BOOST_MIN_EXTRA_PACKETS));
        }
        let destroy_max_bytes = if mass_boost && max_bytes != usize::MAX {
            max_bytes.saturating_add(max_bytes / 2)
        } else {
            max_bytes
        };

        Self {
            max_packets,
            max_packets_with_burst: with_burst,
            max_bytes,
            destroy_max_bytes,
            destroy_burst: fast_path || mass_boost,
        }
    }
}

fn unlimited_if_zero(limit: usize) -> usize {
    if limit == 0 {
        usize::MAX
    } else {
        limit
    }
}

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub observers_with_packets: usize,
    /// Most packets sent to a single observer this flush
    pub tick_peak: usize,
    /// Packets left queued after the flush
    pub deferred: usize,
    pub dropped_stale: u64,
    pub dropped_offline: u64,
}

/// Running flush metrics across ticks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlushTotals {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub deferred_packets: u64,
    pub dropped_packets: u64,
    pub destroy_latency_total_ticks: u64,
    pub destroy_latency_samples: u64,
    pub destroy_latency_peak_ticks: u64,
    pub avg_packets_per_observer: f64,
    pub peak_packets_per_observer: usize,
    avg_samples: u64,
}

impl FlushTotals {
    pub fn average_destroy_latency_ticks(&self) -> f64 {
        if self.destroy_latency_samples == 0 {
            0.0
        } else {
            self.destroy_latency_total_ticks as f64 / self.destroy_latency_samples as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct PacketFlushProcessor {
    totals: FlushTotals,
    last: FlushStats,
}

impl PacketFlushProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every queue once
    ///
    /// Queues of observers not in `online` are cleared and counted as
    /// dropped; entries whose token went stale are dropped as they surface.
    pub fn flush(
        &mut self,
        queues: &mut FxHashMap<ObserverId, ObserverPacketQueue>,
        online: &FxHashSet<ObserverId>,
        tokens: &VisualTokenService,
        budget: FlushBudget,
        tick: Tick,
        sink: &mut dyn PacketSink,
    ) -> FlushStats {
        let mut stats = FlushStats::default();
        let mut batch: Vec<Packet> = Vec::new();

        for (observer, queue) in queues.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            if !online.contains(observer) {
                stats.dropped_offline += queue.clear() as u64;
                continue;
            }

            batch.clear();
            let mut sent_bytes = 0usize;
            while batch.len() < budget.max_packets_with_burst {
                let Some(next) = queue.front() else {
                    break;
                };
                if !next.is_current(tokens) {
                    queue.pop_front();
                    stats.dropped_stale += 1;
                    continue;
                }

                let is_destroy = next.priority == PacketPriority::Destroy;
                if batch.len() >= budget.max_packets && !(is_destroy && budget.destroy_burst) {
                    break;
                }
                let byte_budget = if is_destroy {
                    budget.destroy_max_bytes
                } else {
                    budget.max_bytes
                };
                // An oversized packet still goes out alone
                if sent_bytes.saturating_add(next.estimated_bytes) > byte_budget && !batch.is_empty() {
                    break;
                }

                let Some(entry) = queue.pop_front() else {
                    break;
                };
                sent_bytes = sent_bytes.saturating_add(entry.estimated_bytes);
                if let Some(registered) = entry.destroy_registered_tick {
                    let latency = tick.saturating_sub(registered);
                    self.totals.destroy_latency_total_ticks += latency;
                    self.totals.destroy_latency_samples += 1;
                    self.totals.destroy_latency_peak_ticks = self.totals.destroy_latency_peak_ticks.max(latency);
                }
                batch.push(entry.packet);
            }

            if !batch.is_empty() {
                sink.send_batch(*observer, &batch);
                stats.packets_sent += batch.len() as u64;
                stats.bytes_sent += sent_bytes as u64;
                stats.observers_with_packets += 1;
                stats.tick_peak = stats.tick_peak.max(batch.len());
            }
            stats.deferred += queue.len();
        }

        queues.retain(|observer, queue| !queue.is_empty() || online.contains(observer));
        self.record(stats);
        stats
    }

    fn record(&mut self, stats: FlushStats) {
        let totals = &mut self.totals;
        totals.packets_sent += stats.packets_sent;
        totals.bytes_sent += stats.bytes_sent;
        totals.deferred_packets += stats.deferred as u64;
        totals.dropped_packets += stats.dropped_stale + stats.dropped_offline;
        totals.peak_packets_per_observer = totals.peak_packets_per_observer.max(stats.tick_peak);
        if stats.observers_with_packets > 0 {
            let per_observer = stats.packets_sent as f64 / stats.observers_with_packets as f64;
            totals.avg_samples += 1;
            totals.avg_packets_per_observer +=
                (per_observer - totals.avg_packets_per_observer) / totals.avg_samples as f64;
        }
        if stats.deferred > 0 {
            debug!(
                "Flush deferred {} packets ({} sent to {} observers)",
                stats.deferred, stats.packets_sent, stats.observers_with_packets
            );
        }
        self.last = stats;
    }

    pub fn last(&self) -> &FlushStats {
        &self.last
    }

    pub fn totals(&self) -> &FlushTotals {
        &self.totals
    }

    pub fn clear(&mut self) {
        self.totals = FlushTotals::default();
        self.last = FlushStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::RecordingSink;
    use crate::tracker::packet::QueuedPacket;
    use uuid::Uuid;

    fn config(max_packets: usize, max_bytes: usize) -> TrackerConfig {
        TrackerConfig {
            max_packets_per_observer_per_tick: max_packets,
            max_bytes_per_observer_per_tick: max_bytes,
            destroy_drain_extra_packets_per_observer_per_tick: 4,
            ..TrackerConfig::default()
        }
    }

    fn metadata(visual: u32, token: u64, bytes: usize) -> QueuedPacket {
        QueuedPacket::for_visual(
            Packet::frame(vec![visual as u8]),
            PacketPriority::Metadata,
            visual,
            token,
            bytes,
        )
    }

    fn destroy(visual: u32, bytes: usize, tick: Tick) -> QueuedPacket {
        QueuedPacket::destroy(Packet::frame(vec![0xff, visual as u8]), bytes, tick)
    }

    fn setup(observer: ObserverId) -> (FxHashMap<ObserverId, ObserverPacketQueue>, FxHashSet<ObserverId>) {
        let mut queues = FxHashMap::default();
        queues.insert(observer, ObserverPacketQueue::new());
        let mut online = FxHashSet::default();
        online.insert(observer);
        (queues, online)
    }

    #[test]
    fn test_budget_extras() {
        let cfg = config(10, 1000);
        let plain = FlushBudget::new(&cfg, false, false);
        assert_eq!(plain.max_packets_with_burst, 10);
        assert!(!plain.destroy_burst);

        let fast = FlushBudget::new(&cfg, true, false);
        assert_eq!(fast.max_packets_with_burst, 14);

        let boosted = FlushBudget::new(&cfg, true, true);
        assert_eq!(boosted.max_packets_with_burst, 14 + 16, "Boost adds at least 16");
        assert_eq!(boosted.destroy_max_bytes, 1500);

        let unlimited = FlushBudget::new(&config(0, 0), true, true);
        assert_eq!(unlimited.max_packets, usize::MAX);
        assert_eq!(unlimited.destroy_max_bytes, usize::MAX);
    }

    #[test]
    fn test_priority_order_and_packet_cap() {
        let observer = Uuid::new_v4();
        let (mut queues, online) = setup(observer);
        let tokens = VisualTokenService::new();
        let queue = queues.get_mut(&observer).unwrap();
        for visual in 0..5 {
            queue.push(metadata(visual, 0, 10), &tokens);
        }
        queue.push(destroy(9, 10, 0), &tokens);

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        let stats = flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(3, 1000), false, false), 1, &mut sink);

        assert_eq!(stats.packets_sent, 3);
        assert_eq!(stats.deferred, 3);
        let sent = sink.packets_for(observer);
        assert_eq!(sent[0], Packet::frame(vec![0xff, 9]), "Destroy drains first");
        assert_eq!(sink.batches.len(), 1, "One batch per observer");
    }

    #[test]
    fn test_stale_entries_dropped() {
        let observer = Uuid::new_v4();
        let (mut queues, online) = setup(observer);
        let mut tokens = VisualTokenService::new();
        queues.get_mut(&observer).unwrap().push(metadata(1, 0, 10), &tokens);
        queues.get_mut(&observer).unwrap().push(metadata(2, 0, 10), &tokens);
        tokens.bump(1);

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        let stats = flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(10, 1000), false, false), 1, &mut sink);

        assert_eq!(stats.dropped_stale, 1);
        assert_eq!(sink.packets_for(observer), vec![Packet::frame(vec![2])]);
    }

    #[test]
    fn test_offline_queue_cleared() {
        let observer = Uuid::new_v4();
        let (mut queues, _) = setup(observer);
        let tokens = VisualTokenService::new();
        queues.get_mut(&observer).unwrap().push(metadata(1, 0, 10), &tokens);
        queues.get_mut(&observer).unwrap().push(destroy(2, 10, 0), &tokens);

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        let stats = flush.flush(
            &mut queues,
            &FxHashSet::default(),
            &tokens,
            FlushBudget::new(&config(10, 1000), false, false),
            1,
            &mut sink,
        );

        assert_eq!(stats.dropped_offline, 2);
        assert!(sink.batches.is_empty());
        assert!(queues.is_empty(), "Offline queue is released");
    }

    #[test]
    fn test_byte_budget_allows_single_oversized_packet() {
        let observer = Uuid::new_v4();
        let (mut queues, online) = setup(observer);
        let tokens = VisualTokenService::new();
        queues.get_mut(&observer).unwrap().push(metadata(1, 0, 500), &tokens);
        queues.get_mut(&observer).unwrap().push(metadata(2, 0, 10), &tokens);

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        let stats = flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(10, 100), false, false), 1, &mut sink);

        assert_eq!(stats.packets_sent, 1, "Oversized first packet is sent, the next one waits");
        assert_eq!(stats.deferred, 1);
    }

    #[test]
    fn test_destroy_burst_past_packet_cap() {
        let observer = Uuid::new_v4();
        let (mut queues, online) = setup(observer);
        let tokens = VisualTokenService::new();
        for visual in 0..8 {
            queues.get_mut(&observer).unwrap().push(destroy(visual, 10, 0), &tokens);
        }

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        let plain = flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(2, 1000), false, false), 1, &mut sink);
        assert_eq!(plain.packets_sent, 2);

        let burst = flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(2, 1000), true, false), 2, &mut sink);
        assert_eq!(burst.packets_sent, 6, "2 + 4 extra while the fast path is on");
        assert_eq!(burst.deferred, 0);
    }

    #[test]
    fn test_destroy_latency_tracked() {
        let observer = Uuid::new_v4();
        let (mut queues, online) = setup(observer);
        let tokens = VisualTokenService::new();
        queues.get_mut(&observer).unwrap().push(destroy(1, 10, 3), &tokens);
        queues.get_mut(&observer).unwrap().push(destroy(2, 10, 7), &tokens);

        let mut sink = RecordingSink::new();
        let mut flush = PacketFlushProcessor::new();
        flush.flush(&mut queues, &online, &tokens, FlushBudget::new(&config(10, 1000), false, false), 8, &mut sink);

        let totals = flush.totals();
        assert_eq!(totals.destroy_latency_samples, 2);
        assert_eq!(totals.destroy_latency_peak_ticks, 5);
        assert_eq!(totals.average_destroy_latency_ticks(), 3.0);
    }
}
