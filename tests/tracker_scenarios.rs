//! End-to-end tracker scenarios driven through the public API
//!
//! Every tracker here uses a manual clock that never advances, so the lane
//! scheduler always has time left and results only depend on the
//! configured per-observer budgets.

use std::sync::Arc;

use glam::{DVec3, Quat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use visual_sync_server::config::TrackerConfig;
use visual_sync_server::net::protocol::{decode, BincodePacketFactory, VisualMessage};
use visual_sync_server::net::transport::RecordingSink;
use visual_sync_server::tracker::scheduler::ManualClock;
use visual_sync_server::tracker::{
    NetworkEntityTracker, ObserverId, ObserverView, VisualId, VisualKind, VisualRegistration,
};

fn tracker(config: TrackerConfig) -> NetworkEntityTracker {
    NetworkEntityTracker::with_clock(config, Arc::new(BincodePacketFactory::new()), Box::new(ManualClock::new()))
}

fn register_at(tracker: &mut NetworkEntityTracker, id: VisualId, position: DVec3) {
    tracker.register(VisualRegistration::new(id, VisualKind(1), Uuid::nil(), position));
}

fn messages(sink: &RecordingSink, observer: ObserverId) -> Vec<VisualMessage> {
    sink.packets_for(observer)
        .iter()
        .flat_map(|packet| {
            packet
                .frames()
                .map(|frame| decode::<VisualMessage>(frame).unwrap())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn count_spawns(sent: &[VisualMessage]) -> usize {
    sent.iter()
        .filter(|m| matches!(m, VisualMessage::Spawn { .. }))
        .count()
}

fn count_destroys(sent: &[VisualMessage]) -> usize {
    sent.iter()
        .filter(|m| matches!(m, VisualMessage::Destroy { .. }))
        .count()
}

#[test]
fn test_spawn_then_mid_tier_updates() {
    let mut tracker = tracker(TrackerConfig::default());
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    register_at(&mut tracker, 1, DVec3::new(40.0, 0.0, 0.0));

    tracker.tick(&views, &mut sink);
    let sent = messages(&sink, observer);
    assert_eq!(count_spawns(&sent), 1);
    assert_eq!(sent.len(), 1, "Nothing but the spawn on the first tick");

    // MID tier: first evaluation sends a transform, then every 2 ticks
    let mut per_tick = Vec::new();
    for _ in 0..4 {
        sink.clear();
        tracker.tick(&views, &mut sink);
        per_tick.push(messages(&sink, observer));
    }
    let transforms: Vec<usize> = per_tick
        .iter()
        .map(|sent| {
            sent.iter()
                .filter(|m| matches!(m, VisualMessage::Transform { id: 1, .. }))
                .count()
        })
        .collect();
    assert_eq!(transforms, vec![1, 0, 1, 0]);
    assert!(per_tick
        .iter()
        .flatten()
        .all(|m| !matches!(m, VisualMessage::Position { .. } | VisualMessage::Spawn { .. })));
}

#[test]
fn test_leaving_view_sends_one_destroy() {
    let mut tracker = tracker(TrackerConfig {
        view_distance: 30.0,
        ..TrackerConfig::default()
    });
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    register_at(&mut tracker, 1, DVec3::new(25.0, 0.0, 0.0));
    tracker.tick(&views, &mut sink);

    tracker.update_metadata(1, vec![7, 7, 7], false);
    tracker.update_state(1, Uuid::nil(), DVec3::new(35.0, 0.0, 0.0), Quat::IDENTITY, false);
    sink.clear();
    for _ in 0..5 {
        tracker.tick(&views, &mut sink);
    }

    let sent = messages(&sink, observer);
    assert_eq!(sent, vec![VisualMessage::Destroy { ids: vec![1] }]);
    assert!(!tracker.observer_state(observer).unwrap().is_visible(1));
}

#[test]
fn test_visibility_pass_spreads_over_ticks() {
    let mut tracker = tracker(TrackerConfig {
        max_visibility_updates_per_observer_per_tick: 50,
        ..TrackerConfig::default()
    });
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    for id in 0..200u32 {
        let angle = id as f64 * std::f64::consts::TAU / 200.0;
        register_at(&mut tracker, id, DVec3::new(angle.cos() * 10.0, 0.0, angle.sin() * 10.0));
    }

    for tick in 1..=4 {
        tracker.tick(&views, &mut sink);
        let state = tracker.observer_state(observer).unwrap();
        assert_eq!(state.visible_len(), tick * 50);
        assert_eq!(
            state.needs_visibility_pass(),
            tick < 4,
            "Pass is dirty until tick 4, got {} at tick {}",
            state.needs_visibility_pass(),
            tick
        );
    }
    assert_eq!(count_spawns(&messages(&sink, observer)), 200);
}

#[test]
fn test_unregister_cycles_advance_token() {
    // Rebuild every tick so the re-registered visual is picked up at once
    let mut tracker = tracker(TrackerConfig {
        full_recalc_interval_ticks: 1,
        ..TrackerConfig::default()
    });
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    register_at(&mut tracker, 9, DVec3::new(3.0, 0.0, 0.0));
    tracker.tick(&views, &mut sink);

    let initial = tracker.token(9);
    for _ in 0..5 {
        assert!(tracker.unregister(9));
        register_at(&mut tracker, 9, DVec3::new(3.0, 0.0, 0.0));
    }
    assert_eq!(tracker.token(9), initial + 5);

    sink.clear();
    tracker.tick(&views, &mut sink);
    tracker.tick(&views, &mut sink);
    let sent = messages(&sink, observer);
    assert_eq!(count_destroys(&sent), 1, "Observer is told the old instance is gone");
    assert_eq!(count_spawns(&sent), 1, "And sees the new one once");
}

#[test]
fn test_view_boundary_does_not_oscillate() {
    let mut tracker = tracker(TrackerConfig::default());
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    // Exactly at view distance 64
    register_at(&mut tracker, 1, DVec3::new(64.0, 0.0, 0.0));

    for _ in 0..30 {
        tracker.tick(&views, &mut sink);
    }
    let sent = messages(&sink, observer);
    assert_eq!(count_spawns(&sent), 1);
    assert_eq!(count_destroys(&sent), 0);
}

#[test]
fn test_near_move_sends_teleport_with_metadata() {
    let mut tracker = tracker(TrackerConfig::default());
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    register_at(&mut tracker, 1, DVec3::new(5.0, 0.0, 0.0));
    tracker.tick(&views, &mut sink);

    tracker.update_state(1, Uuid::nil(), DVec3::new(6.0, 0.0, 0.0), Quat::IDENTITY, false);
    tracker.update_metadata(1, vec![4, 2], false);
    sink.clear();
    tracker.tick(&views, &mut sink);

    let packets = sink.packets_for(observer);
    assert_eq!(packets.len(), 1, "Position and metadata travel as one unit");
    assert_eq!(packets[0].frame_count(), 2);
    let sent = messages(&sink, observer);
    assert!(matches!(sent[0], VisualMessage::Position { id: 1, .. }));
    assert_eq!(
        sent[1],
        VisualMessage::Metadata {
            id: 1,
            payload: vec![4, 2]
        }
    );
}

#[test]
fn test_mass_unregister_sends_bulk_destroy() {
    let mut tracker = tracker(TrackerConfig::default());
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    let ids: Vec<VisualId> = (0..100).collect();
    for &id in &ids {
        register_at(&mut tracker, id, DVec3::new(f64::from(id % 10), 0.0, f64::from(id / 10)));
    }
    tracker.tick(&views, &mut sink);
    assert_eq!(tracker.observer_state(observer).unwrap().visible_len(), 100);

    assert_eq!(tracker.unregister_batch(&ids), 100);
    assert_eq!(tracker.visual_count(), 0);
    sink.clear();
    tracker.tick(&views, &mut sink);

    let sent = messages(&sink, observer);
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        VisualMessage::Destroy { ids: destroyed } => assert_eq!(destroyed.len(), 100),
        other => panic!("expected bulk destroy, got {:?}", other),
    }
    let stats = tracker.stats();
    assert_eq!(stats.flush_totals.destroy_latency_samples, 1);
    assert_eq!(stats.backlog.mass_boost_ticks, 1, "Boost counts down once per tick");
}

#[test]
fn test_observer_world_change_destroys_everything() {
    let mut tracker = tracker(TrackerConfig::default());
    let observer = Uuid::new_v4();
    let mut sink = RecordingSink::new();
    register_at(&mut tracker, 1, DVec3::new(5.0, 0.0, 0.0));
    register_at(&mut tracker, 2, DVec3::new(-5.0, 0.0, 0.0));
    tracker.tick(&[ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)], &mut sink);

    sink.clear();
    let elsewhere = Uuid::new_v4();
    tracker.tick(&[ObserverView::new(observer, elsewhere, DVec3::ZERO)], &mut sink);

    let sent = messages(&sink, observer);
    assert_eq!(count_destroys(&sent), 2);
    assert_eq!(count_spawns(&sent), 0);
    assert_eq!(tracker.observer_state(observer).unwrap().visible_len(), 0);
}

#[test]
fn test_visible_stays_within_candidates() {
    let mut tracker = tracker(TrackerConfig {
        max_visibility_updates_per_observer_per_tick: 16,
        max_transform_checks_per_observer_per_tick: 16,
        ..TrackerConfig::default()
    });
    let mut rng = StdRng::seed_from_u64(7);
    let observers: Vec<ObserverId> = (0..4).map(|_| Uuid::new_v4()).collect();
    let mut positions: Vec<DVec3> = (0..300)
        .map(|_| DVec3::new(rng.gen_range(-150.0..150.0), 0.0, rng.gen_range(-150.0..150.0)))
        .collect();
    for (id, position) in positions.iter().enumerate() {
        register_at(&mut tracker, id as VisualId, *position);
    }

    let mut sink = RecordingSink::new();
    for step in 0..60 {
        for (id, position) in positions.iter_mut().enumerate() {
            *position += DVec3::new(rng.gen_range(-3.0..3.0), 0.0, rng.gen_range(-3.0..3.0));
            tracker.update_state(id as VisualId, Uuid::nil(), *position, Quat::IDENTITY, false);
        }
        let views: Vec<ObserverView> = observers
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let offset = step as f64 * (i as f64 + 1.0);
                ObserverView::new(*id, Uuid::nil(), DVec3::new(offset - 60.0, 0.0, 0.0))
            })
            .collect();
        tracker.tick(&views, &mut sink);

        for id in &observers {
            let state = tracker.observer_state(*id).unwrap();
            assert!(state.is_consistent(), "visible must stay within candidates");
        }
    }
    assert!(tracker.stats().visible_pairs > 0);
}

/// Position messages per tick while every visual drifts one unit per tick
fn positions_per_tick(tracker: &mut NetworkEntityTracker, ids: &[VisualId], ticks: usize) -> Vec<usize> {
    let observer = Uuid::new_v4();
    let views = [ObserverView::new(observer, Uuid::nil(), DVec3::ZERO)];
    let mut sink = RecordingSink::new();
    let start = |id: VisualId| DVec3::new(-8.0 + f64::from(id) * 4.0, 0.0, 2.0);
    for &id in ids {
        register_at(tracker, id, start(id));
    }
    tracker.tick(&views, &mut sink);

    let mut per_tick = Vec::new();
    for step in 1..=ticks {
        for &id in ids {
            let position = start(id) + DVec3::new(0.0, 0.0, step as f64);
            tracker.update_state(id, Uuid::nil(), position, Quat::IDENTITY, false);
        }
        sink.clear();
        tracker.tick(&views, &mut sink);
        let sent = messages(&sink, observer);
        per_tick.push(
            sent.iter()
                .filter(|m| matches!(m, VisualMessage::Position { .. }))
                .count(),
        );
    }
    per_tick
}

#[test]
fn test_transform_budget_equal_to_visible_count_updates_every_tick() {
    let mut tracker = tracker(TrackerConfig {
        max_transform_checks_per_observer_per_tick: 2,
        ..TrackerConfig::default()
    });

    let per_tick = positions_per_tick(&mut tracker, &[1, 2], 6);
    assert_eq!(per_tick, vec![2; 6], "Both NEAR visuals move every tick");
    assert_eq!(tracker.stats().counters.transform_checks_skipped_due_budget, 0);
}

#[test]
fn test_transform_budget_dividing_visible_count_never_idles() {
    let mut tracker = tracker(TrackerConfig {
        max_transform_checks_per_observer_per_tick: 2,
        ..TrackerConfig::default()
    });

    let per_tick = positions_per_tick(&mut tracker, &[1, 2, 3, 4], 6);
    assert_eq!(per_tick, vec![2; 6], "Each tick spends its whole budget");
    // Half the list is left over on every other tick, starting with the spawn tick
    assert_eq!(tracker.stats().counters.transform_checks_skipped_due_budget, 4 * 2);
}
