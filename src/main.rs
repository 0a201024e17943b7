use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{DVec3, Quat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use visual_sync_server::config::ServerConfig;
use visual_sync_server::metrics::{self, Metrics};
use visual_sync_server::net::protocol::BincodePacketFactory;
use visual_sync_server::net::transport::{Packet, PacketSink};
use visual_sync_server::tracker::{
    NetworkEntityTracker, ObserverId, ObserverView, TransformPublisher, TransformUpdate, VisualId,
    VisualKind, VisualRegistration, WorldId,
};

/// Ticks between demo despawn/respawn waves
const WAVE_INTERVAL_TICKS: u64 = 200;

/// Visuals cycled per wave
const WAVE_SIZE: usize = 128;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Visual Sync Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    config.validate()?;
    info!(
        "Configuration loaded: tick_rate={}Hz, visuals={}, observers={}, view_distance={}",
        config.tick_rate, config.demo_visuals, config.demo_observers, config.tracker.view_distance
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());
    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    let world = Uuid::new_v4();
    let mut tracker = NetworkEntityTracker::new(config.tracker.clone(), Arc::new(BincodePacketFactory::new()));
    let mut rng = StdRng::from_entropy();
    let registered = tracker.register_batch(
        (0..config.demo_visuals as VisualId)
            .map(|id| random_registration(&mut rng, id, world, config.world_half_extent)),
    );
    info!("Seeded {} demo visuals in world {}", registered, world);

    // Physics runs on its own task and only talks to the tracker through the publisher
    let physics = tokio::spawn(run_physics(
        tracker.publisher(),
        world,
        config.demo_visuals,
        config.world_half_extent,
        config.tick_duration(),
    ));

    let mut observers = DemoObservers::new(config.demo_observers, world, config.world_half_extent);
    let mut sink = DiscardSink::default();
    let tick_budget = config.tick_duration();
    let mut interval = tokio::time::interval(tick_budget);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(shutdown);

    info!("Tracker running at {}Hz", config.tick_rate);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let started = Instant::now();
                let tick = tracker.current_tick() + 1;

                if tick % WAVE_INTERVAL_TICKS == 0 {
                    run_wave(&mut tracker, &mut rng, world, config.world_half_extent);
                }

                let views = observers.advance(tick);
                let outcome = tracker.tick(&views, &mut sink);

                let elapsed = started.elapsed();
                tracker.record_host_tick(elapsed);
                metrics.record_tick_time(elapsed, tick_budget);
                metrics.record_stats(&tracker.stats());

                if elapsed > tick_budget {
                    warn!("Tick {} took {:?} (budget {:?})", outcome.tick, elapsed, tick_budget);
                }
                if outcome.tick % (u64::from(config.tick_rate) * 10) == 0 {
                    let stats = tracker.stats();
                    info!(
                        "Tick {}: {} visuals, {} visible pairs, {} packets in {} batches, shedding={}",
                        outcome.tick,
                        stats.visuals,
                        stats.visible_pairs,
                        sink.packets,
                        sink.batches,
                        stats.shedding_intensity
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    physics.abort();
    tracker.clear();
    info!("Server stopped");
    Ok(())
}

fn random_registration(rng: &mut impl Rng, id: VisualId, world: WorldId, half_extent: f64) -> VisualRegistration {
    let position = DVec3::new(
        rng.gen_range(-half_extent..=half_extent),
        0.0,
        rng.gen_range(-half_extent..=half_extent),
    );
    let mut registration = VisualRegistration::new(id, VisualKind(rng.gen_range(1..4)), world, position);
    registration.metadata = vec![rng.gen()];
    registration
}

/// Despawn a random block of visuals and bring them straight back
fn run_wave(tracker: &mut NetworkEntityTracker, rng: &mut impl Rng, world: WorldId, half_extent: f64) {
    let visuals = tracker.visual_count() as VisualId;
    if visuals == 0 {
        return;
    }
    let start = rng.gen_range(0..visuals);
    let ids: Vec<VisualId> = (0..WAVE_SIZE as VisualId)
        .map(|offset| (start + offset) % visuals)
        .collect();
    let removed = tracker.unregister_batch(&ids);
    tracker.register_batch(ids.iter().map(|&id| random_registration(rng, id, world, half_extent)));
    info!("Wave: cycled {} visuals", removed);
}

/// Synthetic physics: bodies drift and bounce inside the world square
async fn run_physics(
    publisher: TransformPublisher,
    world: WorldId,
    bodies: usize,
    half_extent: f64,
    step: Duration,
) {
    let mut rng = StdRng::from_entropy();
    let mut state: Vec<(DVec3, DVec3)> = (0..bodies)
        .map(|_| {
            let position = DVec3::new(
                rng.gen_range(-half_extent..=half_extent),
                0.0,
                rng.gen_range(-half_extent..=half_extent),
            );
            let velocity = DVec3::new(rng.gen_range(-4.0..4.0), 0.0, rng.gen_range(-4.0..4.0));
            (position, velocity)
        })
        .collect();

    let mut interval = tokio::time::interval(step);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let dt = step.as_secs_f64();
    loop {
        interval.tick().await;
        publisher.publish_all(state.iter_mut().enumerate().map(|(id, (position, velocity))| {
            *position += *velocity * dt;
            if position.x.abs() > half_extent {
                velocity.x = -velocity.x;
            }
            if position.z.abs() > half_extent {
                velocity.z = -velocity.z;
            }
            let heading = velocity.z.atan2(velocity.x) as f32;
            TransformUpdate {
                visual: id as VisualId,
                world,
                position: *position,
                orientation: Quat::from_rotation_y(heading),
                critical: false,
            }
        }));
    }
}

/// Observers walking circles around the origin
struct DemoObservers {
    ids: Vec<ObserverId>,
    world: WorldId,
    radius: f64,
}

impl DemoObservers {
    fn new(count: usize, world: WorldId, half_extent: f64) -> Self {
        Self {
            ids: (0..count).map(|_| Uuid::new_v4()).collect(),
            world,
            radius: half_extent * 0.6,
        }
    }

    fn advance(&mut self, tick: u64) -> Vec<ObserverView> {
        let count = self.ids.len().max(1) as f64;
        self.ids
            .iter()
            .enumerate()
            .map(|(i, &id)| {
                let angle = tick as f64 * 0.01 + i as f64 * std::f64::consts::TAU / count;
                let position = DVec3::new(angle.cos() * self.radius, 0.0, angle.sin() * self.radius);
                let mut view = ObserverView::new(id, self.world, position);
                view.latency_ms = 40.0 + (i % 5) as f64 * 30.0;
                view
            })
            .collect()
    }
}

/// Stands in for the real transport; only counts what it is handed
#[derive(Debug, Default)]
struct DiscardSink {
    batches: u64,
    packets: u64,
}

impl PacketSink for DiscardSink {
    fn send_batch(&mut self, _observer: ObserverId, packets: &[Packet]) {
        self.batches += 1;
        self.packets += packets.len() as u64;
    }
}
