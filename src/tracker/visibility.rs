//! Budgeted visibility pass
//!
//! Walks an observer's candidate list from where the previous slice
//! stopped, promoting in-range candidates to visible (SPAWN) and demoting
//! out-of-range ones (DESTROY). A pass over a long candidate list spreads
//! over several ticks; the dirty flag clears only once the cursor reaches
//! the end.

use tracing::trace;

use super::executor::{retire_visible, TickExecutor, TrackerCore};
use super::scheduler::{LaneQueues, SpawnTask};
use super::ObserverId;

/// Outcome of one slice, mostly for tests and tracing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisibilitySliceResult {
    pub processed: usize,
    pub entered: usize,
    pub exited: usize,
    pub pass_complete: bool,
}

pub(crate) fn run_visibility_slice(
    exec: &mut TickExecutor<'_>,
    observer: ObserverId,
    lanes: &mut LaneQueues,
) -> VisibilitySliceResult {
    let budget = exec.config.max_visibility_updates_per_observer_per_tick;
    let view_sq = exec.config.view_distance_sq();
    let TrackerCore {
        visuals,
        observers,
        frames,
        queues,
        tokens,
        counters,
        tick,
        ..
    } = &mut *exec.core;
    let tick = *tick;

    let mut result = VisibilitySliceResult::default();
    let (Some(frame), Some(state)) = (frames.get(&observer), observers.get_mut(&observer)) else {
        counters.skipped_tasks += 1;
        return result;
    };
    state.visibility_queued = false;

    while result.processed < budget {
        let Some(id) = state.next_candidate() else {
            break;
        };
        result.processed += 1;

        let Some(visual) = visuals.get(&id) else {
            // Unregistered since the candidate list was built
            state.remove_visible(id);
            counters.vanished_visuals += 1;
            continue;
        };
        let in_range =
            visual.world == frame.world && visual.position().distance_squared(frame.position) <= view_sq;

        if in_range {
            if state.add_visible(id, tick) {
                lanes.enqueue_spawn(SpawnTask {
                    observer,
                    visual: id,
                    kind: visual.kind,
                    token: tokens.current(id),
                    position: visual.position(),
                    orientation: visual.orientation(),
                });
                result.entered += 1;
            }
        } else if state.remove_visible(id) {
            retire_visible(queues, counters, lanes, observer, id, tick);
            result.exited += 1;
        }
    }

    if state.candidates_remaining() == 0 {
        state.mark_visibility_pass_complete();
        result.pass_complete = true;
    }
    trace!(
        "Visibility slice for {}: {} checked, {} entered, {} exited",
        observer,
        result.processed,
        result.entered,
        result.exited
    );
    result
}
