//! Spatial candidate index
//!
//! Buckets visual ids by the 2D cell (x/z plane) their position falls in.
//! Observers query a square window of cells around their own cell to
//! build the candidate list; distance is confirmed later.

use glam::DVec3;
use hashbrown::HashMap;
use rustc_hash::{FxBuildHasher, FxHashSet};

use super::VisualId;

/// Initial capacity for grid cells (number of expected non-empty cells)
const GRID_INITIAL_CAPACITY: usize = 256;

/// Grid cell key - (x, z) cell coordinates
pub type CellKey = (i32, i32);

/// Map from cell to the visuals located in it
#[derive(Debug)]
pub struct ChunkGridIndex {
    cell_size: f64,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f64,
    cells: HashMap<CellKey, FxHashSet<VisualId>, FxBuildHasher>,
}

impl ChunkGridIndex {
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            cells: HashMap::with_capacity_and_hasher(GRID_INITIAL_CAPACITY, FxBuildHasher),
        }
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Convert world position to cell key (floor division, negative-safe)
    #[inline]
    pub fn cell_of(&self, position: DVec3) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.z * self.inv_cell_size).floor() as i32,
        )
    }

    pub fn insert(&mut self, cell: CellKey, id: VisualId) {
        self.cells.entry(cell).or_default().insert(id);
    }

    /// Remove `id` from `cell`, dropping the cell once it is empty
    pub fn remove(&mut self, cell: CellKey, id: VisualId) -> bool {
        let Some(ids) = self.cells.get_mut(&cell) else {
            return false;
        };
        let removed = ids.remove(&id);
        if ids.is_empty() {
            self.cells.remove(&cell);
        }
        removed
    }

    /// Re-bucket a visual that crossed a cell boundary
    pub fn move_between(&mut self, from: CellKey, to: CellKey, id: VisualId) {
        if from == to {
            return;
        }
        self.remove(from, id);
        self.insert(to, id);
    }

    pub fn ids_in(&self, cell: CellKey) -> impl Iterator<Item = VisualId> + '_ {
        self.cells.get(&cell).into_iter().flat_map(|ids| ids.iter().copied())
    }

    /// Every id within `radius` cells (Chebyshev) of `center`, window order
    pub fn ids_in_window(&self, center: CellKey, radius: i32) -> impl Iterator<Item = VisualId> + '_ {
        let radius = radius.max(0);
        (-radius..=radius).flat_map(move |dx| {
            (-radius..=radius).flat_map(move |dz| self.ids_in((center.0 + dx, center.1 + dz)))
        })
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    pub fn stats(&self) -> GridStats {
        let mut total = 0;
        let mut max_per_cell = 0;
        for ids in self.cells.values() {
            total += ids.len();
            max_per_cell = max_per_cell.max(ids.len());
        }
        GridStats {
            non_empty_cells: self.cells.len(),
            total_entries: total,
            max_per_cell,
        }
    }
}

/// Occupancy summary of the grid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GridStats {
    pub non_empty_cells: usize,
    pub total_entries: usize,
    pub max_per_cell: usize,
}
