//! Spatial partitioning grid and rank-domain decomposition.
//!
//! The grid tiles the configured domain with cells at least one interaction
//! horizon wide, so a single layer of adjacent cells covers every possible
//! bond. Cells are created once at configuration time; only their particle
//! membership is rebuilt as particles move. Periodic boundaries are realised
//! as image cells outside the domain that wrap to a real cell and carry the
//! translation applied to any state copied across them.

pub mod cell;
pub mod layout;

pub use cell::GridCell;
pub use layout::rank_layout;

use nalgebra::Vector3;
use std::collections::HashMap;

use crate::error::PdError;
use crate::particles::ParticleStore;

/// A periodic halo obligation of this rank: the contents of `cell` must be
/// sent to `to_rank` with `shift` applied to positions.
#[derive(Debug, Clone)]
pub struct PeriodicSend {
    pub cell: usize,
    pub shift: Vector3<f64>,
    pub to_rank: usize,
}

#[derive(Debug, Clone)]
pub struct SpatialGrid {
    dim: usize,
    bounds: [(f64, f64); 3],
    periodic: [bool; 3],
    /// Inner cells per axis (1 on unused axes)
    n: [i64; 3],
    spacing: [f64; 3],
    extent: [f64; 3],
    side: [usize; 3],
    cells: HashMap<usize, GridCell>,
    my_cells: Vec<usize>,
    boundary_cells: Vec<usize>,
    periodic_senders: Vec<PeriodicSend>,
    neighbouring_ranks: Vec<usize>,
    rank: usize,
    n_ranks: usize,
    rank_grid: [usize; 3],
    /// Per-axis cell-index block starts of the rank decomposition
    splits: [Vec<i64>; 3],
}

impl SpatialGrid {
    pub fn new(
        dim: usize,
        bounds: [(f64, f64); 3],
        spacing: f64,
        periodic: [bool; 3],
        rank: usize,
        n_ranks: usize,
    ) -> Result<Self, PdError> {
        if dim == 0 || dim > 3 {
            return Err(PdError::UnsupportedDimension(dim));
        }
        if n_ranks == 0 || rank >= n_ranks {
            return Err(PdError::Config(format!(
                "invalid rank {} of {}",
                rank, n_ranks
            )));
        }

        let mut n = [1i64; 3];
        let mut actual = [1.0f64; 3];
        let mut extent = [0.0f64; 3];
        for d in 0..dim {
            extent[d] = bounds[d].1 - bounds[d].0;
            n[d] = ((extent[d] / spacing).floor() as i64).max(1);
            actual[d] = extent[d] / n[d] as f64;
        }

        let rank_grid = rank_layout(n_ranks, &extent[..dim]);
        let mut splits: [Vec<i64>; 3] = [vec![0], vec![0], vec![0]];
        for d in 0..3 {
            let rg = rank_grid[d] as i64;
            splits[d] = (0..=rg).map(|b| b * n[d] / rg).collect();
        }

        let mut grid = Self {
            dim,
            bounds,
            periodic,
            n,
            spacing: actual,
            extent,
            side: [(n[0] + 2) as usize, (n[1] + 2) as usize, (n[2] + 2) as usize],
            cells: HashMap::new(),
            my_cells: Vec::new(),
            boundary_cells: Vec::new(),
            periodic_senders: Vec::new(),
            neighbouring_ranks: Vec::new(),
            rank,
            n_ranks,
            rank_grid,
            splits,
        };
        grid.build();
        grid.link_neighbours();
        grid.set_ownership();
        Ok(grid)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    pub fn rank_grid(&self) -> [usize; 3] {
        self.rank_grid
    }

    fn index_range(&self, d: usize) -> (i64, i64) {
        if d >= self.dim || !self.periodic[d] {
            if d >= self.dim {
                (0, 0)
            } else {
                (0, self.n[d] - 1)
            }
        } else {
            (-1, self.n[d])
        }
    }

    fn flatten(&self, ix: [i64; 3]) -> usize {
        let x = (ix[0] + 1) as usize;
        let y = (ix[1] + 1) as usize;
        let z = (ix[2] + 1) as usize;
        x + y * self.side[0] + z * self.side[0] * self.side[1]
    }

    /// Allocate every real cell plus image layers on periodic axes.
    fn build(&mut self) {
        let (x0, x1) = self.index_range(0);
        let (y0, y1) = self.index_range(1);
        let (z0, z1) = self.index_range(2);

        for iz in z0..=z1 {
            for iy in y0..=y1 {
                for ix in x0..=x1 {
                    let idx = [ix, iy, iz];
                    let id = self.flatten(idx);

                    let mut image = false;
                    let mut shift = Vector3::zeros();
                    let mut wrapped = idx;
                    for d in 0..self.dim {
                        if idx[d] < 0 {
                            image = true;
                            shift[d] = -self.extent[d];
                            wrapped[d] = self.n[d] - 1;
                        } else if idx[d] >= self.n[d] {
                            image = true;
                            shift[d] = self.extent[d];
                            wrapped[d] = 0;
                        }
                    }

                    let mut center = Vector3::zeros();
                    for d in 0..self.dim {
                        center[d] = self.bounds[d].0 + (idx[d] as f64 + 0.5) * self.spacing[d];
                    }

                    self.cells.insert(
                        id,
                        GridCell {
                            id,
                            center,
                            periodic_image: image,
                            shift,
                            wraps_to: self.flatten(wrapped),
                            owner: 0,
                            neighbours: Vec::new(),
                            neighbour_ranks: Vec::new(),
                            particles: Vec::new(),
                        },
                    );
                }
            }
        }
    }

    /// Link each real cell to every existing cell within one index step per
    /// axis, periodic images included.
    fn link_neighbours(&mut self) {
        let ids: Vec<usize> = self.cells.keys().copied().collect();
        for id in ids {
            if self.cells[&id].periodic_image {
                continue;
            }
            let idx = self.unflatten(id);
            let mut neighbours = Vec::new();
            for dz in -1..=1i64 {
                for dy in -1..=1i64 {
                    for dx in -1..=1i64 {
                        if dx == 0 && dy == 0 && dz == 0 {
                            continue;
                        }
                        let candidate = [idx[0] + dx, idx[1] + dy, idx[2] + dz];
                        let in_range = (0..3).all(|d| {
                            let (lo, hi) = self.index_range(d);
                            candidate[d] >= lo && candidate[d] <= hi
                        });
                        if in_range {
                            neighbours.push(self.flatten(candidate));
                        }
                    }
                }
            }
            self.cells.get_mut(&id).expect("linked cell").neighbours = neighbours;
        }
    }

    fn unflatten(&self, id: usize) -> [i64; 3] {
        let x = (id % self.side[0]) as i64 - 1;
        let y = ((id / self.side[0]) % self.side[1]) as i64 - 1;
        let z = (id / (self.side[0] * self.side[1])) as i64 - 1;
        [x, y, z]
    }

    /// Static coordinate-range partition of the real cells across ranks,
    /// plus the derived boundary and periodic halo bookkeeping.
    fn set_ownership(&mut self) {
        let ids: Vec<usize> = self.cells.keys().copied().collect();
        // Real cells first; images inherit the wrapped cell's owner.
        for &id in &ids {
            if !self.cells[&id].periodic_image {
                let owner = self.owner_of_index(self.unflatten(id));
                self.cells.get_mut(&id).expect("real cell").owner = owner;
            }
        }
        for &id in &ids {
            if self.cells[&id].periodic_image {
                let wrapped = self.cells[&id].wraps_to;
                let owner = self.cells[&wrapped].owner;
                self.cells.get_mut(&id).expect("image cell").owner = owner;
            }
        }

        self.my_cells = ids
            .iter()
            .copied()
            .filter(|id| {
                let c = &self.cells[id];
                !c.periodic_image && c.owner == self.rank
            })
            .collect();
        self.my_cells.sort_unstable();

        // Boundary cells: mine, with a real neighbour on a foreign rank.
        let mut neighbouring = Vec::new();
        for &id in &self.my_cells {
            let foreign: Vec<usize> = self.cells[&id]
                .neighbours
                .iter()
                .filter(|n| !self.cells[n].periodic_image)
                .map(|n| self.cells[n].owner)
                .filter(|&r| r != self.rank)
                .collect();
            let mut ranks: Vec<usize> = foreign;
            ranks.sort_unstable();
            ranks.dedup();
            if !ranks.is_empty() {
                self.boundary_cells.push(id);
                neighbouring.extend_from_slice(&ranks);
            }
            self.cells.get_mut(&id).expect("boundary cell").neighbour_ranks = ranks;
        }

        // Periodic halo: for every image cell adjacent to some real cell C,
        // the owner of the wrapped cell sends its contents, shifted, to the
        // owner of C.
        let mut senders: Vec<(usize, usize, usize)> = Vec::new(); // (cell, image, to)
        for &id in &ids {
            let c = &self.cells[&id];
            if c.periodic_image {
                continue;
            }
            for &nb in &c.neighbours {
                let image = &self.cells[&nb];
                if !image.periodic_image {
                    continue;
                }
                let wrapped = image.wraps_to;
                let source_owner = self.cells[&wrapped].owner;
                if source_owner == self.rank {
                    senders.push((wrapped, nb, c.owner));
                }
                // Symmetric handshake bookkeeping on the receiving side
                if c.owner == self.rank && source_owner != self.rank {
                    neighbouring.push(source_owner);
                }
            }
        }
        senders.sort_unstable();
        senders.dedup();
        for (cell, image, to_rank) in senders {
            let shift = self.cells[&image].shift;
            if to_rank != self.rank {
                neighbouring.push(to_rank);
            }
            self.periodic_senders.push(PeriodicSend { cell, shift, to_rank });
        }

        neighbouring.sort_unstable();
        neighbouring.dedup();
        self.neighbouring_ranks = neighbouring;
    }

    fn owner_of_index(&self, idx: [i64; 3]) -> usize {
        let mut block = [0usize; 3];
        for d in 0..3 {
            let s = &self.splits[d];
            // Last block containing idx[d]
            block[d] = (0..self.rank_grid[d])
                .rfind(|&b| s[b] <= idx[d])
                .unwrap_or(0);
        }
        block[0] + block[1] * self.rank_grid[0] + block[2] * self.rank_grid[0] * self.rank_grid[1]
    }

    /// Deterministic cell lookup for a position. Outside the grid extent
    /// (beyond the image layer on periodic axes) is a fatal error.
    pub fn cell_id(&self, r: &Vector3<f64>) -> Result<usize, PdError> {
        let mut idx = [0i64; 3];
        for d in 0..self.dim {
            let q = (r[d] - self.bounds[d].0) / self.spacing[d];
            let mut i = q.floor() as i64;
            // A position exactly on the upper face belongs to the last cell
            if i == self.n[d] && !self.periodic[d] && r[d] <= self.bounds[d].1 {
                i = self.n[d] - 1;
            }
            let (lo, hi) = self.index_range(d);
            if i < lo || i > hi {
                return Err(PdError::OutsideGrid {
                    x: r.x,
                    y: r.y,
                    z: r.z,
                });
            }
            idx[d] = i;
        }
        Ok(self.flatten(idx))
    }

    pub fn owner_of(&self, cell_id: usize) -> usize {
        self.cells[&cell_id].owner
    }

    pub fn cell(&self, id: usize) -> &GridCell {
        &self.cells[&id]
    }

    pub fn cell_mut(&mut self, id: usize) -> &mut GridCell {
        self.cells.get_mut(&id).expect("known cell id")
    }

    pub fn cells(&self) -> &HashMap<usize, GridCell> {
        &self.cells
    }

    pub fn my_cells(&self) -> &[usize] {
        &self.my_cells
    }

    pub fn boundary_cells(&self) -> &[usize] {
        &self.boundary_cells
    }

    pub fn periodic_senders(&self) -> &[PeriodicSend] {
        &self.periodic_senders
    }

    pub fn neighbouring_ranks(&self) -> &[usize] {
        &self.neighbouring_ranks
    }

    pub fn clear_particles(&mut self) {
        for cell in self.cells.values_mut() {
            cell.particles.clear();
        }
    }

    /// Rebucket every particle (owned and ghost) into its current cell.
    /// Invoked every step because particles move.
    pub fn place(&mut self, store: &ParticleStore) -> Result<(), PdError> {
        self.clear_particles();
        for col in 0..store.n_total() {
            let id = store.id_at(col);
            let cell = self.cell_id(&store.r[col])?;
            self.cells
                .get_mut(&cell)
                .expect("cell_id returned known cell")
                .particles
                .push((id, col));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::AttributeSchema;

    fn unit_square(periodic: [bool; 3], rank: usize, n_ranks: usize) -> SpatialGrid {
        SpatialGrid::new(
            2,
            [(0.0, 1.0), (0.0, 1.0), (0.0, 0.0)],
            0.25,
            periodic,
            rank,
            n_ranks,
        )
        .unwrap()
    }

    #[test]
    fn test_cell_id_deterministic_and_bounded() {
        let grid = unit_square([false; 3], 0, 1);
        let a = grid.cell_id(&Vector3::new(0.1, 0.1, 0.0)).unwrap();
        let b = grid.cell_id(&Vector3::new(0.1, 0.1, 0.0)).unwrap();
        assert_eq!(a, b);
        // Upper domain face maps to the last cell
        assert!(grid.cell_id(&Vector3::new(1.0, 1.0, 0.0)).is_ok());
        assert!(matches!(
            grid.cell_id(&Vector3::new(1.5, 0.5, 0.0)),
            Err(PdError::OutsideGrid { .. })
        ));
    }

    #[test]
    fn test_inner_cell_has_full_neighbourhood() {
        let grid = unit_square([false; 3], 0, 1);
        let id = grid.cell_id(&Vector3::new(0.5, 0.5, 0.0)).unwrap();
        assert_eq!(grid.cell(id).neighbours.len(), 8);
        // A corner cell of a non-periodic grid has only 3 neighbours
        let corner = grid.cell_id(&Vector3::new(0.01, 0.01, 0.0)).unwrap();
        assert_eq!(grid.cell(corner).neighbours.len(), 3);
    }

    #[test]
    fn test_periodic_corner_has_full_neighbourhood() {
        let grid = unit_square([true, true, false], 0, 1);
        let corner = grid.cell_id(&Vector3::new(0.01, 0.01, 0.0)).unwrap();
        assert_eq!(grid.cell(corner).neighbours.len(), 8);
        // One of them is an image cell carrying a negative shift
        let image = grid
            .cell(corner)
            .neighbours
            .iter()
            .map(|&n| grid.cell(n))
            .find(|c| c.periodic_image)
            .expect("corner neighbourhood contains an image");
        assert!(image.shift.x < 0.0 || image.shift.y < 0.0);
        assert!(!grid.cell(image.wraps_to).periodic_image);
    }

    #[test]
    fn test_rank_decomposition_partitions_cells() {
        for rank in 0..4 {
            let grid = unit_square([false; 3], rank, 4);
            assert_eq!(grid.rank_grid(), [2, 2, 1]);
            assert_eq!(grid.my_cells().len(), 4); // 16 cells over 4 ranks
            for &id in grid.my_cells() {
                assert_eq!(grid.owner_of(id), rank);
            }
        }
    }

    #[test]
    fn test_boundary_cells_touch_foreign_ranks() {
        let grid = unit_square([false; 3], 0, 2);
        assert!(!grid.boundary_cells().is_empty());
        for &id in grid.boundary_cells() {
            let foreign = grid
                .cell(id)
                .neighbours
                .iter()
                .any(|&n| !grid.cell(n).periodic_image && grid.cell(n).owner != 0);
            assert!(foreign);
        }
        assert_eq!(grid.neighbouring_ranks(), &[1]);
    }

    #[test]
    fn test_place_buckets_all_particles() {
        let mut grid = unit_square([false; 3], 0, 1);
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        let mut store = ParticleStore::new(2, schema).unwrap();
        for (i, x) in [0.1, 0.4, 0.9].iter().enumerate() {
            let col = store.push_owned(i).unwrap();
            store.r[col] = Vector3::new(*x, 0.5, 0.0);
        }
        grid.place(&store).unwrap();
        let total: usize = grid.cells().values().map(|c| c.particles.len()).sum();
        assert_eq!(total, 3);

        // Membership is rebuilt, not accumulated
        grid.place(&store).unwrap();
        let total: usize = grid.cells().values().map(|c| c.particles.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_periodic_senders_exist_for_single_rank() {
        let grid = unit_square([true, false, false], 0, 1);
        assert!(!grid.periodic_senders().is_empty());
        for send in grid.periodic_senders() {
            assert_eq!(send.to_rank, 0);
            assert!(send.shift.x.abs() > 0.0);
        }
    }
}
