//! Bond network construction and maintenance.
//!
//! Bonds are stored per owner id only; a broken bond on one side requires
//! the explicit symmetry pass to mirror the break on the neighbour's list.
//! Connected flags are monotonic: once a bond is cut it is never restored,
//! and the amortized compaction pass physically removes dead entries.

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use std::collections::HashMap;

use crate::error::PdError;
use crate::grid::SpatialGrid;
use crate::particles::{
    BondSchema, ParticleId, ParticleStore, ParticleView, BOND_CONNECTED, BOND_DR0,
};

/// A single bond, owned by one particle. `data` is a fixed-length attribute
/// vector whose layout is given by the shared [`BondSchema`].
#[derive(Debug, Clone, PartialEq)]
pub struct Bond {
    pub neighbour: ParticleId,
    pub data: Vec<f64>,
}

impl Bond {
    #[inline]
    pub fn connected(&self) -> bool {
        self.data[BOND_CONNECTED] > 0.5
    }

    #[inline]
    pub fn dr0(&self) -> f64 {
        self.data[BOND_DR0]
    }
}

#[derive(Debug, Clone)]
pub struct BondNetwork {
    schema: BondSchema,
    i_volume_scaling: usize,
    /// Nonzero when periodic images are in play: ids at or above this base
    /// are image copies and canonicalize to `id % base`.
    periodic_id_base: usize,
    pub lists: HashMap<ParticleId, Vec<Bond>>,
}

impl BondNetwork {
    pub fn new(mut schema: BondSchema) -> Result<Self, PdError> {
        let i_volume_scaling = schema.register("volumeScaling")?;
        Ok(Self {
            schema,
            i_volume_scaling,
            periodic_id_base: 0,
            lists: HashMap::new(),
        })
    }

    pub fn set_periodic_id_base(&mut self, base: usize) {
        self.periodic_id_base = base;
    }

    /// Owner id behind a possibly periodic-image id.
    #[inline]
    pub fn canonical(&self, id: ParticleId) -> ParticleId {
        if self.periodic_id_base > 0 && id >= self.periodic_id_base {
            id % self.periodic_id_base
        } else {
            id
        }
    }

    pub fn schema(&self) -> &BondSchema {
        &self.schema
    }

    pub fn volume_scaling_index(&self) -> usize {
        self.i_volume_scaling
    }

    pub fn bonds(&self, id: ParticleId) -> &[Bond] {
        self.lists.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn set_bonds(&mut self, id: ParticleId, bonds: Vec<Bond>) {
        self.lists.insert(id, bonds);
    }

    pub fn remove(&mut self, id: ParticleId) -> Option<Vec<Bond>> {
        self.lists.remove(&id)
    }

    /// Total number of bond entries (both directions of a pair count).
    pub fn n_bonds(&self) -> usize {
        self.lists.values().map(Vec::len).sum()
    }

    /// Build the neighbour list of every owned particle from the grid.
    ///
    /// Only the particle's own cell and its adjacent cells are scanned, so
    /// the cost stays near-linear in particle count for a fixed horizon. A
    /// candidate is admitted when it is a different particle of the same
    /// group within the horizon of the reference configuration, optionally
    /// inflated by the per-particle radii.
    pub fn build_connections(
        &mut self,
        store: &ParticleStore,
        grid: &SpatialGrid,
        horizon: f64,
        inflate_by_radius: bool,
    ) -> Result<(), PdError> {
        self.schema.freeze();
        let n_params = self.schema.len();
        let i_vs = self.i_volume_scaling;
        let view = store.view();
        let i_group = if store.schema().contains("groupId") {
            Some(store.schema().get("groupId")?)
        } else {
            None
        };
        let i_radius = if inflate_by_radius {
            Some(store.schema().get("radius")?)
        } else {
            None
        };

        let built: Vec<(ParticleId, Vec<Bond>)> = grid
            .my_cells()
            .par_iter()
            .flat_map_iter(|&cell_id| {
                let cell = grid.cell(cell_id);
                cell.particles.iter().map(move |&(id_i, col_i)| {
                    let r_i = view.r0[col_i];
                    let group_i = i_group.map(|g| view.value(g, col_i));
                    let radius_i = i_radius.map_or(0.0, |a| view.value(a, col_i));
                    let mut bonds = Vec::new();

                    let mut admit = |id_j: ParticleId, col_j: usize| {
                        if id_i == id_j {
                            return;
                        }
                        if let Some(g) = i_group {
                            if view.value(g, col_j) != group_i.unwrap_or(0.0) {
                                return;
                            }
                        }
                        let radius_j = i_radius.map_or(0.0, |a| view.value(a, col_j));
                        let dr = (r_i - view.r0[col_j]).norm();
                        if horizon >= dr - radius_i && horizon >= dr - radius_j {
                            let mut data = vec![0.0; n_params];
                            data[BOND_DR0] = dr;
                            data[BOND_CONNECTED] = 1.0;
                            // Bulk default; the correction pass only lowers it
                            data[i_vs] = 1.0;
                            bonds.push(Bond { neighbour: id_j, data });
                        }
                    };

                    for &(id_j, col_j) in &cell.particles {
                        admit(id_j, col_j);
                    }
                    for &nb in &cell.neighbours {
                        for &(id_j, col_j) in &grid.cell(nb).particles {
                            admit(id_j, col_j);
                        }
                    }
                    (id_i, bonds)
                })
            })
            .collect();

        for (id, bonds) in built {
            self.lists.insert(id, bonds);
        }
        Ok(())
    }

    /// Scale each bond's volume contribution by the fraction of the
    /// neighbour's effective volume that actually lies inside the horizon,
    /// so near-surface stiffness matches bulk stiffness. Bonds entirely
    /// inside the horizon keep a scaling of 1.
    pub fn apply_volume_correction(
        &mut self,
        store: &ParticleStore,
        horizon: f64,
    ) -> Result<(), PdError> {
        let view = store.view();
        let dim = store.dim();
        let i_radius = store.schema().get("radius")?;
        let i_vs = self.i_volume_scaling;

        self.lists.par_iter_mut().for_each(|(_, bonds)| {
            for bond in bonds.iter_mut() {
                let col_j = match view.id_to_col.get(&bond.neighbour) {
                    Some(&c) => c,
                    None => continue,
                };
                let radius_j = view.value(i_radius, col_j);
                let dr = bond.dr0();
                bond.data[i_vs] = volume_scaling(dim, horizon, radius_j, dr);
            }
        });
        Ok(())
    }

    /// Mirror every one-sided break onto the neighbour's bond list.
    ///
    /// Must run once per step in which any modifier may have mutated
    /// connectivity, before forces are recomputed. Returns the number of
    /// reverse bonds cut.
    pub fn enforce_symmetry(&mut self) -> usize {
        let broken: Vec<(ParticleId, ParticleId)> = self
            .lists
            .par_iter()
            .flat_map_iter(|(&id, bonds)| {
                bonds
                    .iter()
                    .filter(|b| !b.connected())
                    .map(move |b| (b.neighbour, id))
            })
            .collect();

        // Image copies canonicalize to their owner so a break crossing a
        // periodic boundary lands on the authoritative list
        let mut mirrored = 0;
        for (owner, neighbour) in broken {
            let owner = self.canonical(owner);
            let neighbour = self.canonical(neighbour);
            let base = self.periodic_id_base;
            if let Some(bonds) = self.lists.get_mut(&owner) {
                for bond in bonds.iter_mut() {
                    let canon = if base > 0 && bond.neighbour >= base {
                        bond.neighbour % base
                    } else {
                        bond.neighbour
                    };
                    if canon == neighbour && bond.connected() {
                        bond.data[BOND_CONNECTED] = 0.0;
                        mirrored += 1;
                    }
                }
            }
        }
        mirrored
    }

    /// Amortized compaction: physically remove entries with a cleared
    /// connected flag, bounding memory growth from accumulated fracture.
    pub fn prune_disconnected(&mut self) -> usize {
        self.lists
            .par_iter_mut()
            .map(|(_, bonds)| {
                let before = bonds.len();
                bonds.retain(Bond::connected);
                before - bonds.len()
            })
            .sum()
    }

    /// Reference-configuration shape tensor of a particle, built from its
    /// remaining active neighbours. Falls back to the identity when the
    /// neighbourhood is too sparse to be invertible, trading local accuracy
    /// near free surfaces and crack tips for robustness.
    pub fn shape_tensor(
        &self,
        view: &ParticleView<'_>,
        id: ParticleId,
        horizon: f64,
        i_volume: usize,
    ) -> Matrix3<f64> {
        let dim = view.dim;
        let col_i = view.col(id);
        let bonds = self.bonds(id);

        let mut k = Matrix3::zeros();
        let mut active = 0usize;
        for bond in bonds.iter().filter(|b| b.connected()) {
            let col_j = view.col(bond.neighbour);
            let dr0: Vector3<f64> = view.r0[col_j] - view.r0[col_i];
            let w = horizon / bond.dr0();
            let volume = view.value(i_volume, col_j) * bond.data[self.i_volume_scaling];
            k += w * volume * dr0 * dr0.transpose();
            active += 1;
        }
        // Pad unused axes so the full 3x3 inverse exists in lower dimensions
        for d in dim..3 {
            k[(d, d)] = 1.0;
        }

        if active <= dim {
            return Matrix3::identity();
        }
        match k.try_inverse() {
            Some(inv) => inv,
            None => Matrix3::identity(),
        }
    }
}

/// Fraction of a neighbour's effective volume lying inside the horizon.
///
/// In 2-D this is the exact circle-circle intersection area over the
/// neighbour's area; in 1-D and 3-D a linear ramp across the horizon shell.
pub fn volume_scaling(dim: usize, horizon: f64, radius_j: f64, dr: f64) -> f64 {
    if radius_j <= 0.0 || dr <= horizon - radius_j {
        return 1.0;
    }
    match dim {
        2 => {
            // http://mathworld.wolfram.com/Circle-CircleIntersection.html
            let d = dr;
            let big_r = horizon;
            let r = radius_j;
            let d1 = 0.5 * (d * d - r * r + big_r * big_r) / d;
            let d2 = 0.5 * (d * d + r * r - big_r * big_r) / d;
            let a1 = big_r * big_r * (d1 / big_r).clamp(-1.0, 1.0).acos()
                - d1 * (big_r * big_r - d1 * d1).max(0.0).sqrt();
            let a2 = r * r * (d2 / r).clamp(-1.0, 1.0).acos()
                - d2 * (r * r - d2 * d2).max(0.0).sqrt();
            ((a1 + a2) / (std::f64::consts::PI * r * r)).clamp(0.0, 1.0)
        }
        _ => (0.5 * (horizon + radius_j - dr) / radius_j).clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particles::AttributeSchema;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn two_particle_setup() -> (ParticleStore, SpatialGrid, BondNetwork) {
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        schema.register("radius").unwrap();
        let mut store = ParticleStore::new(2, schema).unwrap();
        for (id, x) in [(0usize, 0.2), (1usize, 0.4)] {
            let col = store.push_owned(id).unwrap();
            store.r[col] = Vector3::new(x, 0.5, 0.0);
            store.r0[col] = store.r[col];
        }
        let mut grid = SpatialGrid::new(
            2,
            [(0.0, 1.0), (0.0, 1.0), (0.0, 0.0)],
            0.5,
            [false; 3],
            0,
            1,
        )
        .unwrap();
        grid.place(&store).unwrap();
        let network = BondNetwork::new(BondSchema::new()).unwrap();
        (store, grid, network)
    }

    #[test]
    fn test_build_connections_pairs_within_horizon() {
        let (store, grid, mut network) = two_particle_setup();
        network.build_connections(&store, &grid, 0.3, false).unwrap();
        assert_eq!(network.bonds(0).len(), 1);
        assert_eq!(network.bonds(1).len(), 1);
        assert_eq!(network.bonds(0)[0].neighbour, 1);
        assert_relative_eq!(network.bonds(0)[0].dr0(), 0.2, epsilon = 1e-12);
        assert!(network.bonds(0)[0].connected());
    }

    #[test]
    fn test_no_self_bond_and_out_of_horizon_rejected() {
        let (store, grid, mut network) = two_particle_setup();
        network.build_connections(&store, &grid, 0.1, false).unwrap();
        assert!(network.bonds(0).is_empty());
        assert!(network.bonds(1).is_empty());
    }

    #[test]
    fn test_build_connections_matches_brute_force() {
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        schema.register("radius").unwrap();
        let mut store = ParticleStore::new(2, schema).unwrap();
        // Jittered 5x5 cloud, deterministic
        let mut id = 0usize;
        for i in 0..5 {
            for j in 0..5 {
                let col = store.push_owned(id).unwrap();
                let jitter = 0.03 * ((id * 7 % 5) as f64 - 2.0);
                store.r[col] = Vector3::new(
                    0.1 + 0.2 * i as f64 + jitter,
                    0.1 + 0.2 * j as f64 - jitter,
                    0.0,
                );
                store.r0[col] = store.r[col];
                id += 1;
            }
        }
        let horizon = 0.45;
        let mut grid = SpatialGrid::new(
            2,
            [(0.0, 1.1), (0.0, 1.1), (0.0, 0.0)],
            horizon,
            [false; 3],
            0,
            1,
        )
        .unwrap();
        grid.place(&store).unwrap();
        let mut network = BondNetwork::new(BondSchema::new()).unwrap();
        network.build_connections(&store, &grid, horizon, false).unwrap();

        let mut grid_pairs: Vec<(usize, usize)> = network
            .lists
            .iter()
            .flat_map(|(&i, bonds)| bonds.iter().map(move |b| (i, b.neighbour)))
            .collect();
        let mut brute_pairs = Vec::new();
        for a in 0..25usize {
            for b in 0..25usize {
                if a == b {
                    continue;
                }
                let ca = store.col_of(a).unwrap();
                let cb = store.col_of(b).unwrap();
                if (store.r0[ca] - store.r0[cb]).norm() <= horizon {
                    brute_pairs.push((a, b));
                }
            }
        }
        grid_pairs.sort_unstable();
        brute_pairs.sort_unstable();
        assert_eq!(grid_pairs, brute_pairs);
    }

    #[test]
    fn test_enforce_symmetry_and_prune() {
        let (store, grid, mut network) = two_particle_setup();
        network.build_connections(&store, &grid, 0.3, false).unwrap();

        // Break one side only
        network.lists.get_mut(&0).unwrap()[0].data[BOND_CONNECTED] = 0.0;
        let mirrored = network.enforce_symmetry();
        assert_eq!(mirrored, 1);
        assert!(!network.bonds(1)[0].connected());

        let removed = network.prune_disconnected();
        assert_eq!(removed, 2);
        assert_eq!(network.n_bonds(), 0);
    }

    #[test]
    fn test_volume_scaling_bounds() {
        let horizon = 1.0;
        let radius = 0.2;
        // Entirely inside the horizon
        assert_relative_eq!(volume_scaling(2, horizon, radius, 0.5), 1.0);
        assert_relative_eq!(volume_scaling(3, horizon, radius, 0.5), 1.0);
        // Straddling the horizon boundary
        for dim in [1usize, 2, 3] {
            let s = volume_scaling(dim, horizon, radius, horizon - 0.5 * radius);
            assert!(s > 0.0 && s < 1.0, "dim {} scaling {} out of (0,1)", dim, s);
        }
        // Centered exactly on the horizon in 1-D/3-D gives a half ramp
        assert_relative_eq!(volume_scaling(3, horizon, radius, horizon), 0.5);
    }

    #[test]
    fn test_shape_tensor_identity_fallback() {
        let (mut store, grid, mut network) = two_particle_setup();
        network.build_connections(&store, &grid, 0.3, false).unwrap();
        crate::particles::calculate_radius(&mut store, 1.0).unwrap();
        network.apply_volume_correction(&store, 0.3).unwrap();

        // One active neighbour in 2-D is below the invertibility threshold
        let i_volume = store.schema().get("volume").unwrap();
        let view = store.view();
        let k = network.shape_tensor(&view, 0, 0.3, i_volume);
        assert_eq!(k, Matrix3::identity());
    }
}
