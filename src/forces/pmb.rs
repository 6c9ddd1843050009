//! Prototype microelastic brittle (PMB) bond force.
//!
//! The pair force is linear in the bond stretch with a dimension-dependent
//! micromodulus derived from the macroscopic elastic constants. The current
//! stretch is written back onto each bond so fracture criteria can read it
//! without recomputing geometry.

use nalgebra::Vector3;

use crate::bonds::{Bond, BondNetwork};
use crate::error::PdError;
use crate::forces::{Force, StressComponents};
use crate::particles::{AttributeSchema, BondSchema, ParticleId, ParticleStore, ParticleView};

#[derive(Debug, Clone)]
pub struct Pmb {
    dim: usize,
    horizon: f64,
    micromodulus: f64,
    i_volume: usize,
    i_stretch: usize,
    i_volume_scaling: usize,
}

impl Pmb {
    /// Derive the micromodulus from Young's modulus and Poisson's ratio.
    /// In 2-D the plane-stress form is used; `thickness` is the out-of-plane
    /// extent (cross-section side length in 1-D).
    pub fn new(
        youngs_modulus: f64,
        poisson_ratio: f64,
        horizon: f64,
        dim: usize,
        thickness: f64,
    ) -> Result<Self, PdError> {
        let micromodulus = match dim {
            3 => {
                let k = youngs_modulus / (3.0 * (1.0 - 2.0 * poisson_ratio));
                18.0 * k / (std::f64::consts::PI * horizon.powi(4))
            }
            2 => {
                let k = youngs_modulus / (2.0 * (1.0 - poisson_ratio));
                12.0 * k / (std::f64::consts::PI * thickness * horizon.powi(3))
            }
            1 => {
                let area = thickness * thickness;
                2.0 * youngs_modulus / (area * horizon * horizon)
            }
            d => return Err(PdError::UnsupportedDimension(d)),
        };
        Ok(Self {
            dim,
            horizon,
            micromodulus,
            i_volume: 0,
            i_stretch: 0,
            i_volume_scaling: 0,
        })
    }

    pub fn micromodulus(&self) -> f64 {
        self.micromodulus
    }
}

impl Force for Pmb {
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError> {
        // Ghost copies need the neighbour volume for force evaluation
        particle_schema.mark_ghost("volume")?;
        bond_schema.register("stretch")?;
        Ok(())
    }

    fn initialize(&mut self, store: &ParticleStore, bonds: &BondNetwork) -> Result<(), PdError> {
        self.i_volume = store.schema().get("volume")?;
        self.i_stretch = bonds.schema().get("stretch")?;
        self.i_volume_scaling = bonds.volume_scaling_index();
        Ok(())
    }

    fn calculate_forces(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> Vector3<f64> {
        let col_i = view.col(id);
        let r_i = view.r[col_i];
        let mut f = Vector3::zeros();

        for bond in bonds.iter_mut() {
            if !bond.connected() {
                continue;
            }
            let col_j = view.col(bond.neighbour);
            let volume =
                view.value(self.i_volume, col_j) * bond.data[self.i_volume_scaling];
            let dr0 = bond.dr0();

            let dr_vec: Vector3<f64> = view.r[col_j] - r_i;
            let dr = dr_vec.norm();
            let stretch = (dr - dr0) / dr0;
            let g = self.micromodulus * stretch * volume / dr;

            f += g * dr_vec;
            bond.data[self.i_stretch] = stretch;
        }
        f
    }

    fn calculate_stress(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
    ) -> StressComponents {
        let col_i = view.col(id);
        let r_i = view.r[col_i];
        let mut s = [0.0; 6];

        for bond in bonds.iter().filter(|b| b.connected()) {
            let col_j = view.col(bond.neighbour);
            let volume =
                view.value(self.i_volume, col_j) * bond.data[self.i_volume_scaling];
            let dr0 = bond.dr0();

            let dr_vec: Vector3<f64> = view.r[col_j] - r_i;
            let dr = dr_vec.norm();
            let g = self.micromodulus * (dr - dr0) / dr0 * volume / dr;

            s[0] += 0.5 * dr_vec.x * dr_vec.x * g;
            s[1] += 0.5 * dr_vec.y * dr_vec.y * g;
            s[2] += 0.5 * dr_vec.x * dr_vec.y * g;
            if self.dim == 3 {
                s[3] += 0.5 * dr_vec.z * dr_vec.z * g;
                s[4] += 0.5 * dr_vec.x * dr_vec.z * g;
                s[5] += 0.5 * dr_vec.y * dr_vec.z * g;
            }
        }
        s
    }

    fn calculate_stable_mass(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
        dt: f64,
    ) -> f64 {
        let dt = dt * 1.1;
        let col_i = view.col(id);
        let r0_i = view.r0[col_i];

        let mut k = [0.0f64; 3];
        for bond in bonds.iter().filter(|b| b.connected()) {
            let col_j = view.col(bond.neighbour);
            let volume =
                view.value(self.i_volume, col_j) * bond.data[self.i_volume_scaling];
            let dr0_vec: Vector3<f64> = r0_i - view.r0[col_j];
            let dr0 = bond.dr0();

            let c = self.micromodulus * volume / (dr0 * dr0);
            let sum: f64 = (0..self.dim).map(|d| dr0_vec[d].abs()).sum();
            for d in 0..self.dim {
                k[d] += dr0_vec[d].abs() * c * sum;
            }
        }

        let stiffness = k.iter().cloned().fold(0.0, f64::max);
        if stiffness == 0.0 {
            // Fully disconnected particle; any positive mass keeps the
            // integrator finite
            return 1.0;
        }
        2.0 * 0.25 * dt * dt * stiffness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_micromodulus_positive_in_all_dimensions() {
        for dim in 1..=3 {
            let pmb = Pmb::new(1.0e9, 0.3, 0.01, dim, 1.0e-3).unwrap();
            assert!(pmb.micromodulus() > 0.0, "dim {}", dim);
        }
        assert!(Pmb::new(1.0e9, 0.3, 0.01, 4, 1.0e-3).is_err());
    }

    #[test]
    fn test_pair_forces_equal_and_opposite() {
        use crate::grid::SpatialGrid;
        use crate::particles::BondSchema;

        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        let mut bond_schema = BondSchema::new();
        let mut pmb = Pmb::new(1.0e6, 1.0 / 3.0, 0.4, 2, 1.0).unwrap();
        pmb.register_attributes(&mut schema, &mut bond_schema).unwrap();
        let i_volume = schema.get("volume").unwrap();

        let mut store = ParticleStore::new(2, schema).unwrap();
        for (id, x) in [(0usize, 0.3), (1usize, 0.6)] {
            let col = store.push_owned(id).unwrap();
            store.r0[col] = Vector3::new(x, 0.5, 0.0);
            store.r[col] = store.r0[col];
            store.set_value(i_volume, col, 1.0e-2);
        }
        // Stretch the pair
        store.r[1].x += 0.05;

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
        let mut network = crate::bonds::BondNetwork::new(bond_schema).unwrap();
        network.build_connections(&store, &grid, 0.4, false).unwrap();
        pmb.initialize(&store, &network).unwrap();

        let view = store.view();
        let mut bonds0 = network.bonds(0).to_vec();
        let mut bonds1 = network.bonds(1).to_vec();
        let f0 = pmb.calculate_forces(0, &mut bonds0, &view);
        let f1 = pmb.calculate_forces(1, &mut bonds1, &view);

        assert!(f0.x > 0.0);
        assert_relative_eq!(f0.x, -f1.x, epsilon = 1e-9 * f0.x.abs());
        assert_relative_eq!(f0.y, 0.0);

        // Tension shows up as positive normal stress along the pair axis
        let s = pmb.calculate_stress(0, &bonds0, &view);
        assert!(s[0] > 0.0);
        assert_relative_eq!(s[1], 0.0);

        // Both directions record the same stretch
        let i_stretch = network.schema().get("stretch").unwrap();
        assert_relative_eq!(
            bonds0[0].data[i_stretch],
            0.05 / 0.3,
            epsilon = 1e-12
        );
        assert_relative_eq!(bonds0[0].data[i_stretch], bonds1[0].data[i_stretch]);
    }

    #[test]
    fn test_stable_mass_floor_without_bonds() {
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        let mut bond_schema = BondSchema::new();
        let mut pmb = Pmb::new(1.0e6, 1.0 / 3.0, 0.4, 2, 1.0).unwrap();
        pmb.register_attributes(&mut schema, &mut bond_schema).unwrap();

        let mut store = ParticleStore::new(2, schema).unwrap();
        store.push_owned(7).unwrap();
        let network = crate::bonds::BondNetwork::new(bond_schema).unwrap();
        pmb.initialize(&store, &network).unwrap();

        let view = store.view();
        assert_eq!(pmb.calculate_stable_mass(7, &[], &view, 1.0e-3), 1.0);
    }
}
