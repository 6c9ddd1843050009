//! Critical-stretch fracture criterion.

use tracing::debug;

use crate::bonds::{Bond, BondNetwork};
use crate::error::PdError;
use crate::modifiers::Modifier;
use crate::particles::{
    AttributeSchema, BondSchema, ParticleId, ParticleStore, ParticleView, BOND_CONNECTED,
};

/// Breaks a bond when its stretch exceeds the smaller of the two endpoint
/// thresholds. Thresholds live in the per-particle `s00` column so material
/// heterogeneity and unbreakable regions stay expressible.
#[derive(Debug, Clone)]
pub struct StretchFracture {
    critical_stretch: f64,
    i_s00: usize,
    i_stretch: usize,
    i_unbreakable: usize,
    state_changed: bool,
}

impl StretchFracture {
    pub fn new(critical_stretch: f64) -> Self {
        Self {
            critical_stretch,
            i_s00: 0,
            i_stretch: 0,
            i_unbreakable: 0,
            state_changed: false,
        }
    }
}

impl Modifier for StretchFracture {
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError> {
        particle_schema.register("s00")?;
        particle_schema.mark_ghost("s00")?;
        // Both endpoint flags gate a break, so the column must travel with
        // ghost copies across rank and periodic boundaries
        particle_schema.register("unbreakable")?;
        particle_schema.mark_ghost("unbreakable")?;
        // The stretch column is owned by the force law; registration is
        // idempotent so ordering against it does not matter
        bond_schema.register("stretch")?;
        Ok(())
    }

    fn initialize(
        &mut self,
        store: &mut ParticleStore,
        bonds: &BondNetwork,
    ) -> Result<(), PdError> {
        self.i_s00 = store.schema().get("s00")?;
        self.i_stretch = bonds.schema().get("stretch")?;
        self.i_unbreakable = store.schema().get("unbreakable")?;
        for col in 0..store.n_total() {
            if store.value(self.i_s00, col) == 0.0 {
                store.set_value(self.i_s00, col, self.critical_stretch);
            }
        }
        Ok(())
    }

    fn evaluate_step_one(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> usize {
        let col_i = view.col(id);
        if view.value(self.i_unbreakable, col_i) > 0.5 {
            return 0;
        }
        let s00_i = view.value(self.i_s00, col_i);

        let mut broken = 0;
        for bond in bonds.iter_mut() {
            if !bond.connected() {
                continue;
            }
            let col_j = view.col(bond.neighbour);
            if view.value(self.i_unbreakable, col_j) > 0.5 {
                continue;
            }
            let s00 = s00_i.min(view.value(self.i_s00, col_j));
            if bond.data[self.i_stretch] > s00 {
                bond.data[BOND_CONNECTED] = 0.0;
                broken += 1;
            }
        }
        broken
    }

    fn evaluate_step_two(&mut self, total_broken: usize) -> bool {
        self.state_changed = total_broken > 0;
        if self.state_changed {
            debug!(broken = total_broken, "bonds cut this pass");
        }
        self.state_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::SpatialGrid;
    use nalgebra::Vector3;

    fn setup(critical: f64) -> (ParticleStore, crate::bonds::BondNetwork, StretchFracture) {
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        let mut bond_schema = BondSchema::new();
        let mut fracture = StretchFracture::new(critical);
        fracture
            .register_attributes(&mut schema, &mut bond_schema)
            .unwrap();

        let mut store = ParticleStore::new(2, schema).unwrap();
        for (id, x) in [(0usize, 0.3), (1usize, 0.6)] {
            let col = store.push_owned(id).unwrap();
            store.r0[col] = Vector3::new(x, 0.5, 0.0);
            store.r[col] = store.r0[col];
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
        let mut network = crate::bonds::BondNetwork::new(bond_schema).unwrap();
        network.build_connections(&store, &grid, 0.4, false).unwrap();
        fracture.initialize(&mut store, &network).unwrap();
        (store, network, fracture)
    }

    #[test]
    fn test_breaks_only_past_critical_stretch() {
        let (store, mut network, fracture) = setup(0.1);
        let i_stretch = network.schema().get("stretch").unwrap();
        let view = store.view();

        let mut bonds = network.bonds(0).to_vec();
        bonds[0].data[i_stretch] = 0.05;
        assert_eq!(fracture.evaluate_step_one(0, &mut bonds, &view), 0);
        assert!(bonds[0].connected());

        bonds[0].data[i_stretch] = 0.2;
        assert_eq!(fracture.evaluate_step_one(0, &mut bonds, &view), 1);
        assert!(!bonds[0].connected());
        network.set_bonds(0, bonds);
    }

    #[test]
    fn test_unbreakable_neighbour_shields_the_bond() {
        let (mut store, network, fracture) = setup(0.1);
        let i_unbreakable = store.schema().get("unbreakable").unwrap();
        // Neighbour-read column, so ghost copies must carry it
        assert!(store.schema().ghost_columns().contains(&i_unbreakable));

        let col = store.col_of(1).unwrap();
        store.set_value(i_unbreakable, col, 1.0);
        let i_stretch = network.schema().get("stretch").unwrap();
        let view = store.view();

        let mut bonds = network.bonds(0).to_vec();
        bonds[0].data[i_stretch] = 0.2;
        assert_eq!(fracture.evaluate_step_one(0, &mut bonds, &view), 0);
        assert!(bonds[0].connected());
    }

    #[test]
    fn test_step_two_reports_topology_change() {
        let (_, _, mut fracture) = setup(0.1);
        assert!(!fracture.evaluate_step_two(0));
        assert!(fracture.evaluate_step_two(3));
    }
}
