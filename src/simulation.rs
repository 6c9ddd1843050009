//! Simulation assembly and per-step orchestration.
//!
//! Owns the particle store, grid, bond network, exchange layer and the
//! registered force laws and modifiers, and wires them together in the
//! order the relaxation solver expects: place, refresh ghosts, evaluate
//! forces, and only after convergence evaluate fracture.

use std::fs::File;
use std::io::BufReader;

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::info;

use crate::bonds::BondNetwork;
use crate::config::SimulationConfig;
use crate::error::PdError;
use crate::exchange::{GhostExchange, GhostSpec, Transport};
use crate::forces::{Force, ForceModel, Pmb};
use crate::grid::SpatialGrid;
use crate::modifiers::{Modifier, ModifierModel, StretchFracture};
use crate::particles::{
    calculate_radius, load_binary_with_schema, load_xyz_with_schema, AttributeSchema, BondSchema,
    ParticleStore,
};

pub struct Simulation<T> {
    pub dim: usize,
    pub horizon: f64,
    pub store: ParticleStore,
    pub grid: SpatialGrid,
    pub bonds: BondNetwork,
    pub exchange: GhostExchange<T>,
    pub forces: Vec<ForceModel>,
    pub modifiers: Vec<ModifierModel>,
}

impl<T: Transport> Simulation<T> {
    /// Collect attribute registrations from every collaborator. Must run
    /// before any particle allocation; the returned schemas seed the loader
    /// and the bond network.
    pub fn prepare_schemas(
        forces: &mut [ForceModel],
        modifiers: &mut [ModifierModel],
    ) -> Result<(AttributeSchema, BondSchema), PdError> {
        let mut particle_schema = AttributeSchema::new();
        particle_schema.register("volume")?;
        particle_schema.register("radius")?;
        particle_schema.mark_ghost("radius")?;
        let mut bond_schema = BondSchema::new();
        for force in forces.iter_mut() {
            force.register_attributes(&mut particle_schema, &mut bond_schema)?;
        }
        for modifier in modifiers.iter_mut() {
            modifier.register_attributes(&mut particle_schema, &mut bond_schema)?;
        }
        Ok((particle_schema, bond_schema))
    }

    /// Build the default collaborator set from the material section: one
    /// bond-based force and one critical-stretch fracture criterion.
    pub fn from_config(config: &SimulationConfig, transport: T) -> Result<Self, PdError> {
        let pmb = Pmb::new(
            config.material.youngs_modulus,
            config.material.poisson_ratio,
            config.domain.horizon,
            config.domain.dim,
            config.material.thickness,
        )?;
        let mut forces = vec![ForceModel::BondBased(pmb)];
        let mut modifiers = vec![ModifierModel::StretchFracture(StretchFracture::new(
            config.material.critical_stretch,
        ))];

        let (schema, bond_schema) = Self::prepare_schemas(&mut forces, &mut modifiers)?;
        let store = match config.particles.format.as_str() {
            "xyz" => {
                let file = File::open(&config.particles.path)?;
                load_xyz_with_schema(BufReader::new(file), config.domain.dim, schema)?
            }
            "bin" => load_binary_with_schema(
                &config.particles.path,
                &config.particles.columns,
                config.domain.dim,
                schema,
            )?,
            other => {
                return Err(PdError::Config(format!(
                    "unknown particle file format '{}'",
                    other
                )))
            }
        };
        Self::assemble(config, store, transport, forces, modifiers, bond_schema)
    }

    /// Wire a fully loaded store into a running simulation: distribute
    /// particles to their owning rank, derive radii, build the grid, bonds
    /// and ghost layer, then initialize every collaborator.
    pub fn assemble(
        config: &SimulationConfig,
        mut store: ParticleStore,
        transport: T,
        mut forces: Vec<ForceModel>,
        mut modifiers: Vec<ModifierModel>,
        bond_schema: BondSchema,
    ) -> Result<Self, PdError> {
        let dim = config.domain.dim;
        let horizon = config.domain.horizon;
        let rank = transport.rank();

        // Image identities must agree across ranks, so the base is derived
        // from the full particle set before distribution
        let image_id_base = store.owned_ids().iter().max().map_or(1, |m| m + 1);

        let mut grid = SpatialGrid::new(
            dim,
            config.bounds(),
            config.domain.grid_spacing,
            config.domain.periodic,
            rank,
            transport.n_ranks(),
        )?;

        // Keep only this rank's share
        let foreign: Vec<usize> = (0..store.n_owned())
            .filter(|&col| match grid.cell_id(&store.r[col]) {
                Ok(cell) => grid.owner_of(cell) != rank,
                Err(_) => false,
            })
            .map(|col| store.id_at(col))
            .collect();
        for id in foreign {
            store.delete_owned(id)?;
        }

        calculate_radius(&mut store, config.material.thickness)?;
        // Neighbour search filters on the group of both endpoints, so the
        // column must reach ghost copies before the first refresh
        if store.schema().contains("groupId") {
            store.schema_mut().mark_ghost("groupId")?;
        }
        if store.schema().contains("static") {
            let i_static = store.schema().get("static")?;
            for col in 0..store.n_owned() {
                store.is_static[col] = store.value(i_static, col) > 0.5;
            }
        }

        let mut bonds = BondNetwork::new(bond_schema)?;
        if config.domain.periodic.iter().any(|&p| p) {
            bonds.set_periodic_id_base(image_id_base);
        }
        let spec = GhostSpec {
            dim,
            with_velocity: false,
            with_r0: true,
            with_bonds: true,
        };
        let mut exchange = GhostExchange::new(transport, spec, image_id_base);

        // First refresh supplies ghost candidates for neighbour search; the
        // second re-sends them with their freshly built bond lists
        exchange.refresh_ghosts(&mut store, &mut bonds, &mut grid)?;
        bonds.build_connections(
            &store,
            &grid,
            horizon,
            config.particles.inflate_by_radius,
        )?;
        bonds.apply_volume_correction(&store, horizon)?;
        exchange.refresh_ghosts(&mut store, &mut bonds, &mut grid)?;

        for force in &mut forces {
            force.initialize(&store, &bonds)?;
        }
        for modifier in &mut modifiers {
            modifier.initialize(&mut store, &bonds)?;
        }

        info!(
            rank,
            n_particles = store.n_owned(),
            n_bonds = bonds.n_bonds(),
            "simulation assembled"
        );
        Ok(Self {
            dim,
            horizon,
            store,
            grid,
            bonds,
            exchange,
            forces,
            modifiers,
        })
    }

    pub fn transport(&self) -> &T {
        self.exchange.transport()
    }

    /// Rebuild the ghost layer from current positions.
    pub fn refresh_ghosts(&mut self) -> Result<(), PdError> {
        self.exchange
            .refresh_ghosts(&mut self.store, &mut self.bonds, &mut self.grid)
    }

    /// Hand off particles whose cell changed owner, then tell every
    /// modifier which ids arrived and left.
    pub fn migrate(&mut self) -> Result<(), PdError> {
        self.exchange
            .migrate(&mut self.store, &mut self.bonds, &mut self.grid)?;
        for modifier in &mut self.modifiers {
            modifier.notify_migrated_out(self.exchange.migrated_out());
            modifier.notify_migrated_in(self.exchange.migrated_in());
        }
        Ok(())
    }

    /// Zero and repopulate the force accumulators of every owned particle
    /// from its bond list.
    pub fn calculate_forces(&mut self) -> Result<(), PdError> {
        let n = self.store.n_owned();
        for f in self.store.f.iter_mut().take(n) {
            *f = Vector3::zeros();
        }

        let view = self.store.view();
        let forces = &self.forces;
        let contributions: Vec<(usize, Vector3<f64>)> = self
            .bonds
            .lists
            .par_iter_mut()
            .filter_map(|(&id, list)| {
                let &col = view.id_to_col.get(&id)?;
                if col >= view.n_owned {
                    return None;
                }
                let mut f = Vector3::zeros();
                for force in forces {
                    f += force.calculate_forces(id, list, &view);
                }
                Some((col, f))
            })
            .collect();
        drop(view);

        for (col, f) in contributions {
            self.store.f[col] += f;
        }
        Ok(())
    }

    /// Fictitious nodal mass from the stiffest registered force law.
    pub fn update_stable_mass(&mut self, dt: f64) {
        let view = self.store.view();
        let forces = &self.forces;
        let masses: Vec<(usize, f64)> = self
            .bonds
            .lists
            .par_iter()
            .filter_map(|(&id, list)| {
                let &col = view.id_to_col.get(&id)?;
                if col >= view.n_owned {
                    return None;
                }
                let m = forces
                    .iter()
                    .map(|f| f.calculate_stable_mass(id, list, &view, dt))
                    .fold(0.0, f64::max);
                Some((col, m))
            })
            .collect();
        drop(view);

        for (col, m) in masses {
            self.store.stable_mass[col] = if m.is_finite() && m > 0.0 { m } else { 1.0 };
        }
    }

    /// Run every modifier over the owned bond lists, restore cross-list
    /// symmetry, and report (globally) whether the topology changed.
    pub fn evaluate_fracture(&mut self) -> Result<bool, PdError> {
        let view = self.store.view();
        let modifiers = &self.modifiers;
        let broken: usize = self
            .bonds
            .lists
            .par_iter_mut()
            .map(|(&id, list)| match view.id_to_col.get(&id) {
                Some(&col) if col < view.n_owned => modifiers
                    .iter()
                    .map(|m| m.evaluate_step_one(id, list, &view))
                    .sum(),
                _ => 0,
            })
            .sum();
        drop(view);

        self.bonds.enforce_symmetry();
        let total = self
            .transport()
            .allreduce_sum(broken as f64)? as usize;

        let mut changed = false;
        for modifier in &mut self.modifiers {
            changed |= modifier.evaluate_step_two(total);
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, MaterialConfig, ParticlesConfig, SolverConfig};
    use crate::exchange::SingleRank;

    fn periodic_config() -> SimulationConfig {
        SimulationConfig {
            domain: DomainConfig {
                dim: 2,
                x: [0.0, 1.0],
                y: [0.0, 1.0],
                z: [0.0, 0.0],
                periodic: [true, false, false],
                horizon: 0.2,
                grid_spacing: 0.25,
            },
            particles: ParticlesConfig {
                path: String::new(),
                format: "xyz".into(),
                columns: Vec::new(),
                lattice_spacing: 0.1,
                inflate_by_radius: false,
            },
            material: MaterialConfig {
                youngs_modulus: 1.0e6,
                poisson_ratio: 0.33,
                thickness: 1.0,
                critical_stretch: 0.5,
            },
            solver: SolverConfig {
                dt: 1.0,
                error_threshold: 1.0e-6,
                max_iterations: 100,
                max_fracture_passes: 10,
                migration_frequency: 30,
                steps: 1,
            },
        }
    }

    /// Two particles of the same group, 0.1 apart across the periodic
    /// x-boundary; particle 1 is flagged unbreakable.
    fn grouped_pair() -> Simulation<SingleRank> {
        let config = periodic_config();
        let pmb = Pmb::new(
            config.material.youngs_modulus,
            config.material.poisson_ratio,
            config.domain.horizon,
            config.domain.dim,
            config.material.thickness,
        )
        .unwrap();
        let mut forces = vec![ForceModel::BondBased(pmb)];
        let mut modifiers = vec![ModifierModel::StretchFracture(StretchFracture::new(
            config.material.critical_stretch,
        ))];
        let (mut schema, bond_schema) =
            Simulation::<SingleRank>::prepare_schemas(&mut forces, &mut modifiers).unwrap();
        schema.register("groupId").unwrap();
        let i_volume = schema.get("volume").unwrap();
        let i_group = schema.get("groupId").unwrap();
        let i_unbreakable = schema.get("unbreakable").unwrap();

        let mut store = ParticleStore::new(2, schema).unwrap();
        for (id, x) in [(0usize, 0.05), (1usize, 0.95)] {
            let col = store.push_owned(id).unwrap();
            store.r[col] = nalgebra::Vector3::new(x, 0.5, 0.0);
            store.r0[col] = store.r[col];
            store.set_value(i_volume, col, 1.0e-2);
            store.set_value(i_group, col, 2.0);
        }
        store.set_value(i_unbreakable, store.col_of(1).unwrap(), 1.0);
        Simulation::assemble(&config, store, SingleRank, forces, modifiers, bond_schema).unwrap()
    }

    #[test]
    fn test_same_group_bond_crosses_periodic_boundary() {
        let sim = grouped_pair();
        assert_eq!(sim.bonds.bonds(0).len(), 1);
        assert_eq!(sim.bonds.canonical(sim.bonds.bonds(0)[0].neighbour), 1);
        assert_eq!(sim.bonds.bonds(1).len(), 1);
        assert_eq!(sim.bonds.canonical(sim.bonds.bonds(1)[0].neighbour), 0);
    }

    #[test]
    fn test_ghost_images_carry_neighbour_read_columns() {
        let sim = grouped_pair();
        let i_group = sim.store.schema().get("groupId").unwrap();
        let i_unbreakable = sim.store.schema().get("unbreakable").unwrap();
        assert!(sim.store.n_ghosts() > 0);
        for col in sim.store.n_owned()..sim.store.n_total() {
            assert_eq!(sim.store.value(i_group, col), 2.0);
        }
        let image_of_1 = (sim.store.n_owned()..sim.store.n_total())
            .find(|&col| sim.bonds.canonical(sim.store.id_at(col)) == 1)
            .unwrap();
        assert_eq!(sim.store.value(i_unbreakable, image_of_1), 1.0);
    }
}
