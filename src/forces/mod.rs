//! Constitutive force laws.
//!
//! A force law participates in two phases: attribute registration before
//! particle allocation, then index resolution and parameter derivation once
//! the schemas are frozen. The hot path is [`Force::calculate_forces`],
//! called per owned particle with a mutable slice of that particle's bonds.

pub mod pmb;

use nalgebra::Vector3;

use crate::bonds::{Bond, BondNetwork};
use crate::error::PdError;
use crate::particles::{AttributeSchema, BondSchema, ParticleId, ParticleStore, ParticleView};

pub use pmb::Pmb;

/// Symmetric stress components in Voigt-like order:
/// `[s_xx, s_yy, s_xy, s_zz, s_xz, s_yz]`.
pub type StressComponents = [f64; 6];

pub trait Force {
    /// Declare particle and bond attributes. Runs before allocation; the
    /// schemas are still open.
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError>;

    /// Resolve attribute indices and derive material parameters. Runs after
    /// allocation and bond construction, before the first force evaluation.
    fn initialize(&mut self, store: &ParticleStore, bonds: &BondNetwork) -> Result<(), PdError>;

    /// Accumulated internal force density on one particle. May write
    /// per-bond state such as the current stretch.
    fn calculate_forces(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> Vector3<f64>;

    /// First-order stress estimate assembled from the bond forces.
    fn calculate_stress(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
    ) -> StressComponents;

    /// Upper bound on the fictitious nodal stiffness used by dynamic
    /// relaxation, per unit squared timestep.
    fn calculate_stable_mass(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
        dt: f64,
    ) -> f64;

    /// End-of-step state update. Most bond-based laws carry no evolving
    /// state and keep the default no-op.
    fn update_state(
        &mut self,
        _store: &mut ParticleStore,
        _bonds: &BondNetwork,
    ) -> Result<(), PdError> {
        Ok(())
    }
}

/// Closed set of constitutive laws. The solver iterates these uniformly
/// through the [`Force`] trait; adding a law means adding a variant here.
#[derive(Debug, Clone)]
pub enum ForceModel {
    BondBased(Pmb),
}

impl Force for ForceModel {
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError> {
        match self {
            ForceModel::BondBased(f) => f.register_attributes(particle_schema, bond_schema),
        }
    }

    fn initialize(&mut self, store: &ParticleStore, bonds: &BondNetwork) -> Result<(), PdError> {
        match self {
            ForceModel::BondBased(f) => f.initialize(store, bonds),
        }
    }

    fn calculate_forces(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> Vector3<f64> {
        match self {
            ForceModel::BondBased(f) => f.calculate_forces(id, bonds, view),
        }
    }

    fn calculate_stress(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
    ) -> StressComponents {
        match self {
            ForceModel::BondBased(f) => f.calculate_stress(id, bonds, view),
        }
    }

    fn calculate_stable_mass(
        &self,
        id: ParticleId,
        bonds: &[Bond],
        view: &ParticleView<'_>,
        dt: f64,
    ) -> f64 {
        match self {
            ForceModel::BondBased(f) => f.calculate_stable_mass(id, bonds, view, dt),
        }
    }

    fn update_state(
        &mut self,
        store: &mut ParticleStore,
        bonds: &BondNetwork,
    ) -> Result<(), PdError> {
        match self {
            ForceModel::BondBased(f) => f.update_state(store, bonds),
        }
    }
}
