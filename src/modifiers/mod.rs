//! Post-convergence modifiers, chiefly fracture criteria.
//!
//! Modifiers run in two steps: step one is evaluated per owned particle in
//! parallel and may cut bonds; step two aggregates the per-rank outcome and
//! reports whether the equilibrium must be re-relaxed. Migration notifies
//! modifiers of ids entering or leaving the rank so any per-id state they
//! hold stays valid.

pub mod fracture;

use crate::bonds::{Bond, BondNetwork};
use crate::error::PdError;
use crate::particles::{AttributeSchema, BondSchema, ParticleId, ParticleStore, ParticleView};

pub use fracture::StretchFracture;

pub trait Modifier {
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError>;

    fn initialize(&mut self, store: &mut ParticleStore, bonds: &BondNetwork)
        -> Result<(), PdError>;

    /// Per-particle evaluation; returns the number of bonds cut on this
    /// particle's list. Symmetry across lists is restored afterwards by the
    /// bond network, not here.
    fn evaluate_step_one(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> usize;

    /// Aggregate step: `total_broken` sums step-one results over every rank.
    /// Returns true when the topology changed and relaxation must resume.
    fn evaluate_step_two(&mut self, total_broken: usize) -> bool;

    fn notify_migrated_in(&mut self, _ids: &[ParticleId]) {}

    fn notify_migrated_out(&mut self, _ids: &[ParticleId]) {}
}

/// Closed set of modifiers, dispatched uniformly by the solver.
#[derive(Debug, Clone)]
pub enum ModifierModel {
    StretchFracture(StretchFracture),
}

impl Modifier for ModifierModel {
    fn register_attributes(
        &mut self,
        particle_schema: &mut AttributeSchema,
        bond_schema: &mut BondSchema,
    ) -> Result<(), PdError> {
        match self {
            ModifierModel::StretchFracture(m) => {
                m.register_attributes(particle_schema, bond_schema)
            }
        }
    }

    fn initialize(
        &mut self,
        store: &mut ParticleStore,
        bonds: &BondNetwork,
    ) -> Result<(), PdError> {
        match self {
            ModifierModel::StretchFracture(m) => m.initialize(store, bonds),
        }
    }

    fn evaluate_step_one(
        &self,
        id: ParticleId,
        bonds: &mut [Bond],
        view: &ParticleView<'_>,
    ) -> usize {
        match self {
            ModifierModel::StretchFracture(m) => m.evaluate_step_one(id, bonds, view),
        }
    }

    fn evaluate_step_two(&mut self, total_broken: usize) -> bool {
        match self {
            ModifierModel::StretchFracture(m) => m.evaluate_step_two(total_broken),
        }
    }

    fn notify_migrated_in(&mut self, ids: &[ParticleId]) {
        match self {
            ModifierModel::StretchFracture(m) => m.notify_migrated_in(ids),
        }
    }

    fn notify_migrated_out(&mut self, ids: &[ParticleId]) {
        match self {
            ModifierModel::StretchFracture(m) => m.notify_migrated_out(ids),
        }
    }
}
