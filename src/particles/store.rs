//! Columnar particle storage.
//!
//! Structure-of-Arrays layout for positions, velocities, force accumulators
//! and a named scalar-attribute table, with a bidirectional map between
//! stable particle ids and current column slots. Owned particles occupy
//! columns `0..n_owned`; ghost copies received from other ranks are appended
//! after them and rebuilt from scratch every exchange cycle.

use nalgebra::Vector3;
use std::collections::HashMap;

use crate::error::PdError;
use crate::particles::schema::AttributeSchema;

/// Stable particle identifier, unique across all ranks.
pub type ParticleId = usize;

#[derive(Debug, Clone)]
pub struct ParticleStore {
    dim: usize,
    schema: AttributeSchema,

    /// Current positions
    pub r: Vec<Vector3<f64>>,
    /// Reference (undeformed) positions
    pub r0: Vec<Vector3<f64>>,
    /// Velocities
    pub v: Vec<Vector3<f64>>,
    /// Force accumulator for the current evaluation
    pub f: Vec<Vector3<f64>>,
    /// Force of the previous relaxation iteration
    pub f_old: Vec<Vector3<f64>>,
    /// Per-particle stability bound used by the ADR integrator
    pub stable_mass: Vec<f64>,
    /// Particles pinned by boundary conditions; skipped by the integrator
    pub is_static: Vec<bool>,

    /// Scalar attribute table, `data[attr][col]`
    data: Vec<Vec<f64>>,

    col_to_id: Vec<ParticleId>,
    id_to_col: HashMap<ParticleId, usize>,
    n_owned: usize,
}

/// Read-only view of the particle state handed to force and fracture
/// evaluations, split from the mutable force rows so per-particle loops can
/// run in parallel.
#[derive(Clone, Copy)]
pub struct ParticleView<'a> {
    pub dim: usize,
    pub n_owned: usize,
    pub r: &'a [Vector3<f64>],
    pub r0: &'a [Vector3<f64>],
    pub data: &'a [Vec<f64>],
    pub id_to_col: &'a HashMap<ParticleId, usize>,
}

impl<'a> ParticleView<'a> {
    /// Resolve a stable id to its current column. Ids are resolved at use
    /// time only; callers must hold ids that are present on this rank.
    #[inline]
    pub fn col(&self, id: ParticleId) -> usize {
        self.id_to_col[&id]
    }

    #[inline]
    pub fn value(&self, attr: usize, col: usize) -> f64 {
        self.data[attr][col]
    }
}

impl ParticleStore {
    pub fn new(dim: usize, schema: AttributeSchema) -> Result<Self, PdError> {
        if dim == 0 || dim > 3 {
            return Err(PdError::UnsupportedDimension(dim));
        }
        Ok(Self {
            dim,
            schema,
            r: Vec::new(),
            r0: Vec::new(),
            v: Vec::new(),
            f: Vec::new(),
            f_old: Vec::new(),
            stable_mass: Vec::new(),
            is_static: Vec::new(),
            data: Vec::new(),
            col_to_id: Vec::new(),
            id_to_col: HashMap::new(),
            n_owned: 0,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn schema(&self) -> &AttributeSchema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut AttributeSchema {
        &mut self.schema
    }

    pub fn n_owned(&self) -> usize {
        self.n_owned
    }

    pub fn n_total(&self) -> usize {
        self.col_to_id.len()
    }

    pub fn n_ghosts(&self) -> usize {
        self.col_to_id.len() - self.n_owned
    }

    /// Append an owned particle, freezing the attribute schema on first use.
    pub fn push_owned(&mut self, id: ParticleId) -> Result<usize, PdError> {
        debug_assert_eq!(self.n_ghosts(), 0, "owned slots must precede ghost slots");
        if self.id_to_col.contains_key(&id) {
            return Err(PdError::Config(format!("duplicate particle id {}", id)));
        }
        if !self.schema.is_frozen() {
            self.schema.freeze();
            self.data = vec![Vec::new(); self.schema.len()];
        }
        let col = self.push_slot(id);
        self.n_owned += 1;
        Ok(col)
    }

    /// Append a ghost slot after all owned slots.
    pub fn push_ghost(&mut self, id: ParticleId) -> usize {
        self.push_slot(id)
    }

    fn push_slot(&mut self, id: ParticleId) -> usize {
        let col = self.col_to_id.len();
        self.r.push(Vector3::zeros());
        self.r0.push(Vector3::zeros());
        self.v.push(Vector3::zeros());
        self.f.push(Vector3::zeros());
        self.f_old.push(Vector3::zeros());
        self.stable_mass.push(0.0);
        self.is_static.push(false);
        for column in &mut self.data {
            column.push(0.0);
        }
        self.col_to_id.push(id);
        self.id_to_col.insert(id, col);
        col
    }

    /// Invalidate every ghost slot; their columns and id mappings disappear.
    pub fn clear_ghosts(&mut self) {
        for col in self.n_owned..self.col_to_id.len() {
            self.id_to_col.remove(&self.col_to_id[col]);
        }
        let n = self.n_owned;
        self.r.truncate(n);
        self.r0.truncate(n);
        self.v.truncate(n);
        self.f.truncate(n);
        self.f_old.truncate(n);
        self.stable_mass.truncate(n);
        self.is_static.truncate(n);
        for column in &mut self.data {
            column.truncate(n);
        }
        self.col_to_id.truncate(n);
    }

    /// Remove an owned particle by id, backfilling its column with the last
    /// owned slot. Ghost slots must have been cleared first.
    pub fn delete_owned(&mut self, id: ParticleId) -> Result<(), PdError> {
        debug_assert_eq!(self.n_ghosts(), 0, "clear ghosts before deleting owned particles");
        let col = *self
            .id_to_col
            .get(&id)
            .ok_or(PdError::UnknownParticle(id))?;
        let last = self.n_owned - 1;
        if col != last {
            self.r.swap(col, last);
            self.r0.swap(col, last);
            self.v.swap(col, last);
            self.f.swap(col, last);
            self.f_old.swap(col, last);
            self.stable_mass.swap(col, last);
            self.is_static.swap(col, last);
            for column in &mut self.data {
                column.swap(col, last);
            }
            let moved = self.col_to_id[last];
            self.col_to_id[col] = moved;
            self.id_to_col.insert(moved, col);
        }
        self.r.pop();
        self.r0.pop();
        self.v.pop();
        self.f.pop();
        self.f_old.pop();
        self.stable_mass.pop();
        self.is_static.pop();
        for column in &mut self.data {
            column.pop();
        }
        self.col_to_id.pop();
        self.id_to_col.remove(&id);
        self.n_owned -= 1;
        Ok(())
    }

    #[inline]
    pub fn col_of(&self, id: ParticleId) -> Option<usize> {
        self.id_to_col.get(&id).copied()
    }

    #[inline]
    pub fn id_at(&self, col: usize) -> ParticleId {
        self.col_to_id[col]
    }

    pub fn owned_ids(&self) -> &[ParticleId] {
        &self.col_to_id[..self.n_owned]
    }

    #[inline]
    pub fn value(&self, attr: usize, col: usize) -> f64 {
        self.data[attr][col]
    }

    #[inline]
    pub fn set_value(&mut self, attr: usize, col: usize, value: f64) {
        self.data[attr][col] = value;
    }

    pub fn view(&self) -> ParticleView<'_> {
        ParticleView {
            dim: self.dim,
            n_owned: self.n_owned,
            r: &self.r,
            r0: &self.r0,
            data: &self.data,
            id_to_col: &self.id_to_col,
        }
    }

    /// Verify that `id_to_col` and `col_to_id` are exact inverses over every
    /// valid column, ghost slots included.
    pub fn id_map_consistent(&self) -> bool {
        if self.id_to_col.len() != self.col_to_id.len() {
            return false;
        }
        self.col_to_id
            .iter()
            .enumerate()
            .all(|(col, id)| self.id_to_col.get(id) == Some(&col))
    }
}
