//! Flat `f64` wire records for ghost refresh and particle migration.
//!
//! Ids are carried as exactly representable integers. A record is
//! self-delimiting given the schema widths agreed at configuration time;
//! any underrun while decoding is a fatal protocol error.

use nalgebra::Vector3;

use crate::bonds::{Bond, BondNetwork};
use crate::error::PdError;
use crate::particles::{ParticleId, ParticleStore};

/// Which optional state a ghost record carries, fixed per simulation by the
/// needs of the registered force laws.
#[derive(Debug, Clone, Copy)]
pub struct GhostSpec {
    pub dim: usize,
    pub with_velocity: bool,
    pub with_r0: bool,
    pub with_bonds: bool,
}

struct Reader<'a> {
    buf: &'a [f64],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [f64]) -> Self {
        Self { buf, pos: 0 }
    }

    fn f64(&mut self) -> Result<f64, PdError> {
        let v = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| PdError::Protocol("truncated record".into()))?;
        self.pos += 1;
        Ok(v)
    }

    fn id(&mut self) -> Result<ParticleId, PdError> {
        Ok(self.f64()? as ParticleId)
    }

    fn vector(&mut self, dim: usize) -> Result<Vector3<f64>, PdError> {
        let mut v = Vector3::zeros();
        for d in 0..dim {
            v[d] = self.f64()?;
        }
        Ok(v)
    }

    fn done(&self) -> bool {
        self.pos == self.buf.len()
    }
}

fn push_vector(out: &mut Vec<f64>, v: &Vector3<f64>, dim: usize) {
    for d in 0..dim {
        out.push(v[d]);
    }
}

/// Append one ghost record for `id`, translated by `shift` (nonzero only
/// for copies crossing a periodic boundary). `wire_id` is the identity the
/// copy assumes on the receiving side; it differs from `id` only for
/// periodic images.
pub fn pack_ghost(
    store: &ParticleStore,
    bonds: &BondNetwork,
    id: ParticleId,
    wire_id: ParticleId,
    shift: &Vector3<f64>,
    spec: &GhostSpec,
    out: &mut Vec<f64>,
) -> Result<(), PdError> {
    let col = store
        .col_of(id)
        .ok_or(PdError::UnknownParticle(id))?;

    out.push(wire_id as f64);
    push_vector(out, &(store.r[col] + shift), spec.dim);
    if spec.with_velocity {
        push_vector(out, &store.v[col], spec.dim);
    }
    if spec.with_r0 {
        push_vector(out, &(store.r0[col] + shift), spec.dim);
    }
    for &attr in store.schema().ghost_columns() {
        out.push(store.value(attr, col));
    }
    if spec.with_bonds {
        let list = bonds.bonds(id);
        out.push(list.len() as f64);
        for bond in list {
            out.push(bond.neighbour as f64);
            out.extend_from_slice(&bond.data);
        }
    }
    Ok(())
}

/// Decode a buffer of ghost records, appending each as a ghost slot.
/// Returns the received ids.
pub fn unpack_ghosts(
    store: &mut ParticleStore,
    bonds: &mut BondNetwork,
    spec: &GhostSpec,
    buf: &[f64],
) -> Result<Vec<ParticleId>, PdError> {
    let ghost_attrs: Vec<usize> = store.schema().ghost_columns().to_vec();
    let n_bond_params = bonds.schema().len();
    let mut reader = Reader::new(buf);
    let mut ids = Vec::new();

    while !reader.done() {
        let id = reader.id()?;
        let col = store.push_ghost(id);
        store.r[col] = reader.vector(spec.dim)?;
        if spec.with_velocity {
            store.v[col] = reader.vector(spec.dim)?;
        }
        if spec.with_r0 {
            store.r0[col] = reader.vector(spec.dim)?;
        }
        for &attr in &ghost_attrs {
            let v = reader.f64()?;
            store.set_value(attr, col, v);
        }
        if spec.with_bonds {
            let n_bonds = reader.id()?;
            let mut list = Vec::with_capacity(n_bonds);
            for _ in 0..n_bonds {
                let neighbour = reader.id()?;
                let mut data = Vec::with_capacity(n_bond_params);
                for _ in 0..n_bond_params {
                    data.push(reader.f64()?);
                }
                list.push(Bond { neighbour, data });
            }
            bonds.set_bonds(id, list);
        }
        ids.push(id);
    }
    Ok(ids)
}

/// Append the full state of a particle handing ownership to another rank.
/// `shift` is the periodic translation into the receiver's frame.
pub fn pack_migrating(
    store: &ParticleStore,
    bonds: &BondNetwork,
    id: ParticleId,
    shift: &Vector3<f64>,
    out: &mut Vec<f64>,
) -> Result<(), PdError> {
    let col = store
        .col_of(id)
        .ok_or(PdError::UnknownParticle(id))?;
    let dim = store.dim();

    out.push(id as f64);
    push_vector(out, &(store.r[col] + shift), dim);
    push_vector(out, &(store.r0[col] + shift), dim);
    push_vector(out, &store.v[col], dim);
    push_vector(out, &store.f[col], dim);
    push_vector(out, &store.f_old[col], dim);
    out.push(store.stable_mass[col]);
    out.push(if store.is_static[col] { 1.0 } else { 0.0 });
    for attr in 0..store.schema().len() {
        out.push(store.value(attr, col));
    }
    let list = bonds.bonds(id);
    out.push(list.len() as f64);
    for bond in list {
        out.push(bond.neighbour as f64);
        out.extend_from_slice(&bond.data);
    }
    Ok(())
}

/// Decode a buffer of migration records, appending each as a newly owned
/// particle. Returns the received ids.
pub fn unpack_migrating(
    store: &mut ParticleStore,
    bonds: &mut BondNetwork,
    buf: &[f64],
) -> Result<Vec<ParticleId>, PdError> {
    let dim = store.dim();
    let n_attrs = store.schema().len();
    let n_bond_params = bonds.schema().len();
    let mut reader = Reader::new(buf);
    let mut ids = Vec::new();

    while !reader.done() {
        let id = reader.id()?;
        let col = store.push_owned(id)?;
        store.r[col] = reader.vector(dim)?;
        store.r0[col] = reader.vector(dim)?;
        store.v[col] = reader.vector(dim)?;
        store.f[col] = reader.vector(dim)?;
        store.f_old[col] = reader.vector(dim)?;
        store.stable_mass[col] = reader.f64()?;
        store.is_static[col] = reader.f64()? > 0.5;
        for attr in 0..n_attrs {
            let v = reader.f64()?;
            store.set_value(attr, col, v);
        }
        let n_bonds = reader.id()?;
        let mut list = Vec::with_capacity(n_bonds);
        for _ in 0..n_bonds {
            let neighbour = reader.id()?;
            let mut data = Vec::with_capacity(n_bond_params);
            for _ in 0..n_bond_params {
                data.push(reader.f64()?);
            }
            list.push(Bond { neighbour, data });
        }
        bonds.set_bonds(id, list);
        ids.push(id);
    }
    Ok(ids)
}
