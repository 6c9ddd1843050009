//! Ghost refresh and particle migration between ranks.
//!
//! Both operations are synchronous collectives: every rank exchanges with
//! every neighbouring rank, sending empty payloads where it has nothing, so
//! the pairwise handshakes always pair up. The ghost set is rebuilt from
//! scratch on every refresh; there is no incremental diffing.
//!
//! Periodic image copies assume a derived identity `(code + 1) * base + id`
//! where `code` encodes the shift direction. This keeps the id/column map a
//! bijection even when a rank receives an image of a particle it owns, and
//! lets bond bookkeeping canonicalize an image back to its owner.

pub mod transport;
pub mod wire;

use std::collections::HashMap;

use nalgebra::Vector3;
use tracing::debug;

use crate::bonds::BondNetwork;
use crate::error::PdError;
use crate::grid::SpatialGrid;
use crate::particles::{ParticleId, ParticleStore};

pub use transport::{ChannelTransport, SingleRank, Transport};
pub use wire::GhostSpec;

/// Shift-direction code for a periodic image, 0..26 with 13 meaning no
/// shift on any axis.
fn image_code(shift: &Vector3<f64>) -> usize {
    let mut code = 0;
    let mut stride = 1;
    for d in 0..3 {
        let s = if shift[d] > 0.0 {
            2
        } else if shift[d] < 0.0 {
            0
        } else {
            1
        };
        code += s * stride;
        stride *= 3;
    }
    code
}

pub struct GhostExchange<T> {
    transport: T,
    spec: GhostSpec,
    /// Strictly greater than every real particle id, identical on all ranks
    image_id_base: usize,
    ghost_ids: Vec<ParticleId>,
    migrated_in: Vec<ParticleId>,
    migrated_out: Vec<ParticleId>,
}

impl<T: Transport> GhostExchange<T> {
    pub fn new(transport: T, spec: GhostSpec, image_id_base: usize) -> Self {
        Self {
            transport,
            spec,
            image_id_base,
            ghost_ids: Vec::new(),
            migrated_in: Vec::new(),
            migrated_out: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Ids received during the last [`migrate`](Self::migrate).
    pub fn migrated_in(&self) -> &[ParticleId] {
        &self.migrated_in
    }

    /// Ids handed off during the last [`migrate`](Self::migrate).
    pub fn migrated_out(&self) -> &[ParticleId] {
        &self.migrated_out
    }

    fn image_id(&self, id: ParticleId, shift: &Vector3<f64>) -> ParticleId {
        (image_code(shift) + 1) * self.image_id_base + id
    }

    fn drop_ghosts(&mut self, store: &mut ParticleStore, bonds: &mut BondNetwork) {
        for id in self.ghost_ids.drain(..) {
            bonds.remove(id);
        }
        store.clear_ghosts();
    }

    /// Rebuild the ghost set: boundary-cell contents go to every foreign
    /// neighbour rank verbatim, periodic-sender contents go shifted and
    /// under their image identity (possibly back to this rank).
    pub fn refresh_ghosts(
        &mut self,
        store: &mut ParticleStore,
        bonds: &mut BondNetwork,
        grid: &mut SpatialGrid,
    ) -> Result<(), PdError> {
        self.drop_ghosts(store, bonds);
        grid.place(store)?;

        let my_rank = self.transport.rank();
        let mut payloads: HashMap<usize, Vec<f64>> = HashMap::new();
        let mut local = Vec::new();
        let zero = Vector3::zeros();

        for &cell_id in grid.boundary_cells() {
            let cell = grid.cell(cell_id);
            for &to in &cell.neighbour_ranks {
                let out = payloads.entry(to).or_default();
                for &(id, _) in &cell.particles {
                    wire::pack_ghost(store, bonds, id, id, &zero, &self.spec, out)?;
                }
            }
        }

        for ps in grid.periodic_senders() {
            let cell = grid.cell(ps.cell);
            for &(id, _) in &cell.particles {
                let wire_id = self.image_id(id, &ps.shift);
                let out = if ps.to_rank == my_rank {
                    &mut local
                } else {
                    payloads.entry(ps.to_rank).or_default()
                };
                wire::pack_ghost(store, bonds, id, wire_id, &ps.shift, &self.spec, out)?;
            }
        }

        let mut received = Vec::new();
        for &peer in grid.neighbouring_ranks() {
            let payload = payloads.remove(&peer).unwrap_or_default();
            let back = self.transport.exchange(peer, &payload)?;
            received.extend(wire::unpack_ghosts(store, bonds, &self.spec, &back)?);
        }
        received.extend(wire::unpack_ghosts(store, bonds, &self.spec, &local)?);

        for &id in &received {
            let col = store.col_of(id).ok_or(PdError::UnknownParticle(id))?;
            let cell_id = grid.cell_id(&store.r[col])?;
            grid.cell_mut(cell_id).particles.push((id, col));
        }
        debug!(rank = my_rank, n_ghosts = received.len(), "ghosts rebuilt");
        self.ghost_ids = received;
        Ok(())
    }

    /// Hand off every owned particle whose cell now belongs to a foreign
    /// rank, full state and bond list included. Deletion on the sending
    /// side happens after all sends so the handshakes see a consistent
    /// picture; only then are received particles appended. Positions
    /// crossing a periodic boundary are wrapped back into the domain,
    /// whether or not ownership changes.
    pub fn migrate(
        &mut self,
        store: &mut ParticleStore,
        bonds: &mut BondNetwork,
        grid: &mut SpatialGrid,
    ) -> Result<(), PdError> {
        self.migrated_in.clear();
        self.migrated_out.clear();
        self.drop_ghosts(store, bonds);

        let my_rank = self.transport.rank();
        let mut payloads: HashMap<usize, Vec<f64>> = HashMap::new();
        let ids: Vec<ParticleId> = store.owned_ids().to_vec();

        for id in ids {
            let col = store.col_of(id).ok_or(PdError::UnknownParticle(id))?;
            let cell_id = grid.cell_id(&store.r[col])?;
            let cell = grid.cell(cell_id);
            let (owner, wrap) = if cell.periodic_image {
                (grid.cell(cell.wraps_to).owner, -cell.shift)
            } else {
                (cell.owner, Vector3::zeros())
            };

            if owner == my_rank {
                if cell.periodic_image {
                    let shift = cell.shift;
                    store.r[col] -= shift;
                    store.r0[col] -= shift;
                }
                continue;
            }
            if !grid.neighbouring_ranks().contains(&owner) {
                return Err(PdError::Protocol(format!(
                    "particle {} moved to non-adjacent rank {}",
                    id, owner
                )));
            }
            wire::pack_migrating(store, bonds, id, &wrap, payloads.entry(owner).or_default())?;
            self.migrated_out.push(id);
        }

        let mut received = Vec::new();
        for &peer in grid.neighbouring_ranks() {
            let payload = payloads.remove(&peer).unwrap_or_default();
            received.push(self.transport.exchange(peer, &payload)?);
        }

        for &id in &self.migrated_out {
            store.delete_owned(id)?;
            bonds.remove(id);
        }
        for buf in received {
            self.migrated_in
                .extend(wire::unpack_migrating(store, bonds, &buf)?);
        }
        if !self.migrated_in.is_empty() || !self.migrated_out.is_empty() {
            debug!(
                rank = my_rank,
                migrated_in = self.migrated_in.len(),
                migrated_out = self.migrated_out.len(),
                "ownership handoff"
            );
        }
        grid.place(store)
    }
}
