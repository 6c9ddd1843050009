//! A single cell of the spatial partitioning grid.

use nalgebra::Vector3;

use crate::particles::ParticleId;

/// Grid cell: created once at configuration time, repopulated every step.
///
/// `particles` holds (id, column) pairs of everything currently located in
/// the cell, ghost copies included. For periodic image cells `shift` is the
/// translation applied to any particle state copied across the boundary and
/// `wraps_to` names the real cell the image corresponds to.
#[derive(Debug, Clone)]
pub struct GridCell {
    pub id: usize,
    pub center: Vector3<f64>,
    pub periodic_image: bool,
    pub shift: Vector3<f64>,
    pub wraps_to: usize,
    pub owner: usize,
    /// All cells within one interaction-horizon step
    pub neighbours: Vec<usize>,
    /// Foreign ranks owning real cells in this cell's neighbourhood
    pub neighbour_ranks: Vec<usize>,
    pub particles: Vec<(ParticleId, usize)>,
}
