pub mod bonds;
pub mod config;
pub mod error;
pub mod exchange;
pub mod forces;
pub mod grid;
pub mod modifiers;
pub mod particles;
pub mod simulation;
pub mod solver;

pub use bonds::{Bond, BondNetwork};
pub use config::SimulationConfig;
pub use error::PdError;
pub use exchange::{ChannelTransport, GhostExchange, GhostSpec, SingleRank, Transport};
pub use forces::{Force, ForceModel, Pmb};
pub use grid::{GridCell, SpatialGrid};
pub use modifiers::{Modifier, ModifierModel, StretchFracture};
pub use particles::{
    calculate_radius, AttributeSchema, BondSchema, ParticleId, ParticleStore, ParticleView,
};
pub use simulation::Simulation;
pub use solver::{AdrSolver, RelaxationReport, SolverState};
