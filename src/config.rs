//! Configuration management for peridynamic simulations
//!
//! Reads TOML configuration files and provides structured data for setting up
//! the domain, spatial grid, material parameters and solver settings.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::PdError;

/// Main simulation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    pub domain: DomainConfig,
    pub particles: ParticlesConfig,
    pub material: MaterialConfig,
    pub solver: SolverConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DomainConfig {
    /// Spatial dimension (1, 2 or 3)
    pub dim: usize,
    /// Domain bounds in x (m)
    pub x: [f64; 2],
    /// Domain bounds in y (m)
    pub y: [f64; 2],
    /// Domain bounds in z (m)
    pub z: [f64; 2],
    /// Periodic boundary per axis
    #[serde(default)]
    pub periodic: [bool; 3],
    /// Interaction horizon (m)
    pub horizon: f64,
    /// Grid cell spacing (m); must be >= horizon so one layer of
    /// neighbouring cells covers every possible bond
    pub grid_spacing: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParticlesConfig {
    /// Path to the particle file
    pub path: String,
    /// File format: "xyz" (columnar text) or "bin" (little-endian columnar)
    pub format: String,
    /// Column names for binary files (text files carry their own header)
    #[serde(default)]
    pub columns: Vec<String>,
    /// Lattice spacing of the loaded configuration (m)
    pub lattice_spacing: f64,
    /// Inflate neighbour admission by the per-particle radii
    #[serde(default)]
    pub inflate_by_radius: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MaterialConfig {
    /// Young's modulus (Pa)
    pub youngs_modulus: f64,
    /// Poisson ratio
    pub poisson_ratio: f64,
    /// Out-of-plane thickness for 2-D problems (m)
    #[serde(default = "default_thickness")]
    pub thickness: f64,
    /// Critical bond stretch for fracture
    pub critical_stretch: f64,
}

fn default_thickness() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverConfig {
    /// Pseudo-timestep of the relaxation integrator
    #[serde(default = "default_dt")]
    pub dt: f64,
    /// Convergence threshold on the relative force-change residual
    pub error_threshold: f64,
    /// Hard cap on relaxation iterations per equilibrium solve
    pub max_iterations: usize,
    /// Cap on fracture-driven re-convergence passes
    #[serde(default = "default_fracture_passes")]
    pub max_fracture_passes: usize,
    /// Relaxation iterations between ownership-migration checks
    #[serde(default = "default_migration_frequency")]
    pub migration_frequency: usize,
    /// Number of load/relaxation steps
    pub steps: usize,
}

fn default_dt() -> f64 {
    1.0
}

fn default_fracture_passes() -> usize {
    1000
}

fn default_migration_frequency() -> usize {
    30
}

impl SimulationConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PdError> {
        let contents = fs::read_to_string(path)?;
        let config: SimulationConfig = toml::from_str(&contents)
            .map_err(|e| PdError::Config(format!("failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check basic consistency of the configured domain
    pub fn validate(&self) -> Result<(), PdError> {
        let d = &self.domain;
        if d.dim == 0 || d.dim > 3 {
            return Err(PdError::UnsupportedDimension(d.dim));
        }
        if d.grid_spacing < d.horizon {
            return Err(PdError::Config(format!(
                "grid spacing {} is smaller than the horizon {}",
                d.grid_spacing, d.horizon
            )));
        }
        for (axis, b) in [d.x, d.y, d.z].iter().enumerate().take(d.dim) {
            if b[1] <= b[0] {
                return Err(PdError::Config(format!(
                    "empty domain extent on axis {}: [{}, {}]",
                    axis, b[0], b[1]
                )));
            }
        }
        Ok(())
    }

    /// Domain bounds as per-axis (lo, hi) pairs
    pub fn bounds(&self) -> [(f64, f64); 3] {
        [
            (self.domain.x[0], self.domain.x[1]),
            (self.domain.y[0], self.domain.y[1]),
            (self.domain.z[0], self.domain.z[1]),
        ]
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let d = &self.domain;
        println!("═══════════════════════════════════════════════════════════════");
        println!("  Peridynamic Simulation Configuration");
        println!("═══════════════════════════════════════════════════════════════");
        println!("Domain ({}-D):", d.dim);
        println!("  x: [{:.3}, {:.3}] m", d.x[0], d.x[1]);
        if d.dim > 1 {
            println!("  y: [{:.3}, {:.3}] m", d.y[0], d.y[1]);
        }
        if d.dim > 2 {
            println!("  z: [{:.3}, {:.3}] m", d.z[0], d.z[1]);
        }
        println!("  Horizon: {:.4e} m, grid spacing: {:.4e} m", d.horizon, d.grid_spacing);
        println!("\nMaterial:");
        println!(
            "  E = {:.3e} Pa, nu = {:.3}, s0 = {:.3e}",
            self.material.youngs_modulus, self.material.poisson_ratio, self.material.critical_stretch
        );
        println!("\nSolver:");
        println!(
            "  threshold = {:.1e}, max iterations = {}, steps = {}",
            self.solver.error_threshold, self.solver.max_iterations, self.solver.steps
        );
        println!("═══════════════════════════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimulationConfig {
        toml::from_str(
            r#"
            [domain]
            dim = 2
            x = [0.0, 1.0]
            y = [0.0, 0.5]
            z = [0.0, 0.0]
            horizon = 0.05
            grid_spacing = 0.05

            [particles]
            path = "plate.xyz"
            format = "xyz"
            lattice_spacing = 0.0125

            [material]
            youngs_modulus = 3.0e9
            poisson_ratio = 0.33
            critical_stretch = 0.01

            [solver]
            error_threshold = 1.0e-5
            max_iterations = 2500
            steps = 10
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_and_validate() {
        let cfg = sample();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.domain.dim, 2);
        assert_eq!(cfg.bounds()[1], (0.0, 0.5));
    }

    #[test]
    fn test_spacing_below_horizon_rejected() {
        let mut cfg = sample();
        cfg.domain.grid_spacing = 0.01;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_dimension_rejected() {
        let mut cfg = sample();
        cfg.domain.dim = 4;
        assert!(matches!(cfg.validate(), Err(PdError::UnsupportedDimension(4))));
    }
}
