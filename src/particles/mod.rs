//! Particle storage, attribute registries and file loading.

pub mod loader;
pub mod schema;
pub mod store;

pub use loader::{
    load_binary, load_binary_with_schema, load_xyz, load_xyz_from, load_xyz_with_schema,
};
pub use schema::{AttributeSchema, BondSchema, BOND_CONNECTED, BOND_DR0};
pub use store::{ParticleId, ParticleStore, ParticleView};

use crate::error::PdError;

/// Derive an effective particle radius from its volume, per dimension.
///
/// The scale accounts for the packing fraction of an irregular particle
/// arrangement; `thickness` is the out-of-plane extent used in 1-D and 2-D.
/// The "radius" column must be registered before the store is allocated.
pub fn calculate_radius(store: &mut ParticleStore, thickness: f64) -> Result<(), PdError> {
    let dim = store.dim();
    let i_volume = store.schema().get("volume")?;
    let i_radius = store.schema_mut().register("radius")?;

    for col in 0..store.n_total() {
        let volume = store.value(i_volume, col);
        let radius = match dim {
            3 => 0.9 * (3.0 * volume / (4.0 * std::f64::consts::PI)).cbrt(),
            2 => 0.9069 * (volume / (std::f64::consts::PI * thickness)).sqrt(),
            1 => 0.5 * volume / (thickness * thickness),
            d => return Err(PdError::UnsupportedDimension(d)),
        };
        store.set_value(i_radius, col, radius);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_radius_from_volume_2d() {
        let mut schema = AttributeSchema::new();
        schema.register("volume").unwrap();
        schema.register("radius").unwrap();
        let mut store = ParticleStore::new(2, schema).unwrap();
        let col = store.push_owned(0).unwrap();
        let i_volume = store.schema().get("volume").unwrap();
        store.set_value(i_volume, col, std::f64::consts::PI * 1e-4);

        calculate_radius(&mut store, 1.0).unwrap();
        let i_radius = store.schema().get("radius").unwrap();
        assert_relative_eq!(store.value(i_radius, col), 0.9069 * 1e-2, epsilon = 1e-12);
    }
}
