//! Attribute registries for the particle table and the bond network.
//!
//! Every scalar column a component needs is registered here by name before
//! any particle or bond is allocated. Lookups of unregistered names are a
//! configuration-time contract violation, never a silent default.

use crate::error::PdError;
use std::collections::HashMap;

/// Registry of named per-particle scalar columns.
///
/// Columns flagged as "ghost" are included in every ghost-exchange payload;
/// migration always carries the full table. The schema freezes once the
/// particle table is allocated.
#[derive(Debug, Clone, Default)]
pub struct AttributeSchema {
    names: Vec<String>,
    index: HashMap<String, usize>,
    ghost: Vec<usize>,
    frozen: bool,
}

impl AttributeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a column, returning its index. Re-registration of an
    /// existing name returns the existing index.
    pub fn register(&mut self, name: &str) -> Result<usize, PdError> {
        if let Some(&idx) = self.index.get(name) {
            return Ok(idx);
        }
        if self.frozen {
            return Err(PdError::SchemaFrozen(name.to_string()));
        }
        let idx = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        Ok(idx)
    }

    /// Index of a registered column.
    pub fn get(&self, name: &str) -> Result<usize, PdError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PdError::MissingAttribute(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Mark a registered column for inclusion in ghost payloads.
    pub fn mark_ghost(&mut self, name: &str) -> Result<(), PdError> {
        let idx = self.get(name)?;
        if !self.ghost.contains(&idx) {
            self.ghost.push(idx);
        }
        Ok(())
    }

    /// Column indices carried by ghost exchange, in registration order.
    pub fn ghost_columns(&self) -> &[usize] {
        &self.ghost
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Reject further registrations; called when storage is allocated.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }
}

/// Bond attribute indices are positional: `dr0` and `connected` are always
/// the first two entries, matching the order the network writes them in.
pub const BOND_DR0: usize = 0;
pub const BOND_CONNECTED: usize = 1;

/// Registry of named per-bond scalars.
///
/// The length of every bond's attribute vector equals the schema size at
/// bond creation time, so all registration must precede `build_connections`.
#[derive(Debug, Clone)]
pub struct BondSchema {
    inner: AttributeSchema,
}

impl BondSchema {
    pub fn new() -> Self {
        let mut inner = AttributeSchema::new();
        // The order is important
        inner.register("dr0").expect("fresh schema");
        inner.register("connected").expect("fresh schema");
        Self { inner }
    }

    pub fn register(&mut self, name: &str) -> Result<usize, PdError> {
        self.inner.register(name)
    }

    pub fn get(&self, name: &str) -> Result<usize, PdError> {
        self.inner.get(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn freeze(&mut self) {
        self.inner.freeze();
    }
}

impl Default for BondSchema {
    fn default() -> Self {
        Self::new()
    }
}
