//! Particle file readers.
//!
//! Two on-disk layouts are supported: an xyz-style columnar text format
//! whose comment line names the columns, and a raw little-endian binary
//! columnar format with the column names supplied by the caller. Both must
//! provide at least a particle id, the reference position and a volume
//! before bond construction can proceed.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::PdError;
use crate::particles::schema::AttributeSchema;
use crate::particles::store::ParticleStore;

const POSITION_NAMES: [&str; 3] = ["x", "y", "z"];

/// Load an xyz-style text file:
///
/// ```text
/// 4
/// id x y volume
/// 0  0.0 0.0 1.0e-6
/// ...
/// ```
pub fn load_xyz<P: AsRef<Path>>(path: P, dim: usize) -> Result<ParticleStore, PdError> {
    let file = File::open(path)?;
    load_xyz_from(BufReader::new(file), dim)
}

pub fn load_xyz_from<R: BufRead>(reader: R, dim: usize) -> Result<ParticleStore, PdError> {
    load_xyz_with_schema(reader, dim, AttributeSchema::new())
}

/// Variant that merges the file's columns into a schema that other
/// components (forces, modifiers) have already registered into. All
/// registration must happen before allocation, so this is the entry point
/// used by the simulation builder.
pub fn load_xyz_with_schema<R: BufRead>(
    mut reader: R,
    dim: usize,
    schema: AttributeSchema,
) -> Result<ParticleStore, PdError> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let n: usize = line
        .trim()
        .parse()
        .map_err(|_| PdError::ParticleFile(format!("bad particle count '{}'", line.trim())))?;

    line.clear();
    reader.read_line(&mut line)?;
    let columns: Vec<String> = line
        .split_whitespace()
        .map(|s| s.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let mut rows = Vec::with_capacity(n);
    for _ in 0..n {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(PdError::ParticleFile(format!(
                "expected {} particle rows, file ended after {}",
                n,
                rows.len()
            )));
        }
        let row: Result<Vec<f64>, _> = line.split_whitespace().map(str::parse::<f64>).collect();
        let row = row.map_err(|_| PdError::ParticleFile(format!("bad row '{}'", line.trim())))?;
        if row.len() != columns.len() {
            return Err(PdError::ParticleFile(format!(
                "row has {} fields, header names {}",
                row.len(),
                columns.len()
            )));
        }
        rows.push(row);
    }

    build_store(&columns, &rows, dim, schema)
}

/// Load a little-endian binary columnar file; every row is `columns.len()`
/// consecutive f64 values.
pub fn load_binary<P: AsRef<Path>>(
    path: P,
    columns: &[String],
    dim: usize,
) -> Result<ParticleStore, PdError> {
    load_binary_with_schema(path, columns, dim, AttributeSchema::new())
}

pub fn load_binary_with_schema<P: AsRef<Path>>(
    path: P,
    columns: &[String],
    dim: usize,
    schema: AttributeSchema,
) -> Result<ParticleStore, PdError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let row_len = columns.len() * 8;
    if row_len == 0 || bytes.len() % row_len != 0 {
        return Err(PdError::ParticleFile(format!(
            "binary size {} is not a multiple of the {}-column row",
            bytes.len(),
            columns.len()
        )));
    }

    let rows: Vec<Vec<f64>> = bytes
        .chunks_exact(row_len)
        .map(|row| {
            row.chunks_exact(8)
                .map(|b| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(b);
                    f64::from_le_bytes(word)
                })
                .collect()
        })
        .collect();

    build_store(columns, &rows, dim, schema)
}

fn build_store(
    columns: &[String],
    rows: &[Vec<f64>],
    dim: usize,
    mut schema: AttributeSchema,
) -> Result<ParticleStore, PdError> {
    let find = |name: &str| columns.iter().position(|c| c == name);

    let id_col = find("id")
        .ok_or_else(|| PdError::MissingAttribute("id".to_string()))?;
    let mut pos_cols = [usize::MAX; 3];
    for (d, name) in POSITION_NAMES.iter().enumerate().take(dim) {
        pos_cols[d] = find(name)
            .ok_or_else(|| PdError::MissingAttribute((*name).to_string()))?;
    }
    if find("volume").is_none() {
        return Err(PdError::MissingAttribute("volume".to_string()));
    }

    // Every non-positional column becomes a scalar attribute
    let mut attr_cols = Vec::new();
    for (i, name) in columns.iter().enumerate() {
        if i == id_col || pos_cols[..dim].contains(&i) {
            continue;
        }
        attr_cols.push((schema.register(name)?, i));
    }

    let mut store = ParticleStore::new(dim, schema)?;
    for row in rows {
        let id = row[id_col] as usize;
        let col = store.push_owned(id)?;
        for d in 0..dim {
            store.r[col][d] = row[pos_cols[d]];
        }
        store.r0[col] = store.r[col];
        for &(attr, src) in &attr_cols {
            store.set_value(attr, col, row[src]);
        }
    }
    Ok(store)
}
