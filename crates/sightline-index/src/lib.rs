//! Spatial indexing abstractions for entity proximity queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Common behaviour exposed by spatial query providers.
///
/// Entries are addressed by their slot in the positions passed to the most
/// recent [`rebuild`](SpatialQuery::rebuild). A query must visit every entry
/// whose distance to the origin was within `radius` at rebuild time, but may
/// omit entries that moved since; consumers are expected to tolerate such
/// staleness. No visit order is guaranteed.
pub trait SpatialQuery: Send + Sync {
    /// Rebuild internal structures from entity positions.
    fn rebuild(&mut self, positions: &[(f32, f32, f32)]) -> Result<(), IndexError>;

    /// Visit entries within `radius` of `origin`, passing each entry's slot
    /// and its distance to the origin.
    fn query_nearby(
        &self,
        origin: (f32, f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform hash-grid index bucketing entities into fixed-size 3D cells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing entities.
    pub cell_size: f32,
    #[serde(skip)]
    cells: HashMap<(i32, i32, i32), Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32, f32)>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            cells: HashMap::new(),
            positions: Vec::new(),
        }
    }

    /// Number of entries captured by the last rebuild.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// True when the last rebuild captured no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn cell_of(&self, position: (f32, f32, f32)) -> (i32, i32, i32) {
        (
            (position.0 / self.cell_size).floor() as i32,
            (position.1 / self.cell_size).floor() as i32,
            (position.2 / self.cell_size).floor() as i32,
        )
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl SpatialQuery for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        self.cells.clear();
        self.positions.clear();
        self.positions.extend_from_slice(positions);
        for (idx, &position) in positions.iter().enumerate() {
            let cell = self.cell_of(position);
            self.cells.entry(cell).or_default().push(idx);
        }
        Ok(())
    }

    fn query_nearby(
        &self,
        origin: (f32, f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if self.positions.is_empty() || !radius.is_finite() || radius < 0.0 {
            return;
        }
        let radius_sq = radius * radius;
        let lo = self.cell_of((origin.0 - radius, origin.1 - radius, origin.2 - radius));
        let hi = self.cell_of((origin.0 + radius, origin.1 + radius, origin.2 + radius));
        for cx in lo.0..=hi.0 {
            for cy in lo.1..=hi.1 {
                for cz in lo.2..=hi.2 {
                    let Some(bucket) = self.cells.get(&(cx, cy, cz)) else {
                        continue;
                    };
                    for &idx in bucket {
                        let position = self.positions[idx];
                        let dx = position.0 - origin.0;
                        let dy = position.1 - origin.1;
                        let dz = position.2 - origin.2;
                        let dist_sq = dx * dx + dy * dy + dz * dz;
                        if dist_sq <= radius_sq {
                            visitor(idx, OrderedFloat(dist_sq.sqrt()));
                        }
                    }
                }
            }
        }
    }
}
