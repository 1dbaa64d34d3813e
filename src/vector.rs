//! Vector type and its pgvector text representation

use crate::error::{Result, VecsError};
use serde::{Deserialize, Serialize};

/// A vector in n-dimensional space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    /// Create a new vector from a Vec<f32>
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    /// Get the dimension of the vector
    pub fn dimension(&self) -> usize {
        self.data.len()
    }

    /// Get the underlying data as a slice
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Fail unless the vector has exactly `expected` components, all finite.
    pub fn check_dimension(&self, expected: usize) -> Result<()> {
        if self.dimension() != expected {
            return Err(VecsError::DimensionMismatch {
                expected,
                actual: self.dimension(),
            });
        }
        if let Some(x) = self.data.iter().find(|x| !x.is_finite()) {
            return Err(VecsError::InvalidVector {
                reason: format!("non-finite component: {}", x),
            });
        }
        Ok(())
    }

    /// Encode as a pgvector literal, e.g. `[1,0.5,-2]`.
    ///
    /// Bound as text and cast with `::vector` on the SQL side.
    pub fn to_pg_literal(&self) -> String {
        let values: Vec<String> = self.data.iter().map(|v| v.to_string()).collect();
        format!("[{}]", values.join(","))
    }

    /// Parse the text output of a pgvector column (`vector::text`).
    pub fn from_pg_literal(s: &str) -> Result<Self> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| VecsError::InvalidVector {
                reason: format!("not a vector literal: {}", s),
            })?;
        if inner.trim().is_empty() {
            return Ok(Vector::new(vec![]));
        }
        Self::from_str(inner)
    }

    /// Parse a vector from a comma-separated string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        let data: Result<Vec<f32>> = s
            .split(',')
            .map(|x| {
                x.trim()
                    .parse::<f32>()
                    .map_err(|_| VecsError::InvalidVector {
                        reason: format!("Invalid float: {}", x),
                    })
            })
            .collect();
        Ok(Vector::new(data?))
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Vector::new(data)
    }
}
