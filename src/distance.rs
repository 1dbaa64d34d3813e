//! Distance measures and their pgvector operators

use crate::error::{Result, VecsError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Distance measures for vector similarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMeasure {
    /// Cosine distance (1 - cosine similarity)
    #[default]
    Cosine,
    /// Euclidean (L2) distance
    L2,
    /// Negative inner product
    InnerProduct,
}

impl DistanceMeasure {
    pub const ALL: [DistanceMeasure; 3] = [
        DistanceMeasure::Cosine,
        DistanceMeasure::L2,
        DistanceMeasure::InnerProduct,
    ];

    /// pgvector ordering operator for this measure.
    pub fn operator(&self) -> &'static str {
        match self {
            DistanceMeasure::Cosine => "<=>",
            DistanceMeasure::L2 => "<->",
            DistanceMeasure::InnerProduct => "<#>",
        }
    }

    /// Operator class an ANN index must be built with to serve this measure.
    pub fn opclass(&self) -> &'static str {
        match self {
            DistanceMeasure::Cosine => "vector_cosine_ops",
            DistanceMeasure::L2 => "vector_l2_ops",
            DistanceMeasure::InnerProduct => "vector_ip_ops",
        }
    }

    pub fn from_opclass(opclass: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.opclass() == opclass)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMeasure::Cosine => "cosine",
            DistanceMeasure::L2 => "l2",
            DistanceMeasure::InnerProduct => "inner_product",
        }
    }

    /// Score reported for plain similarity queries.
    ///
    /// Cosine reports `1 - distance`; other measures expose the raw value.
    pub fn score(&self, distance: f64) -> f64 {
        match self {
            DistanceMeasure::Cosine => 1.0 - distance,
            DistanceMeasure::L2 | DistanceMeasure::InnerProduct => distance,
        }
    }
}

impl fmt::Display for DistanceMeasure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMeasure {
    type Err = VecsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cosine" | "cosine_distance" => Ok(DistanceMeasure::Cosine),
            "l2" | "l2_distance" | "euclidean" => Ok(DistanceMeasure::L2),
            "inner_product" | "max_inner_product" | "ip" => Ok(DistanceMeasure::InnerProduct),
            other => Err(VecsError::arg(format!("unknown distance measure: {}", other))),
        }
    }
}
