//! Line diff kernel: edit scripts over byte-line sequences.
//!
//! Provides the Myers and histogram algorithms behind one
//! [`DiffAlgorithm`] switch, plus the line splitting shared by diff and
//! merge consumers.

pub mod algorithm;

pub use algorithm::{diff_edits, split_lines, Edit, EditOp};

/// Selectable diff algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffAlgorithm {
    /// Myers O(ND) with heuristics (default).
    #[default]
    Myers,
    /// Myers searching for the absolute minimum edit script.
    Minimal,
    /// Histogram: patience variant keyed on low-occurrence lines.
    Histogram,
}

impl DiffAlgorithm {
    /// Parse a configuration value (as used by `diff.algorithm`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "myers" | "default" => Some(Self::Myers),
            "minimal" => Some(Self::Minimal),
            "histogram" => Some(Self::Histogram),
            _ => None,
        }
    }

    /// Canonical config name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Myers => "myers",
            Self::Minimal => "minimal",
            Self::Histogram => "histogram",
        }
    }
}
