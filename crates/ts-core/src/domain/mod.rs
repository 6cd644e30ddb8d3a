pub mod errors;

pub use errors::{ConvergenceDiagnostics, TsError, TsErrorCategory, TsResult};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

/// The two angular groups a spectrometer's fibres are wired into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum FibreSet {
    A,
    B,
}

impl FibreSet {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "A" | "a" => Some(Self::A),
            "B" | "b" => Some(Self::B),
            _ => None,
        }
    }
}

impl Display for FibreSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FibreStage {
    Raw,
    Calibrated,
    Cropped,
    Fitted,
    Derived,
}

impl FibreStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Calibrated => "calibrated",
            Self::Cropped => "cropped",
            Self::Fitted => "fitted",
            Self::Derived => "derived",
        }
    }
}

impl Display for FibreStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecutionMode, FibreSet, FibreStage};

    #[test]
    fn execution_mode_defaults_to_serial() {
        assert_eq!(ExecutionMode::default(), ExecutionMode::Serial);
        let parsed: ExecutionMode =
            serde_json::from_str("\"parallel\"").expect("mode should parse");
        assert_eq!(parsed, ExecutionMode::Parallel);
    }

    #[test]
    fn fibre_set_labels_roundtrip() {
        assert_eq!(FibreSet::from_label("a"), Some(FibreSet::A));
        assert_eq!(FibreSet::from_label(" B "), Some(FibreSet::B));
        assert_eq!(FibreSet::from_label("C"), None);
        assert_eq!(FibreSet::B.to_string(), "B");
    }

    #[test]
    fn fibre_stages_are_ordered_along_the_pipeline() {
        assert!(FibreStage::Raw < FibreStage::Calibrated);
        assert!(FibreStage::Cropped < FibreStage::Fitted);
        assert!(FibreStage::Fitted < FibreStage::Derived);
        assert_eq!(FibreStage::Cropped.to_string(), "cropped");
    }
}
