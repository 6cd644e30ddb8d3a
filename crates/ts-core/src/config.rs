//! JSON analysis configuration.
//!
//! Every section is optional; omitted values fall back to the spectrometer defaults. Relative
//! paths are resolved against the directory holding the configuration file.

use crate::calibration::CalibrationOverrides;
use crate::domain::{ExecutionMode, TsError, TsResult};
use crate::frame::{
    DEFAULT_DISCARD_ROWS, DEFAULT_EDGE_OFFSET, DEFAULT_EDGE_SPACING, DEFAULT_PROFILE_COLUMNS,
};
use crate::numerics::LeastSquaresConfig;
use crate::preprocess::DEFAULT_WINDOW;
use crate::scattering::ParameterSpecification;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const DEFAULT_TABLES_DIRECTORY: &str = "zte";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read analysis config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse analysis config '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<ConfigError> for TsError {
    fn from(error: ConfigError) -> Self {
        match &error {
            ConfigError::Read { .. } => TsError::io_system("IO.CONFIG_READ", error.to_string()),
            ConfigError::Parse { .. } => {
                TsError::configuration("CONFIG.PARSE", error.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub input: InputConfig,
    pub edges: EdgeConfig,
    pub split: SplitConfig,
    pub window: WindowConfig,
    pub angles: AngleConfig,
    pub calibration: CalibrationOverrides,
    pub background_patches: Vec<BackgroundPatch>,
    pub fit: FitConfig,
    pub tables: TablesConfig,
    pub execution: ExecutionMode,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputConfig {
    pub shot: Option<PathBuf>,
    pub backgrounds: Vec<PathBuf>,
    /// Glob over file names, e.g. `backgrounds/bkgd*.asc`; the directory part is literal.
    pub background_glob: Option<String>,
    pub calibration: Option<PathBuf>,
    pub skip_footer: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EdgeConfig {
    pub spacing: f64,
    pub offset: f64,
    pub profile_columns: [usize; 2],
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            spacing: DEFAULT_EDGE_SPACING,
            offset: DEFAULT_EDGE_OFFSET,
            profile_columns: [DEFAULT_PROFILE_COLUMNS.start, DEFAULT_PROFILE_COLUMNS.end],
        }
    }
}

impl EdgeConfig {
    pub fn profile_columns(&self) -> Range<usize> {
        self.profile_columns[0]..self.profile_columns[1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    pub discard_rows: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            discard_rows: DEFAULT_DISCARD_ROWS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub lower: usize,
    pub upper: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            lower: DEFAULT_WINDOW.start,
            upper: DEFAULT_WINDOW.end,
        }
    }
}

impl WindowConfig {
    pub fn range(&self) -> Range<usize> {
        self.lower..self.upper
    }
}

/// Scattering angles in degrees.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AngleConfig {
    pub set_a: Vec<f64>,
    pub set_b: Vec<f64>,
}

/// Global 0-based fibre indices: `bad` receives `good`'s background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundPatch {
    pub good: usize,
    pub bad: usize,
}

/// A fibre addressed the way operators name them, e.g. `3A`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct FibreSelection {
    pub set: crate::domain::FibreSet,
    pub number: usize,
}

impl TryFrom<String> for FibreSelection {
    type Error = String;

    fn try_from(label: String) -> Result<Self, Self::Error> {
        FibreSelection::parse(&label)
    }
}

impl From<FibreSelection> for String {
    fn from(selection: FibreSelection) -> Self {
        format!("{}{}", selection.number, selection.set)
    }
}

impl FibreSelection {
    pub fn parse(label: &str) -> Result<Self, String> {
        let label = label.trim();
        let split = label
            .char_indices()
            .last()
            .map(|(index, _)| index)
            .ok_or_else(|| "empty fibre label".to_string())?;
        let (number, set) = label.split_at(split);
        let set = crate::domain::FibreSet::from_label(set)
            .ok_or_else(|| format!("fibre label '{label}' must end in A or B"))?;
        let number = number
            .parse::<usize>()
            .ok()
            .filter(|number| *number > 0)
            .ok_or_else(|| format!("fibre label '{label}' must start with a number from 1"))?;
        Ok(Self { set, number })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    pub interpolation_scale: usize,
    /// Flat mapping of `model`, `n_e`, `T_e`, ... as accepted by [`ParameterSpecification`].
    pub parameters: Map<String, Value>,
    pub optimizer: LeastSquaresConfig,
    /// Fibres to fit; empty means all of them.
    pub fibres: Vec<FibreSelection>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            interpolation_scale: 1,
            parameters: Map::new(),
            optimizer: LeastSquaresConfig::default(),
            fibres: Vec::new(),
        }
    }
}

impl FitConfig {
    /// `None` when no parameters were configured, so callers can stop after calibration.
    pub fn specification(&self) -> TsResult<Option<ParameterSpecification>> {
        if self.parameters.is_empty() {
            return Ok(None);
        }
        ParameterSpecification::from_map(&self.parameters).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TablesConfig {
    pub directory: PathBuf,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_TABLES_DIRECTORY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutputConfig {
    pub directory: PathBuf,
    pub write_exports: bool,
    pub write_report: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            write_exports: true,
            write_report: true,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }

    pub fn validate(&self) -> TsResult<()> {
        if self.fit.interpolation_scale == 0 {
            return Err(TsError::configuration(
                "CONFIG.INTERPOLATION_SCALE",
                "interpolation scale must be at least 1",
            ));
        }
        if self.window.lower > self.window.upper {
            return Err(TsError::configuration(
                "CONFIG.WINDOW",
                format!(
                    "window lower bound {} exceeds upper bound {}",
                    self.window.lower, self.window.upper
                ),
            ));
        }
        if !(self.edges.spacing.is_finite() && self.edges.spacing > 0.0) {
            return Err(TsError::configuration(
                "CONFIG.EDGE_SPACING",
                format!("edge spacing must be positive, got {}", self.edges.spacing),
            ));
        }
        if self.edges.profile_columns[0] > self.edges.profile_columns[1] {
            return Err(TsError::configuration(
                "CONFIG.PROFILE_COLUMNS",
                format!(
                    "profile columns {:?} are not an increasing range",
                    self.edges.profile_columns
                ),
            ));
        }
        if let Some(angle) = self
            .angles
            .set_a
            .iter()
            .chain(&self.angles.set_b)
            .find(|angle| !angle.is_finite())
        {
            return Err(TsError::configuration(
                "CONFIG.ANGLE",
                format!("scattering angle {angle} is not finite"),
            ));
        }
        Ok(())
    }

    /// Rewrites every relative path as relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        if let Some(shot) = self.input.shot.as_mut() {
            resolve(shot);
        }
        self.input.backgrounds.iter_mut().for_each(resolve);
        if let Some(calibration) = self.input.calibration.as_mut() {
            resolve(calibration);
        }
        if let Some(pattern) = self.input.background_glob.as_mut() {
            if Path::new(pattern.as_str()).is_relative() {
                *pattern = base.join(pattern.as_str()).to_string_lossy().into_owned();
            }
        }
        resolve(&mut self.tables.directory);
        resolve(&mut self.output.directory);
    }

    /// Splits `background_glob` into the directory to list and the file-name pattern.
    pub fn background_search(&self) -> Option<(PathBuf, String)> {
        let glob = self.input.background_glob.as_deref()?;
        let path = Path::new(glob);
        let pattern = path.file_name()?.to_string_lossy().into_owned();
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Some((directory, pattern))
    }
}

pub fn load_analysis_config(path: impl AsRef<Path>) -> Result<AnalysisConfig, ConfigError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config =
        AnalysisConfig::from_json_str(&source).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));
    config.resolve_paths(base);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::{AnalysisConfig, FibreSelection, load_analysis_config};
    use crate::domain::{ExecutionMode, FibreSet, TsError, TsErrorCategory};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn empty_config_uses_spectrometer_defaults() {
        let config = AnalysisConfig::from_json_str("{}").expect("empty config should parse");
        assert_eq!(config.edges.spacing, 17.8);
        assert_eq!(config.edges.offset, 8.0);
        assert_eq!(config.edges.profile_columns(), 950..1100);
        assert_eq!(config.split.discard_rows, 3);
        assert_eq!(config.window.range(), 500..1500);
        assert_eq!(config.fit.interpolation_scale, 1);
        assert_eq!(config.execution, ExecutionMode::Serial);
        assert!(config.fit.specification().expect("no parameters").is_none());
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn relative_paths_resolve_against_config_directory() {
        let temp = TempDir::new().expect("tempdir should be created");
        let path = temp.path().join("analysis.json");
        fs::write(
            &path,
            r#"{
                "input": {"shot": "s0415_01.asc", "background_glob": "bkgd/*.asc"},
                "tables": {"directory": "/opt/zte"},
                "execution": "parallel",
                "background_patches": [{"good": 2, "bad": 3}],
                "fit": {"fibres": ["2A", "10B"], "parameters": {"model": "doppler_ion"}}
            }"#,
        )
        .expect("config should be written");

        let config = load_analysis_config(&path).expect("config should load");
        assert_eq!(config.input.shot, Some(temp.path().join("s0415_01.asc")));
        assert_eq!(config.tables.directory, PathBuf::from("/opt/zte"));
        assert_eq!(config.output.directory, temp.path().join("."));
        assert_eq!(config.execution, ExecutionMode::Parallel);
        assert_eq!(config.background_patches[0].bad, 3);

        let (directory, pattern) = config.background_search().expect("glob configured");
        assert_eq!(directory, temp.path().join("bkgd"));
        assert_eq!(pattern, "*.asc");

        assert_eq!(
            config.fit.fibres,
            vec![
                FibreSelection { set: FibreSet::A, number: 2 },
                FibreSelection { set: FibreSet::B, number: 10 },
            ]
        );
    }

    #[test]
    fn unknown_sections_and_bad_labels_are_rejected() {
        assert!(AnalysisConfig::from_json_str(r#"{"fitting": {}}"#).is_err());
        assert!(AnalysisConfig::from_json_str(r#"{"fit": {"fibres": ["0A"]}}"#).is_err());
        assert!(AnalysisConfig::from_json_str(r#"{"fit": {"fibres": ["3C"]}}"#).is_err());
    }

    #[test]
    fn validation_rejects_zero_interpolation_scale() {
        let config = AnalysisConfig::from_json_str(r#"{"fit": {"interpolation_scale": 0}}"#)
            .expect("config should parse");
        let error = config.validate().expect_err("scale 0 is invalid");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
    }

    #[test]
    fn missing_file_maps_to_io_error() {
        let temp = TempDir::new().expect("tempdir should be created");
        let error = load_analysis_config(temp.path().join("absent.json"))
            .expect_err("missing config should fail");
        let error = TsError::from(error);
        assert_eq!(error.category(), TsErrorCategory::IoSystem);
    }
}
