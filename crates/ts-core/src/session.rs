//! Shot-level analysis session: frames in, paired fibres and their results out.

use crate::calibration::CalibrationOverrides;
use crate::config::{AnalysisConfig, FibreSelection};
use crate::domain::{ExecutionMode, FibreSet, FibreStage, TsError, TsResult};
use crate::export::{
    ExportTable, REPORT_FILE_NAME, export_relative_path, write_export, write_json_report,
};
use crate::fibre::{Fibre, FibreData, FibreReport};
use crate::frame::{
    LoadedFrames, RawFrame, SplitSpectra, discover_backgrounds, edge_profile, fibre_edges,
    load_frames, split_into_fibres,
};
use crate::ionization::IonizationTables;
use crate::numerics::LeastSquaresConfig;
use crate::preprocess::{ZeroedSpectra, zero_fibres};
use crate::scattering::{ParameterSpecification, ScatteringLineshape, builtin_lineshape};
use rayon::prelude::*;
use serde::Serialize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Spectrometer axes are recorded in nanometres.
pub const AXIS_TO_METRES: f64 = 1.0e-9;

#[derive(Debug, Clone)]
pub struct TsAnalysis {
    shot_name: String,
    shot: RawFrame,
    background: RawFrame,
    edges: Option<Vec<usize>>,
    split: Option<Vec<SplitSpectra>>,
    zeroed: Option<ZeroedSpectra>,
    fibres: Vec<Fibre>,
    set_a_len: usize,
}

/// Steps applied to each fibre once pairing is done.
pub struct FibrePipeline<'a> {
    pub overrides: CalibrationOverrides,
    pub optimizer: LeastSquaresConfig,
    pub fit: Option<FitStep<'a>>,
}

#[derive(Clone, Copy)]
pub struct FitStep<'a> {
    pub specification: &'a ParameterSpecification,
    pub interpolation_scale: usize,
    pub lineshape: &'a dyn ScatteringLineshape,
    pub tables: &'a IonizationTables,
}

impl FibrePipeline<'_> {
    /// Calibrate, crop and integrate; then fit and derive when a fit step is configured.
    pub fn run(&self, fibre: &mut Fibre) -> TsResult<FibreStage> {
        fibre.calibrate(&self.overrides, &self.optimizer)?;
        fibre.symmetric_crop()?;
        fibre.calculate_integrated_intensity()?;

        if let Some(step) = &self.fit {
            fibre.fit_scattering(
                step.specification,
                step.interpolation_scale,
                step.lineshape,
                step.tables,
                &self.optimizer,
            )?;
            fibre.calculate_alpha()?;
            fibre.calculate_predicted_intensity()?;
        }
        Ok(fibre.stage())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FibreFailure {
    pub label: String,
    pub category: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl FibreFailure {
    fn new(label: String, error: &TsError) -> Self {
        Self {
            label,
            category: error.category().as_str(),
            code: error.code(),
            message: error.message().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PipelineSummary {
    pub processed: Vec<String>,
    pub failures: Vec<FibreFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub shot_name: String,
    pub edges: Vec<usize>,
    pub fibres: Vec<FibreReport>,
    pub failures: Vec<FibreFailure>,
}

impl TsAnalysis {
    pub fn load(
        shot: &Path,
        backgrounds: &[PathBuf],
        calibration: Option<&Path>,
        skip_footer: usize,
    ) -> TsResult<Self> {
        Ok(Self::from_frames(load_frames(shot, backgrounds, calibration, skip_footer)?))
    }

    pub fn from_frames(frames: LoadedFrames) -> Self {
        Self {
            shot_name: frames.shot_name,
            shot: frames.shot,
            background: frames.background,
            edges: None,
            split: None,
            zeroed: None,
            fibres: Vec::new(),
            set_a_len: 0,
        }
    }

    pub fn shot_name(&self) -> &str {
        &self.shot_name
    }

    pub fn shot_frame(&self) -> &RawFrame {
        &self.shot
    }

    pub fn background_frame(&self) -> &RawFrame {
        &self.background
    }

    pub fn edges(&self) -> Option<&[usize]> {
        self.edges.as_deref()
    }

    pub fn split_spectra(&self) -> Option<&[SplitSpectra]> {
        self.split.as_deref()
    }

    pub fn zeroed(&self) -> Option<&ZeroedSpectra> {
        self.zeroed.as_ref()
    }

    pub fn fibres(&self) -> &[Fibre] {
        &self.fibres
    }

    pub fn fibres_in(&self, set: FibreSet) -> &[Fibre] {
        match set {
            FibreSet::A => &self.fibres[..self.set_a_len],
            FibreSet::B => &self.fibres[self.set_a_len..],
        }
    }

    /// Shot intensity per detector row, for previewing edges.
    pub fn edge_profile(&self, columns: Range<usize>) -> Vec<f64> {
        edge_profile(&self.shot, columns)
    }

    /// Computes and stores fibre boundaries. Repeatable; later stages are discarded.
    pub fn find_fibre_edges(&mut self, spacing: f64, offset: f64) -> TsResult<&[usize]> {
        let edges = fibre_edges(self.shot.rows(), spacing, offset)?;
        info!(count = edges.len(), spacing, offset, "located fibre edges");
        self.split = None;
        self.zeroed = None;
        self.fibres.clear();
        self.set_a_len = 0;
        Ok(self.edges.insert(edges).as_slice())
    }

    pub fn split_fibres(&mut self, discard_rows: usize) -> TsResult<usize> {
        let edges = self.edges.as_deref().ok_or_else(|| {
            TsError::missing_dependency(
                "SESSION.STAGE",
                "fibre edges must be found before splitting",
            )
        })?;
        let spectra = split_into_fibres(&self.shot, &self.background, edges, discard_rows)?;
        let count = spectra.len();
        info!(fibres = count, discard_rows, "split frames into fibres");
        self.split = Some(spectra);
        self.zeroed = None;
        self.fibres.clear();
        self.set_a_len = 0;
        Ok(count)
    }

    pub fn zero_fibres(&mut self, window: Range<usize>) -> TsResult<&ZeroedSpectra> {
        let spectra = self.split.as_deref().ok_or_else(|| {
            TsError::missing_dependency("SESSION.STAGE", "fibres must be split before zeroing")
        })?;
        let zeroed = zero_fibres(spectra, self.shot.axis(), window)?;
        self.fibres.clear();
        self.set_a_len = 0;
        Ok(&*self.zeroed.insert(zeroed))
    }

    /// Tags fibres with their scattering angles (degrees): set A takes the first
    /// `angles_a.len()` fibres in detector order, set B the rest.
    pub fn pair_fibres(&mut self, angles_a: &[f64], angles_b: &[f64]) -> TsResult<&[Fibre]> {
        let zeroed = self.zeroed.as_ref().ok_or_else(|| {
            TsError::missing_dependency("SESSION.STAGE", "fibres must be zeroed before pairing")
        })?;
        if angles_a.len() + angles_b.len() != zeroed.fibres.len() {
            return Err(TsError::configuration(
                "CONFIG.ANGLE_COUNT",
                format!(
                    "{} + {} scattering angles given for {} fibres",
                    angles_a.len(),
                    angles_b.len(),
                    zeroed.fibres.len()
                ),
            ));
        }

        let wavelength: Vec<f64> = zeroed.axis.iter().map(|value| value * AXIS_TO_METRES).collect();
        let tagged = angles_a
            .iter()
            .enumerate()
            .map(|(position, angle)| (FibreSet::A, position + 1, *angle))
            .chain(
                angles_b
                    .iter()
                    .enumerate()
                    .map(|(position, angle)| (FibreSet::B, position + 1, *angle)),
            );

        let mut fibres = Vec::with_capacity(zeroed.fibres.len());
        for ((set, number, degrees), spectra) in tagged.zip(&zeroed.fibres) {
            fibres.push(Fibre::new(FibreData {
                set,
                number,
                wavelength: wavelength.clone(),
                theta: degrees.to_radians(),
                background: spectra.background.clone(),
                shot: spectra.shot.clone(),
                background_fractional_error: spectra.background_fractional_error.clone(),
                shot_fractional_error: spectra.shot_fractional_error.clone(),
                scattered_amplitude: spectra.scattered_amplitude,
            })?);
        }

        info!(set_a = angles_a.len(), set_b = angles_b.len(), "paired fibres with angles");
        self.fibres = fibres;
        self.set_a_len = angles_a.len();
        Ok(self.fibres.as_slice())
    }

    /// Copies fibre `good`'s background over fibre `bad`'s (0-based detector order).
    pub fn copy_background(&mut self, good: usize, bad: usize) -> TsResult<()> {
        let count = self.fibres.len();
        let source = self.fibres.get(good).ok_or_else(|| fibre_index_error(good, count))?;
        let background = source.background().to_vec();
        let fractional_error = source.background_fractional_error().to_vec();
        let target = self
            .fibres
            .get_mut(bad)
            .ok_or_else(|| fibre_index_error(bad, count))?;
        target.replace_background(background, fractional_error)?;
        info!(good, bad, "copied fibre background");
        Ok(())
    }

    /// `number` counts from 1 within `set`.
    pub fn select_fibre(&self, set: FibreSet, number: usize) -> TsResult<&Fibre> {
        let index = self.fibre_index(set, number)?;
        Ok(&self.fibres[index])
    }

    pub fn select_fibre_mut(&mut self, set: FibreSet, number: usize) -> TsResult<&mut Fibre> {
        let index = self.fibre_index(set, number)?;
        Ok(&mut self.fibres[index])
    }

    fn fibre_index(&self, set: FibreSet, number: usize) -> TsResult<usize> {
        let len = self.fibres_in(set).len();
        if number == 0 || number > len {
            return Err(TsError::configuration(
                "CONFIG.FIBRE_SELECTION",
                format!("fibre {number}{set} does not exist; set {set} has {len} fibres"),
            ));
        }
        Ok(match set {
            FibreSet::A => number - 1,
            FibreSet::B => self.set_a_len + number - 1,
        })
    }

    /// Runs `pipeline` over the selected fibres (all when `selection` is empty).
    ///
    /// A failing fibre is recorded and skipped; the rest still run. Parallel execution gives
    /// the same results as serial.
    pub fn process_fibres(
        &mut self,
        pipeline: &FibrePipeline<'_>,
        selection: &[FibreSelection],
        mode: ExecutionMode,
    ) -> TsResult<PipelineSummary> {
        if self.fibres.is_empty() {
            return Err(TsError::missing_dependency(
                "SESSION.STAGE",
                "fibres must be paired with angles before processing",
            ));
        }
        let mut selected = vec![selection.is_empty(); self.fibres.len()];
        for choice in selection {
            selected[self.fibre_index(choice.set, choice.number)?] = true;
        }

        let run = |(fibre, chosen): (&mut Fibre, &bool)| -> Option<(String, TsResult<FibreStage>)> {
            chosen.then(|| (fibre.label(), pipeline.run(fibre)))
        };
        let outcomes: Vec<_> = match mode {
            ExecutionMode::Serial => self
                .fibres
                .iter_mut()
                .zip(&selected)
                .filter_map(run)
                .collect(),
            ExecutionMode::Parallel => self
                .fibres
                .par_iter_mut()
                .zip(selected.par_iter())
                .filter_map(run)
                .collect(),
        };

        let mut summary = PipelineSummary::default();
        for (label, outcome) in outcomes {
            match outcome {
                Ok(stage) => {
                    info!(fibre = %label, %stage, "fibre processed");
                    summary.processed.push(label);
                }
                Err(error) => {
                    warn!(fibre = %label, "{}", error.diagnostic_line());
                    summary.failures.push(FibreFailure::new(label, &error));
                }
            }
        }
        Ok(summary)
    }

    pub fn export_path(&self, output_directory: &Path, fibre: &Fibre) -> PathBuf {
        output_directory.join(export_relative_path(&self.shot_name, &fibre.label()))
    }

    pub fn export_fibre(
        &self,
        output_directory: &Path,
        set: FibreSet,
        number: usize,
    ) -> TsResult<PathBuf> {
        let fibre = self.select_fibre(set, number)?;
        let path = self.export_path(output_directory, fibre);
        write_export(&path, &ExportTable::from_fibre(fibre)?)?;
        Ok(path)
    }

    /// Writes a table for every fitted fibre.
    pub fn export_fitted(&self, output_directory: &Path) -> TsResult<Vec<PathBuf>> {
        let mut written = Vec::new();
        for fibre in self.fibres.iter().filter(|fibre| fibre.fit().is_some()) {
            let path = self.export_path(output_directory, fibre);
            write_export(&path, &ExportTable::from_fibre(fibre)?)?;
            written.push(path);
        }
        Ok(written)
    }

    pub fn report(&self, failures: Vec<FibreFailure>) -> AnalysisReport {
        AnalysisReport {
            shot_name: self.shot_name.clone(),
            edges: self.edges.clone().unwrap_or_default(),
            fibres: self.fibres.iter().map(Fibre::report).collect(),
            failures,
        }
    }
}

fn fibre_index_error(index: usize, count: usize) -> TsError {
    TsError::configuration(
        "CONFIG.FIBRE_INDEX",
        format!("fibre index {index} is out of range for {count} fibres"),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutcome {
    pub report: AnalysisReport,
    pub exports: Vec<PathBuf>,
    pub report_path: Option<PathBuf>,
}

/// Runs a whole shot as described by `config`, writing exports and `report.json` under the
/// configured output directory.
pub fn run_configured_analysis(config: &AnalysisConfig) -> TsResult<AnalysisOutcome> {
    config.validate()?;
    let shot = config.input.shot.as_deref().ok_or_else(|| {
        TsError::configuration("CONFIG.INPUT_SHOT", "no shot file configured")
    })?;

    let mut backgrounds = config.input.backgrounds.clone();
    if let Some((directory, pattern)) = config.background_search() {
        backgrounds.extend(discover_backgrounds(&directory, &pattern)?);
    }
    if backgrounds.is_empty() {
        warn!("no background frames given; using an all-zero background");
    }

    let mut analysis = TsAnalysis::load(
        shot,
        &backgrounds,
        config.input.calibration.as_deref(),
        config.input.skip_footer,
    )?;
    analysis.find_fibre_edges(config.edges.spacing, config.edges.offset)?;
    analysis.split_fibres(config.split.discard_rows)?;
    analysis.zero_fibres(config.window.range())?;
    analysis.pair_fibres(&config.angles.set_a, &config.angles.set_b)?;
    for patch in &config.background_patches {
        analysis.copy_background(patch.good, patch.bad)?;
    }

    let specification = config.fit.specification()?;
    let tables = IonizationTables::new(&config.tables.directory);
    let fit = match &specification {
        Some(specification) => Some(FitStep {
            specification,
            interpolation_scale: config.fit.interpolation_scale,
            lineshape: builtin_lineshape(&specification.model).ok_or_else(|| {
                TsError::configuration(
                    "CONFIG.MODEL",
                    format!("unknown scattering model '{}'", specification.model),
                )
            })?,
            tables: &tables,
        }),
        None => None,
    };
    let pipeline = FibrePipeline {
        overrides: config.calibration,
        optimizer: config.fit.optimizer,
        fit,
    };
    let summary = analysis.process_fibres(&pipeline, &config.fit.fibres, config.execution)?;

    let output = &config.output;
    let exports = if output.write_exports {
        analysis.export_fitted(&output.directory)?
    } else {
        Vec::new()
    };
    let report = analysis.report(summary.failures);
    let report_path = if output.write_report {
        let path = output.directory.join(REPORT_FILE_NAME);
        write_json_report(&path, &report)?;
        Some(path)
    } else {
        None
    };

    info!(
        processed = summary.processed.len(),
        failed = report.failures.len(),
        exports = exports.len(),
        "analysis finished"
    );
    Ok(AnalysisOutcome {
        report,
        exports,
        report_path,
    })
}

#[cfg(test)]
mod tests {
    use super::{AXIS_TO_METRES, TsAnalysis};
    use crate::domain::{FibreSet, TsErrorCategory};
    use crate::frame::{LoadedFrames, RawFrame};
    use crate::numerics::DenseMatrix;

    fn analysis(rows: usize, columns: usize) -> TsAnalysis {
        let axis: Vec<f64> = (0..columns).map(|column| 520.0 + column as f64 * 0.05).collect();
        let mut intensities = DenseMatrix::zeros(rows, columns);
        for row in 0..rows {
            for column in 0..columns {
                intensities[(row, column)] = 100.0 + (row % 7) as f64;
            }
        }
        let shot = RawFrame::new(intensities.clone(), axis.clone()).expect("shot frame");
        let background = RawFrame::new(intensities, axis).expect("background frame");
        TsAnalysis::from_frames(LoadedFrames {
            shot_name: "s0001_01".to_string(),
            shot,
            background,
        })
    }

    fn paired(angles_a: &[f64], angles_b: &[f64]) -> TsAnalysis {
        let mut analysis = analysis(51, 40);
        analysis.find_fibre_edges(10.0, 0.0).expect("edges");
        assert_eq!(analysis.edges(), Some(&[0, 10, 20, 30, 40, 50][..]));
        analysis.split_fibres(1).expect("split");
        analysis.zero_fibres(0..40).expect("zeroed");
        analysis.pair_fibres(angles_a, angles_b).expect("paired");
        analysis
    }

    #[test]
    fn pairing_splits_fibres_into_sets_in_order() {
        let analysis = paired(&[0.0, 10.0, 20.0], &[30.0, 40.0]);
        assert_eq!(analysis.fibres().len(), 5);
        assert_eq!(analysis.fibres_in(FibreSet::A).len(), 3);
        assert_eq!(analysis.fibres_in(FibreSet::B).len(), 2);

        let angles: Vec<f64> = analysis
            .fibres()
            .iter()
            .map(|fibre| fibre.theta().to_degrees())
            .collect();
        for (actual, expected) in angles.iter().zip([0.0, 10.0, 20.0, 30.0, 40.0]) {
            assert!((actual - expected).abs() < 1.0e-12);
        }

        let fibre = analysis.select_fibre(FibreSet::B, 1).expect("fibre 1B");
        assert!((fibre.theta().to_degrees() - 30.0).abs() < 1.0e-12);
        assert_eq!(fibre.label(), "1B");
        assert!((fibre.wavelength()[0] - 520.0 * AXIS_TO_METRES).abs() < 1.0e-20);
    }

    #[test]
    fn pairing_rejects_angle_count_mismatch() {
        let mut analysis = analysis(51, 40);
        analysis.find_fibre_edges(10.0, 0.0).expect("edges");
        analysis.split_fibres(1).expect("split");
        analysis.zero_fibres(0..40).expect("zeroed");
        let error = analysis
            .pair_fibres(&[0.0, 10.0], &[30.0, 40.0])
            .expect_err("4 angles for 5 fibres");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
    }

    #[test]
    fn stages_must_run_in_order() {
        let mut analysis = analysis(51, 40);
        let error = analysis.split_fibres(1).expect_err("no edges yet");
        assert_eq!(error.category(), TsErrorCategory::MissingDependency);
        let error = analysis.pair_fibres(&[], &[]).expect_err("not zeroed");
        assert_eq!(error.category(), TsErrorCategory::MissingDependency);
    }

    #[test]
    fn fibre_selection_is_one_based_within_a_set() {
        let analysis = paired(&[0.0, 10.0, 20.0], &[30.0, 40.0]);
        assert_eq!(
            analysis.select_fibre(FibreSet::A, 3).expect("3A").label(),
            "3A"
        );
        for (set, number) in [(FibreSet::A, 0), (FibreSet::A, 4), (FibreSet::B, 3)] {
            let error = analysis
                .select_fibre(set, number)
                .expect_err("out of range selection");
            assert_eq!(error.category(), TsErrorCategory::Configuration);
        }
    }

    #[test]
    fn copy_background_uses_global_indices() {
        let mut analysis = paired(&[0.0, 10.0, 20.0], &[30.0, 40.0]);
        let good = analysis.fibres()[1].background().to_vec();
        analysis.copy_background(1, 3).expect("copy");
        assert_eq!(analysis.fibres()[3].background(), good.as_slice());

        let error = analysis.copy_background(5, 0).expect_err("index 5 of 5");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
    }
}
