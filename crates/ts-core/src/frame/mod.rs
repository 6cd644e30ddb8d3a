//! Raw detector frames and their reduction to one spectrum per fibre.

mod parser;

pub use parser::{LoadedFrames, discover_backgrounds, load_frames, parse_asc, shot_name};

use crate::domain::{TsError, TsResult};
use crate::numerics::DenseMatrix;
use std::ops::Range;
use tracing::debug;

pub const DEFAULT_EDGE_SPACING: f64 = 17.8;
pub const DEFAULT_EDGE_OFFSET: f64 = 8.0;
pub const DEFAULT_PROFILE_COLUMNS: Range<usize> = 950..1100;
pub const DEFAULT_DISCARD_ROWS: usize = 3;

/// Detector image: one row per detector pixel row, one column per wavelength sample.
#[derive(Debug, Clone)]
pub struct RawFrame {
    intensities: DenseMatrix,
    axis: Vec<f64>,
}

impl RawFrame {
    pub fn new(intensities: DenseMatrix, axis: Vec<f64>) -> TsResult<Self> {
        if intensities.ncols() != axis.len() {
            return Err(TsError::data_shape(
                "FRAME.AXIS_LENGTH",
                format!(
                    "frame has {} wavelength columns but the axis has {} samples",
                    intensities.ncols(),
                    axis.len()
                ),
            ));
        }
        Ok(Self { intensities, axis })
    }

    pub fn zeros(rows: usize, axis: Vec<f64>) -> Self {
        Self {
            intensities: DenseMatrix::zeros(rows, axis.len()),
            axis,
        }
    }

    pub fn rows(&self) -> usize {
        self.intensities.nrows()
    }

    pub fn columns(&self) -> usize {
        self.intensities.ncols()
    }

    pub fn axis(&self) -> &[f64] {
        &self.axis
    }

    pub fn value(&self, row: usize, column: usize) -> f64 {
        self.intensities[(row, column)]
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.columns())
    }

    /// Replaces the wavelength axis, e.g. with one borrowed from a calibration file.
    pub fn with_axis(mut self, axis: Vec<f64>) -> TsResult<Self> {
        if axis.len() != self.columns() {
            return Err(TsError::data_shape(
                "FRAME.CALIBRATION_LENGTH",
                format!(
                    "calibration axis has {} samples but the frame has {} wavelength columns",
                    axis.len(),
                    self.columns()
                ),
            ));
        }
        self.axis = axis;
        Ok(self)
    }

    /// Element-wise sum used to stack several background exposures.
    pub fn accumulate(&mut self, other: &RawFrame) -> TsResult<()> {
        if self.shape() != other.shape() {
            return Err(TsError::data_shape(
                "FRAME.SHAPE_MISMATCH",
                format!(
                    "cannot sum frames of shape {:?} and {:?}",
                    self.shape(),
                    other.shape()
                ),
            ));
        }
        for column in 0..self.columns() {
            for row in 0..self.rows() {
                self.intensities[(row, column)] += other.intensities[(row, column)];
            }
        }
        Ok(())
    }

    fn column_sums(&self, rows: Range<usize>) -> Vec<f64> {
        (0..self.columns())
            .map(|column| {
                rows.clone()
                    .map(|row| self.intensities[(row, column)])
                    .sum()
            })
            .collect()
    }
}

/// Column-wise sum of a band of frame rows.
#[derive(Debug, Clone, PartialEq)]
pub struct FibreSpectrum {
    pub intensity: Vec<f64>,
    /// Poisson fractional error `1/sqrt(intensity)`; non-finite where intensity <= 0.
    pub fractional_error: Vec<f64>,
    pub rows: Range<usize>,
}

impl FibreSpectrum {
    pub fn from_rows(frame: &RawFrame, rows: Range<usize>) -> Self {
        let intensity = frame.column_sums(rows.clone());
        let fractional_error = intensity.iter().map(|value| 1.0 / value.sqrt()).collect();
        Self {
            intensity,
            fractional_error,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.intensity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intensity.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitSpectra {
    pub index: usize,
    pub shot: FibreSpectrum,
    pub background: FibreSpectrum,
}

/// Per-row intensity summed over `columns`, clamped to the frame width.
pub fn edge_profile(frame: &RawFrame, columns: Range<usize>) -> Vec<f64> {
    let end = columns.end.min(frame.columns());
    let start = columns.start.min(end);
    (0..frame.rows())
        .map(|row| (start..end).map(|column| frame.value(row, column)).sum())
        .collect()
}

/// Evenly spaced fibre boundaries `offset, offset + spacing, ...` below `profile_len - 1`,
/// terminated by `profile_len - 1`.
pub fn fibre_edges(profile_len: usize, spacing: f64, offset: f64) -> TsResult<Vec<usize>> {
    if !spacing.is_finite() || spacing <= 0.0 {
        return Err(TsError::configuration(
            "CONFIG.EDGE_SPACING",
            format!("fibre edge spacing must be finite and > 0, got {spacing}"),
        ));
    }
    if !offset.is_finite() {
        return Err(TsError::configuration(
            "CONFIG.EDGE_OFFSET",
            format!("fibre edge offset must be finite, got {offset}"),
        ));
    }
    if profile_len < 2 {
        return Err(TsError::data_shape(
            "FRAME.EDGE_PROFILE",
            format!("edge profile needs at least 2 rows, got {profile_len}"),
        ));
    }

    let last = (profile_len - 1) as f64;
    let mut raw = Vec::new();
    let mut step = 0usize;
    loop {
        let edge = offset + step as f64 * spacing;
        if edge >= last {
            break;
        }
        raw.push(edge);
        step += 1;
    }
    raw.push(last);

    Ok(raw
        .into_iter()
        .map(|edge| edge.round_ties_even().max(0.0) as usize)
        .collect())
}

/// Splits shot and background frames into `edges.len() - 1` fibre spectra.
///
/// Shot rows `[edge[i] + discard, edge[i + 1] - discard)` are summed to suppress cross talk
/// between neighbouring fibres; backgrounds use the full band `[edge[i], edge[i + 1])`.
pub fn split_into_fibres(
    shot: &RawFrame,
    background: &RawFrame,
    edges: &[usize],
    discard_rows: usize,
) -> TsResult<Vec<SplitSpectra>> {
    if shot.shape() != background.shape() {
        return Err(TsError::data_shape(
            "FRAME.SHAPE_MISMATCH",
            format!(
                "shot frame {:?} and background frame {:?} differ in shape",
                shot.shape(),
                background.shape()
            ),
        ));
    }
    if edges.len() < 2 {
        return Err(TsError::data_shape(
            "FRAME.EDGE_COUNT",
            format!("need at least 2 fibre edges, got {}", edges.len()),
        ));
    }
    if let Some(&edge) = edges.iter().find(|&&edge| edge > shot.rows()) {
        return Err(TsError::data_shape(
            "FRAME.EDGE_RANGE",
            format!("fibre edge {edge} lies outside a frame of {} rows", shot.rows()),
        ));
    }

    let mut spectra = Vec::with_capacity(edges.len() - 1);
    for (index, window) in edges.windows(2).enumerate() {
        let (lower, upper) = (window[0], window[1]);
        if upper <= lower {
            return Err(TsError::data_shape(
                "FRAME.EDGE_ORDER",
                format!("fibre {index} has non-increasing edges {lower}..{upper}"),
            ));
        }

        let shot_rows = (lower + discard_rows)..upper.saturating_sub(discard_rows);
        if shot_rows.is_empty() {
            return Err(TsError::data_shape(
                "FRAME.FIBRE_EMPTY",
                format!(
                    "fibre {index} (rows {lower}..{upper}) is empty after discarding {discard_rows} rows per side"
                ),
            ));
        }
        debug!(fibre = index, ?shot_rows, "splitting fibre");

        spectra.push(SplitSpectra {
            index,
            shot: FibreSpectrum::from_rows(shot, shot_rows),
            background: FibreSpectrum::from_rows(background, lower..upper),
        });
    }

    Ok(spectra)
}

#[cfg(test)]
mod tests {
    use super::{RawFrame, edge_profile, fibre_edges, split_into_fibres};
    use crate::domain::TsErrorCategory;
    use crate::numerics::DenseMatrix;

    fn ramp_frame(rows: usize, columns: usize) -> RawFrame {
        let mut intensities = DenseMatrix::zeros(rows, columns);
        for row in 0..rows {
            for column in 0..columns {
                intensities[(row, column)] = (row + 1) as f64;
            }
        }
        let axis = (0..columns).map(|column| 530.0 + column as f64).collect();
        RawFrame::new(intensities, axis).expect("frame should build")
    }

    #[test]
    fn fibre_edges_follow_spacing_and_end_at_last_row() {
        let edges = fibre_edges(100, 17.8, 8.0).expect("edges");
        assert_eq!(edges, vec![8, 26, 44, 61, 79, 97, 99]);

        let again = fibre_edges(100, 17.8, 8.0).expect("edges");
        assert_eq!(edges, again);
    }

    #[test]
    fn fibre_edges_clamp_negative_offsets() {
        let edges = fibre_edges(20, 10.0, -4.0).expect("edges");
        assert_eq!(edges, vec![0, 6, 16, 19]);
    }

    #[test]
    fn fibre_edges_reject_non_positive_spacing() {
        let error = fibre_edges(100, 0.0, 8.0).expect_err("zero spacing");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
    }

    #[test]
    fn edge_profile_clamps_column_window() {
        let frame = ramp_frame(4, 10);
        let profile = edge_profile(&frame, 8..20);
        assert_eq!(profile, vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn split_yields_one_fibre_per_edge_gap_with_discarded_rows() {
        let shot = ramp_frame(40, 5);
        let background = ramp_frame(40, 5);
        let edges = [0, 10, 20, 30];

        let spectra = split_into_fibres(&shot, &background, &edges, 3).expect("split");
        assert_eq!(spectra.len(), edges.len() - 1);

        let first = &spectra[0];
        assert_eq!(first.shot.rows, 3..7);
        assert_eq!(first.background.rows, 0..10);
        // rows 3..7 hold values 4..=7
        assert_eq!(first.shot.intensity[0], 22.0);
        assert_eq!(first.background.intensity[0], 55.0);
        assert!((first.shot.fractional_error[0] - 1.0 / 22.0_f64.sqrt()).abs() < 1.0e-15);
    }

    #[test]
    fn split_rejects_fibres_collapsed_by_discard() {
        let shot = ramp_frame(20, 3);
        let background = ramp_frame(20, 3);
        let error = split_into_fibres(&shot, &background, &[0, 10, 14], 2).expect_err("collapsed");
        assert_eq!(error.category(), TsErrorCategory::DataShape);
        assert!(error.message().contains("fibre 1"));
    }

    #[test]
    fn fractional_error_is_non_finite_for_empty_bins() {
        let shot = RawFrame::zeros(10, vec![1.0, 2.0]);
        let spectra = split_into_fibres(&shot, &shot, &[0, 9], 1).expect("split");
        assert!(spectra[0].shot.fractional_error.iter().all(|value| !value.is_finite()));
    }

    #[test]
    fn accumulate_requires_matching_shapes() {
        let mut sum = ramp_frame(3, 2);
        sum.accumulate(&ramp_frame(3, 2)).expect("same shape");
        assert_eq!(sum.value(2, 1), 6.0);

        let error = sum.accumulate(&ramp_frame(2, 2)).expect_err("shape mismatch");
        assert_eq!(error.category(), TsErrorCategory::DataShape);
    }
}
