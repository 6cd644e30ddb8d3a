//! Dark-count removal and wavelength windowing of split fibre spectra.

use crate::domain::{TsError, TsResult};
use crate::frame::SplitSpectra;
use crate::numerics::{mean, trapezoid};
use std::ops::Range;
use tracing::{info, warn};

pub const BASELINE_SAMPLES: usize = 300;
pub const DEFAULT_WINDOW: Range<usize> = 500..1500;

/// Average of the mean of the first and the mean of the last [`BASELINE_SAMPLES`] samples.
pub fn baseline_offset(signal: &[f64]) -> Option<f64> {
    let take = BASELINE_SAMPLES.min(signal.len());
    let head = mean(&signal[..take])?;
    let tail = mean(&signal[signal.len() - take..])?;
    Some(0.5 * (head + tail))
}

pub fn zero_baseline(signal: &[f64]) -> Option<Vec<f64>> {
    let offset = baseline_offset(signal)?;
    Some(signal.iter().map(|value| value - offset).collect())
}

/// `values[window]`, truncated silently to what is available.
pub fn apply_window<T: Clone>(values: &[T], window: &Range<usize>) -> Vec<T> {
    let end = window.end.min(values.len());
    let start = window.start.min(end);
    values[start..end].to_vec()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZeroedFibre {
    pub index: usize,
    pub shot: Vec<f64>,
    pub shot_fractional_error: Vec<f64>,
    pub background: Vec<f64>,
    pub background_fractional_error: Vec<f64>,
    /// Trapezoidal integral of the zeroed shot over the full, unwindowed axis.
    pub scattered_amplitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZeroedSpectra {
    pub axis: Vec<f64>,
    pub fibres: Vec<ZeroedFibre>,
}

pub fn zero_fibres(
    spectra: &[SplitSpectra],
    axis: &[f64],
    window: Range<usize>,
) -> TsResult<ZeroedSpectra> {
    if window.start > window.end {
        return Err(TsError::configuration(
            "CONFIG.WINDOW",
            format!(
                "wavelength window lower bound {} exceeds upper bound {}",
                window.start, window.end
            ),
        ));
    }
    if window.end > axis.len() {
        warn!(
            requested = window.end,
            available = axis.len(),
            "wavelength window truncated to available samples"
        );
    }

    let mut fibres = Vec::with_capacity(spectra.len());
    for split in spectra {
        if split.shot.len() != axis.len() || split.background.len() != axis.len() {
            return Err(TsError::data_shape(
                "PREPROCESS.AXIS_LENGTH",
                format!(
                    "fibre {} spectra do not match the {}-sample axis",
                    split.index,
                    axis.len()
                ),
            ));
        }

        let shot = zero_baseline(&split.shot.intensity).ok_or_else(|| empty_fibre(split.index))?;
        let background =
            zero_baseline(&split.background.intensity).ok_or_else(|| empty_fibre(split.index))?;
        let scattered_amplitude = trapezoid(&shot, axis).ok_or_else(|| empty_fibre(split.index))?;

        fibres.push(ZeroedFibre {
            index: split.index,
            shot: apply_window(&shot, &window),
            shot_fractional_error: apply_window(&split.shot.fractional_error, &window),
            background: apply_window(&background, &window),
            background_fractional_error: apply_window(&split.background.fractional_error, &window),
            scattered_amplitude,
        });
    }

    info!(fibres = fibres.len(), ?window, "zeroed fibre baselines");
    Ok(ZeroedSpectra {
        axis: apply_window(axis, &window),
        fibres,
    })
}

fn empty_fibre(index: usize) -> TsError {
    TsError::data_shape(
        "PREPROCESS.EMPTY_FIBRE",
        format!("fibre {index} has no samples to zero"),
    )
}

#[cfg(test)]
mod tests {
    use super::{apply_window, baseline_offset, zero_baseline, zero_fibres};
    use crate::domain::TsErrorCategory;
    use crate::frame::{FibreSpectrum, SplitSpectra};

    fn spectrum(values: Vec<f64>) -> FibreSpectrum {
        FibreSpectrum {
            fractional_error: values.iter().map(|value| 1.0 / value.sqrt()).collect(),
            intensity: values,
            rows: 0..1,
        }
    }

    #[test]
    fn baseline_averages_head_and_tail_means() {
        let mut signal = vec![10.0; 1000];
        signal[700..].fill(20.0);
        signal[500] = 1.0e6;
        assert_eq!(baseline_offset(&signal), Some(15.0));
        assert_eq!(baseline_offset(&[2.0, 4.0]), Some(3.0));
        assert_eq!(baseline_offset(&[]), None);
    }

    #[test]
    fn zeroing_twice_leaves_offset_near_zero() {
        let signal: Vec<f64> = (0..800).map(|index| 5.0 + (index as f64 * 0.01).sin()).collect();
        let once = zero_baseline(&signal).expect("zeroed");
        let offset = baseline_offset(&once).expect("offset");
        assert!(offset.abs() < 1.0e-12);
        let twice = zero_baseline(&once).expect("zeroed twice");
        for (a, b) in once.iter().zip(&twice) {
            assert!((a - b).abs() < 1.0e-12);
        }
    }

    #[test]
    fn window_truncates_silently() {
        let values = [0, 1, 2, 3, 4];
        assert_eq!(apply_window(&values, &(2..10)), vec![2, 3, 4]);
        assert_eq!(apply_window(&values, &(7..10)), Vec::<i32>::new());
    }

    #[test]
    fn zero_fibres_integrates_before_windowing() {
        let axis: Vec<f64> = (0..10).map(|index| index as f64).collect();
        let mut shot = vec![1.0; 10];
        shot[5] = 3.0;
        let split = SplitSpectra {
            index: 0,
            shot: spectrum(shot),
            background: spectrum(vec![2.0; 10]),
        };

        let zeroed = zero_fibres(&[split], &axis, 4..7).expect("zeroed");
        let fibre = &zeroed.fibres[0];
        assert_eq!(zeroed.axis, vec![4.0, 5.0, 6.0]);
        assert_eq!(fibre.shot.len(), 3);
        assert_eq!(fibre.shot_fractional_error.len(), 3);
        assert_eq!(fibre.background, vec![0.0, 0.0, 0.0]);

        // baseline over all ten samples is 1.2, leaving -0.2 everywhere and 1.8 at the spike
        assert!((fibre.scattered_amplitude - 0.2).abs() < 1.0e-12);
    }

    #[test]
    fn inverted_window_is_a_configuration_error() {
        let error = zero_fibres(&[], &[0.0, 1.0], 5..2).expect_err("inverted");
        assert_eq!(error.category(), TsErrorCategory::Configuration);
    }
}
