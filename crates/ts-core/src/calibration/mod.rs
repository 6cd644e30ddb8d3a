//! Instrument response from a Voigt fit to the reference-line background.

use crate::domain::{TsError, TsResult};
use crate::numerics::{
    Bound, LeastSquaresConfig, LeastSquaresError, LeastSquaresProblem, VoigtError,
    levenberg_marquardt, nearest_index, voigt_profile,
};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, info};

/// Laser line the spectrometer is calibrated against (m).
pub const REFERENCE_LINE: f64 = 532.0e-9;

/// FWHM / sigma of a Voigt profile with `gamma == sigma`.
const VOIGT_FWHM_PER_SIGMA: f64 = 3.6013;
const MIN_CALIBRATION_SAMPLES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoigtProfile {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
    pub gamma: f64,
}

impl VoigtProfile {
    pub fn evaluate(&self, x: f64) -> Result<f64, VoigtError> {
        voigt_profile(x, self.amplitude, self.center, self.sigma, self.gamma)
    }

    pub fn evaluate_grid(&self, xs: &[f64]) -> TsResult<Vec<f64>> {
        xs.iter()
            .map(|x| self.evaluate(*x).map_err(voigt_failure))
            .collect()
    }
}

/// Widths pinned from a previous fit to a clean background.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CalibrationOverrides {
    pub sigma: Option<f64>,
    pub gamma: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoigtGuess {
    pub amplitude: f64,
    pub center: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseCalibration {
    pub profile: VoigtProfile,
    pub chi_square: f64,
    pub iterations: usize,
    pub sigma_fixed: bool,
    pub gamma_fixed: bool,
}

impl ResponseCalibration {
    pub fn l0(&self) -> f64 {
        self.profile.center
    }

    pub fn sigma(&self) -> f64 {
        self.profile.sigma
    }

    pub fn gamma(&self) -> f64 {
        self.profile.gamma
    }

    pub fn amplitude(&self) -> f64 {
        self.profile.amplitude
    }
}

/// Seeds from peak height and the half-maximum crossings either side of the peak.
pub fn guess_voigt(axis: &[f64], signal: &[f64]) -> TsResult<VoigtGuess> {
    validate_samples(axis, signal)?;

    let (peak_index, peak) = signal
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, value)| value.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (index, value)| match best {
            Some((_, best_value)) if best_value >= value => best,
            _ => Some((index, value)),
        })
        .ok_or_else(|| {
            TsError::data_shape("CALIBRATION.NO_PEAK", "background has no finite samples")
        })?;
    let floor = signal
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .fold(f64::INFINITY, f64::min);
    let half_height = floor + 0.5 * (peak - floor);

    let mut left = peak_index;
    while left > 0 && signal[left] > half_height {
        left -= 1;
    }
    let mut right = peak_index;
    while right < signal.len() - 1 && signal[right] > half_height {
        right += 1;
    }

    let span = (axis[axis.len() - 1] - axis[0]).abs();
    let fwhm = if left < right {
        (axis[right] - axis[left]).abs()
    } else {
        span / 6.0
    };
    let sigma = (fwhm / VOIGT_FWHM_PER_SIGMA).max(span * 1.0e-6);

    let unit_peak = voigt_profile(0.0, 1.0, 0.0, sigma, sigma).map_err(voigt_failure)?;
    Ok(VoigtGuess {
        amplitude: (peak - floor) / unit_peak,
        center: axis[peak_index],
        sigma,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VoigtSlot {
    Amplitude,
    Center,
    Sigma,
    Gamma,
}

impl VoigtSlot {
    const fn name(self) -> &'static str {
        match self {
            Self::Amplitude => "amplitude",
            Self::Center => "center",
            Self::Sigma => "sigma",
            Self::Gamma => "gamma",
        }
    }
}

struct VoigtFit<'a> {
    axis: &'a [f64],
    signal: &'a [f64],
    base: VoigtProfile,
    slots: Vec<VoigtSlot>,
    scales: Vec<f64>,
}

impl VoigtFit<'_> {
    fn profile(&self, parameters: &[f64]) -> VoigtProfile {
        let mut profile = self.base;
        for (slot, value) in self.slots.iter().zip(parameters) {
            match slot {
                VoigtSlot::Amplitude => profile.amplitude = *value,
                VoigtSlot::Center => profile.center = *value,
                VoigtSlot::Sigma => profile.sigma = *value,
                VoigtSlot::Gamma => profile.gamma = *value,
            }
        }
        profile
    }
}

impl LeastSquaresProblem for VoigtFit<'_> {
    fn residuals(&self, parameters: &[f64]) -> Result<Vec<f64>, LeastSquaresError> {
        let profile = self.profile(parameters);
        self.axis
            .iter()
            .zip(self.signal)
            .map(|(x, y)| {
                profile
                    .evaluate(*x)
                    .map(|model| y - model)
                    .map_err(|error| LeastSquaresError::Model(voigt_failure(error)))
            })
            .collect()
    }

    fn parameter_scale(&self, index: usize) -> f64 {
        self.scales.get(index).copied().unwrap_or(1.0)
    }
}

/// Fits `amplitude · Re[w(z)] / (σ√(2π))` to a background spectrum.
///
/// The centre starts at [`REFERENCE_LINE`] when the axis covers it and is bounded to the axis
/// span. A provided sigma or gamma is held fixed; without a gamma the Lorentzian width starts at
/// sigma's value and is fitted.
pub fn calibrate_response(
    axis: &[f64],
    background: &[f64],
    overrides: &CalibrationOverrides,
    config: &LeastSquaresConfig,
) -> TsResult<ResponseCalibration> {
    validate_overrides(overrides)?;
    let guess = guess_voigt(axis, background)?;

    let (lower, upper) = (axis[0].min(axis[axis.len() - 1]), axis[0].max(axis[axis.len() - 1]));
    let center = if (lower..=upper).contains(&REFERENCE_LINE) {
        REFERENCE_LINE
    } else {
        guess.center
    };
    let sigma = overrides.sigma.unwrap_or(guess.sigma);
    let gamma = overrides.gamma.unwrap_or(sigma);
    let base = VoigtProfile {
        amplitude: guess.amplitude,
        center,
        sigma,
        gamma,
    };

    let width_floor = (upper - lower) / (axis.len() - 1) as f64 * 1.0e-3;
    let mut slots = vec![VoigtSlot::Amplitude, VoigtSlot::Center];
    let mut bounds = vec![Bound::UNBOUNDED, Bound::between(lower, upper)];
    let mut initial = vec![base.amplitude, base.center];
    let mut scales = vec![base.amplitude.abs().max(f64::MIN_POSITIVE), base.center.abs()];
    if overrides.sigma.is_none() {
        slots.push(VoigtSlot::Sigma);
        bounds.push(Bound::lower(width_floor));
        initial.push(sigma);
        scales.push(sigma);
    }
    if overrides.gamma.is_none() {
        slots.push(VoigtSlot::Gamma);
        bounds.push(Bound::lower(0.0));
        initial.push(gamma);
        scales.push(sigma);
    }

    let problem = VoigtFit {
        axis,
        signal: background,
        base,
        slots,
        scales,
    };
    debug!(?base, "seeded response calibration");

    let solution = levenberg_marquardt(&problem, &initial, &bounds, config).map_err(|error| {
        let names: Vec<String> = problem
            .slots
            .iter()
            .map(|slot| slot.name().to_string())
            .collect();
        error.into_ts_error(
            "CALIBRATION.NOT_CONVERGED",
            "response calibration",
            &names,
            &initial,
        )
    })?;

    let profile = problem.profile(&solution.parameters);
    info!(
        l0 = profile.center,
        sigma = profile.sigma,
        gamma = profile.gamma,
        iterations = solution.iterations,
        "calibrated instrument response"
    );

    Ok(ResponseCalibration {
        profile,
        chi_square: solution.chi_square,
        iterations: solution.iterations,
        sigma_fixed: overrides.sigma.is_some(),
        gamma_fixed: overrides.gamma.is_some(),
    })
}

/// Index range `[i - take, i + take)` centred on the sample nearest `l0`, with
/// `take = min(i, n - i)`.
pub fn symmetric_crop(axis: &[f64], l0: f64) -> TsResult<Range<usize>> {
    let center = nearest_index(axis, l0).ok_or_else(|| {
        TsError::data_shape("CROP.EMPTY_AXIS", "cannot crop an empty wavelength axis")
    })?;
    let take = center.min(axis.len() - center);
    if take == 0 {
        return Err(TsError::data_shape(
            "CROP.AT_EDGE",
            format!("fitted centre {l0:.6E} sits on the edge of the wavelength axis"),
        ));
    }
    Ok(center - take..center + take)
}

fn validate_samples(axis: &[f64], signal: &[f64]) -> TsResult<()> {
    if axis.len() != signal.len() {
        return Err(TsError::data_shape(
            "CALIBRATION.LENGTH",
            format!(
                "axis has {} samples but the background has {}",
                axis.len(),
                signal.len()
            ),
        ));
    }
    if axis.len() < MIN_CALIBRATION_SAMPLES {
        return Err(TsError::data_shape(
            "CALIBRATION.LENGTH",
            format!(
                "response calibration needs at least {MIN_CALIBRATION_SAMPLES} samples, got {}",
                axis.len()
            ),
        ));
    }
    Ok(())
}

fn validate_overrides(overrides: &CalibrationOverrides) -> TsResult<()> {
    if let Some(sigma) = overrides.sigma {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(TsError::configuration(
                "CONFIG.CALIBRATION_SIGMA",
                format!("fixed sigma must be finite and > 0, got {sigma}"),
            ));
        }
    }
    if let Some(gamma) = overrides.gamma {
        if !gamma.is_finite() || gamma < 0.0 {
            return Err(TsError::configuration(
                "CONFIG.CALIBRATION_GAMMA",
                format!("fixed gamma must be finite and >= 0, got {gamma}"),
            ));
        }
    }
    Ok(())
}

fn voigt_failure(error: VoigtError) -> TsError {
    TsError::internal("CALIBRATION.VOIGT", error.to_string())
}
