//! One fibre's spectra and the analysis state accumulated on them.

use crate::calibration::{
    CalibrationOverrides, ResponseCalibration, calibrate_response, symmetric_crop,
};
use crate::domain::{FibreSet, FibreStage, TsError, TsResult};
use crate::ionization::IonizationTables;
use crate::numerics::LeastSquaresConfig;
use crate::scattering::{
    ParameterSpecification, ScatteringFit, ScatteringFitInput, ScatteringLineshape,
    fit_scattering, integrated_intensity, ionization_at, predicted_intensity, scattering_alpha,
};
use serde::Serialize;
use std::ops::Range;
use tracing::info;

/// Spectra of one fibre after zeroing and windowing; the axis is in metres.
#[derive(Debug, Clone, PartialEq)]
pub struct FibreData {
    pub set: FibreSet,
    /// 1-based position within `set`.
    pub number: usize,
    pub wavelength: Vec<f64>,
    pub theta: f64,
    pub background: Vec<f64>,
    pub shot: Vec<f64>,
    pub background_fractional_error: Vec<f64>,
    pub shot_fractional_error: Vec<f64>,
    pub scattered_amplitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DerivedQuantities {
    pub alpha: Option<f64>,
    pub predicted_intensity: Option<f64>,
    pub integrated_intensity: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Fibre {
    data: FibreData,
    calibration: Option<ResponseCalibration>,
    crop: Option<Range<usize>>,
    response: Option<Vec<f64>>,
    shift: Option<Vec<f64>>,
    fit: Option<ScatteringFit>,
    derived: DerivedQuantities,
}

impl Fibre {
    pub fn new(data: FibreData) -> TsResult<Self> {
        let samples = data.wavelength.len();
        let lengths = [
            data.background.len(),
            data.shot.len(),
            data.background_fractional_error.len(),
            data.shot_fractional_error.len(),
        ];
        if lengths.iter().any(|length| *length != samples) {
            return Err(TsError::data_shape(
                "FIBRE.LENGTH",
                format!(
                    "fibre {}{} arrays {:?} do not match its {}-sample axis",
                    data.number, data.set, lengths, samples
                ),
            ));
        }

        Ok(Self {
            data,
            calibration: None,
            crop: None,
            response: None,
            shift: None,
            fit: None,
            derived: DerivedQuantities::default(),
        })
    }

    pub fn label(&self) -> String {
        format!("{}{}", self.data.number, self.data.set)
    }

    pub fn set(&self) -> FibreSet {
        self.data.set
    }

    pub fn number(&self) -> usize {
        self.data.number
    }

    pub fn theta(&self) -> f64 {
        self.data.theta
    }

    pub fn wavelength(&self) -> &[f64] {
        &self.data.wavelength
    }

    pub fn background(&self) -> &[f64] {
        &self.data.background
    }

    pub fn shot(&self) -> &[f64] {
        &self.data.shot
    }

    pub fn background_fractional_error(&self) -> &[f64] {
        &self.data.background_fractional_error
    }

    pub fn shot_fractional_error(&self) -> &[f64] {
        &self.data.shot_fractional_error
    }

    pub fn scattered_amplitude(&self) -> f64 {
        self.data.scattered_amplitude
    }

    pub fn calibration(&self) -> Option<&ResponseCalibration> {
        self.calibration.as_ref()
    }

    pub fn crop(&self) -> Option<&Range<usize>> {
        self.crop.as_ref()
    }

    pub fn response(&self) -> Option<&[f64]> {
        self.response.as_deref()
    }

    pub fn shift(&self) -> Option<&[f64]> {
        self.shift.as_deref()
    }

    pub fn fit(&self) -> Option<&ScatteringFit> {
        self.fit.as_ref()
    }

    pub fn derived(&self) -> &DerivedQuantities {
        &self.derived
    }

    pub fn stage(&self) -> FibreStage {
        if self.fit.is_some() {
            if self.derived.alpha.is_some() || self.derived.integrated_intensity.is_some() {
                FibreStage::Derived
            } else {
                FibreStage::Fitted
            }
        } else if self.response.is_some() {
            FibreStage::Cropped
        } else if self.calibration.is_some() {
            FibreStage::Calibrated
        } else {
            FibreStage::Raw
        }
    }

    /// Replaces the background with another fibre's, discarding state built on the old one.
    pub fn replace_background(
        &mut self,
        background: Vec<f64>,
        fractional_error: Vec<f64>,
    ) -> TsResult<()> {
        if background.len() != self.data.background.len()
            || fractional_error.len() != self.data.background_fractional_error.len()
        {
            return Err(TsError::data_shape(
                "FIBRE.BACKGROUND_LENGTH",
                format!(
                    "replacement background has {} samples, fibre {} has {}",
                    background.len(),
                    self.label(),
                    self.data.background.len()
                ),
            ));
        }
        self.data.background = background;
        self.data.background_fractional_error = fractional_error;
        self.calibration = None;
        self.response = None;
        self.shift = None;
        self.fit = None;
        self.derived = DerivedQuantities::default();
        Ok(())
    }

    /// Fits the instrument response to the background.
    pub fn calibrate(
        &mut self,
        overrides: &CalibrationOverrides,
        config: &LeastSquaresConfig,
    ) -> TsResult<&ResponseCalibration> {
        let calibration =
            calibrate_response(&self.data.wavelength, &self.data.background, overrides, config)
                .map_err(|error| self.annotate(error))?;

        if self.response.is_some() {
            self.response = Some(calibration.profile.evaluate_grid(&self.data.wavelength)?);
            self.shift = Some(shift_axis(&self.data.wavelength, calibration.l0()));
        }
        self.fit = None;
        self.derived = DerivedQuantities::default();
        Ok(&*self.calibration.insert(calibration))
    }

    /// Crops every array symmetrically about `l0` and evaluates the smooth response there.
    pub fn symmetric_crop(&mut self) -> TsResult<Range<usize>> {
        let calibration = self.require_calibration("symmetric crop")?;
        let l0 = calibration.l0();
        let profile = calibration.profile;
        let range =
            symmetric_crop(&self.data.wavelength, l0).map_err(|error| self.annotate(error))?;

        let data = &mut self.data;
        data.wavelength = data.wavelength[range.clone()].to_vec();
        data.background = data.background[range.clone()].to_vec();
        data.shot = data.shot[range.clone()].to_vec();
        data.background_fractional_error = data.background_fractional_error[range.clone()].to_vec();
        data.shot_fractional_error = data.shot_fractional_error[range.clone()].to_vec();

        self.response = Some(profile.evaluate_grid(&self.data.wavelength)?);
        self.shift = Some(shift_axis(&self.data.wavelength, l0));
        self.crop = Some(range.clone());
        self.fit = None;
        self.derived = DerivedQuantities::default();

        info!(fibre = %self.label(), half_width = range.len() / 2, "cropped around l0");
        Ok(range)
    }

    pub fn fit_scattering(
        &mut self,
        specification: &ParameterSpecification,
        interpolation_scale: usize,
        lineshape: &dyn ScatteringLineshape,
        tables: &IonizationTables,
        config: &LeastSquaresConfig,
    ) -> TsResult<&ScatteringFit> {
        if self.response.is_none() {
            return Err(self.missing("scattering fit", FibreStage::Cropped));
        }
        let calibration = self.require_calibration("scattering fit")?;

        let fit = fit_scattering(
            ScatteringFitInput {
                axis: &self.data.wavelength,
                shot: &self.data.shot,
                response: &calibration.profile,
                theta: self.data.theta,
                specification,
                interpolation_scale,
            },
            lineshape,
            tables,
            config,
        )
        .map_err(|error| self.annotate(error))?;

        self.derived = DerivedQuantities::default();
        Ok(&*self.fit.insert(fit))
    }

    pub fn calculate_alpha(&mut self) -> TsResult<f64> {
        let fit = self.require_fit("alpha")?;
        let l0 = self.require_calibration("alpha")?.l0();
        let alpha = scattering_alpha(fit.parameters.t_e, fit.parameters.n_e, self.data.theta, l0);
        self.derived.alpha = Some(alpha);
        Ok(alpha)
    }

    /// Re-reads Z at the fitted `T_e` from the fit's Z-Te table and evaluates the expected
    /// Thomson intensity.
    pub fn calculate_predicted_intensity(&mut self) -> TsResult<f64> {
        let alpha = self
            .derived
            .alpha
            .ok_or_else(|| self.missing("predicted intensity", FibreStage::Derived))?;
        let fit = self.require_fit("predicted intensity")?;
        let parameters = fit.parameters;
        let z = ionization_at(&fit.ionization, parameters.t_e)
            .map_err(|error| self.annotate(error))?;
        let intensity =
            predicted_intensity(z, parameters.n_e, parameters.t_e, parameters.t_i, alpha);

        if let Some(fit) = self.fit.as_mut() {
            fit.z = z;
        }
        self.derived.predicted_intensity = Some(intensity);
        Ok(intensity)
    }

    pub fn calculate_integrated_intensity(&mut self) -> TsResult<f64> {
        let response = self
            .response
            .as_deref()
            .ok_or_else(|| self.missing("integrated intensity", FibreStage::Cropped))?;
        let intensity = integrated_intensity(&self.data.shot, response);
        self.derived.integrated_intensity = Some(intensity);
        Ok(intensity)
    }

    pub fn report(&self) -> FibreReport {
        FibreReport {
            label: self.label(),
            set: self.data.set.as_str(),
            number: self.data.number,
            theta_degrees: self.data.theta.to_degrees(),
            stage: self.stage().as_str(),
            scattered_amplitude: self.data.scattered_amplitude,
            crop_half_width: self.crop.as_ref().map(|range| range.len() / 2),
            calibration: self.calibration.clone(),
            fit: self.fit.clone(),
            derived: self.derived,
        }
    }

    fn require_calibration(&self, operation: &str) -> TsResult<&ResponseCalibration> {
        self.calibration
            .as_ref()
            .ok_or_else(|| self.missing(operation, FibreStage::Calibrated))
    }

    fn require_fit(&self, operation: &str) -> TsResult<&ScatteringFit> {
        self.fit
            .as_ref()
            .ok_or_else(|| self.missing(operation, FibreStage::Fitted))
    }

    fn missing(&self, operation: &str, required: FibreStage) -> TsError {
        TsError::missing_dependency(
            "FIBRE.STAGE",
            format!(
                "{} for fibre {} requires stage '{}', fibre is '{}'",
                operation,
                self.label(),
                required,
                self.stage()
            ),
        )
    }

    fn annotate(&self, error: TsError) -> TsError {
        error.with_context(format_args!("fibre {}", self.label()))
    }
}

fn shift_axis(wavelength: &[f64], l0: f64) -> Vec<f64> {
    wavelength.iter().map(|lambda| lambda - l0).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FibreReport {
    pub label: String,
    pub set: &'static str,
    pub number: usize,
    pub theta_degrees: f64,
    pub stage: &'static str,
    /// Trapezoidal integral of the zeroed shot (S_T).
    pub scattered_amplitude: f64,
    pub crop_half_width: Option<usize>,
    pub calibration: Option<ResponseCalibration>,
    pub fit: Option<ScatteringFit>,
    pub derived: DerivedQuantities,
}
