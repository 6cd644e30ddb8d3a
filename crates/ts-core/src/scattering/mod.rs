//! Scattering-model fit of a calibrated fibre spectrum and the quantities derived from it.

mod lineshape;
mod parameters;

pub use lineshape::{
    DOPPLER_ION_FEATURE, DopplerIonFeature, ELEMENTARY_CHARGE, FitContext, PROTON_MASS,
    SPEED_OF_LIGHT, ScatteringLineshape, builtin_lineshape,
};
pub use parameters::{
    FitParameter, MODEL_KEY, ParameterEntry, ParameterName, ParameterSpecification,
    PlasmaParameters,
};

use crate::calibration::VoigtProfile;
use crate::domain::{TsError, TsResult};
use crate::ionization::{IonizationTables, ZTeTable};
use crate::numerics::{
    Bound, LeastSquaresConfig, LeastSquaresError, LeastSquaresProblem, levenberg_marquardt,
    stable_sum, upsample_grid,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;
use tracing::{debug, info};

/// Debye-length prefactor: `lambda_De = 7.43 sqrt(T_e / n_e)` m, with `T_e` in eV and `n_e`
/// in m^-3.
pub const DEBYE_LENGTH_PREFACTOR: f64 = 7.43;
const FLOW_SCALE: f64 = 1.0e3;

#[derive(Debug, Clone, Copy)]
pub struct ScatteringFitInput<'a> {
    /// Cropped wavelength axis (m).
    pub axis: &'a [f64],
    pub shot: &'a [f64],
    pub response: &'a VoigtProfile,
    pub theta: f64,
    pub specification: &'a ParameterSpecification,
    pub interpolation_scale: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScatteringFit {
    pub model: String,
    pub parameters: PlasmaParameters,
    pub free_parameters: Vec<String>,
    /// One-sigma errors of the free parameters whose covariance could be estimated.
    pub standard_errors: BTreeMap<String, f64>,
    #[serde(skip)]
    pub best_fit: Vec<f64>,
    pub chi_square: f64,
    pub reduced_chi_square: Option<f64>,
    pub iterations: usize,
    pub converged: bool,
    pub interpolation_scale: usize,
    /// Mean ionization at the fitted `T_e`.
    pub z: f64,
    /// Z-Te table selected by the starting `A`; derived quantities read Z from it.
    #[serde(skip)]
    pub ionization: Arc<ZTeTable>,
}

struct ScatteringProblem<'a> {
    shot: &'a [f64],
    context: &'a FitContext,
    lineshape: &'a dyn ScatteringLineshape,
    parameters: &'a [FitParameter],
    scales: Vec<f64>,
}

impl ScatteringProblem<'_> {
    fn model(&self, free_values: &[f64]) -> TsResult<Vec<f64>> {
        let plasma = PlasmaParameters::assemble(self.parameters, free_values);
        let model = self.lineshape.evaluate(self.context, &plasma)?;
        if model.len() != self.shot.len() {
            return Err(TsError::internal(
                "FIT.LINESHAPE_LENGTH",
                format!(
                    "lineshape '{}' returned {} samples for a {}-sample spectrum",
                    self.lineshape.name(),
                    model.len(),
                    self.shot.len()
                ),
            ));
        }
        Ok(model)
    }
}

impl LeastSquaresProblem for ScatteringProblem<'_> {
    fn residuals(&self, parameters: &[f64]) -> Result<Vec<f64>, LeastSquaresError> {
        let model = self.model(parameters).map_err(LeastSquaresError::Model)?;
        Ok(self
            .shot
            .iter()
            .zip(&model)
            .map(|(data, model)| data - model)
            .collect())
    }

    fn parameter_scale(&self, index: usize) -> f64 {
        self.scales.get(index).copied().unwrap_or(1.0)
    }
}

/// Fits `lineshape` to a cropped shot spectrum.
///
/// Independent entries of the parameter set are held at their values; the rest are fitted
/// from their values, bounded below by their optional minimum.
pub fn fit_scattering(
    input: ScatteringFitInput<'_>,
    lineshape: &dyn ScatteringLineshape,
    tables: &IonizationTables,
    config: &LeastSquaresConfig,
) -> TsResult<ScatteringFit> {
    let ScatteringFitInput {
        axis,
        shot,
        response,
        theta,
        specification,
        interpolation_scale,
    } = input;

    if interpolation_scale == 0 {
        return Err(TsError::configuration(
            "CONFIG.INTERPOLATION_SCALE",
            "interpolation scale must be >= 1",
        ));
    }
    if axis.len() != shot.len() || axis.len() < 2 {
        return Err(TsError::data_shape(
            "FIT.LENGTH",
            format!(
                "axis has {} samples and the shot {}; need matching lengths of at least 2",
                axis.len(),
                shot.len()
            ),
        ));
    }

    let parameters = specification.partition();
    let grid = upsample_grid(axis, interpolation_scale).ok_or_else(|| {
        TsError::data_shape("FIT.GRID", "cannot upsample the wavelength axis")
    })?;
    let upsampled_response = response.evaluate_grid(&grid)?;
    let table: Arc<ZTeTable> = tables.for_mass(specification.a.value)?;
    let context = FitContext::new(
        grid,
        interpolation_scale,
        response.center,
        upsampled_response,
        theta,
        specification.model.clone(),
        Arc::clone(&table),
    )?;

    let spacing = (axis[axis.len() - 1] - axis[0]).abs() / (axis.len() - 1) as f64;
    let mut free_names = Vec::new();
    let mut initial = Vec::new();
    let mut bounds = Vec::new();
    let mut scales = Vec::new();
    for parameter in &parameters {
        if let FitParameter::Free { name, initial: value, min } = parameter {
            free_names.push(name.key().to_string());
            initial.push(*value);
            bounds.push(min.map_or(Bound::UNBOUNDED, Bound::lower));
            scales.push(if *value != 0.0 {
                value.abs()
            } else {
                default_scale(*name, spacing)
            });
        }
    }

    let problem = ScatteringProblem {
        shot,
        context: &context,
        lineshape,
        parameters: &parameters,
        scales,
    };
    debug!(free = ?free_names, model = %specification.model, "starting scattering fit");

    let (free_values, chi_square, reduced_chi_square, iterations, converged, errors) =
        if initial.is_empty() {
            let residuals = problem.residuals(&[]).map_err(|error| {
                error.into_ts_error("FIT.NOT_CONVERGED", "scattering model", &[], &[])
            })?;
            if residuals.iter().any(|value| !value.is_finite()) {
                return Err(LeastSquaresError::NonFiniteResiduals { iteration: 0 }
                    .into_ts_error("FIT.NOT_CONVERGED", "scattering model", &[], &[]));
            }
            let chi_square = residuals.iter().map(|value| value * value).sum::<f64>();
            let dof = residuals.len();
            (Vec::new(), chi_square, Some(chi_square / dof as f64), 0, true, None)
        } else {
            let solution = levenberg_marquardt(&problem, &initial, &bounds, config)
                .map_err(|error| {
                    error.into_ts_error(
                        "FIT.NOT_CONVERGED",
                        "scattering fit",
                        &free_names,
                        &initial,
                    )
                })?;
            let reduced = solution.reduced_chi_square();
            (
                solution.parameters,
                solution.chi_square,
                reduced,
                solution.iterations,
                solution.converged,
                solution.standard_errors,
            )
        };

    let best_fit = problem.model(&free_values)?;
    let plasma = PlasmaParameters::assemble(&parameters, &free_values);
    let z = ionization_at(context.ionization(), plasma.t_e)?;

    let standard_errors = errors
        .map(|errors| {
            free_names
                .iter()
                .cloned()
                .zip(errors)
                .collect::<BTreeMap<String, f64>>()
        })
        .unwrap_or_default();

    info!(
        chi_square,
        iterations,
        t_e = plasma.t_e,
        t_i = plasma.t_i,
        z,
        "scattering fit finished"
    );

    Ok(ScatteringFit {
        model: specification.model.clone(),
        parameters: plasma,
        free_parameters: free_names,
        standard_errors,
        best_fit,
        chi_square,
        reduced_chi_square,
        iterations,
        converged,
        interpolation_scale,
        z,
        ionization: table,
    })
}

/// Mean ionization at `t_e` from the first density bracket.
pub fn ionization_at(table: &ZTeTable, t_e: f64) -> TsResult<f64> {
    table.ionization(t_e).ok_or_else(|| {
        TsError::data_shape("FIT.IONIZATION", format!("cannot look up Z for T_e={t_e}"))
    })
}

fn default_scale(name: ParameterName, spacing: f64) -> f64 {
    match name {
        ParameterName::Shift => spacing,
        ParameterName::ElectronFlow | ParameterName::IonFlow => FLOW_SCALE,
        _ => 1.0,
    }
}

/// Scattering parameter `alpha = 1 / (k lambda_De)` with `k = 4π sin(θ/2) / l0`.
pub fn scattering_alpha(t_e: f64, n_e: f64, theta: f64, l0: f64) -> f64 {
    let debye_length = DEBYE_LENGTH_PREFACTOR * (t_e / n_e).sqrt();
    let k = 4.0 * PI * (0.5 * theta).sin() / l0;
    (1.0 / (k * debye_length)).abs()
}

/// Expected Thomson intensity `Z n_e α⁴ / [(1+α²)(1+α²+α² Z T_e/T_i)]`.
pub fn predicted_intensity(z: f64, n_e: f64, t_e: f64, t_i: f64, alpha: f64) -> f64 {
    let alpha2 = alpha * alpha;
    z * n_e * alpha2 * alpha2 / ((1.0 + alpha2) * (1.0 + alpha2 + alpha2 * z * t_e / t_i))
}

/// `sum(shot) / sum(response)` over the cropped arrays.
pub fn integrated_intensity(shot: &[f64], response: &[f64]) -> f64 {
    stable_sum(shot) / stable_sum(response)
}

#[cfg(test)]
mod tests {
    use super::{
        DOPPLER_ION_FEATURE, DopplerIonFeature, FitContext, ParameterSpecification,
        PlasmaParameters, ScatteringFitInput, ScatteringLineshape, fit_scattering,
        integrated_intensity, predicted_intensity, scattering_alpha,
    };
    use crate::calibration::{REFERENCE_LINE, VoigtProfile};
    use crate::ionization::IonizationTables;
    use crate::numerics::{LeastSquaresConfig, upsample_grid};
    use serde_json::json;
    use std::f64::consts::{FRAC_PI_2, PI};
    use std::fs;
    use tempfile::TempDir;

    const CARBON_TABLE: &str = "header\nheader\nheader\nheader\n1 1.0\n10 3.0\n100 5.5\n1000 6.0\n";

    fn carbon_tables(temp: &TempDir) -> IonizationTables {
        fs::write(temp.path().join("zb_C.dat"), CARBON_TABLE).expect("table should be written");
        IonizationTables::new(temp.path())
    }

    fn response() -> VoigtProfile {
        VoigtProfile {
            amplitude: 2.5e-8,
            center: REFERENCE_LINE,
            sigma: 1.0e-11,
            gamma: 1.0e-12,
        }
    }

    fn axis() -> Vec<f64> {
        (0..201)
            .map(|index| REFERENCE_LINE + (index as f64 - 100.0) * 5.0e-12)
            .collect()
    }

    #[test]
    fn recovers_ion_temperature_and_flow_on_upsampled_grid() {
        let temp = TempDir::new().expect("tempdir should be created");
        let tables = carbon_tables(&temp);
        let axis = axis();
        let response = response();
        let scale = 3;

        let truth = PlasmaParameters {
            n_e: 1.0e23,
            t_e: 100.0,
            a: 12.0,
            t_i: 300.0,
            v_fi: 4.0e4,
            stray: 5.0,
            amplitude: 50.0,
            offset: 1.0,
            ..PlasmaParameters::default()
        };
        let grid = upsample_grid(&axis, scale).expect("grid");
        let upsampled = response.evaluate_grid(&grid).expect("response");
        let context = FitContext::new(
            grid,
            scale,
            response.center,
            upsampled,
            FRAC_PI_2,
            DOPPLER_ION_FEATURE,
            tables.for_mass(12.0).expect("carbon"),
        )
        .expect("context");
        let shot = DopplerIonFeature.evaluate(&context, &truth).expect("shot");
        assert_eq!(shot.len(), axis.len());

        let specification = ParameterSpecification::from_value(&json!({
            "model": DOPPLER_ION_FEATURE,
            "n_e": [1.0e23, true],
            "T_e": [100.0, true],
            "V_fe": [0.0, true],
            "A": [12.0, true],
            "T_i": [200.0, false, 1.0],
            "V_fi": [1.0e4, false],
            "stray": [5.0, true],
            "amplitude": [50.0, true],
            "offset": [1.0, true],
            "shift": [0.0, true]
        }))
        .expect("specification");

        let fit = fit_scattering(
            ScatteringFitInput {
                axis: &axis,
                shot: &shot,
                response: &response,
                theta: FRAC_PI_2,
                specification: &specification,
                interpolation_scale: scale,
            },
            &DopplerIonFeature,
            &tables,
            &LeastSquaresConfig::default(),
        )
        .expect("fit should converge");

        assert!(fit.converged);
        assert_eq!(fit.interpolation_scale, 3);
        assert_eq!(fit.free_parameters, vec!["T_i".to_string(), "V_fi".to_string()]);
        assert!((fit.parameters.t_i - 300.0).abs() < 1.0e-6 * 300.0);
        assert!((fit.parameters.v_fi - 4.0e4).abs() < 1.0e-6 * 4.0e4);
        assert_eq!(fit.parameters.a, 12.0);
        assert_eq!(fit.best_fit.len(), axis.len());
        assert_eq!(fit.z, 5.5);
        assert!(fit.chi_square < 1.0e-12);
    }

    #[test]
    fn alpha_is_non_negative_for_any_sign_of_k() {
        let forward = scattering_alpha(100.0, 1.0e24, PI / 2.0, 532.0e-9);
        let backward = scattering_alpha(100.0, 1.0e24, -PI / 2.0, 532.0e-9);
        assert!(forward > 0.0);
        assert!((forward - backward).abs() < 1.0e-12 * forward);

        let lambda_de = 7.43 * (100.0_f64 / 1.0e24).sqrt();
        let k = 4.0 * PI * (PI / 4.0).sin() / 532.0e-9;
        assert!((forward - 1.0 / (k * lambda_de)).abs() < 1.0e-9 * forward);
    }

    #[test]
    fn predicted_intensity_matches_closed_form() {
        let value = predicted_intensity(2.0, 1.0e18, 10.0, 5.0, 1.0);
        // 2e18 / (2 * (1 + 1 + 4))
        assert!((value - 2.0e18 / 12.0).abs() < 1.0e-12 * value);
    }

    #[test]
    fn integrated_intensity_is_sum_ratio() {
        assert_eq!(integrated_intensity(&[1.0, 3.0], &[0.5, 0.5]), 4.0);
    }
}
