//! Bounded Levenberg-Marquardt driver with a forward-difference Jacobian.
//!
//! Normal equations are column-scaled by `sqrt(diag(JᵀJ))` before the Marquardt damping term is
//! added, so parameters of very different magnitude (densities near 1e19, wavelengths near 5e-7)
//! share one damping factor. Bounds are enforced by clamping trial points.

use super::linalg::{
    DenseMatrix, LuError, lu_factorize, normal_matrix, symmetric_inverse, transpose_apply,
};
use crate::domain::{ConvergenceDiagnostics, TsError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MIN_LAMBDA: f64 = 1.0e-15;
const GRADIENT_FLOOR: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bound {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bound {
    pub const UNBOUNDED: Self = Self {
        min: None,
        max: None,
    };

    pub const fn lower(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub const fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        let mut value = value;
        if let Some(min) = self.min {
            value = value.max(min);
        }
        if let Some(max) = self.max {
            value = value.min(max);
        }
        value
    }

    fn at_upper(&self, value: f64) -> bool {
        self.max.is_some_and(|max| value >= max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeastSquaresConfig {
    pub max_iterations: usize,
    /// Relative chi-square reduction below which an accepted step ends the fit.
    pub ftol: f64,
    /// Relative parameter change below which an accepted step ends the fit.
    pub xtol: f64,
    /// Infinity norm of the scaled gradient below which the fit is considered stationary.
    pub gtol: f64,
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub max_lambda: f64,
    /// Relative forward-difference step for the Jacobian.
    pub jacobian_step: f64,
}

impl Default for LeastSquaresConfig {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            ftol: 1.0e-10,
            xtol: 1.0e-10,
            gtol: 1.0e-12,
            initial_lambda: 1.0e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            max_lambda: 1.0e16,
            jacobian_step: 1.0e-7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LeastSquaresError {
    #[error("least-squares problem has no free parameters")]
    NoParameters,
    #[error("expected {expected} {what}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{residuals} residuals cannot determine {parameters} parameters")]
    Underdetermined { residuals: usize, parameters: usize },
    #[error("residuals are not finite at iteration {iteration}")]
    NonFiniteResiduals { iteration: usize },
    #[error("model evaluation failed: {0}")]
    Model(#[source] TsError),
    #[error("no convergence after {iterations} iterations (chi2={chi_square:.6E})")]
    NotConverged {
        iterations: usize,
        chi_square: f64,
        parameters: Vec<f64>,
    },
}

impl LeastSquaresError {
    /// Lifts an optimizer failure into the domain error, attaching the optimizer state when the
    /// fit itself ran.
    pub fn into_ts_error(
        self,
        code: &'static str,
        context: &str,
        names: &[String],
        last_parameters: &[f64],
    ) -> TsError {
        let diagnostics = |iterations: usize, chi_square: f64, values: Vec<f64>| {
            ConvergenceDiagnostics {
                iterations,
                chi_square,
                parameter_names: names.to_vec(),
                parameter_values: values,
            }
        };
        let summary = format!("{context}: {self}");

        match self {
            Self::NotConverged {
                iterations,
                chi_square,
                parameters,
            } => TsError::convergence(
                code,
                format!("{context} did not converge"),
                diagnostics(iterations, chi_square, parameters),
            ),
            Self::NonFiniteResiduals { iteration } => TsError::convergence(
                code,
                format!("{context} produced non-finite model output"),
                diagnostics(iteration, f64::NAN, last_parameters.to_vec()),
            ),
            Self::Model(error) => error,
            Self::Underdetermined { .. } => TsError::data_shape(code, summary),
            Self::NoParameters | Self::LengthMismatch { .. } => TsError::internal(code, summary),
        }
    }
}

/// Residual vector `data - model` as a function of the free parameters.
pub trait LeastSquaresProblem {
    fn residuals(&self, parameters: &[f64]) -> Result<Vec<f64>, LeastSquaresError>;

    /// Typical magnitude of parameter `index`; sets the finite-difference step when the
    /// parameter itself is near zero.
    fn parameter_scale(&self, _index: usize) -> f64 {
        1.0
    }
}

impl<F> LeastSquaresProblem for F
where
    F: Fn(&[f64]) -> Result<Vec<f64>, LeastSquaresError>,
{
    fn residuals(&self, parameters: &[f64]) -> Result<Vec<f64>, LeastSquaresError> {
        self(parameters)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeastSquaresSolution {
    pub parameters: Vec<f64>,
    pub residuals: Vec<f64>,
    pub chi_square: f64,
    pub iterations: usize,
    pub converged: bool,
    /// `sqrt(diag((JᵀJ)⁻¹) · chi2 / (n - p))`; `None` when the covariance is not estimable.
    pub standard_errors: Option<Vec<f64>>,
}

impl LeastSquaresSolution {
    pub fn reduced_chi_square(&self) -> Option<f64> {
        let dof = self.residuals.len().checked_sub(self.parameters.len())?;
        if dof == 0 {
            return None;
        }
        Some(self.chi_square / dof as f64)
    }
}

pub fn levenberg_marquardt<P>(
    problem: &P,
    initial: &[f64],
    bounds: &[Bound],
    config: &LeastSquaresConfig,
) -> Result<LeastSquaresSolution, LeastSquaresError>
where
    P: LeastSquaresProblem + ?Sized,
{
    if initial.is_empty() {
        return Err(LeastSquaresError::NoParameters);
    }
    if bounds.len() != initial.len() {
        return Err(LeastSquaresError::LengthMismatch {
            what: "bounds",
            expected: initial.len(),
            actual: bounds.len(),
        });
    }

    let mut parameters: Vec<f64> = initial
        .iter()
        .zip(bounds)
        .map(|(value, bound)| bound.clamp(*value))
        .collect();
    let mut residuals = evaluate(problem, &parameters, None, 0)?;
    if residuals.len() < parameters.len() {
        return Err(LeastSquaresError::Underdetermined {
            residuals: residuals.len(),
            parameters: parameters.len(),
        });
    }
    let residual_count = residuals.len();
    let mut chi_square = sum_of_squares(&residuals);
    let mut lambda = config.initial_lambda.max(MIN_LAMBDA);
    let mut converged = chi_square == 0.0;
    let mut iterations = 0;
    let mut accepted_steps = 0_usize;

    while !converged && iterations < config.max_iterations {
        iterations += 1;
        let jacobian = forward_jacobian(problem, &parameters, &residuals, bounds, config)?;
        let (normal, gradient) = normal_equations(&jacobian, &residuals);
        let scale: Vec<f64> = (0..parameters.len())
            .map(|index| {
                let diagonal = normal[(index, index)];
                if diagonal > 0.0 { diagonal.sqrt() } else { 1.0 }
            })
            .collect();

        let scaled_gradient = gradient
            .iter()
            .zip(&scale)
            .map(|(g, s)| (g / s).abs())
            .fold(0.0_f64, f64::max);
        if scaled_gradient <= config.gtol * chi_square.sqrt().max(GRADIENT_FLOOR) {
            converged = true;
            break;
        }

        let mut damping_exhausted = false;
        loop {
            let trial = match damped_step(&normal, &gradient, &scale, lambda) {
                Ok(step) => parameters
                    .iter()
                    .zip(&step)
                    .zip(bounds)
                    .map(|((value, delta), bound)| bound.clamp(value + delta))
                    .collect::<Vec<_>>(),
                Err(_) => {
                    lambda *= config.lambda_up;
                    if lambda > config.max_lambda {
                        damping_exhausted = true;
                        break;
                    }
                    continue;
                }
            };

            let trial_residuals = match evaluate(problem, &trial, Some(residual_count), iterations)
            {
                Ok(values) => values,
                Err(LeastSquaresError::NonFiniteResiduals { .. }) => Vec::new(),
                Err(error) => return Err(error),
            };
            let trial_chi_square = if trial_residuals.is_empty() {
                f64::INFINITY
            } else {
                sum_of_squares(&trial_residuals)
            };

            if trial_chi_square < chi_square {
                let reduction = (chi_square - trial_chi_square) / chi_square;
                let step_size = parameters
                    .iter()
                    .zip(&trial)
                    .map(|(old, new)| (new - old).abs() / old.abs().max(f64::MIN_POSITIVE))
                    .fold(0.0_f64, f64::max);

                parameters = trial;
                residuals = trial_residuals;
                accepted_steps += 1;
                chi_square = trial_chi_square;
                lambda = (lambda * config.lambda_down).max(MIN_LAMBDA);
                debug!(
                    iteration = iterations,
                    chi_square, lambda, reduction, "levenberg-marquardt step accepted"
                );

                if reduction <= config.ftol || step_size <= config.xtol || chi_square == 0.0 {
                    converged = true;
                }
                break;
            }

            lambda *= config.lambda_up;
            if lambda > config.max_lambda {
                damping_exhausted = true;
                break;
            }
        }

        if damping_exhausted {
            // No downhill step exists at any damping: a minimum only if the fit ever moved.
            if accepted_steps == 0 {
                warn!(
                    iteration = iterations,
                    chi_square, "levenberg-marquardt never improved on the starting point"
                );
                return Err(LeastSquaresError::NotConverged {
                    iterations,
                    chi_square,
                    parameters,
                });
            }
            debug!(
                iteration = iterations,
                chi_square, "levenberg-marquardt damping limit reached"
            );
            converged = true;
        }
    }

    if !converged {
        return Err(LeastSquaresError::NotConverged {
            iterations,
            chi_square,
            parameters,
        });
    }

    let standard_errors = estimate_standard_errors(
        problem, &parameters, &residuals, bounds, config, chi_square,
    );

    Ok(LeastSquaresSolution {
        parameters,
        residuals,
        chi_square,
        iterations,
        converged,
        standard_errors,
    })
}

fn evaluate<P>(
    problem: &P,
    parameters: &[f64],
    expected_len: Option<usize>,
    iteration: usize,
) -> Result<Vec<f64>, LeastSquaresError>
where
    P: LeastSquaresProblem + ?Sized,
{
    let residuals = problem.residuals(parameters)?;
    if let Some(expected) = expected_len {
        if residuals.len() != expected {
            return Err(LeastSquaresError::LengthMismatch {
                what: "residuals",
                expected,
                actual: residuals.len(),
            });
        }
    }
    if residuals.iter().any(|value| !value.is_finite()) {
        return Err(LeastSquaresError::NonFiniteResiduals { iteration });
    }
    Ok(residuals)
}

fn sum_of_squares(values: &[f64]) -> f64 {
    let squares: Vec<f64> = values.iter().map(|value| value * value).collect();
    super::stable_sum(&squares)
}

fn forward_jacobian<P>(
    problem: &P,
    parameters: &[f64],
    residuals: &[f64],
    bounds: &[Bound],
    config: &LeastSquaresConfig,
) -> Result<DenseMatrix, LeastSquaresError>
where
    P: LeastSquaresProblem + ?Sized,
{
    let mut jacobian = DenseMatrix::zeros(residuals.len(), parameters.len());
    let mut shifted = parameters.to_vec();

    for (col, bound) in bounds.iter().enumerate() {
        let base = parameters[col];
        let magnitude = config.jacobian_step * base.abs().max(problem.parameter_scale(col));
        let step = if bound.at_upper(base + magnitude) {
            -magnitude
        } else {
            magnitude
        };

        shifted[col] = base + step;
        let perturbed = evaluate(problem, &shifted, Some(residuals.len()), 0)?;
        shifted[col] = base;

        for (row, (perturbed, current)) in perturbed.iter().zip(residuals).enumerate() {
            jacobian[(row, col)] = (perturbed - current) / step;
        }
    }

    Ok(jacobian)
}

fn normal_equations(jacobian: &DenseMatrix, residuals: &[f64]) -> (DenseMatrix, Vec<f64>) {
    (normal_matrix(jacobian), transpose_apply(jacobian, residuals))
}

fn damped_step(
    normal: &DenseMatrix,
    gradient: &[f64],
    scale: &[f64],
    lambda: f64,
) -> Result<Vec<f64>, LuError> {
    let parameters = scale.len();
    let mut damped = DenseMatrix::zeros(parameters, parameters);
    for i in 0..parameters {
        for j in 0..parameters {
            damped[(i, j)] = normal[(i, j)] / (scale[i] * scale[j]);
        }
        damped[(i, i)] += lambda;
    }

    // Residuals are data - model: the Gauss-Newton step solves (JᵀJ) δ = -Jᵀr.
    let rhs: Vec<f64> = gradient
        .iter()
        .zip(scale)
        .map(|(g, s)| -g / s)
        .collect();
    let scaled = lu_factorize(&damped)?.solve(&rhs)?;
    Ok(scaled.iter().zip(scale).map(|(y, s)| y / s).collect())
}

fn estimate_standard_errors<P>(
    problem: &P,
    parameters: &[f64],
    residuals: &[f64],
    bounds: &[Bound],
    config: &LeastSquaresConfig,
    chi_square: f64,
) -> Option<Vec<f64>>
where
    P: LeastSquaresProblem + ?Sized,
{
    let dof = residuals.len().checked_sub(parameters.len())?;
    if dof == 0 {
        return None;
    }

    let jacobian = forward_jacobian(problem, parameters, residuals, bounds, config).ok()?;
    let covariance = symmetric_inverse(&normal_matrix(&jacobian)).ok()?;
    let scale = chi_square / dof as f64;

    (0..parameters.len())
        .map(|index| {
            let variance = covariance[(index, index)] * scale;
            (variance.is_finite() && variance >= 0.0).then(|| variance.sqrt())
        })
        .collect()
}
