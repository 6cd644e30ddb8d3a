use super::parameters::PlasmaParameters;
use crate::domain::{TsError, TsResult};
use crate::ionization::ZTeTable;
use crate::numerics::{KernelConvolutionInput, convolve_same, nearest_index, normalize_kernel};
use std::sync::Arc;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;
pub const PROTON_MASS: f64 = 1.672_621_923_69e-27;
pub const ELEMENTARY_CHARGE: f64 = 1.602_176_634e-19;

/// Everything a lineshape needs besides the plasma parameters.
#[derive(Debug, Clone)]
pub struct FitContext {
    grid: Vec<f64>,
    interpolation_scale: usize,
    l0: f64,
    response: Vec<f64>,
    response_kernel: Vec<f64>,
    kernel_center: usize,
    theta: f64,
    model: String,
    ionization: Arc<ZTeTable>,
}

impl FitContext {
    pub fn new(
        grid: Vec<f64>,
        interpolation_scale: usize,
        l0: f64,
        response: Vec<f64>,
        theta: f64,
        model: impl Into<String>,
        ionization: Arc<ZTeTable>,
    ) -> TsResult<Self> {
        if interpolation_scale == 0 {
            return Err(TsError::configuration(
                "CONFIG.INTERPOLATION_SCALE",
                "interpolation scale must be >= 1",
            ));
        }
        if grid.len() < 2 || (grid.len() - 1) % interpolation_scale != 0 {
            return Err(TsError::data_shape(
                "FIT.GRID",
                format!(
                    "grid of {} points is not an upsampling by {}",
                    grid.len(),
                    interpolation_scale
                ),
            ));
        }
        if response.len() != grid.len() {
            return Err(TsError::data_shape(
                "FIT.RESPONSE_LENGTH",
                format!(
                    "response has {} samples but the grid has {}",
                    response.len(),
                    grid.len()
                ),
            ));
        }
        let response_kernel = normalize_kernel(&response).map_err(|source| {
            TsError::data_shape("FIT.RESPONSE_KERNEL", format!("instrument response: {source}"))
        })?;
        let kernel_center = nearest_index(&grid, l0).ok_or_else(|| {
            TsError::data_shape("FIT.RESPONSE_CENTER", format!("l0={l0} is not a number"))
        })?;

        Ok(Self {
            grid,
            interpolation_scale,
            l0,
            response,
            response_kernel,
            kernel_center,
            theta,
            model: model.into(),
            ionization,
        })
    }

    /// Upsampled wavelength grid (m).
    pub fn grid(&self) -> &[f64] {
        &self.grid
    }

    pub fn interpolation_scale(&self) -> usize {
        self.interpolation_scale
    }

    pub fn l0(&self) -> f64 {
        self.l0
    }

    /// Calibrated response evaluated on [`FitContext::grid`].
    pub fn response(&self) -> &[f64] {
        &self.response
    }

    /// Response rescaled to unit sum, ready for convolution.
    pub fn response_kernel(&self) -> &[f64] {
        &self.response_kernel
    }

    /// Grid index nearest `l0`, where the response peaks.
    pub fn kernel_center(&self) -> usize {
        self.kernel_center
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn ionization(&self) -> &ZTeTable {
        &self.ionization
    }

    /// Number of original (non-upsampled) axis samples.
    pub fn sample_count(&self) -> usize {
        (self.grid.len() - 1) / self.interpolation_scale + 1
    }

    /// Every `interpolation_scale`-th value, i.e. the values at the original samples.
    pub fn downsample(&self, values: &[f64]) -> Vec<f64> {
        values
            .iter()
            .step_by(self.interpolation_scale)
            .copied()
            .collect()
    }
}

/// Theoretical scattered spectrum, already convolved with the instrument response.
pub trait ScatteringLineshape: Sync {
    fn name(&self) -> &str;

    /// One value per original axis sample.
    fn evaluate(&self, context: &FitContext, parameters: &PlasmaParameters) -> TsResult<Vec<f64>>;
}

pub const DOPPLER_ION_FEATURE: &str = "doppler_ion";

/// Doppler-broadened, flow-shifted ion feature plus stray laser light and a constant offset.
///
/// The feature is a Gaussian of peak `amplitude` and width
/// `2 sin(θ/2) l0 sqrt(e T_i / (A m_p)) / c`, centred at `l0 (1 + 2 sin(θ/2) V_fi / c) + shift`.
/// Stray light follows the response shape scaled to peak `stray`. Non-physical temperatures or
/// masses produce NaN samples, which the optimizer treats as a rejected step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DopplerIonFeature;

impl ScatteringLineshape for DopplerIonFeature {
    fn name(&self) -> &str {
        DOPPLER_ION_FEATURE
    }

    fn evaluate(&self, context: &FitContext, parameters: &PlasmaParameters) -> TsResult<Vec<f64>> {
        let half_angle = (0.5 * context.theta()).sin();
        let l0 = context.l0();
        let thermal = (ELEMENTARY_CHARGE * parameters.t_i / (parameters.a * PROTON_MASS)).sqrt();
        let width = (2.0 * half_angle * l0 * thermal / SPEED_OF_LIGHT).abs();
        if !width.is_finite() || width == 0.0 {
            return Ok(vec![f64::NAN; context.sample_count()]);
        }
        let center =
            l0 + 2.0 * half_angle * l0 * parameters.v_fi / SPEED_OF_LIGHT + parameters.shift;

        let feature: Vec<f64> = context
            .grid()
            .iter()
            .map(|lambda| {
                let x = (lambda - center) / width;
                parameters.amplitude * (-0.5 * x * x).exp()
            })
            .collect();
        let convolved = convolve_same(
            KernelConvolutionInput::new(&feature, context.response_kernel())
                .centered_at(context.kernel_center()),
        )
        .map_err(|source| TsError::internal("FIT.CONVOLUTION", source.to_string()))?;

        let response_peak = context
            .response()
            .iter()
            .fold(0.0_f64, |peak, value| peak.max(*value));
        let stray_scale = if response_peak > 0.0 {
            parameters.stray / response_peak
        } else {
            0.0
        };

        let spectrum: Vec<f64> = convolved
            .iter()
            .zip(context.response())
            .map(|(value, response)| value + stray_scale * response + parameters.offset)
            .collect();
        Ok(context.downsample(&spectrum))
    }
}

/// Built-in lineshape registered under `model`.
pub fn builtin_lineshape(model: &str) -> Option<&'static dyn ScatteringLineshape> {
    static DOPPLER: DopplerIonFeature = DopplerIonFeature;
    match model {
        DOPPLER_ION_FEATURE => Some(&DOPPLER),
        _ => None,
    }
}
