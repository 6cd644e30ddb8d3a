//! Faddeeva function and the area-normalized Voigt lineshape.
//!
//! `w(z)` is evaluated with Weideman's rational expansion (SIAM J. Numer. Anal. 31, 1994),
//! valid in the closed upper half plane, which is all a Voigt profile with `gamma >= 0` needs.

use num_complex::Complex64;
use std::f64::consts::PI;
use std::sync::OnceLock;

const WEIDEMAN_TERMS: usize = 32;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VoigtError {
    #[error("voigt gaussian width must be finite and > 0, got {value}")]
    InvalidSigma { value: f64 },
    #[error("voigt lorentzian width must be finite and >= 0, got {value}")]
    InvalidGamma { value: f64 },
    #[error("faddeeva argument must lie in the upper half plane, got {value}")]
    LowerHalfPlane { value: Complex64 },
}

struct WeidemanExpansion {
    scale: f64,
    coefficients: [f64; WEIDEMAN_TERMS],
}

fn weideman_expansion() -> &'static WeidemanExpansion {
    static EXPANSION: OnceLock<WeidemanExpansion> = OnceLock::new();
    EXPANSION.get_or_init(|| {
        let terms = WEIDEMAN_TERMS;
        let nodes = 2 * terms;
        let scale = (terms as f64 / 2.0_f64.sqrt()).sqrt();

        let samples: Vec<f64> = (0..nodes)
            .map(|k| {
                let theta = k as f64 * PI / nodes as f64;
                let t = scale * (theta / 2.0).tan();
                (-t * t).exp() * (scale * scale + t * t)
            })
            .collect();

        let mut coefficients = [0.0; WEIDEMAN_TERMS];
        for (offset, coefficient) in coefficients.iter_mut().enumerate() {
            let order = (offset + 1) as f64;
            let mut sum = samples[0];
            for (k, sample) in samples.iter().enumerate().skip(1) {
                sum += 2.0 * sample * (PI * k as f64 * order / nodes as f64).cos();
            }
            *coefficient = sum / (2 * nodes) as f64;
        }

        WeidemanExpansion {
            scale,
            coefficients,
        }
    })
}

/// Faddeeva function `w(z) = exp(-z^2) erfc(-iz)` for `Im(z) >= 0`.
pub fn faddeeva(z: Complex64) -> Result<Complex64, VoigtError> {
    if z.im < 0.0 || !z.re.is_finite() || !z.im.is_finite() {
        return Err(VoigtError::LowerHalfPlane { value: z });
    }

    let expansion = weideman_expansion();
    let scale = Complex64::new(expansion.scale, 0.0);
    let iz = Complex64::new(-z.im, z.re);
    let denominator = scale - iz;
    let mobius = (scale + iz) / denominator;

    let mut polynomial = Complex64::new(0.0, 0.0);
    for coefficient in expansion.coefficients.iter().rev() {
        polynomial = polynomial * mobius + *coefficient;
    }

    let inv_sqrt_pi = 1.0 / PI.sqrt();
    Ok(2.0 * polynomial / (denominator * denominator) + inv_sqrt_pi / denominator)
}

/// Voigt profile with unit area scaled by `amplitude`.
pub fn voigt_profile(
    x: f64,
    amplitude: f64,
    center: f64,
    sigma: f64,
    gamma: f64,
) -> Result<f64, VoigtError> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(VoigtError::InvalidSigma { value: sigma });
    }
    if !gamma.is_finite() || gamma < 0.0 {
        return Err(VoigtError::InvalidGamma { value: gamma });
    }

    let norm = sigma * std::f64::consts::SQRT_2;
    let z = Complex64::new((x - center) / norm, gamma / norm);
    let w = faddeeva(z)?;
    Ok(amplitude * w.re / (sigma * (2.0 * PI).sqrt()))
}

#[cfg(test)]
mod tests {
    use super::{VoigtError, faddeeva, voigt_profile};
    use num_complex::Complex64;

    #[test]
    fn faddeeva_matches_reference_values() {
        let origin = faddeeva(Complex64::new(0.0, 0.0)).expect("w(0)");
        assert!((origin.re - 1.0).abs() < 1.0e-9);
        assert!(origin.im.abs() < 1.0e-9);

        let imaginary = faddeeva(Complex64::new(0.0, 1.0)).expect("w(i)");
        assert!((imaginary.re - 0.427_583_576_155_807).abs() < 1.0e-8);
        assert!(imaginary.im.abs() < 1.0e-9);

        let real = faddeeva(Complex64::new(1.0, 0.0)).expect("w(1)");
        assert!((real.re - 0.367_879_441_171_442_3).abs() < 1.0e-8);
        assert!((real.im - 0.607_157_705_841_393_7).abs() < 1.0e-8);
    }

    #[test]
    fn faddeeva_rejects_lower_half_plane() {
        let error = faddeeva(Complex64::new(0.5, -0.1)).expect_err("lower half plane");
        assert!(matches!(error, VoigtError::LowerHalfPlane { .. }));
    }

    #[test]
    fn voigt_reduces_to_gaussian_without_lorentzian_width() {
        let sigma = 0.7;
        let value = voigt_profile(0.3, 2.0, 0.0, sigma, 0.0).expect("voigt");
        let gaussian =
            2.0 * (-(0.3_f64 * 0.3) / (2.0 * sigma * sigma)).exp()
                / (sigma * (2.0 * std::f64::consts::PI).sqrt());
        assert!((value - gaussian).abs() < 1.0e-8);
    }

    #[test]
    fn voigt_is_symmetric_and_area_normalized() {
        let left = voigt_profile(-0.4, 1.0, 0.0, 0.2, 0.1).expect("left");
        let right = voigt_profile(0.4, 1.0, 0.0, 0.2, 0.1).expect("right");
        assert!((left - right).abs() < 1.0e-12);

        let step = 0.001;
        let area: f64 = (-40_000..=40_000)
            .map(|index| voigt_profile(index as f64 * step, 1.0, 0.0, 0.2, 0.1).expect("sample"))
            .sum::<f64>()
            * step;
        assert!((area - 1.0).abs() < 2.0e-3, "area was {area}");
    }

    #[test]
    fn voigt_rejects_invalid_widths() {
        assert!(matches!(
            voigt_profile(0.0, 1.0, 0.0, 0.0, 0.1),
            Err(VoigtError::InvalidSigma { .. })
        ));
        assert!(matches!(
            voigt_profile(0.0, 1.0, 0.0, 1.0, -0.1),
            Err(VoigtError::InvalidGamma { .. })
        ));
    }
}
