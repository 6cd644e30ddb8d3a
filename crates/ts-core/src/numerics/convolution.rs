/// Relative kernel magnitude below which taps are dropped from the support.
const KERNEL_SUPPORT_CUTOFF: f64 = 1.0e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelConvolutionInput<'a> {
    pub signal: &'a [f64],
    pub kernel: &'a [f64],
    /// Kernel tap aligned with each output sample; the middle tap when `None`.
    pub center: Option<usize>,
}

impl<'a> KernelConvolutionInput<'a> {
    pub fn new(signal: &'a [f64], kernel: &'a [f64]) -> Self {
        Self {
            signal,
            kernel,
            center: None,
        }
    }

    pub fn centered_at(self, center: usize) -> Self {
        Self {
            center: Some(center),
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvolutionError {
    #[error("convolution requires a non-empty signal and kernel")]
    Empty,
    #[error("kernel value must be finite at index {index}, got {value}")]
    NonFiniteKernel { index: usize, value: f64 },
    #[error("kernel must have a non-zero sum")]
    ZeroKernelSum,
    #[error("kernel centre {center} is outside a kernel of {len} taps")]
    CenterOutOfRange { center: usize, len: usize },
}

/// Kernel rescaled to unit sum.
pub fn normalize_kernel(kernel: &[f64]) -> Result<Vec<f64>, ConvolutionError> {
    if kernel.is_empty() {
        return Err(ConvolutionError::Empty);
    }
    if let Some((index, value)) = kernel
        .iter()
        .copied()
        .enumerate()
        .find(|(_, value)| !value.is_finite())
    {
        return Err(ConvolutionError::NonFiniteKernel { index, value });
    }

    let sum = super::stable_sum(kernel);
    if sum == 0.0 {
        return Err(ConvolutionError::ZeroKernelSum);
    }
    Ok(kernel.iter().map(|value| value / sum).collect())
}

/// Discrete convolution returning `signal.len()` samples, with the kernel centred on
/// `input.center` or, by default, index `(kernel.len() - 1) / 2`.
pub fn convolve_same(input: KernelConvolutionInput<'_>) -> Result<Vec<f64>, ConvolutionError> {
    let KernelConvolutionInput {
        signal,
        kernel,
        center,
    } = input;
    if signal.is_empty() || kernel.is_empty() {
        return Err(ConvolutionError::Empty);
    }
    let center = center.unwrap_or((kernel.len() - 1) / 2);
    if center >= kernel.len() {
        return Err(ConvolutionError::CenterOutOfRange {
            center,
            len: kernel.len(),
        });
    }

    let peak = kernel.iter().fold(0.0_f64, |peak, value| peak.max(value.abs()));
    let cutoff = peak * KERNEL_SUPPORT_CUTOFF;
    let first = kernel.iter().position(|value| value.abs() > cutoff).unwrap_or(0);
    let last = kernel
        .iter()
        .rposition(|value| value.abs() > cutoff)
        .unwrap_or(kernel.len() - 1);
    let center = center as isize;

    let mut output = vec![0.0; signal.len()];
    for (target, value) in output.iter_mut().enumerate() {
        let mut sum = 0.0;
        for (tap, weight) in kernel.iter().enumerate().take(last + 1).skip(first) {
            let source = target as isize + center - tap as isize;
            if source >= 0 && (source as usize) < signal.len() {
                sum += signal[source as usize] * weight;
            }
        }
        *value = sum;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::{ConvolutionError, KernelConvolutionInput, convolve_same, normalize_kernel};

    #[test]
    fn delta_kernel_is_identity() {
        let signal = [1.0, 2.0, 3.0, 4.0];
        let output =
            convolve_same(KernelConvolutionInput::new(&signal, &[0.0, 1.0, 0.0])).expect("conv");
        assert_eq!(output, signal.to_vec());
    }

    #[test]
    fn off_centre_kernel_shifts_signal() {
        let signal = [0.0, 1.0, 0.0, 0.0];
        let output =
            convolve_same(KernelConvolutionInput::new(&signal, &[0.0, 0.0, 1.0])).expect("conv");
        assert_eq!(output, vec![0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn explicit_centre_aligns_even_kernel_peak() {
        let signal = [0.0, 1.0, 0.0, 0.0];
        let kernel = [0.0, 0.0, 1.0, 0.0];
        let default = convolve_same(KernelConvolutionInput::new(&signal, &kernel)).expect("conv");
        assert_eq!(default, vec![0.0, 0.0, 1.0, 0.0]);

        let aligned = convolve_same(KernelConvolutionInput::new(&signal, &kernel).centered_at(2))
            .expect("conv");
        assert_eq!(aligned, signal.to_vec());

        assert_eq!(
            convolve_same(KernelConvolutionInput::new(&signal, &kernel).centered_at(4)),
            Err(ConvolutionError::CenterOutOfRange { center: 4, len: 4 })
        );
    }

    #[test]
    fn box_kernel_smooths_and_conserves_interior_area() {
        let signal = [0.0, 0.0, 3.0, 0.0, 0.0];
        let kernel = normalize_kernel(&[1.0, 1.0, 1.0]).expect("kernel");
        let output = convolve_same(KernelConvolutionInput::new(&signal, &kernel)).expect("conv");
        for (actual, expected) in output.iter().zip([0.0, 1.0, 1.0, 1.0, 0.0]) {
            assert!((actual - expected).abs() < 1.0e-12);
        }
    }

    #[test]
    fn normalize_rejects_degenerate_kernels() {
        assert_eq!(normalize_kernel(&[]), Err(ConvolutionError::Empty));
        assert_eq!(normalize_kernel(&[1.0, -1.0]), Err(ConvolutionError::ZeroKernelSum));
        assert!(matches!(
            normalize_kernel(&[1.0, f64::NAN]),
            Err(ConvolutionError::NonFiniteKernel { index: 1, .. })
        ));
    }
}
