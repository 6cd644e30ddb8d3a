pub mod convolution;
pub mod least_squares;
pub mod linalg;
pub mod voigt;

pub use convolution::{ConvolutionError, KernelConvolutionInput, convolve_same, normalize_kernel};
pub use least_squares::{
    Bound, LeastSquaresConfig, LeastSquaresError, LeastSquaresProblem, LeastSquaresSolution,
    levenberg_marquardt,
};
pub use linalg::{DenseMatrix, LuDecomposition, LuError, lu_factorize, lu_invert, lu_solve};
pub use voigt::{VoigtError, faddeeva, voigt_profile};

/// Compensated (Kahan) running sum.
#[derive(Debug, Default, Clone, Copy)]
struct CompensatedSum {
    total: f64,
    carry: f64,
}

impl CompensatedSum {
    fn push(&mut self, value: f64) {
        let adjusted = value - self.carry;
        let total = self.total + adjusted;
        self.carry = (total - self.total) - adjusted;
        self.total = total;
    }
}

pub fn stable_sum(values: &[f64]) -> f64 {
    values
        .iter()
        .fold(CompensatedSum::default(), |mut sum, &value| {
            sum.push(value);
            sum
        })
        .total
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| stable_sum(values) / values.len() as f64)
}

/// `count` evenly spaced points from `start` to exactly `end`.
pub fn linear_grid(start: f64, end: f64, count: usize) -> Option<Vec<f64>> {
    let last = count.checked_sub(1).filter(|&last| last > 0)?;
    let step = (end - start) / last as f64;
    Some(
        (0..count)
            .map(|index| if index == last { end } else { start + step * index as f64 })
            .collect(),
    )
}

/// Refines `axis` to `(len - 1) * scale + 1` evenly spaced points over the same span.
pub fn upsample_grid(axis: &[f64], scale: usize) -> Option<Vec<f64>> {
    if scale == 0 || axis.len() < 2 {
        return None;
    }
    let count = (axis.len() - 1) * scale + 1;
    linear_grid(axis[0], axis[axis.len() - 1], count)
}

/// Piecewise-linear lookup on an ascending grid, held constant past either end.
pub fn interpolate_linear(x: f64, knots: &[f64], values: &[f64]) -> Option<f64> {
    if knots.len() < 2 || knots.len() != values.len() || knots.windows(2).any(|w| w[1] < w[0]) {
        return None;
    }

    let upper = knots.partition_point(|&knot| knot < x);
    if upper == 0 {
        return values.first().copied();
    }
    if upper == knots.len() {
        return values.last().copied();
    }

    let (x0, x1) = (knots[upper - 1], knots[upper]);
    let (y0, y1) = (values[upper - 1], values[upper]);
    if x1 == x0 {
        return Some(y1);
    }
    Some(y0 + (x - x0) / (x1 - x0) * (y1 - y0))
}

/// Index of the element closest to `value`; first index wins on ties.
pub fn nearest_index(values: &[f64], value: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in values.iter().copied().enumerate() {
        let distance = (candidate - value).abs();
        if distance.is_nan() {
            continue;
        }
        match best {
            Some((_, best_distance)) if best_distance <= distance => {}
            _ => best = Some((index, distance)),
        }
    }
    best.map(|(index, _)| index)
}

/// Trapezoidal integral of `y` over the sample positions `x`.
pub fn trapezoid(y: &[f64], x: &[f64]) -> Option<f64> {
    if y.len() != x.len() {
        return None;
    }
    let mut sum = CompensatedSum::default();
    for (ys, xs) in y.windows(2).zip(x.windows(2)) {
        sum.push(0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]));
    }
    Some(sum.total)
}
