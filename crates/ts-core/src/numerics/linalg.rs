//! Small dense real systems: the normal equations of the least-squares driver.

use faer::Mat;

pub type DenseMatrix = Mat<f64>;

/// Pivots below this fraction of the largest input entry count as zero.
const RELATIVE_PIVOT_FLOOR: f64 = 1.0e-14;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LuError {
    #[error("LU factorization requires a non-empty matrix")]
    EmptyMatrix,
    #[error("LU factorization requires a square matrix, got {rows}x{cols}")]
    NonSquareMatrix { rows: usize, cols: usize },
    #[error("matrix is singular at pivot index {pivot_index}")]
    SingularMatrix { pivot_index: usize },
    #[error("right-hand side length mismatch: expected {expected}, got {actual}")]
    RhsLengthMismatch { expected: usize, actual: usize },
}

/// Row-permuted LU factors packed into one matrix; rows are addressed through `order`
/// instead of being swapped.
#[derive(Debug, Clone)]
pub struct LuDecomposition {
    packed: DenseMatrix,
    order: Vec<usize>,
}

impl LuDecomposition {
    pub fn dimension(&self) -> usize {
        self.order.len()
    }

    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
        let n = self.dimension();
        if rhs.len() != n {
            return Err(LuError::RhsLengthMismatch {
                expected: n,
                actual: rhs.len(),
            });
        }

        let mut x = vec![0.0; n];
        for i in 0..n {
            let row = self.order[i];
            let eliminated: f64 = (0..i).map(|j| self.packed[(row, j)] * x[j]).sum();
            x[i] = rhs[row] - eliminated;
        }
        for i in (0..n).rev() {
            let row = self.order[i];
            let eliminated: f64 = (i + 1..n).map(|j| self.packed[(row, j)] * x[j]).sum();
            x[i] = (x[i] - eliminated) / self.packed[(row, i)];
        }
        Ok(x)
    }

    pub fn invert(&self) -> Result<DenseMatrix, LuError> {
        let n = self.dimension();
        let mut inverse = DenseMatrix::zeros(n, n);
        let mut unit = vec![0.0; n];
        for col in 0..n {
            unit[col] = 1.0;
            let column = self.solve(&unit)?;
            unit[col] = 0.0;
            for (row, value) in column.into_iter().enumerate() {
                inverse[(row, col)] = value;
            }
        }
        Ok(inverse)
    }
}

/// Partial-pivoting LU of a square matrix.
pub fn lu_factorize(matrix: &DenseMatrix) -> Result<LuDecomposition, LuError> {
    let (rows, cols) = (matrix.nrows(), matrix.ncols());
    if rows == 0 || cols == 0 {
        return Err(LuError::EmptyMatrix);
    }
    if rows != cols {
        return Err(LuError::NonSquareMatrix { rows, cols });
    }

    let n = rows;
    let largest = (0..n)
        .flat_map(|row| (0..n).map(move |col| (row, col)))
        .fold(0.0_f64, |largest, index| largest.max(matrix[index].abs()));
    let floor = largest * RELATIVE_PIVOT_FLOOR;

    let mut packed = matrix.clone();
    let mut order: Vec<usize> = (0..n).collect();
    for k in 0..n {
        let (best, magnitude) = (k..n)
            .map(|i| (i, packed[(order[i], k)].abs()))
            .fold((k, -1.0), |best, candidate| {
                if candidate.1 > best.1 { candidate } else { best }
            });
        if !(magnitude > floor) {
            return Err(LuError::SingularMatrix { pivot_index: k });
        }
        order.swap(k, best);

        let pivot_row = order[k];
        let pivot = packed[(pivot_row, k)];
        for &row in &order[k + 1..] {
            let factor = packed[(row, k)] / pivot;
            packed[(row, k)] = factor;
            if factor == 0.0 {
                continue;
            }
            for col in k + 1..n {
                let reduced = packed[(row, col)] - factor * packed[(pivot_row, col)];
                packed[(row, col)] = reduced;
            }
        }
    }

    Ok(LuDecomposition { packed, order })
}

pub fn lu_solve(matrix: &DenseMatrix, rhs: &[f64]) -> Result<Vec<f64>, LuError> {
    lu_factorize(matrix)?.solve(rhs)
}

pub fn lu_invert(matrix: &DenseMatrix) -> Result<DenseMatrix, LuError> {
    lu_factorize(matrix)?.invert()
}

/// `JᵀJ` of a tall Jacobian.
pub fn normal_matrix(jacobian: &DenseMatrix) -> DenseMatrix {
    let n = jacobian.ncols();
    let mut normal = DenseMatrix::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let dot: f64 = (0..jacobian.nrows())
                .map(|row| jacobian[(row, i)] * jacobian[(row, j)])
                .sum();
            normal[(i, j)] = dot;
            normal[(j, i)] = dot;
        }
    }
    normal
}

/// `Jᵀv`.
pub fn transpose_apply(jacobian: &DenseMatrix, vector: &[f64]) -> Vec<f64> {
    (0..jacobian.ncols())
        .map(|col| {
            vector
                .iter()
                .enumerate()
                .map(|(row, value)| jacobian[(row, col)] * value)
                .sum()
        })
        .collect()
}

/// Inverse of a symmetric positive matrix, inverted after scaling to a unit diagonal so
/// parameters of very different magnitude do not read as singular.
pub fn symmetric_inverse(matrix: &DenseMatrix) -> Result<DenseMatrix, LuError> {
    let n = matrix.nrows();
    let mut diagonal = Vec::with_capacity(n);
    for index in 0..n.min(matrix.ncols()) {
        let value = matrix[(index, index)];
        if !(value > 0.0 && value.is_finite()) {
            return Err(LuError::SingularMatrix { pivot_index: index });
        }
        diagonal.push(value.sqrt());
    }

    let mut scaled = matrix.clone();
    for row in 0..scaled.nrows() {
        for col in 0..scaled.ncols() {
            scaled[(row, col)] /= diagonal.get(row).copied().unwrap_or(1.0)
                * diagonal.get(col).copied().unwrap_or(1.0);
        }
    }

    let mut inverse = lu_invert(&scaled)?;
    for row in 0..n {
        for col in 0..n {
            inverse[(row, col)] /= diagonal[row] * diagonal[col];
        }
    }
    Ok(inverse)
}
