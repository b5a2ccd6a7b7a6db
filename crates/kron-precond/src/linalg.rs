//! Host-side dense linear algebra on factor matrices.
//!
//! Factor matrices are small (bounded by the merge limit), so eigen, QR and
//! triangular work happens in `f64` on nalgebra copies. The staging buffers
//! for those copies come from a [`ScratchPool`] owned by the engine.

use candle_core::{Device, Tensor};
use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::error::PrecondResult;

const EIGEN_EPS: f64 = f64::EPSILON;
const EIGEN_MAX_ITERS: usize = 10_000;

/// Pool of `f64` staging buffers for the tensor/matrix bridge.
///
/// A buffer is owned by exactly one conversion at a time. Matrices hand
/// their storage back through [`ScratchPool::recycle`] when they are done.
#[derive(Debug)]
pub struct ScratchPool {
    buffers: Vec<Vec<f64>>,
    max_buffers: usize,
    total_acquired: usize,
    total_reused: usize,
}

/// Statistics about pool usage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub pooled_buffers: usize,
    pub total_acquired: usize,
    pub total_reused: usize,
    pub reuse_rate: f64,
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(8)
    }
}

impl ScratchPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Vec::new(),
            max_buffers: max_buffers.max(1),
            total_acquired: 0,
            total_reused: 0,
        }
    }

    /// Take a zeroed buffer of length `len`.
    ///
    /// Prefers the pooled buffer with the smallest sufficient capacity.
    pub fn acquire(&mut self, len: usize) -> Vec<f64> {
        self.total_acquired += 1;

        let best = self
            .buffers
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= len)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);

        let mut buf = match best {
            Some(i) => {
                self.total_reused += 1;
                self.buffers.swap_remove(i)
            }
            None => Vec::with_capacity(len),
        };
        buf.clear();
        buf.resize(len, 0.0);
        buf
    }

    /// Return a buffer; dropped if the pool is full.
    pub fn release(&mut self, buf: Vec<f64>) {
        if self.buffers.len() < self.max_buffers {
            self.buffers.push(buf);
        }
    }

    /// Return a finished matrix's storage to the pool.
    pub fn recycle(&mut self, m: DMatrix<f64>) {
        self.release(m.data.into());
    }

    pub fn stats(&self) -> PoolStats {
        let reuse_rate = if self.total_acquired > 0 {
            self.total_reused as f64 / self.total_acquired as f64
        } else {
            0.0
        };
        PoolStats {
            pooled_buffers: self.buffers.len(),
            total_acquired: self.total_acquired,
            total_reused: self.total_reused,
            reuse_rate,
        }
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

/// Copy a 2-D tensor into an `f64` matrix backed by a pooled buffer.
pub fn to_matrix(t: &Tensor, pool: &mut ScratchPool) -> PrecondResult<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let data = t.flatten_all()?.to_vec1::<f32>()?;
    let mut buf = pool.acquire(rows * cols);
    // nalgebra storage is column-major
    for r in 0..rows {
        for c in 0..cols {
            buf[c * rows + r] = data[r * cols + c] as f64;
        }
    }
    Ok(DMatrix::from_vec(rows, cols, buf))
}

/// Copy a matrix back into an `f32` tensor, recycling its storage.
pub fn from_matrix(m: DMatrix<f64>, device: &Device, pool: &mut ScratchPool) -> PrecondResult<Tensor> {
    let (rows, cols) = m.shape();
    let mut data = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            data.push(m[(r, c)] as f32);
        }
    }
    pool.recycle(m);
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

pub fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// Eigenvectors of a symmetric matrix, columns ordered by descending
/// eigenvalue (ties keep nalgebra's order).
///
/// `None` when the decomposition does not converge or is not finite.
pub fn sorted_eigenvectors(m: DMatrix<f64>) -> Option<(DVector<f64>, DMatrix<f64>)> {
    if !is_finite(&m) {
        return None;
    }
    let eig = SymmetricEigen::try_new(m, EIGEN_EPS, EIGEN_MAX_ITERS)?;
    if !eig.eigenvalues.iter().all(|v| v.is_finite()) || !is_finite(&eig.eigenvectors) {
        return None;
    }
    let values: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    let order = descending_order(&values);
    let n = values.len();
    let sorted_values = DVector::from_fn(n, |i, _| values[order[i]]);
    let sorted_vectors = DMatrix::from_fn(n, n, |r, c| eig.eigenvectors[(r, order[c])]);
    Some((sorted_values, sorted_vectors))
}

/// Stable permutation sorting `values` from largest to smallest.
pub fn descending_order(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].total_cmp(&values[a]));
    order
}

/// Orthonormal factor of a QR decomposition with columns signed so that
/// `diag(R) >= 0`.
pub fn qr_signed(m: DMatrix<f64>) -> DMatrix<f64> {
    let qr = m.qr();
    let r = qr.r();
    let mut q = qr.q();
    let k = r.nrows().min(r.ncols());
    for j in 0..k {
        if r[(j, j)] < 0.0 {
            q.column_mut(j).neg_mut();
        }
    }
    q
}

/// Inverse of an upper-triangular matrix; `None` if singular.
pub fn upper_triangular_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = m.nrows();
    if (0..n).any(|i| m[(i, i)] == 0.0 || !m[(i, i)].is_finite()) {
        return None;
    }
    let inv = m.solve_upper_triangular(&DMatrix::identity(n, n))?;
    is_finite(&inv).then_some(inv)
}

/// Largest absolute entry.
pub fn max_abs(m: &DMatrix<f64>) -> f64 {
    m.iter().fold(0.0f64, |acc, v| acc.max(v.abs()))
}

/// Cheap lower bound on the spectral norm of a symmetric matrix.
///
/// Starts from the column with the largest norm and applies the matrix
/// twice. `scale` is a precomputed `max_abs(m)` used for conditioning.
pub fn spectral_norm_lower_bound(m: &DMatrix<f64>, scale: f64) -> f64 {
    if scale <= 0.0 {
        return 0.0;
    }
    let a = m / scale;
    let best = (0..a.ncols())
        .map(|j| (j, a.column(j).norm_squared()))
        .max_by(|x, y| x.1.total_cmp(&y.1))
        .map(|(j, _)| j)
        .unwrap_or(0);
    let x = a.column(best).into_owned();
    let y = a.tr_mul(&x);
    let norm = y.norm();
    if norm == 0.0 {
        return 0.0;
    }
    let y = y / norm;
    (&a * y).norm() * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Result;

    fn sym(n: usize, seed: f64) -> DMatrix<f64> {
        let a = DMatrix::from_fn(n, n, |r, c| ((r * 7 + c * 3) as f64 * seed).sin());
        &a * a.transpose()
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let mut pool = ScratchPool::new(2);
        let a = pool.acquire(16);
        pool.release(a);
        let b = pool.acquire(8);
        assert_eq!(b.len(), 8);
        assert!(b.iter().all(|&v| v == 0.0));
        let stats = pool.stats();
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.total_reused, 1);
        assert!((stats.reuse_rate - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_pool_capacity_limit() {
        let mut pool = ScratchPool::new(1);
        pool.release(vec![0.0; 4]);
        pool.release(vec![0.0; 4]);
        assert_eq!(pool.stats().pooled_buffers, 1);
        pool.clear();
        assert_eq!(pool.stats().pooled_buffers, 0);
    }

    #[test]
    fn test_tensor_matrix_roundtrip() -> Result<()> {
        let device = Device::Cpu;
        let mut pool = ScratchPool::default();
        let t = Tensor::arange(0f32, 6.0, &device)?.reshape((2, 3))?;
        let m = to_matrix(&t, &mut pool).unwrap();
        assert_eq!(m[(1, 0)], 3.0);
        assert_eq!(m[(0, 2)], 2.0);
        let back = from_matrix(m, &device, &mut pool).unwrap();
        assert_eq!(back.to_vec2::<f32>()?, t.to_vec2::<f32>()?);
        assert_eq!(pool.stats().pooled_buffers, 1);
        Ok(())
    }

    #[test]
    fn test_sorted_eigenvectors_descending() {
        let m = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, 5.0, 3.0]));
        let (values, vectors) = sorted_eigenvectors(m).unwrap();
        for (got, want) in values.iter().zip([5.0, 3.0, 1.0]) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }
        assert!((vectors[(1, 0)].abs() - 1.0).abs() < 1e-12);
        assert!((vectors[(2, 1)].abs() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_non_finite_eigen_rejected() {
        let mut m = sym(3, 0.3);
        m[(0, 1)] = f64::NAN;
        assert!(sorted_eigenvectors(m).is_none());
    }

    #[test]
    fn test_qr_signed_is_orthonormal_with_positive_r() {
        let m = sym(5, 0.7) + DMatrix::identity(5, 5);
        let q = qr_signed(m.clone());
        let qtq = q.transpose() * &q;
        assert!((qtq - DMatrix::identity(5, 5)).norm() < 1e-10);
        let r = q.transpose() * m;
        for j in 0..5 {
            assert!(r[(j, j)] >= -1e-12, "diag(R)[{}] = {}", j, r[(j, j)]);
        }
    }

    #[test]
    fn test_descending_order_is_stable() {
        assert_eq!(descending_order(&[1.0, 2.0, 2.0, 0.5]), vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_triangular_inverse() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 0.0, 4.0]);
        let inv = upper_triangular_inverse(&m).unwrap();
        assert!((&m * &inv - DMatrix::identity(2, 2)).norm() < 1e-12);
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 0.0]);
        assert!(upper_triangular_inverse(&singular).is_none());
    }

    #[test]
    fn test_spectral_lower_bound() {
        let m = sym(6, 0.45);
        let exact = SymmetricEigen::new(m.clone())
            .eigenvalues
            .iter()
            .fold(0.0f64, |acc, v| acc.max(v.abs()));
        let lb = spectral_norm_lower_bound(&m, max_abs(&m));
        assert!(lb <= exact * (1.0 + 1e-9), "{} > {}", lb, exact);
        // the largest column alone already bounds it from below by exact / sqrt(n)
        assert!(lb >= exact / 6f64.sqrt(), "{} too loose vs {}", lb, exact);
        assert_eq!(spectral_norm_lower_bound(&DMatrix::zeros(3, 3), 0.0), 0.0);
    }
}
