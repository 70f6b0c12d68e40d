// src/covariance.rs

use crate::error::{PcaError, Result};
use crate::stats::{column_mean, subtract_in_place};
use log::debug;
use ndarray::linalg::general_mat_mul;
use ndarray::{Array1, Array2};

/// Sample covariance of a feature matrix together with the mean that was removed.
#[derive(Debug, Clone)]
pub struct Covariance {
    /// D x D symmetric matrix `X^T X / (N - 1)` of the centered data.
    pub matrix: Array2<f32>,
    /// Column mean subtracted from the data (length D).
    pub mean: Array1<f32>,
}

impl Covariance {
    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }

    /// Per-column variances (the diagonal).
    pub fn variances(&self) -> Array1<f32> {
        self.matrix.diag().to_owned()
    }
}

/// Mean-centers `data` in place and returns its covariance matrix.
///
/// After this call `data` holds the centered values; callers that need the
/// original values must keep their own copy. The covariance is computed with a
/// single `X^T * X` product scaled by `1 / (N - 1)` into a fresh D x D buffer.
///
/// # Errors
/// `InsufficientRows` when `data` has fewer than two rows, `InvalidDimension`
/// when it has no columns.
pub fn center_and_covariance_in_place(data: &mut Array2<f32>) -> Result<Covariance> {
    let (num_rows, dimension) = data.dim();
    if num_rows < 2 {
        return Err(PcaError::InsufficientRows {
            rows: num_rows,
            required: 2,
        });
    }
    if dimension == 0 {
        return Err(PcaError::InvalidDimension { dimension });
    }

    let mean = column_mean(data.view())?;
    subtract_in_place(data.view_mut(), mean.view())?;

    let mut matrix = Array2::<f32>::zeros((dimension, dimension));
    let alpha = 1.0f32 / (num_rows - 1) as f32;
    general_mat_mul(alpha, &data.t(), &*data, 0.0, &mut matrix);
    debug!(
        "Computed {}x{} covariance from {} centered rows",
        dimension, dimension, num_rows
    );

    Ok(Covariance { matrix, mean })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Axis};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    #[test]
    fn square_has_isotropic_covariance() {
        let mut data = array![[1.0f32, 1.0], [1.0, 3.0], [3.0, 3.0], [3.0, 1.0]];
        let cov = center_and_covariance_in_place(&mut data).unwrap();

        assert_eq!(cov.mean, array![2.0f32, 2.0]);
        assert_eq!(data, array![[-1.0f32, -1.0], [-1.0, 1.0], [1.0, 1.0], [1.0, -1.0]]);
        assert_abs_diff_eq!(cov.matrix[[0, 0]], 4.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cov.matrix[[1, 1]], 4.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cov.matrix[[0, 1]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(cov.matrix[[1, 0]], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn matches_sample_covariance_of_correlated_data() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let normal = Normal::new(0.0f32, 1.0).unwrap();
        let mut data = Array2::<f32>::zeros((400, 3));
        for mut row in data.axis_iter_mut(Axis(0)) {
            let a = normal.sample(&mut rng);
            let b = normal.sample(&mut rng);
            row[0] = 3.0 * a + 10.0;
            row[1] = a + 0.5 * b;
            row[2] = -2.0 * b;
        }
        let original = data.clone();
        let cov = center_and_covariance_in_place(&mut data).unwrap();

        // Reference in f64.
        let n = original.nrows() as f64;
        let reference_mean = original.mapv(|x| x as f64).mean_axis(Axis(0)).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let mut acc = 0.0f64;
                for row in original.axis_iter(Axis(0)) {
                    acc += (row[i] as f64 - reference_mean[i]) * (row[j] as f64 - reference_mean[j]);
                }
                let expected = acc / (n - 1.0);
                assert_abs_diff_eq!(cov.matrix[[i, j]] as f64, expected, epsilon = 1e-2);
            }
        }
        // Symmetric by construction.
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(cov.matrix[[i, j]], cov.matrix[[j, i]], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn single_row_is_rejected() {
        let mut data = array![[1.0f32, 2.0, 3.0]];
        assert!(matches!(
            center_and_covariance_in_place(&mut data),
            Err(PcaError::InsufficientRows { rows: 1, required: 2 })
        ));
    }
}
