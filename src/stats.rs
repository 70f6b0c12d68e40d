// src/stats.rs

//! Column/row reductions and in-place row arithmetic over N x D feature matrices.
//!
//! All sums accumulate in `f32` without compensation. Loops run on the rayon
//! pool; results may differ from a serial pass by float reassociation only.

use crate::error::{PcaError, Result};
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut2, Axis, Zip};
use rayon::prelude::*;

/// Mean of each column of `matrix` (length `ncols`).
///
/// # Errors
/// `InsufficientRows` when `matrix` has no rows.
pub fn column_mean(matrix: ArrayView2<'_, f32>) -> Result<Array1<f32>> {
    let num_rows = matrix.nrows();
    if num_rows == 0 {
        return Err(PcaError::InsufficientRows {
            rows: 0,
            required: 1,
        });
    }
    let means: Vec<f32> = matrix
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|column| column.iter().sum::<f32>() / num_rows as f32)
        .collect();
    Ok(Array1::from(means))
}

/// Mean of each row of `matrix` (length `nrows`).
///
/// # Errors
/// `InvalidDimension` when `matrix` has no columns.
pub fn row_mean(matrix: ArrayView2<'_, f32>) -> Result<Array1<f32>> {
    let num_columns = matrix.ncols();
    if num_columns == 0 {
        return Err(PcaError::InvalidDimension { dimension: 0 });
    }
    let means: Vec<f32> = matrix
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| row.iter().sum::<f32>() / num_columns as f32)
        .collect();
    Ok(Array1::from(means))
}

/// Subtracts `vector` from every row of `matrix`, mutating it.
pub fn subtract_in_place(
    mut matrix: ArrayViewMut2<'_, f32>,
    vector: ArrayView1<'_, f32>,
) -> Result<()> {
    if vector.len() != matrix.ncols() {
        return Err(PcaError::LengthMismatch {
            what: "row vector to subtract",
            expected: matrix.ncols(),
            actual: vector.len(),
        });
    }
    matrix
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            Zip::from(&mut row)
                .and(&vector)
                .for_each(|value, &offset| *value -= offset);
        });
    Ok(())
}

/// Divides column `j` of `matrix` by `divisors[j]`, mutating it.
pub fn divide_columns_in_place(
    mut matrix: ArrayViewMut2<'_, f32>,
    divisors: ArrayView1<'_, f32>,
) -> Result<()> {
    if divisors.len() != matrix.ncols() {
        return Err(PcaError::LengthMismatch {
            what: "column divisors",
            expected: matrix.ncols(),
            actual: divisors.len(),
        });
    }
    matrix
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .for_each(|mut row| {
            Zip::from(&mut row)
                .and(&divisors)
                .for_each(|value, &divisor| *value /= divisor);
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn column_and_row_means_of_small_matrix() {
        let data = array![[1.0f32, 1.0], [1.0, 3.0], [3.0, 3.0], [3.0, 1.0]];
        assert_eq!(column_mean(data.view()).unwrap(), array![2.0f32, 2.0]);
        assert_eq!(row_mean(data.view()).unwrap(), array![1.0f32, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn subtracting_the_mean_centers_the_square() {
        let mut data = array![[1.0f32, 1.0], [1.0, 3.0], [3.0, 3.0], [3.0, 1.0]];
        let mean = column_mean(data.view()).unwrap();
        subtract_in_place(data.view_mut(), mean.view()).unwrap();
        assert_eq!(data, array![[-1.0f32, -1.0], [-1.0, 1.0], [1.0, 1.0], [1.0, -1.0]]);
    }

    #[test]
    fn centering_twice_is_a_fixed_point() {
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let mut data = Array2::from_shape_fn((500, 12), |_| rng.gen_range(-50.0f32..150.0));

        let first_mean = column_mean(data.view()).unwrap();
        subtract_in_place(data.view_mut(), first_mean.view()).unwrap();
        let second_mean = column_mean(data.view()).unwrap();
        for &m in second_mean.iter() {
            assert_abs_diff_eq!(m, 0.0, epsilon = 1e-3);
        }

        let before = data.clone();
        subtract_in_place(data.view_mut(), second_mean.view()).unwrap();
        for (a, b) in before.iter().zip(data.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-3);
        }
    }

    #[test]
    fn parallel_column_mean_matches_serial_sum() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let data = Array2::from_shape_fn((257, 9), |_| rng.gen_range(0.0f32..1.0));
        let parallel = column_mean(data.view()).unwrap();
        for (j, column) in data.axis_iter(Axis(1)).enumerate() {
            let serial: f64 = column.iter().map(|&x| x as f64).sum::<f64>() / 257.0;
            assert_abs_diff_eq!(parallel[j] as f64, serial, epsilon = 1e-4);
        }
    }

    #[test]
    fn divide_columns_scales_each_column() {
        let mut data = array![[2.0f32, 9.0], [4.0, 3.0]];
        divide_columns_in_place(data.view_mut(), array![2.0f32, 3.0].view()).unwrap();
        assert_eq!(data, array![[1.0f32, 3.0], [2.0, 1.0]]);
    }

    #[test]
    fn shape_errors_are_reported() {
        let mut data = Array2::<f32>::zeros((3, 2));
        assert!(matches!(
            subtract_in_place(data.view_mut(), array![1.0f32].view()),
            Err(PcaError::LengthMismatch { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            column_mean(Array2::<f32>::zeros((0, 4)).view()),
            Err(PcaError::InsufficientRows { rows: 0, .. })
        ));
        assert!(matches!(
            row_mean(Array2::<f32>::zeros((4, 0)).view()),
            Err(PcaError::InvalidDimension { dimension: 0 })
        ));
    }
}
