// src/linalg_backends.rs

use crate::error::{PcaError, Result};
use float_cmp::approx_eq;
use log::{debug, trace};
use ndarray::{s, Array1, Array2, ShapeBuilder};
use ndarray_linalg::{Eigh, UPLO};
use std::marker::PhantomData;

/// Relative gap below which two neighbouring eigenvalues are reported as tied.
const TIE_RELATIVE_TOLERANCE: f32 = 1e-5;

/// Output of a symmetric eigendecomposition restricted to a rank window.
#[derive(Debug)]
pub struct EighOutput<F: 'static> {
    /// Eigenvalues of the window in ascending order.
    pub eigenvalues: Array1<F>,
    /// Eigenvectors as columns: `eigenvectors.column(i)` belongs to `eigenvalues[i]`.
    /// Shape: `(n, high - low + 1)`.
    pub eigenvectors: Array2<F>,
}

/// Symmetric eigensolver that can return only the eigenpairs whose ascending
/// rank lies in `[low, high]` (1-based, inclusive). Only the upper triangle of
/// `matrix` is read.
pub trait BackendSelectiveEigh<F: 'static + Copy + Send + Sync> {
    fn eigh_upper_window(&self, matrix: &Array2<F>, low: usize, high: usize) -> Result<EighOutput<F>>;
}

/// LAPACK `?syevr` with `RANGE = 'I'`: computes only the requested eigenpairs.
#[derive(Debug, Default, Copy, Clone)]
pub struct LapackSyevrBackend;

/// Full `ndarray-linalg` decomposition followed by slicing out the window.
/// Costs the whole spectrum; kept as a cross-check and a fallback backend.
#[derive(Debug, Default, Copy, Clone)]
pub struct NdarrayLinAlgBackend;

fn to_lapack_int(value: usize) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| PcaError::Eigensolver(format!("{} exceeds the LAPACK integer range", value)))
}

macro_rules! impl_lapack_syevr {
    ($float:ty, $syevr:path) => {
        impl BackendSelectiveEigh<$float> for LapackSyevrBackend {
            fn eigh_upper_window(
                &self,
                matrix: &Array2<$float>,
                low: usize,
                high: usize,
            ) -> Result<EighOutput<$float>> {
                let n = matrix.nrows();
                let k = high + 1 - low;
                let n_lapack = to_lapack_int(n)?;
                let il = to_lapack_int(low)?;
                let iu = to_lapack_int(high)?;

                // A symmetric matrix reads the same in row-major and column-major order.
                let mut a: Vec<$float> = matrix.iter().copied().collect();
                let mut w = vec![0.0 as $float; n];
                let mut z = vec![0.0 as $float; n * k];
                let mut isuppz = vec![0i32; 2 * k];
                let mut num_found = 0i32;
                let mut info = 0i32;

                let mut work_query = [0.0 as $float; 1];
                let mut iwork_query = [0i32; 1];
                // SAFETY: every buffer is sized per the ?syevr contract for n, lda = ldz = n
                // and m = iu - il + 1; lwork = liwork = -1 only writes the optimal sizes.
                unsafe {
                    $syevr(
                        b'V', b'I', b'U', n_lapack, &mut a, n_lapack, 0.0, 0.0, il, iu,
                        <$float>::MIN_POSITIVE, &mut num_found, &mut w, &mut z, n_lapack,
                        &mut isuppz, &mut work_query, -1, &mut iwork_query, -1, &mut info,
                    );
                }
                if info != 0 {
                    return Err(PcaError::Eigensolver(format!(
                        "?syevr workspace query failed with info = {}",
                        info
                    )));
                }

                let lwork = (work_query[0] as usize).max(26 * n).max(1);
                let liwork = (iwork_query[0].max(0) as usize).max(10 * n).max(1);
                let mut work = vec![0.0 as $float; lwork];
                let mut iwork = vec![0i32; liwork];
                trace!("?syevr n={} window=[{}, {}] lwork={} liwork={}", n, low, high, lwork, liwork);

                // SAFETY: as above, with work/iwork allocated to the queried sizes.
                unsafe {
                    $syevr(
                        b'V', b'I', b'U', n_lapack, &mut a, n_lapack, 0.0, 0.0, il, iu,
                        <$float>::MIN_POSITIVE, &mut num_found, &mut w, &mut z, n_lapack,
                        &mut isuppz, &mut work, to_lapack_int(lwork)?, &mut iwork,
                        to_lapack_int(liwork)?, &mut info,
                    );
                }
                if info != 0 {
                    return Err(PcaError::Eigensolver(format!("?syevr failed with info = {}", info)));
                }
                if num_found as usize != k {
                    return Err(PcaError::Eigensolver(format!(
                        "?syevr returned {} eigenpairs, expected {}",
                        num_found, k
                    )));
                }

                w.truncate(k);
                let eigenvectors = Array2::from_shape_vec((n, k).f(), z)?;
                Ok(EighOutput {
                    eigenvalues: Array1::from(w),
                    eigenvectors,
                })
            }
        }
    };
}

impl_lapack_syevr!(f32, lapack::ssyevr);
impl_lapack_syevr!(f64, lapack::dsyevr);

macro_rules! impl_ndarray_window {
    ($float:ty) => {
        impl BackendSelectiveEigh<$float> for NdarrayLinAlgBackend {
            fn eigh_upper_window(
                &self,
                matrix: &Array2<$float>,
                low: usize,
                high: usize,
            ) -> Result<EighOutput<$float>> {
                let (eigenvalues, eigenvectors) = matrix
                    .eigh(UPLO::Upper)
                    .map_err(|e| PcaError::Eigensolver(e.to_string()))?;
                Ok(EighOutput {
                    eigenvalues: eigenvalues.slice(s![low - 1..high]).to_owned(),
                    eigenvectors: eigenvectors.slice(s![.., low - 1..high]).to_owned(),
                })
            }
        }
    };
}

impl_ndarray_window!(f32);
impl_ndarray_window!(f64);

/// Dispatches to the eigensolver selected by compile-time features:
/// `?syevr` by default, the full decomposition with `backend_full_eigh`.
#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

impl<F> BackendSelectiveEigh<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    LapackSyevrBackend: BackendSelectiveEigh<F>,
    NdarrayLinAlgBackend: BackendSelectiveEigh<F>,
{
    fn eigh_upper_window(&self, matrix: &Array2<F>, low: usize, high: usize) -> Result<EighOutput<F>> {
        #[cfg(feature = "backend_full_eigh")]
        {
            NdarrayLinAlgBackend.eigh_upper_window(matrix, low, high)
        }
        #[cfg(not(feature = "backend_full_eigh"))]
        {
            LapackSyevrBackend.eigh_upper_window(matrix, low, high)
        }
    }
}

/// Eigenpairs of the symmetric `matrix` with ascending ranks `low..=high` (1-based).
///
/// Validates the window and the input, runs `backend`, and checks the result
/// shape. The window is not clamped: a request outside `[1, n]` is an error.
/// Eigenvalues come back ascending with eigenvectors as columns.
pub fn top_eigenpairs<B>(backend: &B, matrix: &Array2<f32>, low: usize, high: usize) -> Result<EighOutput<f32>>
where
    B: BackendSelectiveEigh<f32>,
{
    let (n, ncols) = matrix.dim();
    if n != ncols {
        return Err(PcaError::LengthMismatch {
            what: "columns of symmetric matrix",
            expected: n,
            actual: ncols,
        });
    }
    if low == 0 || low > high || high > n {
        return Err(PcaError::InvalidRankWindow {
            low,
            high,
            dimension: n,
        });
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(PcaError::NonFinite {
            what: "symmetric matrix passed to the eigensolver",
        });
    }

    let output = backend.eigh_upper_window(matrix, low, high)?;
    let k = high + 1 - low;
    if output.eigenvalues.len() != k || output.eigenvectors.dim() != (n, k) {
        return Err(PcaError::Eigensolver(format!(
            "backend returned {} eigenvalues and a {:?} eigenvector matrix for a window of {}",
            output.eigenvalues.len(),
            output.eigenvectors.dim(),
            k
        )));
    }

    for (rank_offset, pair) in output.eigenvalues.windows(2).into_iter().enumerate() {
        let (lower, upper) = (pair[0], pair[1]);
        let margin = TIE_RELATIVE_TOLERANCE * lower.abs().max(upper.abs());
        if approx_eq!(f32, lower, upper, epsilon = margin) {
            debug!(
                "Eigenvalues at ranks {} and {} are tied ({} vs {}); their eigenvectors are not unique",
                low + rank_offset,
                low + rank_offset + 1,
                lower,
                upper
            );
        }
    }

    Ok(output)
}
