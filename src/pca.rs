// Principal component analysis (PCA) driver

use crate::covariance::center_and_covariance_in_place;
use crate::error::{PcaError, Result};
use crate::linalg_backends::{top_eigenpairs, BackendSelectiveEigh, LinAlgBackendProvider};
use crate::stats::{divide_columns_in_place, subtract_in_place};
use log::{debug, info, warn};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

/// Standard deviations at or below this value count as zero variance.
pub const ZERO_VARIANCE_THRESHOLD: f32 = 1e-7;

/// What to do with columns whose standard deviation is (numerically) zero when whitening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZeroVariancePolicy {
    /// Fail with [`PcaError::ZeroVariance`].
    #[default]
    Reject,
    /// Leave such columns unscaled (scale factor 1.0) and log a warning.
    Unit,
}

/// Parameters of a PCA reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PcaConfig {
    /// Requested output dimension L. Values above the input dimension D are
    /// clamped to D, which turns the reduction into a basis rotation.
    pub target_dimension: usize,
    /// Divide each centered column by its standard deviation before projecting.
    pub whiten: bool,
    pub zero_variance: ZeroVariancePolicy,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig {
            target_dimension: 64,
            whiten: true,
            zero_variance: ZeroVariancePolicy::Reject,
        }
    }
}

impl PcaConfig {
    pub fn new(target_dimension: usize) -> Self {
        Self {
            target_dimension,
            ..Self::default()
        }
    }

    pub fn with_whitening(mut self, whiten: bool) -> Self {
        self.whiten = whiten;
        self
    }

    pub fn with_zero_variance_policy(mut self, policy: ZeroVariancePolicy) -> Self {
        self.zero_variance = policy;
        self
    }
}

/// A fitted projection: the statistics removed from the training data and the
/// principal components it was projected onto.
///
/// Models can be applied to new vectors with [`PcaModel::transform`] and
/// persisted with [`PcaModel::save_model`] / [`PcaModel::load_model`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PcaModel {
    /// Principal components as columns, largest eigenvalue first.
    /// Shape: (n_features, n_components)
    components: Array2<f32>,
    /// Eigenvalues of the covariance matrix belonging to `components`, non-increasing.
    /// Shape: (n_components)
    eigenvalues: Array1<f32>,
    /// Column mean of the training data.
    /// Shape: (n_features)
    mean: Array1<f32>,
    /// Per-column divisor applied after centering: the standard deviations when
    /// whitening, ones otherwise. Always positive and finite.
    /// Shape: (n_features)
    scale: Array1<f32>,
}

impl PcaModel {
    /// Builds a model from precomputed parts.
    ///
    /// # Errors
    /// Returns an error if shapes disagree, if `scale` has non-positive or
    /// non-finite entries, or if `eigenvalues` has negative or non-finite entries.
    pub fn with_model(
        components: Array2<f32>,
        eigenvalues: Array1<f32>,
        mean: Array1<f32>,
        scale: Array1<f32>,
    ) -> Result<Self> {
        let model = Self {
            components,
            eigenvalues,
            mean,
            scale,
        };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let n_features = self.components.nrows();
        if self.mean.len() != n_features {
            return Err(PcaError::LengthMismatch {
                what: "model mean",
                expected: n_features,
                actual: self.mean.len(),
            });
        }
        if self.scale.len() != n_features {
            return Err(PcaError::LengthMismatch {
                what: "model scale",
                expected: n_features,
                actual: self.scale.len(),
            });
        }
        if self.eigenvalues.len() != self.components.ncols() {
            return Err(PcaError::LengthMismatch {
                what: "model eigenvalues",
                expected: self.components.ncols(),
                actual: self.eigenvalues.len(),
            });
        }
        if self.scale.iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(PcaError::NonFinite {
                what: "model scale (must be positive and finite)",
            });
        }
        if self.eigenvalues.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(PcaError::NonFinite {
                what: "model eigenvalues (must be non-negative and finite)",
            });
        }
        if self.components.iter().chain(self.mean.iter()).any(|v| !v.is_finite()) {
            return Err(PcaError::NonFinite {
                what: "model components or mean",
            });
        }
        Ok(())
    }

    /// Principal components as columns, shape (n_features, n_components).
    pub fn components(&self) -> &Array2<f32> {
        &self.components
    }

    /// Variance captured by each component, largest first.
    pub fn eigenvalues(&self) -> &Array1<f32> {
        &self.eigenvalues
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f32> {
        &self.scale
    }

    pub fn num_features(&self) -> usize {
        self.components.nrows()
    }

    pub fn num_components(&self) -> usize {
        self.components.ncols()
    }

    /// Centers, scales and projects `data` (m_samples x n_features) onto the components.
    ///
    /// `data` is consumed and reused as scratch space.
    ///
    /// # Errors
    /// Returns an error if the feature dimension of `data` does not match the model.
    pub fn transform(&self, mut data: Array2<f32>) -> Result<Array2<f32>> {
        if data.ncols() != self.num_features() {
            return Err(PcaError::LengthMismatch {
                what: "feature dimension of data to transform",
                expected: self.num_features(),
                actual: data.ncols(),
            });
        }
        if data.nrows() == 0 {
            return Ok(Array2::zeros((0, self.num_components())));
        }
        subtract_in_place(data.view_mut(), self.mean.view())?;
        divide_columns_in_place(data.view_mut(), self.scale.view())?;

        let mut projected = Array2::<f32>::zeros((data.nrows(), self.num_components()));
        general_mat_mul(1.0, &data, &self.components, 0.0, &mut projected);
        Ok(projected)
    }

    /// Saves the model to `path` using bincode.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| PcaError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| PcaError::Serialization(format!("failed to encode PCA model: {}", e)))?;
        debug!(
            "Saved {}x{} PCA model to {}",
            self.num_features(),
            self.num_components(),
            path.display()
        );
        Ok(())
    }

    /// Loads a model previously written by [`PcaModel::save_model`] and validates it.
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PcaError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let model: PcaModel =
            bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
                .map_err(|e| PcaError::Serialization(format!("failed to decode PCA model: {}", e)))?;
        model.validate()?;
        Ok(model)
    }
}

/// Result of [`PcaReducer::reduce`].
#[derive(Debug, Clone)]
pub struct Reduction {
    /// Input rows expressed in the principal basis. Shape: (n_samples, n_components)
    pub projected: Array2<f32>,
    pub model: PcaModel,
}

impl Reduction {
    pub fn num_components(&self) -> usize {
        self.model.num_components()
    }

    /// Principal components, shape (n_features, n_components).
    pub fn components(&self) -> &Array2<f32> {
        self.model.components()
    }

    pub fn into_parts(self) -> (Array2<f32>, PcaModel) {
        (self.projected, self.model)
    }
}

/// Runs covariance PCA with a selective eigensolve of only the top components.
#[derive(Debug, Clone)]
pub struct PcaReducer<B = LinAlgBackendProvider<f32>> {
    config: PcaConfig,
    backend: B,
}

impl PcaReducer {
    /// Reducer using the eigensolver chosen by the crate features.
    pub fn new(config: PcaConfig) -> Self {
        Self {
            config,
            backend: LinAlgBackendProvider::new(),
        }
    }
}

impl<B: BackendSelectiveEigh<f32>> PcaReducer<B> {
    pub fn with_backend(config: PcaConfig, backend: B) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    /// Reduces `data` (n_samples x n_features) to `min(target_dimension, n_features)` dimensions.
    ///
    /// Steps: mean-center and form the covariance `C`; take per-column standard
    /// deviations from `diag(C)`; ask the eigensolver only for the top-L ranks of
    /// `C`; flip them into descending order; whiten the centered data (if
    /// configured); project onto the components.
    ///
    /// `data` is consumed: its buffer holds the centered (and whitened) values
    /// during the computation and is released afterwards.
    ///
    /// Tied eigenvalues make the basis non-unique: any orthonormal basis of the
    /// tied subspace is a valid answer.
    ///
    /// # Errors
    /// `InvalidDimension` for a zero target or zero-width input,
    /// `InsufficientRows` for fewer than two rows, `ZeroVariance` for constant
    /// columns under [`ZeroVariancePolicy::Reject`] while whitening,
    /// `NonFinite` for a non-finite covariance, and eigensolver failures.
    pub fn reduce(&self, mut data: Array2<f32>) -> Result<Reduction> {
        let (n_samples, n_features) = data.dim();
        if self.config.target_dimension == 0 {
            return Err(PcaError::InvalidDimension { dimension: 0 });
        }
        if n_features == 0 {
            return Err(PcaError::InvalidDimension { dimension: 0 });
        }
        if n_samples < 2 {
            return Err(PcaError::InsufficientRows {
                rows: n_samples,
                required: 2,
            });
        }
        let n_components = self.config.target_dimension.min(n_features);
        if n_components < self.config.target_dimension {
            debug!(
                "Target dimension {} exceeds input dimension {}; keeping all {} components",
                self.config.target_dimension, n_features, n_components
            );
        }
        info!(
            "Reducing {} samples from {} to {} dimensions (whiten = {})",
            n_samples, n_features, n_components, self.config.whiten
        );

        let covariance_start_time = Instant::now();
        let covariance = center_and_covariance_in_place(&mut data)?;
        if covariance.matrix.iter().any(|v| !v.is_finite()) {
            return Err(PcaError::NonFinite {
                what: "covariance matrix",
            });
        }
        info!("Computed covariance matrix in {:?}", covariance_start_time.elapsed());

        let standard_deviations = covariance.variances().mapv(|v| v.max(0.0).sqrt());
        let scale = if self.config.whiten {
            self.sanitize_scale(standard_deviations)?
        } else {
            Array1::ones(n_features)
        };

        let eigensolve_start_time = Instant::now();
        let eigen = top_eigenpairs(
            &self.backend,
            &covariance.matrix,
            n_features - n_components + 1,
            n_features,
        )?;
        info!(
            "Extracted top {} of {} eigenpairs in {:?}",
            n_components,
            n_features,
            eigensolve_start_time.elapsed()
        );

        // The solver returns ascending eigenvalues; principal components go largest first.
        let eigenvalues = eigen.eigenvalues.slice(s![..;-1]).mapv(|v| v.max(0.0));
        let components = eigen
            .eigenvectors
            .slice(s![.., ..;-1])
            .as_standard_layout()
            .into_owned();

        let projection_start_time = Instant::now();
        if self.config.whiten {
            divide_columns_in_place(data.view_mut(), scale.view())?;
        }
        let mut projected = Array2::<f32>::zeros((n_samples, n_components));
        general_mat_mul(1.0, &data, &components, 0.0, &mut projected);
        drop(data);
        info!("Projected data onto principal components in {:?}", projection_start_time.elapsed());

        Ok(Reduction {
            projected,
            model: PcaModel {
                components,
                eigenvalues,
                mean: covariance.mean,
                scale,
            },
        })
    }

    fn sanitize_scale(&self, standard_deviations: Array1<f32>) -> Result<Array1<f32>> {
        let degenerate_columns: Vec<usize> = standard_deviations
            .iter()
            .enumerate()
            .filter(|&(_, &s)| !s.is_finite() || s <= ZERO_VARIANCE_THRESHOLD)
            .map(|(j, _)| j)
            .collect();
        if degenerate_columns.is_empty() {
            return Ok(standard_deviations);
        }
        match self.config.zero_variance {
            ZeroVariancePolicy::Reject => Err(PcaError::ZeroVariance {
                columns: degenerate_columns,
            }),
            ZeroVariancePolicy::Unit => {
                warn!(
                    "{} column(s) have zero variance and are left unscaled: {:?}",
                    degenerate_columns.len(),
                    degenerate_columns
                );
                Ok(standard_deviations
                    .mapv(|s| if s.is_finite() && s > ZERO_VARIANCE_THRESHOLD { s } else { 1.0 }))
            }
        }
    }
}

/// Reduces `data` to `target_dimension` dimensions with the default configuration.
pub fn reduce(data: Array2<f32>, target_dimension: usize) -> Result<Reduction> {
    PcaReducer::new(PcaConfig::new(target_dimension)).reduce(data)
}
