// Principal component analysis (PCA) of fixed-stride binary descriptor records

#![doc = include_str!("../README.md")]

pub mod covariance;
pub mod error;
pub mod linalg_backends;
pub mod pca;
pub mod record_store;
pub mod stats;


pub use error::{PcaError, Result};
pub use pca::{reduce, PcaConfig, PcaModel, PcaReducer, Reduction, ZeroVariancePolicy};
pub use record_store::{
    features_from_flat, load_features, load_records, save_features, save_records, ByteOrder,
    LoadedRecords, RecordLayout, RecordScalar,
};
