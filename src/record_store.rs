// src/record_store.rs

//! Fixed-stride binary record files accessed through memory maps.
//!
//! A record file has no header, magic number or embedded shape. Every record is
//! `header_bytes` raw bytes (an `i32` id when the header is present) followed by
//! `dimension` tightly packed scalars. The dimension and header width travel
//! out of band in a [`RecordLayout`].

use crate::error::{PcaError, Result};
use bytemuck::Pod;
use log::{debug, info, warn};
use memmap2::{Mmap, MmapMut};
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::Path;
use std::time::Instant;

/// Width of the id header written by [`save_records`] when ids are saved.
pub const ID_BYTES: usize = size_of::<i32>();

/// Byte order of ids and payload scalars on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Host byte order. This is what the descriptor tooling writes.
    #[default]
    Native,
    Little,
    Big,
}

impl ByteOrder {
    fn is_native(self) -> bool {
        match self {
            ByteOrder::Native => true,
            ByteOrder::Little => cfg!(target_endian = "little"),
            ByteOrder::Big => cfg!(target_endian = "big"),
        }
    }
}

/// A scalar that can be stored in a record payload.
pub trait RecordScalar: Pod + Send + Sync {
    /// Decodes one value from the first `size_of::<Self>()` bytes of `bytes`.
    fn decode(bytes: &[u8], order: ByteOrder) -> Self;
    /// Encodes `self` into the first `size_of::<Self>()` bytes of `out`.
    fn encode(self, out: &mut [u8], order: ByteOrder);
}

macro_rules! impl_record_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl RecordScalar for $t {
                #[inline]
                fn decode(bytes: &[u8], order: ByteOrder) -> Self {
                    let mut raw = [0u8; size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..size_of::<$t>()]);
                    match order {
                        ByteOrder::Native => <$t>::from_ne_bytes(raw),
                        ByteOrder::Little => <$t>::from_le_bytes(raw),
                        ByteOrder::Big => <$t>::from_be_bytes(raw),
                    }
                }

                #[inline]
                fn encode(self, out: &mut [u8], order: ByteOrder) {
                    let raw = match order {
                        ByteOrder::Native => self.to_ne_bytes(),
                        ByteOrder::Little => self.to_le_bytes(),
                        ByteOrder::Big => self.to_be_bytes(),
                    };
                    out[..size_of::<$t>()].copy_from_slice(&raw);
                }
            }
        )*
    };
}

impl_record_scalar!(f32, f64, i32, u32, u8);

/// Out-of-band description of a record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    /// Bytes preceding each payload. 0 means no id; otherwise at least [`ID_BYTES`],
    /// with the id stored in the first four bytes.
    pub header_bytes: usize,
    /// Number of scalars per record.
    pub dimension: usize,
    pub byte_order: ByteOrder,
}

impl RecordLayout {
    /// Layout without ids in native byte order.
    pub fn new(dimension: usize) -> Self {
        Self {
            header_bytes: 0,
            dimension,
            byte_order: ByteOrder::Native,
        }
    }

    /// Layout with a four-byte `i32` id before each payload.
    pub fn with_ids(self) -> Self {
        self.with_header_bytes(ID_BYTES)
    }

    pub fn with_header_bytes(mut self, header_bytes: usize) -> Self {
        self.header_bytes = header_bytes;
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn has_ids(&self) -> bool {
        self.header_bytes > 0
    }

    /// Bytes per record for payload scalars of type `T`.
    pub fn stride<T: RecordScalar>(&self) -> usize {
        self.header_bytes + self.dimension * size_of::<T>()
    }

    fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(PcaError::InvalidDimension { dimension: 0 });
        }
        if self.header_bytes > 0 && self.header_bytes < ID_BYTES {
            return Err(PcaError::InvalidHeaderWidth {
                header_bytes: self.header_bytes,
            });
        }
        Ok(())
    }
}

/// Records decoded from a file: an N x D matrix plus the ids when the layout has a header.
#[derive(Debug, Clone)]
pub struct LoadedRecords<T> {
    pub features: Array2<T>,
    pub ids: Option<Vec<i32>>,
}

impl<T> LoadedRecords<T> {
    pub fn num_rows(&self) -> usize {
        self.features.nrows()
    }

    pub fn dimension(&self) -> usize {
        self.features.ncols()
    }

    pub fn into_parts(self) -> (Array2<T>, Option<Vec<i32>>) {
        (self.features, self.ids)
    }
}

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(PcaError::EmptyPath);
    }
    Ok(())
}

fn decode_row<T: RecordScalar>(payload: &[u8], row: &mut [T], order: ByteOrder) {
    if order.is_native() {
        // Zero-copy when the mapped payload happens to be aligned for T.
        if let Ok(values) = bytemuck::try_cast_slice::<u8, T>(payload) {
            row.copy_from_slice(values);
            return;
        }
    }
    for (value, bytes) in row.iter_mut().zip(payload.chunks_exact(size_of::<T>())) {
        *value = T::decode(bytes, order);
    }
}

fn encode_row<T: RecordScalar>(row: ArrayView1<'_, T>, payload: &mut [u8], order: ByteOrder) {
    if order.is_native() {
        if let Some(values) = row.as_slice() {
            payload.copy_from_slice(bytemuck::cast_slice(values));
            return;
        }
    }
    for (value, bytes) in row.iter().zip(payload.chunks_exact_mut(size_of::<T>())) {
        value.encode(bytes, order);
    }
}

/// Memory-maps `path` read-only and decodes every complete record.
///
/// The row count is `floor(file_size / stride)`; trailing bytes that do not
/// fill a record are ignored. The map is released before returning.
///
/// # Errors
/// `EmptyPath`, `InvalidDimension` and `InvalidHeaderWidth` for a bad request,
/// `Io` when the file cannot be opened, sized or mapped.
pub fn load_records<T, P>(path: P, layout: RecordLayout) -> Result<LoadedRecords<T>>
where
    T: RecordScalar,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    check_path(path)?;
    layout.validate()?;

    let load_start_time = Instant::now();
    let file = File::open(path).map_err(|e| PcaError::io(path, e))?;
    let file_size = file.metadata().map_err(|e| PcaError::io(path, e))?.len();
    let stride = layout.stride::<T>();
    let dimension = layout.dimension;

    if file_size < stride as u64 {
        debug!(
            "{}: {} bytes is smaller than one {}-byte record, loaded 0 rows",
            path.display(),
            file_size,
            stride
        );
        return Ok(LoadedRecords {
            features: Array2::from_elem((0, dimension), T::zeroed()),
            ids: layout.has_ids().then(Vec::new),
        });
    }

    // SAFETY: the map is read-only and dropped before this function returns.
    // Truncating the file from another process while it is mapped is not supported.
    let mapped = unsafe { Mmap::map(&file) }.map_err(|e| PcaError::io(path, e))?;
    let num_rows = mapped.len() / stride;
    let trailing_bytes = mapped.len() % stride;
    if trailing_bytes != 0 {
        warn!(
            "{}: ignoring {} trailing bytes that do not fill a {}-byte record",
            path.display(),
            trailing_bytes,
            stride
        );
    }
    let records = &mapped[..num_rows * stride];
    let header_bytes = layout.header_bytes;
    let order = layout.byte_order;

    let mut values = vec![T::zeroed(); num_rows * dimension];
    values
        .par_chunks_mut(dimension)
        .zip(records.par_chunks_exact(stride))
        .for_each(|(row, record)| decode_row(&record[header_bytes..], row, order));

    let ids = layout.has_ids().then(|| {
        records
            .par_chunks_exact(stride)
            .map(|record| i32::decode(&record[..ID_BYTES], order))
            .collect::<Vec<i32>>()
    });
    drop(mapped);

    let features = Array2::from_shape_vec((num_rows, dimension), values)?;
    info!(
        "Loaded {} records of dimension {} from {} in {:?}",
        num_rows,
        dimension,
        path.display(),
        load_start_time.elapsed()
    );
    Ok(LoadedRecords { features, ids })
}

/// Writes one record per row of `features`, each preceded by its id when `ids` is given.
///
/// The file is created or truncated, sized to exactly `rows * stride` bytes,
/// mapped read-write and filled row by row. On error the file contents are
/// unspecified and should be discarded.
///
/// # Errors
/// `EmptyPath` or `InvalidDimension` for a bad request, `LengthMismatch` when
/// `ids` does not have one entry per row, `Io` when the file cannot be created,
/// extended, mapped or flushed.
pub fn save_records<T, P>(
    path: P,
    features: ArrayView2<'_, T>,
    ids: Option<&[i32]>,
    byte_order: ByteOrder,
) -> Result<()>
where
    T: RecordScalar,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    check_path(path)?;
    let (num_rows, points_per_row) = features.dim();
    if points_per_row == 0 {
        return Err(PcaError::InvalidDimension { dimension: 0 });
    }
    if let Some(ids) = ids {
        if ids.len() != num_rows {
            return Err(PcaError::LengthMismatch {
                what: "record ids",
                expected: num_rows,
                actual: ids.len(),
            });
        }
    }

    let save_start_time = Instant::now();
    let header_bytes = if ids.is_some() { ID_BYTES } else { 0 };
    let stride = header_bytes + points_per_row * size_of::<T>();
    let total_bytes = num_rows * stride;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| PcaError::io(path, e))?;
    file.set_len(total_bytes as u64)
        .map_err(|e| PcaError::io(path, e))?;

    if total_bytes == 0 {
        debug!("{}: no rows to write, left an empty file", path.display());
        return Ok(());
    }

    // SAFETY: the file was just created by this call and the map does not outlive it.
    let mut mapped = unsafe { MmapMut::map_mut(&file) }.map_err(|e| PcaError::io(path, e))?;
    mapped[..total_bytes]
        .par_chunks_exact_mut(stride)
        .zip(features.axis_iter(Axis(0)).into_par_iter())
        .enumerate()
        .for_each(|(row_index, (record, row))| {
            let (header, payload) = record.split_at_mut(header_bytes);
            if let Some(ids) = ids {
                ids[row_index].encode(header, byte_order);
            }
            encode_row(row, payload, byte_order);
        });
    mapped.flush().map_err(|e| PcaError::io(path, e))?;
    drop(mapped);

    info!(
        "Saved {} records of dimension {} ({} bytes) to {} in {:?}",
        num_rows,
        points_per_row,
        total_bytes,
        path.display(),
        save_start_time.elapsed()
    );
    Ok(())
}

/// Loads an id-less native-order `f32` record file as a feature matrix.
pub fn load_features<P: AsRef<Path>>(path: P, dimension: usize) -> Result<Array2<f32>> {
    Ok(load_records::<f32, _>(path, RecordLayout::new(dimension))?.features)
}

/// Saves a feature matrix without ids in native byte order.
pub fn save_features<P: AsRef<Path>>(path: P, features: ArrayView2<'_, f32>) -> Result<()> {
    save_records(path, features, None, ByteOrder::Native)
}

/// Reshapes the flat output of a feature extractor (samples concatenated in
/// processing order) into an N x `dimension` matrix.
pub fn features_from_flat(buffer: Vec<f32>, dimension: usize) -> Result<Array2<f32>> {
    if dimension == 0 {
        return Err(PcaError::InvalidDimension { dimension });
    }
    if buffer.len() % dimension != 0 {
        return Err(PcaError::LengthMismatch {
            what: "flat feature buffer (multiple of dimension)",
            expected: buffer.len() - buffer.len() % dimension,
            actual: buffer.len(),
        });
    }
    let num_rows = buffer.len() / dimension;
    Ok(Array2::from_shape_vec((num_rows, dimension), buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_bytes(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("create temp file");
        file.write_all(bytes).expect("write temp file");
        file.flush().expect("flush temp file");
        file
    }

    #[test]
    fn round_trip_with_ids_is_bit_exact() {
        let features = array![
            [1.5f32, -0.0, f32::MIN_POSITIVE],
            [f32::MAX, 3.25, -7.125],
            [0.1, 0.2, 0.3],
        ];
        let ids = vec![7, -3, i32::MAX];
        let file = NamedTempFile::new().unwrap();

        save_records(file.path(), features.view(), Some(ids.as_slice()), ByteOrder::Native).unwrap();
        assert_eq!(
            std::fs::metadata(file.path()).unwrap().len() as usize,
            3 * (ID_BYTES + 3 * 4)
        );

        let loaded = load_records::<f32, _>(file.path(), RecordLayout::new(3).with_ids()).unwrap();
        assert_eq!(loaded.num_rows(), 3);
        assert_eq!(loaded.ids.as_deref(), Some(&ids[..]));
        for (a, b) in features.iter().zip(loaded.features.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn trailing_partial_record_is_ignored() {
        // stride 8 (two f32), 20 bytes on disk: two full rows and four spare bytes.
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0, 99.0] {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        assert_eq!(bytes.len(), 20);
        let file = write_bytes(&bytes);

        let loaded = load_records::<f32, _>(file.path(), RecordLayout::new(2)).unwrap();
        assert_eq!(loaded.features, array![[1.0f32, 2.0], [3.0, 4.0]]);
        assert!(loaded.ids.is_none());
    }

    #[test]
    fn wide_header_uses_first_four_bytes_as_id() {
        let mut bytes = Vec::new();
        for (id, value) in [(11i32, 0.5f32), (12, -0.5)] {
            bytes.extend_from_slice(&id.to_ne_bytes());
            bytes.extend_from_slice(&[0xAB; 4]);
            bytes.extend_from_slice(&value.to_ne_bytes());
        }
        let file = write_bytes(&bytes);

        let layout = RecordLayout::new(1).with_header_bytes(8);
        let loaded = load_records::<f32, _>(file.path(), layout).unwrap();
        assert_eq!(loaded.ids, Some(vec![11, 12]));
        assert_eq!(loaded.features, array![[0.5f32], [-0.5]]);
    }

    #[test]
    fn big_endian_layout_matches_raw_bytes() {
        let features = array![[1.0f32, -2.0]];
        let file = NamedTempFile::new().unwrap();
        save_records(file.path(), features.view(), Some(&[258][..]), ByteOrder::Big).unwrap();

        let raw = std::fs::read(file.path()).unwrap();
        let mut expected = Vec::new();
        expected.extend_from_slice(&258i32.to_be_bytes());
        expected.extend_from_slice(&1.0f32.to_be_bytes());
        expected.extend_from_slice(&(-2.0f32).to_be_bytes());
        assert_eq!(raw, expected);

        let layout = RecordLayout::new(2).with_ids().with_byte_order(ByteOrder::Big);
        let loaded = load_records::<f32, _>(file.path(), layout).unwrap();
        assert_eq!(loaded.ids, Some(vec![258]));
        assert_eq!(loaded.features, features);
    }

    #[test]
    fn f64_and_u8_payloads_round_trip() {
        let wide = array![[1.0f64 / 3.0, 2.0], [-4.0, 1e300]];
        let file = NamedTempFile::new().unwrap();
        save_records(file.path(), wide.view(), None, ByteOrder::Little).unwrap();
        let layout = RecordLayout::new(2).with_byte_order(ByteOrder::Little);
        assert_eq!(load_records::<f64, _>(file.path(), layout).unwrap().features, wide);

        let bytes = array![[1u8, 2, 3], [250, 251, 252]];
        let file = NamedTempFile::new().unwrap();
        save_records(file.path(), bytes.view(), Some(&[5, 6][..]), ByteOrder::Native).unwrap();
        let loaded = load_records::<u8, _>(file.path(), RecordLayout::new(3).with_ids()).unwrap();
        assert_eq!(loaded.features, bytes);
        assert_eq!(loaded.ids, Some(vec![5, 6]));
    }

    #[test]
    fn non_contiguous_view_is_saved_row_by_row() {
        let base = array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let transposed = base.t();
        let file = NamedTempFile::new().unwrap();
        save_records(file.path(), transposed, None, ByteOrder::Native).unwrap();
        let loaded = load_features(file.path(), 2).unwrap();
        assert_eq!(loaded, array![[1.0f32, 4.0], [2.0, 5.0], [3.0, 6.0]]);
    }

    #[test]
    fn zero_rows_produce_empty_file() {
        let empty = Array2::<f32>::zeros((0, 4));
        let file = NamedTempFile::new().unwrap();
        save_features(file.path(), empty.view()).unwrap();
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 0);

        let loaded = load_records::<f32, _>(file.path(), RecordLayout::new(4).with_ids()).unwrap();
        assert_eq!(loaded.features.dim(), (0, 4));
        assert_eq!(loaded.ids, Some(Vec::new()));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let file = write_bytes(&[0u8; 16]);
        assert!(matches!(
            load_records::<f32, _>("", RecordLayout::new(2)),
            Err(PcaError::EmptyPath)
        ));
        assert!(matches!(
            load_records::<f32, _>(file.path(), RecordLayout::new(0)),
            Err(PcaError::InvalidDimension { dimension: 0 })
        ));
        assert!(matches!(
            load_records::<f32, _>(file.path(), RecordLayout::new(2).with_header_bytes(2)),
            Err(PcaError::InvalidHeaderWidth { header_bytes: 2 })
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");
        assert!(matches!(
            load_records::<f32, _>(&missing, RecordLayout::new(2)),
            Err(PcaError::Io { .. })
        ));
    }

    #[test]
    fn ids_must_match_row_count() {
        let features = array![[1.0f32], [2.0]];
        let file = NamedTempFile::new().unwrap();
        let err = save_records(file.path(), features.view(), Some(&[1][..]), ByteOrder::Native)
            .unwrap_err();
        assert!(matches!(
            err,
            PcaError::LengthMismatch { expected: 2, actual: 1, .. }
        ));
    }

    #[test]
    fn flat_buffer_is_reshaped_by_dimension() {
        let matrix = features_from_flat(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 3).unwrap();
        assert_eq!(matrix, array![[1.0f32, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert!(matches!(
            features_from_flat(vec![1.0; 5], 2),
            Err(PcaError::LengthMismatch { actual: 5, .. })
        ));
        assert!(matches!(
            features_from_flat(vec![1.0; 4], 0),
            Err(PcaError::InvalidDimension { .. })
        ));
    }
}
