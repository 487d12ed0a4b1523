//! Compressed bundles of named arrays (NumPy `.npz`).
//!
//! The remote server, the worker process and the CLI all exchange
//! volumes and masks as bundles. Array names follow the server's
//! conventions (`Volume`, `Segmentation`, `Ax`/`Sag`/`Cor`).

use std::fs::File;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use cascore_pipeline::{Mask, PipelineError, Placement, Volume, VoxelSpacing, Voxels};
use ndarray::{Array, Array1, Array2, ArrayBase, Data, Dimension, Ix3};
use ndarray_npy::{
    NpzReader, NpzWriter, ReadNpzError, ReadableElement, WritableElement, WriteNpzError,
};

/// Voxel array of a volume bundle.
pub const VOLUME: &str = "Volume";
/// Voxel spacing `[z, x, y]` of a volume bundle, in mm.
pub const SPACING: &str = "Spacing";
/// 4x4 placement matrix of a volume bundle.
pub const PLACEMENT: &str = "Placement";
/// Full-volume segmentation.
pub const SEGMENTATION: &str = "Segmentation";

/// Errors from reading or writing a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The bundle has no array with this name.
    #[error("bundle has no array named {0:?}")]
    Missing(String),

    /// The array exists but its element type or rank is not accepted.
    #[error("array {name:?} has an unsupported element type or rank: {source}")]
    Unsupported {
        /// Array name.
        name: String,
        /// Error from the last decoding attempt.
        source: ReadNpzError,
    },

    /// The array exists but has the wrong number of elements.
    #[error("array {name:?} has {found} elements, expected {expected}")]
    Length {
        /// Array name.
        name: String,
        /// Required element count.
        expected: usize,
        /// Actual element count.
        found: usize,
    },

    /// The archive could not be read.
    #[error("failed to read bundle: {0}")]
    Read(#[from] ReadNpzError),

    /// The archive could not be written.
    #[error("failed to write bundle: {0}")]
    Write(#[from] WriteNpzError),

    /// The bundle file could not be opened or created.
    #[error("bundle file error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BundleError> for PipelineError {
    fn from(e: BundleError) -> Self {
        Self::Codec(e.to_string())
    }
}

/// Builds an in-memory compressed bundle.
pub struct BundleWriter {
    inner: NpzWriter<Cursor<Vec<u8>>>,
}

impl BundleWriter {
    /// An empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: NpzWriter::new_compressed(Cursor::new(Vec::new())),
        }
    }

    /// Append `array` under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Write`] if the array cannot be encoded.
    pub fn add<S, D>(&mut self, name: &str, array: &ArrayBase<S, D>) -> Result<(), BundleError>
    where
        S: Data,
        S::Elem: WritableElement,
        D: Dimension,
    {
        self.inner.add_array(name, array)?;
        Ok(())
    }

    /// Builder form of [`add`](Self::add).
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Write`] if the array cannot be encoded.
    pub fn with<S, D>(mut self, name: &str, array: &ArrayBase<S, D>) -> Result<Self, BundleError>
    where
        S: Data,
        S::Elem: WritableElement,
        D: Dimension,
    {
        self.add(name, array)?;
        Ok(self)
    }

    /// Finish the archive and return its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Write`] if the archive cannot be closed.
    pub fn finish(self) -> Result<Vec<u8>, BundleError> {
        Ok(self.inner.finish()?.into_inner())
    }
}

impl Default for BundleWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// A readable bundle.
///
/// Array names are matched with or without the `.npy` suffix that
/// NumPy adds to archive entries.
pub struct Bundle<R: Read + Seek> {
    reader: NpzReader<R>,
    entries: Vec<String>,
}

impl Bundle<Cursor<Vec<u8>>> {
    /// Open a bundle held in memory.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Read`] if the bytes are not an archive.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, BundleError> {
        Self::new(Cursor::new(bytes))
    }
}

impl Bundle<File> {
    /// Open a bundle file.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Io`] if the file cannot be opened and
    /// [`BundleError::Read`] if it is not an archive.
    pub fn open(path: &Path) -> Result<Self, BundleError> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> Bundle<R> {
    /// Open a bundle from any seekable reader.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Read`] if the reader is not an archive.
    pub fn new(reader: R) -> Result<Self, BundleError> {
        let mut reader = NpzReader::new(reader)?;
        let entries = reader.names()?;
        Ok(Self { reader, entries })
    }

    /// Array names without the `.npy` suffix.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(|e| e.strip_suffix(".npy").unwrap_or(e))
    }

    /// Whether an array named `name` exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    fn entry(&self, name: &str) -> Option<String> {
        let suffixed = format!("{name}.npy");
        self.entries
            .iter()
            .find(|e| **e == name || **e == suffixed)
            .cloned()
    }

    /// Read an array of a known element type and rank.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Missing`] if there is no such array and
    /// [`BundleError::Read`] if it has another type or rank.
    pub fn array<A, D>(&mut self, name: &str) -> Result<Array<A, D>, BundleError>
    where
        A: ReadableElement,
        D: Dimension,
    {
        let entry = self
            .entry(name)
            .ok_or_else(|| BundleError::Missing(name.to_string()))?;
        Ok(self.reader.by_name(&entry)?)
    }

    /// Read a voxel volume.
    ///
    /// Accepts `i16` directly; wider integer and float arrays are
    /// rounded and saturated into the `i16` range.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Missing`] or [`BundleError::Unsupported`].
    pub fn voxels(&mut self, name: &str) -> Result<Voxels, BundleError> {
        let err = match self.array::<i16, Ix3>(name) {
            Ok(a) => return Ok(a),
            Err(BundleError::Read(e)) => e,
            Err(e) => return Err(e),
        };
        tracing::debug!(name, %err, "volume is not i16, trying wider types");
        if let Ok(a) = self.array::<i32, Ix3>(name) {
            return Ok(a.mapv(saturate_i32));
        }
        if let Ok(a) = self.array::<f32, Ix3>(name) {
            return Ok(a.mapv(|v| saturate_f64(f64::from(v))));
        }
        if let Ok(a) = self.array::<f64, Ix3>(name) {
            return Ok(a.mapv(saturate_f64));
        }
        Err(BundleError::Unsupported {
            name: name.to_string(),
            source: err,
        })
    }

    /// Read a binary mask.
    ///
    /// Accepts `u8`, `bool` and floating-point arrays; float values
    /// above 0.5 count as foreground and nonzero integers become 1.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Missing`] or [`BundleError::Unsupported`].
    pub fn mask(&mut self, name: &str) -> Result<Mask, BundleError> {
        let err = match self.array::<u8, Ix3>(name) {
            Ok(a) => return Ok(a.mapv(|v| u8::from(v != 0))),
            Err(BundleError::Read(e)) => e,
            Err(e) => return Err(e),
        };
        if let Ok(a) = self.array::<bool, Ix3>(name) {
            return Ok(a.mapv(u8::from));
        }
        if let Ok(a) = self.array::<f32, Ix3>(name) {
            return Ok(a.mapv(|v| u8::from(v > 0.5)));
        }
        if let Ok(a) = self.array::<f64, Ix3>(name) {
            return Ok(a.mapv(|v| u8::from(v > 0.5)));
        }
        if let Ok(a) = self.array::<i64, Ix3>(name) {
            return Ok(a.mapv(|v| u8::from(v != 0)));
        }
        Err(BundleError::Unsupported {
            name: name.to_string(),
            source: err,
        })
    }

    fn float_list(&mut self, name: &str, expected: usize) -> Result<Vec<f64>, BundleError> {
        let values: Vec<f64> = match self.array::<f64, ndarray::IxDyn>(name) {
            Ok(a) => a.into_iter().collect(),
            Err(BundleError::Read(_)) => self
                .array::<f32, ndarray::IxDyn>(name)?
                .into_iter()
                .map(f64::from)
                .collect(),
            Err(e) => return Err(e),
        };
        if values.len() != expected {
            return Err(BundleError::Length {
                name: name.to_string(),
                expected,
                found: values.len(),
            });
        }
        Ok(values)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn saturate_i32(v: i32) -> i16 {
    v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

#[allow(clippy::cast_possible_truncation)]
fn saturate_f64(v: f64) -> i16 {
    // Float-to-int `as` saturates; NaN maps to 0.
    v.round() as i16
}

/// Bundle carrying a single mask under `name`.
///
/// # Errors
///
/// Returns [`BundleError::Write`] if encoding fails.
pub fn encode_mask(name: &str, mask: &Mask) -> Result<Vec<u8>, BundleError> {
    BundleWriter::new().with(name, mask)?.finish()
}

/// Bundle carrying a single voxel array under `name`.
///
/// # Errors
///
/// Returns [`BundleError::Write`] if encoding fails.
pub fn encode_voxels(name: &str, voxels: &Voxels) -> Result<Vec<u8>, BundleError> {
    BundleWriter::new().with(name, voxels)?.finish()
}

/// Load a volume bundle from disk.
///
/// The bundle holds the voxels under [`VOLUME`] and, optionally, the
/// spacing under [`SPACING`] and a 4x4 matrix under [`PLACEMENT`].
/// The volume is named after the file stem.
///
/// # Errors
///
/// Returns a [`BundleError`] if the file cannot be read or lacks a
/// volume.
pub fn load_volume(path: &Path) -> Result<Volume, BundleError> {
    let mut bundle = Bundle::open(path)?;
    let voxels = bundle.voxels(VOLUME)?;
    let spacing = if bundle.contains(SPACING) {
        let s = bundle.float_list(SPACING, 3)?;
        VoxelSpacing([s[0], s[1], s[2]])
    } else {
        VoxelSpacing::default()
    };
    let placement = if bundle.contains(PLACEMENT) {
        let m = bundle.float_list(PLACEMENT, 16)?;
        let mut rows = [[0.0; 4]; 4];
        for (i, row) in rows.iter_mut().enumerate() {
            row.copy_from_slice(&m[i * 4..i * 4 + 4]);
        }
        Placement(rows)
    } else {
        Placement::default()
    };
    let name = path
        .file_stem()
        .map_or_else(|| "Volume".to_string(), |s| s.to_string_lossy().into_owned());
    tracing::info!(%name, shape = ?voxels.shape(), ?spacing, "loaded volume");
    Ok(Volume::new(name, voxels, spacing, placement))
}

/// Write a volume bundle to disk, the inverse of [`load_volume`].
///
/// # Errors
///
/// Returns a [`BundleError`] if the file cannot be written.
pub fn save_volume(path: &Path, volume: &Volume) -> Result<(), BundleError> {
    let placement: Vec<f64> = volume.placement().0.iter().flatten().copied().collect();
    let bytes = BundleWriter::new()
        .with(VOLUME, volume.voxels())?
        .with(SPACING, &Array1::from(volume.spacing().0.to_vec()))?
        .with(
            PLACEMENT,
            &Array2::from_shape_vec((4, 4), placement)
                .map_err(|e| BundleError::Io(std::io::Error::other(e)))?,
        )?
        .finish()?;
    File::create(path)?.write_all(&bytes)?;
    Ok(())
}

/// Write a single-mask bundle to disk.
///
/// # Errors
///
/// Returns a [`BundleError`] if the file cannot be written.
pub fn save_mask(path: &Path, name: &str, mask: &Mask) -> Result<(), BundleError> {
    let bytes = encode_mask(name, mask)?;
    File::create(path)?.write_all(&bytes)?;
    Ok(())
}
