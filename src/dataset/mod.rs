//! Per-format readers and the capabilities they share.
//!
//! Every reader is cheap to construct and does no I/O until the first
//! [`Dataset::summary`], [`Dataset::load`] or
//! [`Dataset::preview_primary_ids`]. Methods take `&mut self`, so one
//! reader never serves two calls at once.

pub mod artifactdb;
pub mod experiment;
pub mod h5ad;
pub mod mtx;
pub mod rds;
pub mod tenx;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{FormatTag, ModalityMap, NamedMap};
use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::frame::DataFrame;
use crate::lifecycle::DatasetState;
use crate::matrix::{MatrixHandle, MultiMatrix};

pub use artifactdb::{ZippedAlabasterDataset, ZippedAlabasterResult, ZippedArtifactDbDataset, ZippedArtifactDbResult};
pub use experiment::{ExperimentDataset, ExperimentResult, PersistedSource};
pub use h5ad::{H5adDataset, H5adResult};
pub use mtx::MatrixMarketDataset;
pub use rds::{RdsDataset, RdsResult};
pub use tenx::TenxDataset;

/// Annotation-only view of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Features per modality. Keys are canonical modalities or raw
    /// experiment names, depending on the reader.
    pub modality_features: ModalityMap<DataFrame>,
    pub cells: DataFrame,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modality_assay_names: Option<ModalityMap<Vec<String>>>,
    /// Assays of single-experiment files such as H5AD.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_assay_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduced_dimension_names: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_metadata: Option<Value>,
}

impl Summary {
    pub fn new(modality_features: ModalityMap<DataFrame>, cells: DataFrame) -> Self {
        Self {
            modality_features,
            cells,
            modality_assay_names: None,
            all_assay_names: None,
            reduced_dimension_names: None,
            other_metadata: None,
        }
    }
}

/// Matrices and annotations returned by [`Dataset::load`]. The caller owns
/// the matrices; dropping this value (or calling [`Loaded::free`]) releases
/// them.
#[derive(Debug)]
pub struct Loaded {
    pub matrix: MultiMatrix,
    pub features: ModalityMap<DataFrame>,
    pub cells: DataFrame,
    pub primary_ids: ModalityMap<Option<Vec<String>>>,
    /// Original feature index of every row, per modality.
    pub row_ids: ModalityMap<Vec<usize>>,
    /// Per reduced dimension, one vector of cell coordinates per component.
    pub reduced_dimensions: Option<NamedMap<Vec<Vec<f64>>>>,
    pub other_metadata: Option<Value>,
}

impl Loaded {
    pub fn free(self) -> Result<(), ScError> {
        self.matrix.free()
    }
}

pub type PrimaryIds = ModalityMap<Option<Vec<String>>>;

pub trait Dataset {
    fn state(&self) -> DatasetState;

    fn summary(&mut self, cache: bool) -> Result<Summary, ScError>;

    fn load(&mut self, cache: bool) -> Result<Loaded, ScError>;

    /// Primary identifiers per modality, without loading any matrix.
    fn preview_primary_ids(&mut self, cache: bool) -> Result<PrimaryIds, ScError>;

    /// Current options as a JSON object of wire names.
    fn options(&self) -> Result<Value, ScError>;

    /// Merges a partial options object; unknown keys are rejected.
    fn set_options(&mut self, partial: &Value) -> Result<(), ScError>;

    /// Releases every cached handle and temporary file.
    fn clear(&mut self);
}

/// Decoded feature and cell tables cached between calls.
#[derive(Debug, Clone)]
pub(crate) struct Annotations {
    pub features: DataFrame,
    pub cells: DataFrame,
}

/// One input file of a dataset, tagged with its role (`h5`, `mtx`,
/// `genes`, `annotations`, `rds`, `zip`).
#[derive(Debug, Clone)]
pub struct DatasetFile {
    pub kind: String,
    pub file: FileRef,
}

impl DatasetFile {
    pub fn new(kind: impl Into<String>, file: FileRef) -> Self {
        Self {
            kind: kind.into(),
            file,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AbbreviatedFile {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Abbreviated {
    pub format: FormatTag,
    pub files: Vec<AbbreviatedFile>,
    pub options: Value,
}

/// Whether a reader extracts raw counts or analysis results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMode {
    #[default]
    Dataset,
    Result,
}

/// Readers that can describe their inputs for persistence.
pub trait Persistable: Dataset {
    fn format(&self) -> FormatTag;

    fn mode(&self) -> ReaderMode {
        ReaderMode::Dataset
    }

    fn files(&self) -> Vec<DatasetFile>;

    /// File names, sizes and options. Performs no matrix I/O.
    fn abbreviate(&self) -> Result<Abbreviated, ScError> {
        let files = self
            .files()
            .into_iter()
            .map(|entry| {
                Ok(AbbreviatedFile {
                    name: entry.file.name().to_string(),
                    size: entry.file.size()?,
                    kind: entry.kind,
                })
            })
            .collect::<Result<Vec<_>, ScError>>()?;
        Ok(Abbreviated {
            format: self.format(),
            files,
            options: self.options()?,
        })
    }
}

/// Construction from persisted files and options.
pub trait Unserialize: Sized {
    const FORMAT: FormatTag;

    /// Default options as a JSON object.
    fn defaults() -> Value;

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError>;
}

/// The single file of role `kind`; anything else is a format mismatch.
pub(crate) fn single_file(files: Vec<DatasetFile>, kind: &str, format: FormatTag) -> Result<FileRef, ScError> {
    let mut files = files.into_iter();
    match (files.next(), files.next()) {
        (Some(entry), None) if entry.kind == kind => Ok(entry.file),
        _ => Err(ScError::FormatMismatch(format!(
            "{format} expects exactly one '{kind}' file"
        ))),
    }
}

/// Adds the raw matrix under `name`, then its log-normalized counterpart
/// under the same name, which releases the raw one.
pub(crate) fn add_normalized(
    matrix: &mut MultiMatrix,
    name: &str,
    raw: MatrixHandle,
    size_factors: Option<&[f64]>,
) -> Result<(), ScError> {
    let normalized = raw.log_norm_counts(size_factors)?;
    matrix.add(name, raw)?;
    matrix.add(name, normalized)
}

/// Splits a reserved key such as `datasetName` off an options object.
pub(crate) fn take_reserved(options: &Value, key: &str) -> Result<(Option<String>, Value), ScError> {
    let mut map = match options {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        _ => return Err(ScError::Config("options must be a JSON object".to_string())),
    };
    let reserved = match map.remove(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) => Some(value),
        Some(other) => return Err(ScError::Config(format!("'{key}' must be a string, got {other}"))),
    };
    Ok((reserved, Value::Object(map)))
}

/// Applies persisted options; `null` keeps the defaults.
pub(crate) fn apply_options<D: Dataset + ?Sized>(dataset: &mut D, options: &Value) -> Result<(), ScError> {
    if options.is_null() {
        return Ok(());
    }
    dataset.set_options(options)
}

/// Adds a reserved key to an options object.
pub(crate) fn with_reserved(mut options: Value, key: &str, value: &str) -> Value {
    if let Value::Object(map) = &mut options {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
    options
}
