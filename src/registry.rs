//! Format tags mapped to the reader types that handle them.

use serde_json::Value;

use crate::dataset::{
    DatasetFile, H5adDataset, H5adResult, MatrixMarketDataset, Persistable, RdsDataset, RdsResult, ReaderMode,
    TenxDataset, Unserialize, ZippedAlabasterDataset, ZippedAlabasterResult, ZippedArtifactDbDataset,
    ZippedArtifactDbResult,
};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;

/// Formats with a reader in `mode`.
pub fn formats(mode: ReaderMode) -> Vec<FormatTag> {
    FormatTag::ALL
        .into_iter()
        .filter(|format| is_supported(*format, mode))
        .collect()
}

pub fn is_supported(format: FormatTag, mode: ReaderMode) -> bool {
    match mode {
        ReaderMode::Dataset => true,
        ReaderMode::Result => !matches!(format, FormatTag::TenxHdf5 | FormatTag::MatrixMarket),
    }
}

fn unsupported(format: FormatTag, mode: ReaderMode) -> ScError {
    let kind = match mode {
        ReaderMode::Dataset => "dataset",
        ReaderMode::Result => "result",
    };
    ScError::FormatMismatch(format!("no {kind} reader for {format}"))
}

/// Default options of the reader for `format`.
pub fn defaults(format: FormatTag, mode: ReaderMode) -> Result<Value, ScError> {
    let value = match (mode, format) {
        (ReaderMode::Dataset, FormatTag::TenxHdf5) => TenxDataset::defaults(),
        (ReaderMode::Dataset, FormatTag::MatrixMarket) => MatrixMarketDataset::defaults(),
        (ReaderMode::Dataset, FormatTag::H5ad) => H5adDataset::defaults(),
        (ReaderMode::Dataset, FormatTag::SummarizedExperiment) => RdsDataset::defaults(),
        (ReaderMode::Dataset, FormatTag::ZippedArtifactdb) => ZippedArtifactDbDataset::defaults(),
        (ReaderMode::Dataset, FormatTag::ZippedAlabaster) => ZippedAlabasterDataset::defaults(),
        (ReaderMode::Result, FormatTag::H5ad) => H5adResult::defaults(),
        (ReaderMode::Result, FormatTag::SummarizedExperiment) => RdsResult::defaults(),
        (ReaderMode::Result, FormatTag::ZippedArtifactdb) => ZippedArtifactDbResult::defaults(),
        (ReaderMode::Result, FormatTag::ZippedAlabaster) => ZippedAlabasterResult::defaults(),
        (ReaderMode::Result, FormatTag::TenxHdf5 | FormatTag::MatrixMarket) => {
            return Err(unsupported(format, mode));
        }
    };
    Ok(value)
}

fn build<D>(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Box<dyn Persistable>, ScError>
where
    D: Unserialize + Persistable + 'static,
{
    Ok(Box::new(D::unserialize(files, options, engines)?))
}

/// Reconstructs the reader whose format and mode match.
pub fn unserialize(
    format: FormatTag,
    mode: ReaderMode,
    files: Vec<DatasetFile>,
    options: &Value,
    engines: Engines,
) -> Result<Box<dyn Persistable>, ScError> {
    tracing::debug!(format = %format, mode = ?mode, files = files.len(), "restoring reader");
    match (mode, format) {
        (ReaderMode::Dataset, FormatTag::TenxHdf5) => build::<TenxDataset>(files, options, engines),
        (ReaderMode::Dataset, FormatTag::MatrixMarket) => build::<MatrixMarketDataset>(files, options, engines),
        (ReaderMode::Dataset, FormatTag::H5ad) => build::<H5adDataset>(files, options, engines),
        (ReaderMode::Dataset, FormatTag::SummarizedExperiment) => build::<RdsDataset>(files, options, engines),
        (ReaderMode::Dataset, FormatTag::ZippedArtifactdb) => {
            build::<ZippedArtifactDbDataset>(files, options, engines)
        }
        (ReaderMode::Dataset, FormatTag::ZippedAlabaster) => build::<ZippedAlabasterDataset>(files, options, engines),
        (ReaderMode::Result, FormatTag::H5ad) => build::<H5adResult>(files, options, engines),
        (ReaderMode::Result, FormatTag::SummarizedExperiment) => build::<RdsResult>(files, options, engines),
        (ReaderMode::Result, FormatTag::ZippedArtifactdb) => build::<ZippedArtifactDbResult>(files, options, engines),
        (ReaderMode::Result, FormatTag::ZippedAlabaster) => build::<ZippedAlabasterResult>(files, options, engines),
        (ReaderMode::Result, FormatTag::TenxHdf5 | FormatTag::MatrixMarket) => Err(unsupported(format, mode)),
    }
}
