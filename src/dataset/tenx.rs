//! 10X Genomics feature-barcode matrices in HDF5.

use serde_json::Value;

use crate::config::{self, TenxOptions};
use crate::dataset::{
    apply_options, single_file, Annotations, Dataset, DatasetFile, Loaded, Persistable, PrimaryIds, Summary, Unserialize,
};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;
use crate::features::{self, PrimaryIdFallback};
use crate::file_ref::FileRef;
use crate::frame::{Column, DataFrame};
use crate::h5::{self, H5Group, H5Kind};
use crate::lifecycle::{self, DatasetState, LazyH5};
use crate::matrix::MatrixHandle;

const MATRIX_GROUP: &str = "matrix";
const TYPE_COLUMN: &str = "type";

#[derive(Debug)]
pub struct TenxDataset {
    h5: LazyH5,
    options: TenxOptions,
    engines: Engines,
    state: DatasetState,
    annotations: Option<Annotations>,
}

impl TenxDataset {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self {
            h5: LazyH5::new(file),
            options: TenxOptions::default(),
            engines,
            state: DatasetState::Fresh,
            annotations: None,
        }
    }

    pub fn config(&self) -> &TenxOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: TenxOptions) {
        self.options = options;
    }

    fn default_label(&self) -> String {
        self.options.feature_type_rna_name.clone().unwrap_or_default()
    }

    fn annotations(&mut self) -> Result<&Annotations, ScError> {
        let annotations = match self.annotations.take() {
            Some(annotations) => annotations,
            None => self.read_annotations()?,
        };
        self.state = DatasetState::Populated;
        Ok(self.annotations.insert(annotations))
    }

    fn read_annotations(&mut self) -> Result<Annotations, ScError> {
        let opened = self.h5.open(self.engines.h5.as_ref())?;
        self.state = DatasetState::Opened;
        let features = read_features(opened.root.as_ref())?;
        let dimensions = self.engines.matrix.hdf5_matrix_details(opened.path(), MATRIX_GROUP)?;
        if features.row_count() != dimensions.rows {
            return Err(ScError::DimensionMismatch(format!(
                "{} lists {} features for a matrix of {} rows",
                self.h5.file().name(),
                features.row_count(),
                dimensions.rows
            )));
        }
        Ok(Annotations {
            features,
            cells: DataFrame::empty(dimensions.columns),
        })
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let annotations = self.annotations()?;
        let modality_features =
            features::split_features(&annotations.features, Some(TYPE_COLUMN), &labels, &default)?;
        Ok(Summary::new(modality_features, annotations.cells.clone()))
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let selectors = self.options.primary_id_columns();

        self.annotations()?;
        let handle = {
            let opened = self.h5.open(self.engines.h5.as_ref())?;
            let id = self.engines.matrix.sparse_from_hdf5(opened.path(), MATRIX_GROUP, true)?;
            MatrixHandle::adopt(self.engines.matrix.clone(), id)?
        };
        let annotations = self.annotations()?;
        let split = features::split_by_modality(handle, &annotations.features, Some(TYPE_COLUMN), &labels, &default)?;
        let primary_ids = features::extract_primary_ids(&split.features, &selectors, PrimaryIdFallback::None);
        Ok(Loaded {
            matrix: split.matrix,
            features: split.features,
            cells: annotations.cells.clone(),
            primary_ids,
            row_ids: split.row_ids,
            reduced_dimensions: None,
            other_metadata: None,
        })
    }

    fn preview(&mut self) -> Result<PrimaryIds, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let selectors = self.options.primary_id_columns();
        let annotations = self.annotations()?;
        let split = features::split_features(&annotations.features, Some(TYPE_COLUMN), &labels, &default)?;
        Ok(features::extract_primary_ids(&split, &selectors, PrimaryIdFallback::None))
    }
}

/// `matrix/features`: `id` is required, `name` and `feature_type` are
/// optional and become the `name` and `type` columns.
fn read_features(root: &dyn H5Group) -> Result<DataFrame, ScError> {
    if root.child_kind(MATRIX_GROUP) != Some(H5Kind::Group) {
        return Err(ScError::RequiredFieldMissing(MATRIX_GROUP.to_string()));
    }
    let ids = h5::extract_strings(root, "matrix/features/id")?
        .ok_or_else(|| ScError::RequiredFieldMissing("matrix/features/id".to_string()))?;
    let rows = ids.len();
    let mut frame = DataFrame::empty(rows);
    frame.add_column("id", Column::strings(ids))?;

    for (source, column) in [("name", "name"), ("feature_type", TYPE_COLUMN)] {
        let path = format!("matrix/features/{source}");
        match h5::extract_strings(root, &path)? {
            Some(values) if values.len() == rows => frame.add_column(column, Column::strings(values))?,
            Some(values) => {
                return Err(ScError::DimensionMismatch(format!(
                    "{path} has {} entries, expected {rows}",
                    values.len()
                )));
            }
            None => tracing::debug!(path = %path, "optional feature field absent"),
        }
    }
    Ok(frame)
}

impl Dataset for TenxDataset {
    fn state(&self) -> DatasetState {
        self.state
    }

    fn summary(&mut self, cache: bool) -> Result<Summary, ScError> {
        lifecycle::scoped(self, cache, Self::summarize)
    }

    fn load(&mut self, cache: bool) -> Result<Loaded, ScError> {
        lifecycle::scoped(self, cache, Self::load_matrices)
    }

    fn preview_primary_ids(&mut self, cache: bool) -> Result<PrimaryIds, ScError> {
        lifecycle::scoped(self, cache, Self::preview)
    }

    fn options(&self) -> Result<Value, ScError> {
        config::to_options_value(&self.options)
    }

    fn set_options(&mut self, partial: &Value) -> Result<(), ScError> {
        self.options = config::merge_options(&self.options, partial)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.h5.close();
        self.annotations = None;
        if self.state != DatasetState::Fresh {
            self.state = DatasetState::Cleared;
        }
    }
}

impl Persistable for TenxDataset {
    fn format(&self) -> FormatTag {
        FormatTag::TenxHdf5
    }

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new("h5", self.h5.file().clone())]
    }
}

impl Unserialize for TenxDataset {
    const FORMAT: FormatTag = FormatTag::TenxHdf5;

    fn defaults() -> Value {
        serde_json::to_value(TenxOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, "h5", Self::FORMAT)?;
        let mut dataset = Self::new(file, engines);
        apply_options(&mut dataset, options)?;
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::H5Node;

    fn tenx_file(with_ids: bool) -> FileRef {
        let mut features = H5Node::group()
            .with_child("name", H5Node::strings(&["G1", "G2", "A1"]))
            .with_child(
                "feature_type",
                H5Node::strings(&["Gene Expression", "Gene Expression", "Antibody Capture"]),
            );
        if with_ids {
            features = features.with_child("id", H5Node::strings(&["g1", "g2", "a1"]));
        }
        // 3 x 4, CSC.
        let matrix = H5Node::group()
            .with_child("shape", H5Node::integers(vec![3, 4]))
            .with_child("data", H5Node::integers(vec![1, 2, 3, 4, 5]))
            .with_child("indices", H5Node::integers(vec![0, 2, 1, 0, 2]))
            .with_child("indptr", H5Node::integers(vec![0, 2, 3, 4, 5]))
            .with_child("features", features);
        let bytes = H5Node::group().with_child("matrix", matrix).to_bytes().unwrap();
        FileRef::from_bytes(bytes, "filtered.h5").unwrap()
    }

    #[test]
    fn missing_feature_ids_are_fatal() {
        let mut dataset = TenxDataset::new(tenx_file(false), Engines::reference());
        assert_matches!(dataset.summary(false), Err(ScError::RequiredFieldMissing(field)) if field == "matrix/features/id");
        assert_eq!(dataset.state(), DatasetState::Cleared);
    }

    #[test]
    fn summary_caches_until_cleared() {
        let mut dataset = TenxDataset::new(tenx_file(true), Engines::reference());
        assert_eq!(dataset.state(), DatasetState::Fresh);
        let summary = dataset.summary(true).unwrap();
        assert_eq!(dataset.state(), DatasetState::Populated);
        assert_eq!(summary.cells.row_count(), 4);
        assert_eq!(summary.modality_features.keys().collect::<Vec<_>>(), vec!["RNA", "ADT"]);
        dataset.clear();
        assert_eq!(dataset.state(), DatasetState::Cleared);
    }

    #[test]
    fn unserialize_rejects_extra_files() {
        let files = vec![
            DatasetFile::new("h5", tenx_file(true)),
            DatasetFile::new("h5", tenx_file(true)),
        ];
        assert_matches!(
            TenxDataset::unserialize(files, &Value::Null, Engines::reference()),
            Err(ScError::FormatMismatch(_))
        );
    }
}
