//! Legacy ArtifactDB projects: every object is described by a JSON
//! document whose `$schema` names its type, and children are referenced
//! through `resource.path` entries.

use serde_json::{Map, Value};

use crate::archive::{self, SharedArchive};
use crate::assay::{self, DecomposedAssay};
use crate::domain::NamedMap;
use crate::engine::Engines;
use crate::error::ScError;
use crate::frame::DataFrame;
use crate::frame_loader::{self, object_type};
use crate::matrix::{Dimensions, MatrixHandle};
use crate::navigator::{self, Navigator};
use crate::project::{self, Experiment, ExperimentSource};

const DENSE_TYPES: [&str; 2] = ["hdf5_dense_array", "dense_array"];
const LIST_TYPES: [&str; 2] = ["basic_list", "json_simple_list"];

/// One SummarizedExperiment inside an ArtifactDB project.
#[derive(Debug)]
pub struct ArtifactDbProject<N> {
    navigator: N,
    path: String,
    engines: Engines,
}

/// A named child entry: `{name, resource: {path}}`.
struct Entry {
    name: String,
    path: String,
}

fn entries(document: &Value, pointer: &str) -> Vec<Entry> {
    document
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(Entry {
                        name: item.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                        path: item.pointer("/resource/path").and_then(Value::as_str)?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn resource(document: &Value, pointer: &str) -> Option<String> {
    document
        .pointer(&format!("{pointer}/resource/path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `summarized_experiment.dimensions` of an experiment document.
pub fn experiment_dimensions(document: &Value) -> Result<Dimensions, ScError> {
    let dimension = |index: usize| {
        document
            .pointer(&format!("/summarized_experiment/dimensions/{index}"))
            .and_then(Value::as_u64)
            .map(|value| value as usize)
            .ok_or_else(|| ScError::RequiredFieldMissing("summarized_experiment.dimensions".to_string()))
    };
    Ok(Dimensions {
        rows: dimension(0)?,
        columns: dimension(1)?,
    })
}

impl<N: Navigator> ArtifactDbProject<N> {
    pub fn new(navigator: N, path: impl Into<String>, engines: Engines) -> Self {
        Self {
            navigator,
            path: path.into(),
            engines,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Points at another experiment of the same project.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
        self.navigator.clear();
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    fn main_document(&mut self) -> Result<Value, ScError> {
        let document = navigator::resolve_metadata(&mut self.navigator, &self.path)?;
        match object_type(&document) {
            Some(kind) if project::is_experiment_type(&kind) => Ok(document),
            Some(kind) => Err(ScError::SchemaUnknown(format!(
                "'{}' is a {kind}, not a SummarizedExperiment",
                self.path
            ))),
            None => Err(ScError::SchemaUnknown(format!("no $schema for '{}'", self.path))),
        }
    }

    fn document(&mut self, experiment: Experiment) -> Result<Value, ScError> {
        let main = self.main_document()?;
        match experiment {
            Experiment::Main => Ok(main),
            Experiment::Alternative(index) => {
                let entry = entries(&main, "/single_cell_experiment/alternative_experiments")
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| ScError::SelectorInvalid(format!("no alternative experiment #{index}")))?;
                navigator::resolve_metadata(&mut self.navigator, &entry.path)
            }
        }
    }

    fn assay_path(&mut self, experiment: Experiment, assay: usize) -> Result<String, ScError> {
        let document = self.document(experiment)?;
        entries(&document, "/summarized_experiment/assays")
            .into_iter()
            .nth(assay)
            .map(|entry| entry.path)
            .ok_or_else(|| ScError::SelectorInvalid(format!("no assay #{assay}")))
    }

    fn frame(&mut self, path: &str) -> Result<DataFrame, ScError> {
        frame_loader::load_data_frame(&mut self.navigator, self.engines.h5.as_ref(), path)
    }

    /// Reduced dimensions stored as dense arrays; others are skipped.
    fn dense_reduced_dimensions(&mut self) -> Result<Vec<Entry>, ScError> {
        let main = self.main_document()?;
        let mut dense = Vec::new();
        for entry in entries(&main, "/single_cell_experiment/reduced_dimensions") {
            let document = navigator::resolve_metadata(&mut self.navigator, &entry.path)?;
            match object_type(&document) {
                Some(kind) if DENSE_TYPES.contains(&kind.as_str()) => dense.push(entry),
                kind => tracing::warn!(name = %entry.name, kind = ?kind, "skipping reduced dimension that is not a dense array"),
            }
        }
        Ok(dense)
    }
}

impl<N: Navigator> ExperimentSource for ArtifactDbProject<N> {
    fn cells(&mut self) -> Result<DataFrame, ScError> {
        let main = self.main_document()?;
        let path = match resource(&main, "/summarized_experiment/column_data") {
            Some(path) => Some(path),
            None => {
                let legacy = resource(&main, "/summarized_experiment/col_data");
                if legacy.is_some() {
                    tracing::warn!(path = %self.path, "reading cells from 'col_data' instead of 'column_data'");
                }
                legacy
            }
        };
        match path {
            Some(path) => self.frame(&path),
            None => Ok(DataFrame::empty(experiment_dimensions(&main)?.columns)),
        }
    }

    fn alternative_experiments(&mut self) -> Result<Vec<String>, ScError> {
        let main = self.main_document()?;
        Ok(entries(&main, "/single_cell_experiment/alternative_experiments")
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    fn features(&mut self, experiment: Experiment) -> Result<DataFrame, ScError> {
        let document = self.document(experiment)?;
        match resource(&document, "/summarized_experiment/row_data") {
            Some(path) => self.frame(&path),
            None => Ok(DataFrame::empty(experiment_dimensions(&document)?.rows)),
        }
    }

    fn assay_names(&mut self, experiment: Experiment) -> Result<Vec<String>, ScError> {
        let document = self.document(experiment)?;
        Ok(entries(&document, "/summarized_experiment/assays")
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    fn load_assay(&mut self, experiment: Experiment, assay: usize, force_integer: bool) -> Result<MatrixHandle, ScError> {
        let path = self.assay_path(experiment, assay)?;
        assay::load_assay(&mut self.navigator, &self.engines, &path, force_integer)
    }

    fn load_assay_decomposed(
        &mut self,
        experiment: Experiment,
        assay: usize,
        force_integer: bool,
    ) -> Result<DecomposedAssay, ScError> {
        let path = self.assay_path(experiment, assay)?;
        assay::load_assay_decomposed(&mut self.navigator, &self.engines, &path, force_integer)
    }

    fn reduced_dimension_names(&mut self) -> Result<Vec<String>, ScError> {
        Ok(self
            .dense_reduced_dimensions()?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    fn load_reduced_dimension(&mut self, name: &str) -> Result<Vec<Vec<f64>>, ScError> {
        let entry = self
            .dense_reduced_dimensions()?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| ScError::SelectorInvalid(format!("no reduced dimension named '{name}'")))?;
        let matrix = assay::load_assay(&mut self.navigator, &self.engines, &entry.path, false)?;
        project::matrix_columns(&matrix)
    }

    fn other_metadata(&mut self) -> Result<Value, ScError> {
        let main = self.main_document()?;
        let Some(path) = resource(&main, "/summarized_experiment/other_data") else {
            return Ok(Value::Object(Map::new()));
        };
        let document = navigator::resolve_metadata(&mut self.navigator, &path)?;
        match object_type(&document) {
            Some(kind) if LIST_TYPES.contains(&kind.as_str()) => {
                let file = document
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ScError::RequiredFieldMissing("path".to_string()))?;
                let contents = self.navigator.json(file)?;
                project::uzuki2_to_json(&contents)
            }
            kind => {
                tracing::warn!(path = %path, kind = ?kind, "other data is not a list, ignoring");
                Ok(Value::Object(Map::new()))
            }
        }
    }

    fn clear(&mut self) {
        self.navigator.clear();
    }
}

/// Every SummarizedExperiment document in an archive that is not itself an
/// alternative experiment of another, keyed by object path.
pub fn search_zipped_artifactdb(archive: &SharedArchive) -> Result<NamedMap<Dimensions>, ScError> {
    let mut found = NamedMap::new();
    let mut nested = Vec::new();
    for name in archive::entry_names(archive)? {
        if !name.ends_with(".json") {
            continue;
        }
        let bytes = archive::read_entry(archive, &name)?;
        let Ok(document) = navigator::parse_json(&name, &bytes) else {
            tracing::debug!(entry = %name, "skipping unparseable JSON entry");
            continue;
        };
        let is_experiment = object_type(&document).is_some_and(|kind| project::is_experiment_type(&kind));
        if !is_experiment {
            continue;
        }
        nested.extend(
            entries(&document, "/single_cell_experiment/alternative_experiments")
                .into_iter()
                .map(|entry| navigator::canonical_path(&entry.path).to_string()),
        );
        found.insert(navigator::canonical_path(&name), experiment_dimensions(&document)?);
    }
    for path in nested {
        found.remove(&path);
    }
    Ok(found)
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::archive::tests::build_zip;
    use crate::config::{ExperimentOptions, Selector};
    use crate::file_ref::FileRef;
    use crate::navigator::{MetadataCache, MetadataLayout, ZipNavigator};

    fn experiment(rows: usize, assay: &str, alternatives: Value) -> Value {
        json!({
            "$schema": "single_cell_experiment/v1.json",
            "summarized_experiment": {
                "dimensions": [rows, 2],
                "assays": [{"name": "counts", "resource": {"type": "local", "path": assay}}]
            },
            "single_cell_experiment": {"alternative_experiments": alternatives}
        })
    }

    fn dense(path: &str, rows: usize, values: Vec<i64>) -> Vec<(String, Vec<u8>)> {
        use crate::engine::H5Node;
        use crate::h5::H5Values;
        let array = H5Node::group().with_child("data", H5Node::dataset(vec![2, rows], H5Values::Integer(values)));
        let document = json!({
            "$schema": "hdf5_dense_array/v1.json",
            "path": path,
            "array": {"dimensions": [rows, 2]},
            "hdf5_dense_array": {"dataset": "data"}
        });
        vec![
            (path.to_string(), array.to_bytes().unwrap()),
            (format!("{path}.json"), serde_json::to_vec(&document).unwrap()),
        ]
    }

    pub(crate) fn project_zip() -> Vec<u8> {
        let mut entries = vec![
            (
                "se.json".to_string(),
                serde_json::to_vec(&experiment(
                    3,
                    "se/assay-1/array.h5",
                    json!([{"name": "Antibody Capture", "resource": {"path": "se/alt-1/experiment.json"}}]),
                ))
                .unwrap(),
            ),
            (
                "se/alt-1/experiment.json".to_string(),
                serde_json::to_vec(&experiment(1, "se/alt-1/assay-1/array.h5", json!([]))).unwrap(),
            ),
        ];
        entries.extend(dense("se/assay-1/array.h5", 3, vec![1, 2, 3, 4, 5, 6]));
        entries.extend(dense("se/alt-1/assay-1/array.h5", 1, vec![7, 8]));
        let borrowed: Vec<(&str, &[u8])> = entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())).collect();
        build_zip(&borrowed)
    }

    fn open() -> ArtifactDbProject<MetadataCache<ZipNavigator>> {
        let file = FileRef::from_bytes(project_zip(), "project.zip").unwrap();
        let navigator = MetadataCache::new(ZipNavigator::new(file, MetadataLayout::ArtifactDb));
        ArtifactDbProject::new(navigator, "se", Engines::reference())
    }

    #[test]
    fn summaries_key_experiments_by_name() {
        let mut source = open();
        let summary = project::summarize(&mut source).unwrap();
        assert_eq!(summary.modality_features.keys().collect::<Vec<_>>(), vec!["", "Antibody Capture"]);
        assert_eq!(summary.cells.row_count(), 2);
        assert_eq!(
            summary.modality_assay_names.unwrap().get("").cloned(),
            Some(vec!["counts".to_string()])
        );
    }

    #[test]
    fn modalities_bind_to_experiments() {
        let mut source = open();
        let loaded = project::load_modalities(&mut source, &ExperimentOptions::default()).unwrap();
        assert_eq!(loaded.matrix.available(), vec!["RNA", "ADT"]);
        assert_eq!(loaded.matrix.get("ADT").unwrap().column(1).unwrap(), vec![8.0]);

        let options = ExperimentOptions {
            rna_count_assay: Some(Selector::name("logcounts")),
            ..ExperimentOptions::default()
        };
        assert_matches!(project::load_modalities(&mut source, &options), Err(ScError::SelectorInvalid(_)));
    }

    #[test]
    fn search_skips_alternative_experiments() {
        let file = FileRef::from_bytes(project_zip(), "project.zip").unwrap();
        let archive = archive::open_archive(&file).unwrap();
        let found = search_zipped_artifactdb(&archive).unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["se"]);
        assert_eq!(found.get("se"), Some(&Dimensions { rows: 3, columns: 2 }));
    }
}
