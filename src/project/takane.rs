//! takane (alabaster) projects: every object is a directory holding an
//! `OBJECT` file, and children are numbered subdirectories listed by
//! `names.json`.

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
use crate::project::artifactdb::experiment_dimensions;
use crate::project::{self, Experiment, ExperimentSource};

const OBJECT_FILE: &str = "OBJECT";
const LIST_CONTENTS: &str = "list_contents.json.gz";

/// One SummarizedExperiment inside a takane project, addressed by the
/// directory prefix of its `OBJECT` file.
#[derive(Debug)]
pub struct TakaneProject<N> {
    navigator: N,
    prefix: String,
    engines: Engines,
}

impl<N: Navigator> TakaneProject<N> {
    pub fn new(navigator: N, prefix: impl Into<String>, engines: Engines) -> Self {
        Self {
            navigator,
            prefix: prefix.into(),
            engines,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn set_prefix(&mut self, prefix: impl Into<String>) {
        self.prefix = prefix.into();
        self.navigator.clear();
    }

    pub fn navigator(&self) -> &N {
        &self.navigator
    }

    fn experiment_path(&self, experiment: Experiment) -> String {
        match experiment {
            Experiment::Main => self.prefix.clone(),
            Experiment::Alternative(index) => navigator::join(&self.prefix, &format!("alternative_experiments/{index}")),
        }
    }

    fn experiment_document(&mut self, experiment: Experiment) -> Result<Value, ScError> {
        let path = self.experiment_path(experiment);
        let document = self.navigator.metadata(&path)?;
        match object_type(&document) {
            Some(kind) if project::is_experiment_type(&kind) => Ok(document),
            Some(kind) => Err(ScError::SchemaUnknown(format!(
                "'{path}' is a {kind}, not a SummarizedExperiment"
            ))),
            None => Err(ScError::SchemaUnknown(format!("no type for object at '{path}'"))),
        }
    }

    fn has_object(&mut self, path: &str) -> Result<bool, ScError> {
        self.navigator.exists(&navigator::join(path, OBJECT_FILE))
    }

    /// Entries of a `names.json` listing; an absent listing is empty.
    fn names(&mut self, directory: &str) -> Result<Vec<String>, ScError> {
        let listing = navigator::join(directory, "names.json");
        if !self.navigator.exists(&listing)? {
            return Ok(Vec::new());
        }
        let document = self.navigator.json(&listing)?;
        let names = document
            .as_array()
            .ok_or_else(|| ScError::SchemaUnknown(format!("{listing} is not an array")))?;
        Ok(names
            .iter()
            .map(|name| name.as_str().unwrap_or_default().to_string())
            .collect())
    }

    /// Frame at `path`, or an empty frame of `rows` when no object exists.
    fn frame_or_empty(&mut self, path: &str, rows: usize) -> Result<DataFrame, ScError> {
        if !self.has_object(path)? {
            return Ok(DataFrame::empty(rows));
        }
        frame_loader::load_data_frame(&mut self.navigator, self.engines.h5.as_ref(), path)
    }

    fn assay_path(&mut self, experiment: Experiment, assay: usize) -> Result<String, ScError> {
        let path = self.experiment_path(experiment);
        let count = self.names(&navigator::join(&path, "assays"))?.len();
        if assay >= count {
            return Err(ScError::SelectorInvalid(format!("no assay #{assay} in '{path}'")));
        }
        Ok(navigator::join(&path, &format!("assays/{assay}")))
    }

    /// Reduced dimensions stored as dense arrays, with their paths.
    fn dense_reduced_dimensions(&mut self) -> Result<Vec<(String, String)>, ScError> {
        let directory = navigator::join(&self.prefix, "reduced_dimensions");
        let mut dense = Vec::new();
        for (index, name) in self.names(&directory)?.into_iter().enumerate() {
            let path = navigator::join(&directory, &index.to_string());
            let document = self.navigator.metadata(&path)?;
            match object_type(&document).as_deref() {
                Some("dense_array") => dense.push((name, path)),
                kind => tracing::warn!(name = %name, kind = ?kind, "skipping reduced dimension that is not a dense array"),
            }
        }
        Ok(dense)
    }
}

impl<N: Navigator> ExperimentSource for TakaneProject<N> {
    fn cells(&mut self) -> Result<DataFrame, ScError> {
        let document = self.experiment_document(Experiment::Main)?;
        let columns = experiment_dimensions(&document)?.columns;
        let path = navigator::join(&self.prefix, "column_data");
        self.frame_or_empty(&path, columns)
    }

    fn alternative_experiments(&mut self) -> Result<Vec<String>, ScError> {
        let directory = navigator::join(&self.prefix, "alternative_experiments");
        self.names(&directory)
    }

    fn features(&mut self, experiment: Experiment) -> Result<DataFrame, ScError> {
        let document = self.experiment_document(experiment)?;
        let rows = experiment_dimensions(&document)?.rows;
        let path = navigator::join(&self.experiment_path(experiment), "row_data");
        self.frame_or_empty(&path, rows)
    }

    fn assay_names(&mut self, experiment: Experiment) -> Result<Vec<String>, ScError> {
        let path = self.experiment_path(experiment);
        self.names(&navigator::join(&path, "assays"))
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
            .map(|(name, _)| name)
            .collect())
    }

    fn load_reduced_dimension(&mut self, name: &str) -> Result<Vec<Vec<f64>>, ScError> {
        let (_, path) = self
            .dense_reduced_dimensions()?
            .into_iter()
            .find(|(candidate, _)| candidate == name)
            .ok_or_else(|| ScError::SelectorInvalid(format!("no reduced dimension named '{name}'")))?;
        let matrix = assay::load_assay(&mut self.navigator, &self.engines, &path, false)?;
        project::matrix_columns(&matrix)
    }

    fn other_metadata(&mut self) -> Result<Value, ScError> {
        let path = navigator::join(&self.prefix, "other_data");
        if !self.has_object(&path)? {
            return Ok(Value::Object(Map::new()));
        }
        let document = self.navigator.metadata(&path)?;
        match object_type(&document).as_deref() {
            Some("simple_list") => {
                let contents = self.navigator.json(&navigator::join(&path, LIST_CONTENTS))?;
                project::uzuki2_to_json(&contents)
            }
            kind => {
                tracing::warn!(path = %path, kind = ?kind, "other data is not a simple list, ignoring");
                Ok(Value::Object(Map::new()))
            }
        }
    }

    fn clear(&mut self) {
        self.navigator.clear();
    }
}

/// Object roots in an archive whose `OBJECT` declares a SummarizedExperiment,
/// excluding objects nested inside another experiment.
pub fn search_zipped_alabaster(archive: &SharedArchive) -> Result<NamedMap<Dimensions>, ScError> {
    let mut candidates = Vec::new();
    for name in archive::entry_names(archive)? {
        let prefix = if name == OBJECT_FILE {
            ""
        } else if let Some(parent) = name.strip_suffix("/OBJECT") {
            parent
        } else {
            continue;
        };
        let bytes = archive::read_entry(archive, &name)?;
        let Ok(document) = navigator::parse_json(&name, &bytes) else {
            tracing::debug!(entry = %name, "skipping unparseable OBJECT file");
            continue;
        };
        if object_type(&document).is_some_and(|kind| project::is_experiment_type(&kind)) {
            candidates.push((prefix.to_string(), document));
        }
    }

    candidates.sort_by_key(|(prefix, _)| depth(prefix));
    let mut found = NamedMap::new();
    let mut accepted: Vec<String> = Vec::new();
    for (prefix, document) in candidates {
        let nested = accepted
            .iter()
            .any(|parent| parent.is_empty() || prefix.starts_with(&format!("{parent}/")));
        if nested {
            continue;
        }
        found.insert(prefix.clone(), experiment_dimensions(&document)?);
        accepted.push(prefix);
    }
    Ok(found)
}

fn depth(prefix: &str) -> usize {
    if prefix.is_empty() {
        0
    } else {
        prefix.matches('/').count() + 1
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;

    use super::*;
    use crate::archive::tests::build_zip;
    use crate::config::{ExperimentResultOptions, PerModality};
    use crate::engine::H5Node;
    use crate::file_ref::FileRef;
    use crate::h5::H5Values;
    use crate::navigator::{MetadataCache, MetadataLayout, ZipNavigator};

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn json_bytes(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    /// A 2x2 experiment whose only assay is a log-count tree over a sparse
    /// count seed, with one dense and one sparse reduced dimension.
    pub(crate) fn project_entries(prefix: &str) -> Vec<(String, Vec<u8>)> {
        let at = |path: &str| navigator::join(prefix, path);
        let seed = H5Node::group()
            .with_string_attribute("delayed_type", "array")
            .with_string_attribute("delayed_array", "custom takane seed array")
            .with_child("index", H5Node::dataset(Vec::new(), H5Values::Integer(vec![0])));
        let tree = crate::delayed::tests::log_norm_tree(seed, std::f64::consts::LN_2);
        let counts = H5Node::group().with_child(
            "compressed_sparse_matrix",
            H5Node::group()
                .with_attribute("shape", H5Values::Integer(vec![2, 2]))
                .with_string_attribute("layout", "CSC")
                .with_child("data", H5Node::integers(vec![1, 3, 2]))
                .with_child("indices", H5Node::integers(vec![0, 1, 0]))
                .with_child("indptr", H5Node::integers(vec![0, 2, 3])),
        );
        let pca = H5Node::group().with_child(
            "dense_array",
            H5Node::group().with_child("data", H5Node::dataset(vec![2, 2], H5Values::Float(vec![0.1, 0.2, 0.3, 0.4]))),
        );
        let list = json!({
            "type": "list",
            "names": ["study"],
            "values": [{"type": "string", "values": "pbmc"}]
        });
        vec![
            (
                at("OBJECT"),
                json_bytes(json!({
                    "type": "single_cell_experiment",
                    "summarized_experiment": {"version": "1.0", "dimensions": [2, 2]}
                })),
            ),
            (at("assays/names.json"), json_bytes(json!(["logcounts"]))),
            (at("assays/0/OBJECT"), json_bytes(json!({"type": "delayed_array"}))),
            (
                at("assays/0/array.h5"),
                H5Node::group().with_child("delayed_array", tree).to_bytes().unwrap(),
            ),
            (at("assays/0/seeds/0/OBJECT"), json_bytes(json!({"type": "compressed_sparse_matrix"}))),
            (at("assays/0/seeds/0/matrix.h5"), counts.to_bytes().unwrap()),
            (at("reduced_dimensions/names.json"), json_bytes(json!(["PCA", "graph"]))),
            (at("reduced_dimensions/0/OBJECT"), json_bytes(json!({"type": "dense_array"}))),
            (at("reduced_dimensions/0/array.h5"), pca.to_bytes().unwrap()),
            (
                at("reduced_dimensions/1/OBJECT"),
                json_bytes(json!({"type": "compressed_sparse_matrix"})),
            ),
            (at("other_data/OBJECT"), json_bytes(json!({"type": "simple_list"}))),
            (at("other_data/list_contents.json.gz"), gzip(&list.to_string())),
        ]
    }

    pub(crate) fn zip(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
        let borrowed: Vec<(&str, &[u8])> = entries.iter().map(|(n, b)| (n.as_str(), b.as_slice())).collect();
        build_zip(&borrowed)
    }

    fn open(prefix: &str) -> TakaneProject<MetadataCache<ZipNavigator>> {
        let file = FileRef::from_bytes(zip(&project_entries(prefix)), "project.zip").unwrap();
        let navigator = MetadataCache::new(ZipNavigator::new(file, MetadataLayout::Takane));
        TakaneProject::new(navigator, prefix, Engines::reference())
    }

    #[test]
    fn only_dense_reduced_dimensions_are_surfaced() {
        let mut source = open("sce");
        let summary = project::summarize_result(&mut source).unwrap();
        assert_eq!(summary.reduced_dimension_names, Some(vec!["PCA".to_string()]));
        assert_eq!(summary.other_metadata, Some(json!({"study": "pbmc"})));
        assert_eq!(summary.cells.row_count(), 2);
    }

    #[test]
    fn stored_log_counts_load_as_their_count_seed() {
        let engines = Engines::reference();
        let file = FileRef::from_bytes(zip(&project_entries("")), "project.zip").unwrap();
        let navigator = MetadataCache::new(ZipNavigator::new(file, MetadataLayout::Takane));
        let mut source = TakaneProject::new(navigator, "", engines.clone());

        let loaded = project::load_results(&mut source, &ExperimentResultOptions::default()).unwrap();
        assert_eq!(loaded.matrix.len(), 1);
        let counts = loaded.matrix.get("").unwrap();
        assert_eq!(counts.column(0).unwrap(), vec![1.0, 3.0]);
        assert_eq!(counts.column(1).unwrap(), vec![2.0, 0.0]);
        let pca = loaded.reduced_dimensions.as_ref().unwrap().get("PCA").unwrap();
        assert_eq!(pca, &vec![vec![0.1, 0.2], vec![0.3, 0.4]]);

        let options = ExperimentResultOptions {
            is_primary_normalized: PerModality::All(false),
            ..ExperimentResultOptions::default()
        };
        let renormalized = project::load_results(&mut source, &options).unwrap();
        assert_eq!(renormalized.matrix.len(), 1);
        // Stored size factors (0.5, 2.0) are centered to (0.4, 1.6).
        let column = renormalized.matrix.get("").unwrap().column(0).unwrap();
        assert!((column[0] - (1.0f64 + 1.0 / 0.4).log2()).abs() < 1e-12);

        drop((loaded, renormalized));
        assert_eq!(engines.matrix.live_handles(), 0);
    }

    #[test]
    fn search_prunes_nested_experiments() {
        let mut entries = project_entries("outer");
        entries.extend(project_entries("outer/alternative_experiments/0"));
        entries.extend(project_entries("second"));
        let file = FileRef::from_bytes(zip(&entries), "project.zip").unwrap();
        let archive = archive::open_archive(&file).unwrap();
        let found = search_zipped_alabaster(&archive).unwrap();
        assert_eq!(found.keys().collect::<Vec<_>>(), vec!["outer", "second"]);
    }
}
