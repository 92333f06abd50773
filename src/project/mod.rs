//! Experiment-shaped inputs: SummarizedExperiment objects from RDS files
//! and from ArtifactDB or takane project directories.
//!
//! Each layout implements [`ExperimentSource`]; summaries, modality loads
//! and result loads are written once against that trait.

pub mod artifactdb;
pub mod rds;
pub mod takane;

use serde_json::{Map, Number, Value};

use crate::assay::{self, DecomposedAssay};
use crate::config::{AssaySelector, ExperimentOptions, ExperimentResultOptions, ExperimentSelector};
use crate::dataset::{add_normalized, Loaded, PrimaryIds, Summary};
use crate::domain::{ModalityMap, NamedMap};
use crate::error::ScError;
use crate::features::{self, PrimaryIdFallback};
use crate::frame::DataFrame;
use crate::matrix::{MatrixHandle, MultiMatrix};

pub use artifactdb::{search_zipped_artifactdb, ArtifactDbProject};
pub use rds::RdsExperiment;
pub use takane::{search_zipped_alabaster, TakaneProject};

/// Object types and schema prefixes of the SummarizedExperiment family.
pub const EXPERIMENT_TYPES: [&str; 4] = [
    "summarized_experiment",
    "ranged_summarized_experiment",
    "single_cell_experiment",
    "spatial_experiment",
];

pub fn is_experiment_type(kind: &str) -> bool {
    EXPERIMENT_TYPES.contains(&kind)
}

/// The main experiment, or an alternative experiment by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Experiment {
    Main,
    Alternative(usize),
}

pub trait ExperimentSource {
    fn cells(&mut self) -> Result<DataFrame, ScError>;

    /// Names of the alternative experiments, in stored order.
    fn alternative_experiments(&mut self) -> Result<Vec<String>, ScError>;

    fn features(&mut self, experiment: Experiment) -> Result<DataFrame, ScError>;

    fn assay_names(&mut self, experiment: Experiment) -> Result<Vec<String>, ScError>;

    fn load_assay(&mut self, experiment: Experiment, assay: usize, force_integer: bool) -> Result<MatrixHandle, ScError>;

    /// Loads an assay, splitting stored log-counts into counts and size
    /// factors where the layout allows it.
    fn load_assay_decomposed(
        &mut self,
        experiment: Experiment,
        assay: usize,
        force_integer: bool,
    ) -> Result<DecomposedAssay, ScError> {
        Ok(DecomposedAssay {
            matrix: self.load_assay(experiment, assay, force_integer)?,
            size_factors: None,
        })
    }

    fn reduced_dimension_names(&mut self) -> Result<Vec<String>, ScError>;

    /// One vector of cell coordinates per component.
    fn load_reduced_dimension(&mut self, name: &str) -> Result<Vec<Vec<f64>>, ScError>;

    fn other_metadata(&mut self) -> Result<Value, ScError>;

    /// Drops cached documents and objects.
    fn clear(&mut self);
}

/// An empty selector picks the main experiment, a name or index an
/// alternative one. Selectors that match nothing yield `None`.
pub fn resolve_experiment(alternatives: &[String], selector: &ExperimentSelector) -> Option<Experiment> {
    match selector {
        ExperimentSelector::Name(name) if name.is_empty() => Some(Experiment::Main),
        other => other.resolve(alternatives).map(Experiment::Alternative),
    }
}

/// The summary key of an experiment: `""` for the main one.
pub fn experiment_key(alternatives: &[String], experiment: Experiment) -> String {
    match experiment {
        Experiment::Main => String::new(),
        Experiment::Alternative(index) => alternatives.get(index).cloned().unwrap_or_default(),
    }
}

fn all_experiments(alternatives: &[String]) -> Vec<Experiment> {
    std::iter::once(Experiment::Main)
        .chain((0..alternatives.len()).map(Experiment::Alternative))
        .collect()
}

/// Features of an alternative experiment, or `None` with a warning when
/// they cannot be read.
fn optional_features(
    source: &mut dyn ExperimentSource,
    alternatives: &[String],
    experiment: Experiment,
) -> Result<Option<DataFrame>, ScError> {
    match source.features(experiment) {
        Ok(frame) => Ok(Some(frame)),
        Err(err) if experiment != Experiment::Main => {
            tracing::warn!(
                experiment = %experiment_key(alternatives, experiment),
                error = %err,
                "skipping alternative experiment with unreadable features"
            );
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Features and assay names of every experiment, keyed by experiment name.
pub fn summarize(source: &mut dyn ExperimentSource) -> Result<Summary, ScError> {
    let cells = source.cells()?;
    let alternatives = source.alternative_experiments()?;

    let mut modality_features = NamedMap::new();
    let mut modality_assay_names = NamedMap::new();
    for experiment in all_experiments(&alternatives) {
        let Some(frame) = optional_features(source, &alternatives, experiment)? else {
            continue;
        };
        let key = experiment_key(&alternatives, experiment);
        modality_assay_names.insert(key.clone(), source.assay_names(experiment)?);
        modality_features.insert(key, frame);
    }

    let mut summary = Summary::new(modality_features, cells);
    summary.modality_assay_names = Some(modality_assay_names);
    Ok(summary)
}

/// [`summarize`] plus reduced dimension names and other metadata.
pub fn summarize_result(source: &mut dyn ExperimentSource) -> Result<Summary, ScError> {
    let mut summary = summarize(source)?;
    summary.reduced_dimension_names = Some(source.reduced_dimension_names()?);
    summary.other_metadata = Some(source.other_metadata()?);
    Ok(summary)
}

/// Experiments bound to each modality; modalities whose experiment
/// selector is unset or matches nothing are skipped.
fn bound_experiments(
    alternatives: &[String],
    options: &ExperimentOptions,
) -> Vec<(String, Experiment, Option<AssaySelector>)> {
    options
        .bindings()
        .into_iter()
        .filter_map(|(modality, (experiment, assay))| {
            let selector = experiment?;
            match resolve_experiment(alternatives, &selector) {
                Some(experiment) => Some((modality, experiment, assay)),
                None => {
                    tracing::debug!(modality = %modality, experiment = %selector, "experiment not found, skipping modality");
                    None
                }
            }
        })
        .collect()
}

/// Loads one count assay per modality.
pub fn load_modalities(source: &mut dyn ExperimentSource, options: &ExperimentOptions) -> Result<Loaded, ScError> {
    let cells = source.cells()?;
    let alternatives = source.alternative_experiments()?;

    let mut matrix = MultiMatrix::new();
    let mut feature_tables = NamedMap::new();
    let mut row_ids = NamedMap::new();
    for (modality, experiment, assay) in bound_experiments(&alternatives, options) {
        let Some(assay) = assay else {
            continue;
        };
        let Some(frame) = optional_features(source, &alternatives, experiment)? else {
            continue;
        };
        let names = source.assay_names(experiment)?;
        let index = assay::resolve_assay(&names, &assay)?;
        let handle = source.load_assay(experiment, index, true)?;
        check_shape(&modality, &frame, &cells, &handle)?;
        row_ids.insert(modality.clone(), (0..frame.row_count()).collect());
        feature_tables.insert(modality.clone(), frame);
        matrix.add(modality, handle)?;
    }

    let primary_ids = features::extract_primary_ids(
        &feature_tables,
        &options.primary_id_columns(),
        PrimaryIdFallback::RowNames,
    );
    Ok(Loaded {
        matrix,
        features: feature_tables,
        cells,
        primary_ids,
        row_ids,
        reduced_dimensions: None,
        other_metadata: None,
    })
}

/// Primary identifiers of every bound modality, without loading matrices.
pub fn preview_modalities(
    source: &mut dyn ExperimentSource,
    options: &ExperimentOptions,
) -> Result<PrimaryIds, ScError> {
    let alternatives = source.alternative_experiments()?;
    let mut feature_tables = NamedMap::new();
    for (modality, experiment, assay) in bound_experiments(&alternatives, options) {
        if assay.is_none() {
            continue;
        }
        if let Some(frame) = optional_features(source, &alternatives, experiment)? {
            feature_tables.insert(modality, frame);
        }
    }
    Ok(features::extract_primary_ids(
        &feature_tables,
        &options.primary_id_columns(),
        PrimaryIdFallback::RowNames,
    ))
}

/// Loads the primary assay of every experiment, keyed by experiment name,
/// normalizing the ones flagged as raw counts.
pub fn load_results(
    source: &mut dyn ExperimentSource,
    options: &ExperimentResultOptions,
) -> Result<Loaded, ScError> {
    let cells = source.cells()?;
    let alternatives = source.alternative_experiments()?;

    let mut matrix = MultiMatrix::new();
    let mut feature_tables: ModalityMap<DataFrame> = NamedMap::new();
    let mut row_ids = NamedMap::new();
    for experiment in all_experiments(&alternatives) {
        let key = experiment_key(&alternatives, experiment);
        let Some(selector) = options.primary_assay.get(&key) else {
            continue;
        };
        let Some(frame) = optional_features(source, &alternatives, experiment)? else {
            continue;
        };
        let names = source.assay_names(experiment)?;
        let index = assay::resolve_assay(&names, selector)?;
        let normalized = options.is_primary_normalized.get(&key).copied().unwrap_or(true);

        // Stored log-counts come back as their count seed either way.
        let DecomposedAssay { matrix: raw, size_factors } =
            source.load_assay_decomposed(experiment, index, !normalized)?;
        check_shape(&key, &frame, &cells, &raw)?;
        if normalized {
            matrix.add(key.clone(), raw)?;
        } else {
            add_normalized(&mut matrix, &key, raw, size_factors.as_deref())?;
        }
        row_ids.insert(key.clone(), (0..frame.row_count()).collect());
        feature_tables.insert(key, frame);
    }

    let primary_ids = features::extract_primary_ids(&feature_tables, &NamedMap::new(), PrimaryIdFallback::RowNames);
    let reduced_dimensions = load_reduced_dimensions(source, options.reduced_dimension_names.as_deref())?;
    let other_metadata = source.other_metadata()?;
    Ok(Loaded {
        matrix,
        features: feature_tables,
        cells,
        primary_ids,
        row_ids,
        reduced_dimensions: Some(reduced_dimensions),
        other_metadata: Some(other_metadata),
    })
}

fn load_reduced_dimensions(
    source: &mut dyn ExperimentSource,
    chosen: Option<&[String]>,
) -> Result<NamedMap<Vec<Vec<f64>>>, ScError> {
    let available = source.reduced_dimension_names()?;
    let names: Vec<String> = match chosen {
        None => available,
        Some(chosen) => chosen
            .iter()
            .filter(|name| {
                let found = available.contains(name);
                if !found {
                    tracing::warn!(name = %name, "requested reduced dimension is not available");
                }
                found
            })
            .cloned()
            .collect(),
    };
    names
        .into_iter()
        .map(|name| {
            let values = source.load_reduced_dimension(&name)?;
            Ok((name, values))
        })
        .collect()
}

fn check_shape(key: &str, features: &DataFrame, cells: &DataFrame, matrix: &MatrixHandle) -> Result<(), ScError> {
    if features.row_count() != matrix.number_of_rows() {
        return Err(ScError::DimensionMismatch(format!(
            "experiment '{key}' has {} features but its assay has {} rows",
            features.row_count(),
            matrix.number_of_rows()
        )));
    }
    if cells.row_count() != matrix.number_of_columns() {
        return Err(ScError::DimensionMismatch(format!(
            "experiment '{key}' has {} cells but its assay has {} columns",
            cells.row_count(),
            matrix.number_of_columns()
        )));
    }
    Ok(())
}

/// Every column of a cells-by-components matrix.
pub fn matrix_columns(matrix: &MatrixHandle) -> Result<Vec<Vec<f64>>, ScError> {
    (0..matrix.number_of_columns()).map(|j| matrix.column(j)).collect()
}

/// Converts an uzuki2 list document into plain JSON. Named lists become
/// objects, vectors of length one with a scalar `values` become plain
/// values, and factors are expanded to their levels.
pub fn uzuki2_to_json(node: &Value) -> Result<Value, ScError> {
    let kind = node
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ScError::RequiredFieldMissing("uzuki2 'type'".to_string()))?;
    match kind {
        "list" => {
            let values = node
                .get("values")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let converted = values.iter().map(uzuki2_to_json).collect::<Result<Vec<_>, _>>()?;
            match node.get("names").and_then(Value::as_array) {
                Some(names) => {
                    let object: Map<String, Value> = names
                        .iter()
                        .map(|name| name.as_str().unwrap_or_default().to_string())
                        .zip(converted)
                        .collect();
                    Ok(Value::Object(object))
                }
                None => Ok(Value::Array(converted)),
            }
        }
        "nothing" => Ok(Value::Null),
        "external" => {
            tracing::warn!("dropping external object from list metadata");
            Ok(Value::Null)
        }
        "factor" => {
            let levels = node.get("levels").and_then(Value::as_array).cloned().unwrap_or_default();
            let expand = |code: &Value| {
                code.as_u64()
                    .and_then(|code| levels.get(code as usize).cloned())
                    .unwrap_or(Value::Null)
            };
            Ok(match node.get("values") {
                Some(Value::Array(codes)) => Value::Array(codes.iter().map(expand).collect()),
                Some(code) => expand(code),
                None => Value::Null,
            })
        }
        "integer" | "number" | "string" | "boolean" | "date" | "date-time" => {
            Ok(node.get("values").cloned().unwrap_or(Value::Null))
        }
        other => Err(ScError::SchemaUnknown(format!("unknown uzuki2 type '{other}'"))),
    }
}

/// Finite floats as JSON numbers, anything else as `null`.
pub(crate) fn json_number(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::config::Selector;
    use crate::engine::{MemoryH5Engine, MemoryMatrixEngine};
    use crate::matrix::MatrixEngine;

    /// A main experiment of two features whose only assay is 2 x 3.
    struct FixedSource {
        engine: Arc<MemoryMatrixEngine>,
        cells: usize,
    }

    impl FixedSource {
        fn new(cells: usize) -> Self {
            Self {
                engine: Arc::new(MemoryMatrixEngine::new(Arc::new(MemoryH5Engine))),
                cells,
            }
        }
    }

    impl ExperimentSource for FixedSource {
        fn cells(&mut self) -> Result<DataFrame, ScError> {
            Ok(DataFrame::empty(self.cells))
        }

        fn alternative_experiments(&mut self) -> Result<Vec<String>, ScError> {
            Ok(Vec::new())
        }

        fn features(&mut self, _experiment: Experiment) -> Result<DataFrame, ScError> {
            Ok(DataFrame::empty(2))
        }

        fn assay_names(&mut self, _experiment: Experiment) -> Result<Vec<String>, ScError> {
            Ok(vec!["counts".to_string()])
        }

        fn load_assay(
            &mut self,
            _experiment: Experiment,
            _assay: usize,
            _force_integer: bool,
        ) -> Result<MatrixHandle, ScError> {
            let id = self.engine.insert_dense(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])?;
            let engine: Arc<dyn MatrixEngine> = self.engine.clone();
            MatrixHandle::adopt(engine, id)
        }

        fn reduced_dimension_names(&mut self) -> Result<Vec<String>, ScError> {
            Ok(Vec::new())
        }

        fn load_reduced_dimension(&mut self, name: &str) -> Result<Vec<Vec<f64>>, ScError> {
            Err(ScError::SelectorInvalid(name.to_string()))
        }

        fn other_metadata(&mut self) -> Result<Value, ScError> {
            Ok(json!({}))
        }

        fn clear(&mut self) {}
    }

    #[test]
    fn assay_columns_must_match_the_cells() {
        let mut source = FixedSource::new(5);
        assert_matches!(
            load_modalities(&mut source, &ExperimentOptions::default()),
            Err(ScError::DimensionMismatch(message)) if message.contains("5 cells") && message.contains("3 columns")
        );
        assert_matches!(
            load_results(&mut source, &ExperimentResultOptions::default()),
            Err(ScError::DimensionMismatch(_))
        );
        assert_eq!(source.engine.live_handles(), 0);

        let mut matching = FixedSource::new(3);
        let loaded = load_modalities(&mut matching, &ExperimentOptions::default()).unwrap();
        assert_eq!(loaded.matrix.get("RNA").unwrap().number_of_columns(), loaded.cells.row_count());
    }

    #[test]
    fn experiment_selectors_resolve_against_alternatives() {
        let alternatives = vec!["ADT".to_string(), "CRISPR".to_string()];
        assert_eq!(resolve_experiment(&alternatives, &Selector::name("")), Some(Experiment::Main));
        assert_eq!(
            resolve_experiment(&alternatives, &Selector::name("CRISPR")),
            Some(Experiment::Alternative(1))
        );
        assert_eq!(resolve_experiment(&alternatives, &Selector::Index(0)), Some(Experiment::Alternative(0)));
        assert_eq!(resolve_experiment(&alternatives, &Selector::Index(2)), None);
        assert_eq!(resolve_experiment(&alternatives, &Selector::name("HTO")), None);
        assert_eq!(experiment_key(&alternatives, Experiment::Alternative(1)), "CRISPR");
    }

    #[test]
    fn converts_uzuki2_lists() {
        let document = json!({
            "type": "list",
            "names": ["title", "sizes", "groups", "empty"],
            "values": [
                {"type": "string", "values": "pbmc"},
                {"type": "integer", "values": [1, 2]},
                {"type": "factor", "values": [1, 0], "levels": ["a", "b"]},
                {"type": "nothing"}
            ]
        });
        assert_eq!(
            uzuki2_to_json(&document).unwrap(),
            json!({"title": "pbmc", "sizes": [1, 2], "groups": ["b", "a"], "empty": null})
        );
    }
}
