use std::fs;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{NamedMap, ADT, CRISPR, RNA};
use crate::error::ScError;

pub const DEFAULT_RNA_FEATURE_TYPE: &str = "Gene Expression";
pub const DEFAULT_ADT_FEATURE_TYPE: &str = "Antibody Capture";
pub const DEFAULT_CRISPR_FEATURE_TYPE: &str = "CRISPR Guide Capture";

/// Picks an entry by position or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Selector {
    Index(usize),
    Name(String),
}

pub type ColumnSelector = Selector;
pub type AssaySelector = Selector;
pub type ExperimentSelector = Selector;

impl Selector {
    pub fn name(value: impl Into<String>) -> Self {
        Selector::Name(value.into())
    }

    /// Position of the selected entry among `names`.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Option<usize> {
        match self {
            Selector::Index(index) => (*index < names.len()).then_some(*index),
            Selector::Name(name) => names.iter().position(|candidate| candidate.as_ref() == name),
        }
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Index(index) => write!(f, "#{index}"),
            Selector::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// A setting given once for every modality, or per modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerModality<T> {
    All(T),
    Each(NamedMap<T>),
}

impl<T> PerModality<T> {
    /// Value for `modality`; `None` when a mapping omits it.
    pub fn get(&self, modality: &str) -> Option<&T> {
        match self {
            PerModality::All(value) => Some(value),
            PerModality::Each(map) => map.get(modality),
        }
    }
}

/// Options shared by the 10X HDF5 and Matrix Market readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TenxOptions {
    pub primary_rna_feature_id_column: Option<ColumnSelector>,
    pub primary_adt_feature_id_column: Option<ColumnSelector>,
    pub primary_crispr_feature_id_column: Option<ColumnSelector>,
    pub feature_type_rna_name: Option<String>,
    pub feature_type_adt_name: Option<String>,
    pub feature_type_crispr_name: Option<String>,
}

impl Default for TenxOptions {
    fn default() -> Self {
        Self {
            primary_rna_feature_id_column: Some(Selector::Index(0)),
            primary_adt_feature_id_column: Some(Selector::Index(0)),
            primary_crispr_feature_id_column: Some(Selector::Index(0)),
            feature_type_rna_name: Some(DEFAULT_RNA_FEATURE_TYPE.to_string()),
            feature_type_adt_name: Some(DEFAULT_ADT_FEATURE_TYPE.to_string()),
            feature_type_crispr_name: Some(DEFAULT_CRISPR_FEATURE_TYPE.to_string()),
        }
    }
}

impl TenxOptions {
    pub fn feature_type_labels(&self) -> NamedMap<Option<String>> {
        feature_type_labels(
            &self.feature_type_rna_name,
            &self.feature_type_adt_name,
            &self.feature_type_crispr_name,
        )
    }

    pub fn primary_id_columns(&self) -> NamedMap<Option<ColumnSelector>> {
        primary_id_columns(
            &self.primary_rna_feature_id_column,
            &self.primary_adt_feature_id_column,
            &self.primary_crispr_feature_id_column,
        )
    }
}

pub type MatrixMarketOptions = TenxOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct H5adOptions {
    /// `X` or a `layers/*` name; `None` picks `X` or the first layer.
    pub count_matrix_name: Option<String>,
    pub feature_type_column_name: Option<String>,
    pub feature_type_rna_name: Option<String>,
    pub feature_type_adt_name: Option<String>,
    pub feature_type_crispr_name: Option<String>,
    pub primary_rna_feature_id_column: Option<ColumnSelector>,
    pub primary_adt_feature_id_column: Option<ColumnSelector>,
    pub primary_crispr_feature_id_column: Option<ColumnSelector>,
}

impl Default for H5adOptions {
    fn default() -> Self {
        Self {
            count_matrix_name: None,
            feature_type_column_name: None,
            feature_type_rna_name: Some(DEFAULT_RNA_FEATURE_TYPE.to_string()),
            feature_type_adt_name: Some(DEFAULT_ADT_FEATURE_TYPE.to_string()),
            feature_type_crispr_name: Some(DEFAULT_CRISPR_FEATURE_TYPE.to_string()),
            primary_rna_feature_id_column: None,
            primary_adt_feature_id_column: None,
            primary_crispr_feature_id_column: None,
        }
    }
}

impl H5adOptions {
    pub fn feature_type_labels(&self) -> NamedMap<Option<String>> {
        feature_type_labels(
            &self.feature_type_rna_name,
            &self.feature_type_adt_name,
            &self.feature_type_crispr_name,
        )
    }

    pub fn primary_id_columns(&self) -> NamedMap<Option<ColumnSelector>> {
        primary_id_columns(
            &self.primary_rna_feature_id_column,
            &self.primary_adt_feature_id_column,
            &self.primary_crispr_feature_id_column,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct H5adResultOptions {
    pub primary_matrix_name: Option<String>,
    pub is_primary_normalized: bool,
    pub feature_type_column_name: Option<String>,
    pub reduced_dimension_names: Option<Vec<String>>,
}

impl Default for H5adResultOptions {
    fn default() -> Self {
        Self {
            primary_matrix_name: None,
            is_primary_normalized: true,
            feature_type_column_name: None,
            reduced_dimension_names: None,
        }
    }
}

/// Options of the experiment-backed readers (RDS, ArtifactDB, alabaster).
///
/// An experiment selector of `""` is the main experiment, a name or index
/// picks an alternative experiment, and `None` skips the modality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExperimentOptions {
    pub rna_count_assay: Option<AssaySelector>,
    pub adt_count_assay: Option<AssaySelector>,
    pub crispr_count_assay: Option<AssaySelector>,
    pub rna_experiment: Option<ExperimentSelector>,
    pub adt_experiment: Option<ExperimentSelector>,
    pub crispr_experiment: Option<ExperimentSelector>,
    pub primary_rna_feature_id_column: Option<ColumnSelector>,
    pub primary_adt_feature_id_column: Option<ColumnSelector>,
    pub primary_crispr_feature_id_column: Option<ColumnSelector>,
}

impl Default for ExperimentOptions {
    fn default() -> Self {
        Self {
            rna_count_assay: Some(Selector::Index(0)),
            adt_count_assay: Some(Selector::Index(0)),
            crispr_count_assay: Some(Selector::Index(0)),
            rna_experiment: Some(Selector::name("")),
            adt_experiment: Some(Selector::name(DEFAULT_ADT_FEATURE_TYPE)),
            crispr_experiment: Some(Selector::name(DEFAULT_CRISPR_FEATURE_TYPE)),
            primary_rna_feature_id_column: None,
            primary_adt_feature_id_column: None,
            primary_crispr_feature_id_column: None,
        }
    }
}

impl ExperimentOptions {
    /// Per modality: which experiment and which assay to load.
    pub fn bindings(&self) -> NamedMap<(Option<ExperimentSelector>, Option<AssaySelector>)> {
        [
            (RNA, (self.rna_experiment.clone(), self.rna_count_assay.clone())),
            (ADT, (self.adt_experiment.clone(), self.adt_count_assay.clone())),
            (CRISPR, (self.crispr_experiment.clone(), self.crispr_count_assay.clone())),
        ]
        .into_iter()
        .collect()
    }

    pub fn primary_id_columns(&self) -> NamedMap<Option<ColumnSelector>> {
        primary_id_columns(
            &self.primary_rna_feature_id_column,
            &self.primary_adt_feature_id_column,
            &self.primary_crispr_feature_id_column,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExperimentResultOptions {
    pub primary_assay: PerModality<AssaySelector>,
    pub is_primary_normalized: PerModality<bool>,
    pub reduced_dimension_names: Option<Vec<String>>,
}

impl Default for ExperimentResultOptions {
    fn default() -> Self {
        Self {
            primary_assay: PerModality::All(Selector::Index(0)),
            is_primary_normalized: PerModality::All(true),
            reduced_dimension_names: None,
        }
    }
}

fn feature_type_labels(rna: &Option<String>, adt: &Option<String>, crispr: &Option<String>) -> NamedMap<Option<String>> {
    [(RNA, rna.clone()), (ADT, adt.clone()), (CRISPR, crispr.clone())]
        .into_iter()
        .collect()
}

fn primary_id_columns(
    rna: &Option<ColumnSelector>,
    adt: &Option<ColumnSelector>,
    crispr: &Option<ColumnSelector>,
) -> NamedMap<Option<ColumnSelector>> {
    [(RNA, rna.clone()), (ADT, adt.clone()), (CRISPR, crispr.clone())]
        .into_iter()
        .collect()
}

/// Applies a partial options object on top of `current`. Keys the options
/// type does not recognize are rejected.
pub fn merge_options<T: Serialize + DeserializeOwned>(current: &T, partial: &Value) -> Result<T, ScError> {
    let Value::Object(partial) = partial else {
        return Err(ScError::Config("options must be a JSON object".to_string()));
    };
    let mut merged = match serde_json::to_value(current) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(ScError::Config("options do not serialize to an object".to_string())),
        Err(err) => return Err(ScError::Config(err.to_string())),
    };
    for (key, value) in partial {
        if !merged.contains_key(key) {
            return Err(ScError::Config(format!("unknown option '{key}'")));
        }
        merged.insert(key.clone(), value.clone());
    }
    serde_json::from_value(Value::Object(merged)).map_err(|err| ScError::Config(err.to_string()))
}

pub fn to_options_value<T: Serialize>(options: &T) -> Result<Value, ScError> {
    serde_json::to_value(options).map_err(|err| ScError::Config(err.to_string()))
}

/// Reads a JSON options object from disk.
pub fn read_options_file(path: &Utf8Path) -> Result<Value, ScError> {
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|err| ScError::Filesystem(format!("read {path}: {err}")))?;
    serde_json::from_str(&content).map_err(|err| ScError::json(path.as_str(), err))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn defaults_use_wire_names() {
        let value = to_options_value(&TenxOptions::default()).unwrap();
        assert_eq!(value["featureTypeRnaName"], json!("Gene Expression"));
        assert_eq!(value["primaryRnaFeatureIdColumn"], json!(0));

        let value = to_options_value(&ExperimentOptions::default()).unwrap();
        assert_eq!(value["rnaExperiment"], json!(""));
        assert_eq!(value["adtExperiment"], json!("Antibody Capture"));
        assert_eq!(value["primaryRnaFeatureIdColumn"], json!(null));
    }

    #[test]
    fn partial_merges_keep_other_fields() {
        let merged = merge_options(
            &ExperimentOptions::default(),
            &json!({ "rnaCountAssay": "counts", "adtExperiment": null }),
        )
        .unwrap();
        assert_eq!(merged.rna_count_assay, Some(Selector::name("counts")));
        assert_eq!(merged.adt_experiment, None);
        assert_eq!(merged.crispr_count_assay, Some(Selector::Index(0)));

        let err = merge_options(&ExperimentOptions::default(), &json!({ "bogus": 1 })).unwrap_err();
        assert_matches!(err, ScError::Config(_));
        assert_matches!(merge_options(&TenxOptions::default(), &json!([1])), Err(ScError::Config(_)));
    }

    #[test]
    fn per_modality_settings_accept_scalars_and_maps() {
        let scalar: PerModality<bool> = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(scalar.get("anything"), Some(&false));

        let mapped: PerModality<Selector> = serde_json::from_value(json!({ "": "logcounts", "ADT": 1 })).unwrap();
        assert_eq!(mapped.get(""), Some(&Selector::name("logcounts")));
        assert_eq!(mapped.get("ADT"), Some(&Selector::Index(1)));
        assert_eq!(mapped.get("CRISPR"), None);
    }

    #[test]
    fn selectors_resolve_by_name_or_index() {
        let names = ["counts", "logcounts"];
        assert_eq!(Selector::name("logcounts").resolve(&names), Some(1));
        assert_eq!(Selector::Index(1).resolve(&names), Some(1));
        assert_eq!(Selector::Index(2).resolve(&names), None);
        assert_eq!(Selector::name("x").resolve(&names), None);
    }
}
