//! AnnData files (`.h5ad`).
//!
//! `X` holds the counts unless absent, in which case the first entry of
//! `layers` is used. AnnData stores cells by genes; every matrix is exposed
//! as genes by cells.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::config::{self, H5adOptions, H5adResultOptions};
use crate::dataset::{
    add_normalized, apply_options, single_file, Dataset, DatasetFile, Loaded, Persistable, PrimaryIds, ReaderMode, Summary,
    Unserialize,
};
use crate::domain::{FormatTag, NamedMap};
use crate::engine::Engines;
use crate::error::ScError;
use crate::features::{self, PrimaryIdFallback, SplitMatrix};
use crate::file_ref::FileRef;
use crate::frame::{Column, DataFrame, Factor};
use crate::h5::{self, H5Dataset, H5Group, H5Kind, H5Values};
use crate::lifecycle::{self, DatasetState, LazyH5};
use crate::matrix::{Dimensions, MatrixHandle, MultiMatrix};

const LAYERS: &str = "layers";
const LEGACY_CATEGORIES: &str = "__categories";
const DEFAULT_INDEX: &str = "_index";
static NAME_LIKE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new("(?i)(name|symb)"));

/// Everything decoded from one opened file.
#[derive(Debug, Clone)]
struct Contents {
    assay_names: Vec<String>,
    dimensions: Dimensions,
    features: DataFrame,
    cells: DataFrame,
}

/// The file, its open handle and the decoded annotations, shared by the
/// dataset and result readers.
#[derive(Debug)]
struct H5adSource {
    h5: LazyH5,
    engines: Engines,
    state: DatasetState,
    contents: Option<Contents>,
}

impl H5adSource {
    fn new(file: FileRef, engines: Engines) -> Self {
        Self {
            h5: LazyH5::new(file),
            engines,
            state: DatasetState::Fresh,
            contents: None,
        }
    }

    fn contents(&mut self, type_column: Option<&str>) -> Result<&Contents, ScError> {
        let contents = match self.contents.take() {
            Some(contents) => contents,
            None => self.read_contents(type_column)?,
        };
        self.state = DatasetState::Populated;
        Ok(self.contents.insert(contents))
    }

    fn read_contents(&mut self, type_column: Option<&str>) -> Result<Contents, ScError> {
        let file_name = self.h5.file().name().to_string();
        let opened = self.h5.open(self.engines.h5.as_ref())?;
        self.state = DatasetState::Opened;
        let root = opened.root.as_ref();

        let assay_names = assay_names(root)?;
        let Some(first) = assay_names.first() else {
            return Err(ScError::RequiredFieldMissing(format!(
                "{file_name} has neither X nor any layers"
            )));
        };
        let dimensions = self.engines.matrix.hdf5_matrix_details(opened.path(), first)?;
        let features = read_var(root, dimensions.rows, type_column)?;
        let cells = read_obs(root, dimensions.columns)?;
        Ok(Contents {
            assay_names,
            dimensions,
            features,
            cells,
        })
    }

    /// Loads one assay as a genes by cells matrix.
    fn load_assay(&mut self, name: &str, force_integer: bool) -> Result<MatrixHandle, ScError> {
        let opened = self.h5.open(self.engines.h5.as_ref())?;
        let id = self.engines.matrix.sparse_from_hdf5(opened.path(), name, force_integer)?;
        let handle = MatrixHandle::adopt(self.engines.matrix.clone(), id)?;
        let expected = self.contents.as_ref().map(|contents| contents.dimensions);
        if let Some(expected) = expected.filter(|expected| *expected != handle.dimensions()) {
            return Err(ScError::DimensionMismatch(format!(
                "'{name}' is {}x{} but X is {}x{}",
                handle.number_of_rows(),
                handle.number_of_columns(),
                expected.rows,
                expected.columns
            )));
        }
        Ok(handle)
    }

    fn root(&mut self) -> Result<&dyn H5Group, ScError> {
        Ok(self.h5.open(self.engines.h5.as_ref())?.root.as_ref())
    }

    fn clear(&mut self) {
        self.h5.close();
        self.contents = None;
        if self.state != DatasetState::Fresh {
            self.state = DatasetState::Cleared;
        }
    }
}

/// `X` first, then every `layers/*` entry.
fn assay_names(root: &dyn H5Group) -> Result<Vec<String>, ScError> {
    let mut names = Vec::new();
    if root.child_kind("X").is_some() {
        names.push("X".to_string());
    }
    if root.child_kind(LAYERS) == Some(H5Kind::Group) {
        let layers = root.group(LAYERS)?;
        names.extend(layers.children().into_iter().map(|(name, _)| format!("{LAYERS}/{name}")));
    }
    Ok(names)
}

fn choose_assay(names: &[String], requested: Option<&str>) -> Result<String, ScError> {
    match requested {
        Some(name) if names.iter().any(|candidate| candidate == name) => Ok(name.to_string()),
        Some(name) => Err(ScError::SelectorInvalid(format!(
            "no assay named '{name}', available: {}",
            names.join(", ")
        ))),
        None => names
            .first()
            .cloned()
            .ok_or_else(|| ScError::RequiredFieldMissing("X".to_string())),
    }
}

fn name_like() -> Result<&'static Regex, ScError> {
    NAME_LIKE.as_ref().map_err(|err| ScError::Config(err.to_string()))
}

/// The index, name- or symbol-like string columns, and the type column.
fn read_var(root: &dyn H5Group, rows: usize, type_column: Option<&str>) -> Result<DataFrame, ScError> {
    let mut frame = DataFrame::empty(rows);
    if root.child_kind("var") != Some(H5Kind::Group) {
        return Ok(frame);
    }
    let var = root.group("var")?;
    let index = h5::string_attribute(var.as_ref(), DEFAULT_INDEX)?.unwrap_or_else(|| DEFAULT_INDEX.to_string());
    let categories = legacy_categories(var.as_ref())?;

    if let Some(ids) = h5::extract_strings(var.as_ref(), &index)? {
        check_length("var", &index, ids.len(), rows)?;
        frame.add_column(index.clone(), Column::strings(ids.iter().cloned()))?;
        frame.set_row_names(Some(ids))?;
    }

    let pattern = name_like()?;
    for (name, _) in var.children() {
        if name == index || name == LEGACY_CATEGORIES || frame.has_column(&name) {
            continue;
        }
        let wanted = Some(name.as_str()) == type_column;
        if !wanted && !pattern.is_match(&name) {
            continue;
        }
        if let Some(column) = decode_column(var.as_ref(), &name, &categories)? {
            let is_string = matches!(column, Column::String(_));
            if wanted || is_string {
                check_length("var", &name, column.len(), rows)?;
                frame.add_column(name, column)?;
            }
        }
    }
    Ok(frame)
}

/// Every column of `obs`, with categorical columns expanded.
fn read_obs(root: &dyn H5Group, rows: usize) -> Result<DataFrame, ScError> {
    let mut frame = DataFrame::empty(rows);
    if root.child_kind("obs") != Some(H5Kind::Group) {
        return Ok(frame);
    }
    let obs = root.group("obs")?;
    let categories = legacy_categories(obs.as_ref())?;
    for (name, _) in obs.children() {
        if name == LEGACY_CATEGORIES {
            continue;
        }
        match decode_column(obs.as_ref(), &name, &categories)? {
            Some(column) => {
                check_length("obs", &name, column.len(), rows)?;
                frame.add_column(name, column)?;
            }
            None => tracing::debug!(column = %name, "skipping undecodable obs entry"),
        }
    }
    Ok(frame)
}

fn check_length(group: &str, name: &str, found: usize, expected: usize) -> Result<(), ScError> {
    if found == expected {
        return Ok(());
    }
    Err(ScError::DimensionMismatch(format!(
        "{group}/{name} has {found} entries, expected {expected}"
    )))
}

/// Level tables of the legacy `__categories` group, keyed by column.
fn legacy_categories(group: &dyn H5Group) -> Result<NamedMap<Vec<String>>, ScError> {
    let mut levels = NamedMap::new();
    if group.child_kind(LEGACY_CATEGORIES) != Some(H5Kind::Group) {
        return Ok(levels);
    }
    let categories = group.group(LEGACY_CATEGORIES)?;
    for (name, kind) in categories.children() {
        if kind != H5Kind::Dataset {
            continue;
        }
        if let Some(values) = h5::extract_strings(categories.as_ref(), &name)? {
            levels.insert(name, values);
        }
    }
    Ok(levels)
}

/// Decodes one annotation column: a plain dataset, a dataset with legacy
/// categories, or a `codes`/`categories` group.
fn decode_column(
    group: &dyn H5Group,
    name: &str,
    legacy: &NamedMap<Vec<String>>,
) -> Result<Option<Column>, ScError> {
    match group.child_kind(name) {
        Some(H5Kind::Dataset) => {
            let dataset = group.dataset(name)?;
            match legacy.get(name) {
                Some(levels) => Ok(factor_column(dataset.as_ref(), levels.clone())?),
                None => Ok(plain_column(dataset.as_ref())?),
            }
        }
        Some(H5Kind::Group) => {
            let categorical = group.group(name)?;
            let has = |child: &str| categorical.child_kind(child) == Some(H5Kind::Dataset);
            if !has("codes") || !has("categories") {
                return Ok(None);
            }
            let Some(levels) = h5::extract_strings(categorical.as_ref(), "categories")? else {
                return Ok(None);
            };
            Ok(factor_column(categorical.dataset("codes")?.as_ref(), levels)?)
        }
        None => Ok(None),
    }
}

fn factor_column(codes: &dyn H5Dataset, levels: Vec<String>) -> Result<Option<Column>, ScError> {
    let Some(codes) = codes.values()?.to_i64() else {
        return Ok(None);
    };
    Ok(Some(Column::String(
        Factor {
            codes,
            levels,
            placeholder: None,
        }
        .expand(),
    )))
}

fn plain_column(dataset: &dyn H5Dataset) -> Result<Option<Column>, ScError> {
    if dataset.shape().len() > 1 {
        return Ok(None);
    }
    Ok(match dataset.values()? {
        H5Values::String(values) => Some(Column::strings(values)),
        H5Values::Integer(values) => Some(Column::Number(values.into_iter().map(|v| v as f64).collect())),
        H5Values::Float(values) => Some(Column::Number(values)),
    })
}

/// Names of the per-cell embeddings in `obsm`.
fn reduced_dimension_names(root: &dyn H5Group) -> Result<Vec<String>, ScError> {
    if root.child_kind("obsm") != Some(H5Kind::Group) {
        return Ok(Vec::new());
    }
    Ok(root
        .group("obsm")?
        .children()
        .into_iter()
        .filter(|(_, kind)| *kind == H5Kind::Dataset)
        .map(|(name, _)| name)
        .collect())
}

/// Reads `[ncells, ndims]` row-major embeddings into one vector per
/// dimension.
fn read_reduced_dimensions(
    root: &dyn H5Group,
    chosen: Option<&[String]>,
    cells: usize,
) -> Result<NamedMap<Vec<Vec<f64>>>, ScError> {
    let available = reduced_dimension_names(root)?;
    let names: Vec<String> = match chosen {
        Some(chosen) => chosen
            .iter()
            .filter(|name| {
                let found = available.contains(name);
                if !found {
                    tracing::warn!(name = %name, "requested reduced dimension not found in obsm");
                }
                found
            })
            .cloned()
            .collect(),
        None => available,
    };

    let mut output = NamedMap::new();
    if names.is_empty() {
        return Ok(output);
    }
    let obsm = root.group("obsm")?;
    for name in names {
        let dataset = obsm.dataset(&name)?;
        let (rows, dims) = match dataset.shape().as_slice() {
            [rows, dims] => (*rows, *dims),
            shape => {
                tracing::warn!(name = %name, shape = ?shape, "skipping reduced dimension that is not two-dimensional");
                continue;
            }
        };
        check_length("obsm", &name, rows, cells)?;
        let values = dataset
            .values()?
            .to_f64()
            .ok_or_else(|| ScError::SchemaUnknown(format!("obsm/{name} is not numeric")))?;
        if values.len() != rows * dims {
            return Err(ScError::DimensionMismatch(format!(
                "obsm/{name} holds {} values for shape [{rows}, {dims}]",
                values.len()
            )));
        }
        let per_dimension = (0..dims)
            .map(|dim| (0..rows).map(|cell| values[cell * dims + dim]).collect())
            .collect();
        output.insert(name, per_dimension);
    }
    Ok(output)
}

/// Converts `uns` into JSON: groups become objects, scalar datasets plain
/// values and the rest arrays.
fn read_uns(root: &dyn H5Group) -> Result<Value, ScError> {
    if root.child_kind("uns") != Some(H5Kind::Group) {
        return Ok(Value::Object(Map::new()));
    }
    group_to_json(root.group("uns")?.as_ref())
}

fn group_to_json(group: &dyn H5Group) -> Result<Value, ScError> {
    let mut object = Map::new();
    for (name, kind) in group.children() {
        let value = match kind {
            H5Kind::Group => group_to_json(group.group(&name)?.as_ref())?,
            H5Kind::Dataset => dataset_to_json(group.dataset(&name)?.as_ref())?,
        };
        object.insert(name, value);
    }
    Ok(Value::Object(object))
}

fn dataset_to_json(dataset: &dyn H5Dataset) -> Result<Value, ScError> {
    let scalar = dataset.shape().is_empty();
    let mut values: Vec<Value> = match dataset.values()? {
        H5Values::String(values) => values.into_iter().map(Value::String).collect(),
        H5Values::Integer(values) => values.into_iter().map(Value::from).collect(),
        H5Values::Float(values) => values
            .into_iter()
            .map(|v| Number::from_f64(v).map_or(Value::Null, Value::Number))
            .collect(),
    };
    if scalar && values.len() == 1 {
        return Ok(values.remove(0));
    }
    Ok(Value::Array(values))
}

/// The distinct values of `type_column`, each mapped to itself; one
/// unnamed group without a type column.
fn raw_type_labels(features: &DataFrame, type_column: Option<&str>) -> NamedMap<Option<String>> {
    let values = type_column
        .and_then(|name| features.column(name))
        .and_then(Column::to_strings);
    let Some(values) = values else {
        return [(String::new(), Some(String::new()))].into_iter().collect();
    };
    let mut labels = NamedMap::new();
    for value in values {
        let value = value.unwrap_or_default();
        if !labels.contains_key(&value) {
            labels.insert(value.clone(), Some(value));
        }
    }
    labels
}

fn present<'a>(features: &DataFrame, column: Option<&'a str>) -> Option<&'a str> {
    column.filter(|name| features.has_column(name))
}

#[derive(Debug)]
pub struct H5adDataset {
    source: H5adSource,
    options: H5adOptions,
}

impl H5adDataset {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self {
            source: H5adSource::new(file, engines),
            options: H5adOptions::default(),
        }
    }

    pub fn config(&self) -> &H5adOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: H5adOptions) {
        self.options = options;
        self.source.contents = None;
    }

    fn default_label(&self) -> String {
        self.options.feature_type_rna_name.clone().unwrap_or_default()
    }

    fn type_column(&self) -> Option<String> {
        self.options.feature_type_column_name.clone()
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let type_column = self.type_column();
        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let modality_features = features::split_features(&contents.features, type_column, &labels, &default)?;
        let mut summary = Summary::new(modality_features, contents.cells.clone());
        summary.all_assay_names = Some(contents.assay_names.clone());
        Ok(summary)
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let selectors = self.options.primary_id_columns();
        let type_column = self.type_column();

        let assay_names = self.source.contents(type_column.as_deref())?.assay_names.clone();
        let chosen = choose_assay(&assay_names, self.options.count_matrix_name.as_deref())?;
        let handle = self.source.load_assay(&chosen, true)?;

        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let split = features::split_by_modality(handle, &contents.features, type_column, &labels, &default)?;
        let primary_ids = features::extract_primary_ids(&split.features, &selectors, PrimaryIdFallback::RowNames);
        Ok(Loaded {
            matrix: split.matrix,
            features: split.features,
            cells: contents.cells.clone(),
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
        let type_column = self.type_column();
        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let split = features::split_features(&contents.features, type_column, &labels, &default)?;
        Ok(features::extract_primary_ids(&split, &selectors, PrimaryIdFallback::RowNames))
    }
}

impl Dataset for H5adDataset {
    fn state(&self) -> DatasetState {
        self.source.state
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
        let merged = config::merge_options(&self.options, partial)?;
        self.set_config(merged);
        Ok(())
    }

    fn clear(&mut self) {
        self.source.clear();
    }
}

impl Persistable for H5adDataset {
    fn format(&self) -> FormatTag {
        FormatTag::H5ad
    }

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new("h5", self.source.h5.file().clone())]
    }
}

impl Unserialize for H5adDataset {
    const FORMAT: FormatTag = FormatTag::H5ad;

    fn defaults() -> Value {
        serde_json::to_value(H5adOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, "h5", Self::FORMAT)?;
        let mut dataset = Self::new(file, engines);
        apply_options(&mut dataset, options)?;
        Ok(dataset)
    }
}

/// An analyzed AnnData file: the primary matrix may already be
/// normalized, and embeddings and `uns` are surfaced.
#[derive(Debug)]
pub struct H5adResult {
    source: H5adSource,
    options: H5adResultOptions,
}

impl H5adResult {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self {
            source: H5adSource::new(file, engines),
            options: H5adResultOptions::default(),
        }
    }

    pub fn config(&self) -> &H5adResultOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: H5adResultOptions) {
        self.options = options;
        self.source.contents = None;
    }

    fn type_column(&self) -> Option<String> {
        self.options.feature_type_column_name.clone()
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        let type_column = self.type_column();
        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let labels = raw_type_labels(&contents.features, type_column);
        let modality_features = features::split_features(&contents.features, type_column, &labels, "")?;
        let mut summary = Summary::new(modality_features, contents.cells.clone());
        summary.all_assay_names = Some(contents.assay_names.clone());

        let root = self.source.root()?;
        summary.reduced_dimension_names = Some(reduced_dimension_names(root)?);
        summary.other_metadata = Some(read_uns(root)?);
        Ok(summary)
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        let type_column = self.type_column();
        let normalized = self.options.is_primary_normalized;

        let assay_names = self.source.contents(type_column.as_deref())?.assay_names.clone();
        let chosen = choose_assay(&assay_names, self.options.primary_matrix_name.as_deref())?;
        let handle = self.source.load_assay(&chosen, !normalized)?;

        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let labels = raw_type_labels(&contents.features, type_column);
        let SplitMatrix {
            matrix,
            features,
            row_ids,
        } = features::split_by_modality(handle, &contents.features, type_column, &labels, "")?;
        let cells = contents.cells.clone();
        let matrix = if normalized { matrix } else { normalize_all(matrix)? };

        let selectors = NamedMap::new();
        let primary_ids = features::extract_primary_ids(&features, &selectors, PrimaryIdFallback::RowNames);

        let chosen_dims = self.options.reduced_dimension_names.clone();
        let cell_count = cells.row_count();
        let root = self.source.root()?;
        let reduced_dimensions = read_reduced_dimensions(root, chosen_dims.as_deref(), cell_count)?;
        let other_metadata = read_uns(root)?;
        Ok(Loaded {
            matrix,
            features,
            cells,
            primary_ids,
            row_ids,
            reduced_dimensions: Some(reduced_dimensions),
            other_metadata: Some(other_metadata),
        })
    }

    fn preview(&mut self) -> Result<PrimaryIds, ScError> {
        let type_column = self.type_column();
        let contents = self.source.contents(type_column.as_deref())?;
        let type_column = present(&contents.features, type_column.as_deref());
        let labels = raw_type_labels(&contents.features, type_column);
        let split = features::split_features(&contents.features, type_column, &labels, "")?;
        Ok(features::extract_primary_ids(&split, &NamedMap::new(), PrimaryIdFallback::RowNames))
    }
}

/// Replaces every matrix with its log-normalized counterpart.
fn normalize_all(mut matrix: MultiMatrix) -> Result<MultiMatrix, ScError> {
    let names: Vec<String> = matrix.available().into_iter().map(str::to_string).collect();
    for name in names {
        if let Some(raw) = matrix.remove(&name) {
            add_normalized(&mut matrix, &name, raw, None)?;
        }
    }
    Ok(matrix)
}

impl Dataset for H5adResult {
    fn state(&self) -> DatasetState {
        self.source.state
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
        let merged = config::merge_options(&self.options, partial)?;
        self.set_config(merged);
        Ok(())
    }

    fn clear(&mut self) {
        self.source.clear();
    }
}

impl Persistable for H5adResult {
    fn format(&self) -> FormatTag {
        FormatTag::H5ad
    }

    fn mode(&self) -> ReaderMode {
        ReaderMode::Result
    }

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new("h5", self.source.h5.file().clone())]
    }
}

impl Unserialize for H5adResult {
    const FORMAT: FormatTag = FormatTag::H5ad;

    fn defaults() -> Value {
        serde_json::to_value(H5adResultOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, "h5", Self::FORMAT)?;
        let mut result = Self::new(file, engines);
        apply_options(&mut result, options)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::H5Node;

    /// 3 genes by 2 cells, stored as AnnData CSR (cells are rows).
    fn counts() -> H5Node {
        H5Node::group()
            .with_child("data", H5Node::integers(vec![4, 1, 8]))
            .with_child("indices", H5Node::integers(vec![0, 2, 1]))
            .with_child("indptr", H5Node::integers(vec![0, 2, 3]))
            .with_string_attribute("encoding-type", "csr_matrix")
            .with_attribute("shape", H5Values::Integer(vec![2, 3]))
    }

    fn annotations(root: H5Node) -> H5Node {
        root.with_child("var/_index", H5Node::strings(&["g1", "g2", "g3"]))
            .with_child("var/gene_symbols", H5Node::strings(&["A", "B", "C"]))
            .with_child("var/highly_variable", H5Node::integers(vec![1, 0, 1]))
            .with_child("obs/_index", H5Node::strings(&["c1", "c2"]))
            .with_child("obs/n_counts", H5Node::floats(vec![5.0, 8.0]))
            .with_child("obs/cluster", H5Node::integers(vec![1, 0]))
            .with_child("obs/__categories/cluster", H5Node::strings(&["a", "b"]))
            .with_child("obs/batch/codes", H5Node::integers(vec![0, -1]))
            .with_child("obs/batch/categories", H5Node::strings(&["x"]))
    }

    fn h5ad_file(root: H5Node) -> FileRef {
        FileRef::from_bytes(root.to_bytes().unwrap(), "cells.h5ad").unwrap()
    }

    #[test]
    fn harvests_named_var_columns_and_categorical_obs() {
        let root = annotations(H5Node::group().with_child("X", counts()));
        let mut dataset = H5adDataset::new(h5ad_file(root), Engines::reference());
        let summary = dataset.summary(false).unwrap();

        assert_eq!(summary.all_assay_names, Some(vec!["X".to_string()]));
        let rna = summary.modality_features.get("RNA").unwrap();
        assert_eq!(rna.column_names(), vec!["_index", "gene_symbols"]);
        assert_eq!(summary.cells.row_count(), 2);
        assert_eq!(
            summary.cells.column("cluster"),
            Some(&Column::String(vec![Some("b".to_string()), Some("a".to_string())]))
        );
        assert_eq!(
            summary.cells.column("batch"),
            Some(&Column::String(vec![Some("x".to_string()), None]))
        );
    }

    #[test]
    fn name_pattern_is_compiled_once() {
        let pattern = name_like().unwrap();
        assert!(std::ptr::eq(pattern, name_like().unwrap()));
        assert!(pattern.is_match("gene_Symbols"));
        assert!(pattern.is_match("NAME"));
        assert!(!pattern.is_match("gene_ids"));
    }

    #[test]
    fn falls_back_to_the_first_layer() {
        let root = annotations(H5Node::group().with_child("layers/counts", counts()));
        let mut dataset = H5adDataset::new(h5ad_file(root), Engines::reference());
        let loaded = dataset.load(false).unwrap();
        let rna = loaded.matrix.get("RNA").unwrap();
        assert_eq!((rna.number_of_rows(), rna.number_of_columns()), (3, 2));
        assert_eq!(rna.column(0).unwrap(), vec![4.0, 0.0, 1.0]);
        assert_eq!(
            loaded.primary_ids.get("RNA"),
            Some(&Some(vec!["g1".to_string(), "g2".to_string(), "g3".to_string()]))
        );
    }

    #[test]
    fn unknown_count_matrix_is_rejected() {
        let root = annotations(H5Node::group().with_child("X", counts()));
        let mut dataset = H5adDataset::new(h5ad_file(root), Engines::reference());
        dataset
            .set_options(&serde_json::json!({"countMatrixName": "layers/missing"}))
            .unwrap();
        assert_matches!(dataset.load(false), Err(ScError::SelectorInvalid(_)));
    }

    #[test]
    fn results_surface_embeddings_and_uns() {
        let root = annotations(H5Node::group().with_child("X", counts()))
            .with_child(
                "obsm/X_pca",
                H5Node::dataset(vec![2, 2], H5Values::Float(vec![1.0, 2.0, 3.0, 4.0])),
            )
            .with_child("uns/title", H5Node::scalar_string("pbmc"))
            .with_child("uns/params/k", H5Node::integers(vec![10, 20]));
        let mut result = H5adResult::new(h5ad_file(root), Engines::reference());

        let summary = result.summary(true).unwrap();
        assert_eq!(summary.reduced_dimension_names, Some(vec!["X_pca".to_string()]));
        assert_eq!(
            summary.other_metadata,
            Some(serde_json::json!({"title": "pbmc", "params": {"k": [10, 20]}}))
        );
        assert_eq!(summary.modality_features.keys().collect::<Vec<_>>(), vec![""]);

        let loaded = result.load(false).unwrap();
        let pca = loaded.reduced_dimensions.as_ref().unwrap().get("X_pca").unwrap();
        assert_eq!(pca, &vec![vec![1.0, 3.0], vec![2.0, 4.0]]);
        assert!(loaded.matrix.has(""));
        assert_eq!(result.state(), DatasetState::Cleared);
    }
}
