//! Readers over an [`ExperimentSource`]: SummarizedExperiment RDS files and
//! zipped ArtifactDB or alabaster projects share one dataset and one result
//! implementation, parameterized by the source.

use serde_json::Value;

use crate::config::{
    self, AssaySelector, ColumnSelector, ExperimentOptions, ExperimentResultOptions, ExperimentSelector, PerModality,
};
use crate::dataset::{
    apply_options, take_reserved, with_reserved, Dataset, DatasetFile, Loaded, Persistable, PrimaryIds, ReaderMode,
    Summary, Unserialize,
};
use crate::domain::{FormatTag, NamedMap};
use crate::engine::Engines;
use crate::error::ScError;
use crate::features::{self, PrimaryIdFallback};
use crate::lifecycle::{self, DatasetState};
use crate::project::{self, ExperimentSource};

/// An experiment source that can be rebuilt from its input files.
pub trait PersistedSource: ExperimentSource + Sized {
    const FORMAT: FormatTag;

    /// Option key naming the experiment inside a multi-object input.
    const LOCATOR_KEY: Option<&'static str>;

    fn files(&self) -> Vec<DatasetFile>;

    fn locator(&self) -> Option<&str>;

    /// Points the source at another experiment, dropping cached state.
    fn set_locator(&mut self, locator: String);

    fn from_files(files: Vec<DatasetFile>, locator: Option<String>, engines: Engines) -> Result<Self, ScError>;
}

/// Splits the locator off `options` when the source uses one.
fn split_locator<S: PersistedSource>(options: &Value) -> Result<(Option<String>, Value), ScError> {
    match S::LOCATOR_KEY {
        Some(key) => take_reserved(options, key),
        None => Ok((None, options.clone())),
    }
}

fn options_with_locator<S: PersistedSource>(source: &S, options: Value) -> Value {
    match (S::LOCATOR_KEY, source.locator()) {
        (Some(key), Some(locator)) => with_reserved(options, key, locator),
        _ => options,
    }
}

/// Count matrices of the experiments bound to each modality.
#[derive(Debug)]
pub struct ExperimentDataset<S> {
    source: S,
    options: ExperimentOptions,
    state: DatasetState,
}

impl<S: PersistedSource> ExperimentDataset<S> {
    pub fn from_source(source: S) -> Self {
        Self {
            source,
            options: ExperimentOptions::default(),
            state: DatasetState::Fresh,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &ExperimentOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: ExperimentOptions) {
        self.options = options;
    }

    pub fn set_rna_count_assay(&mut self, assay: Option<AssaySelector>) {
        self.options.rna_count_assay = assay;
    }

    pub fn set_adt_count_assay(&mut self, assay: Option<AssaySelector>) {
        self.options.adt_count_assay = assay;
    }

    pub fn set_crispr_count_assay(&mut self, assay: Option<AssaySelector>) {
        self.options.crispr_count_assay = assay;
    }

    pub fn set_rna_experiment(&mut self, experiment: Option<ExperimentSelector>) {
        self.options.rna_experiment = experiment;
    }

    pub fn set_adt_experiment(&mut self, experiment: Option<ExperimentSelector>) {
        self.options.adt_experiment = experiment;
    }

    pub fn set_crispr_experiment(&mut self, experiment: Option<ExperimentSelector>) {
        self.options.crispr_experiment = experiment;
    }

    pub fn set_primary_rna_feature_id_column(&mut self, column: Option<ColumnSelector>) {
        self.options.primary_rna_feature_id_column = column;
    }

    pub fn set_primary_adt_feature_id_column(&mut self, column: Option<ColumnSelector>) {
        self.options.primary_adt_feature_id_column = column;
    }

    pub fn set_primary_crispr_feature_id_column(&mut self, column: Option<ColumnSelector>) {
        self.options.primary_crispr_feature_id_column = column;
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        self.state = DatasetState::Opened;
        let summary = project::summarize(&mut self.source)?;
        self.state = DatasetState::Populated;
        Ok(summary)
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        self.state = DatasetState::Opened;
        let loaded = project::load_modalities(&mut self.source, &self.options)?;
        self.state = DatasetState::Populated;
        Ok(loaded)
    }

    fn preview(&mut self) -> Result<PrimaryIds, ScError> {
        self.state = DatasetState::Opened;
        let ids = project::preview_modalities(&mut self.source, &self.options)?;
        self.state = DatasetState::Populated;
        Ok(ids)
    }
}

impl<S: PersistedSource> Dataset for ExperimentDataset<S> {
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
        Ok(options_with_locator(&self.source, config::to_options_value(&self.options)?))
    }

    fn set_options(&mut self, partial: &Value) -> Result<(), ScError> {
        let (locator, rest) = split_locator::<S>(partial)?;
        self.options = config::merge_options(&self.options, &rest)?;
        if let Some(locator) = locator {
            self.source.set_locator(locator);
            self.clear();
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.source.clear();
        if self.state != DatasetState::Fresh {
            self.state = DatasetState::Cleared;
        }
    }
}

impl<S: PersistedSource> Persistable for ExperimentDataset<S> {
    fn format(&self) -> FormatTag {
        S::FORMAT
    }

    fn files(&self) -> Vec<DatasetFile> {
        self.source.files()
    }
}

impl<S: PersistedSource> Unserialize for ExperimentDataset<S> {
    const FORMAT: FormatTag = S::FORMAT;

    fn defaults() -> Value {
        serde_json::to_value(ExperimentOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let (locator, rest) = split_locator::<S>(options)?;
        let mut dataset = Self::from_source(S::from_files(files, locator, engines)?);
        apply_options(&mut dataset, &rest)?;
        Ok(dataset)
    }
}

/// Analysis results: the primary assay of every experiment, reduced
/// dimensions and free-form metadata.
#[derive(Debug)]
pub struct ExperimentResult<S> {
    source: S,
    options: ExperimentResultOptions,
    state: DatasetState,
}

impl<S: PersistedSource> ExperimentResult<S> {
    pub fn from_source(source: S) -> Self {
        Self {
            source,
            options: ExperimentResultOptions::default(),
            state: DatasetState::Fresh,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &ExperimentResultOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: ExperimentResultOptions) {
        self.options = options;
    }

    pub fn set_primary_assay(&mut self, assay: PerModality<AssaySelector>) {
        self.options.primary_assay = assay;
    }

    pub fn set_is_primary_normalized(&mut self, normalized: PerModality<bool>) {
        self.options.is_primary_normalized = normalized;
    }

    pub fn set_reduced_dimension_names(&mut self, names: Option<Vec<String>>) {
        self.options.reduced_dimension_names = names;
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        self.state = DatasetState::Opened;
        let summary = project::summarize_result(&mut self.source)?;
        self.state = DatasetState::Populated;
        Ok(summary)
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        self.state = DatasetState::Opened;
        let loaded = project::load_results(&mut self.source, &self.options)?;
        self.state = DatasetState::Populated;
        Ok(loaded)
    }

    /// Result features carry no primary-id settings; row names are used.
    fn preview(&mut self) -> Result<PrimaryIds, ScError> {
        self.state = DatasetState::Opened;
        let summary = project::summarize(&mut self.source)?;
        self.state = DatasetState::Populated;
        Ok(features::extract_primary_ids(
            &summary.modality_features,
            &NamedMap::new(),
            PrimaryIdFallback::RowNames,
        ))
    }
}

impl<S: PersistedSource> Dataset for ExperimentResult<S> {
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
        Ok(options_with_locator(&self.source, config::to_options_value(&self.options)?))
    }

    fn set_options(&mut self, partial: &Value) -> Result<(), ScError> {
        let (locator, rest) = split_locator::<S>(partial)?;
        self.options = config::merge_options(&self.options, &rest)?;
        if let Some(locator) = locator {
            self.source.set_locator(locator);
            self.clear();
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.source.clear();
        if self.state != DatasetState::Fresh {
            self.state = DatasetState::Cleared;
        }
    }
}

impl<S: PersistedSource> Persistable for ExperimentResult<S> {
    fn format(&self) -> FormatTag {
        S::FORMAT
    }

    fn mode(&self) -> ReaderMode {
        ReaderMode::Result
    }

    fn files(&self) -> Vec<DatasetFile> {
        self.source.files()
    }
}

impl<S: PersistedSource> Unserialize for ExperimentResult<S> {
    const FORMAT: FormatTag = S::FORMAT;

    fn defaults() -> Value {
        serde_json::to_value(ExperimentResultOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let (locator, rest) = split_locator::<S>(options)?;
        let mut dataset = Self::from_source(S::from_files(files, locator, engines)?);
        apply_options(&mut dataset, &rest)?;
        Ok(dataset)
    }
}
