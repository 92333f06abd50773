//! ArtifactDB and alabaster projects packed in a ZIP file. One archive may
//! hold several experiments; the `datasetName` or `datasetPrefix` option
//! names the one to read.

use crate::archive::SharedArchive;
use crate::dataset::{single_file, DatasetFile, ExperimentDataset, ExperimentResult, PersistedSource};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::navigator::{MetadataCache, MetadataLayout, ZipNavigator};
use crate::project::{ArtifactDbProject, TakaneProject};

pub const DATASET_NAME_KEY: &str = "datasetName";
pub const DATASET_PREFIX_KEY: &str = "datasetPrefix";

const ZIP_ROLE: &str = "zip";

pub type ZipProjectNavigator = MetadataCache<ZipNavigator>;
pub type ZippedArtifactDbProject = ArtifactDbProject<ZipProjectNavigator>;
pub type ZippedTakaneProject = TakaneProject<ZipProjectNavigator>;

pub type ZippedArtifactDbDataset = ExperimentDataset<ZippedArtifactDbProject>;
pub type ZippedArtifactDbResult = ExperimentResult<ZippedArtifactDbProject>;
pub type ZippedAlabasterDataset = ExperimentDataset<ZippedTakaneProject>;
pub type ZippedAlabasterResult = ExperimentResult<ZippedTakaneProject>;

fn navigator(file: FileRef, archive: Option<SharedArchive>, layout: MetadataLayout) -> ZipProjectNavigator {
    let inner = match archive {
        Some(archive) => ZipNavigator::with_archive(file, archive, layout),
        None => ZipNavigator::new(file, layout),
    };
    MetadataCache::new(inner)
}

fn required_locator(locator: Option<String>, key: &str, format: FormatTag) -> Result<String, ScError> {
    locator.ok_or_else(|| ScError::Config(format!("{format} needs the '{key}' option")))
}

impl PersistedSource for ZippedArtifactDbProject {
    const FORMAT: FormatTag = FormatTag::ZippedArtifactdb;
    const LOCATOR_KEY: Option<&'static str> = Some(DATASET_NAME_KEY);

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new(ZIP_ROLE, self.navigator().inner().source().clone())]
    }

    fn locator(&self) -> Option<&str> {
        Some(self.path())
    }

    fn set_locator(&mut self, locator: String) {
        self.set_path(locator);
    }

    fn from_files(files: Vec<DatasetFile>, locator: Option<String>, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, ZIP_ROLE, Self::FORMAT)?;
        let name = required_locator(locator, DATASET_NAME_KEY, Self::FORMAT)?;
        Ok(ArtifactDbProject::new(
            navigator(file, None, MetadataLayout::ArtifactDb),
            name,
            engines,
        ))
    }
}

impl PersistedSource for ZippedTakaneProject {
    const FORMAT: FormatTag = FormatTag::ZippedAlabaster;
    const LOCATOR_KEY: Option<&'static str> = Some(DATASET_PREFIX_KEY);

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new(ZIP_ROLE, self.navigator().inner().source().clone())]
    }

    fn locator(&self) -> Option<&str> {
        Some(self.prefix())
    }

    fn set_locator(&mut self, locator: String) {
        self.set_prefix(locator);
    }

    fn from_files(files: Vec<DatasetFile>, locator: Option<String>, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, ZIP_ROLE, Self::FORMAT)?;
        let prefix = required_locator(locator, DATASET_PREFIX_KEY, Self::FORMAT)?;
        Ok(TakaneProject::new(navigator(file, None, MetadataLayout::Takane), prefix, engines))
    }
}

impl ExperimentDataset<ZippedArtifactDbProject> {
    /// Reads the experiment whose document is `name` (with or without its
    /// `.json` suffix).
    pub fn new(file: FileRef, name: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(ArtifactDbProject::new(
            navigator(file, None, MetadataLayout::ArtifactDb),
            name,
            engines,
        ))
    }

    /// Reuses an archive already decoded by [`crate::project::search_zipped_artifactdb`].
    pub fn with_archive(file: FileRef, archive: SharedArchive, name: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(ArtifactDbProject::new(
            navigator(file, Some(archive), MetadataLayout::ArtifactDb),
            name,
            engines,
        ))
    }
}

impl ExperimentResult<ZippedArtifactDbProject> {
    pub fn new(file: FileRef, name: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(ArtifactDbProject::new(
            navigator(file, None, MetadataLayout::ArtifactDb),
            name,
            engines,
        ))
    }

    pub fn with_archive(file: FileRef, archive: SharedArchive, name: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(ArtifactDbProject::new(
            navigator(file, Some(archive), MetadataLayout::ArtifactDb),
            name,
            engines,
        ))
    }
}

impl ExperimentDataset<ZippedTakaneProject> {
    /// Reads the experiment rooted at directory `prefix`; `""` is the
    /// archive root.
    pub fn new(file: FileRef, prefix: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(TakaneProject::new(navigator(file, None, MetadataLayout::Takane), prefix, engines))
    }

    /// Reuses an archive already decoded by [`crate::project::search_zipped_alabaster`].
    pub fn with_archive(file: FileRef, archive: SharedArchive, prefix: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(TakaneProject::new(
            navigator(file, Some(archive), MetadataLayout::Takane),
            prefix,
            engines,
        ))
    }
}

impl ExperimentResult<ZippedTakaneProject> {
    pub fn new(file: FileRef, prefix: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(TakaneProject::new(navigator(file, None, MetadataLayout::Takane), prefix, engines))
    }

    pub fn with_archive(file: FileRef, archive: SharedArchive, prefix: impl Into<String>, engines: Engines) -> Self {
        Self::from_source(TakaneProject::new(
            navigator(file, Some(archive), MetadataLayout::Takane),
            prefix,
            engines,
        ))
    }
}
