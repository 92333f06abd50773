//! SummarizedExperiment objects saved as `.rds` files.

use crate::dataset::{single_file, DatasetFile, ExperimentDataset, ExperimentResult, PersistedSource};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::project::RdsExperiment;

pub type RdsDataset = ExperimentDataset<RdsExperiment>;
pub type RdsResult = ExperimentResult<RdsExperiment>;

impl PersistedSource for RdsExperiment {
    const FORMAT: FormatTag = FormatTag::SummarizedExperiment;
    const LOCATOR_KEY: Option<&'static str> = None;

    fn files(&self) -> Vec<DatasetFile> {
        vec![DatasetFile::new("rds", self.file().clone())]
    }

    fn locator(&self) -> Option<&str> {
        None
    }

    fn set_locator(&mut self, _locator: String) {}

    fn from_files(files: Vec<DatasetFile>, _locator: Option<String>, engines: Engines) -> Result<Self, ScError> {
        let file = single_file(files, "rds", Self::FORMAT)?;
        Ok(RdsExperiment::new(file, engines))
    }
}

impl ExperimentDataset<RdsExperiment> {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self::from_source(RdsExperiment::new(file, engines))
    }
}

impl ExperimentResult<RdsExperiment> {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self::from_source(RdsExperiment::new(file, engines))
    }
}
