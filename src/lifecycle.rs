//! Open/cache/clear state shared by every reader.

use serde::Serialize;

use crate::dataset::Dataset;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::h5::{H5Engine, OpenedH5};

/// Where a reader is in its resource lifecycle.
///
/// `Fresh` readers have done no I/O. The first summary, load or preview
/// opens resources (`Opened`) and decodes annotations (`Populated`).
/// Clearing, explicitly or after a call made with `cache = false`, releases
/// everything (`Cleared`); the next call reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    Fresh,
    Opened,
    Populated,
    Cleared,
}

impl DatasetState {
    pub fn holds_resources(self) -> bool {
        matches!(self, DatasetState::Opened | DatasetState::Populated)
    }
}

/// Runs `call`, then clears `target` unless `cache` is set. Clearing
/// happens on success and on error alike.
pub fn scoped<D, T>(target: &mut D, cache: bool, call: impl FnOnce(&mut D) -> Result<T, ScError>) -> Result<T, ScError>
where
    D: Dataset + ?Sized,
{
    let outcome = call(target);
    if !cache {
        target.clear();
    }
    outcome
}

/// An HDF5 file opened on first use and kept until cleared.
#[derive(Debug)]
pub struct LazyH5 {
    file: FileRef,
    opened: Option<OpenedH5>,
}

impl LazyH5 {
    pub fn new(file: FileRef) -> Self {
        Self { file, opened: None }
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    pub fn open(&mut self, engine: &dyn H5Engine) -> Result<&OpenedH5, ScError> {
        let opened = match self.opened.take() {
            Some(opened) => opened,
            None => {
                tracing::debug!(file = self.file.name(), "opening HDF5 file");
                OpenedH5::open(engine, &self.file.content()?)?
            }
        };
        Ok(self.opened.insert(opened))
    }

    /// Closes the file and deletes any temporary copy.
    pub fn close(&mut self) {
        self.opened = None;
    }
}
