//! Engine bundle handed to every reader, plus in-memory reference engines.
//!
//! The reference engines read JSON documents in place of HDF5 and RDS
//! files, and keep matrices densely in memory. They implement the same
//! traits a native binding would.

mod h5;
mod matrix;

use std::sync::Arc;

pub use h5::{H5Node, MemoryH5Engine};
pub use matrix::MemoryMatrixEngine;

use crate::error::EngineError;
use crate::h5::H5Engine;
use crate::matrix::MatrixEngine;
use crate::rds::{RObject, RdsEngine};

#[derive(Clone)]
pub struct Engines {
    pub matrix: Arc<dyn MatrixEngine>,
    pub h5: Arc<dyn H5Engine>,
    pub rds: Arc<dyn RdsEngine>,
}

impl Engines {
    pub fn new(matrix: Arc<dyn MatrixEngine>, h5: Arc<dyn H5Engine>, rds: Arc<dyn RdsEngine>) -> Self {
        Self { matrix, h5, rds }
    }

    /// Reference engines sharing one document-backed HDF5 reader.
    pub fn reference() -> Self {
        let h5: Arc<dyn H5Engine> = Arc::new(MemoryH5Engine);
        Self {
            matrix: Arc::new(MemoryMatrixEngine::new(h5.clone())),
            h5,
            rds: Arc::new(MemoryRdsEngine),
        }
    }
}

impl std::fmt::Debug for Engines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engines")
            .field("live_handles", &self.matrix.live_handles())
            .finish()
    }
}

/// Reads JSON-encoded [`RObject`] documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryRdsEngine;

impl MemoryRdsEngine {
    pub fn encode(object: &RObject) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(object).map_err(|err| EngineError::new(err.to_string()))
    }
}

impl RdsEngine for MemoryRdsEngine {
    fn read(&self, bytes: &[u8]) -> Result<RObject, EngineError> {
        serde_json::from_slice(bytes)
            .map_err(|err| EngineError::new(format!("not an R object document: {err}")))
    }
}
