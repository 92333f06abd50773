//! Matrix engine interface and the owned handles the readers hand out.

use std::fmt;
use std::sync::Arc;

use camino::Utf8Path;
use serde::Serialize;

use crate::error::{EngineError, ScError};
use crate::file_ref::FileContent;
use crate::rds::RObject;
use crate::text::Compression;

pub type MatrixId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dimensions {
    pub rows: usize,
    pub columns: usize,
}

/// Axis of a vector operand or a bind. `Rows` is axis 0, `Columns` axis 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Rows,
    Columns,
}

impl Axis {
    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(Axis::Rows),
            1 => Some(Axis::Columns),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Power,
    Modulo,
    IntegerDivide,
}

impl ArithOp {
    pub fn parse(method: &str) -> Option<Self> {
        Some(match method {
            "+" => ArithOp::Add,
            "-" => ArithOp::Subtract,
            "*" => ArithOp::Multiply,
            "/" => ArithOp::Divide,
            "^" => ArithOp::Power,
            "%%" => ArithOp::Modulo,
            "%/%" => ArithOp::IntegerDivide,
            _ => return None,
        })
    }

    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            ArithOp::Add => left + right,
            ArithOp::Subtract => left - right,
            ArithOp::Multiply => left * right,
            ArithOp::Divide => left / right,
            ArithOp::Power => left.powf(right),
            ArithOp::Modulo => left - (left / right).floor() * right,
            ArithOp::IntegerDivide => (left / right).floor(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Scalar(f64),
    Vector { values: Vec<f64>, along: Axis },
}

/// Which side of the operator the matrix sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// `value op matrix`
    Left,
    /// `matrix op value`
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathOp {
    Log { base: Option<f64> },
    Log1p,
    Exp,
    Expm1,
    Sqrt,
    Abs,
    Sign,
    Ceiling,
    Floor,
    Trunc,
    Round,
}

impl MathOp {
    pub fn parse(method: &str, base: Option<f64>) -> Option<Self> {
        Some(match method {
            "log" => MathOp::Log { base },
            "log2" => MathOp::Log { base: Some(2.0) },
            "log10" => MathOp::Log { base: Some(10.0) },
            "log1p" => MathOp::Log1p,
            "exp" => MathOp::Exp,
            "expm1" => MathOp::Expm1,
            "sqrt" => MathOp::Sqrt,
            "abs" => MathOp::Abs,
            "sign" => MathOp::Sign,
            "ceiling" => MathOp::Ceiling,
            "floor" => MathOp::Floor,
            "trunc" => MathOp::Trunc,
            "round" => MathOp::Round,
            _ => return None,
        })
    }

    pub fn apply(self, value: f64) -> f64 {
        match self {
            MathOp::Log { base: None } => value.ln(),
            MathOp::Log { base: Some(base) } => value.ln() / base.ln(),
            MathOp::Log1p => value.ln_1p(),
            MathOp::Exp => value.exp(),
            MathOp::Expm1 => value.exp_m1(),
            MathOp::Sqrt => value.sqrt(),
            MathOp::Abs => value.abs(),
            MathOp::Sign => {
                if value == 0.0 || value.is_nan() {
                    value
                } else {
                    value.signum()
                }
            }
            MathOp::Ceiling => value.ceil(),
            MathOp::Floor => value.floor(),
            MathOp::Trunc => value.trunc(),
            MathOp::Round => value.round(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Ensembl,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureGuess {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    pub species: String,
    pub confidence: f64,
}

/// Decodes, transforms and releases numeric matrices. Matrices are
/// addressed by engine-issued ids; every id returned must eventually be
/// passed to [`MatrixEngine::free`].
///
/// HDF5 conventions: a dense dataset of shape `[c, r]` is an `r x c`
/// matrix unless `transposed` is set, in which case the shape is `[r, c]`.
pub trait MatrixEngine: Send + Sync {
    fn sparse_from_matrix_market(
        &self,
        content: &FileContent,
        compression: Option<Compression>,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError>;

    fn matrix_market_dimensions(
        &self,
        content: &FileContent,
        compression: Option<Compression>,
    ) -> Result<Dimensions, EngineError>;

    /// Loads a 10X, AnnData or takane sparse group, or a dense AnnData
    /// dataset, whichever `name` refers to.
    fn sparse_from_hdf5(&self, path: &Utf8Path, name: &str, force_integer: bool) -> Result<MatrixId, EngineError>;

    /// Loads a bare `data`/`indices`/`indptr` group of known dimensions.
    fn sparse_from_hdf5_group(
        &self,
        path: &Utf8Path,
        name: &str,
        dimensions: Dimensions,
        csr: bool,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError>;

    fn dense_from_hdf5(
        &self,
        path: &Utf8Path,
        name: &str,
        transposed: bool,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError>;

    fn hdf5_matrix_details(&self, path: &Utf8Path, name: &str) -> Result<Dimensions, EngineError>;

    /// Loads a base R matrix or a `dgCMatrix`.
    fn from_rds(&self, object: &RObject, force_integer: bool) -> Result<MatrixId, EngineError>;

    fn dimensions(&self, id: MatrixId) -> Result<Dimensions, EngineError>;

    /// Original row index of every row currently in the matrix.
    fn identities(&self, id: MatrixId) -> Result<Vec<usize>, EngineError>;

    fn column(&self, id: MatrixId, index: usize) -> Result<Vec<f64>, EngineError>;

    fn log_norm_counts(
        &self,
        id: MatrixId,
        size_factors: Option<&[f64]>,
        center: bool,
        allow_zeros: bool,
    ) -> Result<MatrixId, EngineError>;

    fn normalize_counts(
        &self,
        id: MatrixId,
        size_factors: &[f64],
        log: bool,
        allow_zeros: bool,
    ) -> Result<MatrixId, EngineError>;

    fn delayed_arithmetic(
        &self,
        id: MatrixId,
        op: ArithOp,
        operand: &Operand,
        side: Side,
    ) -> Result<MatrixId, EngineError>;

    fn delayed_math(&self, id: MatrixId, op: MathOp) -> Result<MatrixId, EngineError>;

    fn transpose(&self, id: MatrixId) -> Result<MatrixId, EngineError>;

    fn subset_rows(&self, id: MatrixId, indices: &[usize]) -> Result<MatrixId, EngineError>;

    fn subset_columns(&self, id: MatrixId, indices: &[usize]) -> Result<MatrixId, EngineError>;

    fn bind(&self, ids: &[MatrixId], along: Axis) -> Result<MatrixId, EngineError>;

    fn free(&self, id: MatrixId) -> Result<(), EngineError>;

    /// Number of matrices allocated and not yet freed.
    fn live_handles(&self) -> usize;

    fn guess_features(&self, values: &[String]) -> Result<FeatureGuess, EngineError>;
}

/// Owned reference to an engine matrix. Dropping the handle frees it.
pub struct MatrixHandle {
    engine: Arc<dyn MatrixEngine>,
    id: MatrixId,
    dimensions: Dimensions,
    released: bool,
}

impl fmt::Debug for MatrixHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixHandle")
            .field("id", &self.id)
            .field("rows", &self.dimensions.rows)
            .field("columns", &self.dimensions.columns)
            .finish()
    }
}

impl MatrixHandle {
    /// Takes ownership of `id`. The id is freed even if its dimensions
    /// cannot be queried.
    pub fn adopt(engine: Arc<dyn MatrixEngine>, id: MatrixId) -> Result<Self, ScError> {
        match engine.dimensions(id) {
            Ok(dimensions) => Ok(Self {
                engine,
                id,
                dimensions,
                released: false,
            }),
            Err(err) => {
                let _ = engine.free(id);
                Err(err.into())
            }
        }
    }

    pub fn id(&self) -> MatrixId {
        self.id
    }

    pub fn engine(&self) -> &Arc<dyn MatrixEngine> {
        &self.engine
    }

    pub fn number_of_rows(&self) -> usize {
        self.dimensions.rows
    }

    pub fn number_of_columns(&self) -> usize {
        self.dimensions.columns
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn identities(&self) -> Result<Vec<usize>, ScError> {
        Ok(self.engine.identities(self.id)?)
    }

    pub fn column(&self, index: usize) -> Result<Vec<f64>, ScError> {
        Ok(self.engine.column(self.id, index)?)
    }

    pub fn subset_rows(&self, indices: &[usize]) -> Result<MatrixHandle, ScError> {
        let id = self.engine.subset_rows(self.id, indices)?;
        MatrixHandle::adopt(self.engine.clone(), id)
    }

    pub fn subset_columns(&self, indices: &[usize]) -> Result<MatrixHandle, ScError> {
        let id = self.engine.subset_columns(self.id, indices)?;
        MatrixHandle::adopt(self.engine.clone(), id)
    }

    pub fn log_norm_counts(&self, size_factors: Option<&[f64]>) -> Result<MatrixHandle, ScError> {
        let id = self
            .engine
            .log_norm_counts(self.id, size_factors, true, true)?;
        MatrixHandle::adopt(self.engine.clone(), id)
    }

    pub fn free(mut self) -> Result<(), ScError> {
        self.released = true;
        Ok(self.engine.free(self.id)?)
    }
}

impl Drop for MatrixHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.engine.free(self.id) {
                tracing::debug!(id = self.id, error = %err, "failed to free matrix");
            }
        }
    }
}

/// Matrices keyed by modality, all sharing one column count.
#[derive(Debug, Default)]
pub struct MultiMatrix {
    entries: Vec<(String, MatrixHandle)>,
}

impl MultiMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `matrix` under `name`, releasing any matrix it replaces. A
    /// matrix whose column count disagrees with the others is released and
    /// rejected.
    pub fn add(&mut self, name: impl Into<String>, matrix: MatrixHandle) -> Result<(), ScError> {
        let name = name.into();
        let conflicting = self
            .entries
            .iter()
            .find(|(existing, other)| {
                *existing != name && other.number_of_columns() != matrix.number_of_columns()
            });
        if let Some((existing, other)) = conflicting {
            return Err(ScError::DimensionMismatch(format!(
                "matrix '{name}' has {} columns but '{existing}' has {}",
                matrix.number_of_columns(),
                other.number_of_columns()
            )));
        }
        match self.entries.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = matrix,
            None => self.entries.push((name, matrix)),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MatrixHandle> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, matrix)| matrix)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn available(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn number_of_columns(&self) -> Option<usize> {
        self.entries
            .first()
            .map(|(_, matrix)| matrix.number_of_columns())
    }

    pub fn remove(&mut self, name: &str) -> Option<MatrixHandle> {
        let index = self.entries.iter().position(|(existing, _)| existing == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ScError> {
        if let Some(matrix) = self.remove(from) {
            self.add(to, matrix)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MatrixHandle)> {
        self.entries.iter().map(|(name, matrix)| (name.as_str(), matrix))
    }

    pub fn free(self) -> Result<(), ScError> {
        let mut first_error = None;
        for (_, matrix) in self.entries {
            if let Err(err) = matrix.free() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
