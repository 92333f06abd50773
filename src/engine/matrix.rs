use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::Utf8Path;
use regex::Regex;

use crate::error::EngineError;
use crate::file_ref::FileContent;
use crate::h5::{H5Engine, H5Group, H5Kind, H5Object};
use crate::matrix::{
    ArithOp, Axis, Dimensions, FeatureGuess, FeatureKind, MathOp, MatrixEngine, MatrixId, Operand,
    Side,
};
use crate::rds::RObject;
use crate::text::{self, Compression};

#[derive(Debug, Clone)]
struct Stored {
    rows: usize,
    columns: usize,
    /// Column-major.
    values: Vec<f64>,
    identities: Vec<usize>,
}

impl Stored {
    fn new(rows: usize, columns: usize, values: Vec<f64>) -> Self {
        Self {
            rows,
            columns,
            values,
            identities: (0..rows).collect(),
        }
    }

    fn zeros(rows: usize, columns: usize) -> Self {
        Stored::new(rows, columns, vec![0.0; rows * columns])
    }

    fn get(&self, row: usize, column: usize) -> f64 {
        self.values[column * self.rows + row]
    }

    fn set(&mut self, row: usize, column: usize, value: f64) {
        self.values[column * self.rows + row] = value;
    }

    fn truncated(mut self, force_integer: bool) -> Self {
        if force_integer {
            for value in &mut self.values {
                *value = value.trunc();
            }
        }
        self
    }

    fn column_sums(&self) -> Vec<f64> {
        (0..self.columns)
            .map(|j| self.values[j * self.rows..(j + 1) * self.rows].iter().sum())
            .collect()
    }

    fn scaled_columns(&self, factors: &[f64], log: bool) -> Stored {
        let mut out = self.clone();
        for j in 0..self.columns {
            for i in 0..self.rows {
                let value = self.get(i, j) / factors[j];
                out.set(i, j, if log { (value + 1.0).log2() } else { value });
            }
        }
        out
    }
}

#[derive(Default)]
struct Store {
    next_id: MatrixId,
    matrices: HashMap<MatrixId, Stored>,
}

/// Dense in-memory [`MatrixEngine`]. HDF5 inputs are read through the
/// supplied [`H5Engine`].
pub struct MemoryMatrixEngine {
    h5: Arc<dyn H5Engine>,
    store: Mutex<Store>,
}

impl MemoryMatrixEngine {
    pub fn new(h5: Arc<dyn H5Engine>) -> Self {
        Self {
            h5,
            store: Mutex::new(Store::default()),
        }
    }

    /// Registers a matrix from column-major values.
    pub fn insert_dense(&self, rows: usize, columns: usize, values: Vec<f64>) -> Result<MatrixId, EngineError> {
        if values.len() != rows * columns {
            return Err(EngineError::new(format!(
                "{} values for a {rows} x {columns} matrix",
                values.len()
            )));
        }
        self.insert(Stored::new(rows, columns, values))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, EngineError> {
        self.store
            .lock()
            .map_err(|_| EngineError::new("matrix store lock poisoned"))
    }

    fn insert(&self, stored: Stored) -> Result<MatrixId, EngineError> {
        let mut store = self.lock()?;
        store.next_id += 1;
        let id = store.next_id;
        store.matrices.insert(id, stored);
        Ok(id)
    }

    fn fetch(&self, id: MatrixId) -> Result<Stored, EngineError> {
        self.lock()?
            .matrices
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::new(format!("no live matrix with id {id}")))
    }

    fn derive(&self, id: MatrixId, f: impl FnOnce(Stored) -> Result<Stored, EngineError>) -> Result<MatrixId, EngineError> {
        let stored = self.fetch(id)?;
        self.insert(f(stored)?)
    }

    fn open(&self, path: &Utf8Path) -> Result<Box<dyn H5Group>, EngineError> {
        self.h5.open(path)
    }

    fn read_sparse(&self, path: &Utf8Path, name: &str) -> Result<Stored, EngineError> {
        let root = self.open(path)?;
        match root.child_kind(name) {
            Some(H5Kind::Dataset) => read_dense(root.as_ref(), name, false),
            Some(H5Kind::Group) => {
                let group = root.group(name)?;
                let layout = sparse_layout(group.as_ref(), name)?;
                read_compressed(group.as_ref(), layout.dimensions, layout.csr)
            }
            None => Err(EngineError::new(format!("{path} has no object named '{name}'"))),
        }
    }
}

struct SparseLayout {
    dimensions: Dimensions,
    csr: bool,
}

/// Recognizes 10X (`shape` dataset, CSC), AnnData (`encoding-type` with an
/// `[obs, var]` shape attribute) and takane (`shape` and `layout`
/// attributes) sparse groups.
fn sparse_layout(group: &dyn H5Group, name: &str) -> Result<SparseLayout, EngineError> {
    if group.child_kind("shape") == Some(H5Kind::Dataset) {
        let shape = group.dataset("shape")?.values()?.to_i64().unwrap_or_default();
        let [rows, columns] = shape_pair(&shape, name)?;
        return Ok(SparseLayout {
            dimensions: Dimensions { rows, columns },
            csr: false,
        });
    }

    let shape = group
        .read_attribute("shape")?
        .and_then(|attr| attr.values.to_i64())
        .ok_or_else(|| EngineError::new(format!("'{name}' is not a recognized sparse matrix")))?;
    let [first, second] = shape_pair(&shape, name)?;

    if let Some(encoding) = attribute_string(group, "encoding-type")? {
        // AnnData stores cells x genes; expose genes x cells.
        let csr = match encoding.as_str() {
            "csr_matrix" => false,
            "csc_matrix" => true,
            other => return Err(EngineError::new(format!("unsupported AnnData encoding '{other}'"))),
        };
        return Ok(SparseLayout {
            dimensions: Dimensions {
                rows: second,
                columns: first,
            },
            csr,
        });
    }

    let csr = attribute_string(group, "layout")?.as_deref() == Some("CSR");
    Ok(SparseLayout {
        dimensions: Dimensions {
            rows: first,
            columns: second,
        },
        csr,
    })
}

fn shape_pair(shape: &[i64], name: &str) -> Result<[usize; 2], EngineError> {
    match shape {
        [a, b] if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
        _ => Err(EngineError::new(format!("'{name}' has an invalid shape {shape:?}"))),
    }
}

fn attribute_string(object: &dyn H5Object, name: &str) -> Result<Option<String>, EngineError> {
    Ok(object
        .read_attribute(name)?
        .and_then(|attr| attr.values.first_string().map(str::to_string)))
}

fn read_indices(group: &dyn H5Group, name: &str) -> Result<Vec<usize>, EngineError> {
    let values = group
        .dataset(name)?
        .values()?
        .to_i64()
        .ok_or_else(|| EngineError::new(format!("'{name}' is not numeric")))?;
    values
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| EngineError::new(format!("negative entry in '{name}'"))))
        .collect()
}

fn read_compressed(group: &dyn H5Group, dimensions: Dimensions, csr: bool) -> Result<Stored, EngineError> {
    let data = group
        .dataset("data")?
        .values()?
        .to_f64()
        .ok_or_else(|| EngineError::new("sparse 'data' is not numeric"))?;
    let indices = read_indices(group, "indices")?;
    let indptr = read_indices(group, "indptr")?;

    let (major, minor) = if csr {
        (dimensions.rows, dimensions.columns)
    } else {
        (dimensions.columns, dimensions.rows)
    };
    if indptr.len() != major + 1 {
        return Err(EngineError::new(format!(
            "indptr has {} entries, expected {}",
            indptr.len(),
            major + 1
        )));
    }
    if data.len() != indices.len() || indptr[major] > data.len() {
        return Err(EngineError::new("sparse data and indices disagree in length"));
    }

    let mut stored = Stored::zeros(dimensions.rows, dimensions.columns);
    for outer in 0..major {
        let (start, end) = (indptr[outer], indptr[outer + 1]);
        if start > end {
            return Err(EngineError::new("indptr is not monotonic"));
        }
        for k in start..end {
            let inner = indices[k];
            if inner >= minor {
                return Err(EngineError::new(format!("index {inner} out of range {minor}")));
            }
            if csr {
                stored.set(outer, inner, data[k]);
            } else {
                stored.set(inner, outer, data[k]);
            }
        }
    }
    Ok(stored)
}

fn read_dense(root: &dyn H5Group, name: &str, transposed: bool) -> Result<Stored, EngineError> {
    let dataset = root.dataset(name)?;
    let shape = dataset.shape();
    let data = dataset
        .values()?
        .to_f64()
        .ok_or_else(|| EngineError::new(format!("'{name}' is not numeric")))?;
    let (first, second) = match shape.as_slice() {
        [n] => (*n, 1),
        [a, b] => (*a, *b),
        _ => return Err(EngineError::new(format!("'{name}' is not two-dimensional"))),
    };
    if data.len() != first * second {
        return Err(EngineError::new(format!("'{name}' holds {} values for shape {shape:?}", data.len())));
    }
    if shape.len() == 1 {
        return Ok(Stored::new(first, 1, data));
    }
    if !transposed {
        // Row-major [c, r] is column-major r x c.
        return Ok(Stored::new(second, first, data));
    }
    let mut stored = Stored::zeros(first, second);
    for i in 0..first {
        for j in 0..second {
            stored.set(i, j, data[i * second + j]);
        }
    }
    Ok(stored)
}

fn matrix_market_text(content: &FileContent, compression: Option<Compression>) -> Result<String, EngineError> {
    let bytes = content
        .bytes()
        .map_err(|err| EngineError::new(err.to_string()))?;
    text::unpack_text(&bytes, compression).map_err(|err| EngineError::new(err.to_string()))
}

struct MatrixMarketHeader {
    dimensions: Dimensions,
    entries: usize,
    pattern: bool,
    symmetric: bool,
}

fn parse_header<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Result<MatrixMarketHeader, EngineError> {
    let banner = lines
        .next()
        .ok_or_else(|| EngineError::new("empty Matrix Market file"))?;
    let tokens: Vec<String> = banner.split_whitespace().map(str::to_lowercase).collect();
    if tokens.first().map(String::as_str) != Some("%%matrixmarket") || tokens.len() < 5 {
        return Err(EngineError::new("missing %%MatrixMarket banner"));
    }
    if tokens[1] != "matrix" || tokens[2] != "coordinate" {
        return Err(EngineError::new("only coordinate matrices are supported"));
    }
    let pattern = tokens[3] == "pattern";
    let symmetric = tokens[4] == "symmetric";

    let size = lines
        .find(|line| !line.trim().is_empty() && !line.starts_with('%'))
        .ok_or_else(|| EngineError::new("missing Matrix Market size line"))?;
    let numbers = size
        .split_whitespace()
        .map(|token| token.parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| EngineError::new(format!("invalid size line '{size}': {err}")))?;
    let [rows, columns, entries] = numbers[..] else {
        return Err(EngineError::new(format!("invalid size line '{size}'")));
    };
    Ok(MatrixMarketHeader {
        dimensions: Dimensions { rows, columns },
        entries,
        pattern,
        symmetric,
    })
}

fn parse_matrix_market(text: &str) -> Result<Stored, EngineError> {
    let mut lines = text.lines();
    let header = parse_header(&mut lines)?;
    let Dimensions { rows, columns } = header.dimensions;
    let mut stored = Stored::zeros(rows, columns);

    let mut seen = 0usize;
    for line in lines {
        let line = line.trim();
        if line.is_empty() || line.starts_with('%') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let mut coordinate = || -> Result<usize, EngineError> {
            fields
                .next()
                .and_then(|field| field.parse::<usize>().ok())
                .filter(|&index| index >= 1)
                .map(|index| index - 1)
                .ok_or_else(|| EngineError::new(format!("invalid entry '{line}'")))
        };
        let (i, j) = (coordinate()?, coordinate()?);
        let value = if header.pattern {
            1.0
        } else {
            fields
                .next()
                .and_then(|field| field.parse::<f64>().ok())
                .ok_or_else(|| EngineError::new(format!("invalid value in '{line}'")))?
        };
        if i >= rows || j >= columns {
            return Err(EngineError::new(format!("entry ({}, {}) outside {rows} x {columns}", i + 1, j + 1)));
        }
        stored.set(i, j, value);
        if header.symmetric && i != j && j < rows && i < columns {
            stored.set(j, i, value);
        }
        seen += 1;
    }
    if seen != header.entries {
        return Err(EngineError::new(format!(
            "expected {} entries, found {seen}",
            header.entries
        )));
    }
    Ok(stored)
}

fn from_r_object(object: &RObject) -> Result<Stored, EngineError> {
    if let RObject::S4 { class, .. } = object {
        if class != "dgCMatrix" {
            return Err(EngineError::new(format!("unsupported matrix class '{class}'")));
        }
        let slot_f64 = |name: &str| -> Result<Vec<f64>, EngineError> {
            object
                .slot(name)
                .and_then(RObject::to_f64)
                .ok_or_else(|| EngineError::new(format!("dgCMatrix lacks slot '{name}'")))
        };
        let dims = slot_f64("Dim")?;
        let [rows, columns] = dims[..] else {
            return Err(EngineError::new("dgCMatrix has an invalid Dim slot"));
        };
        let (rows, columns) = (rows as usize, columns as usize);
        let row_index = slot_f64("i")?;
        let pointers = slot_f64("p")?;
        let values = slot_f64("x")?;
        if pointers.len() != columns + 1 || row_index.len() != values.len() {
            return Err(EngineError::new("dgCMatrix slots disagree in length"));
        }
        let mut stored = Stored::zeros(rows, columns);
        for j in 0..columns {
            for k in pointers[j] as usize..pointers[j + 1] as usize {
                let i = row_index
                    .get(k)
                    .map(|&i| i as usize)
                    .filter(|&i| i < rows)
                    .ok_or_else(|| EngineError::new("dgCMatrix row index out of range"))?;
                stored.set(i, j, values[k]);
            }
        }
        return Ok(stored);
    }

    let (rows, columns) = object
        .dim()
        .ok_or_else(|| EngineError::new("R object is not a matrix"))?;
    let values = object
        .to_f64()
        .ok_or_else(|| EngineError::new("R matrix is not numeric"))?;
    if values.len() != rows * columns {
        return Err(EngineError::new("R matrix length disagrees with its dim"));
    }
    Ok(Stored::new(rows, columns, values))
}

fn checked_factors(factors: Vec<f64>, allow_zeros: bool) -> Result<Vec<f64>, EngineError> {
    factors
        .into_iter()
        .map(|factor| {
            if factor > 0.0 && factor.is_finite() {
                Ok(factor)
            } else if allow_zeros && factor == 0.0 {
                Ok(1.0)
            } else {
                Err(EngineError::new(format!("invalid size factor {factor}")))
            }
        })
        .collect()
}

impl MatrixEngine for MemoryMatrixEngine {
    fn sparse_from_matrix_market(
        &self,
        content: &FileContent,
        compression: Option<Compression>,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError> {
        let text = matrix_market_text(content, compression)?;
        self.insert(parse_matrix_market(&text)?.truncated(force_integer))
    }

    fn matrix_market_dimensions(
        &self,
        content: &FileContent,
        compression: Option<Compression>,
    ) -> Result<Dimensions, EngineError> {
        let text = matrix_market_text(content, compression)?;
        Ok(parse_header(&mut text.lines())?.dimensions)
    }

    fn sparse_from_hdf5(&self, path: &Utf8Path, name: &str, force_integer: bool) -> Result<MatrixId, EngineError> {
        let stored = self.read_sparse(path, name)?;
        self.insert(stored.truncated(force_integer))
    }

    fn sparse_from_hdf5_group(
        &self,
        path: &Utf8Path,
        name: &str,
        dimensions: Dimensions,
        csr: bool,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError> {
        let root = self.open(path)?;
        let group = root.group(name)?;
        let stored = read_compressed(group.as_ref(), dimensions, csr)?;
        self.insert(stored.truncated(force_integer))
    }

    fn dense_from_hdf5(
        &self,
        path: &Utf8Path,
        name: &str,
        transposed: bool,
        force_integer: bool,
    ) -> Result<MatrixId, EngineError> {
        let root = self.open(path)?;
        let stored = read_dense(root.as_ref(), name, transposed)?;
        self.insert(stored.truncated(force_integer))
    }

    fn hdf5_matrix_details(&self, path: &Utf8Path, name: &str) -> Result<Dimensions, EngineError> {
        let root = self.open(path)?;
        match root.child_kind(name) {
            Some(H5Kind::Group) => Ok(sparse_layout(root.group(name)?.as_ref(), name)?.dimensions),
            Some(H5Kind::Dataset) => {
                let shape = root.dataset(name)?.shape();
                match shape.as_slice() {
                    [columns, rows] => Ok(Dimensions {
                        rows: *rows,
                        columns: *columns,
                    }),
                    _ => Err(EngineError::new(format!("'{name}' is not two-dimensional"))),
                }
            }
            None => Err(EngineError::new(format!("{path} has no object named '{name}'"))),
        }
    }

    fn from_rds(&self, object: &RObject, force_integer: bool) -> Result<MatrixId, EngineError> {
        self.insert(from_r_object(object)?.truncated(force_integer))
    }

    fn dimensions(&self, id: MatrixId) -> Result<Dimensions, EngineError> {
        let stored = self.fetch(id)?;
        Ok(Dimensions {
            rows: stored.rows,
            columns: stored.columns,
        })
    }

    fn identities(&self, id: MatrixId) -> Result<Vec<usize>, EngineError> {
        Ok(self.fetch(id)?.identities)
    }

    fn column(&self, id: MatrixId, index: usize) -> Result<Vec<f64>, EngineError> {
        let stored = self.fetch(id)?;
        if index >= stored.columns {
            return Err(EngineError::new(format!("column {index} out of range")));
        }
        Ok(stored.values[index * stored.rows..(index + 1) * stored.rows].to_vec())
    }

    fn log_norm_counts(
        &self,
        id: MatrixId,
        size_factors: Option<&[f64]>,
        center: bool,
        allow_zeros: bool,
    ) -> Result<MatrixId, EngineError> {
        self.derive(id, |stored| {
            let mut factors = match size_factors {
                Some(factors) if factors.len() != stored.columns => {
                    return Err(EngineError::new(format!(
                        "{} size factors for {} columns",
                        factors.len(),
                        stored.columns
                    )));
                }
                Some(factors) => factors.to_vec(),
                None => stored.column_sums(),
            };
            if center {
                let positive: Vec<f64> = factors.iter().copied().filter(|f| *f > 0.0).collect();
                if !positive.is_empty() {
                    let mean = positive.iter().sum::<f64>() / positive.len() as f64;
                    for factor in &mut factors {
                        *factor /= mean;
                    }
                }
            }
            let factors = checked_factors(factors, allow_zeros)?;
            Ok(stored.scaled_columns(&factors, true))
        })
    }

    fn normalize_counts(
        &self,
        id: MatrixId,
        size_factors: &[f64],
        log: bool,
        allow_zeros: bool,
    ) -> Result<MatrixId, EngineError> {
        self.derive(id, |stored| {
            if size_factors.len() != stored.columns {
                return Err(EngineError::new("size factors do not match the column count"));
            }
            let factors = checked_factors(size_factors.to_vec(), allow_zeros)?;
            Ok(stored.scaled_columns(&factors, log))
        })
    }

    fn delayed_arithmetic(
        &self,
        id: MatrixId,
        op: ArithOp,
        operand: &Operand,
        side: Side,
    ) -> Result<MatrixId, EngineError> {
        self.derive(id, |mut stored| {
            if let Operand::Vector { values, along } = operand {
                let expected = match along {
                    Axis::Rows => stored.rows,
                    Axis::Columns => stored.columns,
                };
                if values.len() != expected {
                    return Err(EngineError::new(format!(
                        "operand of length {} along {along:?}, expected {expected}",
                        values.len()
                    )));
                }
            }
            for j in 0..stored.columns {
                for i in 0..stored.rows {
                    let value = match operand {
                        Operand::Scalar(value) => *value,
                        Operand::Vector {
                            values,
                            along: Axis::Rows,
                        } => values[i],
                        Operand::Vector {
                            values,
                            along: Axis::Columns,
                        } => values[j],
                    };
                    let current = stored.get(i, j);
                    let result = match side {
                        Side::Right => op.apply(current, value),
                        Side::Left => op.apply(value, current),
                    };
                    stored.set(i, j, result);
                }
            }
            Ok(stored)
        })
    }

    fn delayed_math(&self, id: MatrixId, op: MathOp) -> Result<MatrixId, EngineError> {
        self.derive(id, |mut stored| {
            for value in &mut stored.values {
                *value = op.apply(*value);
            }
            Ok(stored)
        })
    }

    fn transpose(&self, id: MatrixId) -> Result<MatrixId, EngineError> {
        self.derive(id, |stored| {
            let mut out = Stored::zeros(stored.columns, stored.rows);
            for j in 0..stored.columns {
                for i in 0..stored.rows {
                    out.set(j, i, stored.get(i, j));
                }
            }
            Ok(out)
        })
    }

    fn subset_rows(&self, id: MatrixId, indices: &[usize]) -> Result<MatrixId, EngineError> {
        self.derive(id, |stored| {
            if let Some(bad) = indices.iter().find(|&&i| i >= stored.rows) {
                return Err(EngineError::new(format!("row {bad} out of range {}", stored.rows)));
            }
            let mut out = Stored::zeros(indices.len(), stored.columns);
            for j in 0..stored.columns {
                for (new, &old) in indices.iter().enumerate() {
                    out.set(new, j, stored.get(old, j));
                }
            }
            out.identities = indices.iter().map(|&i| stored.identities[i]).collect();
            Ok(out)
        })
    }

    fn subset_columns(&self, id: MatrixId, indices: &[usize]) -> Result<MatrixId, EngineError> {
        self.derive(id, |stored| {
            if let Some(bad) = indices.iter().find(|&&j| j >= stored.columns) {
                return Err(EngineError::new(format!("column {bad} out of range {}", stored.columns)));
            }
            let mut values = Vec::with_capacity(indices.len() * stored.rows);
            for &j in indices {
                values.extend_from_slice(&stored.values[j * stored.rows..(j + 1) * stored.rows]);
            }
            let mut out = Stored::new(stored.rows, indices.len(), values);
            out.identities = stored.identities.clone();
            Ok(out)
        })
    }

    fn bind(&self, ids: &[MatrixId], along: Axis) -> Result<MatrixId, EngineError> {
        let parts = ids
            .iter()
            .map(|&id| self.fetch(id))
            .collect::<Result<Vec<_>, _>>()?;
        let first = parts
            .first()
            .ok_or_else(|| EngineError::new("nothing to bind"))?;

        let stored = match along {
            Axis::Rows => {
                if parts.iter().any(|part| part.columns != first.columns) {
                    return Err(EngineError::new("row-binding matrices with different column counts"));
                }
                let rows = parts.iter().map(|part| part.rows).sum();
                let mut out = Stored::zeros(rows, first.columns);
                let mut offset = 0;
                out.identities.clear();
                for part in &parts {
                    for j in 0..part.columns {
                        for i in 0..part.rows {
                            out.set(offset + i, j, part.get(i, j));
                        }
                    }
                    out.identities
                        .extend(part.identities.iter().map(|&identity| identity + offset));
                    offset += part.rows;
                }
                out
            }
            Axis::Columns => {
                if parts.iter().any(|part| part.rows != first.rows) {
                    return Err(EngineError::new("column-binding matrices with different row counts"));
                }
                let columns = parts.iter().map(|part| part.columns).sum();
                let values = parts
                    .iter()
                    .flat_map(|part| part.values.iter().copied())
                    .collect();
                let mut out = Stored::new(first.rows, columns, values);
                out.identities = first.identities.clone();
                out
            }
        };
        self.insert(stored)
    }

    fn free(&self, id: MatrixId) -> Result<(), EngineError> {
        self.lock()?
            .matrices
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::new(format!("matrix {id} already freed")))
    }

    fn live_handles(&self) -> usize {
        self.store
            .lock()
            .map(|store| store.matrices.len())
            .unwrap_or_default()
    }

    fn guess_features(&self, values: &[String]) -> Result<FeatureGuess, EngineError> {
        let compile = |pattern: &str| Regex::new(pattern).map_err(|err| EngineError::new(err.to_string()));
        let candidates = [
            (FeatureKind::Ensembl, "human", compile(r"^ENSG\d{11}")?),
            (FeatureKind::Ensembl, "mouse", compile(r"^ENSMUSG\d{11}")?),
            (FeatureKind::Symbol, "human", compile(r"^[A-Z0-9][A-Z0-9.\-]*$")?),
            (FeatureKind::Symbol, "mouse", compile(r"^[A-Z][a-z0-9.\-]+$")?),
        ];

        let total = values.len().max(1) as f64;
        let mut best = FeatureGuess {
            kind: FeatureKind::Symbol,
            species: "human".to_string(),
            confidence: 0.0,
        };
        for (kind, species, regex) in &candidates {
            let hits = values.iter().filter(|value| regex.is_match(value)).count();
            let confidence = hits as f64 / total;
            if confidence > best.confidence {
                best = FeatureGuess {
                    kind: *kind,
                    species: species.to_string(),
                    confidence,
                };
            }
        }
        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;

    use super::*;
    use crate::engine::MemoryH5Engine;

    fn engine() -> MemoryMatrixEngine {
        MemoryMatrixEngine::new(Arc::new(MemoryH5Engine))
    }

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n% comment\n3 2 3\n1 1 5\n3 1 2\n2 2 7\n";

    #[test]
    fn parses_matrix_market_and_tracks_handles() {
        let engine = engine();
        let content = FileContent::Bytes(Arc::from(MTX.as_bytes()));
        let dims = engine.matrix_market_dimensions(&content, None).unwrap();
        assert_eq!(dims, Dimensions { rows: 3, columns: 2 });

        let id = engine.sparse_from_matrix_market(&content, None, true).unwrap();
        assert_eq!(engine.column(id, 0).unwrap(), vec![5.0, 0.0, 2.0]);
        assert_eq!(engine.column(id, 1).unwrap(), vec![0.0, 7.0, 0.0]);
        assert_eq!(engine.live_handles(), 1);
        engine.free(id).unwrap();
        assert_eq!(engine.live_handles(), 0);
        assert!(engine.free(id).is_err());
    }

    #[test]
    fn rejects_entry_count_mismatch() {
        let text = "%%MatrixMarket matrix coordinate real general\n2 2 2\n1 1 1.5\n";
        let content = FileContent::Bytes(Arc::from(text.as_bytes()));
        assert!(engine().sparse_from_matrix_market(&content, None, false).is_err());
    }

    #[test]
    fn subsetting_preserves_identities() {
        let engine = engine();
        let id = engine
            .insert_dense(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let sub = engine.subset_rows(id, &[2, 0]).unwrap();
        assert_eq!(engine.identities(sub).unwrap(), vec![2, 0]);
        let again = engine.subset_rows(sub, &[1]).unwrap();
        assert_eq!(engine.identities(again).unwrap(), vec![0]);
        assert_eq!(engine.column(again, 1).unwrap(), vec![4.0]);
    }

    #[test]
    fn log_normalization_matches_manual_computation() {
        let engine = engine();
        let id = engine.insert_dense(2, 2, vec![1.0, 3.0, 2.0, 2.0]).unwrap();
        let normalized = engine
            .log_norm_counts(id, Some(&[2.0, 4.0]), false, false)
            .unwrap();
        let column = engine.column(normalized, 1).unwrap();
        assert!((column[0] - (1.5f64).log2()).abs() < 1e-12);

        let err = engine.log_norm_counts(id, Some(&[0.0, 1.0]), false, false);
        assert_matches!(err, Err(_));
    }

    #[test]
    fn binds_along_both_axes() {
        let engine = engine();
        let a = engine.insert_dense(1, 2, vec![1.0, 2.0]).unwrap();
        let b = engine.insert_dense(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let rows = engine.bind(&[a, b], Axis::Rows).unwrap();
        assert_eq!(engine.dimensions(rows).unwrap(), Dimensions { rows: 3, columns: 2 });
        assert_eq!(engine.column(rows, 1).unwrap(), vec![2.0, 5.0, 6.0]);
        assert!(engine.bind(&[a, b], Axis::Columns).is_err());
    }

    #[test]
    fn guesses_ensembl_identifiers() {
        let values = vec!["ENSG00000141510".to_string(), "ENSG00000012048".to_string()];
        let guess = engine().guess_features(&values).unwrap();
        assert_eq!(guess.kind, FeatureKind::Ensembl);
        assert_eq!(guess.species, "human");
        assert_eq!(guess.confidence, 1.0);
    }
}
