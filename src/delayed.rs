//! Delayed-array expression trees stored as HDF5 groups.
//!
//! Only the operations needed to reconstruct stored log-normalized counts
//! are understood; anything else is reported as unsupported.

use std::sync::Arc;

use camino::Utf8Path;

use crate::error::ScError;
use crate::h5::{self, H5Group, H5Kind};
use crate::matrix::{ArithOp, Axis, Dimensions, MathOp, MatrixEngine, MatrixHandle, Operand, Side};

/// Tolerance when matching the `log(2)` divisor of the log-count template.
pub const LOG2_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub enum SeedArray {
    /// Seed stored as a sibling takane object, `seeds/<index>`.
    CustomTakane { index: usize },
    /// Seed stored as another resource of a legacy project.
    AlabasterLocal { path: String },
    /// Dataset inside the same file. `native` datasets use the `[c, r]`
    /// layout.
    Dense { dataset: String, native: bool },
    /// Compressed group inside the same file.
    Sparse { group: String, dimensions: Dimensions, csr: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DelayedOp {
    UnaryArith {
        op: ArithOp,
        operand: Operand,
        side: Side,
        seed: Box<DelayedOp>,
    },
    UnaryMath {
        op: MathOp,
        seed: Box<DelayedOp>,
    },
    Transpose {
        permutation: Vec<usize>,
        seed: Box<DelayedOp>,
    },
    Subset {
        rows: Option<Vec<usize>>,
        columns: Option<Vec<usize>>,
        seed: Box<DelayedOp>,
    },
    Combine {
        along: Axis,
        seeds: Vec<DelayedOp>,
    },
    Array(SeedArray),
}

fn unsupported(what: impl Into<String>) -> ScError {
    ScError::DelayedUnsupported(what.into())
}

fn child(parent: &str, name: &str) -> String {
    crate::navigator::join(parent, name)
}

fn required_string(root: &dyn H5Group, name: &str) -> Result<String, ScError> {
    h5::scalar_string(root, name)?.ok_or_else(|| ScError::RequiredFieldMissing(name.to_string()))
}

fn required_indices(root: &dyn H5Group, name: &str) -> Result<Vec<usize>, ScError> {
    let values = h5::integer_values(root, name)?.ok_or_else(|| ScError::RequiredFieldMissing(name.to_string()))?;
    values
        .into_iter()
        .map(|v| usize::try_from(v).map_err(|_| ScError::SchemaUnknown(format!("negative index in '{name}'"))))
        .collect()
}

/// Parses the tree rooted at group `name` of an opened file.
pub fn parse_delayed(root: &dyn H5Group, name: &str) -> Result<DelayedOp, ScError> {
    let group = root.group(name)?;
    let kind = h5::string_attribute(group.as_ref(), "delayed_type")?
        .ok_or_else(|| ScError::RequiredFieldMissing(format!("delayed_type of '{name}'")))?;
    match kind.as_str() {
        "operation" => {
            let operation = h5::string_attribute(group.as_ref(), "delayed_operation")?
                .ok_or_else(|| ScError::RequiredFieldMissing(format!("delayed_operation of '{name}'")))?;
            parse_operation(root, name, &operation)
        }
        "array" => {
            let array = h5::string_attribute(group.as_ref(), "delayed_array")?
                .ok_or_else(|| ScError::RequiredFieldMissing(format!("delayed_array of '{name}'")))?;
            parse_array(root, name, &array).map(DelayedOp::Array)
        }
        other => Err(unsupported(format!("delayed type '{other}'"))),
    }
}

fn parse_seed(root: &dyn H5Group, name: &str) -> Result<Box<DelayedOp>, ScError> {
    parse_delayed(root, &child(name, "seed")).map(Box::new)
}

fn parse_operation(root: &dyn H5Group, name: &str, operation: &str) -> Result<DelayedOp, ScError> {
    match operation {
        "unary arithmetic" => {
            let method = required_string(root, &child(name, "method"))?;
            let side = required_string(root, &child(name, "side"))?;
            let op = ArithOp::parse(&method).ok_or_else(|| unsupported(format!("arithmetic method '{method}'")))?;
            let seed = parse_seed(root, name)?;
            if side == "none" {
                return match op {
                    ArithOp::Subtract => Ok(DelayedOp::UnaryArith {
                        op: ArithOp::Multiply,
                        operand: Operand::Scalar(-1.0),
                        side: Side::Right,
                        seed,
                    }),
                    ArithOp::Add => Ok(*seed),
                    _ => Err(unsupported(format!("unary '{method}' without a value"))),
                };
            }
            let side = match side.as_str() {
                "left" => Side::Left,
                "right" => Side::Right,
                other => return Err(unsupported(format!("arithmetic side '{other}'"))),
            };
            Ok(DelayedOp::UnaryArith {
                op,
                operand: parse_operand(root, name)?,
                side,
                seed,
            })
        }
        "unary math" => {
            let method = required_string(root, &child(name, "method"))?;
            let base = h5::scalar_f64(root, &child(name, "base"))?;
            let op = MathOp::parse(&method, base).ok_or_else(|| unsupported(format!("math method '{method}'")))?;
            Ok(DelayedOp::UnaryMath {
                op,
                seed: parse_seed(root, name)?,
            })
        }
        "transpose" => Ok(DelayedOp::Transpose {
            permutation: required_indices(root, &child(name, "permutation"))?,
            seed: parse_seed(root, name)?,
        }),
        "subset" => {
            let index = child(name, "index");
            let axis = |axis: &str| -> Result<Option<Vec<usize>>, ScError> {
                let path = child(&index, axis);
                match root.child_kind(&path) {
                    Some(H5Kind::Dataset) => required_indices(root, &path).map(Some),
                    _ => Ok(None),
                }
            };
            Ok(DelayedOp::Subset {
                rows: axis("0")?,
                columns: axis("1")?,
                seed: parse_seed(root, name)?,
            })
        }
        "combine" => {
            let along = h5::integer_values(root, &child(name, "along"))?
                .and_then(|values| values.first().copied())
                .and_then(Axis::from_index)
                .ok_or_else(|| unsupported("combine along an unknown axis"))?;
            let seeds_group = child(name, "seeds");
            let count = root.group(&seeds_group)?.children().len();
            let seeds = (0..count)
                .map(|index| parse_delayed(root, &child(&seeds_group, &index.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(DelayedOp::Combine { along, seeds })
        }
        other => Err(unsupported(format!("operation '{other}'"))),
    }
}

fn parse_operand(root: &dyn H5Group, name: &str) -> Result<Operand, ScError> {
    let value_path = child(name, "value");
    let dataset = root.dataset(&value_path)?;
    let values = dataset
        .values()?
        .to_f64()
        .ok_or_else(|| unsupported("non-numeric arithmetic operand"))?;
    if dataset.shape().is_empty() {
        return values
            .first()
            .copied()
            .map(Operand::Scalar)
            .ok_or_else(|| ScError::RequiredFieldMissing(value_path));
    }
    let along = h5::integer_values(root, &child(name, "along"))?
        .and_then(|values| values.first().copied())
        .and_then(Axis::from_index)
        .ok_or_else(|| ScError::RequiredFieldMissing(child(name, "along")))?;
    Ok(Operand::Vector { values, along })
}

fn parse_array(root: &dyn H5Group, name: &str, array: &str) -> Result<SeedArray, ScError> {
    match array {
        "custom takane seed array" => {
            let index = h5::integer_values(root, &child(name, "index"))?
                .and_then(|values| values.first().copied())
                .and_then(|value| usize::try_from(value).ok())
                .ok_or_else(|| ScError::RequiredFieldMissing(child(name, "index")))?;
            Ok(SeedArray::CustomTakane { index })
        }
        "custom alabaster local array" => Ok(SeedArray::AlabasterLocal {
            path: required_string(root, &child(name, "path"))?,
        }),
        "dense array" => {
            let native = h5::integer_values(root, &child(name, "native"))?
                .and_then(|values| values.first().copied())
                .unwrap_or(0)
                != 0;
            Ok(SeedArray::Dense {
                dataset: child(name, "data"),
                native,
            })
        }
        "sparse matrix" => {
            let shape = required_indices(root, &child(name, "shape"))?;
            let [rows, columns] = shape[..] else {
                return Err(ScError::SchemaUnknown(format!("sparse seed '{name}' is not a matrix")));
            };
            let by_column = h5::integer_values(root, &child(name, "by_column"))?
                .and_then(|values| values.first().copied())
                .unwrap_or(1)
                != 0;
            Ok(SeedArray::Sparse {
                group: name.to_string(),
                dimensions: Dimensions { rows, columns },
                csr: !by_column,
            })
        }
        other => Err(unsupported(format!("array '{other}'"))),
    }
}

/// Size factors and seed of a `log2(1 + X / sf)` tree.
#[derive(Debug, Clone, PartialEq)]
pub struct LogNormTemplate<'a> {
    pub size_factors: Vec<f64>,
    pub seed: &'a DelayedOp,
}

pub fn recognize_log_normalized(op: &DelayedOp) -> Option<LogNormTemplate<'_>> {
    let DelayedOp::UnaryArith {
        op: ArithOp::Divide,
        operand: Operand::Scalar(divisor),
        side: Side::Right,
        seed,
    } = op
    else {
        return None;
    };
    if (divisor - std::f64::consts::LN_2).abs() > LOG2_TOLERANCE {
        return None;
    }
    let DelayedOp::UnaryMath {
        op: MathOp::Log1p,
        seed,
    } = seed.as_ref()
    else {
        return None;
    };
    let DelayedOp::UnaryArith {
        op: ArithOp::Divide,
        operand:
            Operand::Vector {
                values,
                along: Axis::Columns,
            },
        side: Side::Right,
        seed,
    } = seed.as_ref()
    else {
        return None;
    };
    matches!(seed.as_ref(), DelayedOp::Array(_)).then(|| LogNormTemplate {
        size_factors: values.clone(),
        seed: seed.as_ref(),
    })
}

/// Evaluates a tree through the matrix engine. Dense and sparse seeds are
/// read from `file`; other seeds are loaded by `load_seed`.
pub fn execute(
    op: &DelayedOp,
    engine: &Arc<dyn MatrixEngine>,
    file: &Utf8Path,
    force_integer: bool,
    load_seed: &mut dyn FnMut(&SeedArray) -> Result<MatrixHandle, ScError>,
) -> Result<MatrixHandle, ScError> {
    let adopt = |id| MatrixHandle::adopt(engine.clone(), id);
    match op {
        DelayedOp::Array(SeedArray::Dense { dataset, native }) => {
            adopt(engine.dense_from_hdf5(file, dataset, !native, force_integer)?)
        }
        DelayedOp::Array(SeedArray::Sparse {
            group,
            dimensions,
            csr,
        }) => adopt(engine.sparse_from_hdf5_group(file, group, *dimensions, *csr, force_integer)?),
        DelayedOp::Array(seed) => load_seed(seed),
        DelayedOp::UnaryArith {
            op,
            operand,
            side,
            seed,
        } => {
            let inner = execute(seed, engine, file, force_integer, load_seed)?;
            adopt(engine.delayed_arithmetic(inner.id(), *op, operand, *side)?)
        }
        DelayedOp::UnaryMath { op, seed } => {
            let inner = execute(seed, engine, file, force_integer, load_seed)?;
            adopt(engine.delayed_math(inner.id(), *op)?)
        }
        DelayedOp::Transpose { permutation, seed } => {
            let inner = execute(seed, engine, file, force_integer, load_seed)?;
            match permutation.as_slice() {
                [0, 1] => Ok(inner),
                [1, 0] => adopt(engine.transpose(inner.id())?),
                other => Err(unsupported(format!("transpose permutation {other:?}"))),
            }
        }
        DelayedOp::Subset { rows, columns, seed } => {
            let mut current = execute(seed, engine, file, force_integer, load_seed)?;
            if let Some(rows) = rows {
                current = current.subset_rows(rows)?;
            }
            if let Some(columns) = columns {
                current = current.subset_columns(columns)?;
            }
            Ok(current)
        }
        DelayedOp::Combine { along, seeds } => {
            let parts = seeds
                .iter()
                .map(|seed| execute(seed, engine, file, force_integer, load_seed))
                .collect::<Result<Vec<_>, _>>()?;
            let ids: Vec<_> = parts.iter().map(MatrixHandle::id).collect();
            adopt(engine.bind(&ids, *along)?)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;
    use crate::engine::{H5Node, MemoryH5Engine, MemoryMatrixEngine};
    use crate::h5::{H5Engine, H5Values};

    fn operation(kind: &str) -> H5Node {
        H5Node::group()
            .with_string_attribute("delayed_type", "operation")
            .with_string_attribute("delayed_operation", kind)
    }

    fn dense_seed() -> H5Node {
        H5Node::group()
            .with_string_attribute("delayed_type", "array")
            .with_string_attribute("delayed_array", "dense array")
            .with_child("native", H5Node::dataset(Vec::new(), H5Values::Integer(vec![1])))
            // [c, r] = [2, 2]: columns (1, 3) and (2, 2).
            .with_child("data", H5Node::dataset(vec![2, 2], H5Values::Float(vec![1.0, 3.0, 2.0, 2.0])))
    }

    pub(crate) fn log_norm_tree(seed: H5Node, divisor: f64) -> H5Node {
        let scaled = operation("unary arithmetic")
            .with_child("method", H5Node::scalar_string("/"))
            .with_child("side", H5Node::scalar_string("right"))
            .with_child("value", H5Node::floats(vec![0.5, 2.0]))
            .with_child("along", H5Node::dataset(Vec::new(), H5Values::Integer(vec![1])))
            .with_child("seed", seed);
        let logged = operation("unary math")
            .with_child("method", H5Node::scalar_string("log1p"))
            .with_child("seed", scaled);
        operation("unary arithmetic")
            .with_child("method", H5Node::scalar_string("/"))
            .with_child("side", H5Node::scalar_string("right"))
            .with_child("value", H5Node::dataset(Vec::new(), H5Values::Float(vec![divisor])))
            .with_child("seed", logged)
    }

    fn write(node: H5Node) -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("delayed.h5")).unwrap();
        H5Node::group().with_child("delayed_array", node).write_to(&path).unwrap();
        (dir, path)
    }

    #[test]
    fn recognizes_the_log_count_template() {
        let (_dir, path) = write(log_norm_tree(dense_seed(), std::f64::consts::LN_2 + 1e-10));
        let root = MemoryH5Engine.open(&path).unwrap();
        let tree = parse_delayed(root.as_ref(), "delayed_array").unwrap();
        let template = recognize_log_normalized(&tree).unwrap();
        assert_eq!(template.size_factors, vec![0.5, 2.0]);
        assert_matches!(template.seed, DelayedOp::Array(SeedArray::Dense { native: true, .. }));

        let (_dir, path) = write(log_norm_tree(dense_seed(), 0.7));
        let root = MemoryH5Engine.open(&path).unwrap();
        let tree = parse_delayed(root.as_ref(), "delayed_array").unwrap();
        assert!(recognize_log_normalized(&tree).is_none());
    }

    #[test]
    fn executes_trees_through_the_engine() {
        let (_dir, path) = write(log_norm_tree(dense_seed(), std::f64::consts::LN_2));
        let h5: Arc<dyn H5Engine> = Arc::new(MemoryH5Engine);
        let root = h5.open(&path).unwrap();
        let tree = parse_delayed(root.as_ref(), "delayed_array").unwrap();
        let memory = Arc::new(MemoryMatrixEngine::new(h5));
        let engine: Arc<dyn MatrixEngine> = memory.clone();

        let mut no_seeds = |_: &SeedArray| -> Result<MatrixHandle, ScError> { Err(unsupported("seed")) };
        let result = execute(&tree, &engine, &path, false, &mut no_seeds).unwrap();
        let column = result.column(1).unwrap();
        assert!((column[0] - (1.0f64 + 2.0 / 2.0).log2()).abs() < 1e-12);
        drop(result);
        assert_eq!(memory.live_handles(), 0);
    }

    #[test]
    fn unknown_operations_are_unsupported() {
        let node = operation("binary arithmetic").with_child("left", dense_seed());
        let (_dir, path) = write(node);
        let root = MemoryH5Engine.open(&path).unwrap();
        let err = parse_delayed(root.as_ref(), "delayed_array").unwrap_err();
        assert_matches!(err, ScError::DelayedUnsupported(message) if message.contains("binary arithmetic"));
    }
}
