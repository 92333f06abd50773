//! Loads one assay of an experiment into the matrix engine, whatever array
//! representation the project stored it in.

use serde_json::Value;

use crate::config::AssaySelector;
use crate::delayed::{self, DelayedOp, SeedArray};
use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::RealizedFile;
use crate::frame_loader::object_type;
use crate::h5::{self, H5Engine};
use crate::matrix::{Dimensions, MatrixHandle};
use crate::navigator::{self, Navigator};

/// Position of the selected assay. Unlike experiment selectors, an assay
/// that cannot be found is an error.
pub fn resolve_assay<S: AsRef<str>>(names: &[S], selector: &AssaySelector) -> Result<usize, ScError> {
    selector.resolve(names).ok_or_else(|| {
        let available: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
        ScError::SelectorInvalid(format!("assay {selector} not found among {available:?}"))
    })
}

/// An assay loaded for result readers: log-count trees are split into
/// their count seed and size factors.
#[derive(Debug)]
pub struct DecomposedAssay {
    pub matrix: MatrixHandle,
    pub size_factors: Option<Vec<f64>>,
}

pub fn load_assay(
    navigator: &mut dyn Navigator,
    engines: &Engines,
    path: &str,
    force_integer: bool,
) -> Result<MatrixHandle, ScError> {
    load(navigator, engines, path, force_integer, false).map(|assay| assay.matrix)
}

/// Like [`load_assay`], but a delayed array matching the log-count
/// template yields its unnormalized seed and the stored size factors.
pub fn load_assay_decomposed(
    navigator: &mut dyn Navigator,
    engines: &Engines,
    path: &str,
    force_integer: bool,
) -> Result<DecomposedAssay, ScError> {
    load(navigator, engines, path, force_integer, true)
}

fn load(
    navigator: &mut dyn Navigator,
    engines: &Engines,
    path: &str,
    force_integer: bool,
    decompose: bool,
) -> Result<DecomposedAssay, ScError> {
    let document = navigator::resolve_metadata(navigator, path)?;
    let kind = object_type(&document)
        .ok_or_else(|| ScError::SchemaUnknown(format!("no type for assay at '{path}'")))?;
    tracing::debug!(path, kind = %kind, "loading assay");

    let plain = |matrix: MatrixHandle| -> Result<DecomposedAssay, ScError> {
        Ok(DecomposedAssay {
            matrix,
            size_factors: None,
        })
    };
    match kind.as_str() {
        "hdf5_sparse_matrix" => {
            let file = resource_path(&document)?;
            let group = string_at(&document, "/hdf5_sparse_matrix/group")?;
            let dimensions = declared_dimensions(&document)?;
            with_file(navigator, &file, |realized| {
                let id = engines.matrix.sparse_from_hdf5_group(
                    realized.path(),
                    &group,
                    dimensions,
                    false,
                    force_integer,
                )?;
                MatrixHandle::adopt(engines.matrix.clone(), id)
            })
            .and_then(plain)
        }
        "hdf5_dense_array" => {
            let file = resource_path(&document)?;
            let dataset = string_at(&document, "/hdf5_dense_array/dataset")?;
            with_file(navigator, &file, |realized| {
                let transposed = {
                    let root = engines.h5.open(realized.path())?;
                    let data = root.dataset(&dataset)?;
                    h5::integer_attribute(data.as_ref(), "transposed")?.unwrap_or(0) != 0
                };
                let id = engines
                    .matrix
                    .dense_from_hdf5(realized.path(), &dataset, transposed, force_integer)?;
                MatrixHandle::adopt(engines.matrix.clone(), id)
            })
            .and_then(plain)
        }
        "hdf5_delayed_array" => {
            let file = resource_path(&document)?;
            let group = string_at(&document, "/hdf5_delayed_array/group")?;
            load_delayed(navigator, engines, path, &file, &group, force_integer, decompose)
        }
        "compressed_sparse_matrix" => {
            let file = navigator::join(path, "matrix.h5");
            with_file(navigator, &file, |realized| {
                let id = engines
                    .matrix
                    .sparse_from_hdf5(realized.path(), "compressed_sparse_matrix", force_integer)?;
                MatrixHandle::adopt(engines.matrix.clone(), id)
            })
            .and_then(plain)
        }
        "dense_array" => {
            let file = navigator::join(path, "array.h5");
            with_file(navigator, &file, |realized| {
                let transposed = {
                    let root = engines.h5.open(realized.path())?;
                    let group = root.group("dense_array")?;
                    h5::integer_attribute(group.as_ref(), "transposed")?.unwrap_or(0) != 0
                };
                let id = engines.matrix.dense_from_hdf5(
                    realized.path(),
                    "dense_array/data",
                    transposed,
                    force_integer,
                )?;
                MatrixHandle::adopt(engines.matrix.clone(), id)
            })
            .and_then(plain)
        }
        "delayed_array" => {
            let file = navigator::join(path, "array.h5");
            load_delayed(navigator, engines, path, &file, "delayed_array", force_integer, decompose)
        }
        other => Err(ScError::SchemaUnknown(format!("'{other}' is not a supported array at '{path}'"))),
    }
}

/// Realizes a project file for a path-addressed engine and releases the
/// local copy whether or not `f` succeeds.
fn with_file<T>(
    navigator: &mut dyn Navigator,
    file: &str,
    f: impl FnOnce(&RealizedFile) -> Result<T, ScError>,
) -> Result<T, ScError> {
    let content = navigator.file(file)?;
    let outcome = content.realize(".h5").and_then(|realized| f(&realized));
    navigator.clean(content)?;
    outcome
}

fn parse_tree(h5: &dyn H5Engine, realized: &RealizedFile, group: &str) -> Result<DelayedOp, ScError> {
    let root = h5.open(realized.path())?;
    delayed::parse_delayed(root.as_ref(), group)
}

fn load_delayed(
    navigator: &mut dyn Navigator,
    engines: &Engines,
    path: &str,
    file: &str,
    group: &str,
    force_integer: bool,
    decompose: bool,
) -> Result<DecomposedAssay, ScError> {
    let content = navigator.file(file)?;
    let outcome = content.realize(".h5").and_then(|realized| {
        let tree = parse_tree(engines.h5.as_ref(), &realized, group)?;
        let template = if decompose {
            delayed::recognize_log_normalized(&tree)
        } else {
            None
        };
        let (target, size_factors) = match template {
            Some(template) => (template.seed, Some(template.size_factors)),
            None => (&tree, None),
        };

        let mut load_seed = |seed: &SeedArray| -> Result<MatrixHandle, ScError> {
            match seed {
                SeedArray::CustomTakane { index } => {
                    let seed_path = navigator::join(path, &format!("seeds/{index}"));
                    load_assay(&mut *navigator, engines, &seed_path, force_integer)
                }
                SeedArray::AlabasterLocal { path } => load_assay(&mut *navigator, engines, path, force_integer),
                other => Err(ScError::DelayedUnsupported(format!("seed {other:?}"))),
            }
        };
        let matrix = delayed::execute(target, &engines.matrix, realized.path(), force_integer, &mut load_seed)?;
        Ok(DecomposedAssay { matrix, size_factors })
    });
    navigator.clean(content)?;
    outcome
}

fn resource_path(document: &Value) -> Result<String, ScError> {
    string_at(document, "/path")
}

fn string_at(document: &Value, pointer: &str) -> Result<String, ScError> {
    document
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ScError::RequiredFieldMissing(pointer.trim_start_matches('/').replace('/', ".")))
}

fn declared_dimensions(document: &Value) -> Result<Dimensions, ScError> {
    let dimension = |index: usize| {
        document
            .pointer(&format!("/array/dimensions/{index}"))
            .and_then(Value::as_u64)
            .map(|value| value as usize)
            .ok_or_else(|| ScError::RequiredFieldMissing("array.dimensions".to_string()))
    };
    Ok(Dimensions {
        rows: dimension(0)?,
        columns: dimension(1)?,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::archive::tests::build_zip;
    use crate::config::Selector;
    use crate::engine::H5Node;
    use crate::file_ref::FileRef;
    use crate::h5::H5Values;
    use crate::navigator::{MetadataLayout, ZipNavigator};

    fn navigator(entries: Vec<(String, Vec<u8>)>, layout: MetadataLayout) -> ZipNavigator {
        let borrowed: Vec<(&str, &[u8])> = entries
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
            .collect();
        let file = FileRef::from_bytes(build_zip(&borrowed), "project.zip").unwrap();
        ZipNavigator::new(file, layout)
    }

    #[test]
    fn assay_selectors_must_resolve() {
        let names = ["counts", "logcounts"];
        assert_eq!(resolve_assay(&names, &Selector::name("logcounts")).unwrap(), 1);
        assert_eq!(resolve_assay(&names, &Selector::Index(0)).unwrap(), 0);
        assert_matches!(
            resolve_assay(&names, &Selector::Index(2)),
            Err(ScError::SelectorInvalid(_))
        );
        assert_matches!(
            resolve_assay(&names, &Selector::name("normcounts")),
            Err(ScError::SelectorInvalid(_))
        );
    }

    #[test]
    fn loads_legacy_dense_arrays() {
        let engines = Engines::reference();
        let array = H5Node::group().with_child(
            "data",
            H5Node::dataset(vec![2, 3], H5Values::Integer(vec![1, 2, 3, 4, 5, 6])),
        );
        let document = json!({
            "$schema": "hdf5_dense_array/v1.json",
            "path": "assay/array.h5",
            "array": {"dimensions": [3, 2]},
            "hdf5_dense_array": {"dataset": "data"}
        });
        let mut nav = navigator(
            vec![
                ("assay/array.h5".to_string(), array.to_bytes().unwrap()),
                ("assay/array.h5.json".to_string(), serde_json::to_vec(&document).unwrap()),
            ],
            MetadataLayout::ArtifactDb,
        );
        let matrix = load_assay(&mut nav, &engines, "assay/array.h5", true).unwrap();
        assert_eq!(matrix.number_of_rows(), 3);
        assert_eq!(matrix.number_of_columns(), 2);
        assert_eq!(matrix.column(1).unwrap(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn decomposes_takane_log_counts() {
        let engines = Engines::reference();
        let seed = H5Node::group()
            .with_string_attribute("delayed_type", "array")
            .with_string_attribute("delayed_array", "custom takane seed array")
            .with_child("index", H5Node::dataset(Vec::new(), H5Values::Integer(vec![0])));
        let tree = crate::delayed::tests::log_norm_tree(seed, std::f64::consts::LN_2);
        let counts = H5Node::group().with_child(
            "compressed_sparse_matrix",
            H5Node::group()
                .with_attribute("shape", H5Values::Integer(vec![2, 2]))
                .with_string_attribute("layout", "CSC")
                .with_child("data", H5Node::integers(vec![1, 3, 2]))
                .with_child("indices", H5Node::integers(vec![0, 1, 0]))
                .with_child("indptr", H5Node::integers(vec![0, 2, 3])),
        );
        let mut nav = navigator(
            vec![
                ("logcounts/OBJECT".to_string(), br#"{"type":"delayed_array"}"#.to_vec()),
                (
                    "logcounts/array.h5".to_string(),
                    H5Node::group().with_child("delayed_array", tree).to_bytes().unwrap(),
                ),
                (
                    "logcounts/seeds/0/OBJECT".to_string(),
                    br#"{"type":"compressed_sparse_matrix"}"#.to_vec(),
                ),
                ("logcounts/seeds/0/matrix.h5".to_string(), counts.to_bytes().unwrap()),
            ],
            MetadataLayout::Takane,
        );

        let decomposed = load_assay_decomposed(&mut nav, &engines, "logcounts", true).unwrap();
        assert_eq!(decomposed.size_factors, Some(vec![0.5, 2.0]));
        assert_eq!(decomposed.matrix.column(0).unwrap(), vec![1.0, 3.0]);

        let evaluated = load_assay(&mut nav, &engines, "logcounts", true).unwrap();
        let column = evaluated.column(1).unwrap();
        assert!((column[0] - 2.0f64.log2()).abs() < 1e-12);
        drop((decomposed, evaluated));
        assert_eq!(engines.matrix.live_handles(), 0);
    }

    #[test]
    fn unknown_array_types_are_rejected() {
        let engines = Engines::reference();
        let mut nav = navigator(
            vec![("x/OBJECT".to_string(), br#"{"type":"vcf_experiment"}"#.to_vec())],
            MetadataLayout::Takane,
        );
        assert_matches!(
            load_assay(&mut nav, &engines, "x", false),
            Err(ScError::SchemaUnknown(_))
        );
    }
}
