//! HDF5 object model consumed by the readers.
//!
//! The crate never links an HDF5 library itself; callers supply an
//! [`H5Engine`]. Names passed to `group`/`dataset` may contain `/` to
//! address nested objects.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ScError};
use crate::file_ref::{FileContent, RealizedFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H5Kind {
    Group,
    Dataset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H5Type {
    Integer,
    Float,
    String,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum H5Values {
    Integer(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
}

impl H5Values {
    pub fn len(&self) -> usize {
        match self {
            H5Values::Integer(values) => values.len(),
            H5Values::Float(values) => values.len(),
            H5Values::String(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> H5Type {
        match self {
            H5Values::Integer(_) => H5Type::Integer,
            H5Values::Float(_) => H5Type::Float,
            H5Values::String(_) => H5Type::String,
        }
    }

    /// Numeric view; strings yield `None`.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            H5Values::Integer(values) => Some(values.iter().map(|&v| v as f64).collect()),
            H5Values::Float(values) => Some(values.clone()),
            H5Values::String(_) => None,
        }
    }

    /// Integer view; floats are truncated.
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        match self {
            H5Values::Integer(values) => Some(values.clone()),
            H5Values::Float(values) => Some(values.iter().map(|&v| v.trunc() as i64).collect()),
            H5Values::String(_) => None,
        }
    }

    pub fn into_strings(self) -> Option<Vec<String>> {
        match self {
            H5Values::String(values) => Some(values),
            _ => None,
        }
    }

    pub fn first_string(&self) -> Option<&str> {
        match self {
            H5Values::String(values) => values.first().map(String::as_str),
            _ => None,
        }
    }

    pub fn first_f64(&self) -> Option<f64> {
        self.to_f64().and_then(|values| values.first().copied())
    }

    pub fn first_i64(&self) -> Option<i64> {
        self.to_i64().and_then(|values| values.first().copied())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct H5Attribute {
    pub values: H5Values,
    #[serde(default)]
    pub shape: Vec<usize>,
}

pub trait H5Object {
    fn attribute_names(&self) -> Vec<String>;
    fn read_attribute(&self, name: &str) -> Result<Option<H5Attribute>, EngineError>;
}

pub trait H5Group: H5Object {
    /// Child names in storage order with their kinds.
    fn children(&self) -> Vec<(String, H5Kind)>;
    fn child_kind(&self, name: &str) -> Option<H5Kind>;
    fn group(&self, name: &str) -> Result<Box<dyn H5Group>, EngineError>;
    fn dataset(&self, name: &str) -> Result<Box<dyn H5Dataset>, EngineError>;
}

pub trait H5Dataset: H5Object {
    fn shape(&self) -> Vec<usize>;
    fn dtype(&self) -> H5Type;
    fn values(&self) -> Result<H5Values, EngineError>;
}

pub trait H5Engine: Send + Sync {
    /// Opens the file's root group.
    fn open(&self, path: &Utf8Path) -> Result<Box<dyn H5Group>, EngineError>;
}

/// Reads a string dataset, or `None` when the child is absent, is not a
/// dataset, or is not string-typed.
pub fn extract_strings(group: &dyn H5Group, name: &str) -> Result<Option<Vec<String>>, ScError> {
    if group.child_kind(name) != Some(H5Kind::Dataset) {
        return Ok(None);
    }
    let dataset = group.dataset(name)?;
    if dataset.dtype() != H5Type::String {
        return Ok(None);
    }
    Ok(dataset.values()?.into_strings())
}

/// Like [`extract_strings`] but keeps the dataset's
/// `missing-value-placeholder` entries as `None`.
pub fn extract_optional_strings(
    group: &dyn H5Group,
    name: &str,
) -> Result<Option<Vec<Option<String>>>, ScError> {
    if group.child_kind(name) != Some(H5Kind::Dataset) {
        return Ok(None);
    }
    let dataset = group.dataset(name)?;
    if dataset.dtype() != H5Type::String {
        return Ok(None);
    }
    let placeholder = missing_placeholder(dataset.as_ref())?
        .and_then(|attr| attr.values.first_string().map(str::to_string));
    let values = dataset.values()?.into_strings().unwrap_or_default();
    Ok(Some(
        values
            .into_iter()
            .map(|value| (Some(&value) != placeholder.as_ref()).then_some(value))
            .collect(),
    ))
}

pub const MISSING_PLACEHOLDER: &str = "missing-value-placeholder";

pub fn missing_placeholder(object: &dyn H5Object) -> Result<Option<H5Attribute>, ScError> {
    Ok(object.read_attribute(MISSING_PLACEHOLDER)?)
}

pub fn string_attribute(object: &dyn H5Object, name: &str) -> Result<Option<String>, ScError> {
    Ok(object
        .read_attribute(name)?
        .and_then(|attr| attr.values.first_string().map(str::to_string)))
}

pub fn integer_attribute(object: &dyn H5Object, name: &str) -> Result<Option<i64>, ScError> {
    Ok(object
        .read_attribute(name)?
        .and_then(|attr| attr.values.first_i64()))
}

/// Reads a scalar (or first element of a 1-d) dataset as a string.
pub fn scalar_string(group: &dyn H5Group, name: &str) -> Result<Option<String>, ScError> {
    if group.child_kind(name) != Some(H5Kind::Dataset) {
        return Ok(None);
    }
    Ok(group
        .dataset(name)?
        .values()?
        .first_string()
        .map(str::to_string))
}

pub fn scalar_f64(group: &dyn H5Group, name: &str) -> Result<Option<f64>, ScError> {
    if group.child_kind(name) != Some(H5Kind::Dataset) {
        return Ok(None);
    }
    Ok(group.dataset(name)?.values()?.first_f64())
}

pub fn integer_values(group: &dyn H5Group, name: &str) -> Result<Option<Vec<i64>>, ScError> {
    if group.child_kind(name) != Some(H5Kind::Dataset) {
        return Ok(None);
    }
    Ok(group.dataset(name)?.values()?.to_i64())
}

/// An opened HDF5 root together with the file backing it. Buffers are
/// realized to a temporary path that lives as long as this value.
pub struct OpenedH5 {
    pub root: Box<dyn H5Group>,
    file: RealizedFile,
}

impl std::fmt::Debug for OpenedH5 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedH5").field("path", &self.path()).finish_non_exhaustive()
    }
}

impl OpenedH5 {
    pub fn open(engine: &dyn H5Engine, content: &FileContent) -> Result<Self, ScError> {
        let file = content.realize(".h5")?;
        let root = engine.open(file.path())?;
        Ok(Self { root, file })
    }

    pub fn path(&self) -> &Utf8Path {
        self.file.path()
    }

    pub fn file(&self) -> &RealizedFile {
        &self.file
    }
}
