use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::domain::NamedMap;
use crate::error::{EngineError, ScError};
use crate::h5::{H5Attribute, H5Dataset, H5Engine, H5Group, H5Kind, H5Object, H5Type, H5Values};

/// One node of a document-encoded HDF5 file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum H5Node {
    Group {
        #[serde(default)]
        attributes: NamedMap<H5Attribute>,
        #[serde(default)]
        children: NamedMap<H5Node>,
    },
    Dataset {
        shape: Vec<usize>,
        values: H5Values,
        #[serde(default)]
        attributes: NamedMap<H5Attribute>,
    },
}

impl H5Node {
    pub fn group() -> Self {
        H5Node::Group {
            attributes: NamedMap::new(),
            children: NamedMap::new(),
        }
    }

    pub fn dataset(shape: Vec<usize>, values: H5Values) -> Self {
        H5Node::Dataset {
            shape,
            values,
            attributes: NamedMap::new(),
        }
    }

    pub fn strings<S: AsRef<str>>(values: &[S]) -> Self {
        let values: Vec<String> = values.iter().map(|v| v.as_ref().to_string()).collect();
        H5Node::dataset(vec![values.len()], H5Values::String(values))
    }

    pub fn integers(values: Vec<i64>) -> Self {
        H5Node::dataset(vec![values.len()], H5Values::Integer(values))
    }

    pub fn floats(values: Vec<f64>) -> Self {
        H5Node::dataset(vec![values.len()], H5Values::Float(values))
    }

    pub fn scalar_string(value: &str) -> Self {
        H5Node::dataset(Vec::new(), H5Values::String(vec![value.to_string()]))
    }

    /// Adds a child, creating intermediate groups for `/`-separated names.
    /// Datasets ignore children.
    pub fn with_child(mut self, name: &str, node: H5Node) -> Self {
        self.insert_child(name, node);
        self
    }

    fn insert_child(&mut self, name: &str, node: H5Node) {
        let H5Node::Group { children, .. } = self else {
            return;
        };
        match name.split_once('/') {
            None => {
                children.insert(name, node);
            }
            Some((head, rest)) => {
                if !children.contains_key(head) {
                    children.insert(head, H5Node::group());
                }
                if let Some(child) = children.get_mut(head) {
                    child.insert_child(rest, node);
                }
            }
        }
    }

    pub fn with_attribute(mut self, name: &str, values: H5Values) -> Self {
        let shape = if values.len() == 1 { Vec::new() } else { vec![values.len()] };
        let attribute = H5Attribute { values, shape };
        match &mut self {
            H5Node::Group { attributes, .. } | H5Node::Dataset { attributes, .. } => {
                attributes.insert(name, attribute);
            }
        }
        self
    }

    pub fn with_string_attribute(self, name: &str, value: &str) -> Self {
        self.with_attribute(name, H5Values::String(vec![value.to_string()]))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ScError> {
        serde_json::to_vec(self).map_err(|err| ScError::json("<h5 document>", err))
    }

    pub fn write_to(&self, path: &Utf8Path) -> Result<(), ScError> {
        fs::write(path.as_std_path(), self.to_bytes()?)
            .map_err(|err| ScError::Filesystem(format!("write {path}: {err}")))
    }

    fn kind(&self) -> H5Kind {
        match self {
            H5Node::Group { .. } => H5Kind::Group,
            H5Node::Dataset { .. } => H5Kind::Dataset,
        }
    }

    fn attributes(&self) -> &NamedMap<H5Attribute> {
        match self {
            H5Node::Group { attributes, .. } | H5Node::Dataset { attributes, .. } => attributes,
        }
    }

    fn resolve(&self, name: &str) -> Option<&H5Node> {
        let mut node = self;
        for part in name.split('/').filter(|part| !part.is_empty()) {
            match node {
                H5Node::Group { children, .. } => node = children.get(part)?,
                H5Node::Dataset { .. } => return None,
            }
        }
        Some(node)
    }
}

/// HDF5 engine over [`H5Node`] JSON documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryH5Engine;

impl H5Engine for MemoryH5Engine {
    fn open(&self, path: &Utf8Path) -> Result<Box<dyn H5Group>, EngineError> {
        let bytes = fs::read(path.as_std_path())
            .map_err(|err| EngineError::new(format!("cannot open {path}: {err}")))?;
        let node: H5Node = serde_json::from_slice(&bytes)
            .map_err(|err| EngineError::new(format!("{path} is not an HDF5 document: {err}")))?;
        match node {
            H5Node::Group { .. } => Ok(Box::new(MemoryObject { node })),
            H5Node::Dataset { .. } => Err(EngineError::new(format!("{path} has no root group"))),
        }
    }
}

struct MemoryObject {
    node: H5Node,
}

impl MemoryObject {
    fn lookup(&self, name: &str, expected: H5Kind) -> Result<MemoryObject, EngineError> {
        let node = self
            .node
            .resolve(name)
            .ok_or_else(|| EngineError::new(format!("no object named '{name}'")))?;
        if node.kind() != expected {
            return Err(EngineError::new(format!("'{name}' is not a {expected:?}")));
        }
        Ok(MemoryObject { node: node.clone() })
    }
}

impl H5Object for MemoryObject {
    fn attribute_names(&self) -> Vec<String> {
        self.node.attributes().keys().map(str::to_string).collect()
    }

    fn read_attribute(&self, name: &str) -> Result<Option<H5Attribute>, EngineError> {
        Ok(self.node.attributes().get(name).cloned())
    }
}

impl H5Group for MemoryObject {
    fn children(&self) -> Vec<(String, H5Kind)> {
        match &self.node {
            H5Node::Group { children, .. } => children
                .iter()
                .map(|(name, child)| (name.to_string(), child.kind()))
                .collect(),
            H5Node::Dataset { .. } => Vec::new(),
        }
    }

    fn child_kind(&self, name: &str) -> Option<H5Kind> {
        self.node.resolve(name).map(H5Node::kind)
    }

    fn group(&self, name: &str) -> Result<Box<dyn H5Group>, EngineError> {
        Ok(Box::new(self.lookup(name, H5Kind::Group)?))
    }

    fn dataset(&self, name: &str) -> Result<Box<dyn H5Dataset>, EngineError> {
        Ok(Box::new(self.lookup(name, H5Kind::Dataset)?))
    }
}

impl H5Dataset for MemoryObject {
    fn shape(&self) -> Vec<usize> {
        match &self.node {
            H5Node::Dataset { shape, .. } => shape.clone(),
            H5Node::Group { .. } => Vec::new(),
        }
    }

    fn dtype(&self) -> H5Type {
        match &self.node {
            H5Node::Dataset { values, .. } => values.dtype(),
            H5Node::Group { .. } => H5Type::Other,
        }
    }

    fn values(&self) -> Result<H5Values, EngineError> {
        match &self.node {
            H5Node::Dataset { values, .. } => Ok(values.clone()),
            H5Node::Group { .. } => Err(EngineError::new("groups carry no values")),
        }
    }
}
