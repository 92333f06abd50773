//! Persisting readers as `{format, files, options}` records.
//!
//! File bodies are either handed to a [`LinkRegistry`], which returns an
//! identifier, or appended to an [`EmbeddedBuffer`] and recorded by offset
//! and size. Every serialized file carries exactly one of the two.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::{Dataset, DatasetFile, Persistable, ReaderMode};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::registry;

/// Where a serialized file's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileBody {
    Linked { id: String },
    Embedded { offset: u64, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSerializedFile", into = "RawSerializedFile")]
pub struct SerializedFile {
    pub kind: String,
    pub name: String,
    pub body: FileBody,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSerializedFile {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
}

impl TryFrom<RawSerializedFile> for SerializedFile {
    type Error = String;

    fn try_from(raw: RawSerializedFile) -> Result<Self, Self::Error> {
        let body = match (raw.id, raw.offset, raw.size) {
            (Some(id), None, None) => FileBody::Linked { id },
            (None, Some(offset), Some(size)) => FileBody::Embedded { offset, size },
            _ => {
                return Err(format!(
                    "file '{}' must carry either an id or an offset and size",
                    raw.name
                ));
            }
        };
        Ok(Self {
            kind: raw.kind,
            name: raw.name,
            body,
        })
    }
}

impl From<SerializedFile> for RawSerializedFile {
    fn from(file: SerializedFile) -> Self {
        let (id, offset, size) = match file.body {
            FileBody::Linked { id } => (Some(id), None, None),
            FileBody::Embedded { offset, size } => (None, Some(offset), Some(size)),
        };
        Self {
            kind: file.kind,
            name: file.name,
            id,
            offset,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedDataset {
    pub format: FormatTag,
    #[serde(default)]
    pub mode: ReaderMode,
    pub files: Vec<SerializedFile>,
    pub options: Value,
}

/// Stores file bodies out of band and hands back identifiers for them.
pub trait LinkRegistry {
    fn create_link(&mut self, kind: &str, name: &str, bytes: &[u8]) -> Result<String, ScError>;

    fn resolve_link(&mut self, id: &str) -> Result<FileRef, ScError>;
}

/// A [`LinkRegistry`] that keeps bodies in memory.
#[derive(Debug, Default)]
pub struct MemoryLinkRegistry {
    entries: HashMap<String, (String, Arc<[u8]>)>,
    next: usize,
}

impl MemoryLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LinkRegistry for MemoryLinkRegistry {
    fn create_link(&mut self, kind: &str, name: &str, bytes: &[u8]) -> Result<String, ScError> {
        self.next += 1;
        let id = format!("{kind}-{}", self.next);
        self.entries.insert(id.clone(), (name.to_string(), Arc::from(bytes)));
        Ok(id)
    }

    fn resolve_link(&mut self, id: &str) -> Result<FileRef, ScError> {
        let (name, bytes) = self
            .entries
            .get(id)
            .ok_or_else(|| ScError::FormatMismatch(format!("unknown link '{id}'")))?;
        FileRef::from_bytes(bytes.clone(), name.clone())
    }
}

/// Concatenated file bodies addressed by offset and size.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedBuffer {
    bytes: Vec<u8>,
}

impl EmbeddedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Appends `bytes`, returning their offset and size.
    pub fn append(&mut self, bytes: &[u8]) -> (u64, u64) {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(bytes);
        (offset, bytes.len() as u64)
    }

    pub fn slice(&self, offset: u64, size: u64) -> Result<&[u8], ScError> {
        let start = usize::try_from(offset).map_err(|err| ScError::FormatMismatch(err.to_string()))?;
        let length = usize::try_from(size).map_err(|err| ScError::FormatMismatch(err.to_string()))?;
        start
            .checked_add(length)
            .and_then(|end| self.bytes.get(start..end))
            .ok_or_else(|| {
                ScError::FormatMismatch(format!(
                    "embedded range {offset}+{size} exceeds {} bytes",
                    self.bytes.len()
                ))
            })
    }
}

/// Destination for file bodies during [`serialize_dataset`].
pub enum FileStore<'a> {
    Linked(&'a mut dyn LinkRegistry),
    Embedded(&'a mut EmbeddedBuffer),
}

/// Origins available to [`unserialize_dataset`]. A record may mix linked
/// and embedded files; each kind needs its origin.
#[derive(Default)]
pub struct FileSource<'a> {
    links: Option<&'a mut dyn LinkRegistry>,
    embedded: Option<&'a EmbeddedBuffer>,
}

impl<'a> FileSource<'a> {
    pub fn linked(links: &'a mut dyn LinkRegistry) -> Self {
        Self {
            links: Some(links),
            embedded: None,
        }
    }

    pub fn embedded(buffer: &'a EmbeddedBuffer) -> Self {
        Self {
            links: None,
            embedded: Some(buffer),
        }
    }

    pub fn with_embedded(mut self, buffer: &'a EmbeddedBuffer) -> Self {
        self.embedded = Some(buffer);
        self
    }

    fn resolve(&mut self, file: &SerializedFile) -> Result<FileRef, ScError> {
        match &file.body {
            FileBody::Linked { id } => {
                let links = self
                    .links
                    .as_deref_mut()
                    .ok_or_else(|| ScError::Config(format!("no link registry to resolve '{id}'")))?;
                links.resolve_link(id)
            }
            FileBody::Embedded { offset, size } => {
                let buffer = self
                    .embedded
                    .ok_or_else(|| ScError::Config(format!("no embedded buffer for '{}'", file.name)))?;
                FileRef::from_bytes(buffer.slice(*offset, *size)?.to_vec(), file.name.clone())
            }
        }
    }
}

/// Records `dataset`'s format, options and files, storing every file body
/// in `store`.
pub fn serialize_dataset(dataset: &dyn Persistable, store: &mut FileStore<'_>) -> Result<SerializedDataset, ScError> {
    let mut files = Vec::new();
    for DatasetFile { kind, file } in dataset.files() {
        let bytes = file.buffer(false)?;
        let body = match store {
            FileStore::Linked(links) => FileBody::Linked {
                id: links.create_link(&kind, file.name(), &bytes)?,
            },
            FileStore::Embedded(buffer) => {
                let (offset, size) = buffer.append(&bytes);
                FileBody::Embedded { offset, size }
            }
        };
        files.push(SerializedFile {
            kind,
            name: file.name().to_string(),
            body,
        });
    }
    Ok(SerializedDataset {
        format: dataset.format(),
        mode: dataset.mode(),
        files,
        options: dataset.options()?,
    })
}

/// Rebuilds the reader described by `record`.
pub fn unserialize_dataset(
    record: &SerializedDataset,
    source: &mut FileSource<'_>,
    engines: Engines,
) -> Result<Box<dyn Persistable>, ScError> {
    let files = record
        .files
        .iter()
        .map(|file| Ok(DatasetFile::new(file.kind.clone(), source.resolve(file)?)))
        .collect::<Result<Vec<_>, ScError>>()?;
    registry::unserialize(record.format, record.mode, files, &record.options, engines)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::dataset::MatrixMarketDataset;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n2 2 2\n1 1 5\n2 2 7\n";

    fn dataset() -> MatrixMarketDataset {
        let matrix = FileRef::from_bytes(MTX.as_bytes().to_vec(), "m.mtx").unwrap();
        let genes = FileRef::from_bytes(b"G1\tA\nG2\tB\n".to_vec(), "genes.tsv").unwrap();
        MatrixMarketDataset::new(matrix, Some(genes), None, Engines::reference())
    }

    #[test]
    fn records_need_exactly_one_body() {
        let linked: SerializedFile = serde_json::from_value(json!({"type": "mtx", "name": "m.mtx", "id": "x"})).unwrap();
        assert_eq!(linked.body, FileBody::Linked { id: "x".into() });
        assert!(serde_json::from_value::<SerializedFile>(json!({"type": "mtx", "name": "m.mtx"})).is_err());
        assert!(
            serde_json::from_value::<SerializedFile>(
                json!({"type": "mtx", "name": "m.mtx", "id": "x", "offset": 0, "size": 3})
            )
            .is_err()
        );
    }

    #[test]
    fn embedded_round_trip_preserves_the_summary() {
        let mut original = dataset();
        let expected = original.summary(false).unwrap();

        let mut buffer = EmbeddedBuffer::new();
        let record = serialize_dataset(&original, &mut FileStore::Embedded(&mut buffer)).unwrap();
        assert_eq!(record.files[0].body, FileBody::Embedded { offset: 0, size: MTX.len() as u64 });
        let text = serde_json::to_string(&record).unwrap();
        let record: SerializedDataset = serde_json::from_str(&text).unwrap();

        let mut restored = unserialize_dataset(&record, &mut FileSource::embedded(&buffer), Engines::reference()).unwrap();
        assert_eq!(restored.summary(false).unwrap(), expected);
    }

    #[test]
    fn linked_round_trip_uses_the_registry() {
        let original = dataset();
        let mut links = MemoryLinkRegistry::new();
        let record = serialize_dataset(&original, &mut FileStore::Linked(&mut links)).unwrap();
        assert_eq!(links.len(), 2);
        assert_matches!(&record.files[1].body, FileBody::Linked { id } if id == "genes-2");

        assert!(matches!(
            unserialize_dataset(&record, &mut FileSource::default(), Engines::reference()),
            Err(ScError::Config(_))
        ));
        let restored = unserialize_dataset(&record, &mut FileSource::linked(&mut links), Engines::reference()).unwrap();
        assert_eq!(restored.files()[1].file.name(), "genes.tsv");
    }
}
