//! Path-addressed access to project directories, whether packed in a ZIP
//! archive or laid out on disk.

use std::collections::HashMap;
use std::fs;

use camino::Utf8PathBuf;
use serde_json::Value;

use crate::archive::{self, SharedArchive};
use crate::error::ScError;
use crate::file_ref::{FileContent, FileRef};

/// Upper bound on redirection hops before a chain is treated as cyclic.
pub const MAX_REDIRECTIONS: usize = 32;

/// Where an object's metadata document lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataLayout {
    /// `<path>.json` documents with a `$schema` field.
    ArtifactDb,
    /// `<path>/OBJECT` documents with a `type` field.
    Takane,
}

impl MetadataLayout {
    pub fn document_path(self, path: &str) -> String {
        match self {
            MetadataLayout::ArtifactDb if path.ends_with(".json") => path.to_string(),
            MetadataLayout::ArtifactDb => format!("{path}.json"),
            MetadataLayout::Takane => join(path, "OBJECT"),
        }
    }
}

/// Joins with `/` regardless of the host separator.
pub fn join(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{parent}/{child}")
    }
}

/// Strips a trailing `.json` so `x` and `x.json` address one object.
pub fn canonical_path(path: &str) -> &str {
    path.strip_suffix(".json").unwrap_or(path)
}

pub trait Navigator {
    fn file(&mut self, path: &str) -> Result<FileContent, ScError>;

    /// Parsed metadata document for the object at `path`.
    fn metadata(&mut self, path: &str) -> Result<Value, ScError>;

    fn exists(&mut self, path: &str) -> Result<bool, ScError>;

    /// Immediate children of a directory.
    fn list(&mut self, path: &str) -> Result<Vec<String>, ScError>;

    /// Releases a local copy previously returned by [`Navigator::file`].
    fn clean(&mut self, _local: FileContent) -> Result<(), ScError> {
        Ok(())
    }

    /// Drops cached state.
    fn clear(&mut self) {}

    /// Reads and parses a JSON file.
    fn json(&mut self, path: &str) -> Result<Value, ScError> {
        let bytes = self.file(path)?.bytes()?;
        parse_json(path, &bytes)
    }
}

pub(crate) fn parse_json(path: &str, bytes: &[u8]) -> Result<Value, ScError> {
    let text = crate::text::unpack_text(bytes, None)?;
    serde_json::from_str(&text).map_err(|err| ScError::json(path, err))
}

/// Navigator over a ZIP archive. The archive is decoded on first use and
/// may be shared with other navigators.
#[derive(Debug)]
pub struct ZipNavigator {
    source: FileRef,
    archive: Option<SharedArchive>,
    layout: MetadataLayout,
}

impl ZipNavigator {
    pub fn new(source: FileRef, layout: MetadataLayout) -> Self {
        Self {
            source,
            archive: None,
            layout,
        }
    }

    pub fn with_archive(source: FileRef, archive: SharedArchive, layout: MetadataLayout) -> Self {
        Self {
            source,
            archive: Some(archive),
            layout,
        }
    }

    pub fn archive(&mut self) -> Result<SharedArchive, ScError> {
        if let Some(archive) = &self.archive {
            return Ok(archive.clone());
        }
        tracing::debug!(file = self.source.name(), "decoding archive directory");
        let archive = archive::open_archive(&self.source)?;
        self.archive = Some(archive.clone());
        Ok(archive)
    }

    pub fn source(&self) -> &FileRef {
        &self.source
    }
}

impl Navigator for ZipNavigator {
    fn file(&mut self, path: &str) -> Result<FileContent, ScError> {
        let archive = self.archive()?;
        Ok(FileContent::Bytes(archive::read_entry(&archive, path)?.into()))
    }

    fn metadata(&mut self, path: &str) -> Result<Value, ScError> {
        let document = self.layout.document_path(path);
        self.json(&document)
    }

    fn exists(&mut self, path: &str) -> Result<bool, ScError> {
        let archive = self.archive()?;
        if archive::has_entry(&archive, path)? {
            return Ok(true);
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(archive::entry_names(&archive)?
            .iter()
            .any(|name| name.starts_with(&prefix)))
    }

    fn list(&mut self, path: &str) -> Result<Vec<String>, ScError> {
        let archive = self.archive()?;
        let prefix = match path.trim_end_matches('/') {
            "" => String::new(),
            trimmed => format!("{trimmed}/"),
        };
        let mut children: Vec<String> = Vec::new();
        for name in archive::entry_names(&archive)? {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let child = rest.split('/').next().unwrap_or(rest);
            if !child.is_empty() && !children.iter().any(|existing| existing == child) {
                children.push(child.to_string());
            }
        }
        Ok(children)
    }

    fn clear(&mut self) {
        self.archive = None;
    }
}

/// Navigator over an unpacked project directory. Files are handed out as
/// paths, so there is never a local copy to clean.
#[derive(Debug, Clone)]
pub struct FsNavigator {
    root: Utf8PathBuf,
    layout: MetadataLayout,
}

impl FsNavigator {
    pub fn new(root: impl Into<Utf8PathBuf>, layout: MetadataLayout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    fn resolve(&self, path: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(join(self.root.as_str(), path))
    }
}

impl Navigator for FsNavigator {
    fn file(&mut self, path: &str) -> Result<FileContent, ScError> {
        let full = self.resolve(path);
        if !full.is_file() {
            return Err(ScError::Filesystem(format!("no file at {full}")));
        }
        Ok(FileContent::Path(full))
    }

    fn metadata(&mut self, path: &str) -> Result<Value, ScError> {
        let document = self.layout.document_path(path);
        self.json(&document)
    }

    fn exists(&mut self, path: &str) -> Result<bool, ScError> {
        Ok(self.resolve(path).exists())
    }

    fn list(&mut self, path: &str) -> Result<Vec<String>, ScError> {
        let full = self.resolve(path);
        let entries = fs::read_dir(full.as_std_path())
            .map_err(|err| ScError::Filesystem(format!("list {full}: {err}")))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ScError::Filesystem(err.to_string()))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

/// Returns the redirection target if `document` is a redirection.
pub fn redirection_target(document: &Value) -> Result<Option<String>, ScError> {
    let is_redirection = document
        .get("$schema")
        .and_then(Value::as_str)
        .is_some_and(|schema| schema.starts_with("redirection/"));
    if !is_redirection {
        return Ok(None);
    }
    document
        .pointer("/redirection/targets/0/location")
        .and_then(Value::as_str)
        .map(|location| Some(canonical_path(location).to_string()))
        .ok_or_else(|| ScError::RequiredFieldMissing("redirection.targets[0].location".to_string()))
}

/// Fetches metadata for `path`, following redirections.
pub fn resolve_metadata(navigator: &mut dyn Navigator, path: &str) -> Result<Value, ScError> {
    let mut current = canonical_path(path).to_string();
    for _ in 0..=MAX_REDIRECTIONS {
        let document = navigator.metadata(&current)?;
        match redirection_target(&document)? {
            Some(target) => {
                tracing::debug!(from = %current, to = %target, "following redirection");
                current = target;
            }
            None => return Ok(document),
        }
    }
    Err(redirection_too_deep(path))
}

fn redirection_too_deep(path: &str) -> ScError {
    ScError::SchemaUnknown(format!(
        "redirection chain from '{path}' exceeds {MAX_REDIRECTIONS} hops"
    ))
}

/// Memoizes resolved metadata by canonical path. Every path visited while
/// resolving a redirection chain is cached with the final document.
#[derive(Debug)]
pub struct MetadataCache<N> {
    inner: N,
    entries: HashMap<String, Value>,
}

impl<N: Navigator> MetadataCache<N> {
    pub fn new(inner: N) -> Self {
        Self {
            inner,
            entries: HashMap::new(),
        }
    }

    pub fn inner(&self) -> &N {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut N {
        &mut self.inner
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

impl<N: Navigator> Navigator for MetadataCache<N> {
    fn file(&mut self, path: &str) -> Result<FileContent, ScError> {
        self.inner.file(path)
    }

    fn metadata(&mut self, path: &str) -> Result<Value, ScError> {
        let mut visited: Vec<String> = Vec::new();
        let mut current = canonical_path(path).to_string();
        let resolved = loop {
            if let Some(cached) = self.entries.get(&current) {
                break cached.clone();
            }
            if visited.len() > MAX_REDIRECTIONS {
                return Err(redirection_too_deep(path));
            }
            let document = self.inner.metadata(&current)?;
            visited.push(current.clone());
            match redirection_target(&document)? {
                Some(target) => current = target,
                None => break document,
            }
        };
        for key in visited {
            self.entries.insert(key, resolved.clone());
        }
        Ok(resolved)
    }

    fn exists(&mut self, path: &str) -> Result<bool, ScError> {
        self.inner.exists(path)
    }

    fn list(&mut self, path: &str) -> Result<Vec<String>, ScError> {
        self.inner.list(path)
    }

    fn clean(&mut self, local: FileContent) -> Result<(), ScError> {
        self.inner.clean(local)
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct MapNavigator {
        documents: HashMap<String, Value>,
        fetches: usize,
    }

    impl Navigator for MapNavigator {
        fn file(&mut self, path: &str) -> Result<FileContent, ScError> {
            Err(ScError::Filesystem(path.to_string()))
        }

        fn metadata(&mut self, path: &str) -> Result<Value, ScError> {
            self.fetches += 1;
            self.documents
                .get(path)
                .cloned()
                .ok_or_else(|| ScError::Filesystem(path.to_string()))
        }

        fn exists(&mut self, path: &str) -> Result<bool, ScError> {
            Ok(self.documents.contains_key(path))
        }

        fn list(&mut self, _path: &str) -> Result<Vec<String>, ScError> {
            Ok(Vec::new())
        }
    }

    fn redirect(to: &str) -> Value {
        json!({
            "$schema": "redirection/v1.json",
            "redirection": { "targets": [{ "type": "local", "location": to }] }
        })
    }

    #[test]
    fn cache_follows_and_records_redirections() {
        let mut inner = MapNavigator::default();
        inner.documents.insert("a".into(), redirect("b.json"));
        inner.documents.insert("b".into(), redirect("c"));
        inner
            .documents
            .insert("c".into(), json!({ "$schema": "summarized_experiment/v1.json" }));

        let mut cache = MetadataCache::new(inner);
        let a = cache.metadata("a.json").unwrap();
        let c = cache.metadata("c").unwrap();
        assert_eq!(a, c);
        assert_eq!(cache.entry_count(), 3);
        assert_eq!(cache.inner().fetches, 3);

        cache.metadata("b").unwrap();
        assert_eq!(cache.inner().fetches, 3);
        cache.clear();
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn redirection_cycles_are_bounded() {
        let mut inner = MapNavigator::default();
        inner.documents.insert("x".into(), redirect("y"));
        inner.documents.insert("y".into(), redirect("x"));
        let err = resolve_metadata(&mut inner, "x").unwrap_err();
        assert_matches!(err, ScError::SchemaUnknown(_));

        let mut cache = MetadataCache::new(inner);
        assert_matches!(cache.metadata("x"), Err(ScError::SchemaUnknown(_)));
    }

    #[test]
    fn zip_navigator_lists_and_reads_entries() {
        let bytes = crate::archive::tests::build_zip(&[
            ("exp/OBJECT", br#"{"type":"summarized_experiment"}"#),
            ("exp/assays/names.json", br#"["counts"]"#),
            ("exp/assays/0/OBJECT", br#"{"type":"dense_array"}"#),
        ]);
        let file = FileRef::from_bytes(bytes, "project.zip").unwrap();
        let mut navigator = ZipNavigator::new(file, MetadataLayout::Takane);
        assert_eq!(navigator.list("exp").unwrap(), vec!["OBJECT", "assays"]);
        assert_eq!(navigator.list("exp/assays/").unwrap(), vec!["names.json", "0"]);
        assert!(navigator.exists("exp/assays").unwrap());
        assert!(!navigator.exists("exp/reduced_dimensions").unwrap());
        assert_eq!(
            navigator.metadata("exp").unwrap()["type"],
            json!("summarized_experiment")
        );
        assert_eq!(navigator.json("exp/assays/names.json").unwrap(), json!(["counts"]));
    }

    #[test]
    fn fs_navigator_joins_with_forward_slashes() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("obj").as_std_path()).unwrap();
        fs::write(root.join("obj.json").as_std_path(), br#"{"$schema":"x/v1.json"}"#).unwrap();
        fs::write(root.join("obj/data.csv").as_std_path(), b"a\n").unwrap();

        let mut navigator = FsNavigator::new(root.clone(), MetadataLayout::ArtifactDb);
        assert_eq!(navigator.metadata("obj").unwrap()["$schema"], json!("x/v1.json"));
        assert_eq!(navigator.list("obj").unwrap(), vec!["data.csv"]);
        assert_matches!(navigator.file("obj/data.csv").unwrap(), FileContent::Path(_));
        assert!(navigator.file("obj/missing").is_err());
    }
}
