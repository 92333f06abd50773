use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempPath;

use crate::error::ScError;

/// A file owned by the host environment rather than by this crate, e.g. an
/// upload handle or a file inside another container.
pub trait HostFile: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn read(&self) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
enum Origin {
    Buffer { bytes: Arc<[u8]>, name: String },
    Path(Utf8PathBuf),
    Host(Arc<dyn HostFile>),
}

/// Uniform handle to dataset bytes, wherever they live.
///
/// Construction performs no I/O; path-backed and host-backed references
/// read their bytes on demand.
#[derive(Debug, Clone)]
pub struct FileRef {
    origin: Origin,
}

impl FileRef {
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, name: impl Into<String>) -> Result<Self, ScError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ScError::InvalidFile(
                "a name is required for byte-buffer files".to_string(),
            ));
        }
        Ok(Self {
            origin: Origin::Buffer {
                bytes: bytes.into(),
                name,
            },
        })
    }

    pub fn from_path(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            origin: Origin::Path(path.into()),
        }
    }

    pub fn from_host(file: Arc<dyn HostFile>) -> Self {
        Self {
            origin: Origin::Host(file),
        }
    }

    pub fn name(&self) -> &str {
        match &self.origin {
            Origin::Buffer { name, .. } => name,
            Origin::Path(path) => path.file_name().unwrap_or(path.as_str()),
            Origin::Host(file) => file.name(),
        }
    }

    pub fn size(&self) -> Result<u64, ScError> {
        match &self.origin {
            Origin::Buffer { bytes, .. } => Ok(bytes.len() as u64),
            Origin::Path(path) => fs::metadata(path.as_std_path())
                .map(|meta| meta.len())
                .map_err(|err| ScError::Filesystem(format!("stat {path}: {err}"))),
            Origin::Host(file) => Ok(file.size()),
        }
    }

    /// Returns the file's bytes. Buffer-backed references are borrowed
    /// unless `copy` is set; other origins always produce an owned buffer.
    pub fn buffer(&self, copy: bool) -> Result<Cow<'_, [u8]>, ScError> {
        match &self.origin {
            Origin::Buffer { bytes, .. } if copy => Ok(Cow::Owned(bytes.to_vec())),
            Origin::Buffer { bytes, .. } => Ok(Cow::Borrowed(&bytes[..])),
            Origin::Path(path) => read_path(path).map(Cow::Owned),
            Origin::Host(file) => file
                .read()
                .map(Cow::Owned)
                .map_err(|err| ScError::Filesystem(format!("read {}: {err}", file.name()))),
        }
    }

    /// Path when the bytes already live on disk, otherwise the bytes.
    pub fn content(&self) -> Result<FileContent, ScError> {
        match &self.origin {
            Origin::Buffer { bytes, .. } => Ok(FileContent::Bytes(bytes.clone())),
            Origin::Path(path) => Ok(FileContent::Path(path.clone())),
            Origin::Host(file) => file
                .read()
                .map(|bytes| FileContent::Bytes(bytes.into()))
                .map_err(|err| ScError::Filesystem(format!("read {}: {err}", file.name()))),
        }
    }

    pub fn is_path(&self) -> bool {
        matches!(self.origin, Origin::Path(_))
    }
}

/// Bytes handed to a loader: either a local path or an in-memory buffer.
#[derive(Debug, Clone)]
pub enum FileContent {
    Path(Utf8PathBuf),
    Bytes(Arc<[u8]>),
}

impl FileContent {
    pub fn bytes(&self) -> Result<Arc<[u8]>, ScError> {
        match self {
            FileContent::Bytes(bytes) => Ok(bytes.clone()),
            FileContent::Path(path) => read_path(path).map(Arc::from),
        }
    }

    /// Hands out a filesystem path for engines that only accept paths.
    /// Buffers are written to a temporary file that lives as long as the
    /// returned [`RealizedFile`].
    pub fn realize(&self, suffix: &str) -> Result<RealizedFile, ScError> {
        match self {
            FileContent::Path(path) => Ok(RealizedFile {
                path: path.clone(),
                temp: None,
            }),
            FileContent::Bytes(bytes) => RealizedFile::from_bytes(bytes, suffix),
        }
    }
}

/// A path usable by file-addressed engines. Temporary paths are deleted on
/// drop, so every exit path releases them.
#[derive(Debug)]
pub struct RealizedFile {
    path: Utf8PathBuf,
    temp: Option<TempPath>,
}

impl RealizedFile {
    fn from_bytes(bytes: &[u8], suffix: &str) -> Result<Self, ScError> {
        let mut file = tempfile::Builder::new()
            .prefix("kira-sc")
            .suffix(suffix)
            .tempfile()
            .map_err(|err| ScError::Filesystem(err.to_string()))?;
        file.write_all(bytes)
            .map_err(|err| ScError::Filesystem(err.to_string()))?;
        file.flush()
            .map_err(|err| ScError::Filesystem(err.to_string()))?;
        let temp = file.into_temp_path();
        let path = Utf8PathBuf::from_path_buf(temp.to_path_buf())
            .map_err(|_| ScError::Filesystem("non-utf8 temporary path".to_string()))?;
        Ok(Self {
            path,
            temp: Some(temp),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Releases the temporary file now instead of on drop.
    pub fn flush(self) -> Result<(), ScError> {
        if let Some(temp) = self.temp {
            temp.close()
                .map_err(|err| ScError::Filesystem(err.to_string()))?;
        }
        Ok(())
    }
}

fn read_path(path: &Utf8Path) -> Result<Vec<u8>, ScError> {
    fs::read(path.as_std_path()).map_err(|err| ScError::Filesystem(format!("read {path}: {err}")))
}
