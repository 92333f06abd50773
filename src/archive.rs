use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex, MutexGuard};

use zip::ZipArchive;

use crate::error::ScError;
use crate::file_ref::FileRef;

/// A decoded archive directory shared between navigators.
pub type SharedArchive = Arc<Mutex<ZipArchive<Cursor<Arc<[u8]>>>>>;

pub fn open_archive(file: &FileRef) -> Result<SharedArchive, ScError> {
    let bytes: Arc<[u8]> = file.content()?.bytes()?;
    let archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|err| ScError::Archive(format!("open zip {}: {err}", file.name())))?;
    Ok(Arc::new(Mutex::new(archive)))
}

fn lock(archive: &SharedArchive) -> Result<MutexGuard<'_, ZipArchive<Cursor<Arc<[u8]>>>>, ScError> {
    archive
        .lock()
        .map_err(|_| ScError::Archive("archive lock poisoned".to_string()))
}

/// Decompresses one entry.
pub fn read_entry(archive: &SharedArchive, name: &str) -> Result<Vec<u8>, ScError> {
    let mut archive = lock(archive)?;
    let mut entry = archive
        .by_name(name)
        .map_err(|err| ScError::Archive(format!("{name}: {err}")))?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| ScError::Archive(format!("{name}: {err}")))?;
    Ok(bytes)
}

/// Names of all file entries, directories excluded, in archive order.
pub fn entry_names(archive: &SharedArchive) -> Result<Vec<String>, ScError> {
    let archive = lock(archive)?;
    Ok(archive
        .file_names()
        .filter(|name| !name.ends_with('/'))
        .map(str::to_string)
        .collect())
}

pub fn has_entry(archive: &SharedArchive, name: &str) -> Result<bool, ScError> {
    Ok(lock(archive)?.index_for_name(name).is_some())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Write;

    use zip::ZipWriter;
    use zip::write::SimpleFileOptions;

    use super::*;

    pub(crate) fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn reads_entries_by_name() {
        let bytes = build_zip(&[("a/OBJECT", b"{}"), ("a/x.txt", b"hello")]);
        let file = FileRef::from_bytes(bytes, "project.zip").unwrap();
        let archive = open_archive(&file).unwrap();
        assert_eq!(entry_names(&archive).unwrap(), vec!["a/OBJECT", "a/x.txt"]);
        assert_eq!(read_entry(&archive, "a/x.txt").unwrap(), b"hello");
        assert!(has_entry(&archive, "a/OBJECT").unwrap());
        assert!(read_entry(&archive, "missing").is_err());
    }

    #[test]
    fn rejects_non_zip_bytes() {
        let file = FileRef::from_bytes(b"not a zip".to_vec(), "x.zip").unwrap();
        assert!(matches!(open_archive(&file), Err(ScError::Archive(_))));
    }
}
