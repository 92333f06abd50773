//! Text decoding: gzip detection, whole-file unpacking, and a chunked
//! delimited-table reader.
//!
//! The table reader does not support newlines embedded inside quoted
//! fields; rows are split on raw newline bytes before field parsing.

use std::fs::File;
use std::io::{self, Cursor, Read};

use flate2::read::GzDecoder;

use crate::error::ScError;
use crate::file_ref::{FileContent, FileRef};

pub const GZIP_MAGIC: [u8; 3] = [0x1f, 0x8b, 0x08];
pub const DEFAULT_CHUNK_SIZE: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

pub fn detect_compression(bytes: &[u8]) -> Compression {
    if bytes.len() >= GZIP_MAGIC.len() && bytes[..GZIP_MAGIC.len()] == GZIP_MAGIC {
        Compression::Gzip
    } else {
        Compression::None
    }
}

pub fn unpack_text(bytes: &[u8], compression: Option<Compression>) -> Result<String, ScError> {
    let compression = compression.unwrap_or_else(|| detect_compression(bytes));
    match compression {
        Compression::None => String::from_utf8(bytes.to_vec()).map_err(|err| ScError::Text {
            name: "buffer".to_string(),
            message: err.to_string(),
        }),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(bytes);
            let mut text = String::new();
            decoder
                .read_to_string(&mut text)
                .map_err(|err| ScError::Text {
                    name: "buffer".to_string(),
                    message: err.to_string(),
                })?;
            Ok(text)
        }
    }
}

/// Anything the text readers accept.
#[derive(Debug, Clone)]
pub enum TextSource<'a> {
    Bytes(&'a [u8]),
    Content(&'a FileContent),
    File(&'a FileRef),
}

impl TextSource<'_> {
    fn describe(&self) -> String {
        match self {
            TextSource::Bytes(_) => "buffer".to_string(),
            TextSource::Content(FileContent::Path(path)) => path.to_string(),
            TextSource::Content(FileContent::Bytes(_)) => "buffer".to_string(),
            TextSource::File(file) => file.name().to_string(),
        }
    }

    fn open(&self, compression: Option<Compression>) -> Result<Box<dyn Read + '_>, ScError> {
        let name = self.describe();
        let io_err = |err: io::Error| ScError::Text {
            name: name.clone(),
            message: err.to_string(),
        };

        let raw: Box<dyn Read> = match self {
            TextSource::Bytes(bytes) => Box::new(Cursor::new(bytes.to_vec())),
            TextSource::Content(content) => open_content(content).map_err(io_err)?,
            TextSource::File(file) => open_content(&file.content()?).map_err(io_err)?,
        };

        let mut raw = io::BufReader::new(raw);
        let compression = match compression {
            Some(compression) => compression,
            None => {
                let head = io::BufRead::fill_buf(&mut raw).map_err(io_err)?;
                detect_compression(head)
            }
        };

        Ok(match compression {
            Compression::Gzip => Box::new(GzDecoder::new(raw)),
            Compression::None => Box::new(raw),
        })
    }
}

fn open_content(content: &FileContent) -> io::Result<Box<dyn Read>> {
    match content {
        FileContent::Path(path) => Ok(Box::new(File::open(path.as_std_path())?)),
        FileContent::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
    }
}

/// Reads lines with the chunked reader behind [`read_table`], dropping
/// trailing carriage returns.
pub fn read_lines(source: TextSource<'_>, compression: Option<Compression>) -> Result<Vec<String>, ScError> {
    read_lines_in_chunks(source, compression, DEFAULT_CHUNK_SIZE)
}

fn read_lines_in_chunks(
    source: TextSource<'_>,
    compression: Option<Compression>,
    chunk_size: usize,
) -> Result<Vec<String>, ScError> {
    let mut lines = Vec::new();
    for_each_block(source, compression, chunk_size, |block, name| {
        let text = std::str::from_utf8(block).map_err(|err| ScError::Text {
            name: name.to_string(),
            message: err.to_string(),
        })?;
        lines.extend(text.lines().map(|line| line.strip_suffix('\r').unwrap_or(line).to_string()));
        Ok(())
    })?;
    Ok(lines)
}

#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub delimiter: u8,
    pub chunk_size: usize,
    pub compression: Option<Compression>,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            delimiter: b'\t',
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: None,
        }
    }
}

/// Reads a delimited table in chunks of `chunk_size` (decompressed) bytes.
///
/// Raw bytes accumulate until the buffer holds at least one newline and is
/// at least `chunk_size` long; the complete lines are then parsed in one go
/// and the trailing partial line is carried over.
pub fn read_table(source: TextSource<'_>, options: TableOptions) -> Result<Vec<Vec<String>>, ScError> {
    let mut rows = Vec::new();
    for_each_block(source, options.compression, options.chunk_size, |block, name| {
        parse_block(block, options.delimiter, name, &mut rows)
    })?;
    Ok(rows)
}

/// Hands `parse` runs of complete lines, each at least `chunk_size` bytes
/// unless it is the last.
fn for_each_block<F>(
    source: TextSource<'_>,
    compression: Option<Compression>,
    chunk_size: usize,
    mut parse: F,
) -> Result<(), ScError>
where
    F: FnMut(&[u8], &str) -> Result<(), ScError>,
{
    let name = source.describe();
    let mut reader = source.open(compression)?;
    let chunk_size = chunk_size.max(1);

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let read = reader.read(&mut chunk).map_err(|err| ScError::Text {
            name: name.clone(),
            message: err.to_string(),
        })?;
        if read == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..read]);

        if pending.len() < chunk_size {
            continue;
        }
        if let Some(last_newline) = pending.iter().rposition(|&byte| byte == b'\n') {
            let remainder = pending.split_off(last_newline + 1);
            parse(&pending, &name)?;
            pending = remainder;
        }
    }

    if !pending.is_empty() {
        parse(&pending, &name)?;
    }
    Ok(())
}

fn parse_block(block: &[u8], delimiter: u8, name: &str, rows: &mut Vec<Vec<String>>) -> Result<(), ScError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(block);
    for record in reader.records() {
        let record = record.map_err(|err| ScError::Text {
            name: name.to_string(),
            message: err.to_string(),
        })?;
        rows.push(record.iter().map(|field| field.to_string()).collect());
    }
    Ok(())
}

/// Converts every value to a float, or returns `None` if any value is not
/// numeric. Missing markers (`NA`, `na`, `NaN`, `nan`, empty) become NaN.
pub fn promote_to_number<S: AsRef<str>>(values: &[S]) -> Option<Vec<f64>> {
    values
        .iter()
        .map(|value| parse_number(value.as_ref()))
        .collect()
}

fn parse_number(value: &str) -> Option<f64> {
    match value.trim() {
        "" | "NA" | "na" | "NaN" | "nan" => Some(f64::NAN),
        "Inf" | "inf" => Some(f64::INFINITY),
        "-Inf" | "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok(),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;

    use super::*;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn detects_gzip_magic() {
        assert_eq!(detect_compression(&gzip("a")), Compression::Gzip);
        assert_eq!(detect_compression(b"a\tb\n"), Compression::None);
        assert_eq!(detect_compression(&[0x1f]), Compression::None);
    }

    #[test]
    fn unpacks_plain_and_gzipped_text() {
        assert_eq!(unpack_text(b"abc", None).unwrap(), "abc");
        assert_eq!(unpack_text(&gzip("abc"), None).unwrap(), "abc");
    }

    #[test]
    fn small_chunks_split_rows_correctly() {
        let text = "a\tb\tc\n1\t2\t3\n\"x y\"\t5\t6\n7\t8\t9";
        for chunk_size in [1, 3, 7, 64] {
            let options = TableOptions {
                chunk_size,
                ..TableOptions::default()
            };
            let rows = read_table(TextSource::Bytes(text.as_bytes()), options).unwrap();
            assert_eq!(rows.len(), 4, "chunk size {chunk_size}");
            assert_eq!(rows[2], vec!["x y", "5", "6"]);
            assert_eq!(rows[3], vec!["7", "8", "9"]);
        }
    }

    #[test]
    fn gzipped_tables_are_inflated() {
        let bytes = gzip("g1\tG1\n g2\tG2\n");
        let options = TableOptions {
            chunk_size: 4,
            ..TableOptions::default()
        };
        let rows = read_table(TextSource::Bytes(&bytes), options).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["g1", "G1"]);
    }

    #[test]
    fn read_lines_strips_carriage_returns() {
        let lines = read_lines(TextSource::Bytes(b"a\r\nb\r\n"), None).unwrap();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[test]
    fn gzipped_lines_are_read_in_chunks() {
        let bytes = gzip("AAACCTG-1\r\nAAACGGG-1\nAAAGATG-1");
        for chunk_size in [1, 5, 64] {
            let lines = read_lines_in_chunks(TextSource::Bytes(&bytes), None, chunk_size).unwrap();
            assert_eq!(lines, vec!["AAACCTG-1", "AAACGGG-1", "AAAGATG-1"], "chunk size {chunk_size}");
        }
    }

    #[test]
    fn promotes_numbers_with_missing_markers() {
        let values = promote_to_number(&["1", "NA", "", "Inf", "-inf", "2.5"]).unwrap();
        assert_eq!(values[0], 1.0);
        assert!(values[1].is_nan() && values[2].is_nan());
        assert_eq!(values[3], f64::INFINITY);
        assert_eq!(values[4], f64::NEG_INFINITY);
        assert_eq!(values[5], 2.5);
        assert!(promote_to_number(&["1", "x"]).is_none());
    }

    #[test]
    fn promotion_is_idempotent_on_floats() {
        let original = vec![1.5, -0.25, f64::INFINITY, 1e-300];
        let text: Vec<String> = original.iter().map(|v| v.to_string()).collect();
        let promoted = promote_to_number(&text).unwrap();
        assert_eq!(promoted, original);
        let again: Vec<String> = promoted.iter().map(|v| v.to_string()).collect();
        assert_eq!(promote_to_number(&again).unwrap(), original);
    }
}
