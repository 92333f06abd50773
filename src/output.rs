use std::io::{self, Write};

use serde::Serialize;

use crate::dataset::{Abbreviated, Loaded, Summary};
use crate::domain::NamedMap;
use crate::matrix::Dimensions;
use crate::serialize::SerializedDataset;

/// Shape of a `load()` outcome, without the matrix contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub matrices: NamedMap<Dimensions>,
    pub cells: usize,
    pub primary_ids: NamedMap<Option<usize>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reduced_dimensions: Vec<String>,
}

impl LoadReport {
    pub fn new(loaded: &Loaded) -> Self {
        Self {
            matrices: loaded
                .matrix
                .iter()
                .map(|(name, matrix)| (name, matrix.dimensions()))
                .collect(),
            cells: loaded.cells.row_count(),
            primary_ids: loaded.primary_ids.map(|ids| ids.as_ref().map(Vec::len)),
            reduced_dimensions: loaded
                .reduced_dimensions
                .as_ref()
                .map(|dims| dims.keys().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(summary: &Summary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_abbreviated(abbreviated: &Abbreviated) -> io::Result<()> {
        Self::print_json(abbreviated)
    }

    pub fn print_load(report: &LoadReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_serialized(record: &SerializedDataset) -> io::Result<()> {
        Self::print_json(record)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
