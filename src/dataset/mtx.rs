//! Matrix Market counts with optional feature and barcode tables.

use serde_json::Value;

use crate::config::{self, MatrixMarketOptions};
use crate::dataset::{
    apply_options, Annotations, Dataset, DatasetFile, Loaded, Persistable, PrimaryIds, Summary, Unserialize,
};
use crate::domain::FormatTag;
use crate::engine::Engines;
use crate::error::ScError;
use crate::features::{self, PrimaryIdFallback};
use crate::file_ref::FileRef;
use crate::frame::{Column, DataFrame};
use crate::lifecycle::{self, DatasetState};
use crate::matrix::MatrixHandle;
use crate::text::{self, TableOptions, TextSource};

const TYPE_COLUMN: &str = "type";
const HEADERLESS_FEATURE_COLUMNS: [&str; 3] = ["id", "name", TYPE_COLUMN];

#[derive(Debug)]
pub struct MatrixMarketDataset {
    matrix: FileRef,
    genes: Option<FileRef>,
    annotations_file: Option<FileRef>,
    options: MatrixMarketOptions,
    engines: Engines,
    state: DatasetState,
    annotations: Option<Annotations>,
}

impl MatrixMarketDataset {
    pub fn new(matrix: FileRef, genes: Option<FileRef>, annotations: Option<FileRef>, engines: Engines) -> Self {
        Self {
            matrix,
            genes,
            annotations_file: annotations,
            options: MatrixMarketOptions::default(),
            engines,
            state: DatasetState::Fresh,
            annotations: None,
        }
    }

    pub fn config(&self) -> &MatrixMarketOptions {
        &self.options
    }

    pub fn set_config(&mut self, options: MatrixMarketOptions) {
        self.options = options;
    }

    fn default_label(&self) -> String {
        self.options.feature_type_rna_name.clone().unwrap_or_default()
    }

    fn annotations(&mut self) -> Result<&Annotations, ScError> {
        let annotations = match self.annotations.take() {
            Some(annotations) => annotations,
            None => self.read_annotations()?,
        };
        self.state = DatasetState::Populated;
        Ok(self.annotations.insert(annotations))
    }

    fn read_annotations(&mut self) -> Result<Annotations, ScError> {
        let content = self.matrix.content()?;
        self.state = DatasetState::Opened;
        let dimensions = self.engines.matrix.matrix_market_dimensions(&content, None)?;

        let features = match &self.genes {
            Some(file) => {
                let table = read_rows(file, dimensions.rows)?;
                feature_frame(table, dimensions.rows)?
            }
            None => DataFrame::empty(dimensions.rows),
        };
        let cells = match &self.annotations_file {
            Some(file) => {
                let table = read_rows(file, dimensions.columns)?;
                cell_frame(table, dimensions.columns)?
            }
            None => DataFrame::empty(dimensions.columns),
        };
        Ok(Annotations { features, cells })
    }

    fn type_column(features: &DataFrame) -> Option<&'static str> {
        features.has_column(TYPE_COLUMN).then_some(TYPE_COLUMN)
    }

    fn summarize(&mut self) -> Result<Summary, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let annotations = self.annotations()?;
        let type_column = Self::type_column(&annotations.features);
        let modality_features = features::split_features(&annotations.features, type_column, &labels, &default)?;
        Ok(Summary::new(modality_features, annotations.cells.clone()))
    }

    fn load_matrices(&mut self) -> Result<Loaded, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let selectors = self.options.primary_id_columns();

        self.annotations()?;
        let content = self.matrix.content()?;
        let id = self.engines.matrix.sparse_from_matrix_market(&content, None, true)?;
        let handle = MatrixHandle::adopt(self.engines.matrix.clone(), id)?;

        let annotations = self.annotations()?;
        let type_column = Self::type_column(&annotations.features);
        let split = features::split_by_modality(handle, &annotations.features, type_column, &labels, &default)?;
        let primary_ids = features::extract_primary_ids(&split.features, &selectors, PrimaryIdFallback::RowNames);
        Ok(Loaded {
            matrix: split.matrix,
            features: split.features,
            cells: annotations.cells.clone(),
            primary_ids,
            row_ids: split.row_ids,
            reduced_dimensions: None,
            other_metadata: None,
        })
    }

    fn preview(&mut self) -> Result<PrimaryIds, ScError> {
        let labels = self.options.feature_type_labels();
        let default = self.default_label();
        let selectors = self.options.primary_id_columns();
        let annotations = self.annotations()?;
        let type_column = Self::type_column(&annotations.features);
        let split = features::split_features(&annotations.features, type_column, &labels, &default)?;
        Ok(features::extract_primary_ids(&split, &selectors, PrimaryIdFallback::RowNames))
    }
}

/// A parsed annotation table and whether its first row is a header.
struct Table {
    header: Option<Vec<String>>,
    rows: Vec<Vec<String>>,
}

/// Reads a tab-separated table that must describe `expected` entries,
/// optionally after one header line.
fn read_rows(file: &FileRef, expected: usize) -> Result<Table, ScError> {
    let mut rows = text::read_table(TextSource::File(file), TableOptions::default())?;
    let name = file.name().to_string();
    if rows.len() == expected + 1 {
        let header = rows.remove(0);
        Ok(Table {
            header: Some(header),
            rows,
        })
    } else if rows.len() == expected {
        Ok(Table {
            header: None,
            rows,
        })
    } else {
        Err(ScError::DimensionMismatch(format!(
            "{name} has {} lines but the matrix has {expected} entries on that axis",
            rows.len()
        )))
    }
}

fn column_name(table: &Table, index: usize, defaults: &[&str]) -> String {
    table
        .header
        .as_ref()
        .and_then(|header| header.get(index))
        .filter(|name| !name.is_empty())
        .cloned()
        .or_else(|| defaults.get(index).map(|name| name.to_string()))
        .unwrap_or_else(|| format!("column_{}", index + 1))
}

fn table_columns(table: &Table) -> usize {
    let body = table.rows.iter().map(Vec::len).max().unwrap_or(0);
    body.max(table.header.as_ref().map_or(0, Vec::len))
}

fn raw_column(table: &Table, index: usize) -> Vec<String> {
    table
        .rows
        .iter()
        .map(|row| row.get(index).cloned().unwrap_or_default())
        .collect()
}

/// Header-less feature files follow the 10X layout of id, symbol and
/// feature type.
fn feature_frame(table: Table, rows: usize) -> Result<DataFrame, ScError> {
    let mut frame = DataFrame::empty(rows);
    for index in 0..table_columns(&table) {
        let name = column_name(&table, index, &HEADERLESS_FEATURE_COLUMNS);
        frame.add_column(name, Column::strings(raw_column(&table, index)))?;
    }
    Ok(frame)
}

/// Numeric barcode annotations are promoted to numbers.
fn cell_frame(table: Table, rows: usize) -> Result<DataFrame, ScError> {
    let mut frame = DataFrame::empty(rows);
    for index in 0..table_columns(&table) {
        let name = column_name(&table, index, &[]);
        let values = raw_column(&table, index);
        let column = match text::promote_to_number(&values) {
            Some(numbers) => Column::Number(numbers),
            None => Column::strings(values),
        };
        frame.add_column(name, column)?;
    }
    Ok(frame)
}

impl Dataset for MatrixMarketDataset {
    fn state(&self) -> DatasetState {
        self.state
    }

    fn summary(&mut self, cache: bool) -> Result<Summary, ScError> {
        lifecycle::scoped(self, cache, Self::summarize)
    }

    fn load(&mut self, cache: bool) -> Result<Loaded, ScError> {
        lifecycle::scoped(self, cache, Self::load_matrices)
    }

    fn preview_primary_ids(&mut self, cache: bool) -> Result<PrimaryIds, ScError> {
        lifecycle::scoped(self, cache, Self::preview)
    }

    fn options(&self) -> Result<Value, ScError> {
        config::to_options_value(&self.options)
    }

    fn set_options(&mut self, partial: &Value) -> Result<(), ScError> {
        self.options = config::merge_options(&self.options, partial)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.annotations = None;
        if self.state != DatasetState::Fresh {
            self.state = DatasetState::Cleared;
        }
    }
}

impl Persistable for MatrixMarketDataset {
    fn format(&self) -> FormatTag {
        FormatTag::MatrixMarket
    }

    fn files(&self) -> Vec<DatasetFile> {
        let mut files = vec![DatasetFile::new("mtx", self.matrix.clone())];
        if let Some(genes) = &self.genes {
            files.push(DatasetFile::new("genes", genes.clone()));
        }
        if let Some(annotations) = &self.annotations_file {
            files.push(DatasetFile::new("annotations", annotations.clone()));
        }
        files
    }
}

impl Unserialize for MatrixMarketDataset {
    const FORMAT: FormatTag = FormatTag::MatrixMarket;

    fn defaults() -> Value {
        serde_json::to_value(MatrixMarketOptions::default()).unwrap_or_default()
    }

    fn unserialize(files: Vec<DatasetFile>, options: &Value, engines: Engines) -> Result<Self, ScError> {
        let mut matrix = None;
        let mut genes = None;
        let mut annotations = None;
        for entry in files {
            let slot = match entry.kind.as_str() {
                "mtx" => &mut matrix,
                "genes" => &mut genes,
                "annotations" => &mut annotations,
                other => {
                    return Err(ScError::FormatMismatch(format!(
                        "unexpected '{other}' file for {}",
                        Self::FORMAT
                    )));
                }
            };
            if slot.replace(entry.file).is_some() {
                return Err(ScError::FormatMismatch(format!(
                    "duplicate '{}' file for {}",
                    entry.kind,
                    Self::FORMAT
                )));
            }
        }
        let matrix = matrix
            .ok_or_else(|| ScError::FormatMismatch(format!("{} needs an 'mtx' file", Self::FORMAT)))?;
        let mut dataset = Self::new(matrix, genes, annotations, engines);
        apply_options(&mut dataset, options)?;
        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n3 2 2\n1 1 5\n3 2 7\n";

    fn file(name: &str, text: &str) -> FileRef {
        FileRef::from_bytes(text.as_bytes().to_vec(), name).unwrap()
    }

    #[test]
    fn feature_headers_are_detected_from_line_counts() {
        let genes = file("genes.tsv", "gene_id\tsymbol\nG1\tA\nG2\tB\nG3\tC\n");
        let mut dataset = MatrixMarketDataset::new(file("m.mtx", MTX), Some(genes), None, Engines::reference());
        let summary = dataset.summary(false).unwrap();
        let rna = summary.modality_features.get("RNA").unwrap();
        assert_eq!(rna.column_names(), vec!["gene_id", "symbol"]);
        assert_eq!(summary.cells.row_count(), 2);
    }

    #[test]
    fn numeric_barcode_columns_are_promoted() {
        let barcodes = file("barcodes.tsv", "AAAC\t1.5\nTTTG\tNA\n");
        let mut dataset = MatrixMarketDataset::new(file("m.mtx", MTX), None, Some(barcodes), Engines::reference());
        let summary = dataset.summary(false).unwrap();
        assert_eq!(summary.cells.column_names(), vec!["column_1", "column_2"]);
        assert_matches!(summary.cells.column("column_2"), Some(Column::Number(values)) if values[0] == 1.5 && values[1].is_nan());
    }

    #[test]
    fn feature_counts_that_match_neither_layout_are_rejected() {
        let genes = file("genes.tsv", "G1\nG2\n");
        let mut dataset = MatrixMarketDataset::new(file("m.mtx", MTX), Some(genes), None, Engines::reference());
        assert_matches!(dataset.summary(false), Err(ScError::DimensionMismatch(message)) if message.contains("genes.tsv"));
    }
}
