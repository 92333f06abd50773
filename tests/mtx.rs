use std::io::Write;

use assert_matches::assert_matches;
use flate2::Compression;
use flate2::write::GzEncoder;

use kira_sc_reader::dataset::{Dataset, MatrixMarketDataset, Persistable};
use kira_sc_reader::engine::Engines;
use kira_sc_reader::error::ScError;
use kira_sc_reader::file_ref::FileRef;

const MTX: &str = "%%MatrixMarket matrix coordinate integer general\n5 3 4\n1 1 3\n2 2 1\n5 2 9\n4 3 2\n";

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn genes() -> FileRef {
    let lines: String = (1..=5)
        .map(|index| format!("ENSG0000{index}\tSYM{index}\tGene Expression\n"))
        .collect();
    FileRef::from_bytes(gzip(&lines), "genes.tsv.gz").unwrap()
}

fn matrix() -> FileRef {
    FileRef::from_bytes(MTX.as_bytes().to_vec(), "matrix.mtx").unwrap()
}

#[test]
fn headerless_gzipped_features_take_the_tenx_layout() {
    let engines = Engines::reference();
    let mut dataset = MatrixMarketDataset::new(matrix(), Some(genes()), None, engines.clone());
    let loaded = dataset.load(false).unwrap();

    assert_eq!(loaded.matrix.available(), vec!["RNA"]);
    let rna = loaded.matrix.get("RNA").unwrap();
    assert_eq!((rna.number_of_rows(), rna.number_of_columns()), (5, 3));
    assert_eq!(rna.column(1).unwrap(), vec![0.0, 1.0, 0.0, 0.0, 9.0]);

    let features = loaded.features.get("RNA").unwrap();
    assert_eq!(features.column_names(), vec!["id", "name", "type"]);
    assert_eq!(loaded.cells.row_count(), 3);
    assert_eq!(loaded.cells.column_count(), 0);
    assert_eq!(
        loaded.primary_ids.get("RNA").cloned().flatten().map(|ids| ids[0].clone()),
        Some("ENSG00001".to_string())
    );

    drop(loaded);
    assert_eq!(engines.matrix.live_handles(), 0);
}

#[test]
fn barcode_count_mismatch_names_the_file() {
    let barcodes = FileRef::from_bytes(b"A\nB\nC\nD\nE\n".to_vec(), "barcodes.tsv").unwrap();
    let mut dataset = MatrixMarketDataset::new(matrix(), Some(genes()), Some(barcodes), Engines::reference());
    assert_matches!(
        dataset.load(false),
        Err(ScError::DimensionMismatch(message)) if message.contains("barcodes.tsv")
    );
}

#[test]
fn abbreviation_reports_names_and_sizes_only() {
    let dataset = MatrixMarketDataset::new(matrix(), Some(genes()), None, Engines::reference());
    let abbreviated = dataset.abbreviate().unwrap();
    let files: Vec<(&str, &str, u64)> = abbreviated
        .files
        .iter()
        .map(|file| (file.kind.as_str(), file.name.as_str(), file.size))
        .collect();
    assert_eq!(files[0], ("mtx", "matrix.mtx", MTX.len() as u64));
    assert_eq!(files[1].1, "genes.tsv.gz");
    assert_eq!(abbreviated.options, dataset.options().unwrap());
}
