use kira_sc_reader::dataset::{Dataset, H5adDataset};
use kira_sc_reader::engine::{Engines, H5Node};
use kira_sc_reader::file_ref::FileRef;
use kira_sc_reader::h5::H5Values;

const CELLS: usize = 20;
const GENES: usize = 100;

/// Cells by genes in CSR form, one count per cell, with no `X`.
fn layers_only() -> FileRef {
    let counts = H5Node::group()
        .with_child("data", H5Node::integers((1..=CELLS as i64).collect()))
        .with_child("indices", H5Node::integers((0..CELLS as i64).map(|cell| cell * 5).collect()))
        .with_child("indptr", H5Node::integers((0..=CELLS as i64).collect()))
        .with_string_attribute("encoding-type", "csr_matrix")
        .with_attribute("shape", H5Values::Integer(vec![CELLS as i64, GENES as i64]));
    let genes: Vec<String> = (0..GENES).map(|gene| format!("gene{gene}")).collect();
    let cells: Vec<String> = (0..CELLS).map(|cell| format!("cell{cell}")).collect();
    let root = H5Node::group()
        .with_child("layers/counts", counts)
        .with_child("var/_index", H5Node::strings(&genes))
        .with_child("obs/_index", H5Node::strings(&cells));
    FileRef::from_bytes(root.to_bytes().unwrap(), "layers.h5ad").unwrap()
}

#[test]
fn layers_stand_in_for_a_missing_x() {
    let engines = Engines::reference();
    let mut dataset = H5adDataset::new(layers_only(), engines.clone());

    let summary = dataset.summary(true).unwrap();
    assert_eq!(summary.all_assay_names, Some(vec!["layers/counts".to_string()]));

    let loaded = dataset.load(false).unwrap();
    assert_eq!(loaded.matrix.available(), vec!["RNA"]);
    let rna = loaded.matrix.get("RNA").unwrap();
    assert_eq!((rna.number_of_rows(), rna.number_of_columns()), (GENES, CELLS));
    assert_eq!(rna.column(1).unwrap()[5], 2.0);
    assert_eq!(loaded.cells.row_count(), CELLS);
    assert!(loaded.cells.has_column("_index"));
    assert_eq!(loaded.features.get("RNA").unwrap().row_count(), GENES);

    drop(loaded);
    assert_eq!(engines.matrix.live_handles(), 0);
}
