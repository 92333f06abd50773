use serde_json::json;

use kira_sc_reader::dataset::{Dataset, DatasetFile, Persistable, RdsDataset, ReaderMode};
use kira_sc_reader::domain::FormatTag;
use kira_sc_reader::engine::{Engines, MemoryRdsEngine};
use kira_sc_reader::file_ref::FileRef;
use kira_sc_reader::lifecycle::DatasetState;
use kira_sc_reader::rds::{RAttributes, RObject};
use kira_sc_reader::registry;
use kira_sc_reader::serialize::{self, FileSource, FileStore, MemoryLinkRegistry};

fn strings(values: &[&str]) -> RObject {
    RObject::String {
        values: values.iter().map(|value| Some(value.to_string())).collect(),
        attributes: RAttributes::new(),
    }
}

fn s4(class: &str, slots: Vec<(&str, RObject)>) -> RObject {
    RObject::S4 {
        class: class.into(),
        package: None,
        slots: slots.into_iter().map(|(name, value)| (name.to_string(), value)).collect(),
    }
}

fn named_list(entries: Vec<(&str, RObject)>) -> RObject {
    let names: Vec<&str> = entries.iter().map(|(name, _)| *name).collect();
    let mut attributes = RAttributes::new();
    attributes.insert("names".into(), strings(&names));
    RObject::List {
        values: entries.into_iter().map(|(_, value)| value).collect(),
        attributes,
    }
}

fn dframe(rows: i32, columns: Vec<(&str, RObject)>) -> RObject {
    let count = RObject::Integer {
        values: vec![Some(rows)],
        attributes: RAttributes::new(),
    };
    s4("DFrame", vec![("listData", named_list(columns)), ("nrows", count)])
}

/// Three genes by two cells, RNA only.
fn rna_only() -> FileRef {
    let mut attributes = RAttributes::new();
    attributes.insert(
        "dim".into(),
        RObject::Integer {
            values: vec![Some(3), Some(2)],
            attributes: RAttributes::new(),
        },
    );
    let counts = RObject::Double {
        values: [1.0, 0.0, 2.0, 0.0, 5.0, 6.0].into_iter().map(Some).collect(),
        attributes,
    };
    let object = s4(
        "SummarizedExperiment",
        vec![
            ("NAMES", strings(&["ENSG1", "ENSG2", "ENSG3"])),
            ("elementMetadata", dframe(3, vec![("symbol", strings(&["A", "B", "C"]))])),
            ("colData", dframe(2, vec![("donor", strings(&["d1", "d2"]))])),
            (
                "assays",
                s4(
                    "SimpleAssays",
                    vec![("data", s4("SimpleList", vec![("listData", named_list(vec![("counts", counts)]))]))],
                ),
            ),
        ],
    );
    FileRef::from_bytes(MemoryRdsEngine::encode(&object).unwrap(), "se.rds").unwrap()
}

#[test]
fn sole_rna_experiment_yields_one_matrix() {
    let engines = Engines::reference();
    let mut dataset = RdsDataset::new(rna_only(), engines.clone());

    let summary = dataset.summary(true).unwrap();
    assert_eq!(summary.modality_features.keys().collect::<Vec<_>>(), vec![""]);
    let loaded = dataset.load(true).unwrap();
    assert_eq!(loaded.matrix.available(), vec!["RNA"]);
    assert_eq!(loaded.features.get("RNA"), summary.modality_features.get(""));
    assert_eq!(loaded.cells, summary.cells);

    let rna = loaded.matrix.get("RNA").unwrap();
    assert_eq!(rna.column(1).unwrap(), vec![0.0, 5.0, 6.0]);
    assert_eq!(
        loaded.primary_ids.get("RNA"),
        Some(&Some(vec!["ENSG1".to_string(), "ENSG2".to_string(), "ENSG3".to_string()]))
    );
    assert_eq!(dataset.state(), DatasetState::Populated);

    drop(loaded);
    dataset.clear();
    assert_eq!(engines.matrix.live_handles(), 0);
}

#[test]
fn linked_round_trip_restores_options() {
    let mut dataset = RdsDataset::new(rna_only(), Engines::reference());
    dataset
        .set_options(&json!({"primaryRnaFeatureIdColumn": "symbol"}))
        .unwrap();

    let mut links = MemoryLinkRegistry::new();
    let record = serialize::serialize_dataset(&dataset, &mut FileStore::Linked(&mut links)).unwrap();
    assert_eq!(record.format, FormatTag::SummarizedExperiment);
    assert_eq!(links.len(), 1);

    let text = serde_json::to_string(&record).unwrap();
    let record = serde_json::from_str(&text).unwrap();
    let mut restored =
        serialize::unserialize_dataset(&record, &mut FileSource::linked(&mut links), Engines::reference()).unwrap();
    let ids = restored.preview_primary_ids(false).unwrap();
    assert_eq!(
        ids.get("RNA"),
        Some(&Some(vec!["A".to_string(), "B".to_string(), "C".to_string()]))
    );
}

#[test]
fn registry_builds_result_readers_for_experiment_files() {
    let files = vec![DatasetFile::new("rds", rna_only())];
    let mut result = registry::unserialize(
        FormatTag::SummarizedExperiment,
        ReaderMode::Result,
        files,
        &json!({"isPrimaryNormalized": false}),
        Engines::reference(),
    )
    .unwrap();
    assert_eq!(result.mode(), ReaderMode::Result);

    let loaded = result.load(false).unwrap();
    assert_eq!(loaded.matrix.available(), vec![""]);
    let normalized = loaded.matrix.get("").unwrap();
    assert_eq!(normalized.number_of_rows(), 3);
    assert_eq!(result.state(), DatasetState::Cleared);
}
