//! SummarizedExperiment objects saved with `saveRDS`.

use serde_json::{Map, Value};

use crate::engine::Engines;
use crate::error::ScError;
use crate::file_ref::FileRef;
use crate::frame::DataFrame;
use crate::matrix::MatrixHandle;
use crate::project::{self, Experiment, ExperimentSource};
use crate::rds::{self, RObject};

const EXPERIMENT_CLASSES: [&str; 4] = [
    "SummarizedExperiment",
    "RangedSummarizedExperiment",
    "SingleCellExperiment",
    "SpatialExperiment",
];

/// An RDS file decoded on first use and kept until cleared.
#[derive(Debug)]
pub struct RdsExperiment {
    file: FileRef,
    engines: Engines,
    object: Option<RObject>,
}

impl RdsExperiment {
    pub fn new(file: FileRef, engines: Engines) -> Self {
        Self {
            file,
            engines,
            object: None,
        }
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    fn root(&mut self) -> Result<&RObject, ScError> {
        let object = match self.object.take() {
            Some(object) => object,
            None => self.read()?,
        };
        Ok(self.object.insert(object))
    }

    fn read(&self) -> Result<RObject, ScError> {
        tracing::debug!(file = self.file.name(), "decoding RDS file");
        let bytes = self.file.content()?.bytes()?;
        let object = self.engines.rds.read(&bytes)?;
        match object.class_name() {
            Some(class) if EXPERIMENT_CLASSES.contains(&class) => Ok(object),
            Some(class) => Err(ScError::SchemaUnknown(format!(
                "{} holds a '{class}', not a SummarizedExperiment",
                self.file.name()
            ))),
            None => Err(ScError::SchemaUnknown(format!("{} holds no S4 object", self.file.name()))),
        }
    }

    fn experiment(&mut self, experiment: Experiment) -> Result<&RObject, ScError> {
        let root = self.root()?;
        match experiment {
            Experiment::Main => Ok(root),
            Experiment::Alternative(index) => {
                let (entries, _) = alternative_entries(root)
                    .ok_or_else(|| ScError::SelectorInvalid(format!("no alternative experiment #{index}")))?;
                let entry = entries
                    .get(index)
                    .ok_or_else(|| ScError::SelectorInvalid(format!("no alternative experiment #{index}")))?;
                // altExps wraps each experiment in a SummarizedExperimentByColumn.
                Ok(entry.slot("se").unwrap_or(entry))
            }
        }
    }
}

fn int_col_data_element<'a>(root: &'a RObject, name: &str) -> Option<&'a RObject> {
    root.slot("int_colData")?.slot("listData")?.list_element(name)
}

/// Entries and names of `int_colData$altExps`.
fn alternative_entries(root: &RObject) -> Option<(&[RObject], Vec<String>)> {
    let list = int_col_data_element(root, "altExps")?.slot("listData")?;
    Some((list.as_list()?, list.names().unwrap_or_default()))
}

/// Named list of assays in `assays@data@listData`.
fn assay_list(experiment: &RObject) -> Result<&RObject, ScError> {
    experiment
        .slot("assays")
        .and_then(|assays| assays.slot("data"))
        .and_then(|data| data.slot("listData"))
        .ok_or_else(|| ScError::RequiredFieldMissing("assays@data@listData".to_string()))
}

/// Row annotations from `rowRanges` for ranged experiments, else from
/// `elementMetadata`, named by the experiment's `NAMES`.
fn row_data(experiment: &RObject) -> Result<DataFrame, ScError> {
    let ranges = experiment
        .slot("rowRanges")
        .filter(|ranges| ranges.slot("elementMetadata").is_some());
    let metadata = ranges
        .and_then(|ranges| ranges.slot("elementMetadata"))
        .or_else(|| experiment.slot("elementMetadata"))
        .ok_or_else(|| ScError::RequiredFieldMissing("elementMetadata".to_string()))?;
    let mut frame = rds::s4_data_frame(metadata)?;

    let names = experiment
        .slot("NAMES")
        .and_then(RObject::strings_or_none)
        .or_else(|| {
            ranges
                .and_then(|ranges| ranges.slot("ranges"))
                .and_then(|ranges| ranges.slot("NAMES"))
                .and_then(RObject::strings_or_none)
        });
    if let Some(names) = names {
        frame.set_row_names(Some(names))?;
    }
    Ok(frame)
}

/// Converts R list metadata into plain JSON. Length-one vectors become
/// scalars and factors are expanded to their levels.
pub fn r_to_json(object: &RObject) -> Value {
    let scalar_or_array = |values: Vec<Value>| match <[Value; 1]>::try_from(values) {
        Ok([value]) => value,
        Err(values) => Value::Array(values),
    };
    if object.class_name() == Some("factor") {
        return match rds::vector_to_column(object).and_then(|column| column.to_strings()) {
            Some(values) => scalar_or_array(values.into_iter().map(|v| v.map_or(Value::Null, Value::String)).collect()),
            None => Value::Null,
        };
    }
    match object {
        RObject::Null => Value::Null,
        RObject::Integer { values, .. } => {
            scalar_or_array(values.iter().map(|v| v.map_or(Value::Null, Value::from)).collect())
        }
        RObject::Double { values, .. } => scalar_or_array(
            values
                .iter()
                .map(|v| v.map_or(Value::Null, project::json_number))
                .collect(),
        ),
        RObject::Logical { values, .. } => {
            scalar_or_array(values.iter().map(|v| v.map_or(Value::Null, Value::Bool)).collect())
        }
        RObject::String { values, .. } => scalar_or_array(
            values
                .iter()
                .map(|v| v.clone().map_or(Value::Null, Value::String))
                .collect(),
        ),
        RObject::List { values, .. } => {
            let converted = values.iter().map(r_to_json);
            match object.names() {
                Some(names) => Value::Object(names.into_iter().zip(converted).collect::<Map<_, _>>()),
                None => Value::Array(converted.collect()),
            }
        }
        RObject::S4 { class, .. } => {
            tracing::warn!(class = %class, "dropping S4 object from list metadata");
            Value::Null
        }
    }
}

impl ExperimentSource for RdsExperiment {
    fn cells(&mut self) -> Result<DataFrame, ScError> {
        let root = self.root()?;
        let col_data = root
            .slot("colData")
            .ok_or_else(|| ScError::RequiredFieldMissing("colData".to_string()))?;
        rds::s4_data_frame(col_data)
    }

    fn alternative_experiments(&mut self) -> Result<Vec<String>, ScError> {
        let root = self.root()?;
        Ok(alternative_entries(root).map(|(_, names)| names).unwrap_or_default())
    }

    fn features(&mut self, experiment: Experiment) -> Result<DataFrame, ScError> {
        row_data(self.experiment(experiment)?)
    }

    fn assay_names(&mut self, experiment: Experiment) -> Result<Vec<String>, ScError> {
        let list = assay_list(self.experiment(experiment)?)?;
        Ok(list.names().unwrap_or_else(|| vec![String::new(); list.len()]))
    }

    fn load_assay(&mut self, experiment: Experiment, assay: usize, force_integer: bool) -> Result<MatrixHandle, ScError> {
        let engine = self.engines.matrix.clone();
        let list = assay_list(self.experiment(experiment)?)?;
        let object = list
            .as_list()
            .and_then(|assays| assays.get(assay))
            .ok_or_else(|| ScError::SelectorInvalid(format!("no assay #{assay}")))?;
        let id = engine.from_rds(object, force_integer)?;
        MatrixHandle::adopt(engine, id)
    }

    fn reduced_dimension_names(&mut self) -> Result<Vec<String>, ScError> {
        let root = self.root()?;
        Ok(int_col_data_element(root, "reducedDims")
            .and_then(|dims| dims.slot("listData"))
            .and_then(RObject::names)
            .unwrap_or_default())
    }

    fn load_reduced_dimension(&mut self, name: &str) -> Result<Vec<Vec<f64>>, ScError> {
        let root = self.root()?;
        let matrix = int_col_data_element(root, "reducedDims")
            .and_then(|dims| dims.slot("listData"))
            .and_then(|list| list.list_element(name))
            .ok_or_else(|| ScError::SelectorInvalid(format!("no reduced dimension named '{name}'")))?;
        let (cells, components) = matrix
            .dim()
            .ok_or_else(|| ScError::SchemaUnknown(format!("reduced dimension '{name}' is not a matrix")))?;
        let values = matrix
            .to_f64()
            .ok_or_else(|| ScError::SchemaUnknown(format!("reduced dimension '{name}' is not numeric")))?;
        if values.len() != cells * components {
            return Err(ScError::DimensionMismatch(format!(
                "reduced dimension '{name}' holds {} values for {cells}x{components}",
                values.len()
            )));
        }
        Ok(values.chunks(cells.max(1)).take(components).map(<[f64]>::to_vec).collect())
    }

    fn other_metadata(&mut self) -> Result<Value, ScError> {
        let root = self.root()?;
        Ok(match root.slot("metadata") {
            Some(metadata) if !metadata.is_empty() => r_to_json(metadata),
            _ => Value::Object(Map::new()),
        })
    }

    fn clear(&mut self) {
        self.object = None;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::engine::MemoryRdsEngine;
    use crate::rds::RAttributes;

    fn strings(values: &[&str]) -> RObject {
        RObject::String {
            values: values.iter().map(|v| Some(v.to_string())).collect(),
            attributes: RAttributes::new(),
        }
    }

    fn integers(values: &[i32]) -> RObject {
        RObject::Integer {
            values: values.iter().copied().map(Some).collect(),
            attributes: RAttributes::new(),
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

    fn s4(class: &str, slots: Vec<(&str, RObject)>) -> RObject {
        RObject::S4 {
            class: class.into(),
            package: None,
            slots: slots.into_iter().map(|(name, value)| (name.to_string(), value)).collect(),
        }
    }

    fn dframe(rows: usize, columns: Vec<(&str, RObject)>, row_names: Option<&[&str]>) -> RObject {
        let mut slots = vec![
            ("listData", named_list(columns)),
            ("nrows", integers(&[rows as i32])),
        ];
        if let Some(names) = row_names {
            slots.push(("rownames", strings(names)));
        }
        s4("DFrame", slots)
    }

    fn base_matrix(rows: usize, columns: usize, values: Vec<f64>) -> RObject {
        let mut attributes = RAttributes::new();
        attributes.insert("dim".into(), integers(&[rows as i32, columns as i32]));
        RObject::Double {
            values: values.into_iter().map(Some).collect(),
            attributes,
        }
    }

    fn experiment(class: &str, genes: &[&str], symbols: &[&str], counts: RObject, extra: Vec<(&str, RObject)>) -> RObject {
        let mut slots = vec![
            ("NAMES", strings(genes)),
            ("elementMetadata", dframe(genes.len(), vec![("symbol", strings(symbols))], None)),
            ("colData", dframe(2, vec![], Some(&["c1", "c2"]))),
            (
                "assays",
                s4(
                    "SimpleAssays",
                    vec![("data", s4("SimpleList", vec![("listData", named_list(vec![("counts", counts)]))]))],
                ),
            ),
        ];
        slots.extend(extra);
        s4(class, slots)
    }

    /// A two-cell SingleCellExperiment with an ADT alternative experiment,
    /// a PCA embedding and list metadata.
    pub(crate) fn single_cell_experiment() -> RObject {
        let adt = experiment(
            "SummarizedExperiment",
            &["CD4"],
            &["CD4"],
            base_matrix(1, 2, vec![7.0, 9.0]),
            vec![],
        );
        let int_col_data = dframe(
            2,
            vec![
                (
                    "altExps",
                    dframe(2, vec![("ADT", s4("SummarizedExperimentByColumn", vec![("se", adt)]))], None),
                ),
                (
                    "reducedDims",
                    dframe(2, vec![("PCA", base_matrix(2, 2, vec![0.1, 0.2, 0.3, 0.4]))], None),
                ),
            ],
            None,
        );
        experiment(
            "SingleCellExperiment",
            &["G1", "G2"],
            &["A", "B"],
            base_matrix(2, 2, vec![1.0, 0.0, 3.0, 4.0]),
            vec![
                ("int_colData", int_col_data),
                ("metadata", named_list(vec![("study", strings(&["pbmc"])), ("n", integers(&[1, 2]))])),
            ],
        )
    }

    pub(crate) fn rds_file(object: &RObject) -> FileRef {
        FileRef::from_bytes(MemoryRdsEngine::encode(object).unwrap(), "sce.rds").unwrap()
    }

    #[test]
    fn walks_main_and_alternative_experiments() {
        let mut source = RdsExperiment::new(rds_file(&single_cell_experiment()), Engines::reference());
        assert_eq!(source.alternative_experiments().unwrap(), vec!["ADT"]);
        let rna = source.features(Experiment::Main).unwrap();
        assert_eq!(rna.row_names().unwrap(), ["G1", "G2"]);
        assert!(rna.has_column("symbol"));
        assert_eq!(source.features(Experiment::Alternative(0)).unwrap().row_count(), 1);
        assert_eq!(source.assay_names(Experiment::Alternative(0)).unwrap(), vec!["counts"]);
        let adt = source.load_assay(Experiment::Alternative(0), 0, true).unwrap();
        assert_eq!(adt.column(1).unwrap(), vec![9.0]);
        assert_eq!(source.cells().unwrap().row_count(), 2);
    }

    #[test]
    fn surfaces_reduced_dimensions_and_metadata() {
        let mut source = RdsExperiment::new(rds_file(&single_cell_experiment()), Engines::reference());
        assert_eq!(source.reduced_dimension_names().unwrap(), vec!["PCA"]);
        assert_eq!(
            source.load_reduced_dimension("PCA").unwrap(),
            vec![vec![0.1, 0.2], vec![0.3, 0.4]]
        );
        assert_eq!(source.other_metadata().unwrap(), json!({"study": "pbmc", "n": [1, 2]}));
    }

    #[test]
    fn rejects_objects_outside_the_experiment_family() {
        let mut source = RdsExperiment::new(rds_file(&s4("DFrame", vec![])), Engines::reference());
        assert_matches!(source.cells(), Err(ScError::SchemaUnknown(_)));
    }
}
