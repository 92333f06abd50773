//! Splits a loaded matrix and its feature annotations by modality, and
//! picks primary identifiers per modality.

use crate::config::ColumnSelector;
use crate::domain::{ModalityMap, NamedMap};
use crate::error::ScError;
use crate::frame::DataFrame;
use crate::matrix::{MatrixHandle, MultiMatrix};

/// What to use when a modality's primary-id column is not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryIdFallback {
    RowNames,
    None,
}

#[derive(Debug)]
pub struct SplitMatrix {
    pub matrix: MultiMatrix,
    pub features: ModalityMap<DataFrame>,
    /// Original row index of every feature in each modality.
    pub row_ids: ModalityMap<Vec<usize>>,
}

/// Groups rows by the value of `type_column`, in order of first
/// appearance. Without a usable type column every row lands in
/// `default_label`.
fn group_rows(features: &DataFrame, type_column: Option<&str>, default_label: &str) -> Vec<(String, Vec<usize>)> {
    let types = type_column
        .and_then(|name| features.column(name))
        .and_then(|column| column.to_strings());
    let Some(types) = types else {
        return vec![(default_label.to_string(), (0..features.row_count()).collect())];
    };

    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (row, value) in types.into_iter().enumerate() {
        let label = value.unwrap_or_default();
        match groups.iter_mut().find(|(existing, _)| *existing == label) {
            Some((_, rows)) => rows.push(row),
            None => groups.push((label, vec![row])),
        }
    }
    groups
}

/// Maps row groups onto modalities. Modalities are visited in the order of
/// `labels`; groups with no modality, and modalities whose label is
/// `None`, are dropped.
fn assign_modalities(
    groups: Vec<(String, Vec<usize>)>,
    labels: &NamedMap<Option<String>>,
) -> Vec<(String, Vec<usize>)> {
    labels
        .iter()
        .filter_map(|(modality, label)| {
            let label = label.as_deref()?;
            groups
                .iter()
                .find(|(group, _)| group == label)
                .map(|(_, rows)| (modality.to_string(), rows.clone()))
        })
        .collect()
}

/// Partitions `loaded` into per-modality matrices. The feature table is
/// first aligned with the rows the matrix retained.
pub fn split_by_modality(
    loaded: MatrixHandle,
    features: &DataFrame,
    type_column: Option<&str>,
    labels: &NamedMap<Option<String>>,
    default_label: &str,
) -> Result<SplitMatrix, ScError> {
    if features.row_count() < loaded.number_of_rows() {
        return Err(ScError::DimensionMismatch(format!(
            "{} features for a matrix of {} rows",
            features.row_count(),
            loaded.number_of_rows()
        )));
    }
    let identities = loaded.identities()?;
    let aligned = features.slice_rows(&identities)?;
    let groups = group_rows(&aligned, type_column, default_label);
    let group_count = groups.len();
    let assigned = assign_modalities(groups, labels);

    let mut output = SplitMatrix {
        matrix: MultiMatrix::new(),
        features: NamedMap::new(),
        row_ids: NamedMap::new(),
    };

    if group_count == 1 {
        if let Some((modality, rows)) = assigned.into_iter().next() {
            output.features.insert(modality.clone(), aligned);
            output
                .row_ids
                .insert(modality.clone(), rows.iter().map(|&row| identities[row]).collect());
            output.matrix.add(modality, loaded)?;
        }
        return Ok(output);
    }

    for (modality, rows) in assigned {
        let sub = loaded.subset_rows(&rows)?;
        output.features.insert(modality.clone(), aligned.slice_rows(&rows)?);
        output
            .row_ids
            .insert(modality.clone(), rows.iter().map(|&row| identities[row]).collect());
        output.matrix.add(modality, sub)?;
    }
    loaded.free()?;
    Ok(output)
}

/// Feature tables per modality, without touching any matrix.
pub fn split_features(
    features: &DataFrame,
    type_column: Option<&str>,
    labels: &NamedMap<Option<String>>,
    default_label: &str,
) -> Result<ModalityMap<DataFrame>, ScError> {
    let groups = group_rows(features, type_column, default_label);
    let single = groups.len() == 1;
    assign_modalities(groups, labels)
        .into_iter()
        .map(|(modality, rows)| {
            let frame = if single {
                features.clone()
            } else {
                features.slice_rows(&rows)?
            };
            Ok((modality, frame))
        })
        .collect()
}

/// The identifier column chosen by `selector`, as strings. Missing values
/// become empty strings.
pub fn select_id_column(frame: &DataFrame, selector: &ColumnSelector) -> Option<Vec<String>> {
    let column = match selector {
        ColumnSelector::Name(name) => frame.column(name),
        ColumnSelector::Index(index) => frame.column_at(*index).map(|(_, column)| column),
    }?;
    column
        .to_strings()
        .map(|values| values.into_iter().map(Option::unwrap_or_default).collect())
}

/// Primary identifiers for each modality of `features`.
pub fn extract_primary_ids(
    features: &ModalityMap<DataFrame>,
    selectors: &NamedMap<Option<ColumnSelector>>,
    fallback: PrimaryIdFallback,
) -> ModalityMap<Option<Vec<String>>> {
    features
        .iter()
        .map(|(modality, frame)| {
            let selected = selectors
                .get(modality)
                .and_then(Option::as_ref)
                .and_then(|selector| select_id_column(frame, selector));
            let ids = selected.or_else(|| match fallback {
                PrimaryIdFallback::RowNames => frame.row_names().map(<[String]>::to_vec),
                PrimaryIdFallback::None => None,
            });
            (modality.to_string(), ids)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Selector;
    use crate::domain::{ADT, CRISPR, RNA};
    use crate::engine::{MemoryH5Engine, MemoryMatrixEngine};
    use crate::frame::Column;
    use crate::matrix::MatrixEngine;

    fn labels() -> NamedMap<Option<String>> {
        [
            (RNA, Some("Gene Expression".to_string())),
            (ADT, Some("Antibody Capture".to_string())),
            (CRISPR, None),
        ]
        .into_iter()
        .collect()
    }

    fn features() -> DataFrame {
        DataFrame::new(
            3,
            vec![
                ("id".to_string(), Column::strings(["g1", "g2", "a1"])),
                (
                    "type".to_string(),
                    Column::strings(["Gene Expression", "Antibody Capture", "Gene Expression"]),
                ),
            ],
            None,
        )
        .unwrap()
    }

    #[test]
    fn splits_rows_by_feature_type() {
        let memory = Arc::new(MemoryMatrixEngine::new(Arc::new(MemoryH5Engine)));
        let raw = memory
            .insert_dense(3, 2, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let engine: Arc<dyn MatrixEngine> = memory.clone();
        let handle = MatrixHandle::adopt(engine, raw).unwrap();

        let split = split_by_modality(handle, &features(), Some("type"), &labels(), "Gene Expression").unwrap();
        assert_eq!(split.matrix.available(), vec![RNA, ADT]);
        assert_eq!(split.matrix.get(RNA).unwrap().number_of_rows(), 2);
        assert_eq!(split.matrix.get(RNA).unwrap().column(1).unwrap(), vec![4.0, 6.0]);
        assert_eq!(split.row_ids.get(ADT), Some(&vec![1]));
        assert_eq!(split.features.get(RNA).unwrap().row_count(), 2);
        assert_eq!(memory.live_handles(), 2);

        split.matrix.free().unwrap();
        assert_eq!(memory.live_handles(), 0);
    }

    #[test]
    fn single_group_is_renamed_without_copying() {
        let memory = Arc::new(MemoryMatrixEngine::new(Arc::new(MemoryH5Engine)));
        let raw = memory.insert_dense(3, 1, vec![1.0, 2.0, 3.0]).unwrap();
        let handle = MatrixHandle::adopt(memory.clone(), raw).unwrap();
        let split = split_by_modality(handle, &features(), None, &labels(), "Gene Expression").unwrap();
        assert_eq!(split.matrix.available(), vec![RNA]);
        assert_eq!(split.matrix.get(RNA).unwrap().id(), raw);
        assert_eq!(memory.live_handles(), 1);
    }

    #[test]
    fn primary_ids_fall_back_to_row_names_when_allowed() {
        let mut frame = features();
        frame
            .set_row_names(Some(vec!["r1".into(), "r2".into(), "r3".into()]))
            .unwrap();
        let features: ModalityMap<DataFrame> = [(RNA, frame)].into_iter().collect();

        let selectors: NamedMap<Option<ColumnSelector>> =
            [(RNA, Some(Selector::name("missing")))].into_iter().collect();
        let ids = extract_primary_ids(&features, &selectors, PrimaryIdFallback::RowNames);
        assert_eq!(ids.get(RNA).unwrap().as_ref().unwrap()[0], "r1");
        let ids = extract_primary_ids(&features, &selectors, PrimaryIdFallback::None);
        assert_eq!(ids.get(RNA), Some(&None));

        let selectors: NamedMap<Option<ColumnSelector>> = [(RNA, Some(Selector::Index(0)))].into_iter().collect();
        let ids = extract_primary_ids(&features, &selectors, PrimaryIdFallback::None);
        assert_eq!(ids.get(RNA).unwrap().as_ref().unwrap(), &vec!["g1", "g2", "a1"]);
    }
}
