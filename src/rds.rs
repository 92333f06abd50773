//! In-memory model of the R objects read from `.rds` files, and helpers for
//! the Bioconductor classes the SummarizedExperiment reader walks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, ScError};
use crate::frame::{Column, DataFrame};

pub type RAttributes = BTreeMap<String, RObject>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RObject {
    Null,
    Integer {
        values: Vec<Option<i32>>,
        #[serde(default)]
        attributes: RAttributes,
    },
    Double {
        values: Vec<Option<f64>>,
        #[serde(default)]
        attributes: RAttributes,
    },
    Logical {
        values: Vec<Option<bool>>,
        #[serde(default)]
        attributes: RAttributes,
    },
    String {
        values: Vec<Option<String>>,
        #[serde(default)]
        attributes: RAttributes,
    },
    List {
        values: Vec<RObject>,
        #[serde(default)]
        attributes: RAttributes,
    },
    S4 {
        class: String,
        #[serde(default)]
        package: Option<String>,
        #[serde(default)]
        slots: RAttributes,
    },
}

/// Parses R-serialized bytes into an [`RObject`].
pub trait RdsEngine: Send + Sync {
    fn read(&self, bytes: &[u8]) -> Result<RObject, EngineError>;
}

impl RObject {
    pub fn attributes(&self) -> Option<&RAttributes> {
        match self {
            RObject::Null => None,
            RObject::Integer { attributes, .. }
            | RObject::Double { attributes, .. }
            | RObject::Logical { attributes, .. }
            | RObject::String { attributes, .. }
            | RObject::List { attributes, .. } => Some(attributes),
            RObject::S4 { slots, .. } => Some(slots),
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&RObject> {
        self.attributes().and_then(|attrs| attrs.get(name))
    }

    pub fn slot(&self, name: &str) -> Option<&RObject> {
        match self {
            RObject::S4 { slots, .. } => slots.get(name),
            _ => None,
        }
    }

    /// S4 class name, or the first entry of the `class` attribute.
    pub fn class_name(&self) -> Option<&str> {
        match self {
            RObject::S4 { class, .. } => Some(class),
            _ => self
                .attribute("class")
                .and_then(RObject::as_strings)
                .and_then(|values| values.first())
                .and_then(|value| value.as_deref()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RObject::Null)
    }

    pub fn len(&self) -> usize {
        match self {
            RObject::Null | RObject::S4 { .. } => 0,
            RObject::Integer { values, .. } => values.len(),
            RObject::Double { values, .. } => values.len(),
            RObject::Logical { values, .. } => values.len(),
            RObject::String { values, .. } => values.len(),
            RObject::List { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_strings(&self) -> Option<&[Option<String>]> {
        match self {
            RObject::String { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn as_integers(&self) -> Option<&[Option<i32>]> {
        match self {
            RObject::Integer { values, .. } => Some(values),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RObject]> {
        match self {
            RObject::List { values, .. } => Some(values),
            _ => None,
        }
    }

    /// Numeric values of an integer, double or logical vector.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            RObject::Integer { values, .. } => Some(
                values
                    .iter()
                    .map(|v| v.map(f64::from).unwrap_or(f64::NAN))
                    .collect(),
            ),
            RObject::Double { values, .. } => {
                Some(values.iter().map(|v| v.unwrap_or(f64::NAN)).collect())
            }
            RObject::Logical { values, .. } => Some(
                values
                    .iter()
                    .map(|v| v.map(|b| if b { 1.0 } else { 0.0 }).unwrap_or(f64::NAN))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Contents of the `names` attribute, with missing names as empty strings.
    pub fn names(&self) -> Option<Vec<String>> {
        self.attribute("names")
            .and_then(RObject::as_strings)
            .map(|names| {
                names
                    .iter()
                    .map(|name| name.clone().unwrap_or_default())
                    .collect()
            })
    }

    /// Looks up an element of a named list.
    pub fn list_element(&self, name: &str) -> Option<&RObject> {
        let values = self.as_list()?;
        let index = self.names()?.iter().position(|candidate| candidate == name)?;
        values.get(index)
    }

    /// `dim` attribute as `(rows, columns)`.
    pub fn dim(&self) -> Option<(usize, usize)> {
        let dims = self.attribute("dim")?.as_integers()?;
        match dims {
            [Some(rows), Some(cols)] if *rows >= 0 && *cols >= 0 => {
                Some((*rows as usize, *cols as usize))
            }
            _ => None,
        }
    }

    pub fn strings_or_none(&self) -> Option<Vec<String>> {
        self.as_strings().map(|values| {
            values
                .iter()
                .map(|value| value.clone().unwrap_or_default())
                .collect()
        })
    }
}

/// Converts one atomic R vector into a frame column. Factors are expanded to
/// strings; R's `NA` becomes the column's missing sentinel. Returns `None`
/// for vectors with no column rendition.
pub fn vector_to_column(object: &RObject) -> Option<Column> {
    if object.class_name() == Some("factor") {
        let levels = object.attribute("levels").and_then(RObject::as_strings)?;
        let codes = object.as_integers()?;
        return Some(Column::String(
            codes
                .iter()
                .map(|code| {
                    code.and_then(|c| usize::try_from(c - 1).ok())
                        .and_then(|i| levels.get(i).cloned().flatten())
                })
                .collect(),
        ));
    }
    match object {
        RObject::Integer { values, .. } => Some(Column::from_optional_integers(values.clone())),
        RObject::Double { values, .. } => Some(Column::Number(
            values.iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
        )),
        RObject::Logical { values, .. } => Some(Column::Boolean(values.clone())),
        RObject::String { values, .. } => Some(Column::String(values.clone())),
        _ => None,
    }
}

/// Decodes an S4 `DFrame`/`DataFrame` into a [`DataFrame`]. Columns without
/// an atomic rendition (nested objects, lists) are dropped with a warning.
pub fn s4_data_frame(object: &RObject) -> Result<DataFrame, ScError> {
    let class = object.class_name().unwrap_or("unknown");
    if !matches!(object, RObject::S4 { .. }) {
        return Err(ScError::SchemaUnknown(format!(
            "expected an S4 DataFrame, found '{class}'"
        )));
    }

    let list = object
        .slot("listData")
        .ok_or_else(|| ScError::RequiredFieldMissing(format!("listData slot of '{class}'")))?;
    let names = list.names().unwrap_or_default();
    let values = list.as_list().unwrap_or_default();

    let row_names = object
        .slot("rownames")
        .and_then(RObject::strings_or_none);
    let row_count = match object.slot("nrows").and_then(RObject::as_integers) {
        Some([Some(n)]) if *n >= 0 => *n as usize,
        _ => row_names
            .as_ref()
            .map(Vec::len)
            .or_else(|| values.first().map(RObject::len))
            .unwrap_or(0),
    };

    let mut frame = DataFrame::empty(row_count);
    frame.set_row_names(row_names)?;
    for (name, value) in names.iter().zip(values) {
        let column = if matches!(value, RObject::S4 { .. }) {
            s4_data_frame(value)
                .ok()
                .map(|nested| Column::Frame(Box::new(nested)))
        } else {
            vector_to_column(value)
        };
        match column {
            Some(column) if column.len() == row_count => frame.add_column(name.clone(), column)?,
            _ => tracing::warn!(column = %name, "skipping column without a tabular rendition"),
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn strings(values: &[&str]) -> RObject {
        RObject::String {
            values: values.iter().map(|v| Some(v.to_string())).collect(),
            attributes: RAttributes::new(),
        }
    }

    #[test]
    fn decodes_factors_and_named_lists() {
        let mut attributes = RAttributes::new();
        attributes.insert("levels".into(), strings(&["lo", "hi"]));
        attributes.insert("class".into(), strings(&["factor"]));
        let factor = RObject::Integer {
            values: vec![Some(2), None, Some(1)],
            attributes,
        };
        assert_eq!(
            vector_to_column(&factor).unwrap(),
            Column::String(vec![Some("hi".into()), None, Some("lo".into())])
        );

        let mut attributes = RAttributes::new();
        attributes.insert("names".into(), strings(&["a", "b"]));
        let list = RObject::List {
            values: vec![RObject::Null, strings(&["x"])],
            attributes,
        };
        assert_eq!(list.list_element("b"), Some(&strings(&["x"])));
        assert!(list.list_element("c").is_none());
    }

    #[test]
    fn decodes_s4_data_frames() {
        let mut list_attrs = RAttributes::new();
        list_attrs.insert("names".into(), strings(&["symbol", "score"]));
        let mut slots = RAttributes::new();
        slots.insert(
            "listData".into(),
            RObject::List {
                values: vec![
                    strings(&["A", "B"]),
                    RObject::Double {
                        values: vec![Some(1.5), None],
                        attributes: RAttributes::new(),
                    },
                ],
                attributes: list_attrs,
            },
        );
        slots.insert("rownames".into(), strings(&["g1", "g2"]));
        slots.insert(
            "nrows".into(),
            RObject::Integer {
                values: vec![Some(2)],
                attributes: RAttributes::new(),
            },
        );
        let frame = s4_data_frame(&RObject::S4 {
            class: "DFrame".into(),
            package: Some("S4Vectors".into()),
            slots,
        })
        .unwrap();
        assert_eq!(frame.row_count(), 2);
        assert_eq!(frame.column_names(), vec!["symbol", "score"]);
        assert_eq!(frame.row_names().unwrap()[1], "g2");
    }
}
