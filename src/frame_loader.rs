//! Decodes data frames stored in project directories: legacy
//! `csv_data_frame` and `hdf5_data_frame` resources, and takane
//! `data_frame` objects.

use serde_json::Value;

use crate::error::ScError;
use crate::frame::{Column, DataFrame, Factor};
use crate::h5::{self, H5Dataset, H5Engine, H5Group, H5Kind, H5Type, H5Values, OpenedH5};
use crate::navigator::{self, Navigator};
use crate::text::{self, Compression, TableOptions, TextSource};

const BOOLEAN_MISSING: i64 = -(1 << 31);

/// Object type of a metadata document: the takane `type` field, or the
/// name part of a legacy `$schema`.
pub fn object_type(document: &Value) -> Option<String> {
    if let Some(kind) = document.get("type").and_then(Value::as_str) {
        return Some(kind.to_string());
    }
    document
        .get("$schema")
        .and_then(Value::as_str)
        .map(|schema| schema.split('/').next().unwrap_or(schema).to_string())
}

pub fn load_data_frame(
    navigator: &mut dyn Navigator,
    h5: &dyn H5Engine,
    path: &str,
) -> Result<DataFrame, ScError> {
    let document = navigator::resolve_metadata(navigator, path)?;
    load_data_frame_from(navigator, h5, path, &document)
}

pub fn load_data_frame_from(
    navigator: &mut dyn Navigator,
    h5: &dyn H5Engine,
    path: &str,
    document: &Value,
) -> Result<DataFrame, ScError> {
    match object_type(document).as_deref() {
        Some("csv_data_frame") => load_csv_frame(navigator, h5, document),
        Some("hdf5_data_frame") => load_legacy_hdf5_frame(navigator, h5, document),
        Some("data_frame") => load_takane_frame(navigator, h5, path),
        Some(other) => Err(ScError::SchemaUnknown(format!("'{other}' is not a data frame"))),
        None => Err(ScError::SchemaUnknown(format!("no type for object at '{path}'"))),
    }
}

/// Column declaration from a legacy `data_frame` block.
struct ColumnSpec<'a> {
    name: String,
    kind: String,
    raw: &'a Value,
}

fn column_specs(document: &Value) -> Result<(usize, Vec<ColumnSpec<'_>>), ScError> {
    let frame = document
        .get("data_frame")
        .ok_or_else(|| ScError::RequiredFieldMissing("data_frame".to_string()))?;
    let rows = frame
        .pointer("/dimensions/0")
        .and_then(Value::as_u64)
        .ok_or_else(|| ScError::RequiredFieldMissing("data_frame.dimensions".to_string()))?
        as usize;
    let specs = frame
        .get("columns")
        .and_then(Value::as_array)
        .map(|columns| {
            columns
                .iter()
                .map(|column| ColumnSpec {
                    name: column
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: column
                        .get("type")
                        .and_then(Value::as_str)
                        .unwrap_or("string")
                        .to_string(),
                    raw: column,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok((rows, specs))
}

fn has_row_names(document: &Value) -> bool {
    document
        .pointer("/data_frame/row_names")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn resource_path(document: &Value) -> Result<String, ScError> {
    document
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ScError::RequiredFieldMissing("path".to_string()))
}

/// Loads a nested frame, logging and discarding failures.
fn nested_frame(navigator: &mut dyn Navigator, h5: &dyn H5Engine, path: &str, column: &str) -> Option<Column> {
    match load_data_frame(navigator, h5, path) {
        Ok(frame) => Some(Column::Frame(Box::new(frame))),
        Err(err) => {
            tracing::warn!(column, path, error = %err, "dropping nested column that failed to load");
            None
        }
    }
}

fn finish_frame(
    rows: usize,
    columns: Vec<(String, Option<Column>)>,
    row_names: Option<Vec<String>>,
) -> Result<DataFrame, ScError> {
    let mut frame = DataFrame::empty(rows);
    frame.set_row_names(row_names)?;
    for (name, column) in columns {
        match column {
            Some(column) => frame.add_column(name, column)?,
            None => tracing::debug!(column = %name, "column dropped"),
        }
    }
    Ok(frame)
}

fn load_csv_frame(navigator: &mut dyn Navigator, h5: &dyn H5Engine, document: &Value) -> Result<DataFrame, ScError> {
    let (rows, specs) = column_specs(document)?;
    let path = resource_path(document)?;
    let compression = match document
        .pointer("/csv_data_frame/compression")
        .and_then(Value::as_str)
    {
        Some("gzip") => Some(Compression::Gzip),
        Some("none") => Some(Compression::None),
        _ => None,
    };

    let content = navigator.file(&path)?;
    let options = TableOptions {
        delimiter: b',',
        compression,
        ..TableOptions::default()
    };
    let mut table = text::read_table(TextSource::Content(&content), options)?;
    navigator.clean(content)?;
    if table.is_empty() {
        return Err(ScError::RequiredFieldMissing(format!("header row of {path}")));
    }
    let body = table.split_off(1);
    if body.len() != rows {
        return Err(ScError::DimensionMismatch(format!(
            "{path} has {} rows but declares {rows}",
            body.len()
        )));
    }

    let offset = usize::from(has_row_names(document));
    let row_names = (offset == 1).then(|| {
        body.iter()
            .map(|row| row.first().cloned().unwrap_or_default())
            .collect()
    });

    let mut columns = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        let column = if spec.kind == "other" {
            spec.raw
                .pointer("/resource/path")
                .and_then(Value::as_str)
                .and_then(|nested| nested_frame(navigator, h5, nested, &spec.name))
        } else {
            let raw: Vec<&str> = body
                .iter()
                .map(|row| row.get(index + offset).map(String::as_str).unwrap_or(""))
                .collect();
            Some(coerce_strings(&raw, &spec.kind, &path, &spec.name)?)
        };
        columns.push((spec.name.clone(), column));
    }
    finish_frame(rows, columns, row_names)
}

fn is_missing_text(value: &str) -> bool {
    matches!(value, "" | "NA")
}

fn coerce_strings(raw: &[&str], kind: &str, path: &str, name: &str) -> Result<Column, ScError> {
    let bad_value = |value: &str| ScError::Text {
        name: path.to_string(),
        message: format!("column '{name}' has non-{kind} value '{value}'"),
    };
    match kind {
        "integer" => {
            let values = raw
                .iter()
                .map(|&value| {
                    if is_missing_text(value) {
                        return Ok(None);
                    }
                    let parsed = value.parse::<f64>().map_err(|_| bad_value(value))?;
                    checked_integer(parsed).map(Some).ok_or_else(|| bad_value(value))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Column::from_optional_integers(values))
        }
        "number" | "double" => match text::promote_to_number(raw) {
            Some(values) => Ok(Column::Number(values)),
            None => {
                let offending = raw
                    .iter()
                    .copied()
                    .find(|value| text::promote_to_number(&[*value]).is_none())
                    .unwrap_or("");
                Err(bad_value(offending))
            }
        },
        "boolean" => {
            let values = raw
                .iter()
                .map(|&value| match value {
                    "TRUE" | "true" | "True" | "1" => Ok(Some(true)),
                    "FALSE" | "false" | "False" | "0" => Ok(Some(false)),
                    other if is_missing_text(other) => Ok(None),
                    other => Err(bad_value(other)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Column::Boolean(values))
        }
        _ => Ok(Column::String(
            raw.iter()
                .map(|&value| (value != "NA").then(|| value.to_string()))
                .collect(),
        )),
    }
}

fn load_legacy_hdf5_frame(
    navigator: &mut dyn Navigator,
    h5: &dyn H5Engine,
    document: &Value,
) -> Result<DataFrame, ScError> {
    let (rows, specs) = column_specs(document)?;
    let path = resource_path(document)?;
    let group_name = document
        .pointer("/hdf5_data_frame/group")
        .and_then(Value::as_str)
        .ok_or_else(|| ScError::RequiredFieldMissing("hdf5_data_frame.group".to_string()))?
        .to_string();

    let content = navigator.file(&path)?;
    let decoded = {
        let opened = OpenedH5::open(h5, &content)?;
        let group = opened.root.group(&group_name)?;
        let row_names = if has_row_names(document) {
            h5::extract_strings(group.as_ref(), "row_names")?
        } else {
            None
        };

        let mut columns = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let child = format!("data/{index}");
            let column = if spec.kind == "other" {
                None
            } else if group.child_kind(&child) == Some(H5Kind::Dataset) {
                let dataset = group.dataset(&child)?;
                let levels = spec.raw.get("levels").and_then(Value::as_array).map(|levels| {
                    levels
                        .iter()
                        .map(|level| level.as_str().unwrap_or_default().to_string())
                        .collect::<Vec<_>>()
                });
                decode_dataset(dataset.as_ref(), &spec.kind, levels)?
            } else {
                None
            };
            columns.push((spec.name.clone(), column));
        }
        (row_names, columns)
    };
    navigator.clean(content)?;

    let (row_names, mut columns) = decoded;
    for ((name, column), spec) in columns.iter_mut().zip(&specs) {
        if spec.kind == "other" {
            *column = spec
                .raw
                .pointer("/resource/path")
                .and_then(Value::as_str)
                .and_then(|nested| nested_frame(navigator, h5, nested, name));
        }
    }
    finish_frame(rows, columns, row_names)
}

fn load_takane_frame(navigator: &mut dyn Navigator, h5: &dyn H5Engine, path: &str) -> Result<DataFrame, ScError> {
    let content = navigator.file(&navigator::join(path, "basic_columns.h5"))?;
    let (rows, names, row_names, mut columns) = {
        let opened = OpenedH5::open(h5, &content)?;
        let group = opened.root.group("data_frame")?;
        let rows = h5::integer_attribute(group.as_ref(), "row-count")?
            .ok_or_else(|| ScError::RequiredFieldMissing(format!("row-count of {path}")))?
            as usize;
        let names = h5::extract_strings(group.as_ref(), "column_names")?
            .ok_or_else(|| ScError::RequiredFieldMissing(format!("column_names of {path}")))?;
        let row_names = h5::extract_strings(group.as_ref(), "row_names")?;

        let mut columns = Vec::with_capacity(names.len());
        for index in 0..names.len() {
            let child = format!("data/{index}");
            let column = match group.child_kind(&child) {
                Some(H5Kind::Dataset) => {
                    let dataset = group.dataset(&child)?;
                    let kind = h5::string_attribute(dataset.as_ref(), "type")?
                        .unwrap_or_else(|| default_kind(dataset.dtype()).to_string());
                    decode_dataset(dataset.as_ref(), &kind, None)?
                }
                Some(H5Kind::Group) => Some(decode_factor_group(group.group(&child)?.as_ref())?),
                None => None,
            };
            columns.push(column);
        }
        (rows, names, row_names, columns)
    };
    navigator.clean(content)?;

    for (index, column) in columns.iter_mut().enumerate() {
        if column.is_none() {
            let nested = navigator::join(path, &format!("other_columns/{index}"));
            *column = nested_frame(navigator, h5, &nested, &names[index]);
        }
    }
    finish_frame(rows, names.into_iter().zip(columns).collect(), row_names)
}

fn default_kind(dtype: H5Type) -> &'static str {
    match dtype {
        H5Type::Integer => "integer",
        H5Type::Float => "number",
        _ => "string",
    }
}

fn decode_factor_group(group: &dyn H5Group) -> Result<Column, ScError> {
    let codes_dataset = group.dataset("codes")?;
    let placeholder = h5::missing_placeholder(codes_dataset.as_ref())?.and_then(|attr| attr.values.first_i64());
    let codes = codes_dataset
        .values()?
        .to_i64()
        .ok_or_else(|| ScError::SchemaUnknown("factor codes are not integers".to_string()))?;
    let levels = h5::extract_strings(group, "levels")?
        .ok_or_else(|| ScError::RequiredFieldMissing("factor levels".to_string()))?;
    Ok(Column::String(
        Factor {
            codes,
            levels,
            placeholder,
        }
        .expand(),
    ))
}

/// Truncates toward zero; `None` for non-finite or out-of-range values.
fn checked_integer(value: f64) -> Option<i32> {
    let truncated = value.trunc();
    (truncated >= f64::from(i32::MIN) && truncated <= f64::from(i32::MAX)).then_some(truncated as i32)
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

/// Coerces one dataset to the declared column type. Returns `None` when
/// the stored type cannot represent the declaration.
pub(crate) fn decode_dataset(
    dataset: &dyn H5Dataset,
    kind: &str,
    levels: Option<Vec<String>>,
) -> Result<Option<Column>, ScError> {
    let placeholder = h5::missing_placeholder(dataset)?;
    let values = dataset.values()?;

    if let Some(levels) = levels.filter(|_| matches!(kind, "factor" | "ordered")) {
        let Some(codes) = values.to_i64() else {
            return Ok(Some(string_column(values, placeholder.and_then(|p| p.values.first_string().map(str::to_string)))));
        };
        return Ok(Some(Column::String(
            Factor {
                codes,
                levels,
                placeholder: placeholder.and_then(|p| p.values.first_i64()),
            }
            .expand(),
        )));
    }

    let numeric_placeholder = placeholder.as_ref().and_then(|p| p.values.first_f64());
    let column = match kind {
        "integer" => values
            .to_f64()
            .map(|numbers| {
                numbers
                    .into_iter()
                    .map(|v| {
                        if numeric_placeholder.is_some_and(|p| same_value(p, v)) || v.is_nan() {
                            return Ok(None);
                        }
                        checked_integer(v).map(Some).ok_or_else(|| {
                            ScError::InvalidFile(format!("integer column holds {v}, outside the 32-bit range"))
                        })
                    })
                    .collect::<Result<Vec<_>, ScError>>()
                    .map(Column::from_optional_integers)
            })
            .transpose()?,
        "number" | "double" => values.to_f64().map(|numbers| {
            Column::Number(
                numbers
                    .into_iter()
                    .map(|v| {
                        if numeric_placeholder.is_some_and(|p| same_value(p, v)) {
                            f64::NAN
                        } else {
                            v
                        }
                    })
                    .collect(),
            )
        }),
        "boolean" => values.to_i64().map(|numbers| {
            let placeholder = numeric_placeholder.map(|p| p as i64);
            Column::Boolean(
                numbers
                    .into_iter()
                    .map(|v| (v != BOOLEAN_MISSING && Some(v) != placeholder).then_some(v != 0))
                    .collect(),
            )
        }),
        _ => Some(string_column(
            values,
            placeholder.and_then(|p| p.values.first_string().map(str::to_string)),
        )),
    };
    Ok(column)
}

fn string_column(values: H5Values, placeholder: Option<String>) -> Column {
    let strings: Vec<String> = match values {
        H5Values::String(values) => values,
        H5Values::Integer(values) => values.iter().map(i64::to_string).collect(),
        H5Values::Float(values) => values.iter().map(f64::to_string).collect(),
    };
    Column::String(
        strings
            .into_iter()
            .map(|value| (Some(&value) != placeholder.as_ref()).then_some(value))
            .collect(),
    )
}
