use serde::Serialize;

use crate::error::ScError;

/// One column of a [`DataFrame`]. Missing values use a single sentinel per
/// domain: NaN for numbers, `None` for booleans and strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    Integer(Vec<i32>),
    Number(Vec<f64>),
    Boolean(Vec<Option<bool>>),
    String(Vec<Option<String>>),
    Frame(Box<DataFrame>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Integer(values) => values.len(),
            Column::Number(values) => values.len(),
            Column::Boolean(values) => values.len(),
            Column::String(values) => values.len(),
            Column::Frame(frame) => frame.row_count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Column::Integer(_) => "integer",
            Column::Number(_) => "number",
            Column::Boolean(_) => "boolean",
            Column::String(_) => "string",
            Column::Frame(_) => "frame",
        }
    }

    pub fn strings(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Column::String(values.into_iter().map(|value| Some(value.into())).collect())
    }

    /// Integer column whose missing entries force promotion to floats.
    pub fn from_optional_integers(values: Vec<Option<i32>>) -> Self {
        if values.iter().all(Option::is_some) {
            Column::Integer(values.into_iter().flatten().collect())
        } else {
            Column::Number(
                values
                    .into_iter()
                    .map(|value| value.map(f64::from).unwrap_or(f64::NAN))
                    .collect(),
            )
        }
    }

    /// String rendition used for identifiers; nested frames have none.
    pub fn to_strings(&self) -> Option<Vec<Option<String>>> {
        match self {
            Column::Integer(values) => Some(values.iter().map(|v| Some(v.to_string())).collect()),
            Column::Number(values) => Some(
                values
                    .iter()
                    .map(|v| (!v.is_nan()).then(|| v.to_string()))
                    .collect(),
            ),
            Column::Boolean(values) => Some(
                values
                    .iter()
                    .map(|v| v.map(|b| if b { "TRUE" } else { "FALSE" }.to_string()))
                    .collect(),
            ),
            Column::String(values) => Some(values.clone()),
            Column::Frame(_) => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[Option<String>]> {
        match self {
            Column::String(values) => Some(values),
            _ => None,
        }
    }

    pub fn slice(&self, indices: &[usize]) -> Result<Column, ScError> {
        let len = self.len();
        if let Some(&bad) = indices.iter().find(|&&index| index >= len) {
            return Err(ScError::DimensionMismatch(format!(
                "row index {bad} out of range for column of length {len}"
            )));
        }
        Ok(match self {
            Column::Integer(values) => Column::Integer(indices.iter().map(|&i| values[i]).collect()),
            Column::Number(values) => Column::Number(indices.iter().map(|&i| values[i]).collect()),
            Column::Boolean(values) => Column::Boolean(indices.iter().map(|&i| values[i]).collect()),
            Column::String(values) => {
                Column::String(indices.iter().map(|&i| values[i].clone()).collect())
            }
            Column::Frame(frame) => Column::Frame(Box::new(frame.slice_rows(indices)?)),
        })
    }
}

/// Factor-encoded strings: integer codes into a level table.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub codes: Vec<i64>,
    pub levels: Vec<String>,
    pub placeholder: Option<i64>,
}

impl Factor {
    /// Codes equal to the placeholder, or outside the level range, become
    /// missing.
    pub fn expand(&self) -> Vec<Option<String>> {
        self.codes
            .iter()
            .map(|&code| {
                if Some(code) == self.placeholder || code < 0 {
                    return None;
                }
                self.levels.get(code as usize).cloned()
            })
            .collect()
    }
}

/// Ordered named columns with optional row names and a declared row count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataFrame {
    row_count: usize,
    columns: Vec<(String, Column)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    row_names: Option<Vec<String>>,
}

impl DataFrame {
    pub fn empty(row_count: usize) -> Self {
        Self {
            row_count,
            columns: Vec::new(),
            row_names: None,
        }
    }

    pub fn new(
        row_count: usize,
        columns: Vec<(String, Column)>,
        row_names: Option<Vec<String>>,
    ) -> Result<Self, ScError> {
        let mut frame = DataFrame::empty(row_count);
        frame.set_row_names(row_names)?;
        for (name, column) in columns {
            frame.add_column(name, column)?;
        }
        Ok(frame)
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(existing, _)| existing == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, column)| column)
    }

    pub fn column_at(&self, index: usize) -> Option<(&str, &Column)> {
        self.columns
            .get(index)
            .map(|(name, column)| (name.as_str(), column))
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn row_names(&self) -> Option<&[String]> {
        self.row_names.as_deref()
    }

    pub fn set_row_names(&mut self, row_names: Option<Vec<String>>) -> Result<(), ScError> {
        if let Some(names) = &row_names {
            if names.len() != self.row_count {
                return Err(ScError::DimensionMismatch(format!(
                    "{} row names for a frame of {} rows",
                    names.len(),
                    self.row_count
                )));
            }
        }
        self.row_names = row_names;
        Ok(())
    }

    /// Adds a column or replaces an existing one of the same name in place.
    pub fn add_column(&mut self, name: impl Into<String>, column: Column) -> Result<(), ScError> {
        let name = name.into();
        if column.len() != self.row_count {
            return Err(ScError::DimensionMismatch(format!(
                "column '{name}' has {} entries, expected {}",
                column.len(),
                self.row_count
            )));
        }
        match self.columns.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = column,
            None => self.columns.push((name, column)),
        }
        Ok(())
    }

    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        let index = self.columns.iter().position(|(existing, _)| existing == name)?;
        Some(self.columns.remove(index).1)
    }

    pub fn slice_rows(&self, indices: &[usize]) -> Result<DataFrame, ScError> {
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| Ok((name.clone(), column.slice(indices)?)))
            .collect::<Result<Vec<_>, ScError>>()?;
        let row_names = self
            .row_names
            .as_ref()
            .map(|names| indices.iter().map(|&i| names[i].clone()).collect());
        Ok(DataFrame {
            row_count: indices.len(),
            columns,
            row_names,
        })
    }
}
