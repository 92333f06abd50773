use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ScError;

pub const RNA: &str = "RNA";
pub const ADT: &str = "ADT";
pub const CRISPR: &str = "CRISPR";

/// Canonical modalities, in the order loaders visit them.
pub const MODALITIES: [&str; 3] = [RNA, ADT, CRISPR];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ValueEnum)]
pub enum FormatTag {
    #[value(name = "10X")]
    TenxHdf5,
    #[value(name = "MatrixMarket")]
    MatrixMarket,
    #[value(name = "H5AD")]
    H5ad,
    #[value(name = "SummarizedExperiment")]
    SummarizedExperiment,
    #[value(name = "ArtifactDB-zipped")]
    ZippedArtifactdb,
    #[value(name = "alabaster-zipped")]
    ZippedAlabaster,
}

impl FormatTag {
    pub const ALL: [FormatTag; 6] = [
        FormatTag::TenxHdf5,
        FormatTag::MatrixMarket,
        FormatTag::H5ad,
        FormatTag::SummarizedExperiment,
        FormatTag::ZippedArtifactdb,
        FormatTag::ZippedAlabaster,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatTag::TenxHdf5 => "10X",
            FormatTag::MatrixMarket => "MatrixMarket",
            FormatTag::H5ad => "H5AD",
            FormatTag::SummarizedExperiment => "SummarizedExperiment",
            FormatTag::ZippedArtifactdb => "ArtifactDB-zipped",
            FormatTag::ZippedAlabaster => "alabaster-zipped",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FormatTag {
    type Err = ScError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        FormatTag::ALL
            .into_iter()
            .find(|tag| tag.as_str() == value.trim())
            .ok_or_else(|| ScError::FormatMismatch(format!("unknown format tag '{value}'")))
    }
}

impl Serialize for FormatTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FormatTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Insertion-ordered string-keyed map.
///
/// Used for modality maps (`RNA`/`ADT`/`CRISPR`, or raw experiment names with
/// `""` for the main experiment) and for named collections such as reduced
/// dimensions. Inserting an existing key replaces the value in place.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedMap<T> {
    entries: Vec<(String, T)>,
}

pub type ModalityMap<T> = NamedMap<T>;

impl<T> Default for NamedMap<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> NamedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        let key = key.into();
        if let Some(slot) = self.entries.iter_mut().find(|(name, _)| *name == key) {
            return Some(std::mem::replace(&mut slot.1, value));
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut T> {
        self.entries
            .iter_mut()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &str) -> Option<T> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(name, _)| name == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> NamedMap<U> {
        NamedMap {
            entries: self
                .entries
                .iter()
                .map(|(name, value)| (name.clone(), f(value)))
                .collect(),
        }
    }
}

impl<T> IntoIterator for NamedMap<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for NamedMap<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut map = NamedMap::new();
        for (key, value) in iter {
            map.insert(key, value);
        }
        map
    }
}

impl<T: Serialize> Serialize for NamedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for NamedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NamedMapVisitor<T>(std::marker::PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for NamedMapVisitor<T> {
            type Value = NamedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "a map keyed by modality name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = NamedMap::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    map.insert(key, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(NamedMapVisitor(std::marker::PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn format_tags_round_trip_through_strings() {
        for tag in FormatTag::ALL {
            let parsed: FormatTag = tag.as_str().parse().unwrap();
            assert_eq!(parsed, tag);
        }
        let err = "loom".parse::<FormatTag>().unwrap_err();
        assert_matches!(err, ScError::FormatMismatch(_));
    }

    #[test]
    fn named_map_keeps_insertion_order_and_replaces_in_place() {
        let mut map = NamedMap::new();
        map.insert(RNA, 1);
        map.insert(ADT, 2);
        assert_eq!(map.insert(RNA, 3), Some(1));
        assert_eq!(map.keys().collect::<Vec<_>>(), vec![RNA, ADT]);
        assert_eq!(map.get(RNA), Some(&3));

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"RNA":3,"ADT":2}"#);
        let back: NamedMap<i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
