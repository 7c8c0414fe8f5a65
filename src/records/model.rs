use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field map of a single record
pub type Fields = Map<String, Value>;

/// A single row in a record-store collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identity, stable across fetches
    pub id: String,
    /// Field values
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Fields::new(),
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Point-in-time contents of several collections, keyed by collection name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    collections: BTreeMap<String, Vec<Record>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style collection setter
    pub fn with_collection(mut self, name: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert_collection(name, records);
        self
    }

    /// Insert or replace a collection
    pub fn insert_collection(&mut self, name: impl Into<String>, records: Vec<Record>) {
        self.collections.insert(name.into(), records);
    }

    pub fn collection(&self, name: &str) -> Option<&[Record]> {
        self.collections.get(name).map(Vec::as_slice)
    }

    pub fn collection_mut(&mut self, name: &str) -> Option<&mut Vec<Record>> {
        self.collections.get_mut(name)
    }

    pub fn collection_names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Record])> {
        self.collections
            .iter()
            .map(|(name, records)| (name.as_str(), records.as_slice()))
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl FromIterator<(String, Vec<Record>)> for Dataset {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Record>)>>(iter: I) -> Self {
        Self {
            collections: iter.into_iter().collect(),
        }
    }
}
