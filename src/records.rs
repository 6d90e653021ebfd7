//! Health records and the collections that hold them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::crypto::aead::secure_random;
use crate::error::{Result, VaultError};
use crate::storage::slots;

/// Current version of the collection envelope.
pub const SCHEMA_VERSION: u32 = 1;

/// The collections the vault manages, each stored in its own slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    Readings,
    Medications,
}

impl CollectionName {
    pub const ALL: [CollectionName; 2] = [CollectionName::Readings, CollectionName::Medications];

    pub fn slot(self) -> &'static str {
        match self {
            CollectionName::Readings => slots::READINGS,
            CollectionName::Medications => slots::MEDICATIONS,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            CollectionName::Readings => 0,
            CollectionName::Medications => 1,
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionName::Readings => f.write_str("readings"),
            CollectionName::Medications => f.write_str("medications"),
        }
    }
}

impl FromStr for CollectionName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "readings" => Ok(CollectionName::Readings),
            "medications" => Ok(CollectionName::Medications),
            other => Err(format!("unknown collection '{other}'")),
        }
    }
}

/// A record type that lives in one named collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const COLLECTION: CollectionName;

    fn id(&self) -> &str;

    /// Records with a timestamp are kept newest first.
    fn timestamp(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// A blood pressure measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    pub id: String,
    pub systolic: u16,
    pub diastolic: u16,
    pub pulse: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub notes: String,
}

impl Reading {
    pub fn new(
        systolic: u16,
        diastolic: u16,
        pulse: u16,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: generate_id()?,
            systolic,
            diastolic,
            pulse,
            timestamp,
            notes: String::new(),
        })
    }
}

impl Record for Reading {
    const COLLECTION: CollectionName = CollectionName::Readings;

    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        Some(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    pub id: String,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    #[serde(default)]
    pub time_of_day: Option<String>,
}

impl Medication {
    pub fn new(name: &str, dosage: &str, frequency: &str) -> Result<Self> {
        Ok(Self {
            id: generate_id()?,
            name: name.to_string(),
            dosage: dosage.to_string(),
            frequency: frequency.to_string(),
            time_of_day: None,
        })
    }
}

impl Record for Medication {
    const COLLECTION: CollectionName = CollectionName::Medications;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Time-based id with a random suffix, unique enough for a single user.
pub fn generate_id() -> Result<String> {
    let millis = Utc::now().timestamp_millis();
    let mut suffix = [0u8; 4];
    secure_random(&mut suffix)?;
    let suffix: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("{millis:x}{suffix}"))
}

/// Ordered records of one type. Always persisted as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection<T> {
    records: Vec<T>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl<T: Record> Collection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<T>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.records.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Adds a record. Timestamped records go first, untimestamped ones last.
    pub fn insert(&mut self, record: T) {
        if record.timestamp().is_some() {
            self.records.insert(0, record);
        } else {
            self.records.push(record);
        }
    }

    /// Replaces the record with the same id, or inserts it.
    pub fn upsert(&mut self, record: T) {
        match self.records.iter_mut().find(|r| r.id() == record.id()) {
            Some(existing) => *existing = record,
            None => self.insert(record),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        let pos = self.records.iter().position(|r| r.id() == id)?;
        Some(self.records.remove(pos))
    }

    /// Union with `imported`, keeping existing records on id clashes, then
    /// newest first. Returns how many records were added, so merging the
    /// same import twice adds nothing the second time.
    pub fn merge(&mut self, imported: Collection<T>) -> usize {
        let mut seen: HashSet<String> = self.records.iter().map(|r| r.id().to_string()).collect();
        let before = self.records.len();
        for record in imported.records {
            if seen.insert(record.id().to_string()) {
                self.records.push(record);
            }
        }
        // stable, so untimestamped records keep their order
        self.records
            .sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        self.records.len() - before
    }

    /// Serializes into the versioned envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&EnvelopeRef {
            schema: SCHEMA_VERSION,
            records: &self.records,
        })?)
    }

    /// Parses the versioned envelope, or a bare array from older files.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let slot = T::COLLECTION.slot();
        let stored: Stored<T> =
            serde_json::from_slice(bytes).map_err(|e| VaultError::corrupt(slot, e))?;
        match stored {
            Stored::Envelope { schema, records } if schema == SCHEMA_VERSION => {
                Ok(Self { records })
            }
            Stored::Envelope { schema, .. } => Err(VaultError::corrupt(
                slot,
                format!("unsupported collection schema {schema}"),
            )),
            Stored::Legacy(records) => Ok(Self { records }),
        }
    }
}

impl<T> IntoIterator for Collection<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a Collection<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: u32,
    records: &'a [T],
}

#[derive(Deserialize)]
#[serde(untagged)]
#[serde(bound = "T: DeserializeOwned")]
enum Stored<T> {
    Envelope { schema: u32, records: Vec<T> },
    Legacy(Vec<T>),
}
