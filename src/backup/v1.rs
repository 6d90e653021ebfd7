//! Backup file format v1.
//!
//! ```text
//! { "version": 1,
//!   "encrypted": bool,
//!   "exportDate": ISO-8601,
//!   "collection": "readings" | "medications",   encrypted only, default readings
//!   "salt": base64,                              iff encrypted
//!   "data": { "nonce", "ciphertext" },           iff encrypted
//!   "readings": [...] | "medications": [...]     iff plain }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::EncryptedBlob;
use crate::error::{Result, VaultError};
use crate::records::CollectionName;

pub const VERSION_V1: u32 = 1;

/// A versioned backup envelope. Never persisted by the vault itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    pub version: u32,
    pub encrypted: bool,
    pub export_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EncryptedBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readings: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medications: Option<serde_json::Value>,
}

impl Backup {
    /// Which collection an encrypted backup holds.
    pub fn encrypted_collection(&self) -> CollectionName {
        self.collection.unwrap_or(CollectionName::Readings)
    }

    /// The plain payload for `name`, if present.
    pub fn plain_payload(&self, name: CollectionName) -> Option<&serde_json::Value> {
        match name {
            CollectionName::Readings => self.readings.as_ref(),
            CollectionName::Medications => self.medications.as_ref(),
        }
    }
}

/// Parses a v1 backup and checks the fields required by its kind.
pub fn parse(value: serde_json::Value) -> Result<Backup> {
    let backup: Backup =
        serde_json::from_value(value).map_err(|e| VaultError::InvalidBackup(e.to_string()))?;

    if backup.version != VERSION_V1 {
        return Err(VaultError::InvalidBackup("wrong version for v1 parser".into()));
    }

    if backup.encrypted {
        if backup.salt.is_none() || backup.data.is_none() {
            return Err(VaultError::InvalidBackup(
                "encrypted backup lacks salt or data".into(),
            ));
        }
    } else if backup.readings.is_none() && backup.medications.is_none() {
        return Err(VaultError::InvalidBackup("plain backup has no records".into()));
    }

    Ok(backup)
}

/// Pretty-printed JSON, the form handed to the user.
pub fn serialize(backup: &Backup) -> Result<String> {
    if backup.version != VERSION_V1 {
        return Err(VaultError::InvalidBackup("wrong version for v1 serializer".into()));
    }
    Ok(serde_json::to_string_pretty(backup)?)
}
