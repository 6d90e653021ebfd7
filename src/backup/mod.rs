//! Backup export and import.
//!
//! Plain backups are portable across devices and passwords. Encrypted
//! backups are tied to the salt epoch that produced them and are refused
//! once the password has changed.

use chrono::Utc;

use crate::crypto::{SessionKey, decrypt, encrypt};
use crate::error::{Result, VaultError};
use crate::records::{Collection, CollectionName, Record};
use crate::salt::Salt;

pub mod v1;

pub use v1::Backup;

/// Latest backup format version
pub const CURRENT_VERSION: u32 = v1::VERSION_V1;

/// Parses a backup file, dispatching on its `version` field.
pub fn parse(text: &str) -> Result<Backup> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| VaultError::InvalidBackup(e.to_string()))?;

    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| VaultError::InvalidBackup("missing version".into()))?;

    match version {
        1 => v1::parse(value),
        other => Err(VaultError::InvalidBackup(format!(
            "unsupported backup version {other}"
        ))),
    }
}

pub fn serialize(backup: &Backup) -> Result<String> {
    match backup.version {
        1 => v1::serialize(backup),
        other => Err(VaultError::InvalidBackup(format!(
            "unsupported backup version {other}"
        ))),
    }
}

/// Backup with the records in the clear.
pub fn export_plain<T: Record>(collection: &Collection<T>) -> Result<Backup> {
    let records = Some(serde_json::to_value(collection.records())?);
    let (readings, medications) = match T::COLLECTION {
        CollectionName::Readings => (records, None),
        CollectionName::Medications => (None, records),
    };
    Ok(Backup {
        version: CURRENT_VERSION,
        encrypted: false,
        export_date: Utc::now(),
        collection: None,
        salt: None,
        data: None,
        readings,
        medications,
    })
}

/// Backup sealed under the session key, stamped with the current salt.
pub fn export_encrypted<T: Record>(
    key: &SessionKey,
    salt: &Salt,
    collection: &Collection<T>,
) -> Result<Backup> {
    let plaintext = zeroize::Zeroizing::new(collection.to_bytes()?);
    Ok(Backup {
        version: CURRENT_VERSION,
        encrypted: true,
        export_date: Utc::now(),
        collection: Some(T::COLLECTION),
        salt: Some(salt.to_base64()),
        data: Some(encrypt(key, &plaintext)?),
        readings: None,
        medications: None,
    })
}

/// Records of a plain backup, validated only by their shape.
pub fn import_plain<T: Record>(backup: &Backup) -> Result<Collection<T>> {
    if backup.encrypted {
        return Err(VaultError::InvalidBackup("backup is encrypted".into()));
    }
    let payload = backup.plain_payload(T::COLLECTION).ok_or_else(|| {
        VaultError::InvalidBackup(format!("backup contains no {}", T::COLLECTION))
    })?;
    let records: Vec<T> = serde_json::from_value(payload.clone())
        .map_err(|e| VaultError::InvalidBackup(e.to_string()))?;
    Ok(Collection::from_records(records))
}

/// Records of any backup. Encrypted backups must come from the current
/// salt epoch; decrypting across epochs is refused with `SaltMismatch`.
pub fn import<T: Record>(
    backup: &Backup,
    key: &SessionKey,
    current_salt: &Salt,
) -> Result<Collection<T>> {
    if !backup.encrypted {
        return import_plain(backup);
    }

    if backup.encrypted_collection() != T::COLLECTION {
        return Err(VaultError::InvalidBackup(format!(
            "backup contains {}, not {}",
            backup.encrypted_collection(),
            T::COLLECTION
        )));
    }

    let (Some(salt), Some(data)) = (&backup.salt, &backup.data) else {
        return Err(VaultError::InvalidBackup(
            "encrypted backup lacks salt or data".into(),
        ));
    };
    let salt = Salt::from_base64(salt).map_err(|_| VaultError::InvalidBackup("bad salt".into()))?;
    if &salt != current_salt {
        return Err(VaultError::SaltMismatch);
    }

    let plaintext = decrypt(key, data)?;
    Collection::from_bytes(&plaintext).map_err(|e| VaultError::InvalidBackup(e.to_string()))
}
