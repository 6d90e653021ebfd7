//! The salt of the current password epoch.

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::crypto::{SALT_LEN, aead::secure_random};
use crate::error::{Result, VaultError};
use crate::storage::{SlotStore, slots};

/// Random, public value mixed into key derivation. One per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Salt([u8; SALT_LEN]);

impl Salt {
    pub fn from_bytes(bytes: [u8; SALT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::corrupt(slots::SALT, e))?;
        let bytes: [u8; SALT_LEN] = bytes
            .try_into()
            .map_err(|_| VaultError::corrupt(slots::SALT, "invalid salt length"))?;
        Ok(Self(bytes))
    }
}

/// Reads and writes the single salt slot.
pub struct SaltStore<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: SlotStore + ?Sized> SaltStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Draws a new random salt. Not persisted until [`SaltStore::set`].
    pub fn generate() -> Result<Salt> {
        let mut salt = [0u8; SALT_LEN];
        secure_random(&mut salt)?;
        Ok(Salt(salt))
    }

    /// `None` means first-time setup has not happened.
    pub async fn get(&self) -> Result<Option<Salt>> {
        match self.store.get(slots::SALT).await? {
            Some(encoded) => Ok(Some(Salt::from_base64(&encoded)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, salt: &Salt) -> Result<()> {
        self.store.put(slots::SALT, &salt.to_base64()).await?;
        Ok(())
    }
}
