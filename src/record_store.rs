//! Collections persisted as independently encrypted blobs.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::crypto::{EncryptedBlob, SessionKey, decrypt, encrypt};
use crate::error::{Result, VaultError};
use crate::records::{Collection, CollectionName, Record};
use crate::storage::SlotStore;

/// What `load` does when a stored blob cannot be decrypted or parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Surface the error.
    #[default]
    Strict,
    /// Log a warning and return an empty collection. The next save
    /// overwrites the unreadable blob.
    Lenient,
}

/// Loads and saves whole collections under one session key.
///
/// Holds no locks itself; callers serialize writes per collection.
pub struct EncryptedRecordStore<'a, S: ?Sized> {
    store: &'a S,
    key: &'a SessionKey,
    policy: LoadPolicy,
}

impl<'a, S: SlotStore + ?Sized> EncryptedRecordStore<'a, S> {
    pub fn new(store: &'a S, key: &'a SessionKey, policy: LoadPolicy) -> Self {
        Self { store, key, policy }
    }

    /// Decrypted bytes of a collection, `None` if it was never saved.
    /// Ignores the load policy.
    pub async fn load_raw(&self, name: CollectionName) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let slot = name.slot();
        let Some(encoded) = self.store.get(slot).await? else {
            return Ok(None);
        };
        let blob = EncryptedBlob::decode(slot, &encoded)?;
        Ok(Some(decrypt(self.key, &blob)?))
    }

    /// An absent blob is an empty collection.
    pub async fn load<T: Record>(&self) -> Result<Collection<T>> {
        let loaded = match self.load_raw(T::COLLECTION).await {
            Ok(Some(plaintext)) => Collection::from_bytes(&plaintext),
            Ok(None) => return Ok(Collection::new()),
            Err(e) => Err(e),
        };

        match (loaded, self.policy) {
            (Ok(collection), _) => Ok(collection),
            (Err(e @ (VaultError::Decryption | VaultError::Corrupt { .. })), LoadPolicy::Lenient) => {
                let collection = T::COLLECTION;
                warn!(%collection, error = %e, "unreadable collection, starting empty");
                Ok(Collection::new())
            }
            (Err(e), _) => Err(e),
        }
    }

    /// Encrypts the full collection and overwrites its blob.
    pub async fn save<T: Record>(&self, collection: &Collection<T>) -> Result<()> {
        let plaintext = Zeroizing::new(collection.to_bytes()?);
        let blob = encrypt(self.key, &plaintext)?;
        self.store.put(T::COLLECTION.slot(), &blob.encode()?).await?;
        let name = T::COLLECTION;
        debug!(collection = %name, records = collection.len(), "collection saved");
        Ok(())
    }
}
