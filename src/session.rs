use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroizing;

use crate::backup::{self, Backup};
use crate::crypto::{SessionKey, token};
use crate::error::{Result, VaultError};
use crate::record_store::EncryptedRecordStore;
use crate::records::{Collection, Record};
use crate::rotation;
use crate::salt::SaltStore;
use crate::storage::SlotStore;
use crate::{Shared, check_password, read_token};

/// An unlocked vault.
///
/// Owns the session key; the key is wiped when the session is locked or
/// dropped. Cheap to share behind an `Arc` across tasks: reads of one
/// collection run concurrently, writes to it are serialized.
pub struct Session<S> {
    shared: Arc<Shared<S>>,
    key: Arc<RwLock<Option<SessionKey>>>,
}

impl<S: SlotStore + 'static> Session<S> {
    pub(crate) fn new(shared: Arc<Shared<S>>, key: SessionKey) -> Self {
        Self {
            shared,
            key: Arc::new(RwLock::new(Some(key))),
        }
    }

    /// Loads a whole collection. A collection never saved is empty.
    pub async fn load<T: Record>(&self) -> Result<Collection<T>> {
        let _epoch = self.shared.epoch.read().await;
        let _reading = self.shared.collection_lock(T::COLLECTION).read().await;
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(VaultError::Uninitialized)?;

        self.ensure_settled().await?;
        self.records(key).load().await
    }

    /// Replaces the stored collection with `collection`.
    pub async fn save<T: Record>(&self, collection: &Collection<T>) -> Result<()> {
        let _epoch = self.shared.epoch.read().await;
        let _writing = self.shared.collection_lock(T::COLLECTION).write().await;
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(VaultError::Uninitialized)?;

        self.ensure_current(key).await?;
        self.records(key).save(collection).await
    }

    /// Load, modify and save as one step, with the collection's write lock
    /// held throughout so concurrent updates cannot lose each other's work.
    pub async fn update<T, F, R>(&self, f: F) -> Result<R>
    where
        T: Record,
        F: FnOnce(&mut Collection<T>) -> R,
    {
        let _epoch = self.shared.epoch.read().await;
        let _writing = self.shared.collection_lock(T::COLLECTION).write().await;
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(VaultError::Uninitialized)?;

        self.ensure_current(key).await?;
        let records = self.records(key);
        let mut collection = records.load().await?;
        let result = f(&mut collection);
        records.save(&collection).await?;
        Ok(result)
    }

    /// Re-keys the whole vault under `new_password`.
    ///
    /// Either every slot moves to the new password or none does. The work
    /// runs on its own task, so dropping this future does not interrupt it.
    pub async fn change_password(
        &self,
        old_password: Zeroizing<String>,
        new_password: Zeroizing<String>,
    ) -> Result<()> {
        check_password(&new_password)?;
        let task = tokio::spawn(rotation::rotate(
            Arc::clone(&self.shared),
            Arc::clone(&self.key),
            old_password,
            new_password,
        ));
        task.await?
    }

    pub async fn export_plain<T: Record>(&self) -> Result<Backup> {
        backup::export_plain(&self.load::<T>().await?)
    }

    /// Encrypted backup bound to the current password epoch.
    pub async fn export_encrypted<T: Record>(&self) -> Result<Backup> {
        let _epoch = self.shared.epoch.read().await;
        let _reading = self.shared.collection_lock(T::COLLECTION).read().await;
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(VaultError::Uninitialized)?;

        self.ensure_settled().await?;
        let salt = SaltStore::new(&self.shared.store)
            .get()
            .await?
            .ok_or(VaultError::Uninitialized)?;
        let collection = self.records(key).load::<T>().await?;
        backup::export_encrypted(key, &salt, &collection)
    }

    /// Records held by `backup`. Does not touch the stored collection.
    pub async fn import<T: Record>(&self, backup: &Backup) -> Result<Collection<T>> {
        let _epoch = self.shared.epoch.read().await;
        let key = self.key.read().await;
        let key = key.as_ref().ok_or(VaultError::Uninitialized)?;

        if !backup.encrypted {
            return backup::import_plain(backup);
        }
        self.ensure_settled().await?;
        let salt = SaltStore::new(&self.shared.store)
            .get()
            .await?
            .ok_or(VaultError::Uninitialized)?;
        backup::import(backup, key, &salt)
    }

    /// Merges `backup` into the stored collection: union by id, newest
    /// first. Returns how many records were new.
    pub async fn import_and_merge<T: Record>(&self, backup: &Backup) -> Result<usize> {
        let imported = self.import::<T>(backup).await?;
        let added = self
            .update(move |existing: &mut Collection<T>| existing.merge(imported))
            .await?;
        debug!(added, "backup merged");
        Ok(added)
    }

    pub async fn is_locked(&self) -> bool {
        self.key.read().await.is_none()
    }

    /// Wipes the session key. Further calls fail with `Uninitialized`.
    pub async fn lock(&self) {
        *self.key.write().await = None;
    }

    fn records<'a>(&'a self, key: &'a SessionKey) -> EncryptedRecordStore<'a, S> {
        EncryptedRecordStore::new(&self.shared.store, key, self.shared.options.load_policy)
    }

    /// Refuses to touch slots while a committed password change is only
    /// partly applied; the next unlock finishes it.
    async fn ensure_settled(&self) -> Result<()> {
        if rotation::is_pending(&self.shared.store).await? {
            return Err(VaultError::RotationIncomplete);
        }
        Ok(())
    }

    /// Refuses writes from a session whose key no longer opens the vault,
    /// e.g. after another session changed the password.
    async fn ensure_current(&self, key: &SessionKey) -> Result<()> {
        self.ensure_settled().await?;
        if token::verify(key, &read_token(&self.shared.store).await?) {
            Ok(())
        } else {
            Err(VaultError::StaleSession)
        }
    }
}
