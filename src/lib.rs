//! # cuffvault
//!
//! Local, password-protected store for blood pressure readings and
//! medications.
//!
//! A password and a random salt derive the session key (Argon2id). Each
//! collection is sealed as its own ChaCha20-Poly1305 blob in a key-value
//! [`SlotStore`]. The password itself is never stored; a verification
//! token tells a right password from a wrong one.
//!
//! ```no_run
//! # async fn demo() -> cuffvault::Result<()> {
//! use cuffvault::{Reading, Vault, VaultOptions, default_store};
//! use zeroize::Zeroizing;
//!
//! let vault = Vault::new(default_store()?, VaultOptions::default());
//! let session = vault.unlock(Zeroizing::new("abcd".to_string())).await?;
//! let readings = session.load::<Reading>().await?;
//! # Ok(()) }
//! ```

mod backup;
mod crypto;
mod error;
mod record_store;
mod records;
mod rotation;
mod salt;
mod session;
mod storage;

pub use crate::backup::{Backup, parse as parse_backup, serialize as serialize_backup};
pub use crate::crypto::{EncryptedBlob, KdfParams};
pub use crate::error::{Result, VaultError};
pub use crate::record_store::LoadPolicy;
pub use crate::records::{Collection, CollectionName, Medication, Reading, Record, generate_id};
pub use crate::salt::Salt;
pub use crate::session::Session;
pub use crate::storage::{FileSlotStore, MemorySlotStore, SlotStore, slots};

use directories::ProjectDirs;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use zeroize::Zeroizing;

use crate::crypto::{derive_key, token};
use crate::salt::SaltStore;

/// Shortest password accepted at setup and when changing password.
pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct VaultOptions {
    /// Argon2 parameters for a new vault. Existing vaults keep the
    /// parameters stored with them.
    pub kdf: KdfParams,
    pub load_policy: LoadPolicy,
}

/// State shared by a vault and every session opened on it.
pub(crate) struct Shared<S> {
    pub(crate) store: S,
    pub(crate) options: VaultOptions,
    /// Held shared by every session operation, exclusively by rotation
    /// and journal recovery.
    pub(crate) epoch: RwLock<()>,
    /// One lock per collection; writers exclusive, readers shared.
    collections: [RwLock<()>; 2],
}

impl<S> Shared<S> {
    pub(crate) fn collection_lock(&self, name: CollectionName) -> &RwLock<()> {
        &self.collections[name.index()]
    }
}

/// Entry point: owns the slot store and hands out sessions.
pub struct Vault<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for Vault<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: SlotStore + 'static> Vault<S> {
    pub fn new(store: S, options: VaultOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                options,
                epoch: RwLock::new(()),
                collections: [RwLock::new(()), RwLock::new(())],
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.shared.store
    }

    /// True once a password has been set up.
    pub async fn is_set_up(&self) -> Result<bool> {
        Ok(SaltStore::new(&self.shared.store).get().await?.is_some())
    }

    /// First-time setup: new salt, key and verification token.
    ///
    /// The salt is written last, so an interrupted setup still reads as
    /// not set up and can simply be repeated.
    pub async fn setup(&self, password: Zeroizing<String>) -> Result<Session<S>> {
        check_password(&password)?;
        let kdf = self.shared.options.kdf;
        kdf.validate()?;

        let _epoch = self.shared.epoch.write().await;
        let store = &self.shared.store;
        let salts = SaltStore::new(store);
        if salts.get().await?.is_some() {
            return Err(VaultError::AlreadyInitialized);
        }

        let salt = SaltStore::<S>::generate()?;
        let key = derive_key(password, salt, kdf).await?;

        store.put(slots::KDF, &serde_json::to_string(&kdf)?).await?;
        store
            .put(slots::VERIFY_TOKEN, &token::create(&key)?.encode()?)
            .await?;
        for name in CollectionName::ALL {
            store.remove(name.slot()).await?;
        }
        salts.set(&salt).await?;

        info!("vault initialized");
        Ok(Session::new(Arc::clone(&self.shared), key))
    }

    /// Derives the key for `password` and checks it against the stored
    /// verification token. A wrong password touches nothing.
    pub async fn unlock(&self, password: Zeroizing<String>) -> Result<Session<S>> {
        rotation::recover(&self.shared).await?;

        let _epoch = self.shared.epoch.read().await;
        let store = &self.shared.store;
        let Some(salt) = SaltStore::new(store).get().await? else {
            return Err(VaultError::Uninitialized);
        };
        let kdf = read_kdf(store).await?;
        let verify_token = read_token(store).await?;

        let key = derive_key(password, salt, kdf).await?;
        if !token::verify(&key, &verify_token) {
            return Err(VaultError::Authentication);
        }

        info!("vault unlocked");
        Ok(Session::new(Arc::clone(&self.shared), key))
    }
}

pub(crate) fn check_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::WeakPassword);
    }
    Ok(())
}

/// Argon2 parameters of the current epoch; defaults if the slot predates them.
pub(crate) async fn read_kdf<S: SlotStore + ?Sized>(store: &S) -> Result<KdfParams> {
    let Some(encoded) = store.get(slots::KDF).await? else {
        return Ok(KdfParams::default());
    };
    let kdf: KdfParams =
        serde_json::from_str(&encoded).map_err(|e| VaultError::corrupt(slots::KDF, e))?;
    kdf.validate()?;
    Ok(kdf)
}

pub(crate) async fn read_token<S: SlotStore + ?Sized>(store: &S) -> Result<EncryptedBlob> {
    let encoded = store
        .get(slots::VERIFY_TOKEN)
        .await?
        .ok_or_else(|| VaultError::corrupt(slots::VERIFY_TOKEN, "missing verification token"))?;
    EncryptedBlob::decode(slots::VERIFY_TOKEN, &encoded)
}

/// Slot store in the platform data directory.
pub fn default_store() -> Result<FileSlotStore> {
    let project_dirs = ProjectDirs::from("", "", "cuffvault").ok_or_else(|| {
        VaultError::Storage(std::io::Error::other(
            "could not determine platform directories",
        ))
    })?;

    Ok(FileSlotStore::new(project_dirs.data_dir().join("vault")))
}
