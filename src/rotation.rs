//! Password rotation as a staged, journaled transaction.
//!
//! All new slot values are computed in memory first, then written as a
//! single journal value. That write is the commit point: before it nothing
//! has changed, after it the journal is authoritative and is replayed by
//! [`recover`] until every slot matches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{SessionKey, derive_key, encrypt, token};
use crate::error::{Result, VaultError};
use crate::record_store::EncryptedRecordStore;
use crate::records::CollectionName;
use crate::salt::SaltStore;
use crate::storage::{SlotStore, slots};
use crate::{Shared, read_kdf, read_token};

const JOURNAL_VERSION: u32 = 1;

/// New slot values, keyed by slot name.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Journal {
    version: u32,
    writes: BTreeMap<String, String>,
}

impl Journal {
    fn new() -> Self {
        Self {
            version: JOURNAL_VERSION,
            writes: BTreeMap::new(),
        }
    }

    fn stage(&mut self, slot: &str, value: String) {
        self.writes.insert(slot.to_string(), value);
    }

    async fn apply<S: SlotStore + ?Sized>(&self, store: &S) -> Result<()> {
        for (slot, value) in &self.writes {
            store.put(slot, value).await?;
        }
        Ok(())
    }
}

/// Re-keys every slot under a new salt and password.
///
/// Runs to completion on its own task: the caller awaiting it may go away
/// without leaving the vault half rotated.
pub(crate) async fn rotate<S: SlotStore + 'static>(
    shared: Arc<Shared<S>>,
    session_key: Arc<RwLock<Option<SessionKey>>>,
    old_password: Zeroizing<String>,
    new_password: Zeroizing<String>,
) -> Result<()> {
    let _epoch = shared.epoch.write().await;
    let mut session_key = session_key.write().await;
    if session_key.is_none() {
        return Err(VaultError::Uninitialized);
    }

    let store = &shared.store;
    // an earlier committed change wins; the old password is checked against it
    replay_pending(store).await?;

    let salts = SaltStore::new(store);
    let Some(old_salt) = salts.get().await? else {
        return Err(VaultError::Uninitialized);
    };
    let kdf = read_kdf(store).await?;

    let old_key = derive_key(old_password, old_salt, kdf).await?;
    if !token::verify(&old_key, &read_token(store).await?) {
        return Err(VaultError::Authentication);
    }

    // any unreadable collection aborts before anything is written
    let old_records = EncryptedRecordStore::new(store, &old_key, shared.options.load_policy);
    let mut plaintexts = Vec::new();
    for name in CollectionName::ALL {
        if let Some(plaintext) = old_records.load_raw(name).await? {
            plaintexts.push((name, plaintext));
        }
    }

    let new_salt = SaltStore::<S>::generate()?;
    let new_key = derive_key(new_password, new_salt, kdf).await?;

    let mut journal = Journal::new();
    for (name, plaintext) in &plaintexts {
        journal.stage(name.slot(), encrypt(&new_key, plaintext)?.encode()?);
    }
    journal.stage(slots::VERIFY_TOKEN, token::create(&new_key)?.encode()?);
    journal.stage(slots::KDF, serde_json::to_string(&kdf)?);
    journal.stage(slots::SALT, new_salt.to_base64());

    store
        .put(slots::ROTATION_JOURNAL, &serde_json::to_string(&journal)?)
        .await?;

    // committed: from here on only the new password is valid
    if let Err(e) = finish(store, &journal).await {
        warn!(error = %e, "password change committed but not applied; locking session");
        *session_key = None;
        return Err(VaultError::RotationIncomplete);
    }

    *session_key = Some(new_key);
    info!(collections = plaintexts.len(), "password changed");
    Ok(())
}

async fn finish<S: SlotStore + ?Sized>(store: &S, journal: &Journal) -> Result<()> {
    journal.apply(store).await?;
    store.remove(slots::ROTATION_JOURNAL).await?;
    Ok(())
}

/// Replays a journal left by an interrupted rotation. A no-op when none
/// is pending.
pub(crate) async fn recover<S: SlotStore>(shared: &Shared<S>) -> Result<()> {
    let _epoch = shared.epoch.write().await;
    replay_pending(&shared.store).await
}

/// True while a committed password change has not reached every slot.
pub(crate) async fn is_pending<S: SlotStore + ?Sized>(store: &S) -> Result<bool> {
    Ok(store.get(slots::ROTATION_JOURNAL).await?.is_some())
}

async fn replay_pending<S: SlotStore + ?Sized>(store: &S) -> Result<()> {
    let Some(encoded) = store.get(slots::ROTATION_JOURNAL).await? else {
        return Ok(());
    };

    let journal: Journal = serde_json::from_str(&encoded)
        .map_err(|e| VaultError::corrupt(slots::ROTATION_JOURNAL, e))?;
    if journal.version != JOURNAL_VERSION {
        return Err(VaultError::corrupt(
            slots::ROTATION_JOURNAL,
            format!("unsupported journal version {}", journal.version),
        ));
    }

    warn!(slots = journal.writes.len(), "finishing interrupted password change");
    finish(store, &journal).await
}
