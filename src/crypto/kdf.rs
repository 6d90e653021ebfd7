use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::KEY_LEN;
use crate::error::{Result, VaultError};
use crate::salt::Salt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            // default memory cost
            mem_cost_kib: 64 * 1024, // 64 MiB
            // default number of passes
            time_cost: 3,
            // default number of lanes
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn new(mem_cost_kib: u32, time_cost: u32, parallelism: u32) -> Result<Self> {
        let params = Self {
            mem_cost_kib,
            time_cost,
            parallelism,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn mem_cost_kib(&self) -> u32 {
        self.mem_cost_kib
    }

    pub fn time_cost(&self) -> u32 {
        self.time_cost
    }

    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> { Err(VaultError::InvalidKdfParams(msg.to_string())) };
        if self.mem_cost_kib < 8 {
            return invalid("argon2 memory cost too low");
        }
        if self.time_cost < 1 {
            return invalid("argon2 time cost must be >= 1");
        }
        if self.parallelism < 1 {
            return invalid("argon2 parallelism must be >= 1");
        }
        if self.mem_cost_kib < 8 * self.parallelism {
            return invalid("argon2 memory cost must be at least 8 * parallelism");
        }
        Ok(())
    }
}

/// 256-bit symmetric key of an unlocked session.
///
/// Lives only in memory and is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Derive the session key from a password with Argon2id.
///
/// Deterministic for a given (password, salt, params). A wrong password
/// still yields a key; it is rejected later by the verification token.
pub fn derive_key_blocking(password: &str, salt: &Salt, kdf: KdfParams) -> Result<SessionKey> {
    kdf.validate()?;

    let params = Params::new(
        kdf.mem_cost_kib,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::InvalidKdfParams(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt.as_bytes(), &mut key)
        .map_err(|e| VaultError::InvalidKdfParams(e.to_string()))?;

    let session_key = SessionKey(key);
    key.zeroize();
    Ok(session_key)
}

/// Runs [`derive_key_blocking`] on the blocking pool so the async runtime
/// keeps serving other tasks while Argon2 grinds.
pub async fn derive_key(
    password: Zeroizing<String>,
    salt: Salt,
    kdf: KdfParams,
) -> Result<SessionKey> {
    tokio::task::spawn_blocking(move || derive_key_blocking(&password, &salt, kdf)).await?
}
