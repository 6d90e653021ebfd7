use thiserror::Error;

use crate::MIN_PASSWORD_LEN;

pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors raised by vault, session and backup operations.
///
/// None of these are retried internally: repeating a call with the same
/// inputs reproduces the same failure.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No password has been set up yet, or the session is locked.
    #[error("vault is not initialized or the session is locked")]
    Uninitialized,

    #[error("vault is already initialized")]
    AlreadyInitialized,

    #[error("incorrect password")]
    Authentication,

    /// Authentication tag check failed: wrong key, corruption or tampering.
    #[error("decryption failed: wrong key or corrupted data")]
    Decryption,

    /// The session key belongs to an earlier password epoch.
    #[error("session is stale: the password was changed; unlock again")]
    StaleSession,

    #[error("backup was created under a different password and cannot be decrypted")]
    SaltMismatch,

    #[error("password must be at least {} characters", MIN_PASSWORD_LEN)]
    WeakPassword,

    #[error("invalid backup: {0}")]
    InvalidBackup(String),

    #[error("malformed data in slot '{slot}': {reason}")]
    Corrupt { slot: String, reason: String },

    #[error("invalid key derivation parameters: {0}")]
    InvalidKdfParams(String),

    /// The new password was committed but not every slot was rewritten.
    /// Unlocking with the new password finishes the change.
    #[error("password change committed but not fully applied; unlock with the new password")]
    RotationIncomplete,

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("encryption failed")]
    Encryption,

    #[error("OS random generator unavailable")]
    Random,

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub(crate) fn corrupt(slot: &str, reason: impl ToString) -> Self {
        VaultError::Corrupt {
            slot: slot.to_string(),
            reason: reason.to_string(),
        }
    }
}
