//! Password verification token.
//!
//! The token is a blob over a fixed, public marker. A candidate key is
//! correct iff it decrypts the token and recovers the marker.

use serde::{Deserialize, Serialize};

use super::{EncryptedBlob, SessionKey, decrypt, encrypt};
use crate::error::Result;

const MARKER: &str = "cuffvault";

#[derive(Serialize, Deserialize)]
struct Marker {
    verify: String,
}

/// Encrypts the marker under `key`.
pub fn create(key: &SessionKey) -> Result<EncryptedBlob> {
    let marker = serde_json::to_vec(&Marker {
        verify: MARKER.to_string(),
    })?;
    encrypt(key, &marker)
}

/// Returns true only when `key` decrypts `token` to the expected marker.
/// Any failure along the way is a failed verification, not an error.
pub fn verify(key: &SessionKey, token: &EncryptedBlob) -> bool {
    let Ok(plaintext) = decrypt(key, token) else {
        return false;
    };
    serde_json::from_slice::<Marker>(&plaintext)
        .map(|m| m.verify == MARKER)
        .unwrap_or(false)
}
