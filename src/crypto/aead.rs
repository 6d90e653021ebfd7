use super::{NONCE_LEN, SessionKey};
use crate::error::{Result, VaultError};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use getrandom::fill;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Ciphertext plus the nonce it was sealed under.
///
/// Serialized as `{"nonce": <base64>, "ciphertext": <base64>}`. The
/// ciphertext carries the Poly1305 tag at its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    #[serde(with = "b64")]
    pub(crate) nonce: [u8; NONCE_LEN],
    #[serde(with = "b64")]
    pub(crate) ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Encodes the blob as the string stored in a slot.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a slot value back into a blob.
    pub fn decode(slot: &str, value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| VaultError::corrupt(slot, e))
    }
}

/// Fill buffer with cryptographically secure random bytes
pub(crate) fn secure_random(buf: &mut [u8]) -> Result<()> {
    fill(buf).map_err(|_| VaultError::Random)
}

/// Encrypt plaintext under a fresh random nonce
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<EncryptedBlob> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce = [0u8; NONCE_LEN];
    secure_random(&mut nonce)?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::Encryption)?;

    Ok(EncryptedBlob { nonce, ciphertext })
}

/// Decrypt and authenticate a blob. Never returns unauthenticated plaintext.
pub fn decrypt(key: &SessionKey, blob: &EncryptedBlob) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| VaultError::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

pub(crate) mod b64 {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        T::try_from(bytes).map_err(|_| D::Error::custom("unexpected byte length"))
    }
}
