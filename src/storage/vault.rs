//! Credential vault.
//!
//! Encrypts OAuth tokens and server passwords at rest with AES-256-GCM.
//! Each encryption draws a fresh 96-bit IV, stored next to the ciphertext as
//! the `{ciphertext, iv}` pair. Plaintext only ever leaves the vault inside a
//! [`Secret`], which is redacted in `Debug` and zeroed on drop.
//!
//! Records written by earlier deployments use AES-256-CBC with PKCS#7
//! padding and a 128-bit IV, hex or base64 encoded. They are recognized by
//! the IV length and stay readable; new writes are always GCM.

use aes::Aes256;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::keychain::{KeychainAccess, KeychainError};
use crate::domain::{EncryptedLogin, EncryptedSecret};

const KEY_LEN: usize = 32;
const LEGACY_IV_LEN: usize = 16;

type LegacyDecryptor = cbc::Decryptor<Aes256>;

/// Errors that can occur in the credential vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Vault key must be {KEY_LEN} bytes of standard base64")]
    InvalidKey,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed: ciphertext or key mismatch")]
    Decrypt,

    #[error("Invalid base64 in stored secret: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid hex in stored secret: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Decrypted secret is not valid UTF-8")]
    Utf8,

    #[error("Random number generator failure")]
    Rng,

    #[error("Keychain error: {0}")]
    Keychain(#[from] KeychainError),
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Decrypted secret material.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Exposes the plaintext. Do not store or log the returned value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A decrypted username/password pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: Secret,
    pub password: Secret,
}

impl Login {
    pub fn new(username: impl Into<Secret>, password: impl Into<Secret>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// AES-256-GCM vault keyed by a 32-byte master key.
pub struct CredentialVault {
    key: Zeroizing<[u8; KEY_LEN]>,
    rng: SystemRandom,
}

impl CredentialVault {
    /// Creates a vault from raw key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self {
            key: Zeroizing::new(key),
            rng: SystemRandom::new(),
        }
    }

    /// Creates a vault from a base64-encoded key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| VaultError::InvalidKey)?,
        );
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidKey)?;
        Ok(Self::new(key))
    }

    /// Generates a fresh random key, base64-encoded.
    pub fn generate_key() -> Result<String> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        SystemRandom::new()
            .fill(&mut key[..])
            .map_err(|_| VaultError::Rng)?;
        Ok(BASE64.encode(&key[..]))
    }

    /// Loads the vault key from the explicit value when given, else from the
    /// OS keychain, generating and storing a key on first run.
    pub async fn load(explicit_key: Option<&str>, keychain: &KeychainAccess) -> Result<Self> {
        if let Some(encoded) = explicit_key {
            tracing::debug!("Using vault key from configuration");
            return Self::from_base64(encoded);
        }

        let generated = Self::generate_key()?;
        let encoded = keychain
            .get_or_insert_with(KeychainAccess::VAULT_KEY_ENTRY, move || generated)
            .await?;
        Self::from_base64(&encoded)
    }

    fn sealing_key(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key[..])
            .map_err(|_| VaultError::InvalidKey)?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Encrypts a plaintext secret.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret> {
        let key = self.sealing_key()?;

        let mut iv = [0u8; NONCE_LEN];
        self.rng.fill(&mut iv).map_err(|_| VaultError::Rng)?;

        let mut buf = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut buf)
            .map_err(|_| VaultError::Encrypt)?;

        Ok(EncryptedSecret {
            ciphertext: BASE64.encode(&buf),
            iv: BASE64.encode(iv),
        })
    }

    /// Decrypts a stored secret, GCM or legacy CBC.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<Secret> {
        let (iv, ciphertext) = decode_pair(secret)?;
        let plaintext = match iv.len() {
            NONCE_LEN => self.open_gcm(&iv, ciphertext)?,
            LEGACY_IV_LEN => self.open_cbc(&iv, &ciphertext)?,
            _ => return Err(VaultError::Decrypt),
        };

        let text = std::str::from_utf8(&plaintext).map_err(|_| VaultError::Utf8)?;
        Ok(Secret::new(text))
    }

    fn open_gcm(&self, iv: &[u8], mut buf: Zeroizing<Vec<u8>>) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.sealing_key()?;
        let nonce = Nonce::try_assume_unique_for_key(iv).map_err(|_| VaultError::Decrypt)?;
        let len = key
            .open_in_place(nonce, Aad::empty(), buf.as_mut_slice())
            .map_err(|_| VaultError::Decrypt)?
            .len();
        buf.truncate(len);
        Ok(buf)
    }

    fn open_cbc(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = LegacyDecryptor::new_from_slices(&self.key[..], iv)
            .map_err(|_| VaultError::InvalidKey)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| VaultError::Decrypt)?;
        Ok(Zeroizing::new(plaintext))
    }

    pub fn encrypt_login(&self, login: &Login) -> Result<EncryptedLogin> {
        Ok(EncryptedLogin {
            username: self.encrypt(login.username.expose())?,
            password: self.encrypt(login.password.expose())?,
        })
    }

    pub fn decrypt_login(&self, login: &EncryptedLogin) -> Result<Login> {
        Ok(Login {
            username: self.decrypt(&login.username)?,
            password: self.decrypt(&login.password)?,
        })
    }
}

/// Decodes `(iv, ciphertext)`. A 32-character hex IV marks a legacy hex
/// record; everything else is base64.
fn decode_pair(secret: &EncryptedSecret) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
    let hex_encoded = secret.iv.len() == LEGACY_IV_LEN * 2
        && secret.iv.bytes().all(|b| b.is_ascii_hexdigit());
    if hex_encoded {
        Ok((
            hex::decode(&secret.iv)?,
            Zeroizing::new(hex::decode(&secret.ciphertext)?),
        ))
    } else {
        Ok((
            BASE64.decode(&secret.iv)?,
            Zeroizing::new(BASE64.decode(&secret.ciphertext)?),
        ))
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new([7u8; KEY_LEN])
    }

    #[test]
    fn round_trip() {
        let vault = vault();
        for plaintext in ["", "ya29.a0Af-token", "pässwörd with spaces", "x".repeat(4096).as_str()] {
            let encrypted = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&encrypted).unwrap().expose(), plaintext);
        }
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let vault = vault();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_eq!(BASE64.decode(&a.iv).unwrap().len(), NONCE_LEN);
    }

    #[test]
    fn wrong_key_fails() {
        let encrypted = vault().encrypt("secret").unwrap();
        let other = CredentialVault::new([8u8; KEY_LEN]);
        assert!(matches!(other.decrypt(&encrypted), Err(VaultError::Decrypt)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let vault = vault();
        let mut encrypted = vault.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&encrypted.ciphertext).unwrap();
        raw[0] ^= 0x01;
        encrypted.ciphertext = BASE64.encode(raw);
        assert!(vault.decrypt(&encrypted).is_err());
    }

    #[test]
    fn legacy_cbc_records_decrypt() {
        let vault = vault();
        let hex_record = EncryptedSecret {
            ciphertext: "7dbc717a58baa242fd76a2a96ca912cb3d4497bacffeaf0ef4f9105f06acc3f6"
                .to_string(),
            iv: "000102030405060708090a0b0c0d0e0f".to_string(),
        };
        assert_eq!(
            vault.decrypt(&hex_record).unwrap().expose(),
            "ya29.legacy-access-token"
        );

        let base64_record = EncryptedSecret {
            ciphertext: "+kE3BeG/GFXeUgtZlioAeg9O8JA+eQ1qddJZOAvsbYs=".to_string(),
            iv: "AAECAwQFBgcICQoLDA0ODw==".to_string(),
        };
        assert_eq!(
            vault.decrypt(&base64_record).unwrap().expose(),
            "1//legacy-refresh"
        );
    }

    #[test]
    fn legacy_cbc_record_with_wrong_key_fails() {
        let record = EncryptedSecret {
            ciphertext: "7dbc717a58baa242fd76a2a96ca912cb3d4497bacffeaf0ef4f9105f06acc3f6"
                .to_string(),
            iv: "000102030405060708090a0b0c0d0e0f".to_string(),
        };
        let other = CredentialVault::new([8u8; KEY_LEN]);
        assert!(matches!(other.decrypt(&record), Err(VaultError::Decrypt)));
    }

    #[test]
    fn unknown_iv_length_rejected() {
        let vault = vault();
        let mut encrypted = vault.encrypt("secret").unwrap();
        encrypted.iv = BASE64.encode([0u8; 8]);
        assert!(matches!(vault.decrypt(&encrypted), Err(VaultError::Decrypt)));
    }

    #[test]
    fn base64_key_round_trip() {
        let key = CredentialVault::generate_key().unwrap();
        let a = CredentialVault::from_base64(&key).unwrap();
        let b = CredentialVault::from_base64(&key).unwrap();
        let encrypted = a.encrypt("shared").unwrap();
        assert_eq!(b.decrypt(&encrypted).unwrap().expose(), "shared");
    }

    #[test]
    fn short_key_rejected() {
        let short = BASE64.encode([1u8; 16]);
        assert!(matches!(
            CredentialVault::from_base64(&short),
            Err(VaultError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn load_prefers_explicit_key() {
        let key = CredentialVault::generate_key().unwrap();
        let keychain = KeychainAccess::with_service("io.mailsync.test.unused");
        let vault = CredentialVault::load(Some(&key), &keychain).await.unwrap();
        let encrypted = vault.encrypt("x").unwrap();
        let same = CredentialVault::from_base64(&key).unwrap();
        assert_eq!(same.decrypt(&encrypted).unwrap().expose(), "x");
    }

    #[test]
    fn login_round_trip() {
        let vault = vault();
        let login = Login::new("user@example.com", "hunter2");
        let encrypted = vault.encrypt_login(&login).unwrap();
        assert_eq!(vault.decrypt_login(&encrypted).unwrap(), login);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("top-secret");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert!(!format!("{:?}", Login::new("alice", "zz9")).contains("zz9"));
    }
}
