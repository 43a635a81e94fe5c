//! At-rest protection for the template payload.
//!
//! The template store never looks inside a sealed payload; it hands bytes to a
//! [`Protector`] and gets bytes back. Two implementations are selected at
//! startup: [`SealedProtector`] (AES-256-GCM, key kept in the OS keyring) and
//! [`PassthroughProtector`] for platforms without a keyring backend.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose, Engine as _};
use keyring::{error::Error as KeyringError, Entry};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_SERVICE_NAME: &str = "facelock";
const ENVELOPE_VERSION: u32 = 1;
const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";
const NONCE_LEN: usize = 12;
pub const AES_GCM_KEY_BYTES: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtectError {
    /// The payload or platform is outside what this protector handles.
    #[error("protection not supported: {0}")]
    Unsupported(String),
    #[error("protection failed: {0}")]
    Failed(String),
}

pub trait Protector: Send + Sync {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError>;
    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectError>;
    fn name(&self) -> &'static str;
}

impl<P: Protector + ?Sized> Protector for Box<P> {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError> {
        (**self).protect(plaintext)
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectError> {
        (**self).unprotect(payload)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProtector;

impl Protector for PassthroughProtector {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError> {
        Ok(plaintext.to_vec())
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectError> {
        Ok(payload.to_vec())
    }

    fn name(&self) -> &'static str {
        "passthrough"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionKey {
    bytes: Vec<u8>,
}

impl ProtectionKey {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; AES_GCM_KEY_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ProtectError> {
        if bytes.len() != AES_GCM_KEY_BYTES {
            return Err(ProtectError::Failed(format!(
                "expected {AES_GCM_KEY_BYTES} key bytes but found {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Storage for the sealing key.
pub trait KeyProvider: Send + Sync {
    fn fetch(&self) -> Result<Option<ProtectionKey>, ProtectError>;
    fn store(&self, key: &ProtectionKey) -> Result<(), ProtectError>;
}

#[derive(Debug, Clone)]
pub struct KeyringKeyProvider {
    service: String,
    user: String,
}

impl KeyringKeyProvider {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            service: DEFAULT_SERVICE_NAME.to_string(),
            user: user.into(),
        }
    }

    /// Succeeds when the keyring backend answers, whether or not a key exists.
    pub fn check_access(&self) -> Result<(), ProtectError> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(_) | Err(KeyringError::NoEntry) => Ok(()),
            Err(err) => Err(ProtectError::Unsupported(describe_keyring_error(&err))),
        }
    }

    fn entry(&self) -> Result<Entry, ProtectError> {
        Entry::new(&self.service, &self.user).map_err(|err| {
            ProtectError::Unsupported(format!("failed to create keyring entry: {err}"))
        })
    }
}

impl KeyProvider for KeyringKeyProvider {
    fn fetch(&self) -> Result<Option<ProtectionKey>, ProtectError> {
        match self.entry()?.get_password() {
            Ok(secret) => decode_key(&secret).map(Some),
            Err(KeyringError::NoEntry) => Ok(None),
            Err(err) => Err(keyring_error(&err)),
        }
    }

    fn store(&self, key: &ProtectionKey) -> Result<(), ProtectError> {
        self.entry()?
            .set_password(&general_purpose::STANDARD.encode(key.as_bytes()))
            .map_err(|err| keyring_error(&err))
    }
}

#[derive(Serialize, Deserialize)]
struct SealedEnvelope {
    version: u32,
    algorithm: String,
    nonce: String,
    ciphertext: String,
}

/// AES-256-GCM sealing with a key held by a [`KeyProvider`].
///
/// The key is created on first use and reused afterwards, so a file sealed
/// earlier stays readable when a later save fails halfway.
pub struct SealedProtector<K> {
    keys: K,
}

impl<K: KeyProvider> SealedProtector<K> {
    pub fn new(keys: K) -> Self {
        Self { keys }
    }

    fn key_for_sealing(&self) -> Result<ProtectionKey, ProtectError> {
        if let Some(key) = self.keys.fetch()? {
            return Ok(key);
        }
        let key = ProtectionKey::generate();
        self.keys.store(&key)?;
        debug!("generated new template sealing key");
        Ok(key)
    }
}

impl<K: KeyProvider> Protector for SealedProtector<K> {
    fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectError> {
        let key = self.key_for_sealing()?;
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| ProtectError::Failed("invalid AES-GCM key length".into()))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|err| ProtectError::Failed(format!("failed to seal templates: {err}")))?;
        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            nonce: general_purpose::STANDARD.encode(nonce),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
        };
        serde_json::to_vec_pretty(&envelope)
            .map_err(|err| ProtectError::Failed(format!("failed to encode envelope: {err}")))
    }

    fn unprotect(&self, payload: &[u8]) -> Result<Vec<u8>, ProtectError> {
        let envelope = serde_json::from_slice::<SealedEnvelope>(payload).map_err(|_| {
            ProtectError::Failed("payload is not a sealed template envelope".into())
        })?;
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(ProtectError::Failed(format!(
                "unsupported envelope algorithm '{}'",
                envelope.algorithm
            )));
        }
        if envelope.version != ENVELOPE_VERSION {
            return Err(ProtectError::Failed(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let key = self
            .keys
            .fetch()?
            .ok_or_else(|| ProtectError::Failed("no sealing key stored for this user".into()))?;

        let nonce = general_purpose::STANDARD
            .decode(envelope.nonce.trim())
            .map_err(|err| ProtectError::Failed(format!("invalid nonce encoding: {err}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(ProtectError::Failed(format!(
                "expected nonce of {NONCE_LEN} bytes but found {}",
                nonce.len()
            )));
        }
        let ciphertext = general_purpose::STANDARD
            .decode(envelope.ciphertext.trim())
            .map_err(|err| ProtectError::Failed(format!("invalid ciphertext encoding: {err}")))?;

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|_| ProtectError::Failed("invalid AES-GCM key length".into()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|err| ProtectError::Failed(format!("failed to unseal templates: {err}")))
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectorSelection {
    Auto,
    Keyring,
    Passthrough,
}

/// Picks the protector once at startup.
pub fn select_protector(
    selection: ProtectorSelection,
    user: &str,
) -> Result<Box<dyn Protector>, ProtectError> {
    let keys = KeyringKeyProvider::new(user);
    match selection {
        ProtectorSelection::Passthrough => Ok(Box::new(PassthroughProtector)),
        ProtectorSelection::Keyring => {
            keys.check_access()?;
            Ok(Box::new(SealedProtector::new(keys)))
        }
        ProtectorSelection::Auto => match keys.check_access() {
            Ok(()) => Ok(Box::new(SealedProtector::new(keys))),
            Err(err) => {
                warn!(error = %err, "keyring unavailable; templates will be stored unsealed");
                Ok(Box::new(PassthroughProtector))
            }
        },
    }
}

fn describe_keyring_error(err: &KeyringError) -> String {
    match err {
        KeyringError::NoStorageAccess(inner) => {
            format!("keyring locked or unavailable: {inner}")
        }
        KeyringError::PlatformFailure(inner) => format!("keyring platform failure: {inner}"),
        KeyringError::BadEncoding(_) => "keyring returned a non-UTF8 secret".into(),
        KeyringError::NoEntry => "keyring reported no entry".into(),
        _ => format!("keyring error: {err}"),
    }
}

/// A missing or locked backend is `Unsupported`; anything else is `Failed`.
fn keyring_error(err: &KeyringError) -> ProtectError {
    let message = describe_keyring_error(err);
    match err {
        KeyringError::NoStorageAccess(_) | KeyringError::PlatformFailure(_) => {
            ProtectError::Unsupported(message)
        }
        _ => ProtectError::Failed(message),
    }
}

fn decode_key(secret: &str) -> Result<ProtectionKey, ProtectError> {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return Err(ProtectError::Failed("stored sealing key was empty".into()));
    }
    let decoded = general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .map_err(|err| ProtectError::Failed(format!("sealing key base64 decode failed: {err}")))?;
    ProtectionKey::from_bytes(decoded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryKeyProvider {
        pub(crate) key: Mutex<Option<ProtectionKey>>,
        pub(crate) stores: Mutex<usize>,
    }

    impl KeyProvider for MemoryKeyProvider {
        fn fetch(&self) -> Result<Option<ProtectionKey>, ProtectError> {
            Ok(self.key.lock().unwrap().clone())
        }

        fn store(&self, key: &ProtectionKey) -> Result<(), ProtectError> {
            *self.key.lock().unwrap() = Some(key.clone());
            *self.stores.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[test]
    fn sealed_round_trip_reuses_key() {
        let protector = SealedProtector::new(MemoryKeyProvider::default());
        let first = protector.protect(b"templates").unwrap();
        let second = protector.protect(b"templates").unwrap();
        assert_ne!(first, second, "nonces must differ");
        assert_eq!(protector.unprotect(&first).unwrap(), b"templates");
        assert_eq!(protector.unprotect(&second).unwrap(), b"templates");
        assert_eq!(*protector.keys.stores.lock().unwrap(), 1);
    }

    #[test]
    fn unsealed_payload_fails_while_sealing_is_available() {
        let protector = SealedProtector::new(MemoryKeyProvider::default());
        let err = protector.unprotect(b"{\"version\":1}").unwrap_err();
        assert!(matches!(err, ProtectError::Failed(msg) if msg.contains("not a sealed")));
    }

    #[test]
    fn unavailable_keyring_backend_is_unsupported() {
        let locked = keyring_error(&KeyringError::NoStorageAccess("locked".into()));
        assert!(matches!(locked, ProtectError::Unsupported(_)));
        let platform = keyring_error(&KeyringError::PlatformFailure("no dbus".into()));
        assert!(matches!(platform, ProtectError::Unsupported(_)));
        let encoding = keyring_error(&KeyringError::BadEncoding(vec![0xff]));
        assert!(matches!(encoding, ProtectError::Failed(_)));
    }

    #[test]
    fn wrong_key_fails_instead_of_returning_data() {
        let sealing = SealedProtector::new(MemoryKeyProvider::default());
        let payload = sealing.protect(b"secret").unwrap();

        let other = SealedProtector::new(MemoryKeyProvider::default());
        other.keys.store(&ProtectionKey::generate()).unwrap();
        let err = other.unprotect(&payload).unwrap_err();
        assert!(matches!(err, ProtectError::Failed(_)));
    }

    #[test]
    fn missing_key_is_a_failure() {
        let sealing = SealedProtector::new(MemoryKeyProvider::default());
        let payload = sealing.protect(b"secret").unwrap();
        let fresh = SealedProtector::new(MemoryKeyProvider::default());
        let err = fresh.unprotect(&payload).unwrap_err();
        assert_eq!(
            err,
            ProtectError::Failed("no sealing key stored for this user".into())
        );
    }

    #[test]
    fn passthrough_is_identity() {
        let protector = PassthroughProtector;
        let sealed = protector.protect(b"abc").unwrap();
        assert_eq!(sealed, b"abc");
        assert_eq!(protector.unprotect(&sealed).unwrap(), b"abc");
    }

    #[test]
    fn decode_key_accepts_padded_base64() {
        let raw = [0xABu8; AES_GCM_KEY_BYTES];
        let encoded = general_purpose::STANDARD.encode(raw);
        let key = decode_key(&encoded).unwrap();
        assert_eq!(key.as_bytes(), &raw);
    }

    #[test]
    fn decode_key_rejects_short_values() {
        let encoded = general_purpose::STANDARD.encode([0xCDu8; 4]);
        let err = decode_key(&encoded).unwrap_err();
        assert!(matches!(err, ProtectError::Failed(msg) if msg.contains("expected")));
    }
}
