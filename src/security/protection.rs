//! Purpose-scoped encryption of token-cache payloads.
//!
//! Blob layout: `b"TBC" | version | key-id len | key-id | nonce (12) | ciphertext+tag`.
//! Each purpose gets its own AES-256-GCM key derived with HKDF-SHA256 from the
//! master key, and the purpose plus the header are bound as associated data.

use std::fmt;

use base64::{engine::general_purpose, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::ProtectionError;

const MAGIC: &[u8; 3] = b"TBC";
const FORMAT_VERSION: u8 = 1;
const KEY_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"token-broker.protection.v1";

/// Master key material, identified so blobs can name the key that sealed them.
#[derive(Clone)]
pub struct ProtectionKey {
    id: String,
    material: [u8; KEY_LEN],
}

impl ProtectionKey {
    pub fn new(id: &str, material: [u8; KEY_LEN]) -> Result<Self, ProtectionError> {
        if id.is_empty() || id.len() > u8::MAX as usize {
            return Err(ProtectionError::InvalidKey(
                "key id must be 1-255 bytes".to_string(),
            ));
        }
        if id.contains([':', ',']) {
            return Err(ProtectionError::InvalidKey(format!(
                "key id '{id}' must not contain ':' or ','"
            )));
        }
        Ok(Self {
            id: id.to_string(),
            material,
        })
    }

    /// Parse `base64key` material for the given id.
    pub fn from_base64(id: &str, encoded: &str) -> Result<Self, ProtectionError> {
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ProtectionError::InvalidKey(format!("invalid base64 key: {e}")))?;
        let material: [u8; KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtectionKey::length_error(v.len())
        })?;
        Self::new(id, material)
    }

    fn length_error(len: usize) -> ProtectionError {
        ProtectionError::InvalidKey(format!("key must be {KEY_LEN} bytes, got {len}"))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn derive(&self, purpose: &str) -> Result<LessSafeKey, ProtectionError> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, HKDF_SALT).extract(&self.material);
        let info = [purpose.as_bytes()];
        let okm = prk.expand(&info, &AES_256_GCM).map_err(|_| {
            ProtectionError::InvalidKey(format!("cannot derive key '{}' for purpose", self.id))
        })?;
        Ok(LessSafeKey::new(UnboundKey::from(okm)))
    }
}

impl fmt::Debug for ProtectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionKey")
            .field("id", &self.id)
            .field("material", &"<redacted>")
            .finish()
    }
}

/// Ordered set of master keys. The first key seals new blobs; all keys open.
#[derive(Debug, Clone)]
pub struct Keyring {
    keys: Vec<ProtectionKey>,
}

impl Keyring {
    pub fn new(current: ProtectionKey) -> Self {
        Self {
            keys: vec![current],
        }
    }

    /// Parse `id:base64key[,id:base64key...]`, current key first.
    pub fn parse(list: &str) -> Result<Self, ProtectionError> {
        let mut keys = Vec::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, encoded) = item.split_once(':').ok_or_else(|| {
                ProtectionError::InvalidKey("expected 'id:base64key'".to_string())
            })?;
            let key = ProtectionKey::from_base64(id.trim(), encoded)?;
            if keys.iter().any(|k: &ProtectionKey| k.id == key.id) {
                return Err(ProtectionError::InvalidKey(format!(
                    "duplicate key id '{}'",
                    key.id
                )));
            }
            keys.push(key);
        }
        if keys.is_empty() {
            return Err(ProtectionError::InvalidKey("no keys configured".to_string()));
        }
        Ok(Self { keys })
    }

    /// Keep `key` for opening older blobs without making it current.
    pub fn with_previous(mut self, key: ProtectionKey) -> Self {
        self.keys.push(key);
        self
    }

    pub fn current_key_id(&self) -> &str {
        &self.keys[0].id
    }

    /// Build a protector whose ciphertexts only open under the same `purpose`.
    pub fn protector(&self, purpose: &str) -> Result<DataProtector, ProtectionError> {
        let keys = self
            .keys
            .iter()
            .map(|k| Ok((k.id.clone(), k.derive(purpose)?)))
            .collect::<Result<Vec<_>, ProtectionError>>()?;
        Ok(DataProtector {
            purpose: purpose.to_string(),
            keys,
            rng: SystemRandom::new(),
        })
    }
}

/// Generate fresh key material, base64 encoded.
pub fn generate_key() -> Result<String, ProtectionError> {
    let mut material = [0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut material)
        .map_err(|_| ProtectionError::InvalidKey("system RNG unavailable".to_string()))?;
    Ok(general_purpose::STANDARD.encode(material))
}

pub struct DataProtector {
    purpose: String,
    keys: Vec<(String, LessSafeKey)>,
    rng: SystemRandom,
}

impl fmt::Debug for DataProtector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataProtector")
            .field("purpose", &self.purpose)
            .field("key_ids", &self.keys.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish()
    }
}

impl DataProtector {
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    fn aad(&self, header: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(self.purpose.len() + 1 + header.len());
        aad.extend_from_slice(self.purpose.as_bytes());
        aad.push(0);
        aad.extend_from_slice(header);
        aad
    }

    pub fn protect(&self, plaintext: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let (key_id, key) = &self.keys[0];

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| ProtectionError::EncryptionFailed)?;

        let mut header = Vec::with_capacity(MAGIC.len() + 2 + key_id.len());
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        header.push(key_id.len() as u8);
        header.extend_from_slice(key_id.as_bytes());

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(self.aad(&header)),
            &mut in_out,
        )
        .map_err(|_| ProtectionError::EncryptionFailed)?;

        let mut blob = header;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    pub fn unprotect(&self, blob: &[u8]) -> Result<Vec<u8>, ProtectionError> {
        let rest = blob
            .strip_prefix(MAGIC.as_slice())
            .ok_or(ProtectionError::DecryptionFailed("unrecognized blob"))?;
        let (&version, rest) = rest
            .split_first()
            .ok_or(ProtectionError::DecryptionFailed("truncated header"))?;
        if version != FORMAT_VERSION {
            return Err(ProtectionError::DecryptionFailed("unsupported format version"));
        }
        let (&id_len, rest) = rest
            .split_first()
            .ok_or(ProtectionError::DecryptionFailed("truncated header"))?;
        let id_len = id_len as usize;
        if rest.len() < id_len + NONCE_LEN {
            return Err(ProtectionError::DecryptionFailed("truncated header"));
        }
        let (key_id, rest) = rest.split_at(id_len);
        let (nonce_bytes, sealed) = rest.split_at(NONCE_LEN);

        let key = self
            .keys
            .iter()
            .find(|(id, _)| id.as_bytes() == key_id)
            .map(|(_, key)| key)
            .ok_or(ProtectionError::DecryptionFailed("unknown key id"))?;

        let header = &blob[..MAGIC.len() + 2 + id_len];
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ProtectionError::DecryptionFailed("invalid nonce"))?;

        let mut in_out = sealed.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::from(self.aad(header)), &mut in_out)
            .map_err(|_| ProtectionError::DecryptionFailed("authentication failed"))?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str, fill: u8) -> ProtectionKey {
        ProtectionKey::new(id, [fill; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_protect_unprotect() {
        let protector = Keyring::new(key("k1", 7)).protector("token-cache").unwrap();
        let blob = protector.protect(b"payload").unwrap();
        assert!(blob.starts_with(MAGIC));
        assert!(!blob.windows(7).any(|w| w == b"payload"));
        assert_eq!(protector.unprotect(&blob).unwrap(), b"payload");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let protector = Keyring::new(key("k1", 7)).protector("token-cache").unwrap();
        let a = protector.protect(b"same").unwrap();
        let b = protector.protect(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_purpose_mismatch_fails() {
        let ring = Keyring::new(key("k1", 7));
        let blob = ring.protector("token-cache").unwrap().protect(b"payload").unwrap();
        let err = ring.protector("session-cookie").unwrap().unprotect(&blob).unwrap_err();
        assert!(matches!(err, ProtectionError::DecryptionFailed(_)));
    }

    #[test]
    fn test_wrong_key_material_fails() {
        let blob = Keyring::new(key("k1", 7))
            .protector("p").unwrap()
            .protect(b"payload")
            .unwrap();
        let err = Keyring::new(key("k1", 8)).protector("p").unwrap().unprotect(&blob);
        assert_eq!(
            err.unwrap_err(),
            ProtectionError::DecryptionFailed("authentication failed")
        );
    }

    #[test]
    fn test_rotated_keyring_opens_old_blobs() {
        let old = Keyring::new(key("old", 1)).protector("p").unwrap();
        let blob = old.protect(b"payload").unwrap();

        let rotated = Keyring::new(key("new", 2)).with_previous(key("old", 1));
        let protector = rotated.protector("p").unwrap();
        assert_eq!(protector.unprotect(&blob).unwrap(), b"payload");

        let fresh = protector.protect(b"payload").unwrap();
        assert_eq!(&fresh[5..8], b"new");
    }

    #[test]
    fn test_unknown_key_id_fails() {
        let blob = Keyring::new(key("retired", 1))
            .protector("p").unwrap()
            .protect(b"x")
            .unwrap();
        let err = Keyring::new(key("new", 2)).protector("p").unwrap().unprotect(&blob);
        assert_eq!(
            err.unwrap_err(),
            ProtectionError::DecryptionFailed("unknown key id")
        );
    }

    #[test]
    fn test_corrupt_and_truncated_blobs_fail() {
        let protector = Keyring::new(key("k1", 7)).protector("p").unwrap();
        let mut blob = protector.protect(b"payload").unwrap();

        assert!(protector.unprotect(b"").is_err());
        assert!(protector.unprotect(b"garbage").is_err());
        assert!(protector.unprotect(&blob[..10]).is_err());

        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(protector.unprotect(&blob).is_err());
    }

    #[test]
    fn test_tampered_header_fails() {
        let protector = Keyring::new(key("k1", 7)).protector("p").unwrap();
        let mut blob = protector.protect(b"payload").unwrap();
        blob[3] = 9;
        assert_eq!(
            protector.unprotect(&blob).unwrap_err(),
            ProtectionError::DecryptionFailed("unsupported format version")
        );
    }

    #[test]
    fn test_keyring_parse() {
        let k1 = generate_key().unwrap();
        let k2 = generate_key().unwrap();
        let ring = Keyring::parse(&format!("v2:{k2}, v1:{k1}")).unwrap();
        assert_eq!(ring.current_key_id(), "v2");

        assert!(Keyring::parse("").is_err());
        assert!(Keyring::parse("nocolon").is_err());
        assert!(Keyring::parse("v1:c2hvcnQ=").is_err());
        assert!(Keyring::parse(&format!("v1:{k1},v1:{k2}")).is_err());
    }

    #[test]
    fn test_debug_redacts_material() {
        let rendered = format!("{:?}", key("k1", 0xab));
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains("171"));
    }
}
