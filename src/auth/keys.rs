use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no signing keys configured")]
    Empty,
    #[error("duplicate key id '{0}'")]
    DuplicateId(String),
    #[error("unknown key id '{0}'")]
    NotFound(String),
    #[error("invalid key material for '{id}': {reason}")]
    Invalid { id: String, reason: String },
}

/// An RSA signing key and the jsonwebtoken handles derived from it
pub struct SigningKey {
    id: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    pub fn from_rsa(id: impl Into<String>, key: &RsaPrivateKey) -> Result<Self, KeyError> {
        let id = id.into();
        let invalid = |reason: String| KeyError::Invalid {
            id: id.clone(),
            reason,
        };

        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| invalid(e.to_string()))?;
        let encoding = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| invalid(e.to_string()))?;

        let public = key.to_public_key();
        let decoding = DecodingKey::from_rsa_components(
            &URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            &URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        )
        .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            id,
            encoding,
            decoding,
        })
    }

    /// Fresh random key. Anything signed with it dies with the process.
    pub fn generate(id: impl Into<String>, bits: usize) -> Result<Self, KeyError> {
        let id = id.into();
        let key = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, bits).map_err(|e| {
            KeyError::Invalid {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;
        Self::from_rsa(id, &key)
    }

    /// PKCS#8 or PKCS#1 PEM. The key id is the file stem.
    pub fn from_pem_file(path: &Path) -> Result<Self, KeyError> {
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
            .to_string();

        let pem = std::fs::read_to_string(path).map_err(|e| KeyError::Invalid {
            id: id.clone(),
            reason: format!("{}: {}", path.display(), e),
        })?;

        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| KeyError::Invalid {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        Self::from_rsa(id, &key)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

/// Startup-populated, read-only set of signing keys. Only the default key issues;
/// the others are kept so credentials they signed still verify.
#[derive(Clone)]
pub struct KeyRegistry {
    default_id: Arc<str>,
    keys: Arc<HashMap<String, SigningKey>>,
}

impl KeyRegistry {
    /// The first key becomes the default
    pub fn new(keys: Vec<SigningKey>) -> Result<Self, KeyError> {
        let default_id = keys.first().ok_or(KeyError::Empty)?.id.clone();

        let mut by_id = HashMap::with_capacity(keys.len());
        for key in keys {
            if by_id.contains_key(&key.id) {
                return Err(KeyError::DuplicateId(key.id));
            }
            by_id.insert(key.id.clone(), key);
        }

        Ok(Self {
            default_id: default_id.into(),
            keys: Arc::new(by_id),
        })
    }

    pub fn default_key(&self) -> &SigningKey {
        // new() guarantees the default id is present
        &self.keys[&*self.default_id]
    }

    /// Resolve a key by id; an empty id means the default
    pub fn lookup(&self, id: &str) -> Result<&SigningKey, KeyError> {
        let id = if id.is_empty() { &*self.default_id } else { id };
        self.keys
            .get(id)
            .ok_or_else(|| KeyError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    use super::*;
    use std::sync::OnceLock;

    // keygen is slow in debug builds, so generate once per test binary
    static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();

    fn keys() -> &'static (RsaPrivateKey, RsaPrivateKey) {
        KEYS.get_or_init(|| {
            let mut rng = rsa::rand_core::OsRng;
            (
                RsaPrivateKey::new(&mut rng, 1024).unwrap(),
                RsaPrivateKey::new(&mut rng, 1024).unwrap(),
            )
        })
    }

    pub fn primary(id: &str) -> SigningKey {
        SigningKey::from_rsa(id, &keys().0).unwrap()
    }

    pub fn secondary(id: &str) -> SigningKey {
        SigningKey::from_rsa(id, &keys().1).unwrap()
    }

    pub fn registry() -> KeyRegistry {
        KeyRegistry::new(vec![primary("1")]).unwrap()
    }
}
