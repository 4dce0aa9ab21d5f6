mod kubernetes;
mod memory;

use base64::{prelude::BASE64_STANDARD, Engine};
use dyn_clone::{clone_trait_object, DynClone};
use std::{collections::BTreeMap, fmt::Debug, str};

use crate::{
    keys::{Key, KeyError, KeyMaterial, KeyVersion},
    ErrorClassification,
};

pub use kubernetes::KubernetesSecretStore;
pub use memory::MemorySecretStore;

/// The secret data key under which the JSON versioned representation of a
/// key is stored.
const KEY_VERSIONS_DATA_KEY: &str = "key_versions";
/// The secret data key under which the primary version's private material is
/// stored for consumers that predate versioned keys.
const LEGACY_SECRET_KEY_DATA_KEY: &str = "secret_key";
/// The secret data key under which the primary version's kid is stored for
/// consumers that predate versioned keys.
const PRIMARY_KID_DATA_KEY: &str = "primary_kid";

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("malformed secret {0}: {1}")]
    Malformed(String, String),
    #[error("kubernetes API error: {0}")]
    Kubernetes(#[source] anyhow::Error),
    #[error("cannot store an empty key in secret {0}")]
    EmptyKey(String),
}

impl ErrorClassification for SecretStoreError {
    fn is_retryable(&self) -> bool {
        match self {
            // Unparseable keys must never be overwritten; retrying won't
            // change that.
            SecretStoreError::Key(_) | SecretStoreError::Malformed(_, _) => false,
            SecretStoreError::EmptyKey(_) => false,
            SecretStoreError::Kubernetes(_) => true,
        }
    }
}

/// The two families of key this deployment maintains. They differ in the
/// serialization downstream cryptographic workers expect for the legacy
/// single-version secret entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum KeyEncoding {
    /// Batch signing keys: PKCS#8, parseable by ring.
    BatchSigning,
    /// Packet encryption (a.k.a. packet decryption) keys: X9.62 point plus
    /// scalar, the format libprio consumes.
    PacketEncryption,
}

/// The name of the secret holding a locality's batch signing key for the
/// provided ingestion server. The name doubles as the kid prefix under which
/// the key's versions appear in manifests.
pub fn batch_signing_key_name(environment: &str, locality: &str, ingestor: &str) -> String {
    format!("{environment}-{locality}-{ingestor}-batch-signing-key")
}

/// The name of the secret holding a locality's packet decryption key, also
/// its manifest kid prefix.
pub fn packet_encryption_key_name(environment: &str, locality: &str) -> String {
    format!("{environment}-{locality}-ingestion-packet-decryption-key")
}

/// A secret store holds the private key material this data share processor
/// uses, one secret per key. A missing secret reads as the empty Key.
/// Implementations must be cloneable so reads and writes can fan out across
/// worker threads.
pub trait SecretStore: Debug + DynClone + Send + Sync {
    fn get_batch_signing_key(
        &self,
        locality: &str,
        ingestor: &str,
    ) -> Result<Key, SecretStoreError>;

    fn put_batch_signing_key(
        &self,
        locality: &str,
        ingestor: &str,
        key: &Key,
    ) -> Result<(), SecretStoreError>;

    fn get_packet_encryption_key(&self, locality: &str) -> Result<Key, SecretStoreError>;

    fn put_packet_encryption_key(&self, locality: &str, key: &Key)
        -> Result<(), SecretStoreError>;
}

clone_trait_object!(SecretStore);

/// Encodes a key into the data map stored in a secret. Writers are strict:
/// both the JSON versioned representation and the legacy single-version
/// fields are always emitted, so downstream cryptographic workers that
/// predate versioned keys continue to operate.
fn encode_secret_data(
    secret_name: &str,
    key: &Key,
    encoding: KeyEncoding,
) -> Result<BTreeMap<String, Vec<u8>>, SecretStoreError> {
    let primary = key
        .primary()
        .ok_or_else(|| SecretStoreError::EmptyKey(secret_name.to_owned()))?;

    let legacy_material = match encoding {
        KeyEncoding::BatchSigning => primary.key.to_pkcs8_der()?,
        KeyEncoding::PacketEncryption => primary.key.to_x962(),
    };

    let mut data = BTreeMap::new();
    data.insert(KEY_VERSIONS_DATA_KEY.to_owned(), key.to_json()?);
    data.insert(
        LEGACY_SECRET_KEY_DATA_KEY.to_owned(),
        BASE64_STANDARD.encode(legacy_material).into_bytes(),
    );
    data.insert(
        PRIMARY_KID_DATA_KEY.to_owned(),
        primary.kid(secret_name).into_bytes(),
    );
    Ok(data)
}

/// Decodes a key from the data map stored in a secret. Readers are
/// permissive: the JSON versioned representation is preferred; a secret
/// written by something older that only carries `secret_key` is read as a
/// single-version key with creation time 0, which keeps its legacy kid.
fn decode_secret_data(
    secret_name: &str,
    data: &BTreeMap<String, Vec<u8>>,
    encoding: KeyEncoding,
) -> Result<Key, SecretStoreError> {
    if let Some(json) = data.get(KEY_VERSIONS_DATA_KEY) {
        return Ok(Key::from_json(json)?);
    }

    let legacy = data.get(LEGACY_SECRET_KEY_DATA_KEY).ok_or_else(|| {
        SecretStoreError::Malformed(
            secret_name.to_owned(),
            format!("secret has neither {KEY_VERSIONS_DATA_KEY} nor {LEGACY_SECRET_KEY_DATA_KEY}"),
        )
    })?;
    let legacy = str::from_utf8(legacy).map_err(|e| {
        SecretStoreError::Malformed(secret_name.to_owned(), format!("non UTF-8 secret key: {e}"))
    })?;
    let der = BASE64_STANDARD
        .decode(legacy.trim())
        .map_err(|e| KeyError::Base64(e))?;
    let material = match encoding {
        KeyEncoding::BatchSigning => KeyMaterial::from_pkcs8_der(&der)?,
        KeyEncoding::PacketEncryption => KeyMaterial::from_x962(&der)?,
    };
    Ok(Key::from_versions(vec![KeyVersion {
        key: material,
        creation_time: 0,
        primary: true,
    }])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key {
        Key::from_versions(vec![
            KeyVersion {
                key: KeyMaterial::generate().unwrap(),
                creation_time: 1600000000,
                primary: false,
            },
            KeyVersion {
                key: KeyMaterial::generate().unwrap(),
                creation_time: 1500000000,
                primary: true,
            },
        ])
        .unwrap()
    }

    #[test]
    fn secret_names() {
        assert_eq!(
            batch_signing_key_name("prod", "us-ca", "ingestor-1"),
            "prod-us-ca-ingestor-1-batch-signing-key"
        );
        assert_eq!(
            packet_encryption_key_name("prod", "us-ca"),
            "prod-us-ca-ingestion-packet-decryption-key"
        );
    }

    #[test]
    fn encode_emits_versioned_and_legacy_fields() {
        let key = test_key();
        let data = encode_secret_data("fake-secret", &key, KeyEncoding::BatchSigning).unwrap();

        assert_eq!(
            Key::from_json(data.get(KEY_VERSIONS_DATA_KEY).unwrap()).unwrap(),
            key
        );
        assert_eq!(
            data.get(PRIMARY_KID_DATA_KEY).unwrap(),
            b"fake-secret-1500000000"
        );
        // The legacy field holds the primary version's private material
        let legacy = BASE64_STANDARD
            .decode(data.get(LEGACY_SECRET_KEY_DATA_KEY).unwrap())
            .unwrap();
        let material = KeyMaterial::from_pkcs8_der(&legacy).unwrap();
        assert_eq!(material, key.primary().unwrap().key);
    }

    #[test]
    fn encode_packet_encryption_legacy_is_x962() {
        let key = test_key();
        let data = encode_secret_data("fake-secret", &key, KeyEncoding::PacketEncryption).unwrap();
        let legacy = BASE64_STANDARD
            .decode(data.get(LEGACY_SECRET_KEY_DATA_KEY).unwrap())
            .unwrap();
        assert_eq!(legacy.len(), 97);
        let material = KeyMaterial::from_x962(&legacy).unwrap();
        assert_eq!(material, key.primary().unwrap().key);
    }

    #[test]
    fn encode_refuses_empty_key() {
        assert_matches::assert_matches!(
            encode_secret_data("fake-secret", &Key::empty(), KeyEncoding::BatchSigning),
            Err(SecretStoreError::EmptyKey(_))
        );
    }

    #[test]
    fn decode_prefers_versioned_representation() {
        let key = test_key();
        let data = encode_secret_data("fake-secret", &key, KeyEncoding::BatchSigning).unwrap();
        let decoded = decode_secret_data("fake-secret", &data, KeyEncoding::BatchSigning).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn decode_falls_back_to_legacy_layout() {
        let material = KeyMaterial::generate().unwrap();
        let mut data = BTreeMap::new();
        data.insert(
            LEGACY_SECRET_KEY_DATA_KEY.to_owned(),
            BASE64_STANDARD
                .encode(material.to_pkcs8_der().unwrap())
                .into_bytes(),
        );

        let decoded = decode_secret_data("fake-secret", &data, KeyEncoding::BatchSigning).unwrap();
        assert_eq!(decoded.versions().len(), 1);
        let version = &decoded.versions()[0];
        assert_eq!(version.key, material);
        assert_eq!(version.creation_time, 0);
        assert!(version.primary);
        // A creation time of 0 yields the legacy, prefix-only kid
        assert_eq!(version.kid("fake-secret"), "fake-secret");
    }

    #[test]
    fn decode_rejects_empty_secret() {
        assert_matches::assert_matches!(
            decode_secret_data("fake-secret", &BTreeMap::new(), KeyEncoding::BatchSigning),
            Err(SecretStoreError::Malformed(_, _))
        );
    }
}
