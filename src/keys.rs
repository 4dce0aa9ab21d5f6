use base64::{prelude::BASE64_STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use p256::{
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use pkix::{
    pem::{pem_to_der, PEM_CERTIFICATE_REQUEST},
    pkcs10::DerCertificationRequest,
    FromDer,
};
use rand::rngs::OsRng;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("PKCS#8 error: {0}")]
    Pkcs8(#[from] p256::pkcs8::Error),
    #[error("SPKI error: {0}")]
    Spki(#[from] p256::pkcs8::spki::Error),
    #[error("elliptic curve error: {0}")]
    EllipticCurve(#[from] p256::elliptic_curve::Error),
    #[error("CSR generation error: {0}")]
    Rcgen(#[from] rcgen::RcgenError),
    #[error("failed to parse CSR: {0}")]
    CsrParse(String),
    #[error("X9.62 encoding must be {X962_LENGTH} bytes, got {0}")]
    X962Length(usize),
    #[error("failed to decode base64 key material: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid key: {0}")]
    Validation(String),
}

// An X9.62 encoded key is the uncompressed SEC 1 public point (1 byte of tag
// plus two 32 byte coordinates) followed by the 32 byte secret scalar. This
// is the representation the downstream cryptographic workers consume.
const X962_LENGTH: usize = 97;
const X962_POINT_LENGTH: usize = 65;

/// An ECDSA P-256 private key and the serializations of it and of its public
/// portion that this application deals in.
#[derive(Clone)]
pub struct KeyMaterial(SecretKey);

impl KeyMaterial {
    /// Generates a fresh random key.
    pub fn generate() -> Result<KeyMaterial, KeyError> {
        Ok(KeyMaterial(SecretKey::random(&mut OsRng)))
    }

    pub fn from_pkcs8_der(der: &[u8]) -> Result<KeyMaterial, KeyError> {
        Ok(KeyMaterial(SecretKey::from_pkcs8_der(der)?))
    }

    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, KeyError> {
        Ok(self.0.to_pkcs8_der()?.as_bytes().to_vec())
    }

    /// The public portion of the key as a PEM armored PKIX
    /// SubjectPublicKeyInfo structure, as published in manifests.
    pub fn public_key_pem(&self) -> Result<String, KeyError> {
        Ok(self.0.public_key().to_public_key_pem(LineEnding::LF)?)
    }

    pub fn public_key(&self) -> PublicKey {
        self.0.public_key()
    }

    /// The X9.62 concatenation of the uncompressed public point and the
    /// secret scalar.
    pub fn to_x962(&self) -> Vec<u8> {
        let mut encoded = self
            .0
            .public_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        encoded.extend_from_slice(&self.0.to_be_bytes());
        encoded
    }

    pub fn from_x962(encoded: &[u8]) -> Result<KeyMaterial, KeyError> {
        if encoded.len() != X962_LENGTH {
            return Err(KeyError::X962Length(encoded.len()));
        }
        let secret = SecretKey::from_be_bytes(&encoded[X962_POINT_LENGTH..])?;
        Ok(KeyMaterial(secret))
    }

    /// A PEM armored PKCS#10 certificate signing request over the key,
    /// signed with ECDSA-with-SHA256, with the provided FQDN as the subject
    /// common name.
    pub fn csr_pem(&self, fqdn: &str) -> Result<String, KeyError> {
        let key_pair = KeyPair::from_der(&self.to_pkcs8_der()?)?;
        let mut params = CertificateParams::new(Vec::<String>::new());
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        params.key_pair = Some(key_pair);
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, fqdn);
        params.distinguished_name = distinguished_name;

        Ok(Certificate::from_params(params)?.serialize_request_pem()?)
    }

    pub fn public_key_equal(&self, other: &KeyMaterial) -> bool {
        self.0.public_key() == other.0.public_key()
    }
}

// The secret scalar must not leak into logs.
impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyMaterial({:?})", self.0.public_key())
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_be_bytes() == other.0.to_be_bytes()
    }
}

impl Eq for KeyMaterial {}

/// Parses a PEM armored PKIX SubjectPublicKeyInfo structure containing an
/// ECDSA P-256 public key, as found in manifest batch signing key entries.
pub fn public_key_from_pem(pem: &str) -> Result<PublicKey, KeyError> {
    Ok(PublicKey::from_public_key_pem(pem)?)
}

/// Extracts the public key from a PEM armored PKCS#10 certificate signing
/// request, as found in manifest packet encryption key entries.
pub fn public_key_from_csr_pem(csr_pem: &str) -> Result<PublicKey, KeyError> {
    let der = pem_to_der(csr_pem, Some(PEM_CERTIFICATE_REQUEST))
        .ok_or_else(|| KeyError::CsrParse("not a PEM certificate request".to_owned()))?;
    let csr = DerCertificationRequest::from_der(&der)
        .map_err(|e| KeyError::CsrParse(format!("failed to decode CSR: {e:?}")))?;
    Ok(PublicKey::from_public_key_der(&csr.reqinfo.spki.value)?)
}

/// The kid under which a key version created at `creation_time` appears in a
/// manifest. Versions with creation time 0 predate versioned keys and use
/// the bare prefix as their kid.
pub fn kid(prefix: &str, creation_time: i64) -> String {
    if creation_time == 0 {
        prefix.to_owned()
    } else {
        format!("{prefix}-{creation_time}")
    }
}

/// One version of a key: its material, when it was created (seconds since
/// the Unix epoch) and whether it is the version currently in use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyVersion {
    pub key: KeyMaterial,
    pub creation_time: i64,
    pub primary: bool,
}

impl KeyVersion {
    /// The age of this version at `now`.
    fn age_at(&self, now: DateTime<Utc>) -> Duration {
        Duration::seconds(now.timestamp() - self.creation_time)
    }

    /// The kid under which this version appears in a manifest.
    pub fn kid(&self, prefix: &str) -> String {
        kid(prefix, self.creation_time)
    }
}

/// The JSON representation of a key version in secret storage.
#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct KeyVersionRecord {
    /// Base64 encoding of the PKCS#8 encoded private key.
    key: String,
    /// Seconds since the Unix epoch.
    creation_time: i64,
    primary: bool,
}

/// A versioned key: an ordered collection of key versions, newest first.
/// An empty Key represents a secret that does not exist yet; a non-empty Key
/// has exactly one primary version and distinct creation timestamps.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Key {
    versions: Vec<KeyVersion>,
}

impl Key {
    pub fn empty() -> Key {
        Key {
            versions: Vec::new(),
        }
    }

    /// Constructs a Key from the provided versions, sorting them newest
    /// first and validating the Key's invariants.
    pub fn from_versions(mut versions: Vec<KeyVersion>) -> Result<Key, KeyError> {
        versions.sort_by_key(|version| std::cmp::Reverse(version.creation_time));
        let key = Key { versions };
        key.validate()?;
        Ok(key)
    }

    fn validate(&self) -> Result<(), KeyError> {
        let primary_count = self.versions.iter().filter(|v| v.primary).count();
        if !self.versions.is_empty() && primary_count != 1 {
            return Err(KeyError::Validation(format!(
                "key must have exactly one primary version, has {primary_count}"
            )));
        }
        for window in self.versions.windows(2) {
            if window[0].creation_time == window[1].creation_time {
                return Err(KeyError::Validation(format!(
                    "duplicate version creation time {}",
                    window[0].creation_time
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// The versions of this key, newest first.
    pub fn versions(&self) -> &[KeyVersion] {
        &self.versions
    }

    pub fn primary(&self) -> Option<&KeyVersion> {
        self.versions.iter().find(|version| version.primary)
    }

    /// The version whose kid (derived with `prefix`) is `kid`, if any.
    pub fn version_with_kid(&self, prefix: &str, kid: &str) -> Option<&KeyVersion> {
        self.versions
            .iter()
            .find(|version| version.kid(prefix) == kid)
    }

    /// Serializes the key for secret storage as a JSON array of versions.
    pub fn to_json(&self) -> Result<Vec<u8>, KeyError> {
        let records = self
            .versions
            .iter()
            .map(|version| {
                Ok(KeyVersionRecord {
                    key: BASE64_STANDARD.encode(version.key.to_pkcs8_der()?),
                    creation_time: version.creation_time,
                    primary: version.primary,
                })
            })
            .collect::<Result<Vec<_>, KeyError>>()?;
        Ok(serde_json::to_vec(&records)?)
    }

    pub fn from_json(json: &[u8]) -> Result<Key, KeyError> {
        let records: Vec<KeyVersionRecord> = serde_json::from_slice(json)?;
        let versions = records
            .into_iter()
            .map(|record| {
                Ok(KeyVersion {
                    key: KeyMaterial::from_pkcs8_der(&BASE64_STANDARD.decode(record.key)?)?,
                    creation_time: record.creation_time,
                    primary: record.primary,
                })
            })
            .collect::<Result<Vec<_>, KeyError>>()?;
        Key::from_versions(versions)
    }
}

/// Policy governing when key versions are created, promoted to primary and
/// retired.
#[derive(Clone, Copy, Debug)]
pub struct RotationConfig {
    /// A new version is created when the newest version is older than this.
    pub create_min_age: Duration,
    /// A version must be at least this old before it may become primary,
    /// leaving time for its public portion to propagate to peers via
    /// manifests before it is used.
    pub primary_min_age: Duration,
    /// A version must be at least this old before it may be retired.
    pub delete_min_age: Duration,
    /// At least this many versions are kept, regardless of age.
    pub delete_min_count: usize,
    /// Source of fresh key material. Tests may substitute a deterministic
    /// generator.
    pub new_key: fn() -> Result<KeyMaterial, KeyError>,
}

impl RotationConfig {
    pub fn new(
        create_min_age: Duration,
        primary_min_age: Duration,
        delete_min_age: Duration,
        delete_min_count: usize,
    ) -> RotationConfig {
        RotationConfig {
            create_min_age,
            primary_min_age,
            delete_min_age,
            delete_min_count,
            new_key: KeyMaterial::generate,
        }
    }
}

/// Rewrites a key per the provided rotation policy, evaluated at `now`:
///
///   - a new non-primary version is minted if the key is empty or its newest
///     version is older than `create_min_age`;
///   - the newest version at least `primary_min_age` old becomes primary; if
///     no version qualifies, the existing primary is kept, or the oldest
///     version is promoted when the key had no primary;
///   - the oldest non-primary version is dropped, repeatedly, while it is at
///     least `delete_min_age` old and at least `delete_min_count` versions
///     would remain.
///
/// Rotation is pure and idempotent: rotating the result again at the same
/// `now` returns an equal key.
pub fn rotate(key: &Key, now: DateTime<Utc>, config: &RotationConfig) -> Result<Key, KeyError> {
    let mut versions = key.versions().to_vec();

    // Create
    let needs_new_version = match versions.first() {
        None => true,
        Some(newest) => newest.age_at(now) > config.create_min_age,
    };
    if needs_new_version {
        versions.insert(
            0,
            KeyVersion {
                key: (config.new_key)()?,
                creation_time: now.timestamp(),
                primary: false,
            },
        );
    }

    // Promote
    let primary_index = versions
        .iter()
        .position(|version| version.age_at(now) >= config.primary_min_age)
        .or_else(|| versions.iter().position(|version| version.primary))
        .unwrap_or(versions.len() - 1);
    for (index, version) in versions.iter_mut().enumerate() {
        version.primary = index == primary_index;
    }

    // Retire
    while let Some(oldest_non_primary) = versions.iter().rposition(|version| !version.primary) {
        let retirable = versions[oldest_non_primary].age_at(now) >= config.delete_min_age
            && versions.len() - 1 >= config.delete_min_count;
        if !retirable {
            break;
        }
        versions.remove(oldest_non_primary);
    }

    Key::from_versions(versions)
}
