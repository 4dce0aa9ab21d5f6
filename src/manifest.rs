use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt::Write};

use crate::{
    config::{Identity, StoragePath},
    keys::{public_key_from_csr_pem, public_key_from_pem, Key, KeyError},
};

/// The object key at which an ingestion server's global manifest is stored.
pub const GLOBAL_MANIFEST_KEY: &str = "global-manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to decode manifest from JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported manifest format {0}")]
    UnsupportedFormat(u32),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("manifest update validation failed: {0}")]
    Validation(String),
}

/// Represents the description of a batch signing public key in a manifest.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct BatchSigningPublicKey {
    /// The PEM-armored base64 encoding of the ASN.1 encoding of the PKIX
    /// SubjectPublicKeyInfo structure of an ECDSA P256 key.
    pub public_key: String,
    /// The ISO 8601 encoded UTC date at which this key expires.
    pub expiration: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PacketEncryptionCertificateSigningRequest {
    /// The PEM-armored base64 encoding of the ASN.1 encoding of a PKCS#10
    /// certificate signing request containing an ECDSA P256 key.
    pub certificate_signing_request: String,
}

pub type BatchSigningPublicKeys = BTreeMap<String, BatchSigningPublicKey>;
pub type PacketEncryptionCertificateSigningRequests =
    BTreeMap<String, PacketEncryptionCertificateSigningRequest>;

/// The parameters from which `SpecificManifest::update_keys` rewrites a
/// manifest's key maps.
#[derive(Clone, Debug)]
pub struct ManifestKeyUpdate<'a> {
    /// The rotated batch signing key whose versions the manifest should
    /// advertise.
    pub batch_signing_key: &'a Key,
    /// The kid prefix for batch signing key versions (the secret's name).
    pub batch_signing_kid_prefix: &'a str,
    /// The rotated packet encryption key whose primary version the manifest
    /// should advertise.
    pub packet_encryption_key: &'a Key,
    /// The kid prefix for packet encryption key versions.
    pub packet_encryption_kid_prefix: &'a str,
    /// The FQDN used as the common name in newly generated certificate
    /// signing requests.
    pub csr_fqdn: &'a str,
    /// The instant at which the update is evaluated, used for newly
    /// generated key expirations.
    pub now: DateTime<Utc>,
}

/// A data share processor specific manifest, used to exchange parameters
/// with peers at runtime. The key rotator is the writer of these documents;
/// the facilitator and peer data share processors are among the readers.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SpecificManifest {
    /// Format version of the manifest. Always 1 or 2.
    format: u32,
    /// URL of the ingestion bucket owned by this data share processor, which
    /// may be in the form "s3://{region}/{name}" or "gs://{name}".
    ingestion_bucket: StoragePath,
    /// The ARN of the AWS IAM role that should be assumed by an ingestion
    /// server to write to this data share processor's ingestion bucket, if
    /// the ingestor does not have an AWS account of their own. This will not
    /// be present if the data share processor's ingestion bucket is not in
    /// AWS S3.
    #[serde(default = "Identity::none", skip_serializing_if = "Identity::is_none")]
    ingestion_identity: Identity,
    /// URL of the validation bucket owned by this data share processor,
    /// which may be in the form "s3://{region}/{name}" or "gs://{name}".
    peer_validation_bucket: StoragePath,
    /// The ARN of the AWS IAM role that should be assumed by a peer data
    /// share processor to write to this data share processor's peer
    /// validation bucket. This will not be present if the peer validation
    /// bucket is not in AWS S3.
    #[serde(default = "Identity::none", skip_serializing_if = "Identity::is_none")]
    peer_validation_identity: Identity,
    /// Keys used by this data share processor to sign batches, by kid.
    batch_signing_public_keys: BatchSigningPublicKeys,
    /// Certificate signing requests containing public keys that should be
    /// used to encrypt ingestion share packets intended for this data share
    /// processor, by kid.
    packet_encryption_keys: PacketEncryptionCertificateSigningRequests,
}

impl SpecificManifest {
    /// Constructs a manifest with empty key maps, used the first time the
    /// key rotator runs for a data share processor that has no manifest yet.
    pub fn new(
        ingestion_bucket: StoragePath,
        ingestion_identity: Identity,
        peer_validation_bucket: StoragePath,
        peer_validation_identity: Identity,
    ) -> SpecificManifest {
        SpecificManifest {
            format: 1,
            ingestion_bucket,
            ingestion_identity,
            peer_validation_bucket,
            peer_validation_identity,
            batch_signing_public_keys: BTreeMap::new(),
            packet_encryption_keys: BTreeMap::new(),
        }
    }

    /// The object key at which the manifest for the provided data share
    /// processor is stored in the manifest bucket.
    pub fn manifest_key(data_share_processor_name: &str) -> String {
        format!("{data_share_processor_name}-manifest.json")
    }

    /// Loads the manifest from the provided bytes. Returns an error if the
    /// manifest could not be parsed.
    pub fn from_slice(json: &[u8]) -> Result<SpecificManifest, ManifestError> {
        let manifest: SpecificManifest = serde_json::from_slice(json)?;
        match manifest.format {
            1 | 2 => Ok(manifest),
            format => Err(ManifestError::UnsupportedFormat(format)),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn batch_signing_public_keys(&self) -> &BatchSigningPublicKeys {
        &self.batch_signing_public_keys
    }

    pub fn packet_encryption_keys(&self) -> &PacketEncryptionCertificateSigningRequests {
        &self.packet_encryption_keys
    }

    /// Checks that every key entry in the manifest is parseable: batch
    /// signing keys as PEM PKIX SubjectPublicKeyInfo, packet encryption
    /// entries as PEM PKCS#10 certificate signing requests.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_batch_signing_entries(&self.batch_signing_public_keys)?;
        for (kid, csr) in &self.packet_encryption_keys {
            public_key_from_csr_pem(&csr.certificate_signing_request).map_err(|e| {
                ManifestError::Validation(format!(
                    "packet encryption key {kid} has unparseable CSR: {e}"
                ))
            })?;
        }
        Ok(())
    }

    /// Returns a new manifest whose key maps advertise the provided rotated
    /// keys. The input manifest is not modified. The update is rejected if
    /// it would orphan key material that peers currently trust, or if key
    /// material disagrees between the manifest and the rotated keys.
    pub fn update_keys(
        &self,
        update: &ManifestKeyUpdate,
    ) -> Result<SpecificManifest, ManifestError> {
        // Pre-validation
        if update.batch_signing_key.is_empty() {
            return Err(ManifestError::Validation(
                "update's batch signing key has no versions".to_owned(),
            ));
        }
        if update.packet_encryption_key.is_empty() {
            return Err(ManifestError::Validation(
                "update's packet encryption key has no versions".to_owned(),
            ));
        }
        if !self.batch_signing_public_keys.is_empty() {
            // The primary signing key is what peers use right now to verify
            // our batches. If its kid is not already in the manifest, a
            // previous run failed to advertise it and promoting it would
            // orphan the key peers trust.
            let primary_kid = update
                .batch_signing_key
                .primary()
                .expect("non-empty key must have a primary version")
                .kid(update.batch_signing_kid_prefix);
            if !self.batch_signing_public_keys.contains_key(&primary_kid) {
                return Err(ManifestError::Validation(format!(
                    "update's batch signing key primary version not included in manifest \
                     (kid {primary_kid})"
                )));
            }
        }
        for kid in self.packet_encryption_keys.keys() {
            if update
                .packet_encryption_key
                .version_with_kid(update.packet_encryption_kid_prefix, kid)
                .is_none()
            {
                return Err(ManifestError::Validation(format!(
                    "manifest packet encryption key {kid} does not correspond to any version \
                     of the update's packet encryption key"
                )));
            }
        }

        // Cross-validation of the pre-existing state
        cross_validate(self, update)?;

        let manifest = SpecificManifest {
            batch_signing_public_keys: updated_batch_signing_keys(
                &self.batch_signing_public_keys,
                update.batch_signing_key,
                update.batch_signing_kid_prefix,
                update.now,
            )?,
            packet_encryption_keys: updated_packet_encryption_keys(
                &self.packet_encryption_keys,
                update.packet_encryption_key,
                update.packet_encryption_kid_prefix,
                update.csr_fqdn,
            )?,
            ..self.clone()
        };

        // Post-validation
        if manifest.batch_signing_public_keys.is_empty() {
            return Err(ManifestError::Validation(
                "updated manifest has no batch signing keys".to_owned(),
            ));
        }
        if manifest.packet_encryption_keys.len() != 1 {
            return Err(ManifestError::Validation(format!(
                "updated manifest must have exactly one packet encryption key, has {}",
                manifest.packet_encryption_keys.len()
            )));
        }
        if !self.scalar_fields_equal(&manifest) {
            return Err(ManifestError::Validation(
                "update changed a non-key manifest field".to_owned(),
            ));
        }
        for (kid, entry) in &self.batch_signing_public_keys {
            if let Some(updated) = manifest.batch_signing_public_keys.get(kid) {
                if updated != entry {
                    return Err(ManifestError::Validation(format!(
                        "update changed pre-existing batch signing key entry {kid}"
                    )));
                }
            }
        }
        for (kid, entry) in &self.packet_encryption_keys {
            if let Some(updated) = manifest.packet_encryption_keys.get(kid) {
                if updated != entry {
                    return Err(ManifestError::Validation(format!(
                        "update changed pre-existing packet encryption key entry {kid}"
                    )));
                }
            }
        }
        cross_validate(&manifest, update)?;

        Ok(manifest)
    }

    /// True if all fields other than the two key maps are equal.
    fn scalar_fields_equal(&self, other: &SpecificManifest) -> bool {
        self.format == other.format
            && self.ingestion_bucket == other.ingestion_bucket
            && self.ingestion_identity == other.ingestion_identity
            && self.peer_validation_bucket == other.peer_validation_bucket
            && self.peer_validation_identity == other.peer_validation_identity
    }

    /// A human-readable description of the differences between this manifest
    /// and `other`. Empty if and only if the manifests are equal.
    pub fn diff(&self, other: &SpecificManifest) -> String {
        let mut diff = String::new();
        diff_scalar(&mut diff, "format", &self.format, &other.format);
        diff_scalar(
            &mut diff,
            "ingestion-bucket",
            &self.ingestion_bucket,
            &other.ingestion_bucket,
        );
        diff_scalar(
            &mut diff,
            "ingestion-identity",
            &self.ingestion_identity,
            &other.ingestion_identity,
        );
        diff_scalar(
            &mut diff,
            "peer-validation-bucket",
            &self.peer_validation_bucket,
            &other.peer_validation_bucket,
        );
        diff_scalar(
            &mut diff,
            "peer-validation-identity",
            &self.peer_validation_identity,
            &other.peer_validation_identity,
        );
        diff_keys(
            &mut diff,
            "batch-signing-public-keys",
            &self.batch_signing_public_keys,
            &other.batch_signing_public_keys,
        );
        diff_keys(
            &mut diff,
            "packet-encryption-keys",
            &self.packet_encryption_keys,
            &other.packet_encryption_keys,
        );
        diff
    }
}

/// Represents the server-identity structure within an ingestion server
/// global manifest. One of aws_iam_entity or gcp_service_account_id should
/// be Some.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct IngestionServerIdentity {
    /// The ARN of the AWS IAM entity that this ingestion server uses to
    /// access ingestion buckets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_iam_entity: Option<String>,
    /// The numeric identifier of the GCP service account that this ingestion
    /// server uses to authenticate via OIDC identity federation to access
    /// ingestion buckets. While this field's value is a number, it is
    /// treated as an opaque string to avoid surprises like account IDs with
    /// leading 0s that would be discarded by integer conversion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gcp_service_account_id: Option<String>,
    /// The email address of the GCP service account that this ingestion
    /// server uses to authenticate to GCS to access ingestion buckets.
    pub gcp_service_account_email: String,
}

/// Represents an ingestion server's global manifest.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct IngestorGlobalManifest {
    /// Format version of the manifest. Versions besides the currently
    /// supported one are rejected.
    format: u32,
    /// The identity used by the ingestor to authenticate when writing to
    /// ingestion buckets.
    pub server_identity: IngestionServerIdentity,
    /// ECDSA P256 public keys used by the ingestor to sign ingestion
    /// batches, by kid.
    batch_signing_public_keys: BatchSigningPublicKeys,
}

impl IngestorGlobalManifest {
    pub fn new(server_identity: IngestionServerIdentity) -> IngestorGlobalManifest {
        IngestorGlobalManifest {
            format: 1,
            server_identity,
            batch_signing_public_keys: BTreeMap::new(),
        }
    }

    /// Loads the manifest from the provided bytes. Returns an error if the
    /// manifest could not be parsed.
    pub fn from_slice(json: &[u8]) -> Result<IngestorGlobalManifest, ManifestError> {
        let manifest: IngestorGlobalManifest = serde_json::from_slice(json)?;
        if manifest.format != 1 {
            return Err(ManifestError::UnsupportedFormat(manifest.format));
        }
        if manifest.server_identity.aws_iam_entity.is_some()
            && manifest.server_identity.gcp_service_account_id.is_some()
        {
            return Err(ManifestError::Validation(
                "at most one of aws-iam-entity, gcp-service-account-id may be set".to_owned(),
            ));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ManifestError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn batch_signing_public_keys(&self) -> &BatchSigningPublicKeys {
        &self.batch_signing_public_keys
    }

    /// Checks that every batch signing key entry is parseable.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_batch_signing_entries(&self.batch_signing_public_keys)
    }

    /// Returns a new manifest advertising the versions of the provided
    /// rotated batch signing key, with the same orphaning and cross
    /// validation rules as `SpecificManifest::update_keys`.
    pub fn update_batch_signing_keys(
        &self,
        key: &Key,
        kid_prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<IngestorGlobalManifest, ManifestError> {
        if key.is_empty() {
            return Err(ManifestError::Validation(
                "update's batch signing key has no versions".to_owned(),
            ));
        }
        if !self.batch_signing_public_keys.is_empty() {
            let primary_kid = key
                .primary()
                .expect("non-empty key must have a primary version")
                .kid(kid_prefix);
            if !self.batch_signing_public_keys.contains_key(&primary_kid) {
                return Err(ManifestError::Validation(format!(
                    "update's batch signing key primary version not included in manifest \
                     (kid {primary_kid})"
                )));
            }
        }
        cross_validate_batch_signing(&self.batch_signing_public_keys, key, kid_prefix)?;

        let manifest = IngestorGlobalManifest {
            batch_signing_public_keys: updated_batch_signing_keys(
                &self.batch_signing_public_keys,
                key,
                kid_prefix,
                now,
            )?,
            ..self.clone()
        };
        cross_validate_batch_signing(&manifest.batch_signing_public_keys, key, kid_prefix)?;
        Ok(manifest)
    }
}

/// New batch signing key entries expire far enough in the future that
/// expiration never interferes with the rotation policy, which is what
/// actually retires keys.
const KEY_EXPIRATION_YEARS: i64 = 100;

/// Rewrites a batch signing key map to contain one entry per version of the
/// rotated key. Entries for kids already present are kept verbatim,
/// preserving their expiration; new entries get a freshly encoded public key
/// and an expiration far in the future.
fn updated_batch_signing_keys(
    existing: &BatchSigningPublicKeys,
    key: &Key,
    kid_prefix: &str,
    now: DateTime<Utc>,
) -> Result<BatchSigningPublicKeys, ManifestError> {
    let expiration = (now + Duration::days(365 * KEY_EXPIRATION_YEARS))
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut keys = BTreeMap::new();
    for version in key.versions() {
        let kid = version.kid(kid_prefix);
        let entry = match existing.get(&kid) {
            Some(entry) => entry.clone(),
            None => BatchSigningPublicKey {
                public_key: version.key.public_key_pem()?,
                expiration: expiration.clone(),
            },
        };
        keys.insert(kid, entry);
    }
    Ok(keys)
}

/// Rewrites a packet encryption key map to contain exactly one entry, for
/// the rotated key's primary version. An already-present CSR for that kid is
/// kept verbatim; otherwise a new CSR is generated with the provided FQDN as
/// common name.
fn updated_packet_encryption_keys(
    existing: &PacketEncryptionCertificateSigningRequests,
    key: &Key,
    kid_prefix: &str,
    csr_fqdn: &str,
) -> Result<PacketEncryptionCertificateSigningRequests, ManifestError> {
    let primary = key.primary().ok_or_else(|| {
        ManifestError::Validation("packet encryption key has no primary version".to_owned())
    })?;
    let kid = primary.kid(kid_prefix);
    let entry = match existing.get(&kid) {
        Some(entry) => entry.clone(),
        None => PacketEncryptionCertificateSigningRequest {
            certificate_signing_request: primary.key.csr_pem(csr_fqdn)?,
        },
    };
    Ok(BTreeMap::from([(kid, entry)]))
}

/// Checks that, for every kid present both in the manifest's key maps and
/// among the rotated keys' versions, the public key material agrees.
fn cross_validate(
    manifest: &SpecificManifest,
    update: &ManifestKeyUpdate,
) -> Result<(), ManifestError> {
    cross_validate_batch_signing(
        &manifest.batch_signing_public_keys,
        update.batch_signing_key,
        update.batch_signing_kid_prefix,
    )?;
    for (kid, entry) in &manifest.packet_encryption_keys {
        let version = match update
            .packet_encryption_key
            .version_with_kid(update.packet_encryption_kid_prefix, kid)
        {
            Some(version) => version,
            None => continue,
        };
        let manifest_public_key = public_key_from_csr_pem(&entry.certificate_signing_request)
            .map_err(|e| {
                ManifestError::Validation(format!(
                    "packet encryption key {kid} has unparseable CSR: {e}"
                ))
            })?;
        if manifest_public_key != version.key.public_key() {
            return Err(ManifestError::Validation(format!(
                "packet encryption key {kid} in manifest does not match key version material"
            )));
        }
    }
    Ok(())
}

fn cross_validate_batch_signing(
    entries: &BatchSigningPublicKeys,
    key: &Key,
    kid_prefix: &str,
) -> Result<(), ManifestError> {
    for (kid, entry) in entries {
        let version = match key.version_with_kid(kid_prefix, kid) {
            Some(version) => version,
            None => continue,
        };
        let manifest_public_key = public_key_from_pem(&entry.public_key).map_err(|e| {
            ManifestError::Validation(format!(
                "batch signing key {kid} has unparseable public key: {e}"
            ))
        })?;
        if manifest_public_key != version.key.public_key() {
            return Err(ManifestError::Validation(format!(
                "batch signing key {kid} in manifest does not match key version material"
            )));
        }
    }
    Ok(())
}

fn validate_batch_signing_entries(entries: &BatchSigningPublicKeys) -> Result<(), ManifestError> {
    for (kid, entry) in entries {
        public_key_from_pem(&entry.public_key).map_err(|e| {
            ManifestError::Validation(format!(
                "batch signing key {kid} has unparseable public key: {e}"
            ))
        })?;
    }
    Ok(())
}

fn diff_scalar<T: std::fmt::Display + PartialEq>(diff: &mut String, field: &str, a: &T, b: &T) {
    if a != b {
        writeln!(diff, "{field}: {a} != {b}").unwrap();
    }
}

fn diff_keys<T: PartialEq>(
    diff: &mut String,
    field: &str,
    a: &BTreeMap<String, T>,
    b: &BTreeMap<String, T>,
) {
    for kid in a.keys() {
        match b.get(kid) {
            None => writeln!(diff, "{field}: {kid} removed").unwrap(),
            Some(entry) if entry != &a[kid] => writeln!(diff, "{field}: {kid} modified").unwrap(),
            Some(_) => {}
        }
    }
    for kid in b.keys() {
        if !a.contains_key(kid) {
            writeln!(diff, "{field}: {kid} added").unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyMaterial, KeyVersion};
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()
    }

    fn key_with_times(times: &[(i64, bool)]) -> Key {
        Key::from_versions(
            times
                .iter()
                .map(|(creation_time, primary)| KeyVersion {
                    key: KeyMaterial::generate().unwrap(),
                    creation_time: *creation_time,
                    primary: *primary,
                })
                .collect(),
        )
        .unwrap()
    }

    fn empty_manifest() -> SpecificManifest {
        SpecificManifest::new(
            StoragePath::from_str("gs://fake-ingestion").unwrap(),
            Identity::none(),
            StoragePath::from_str("s3://us-west-2/fake-peer-validation").unwrap(),
            Identity::from_str("arn:aws:iam::1234:role/fake-role").unwrap(),
        )
    }

    fn update<'a>(
        batch_signing_key: &'a Key,
        packet_encryption_key: &'a Key,
    ) -> ManifestKeyUpdate<'a> {
        ManifestKeyUpdate {
            batch_signing_key,
            batch_signing_kid_prefix: "fake-bsk",
            packet_encryption_key,
            packet_encryption_kid_prefix: "fake-pek",
            csr_fqdn: "us-ca.fake.example.com",
            now: now(),
        }
    }

    #[test]
    fn serde_roundtrip() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();

        let json = manifest.to_json().unwrap();
        let parsed = SpecificManifest::from_slice(&json).unwrap();
        assert_eq!(parsed, manifest);

        // Spot-check the wire format uses kebab-case keys
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert!(value.get("batch-signing-public-keys").is_some());
        assert!(value.get("peer-validation-bucket").is_some());
        // The ingestion identity is none and must be omitted entirely
        assert!(value.get("ingestion-identity").is_none());
    }

    #[test]
    fn rejects_unknown_format() {
        assert_matches!(
            SpecificManifest::from_slice(
                br#"
{
    "format": 3,
    "ingestion-bucket": "gs://ingestion",
    "peer-validation-bucket": "gs://peer-validation",
    "batch-signing-public-keys": {},
    "packet-encryption-keys": {}
}
"#
            ),
            Err(ManifestError::UnsupportedFormat(3))
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = br#"
{
    "format": 1,
    "ingestion-bucket": "gs://ingestion",
    "peer-validation-bucket": "gs://peer-validation",
    "batch-signing-public-keys": {},
    "packet-encryption-keys": {},
    "unexpected": "field"
}
"#;
        assert_matches!(SpecificManifest::from_slice(json), Err(ManifestError::Json(_)));
    }

    #[test]
    fn update_fresh_manifest() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);

        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();

        assert_eq!(
            manifest
                .batch_signing_public_keys()
                .keys()
                .collect::<Vec<_>>(),
            vec!["fake-bsk-100"]
        );
        assert_eq!(
            manifest.packet_encryption_keys().keys().collect::<Vec<_>>(),
            vec!["fake-pek-200"]
        );
        manifest.validate().unwrap();

        // The published material matches the keys
        let entry = &manifest.batch_signing_public_keys()["fake-bsk-100"];
        assert_eq!(
            public_key_from_pem(&entry.public_key).unwrap(),
            batch_signing_key.primary().unwrap().key.public_key()
        );
        let csr = &manifest.packet_encryption_keys()["fake-pek-200"];
        assert_eq!(
            public_key_from_csr_pem(&csr.certificate_signing_request).unwrap(),
            packet_encryption_key.primary().unwrap().key.public_key()
        );
    }

    #[test]
    fn update_is_idempotent_and_keeps_entries_verbatim() {
        let batch_signing_key = key_with_times(&[(300, false), (100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let update = update(&batch_signing_key, &packet_encryption_key);

        let once = empty_manifest().update_keys(&update).unwrap();
        let twice = once.update_keys(&update).unwrap();
        assert_eq!(once, twice);
        assert!(once.diff(&twice).is_empty());
    }

    #[test]
    fn update_refuses_to_orphan_signing_key() {
        // The manifest knows kid fake-bsk-100; the rotated key's primary is
        // a version the manifest has never seen
        let original_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&original_key, &packet_encryption_key))
            .unwrap();

        let unrelated_key = key_with_times(&[(500, true)]);
        let err = manifest
            .update_keys(&update(&unrelated_key, &packet_encryption_key))
            .unwrap_err();
        assert_matches!(err, ManifestError::Validation(message) => {
            assert!(
                message.contains("batch signing key primary version not included in manifest"),
                "unexpected message {message}"
            );
        });
    }

    #[test]
    fn update_refuses_unknown_packet_encryption_kid() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();

        // A packet encryption key that has no version for the manifest's kid
        let replacement = key_with_times(&[(900, true)]);
        let err = manifest
            .update_keys(&update(&batch_signing_key, &replacement))
            .unwrap_err();
        assert_matches!(err, ManifestError::Validation(message) => {
            assert!(
                message.contains("does not correspond to any version"),
                "unexpected message {message}"
            );
        });
    }

    #[test]
    fn update_detects_key_material_mismatch() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();

        // Same kid (same creation time and prefix), different material
        let impostor = key_with_times(&[(100, true)]);
        let err = manifest
            .update_keys(&update(&impostor, &packet_encryption_key))
            .unwrap_err();
        assert_matches!(err, ManifestError::Validation(message) => {
            assert!(
                message.contains("does not match key version material"),
                "unexpected message {message}"
            );
        });
    }

    #[test]
    fn update_rotates_forward() {
        // Steady-state rotation: a new version is created and advertised,
        // then promoted on a later run once peers have seen it
        let original = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&original, &packet_encryption_key))
            .unwrap();

        let mut versions = original.versions().to_vec();
        versions.push(KeyVersion {
            key: KeyMaterial::generate().unwrap(),
            creation_time: 900,
            primary: false,
        });
        let extended = Key::from_versions(versions).unwrap();
        let manifest = manifest
            .update_keys(&update(&extended, &packet_encryption_key))
            .unwrap();
        assert_eq!(
            manifest
                .batch_signing_public_keys()
                .keys()
                .collect::<Vec<_>>(),
            vec!["fake-bsk-100", "fake-bsk-900"]
        );

        // Promote 900: its kid is in the manifest now, so the update passes
        let mut versions = extended.versions().to_vec();
        for version in versions.iter_mut() {
            version.primary = version.creation_time == 900;
        }
        let promoted = Key::from_versions(versions).unwrap();
        let manifest = manifest
            .update_keys(&update(&promoted, &packet_encryption_key))
            .unwrap();
        assert!(manifest
            .batch_signing_public_keys()
            .contains_key("fake-bsk-900"));
    }

    #[test]
    fn legacy_kid_for_creation_time_zero() {
        let batch_signing_key = key_with_times(&[(0, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();
        // A version with creation time 0 keeps the bare prefix as its kid
        assert!(manifest.batch_signing_public_keys().contains_key("fake-bsk"));
    }

    #[test]
    fn new_entry_expiration_is_far_future() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let manifest = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();
        let expiration = &manifest.batch_signing_public_keys()["fake-bsk-100"].expiration;
        let parsed = DateTime::parse_from_rfc3339(expiration).unwrap();
        assert!(parsed.with_timezone(&Utc) > now() + Duration::days(364 * 100));
    }

    #[test]
    fn diff_reports_changes() {
        let batch_signing_key = key_with_times(&[(100, true)]);
        let packet_encryption_key = key_with_times(&[(200, true)]);
        let a = empty_manifest()
            .update_keys(&update(&batch_signing_key, &packet_encryption_key))
            .unwrap();

        let extended = Key::from_versions(
            batch_signing_key
                .versions()
                .iter()
                .cloned()
                .chain(std::iter::once(KeyVersion {
                    key: KeyMaterial::generate().unwrap(),
                    creation_time: 900,
                    primary: false,
                }))
                .collect(),
        )
        .unwrap();
        let b = a
            .update_keys(&update(&extended, &packet_encryption_key))
            .unwrap();

        let diff = a.diff(&b);
        assert!(diff.contains("fake-bsk-900 added"), "diff was: {diff}");
        assert!(b.diff(&a).contains("fake-bsk-900 removed"));
        assert!(a.diff(&a).is_empty());
    }

    #[test]
    fn global_manifest_roundtrip_and_update() {
        let manifest = IngestorGlobalManifest::new(IngestionServerIdentity {
            aws_iam_entity: None,
            gcp_service_account_id: Some("112310747466759665351".to_owned()),
            gcp_service_account_email: "foo@bar.com".to_owned(),
        });

        let key = key_with_times(&[(100, true)]);
        let manifest = manifest
            .update_batch_signing_keys(&key, "fake-ingestor-key", now())
            .unwrap();
        assert!(manifest
            .batch_signing_public_keys()
            .contains_key("fake-ingestor-key-100"));
        manifest.validate().unwrap();

        let json = manifest.to_json().unwrap();
        let parsed = IngestorGlobalManifest::from_slice(&json).unwrap();
        assert_eq!(parsed, manifest);

        // Orphaning refusal applies to the global manifest too
        let unrelated = key_with_times(&[(500, true)]);
        assert_matches!(
            manifest.update_batch_signing_keys(&unrelated, "fake-ingestor-key", now()),
            Err(ManifestError::Validation(_))
        );
    }

    #[test]
    fn global_manifest_rejects_two_identities() {
        let json = br#"
{
    "format": 1,
    "server-identity": {
        "aws-iam-entity": "arn:aws:iam::338276578713:role/ingestor-1-role",
        "gcp-service-account-id": "12345678901234567890",
        "gcp-service-account-email": "foo@bar.com"
    },
    "batch-signing-public-keys": {}
}
"#;
        assert_matches!(
            IngestorGlobalManifest::from_slice(json),
            Err(ManifestError::Validation(_))
        );
    }
}
