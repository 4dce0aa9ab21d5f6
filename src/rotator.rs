use chrono::{DateTime, Utc};
use slog::{info, o, Logger};
use std::str::FromStr;

use crate::{
    config::{Identity, StoragePath},
    keys::{rotate, Key, KeyError, RotationConfig},
    logging::event,
    manifest::{ManifestError, ManifestKeyUpdate, SpecificManifest},
    metrics::KeyRotatorMetrics,
    secrets::{
        batch_signing_key_name, packet_encryption_key_name, SecretStore, SecretStoreError,
    },
    storage::{Bucket, StorageError},
    work_queue::fan_out,
    ErrorClassification,
};

#[derive(Debug, thiserror::Error)]
pub enum RotatorError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    SecretStore(#[from] SecretStoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("bad manifest template: {0}")]
    Template(String),
}

impl ErrorClassification for RotatorError {
    fn is_retryable(&self) -> bool {
        match self {
            RotatorError::Storage(e) => e.is_retryable(),
            RotatorError::SecretStore(e) => e.is_retryable(),
            // Rotation and manifest validation failures are deterministic:
            // the run will keep failing until an operator intervenes.
            RotatorError::Key(_) | RotatorError::Manifest(_) | RotatorError::Template(_) => false,
        }
    }
}

/// Describes the manifest to synthesize for a data share processor that has
/// none yet. The bucket templates may contain `{locality}` and `{ingestor}`
/// placeholders.
#[derive(Clone, Debug)]
pub struct ManifestTemplate {
    pub ingestion_bucket: String,
    pub ingestion_identity: Identity,
    pub peer_validation_bucket: String,
    pub peer_validation_identity: Identity,
}

impl ManifestTemplate {
    fn render(&self, locality: &str, ingestor: &str) -> Result<SpecificManifest, RotatorError> {
        let expand = |template: &str| {
            template
                .replace("{locality}", locality)
                .replace("{ingestor}", ingestor)
        };
        let parse = |rendered: String| {
            StoragePath::from_str(&rendered)
                .map_err(|e| RotatorError::Template(format!("bad bucket URL {rendered}: {e}")))
        };
        Ok(SpecificManifest::new(
            parse(expand(&self.ingestion_bucket))?,
            self.ingestion_identity.clone(),
            parse(expand(&self.peer_validation_bucket))?,
            self.peer_validation_identity.clone(),
        ))
    }
}

/// What a rotator run did, for logging and metrics.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    pub keys_written: usize,
    pub manifests_written: usize,
}

/// One key rotator sweep over a locality: loads the locality's packet
/// encryption key and, per ingestor, its batch signing key and manifest;
/// rotates every key per its policy; rewrites the manifests to advertise the
/// rotated keys; then persists keys before manifests, so the private portion
/// of any advertised key is durable before peers can learn of it.
pub struct KeyRotator {
    environment: String,
    locality: String,
    ingestors: Vec<String>,
    csr_fqdn: String,
    secret_store: Box<dyn SecretStore>,
    manifest_bucket: Bucket,
    batch_signing_config: RotationConfig,
    packet_encryption_config: RotationConfig,
    manifest_template: ManifestTemplate,
    dry_run: bool,
    metrics: KeyRotatorMetrics,
    logger: Logger,
}

/// The per-ingestor state loaded at the start of a run.
struct LoadedIngestor {
    ingestor: String,
    batch_signing_key: Key,
    /// None if the data share processor has no manifest yet.
    manifest: Option<SpecificManifest>,
}

/// The per-ingestor state after rotation and manifest update.
struct RotatedIngestor {
    ingestor: String,
    batch_signing_key: Key,
    batch_signing_key_changed: bool,
    manifest: SpecificManifest,
    manifest_changed: bool,
}

impl KeyRotator {
    pub fn new(
        environment: &str,
        locality: &str,
        ingestors: Vec<String>,
        csr_fqdn: &str,
        secret_store: Box<dyn SecretStore>,
        manifest_bucket: Bucket,
        batch_signing_config: RotationConfig,
        packet_encryption_config: RotationConfig,
        manifest_template: ManifestTemplate,
        dry_run: bool,
        metrics: KeyRotatorMetrics,
        parent_logger: &Logger,
    ) -> KeyRotator {
        KeyRotator {
            environment: environment.to_owned(),
            locality: locality.to_owned(),
            ingestors,
            csr_fqdn: csr_fqdn.to_owned(),
            secret_store,
            manifest_bucket,
            batch_signing_config,
            packet_encryption_config,
            manifest_template,
            dry_run,
            metrics,
            logger: parent_logger.new(o!(
                event::LOCALITY => locality.to_owned(),
            )),
        }
    }

    /// The name under which a data share processor's manifest is stored:
    /// one data share processor exists per (locality, ingestor) pair.
    fn data_share_processor_name(&self, ingestor: &str) -> String {
        format!("{}-{}", self.locality, ingestor)
    }

    /// Performs one rotation sweep at the provided instant. Any validation
    /// failure aborts the run before anything is written.
    pub fn run(&self, now: DateTime<Utc>) -> Result<RunSummary, RotatorError> {
        // Load. The packet encryption key and every ingestor's state fan
        // out concurrently; the first error aborts.
        let (packet_encryption_key, loaded) = self.load_locality()?;

        // Rotate. Rotation is pure; nothing is persisted yet.
        let rotated_packet_encryption_key =
            rotate(&packet_encryption_key, now, &self.packet_encryption_config)?;
        let packet_encryption_key_changed =
            rotated_packet_encryption_key != packet_encryption_key;

        // Update manifests. All validation happens here, before any write.
        let mut rotated = Vec::with_capacity(loaded.len());
        for ingestor in loaded {
            rotated.push(self.update_ingestor(
                ingestor,
                &rotated_packet_encryption_key,
                now,
            )?);
        }

        // Persist keys first, manifests second: a manifest must never
        // advertise a public key whose private portion is not durable.
        let mut summary = RunSummary::default();
        summary.keys_written += self.write_keys(
            &rotated,
            &rotated_packet_encryption_key,
            packet_encryption_key_changed,
        )?;
        summary.manifests_written += self.write_manifests(&rotated)?;

        self.metrics.keys_written.set(summary.keys_written as i64);
        self.metrics
            .manifests_written
            .set(summary.manifests_written as i64);

        info!(
            self.logger, "rotation complete";
            "keys_written" => summary.keys_written,
            "manifests_written" => summary.manifests_written,
            "dry_run" => self.dry_run,
        );
        Ok(summary)
    }

    /// Loads everything one rotation sweep needs in a single concurrent
    /// batch: the locality's packet encryption key alongside each
    /// ingestor's batch signing key and manifest.
    fn load_locality(&self) -> Result<(Key, Vec<LoadedIngestor>), RotatorError> {
        enum LoadJob {
            PacketEncryptionKey,
            Ingestor(String),
        }
        enum LoadResult {
            PacketEncryptionKey(Key),
            Ingestor(LoadedIngestor),
        }

        let mut jobs = vec![LoadJob::PacketEncryptionKey];
        jobs.extend(self.ingestors.iter().cloned().map(LoadJob::Ingestor));
        let job_count = jobs.len();

        let results = fan_out(jobs, job_count, |job| -> Result<LoadResult, RotatorError> {
            match job {
                LoadJob::PacketEncryptionKey => Ok(LoadResult::PacketEncryptionKey(
                    self.secret_store.get_packet_encryption_key(&self.locality)?,
                )),
                LoadJob::Ingestor(ingestor) => {
                    Ok(LoadResult::Ingestor(self.load_ingestor(ingestor)?))
                }
            }
        });

        let mut packet_encryption_key = None;
        let mut loaded = Vec::with_capacity(self.ingestors.len());
        for result in results {
            match result? {
                LoadResult::PacketEncryptionKey(key) => packet_encryption_key = Some(key),
                LoadResult::Ingestor(ingestor) => loaded.push(ingestor),
            }
        }
        // fan_out returns results in completion order; keep runs
        // deterministic regardless.
        loaded.sort_by(|a, b| a.ingestor.cmp(&b.ingestor));

        let packet_encryption_key = packet_encryption_key
            .expect("load results must include the packet encryption key");
        Ok((packet_encryption_key, loaded))
    }

    fn load_ingestor(&self, ingestor: String) -> Result<LoadedIngestor, RotatorError> {
        let batch_signing_key = self
            .secret_store
            .get_batch_signing_key(&self.locality, &ingestor)?;

        let manifest_key =
            SpecificManifest::manifest_key(&self.data_share_processor_name(&ingestor));
        let manifest = match self.manifest_bucket.get_manifest(&manifest_key) {
            Ok(json) => Some(SpecificManifest::from_slice(&json)?),
            // A missing manifest is the fresh-environment case; a malformed
            // one is a hard stop and must never be overwritten.
            Err(StorageError::ObjectNotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        Ok(LoadedIngestor {
            ingestor,
            batch_signing_key,
            manifest,
        })
    }

    fn update_ingestor(
        &self,
        loaded: LoadedIngestor,
        rotated_packet_encryption_key: &Key,
        now: DateTime<Utc>,
    ) -> Result<RotatedIngestor, RotatorError> {
        let logger = self.logger.new(o!(
            event::INGESTOR => loaded.ingestor.clone(),
        ));

        let rotated_key = rotate(&loaded.batch_signing_key, now, &self.batch_signing_config)?;
        let batch_signing_key_changed = rotated_key != loaded.batch_signing_key;

        let current_manifest = match &loaded.manifest {
            Some(manifest) => manifest.clone(),
            None => {
                info!(logger, "no manifest yet, creating one");
                self.manifest_template
                    .render(&self.locality, &loaded.ingestor)?
            }
        };

        let updated_manifest = current_manifest.update_keys(&ManifestKeyUpdate {
            batch_signing_key: &rotated_key,
            batch_signing_kid_prefix: &batch_signing_key_name(
                &self.environment,
                &self.locality,
                &loaded.ingestor,
            ),
            packet_encryption_key: rotated_packet_encryption_key,
            packet_encryption_kid_prefix: &packet_encryption_key_name(
                &self.environment,
                &self.locality,
            ),
            csr_fqdn: &self.csr_fqdn,
            now,
        })?;

        let manifest_changed = loaded.manifest.as_ref() != Some(&updated_manifest);
        if manifest_changed {
            if let Some(previous) = &loaded.manifest {
                info!(
                    logger, "manifest changed";
                    "diff" => previous.diff(&updated_manifest),
                );
            }
        }

        Ok(RotatedIngestor {
            ingestor: loaded.ingestor,
            batch_signing_key: rotated_key,
            batch_signing_key_changed,
            manifest: updated_manifest,
            manifest_changed,
        })
    }

    /// Writes every changed key to the secret store, concurrently. Keys
    /// whose rotation was a no-op are not rewritten.
    fn write_keys(
        &self,
        rotated: &[RotatedIngestor],
        packet_encryption_key: &Key,
        packet_encryption_key_changed: bool,
    ) -> Result<usize, RotatorError> {
        enum KeyWrite<'a> {
            BatchSigning { ingestor: &'a str, key: &'a Key },
            PacketEncryption { key: &'a Key },
        }

        let mut writes = Vec::new();
        if packet_encryption_key_changed {
            writes.push(KeyWrite::PacketEncryption {
                key: packet_encryption_key,
            });
        }
        for ingestor in rotated {
            if ingestor.batch_signing_key_changed {
                writes.push(KeyWrite::BatchSigning {
                    ingestor: &ingestor.ingestor,
                    key: &ingestor.batch_signing_key,
                });
            }
        }
        let write_count = writes.len();

        if self.dry_run {
            info!(
                self.logger, "dry run: skipping key writes";
                "count" => write_count,
            );
            return Ok(write_count);
        }

        let results = fan_out(writes, write_count, |write| match write {
            KeyWrite::BatchSigning { ingestor, key } => {
                info!(
                    self.logger, "writing batch signing key";
                    event::INGESTOR => ingestor,
                    event::SECRET_NAME =>
                        batch_signing_key_name(&self.environment, &self.locality, ingestor),
                );
                self.secret_store
                    .put_batch_signing_key(&self.locality, ingestor, key)
            }
            KeyWrite::PacketEncryption { key } => {
                info!(
                    self.logger, "writing packet encryption key";
                    event::SECRET_NAME =>
                        packet_encryption_key_name(&self.environment, &self.locality),
                );
                self.secret_store
                    .put_packet_encryption_key(&self.locality, key)
            }
        });
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(write_count)
    }

    /// Writes every changed manifest, concurrently. Must only be called
    /// after every key write has succeeded.
    fn write_manifests(&self, rotated: &[RotatedIngestor]) -> Result<usize, RotatorError> {
        let writes: Vec<&RotatedIngestor> = rotated
            .iter()
            .filter(|ingestor| ingestor.manifest_changed)
            .collect();
        let write_count = writes.len();

        if self.dry_run {
            info!(
                self.logger, "dry run: skipping manifest writes";
                "count" => write_count,
            );
            return Ok(write_count);
        }

        let results = fan_out(writes, write_count, |ingestor| -> Result<(), RotatorError> {
            let manifest_key =
                SpecificManifest::manifest_key(&self.data_share_processor_name(&ingestor.ingestor));
            info!(
                self.logger, "writing manifest";
                event::INGESTOR => &ingestor.ingestor,
                event::STORAGE_KEY => &manifest_key,
            );
            self.manifest_bucket
                .put_manifest(&manifest_key, &ingestor.manifest.to_json()?)?;
            Ok(())
        });
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(write_count)
    }
}
