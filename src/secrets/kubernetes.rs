use anyhow::{anyhow, Context};
use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString};
use kube::{
    api::{Api, PatchParams, PostParams},
    Client,
};
use slog::{debug, o, Logger};
use std::collections::BTreeMap;
use tokio::runtime::Runtime;

use crate::{
    keys::Key,
    logging::event,
    secrets::{
        batch_signing_key_name, decode_secret_data, encode_secret_data,
        packet_encryption_key_name, KeyEncoding, SecretStore, SecretStoreError,
    },
};

/// A secret store backed by Kubernetes secrets in a single namespace,
/// authenticating with the ambient service account (or local kubeconfig
/// during development).
#[derive(Clone, Debug)]
pub struct KubernetesSecretStore {
    environment: String,
    namespace: String,
    logger: Logger,
}

impl KubernetesSecretStore {
    pub fn new(environment: &str, namespace: &str, parent_logger: &Logger) -> KubernetesSecretStore {
        KubernetesSecretStore {
            environment: environment.to_owned(),
            namespace: namespace.to_owned(),
            logger: parent_logger.new(o!(
                "namespace" => namespace.to_owned(),
            )),
        }
    }

    fn read_secret(
        &self,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, SecretStoreError> {
        let runtime = runtime()?;
        runtime
            .block_on(async {
                let secrets = self.secrets_api().await?;
                match secrets.get(name).await {
                    Ok(secret) => Ok(Some(
                        secret
                            .data
                            .unwrap_or_default()
                            .into_iter()
                            .map(|(key, ByteString(value))| (key, value))
                            .collect(),
                    )),
                    Err(kube::Error::Api(response)) if response.code == 404 => Ok(None),
                    Err(e) => Err(anyhow!("failed to get secret {name}: {e}")),
                }
            })
            .map_err(SecretStoreError::Kubernetes)
    }

    fn write_secret(
        &self,
        name: &str,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), SecretStoreError> {
        let data: BTreeMap<String, ByteString> = data
            .into_iter()
            .map(|(key, value)| (key, ByteString(value)))
            .collect();

        let runtime = runtime()?;
        runtime
            .block_on(async {
                let secrets = self.secrets_api().await?;
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.to_owned()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data.clone()),
                    ..Default::default()
                };

                match secrets.create(&PostParams::default(), &secret).await {
                    Ok(_) => return Ok(()),
                    // The secret already exists, which is the common case:
                    // fall through and update it in place.
                    Err(kube::Error::Api(response)) if response.code == 409 => {
                        debug!(
                            self.logger, "secret exists, updating in place";
                            event::SECRET_NAME => name,
                        );
                    }
                    Err(e) => return Err(anyhow!("failed to create secret {name}: {e}")),
                }

                let patch = kube::api::Patch::Merge(serde_json::json!({ "data": data }));
                secrets
                    .patch(name, &PatchParams::default(), &patch)
                    .await
                    .map_err(|e| anyhow!("failed to patch secret {name}: {e}"))?;
                Ok(())
            })
            .map_err(SecretStoreError::Kubernetes)
    }

    async fn secrets_api(&self) -> Result<Api<Secret>, anyhow::Error> {
        let client = Client::try_default()
            .await
            .map_err(|e| anyhow!("error when getting kubernetes client: {e:?}"))?;
        Ok(Api::namespaced(client, &self.namespace))
    }

    fn get(&self, name: &str, encoding: KeyEncoding) -> Result<Key, SecretStoreError> {
        match self.read_secret(name)? {
            Some(data) => decode_secret_data(name, &data, encoding),
            None => Ok(Key::empty()),
        }
    }

    fn put(&self, name: &str, key: &Key, encoding: KeyEncoding) -> Result<(), SecretStoreError> {
        let data = encode_secret_data(name, key, encoding)?;
        self.write_secret(name, data)
    }
}

fn runtime() -> Result<Runtime, SecretStoreError> {
    Runtime::new()
        .context("failed to create runtime for kubernetes API requests")
        .map_err(SecretStoreError::Kubernetes)
}

impl SecretStore for KubernetesSecretStore {
    fn get_batch_signing_key(
        &self,
        locality: &str,
        ingestor: &str,
    ) -> Result<Key, SecretStoreError> {
        self.get(
            &batch_signing_key_name(&self.environment, locality, ingestor),
            KeyEncoding::BatchSigning,
        )
    }

    fn put_batch_signing_key(
        &self,
        locality: &str,
        ingestor: &str,
        key: &Key,
    ) -> Result<(), SecretStoreError> {
        self.put(
            &batch_signing_key_name(&self.environment, locality, ingestor),
            key,
            KeyEncoding::BatchSigning,
        )
    }

    fn get_packet_encryption_key(&self, locality: &str) -> Result<Key, SecretStoreError> {
        self.get(
            &packet_encryption_key_name(&self.environment, locality),
            KeyEncoding::PacketEncryption,
        )
    }

    fn put_packet_encryption_key(
        &self,
        locality: &str,
        key: &Key,
    ) -> Result<(), SecretStoreError> {
        self.put(
            &packet_encryption_key_name(&self.environment, locality),
            key,
            KeyEncoding::PacketEncryption,
        )
    }
}
