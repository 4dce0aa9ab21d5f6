use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use crate::{
    keys::Key,
    secrets::{
        batch_signing_key_name, decode_secret_data, encode_secret_data,
        packet_encryption_key_name, KeyEncoding, SecretStore, SecretStoreError,
    },
};

/// A secret store backed by an in-memory map, for tests. Clones share the
/// same underlying secrets.
#[derive(Clone, Debug)]
pub struct MemorySecretStore {
    environment: String,
    secrets: Arc<Mutex<HashMap<String, BTreeMap<String, Vec<u8>>>>>,
}

impl MemorySecretStore {
    pub fn new(environment: &str) -> MemorySecretStore {
        MemorySecretStore {
            environment: environment.to_owned(),
            secrets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The names of all secrets currently stored.
    pub fn secret_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// The raw data map of a secret, for tests that inspect the stored
    /// layout.
    pub fn secret_data(&self, name: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.secrets.lock().unwrap().get(name).cloned()
    }

    /// Installs a raw data map, for tests that exercise reading legacy
    /// layouts.
    pub fn install_secret_data(&self, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.secrets.lock().unwrap().insert(name.to_owned(), data);
    }

    fn get(&self, name: &str, encoding: KeyEncoding) -> Result<Key, SecretStoreError> {
        match self.secrets.lock().unwrap().get(name) {
            Some(data) => decode_secret_data(name, data, encoding),
            None => Ok(Key::empty()),
        }
    }

    fn put(&self, name: &str, key: &Key, encoding: KeyEncoding) -> Result<(), SecretStoreError> {
        let data = encode_secret_data(name, key, encoding)?;
        self.secrets.lock().unwrap().insert(name.to_owned(), data);
        Ok(())
    }
}

impl SecretStore for MemorySecretStore {
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
