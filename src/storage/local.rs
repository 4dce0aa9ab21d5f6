use std::{
    fs::{create_dir_all, read_dir, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf, MAIN_SEPARATOR_STR},
};

use crate::storage::{Listing, ObjectStore, PutOptions, StorageError};

/// Errors that can arise when using the local filesystem as an object store.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("opening {1}, {0}")]
    OpenReading(std::io::Error, String),
    #[error("reading {1}, {0}")]
    ReadFile(std::io::Error, String),
    #[error("creating parent directories {1}, {0}")]
    Mkdirp(std::io::Error, String),
    #[error("creating {1}, {0}")]
    CreateFile(std::io::Error, String),
    #[error("writing {1}, {0}")]
    WriteFile(std::io::Error, String),
    #[error("traversing {1}, {0}")]
    WalkDirectory(std::io::Error, String),
    #[error("non UTF-8 file name under {0}")]
    NonUtf8FileName(String),
}

/// An object store backed by a local directory, for development and tests.
/// Object keys are interpreted as `/`-separated paths relative to the root
/// directory.
#[derive(Clone, Debug)]
pub struct LocalFileObjectStore {
    directory: PathBuf,
}

impl LocalFileObjectStore {
    pub fn new(directory: PathBuf) -> LocalFileObjectStore {
        LocalFileObjectStore { directory }
    }

    /// Callers construct keys using "/" as a separator. This function
    /// converts the provided key into a relative path valid for the current
    /// platform.
    fn relative_path(key: &str) -> PathBuf {
        PathBuf::from(key.replace('/', MAIN_SEPARATOR_STR))
    }

    /// Recursively collects the keys of all files under `dir`, where
    /// `key_prefix` is the `/`-joined path from the store root to `dir`.
    fn walk(&self, dir: &Path, key_prefix: &str, keys: &mut Vec<String>) -> Result<(), FileError> {
        let entries = match read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(FileError::WalkDirectory(err, dir.display().to_string())),
        };
        for entry in entries {
            let entry =
                entry.map_err(|e| FileError::WalkDirectory(e, dir.display().to_string()))?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|_| FileError::NonUtf8FileName(dir.display().to_string()))?;
            let key = if key_prefix.is_empty() {
                name
            } else {
                format!("{key_prefix}/{name}")
            };
            let file_type = entry
                .file_type()
                .map_err(|e| FileError::WalkDirectory(e, dir.display().to_string()))?;
            if file_type.is_dir() {
                self.walk(&entry.path(), &key, keys)?;
            } else {
                keys.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalFileObjectStore {
    fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing, StorageError> {
        let mut keys = Vec::new();
        self.walk(&self.directory, "", &mut keys)?;
        keys.sort();

        let mut listing = Listing::default();
        for key in keys {
            if !key.starts_with(prefix) {
                continue;
            }
            match delimiter.and_then(|d| key[prefix.len()..].find(d).map(|i| (d, i))) {
                Some((delimiter, index)) => {
                    let common = &key[..prefix.len() + index + delimiter.len()];
                    if listing.common_prefixes.last().map(String::as_str) != Some(common) {
                        listing.common_prefixes.push(common.to_owned());
                    }
                }
                None => listing.objects.push(key),
            }
        }
        Ok(listing)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.directory.join(Self::relative_path(key));
        let mut f = File::open(path.as_path()).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                return StorageError::ObjectNotFound(key.to_owned());
            }
            StorageError::Local(FileError::OpenReading(err, path.display().to_string()))
        })?;
        let mut contents = Vec::new();
        f.read_to_end(&mut contents)
            .map_err(|e| FileError::ReadFile(e, path.display().to_string()))?;
        Ok(contents)
    }

    fn put(&self, key: &str, body: &[u8], _options: &PutOptions) -> Result<(), StorageError> {
        let path = self.directory.join(Self::relative_path(key));
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .map_err(|e| FileError::Mkdirp(e, parent.display().to_string()))?;
        }
        let mut f = File::create(path.as_path())
            .map_err(|e| FileError::CreateFile(e, path.display().to_string()))?;
        f.write_all(body)
            .map_err(|e| FileError::WriteFile(e, path.display().to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn roundtrip() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let store = LocalFileObjectStore::new(tempdir.path().to_path_buf());
        let content = vec![1, 2, 3, 4, 5, 6, 7, 8];

        assert_matches!(store.get("path2"), Err(StorageError::ObjectNotFound(_)));

        for key in &["path", "path3/with/separators"] {
            store.put(key, &content, &PutOptions::task_marker()).unwrap();
            assert_eq!(store.get(key).unwrap(), content);
        }
    }

    #[test]
    fn listing() {
        let tempdir = tempfile::TempDir::new().unwrap();
        let store = LocalFileObjectStore::new(tempdir.path().to_path_buf());
        for key in ["flock/2021/01/01/00/30/object", "herd/2021/01/01/00/30/object", "loose"] {
            store.put(key, b"", &PutOptions::task_marker()).unwrap();
        }

        let listing = store.list("", Some("/")).unwrap();
        assert_eq!(listing.common_prefixes, vec!["flock/", "herd/"]);
        assert_eq!(listing.objects, vec!["loose"]);

        let listing = store.list("flock/2021/01/01/00/", None).unwrap();
        assert_eq!(listing.objects, vec!["flock/2021/01/01/00/30/object"]);
        assert!(listing.common_prefixes.is_empty());

        // Listing a store whose directory was never created is an empty
        // listing, not an error
        let store = LocalFileObjectStore::new(tempdir.path().join("never-created"));
        assert_eq!(store.list("", None).unwrap(), Listing::default());
    }
}
