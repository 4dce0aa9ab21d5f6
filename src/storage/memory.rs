use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use crate::storage::{Listing, ObjectStore, PutOptions, StorageError};

/// An object store backed by an in-memory map, for tests. Clones share the
/// same underlying objects, so a clone handed to another thread observes
/// writes made through the original (matching the read-after-write
/// consistency of the cloud stores).
#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    /// Listings are served in pages of this many keys, exercising the same
    /// pagination loop the cloud implementations run against real providers.
    page_size: usize,
}

impl MemoryObjectStore {
    pub fn new() -> MemoryObjectStore {
        MemoryObjectStore {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            page_size: 1000,
        }
    }

    /// Creates a store whose listings are served in pages of `page_size`
    /// keys, so tests can drive the pagination loop with small inputs.
    pub fn with_page_size(page_size: usize) -> MemoryObjectStore {
        assert!(page_size > 0);
        MemoryObjectStore {
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            page_size,
        }
    }

    /// The keys of every object in the store, in lexicographic order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// One page of a listing: up to `page_size` matching keys at or after
    /// `start_after`, in lexicographic order, plus whether more remain.
    fn list_page(&self, prefix: &str, start_after: Option<&str>) -> (Vec<String>, bool) {
        let objects = self.objects.lock().unwrap();
        let mut page = Vec::new();
        let mut truncated = false;
        for key in objects.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(start_after) = start_after {
                if key.as_str() <= start_after {
                    continue;
                }
            }
            if page.len() == self.page_size {
                truncated = true;
                break;
            }
            page.push(key.clone());
        }
        (page, truncated)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing, StorageError> {
        let mut listing = Listing::default();
        let mut start_after: Option<String> = None;
        loop {
            let (page, truncated) = self.list_page(prefix, start_after.as_deref());
            start_after = page.last().cloned();
            for key in page {
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
            if !truncated {
                return Ok(listing);
            }
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound(key.to_owned()))
    }

    fn put(&self, key: &str, body: &[u8], _options: &PutOptions) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), body.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn roundtrip() {
        let store = MemoryObjectStore::new();
        assert_matches!(store.get("missing"), Err(StorageError::ObjectNotFound(_)));

        store
            .put("present", b"content", &PutOptions::task_marker())
            .unwrap();
        assert_eq!(store.get("present").unwrap(), b"content".to_vec());

        // Clones observe writes made through the original
        let clone = store.clone();
        assert_eq!(clone.get("present").unwrap(), b"content".to_vec());
    }

    #[test]
    fn delimited_listing() {
        let store = MemoryObjectStore::new();
        for key in ["a/1", "a/2", "b/1", "loose-object"] {
            store.put(key, b"", &PutOptions::task_marker()).unwrap();
        }

        let listing = store.list("", Some("/")).unwrap();
        assert_eq!(listing.common_prefixes, vec!["a/", "b/"]);
        assert_eq!(listing.objects, vec!["loose-object"]);

        let listing = store.list("a/", None).unwrap();
        assert!(listing.common_prefixes.is_empty());
        assert_eq!(listing.objects, vec!["a/1", "a/2"]);
    }

    #[test]
    fn listing_paginates() {
        // With a page size of 2, listing 5 objects takes three pages; all
        // items must still come back
        let store = MemoryObjectStore::with_page_size(2);
        for i in 0..5 {
            store
                .put(&format!("prefix/{i}"), b"", &PutOptions::task_marker())
                .unwrap();
        }
        store.put("other/0", b"", &PutOptions::task_marker()).unwrap();

        let listing = store.list("prefix/", None).unwrap();
        assert_eq!(
            listing.objects,
            (0..5).map(|i| format!("prefix/{i}")).collect::<Vec<_>>()
        );
    }

    #[test]
    fn listing_page_boundary_exact() {
        // Exactly one full page, then an empty page
        let store = MemoryObjectStore::with_page_size(2);
        store.put("a", b"", &PutOptions::task_marker()).unwrap();
        store.put("b", b"", &PutOptions::task_marker()).unwrap();

        let listing = store.list("", None).unwrap();
        assert_eq!(listing.objects, vec!["a", "b"]);
    }
}
