mod gcs;
mod local;
mod memory;
mod s3;

use dyn_clone::{clone_trait_object, DynClone};
use slog::{debug, o, warn, Logger};
use std::{collections::HashSet, fmt::Debug};
use tokio::runtime::Handle;

use crate::{
    batch::{parse_aggregate_marker, parse_intake_marker, TASK_MARKERS_PREFIX},
    config::{Identity, StoragePath},
    gcp_oauth::GcpOauthTokenProvider,
    interval::Interval,
    logging::event,
    ErrorClassification,
};

pub use gcs::GcsObjectStore;
pub use local::LocalFileObjectStore;
pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;
pub(crate) use gcs::ureq_retryable;
pub(crate) use s3::rusoto_retryable;

/// Errors that can arise when listing, reading or writing objects in a
/// bucket.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object {0} does not exist")]
    ObjectNotFound(String),
    #[error(transparent)]
    Local(#[from] local::FileError),
    #[error(transparent)]
    S3(#[from] s3::S3Error),
    #[error(transparent)]
    Gcs(#[from] gcs::GcsError),
}

impl ErrorClassification for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            // A missing object is a fact about the bucket, not a transient
            // failure.
            StorageError::ObjectNotFound(_) => false,
            StorageError::Local(_) => false,
            StorageError::S3(e) => e.is_retryable(),
            StorageError::Gcs(e) => e.is_retryable(),
        }
    }
}

/// The outcome of a listing request: object keys and, when a delimiter was
/// provided, the common prefixes ("directories") that were rolled up.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Listing {
    pub objects: Vec<String>,
    pub common_prefixes: Vec<String>,
}

/// Headers to apply to a stored object.
#[derive(Clone, Debug)]
pub struct PutOptions {
    pub content_type: &'static str,
    pub cache_control: Option<&'static str>,
    /// If true, the object is made world readable where the provider
    /// supports it (S3: public-read canned ACL). Manifests are consumed by
    /// peers and ingestors and must be publicly fetchable.
    pub world_readable: bool,
}

impl PutOptions {
    /// Headers for a task marker object.
    pub fn task_marker() -> PutOptions {
        PutOptions {
            content_type: "text/plain",
            cache_control: None,
            world_readable: false,
        }
    }

    /// Headers for a manifest document.
    pub fn manifest() -> PutOptions {
        PutOptions {
            content_type: "application/json; charset=UTF-8",
            cache_control: Some("no-cache"),
            world_readable: true,
        }
    }
}

/// An object store lists, reads and writes objects in some bucket, such as
/// Amazon S3 or Google Cloud Storage, or local files or buffers in memory
/// for testing. Keys are `/`-separated paths relative to the bucket root.
/// Implementations paginate listings transparently (cloud listings are
/// capped at 1000 keys per page) and retry transient provider errors
/// internally.
pub trait ObjectStore: Debug + DynClone + Send + Sync {
    /// Lists objects whose key begins with `prefix`. If `delimiter` is
    /// provided, keys containing the delimiter past the prefix are rolled up
    /// into `common_prefixes` (each ending with the delimiter), mimicking
    /// directory traversal.
    fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing, StorageError>;

    /// Fetches the contents of the object at `key`. Returns
    /// `StorageError::ObjectNotFound` if there is no such object.
    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Creates or replaces the object at `key`. The write must be visible to
    /// subsequent `get` and `list` calls once this returns (read-after-write
    /// consistency, which S3 and GCS both provide).
    fn put(&self, key: &str, body: &[u8], options: &PutOptions) -> Result<(), StorageError>;
}

clone_trait_object!(ObjectStore);

/// A Bucket wraps an ObjectStore with the listing and marker conventions the
/// workflow manager and key rotator rely on.
#[derive(Clone, Debug)]
pub struct Bucket {
    store: Box<dyn ObjectStore>,
    logger: Logger,
}

impl Bucket {
    pub fn new(store: Box<dyn ObjectStore>, parent_logger: &Logger) -> Bucket {
        Bucket {
            logger: parent_logger.new(o!()),
            store,
        }
    }

    /// Constructs a Bucket over the store implementation matching the
    /// provided path's scheme. `identity` is the GCP service account to
    /// impersonate when accessing GCS; S3 access uses the ambient AWS
    /// credential chain.
    pub fn from_path(
        path: StoragePath,
        identity: Identity,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> Result<Bucket, StorageError> {
        let logger = parent_logger.new(o!(
            event::STORAGE_PATH => path.to_string(),
            event::IDENTITY => identity.to_string(),
        ));
        let store: Box<dyn ObjectStore> = match path {
            StoragePath::S3Path(path) => {
                Box::new(S3ObjectStore::new(path, runtime_handle, &logger))
            }
            StoragePath::GcsPath(path) => Box::new(GcsObjectStore::new(
                path,
                GcpOauthTokenProvider::new(identity.as_str().map(str::to_owned)),
                &logger,
            )),
            StoragePath::LocalPath(path) => Box::new(LocalFileObjectStore::new(path)),
        };
        Ok(Bucket { store, logger })
    }

    /// Lists the top level "directories" of the bucket, each of which is one
    /// aggregation id. The reserved `task-markers` entry is dropped, which
    /// means a real aggregation literally named `task-markers` would be
    /// silently ignored; operator documentation forbids that name.
    pub fn list_aggregation_ids(&self) -> Result<Vec<String>, StorageError> {
        let listing = self.store.list("", Some("/"))?;
        let mut ids: Vec<String> = listing
            .common_prefixes
            .into_iter()
            .map(|prefix| prefix.trim_end_matches('/').to_owned())
            .filter(|id| id != TASK_MARKERS_PREFIX)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Lists the object keys of all batch files for the provided aggregation
    /// whose timestamp falls within `interval`. Rather than scanning the
    /// whole aggregation prefix, listing is restricted to the smallest set of
    /// whole-hour path prefixes covering the interval; since those prefixes
    /// over-cover fractional hours, listed keys are filtered against the
    /// interval by their parsed timestamp.
    pub fn list_batch_files(
        &self,
        aggregation_id: &str,
        interval: &Interval,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for hour_prefix in interval.hour_prefixes() {
            let prefix = format!("{aggregation_id}/{hour_prefix}/");
            let listing = self.store.list(&prefix, None)?;
            for key in listing.objects {
                match key_timestamp_in_interval(&key, interval) {
                    Some(true) => keys.push(key),
                    Some(false) => {}
                    None => {
                        debug!(
                            self.logger, "ignoring foreign object in batch listing";
                            event::STORAGE_KEY => &key,
                        );
                    }
                }
            }
        }
        Ok(keys)
    }

    /// Lists the intake task markers recorded for the provided aggregation
    /// whose batch timestamp falls within `interval`.
    pub fn list_intake_task_markers(
        &self,
        aggregation_id: &str,
        interval: &Interval,
    ) -> Result<HashSet<String>, StorageError> {
        let prefix = format!("{TASK_MARKERS_PREFIX}/intake-{aggregation_id}-");
        let listing = self.store.list(&prefix, None)?;
        let mut markers = HashSet::new();
        for key in listing.objects {
            let name = match key.strip_prefix(&format!("{TASK_MARKERS_PREFIX}/")) {
                Some(name) => name,
                None => continue,
            };
            // The listing prefix over-matches aggregation ids that extend
            // this one (e.g. "flock" vs "flock-extra"), so markers are
            // parsed and checked for an exact aggregation id match.
            match parse_intake_marker(name) {
                Some(marker)
                    if marker.aggregation_id == aggregation_id
                        && interval.contains(marker.time) =>
                {
                    markers.insert(name.to_owned());
                }
                Some(_) => {}
                None => {
                    warn!(
                        self.logger, "ignoring malformed intake task marker";
                        event::STORAGE_KEY => &key,
                    );
                }
            }
        }
        Ok(markers)
    }

    /// Lists all aggregate task markers recorded for the provided
    /// aggregation. Aggregate tasks are rare enough (one per aggregation
    /// window) that no interval restriction is needed.
    pub fn list_aggregate_task_markers(
        &self,
        aggregation_id: &str,
    ) -> Result<HashSet<String>, StorageError> {
        let prefix = format!("{TASK_MARKERS_PREFIX}/aggregate-{aggregation_id}-");
        let listing = self.store.list(&prefix, None)?;
        let mut markers = HashSet::new();
        for key in listing.objects {
            let name = match key.strip_prefix(&format!("{TASK_MARKERS_PREFIX}/")) {
                Some(name) => name,
                None => continue,
            };
            match parse_aggregate_marker(name) {
                Some(marker) if marker.aggregation_id == aggregation_id => {
                    markers.insert(name.to_owned());
                }
                Some(_) => {}
                None => {
                    warn!(
                        self.logger, "ignoring malformed aggregate task marker";
                        event::STORAGE_KEY => &key,
                    );
                }
            }
        }
        Ok(markers)
    }

    /// Records that a task has been scheduled by creating the object
    /// `task-markers/<name>`. The marker's content is its own name; only its
    /// existence is meaningful.
    pub fn write_task_marker(&self, marker: &str) -> Result<(), StorageError> {
        let key = format!("{TASK_MARKERS_PREFIX}/{marker}");
        debug!(
            self.logger, "writing task marker";
            event::STORAGE_KEY => &key,
        );
        self.store
            .put(&key, marker.as_bytes(), &PutOptions::task_marker())
    }

    /// Fetches a manifest document. Returns `StorageError::ObjectNotFound`
    /// if no manifest has been written yet.
    pub fn get_manifest(&self, manifest_key: &str) -> Result<Vec<u8>, StorageError> {
        self.store.get(manifest_key)
    }

    /// Creates or replaces a manifest document.
    pub fn put_manifest(&self, manifest_key: &str, json: &[u8]) -> Result<(), StorageError> {
        debug!(
            self.logger, "writing manifest";
            event::STORAGE_KEY => manifest_key,
        );
        self.store.put(manifest_key, json, &PutOptions::manifest())
    }
}

/// Checks whether the batch path timestamp embedded in `key` falls within
/// `interval`. Returns None if the key does not look like a batch file at
/// all.
fn key_timestamp_in_interval(key: &str, interval: &Interval) -> Option<bool> {
    use crate::batch::{split_path_extensions, BatchPath};

    let (prefix, _) = split_path_extensions(key);
    let path = BatchPath::parse_from_prefix(prefix).ok()?;
    Some(interval.contains(path.time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use chrono::{TimeZone, Utc};

    const BATCH_ID: &str = "6891ce17-623f-41f7-9c1d-20fc2f98248b";
    const OTHER_BATCH_ID: &str = "1e466686-9815-40a7-9647-7deb1a6f6dbf";

    fn test_bucket() -> Bucket {
        let logger = setup_test_logging();
        Bucket::new(Box::new(MemoryObjectStore::new()), &logger)
    }

    fn put_marker(bucket: &Bucket, name: &str) {
        bucket.write_task_marker(name).unwrap();
    }

    #[test]
    fn aggregation_id_discovery() {
        let bucket = test_bucket();
        let options = PutOptions::task_marker();
        for key in [
            "flock/2021/01/01/00/30/some-object",
            "flock/2021/01/01/01/00/some-object",
            "herd/2021/01/01/00/30/some-object",
            "task-markers/intake-flock-2021-01-01-00-30-whatever",
        ] {
            bucket.store.put(key, b"", &options).unwrap();
        }

        // task-markers is reserved and must not surface as an aggregation
        assert_eq!(bucket.list_aggregation_ids().unwrap(), vec!["flock", "herd"]);
    }

    #[test]
    fn batch_file_listing_filters_by_interval() {
        let bucket = test_bucket();
        let options = PutOptions::task_marker();
        let in_window = format!("flock/2021/01/01/00/30/{BATCH_ID}.batch");
        let at_end = format!("flock/2021/01/01/01/00/{OTHER_BATCH_ID}.batch");
        let foreign = "flock/2021/01/01/00/45/not-a-uuid.batch";
        for key in [in_window.as_str(), at_end.as_str(), foreign] {
            bucket.store.put(key, b"", &options).unwrap();
        }

        let interval = Interval::new(
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap(),
        )
        .unwrap();
        // The batch whose timestamp equals the interval's end is excluded,
        // as is the unparseable key
        assert_eq!(
            bucket.list_batch_files("flock", &interval).unwrap(),
            vec![in_window]
        );
    }

    #[test]
    fn intake_marker_listing() {
        let bucket = test_bucket();
        let in_window = format!("intake-flock-2021-01-01-00-30-{BATCH_ID}");
        let outside_window = format!("intake-flock-2021-01-01-03-30-{BATCH_ID}");
        // "flock-extra" shares the "flock-" listing prefix but is a
        // different aggregation
        let other_aggregation = format!("intake-flock-extra-2021-01-01-00-30-{BATCH_ID}");
        for name in [&in_window, &outside_window, &other_aggregation] {
            put_marker(&bucket, name);
        }

        let interval = Interval::new(
            Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 1, 1, 1, 0, 0).unwrap(),
        )
        .unwrap();
        let markers = bucket.list_intake_task_markers("flock", &interval).unwrap();
        assert_eq!(markers, HashSet::from([in_window]));
    }

    #[test]
    fn aggregate_marker_listing() {
        let bucket = test_bucket();
        put_marker(&bucket, "aggregate-flock-2021-01-01-00-00");
        put_marker(&bucket, "aggregate-flock-2021-01-01-08-00");
        put_marker(&bucket, "aggregate-flock-extra-2021-01-01-00-00");

        let markers = bucket.list_aggregate_task_markers("flock").unwrap();
        assert_eq!(
            markers,
            HashSet::from([
                "aggregate-flock-2021-01-01-00-00".to_owned(),
                "aggregate-flock-2021-01-01-08-00".to_owned(),
            ])
        );
    }

    #[test]
    fn manifest_not_found() {
        let bucket = test_bucket();
        assert_matches::assert_matches!(
            bucket.get_manifest("missing-manifest.json"),
            Err(StorageError::ObjectNotFound(_))
        );

        bucket
            .put_manifest("present-manifest.json", br#"{"format": 1}"#)
            .unwrap();
        assert_eq!(
            bucket.get_manifest("present-manifest.json").unwrap(),
            br#"{"format": 1}"#.to_vec()
        );
    }
}
