use base64::{prelude::BASE64_STANDARD, Engine};
use tokio::runtime::Runtime;
use uuid::Uuid;

use crate::keys::{Key, KeyMaterial, KeyVersion};

/// Trace ID used in tests that need a fixed one.
pub const DEFAULT_TRACE_ID: Uuid = Uuid::from_bytes([97; 16]);

/// A runtime for tests that drive clients expecting a tokio Handle.
pub fn test_runtime() -> Runtime {
    Runtime::new().expect("failed to create test runtime")
}

/// A PKCS#8 encoded ECDSA P-256 private key used in tests that need
/// deterministic key material. Stored in base64 to make it convenient to
/// copy/paste into other tools that may wish to verify artifacts emitted by
/// tests using this key.
pub const DEFAULT_BATCH_SIGNING_PRIVATE_KEY: &str =
    "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQgeSa+S+tmLupnAEyFK\
    dVuKB99y09YEqW41+8pwP4cTkahRANCAASy7FHcLGnRudVHWga/j2k9nQ3lMvuGE01\
    Q7DEyjyCuuw9YmB3dHvYcRUnxVRI/nF5LvneGim0dC7F1fuRAPeXI";

/// A second PKCS#8 encoded ECDSA P-256 private key, distinct from
/// `DEFAULT_BATCH_SIGNING_PRIVATE_KEY`.
pub const DEFAULT_PACKET_ENCRYPTION_PRIVATE_KEY: &str =
    "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQg1BQjH71U37XLfWqe+\
    /xP8iUrMiHpmUtbj3UfDkhFIrShRANCAAQgqHcxxwTVx1IXimcRv5TQyYZh+ShDM6X\
    ZqJonoP1m52oN0aLID1hJSrfKJrnqdgmHmaT4eXNNf4C5+g1HZt+u";

/// Parses one of the constants above into key material.
pub fn key_material_from_base64(base64_pkcs8: &str) -> KeyMaterial {
    // The constants are known-good keys, so unwrap() is fine here.
    KeyMaterial::from_pkcs8_der(&BASE64_STANDARD.decode(base64_pkcs8).unwrap()).unwrap()
}

/// A single-version key built from the provided material, created at the
/// provided time and marked primary.
pub fn single_version_key(base64_pkcs8: &str, creation_time: i64) -> Key {
    Key::from_versions(vec![KeyVersion {
        key: key_material_from_base64(base64_pkcs8),
        creation_time,
        primary: true,
    }])
    .unwrap()
}
