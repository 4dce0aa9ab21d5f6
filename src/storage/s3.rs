use rusoto_core::{
    credential::{CredentialsError, DefaultCredentialsProvider, StaticProvider},
    request::TlsError,
    RusotoError,
};
use rusoto_s3::{
    GetObjectError, GetObjectRequest, ListObjectsV2Error, ListObjectsV2Request, PutObjectError,
    PutObjectRequest, S3Client, S3,
};
use slog::{o, Logger};
use tokio::{io::AsyncReadExt, runtime::Handle};

use crate::{
    config::S3Path,
    logging::event,
    retries::retry_request,
    storage::{Listing, ObjectStore, PutOptions, StorageError},
    ErrorClassification,
};

/// Errors encountered when using S3 as an object store.
#[derive(Debug, thiserror::Error)]
pub enum S3Error {
    #[error("failed to construct TLS client: {0}")]
    Tls(#[from] TlsError),
    #[error("failed to obtain AWS credentials: {0}")]
    Credentials(#[from] CredentialsError),
    #[error("error listing S3 objects: {0}")]
    ListObjects(RusotoError<ListObjectsV2Error>),
    #[error("error getting S3 object: {0}")]
    GetObject(RusotoError<GetObjectError>),
    #[error("no body in GetObjectResponse")]
    GetObjectNoBody,
    #[error("error reading S3 object body: {0}")]
    ReadBody(std::io::Error),
    #[error("error putting S3 object: {0}")]
    PutObject(RusotoError<PutObjectError>),
}

impl ErrorClassification for S3Error {
    fn is_retryable(&self) -> bool {
        match self {
            S3Error::Tls(_) => false,
            // Credential fetches go over the network and may succeed later.
            S3Error::Credentials(_) => true,
            S3Error::ReadBody(_) | S3Error::GetObjectNoBody => true,
            S3Error::ListObjects(e) => rusoto_retryable(e),
            S3Error::GetObject(e) => rusoto_retryable(e),
            S3Error::PutObject(e) => rusoto_retryable(e),
        }
    }
}

/// True if the provided rusoto error represents a transient condition:
/// a failure to dispatch the request, throttling, or a server side error.
pub(crate) fn rusoto_retryable<E>(error: &RusotoError<E>) -> bool {
    match error {
        RusotoError::HttpDispatch(_) => true,
        RusotoError::Unknown(response) => {
            response.status.is_server_error() || response.status.as_u16() == 429
        }
        RusotoError::Credentials(_) => true,
        _ => false,
    }
}

/// An object store backed by an Amazon S3 bucket, authenticating with the
/// ambient AWS credential chain (environment, instance profile or web
/// identity).
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    path: S3Path,
    runtime_handle: Handle,
    /// Fixed credentials handed to the client instead of consulting the
    /// ambient chain. Only set by tests, which aim the client at a local
    /// mock endpoint.
    static_credentials: Option<StaticProvider>,
    logger: Logger,
}

impl S3ObjectStore {
    pub fn new(path: S3Path, runtime_handle: &Handle, parent_logger: &Logger) -> S3ObjectStore {
        S3ObjectStore {
            path: path.ensure_directory_prefix(),
            runtime_handle: runtime_handle.clone(),
            static_credentials: None,
            logger: parent_logger.new(o!()),
        }
    }

    /// Creates a store that authenticates with fixed credentials, for tests.
    #[cfg(test)]
    fn new_with_static_credentials(
        path: S3Path,
        credentials: StaticProvider,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> S3ObjectStore {
        S3ObjectStore {
            path: path.ensure_directory_prefix(),
            runtime_handle: runtime_handle.clone(),
            static_credentials: Some(credentials),
            logger: parent_logger.new(o!()),
        }
    }

    fn client(&self) -> Result<S3Client, S3Error> {
        let dispatcher = rusoto_core::HttpClient::new()?;
        let client = match &self.static_credentials {
            Some(credentials) => {
                S3Client::new_with(dispatcher, credentials.clone(), self.path.region.clone())
            }
            None => S3Client::new_with(
                dispatcher,
                DefaultCredentialsProvider::new()?,
                self.path.region.clone(),
            ),
        };
        Ok(client)
    }

    /// The provider-side key for an object, prepending this path's key
    /// prefix.
    fn absolute_key(&self, key: &str) -> String {
        format!("{}{}", self.path.key, key)
    }

    /// Strips this path's key prefix from a provider-side key.
    fn relative_key(&self, key: &str) -> String {
        key.strip_prefix(&self.path.key).unwrap_or(key).to_owned()
    }
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing, StorageError> {
        let client = self.client()?;
        let mut listing = Listing::default();
        let mut continuation_token = None;
        loop {
            let request = ListObjectsV2Request {
                bucket: self.path.bucket.clone(),
                prefix: Some(self.absolute_key(prefix)),
                delimiter: delimiter.map(|d| d.to_owned()),
                continuation_token: continuation_token.clone(),
                ..Default::default()
            };

            let output = retry_request(
                &self.logger.new(o!(event::ACTION => "list objects")),
                || {
                    self.runtime_handle
                        .block_on(client.list_objects_v2(request.clone()))
                },
                |e| rusoto_retryable(e),
            )
            .map_err(S3Error::ListObjects)?;

            for object in output.contents.unwrap_or_default() {
                if let Some(key) = object.key {
                    listing.objects.push(self.relative_key(&key));
                }
            }
            for common_prefix in output.common_prefixes.unwrap_or_default() {
                if let Some(prefix) = common_prefix.prefix {
                    listing.common_prefixes.push(self.relative_key(&prefix));
                }
            }

            continuation_token = output.next_continuation_token;
            if !output.is_truncated.unwrap_or(false) || continuation_token.is_none() {
                return Ok(listing);
            }
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let client = self.client()?;
        let request = GetObjectRequest {
            bucket: self.path.bucket.clone(),
            key: self.absolute_key(key),
            ..Default::default()
        };

        let output = retry_request(
            &self.logger.new(o!(event::ACTION => "get object")),
            || self.runtime_handle.block_on(client.get_object(request.clone())),
            |e| rusoto_retryable(e),
        )
        .map_err(|e| match e {
            RusotoError::Service(GetObjectError::NoSuchKey(_)) => {
                StorageError::ObjectNotFound(key.to_owned())
            }
            RusotoError::Unknown(ref response) if response.status.as_u16() == 404 => {
                StorageError::ObjectNotFound(key.to_owned())
            }
            e => StorageError::S3(S3Error::GetObject(e)),
        })?;

        let body = output.body.ok_or(S3Error::GetObjectNoBody)?;
        let mut reader = Box::pin(body.into_async_read());
        let mut contents = Vec::new();
        self.runtime_handle
            .block_on(reader.read_to_end(&mut contents))
            .map_err(S3Error::ReadBody)?;
        Ok(contents)
    }

    fn put(&self, key: &str, body: &[u8], options: &PutOptions) -> Result<(), StorageError> {
        let client = self.client()?;

        retry_request(
            &self.logger.new(o!(event::ACTION => "put object")),
            || {
                // PutObjectRequest's body (a ByteStream) is not Clone, so the
                // request is rebuilt for every attempt.
                let request = PutObjectRequest {
                    bucket: self.path.bucket.clone(),
                    key: self.absolute_key(key),
                    body: Some(body.to_vec().into()),
                    content_type: Some(options.content_type.to_owned()),
                    cache_control: options.cache_control.map(|c| c.to_owned()),
                    // Manifests must be publicly fetchable by peers and
                    // ingestors.
                    acl: options.world_readable.then(|| "public-read".to_owned()),
                    ..Default::default()
                };
                self.runtime_handle.block_on(client.put_object(request))
            },
            |e| rusoto_retryable(e),
        )
        .map_err(S3Error::PutObject)?;
        Ok(())
    }
}
