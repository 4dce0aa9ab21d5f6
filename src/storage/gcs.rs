use serde::Deserialize;
use slog::{o, Logger};
use std::{io::Read, time::Duration};

use crate::{
    config::GcsPath,
    gcp_oauth::GcpOauthTokenProvider,
    logging::event,
    retries::retry_request,
    storage::{Listing, ObjectStore, PutOptions, StorageError},
    ErrorClassification,
};

const STORAGE_API_BASE_URL: &str = "https://storage.googleapis.com";

/// Errors encountered when using Google Cloud Storage as an object store.
#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    #[error("failed to obtain Oauth token: {0}")]
    Auth(#[source] anyhow::Error),
    #[error("GCS API request failed: {0}")]
    Request(Box<ureq::Error>),
    #[error("failed to read GCS API response: {0}")]
    Response(#[from] std::io::Error),
}

impl From<ureq::Error> for GcsError {
    fn from(error: ureq::Error) -> Self {
        GcsError::Request(Box::new(error))
    }
}

impl ErrorClassification for GcsError {
    fn is_retryable(&self) -> bool {
        match self {
            // Token fetches go over the network and may succeed later.
            GcsError::Auth(_) => true,
            GcsError::Response(_) => true,
            GcsError::Request(e) => ureq_retryable(e),
        }
    }
}

/// True if the provided ureq error represents a transient condition: a
/// transport failure, throttling, or a server side error.
pub(crate) fn ureq_retryable(error: &ureq::Error) -> bool {
    match error {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(status, _) => *status >= 500 || *status == 429,
    }
}

/// One page of an object listing.
/// https://cloud.google.com/storage/docs/json_api/v1/objects/list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectListResponse {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

/// The portion of an object resource this application uses.
/// https://cloud.google.com/storage/docs/json_api/v1/objects#resource
#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
}

/// An object store backed by a Google Cloud Storage bucket, accessed over
/// the JSON API with an Oauth token in an Authorization header.
#[derive(Clone, Debug)]
pub struct GcsObjectStore {
    path: GcsPath,
    token_provider: GcpOauthTokenProvider,
    storage_api_endpoint: String,
    agent: ureq::Agent,
    logger: Logger,
}

impl GcsObjectStore {
    pub fn new(
        path: GcsPath,
        token_provider: GcpOauthTokenProvider,
        parent_logger: &Logger,
    ) -> GcsObjectStore {
        Self::new_with_api_endpoint(path, token_provider, STORAGE_API_BASE_URL, parent_logger)
    }

    /// Allows tests to aim the store at a local mock of the storage API.
    fn new_with_api_endpoint(
        path: GcsPath,
        token_provider: GcpOauthTokenProvider,
        storage_api_endpoint: &str,
        parent_logger: &Logger,
    ) -> GcsObjectStore {
        GcsObjectStore {
            path: path.ensure_directory_prefix(),
            token_provider,
            storage_api_endpoint: storage_api_endpoint.to_owned(),
            // By default, ureq will wait forever to connect or read.
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            logger: parent_logger.new(o!()),
        }
    }

    fn authorization(&self) -> Result<String, GcsError> {
        Ok(format!(
            "Bearer {}",
            self.token_provider
                .ensure_oauth_token()
                .map_err(GcsError::Auth)?
        ))
    }

    fn absolute_key(&self, key: &str) -> String {
        format!("{}{}", self.path.key, key)
    }

    fn relative_key(&self, key: &str) -> String {
        key.strip_prefix(&self.path.key).unwrap_or(key).to_owned()
    }

    fn list_page(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<ObjectListResponse, GcsError> {
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.storage_api_endpoint, self.path.bucket
        );
        let mut request = self
            .agent
            .get(&url)
            .set("Authorization", &self.authorization()?)
            .query("prefix", &self.absolute_key(prefix));
        if let Some(delimiter) = delimiter {
            request = request.query("delimiter", delimiter);
        }
        if let Some(page_token) = page_token {
            request = request.query("pageToken", page_token);
        }

        Ok(request.call()?.into_json::<ObjectListResponse>()?)
    }
}

impl ObjectStore for GcsObjectStore {
    fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing, StorageError> {
        let mut listing = Listing::default();
        let mut page_token: Option<String> = None;
        loop {
            let response = retry_request(
                &self.logger.new(o!(event::ACTION => "list objects")),
                || self.list_page(prefix, delimiter, page_token.as_deref()),
                |e| e.is_retryable(),
            )?;

            for object in response.items {
                listing.objects.push(self.relative_key(&object.name));
            }
            for common_prefix in response.prefixes {
                listing.common_prefixes.push(self.relative_key(&common_prefix));
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                return Ok(listing);
            }
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        // Per API reference, the object key must be URL encoded.
        // https://cloud.google.com/storage/docs/json_api/v1/objects/get
        let encoded_key = urlencoding::encode(&self.absolute_key(key)).into_owned();
        let url = format!(
            "{}/storage/v1/b/{}/o/{encoded_key}",
            self.storage_api_endpoint, self.path.bucket
        );

        let response = retry_request(
            &self.logger.new(o!(event::ACTION => "get object")),
            || -> Result<ureq::Response, GcsError> {
                Ok(self
                    .agent
                    .get(&url)
                    .set("Authorization", &self.authorization()?)
                    // Ensures response body will be content and not JSON
                    // object metadata.
                    .query("alt", "media")
                    .call()?)
            },
            |e| e.is_retryable(),
        )
        .map_err(|e| {
            if let GcsError::Request(inner) = &e {
                if matches!(**inner, ureq::Error::Status(404, _)) {
                    return StorageError::ObjectNotFound(key.to_owned());
                }
            }
            StorageError::Gcs(e)
        })?;

        let mut contents = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut contents)
            .map_err(GcsError::Response)?;
        Ok(contents)
    }

    fn put(&self, key: &str, body: &[u8], options: &PutOptions) -> Result<(), StorageError> {
        // A multipart upload carries the object metadata (content type and
        // cache control) in a JSON part alongside the content.
        // https://cloud.google.com/storage/docs/json_api/v1/how-tos/multipart-upload
        let url = format!(
            "{}/upload/storage/v1/b/{}/o",
            self.storage_api_endpoint, self.path.bucket
        );
        let mut metadata = serde_json::json!({
            "name": self.absolute_key(key),
            "contentType": options.content_type,
        });
        if let Some(cache_control) = options.cache_control {
            metadata["cacheControl"] = cache_control.into();
        }

        const BOUNDARY: &str = "orchestrator_multipart_boundary";
        let mut multipart_body = Vec::new();
        multipart_body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n--{BOUNDARY}\r\nContent-Type: {}\r\n\r\n",
                options.content_type
            )
            .as_bytes(),
        );
        multipart_body.extend_from_slice(body);
        multipart_body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        retry_request(
            &self.logger.new(o!(event::ACTION => "put object")),
            || -> Result<ureq::Response, GcsError> {
                let mut request = self
                    .agent
                    .post(&url)
                    .set("Authorization", &self.authorization()?)
                    .set(
                        "Content-Type",
                        &format!("multipart/related; boundary={BOUNDARY}"),
                    )
                    .query("uploadType", "multipart");
                if options.world_readable {
                    // GCS has no public-read object ACL when uniform bucket
                    // level access is enabled; the bucket's IAM policy makes
                    // manifests public. For fine-grained buckets, ask for
                    // the public-read predefined ACL.
                    request = request.query("predefinedAcl", "publicRead");
                }
                Ok(request.send_bytes(&multipart_body)?)
            },
            |e| e.is_retryable(),
        )
        .map_err(StorageError::Gcs)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;
    use assert_matches::assert_matches;
    use mockito::{mock, Matcher};

    // The testing strategy is to aim the store at a Mockito-managed HTTP
    // endpoint playing canned JSON API responses, with a fixed Oauth token
    // in place of the metadata service.
    fn test_store(bucket: &str, key_prefix: &str) -> GcsObjectStore {
        let logger = setup_test_logging();
        GcsObjectStore::new_with_api_endpoint(
            GcsPath {
                bucket: bucket.to_owned(),
                key: key_prefix.to_owned(),
            },
            GcpOauthTokenProvider::new_with_static_token("fake-token"),
            &mockito::server_url(),
            &logger,
        )
    }

    #[test]
    fn listing_paginates_and_strips_prefix() {
        let store = test_store("fake-list-bucket", "fake-prefix");

        // Both mocks match the paged request; Mockito gives the later
        // registration precedence, so the pageToken request is answered by
        // the second page.
        let first_page = mock("GET", "/storage/v1/b/fake-list-bucket/o")
            .match_header("Authorization", "Bearer fake-token")
            .match_query(Matcher::UrlEncoded(
                "prefix".to_owned(),
                "fake-prefix/batches/".to_owned(),
            ))
            .with_body(
                r#"{"items": [{"name": "fake-prefix/batches/a"}], "nextPageToken": "fake-page-2"}"#,
            )
            .create();
        let second_page = mock("GET", "/storage/v1/b/fake-list-bucket/o")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("prefix".to_owned(), "fake-prefix/batches/".to_owned()),
                Matcher::UrlEncoded("pageToken".to_owned(), "fake-page-2".to_owned()),
            ]))
            .with_body(
                r#"{"items": [{"name": "fake-prefix/batches/b"}], "prefixes": ["fake-prefix/batches/dir/"]}"#,
            )
            .create();

        let listing = store.list("batches/", None).unwrap();
        // All pages are returned, with the store's key prefix stripped
        assert_eq!(listing.objects, vec!["batches/a", "batches/b"]);
        assert_eq!(listing.common_prefixes, vec!["batches/dir/"]);

        first_page.assert();
        second_page.assert();
    }

    #[test]
    fn listing_passes_delimiter() {
        let store = test_store("fake-delimiter-bucket", "");

        let mocked_list = mock("GET", "/storage/v1/b/fake-delimiter-bucket/o")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("prefix".to_owned(), "".to_owned()),
                Matcher::UrlEncoded("delimiter".to_owned(), "/".to_owned()),
            ]))
            .with_body(r#"{"prefixes": ["flock/", "herd/"]}"#)
            .create();

        let listing = store.list("", Some("/")).unwrap();
        assert!(listing.objects.is_empty());
        assert_eq!(listing.common_prefixes, vec!["flock/", "herd/"]);
        mocked_list.assert();
    }

    #[test]
    fn get_url_encodes_key_and_maps_404() {
        let store = test_store("fake-get-bucket", "fake-prefix");

        // Per API reference the object key is URL encoded, so the path
        // separator in the absolute key appears as %2F
        let found = mock(
            "GET",
            "/storage/v1/b/fake-get-bucket/o/fake-prefix%2Fpresent-object",
        )
        .match_header("Authorization", "Bearer fake-token")
        .match_query(Matcher::UrlEncoded("alt".to_owned(), "media".to_owned()))
        .with_body("fake contents")
        .create();

        assert_eq!(
            store.get("present-object").unwrap(),
            b"fake contents".to_vec()
        );
        found.assert();

        let missing = mock(
            "GET",
            "/storage/v1/b/fake-get-bucket/o/fake-prefix%2Fmissing-object",
        )
        .match_query(Matcher::UrlEncoded("alt".to_owned(), "media".to_owned()))
        .with_status(404)
        .with_body(r#"{"error": {"code": 404, "message": "No such object"}}"#)
        .create();

        assert_matches!(
            store.get("missing-object"),
            Err(StorageError::ObjectNotFound(key)) => {
                assert_eq!(key, "missing-object");
            }
        );
        missing.assert();
    }

    #[test]
    fn put_sends_multipart_metadata() {
        let store = test_store("fake-put-bucket", "");

        // The multipart body carries the object metadata as a JSON part
        // ahead of the content part
        let metadata = serde_json::json!({
            "name": "fake-manifest.json",
            "contentType": "application/json; charset=UTF-8",
            "cacheControl": "no-cache",
        });
        let expected_body = format!(
            "--orchestrator_multipart_boundary\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n\
             --orchestrator_multipart_boundary\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {{\"format\": 1}}\r\n\
             --orchestrator_multipart_boundary--\r\n"
        );

        let mocked_upload = mock("POST", "/upload/storage/v1/b/fake-put-bucket/o")
            .match_header("Authorization", "Bearer fake-token")
            .match_header(
                "Content-Type",
                "multipart/related; boundary=orchestrator_multipart_boundary",
            )
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("uploadType".to_owned(), "multipart".to_owned()),
                // Manifests are world readable
                Matcher::UrlEncoded("predefinedAcl".to_owned(), "publicRead".to_owned()),
            ]))
            .match_body(expected_body.as_str())
            .with_body(r#"{"name": "fake-manifest.json"}"#)
            .create();

        store
            .put(
                "fake-manifest.json",
                br#"{"format": 1}"#,
                &PutOptions::manifest(),
            )
            .unwrap();
        mocked_upload.assert();
    }

    #[test]
    fn put_task_marker_has_no_acl_or_cache_control() {
        let store = test_store("fake-marker-bucket", "");

        let metadata = serde_json::json!({
            "name": "task-markers/fake-marker",
            "contentType": "text/plain",
        });
        let expected_body = format!(
            "--orchestrator_multipart_boundary\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n\
             --orchestrator_multipart_boundary\r\n\
             Content-Type: text/plain\r\n\r\n\
             fake-marker\r\n\
             --orchestrator_multipart_boundary--\r\n"
        );

        let mocked_upload = mock("POST", "/upload/storage/v1/b/fake-marker-bucket/o")
            .match_query(Matcher::UrlEncoded(
                "uploadType".to_owned(),
                "multipart".to_owned(),
            ))
            .match_body(expected_body.as_str())
            .with_body(r#"{"name": "task-markers/fake-marker"}"#)
            .create();

        store
            .put(
                "task-markers/fake-marker",
                b"fake-marker",
                &PutOptions::task_marker(),
            )
            .unwrap();
        mocked_upload.assert();
    }
}
