//! Oauth tokens for use with Google Cloud Platform APIs.
//!
//! Workloads running on GKE obtain a token for the node's default service
//! account from the instance metadata service, and may exchange it for a
//! token impersonating another service account via the IAM credentials API.
//! Richer authentication flows (key files, workload identity federation) are
//! deliberately not handled here; they belong to the deployment's ambient
//! credential configuration.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex},
    time::Duration as StdDuration,
};

const DEFAULT_OAUTH_TOKEN_URL: &str =
    "http://metadata.google.internal:80/computeMetadata/v1/instance/service-accounts/default/token";
const IAM_CREDENTIALS_API_BASE_URL: &str = "https://iamcredentials.googleapis.com";

// Tokens are requested with the broad cloud-platform scope, which covers
// both the storage and pubsub APIs this crate talks to.
const OAUTH_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// A wrapper around an Oauth token and its expiration date.
#[derive(Clone, Debug)]
struct OauthToken {
    token: String,
    expiration: DateTime<Utc>,
}

impl OauthToken {
    /// Returns true if the token is not yet expired, with a minute of slack
    /// so a token does not expire mid-request.
    fn usable(&self) -> bool {
        self.expiration > Utc::now() + Duration::minutes(1)
    }
}

/// Represents the response from the GKE metadata service's default service
/// account token endpoint.
#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    expires_in: i64,
    token_type: String,
}

/// Represents the response from the GCP IAM credentials API's
/// generateAccessToken endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateAccessTokenResponse {
    access_token: String,
    expire_time: DateTime<Utc>,
}

/// GcpOauthTokenProvider manages a default service account Oauth token (i.e.
/// the one for a GCP service account mapped to a Kubernetes service account)
/// and an Oauth token used to impersonate another service account. Clones
/// share the cached tokens.
#[derive(Clone, Debug)]
pub struct GcpOauthTokenProvider {
    /// Service account to impersonate, if any.
    service_account_to_impersonate: Option<String>,
    /// A fixed token handed out instead of consulting the metadata service.
    /// Only set by tests, which have no metadata service to talk to.
    static_token: Option<String>,
    /// Cached tokens. Populated the first time a token is requested; the
    /// contained tokens may be expired.
    state: Arc<Mutex<TokenCache>>,
}

#[derive(Debug, Default)]
struct TokenCache {
    default_account_token: Option<OauthToken>,
    impersonated_account_token: Option<OauthToken>,
}

impl GcpOauthTokenProvider {
    /// Creates a token provider which can impersonate the specified service
    /// account. If `service_account_to_impersonate` is None, tokens are for
    /// the workload's default service account.
    pub fn new(service_account_to_impersonate: Option<String>) -> GcpOauthTokenProvider {
        GcpOauthTokenProvider {
            service_account_to_impersonate,
            static_token: None,
            state: Arc::new(Mutex::new(TokenCache::default())),
        }
    }

    /// Creates a provider that always returns the provided token, for tests
    /// that have no metadata service to talk to.
    #[cfg(test)]
    pub(crate) fn new_with_static_token(token: &str) -> GcpOauthTokenProvider {
        GcpOauthTokenProvider {
            service_account_to_impersonate: None,
            static_token: Some(token.to_owned()),
            state: Arc::new(Mutex::new(TokenCache::default())),
        }
    }

    /// Returns an Oauth token suitable for a Bearer Authorization header,
    /// fetching a fresh one if the cached token is absent or expired.
    pub fn ensure_oauth_token(&self) -> Result<String> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }
        let mut state = self.state.lock().unwrap();
        match self.service_account_to_impersonate {
            Some(_) => self.ensure_impersonated_account_token(&mut state),
            None => Self::ensure_default_account_token(&mut state),
        }
    }

    fn ensure_default_account_token(state: &mut TokenCache) -> Result<String> {
        if let Some(token) = &state.default_account_token {
            if token.usable() {
                return Ok(token.token.clone());
            }
        }

        let response = ureq::get(DEFAULT_OAUTH_TOKEN_URL)
            .set("Metadata-Flavor", "Google")
            // By default, ureq will wait forever to connect or read.
            .timeout(StdDuration::from_secs(10))
            .call()
            .context("failed to query GKE metadata service for default account token")?
            .into_json::<MetadataTokenResponse>()
            .context("failed to deserialize response from metadata service")?;

        if response.token_type != "Bearer" {
            return Err(anyhow!("unexpected token type {}", response.token_type));
        }

        state.default_account_token = Some(OauthToken {
            token: response.access_token.clone(),
            expiration: Utc::now() + Duration::seconds(response.expires_in),
        });

        Ok(response.access_token)
    }

    fn ensure_impersonated_account_token(&self, state: &mut TokenCache) -> Result<String> {
        let service_account = match &self.service_account_to_impersonate {
            Some(service_account) => service_account,
            None => return Err(anyhow!("no service account to impersonate was provided")),
        };

        if let Some(token) = &state.impersonated_account_token {
            if token.usable() {
                return Ok(token.token.clone());
            }
        }

        let default_token = Self::ensure_default_account_token(state)?;
        let request_url = format!(
            "{IAM_CREDENTIALS_API_BASE_URL}/v1/projects/-/serviceAccounts/{service_account}:generateAccessToken"
        );
        let response = ureq::post(&request_url)
            .set("Authorization", &format!("Bearer {default_token}"))
            .timeout(StdDuration::from_secs(10))
            .send_json(ureq::json!({ "scope": [OAUTH_SCOPE] }))
            .with_context(|| {
                format!("failed to get Oauth token to impersonate service account {service_account}")
            })?
            .into_json::<GenerateAccessTokenResponse>()
            .context("failed to deserialize response from IAM API")?;

        state.impersonated_account_token = Some(OauthToken {
            token: response.access_token.clone(),
            expiration: response.expire_time,
        });

        Ok(response.access_token)
    }
}
