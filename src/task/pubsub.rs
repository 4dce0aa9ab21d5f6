use anyhow::anyhow;
use base64::{prelude::BASE64_STANDARD, Engine};
use slog::{o, Logger};
use std::time::Duration;

use crate::{
    gcp_oauth::GcpOauthTokenProvider,
    logging::event,
    retries::retry_request,
    storage::ureq_retryable,
    task::{TaskQueueError, TopicPublisher},
};

const PUBSUB_API_BASE_URL: &str = "https://pubsub.googleapis.com";

/// An error from one attempt to publish to PubSub, classified for retry.
#[derive(Debug, thiserror::Error)]
enum PubSubError {
    #[error("failed to obtain Oauth token: {0}")]
    Auth(#[source] anyhow::Error),
    #[error("PubSub publish request failed: {0}")]
    Request(Box<ureq::Error>),
}

impl PubSubError {
    fn is_retryable(&self) -> bool {
        match self {
            PubSubError::Auth(_) => true,
            // Per Google documentation, 429 Too Many Requests should be
            // retried with exponential backoff, as should server errors.
            // https://cloud.google.com/pubsub/docs/reference/error-codes
            PubSubError::Request(e) => ureq_retryable(e),
        }
    }
}

/// A TopicPublisher backed by a Google Cloud PubSub topic, publishing over
/// the REST API with an Oauth token in an Authorization header.
/// API reference: https://cloud.google.com/pubsub/docs/reference/rest/v1/projects.topics/publish
#[derive(Debug)]
pub struct PubSubTopicPublisher {
    publish_url: String,
    oauth_token_provider: GcpOauthTokenProvider,
    agent: ureq::Agent,
    logger: Logger,
}

impl PubSubTopicPublisher {
    pub fn new(
        pubsub_api_endpoint: Option<&str>,
        gcp_project_id: &str,
        topic_id: &str,
        oauth_token_provider: GcpOauthTokenProvider,
        parent_logger: &Logger,
    ) -> PubSubTopicPublisher {
        let logger = parent_logger.new(o!(
            "gcp_project_id" => gcp_project_id.to_owned(),
            event::TASK_QUEUE_ID => topic_id.to_owned(),
        ));
        PubSubTopicPublisher {
            publish_url: format!(
                "{}/v1/projects/{}/topics/{}:publish",
                pubsub_api_endpoint.unwrap_or(PUBSUB_API_BASE_URL),
                gcp_project_id,
                topic_id
            ),
            oauth_token_provider,
            // By default, ureq will wait forever to connect or read.
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(30))
                .build(),
            logger,
        }
    }
}

impl TopicPublisher for PubSubTopicPublisher {
    fn publish(&self, message: &str) -> Result<(), TaskQueueError> {
        // The task JSON is carried as base64 in the PubSub message data
        // field.
        let data = BASE64_STANDARD.encode(message);

        retry_request(
            &self.logger.new(o!(event::ACTION => "publish task")),
            || {
                let token = self
                    .oauth_token_provider
                    .ensure_oauth_token()
                    .map_err(PubSubError::Auth)?;
                self.agent
                    .post(&self.publish_url)
                    .set("Authorization", &format!("Bearer {token}"))
                    .send_json(ureq::json!({
                        "messages": [{ "data": data }]
                    }))
                    .map_err(|e| PubSubError::Request(Box::new(e)))?;
                Ok(())
            },
            PubSubError::is_retryable,
        )
        .map_err(|e| TaskQueueError::Publish(anyhow!(e)))
    }
}
