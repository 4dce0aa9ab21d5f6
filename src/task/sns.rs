use anyhow::anyhow;
use rusoto_core::{
    credential::DefaultCredentialsProvider, region::ParseRegionError, Region, RusotoError,
};
use rusoto_sns::{PublishError, PublishInput, Sns, SnsClient};
use slog::{o, Logger};
use std::str::FromStr;
use tokio::runtime::Handle;

use crate::{
    logging::event,
    retries::retry_request,
    storage::rusoto_retryable,
    task::{TaskQueueError, TopicPublisher},
};

/// A TopicPublisher backed by an AWS SNS topic, authenticating with the
/// ambient AWS credential chain.
#[derive(Debug)]
pub struct SnsTopicPublisher {
    topic_arn: String,
    region: Region,
    runtime_handle: Handle,
    logger: Logger,
}

impl SnsTopicPublisher {
    /// Creates a publisher for the provided topic ARN
    /// (arn:aws:sns:{region}:{account}:{name}). The region is taken from the
    /// ARN.
    pub fn new(
        topic_arn: &str,
        runtime_handle: &Handle,
        parent_logger: &Logger,
    ) -> Result<SnsTopicPublisher, TaskQueueError> {
        let region = region_from_arn(topic_arn)
            .map_err(|e| TaskQueueError::Publish(anyhow!("bad SNS topic ARN {topic_arn}: {e}")))?;
        Ok(SnsTopicPublisher {
            topic_arn: topic_arn.to_owned(),
            region,
            runtime_handle: runtime_handle.clone(),
            logger: parent_logger.new(o!(
                event::TASK_QUEUE_ID => topic_arn.to_owned(),
            )),
        })
    }

    fn client(&self) -> Result<SnsClient, TaskQueueError> {
        let http_client = rusoto_core::HttpClient::new()
            .map_err(|e| TaskQueueError::Publish(anyhow!("failed to construct TLS client: {e}")))?;
        let credentials_provider = DefaultCredentialsProvider::new()
            .map_err(|e| TaskQueueError::Publish(anyhow!("failed to obtain AWS credentials: {e}")))?;
        Ok(SnsClient::new_with(
            http_client,
            credentials_provider,
            self.region.clone(),
        ))
    }
}

/// Extracts the region from an SNS topic ARN of the form
/// arn:aws:sns:{region}:{account}:{name}.
fn region_from_arn(arn: &str) -> Result<Region, ParseRegionError> {
    Region::from_str(arn.split(':').nth(3).unwrap_or_default())
}

impl TopicPublisher for SnsTopicPublisher {
    fn publish(&self, message: &str) -> Result<(), TaskQueueError> {
        let client = self.client()?;

        retry_request(
            &self.logger.new(o!(event::ACTION => "publish task")),
            || {
                let request = PublishInput {
                    topic_arn: Some(self.topic_arn.clone()),
                    message: message.to_owned(),
                    ..Default::default()
                };
                self.runtime_handle.block_on(client.publish(request))
            },
            |e: &RusotoError<PublishError>| rusoto_retryable(e),
        )
        .map_err(|e| TaskQueueError::Publish(anyhow!("SNS publish failed: {e}")))?;
        Ok(())
    }
}
