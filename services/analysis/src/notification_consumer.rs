use crate::config::SqsConfig;
use crate::trigger::{IngestionTrigger, S3EventNotification};
use anyhow::{Context, Result};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::Message;
use aws_sdk_sqs::Client as SqsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Pause after a failed receive before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Long-polls the notification queue and feeds each batch to the trigger
///
/// A message is deleted only after its whole batch was processed; failed
/// messages become visible again once the visibility timeout lapses.
pub struct NotificationConsumer {
    client: SqsClient,
    config: SqsConfig,
    trigger: Arc<IngestionTrigger>,
}

impl NotificationConsumer {
    pub fn new(client: SqsClient, config: &SqsConfig, trigger: Arc<IngestionTrigger>) -> Self {
        Self {
            client,
            config: config.clone(),
            trigger,
        }
    }

    /// Receive and process messages until `shutdown` is cancelled
    ///
    /// Cancellation is only observed between receives, so an in-flight
    /// batch always runs to completion.
    #[instrument(skip(self, shutdown), fields(queue_url = %self.config.queue_url))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!("Starting notification consumer");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.receive() => received,
            };

            match received {
                Ok(messages) => {
                    for message in &messages {
                        self.handle(message).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "SQS receive failed");
                    metrics::counter!("analysis.sqs.errors").increment(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Notification consumer stopped");
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<Message>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.config.queue_url)
            .max_number_of_messages(self.config.max_messages)
            .wait_time_seconds(self.config.wait_time_secs)
            .visibility_timeout(self.config.visibility_timeout_secs)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .context("Failed to receive messages")?;

        Ok(output.messages().to_vec())
    }

    async fn handle(&self, message: &Message) {
        let message_id = message.message_id().unwrap_or("unknown");

        if let Err(e) = self.process_message(message).await {
            error!(
                error = %format!("{:#}", e),
                message_id,
                "Failed to process notification"
            );
            metrics::counter!("analysis.messages.failed").increment(1);
            return;
        }

        // Delete on success
        if let Err(e) = self.delete(message).await {
            warn!(error = %e, message_id, "Failed to delete processed message");
        }
        metrics::counter!("analysis.messages.processed").increment(1);
    }

    #[instrument(skip(self, message), fields(message_id = message.message_id().unwrap_or("unknown")))]
    async fn process_message(&self, message: &Message) -> Result<()> {
        let event = parse_notification(message.body())?;

        debug!(records = event.records.len(), "Received notification batch");

        self.trigger
            .process_batch(&event)
            .await
            .context("Failed to process notification batch")?;

        Ok(())
    }

    async fn delete(&self, message: &Message) -> Result<()> {
        let receipt_handle = message
            .receipt_handle()
            .context("Message has no receipt handle")?;

        self.client
            .delete_message()
            .queue_url(&self.config.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))?;

        Ok(())
    }
}

/// Decode an SQS message body into an S3 event notification
pub fn parse_notification(body: Option<&str>) -> Result<S3EventNotification> {
    let body = body.context("Message has no body")?;
    serde_json::from_str(body).context("Failed to deserialize S3 event notification")
}
