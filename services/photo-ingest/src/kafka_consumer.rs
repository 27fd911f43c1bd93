use crate::config::KafkaConfig;
use crate::pipeline::Pipeline;
use crate::response::IngestResponse;
use anyhow::{Context, Result};
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

/// Kafka consumer for bucket notification documents (MinIO and other
/// S3-compatible stores publish the S3 `Records` shape).
pub struct NotificationConsumer {
    consumer: StreamConsumer,
    pipeline: Arc<Pipeline>,
    job_semaphore: Arc<Semaphore>,
}

impl NotificationConsumer {
    /// Create a new Kafka consumer for bucket notifications
    pub fn new(config: &KafkaConfig, pipeline: Arc<Pipeline>, job_semaphore: Arc<Semaphore>) -> Result<Self> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string());

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: StreamConsumer = client_config
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.notifications_topic])
            .context("Failed to subscribe to notifications topic")?;

        info!(
            topic = %config.notifications_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            pipeline,
            job_semaphore,
        })
    }

    /// Start consuming and processing messages
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<()> {
        info!("Starting notification consumer");

        let mut message_stream = self.consumer.stream();

        while let Some(message_result) = message_stream.next().await {
            match message_result {
                Ok(message) => match self.process_message(&message).await {
                    Ok(response) => {
                        // Committed for every status, redelivery would rerun the same job
                        if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                            warn!(error = %e, "Failed to commit offset");
                        }
                        debug!(status = response.status(), "Notification handled");
                        metrics::counter!("photo_ingest.kafka.messages.processed").increment(1);
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            partition = message.partition(),
                            offset = message.offset(),
                            "Failed to process message"
                        );
                        metrics::counter!("photo_ingest.kafka.messages.failed").increment(1);
                    }
                },
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("photo_ingest.kafka.errors").increment(1);
                }
            }
        }

        Ok(())
    }

    /// Process a single Kafka message
    #[instrument(skip(self, message), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(&self, message: &BorrowedMessage<'_>) -> Result<IngestResponse> {
        let event = decode_payload(message.payload())?;

        let _permit = self
            .job_semaphore
            .acquire()
            .await
            .context("Failed to acquire job semaphore")?;

        Ok(self.pipeline.handle(event).await)
    }
}

fn decode_payload(payload: Option<&[u8]>) -> Result<serde_json::Value> {
    let payload = payload.context("Message has no payload")?;
    serde_json::from_slice(payload).context("Failed to deserialize bucket notification")
}
