//! AWS backends: SQS task queue and S3 object store.
//!
//! These mirror the Postgres/HTTP backends behind the same traits so the
//! control plane, agents, and reclaimer can run against managed services
//! unchanged. Priority tiers are separate SQS queues named
//! `<base>__<priority>`, wired by the harness.

use crate::{
    Error, ObjectStore as ObjectStoreTrait, QueueMessage, QueueSend, Result, SendFailure,
    SendReport, TaskQueue as TaskQueueTrait,
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use std::time::Duration;

/// SQS allows at most ten entries per batch send.
const SQS_MAX_BATCH: usize = 10;

#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    queue_name: String,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_name: impl Into<String>,
        queue_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            queue_name: queue_name.into(),
            queue_url: queue_url.into(),
        }
    }

    pub async fn from_env(queue_name: impl Into<String>) -> Result<Self> {
        let queue_name = queue_name.into();
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = aws_sdk_sqs::Client::new(&config);
        let resp = client
            .get_queue_url()
            .queue_name(&queue_name)
            .send()
            .await
            .context("sqs GetQueueUrl")
            .map_err(Error::from)?;
        let queue_url = resp
            .queue_url()
            .ok_or_else(|| Error::msg("sqs GetQueueUrl returned no queue_url"))?
            .to_string();
        Ok(Self {
            client,
            queue_name,
            queue_url,
        })
    }
}

#[async_trait]
impl TaskQueueTrait for SqsQueue {
    fn name(&self) -> &str {
        &self.queue_name
    }

    async fn send(&self, entries: &[QueueSend]) -> Result<SendReport> {
        let mut report = SendReport::default();

        for chunk in entries.chunks(SQS_MAX_BATCH) {
            let mut batch = self.client.send_message_batch().queue_url(&self.queue_url);
            for (index, entry) in chunk.iter().enumerate() {
                let batch_entry = aws_sdk_sqs::types::SendMessageBatchRequestEntry::builder()
                    .id(index.to_string())
                    .message_body(&entry.body)
                    .build()
                    .context("build sqs batch entry")
                    .map_err(Error::from)?;
                batch = batch.entries(batch_entry);
            }

            let resp = batch
                .send()
                .await
                .context("sqs SendMessageBatch")
                .map_err(Error::from)?;

            for ok in resp.successful() {
                if let Some(entry) = ok.id().parse::<usize>().ok().and_then(|i| chunk.get(i)) {
                    report.sent.push(entry.id.clone());
                }
            }
            for failed in resp.failed() {
                if let Some(entry) = failed.id().parse::<usize>().ok().and_then(|i| chunk.get(i))
                {
                    report.failed.push(SendFailure {
                        id: entry.id.clone(),
                        reason: failed.message().unwrap_or("unspecified").to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    async fn receive(&self, wait: Duration, visibility: Duration) -> Result<Option<QueueMessage>> {
        let wait_secs: i32 = wait.as_secs().min(20).try_into().unwrap_or(20);
        let visibility_secs: i32 = visibility
            .as_secs()
            .min(i32::MAX as u64)
            .try_into()
            .unwrap_or(i32::MAX);

        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait_secs)
            .visibility_timeout(visibility_secs)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
            )
            .send()
            .await
            .context("sqs ReceiveMessage")
            .map_err(Error::from)?;

        let Some(message) = resp.messages().first() else {
            return Ok(None);
        };
        let Some(handle) = message.receipt_handle() else {
            return Ok(None);
        };

        let deliveries = message
            .attributes()
            .and_then(|m| {
                m.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
            })
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(1);

        Ok(Some(QueueMessage {
            handle: handle.to_string(),
            message_id: message.message_id().unwrap_or_default().to_string(),
            body: message.body().unwrap_or_default().to_string(),
            deliveries,
        }))
    }

    async fn ack(&self, handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(handle)
            .send()
            .await
            .context("sqs DeleteMessage")
            .map_err(Error::from)?;
        Ok(())
    }

    async fn extend_lease(&self, handle: &str, visibility: Duration) -> Result<()> {
        let visibility_secs: i32 = visibility
            .as_secs()
            .min(43_200)
            .try_into()
            .unwrap_or(43_200);

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(handle)
            .visibility_timeout(visibility_secs)
            .send()
            .await
            .context("sqs ChangeMessageVisibility")
            .map_err(Error::from)?;
        Ok(())
    }

    async fn depth(&self) -> Result<i64> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .context("sqs GetQueueAttributes")
            .map_err(Error::from)?;

        let depth = resp
            .attributes()
            .and_then(|m| {
                m.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            })
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(depth)
    }
}

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_env(bucket: impl Into<String>) -> Result<Self> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        })
    }
}

#[async_trait]
impl ObjectStoreTrait for S3ObjectStore {
    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("s3 PutObject bucket={} key={key}", self.bucket))
            .map_err(Error::from)?;
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key())
                {
                    return Err(Error::not_found(format!("no object at key [{key}]")));
                }
                return Err(Error::from(
                    anyhow::Error::from(err)
                        .context(format!("s3 GetObject bucket={} key={key}", self.bucket)),
                ));
            }
        };

        let bytes = resp
            .body
            .collect()
            .await
            .context("s3 GetObject body collect")
            .map_err(Error::from)?
            .into_bytes()
            .to_vec();
        Ok(bytes)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match resp {
            Ok(_) => Ok(true),
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(|service| service.is_not_found())
                {
                    return Ok(false);
                }
                Err(Error::from(anyhow::Error::from(err).context(format!(
                    "s3 HeadObject bucket={} key={key}",
                    self.bucket
                ))))
            }
        }
    }
}
