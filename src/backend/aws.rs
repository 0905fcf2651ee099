//! AWS backends — S3, SQS, SageMaker, CloudWatch, and ECR
//!
//! Compiled only with the `aws` feature. Every client is built from one
//! shared SDK configuration loaded by [`load_sdk_config`].

use async_trait::async_trait;
use bytes::Bytes;

use aws_sdk_s3::types::{
    Event, FilterRule, FilterRuleName, NotificationConfiguration,
    NotificationConfigurationFilter, QueueConfiguration, S3KeyFilter,
};
use aws_sdk_sqs::types::QueueAttributeName;

use super::{
    InferenceEndpoint, InvocationAck, InvocationRequest, JobQueue, ObjectLocation, ObjectStore,
    QueueMessage,
};
use crate::bootstrap::{NotificationRule, Provisioner, QueueBinding};
use crate::config::{AwsConfig, ScalingPolicy, Statistic};
use crate::error::{DispatchError, Result};
use crate::registry::{AuthorizationData, RegistryAuth};
use crate::scaling::{
    BacklogSample, BacklogSource, CapacityExecutor, ScaleDecision, ScaleResult, ScalingTarget,
};

/// Load the shared SDK configuration, honoring an explicit region and
/// endpoint override (e.g. a local emulator)
pub async fn load_sdk_config(config: &AwsConfig) -> aws_config::SdkConfig {
    let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.region {
        builder = builder.region(aws_config::Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint_url {
        builder = builder.endpoint_url(endpoint);
    }
    builder.load().await
}

// ---------------------------------------------------------------------------
// S3Store
// ---------------------------------------------------------------------------

pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_s3::Client::new(config),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get_object(&self, location: &ObjectLocation) -> Result<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Store(format!(
                    "GetObject failed for '{}': {}",
                    location,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ))
            })?;

        let body = output.body.collect().await.map_err(|e| {
            DispatchError::Store(format!("Failed to read body of '{}': {}", location, e))
        })?;
        Ok(body.into_bytes())
    }

    fn name(&self) -> &str {
        "s3"
    }
}

// ---------------------------------------------------------------------------
// SqsQueue
// ---------------------------------------------------------------------------

pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    url: String,
}

impl SqsQueue {
    pub fn new(config: &aws_config::SdkConfig, url: impl Into<String>) -> Self {
        Self {
            client: aws_sdk_sqs::Client::new(config),
            url: url.into(),
        }
    }

    /// Resolve a queue URL by name
    pub async fn resolve_url(config: &aws_config::SdkConfig, name: &str) -> Result<String> {
        let output = aws_sdk_sqs::Client::new(config)
            .get_queue_url()
            .queue_name(name)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Queue(format!(
                    "GetQueueUrl failed for '{}': {}",
                    name,
                    aws_sdk_sqs::error::DisplayErrorContext(&e)
                ))
            })?;
        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| DispatchError::Queue(format!("Queue '{}' has no URL", name)))
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn receive(&self, max_messages: u32, wait_time_secs: u32) -> Result<Vec<QueueMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait_time_secs as i32)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Queue(format!(
                    "ReceiveMessage failed: {}",
                    aws_sdk_sqs::error::DisplayErrorContext(&e)
                ))
            })?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                let receipt_handle = m.receipt_handle()?.to_string();
                Some(QueueMessage {
                    message_id: m.message_id().unwrap_or_default().to_string(),
                    receipt_handle,
                    body: m.body().unwrap_or_default().to_string(),
                })
            })
            .collect();
        Ok(messages)
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(&message.receipt_handle)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Queue(format!(
                    "DeleteMessage failed for '{}': {}",
                    message.message_id,
                    aws_sdk_sqs::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.url
    }
}

// ---------------------------------------------------------------------------
// SageMakerEndpoint
// ---------------------------------------------------------------------------

pub struct SageMakerEndpoint {
    client: aws_sdk_sagemakerruntime::Client,
}

impl SageMakerEndpoint {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sagemakerruntime::Client::new(config),
        }
    }
}

#[async_trait]
impl InferenceEndpoint for SageMakerEndpoint {
    async fn invoke_async(&self, request: &InvocationRequest) -> Result<InvocationAck> {
        let output = self
            .client
            .invoke_endpoint_async()
            .endpoint_name(&request.endpoint_name)
            .input_location(&request.input_location)
            .content_type(&request.content_type)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Endpoint(format!(
                    "InvokeEndpointAsync failed for '{}': {}",
                    request.input_location,
                    aws_sdk_sagemakerruntime::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(InvocationAck {
            inference_id: output.inference_id().map(str::to_string),
            output_location: output.output_location().map(str::to_string),
        })
    }

    fn name(&self) -> &str {
        "sagemaker"
    }
}

// ---------------------------------------------------------------------------
// CloudWatchBacklogSource
// ---------------------------------------------------------------------------

pub struct CloudWatchBacklogSource {
    client: aws_sdk_cloudwatch::Client,
}

impl CloudWatchBacklogSource {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_cloudwatch::Client::new(config),
        }
    }
}

fn cloudwatch_statistic(statistic: Statistic) -> aws_sdk_cloudwatch::types::Statistic {
    use aws_sdk_cloudwatch::types::Statistic as Cw;
    match statistic {
        Statistic::Avg => Cw::Average,
        Statistic::Max => Cw::Maximum,
        Statistic::Min => Cw::Minimum,
        Statistic::Sum => Cw::Sum,
    }
}

#[async_trait]
impl BacklogSource for CloudWatchBacklogSource {
    async fn latest(
        &self,
        policy: &ScalingPolicy,
        target: &ScalingTarget,
    ) -> Result<Option<BacklogSample>> {
        use aws_sdk_cloudwatch::primitives::DateTime;
        use aws_sdk_cloudwatch::types::Dimension;

        let period = policy.evaluation_period_secs.max(60) as i64;
        let end = chrono::Utc::now().timestamp();
        // a few periods back so a late datapoint is still found
        let start = end - 3 * period;

        let dimension = Dimension::builder()
            .name("EndpointName")
            .value(&target.endpoint)
            .build()
            .map_err(|e| DispatchError::Metrics(format!("Failed to build dimension: {}", e)))?;

        let output = self
            .client
            .get_metric_statistics()
            .namespace(&policy.metric_namespace)
            .metric_name(&policy.metric_name)
            .dimensions(dimension)
            .start_time(DateTime::from_secs(start))
            .end_time(DateTime::from_secs(end))
            .period(period as i32)
            .statistics(cloudwatch_statistic(policy.statistic))
            .send()
            .await
            .map_err(|e| {
                DispatchError::Metrics(format!(
                    "GetMetricStatistics failed for '{}': {}",
                    policy.metric_name,
                    aws_sdk_cloudwatch::error::DisplayErrorContext(&e)
                ))
            })?;

        let latest = output
            .datapoints()
            .iter()
            .filter_map(|d| {
                let value = match policy.statistic {
                    Statistic::Avg => d.average(),
                    Statistic::Max => d.maximum(),
                    Statistic::Min => d.minimum(),
                    Statistic::Sum => d.sum(),
                }?;
                let secs = d.timestamp().map(|t| t.secs()).unwrap_or(0);
                Some((secs, value))
            })
            .max_by_key(|(secs, _)| *secs);

        Ok(latest.map(|(secs, value)| BacklogSample {
            metric_name: policy.metric_name.clone(),
            value,
            timestamp: chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now),
        }))
    }

    fn name(&self) -> &str {
        "cloudwatch"
    }
}

// ---------------------------------------------------------------------------
// SageMakerCapacityExecutor
// ---------------------------------------------------------------------------

/// Applies capacity through `UpdateEndpointWeightsAndCapacities`
pub struct SageMakerCapacityExecutor {
    client: aws_sdk_sagemaker::Client,
}

impl SageMakerCapacityExecutor {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_sagemaker::Client::new(config),
        }
    }
}

#[async_trait]
impl CapacityExecutor for SageMakerCapacityExecutor {
    async fn execute(&self, decision: &ScaleDecision) -> Result<ScaleResult> {
        use aws_sdk_sagemaker::types::DesiredWeightAndCapacity;

        let desired = DesiredWeightAndCapacity::builder()
            .variant_name(&decision.target.variant)
            .desired_instance_count(decision.desired_capacity as i32)
            .build()
            .map_err(|e| {
                DispatchError::Scaling(format!("Failed to build capacity request: {}", e))
            })?;

        self.client
            .update_endpoint_weights_and_capacities()
            .endpoint_name(&decision.target.endpoint)
            .desired_weights_and_capacities(desired)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Scaling(format!(
                    "UpdateEndpointWeightsAndCapacities failed for '{}': {}",
                    decision.target,
                    aws_sdk_sagemaker::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(ScaleResult {
            accepted: true,
            actual_capacity: decision.desired_capacity,
            message: format!(
                "SageMaker: '{}' updating to {} instances",
                decision.target, decision.desired_capacity
            ),
        })
    }

    async fn current_capacity(&self, target: &ScalingTarget) -> Result<u32> {
        let output = self
            .client
            .describe_endpoint()
            .endpoint_name(&target.endpoint)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Scaling(format!(
                    "DescribeEndpoint failed for '{}': {}",
                    target.endpoint,
                    aws_sdk_sagemaker::error::DisplayErrorContext(&e)
                ))
            })?;

        let variant = output
            .production_variants()
            .iter()
            .find(|v| {
                let name: Option<&str> = v.variant_name().into();
                name == Some(target.variant.as_str())
            })
            .ok_or_else(|| {
                DispatchError::Scaling(format!("Variant '{}' not found", target))
            })?;

        Ok(variant
            .desired_instance_count()
            .or(variant.current_instance_count())
            .unwrap_or(0)
            .max(0) as u32)
    }

    fn name(&self) -> &str {
        "sagemaker"
    }
}

// ---------------------------------------------------------------------------
// EcrRegistryAuth
// ---------------------------------------------------------------------------

pub struct EcrRegistryAuth {
    client: aws_sdk_ecr::Client,
}

impl EcrRegistryAuth {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_ecr::Client::new(config),
        }
    }
}

#[async_trait]
impl RegistryAuth for EcrRegistryAuth {
    #[allow(deprecated)]
    async fn authorization_tokens(&self, registry_ids: &[String]) -> Result<Vec<AuthorizationData>> {
        let output = self
            .client
            .get_authorization_token()
            .set_registry_ids(Some(registry_ids.to_vec()))
            .send()
            .await
            .map_err(|e| {
                DispatchError::Registry(format!(
                    "GetAuthorizationToken failed: {}",
                    aws_sdk_ecr::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(output
            .authorization_data()
            .iter()
            .map(|d| AuthorizationData {
                token: d.authorization_token().unwrap_or_default().to_string(),
                expires_at: d
                    .expires_at()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0)),
                proxy_endpoint: d.proxy_endpoint().map(str::to_string),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "ecr"
    }
}

// ---------------------------------------------------------------------------
// S3SqsProvisioner
// ---------------------------------------------------------------------------

/// Queue access policy allowing `bucket` to publish creation events
pub fn queue_policy(queue_arn: &str, bucket: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Sid": "AllowStoreNotifications",
            "Effect": "Allow",
            "Principal": { "Service": "s3.amazonaws.com" },
            "Action": "sqs:SendMessage",
            "Resource": queue_arn,
            "Condition": { "ArnLike": { "aws:SourceArn": format!("arn:aws:s3:::{}", bucket) } }
        }]
    })
    .to_string()
}

pub struct S3SqsProvisioner {
    s3: aws_sdk_s3::Client,
    sqs: aws_sdk_sqs::Client,
}

impl S3SqsProvisioner {
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            s3: aws_sdk_s3::Client::new(config),
            sqs: aws_sdk_sqs::Client::new(config),
        }
    }

    async fn create_or_get_queue(&self, name: &str, visibility_timeout_secs: u64) -> Result<String> {
        let created = self
            .sqs
            .create_queue()
            .queue_name(name)
            .attributes(
                QueueAttributeName::VisibilityTimeout,
                visibility_timeout_secs.to_string(),
            )
            .send()
            .await;

        match created {
            Ok(output) => output
                .queue_url()
                .map(str::to_string)
                .ok_or_else(|| DispatchError::Queue(format!("Queue '{}' has no URL", name))),
            Err(e) => {
                let detail = aws_sdk_sqs::error::DisplayErrorContext(&e).to_string();
                // existing queue with different attributes
                if !detail.contains("QueueAlreadyExists") && !detail.contains("QueueNameExists") {
                    return Err(DispatchError::Queue(format!(
                        "CreateQueue failed for '{}': {}",
                        name, detail
                    )));
                }
                let output = self
                    .sqs
                    .get_queue_url()
                    .queue_name(name)
                    .send()
                    .await
                    .map_err(|e| {
                        DispatchError::Queue(format!(
                            "GetQueueUrl failed for '{}': {}",
                            name,
                            aws_sdk_sqs::error::DisplayErrorContext(&e)
                        ))
                    })?;
                output
                    .queue_url()
                    .map(str::to_string)
                    .ok_or_else(|| DispatchError::Queue(format!("Queue '{}' has no URL", name)))
            }
        }
    }
}

#[async_trait]
impl Provisioner for S3SqsProvisioner {
    async fn ensure_queue(
        &self,
        name: &str,
        visibility_timeout_secs: u64,
        bucket: &str,
    ) -> Result<QueueBinding> {
        let url = self.create_or_get_queue(name, visibility_timeout_secs).await?;

        let attributes = self
            .sqs
            .get_queue_attributes()
            .queue_url(&url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Queue(format!(
                    "GetQueueAttributes failed for '{}': {}",
                    url,
                    aws_sdk_sqs::error::DisplayErrorContext(&e)
                ))
            })?;
        let arn = attributes
            .attributes()
            .and_then(|a| a.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| DispatchError::Queue(format!("Queue '{}' has no ARN", url)))?;

        self.sqs
            .set_queue_attributes()
            .queue_url(&url)
            .attributes(QueueAttributeName::Policy, queue_policy(&arn, bucket))
            .send()
            .await
            .map_err(|e| {
                DispatchError::Queue(format!(
                    "SetQueueAttributes failed for '{}': {}",
                    url,
                    aws_sdk_sqs::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(QueueBinding { url, arn })
    }

    async fn ensure_notifications(
        &self,
        bucket: &str,
        queue: &QueueBinding,
        rules: &[NotificationRule],
    ) -> Result<()> {
        let existing = self
            .s3
            .get_bucket_notification_configuration()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Store(format!(
                    "GetBucketNotificationConfiguration failed for '{}': {}",
                    bucket,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ))
            })?;

        // keep queue rules that are not ours, replace ours
        let mut queue_configurations: Vec<QueueConfiguration> = existing
            .queue_configurations()
            .iter()
            .filter(|c| {
                let id = c.id().unwrap_or_default();
                !rules.iter().any(|r| r.id == id)
            })
            .cloned()
            .collect();

        for rule in rules {
            let filter = NotificationConfigurationFilter::builder()
                .key(
                    S3KeyFilter::builder()
                        .filter_rules(
                            FilterRule::builder()
                                .name(FilterRuleName::Prefix)
                                .value(&rule.prefix)
                                .build(),
                        )
                        .build(),
                )
                .build();
            let configuration = QueueConfiguration::builder()
                .id(&rule.id)
                .queue_arn(&queue.arn)
                .set_events(Some(rule.events.iter().map(|e| Event::from(e.as_str())).collect()))
                .filter(filter)
                .build()
                .map_err(|e| {
                    DispatchError::Store(format!("Failed to build rule '{}': {}", rule.id, e))
                })?;
            queue_configurations.push(configuration);
        }

        let configuration = NotificationConfiguration::builder()
            .set_topic_configurations(Some(existing.topic_configurations().to_vec()))
            .set_lambda_function_configurations(Some(
                existing.lambda_function_configurations().to_vec(),
            ))
            .set_event_bridge_configuration(existing.event_bridge_configuration().cloned())
            .set_queue_configurations(Some(queue_configurations))
            .build();

        self.s3
            .put_bucket_notification_configuration()
            .bucket(bucket)
            .notification_configuration(configuration)
            .send()
            .await
            .map_err(|e| {
                DispatchError::Store(format!(
                    "PutBucketNotificationConfiguration failed for '{}': {}",
                    bucket,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "s3-sqs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_policy() {
        let policy: serde_json::Value =
            serde_json::from_str(&queue_policy("arn:aws:sqs:us-east-1:1:q", "B")).unwrap();
        let statement = &policy["Statement"][0];
        assert_eq!(statement["Principal"]["Service"], "s3.amazonaws.com");
        assert_eq!(statement["Action"], "sqs:SendMessage");
        assert_eq!(statement["Resource"], "arn:aws:sqs:us-east-1:1:q");
        assert_eq!(
            statement["Condition"]["ArnLike"]["aws:SourceArn"],
            "arn:aws:s3:::B"
        );
    }

    #[test]
    fn test_cloudwatch_statistic() {
        use aws_sdk_cloudwatch::types::Statistic as Cw;
        assert_eq!(cloudwatch_statistic(Statistic::Avg), Cw::Average);
        assert_eq!(cloudwatch_statistic(Statistic::Max), Cw::Maximum);
    }
}
