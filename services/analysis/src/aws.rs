use crate::config::{AwsConfig, S3Config};
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_rekognition::Client as RekognitionClient;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_sqs::Client as SqsClient;
use aws_types::SdkConfig;
use tracing::info;

/// AWS service clients, built once at startup and shared by every component
#[derive(Clone, Debug)]
pub struct AwsClients {
    pub s3: S3Client,
    pub rekognition: RekognitionClient,
    pub dynamodb: DynamoDbClient,
    pub sqs: SqsClient,
}

impl AwsClients {
    /// Resolve credentials and build every client from one shared config
    pub async fn load(aws: &AwsConfig, s3: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(aws.region.clone()));

        // Custom endpoint for LocalStack
        if let Some(ref endpoint_url) = aws.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let shared = loader.load().await;

        info!(
            region = %aws.region,
            endpoint = aws.endpoint_url.as_deref().unwrap_or("default"),
            "AWS clients initialized"
        );

        Self::from_shared(&shared, s3.force_path_style)
    }

    pub fn from_shared(shared: &SdkConfig, force_path_style: bool) -> Self {
        let s3_config = S3ConfigBuilder::from(shared)
            .force_path_style(force_path_style)
            .build();

        Self {
            s3: S3Client::from_conf(s3_config),
            rekognition: RekognitionClient::new(shared),
            dynamodb: DynamoDbClient::new(shared),
            sqs: SqsClient::new(shared),
        }
    }
}
