//! AgroVision Analysis Service
//!
//! Plant leaf health analysis for the AgroVision image app. Clients upload a
//! leaf photo straight to S3 with a presigned grant; the bucket notifies an
//! SQS queue, this service classifies the image with a Rekognition Custom
//! Labels model and records the verdict in DynamoDB. `POST /analyze` waits a
//! bounded time for that verdict to appear.
//!
//! ## Architecture
//!
//! ```text
//!   POST /upload            S3 bucket              SQS queue
//! ┌──────────────┐  PUT   ┌──────────────┐      ┌──────────────┐
//! │ Upload       │───────▶│ uploads/     │─────▶│ Notification │
//! │ Authorizer   │        │   {id}.{ext} │      │ Consumer     │
//! └──────────────┘        └──────────────┘      └──────────────┘
//!                                ▲                     │
//!                                │ labels              ▼
//!                         ┌──────────────┐      ┌──────────────┐
//!                         │ Rekognition  │◀─────│ Ingestion    │
//!                         │ Detector     │      │ Trigger      │
//!                         └──────────────┘      └──────────────┘
//!                                                      │ upsert
//!   POST /analyze                                      ▼
//! ┌──────────────┐          get by id           ┌──────────────┐
//! │ Result       │─────────────────────────────▶│ Result Store │
//! │ Poller       │                              │ (DynamoDB)   │
//! └──────────────┘                              └──────────────┘
//! ```

pub mod api;
pub mod aws;
pub mod classifier;
pub mod config;
pub mod identity;
pub mod notification_consumer;
pub mod poller;
pub mod result_store;
pub mod trigger;
pub mod uploads;

pub use api::{create_router, start_api_server, AppState, ErrorResponse};
pub use aws::AwsClients;
pub use classifier::{
    Classifier, ClassifierBuilder, DetectionError, HealthStatus, ImageRef, Label, LabelDetector,
    LabelRules, RekognitionDetector, Verdict,
};
pub use config::Config;
pub use identity::{IdentityError, ObjectIdentity};
pub use notification_consumer::NotificationConsumer;
pub use poller::{PollBudget, PollError, PollState, ResultPoller, Sleeper, TokioSleeper};
pub use result_store::{
    DynamoResultStore, InMemoryResultStore, ResultRecord, ResultStore, StoreError,
    StoredRecommendations, StoredResult,
};
pub use trigger::{IngestError, IngestionTrigger, S3EventNotification, S3EventRecord};
pub use uploads::{UploadAuthorizer, UploadError, UploadGrant, UploadRequest};
