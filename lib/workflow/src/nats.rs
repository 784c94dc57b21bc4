//! NATS JetStream transport for lifecycle events and run requests.
//!
//! - Lifecycle events go to `automation.events.<event_type>` on a limits
//!   stream, for any number of downstream consumers.
//! - Run requests go to `automation.runs.<workflow_id>` on a work-queue
//!   stream, consumed by workers through one durable pull consumer.

use crate::envelope::{CURRENT_VERSION, Envelope, RawEnvelope};
use crate::events::{EventSink, EventSinkError, EventType, LifecycleEvent};
use crate::execution::RunRequest;
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use autoflow_core::WorkflowId;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const EVENTS_SUBJECT_PREFIX: &str = "automation.events";

const RUNS_SUBJECT_PREFIX: &str = "automation.runs";

const EVENTS_STREAM_NAME: &str = "AUTOMATION_EVENTS";

const RUNS_STREAM_NAME: &str = "AUTOMATION_RUNS";

const RUNS_CONSUMER_NAME: &str = "autoflow-worker";

/// Connection and naming for the JetStream resources.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Defaults to `AUTOMATION_EVENTS`.
    pub events_stream_name: Option<String>,
    /// Defaults to `AUTOMATION_RUNS`.
    pub runs_stream_name: Option<String>,
    /// Durable consumer shared by all workers. Defaults to `autoflow-worker`.
    pub consumer_name: Option<String>,
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events_stream_name: None,
            runs_stream_name: None,
            consumer_name: None,
        }
    }

    fn events_stream(&self) -> &str {
        self.events_stream_name
            .as_deref()
            .unwrap_or(EVENTS_STREAM_NAME)
    }

    fn runs_stream(&self) -> &str {
        self.runs_stream_name.as_deref().unwrap_or(RUNS_STREAM_NAME)
    }

    fn consumer(&self) -> &str {
        self.consumer_name.as_deref().unwrap_or(RUNS_CONSUMER_NAME)
    }
}

async fn connect(url: &str) -> Result<jetstream::Context, String> {
    let client = async_nats::connect(url).await.map_err(|e| e.to_string())?;
    Ok(jetstream::new(client))
}

fn event_subject(event_type: EventType) -> String {
    format!("{EVENTS_SUBJECT_PREFIX}.{event_type}")
}

fn run_subject(workflow_id: WorkflowId) -> String {
    format!("{RUNS_SUBJECT_PREFIX}.{workflow_id}")
}

/// Publishes lifecycle events to JetStream.
pub struct NatsEventSink {
    jetstream: Arc<jetstream::Context>,
}

impl NatsEventSink {
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the server or the stream is unavailable.
    pub async fn new(config: &NatsConfig) -> Result<Self, EventSinkError> {
        let jetstream = connect(&config.url)
            .await
            .map_err(|message| EventSinkError::ConnectionFailed { message })?;

        let stream_config = jetstream::stream::Config {
            name: config.events_stream().to_string(),
            subjects: vec![format!("{EVENTS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::Limits,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| EventSinkError::ConnectionFailed {
                message: format!("failed to create events stream: {e}"),
            })?;

        Ok(Self {
            jetstream: Arc::new(jetstream),
        })
    }
}

#[async_trait]
impl EventSink for NatsEventSink {
    async fn publish(&self, event: Envelope<LifecycleEvent>) -> Result<(), EventSinkError> {
        let subject = event_subject(event.payload.event_type);
        let bytes = event
            .to_json_bytes()
            .map_err(|e| EventSinkError::PublishFailed {
                message: format!("failed to serialize event: {e}"),
            })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| EventSinkError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| EventSinkError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }
}

/// Errors from the run-request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunQueueError {
    ConnectionFailed { message: String },
    PublishFailed { message: String },
    ReceiveFailed { message: String },
}

impl fmt::Display for RunQueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "run queue connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "run request publish failed: {message}"),
            Self::ReceiveFailed { message } => write!(f, "run request receive failed: {message}"),
        }
    }
}

impl std::error::Error for RunQueueError {}

/// The work-queue stream of run requests.
pub struct NatsRunQueue {
    jetstream: Arc<jetstream::Context>,
    config: NatsConfig,
}

impl NatsRunQueue {
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the server or the stream is unavailable.
    pub async fn new(config: NatsConfig) -> Result<Self, RunQueueError> {
        let jetstream = connect(&config.url)
            .await
            .map_err(|message| RunQueueError::ConnectionFailed { message })?;

        let stream_config = jetstream::stream::Config {
            name: config.runs_stream().to_string(),
            subjects: vec![format!("{RUNS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| RunQueueError::ConnectionFailed {
                message: format!("failed to create runs stream: {e}"),
            })?;

        Ok(Self {
            jetstream: Arc::new(jetstream),
            config,
        })
    }

    /// Enqueues a run request.
    ///
    /// # Errors
    ///
    /// Returns `PublishFailed` if JetStream does not acknowledge the message.
    pub async fn publish(&self, request: &RunRequest) -> Result<(), RunQueueError> {
        let subject = run_subject(request.workflow_id);
        let bytes = serde_json::to_vec(&Envelope::new(request)).map_err(|e| {
            RunQueueError::PublishFailed {
                message: format!("failed to serialize run request: {e}"),
            }
        })?;

        self.jetstream
            .publish(subject, bytes.into())
            .await
            .map_err(|e| RunQueueError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| RunQueueError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }

    /// Attaches to the shared durable consumer.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the consumer cannot be created.
    pub async fn subscribe(&self) -> Result<RunRequestStream, RunQueueError> {
        let stream = self
            .jetstream
            .get_stream(self.config.runs_stream())
            .await
            .map_err(|e| RunQueueError::ConnectionFailed {
                message: format!("failed to get stream: {e}"),
            })?;

        let consumer_config = jetstream::consumer::pull::Config {
            durable_name: Some(self.config.consumer().to_string()),
            filter_subject: format!("{RUNS_SUBJECT_PREFIX}.>"),
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ack_policy: jetstream::consumer::AckPolicy::Explicit,
            ..Default::default()
        };
        let consumer = stream
            .get_or_create_consumer(self.config.consumer(), consumer_config)
            .await
            .map_err(|e| RunQueueError::ConnectionFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| RunQueueError::ConnectionFailed {
                message: format!("failed to get messages: {e}"),
            })?;

        Ok(RunRequestStream { messages })
    }
}

/// Run requests as they arrive.
pub struct RunRequestStream {
    messages: jetstream::consumer::pull::Stream,
}

impl RunRequestStream {
    /// Waits for the next decodable request. Messages that cannot be decoded
    /// are terminated so they are not redelivered.
    pub async fn next(&mut self) -> Option<Result<ReceivedRun, RunQueueError>> {
        loop {
            let message = match self.messages.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(RunQueueError::ReceiveFailed {
                        message: e.to_string(),
                    }));
                }
            };

            match decode_run_request(&message.payload) {
                Ok(request) => return Some(Ok(ReceivedRun { request, message })),
                Err(reason) => {
                    warn!(subject = %message.subject, %reason, "Dropping undecodable run request");
                    if let Err(e) = message.ack_with(AckKind::Term).await {
                        warn!(error = %e, "Failed to terminate run request");
                    }
                }
            }
        }
    }
}

/// A received request; ack once the run has been handed to the queue.
pub struct ReceivedRun {
    pub request: RunRequest,
    message: jetstream::Message,
}

impl ReceivedRun {
    /// # Errors
    ///
    /// Returns `ReceiveFailed` if the ack cannot be sent.
    pub async fn ack(&self) -> Result<(), RunQueueError> {
        self.message
            .ack()
            .await
            .map_err(|e| RunQueueError::ReceiveFailed {
                message: format!("failed to ack message: {e}"),
            })?;
        debug!(workflow_id = %self.request.workflow_id, "Run request acknowledged");
        Ok(())
    }
}

fn decode_run_request(bytes: &[u8]) -> Result<RunRequest, String> {
    let raw = RawEnvelope::from_json_bytes(bytes).map_err(|e| format!("not an envelope: {e}"))?;
    if raw.version() != CURRENT_VERSION {
        return Err(format!("unsupported envelope version {}", raw.version()));
    }
    raw.deserialize_payload::<RunRequest>()
        .map(Envelope::into_payload)
        .map_err(|e| format!("malformed run request: {e}"))
}
