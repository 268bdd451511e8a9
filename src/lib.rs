use {serde::Serialize, std::sync::Arc};

pub mod backoff;
pub mod consumer;
pub mod retry;
pub mod uploaders;

pub use {
    backoff::Backoff,
    consumer::{AsyncConsumer, Batch, ConsumerError, ConsumerOpts, ErrorHandler},
    retry::{retry, RetryError, RetryOpts, Retryable},
    uploaders::{BatchUploader, HttpError, HttpUploader, HttpUploaderOpts},
};

/// Anything a destination wants to carry through the consumer queue.
pub trait Payload: 'static + Send + Sync {}

impl<T> Payload for T where T: 'static + Send + Sync {}

/// A single outbound message. The `message_type` decides which batch the
/// message can join: a batch never mixes types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message<T> {
    message_type: Arc<str>,
    data: T,
}

impl<T> Message<T>
where
    T: Payload,
{
    pub fn new(message_type: impl Into<Arc<str>>, data: T) -> Self {
        Self {
            message_type: message_type.into(),
            data,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub(crate) fn same_type(&self, other: &Self) -> bool {
        self.message_type == other.message_type
    }
}
