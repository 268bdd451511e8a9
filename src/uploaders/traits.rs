use {
    crate::{consumer::Batch, Payload},
    async_trait::async_trait,
    std::fmt::{Debug, Display},
    tokio_util::sync::CancellationToken,
};

/// Delivers one batch to a destination.
///
/// Called from the consumer's drain loop, one batch at a time. Errors are
/// logged and reported by the consumer; the batch is not handed back. An
/// implementation that wants retries does them itself, and should give up
/// waiting once `stop` is cancelled (that happens on consumer shutdown).
#[async_trait]
pub trait BatchUploader<T: Payload>: 'static + Send + Sync {
    type Error: Debug + Display + Send + 'static;

    async fn upload(&self, batch: Batch<T>, stop: CancellationToken) -> Result<(), Self::Error>;
}
