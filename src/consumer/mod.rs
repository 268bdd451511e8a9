use {
    crate::{uploaders::BatchUploader, Message, Payload},
    batch::{BatchBuilder, Drained, Signal},
    parking_lot::Mutex,
    std::{
        future::Future,
        panic::{self, AssertUnwindSafe},
        pin::Pin,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::{
        sync::{
            mpsc::{self, error::TrySendError},
            oneshot,
            watch,
        },
        task::JoinHandle,
        time::timeout,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

mod batch;

pub use batch::Batch;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("invalid consumer options: {0}")]
    InvalidOpts(&'static str),

    #[error("message queue is full")]
    QueueFull,

    #[error("consumer has been shut down")]
    Shutdown,

    #[error("consumer has already been started")]
    AlreadyStarted,
}

impl<T> From<TrySendError<T>> for ConsumerError {
    fn from(val: TrySendError<T>) -> Self {
        match val {
            TrySendError::Full(_) => Self::QueueFull,
            TrySendError::Closed(_) => Self::Shutdown,
        }
    }
}

#[derive(Debug)]
pub(crate) enum ControlEvent<T> {
    Process(Message<T>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Receives the stringified cause of every failed upload.
pub type ErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Most of these values should be left on default outside of testing.
#[derive(Debug, Clone)]
pub struct ConsumerOpts {
    /// Message queue capacity. Enqueuing into a full queue fails immediately
    /// with [`ConsumerError::QueueFull`] instead of waiting for room.
    pub queue_capacity: usize,

    /// The maximum number of messages in a single batch. Reaching it uploads
    /// the batch right away.
    pub flush_queue_size: usize,

    /// The longest time a batch keeps collecting messages before it's uploaded
    /// regardless of its size.
    pub flush_interval: Duration,

    /// How long [`AsyncConsumer::shutdown`] lets the drain loop upload what's
    /// left, retries included, before telling uploads to stop retrying.
    pub shutdown_grace: Duration,
}

impl Default for ConsumerOpts {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            flush_queue_size: 10,
            flush_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl ConsumerOpts {
    fn validate(&self) -> Result<(), ConsumerError> {
        if self.queue_capacity == 0 {
            return Err(ConsumerError::InvalidOpts("queue_capacity must be positive"));
        }

        if self.flush_queue_size == 0 {
            return Err(ConsumerError::InvalidOpts(
                "flush_queue_size must be positive",
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(ConsumerError::InvalidOpts(
                "flush_interval must be non-zero",
            ));
        }

        Ok(())
    }
}

struct Drainer<T: Payload, U: BatchUploader<T>> {
    builder: BatchBuilder<T>,
    uploader: Arc<U>,
    stop: CancellationToken,
    on_error: Option<ErrorHandler>,
    // Never sent on. Dropping it when the loop exits closes the channel.
    _done: watch::Sender<()>,
}

impl<T, U> Drainer<T, U>
where
    T: Payload,
    U: BatchUploader<T>,
{
    async fn run(mut self) {
        info!("analytics consumer started");

        let mut running = true;

        while running {
            let Drained { batch, signal } = self.builder.next().await;

            if let Some(batch) = batch {
                self.upload(batch).await;
            }

            match signal {
                Some(Signal::Flush(waiter)) => {
                    // The flushing caller may have given up waiting.
                    let _ = waiter.send(());
                }

                Some(Signal::Shutdown) | Some(Signal::Closed) => running = false,

                None => {}
            }
        }

        info!("analytics consumer stopped");
    }

    async fn upload(&self, batch: Batch<T>) {
        let message_type = batch.message_type().to_owned();
        let batch_size = batch.len();
        let uploader = self.uploader.clone();
        let stop = self.stop.clone();

        debug!(%message_type, batch_size, "uploading batch");

        // Run in a separate task so that a panicking uploader can't take the
        // drain loop down with it. Still awaited: one upload at a time.
        let result = tokio::spawn(async move { uploader.upload(batch, stop).await }).await;

        let error = match result {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error.to_string(),
            Err(join_error) => format!("upload task failed: {join_error}"),
        };

        error!(%error, %message_type, batch_size, "batch upload failed");

        if let Some(on_error) = &self.on_error {
            // The handler is user code running on the drain task.
            if panic::catch_unwind(AssertUnwindSafe(|| on_error(&error))).is_err() {
                error!(bug = true, "analytics consumer error handler panicked");
            }
        }
    }
}

type DrainFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

enum State {
    Created(DrainFuture),
    Running(JoinHandle<()>),
    Stopped,
}

/// Batches messages in a background task and hands every batch to a
/// [`BatchUploader`].
///
/// Messages are uploaded in enqueue order, split into runs of the same
/// `message_type`. A batch is uploaded once it holds `flush_queue_size`
/// messages or has been collecting for `flush_interval`, whichever comes
/// first. Uploads never overlap, and a failed upload is only reported through
/// `tracing` and the optional [`ErrorHandler`]: it's neither retried nor
/// surfaced to producers.
pub struct AsyncConsumer<T: Payload> {
    ctrl_tx: mpsc::Sender<ControlEvent<T>>,
    state: Mutex<State>,
    shut_down: AtomicBool,
    stop: CancellationToken,
    shutdown_grace: Duration,
    stopped: watch::Receiver<()>,
}

impl<T> AsyncConsumer<T>
where
    T: Payload,
{
    pub fn new<U>(opts: ConsumerOpts, uploader: U) -> Result<Self, ConsumerError>
    where
        U: BatchUploader<T>,
    {
        Self::build(opts, uploader, None)
    }

    pub fn with_error_handler<U>(
        opts: ConsumerOpts,
        uploader: U,
        on_error: impl Fn(&str) + Send + Sync + 'static,
    ) -> Result<Self, ConsumerError>
    where
        U: BatchUploader<T>,
    {
        Self::build(opts, uploader, Some(Arc::new(on_error)))
    }

    fn build<U>(
        opts: ConsumerOpts,
        uploader: U,
        on_error: Option<ErrorHandler>,
    ) -> Result<Self, ConsumerError>
    where
        U: BatchUploader<T>,
    {
        opts.validate()?;

        let (ctrl_tx, ctrl_rx) = mpsc::channel(opts.queue_capacity);
        let stop = CancellationToken::new();
        let (done, stopped) = watch::channel(());
        let drainer = Drainer {
            builder: BatchBuilder::new(ctrl_rx, opts.flush_queue_size, opts.flush_interval),
            uploader: Arc::new(uploader),
            stop: stop.clone(),
            on_error,
            _done: done,
        };

        Ok(Self {
            ctrl_tx,
            state: Mutex::new(State::Created(Box::pin(drainer.run()))),
            shut_down: AtomicBool::new(false),
            stop,
            shutdown_grace: opts.shutdown_grace,
            stopped,
        })
    }

    /// Spawns the drain loop onto the current tokio runtime.
    ///
    /// Must be called from within a runtime context.
    pub fn start(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock();

        match std::mem::replace(&mut *state, State::Stopped) {
            State::Created(drain) => {
                *state = State::Running(tokio::spawn(drain));
                Ok(())
            }

            State::Running(handle) => {
                *state = State::Running(handle);
                Err(ConsumerError::AlreadyStarted)
            }

            State::Stopped => Err(ConsumerError::Shutdown),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), State::Running(_))
    }

    /// Queues a message without waiting. Fails with
    /// [`ConsumerError::QueueFull`] when the queue is at capacity.
    pub fn enqueue(
        &self,
        message_type: impl Into<Arc<str>>,
        data: T,
    ) -> Result<(), ConsumerError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ConsumerError::Shutdown);
        }

        self.ctrl_tx
            .try_send(ControlEvent::Process(Message::new(message_type, data)))
            .map_err(Into::into)
    }

    /// Waits until every message queued before this call has gone through an
    /// upload attempt. Returns immediately if the consumer isn't running.
    pub async fn flush(&self) {
        if !self.is_running() {
            debug!("flush requested while consumer isn't running");
            return;
        }

        let (waiter, done) = oneshot::channel();

        if self.ctrl_tx.send(ControlEvent::Flush(waiter)).await.is_err() {
            return;
        }

        // An error here means the drain loop has exited.
        let _ = done.await;
    }

    /// Uploads whatever is still queued, stops the drain loop and waits for
    /// it to finish.
    ///
    /// Uploads that are still retrying after `shutdown_grace` are told to stop,
    /// and the batches they hold are reported as failed.
    ///
    /// Safe to call more than once, concurrently, and before
    /// [`AsyncConsumer::start`]. Every call returns only once the drain loop
    /// has exited.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);

        let handle = match std::mem::replace(&mut *self.state.lock(), State::Stopped) {
            State::Running(handle) => Some(handle),
            State::Created(_) => return,
            // Someone else is already shutting the loop down.
            State::Stopped => None,
        };

        if handle.is_some() {
            if let Err(error) = self.ctrl_tx.send(ControlEvent::Shutdown).await {
                error!(
                    %error,
                    "failed to send shutdown command to analytics consumer"
                );
            }
        }

        if timeout(self.shutdown_grace, self.drained()).await.is_err() {
            warn!(
                grace = ?self.shutdown_grace,
                "analytics consumer still draining, interrupting uploads"
            );
            self.stop.cancel();
            self.drained().await;
        }

        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                error!(%error, bug = true, "analytics consumer task failed");
            }
        }
    }

    /// Resolves once the drain loop has exited, or was dropped without
    /// ever running.
    async fn drained(&self) {
        let mut stopped = self.stopped.clone();
        while stopped.changed().await.is_ok() {}
    }
}

impl<T> Drop for AsyncConsumer<T>
where
    T: Payload,
{
    fn drop(&mut self) {
        if !matches!(self.state.get_mut(), State::Running(_)) {
            return;
        }

        if let Err(error) = self.ctrl_tx.try_send(ControlEvent::Shutdown) {
            error!(
                %error,
                "failed to send shutdown command to analytics consumer"
            );
        }
    }
}
