use {
    super::ControlEvent,
    crate::{Message, Payload},
    std::time::Duration,
    tokio::{
        sync::{mpsc, oneshot},
        time::{self, Instant},
    },
};

/// A non-empty run of messages sharing one `message_type`, in enqueue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    messages: Vec<Message<T>>,
}

impl<T> Batch<T>
where
    T: Payload,
{
    /// Returns `None` for an empty vector or one that mixes message types.
    pub fn new(messages: Vec<Message<T>>) -> Option<Self> {
        let first = messages.first()?;

        if messages.iter().all(|msg| msg.same_type(first)) {
            Some(Self { messages })
        } else {
            None
        }
    }

    pub fn message_type(&self) -> &str {
        self.messages[0].message_type()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always `false`; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message<T>] {
        &self.messages
    }

    pub fn data(&self) -> impl Iterator<Item = &T> {
        self.messages.iter().map(Message::data)
    }

    pub fn into_messages(self) -> Vec<Message<T>> {
        self.messages
    }
}

/// Why the builder stopped filling before the size or time threshold.
#[derive(Debug)]
pub(crate) enum Signal {
    /// A caller is waiting in `flush()` for everything up to this point.
    Flush(oneshot::Sender<()>),
    Shutdown,
    /// Every sender is gone; nothing more will ever arrive.
    Closed,
}

#[derive(Debug)]
pub(crate) struct Drained<T> {
    pub batch: Option<Batch<T>>,
    pub signal: Option<Signal>,
}

/// Pulls control events off the queue and groups them into batches.
pub(crate) struct BatchBuilder<T> {
    ctrl_rx: mpsc::Receiver<ControlEvent<T>>,
    max_size: usize,
    max_wait: Duration,
    pending: Option<Message<T>>,
}

impl<T> BatchBuilder<T>
where
    T: Payload,
{
    pub fn new(
        ctrl_rx: mpsc::Receiver<ControlEvent<T>>,
        max_size: usize,
        max_wait: Duration,
    ) -> Self {
        Self {
            ctrl_rx,
            max_size,
            max_wait,
            pending: None,
        }
    }

    /// Collects the next batch. Waits at most `max_wait` in total, stops early
    /// once `max_size` messages are collected, when a control signal arrives,
    /// or when a message of another type shows up. That message is held back
    /// and seeds the following batch.
    pub async fn next(&mut self) -> Drained<T> {
        let deadline = Instant::now() + self.max_wait;
        let mut items: Vec<Message<T>> = Vec::with_capacity(self.max_size);
        items.extend(self.pending.take());

        let mut signal = None;

        while items.len() < self.max_size && Instant::now() < deadline {
            let event = match time::timeout_at(deadline, self.ctrl_rx.recv()).await {
                Ok(Some(event)) => event,

                Ok(None) => {
                    signal = Some(Signal::Closed);
                    break;
                }

                // Window elapsed.
                Err(_) => break,
            };

            match event {
                ControlEvent::Process(msg) => {
                    if items.last().is_some_and(|last| !last.same_type(&msg)) {
                        self.pending = Some(msg);
                        break;
                    }

                    items.push(msg);
                }

                ControlEvent::Flush(waiter) => {
                    signal = Some(Signal::Flush(waiter));
                    break;
                }

                ControlEvent::Shutdown => {
                    signal = Some(Signal::Shutdown);
                    break;
                }
            }
        }

        Drained {
            batch: Batch::new(items),
            signal,
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> Option<&Message<T>> {
        self.pending.as_ref()
    }
}
