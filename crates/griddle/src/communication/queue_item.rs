use tokio::sync::oneshot::Sender;

/// # QueueItem
///
/// A queued request: an input value paired with the oneshot channel its
/// result is sent on.
///
/// ## Usage Context
///
/// Requests wait in an engine pool's queue as `QueueItem`s. A worker drains
/// them in batches, runs the batch, and consumes each item's sender to reply.
///
/// ## Type Parameters
///
/// * `Q` - The type of the input value to be processed
/// * `T` - The type of the result that will be sent back
pub struct QueueItem<Q, T> {
    /// The input value to be processed
    input: Q,

    /// Channel for sending the result back to the requester
    sender: Sender<T>,
}

impl<Q, T> QueueItem<Q, T> {
    /// Creates a new `QueueItem` with the specified input and sender.
    pub fn new(input: Q, sender: Sender<T>) -> Self {
        Self {
            input,
            sender,
        }
    }

    /// Returns a reference to the input value.
    pub fn input(&self) -> &Q {
        &self.input
    }

    /// Consumes the item and sends `result` to the requester.
    ///
    /// # Returns
    ///
    /// `false` if the requester stopped waiting and the result was dropped
    pub fn respond(self, result: T) -> bool {
        self.sender.send(result).is_ok()
    }

    /// Returns `true` if the requester has dropped its receiver.
    pub fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }
}

impl<Q, T> AsRef<Sender<T>> for QueueItem<Q, T> {
    fn as_ref(&self) -> &Sender<T> {
        &self.sender
    }
}
