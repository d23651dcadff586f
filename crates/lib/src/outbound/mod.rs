//! Outbound delivery: one global queue, paced per conversation, drained by a single worker.
//!
//! [`OutboundQueue::send`] only enqueues and wakes the worker. The [`OutboundWorker`] owns
//! every delivery attempt, so there is never more than one send in flight. Retried messages
//! go back to the head of the queue, which means one conversation's backoff delays every
//! other conversation queued behind it.

mod queue;
mod retry;

pub use queue::{Delivery, EnqueueError, OutboundQueue, OutboundWorker, QueueStatus, QueuedMessage};
pub use retry::RetryPolicy;
