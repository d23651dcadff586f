use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::channels::{BotApi, OutboundMessage, SendError};
use crate::config::OutboundConfig;
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;
use crate::outbound::retry::RetryPolicy;
use crate::shutdown::shutdown_requested;

/// A message owned by the queue until it is sent or dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub conversation_id: String,
    pub payload: OutboundMessage,
    /// Rate-limit retries so far.
    pub retry_count: u32,
    /// Whether the single server-error retry has been used.
    pub server_retried: bool,
    pub enqueued_at: Instant,
    /// Earliest moment the next attempt may start, set when the message is requeued after a failure.
    pub not_before: Option<Instant>,
}

impl QueuedMessage {
    fn new(conversation_id: String, payload: OutboundMessage) -> Self {
        Self {
            conversation_id,
            payload,
            retry_count: 0,
            server_retried: false,
            enqueued_at: Instant::now(),
            not_before: None,
        }
    }
}

/// Snapshot for the status endpoint and the `/status` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing: bool,
    /// Conversations with a recent delivery still inside the spacing interval.
    pub conversations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("outbound queue is full ({0} messages)")]
    Full(usize),
}

/// Terminal or intermediate result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Put back at the head after sleeping `delay`.
    Requeued { delay: Duration },
    Dropped { kind: ErrorKind },
}

struct Shared {
    queue: Mutex<VecDeque<QueuedMessage>>,
    last_sent: Mutex<HashMap<String, Instant>>,
    processing: AtomicBool,
    notify: Notify,
    capacity: usize,
    metrics: Arc<dyn MetricsSink>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Puts a message back at the head if its send is cancelled before completing.
struct RequeueOnDrop<'a> {
    queue: &'a Mutex<VecDeque<QueuedMessage>>,
    msg: Option<QueuedMessage>,
}

impl RequeueOnDrop<'_> {
    fn disarm(mut self) {
        self.msg = None;
    }
}

impl Drop for RequeueOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            lock(self.queue).push_front(msg);
        }
    }
}

/// Producer handle; cheap to clone.
#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

/// The single consumer. Create with [`OutboundQueue::new`] and either spawn [`OutboundWorker::run`]
/// or call [`OutboundWorker::drain`] directly.
pub struct OutboundWorker {
    shared: Arc<Shared>,
    api: Arc<dyn BotApi>,
    policy: RetryPolicy,
    spacing: Duration,
    shutdown_grace: Duration,
}

impl OutboundQueue {
    pub fn new(
        config: &OutboundConfig,
        api: Arc<dyn BotApi>,
        metrics: Arc<dyn MetricsSink>,
    ) -> (Self, OutboundWorker) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            last_sent: Mutex::new(HashMap::new()),
            processing: AtomicBool::new(false),
            notify: Notify::new(),
            capacity: config.capacity.max(1),
            metrics,
        });
        let worker = OutboundWorker {
            shared: shared.clone(),
            api,
            policy: RetryPolicy::from_config(config),
            spacing: Duration::from_millis(config.spacing_ms),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        };
        (Self { shared }, worker)
    }

    /// Append to the tail and wake the worker. Returns immediately; delivery is best-effort.
    pub fn send(
        &self,
        conversation_id: impl Into<String>,
        payload: OutboundMessage,
    ) -> Result<(), EnqueueError> {
        let conversation_id = conversation_id.into();
        {
            let mut queue = lock(&self.shared.queue);
            if queue.len() >= self.shared.capacity {
                drop(queue);
                log::warn!(
                    "outbound: queue full, rejecting message for conversation={}",
                    conversation_id
                );
                self.shared.metrics.record_error(ErrorKind::QueueFull);
                return Err(EnqueueError::Full(self.shared.capacity));
            }
            queue.push_back(QueuedMessage::new(conversation_id, payload));
        }
        self.shared.metrics.record_queued();
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: lock(&self.shared.queue).len(),
            processing: self.shared.processing.load(Ordering::SeqCst),
            conversations: lock(&self.shared.last_sent).len(),
        }
    }

    /// Discard every queued message and all pacing state. Returns how many messages were dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut queue = lock(&self.shared.queue);
            let n = queue.len();
            queue.clear();
            n
        };
        lock(&self.shared.last_sent).clear();
        if dropped > 0 {
            log::warn!("outbound: cleared {} queued message(s)", dropped);
        }
        dropped
    }
}

impl OutboundWorker {
    fn push_front(&self, msg: QueuedMessage) {
        lock(&self.shared.queue).push_front(msg);
    }

    /// Pop the head once both its conversation spacing and its retry backoff have elapsed,
    /// else report how long to wait.
    fn take_ready(&self, now: Instant) -> Option<Result<QueuedMessage, Duration>> {
        let mut queue = lock(&self.shared.queue);
        let head = queue.front()?;
        let spacing_wait = match lock(&self.shared.last_sent).get(&head.conversation_id) {
            Some(last) => self.spacing.saturating_sub(now.saturating_duration_since(*last)),
            None => Duration::ZERO,
        };
        let backoff_wait = head
            .not_before
            .map_or(Duration::ZERO, |t| t.saturating_duration_since(now));
        let wait = spacing_wait.max(backoff_wait);
        if wait.is_zero() {
            queue.pop_front().map(Ok)
        } else {
            Some(Err(wait))
        }
    }

    fn mark_sent(&self, conversation_id: &str, now: Instant) {
        let mut last_sent = lock(&self.shared.last_sent);
        // Entries older than the spacing no longer constrain anything.
        last_sent.retain(|_, t| now.saturating_duration_since(*t) < self.spacing);
        last_sent.insert(conversation_id.to_string(), now);
    }

    /// Deliver messages until the queue is empty.
    pub async fn drain(&self) {
        while self.deliver_next().await.is_some() {}
    }

    /// Take the head message and attempt it once. None when the queue was empty.
    ///
    /// Cancel-safe: a message waiting out its spacing or backoff stays at the head with its
    /// retry deadline, and one whose send is cancelled mid-request is put back (it may then be
    /// delivered twice).
    pub async fn deliver_next(&self) -> Option<Delivery> {
        let msg = loop {
            match self.take_ready(Instant::now()) {
                None => {
                    self.shared.processing.store(false, Ordering::SeqCst);
                    return None;
                }
                Some(Ok(msg)) => break msg,
                Some(Err(wait)) => {
                    self.shared.processing.store(true, Ordering::SeqCst);
                    tokio::time::sleep(wait).await;
                }
            }
        };
        self.shared.processing.store(true, Ordering::SeqCst);

        let guard = RequeueOnDrop {
            queue: &self.shared.queue,
            msg: Some(msg.clone()),
        };
        let result = self.api.send_message(&msg.conversation_id, &msg.payload).await;
        guard.disarm();

        let outcome = match result {
            Ok(()) => {
                self.mark_sent(&msg.conversation_id, Instant::now());
                self.shared.metrics.record_message_sent();
                log::debug!("outbound: sent conversation={}", msg.conversation_id);
                Delivery::Sent
            }
            Err(err) => self.handle_failure(msg, err).await,
        };
        Some(outcome)
    }

    async fn handle_failure(&self, mut msg: QueuedMessage, err: SendError) -> Delivery {
        let kind = err.kind();
        let delay = match &err {
            SendError::RateLimited { retry_after, .. } => {
                msg.retry_count += 1;
                if msg.retry_count > self.policy.max_retries {
                    return self.drop_message(&msg, kind, &err);
                }
                self.shared.metrics.record_platform_rate_limit();
                self.policy
                    .backoff(msg.retry_count)
                    .max(retry_after.unwrap_or(Duration::ZERO))
            }
            SendError::Server { .. } | SendError::Transport(_) => {
                if msg.server_retried {
                    return self.drop_message(&msg, kind, &err);
                }
                msg.server_retried = true;
                self.policy.server_retry_delay
            }
            SendError::Permanent { .. } => return self.drop_message(&msg, kind, &err),
        };

        self.shared.metrics.record_retry();
        log::info!(
            "outbound: {} for conversation={}, requeued at head, retrying in {}ms",
            kind,
            msg.conversation_id,
            delay.as_millis()
        );
        msg.not_before = Some(Instant::now() + delay);
        self.push_front(msg);
        tokio::time::sleep(delay).await;
        Delivery::Requeued { delay }
    }

    fn drop_message(&self, msg: &QueuedMessage, kind: ErrorKind, err: &SendError) -> Delivery {
        log::warn!(
            "outbound: dropped message for conversation={} kind={} retries={} queued_for={}ms: {}",
            msg.conversation_id,
            kind,
            msg.retry_count,
            msg.enqueued_at.elapsed().as_millis(),
            err
        );
        self.shared.metrics.record_error(kind);
        Delivery::Dropped { kind }
    }

    /// Drain whenever woken until `shutdown` flips to true, then keep draining for at most the
    /// configured grace period.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let work = async {
            loop {
                self.drain().await;
                self.shared.notify.notified().await;
            }
        };
        tokio::select! {
            _ = work => {}
            _ = shutdown_requested(&mut shutdown) => {}
        }

        if !self.shutdown_grace.is_zero() {
            let _ = tokio::time::timeout(self.shutdown_grace, self.drain()).await;
        }
        self.shared.processing.store(false, Ordering::SeqCst);
        let left = lock(&self.shared.queue).len();
        if left > 0 {
            log::warn!("outbound: stopping with {} undelivered message(s)", left);
        }
        log::info!("outbound worker stopped");
    }
}
