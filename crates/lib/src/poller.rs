//! Inbound long-poll loop with at-least-once delivery.
//!
//! The cursor is committed only after an update has been handed to the dispatcher and its
//! reply (if any) enqueued, so a crash mid-batch redelivers the uncommitted tail on restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::channels::{BotApi, FetchError, InboundEvent, OutboundMessage, TelegramUpdate, UpdatesRequest};
use crate::config::TelegramChannelConfig;
use crate::dispatch::CommandDispatcher;
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;
use crate::outbound::OutboundQueue;
use crate::shutdown::shutdown_requested;

/// In-memory update offset shared with the status endpoint. Never decreases.
#[derive(Debug, Clone, Default)]
pub struct Cursor(Arc<AtomicU64>);

impl Cursor {
    pub fn new(start: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Move forward to `next`; lower values are ignored.
    pub fn advance(&self, next: u64) {
        self.0.fetch_max(next, Ordering::SeqCst);
    }
}

/// Long-poll parameters.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub timeout_secs: u64,
    pub allowed_updates: Vec<String>,
    /// Sleep after a failed fetch before trying again.
    pub fetch_backoff: Duration,
}

impl PollSettings {
    pub fn from_config(config: &TelegramChannelConfig) -> Self {
        Self {
            timeout_secs: config.poll_timeout_secs,
            allowed_updates: config.allowed_updates.clone(),
            fetch_backoff: config.fetch_backoff(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from_config(&TelegramChannelConfig::default())
    }
}

/// Result of a single poll iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Fetch succeeded; this many updates were handed off and committed.
    Processed(usize),
    FetchFailed,
}

pub struct UpdatePoller {
    api: Arc<dyn BotApi>,
    dispatcher: Arc<CommandDispatcher>,
    queue: OutboundQueue,
    metrics: Arc<dyn MetricsSink>,
    settings: PollSettings,
    cursor: Cursor,
}

impl UpdatePoller {
    pub fn new(
        api: Arc<dyn BotApi>,
        dispatcher: Arc<CommandDispatcher>,
        queue: OutboundQueue,
        metrics: Arc<dyn MetricsSink>,
        settings: PollSettings,
    ) -> Self {
        Self {
            api,
            dispatcher,
            queue,
            metrics,
            settings,
            cursor: Cursor::default(),
        }
    }

    /// Handle on the cursor; stays valid after the poller is moved into a task.
    pub fn cursor(&self) -> Cursor {
        self.cursor.clone()
    }

    async fn fetch(&self) -> Result<Vec<TelegramUpdate>, FetchError> {
        let request = UpdatesRequest {
            offset: self.cursor.get(),
            timeout_secs: self.settings.timeout_secs,
            allowed_updates: self.settings.allowed_updates.clone(),
        };
        self.api.get_updates(&request).await
    }

    fn fetch_failed(&self, err: &FetchError) {
        log::warn!(
            "poller: getUpdates failed (offset={}), retrying in {}ms: {}",
            self.cursor.get(),
            self.settings.fetch_backoff.as_millis(),
            err
        );
        self.metrics.record_error(ErrorKind::TransientFetch);
    }

    async fn process_batch(&self, updates: Vec<TelegramUpdate>) -> usize {
        let mut handled = 0;
        for update in updates {
            // Already committed; the platform should not return these but may after a restart race.
            if update.update_id < self.cursor.get() {
                continue;
            }
            self.handle_update(&update).await;
            self.cursor.advance(update.update_id + 1);
            handled += 1;
        }
        handled
    }

    async fn handle_update(&self, update: &TelegramUpdate) {
        let Some(event) = InboundEvent::from_update(update) else {
            log::debug!("poller: update {} carries no text, skipping", update.update_id);
            return;
        };
        let Some(reply) = self.dispatcher.dispatch(&event).await else {
            return;
        };
        let mut message = OutboundMessage::text(reply);
        message.thread_id = event.thread_id;
        if let Err(e) = self.queue.send(event.conversation_id.as_str(), message) {
            log::warn!("poller: reply to update {} not queued: {}", event.id, e);
        }
    }

    /// One fetch + process iteration. Does not sleep after a failure; [`UpdatePoller::run`] does.
    pub async fn poll_once(&self) -> PollOutcome {
        match self.fetch().await {
            Ok(updates) => PollOutcome::Processed(self.process_batch(updates).await),
            Err(e) => {
                self.fetch_failed(&e);
                PollOutcome::FetchFailed
            }
        }
    }

    /// Poll until `shutdown` flips to true. A pending fetch or backoff sleep is abandoned on
    /// shutdown; a batch that has been fetched is always processed to the end first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "poller: starting getUpdates long-poll loop (timeout={}s)",
            self.settings.timeout_secs
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                r = self.fetch() => r,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            match fetched {
                Ok(updates) => {
                    let n = self.process_batch(updates).await;
                    if n > 0 {
                        log::debug!("poller: processed {} update(s), cursor={}", n, self.cursor.get());
                    }
                }
                Err(e) => {
                    self.fetch_failed(&e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.fetch_backoff) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }
        log::info!("poller: stopped at cursor={}", self.cursor.get());
    }
}
