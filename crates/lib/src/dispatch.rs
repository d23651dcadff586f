//! Command dispatch: parse, admit, route to a handler, and turn every failure into a reply.
//!
//! [`CommandDispatcher::dispatch`] never returns an error and never lets a handler panic
//! escape, so a broken handler cannot stop the poller.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::channels::InboundEvent;
use crate::config::{RateLimitsConfig, DEFAULT_COMMAND_CLASS};
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;
use crate::rate_limit::RateLimiter;

pub const HANDLER_FAILURE_REPLY: &str = "Something went wrong. Please try again later.";

/// What a handler sees: the parsed command and who sent it where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    pub command: String,
    pub args: Vec<String>,
    pub sender_id: String,
    pub conversation_id: String,
    pub raw_text: String,
}

/// Business logic for one command. `Ok(None)` means "no reply".
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<Option<String>>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    async fn handle(&self, ctx: CommandContext) -> anyhow::Result<Option<String>> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(CommandContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Routes events to handlers behind per-class rate limiters.
pub struct CommandDispatcher {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    command_classes: HashMap<String, String>,
    metrics: Arc<dyn MetricsSink>,
}

impl CommandDispatcher {
    /// One limiter per configured class; a "default" class is always present.
    pub fn new(config: &RateLimitsConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        let mut limiters: HashMap<String, Arc<RateLimiter>> = config
            .classes
            .iter()
            .map(|(name, c)| (name.clone(), Arc::new(RateLimiter::from_config(c))))
            .collect();
        limiters
            .entry(DEFAULT_COMMAND_CLASS.to_string())
            .or_insert_with(|| {
                Arc::new(RateLimiter::from_config(&config.class(DEFAULT_COMMAND_CLASS)))
            });
        let command_classes = config
            .command_classes
            .iter()
            .map(|(cmd, class)| (cmd.to_lowercase(), class.clone()))
            .collect();
        Self {
            handlers: HashMap::new(),
            limiters,
            command_classes,
            metrics,
        }
    }

    /// Register (or replace) the handler for a command name. Names are case-insensitive.
    pub fn register(&mut self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.trim_start_matches('/').to_lowercase(), handler);
    }

    /// Replace the limiter for a class.
    pub fn set_limiter(&mut self, class: &str, limiter: Arc<RateLimiter>) {
        self.limiters.insert(class.to_string(), limiter);
    }

    /// Map a command to a class.
    pub fn set_command_class(&mut self, command: &str, class: &str) {
        self.command_classes
            .insert(command.to_lowercase(), class.to_string());
    }

    /// All limiters, for the periodic sweeper.
    pub fn limiters(&self) -> Vec<Arc<RateLimiter>> {
        self.limiters.values().cloned().collect()
    }

    /// Registered command names, sorted.
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    fn class_of(&self, command: &str) -> &str {
        self.command_classes
            .get(command)
            .map(String::as_str)
            .filter(|class| self.limiters.contains_key(*class))
            .unwrap_or(DEFAULT_COMMAND_CLASS)
    }

    /// Handle one event. Returns the reply to send, if any.
    pub async fn dispatch(&self, event: &InboundEvent) -> Option<String> {
        let command = event.command.as_deref()?;

        let class = self.class_of(command);
        if let Some(limiter) = self.limiters.get(class) {
            if !limiter.is_allowed(&event.sender_id) {
                let wait = limiter.reset_time(&event.sender_id);
                self.metrics.record_rate_limit();
                log::info!(
                    "dispatch: rate limited sender={} command={} class={} reset_ms={}",
                    event.sender_id,
                    command,
                    class,
                    wait.as_millis()
                );
                return Some(rate_limited_reply(wait));
            }
        }

        let Some(handler) = self.handlers.get(command) else {
            log::debug!("dispatch: unknown command {}", command);
            return Some(unknown_command_reply(command));
        };
        self.metrics.record_command(command);

        let ctx = CommandContext {
            command: command.to_string(),
            args: event.args.clone(),
            sender_id: event.sender_id.clone(),
            conversation_id: event.conversation_id.clone(),
            raw_text: event.raw_text.clone(),
        };
        match AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                log::warn!("dispatch: handler {} failed: {:#}", command, e);
                self.metrics.record_error(ErrorKind::HandlerFailure);
                Some(HANDLER_FAILURE_REPLY.to_string())
            }
            Err(_) => {
                log::error!("dispatch: handler {} panicked", command);
                self.metrics.record_error(ErrorKind::HandlerFailure);
                Some(HANDLER_FAILURE_REPLY.to_string())
            }
        }
    }
}

fn rate_limited_reply(wait: Duration) -> String {
    let secs = wait.as_millis().div_ceil(1000).max(1);
    format!(
        "You're sending commands too quickly. Please try again in {} second{}.",
        secs,
        if secs == 1 { "" } else { "s" }
    )
}

fn unknown_command_reply(command: &str) -> String {
    format!(
        "Unknown command: /{}. Send /help to see what I can do.",
        command
    )
}
