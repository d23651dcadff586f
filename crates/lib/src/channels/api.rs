//! Platform seam: the two calls the pipeline makes against the chat platform.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::channels::telegram::TelegramUpdate;
use crate::error::ErrorKind;

/// Parameters for one getUpdates call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatesRequest {
    /// First update id to return; everything below is confirmed to the platform.
    pub offset: u64,
    /// Long-poll timeout in seconds.
    pub timeout_secs: u64,
    /// Update types to receive (e.g. "message").
    pub allowed_updates: Vec<String>,
}

/// Fetch updates and deliver messages. Implemented by [`crate::channels::TelegramClient`]; tests use scripted fakes.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Fetch updates with id >= `request.offset`, in ascending id order.
    async fn get_updates(&self, request: &UpdatesRequest) -> Result<Vec<TelegramUpdate>, FetchError>;

    /// Send one message to a conversation (e.g. Telegram chat_id).
    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SendError>;
}

/// Text formatting mode understood by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseMode {
    #[serde(rename = "HTML")]
    Html,
    Markdown,
    MarkdownV2,
}

/// Outbound payload: text plus optional formatting, notification flag, reply markup and thread.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub text: String,
    pub parse_mode: Option<ParseMode>,
    /// Deliver without a notification sound.
    pub silent: bool,
    /// Interactive reply elements (inline keyboard etc.), passed through as-is.
    pub reply_markup: Option<serde_json::Value>,
    /// Forum topic / thread to post into.
    pub thread_id: Option<i64>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = Some(mode);
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn with_reply_markup(mut self, markup: serde_json::Value) -> Self {
        self.reply_markup = Some(markup);
        self
    }

    pub fn in_thread(mut self, thread_id: i64) -> Self {
        self.thread_id = Some(thread_id);
        self
    }
}

/// getUpdates failure. Always treated as transient by the poller.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("getUpdates request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("getUpdates api error: {0}")]
    Api(String),
}

/// sendMessage failure, already classified for the retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// 429 Too Many Requests; `retry_after` is the platform's hint when present.
    #[error("rate limited: {description}")]
    RateLimited {
        description: String,
        retry_after: Option<Duration>,
    },
    /// 5xx from the platform.
    #[error("server error {code}: {description}")]
    Server { code: u16, description: String },
    /// No response at all (connect, timeout, broken body).
    #[error("transport error: {0}")]
    Transport(String),
    /// Anything else (400, 403, ...). Never retried.
    #[error("permanent error {code}: {description}")]
    Permanent { code: u16, description: String },
}

impl SendError {
    /// Classify a platform error code.
    pub fn from_code(code: u16, description: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let description = description.into();
        match code {
            429 => Self::RateLimited {
                description,
                retry_after,
            },
            500..=599 => Self::Server { code, description },
            _ => Self::Permanent { code, description },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Server { .. } | Self::Transport(_) => ErrorKind::RetryableServer,
            Self::Permanent { .. } => ErrorKind::Permanent,
        }
    }
}
