//! Telegram channel: getUpdates long-poll and sendMessage via the Bot API.

use crate::channels::api::{BotApi, FetchError, OutboundMessage, SendError, UpdatesRequest};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Extra time on top of the long-poll timeout before the HTTP client gives up.
const HTTP_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

/// Bot API envelope: `{ ok, result }` on success, `{ ok: false, error_code, description, parameters }` on error.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<u16>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: u64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
}

/// HTTP client for one bot token.
#[derive(Clone)]
pub struct TelegramClient {
    base_url: String,
    token: String,
    poll_timeout: Duration,
    client: reqwest::Client,
}

impl TelegramClient {
    /// `base_url` defaults to the public Bot API. `poll_timeout` is the longest getUpdates wait the client will issue.
    pub fn new(token: impl Into<String>, base_url: Option<String>, poll_timeout: Duration) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| TELEGRAM_API_BASE.to_string());
        let client = reqwest::Client::builder()
            .timeout(poll_timeout + HTTP_TIMEOUT_SLACK)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("telegram: falling back to default http client: {}", e);
                reqwest::Client::new()
            });
        Self {
            base_url,
            token: token.into(),
            poll_timeout,
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }
}

fn send_message_body(conversation_id: &str, message: &OutboundMessage) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": conversation_id,
        "text": message.text,
    });
    if let Some(mode) = message.parse_mode {
        body["parse_mode"] = serde_json::to_value(mode).unwrap_or(serde_json::Value::Null);
    }
    if message.silent {
        body["disable_notification"] = serde_json::Value::Bool(true);
    }
    if let Some(ref markup) = message.reply_markup {
        body["reply_markup"] = markup.clone();
    }
    if let Some(thread_id) = message.thread_id {
        body["message_thread_id"] = serde_json::Value::from(thread_id);
    }
    body
}

#[async_trait]
impl BotApi for TelegramClient {
    async fn get_updates(&self, request: &UpdatesRequest) -> Result<Vec<TelegramUpdate>, FetchError> {
        let timeout = request.timeout_secs.min(self.poll_timeout.as_secs());
        let body = serde_json::json!({
            "offset": request.offset,
            "timeout": timeout,
            "allowed_updates": request.allowed_updates,
        });
        let res = self
            .client
            .post(self.method_url("getUpdates"))
            .json(&body)
            .send()
            .await?;
        let status = res.status();
        let data: ApiResponse<Vec<TelegramUpdate>> = res.json().await?;
        if !data.ok {
            return Err(FetchError::Api(format!(
                "{} {}",
                data.error_code.unwrap_or(status.as_u16()),
                data.description.unwrap_or_default()
            )));
        }
        let mut updates = data.result.unwrap_or_default();
        updates.sort_by_key(|u| u.update_id);
        Ok(updates)
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SendError> {
        let body = send_message_body(conversation_id, message);
        let res = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| SendError::Transport(e.to_string()))?;
        let parsed = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text).ok();
        if status.is_success() && parsed.as_ref().map(|p| p.ok).unwrap_or(true) {
            return Ok(());
        }
        let (code, description, retry_after) = match parsed {
            Some(p) => (
                p.error_code.unwrap_or(status.as_u16()),
                p.description.unwrap_or_default(),
                p.parameters.and_then(|p| p.retry_after).map(Duration::from_secs),
            ),
            None => (status.as_u16(), text, None),
        };
        Err(SendError::from_code(code, description, retry_after))
    }
}
