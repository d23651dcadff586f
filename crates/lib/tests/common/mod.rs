//! Scripted in-memory Bot API shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use lib::channels::{BotApi, FetchError, OutboundMessage, SendError, TelegramUpdate, UpdatesRequest};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub conversation_id: String,
    pub text: String,
    pub thread_id: Option<i64>,
    pub at: Instant,
    pub ok: bool,
}

/// Send results and fetch batches are consumed in order; once a script runs out, sends succeed
/// and fetches return an empty batch after `idle_fetch`.
pub struct ScriptedApi {
    sends: Mutex<VecDeque<Result<(), SendError>>>,
    fetches: Mutex<VecDeque<Result<Vec<TelegramUpdate>, String>>>,
    attempts: Mutex<Vec<Attempt>>,
    requests: Mutex<Vec<UpdatesRequest>>,
    idle_fetch: Duration,
    send_latency: Duration,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::with_idle_fetch(Duration::from_secs(30))
    }

    pub fn with_idle_fetch(idle_fetch: Duration) -> Self {
        Self {
            sends: Mutex::new(VecDeque::new()),
            fetches: Mutex::new(VecDeque::new()),
            attempts: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            idle_fetch,
            send_latency: Duration::ZERO,
        }
    }

    /// Each send takes this long before it resolves.
    pub fn with_send_latency(mut self, latency: Duration) -> Self {
        self.send_latency = latency;
        self
    }

    pub fn script_sends(&self, results: impl IntoIterator<Item = Result<(), SendError>>) {
        self.sends.lock().unwrap().extend(results);
    }

    pub fn script_batch(&self, updates: Vec<TelegramUpdate>) {
        self.fetches.lock().unwrap().push_back(Ok(updates));
    }

    pub fn script_fetch_error(&self, message: &str) {
        self.fetches.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn delivered(&self) -> Vec<Attempt> {
        self.attempts().into_iter().filter(|a| a.ok).collect()
    }

    pub fn requests(&self) -> Vec<UpdatesRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BotApi for ScriptedApi {
    async fn get_updates(&self, request: &UpdatesRequest) -> Result<Vec<TelegramUpdate>, FetchError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self.fetches.lock().unwrap().pop_front();
        match next {
            Some(Ok(updates)) => Ok(updates
                .into_iter()
                .filter(|u| u.update_id >= request.offset)
                .collect()),
            Some(Err(message)) => Err(FetchError::Api(message)),
            None => {
                tokio::time::sleep(self.idle_fetch).await;
                Ok(Vec::new())
            }
        }
    }

    async fn send_message(
        &self,
        conversation_id: &str,
        message: &OutboundMessage,
    ) -> Result<(), SendError> {
        if !self.send_latency.is_zero() {
            tokio::time::sleep(self.send_latency).await;
        }
        let result = self.sends.lock().unwrap().pop_front().unwrap_or(Ok(()));
        self.attempts.lock().unwrap().push(Attempt {
            conversation_id: conversation_id.to_string(),
            text: message.text.clone(),
            thread_id: message.thread_id,
            at: Instant::now(),
            ok: result.is_ok(),
        });
        result
    }
}

pub fn rate_limited() -> SendError {
    SendError::from_code(429, "Too Many Requests", None)
}

pub fn server_error() -> SendError {
    SendError::from_code(502, "Bad Gateway", None)
}

pub fn forbidden() -> SendError {
    SendError::from_code(403, "Forbidden: bot was blocked by the user", None)
}

/// A text message update from user `sender` in chat `chat`.
pub fn text_update(update_id: u64, chat: i64, sender: i64, text: &str) -> TelegramUpdate {
    serde_json::from_value(serde_json::json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "chat": { "id": chat, "type": "private" },
            "from": { "id": sender, "is_bot": false, "first_name": "t" },
            "text": text,
        }
    }))
    .unwrap()
}

/// An update that carries no text (e.g. a sticker).
pub fn non_text_update(update_id: u64, chat: i64) -> TelegramUpdate {
    serde_json::from_value(serde_json::json!({
        "update_id": update_id,
        "message": { "message_id": update_id, "chat": { "id": chat, "type": "private" } }
    }))
    .unwrap()
}
