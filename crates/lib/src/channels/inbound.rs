//! Inbound event: one platform update reduced to the fields the dispatcher needs.

use crate::channels::telegram::TelegramUpdate;

/// A command-bearing message from a conversation. Built once per update and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Platform update id; the poller's cursor moves past it once handed off.
    pub id: u64,
    pub conversation_id: String,
    pub sender_id: String,
    pub raw_text: String,
    /// Lowercase command without the leading '/' or '@botname'; None when the text is not a command.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Forum topic the message came from, so replies land in the same thread.
    pub thread_id: Option<i64>,
}

impl InboundEvent {
    /// Build an event from a Telegram update. Updates without a text message yield None.
    pub fn from_update(update: &TelegramUpdate) -> Option<Self> {
        let msg = update.message.as_ref()?;
        let text = msg.text.as_ref()?;
        let conversation_id = msg.chat.id.to_string();
        // Channel posts carry no sender; fall back to the chat so rate limits still apply per source.
        let sender_id = msg
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_else(|| conversation_id.clone());
        let (command, args) = match parse_command(text) {
            Some((c, a)) => (Some(c), a),
            None => (None, Vec::new()),
        };
        Some(Self {
            id: update.update_id,
            conversation_id,
            sender_id,
            raw_text: text.clone(),
            command,
            args,
            thread_id: msg.message_thread_id,
        })
    }
}

/// Split `/Cmd@bot arg1 arg2` into ("cmd", ["arg1", "arg2"]). Returns None if the text is not a command.
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let mut parts = text.split_whitespace();
    let head = parts.next()?.strip_prefix('/')?;
    let name = head.split('@').next().unwrap_or("");
    if name.is_empty() {
        return None;
    }
    Some((
        name.to_lowercase(),
        parts.map(str::to_string).collect(),
    ))
}
