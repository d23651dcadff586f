//! Communication channels (e.g. Telegram).
//!
//! [`BotApi`] is the seam between the pipeline and the platform; [`TelegramClient`]
//! implements it over HTTP. Updates are reduced to [`InboundEvent`]s for dispatch.

mod api;
mod inbound;
mod telegram;

pub use api::{BotApi, FetchError, OutboundMessage, ParseMode, SendError, UpdatesRequest};
pub use inbound::{parse_command, InboundEvent};
pub use telegram::{
    TelegramChat, TelegramClient, TelegramMessage, TelegramUpdate, TelegramUser, TELEGRAM_API_BASE,
};
