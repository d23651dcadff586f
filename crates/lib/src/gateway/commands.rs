//! Built-in bot commands.

use std::sync::Arc;

use crate::dispatch::{handler_fn, CommandDispatcher};
use crate::outbound::OutboundQueue;

const START_TEXT: &str = "Hi! I'm up and listening. Send /help to see what I can do.";

/// Register `start`, `ping`, `status` and `help`. `help` lists every command registered so far.
pub fn register_builtins(dispatcher: &mut CommandDispatcher, queue: OutboundQueue) {
    dispatcher.register(
        "start",
        handler_fn(|_| async { Ok(Some(START_TEXT.to_string())) }),
    );
    dispatcher.register("ping", handler_fn(|_| async { Ok(Some("pong".to_string())) }));
    dispatcher.register(
        "status",
        handler_fn(move |_| {
            let queue = queue.clone();
            async move {
                let s = queue.status();
                Ok(Some(format!(
                    "Outbound queue: {} pending, {}, {} active conversation(s).",
                    s.queue_length,
                    if s.processing { "delivering" } else { "idle" },
                    s.conversations
                )))
            }
        }),
    );

    let mut names = dispatcher.command_names();
    names.push("help".to_string());
    names.sort();
    let help = Arc::new(help_text(&names));
    dispatcher.register(
        "help",
        handler_fn(move |_| {
            let help = help.clone();
            async move { Ok(Some(help.as_str().to_string())) }
        }),
    );
}

fn help_text(names: &[String]) -> String {
    let mut text = String::from("Available commands:");
    for name in names {
        text.push_str("\n/");
        text.push_str(name);
    }
    text
}
