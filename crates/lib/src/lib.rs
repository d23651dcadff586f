//! Courier core library: inbound polling, command dispatch with rate limits, and
//! paced outbound delivery with bounded retries. Used by the `courier` CLI.

pub mod channels;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod init;
pub mod metrics;
pub mod outbound;
pub mod poller;
pub mod rate_limit;
pub mod shutdown;
