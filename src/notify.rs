//! Chat delivery seam.
//!
//! The platform wrapper owns command routing and transport; the core only
//! ever needs "deliver this text to this chat".

use anyhow::Result;
use async_trait::async_trait;

/// Outbound side of whatever chat platform embeds the bot.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// Stdout sink for local runs and demos.
pub struct ConsoleChat;

#[async_trait]
impl ChatSink for ConsoleChat {
    async fn send_text(&self, chat_id: &str, text: &str) -> Result<()> {
        println!("[{chat_id}]\n{text}\n");
        Ok(())
    }
}
