//! botlog.rs — in-memory audit trail of chat commands.
//!
//! Every dispatched command is captured twice: as a [`CommandEvent`] in a
//! bounded ring that an external sink can drain via [`CommandLog::snapshot_last_n`],
//! and as a structured `tracing` record. The tracing record carries a short
//! digest of the raw text instead of the text itself, so message contents
//! never land in operator logs.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct CommandEvent {
    pub ts_unix: u64,
    pub chat_id: String,
    pub username: String,
    pub command: String,
    pub raw_text: String,
}

#[derive(Debug)]
pub struct CommandLog {
    inner: Mutex<Vec<CommandEvent>>,
    cap: usize,
}

impl CommandLog {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Vec::with_capacity(cap.min(10_000))),
            cap: cap.min(10_000),
        }
    }

    pub fn record(&self, chat_id: &str, username: &str, command: &str, raw_text: &str) {
        let event = CommandEvent {
            ts_unix: now_unix(),
            chat_id: chat_id.to_string(),
            username: username.to_string(),
            command: command.to_string(),
            raw_text: raw_text.to_string(),
        };

        tracing::info!(
            chat_id = %event.chat_id,
            username = %event.username,
            command = %event.command,
            text_digest = %text_digest(&event.raw_text),
            "chat command"
        );

        let mut v = self.inner.lock().expect("command log mutex poisoned");
        v.push(event);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
    }

    pub fn snapshot_last_n(&self, n: usize) -> Vec<CommandEvent> {
        let v = self.inner.lock().expect("command log mutex poisoned");
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("command log mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn text_digest(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}
