//! dispatch.rs — the per-command entry points a chat platform routes to.
//!
//! Each handler takes the caller's [`CommandContext`] plus the raw argument
//! text and returns the reply as plain text (or chart data for `/series`).
//! Argument problems come back as usage text, unrecognized regions as a
//! guidance message; handlers never return errors to the platform. Every
//! call lands in the [`CommandLog`] audit ring.

use std::sync::Arc;

use crate::aggregate::SourceRegistry;
use crate::botlog::CommandLog;
use crate::region::{self, Region};
use crate::sources::SourceKind;
use crate::stats::Series;
use crate::watch::{WatchService, MIN_INTERVAL_SECS};

/// Who sent the command. The platform collaborator fills this in.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub chat_id: String,
    pub username: String,
}

impl CommandContext {
    pub fn new(chat_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            username: username.into(),
        }
    }
}

/// Reply to a `/series` request. `Chart` hands the platform the data points
/// and a ready caption; rendering pixels is the platform's job.
#[derive(Debug, Clone)]
pub enum SeriesReply {
    Chart {
        source: SourceKind,
        series: Series,
        caption: String,
    },
    Text(String),
}

pub struct Dispatcher {
    registry: Arc<SourceRegistry>,
    watches: Arc<WatchService>,
    log: Arc<CommandLog>,
    default_watch_secs: u64,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SourceRegistry>,
        watches: Arc<WatchService>,
        log: Arc<CommandLog>,
        default_watch_secs: u64,
    ) -> Self {
        Self {
            registry,
            watches,
            log,
            default_watch_secs: default_watch_secs.max(MIN_INTERVAL_SECS),
        }
    }

    /// `/stats [region]`: combined case numbers from every publisher with
    /// data. A blank query means the whole country.
    pub async fn stats(&self, ctx: &CommandContext, query: &str) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/stats", query);
        match classify_or_country(query) {
            Some(region) => self.registry.overview(&region).await,
            None => unknown_region_text(query),
        }
    }

    /// `/series [region]`: cumulative history from the first publisher
    /// that keeps one.
    pub async fn series(&self, ctx: &CommandContext, query: &str) -> SeriesReply {
        self.log.record(&ctx.chat_id, &ctx.username, "/series", query);
        let Some(region) = classify_or_country(query) else {
            return SeriesReply::Text(unknown_region_text(query));
        };
        match self.registry.series_for(&region).await {
            Some((source, series)) => {
                let until = series
                    .last()
                    .map(|(date, _)| format!(" up to {}", date.format("%d-%m-%Y")))
                    .unwrap_or_default();
                let caption = format!(
                    "{region}: cumulative cases{until} ({})",
                    source.display_name()
                );
                SeriesReply::Chart {
                    source,
                    series,
                    caption,
                }
            }
            None => SeriesReply::Text(format!("No history available for {region}.")),
        }
    }

    /// `/watch <region> [seconds] [all]`: periodic updates in this chat.
    /// `all` reports every new publication instead of only increases.
    pub async fn watch(&self, ctx: &CommandContext, args: &str) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/watch", args);

        let mut tokens: Vec<&str> = args.split_whitespace().collect();
        let mut only_report_increase = true;
        if tokens.last().is_some_and(|t| t.eq_ignore_ascii_case("all")) {
            only_report_increase = false;
            tokens.pop();
        }
        let mut interval_secs = self.default_watch_secs;
        if let Some(secs) = tokens.last().and_then(|t| t.parse::<u64>().ok()) {
            interval_secs = secs;
            tokens.pop();
        }
        let query = tokens.join(" ");
        if query.is_empty() {
            return watch_usage_text();
        }
        let Some(region) = region::classify(&query) else {
            return unknown_region_text(&query);
        };
        if interval_secs < MIN_INTERVAL_SECS {
            return format!(
                "The shortest watch interval is {MIN_INTERVAL_SECS} seconds.\n{}",
                watch_usage_text()
            );
        }

        match self
            .watches
            .watch(&ctx.chat_id, region.clone(), interval_secs, only_report_increase)
            .await
        {
            Ok(()) => format!(
                "Watching {region} every {interval_secs} seconds in this chat. Send /unwatch to stop."
            ),
            Err(e) => {
                tracing::warn!(error = ?e, chat_id = %ctx.chat_id, "watch request failed");
                "Sorry, this watch could not be scheduled right now.".to_string()
            }
        }
    }

    /// `/unwatch`: stop this chat's periodic updates.
    pub async fn unwatch(&self, ctx: &CommandContext) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/unwatch", "");
        if self.watches.unwatch(&ctx.chat_id).await {
            "Okay, periodic updates for this chat are stopped.".to_string()
        } else {
            "This chat has no active watch.".to_string()
        }
    }

    /// `/refresh`: force-reload every publisher's cache right now.
    pub async fn force_refresh(&self, ctx: &CommandContext) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/refresh", "");
        let loaded = self.registry.reload_all().await;
        let total = self.registry.order().len();
        if loaded == 0 {
            "No publisher could be reloaded right now.".to_string()
        } else {
            format!("Reloaded {loaded} of {total} publishers.")
        }
    }

    /// `/start`: introduction.
    pub fn start(&self, ctx: &CommandContext) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/start", "");
        "Hello! I track COVID-19 case numbers for Brazil across public sources \
         (Ministério da Saúde, G1, Bing, Brasil.io and the WHO). Send /help to \
         see what I can do."
            .to_string()
    }

    /// `/help`: command overview.
    pub fn help(&self, ctx: &CommandContext) -> String {
        self.log.record(&ctx.chat_id, &ctx.username, "/help", "");
        format!(
            "Commands you can send:\n\
             /start - introduce the bot\n\
             /help - this message\n\
             /stats [region] - case numbers for Brazil, a state code such as SC, or a city\n\
             /series [region] - cumulative case history for a region\n\
             /watch <region> [seconds] [all] - periodic updates in this chat \
             (default every {} seconds; `all` reports every new publication, \
             not just increases)\n\
             /unwatch - stop the periodic updates\n\
             /refresh - force a reload of every source\n\
             A region is BR, a two-letter state code, or a city name like \"Niterói, RJ\".",
            self.default_watch_secs
        )
    }
}

// Blank queries mean country-wide numbers, like the original bot's bare /stats.
fn classify_or_country(query: &str) -> Option<Region> {
    let q = query.trim();
    if q.is_empty() {
        return Some(Region::Country);
    }
    region::classify(q)
}

fn unknown_region_text(query: &str) -> String {
    let q = query.trim();
    format!(
        "I don't know \"{q}\". Try BR for the whole country, a two-letter state \
         code such as SP, or a city name like \"Niterói, RJ\"."
    )
}

fn watch_usage_text() -> String {
    "Usage: /watch <region> [seconds] [all], for example \"/watch SP 3600\". \
     The region is BR, a state code or a city; add `all` to hear about every \
     new publication, not only increases."
        .to_string()
}
