//! covid-br-tracker — headless runner.
//! Boots the source registry, restores persisted watch jobs, starts the
//! system-wide refresh timer and serves a console chat loop.
//!
//! See `README.md` for quickstart notes.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use covid_br_tracker::botlog::CommandLog;
use covid_br_tracker::notify::ConsoleChat;
use covid_br_tracker::scheduler::{ReloadTask, Scheduler, TokioScheduler};
use covid_br_tracker::store::JsonFileStore;
use covid_br_tracker::{
    BotConfig, CommandContext, Dispatcher, Series, SeriesReply, SourceRegistry, WatchService,
};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("covid_br_tracker=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env first so COVBR_* variables reach the config loader.
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = BotConfig::load()?;
    info!(sources = ?config.sources, store = %config.store_path, "tracker starting");

    let registry = Arc::new(SourceRegistry::new(
        config.sources.clone(),
        config.cache_ttl(),
    ));
    let scheduler = Arc::new(TokioScheduler::new());
    let watches = Arc::new(WatchService::new(
        registry.clone(),
        Arc::new(JsonFileStore::new(&config.store_path)),
        Arc::new(ConsoleChat),
        scheduler.clone(),
    ));

    watches.restore().await;

    // Warm every cache once, then keep them warm on a timer.
    registry.reload_all().await;
    scheduler.schedule(
        config.refresh_interval(),
        Box::new(ReloadTask::new(registry.clone())),
    );

    let log = Arc::new(CommandLog::with_capacity(config.command_log_capacity));
    let dispatcher = Dispatcher::new(registry, watches, log, config.default_watch_interval_secs);

    run_console(dispatcher).await
}

async fn run_console(dispatcher: Dispatcher) -> anyhow::Result<()> {
    let ctx = CommandContext::new(
        "console",
        std::env::var("USER").unwrap_or_else(|_| "operator".to_string()),
    );
    println!("{}\n", dispatcher.start(&ctx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading console input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" || line == "/exit" {
            break;
        }
        println!("{}\n", route_line(&dispatcher, &ctx, line).await);
    }
    Ok(())
}

/// Console stand-in for a platform router: `/command [args]`, or a bare
/// region query like the original chat accepted.
async fn route_line(dispatcher: &Dispatcher, ctx: &CommandContext, line: &str) -> String {
    let (command, args) = match line.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match command {
        "/start" => dispatcher.start(ctx),
        "/help" => dispatcher.help(ctx),
        "/stats" => dispatcher.stats(ctx, args).await,
        "/series" => match dispatcher.series(ctx, args).await {
            SeriesReply::Chart {
                series, caption, ..
            } => series_text(&series, &caption),
            SeriesReply::Text(text) => text,
        },
        "/watch" => dispatcher.watch(ctx, args).await,
        "/unwatch" => dispatcher.unwatch(ctx).await,
        "/refresh" => dispatcher.force_refresh(ctx).await,
        other if !other.starts_with('/') => dispatcher.stats(ctx, line).await,
        other => format!("Unknown command {other}. Send /help for the list."),
    }
}

/// The console cannot draw charts; show the tail of the series instead.
fn series_text(series: &Series, caption: &str) -> String {
    use std::fmt::Write;

    let points: Vec<_> = series.iter().collect();
    let start = points.len().saturating_sub(7);
    let mut out = String::from(caption);
    for (date, [confirmed, deaths, _recovered]) in &points[start..] {
        let _ = write!(
            out,
            "\n{}: {confirmed} confirmed, {deaths} deaths",
            date.format("%d-%m-%Y")
        );
    }
    out
}
