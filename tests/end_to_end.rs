// tests/end_to_end.rs
//
// Drives the real object graph (registry, adapters, dispatcher) against
// seeded caches; no network involved.

use std::sync::Arc;

use covid_br_tracker::botlog::CommandLog;
use covid_br_tracker::notify::ConsoleChat;
use covid_br_tracker::scheduler::TokioScheduler;
use covid_br_tracker::sources::gov_br::{GovBrPayload, StateRecord};
use covid_br_tracker::sources::RawCount;
use covid_br_tracker::store::MemoryStore;
use covid_br_tracker::{
    region, CommandContext, Dispatcher, Refresh, Region, SourceKind, SourceRegistry, WatchService,
};

fn rio_payload() -> GovBrPayload {
    GovBrPayload {
        br: Vec::new(),
        states: vec![StateRecord {
            nome: Some("Rio de Janeiro".to_string()),
            qtd_confirmado: Some(RawCount::Text("1.234".to_string())),
            qtd_obito: Some(RawCount::Int(56)),
            updated_at: Some("2020-04-05T18:30:00.000Z".to_string()),
        }],
    }
}

#[tokio::test]
async fn thousands_separated_state_counts_reach_the_reading() {
    let registry = SourceRegistry::new(vec![SourceKind::GovBr], None);
    registry.caches().gov_br.install(rio_payload());

    let region = region::classify("RJ").expect("RJ is a state code");
    let mut adapter = registry.primary_for(&region).expect("one source configured");

    assert_eq!(adapter.refresh().await, Refresh::Fresh);
    let reading = adapter.reading();
    assert_eq!(reading.confirmed, 1234);
    assert_eq!(reading.deaths, 56);
    assert_eq!(reading.region.to_string(), "RJ");
    assert!(reading.has_data());
}

#[tokio::test]
async fn a_bare_state_query_flows_through_the_dispatcher() {
    let registry = Arc::new(SourceRegistry::new(vec![SourceKind::GovBr], None));
    registry.caches().gov_br.install(rio_payload());

    let watches = Arc::new(WatchService::new(
        registry.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ConsoleChat),
        Arc::new(TokioScheduler::new()),
    ));
    let log = Arc::new(CommandLog::with_capacity(8));
    let dispatcher = Dispatcher::new(registry, watches, log.clone(), 3600);

    let ctx = CommandContext::new("chat-42", "ana");
    let out = dispatcher.stats(&ctx, "RJ").await;

    assert!(out.contains("Ministério da Saúde"));
    assert!(out.contains("Confirmed: 1234"));
    assert!(out.contains("Deaths: 56"));
    // 18:30 UTC renders in the São Paulo offset.
    assert!(out.contains("05-04-2020 15:30"));

    let events = log.snapshot_last_n(1);
    assert_eq!(events[0].command, "/stats");
    assert_eq!(events[0].chat_id, "chat-42");
}

#[tokio::test]
async fn every_publisher_renders_a_no_data_line_before_any_fetch() {
    let registry = SourceRegistry::new(SourceKind::all().to_vec(), None);

    for adapter in registry.adapters_for(&Region::Country) {
        let line = adapter.describe();
        assert!(
            line.contains("no data available"),
            "unexpected describe output: {line}"
        );
        assert!(
            line.contains(adapter.name()),
            "describe must carry the publisher name: {line}"
        );
    }
}

#[tokio::test]
async fn unknown_regions_never_reach_the_adapters() {
    let registry = Arc::new(SourceRegistry::new(vec![SourceKind::GovBr], None));
    let watches = Arc::new(WatchService::new(
        registry.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(ConsoleChat),
        Arc::new(TokioScheduler::new()),
    ));
    let dispatcher = Dispatcher::new(
        registry,
        watches,
        Arc::new(CommandLog::with_capacity(8)),
        3600,
    );

    let ctx = CommandContext::new("chat-42", "ana");
    let out = dispatcher.stats(&ctx, "XX").await;
    assert!(out.contains("I don't know \"XX\""));
}
