//! Multi-source overview.
//!
//! The registry knows the configured publisher order and owns the shared
//! caches; everything chat-facing builds its adapters through it. An
//! overview refreshes one adapter per publisher and stitches the non-empty
//! readings together in order, so a single dead upstream never empties the
//! reply.

use std::time::Duration;

use metrics::gauge;
use reqwest::Client;
use tracing::{debug, info};

use crate::http;
use crate::region::Region;
use crate::sources::{ensure_metrics_described, SourceAdapter, SourceCaches, SourceKind};
use crate::stats::Series;

pub struct SourceRegistry {
    order: Vec<SourceKind>,
    client: Client,
    caches: SourceCaches,
}

impl SourceRegistry {
    /// `order` is the publisher precedence for replies, watch jobs and
    /// history lookups. `cache_ttl` bounds how long a cached payload
    /// satisfies refreshes before adapters refetch.
    pub fn new(order: Vec<SourceKind>, cache_ttl: Option<Duration>) -> Self {
        ensure_metrics_described();
        let caches = match cache_ttl {
            Some(ttl) => SourceCaches::with_ttl(ttl),
            None => SourceCaches::new(),
        };
        Self {
            order,
            client: http::client(),
            caches,
        }
    }

    pub fn order(&self) -> &[SourceKind] {
        &self.order
    }

    pub fn caches(&self) -> &SourceCaches {
        &self.caches
    }

    /// One adapter per configured publisher, bound to `region`, in order.
    pub fn adapters_for(&self, region: &Region) -> Vec<Box<dyn SourceAdapter>> {
        self.order
            .iter()
            .map(|kind| kind.build(&self.caches, &self.client, region.clone()))
            .collect()
    }

    /// Adapter over the first configured publisher; watch jobs track this
    /// one so their notion of "new data" stays stable across ticks.
    pub fn primary_for(&self, region: &Region) -> Option<Box<dyn SourceAdapter>> {
        self.order
            .first()
            .map(|kind| kind.build(&self.caches, &self.client, region.clone()))
    }

    /// Refreshes every publisher for `region` and renders the combined
    /// reply.
    pub async fn overview(&self, region: &Region) -> String {
        let mut adapters = self.adapters_for(region);
        collect_overview(&mut adapters, region).await
    }

    /// First publisher in configured order with history for `region`.
    pub async fn series_for(&self, region: &Region) -> Option<(SourceKind, Series)> {
        for kind in &self.order {
            let adapter = kind.build(&self.caches, &self.client, region.clone());
            if let Some(series) = adapter.series().await {
                debug!(source = %kind, region = %region, points = series.len(), "history found");
                return Some((*kind, series));
            }
        }
        None
    }

    /// Force-fetches every publisher, regardless of cache state. Returns
    /// how many installed a payload.
    pub async fn reload_all(&self) -> usize {
        let mut loaded = 0usize;
        for kind in &self.order {
            let adapter = kind.build(&self.caches, &self.client, Region::Country);
            if adapter.load().await {
                loaded += 1;
            }
        }
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        gauge!("sources_last_reload_ts").set(now as f64);
        info!(loaded, total = self.order.len(), "publisher reload pass finished");
        loaded
    }
}

/// Refreshes each adapter in turn and joins the readings that carry data,
/// separated by blank lines. Adapters with nothing to say are left out
/// rather than padding the reply with "no data" lines.
pub async fn collect_overview(adapters: &mut [Box<dyn SourceAdapter>], region: &Region) -> String {
    let mut sections = Vec::new();
    for adapter in adapters.iter_mut() {
        adapter.refresh().await;
        if adapter.reading().has_data() {
            sections.push(adapter.describe());
        }
    }
    if sections.is_empty() {
        format!("No data available for {region}.")
    } else {
        sections.join("\n\n")
    }
}
