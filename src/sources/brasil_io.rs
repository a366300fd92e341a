//! Brasil.io community dataset.
//!
//! REST dataset of per-municipality bulletin rows, paginated via `next`
//! links. The latest snapshot (`is_last=True`) serves readings; history
//! comes from two extra queries, per-state rows for the country and the
//! region's own IBGE code otherwise. Rows are cumulative per region, so a
//! country total is the sum of the state rows.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use metrics::{counter, histogram};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::{folded_eq, Region};
use crate::sources::{
    content_marker, fetch_json, RawCount, Refresh, RefreshState, SourceAdapter,
};
use crate::stats::{at_sao_paulo, NormalizedReading, Series};

const DATA_URL: &str = "https://brasil.io/api/dataset/covid19/caso/data";

/// Hard stop for `next`-link walks; the dataset is a handful of pages and
/// anything past this means the API started looping.
const MAX_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<CaseRecord>,
}

/// Latest snapshot rows, one per region still marked `is_last`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrasilIoPayload {
    #[serde(default)]
    pub results: Vec<CaseRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub place_type: Option<String>,
    #[serde(default)]
    pub confirmed: Option<u64>,
    #[serde(default)]
    pub deaths: Option<u64>,
    #[serde(default)]
    pub date: Option<String>,
    /// Arrives as an integer, but the API has shipped floats here.
    #[serde(default)]
    pub city_ibge_code: Option<RawCount>,
}

pub struct BrasilIoSource {
    cache: SourceCache<BrasilIoPayload>,
    client: Client,
    region: Region,
    state: RefreshState,
}

impl BrasilIoSource {
    pub const NAME: &'static str = "Brasil.io";

    pub fn new(cache: SourceCache<BrasilIoPayload>, client: Client, region: Region) -> Self {
        let state = RefreshState::new(Self::NAME, region.clone());
        Self {
            cache,
            client,
            region,
            state,
        }
    }

    async fn fetch_pages(&self, first_url: String) -> Result<Vec<CaseRecord>> {
        let mut records = Vec::new();
        let mut next = Some(first_url);
        let mut pages = 0usize;
        while let Some(url) = next {
            pages += 1;
            if pages > MAX_PAGES {
                bail!("pagination did not terminate after {MAX_PAGES} pages");
            }
            let page: Page = fetch_json(self.client.get(&url))
                .await
                .with_context(|| format!("page {url}"))?;
            records.extend(page.results);
            next = page.next;
        }
        Ok(records)
    }

    fn extract(payload: &BrasilIoPayload, region: &Region) -> Result<NormalizedReading> {
        let matched: Vec<&CaseRecord> = payload
            .results
            .iter()
            .filter(|r| record_matches(r, region))
            .collect();
        if matched.is_empty() {
            return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
        }

        let confirmed = matched.iter().map(|r| r.confirmed.unwrap_or(0)).sum();
        let deaths = matched.iter().map(|r| r.deaths.unwrap_or(0)).sum();
        let newest = matched
            .iter()
            .filter_map(|r| record_date(r))
            .max()
            .context("matched rows carry no parseable date")?;

        Ok(NormalizedReading {
            confirmed,
            deaths,
            recovered: 0,
            timestamp: Some(at_sao_paulo(newest.and_time(NaiveTime::MIN))),
            source: Self::NAME.into(),
            region: region.clone(),
        })
    }
}

fn record_matches(record: &CaseRecord, region: &Region) -> bool {
    let place_type = record.place_type.as_deref();
    match region {
        Region::Country => place_type == Some("state"),
        Region::State { code } => {
            place_type == Some("state") && record.state.as_deref() == Some(code.as_str())
        }
        Region::City { name, uf: Some(uf) } => {
            place_type == Some("city")
                && record.state.as_deref() == Some(uf.as_str())
                && record.city.as_deref().is_some_and(|c| folded_eq(c, name))
        }
        Region::City { name, uf: None } => {
            place_type == Some("city") && record.city.as_deref().is_some_and(|c| folded_eq(c, name))
        }
    }
}

fn record_date(record: &CaseRecord) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(record.date.as_deref()?, "%Y-%m-%d").ok()
}

fn history_row(record: &CaseRecord) -> Option<(NaiveDate, [u64; 3])> {
    Some((
        record_date(record)?,
        [record.confirmed.unwrap_or(0), record.deaths.unwrap_or(0), 0],
    ))
}

#[async_trait]
impl SourceAdapter for BrasilIoSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load(&self) -> bool {
        match self.fetch_pages(format!("{DATA_URL}?is_last=True")).await {
            Ok(results) => {
                self.cache.install(BrasilIoPayload { results });
                counter!("source_load_total").increment(1);
                true
            }
            Err(error) => {
                warn!(source = Self::NAME, error = ?error, "dataset fetch failed; keeping cached payload");
                counter!("source_load_errors_total").increment(1);
                false
            }
        }
    }

    async fn refresh(&mut self) -> Refresh {
        if self.cache.needs_reload() {
            self.load().await;
        }
        let Some(payload) = self.cache.snapshot() else {
            return self.state.cache_empty();
        };
        let marker = match payload.results.iter().filter_map(|r| r.date.as_deref()).max() {
            Some(newest) => format!("{newest}|{}", payload.results.len()),
            None => content_marker(&payload),
        };
        if self.state.is_current(&marker) {
            return Refresh::Unchanged;
        }
        self.state.accept(marker, Self::extract(&payload, &self.region))
    }

    fn reading(&self) -> &NormalizedReading {
        self.state.reading()
    }

    async fn series(&self) -> Option<Series> {
        if self.cache.needs_reload() {
            self.load().await;
        }

        let series = if self.region.is_country() {
            // Per-state cumulative rows for every date; same-date rows sum
            // to the country total.
            match self.fetch_pages(format!("{DATA_URL}?place_type=state")).await {
                Ok(rows) => Series::from_summed_cumulative(
                    rows.iter()
                        .filter(|r| r.place_type.as_deref() == Some("state"))
                        .filter_map(history_row),
                ),
                Err(error) => {
                    warn!(source = Self::NAME, error = ?error, "state history fetch failed");
                    return None;
                }
            }
        } else {
            // Walk the latest snapshot for the region's IBGE code, then pull
            // that region's own bulletin history.
            let payload = self.cache.snapshot()?;
            let code = payload
                .results
                .iter()
                .filter(|r| record_matches(r, &self.region))
                .find_map(|r| r.city_ibge_code.as_ref())
                .map(RawCount::value)?;
            if code == 0 {
                return None;
            }
            match self
                .fetch_pages(format!("{DATA_URL}?city_ibge_code={code}"))
                .await
            {
                Ok(rows) => Series::from_summed_cumulative(rows.iter().filter_map(history_row)),
                Err(error) => {
                    warn!(source = Self::NAME, error = ?error, code, "region history fetch failed");
                    return None;
                }
            }
        };

        if series.is_empty() {
            return None;
        }
        histogram!("source_series_points").record(series.len() as f64);
        Some(series)
    }
}
