//! G1 news portal feed.
//!
//! One JSON document with every municipal record ever published; each
//! record is a daily *increment*, so readings sum the matching records and
//! history accumulates them in date order. The only timestamp lives at the
//! top level, in Portuguese prose ("05/04/2020, às 20:00").

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::{folded_eq, Region};
use crate::sources::{content_marker, fetch_json, Refresh, RefreshState, SourceAdapter};
use crate::stats::{at_sao_paulo, NormalizedReading, Series};

const FEED_URL: &str = "https://api.especiaisg1.globo/api/eventos/brasil/";

static UPDATED_AT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<d>\d{1,2})/(?P<m>\d{1,2})/(?P<y>\d{4}), às (?P<h>\d{1,2}):(?P<min>\d{1,2})")
        .expect("valid updated_at pattern")
});

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct G1Payload {
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub docs: Vec<CaseDoc>,
}

/// One `(city, date)` increment. Fields come and go as the portal evolves,
/// so everything is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDoc {
    #[serde(default)]
    pub city_name: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub cases: Option<u64>,
    #[serde(default)]
    pub deaths: Option<u64>,
    #[serde(default)]
    pub recovery: Option<u64>,
}

pub struct G1Source {
    cache: SourceCache<G1Payload>,
    client: Client,
    region: Region,
    state: RefreshState,
}

impl G1Source {
    pub const NAME: &'static str = "G1";

    pub fn new(cache: SourceCache<G1Payload>, client: Client, region: Region) -> Self {
        let state = RefreshState::new(Self::NAME, region.clone());
        Self {
            cache,
            client,
            region,
            state,
        }
    }

    fn extract(payload: &G1Payload, region: &Region) -> Result<NormalizedReading> {
        let mut totals = [0u64; 3];
        let mut matched = false;
        for doc in payload.docs.iter().filter(|d| doc_matches(d, region)) {
            matched = true;
            totals[0] += doc.cases.unwrap_or(0);
            totals[1] += doc.deaths.unwrap_or(0);
            totals[2] += doc.recovery.unwrap_or(0);
        }
        if !matched {
            return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
        }
        let raw = payload
            .updated_at
            .as_deref()
            .context("payload carries no updated_at")?;
        Ok(NormalizedReading {
            confirmed: totals[0],
            deaths: totals[1],
            recovered: totals[2],
            timestamp: Some(parse_updated_at(raw)?),
            source: Self::NAME.into(),
            region: region.clone(),
        })
    }
}

fn doc_matches(doc: &CaseDoc, region: &Region) -> bool {
    match region {
        Region::Country => true,
        Region::State { code } => doc.state.as_deref() == Some(code.as_str()),
        Region::City { name, uf: Some(uf) } => {
            doc.state.as_deref() == Some(uf.as_str())
                && doc.city_name.as_deref().is_some_and(|c| folded_eq(c, name))
        }
        Region::City { name, uf: None } => {
            doc.city_name.as_deref().is_some_and(|c| folded_eq(c, name))
        }
    }
}

fn parse_updated_at(raw: &str) -> Result<DateTime<FixedOffset>> {
    let caps = UPDATED_AT
        .captures(raw)
        .with_context(|| format!("unrecognized updated_at {raw:?}"))?;
    let date = NaiveDate::from_ymd_opt(caps["y"].parse()?, caps["m"].parse()?, caps["d"].parse()?)
        .with_context(|| format!("impossible date in {raw:?}"))?;
    let time = NaiveTime::from_hms_opt(caps["h"].parse()?, caps["min"].parse()?, 0)
        .with_context(|| format!("impossible time in {raw:?}"))?;
    Ok(at_sao_paulo(date.and_time(time)))
}

fn doc_date(doc: &CaseDoc) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(doc.date.as_deref()?, "%Y-%m-%d").ok()
}

#[async_trait]
impl SourceAdapter for G1Source {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load(&self) -> bool {
        match fetch_json::<G1Payload>(self.client.get(FEED_URL)).await {
            Ok(payload) => {
                self.cache.install(payload);
                counter!("source_load_total").increment(1);
                true
            }
            Err(error) => {
                warn!(source = Self::NAME, error = ?error, "feed fetch failed; keeping cached payload");
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
        // The prose timestamp is the portal's own version stamp; compare it
        // raw so an unparseable value still dedups.
        let marker = payload
            .updated_at
            .clone()
            .unwrap_or_else(|| content_marker(&payload));
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
        let payload = self.cache.snapshot()?;
        let rows = payload
            .docs
            .iter()
            .filter(|d| doc_matches(d, &self.region))
            .filter_map(|d| {
                Some((
                    doc_date(d)?,
                    [
                        d.cases.unwrap_or(0),
                        d.deaths.unwrap_or(0),
                        d.recovery.unwrap_or(0),
                    ],
                ))
            });
        let series = Series::from_daily_deltas(rows);
        if series.is_empty() {
            return None;
        }
        histogram!("source_series_points").record(series.len() as f64);
        Some(series)
    }
}
