//! Bing covid dashboard.
//!
//! Worldwide payload: one node per country, each with per-state subareas.
//! The whole document shares a single `lastUpdated` stamp, so every
//! reading inherits it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::{folded_eq, Region};
use crate::sources::{content_marker, fetch_json, Refresh, RefreshState, SourceAdapter};
use crate::stats::{sao_paulo_offset, NormalizedReading, Series};

const DASHBOARD_URL: &str = "https://bing.com/covid/data";

const BRAZIL_NODE_ID: &str = "brazil";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BingPayload {
    #[serde(default, rename = "lastUpdated")]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub areas: Vec<AreaNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AreaNode {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, rename = "totalConfirmed")]
    pub total_confirmed: Option<u64>,
    #[serde(default, rename = "totalDeaths")]
    pub total_deaths: Option<u64>,
    #[serde(default, rename = "totalRecovered")]
    pub total_recovered: Option<u64>,
    #[serde(default)]
    pub areas: Vec<AreaNode>,
}

pub struct BingSource {
    cache: SourceCache<BingPayload>,
    client: Client,
    region: Region,
    state: RefreshState,
}

impl BingSource {
    pub const NAME: &'static str = "Bing";

    pub fn new(cache: SourceCache<BingPayload>, client: Client, region: Region) -> Self {
        let state = RefreshState::new(Self::NAME, region.clone());
        Self {
            cache,
            client,
            region,
            state,
        }
    }

    fn extract(payload: &BingPayload, region: &Region) -> Result<NormalizedReading> {
        let brazil = payload
            .areas
            .iter()
            .find(|a| a.id.as_deref() == Some(BRAZIL_NODE_ID))
            .context("no brazil node among worldwide areas")?;

        let node = match region {
            Region::Country => Some(brazil),
            Region::State { .. } => region.state_name().and_then(|name| {
                brazil
                    .areas
                    .iter()
                    .find(|a| a.display_name.as_deref().is_some_and(|n| folded_eq(n, name)))
            }),
            // Subareas are states; a city name matches only if the dashboard
            // happens to list it.
            Region::City { name, .. } => brazil
                .areas
                .iter()
                .find(|a| a.display_name.as_deref().is_some_and(|n| folded_eq(n, name))),
        };
        let Some(node) = node else {
            return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
        };

        Ok(NormalizedReading {
            confirmed: node.total_confirmed.unwrap_or(0),
            deaths: node.total_deaths.unwrap_or(0),
            recovered: node.total_recovered.unwrap_or(0),
            timestamp: Some(parse_last_updated(payload.last_updated.as_deref())?),
            source: Self::NAME.into(),
            region: region.clone(),
        })
    }
}

fn parse_last_updated(raw: Option<&str>) -> Result<DateTime<FixedOffset>> {
    let raw = raw.context("payload carries no lastUpdated")?;
    let parsed =
        DateTime::parse_from_rfc3339(raw).with_context(|| format!("bad lastUpdated {raw:?}"))?;
    Ok(parsed.with_timezone(&sao_paulo_offset()))
}

#[async_trait]
impl SourceAdapter for BingSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load(&self) -> bool {
        match fetch_json::<BingPayload>(self.client.get(DASHBOARD_URL)).await {
            Ok(payload) => {
                self.cache.install(payload);
                counter!("source_load_total").increment(1);
                true
            }
            Err(error) => {
                warn!(source = Self::NAME, error = ?error, "dashboard fetch failed; keeping cached payload");
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
        let marker = payload
            .last_updated
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

    /// The dashboard serves current totals only.
    async fn series(&self) -> Option<Series> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::classify;

    fn payload() -> BingPayload {
        serde_json::from_str(
            r#"{
                "lastUpdated": "2020-04-05T23:10:04.000Z",
                "areas": [
                    {
                        "id": "brazil",
                        "displayName": "Brasil",
                        "totalConfirmed": 11130,
                        "totalDeaths": 486,
                        "totalRecovered": 127,
                        "areas": [
                            {"id": "saopaulostate", "displayName": "São Paulo", "totalConfirmed": 4866, "totalDeaths": 275},
                            {"id": "riodejaneiro", "displayName": "Rio de Janeiro", "totalConfirmed": 1234, "totalDeaths": 41, "totalRecovered": 9}
                        ]
                    },
                    {"id": "italy", "displayName": "Italia", "totalConfirmed": 124632}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn country_reading_uses_the_brazil_node() {
        let reading = BingSource::extract(&payload(), &Region::Country).unwrap();
        assert_eq!(reading.confirmed, 11130);
        assert_eq!(reading.deaths, 486);
        assert_eq!(reading.recovered, 127);
        // 2020-04-05T23:10:04Z is 20:10:04 in Brasília.
        let ts = reading.timestamp.unwrap();
        assert_eq!(ts.to_rfc3339(), "2020-04-05T20:10:04-03:00");
    }

    #[test]
    fn state_lookup_folds_the_display_name() {
        let region = classify("rio de janeiro").unwrap();
        let reading = BingSource::extract(&payload(), &region).unwrap();
        assert_eq!(reading.confirmed, 1234);
        assert_eq!(reading.recovered, 9);
    }

    #[test]
    fn missing_brazil_node_is_an_extraction_error() {
        let mut p = payload();
        p.areas.retain(|a| a.id.as_deref() != Some("brazil"));
        assert!(BingSource::extract(&p, &Region::Country).is_err());
    }

    #[test]
    fn unknown_subarea_yields_empty_reading() {
        let region = classify("Florianópolis").unwrap();
        let reading = BingSource::extract(&payload(), &region).unwrap();
        assert!(!reading.has_data());
    }

    #[tokio::test]
    async fn refresh_follows_last_updated() {
        let cache = SourceCache::new();
        cache.install(payload());
        let mut source = BingSource::new(cache.clone(), Client::new(), Region::Country);

        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.refresh().await, Refresh::Unchanged);

        let mut next = payload();
        next.last_updated = Some("2020-04-06T02:40:00.000Z".into());
        cache.install(next);
        assert_eq!(source.refresh().await, Refresh::Fresh);
    }
}
