//! Ministério da Saúde covid portal.
//!
//! Two endpoints behind one API key: `PortalGeral` carries the single
//! country record, `PortalMapa` the per-state breakdown. No city grain.
//! Counts arrive as strings with `.` thousands separators.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::{folded_eq, Region};
use crate::sources::{
    content_marker, count_or_zero, fetch_json, RawCount, Refresh, RefreshState, SourceAdapter,
};
use crate::stats::{sao_paulo_offset, NormalizedReading, Series};

const PORTAL_GERAL_URL: &str =
    "https://xx9p7hp1p7.execute-api.us-east-1.amazonaws.com/prod/PortalGeral";
const PORTAL_MAPA_URL: &str =
    "https://xx9p7hp1p7.execute-api.us-east-1.amazonaws.com/prod/PortalMapa";

/// Portal API key, shipped to every visitor of the public dashboard.
const APP_ID_HEADER: &str = "x-parse-application-id";
const APP_ID: &str = "unAFkcaNDeXajurGB7LChj8SgQYS2ptm";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    results: Vec<T>,
}

/// Both portal halves, as cached between fetches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovBrPayload {
    #[serde(default)]
    pub br: Vec<CountryRecord>,
    #[serde(default)]
    pub states: Vec<StateRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountryRecord {
    #[serde(default)]
    pub total_confirmado: Option<RawCount>,
    #[serde(default)]
    pub total_obitos: Option<RawCount>,
    #[serde(default, rename = "updatedAt")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub qtd_confirmado: Option<RawCount>,
    #[serde(default)]
    pub qtd_obito: Option<RawCount>,
    #[serde(default, rename = "updatedAt")]
    pub updated_at: Option<String>,
}

pub struct GovBrSource {
    cache: SourceCache<GovBrPayload>,
    client: Client,
    region: Region,
    state: RefreshState,
}

impl GovBrSource {
    pub const NAME: &'static str = "Ministério da Saúde";

    pub fn new(cache: SourceCache<GovBrPayload>, client: Client, region: Region) -> Self {
        let state = RefreshState::new(Self::NAME, region.clone());
        Self {
            cache,
            client,
            region,
            state,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.client.get(url).header(APP_ID_HEADER, APP_ID)
    }

    fn extract(payload: &GovBrPayload, region: &Region) -> Result<NormalizedReading> {
        match region {
            Region::Country => {
                let Some(record) = payload.br.first() else {
                    return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
                };
                Ok(NormalizedReading {
                    confirmed: count_or_zero(&record.total_confirmado),
                    deaths: count_or_zero(&record.total_obitos),
                    recovered: 0,
                    timestamp: Some(parse_updated_at(record.updated_at.as_deref())?),
                    source: Self::NAME.into(),
                    region: region.clone(),
                })
            }
            Region::State { .. } => {
                let Some(name) = region.state_name() else {
                    return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
                };
                let Some(record) = payload
                    .states
                    .iter()
                    .find(|s| s.nome.as_deref().is_some_and(|n| folded_eq(n, name)))
                else {
                    return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
                };
                Ok(NormalizedReading {
                    confirmed: count_or_zero(&record.qtd_confirmado),
                    deaths: count_or_zero(&record.qtd_obito),
                    recovered: 0,
                    timestamp: Some(parse_updated_at(record.updated_at.as_deref())?),
                    source: Self::NAME.into(),
                    region: region.clone(),
                })
            }
            // The ministry publishes no city breakdown.
            Region::City { .. } => Ok(NormalizedReading::empty(Self::NAME, region.clone())),
        }
    }
}

fn parse_updated_at(raw: Option<&str>) -> Result<DateTime<FixedOffset>> {
    let raw = raw.context("record carries no updatedAt")?;
    let parsed =
        DateTime::parse_from_rfc3339(raw).with_context(|| format!("bad updatedAt {raw:?}"))?;
    Ok(parsed.with_timezone(&sao_paulo_offset()))
}

#[async_trait]
impl SourceAdapter for GovBrSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load(&self) -> bool {
        let geral = fetch_json::<Envelope<CountryRecord>>(self.request(PORTAL_GERAL_URL)).await;
        let mapa = fetch_json::<Envelope<StateRecord>>(self.request(PORTAL_MAPA_URL)).await;

        // The halves publish independently; keep whichever cached half a
        // failed endpoint would otherwise wipe.
        let mut payload = self.cache.snapshot().unwrap_or_default();
        let mut installed = false;
        match geral {
            Ok(envelope) => {
                payload.br = envelope.results;
                installed = true;
            }
            Err(error) => warn!(source = Self::NAME, error = ?error, "PortalGeral fetch failed"),
        }
        match mapa {
            Ok(envelope) => {
                payload.states = envelope.results;
                installed = true;
            }
            Err(error) => warn!(source = Self::NAME, error = ?error, "PortalMapa fetch failed"),
        }

        if installed {
            self.cache.install(payload);
            counter!("source_load_total").increment(1);
        } else {
            counter!("source_load_errors_total").increment(1);
        }
        installed
    }

    async fn refresh(&mut self) -> Refresh {
        if self.cache.needs_reload() {
            self.load().await;
        }
        let Some(payload) = self.cache.snapshot() else {
            return self.state.cache_empty();
        };
        let marker = content_marker(&payload);
        if self.state.is_current(&marker) {
            return Refresh::Unchanged;
        }
        self.state.accept(marker, Self::extract(&payload, &self.region))
    }

    fn reading(&self) -> &NormalizedReading {
        self.state.reading()
    }

    /// The portal exposes no history endpoint.
    async fn series(&self) -> Option<Series> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::classify;

    fn payload() -> GovBrPayload {
        serde_json::from_str(
            r#"{
                "br": [{
                    "total_confirmado": "11.130",
                    "total_obitos": "486",
                    "updatedAt": "2020-04-05T22:25:51.000Z"
                }],
                "states": [
                    {
                        "nome": "São Paulo",
                        "qtd_confirmado": "4.866",
                        "qtd_obito": 275,
                        "updatedAt": "2020-04-05T22:25:51.000Z"
                    },
                    {
                        "nome": "Rio de Janeiro",
                        "qtd_confirmado": "1.234",
                        "qtd_obito": "41",
                        "updatedAt": "2020-04-05T22:25:51.000Z"
                    }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn country_reading_strips_separators() {
        let reading = GovBrSource::extract(&payload(), &Region::Country).unwrap();
        assert_eq!(reading.confirmed, 11130);
        assert_eq!(reading.deaths, 486);
        assert!(reading.has_data());
    }

    #[test]
    fn state_lookup_is_accent_insensitive() {
        let region = classify("sao paulo").unwrap();
        let reading = GovBrSource::extract(&payload(), &region).unwrap();
        assert_eq!(reading.confirmed, 4866);
        assert_eq!(reading.deaths, 275);
    }

    #[test]
    fn unknown_state_yields_empty_reading() {
        let region = Region::state("TO");
        let mut p = payload();
        p.states.retain(|s| s.nome.as_deref() == Some("São Paulo"));
        let reading = GovBrSource::extract(&p, &region).unwrap();
        assert!(!reading.has_data());
    }

    #[test]
    fn city_region_has_no_data_here() {
        let region = classify("Niterói").unwrap();
        let reading = GovBrSource::extract(&payload(), &region).unwrap();
        assert!(!reading.has_data());
    }

    #[test]
    fn missing_updated_at_is_an_extraction_error() {
        let mut p = payload();
        p.br[0].updated_at = None;
        assert!(GovBrSource::extract(&p, &Region::Country).is_err());
    }

    #[tokio::test]
    async fn refresh_reports_each_portal_version_once() {
        let cache = SourceCache::new();
        cache.install(payload());
        let mut source = GovBrSource::new(cache.clone(), Client::new(), Region::Country);

        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.reading().confirmed, 11130);
        assert_eq!(source.refresh().await, Refresh::Unchanged);

        let mut next = payload();
        next.br[0].total_confirmado = Some(RawCount::Text("12.056".into()));
        cache.install(next);
        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.reading().confirmed, 12056);
    }

    #[tokio::test]
    async fn second_adapter_on_same_cache_gets_its_own_first_sighting() {
        let cache = SourceCache::new();
        cache.install(payload());
        let mut first = GovBrSource::new(cache.clone(), Client::new(), Region::Country);
        assert_eq!(first.refresh().await, Refresh::Fresh);
        assert_eq!(first.refresh().await, Refresh::Unchanged);

        let mut second = GovBrSource::new(cache, Client::new(), Region::Country);
        assert_eq!(second.refresh().await, Refresh::Fresh);
    }

    #[tokio::test]
    async fn malformed_version_blanks_until_next_version() {
        let cache = SourceCache::new();
        cache.install(payload());
        let mut source = GovBrSource::new(cache.clone(), Client::new(), Region::Country);
        assert_eq!(source.refresh().await, Refresh::Fresh);

        let mut broken = payload();
        broken.br[0].updated_at = Some("soon".into());
        cache.install(broken);
        assert_eq!(source.refresh().await, Refresh::Malformed);
        assert!(!source.reading().has_data());
        assert_eq!(source.refresh().await, Refresh::Unchanged);

        cache.install(payload());
        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.reading().confirmed, 11130);
    }
}
