//! WHO situation-dashboard feed (OMS in Portuguese).
//!
//! One gzip JSON document of positional rows for every country and day.
//! Load keeps only the Brazil rows; the newest row carries the current
//! cumulative totals. Country grain only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use metrics::{counter, histogram};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::Region;
use crate::sources::{content_marker, fetch_json, Refresh, RefreshState, SourceAdapter};
use crate::stats::{sao_paulo_offset, NormalizedReading, Series};

const FEED_URL: &str = "https://dashboards-dev.sprinklr.com/data/9043/global-covid19-who-gis.json";

const COUNTRY_FILTER: &str = "BR";

// Positional row layout: epoch millis, ISO country code, then the
// delta/cumulative count columns.
const COL_TIMESTAMP: usize = 0;
const COL_COUNTRY: usize = 1;
const COL_DEATHS: usize = 4;
const COL_CONFIRMED: usize = 6;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OmsPayload {
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
}

pub struct OmsSource {
    cache: SourceCache<OmsPayload>,
    client: Client,
    region: Region,
    state: RefreshState,
}

impl OmsSource {
    pub const NAME: &'static str = "OMS";

    pub fn new(cache: SourceCache<OmsPayload>, client: Client, region: Region) -> Self {
        let state = RefreshState::new(Self::NAME, region.clone());
        Self {
            cache,
            client,
            region,
            state,
        }
    }

    fn extract(payload: &OmsPayload, region: &Region) -> Result<NormalizedReading> {
        // The feed has no subnational grain.
        if !region.is_country() {
            return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
        }
        if payload.rows.is_empty() {
            return Ok(NormalizedReading::empty(Self::NAME, region.clone()));
        }

        let (timestamp, newest) = payload
            .rows
            .iter()
            .filter_map(|row| Some((row_timestamp(row)?, row)))
            .max_by_key(|(ts, _)| *ts)
            .context("rows carry no usable timestamps")?;

        Ok(NormalizedReading {
            confirmed: row_count(newest, COL_CONFIRMED),
            deaths: row_count(newest, COL_DEATHS),
            recovered: 0,
            timestamp: Some(timestamp),
            source: Self::NAME.into(),
            region: region.clone(),
        })
    }
}

fn row_timestamp(row: &[Value]) -> Option<DateTime<FixedOffset>> {
    let millis = row.get(COL_TIMESTAMP)?.as_i64()?;
    Some(
        Utc.timestamp_millis_opt(millis)
            .single()?
            .with_timezone(&sao_paulo_offset()),
    )
}

fn row_count(row: &[Value], column: usize) -> u64 {
    let Some(value) = row.get(column) else {
        return 0;
    };
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
        .unwrap_or(0)
}

#[async_trait]
impl SourceAdapter for OmsSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load(&self) -> bool {
        match fetch_json::<OmsPayload>(self.client.get(FEED_URL)).await {
            Ok(worldwide) => {
                let rows = worldwide
                    .rows
                    .into_iter()
                    .filter(|row| {
                        row.get(COL_COUNTRY).and_then(Value::as_str) == Some(COUNTRY_FILTER)
                    })
                    .collect();
                self.cache.install(OmsPayload { rows });
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
        let marker = match payload
            .rows
            .iter()
            .filter_map(|row| row.get(COL_TIMESTAMP).and_then(Value::as_i64))
            .max()
        {
            Some(millis) => millis.to_string(),
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
        if !self.region.is_country() {
            return None;
        }
        if self.cache.needs_reload() {
            self.load().await;
        }
        let payload = self.cache.snapshot()?;
        let rows = payload.rows.iter().filter_map(|row| {
            Some((
                row_timestamp(row)?.date_naive(),
                [row_count(row, COL_CONFIRMED), row_count(row, COL_DEATHS), 0],
            ))
        });
        let series = Series::from_cumulative(rows);
        if series.is_empty() {
            return None;
        }
        histogram!("source_series_points").record(series.len() as f64);
        Some(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn payload() -> OmsPayload {
        // 2020-04-04 and 2020-04-05, noon UTC.
        serde_json::from_str(
            r#"{"rows": [
                [1586001600000, "BR", "AMRO", 73, 432, 852, 10278],
                [1586088000000, "BR", "AMRO", 54, 486, 852, 11130]
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn newest_row_wins() {
        let reading = OmsSource::extract(&payload(), &Region::Country).unwrap();
        assert_eq!(reading.confirmed, 11130);
        assert_eq!(reading.deaths, 486);
        assert!(reading.has_data());
    }

    #[test]
    fn subnational_regions_have_no_data_here() {
        let reading = OmsSource::extract(&payload(), &Region::state("SP")).unwrap();
        assert!(!reading.has_data());
    }

    #[test]
    fn rows_without_timestamps_are_an_extraction_error() {
        let p: OmsPayload =
            serde_json::from_str(r#"{"rows": [["soon", "BR", "AMRO", 0, 1, 0, 2]]}"#).unwrap();
        assert!(OmsSource::extract(&p, &Region::Country).is_err());
    }

    #[tokio::test]
    async fn series_keeps_one_point_per_day() {
        let cache = SourceCache::new();
        cache.install(payload());
        let source = OmsSource::new(cache, Client::new(), Region::Country);

        let series = source.series().await.unwrap();
        assert_eq!(series.len(), 2);
        let d5 = NaiveDate::from_ymd_opt(2020, 4, 5).unwrap();
        assert_eq!(series.get(d5), Some([11130, 486, 0]));
    }

    #[tokio::test]
    async fn refresh_tracks_the_newest_row() {
        let cache = SourceCache::new();
        cache.install(payload());
        let mut source = OmsSource::new(cache.clone(), Client::new(), Region::Country);

        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.refresh().await, Refresh::Unchanged);

        let mut next = payload();
        next.rows
            .push(serde_json::from_str(r#"[1586174400000, "BR", "AMRO", 40, 526, 900, 12030]"#).unwrap());
        cache.install(next);
        assert_eq!(source.refresh().await, Refresh::Fresh);
        assert_eq!(source.reading().confirmed, 12030);
    }
}
