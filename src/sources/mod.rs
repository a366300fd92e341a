//! Upstream source adapters.
//!
//! Each adapter wraps one public COVID-19 publisher, shares a process-wide
//! payload cache with every other adapter bound to the same publisher, and
//! reduces the cached payload to a [`NormalizedReading`] for one region.
//!
//! The refresh cycle is deliberately forgiving: a failed fetch keeps the
//! previous payload, an unparseable payload yields an empty reading until
//! the publisher ships a new version, and only genuinely new versions are
//! reported as [`Refresh::Fresh`].

pub mod bing;
pub mod brasil_io;
pub mod g1;
pub mod gov_br;
pub mod oms;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::cache::SourceCache;
use crate::region::Region;
use crate::stats::{NormalizedReading, Series};

/// Outcome of one adapter refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// A payload version not seen by this adapter before; the reading was
    /// recomputed from it.
    Fresh,
    /// Same payload version as the previous cycle; the reading stands.
    Unchanged,
    /// No cached payload and the fetch could not produce one.
    NoData,
    /// A new payload version arrived but could not be interpreted; the
    /// reading is empty until the publisher ships the next version.
    Malformed,
}

impl Refresh {
    /// True only when this cycle produced data the adapter had not seen.
    pub fn is_fresh(self) -> bool {
        matches!(self, Refresh::Fresh)
    }
}

/// One upstream publisher bound to one region.
///
/// Adapters are cheap to construct: the heavy state is the shared payload
/// cache, so a chat command and a background watch can each hold their own
/// adapter over the same upstream without refetching.
#[async_trait]
pub trait SourceAdapter: Send {
    /// Human-readable publisher name, used verbatim in chat output.
    fn name(&self) -> &'static str;

    /// Fetches the upstream payload and installs it in the shared cache.
    ///
    /// Returns `false` when nothing could be installed; the previous
    /// payload, if any, is left untouched either way.
    async fn load(&self) -> bool;

    /// Brings the reading in line with the cached payload, fetching first
    /// if the cache wants a reload.
    async fn refresh(&mut self) -> Refresh;

    /// The reading computed by the most recent refresh.
    fn reading(&self) -> &NormalizedReading;

    /// Per-day history for this adapter's region, where the publisher has
    /// one.
    async fn series(&self) -> Option<Series>;

    /// Chat-ready rendering of the current reading.
    fn describe(&self) -> String {
        self.reading().describe()
    }
}

/// Marker plus last reading; the per-instance half of an adapter.
///
/// The shared cache answers "what did the publisher last send", this
/// answers "what has *this* adapter already told its consumer". Keeping it
/// per instance is what lets two watches over the same publisher each get
/// their own first-sighting notification.
#[derive(Debug)]
pub(crate) struct RefreshState {
    marker: Option<String>,
    reading: NormalizedReading,
}

impl RefreshState {
    pub(crate) fn new(source: &str, region: Region) -> Self {
        Self {
            marker: None,
            reading: NormalizedReading::empty(source, region),
        }
    }

    pub(crate) fn reading(&self) -> &NormalizedReading {
        &self.reading
    }

    /// True when `marker` matches the version already applied.
    pub(crate) fn is_current(&self, marker: &str) -> bool {
        self.marker.as_deref() == Some(marker)
    }

    /// The cached payload disappeared; forget everything derived from it.
    pub(crate) fn cache_empty(&mut self) -> Refresh {
        self.marker = None;
        self.reading =
            NormalizedReading::empty(self.reading.source.as_str(), self.reading.region.clone());
        Refresh::NoData
    }

    /// Applies the extraction result for a payload version not seen before.
    ///
    /// A failed extraction still records the marker: the bad version was
    /// seen, and re-parsing it every cycle would only repeat the warning.
    pub(crate) fn accept(
        &mut self,
        marker: String,
        extracted: Result<NormalizedReading>,
    ) -> Refresh {
        match extracted {
            Ok(reading) => {
                self.reading = reading;
                self.marker = Some(marker);
                counter!("source_refresh_fresh_total").increment(1);
                Refresh::Fresh
            }
            Err(error) => {
                warn!(
                    source = %self.reading.source,
                    region = %self.reading.region,
                    %marker,
                    error = ?error,
                    "payload version could not be interpreted"
                );
                self.reading = NormalizedReading::empty(
                    self.reading.source.as_str(),
                    self.reading.region.clone(),
                );
                self.marker = Some(marker);
                counter!("source_parse_errors_total").increment(1);
                Refresh::Malformed
            }
        }
    }
}

/// Sends the request and decodes the JSON body.
pub(crate) async fn fetch_json<T: DeserializeOwned>(request: reqwest::RequestBuilder) -> Result<T> {
    let response = request.send().await.context("request failed")?;
    let response = response
        .error_for_status()
        .context("upstream returned an error status")?;
    response.json::<T>().await.context("body is not valid json")
}

/// Short content digest, used as a version marker when the payload carries
/// no usable timestamp.
pub(crate) fn content_marker<T: Serialize>(payload: &T) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}

/// Count that arrives either as a JSON number or as a formatted string
/// such as `"1.234"`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RawCount {
    Int(u64),
    Float(f64),
    Text(String),
}

impl RawCount {
    /// Numeric value, treating `.`, `,` and spaces in strings as thousands
    /// separators. Anything unintelligible counts as zero.
    pub fn value(&self) -> u64 {
        match self {
            RawCount::Int(n) => *n,
            RawCount::Float(f) if *f >= 0.0 => *f as u64,
            RawCount::Float(_) => 0,
            RawCount::Text(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            }
        }
    }
}

/// Numeric value of an optional wire count; absent means zero.
pub(crate) fn count_or_zero(count: &Option<RawCount>) -> u64 {
    count.as_ref().map(RawCount::value).unwrap_or(0)
}

/// Identifier of a publisher, as written in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    GovBr,
    G1,
    Bing,
    BrasilIo,
    Oms,
}

impl SourceKind {
    pub fn all() -> [SourceKind; 5] {
        [
            SourceKind::GovBr,
            SourceKind::G1,
            SourceKind::Bing,
            SourceKind::BrasilIo,
            SourceKind::Oms,
        ]
    }

    /// Configuration-file spelling of this publisher.
    pub fn id(self) -> &'static str {
        match self {
            SourceKind::GovBr => "gov-br",
            SourceKind::G1 => "g1",
            SourceKind::Bing => "bing",
            SourceKind::BrasilIo => "brasil-io",
            SourceKind::Oms => "oms",
        }
    }

    /// Publisher name as shown in chat output.
    pub fn display_name(self) -> &'static str {
        match self {
            SourceKind::GovBr => gov_br::GovBrSource::NAME,
            SourceKind::G1 => g1::G1Source::NAME,
            SourceKind::Bing => bing::BingSource::NAME,
            SourceKind::BrasilIo => brasil_io::BrasilIoSource::NAME,
            SourceKind::Oms => oms::OmsSource::NAME,
        }
    }

    /// Builds an adapter over the shared cache for this publisher, bound
    /// to `region`.
    pub fn build(
        self,
        caches: &SourceCaches,
        client: &Client,
        region: Region,
    ) -> Box<dyn SourceAdapter> {
        match self {
            SourceKind::GovBr => Box::new(gov_br::GovBrSource::new(
                caches.gov_br.clone(),
                client.clone(),
                region,
            )),
            SourceKind::G1 => Box::new(g1::G1Source::new(
                caches.g1.clone(),
                client.clone(),
                region,
            )),
            SourceKind::Bing => Box::new(bing::BingSource::new(
                caches.bing.clone(),
                client.clone(),
                region,
            )),
            SourceKind::BrasilIo => Box::new(brasil_io::BrasilIoSource::new(
                caches.brasil_io.clone(),
                client.clone(),
                region,
            )),
            SourceKind::Oms => Box::new(oms::OmsSource::new(
                caches.oms.clone(),
                client.clone(),
                region,
            )),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SourceKind::all()
            .into_iter()
            .find(|kind| kind.id() == s)
            .with_context(|| format!("unknown source id {s:?}"))
    }
}

/// One shared payload cache per publisher.
///
/// Clones share the underlying slots, so every adapter built from the same
/// bundle sees the same payloads.
#[derive(Clone, Default)]
pub struct SourceCaches {
    pub gov_br: SourceCache<gov_br::GovBrPayload>,
    pub g1: SourceCache<g1::G1Payload>,
    pub bing: SourceCache<bing::BingPayload>,
    pub brasil_io: SourceCache<brasil_io::BrasilIoPayload>,
    pub oms: SourceCache<oms::OmsPayload>,
}

impl SourceCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches whose payloads expire `ttl` after installation.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            gov_br: SourceCache::with_ttl(ttl),
            g1: SourceCache::with_ttl(ttl),
            bing: SourceCache::with_ttl(ttl),
            brasil_io: SourceCache::with_ttl(ttl),
            oms: SourceCache::with_ttl(ttl),
        }
    }
}

/// One-time metrics registration.
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "source_load_total",
            "Payloads fetched and installed in a source cache."
        );
        describe_counter!(
            "source_load_errors_total",
            "Upstream fetches that produced nothing installable."
        );
        describe_counter!(
            "source_refresh_fresh_total",
            "Refresh cycles that saw a new payload version."
        );
        describe_counter!(
            "source_parse_errors_total",
            "Payload versions that could not be interpreted."
        );
        describe_counter!(
            "watch_notifications_total",
            "Watch ticks that pushed a message to a chat."
        );
        describe_histogram!(
            "source_series_points",
            "Points per historical series handed to a consumer."
        );
        describe_gauge!(
            "sources_last_reload_ts",
            "Unix ts when every publisher was last force-reloaded."
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_count_reads_dotted_strings() {
        let count: RawCount = serde_json::from_str("\"1.234\"").unwrap();
        assert_eq!(count.value(), 1234);
    }

    #[test]
    fn raw_count_reads_plain_numbers() {
        let count: RawCount = serde_json::from_str("567").unwrap();
        assert_eq!(count.value(), 567);
        let count: RawCount = serde_json::from_str("3304557.0").unwrap();
        assert_eq!(count.value(), 3304557);
    }

    #[test]
    fn raw_count_garbage_is_zero() {
        let count: RawCount = serde_json::from_str("\"n/a\"").unwrap();
        assert_eq!(count.value(), 0);
        let count: RawCount = serde_json::from_str("-4.0").unwrap();
        assert_eq!(count.value(), 0);
    }

    #[test]
    fn source_kind_round_trips_through_config_ids() {
        for kind in SourceKind::all() {
            assert_eq!(kind.id().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("twitter".parse::<SourceKind>().is_err());
    }

    #[test]
    fn refresh_state_reports_each_version_once() {
        let mut state = RefreshState::new("somewhere", Region::Country);
        assert!(!state.is_current("v1"));

        let reading = NormalizedReading {
            confirmed: 10,
            ..NormalizedReading::empty("somewhere", Region::Country)
        };
        assert_eq!(state.accept("v1".into(), Ok(reading)), Refresh::Fresh);
        assert!(state.is_current("v1"));
        assert_eq!(state.reading().confirmed, 10);
    }

    #[test]
    fn refresh_state_blanks_reading_on_bad_version() {
        let mut state = RefreshState::new("somewhere", Region::Country);
        let reading = NormalizedReading {
            confirmed: 10,
            ..NormalizedReading::empty("somewhere", Region::Country)
        };
        state.accept("v1".into(), Ok(reading));

        let outcome = state.accept("v2".into(), Err(anyhow::anyhow!("boom")));
        assert_eq!(outcome, Refresh::Malformed);
        assert!(!state.reading().has_data());
        // The bad version was seen; the next cycle must not re-report it.
        assert!(state.is_current("v2"));
    }

    #[test]
    fn content_marker_tracks_payload_changes() {
        let a = content_marker(&vec![1, 2, 3]);
        let b = content_marker(&vec![1, 2, 4]);
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_eq!(a, content_marker(&vec![1, 2, 3]));
    }
}
