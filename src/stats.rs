//! # Normalized Reading & Series
//!
//! The common shape every source adapter must produce: one cumulative
//! `{confirmed, deaths, recovered}` triple with an optional source timestamp,
//! plus the per-date `Series` used for history charts.
//!
//! Counts for a fixed `(source, region)` pair are cumulative and only ever
//! grow in real data; a later reading that shrinks indicates an upstream
//! correction (or a parsing bug) and is handled by the change detector, not
//! here.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::region::Region;

/// All sources report in Brasília time; the country dropped DST in 2019, so
/// a fixed -03:00 offset is exact.
pub fn sao_paulo_offset() -> FixedOffset {
    FixedOffset::west_opt(3 * 3600).expect("-03:00 is a valid offset")
}

/// Current calendar date in the -03:00 offset; series builders drop entries
/// dated after this.
pub fn today_sao_paulo() -> NaiveDate {
    Utc::now().with_timezone(&sao_paulo_offset()).date_naive()
}

/// Pins a wall-clock datetime to the -03:00 offset. A fixed offset has no
/// gaps or folds, so the mapping is always unique.
pub fn at_sao_paulo(naive: NaiveDateTime) -> DateTime<FixedOffset> {
    sao_paulo_offset()
        .from_local_datetime(&naive)
        .single()
        .expect("fixed offsets map local time uniquely")
}

/// One normalized observation from one source for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReading {
    pub confirmed: u64,
    pub deaths: u64,
    pub recovered: u64,
    /// `None` means the source had no data for this region this cycle.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub source: String,
    pub region: Region,
}

impl NormalizedReading {
    /// The "no data" reading every adapter starts from and degrades to.
    pub fn empty(source: impl Into<String>, region: Region) -> Self {
        Self {
            confirmed: 0,
            deaths: 0,
            recovered: 0,
            timestamp: None,
            source: source.into(),
            region,
        }
    }

    pub fn has_data(&self) -> bool {
        self.timestamp.is_some()
    }

    /// `[confirmed, deaths, recovered]`, the triple watch jobs track.
    pub fn counts(&self) -> [u64; 3] {
        [self.confirmed, self.deaths, self.recovered]
    }

    /// Deaths over confirmed, only when both are meaningful.
    pub fn fatality_rate(&self) -> Option<f64> {
        if self.confirmed > 0 && self.deaths > 0 {
            Some(self.deaths as f64 / self.confirmed as f64)
        } else {
            None
        }
    }

    /// Fixed source-agnostic rendering:
    ///
    /// ```text
    /// {source} at {dd-mm-yyyy HH:MM}
    /// Confirmed: n / Deaths: n / Recovered: n
    /// Fatality rate: p.p%   (only when confirmed and deaths are both > 0)
    /// ```
    ///
    /// An empty reading renders a one-line "no data" message instead.
    pub fn describe(&self) -> String {
        let Some(ts) = self.timestamp else {
            return format!("{}: no data available", self.source);
        };
        let mut out = format!("{} at {}", self.source, ts.format("%d-%m-%Y %H:%M"));
        let _ = write!(
            out,
            "\nConfirmed: {}\nDeaths: {}\nRecovered: {}",
            self.confirmed, self.deaths, self.recovered
        );
        if let Some(rate) = self.fatality_rate() {
            let _ = write!(out, "\nFatality rate: {:.1}%", rate * 100.0);
        }
        out
    }
}

/// Date-ordered cumulative history: `date -> [confirmed, deaths, recovered]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    entries: BTreeMap<NaiveDate, [u64; 3]>,
}

impl Series {
    /// Build from rows that are already cumulative. Several rows on the same
    /// date keep the last one; future-dated rows are dropped.
    pub fn from_cumulative<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        Self::from_cumulative_as_of(rows, today_sao_paulo())
    }

    pub fn from_cumulative_as_of<I>(rows: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        let mut entries = BTreeMap::new();
        for (date, counts) in rows {
            if date <= today {
                entries.insert(date, counts);
            }
        }
        Self { entries }
    }

    /// Build from cumulative rows where several regions may share a date:
    /// same-date rows are summed, with no accumulation across dates.
    pub fn from_summed_cumulative<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        Self::from_summed_cumulative_as_of(rows, today_sao_paulo())
    }

    pub fn from_summed_cumulative_as_of<I>(rows: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        let mut entries: BTreeMap<NaiveDate, [u64; 3]> = BTreeMap::new();
        for (date, counts) in rows {
            if date > today {
                continue;
            }
            let slot = entries.entry(date).or_default();
            for (acc, v) in slot.iter_mut().zip(counts) {
                *acc += v;
            }
        }
        Self { entries }
    }

    /// Build from per-date deltas: deltas on the same date are summed, then
    /// accumulated in date order, so daily increments `[10, 5, 20]` become
    /// cumulatives `[10, 15, 35]`.
    pub fn from_daily_deltas<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        Self::from_daily_deltas_as_of(rows, today_sao_paulo())
    }

    pub fn from_daily_deltas_as_of<I>(rows: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = (NaiveDate, [u64; 3])>,
    {
        let mut per_day: BTreeMap<NaiveDate, [u64; 3]> = BTreeMap::new();
        for (date, counts) in rows {
            if date > today {
                continue;
            }
            let slot = per_day.entry(date).or_default();
            for (acc, v) in slot.iter_mut().zip(counts) {
                *acc += v;
            }
        }
        let mut running = [0u64; 3];
        let entries = per_day
            .into_iter()
            .map(|(date, day)| {
                for (acc, v) in running.iter_mut().zip(day) {
                    *acc += v;
                }
                (date, running)
            })
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, date: NaiveDate) -> Option<[u64; 3]> {
        self.entries.get(&date).copied()
    }

    /// Most recent entry, if any.
    pub fn last(&self) -> Option<(NaiveDate, [u64; 3])> {
        self.entries.iter().next_back().map(|(d, c)| (*d, *c))
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, [u64; 3])> + '_ {
        self.entries.iter().map(|(d, c)| (*d, *c))
    }
}
