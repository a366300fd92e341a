// tests/aggregate_order.rs
use async_trait::async_trait;
use chrono::{FixedOffset, TimeZone};
use covid_br_tracker::aggregate::collect_overview;
use covid_br_tracker::{NormalizedReading, Refresh, Region, Series, SourceAdapter};

/// Test-only publisher with a canned reading.
struct StubAdapter {
    name: &'static str,
    reading: NormalizedReading,
}

impl StubAdapter {
    fn with_data(name: &'static str, confirmed: u64) -> Self {
        let ts = FixedOffset::west_opt(3 * 3600)
            .expect("valid offset")
            .with_ymd_and_hms(2020, 4, 5, 12, 0, 0)
            .single()
            .expect("valid timestamp");
        Self {
            name,
            reading: NormalizedReading {
                confirmed,
                deaths: confirmed / 10,
                recovered: 0,
                timestamp: Some(ts),
                source: name.to_string(),
                region: Region::Country,
            },
        }
    }

    fn empty(name: &'static str) -> Self {
        Self {
            name,
            reading: NormalizedReading::empty(name, Region::Country),
        }
    }
}

#[async_trait]
impl SourceAdapter for StubAdapter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn load(&self) -> bool {
        true
    }

    async fn refresh(&mut self) -> Refresh {
        if self.reading.has_data() {
            Refresh::Fresh
        } else {
            Refresh::NoData
        }
    }

    fn reading(&self) -> &NormalizedReading {
        &self.reading
    }

    async fn series(&self) -> Option<Series> {
        None
    }
}

#[tokio::test]
async fn publishers_without_data_are_omitted_and_order_is_kept() {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::with_data("Alpha", 100)),
        Box::new(StubAdapter::empty("Beta")),
        Box::new(StubAdapter::with_data("Gamma", 300)),
    ];

    let out = collect_overview(&mut adapters, &Region::Country).await;

    assert!(out.contains("Alpha"));
    assert!(out.contains("Gamma"));
    assert!(!out.contains("Beta"));

    let alpha = out.find("Alpha").expect("alpha present");
    let gamma = out.find("Gamma").expect("gamma present");
    assert!(alpha < gamma, "configured order must be preserved");

    // Sections are separated by a blank line.
    assert_eq!(out.matches("\n\n").count(), 1);
}

#[tokio::test]
async fn all_empty_collapses_to_a_single_no_data_reply() {
    let mut adapters: Vec<Box<dyn SourceAdapter>> = vec![
        Box::new(StubAdapter::empty("Alpha")),
        Box::new(StubAdapter::empty("Beta")),
    ];

    let out = collect_overview(&mut adapters, &Region::Country).await;
    assert_eq!(out, "No data available for BR.");
}
