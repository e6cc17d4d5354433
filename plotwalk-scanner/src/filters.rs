use crate::browser::{BrowserPage, settle};
use crate::capability::{Action, CapabilityTable, Locator, resolve};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub const OPEN_FILTERS: &str = "open_filters";
pub const PRICE_MIN: &str = "price_min";
pub const PRICE_MAX: &str = "price_max";
pub const MIN_BEDS: &str = "min_beds";
pub const MIN_SQFT: &str = "min_sqft";
pub const NO_HOA: &str = "no_hoa";
pub const LISTED_WITHIN: &str = "listed_within";
pub const APPLY_FILTERS: &str = "apply_filters";

/// The fixed rule set applied before each locality search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub price_floor: Option<i64>,
    pub price_ceiling: Option<i64>,
    pub min_beds: Option<u32>,
    pub min_sqft: Option<u32>,
    pub no_hoa: bool,
    pub property_types: Vec<String>,
    /// Only listings posted within this many days.
    pub listed_within_days: Option<u32>,
}

impl FilterRules {
    /// Applies numeric overrides from a filter-cycle preset. Unknown keys are ignored.
    pub fn with_overrides(&self, params: &BTreeMap<String, f64>) -> Self {
        let mut rules = self.clone();
        for (key, value) in params {
            match key.as_str() {
                "price_floor" => rules.price_floor = Some(*value as i64),
                "price_ceiling" => rules.price_ceiling = Some(*value as i64),
                "min_beds" => rules.min_beds = Some(*value as u32),
                "min_sqft" => rules.min_sqft = Some(*value as u32),
                "listed_within_days" => rules.listed_within_days = Some(*value as u32),
                _ => {}
            }
        }
        rules
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub applied: Vec<String>,
    pub failures: Vec<String>,
}

impl FilterReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Applies [`FilterRules`] to the current page.
#[async_trait]
pub trait FilterApplier: Send + Sync {
    async fn apply(&self, page: &dyn BrowserPage, rules: &FilterRules) -> Result<FilterReport>;
}

/// Drives whatever filter controls the capability table finds.
pub struct TableFilterApplier {
    fields: CapabilityTable,
    settle_ms: u64,
}

impl TableFilterApplier {
    pub fn new(fields: CapabilityTable, settle_ms: u64) -> Self {
        Self { fields, settle_ms }
    }

    async fn step(
        &self,
        page: &dyn BrowserPage,
        report: &mut FilterReport,
        name: &str,
        candidates: &[Locator],
        action: Action,
    ) -> Result<()> {
        match resolve(page, candidates, &action).await? {
            Some(_) => report.applied.push(name.to_string()),
            None => {
                debug!(field = name, "No filter control matched");
                report.failures.push(name.to_string());
            }
        }
        Ok(())
    }
}

impl Default for TableFilterApplier {
    fn default() -> Self {
        Self::new(default_filter_fields(), 800)
    }
}

pub fn default_filter_fields() -> CapabilityTable {
    CapabilityTable::new()
        .field(
            OPEN_FILTERS,
            vec![
                Locator::aria("filters"),
                Locator::text("button", "filters"),
                Locator::text("button", "more"),
            ],
        )
        .field(
            PRICE_MIN,
            vec![
                Locator::css("input[name='price-min']"),
                Locator::placeholder("min price"),
                Locator::label("minimum price"),
                Locator::aria("minimum price"),
            ],
        )
        .field(
            PRICE_MAX,
            vec![
                Locator::css("input[name='price-max']"),
                Locator::placeholder("max price"),
                Locator::label("maximum price"),
                Locator::aria("maximum price"),
            ],
        )
        .field(
            MIN_BEDS,
            vec![
                Locator::css("select[name='beds-min']"),
                Locator::label("bedrooms"),
                Locator::aria("minimum bedrooms"),
            ],
        )
        .field(
            MIN_SQFT,
            vec![
                Locator::css("select[name='sqft-min']"),
                Locator::label("square feet"),
                Locator::aria("minimum square feet"),
            ],
        )
        .field(
            NO_HOA,
            vec![
                Locator::css("input[name='no-hoa']"),
                Locator::label("no hoa"),
                Locator::aria("no hoa"),
            ],
        )
        .field(
            LISTED_WITHIN,
            vec![
                Locator::css("select[name='days-on-market']"),
                Locator::label("days on"),
                Locator::label("listed"),
            ],
        )
        .field(
            APPLY_FILTERS,
            vec![
                Locator::text("button", "apply"),
                Locator::text("button", "see"),
                Locator::aria("apply filters"),
            ],
        )
}

fn property_type_candidates(kind: &str) -> Vec<Locator> {
    vec![
        Locator::label(kind),
        Locator::aria(kind),
        Locator::text("button", kind),
    ]
}

#[async_trait]
impl FilterApplier for TableFilterApplier {
    async fn apply(&self, page: &dyn BrowserPage, rules: &FilterRules) -> Result<FilterReport> {
        let mut report = FilterReport::default();

        // Panels that are already open or inline need no toggle.
        if self
            .fields
            .resolve(page, OPEN_FILTERS, &Action::Click)
            .await?
            .is_some()
        {
            settle(self.settle_ms).await;
        }

        if let Some(floor) = rules.price_floor {
            let candidates = self.fields.candidates(PRICE_MIN);
            self.step(page, &mut report, PRICE_MIN, candidates, Action::Fill(floor.to_string()))
                .await?;
        }
        if let Some(ceiling) = rules.price_ceiling {
            let candidates = self.fields.candidates(PRICE_MAX);
            self.step(page, &mut report, PRICE_MAX, candidates, Action::Fill(ceiling.to_string()))
                .await?;
        }
        if let Some(beds) = rules.min_beds {
            let candidates = self.fields.candidates(MIN_BEDS);
            self.step(page, &mut report, MIN_BEDS, candidates, Action::Select(format!("{beds}+")))
                .await?;
        }
        if let Some(sqft) = rules.min_sqft {
            let candidates = self.fields.candidates(MIN_SQFT);
            self.step(page, &mut report, MIN_SQFT, candidates, Action::Select(sqft.to_string()))
                .await?;
        }
        if rules.no_hoa {
            let candidates = self.fields.candidates(NO_HOA);
            self.step(page, &mut report, NO_HOA, candidates, Action::Check(true))
                .await?;
        }
        for kind in &rules.property_types {
            let candidates = property_type_candidates(kind);
            self.step(page, &mut report, kind, &candidates, Action::Check(true))
                .await?;
        }
        if let Some(days) = rules.listed_within_days {
            let candidates = self.fields.candidates(LISTED_WITHIN);
            self.step(page, &mut report, LISTED_WITHIN, candidates, Action::Select(days.to_string()))
                .await?;
        }

        if self
            .fields
            .resolve(page, APPLY_FILTERS, &Action::Click)
            .await?
            .is_none()
        {
            debug!("No apply control, assuming filters apply live");
        }
        settle(self.settle_ms).await;

        if !report.succeeded() {
            warn!(
                failures = report.failure_count(),
                missing = ?report.failures,
                "Some filters could not be applied"
            );
        }
        Ok(report)
    }
}
