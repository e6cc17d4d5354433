//! Sweep configuration, loaded from JSON. Every field has a default.

use crate::error::{Result, SweepError};
use crate::recovery::RecoveryConfig;
use plotwalk_scanner::auth::AuthProfile;
use plotwalk_scanner::extract::PriceRange;
use plotwalk_scanner::filters::default_filter_fields;
use plotwalk_scanner::{CapabilityTable, FilterRules, HarvesterConfig, SiteProfile, WalkerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    /// Two-letter code as it appears in listing addresses.
    pub code: String,
    /// Display name, used for ordering.
    pub name: String,
    #[serde(default)]
    pub localities: Vec<String>,
}

impl Region {
    /// Localities in alphabetical order.
    pub fn ordered_localities(&self) -> Vec<String> {
        let mut localities = self.localities.clone();
        localities.sort_by_key(|l| l.to_lowercase());
        localities.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        localities
    }
}

/// A named preset of numeric parameters rotated across global passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCycle {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Fixed identifier of the checkpoint row.
    pub run_key: String,
    pub source_tag: String,
    pub regions: Vec<Region>,
    pub blocked_regions: Vec<String>,
    pub start_url: String,
    /// `{locality}` and `{region}` are substituted. Used when the search box is unavailable.
    pub search_url_template: String,
    pub price_floor: Option<i64>,
    pub price_ceiling: Option<i64>,
    pub filter_rules: FilterRules,
    pub filter_cycles: Vec<FilterCycle>,
    /// Locators for the site's filter panel.
    pub filter_fields: CapabilityTable,
    pub harvester: HarvesterConfig,
    pub walker: WalkerConfig,
    pub recovery: RecoveryConfig,
    pub site: SiteProfile,
    pub login: AuthProfile,
    /// Open each card's detail view when inline agent info is missing.
    pub open_details: bool,
    /// Stop after this many global passes. Unset runs until the quota or an abort.
    pub max_passes: Option<u32>,
    /// Pause once this many records have been ingested. Unset disables the quota.
    pub quota_threshold: Option<u64>,
    pub webdriver_url: String,
    pub headless: bool,
    pub username_env: String,
    pub password_env: String,
    pub verification_code_env: String,
    /// Initial wait after navigation, in ms.
    pub initial_wait_ms: u64,
    /// Network-quiet wait after a search, in ms.
    pub network_wait_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            run_key: "default".to_string(),
            source_tag: "map-search".to_string(),
            regions: Vec::new(),
            blocked_regions: Vec::new(),
            start_url: String::new(),
            search_url_template: String::new(),
            price_floor: None,
            price_ceiling: None,
            filter_rules: FilterRules::default(),
            filter_cycles: Vec::new(),
            filter_fields: default_filter_fields(),
            harvester: HarvesterConfig::default(),
            walker: WalkerConfig::default(),
            recovery: RecoveryConfig::default(),
            site: SiteProfile::default(),
            login: AuthProfile::default(),
            open_details: true,
            max_passes: None,
            quota_threshold: None,
            webdriver_url: "http://localhost:9515".to_string(),
            headless: true,
            username_env: "PLOTWALK_USERNAME".to_string(),
            password_env: "PLOTWALK_PASSWORD".to_string(),
            verification_code_env: "PLOTWALK_VERIFICATION_CODE".to_string(),
            initial_wait_ms: 2000,
            network_wait_ms: 2000,
        }
    }
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config: SweepConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_key.trim().is_empty() {
            return Err(SweepError::Config("run_key must not be empty".to_string()));
        }
        if let (Some(floor), Some(ceiling)) = (self.price_floor, self.price_ceiling)
            && floor > ceiling
        {
            return Err(SweepError::Config(format!(
                "price_floor {floor} is above price_ceiling {ceiling}"
            )));
        }
        if self.start_url.is_empty() && self.search_url_template.is_empty() {
            return Err(SweepError::Config(
                "one of start_url or search_url_template is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Regions sorted by display name, blocked codes removed.
    pub fn ordered_regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .regions
            .iter()
            .filter(|r| {
                !self
                    .blocked_regions
                    .iter()
                    .any(|b| b.eq_ignore_ascii_case(&r.code))
            })
            .cloned()
            .collect();
        regions.sort_by_key(|r| r.name.to_lowercase());
        regions
    }

    pub fn price_range(&self) -> PriceRange {
        PriceRange {
            floor: self.price_floor,
            ceiling: self.price_ceiling,
        }
    }

    /// Filter rules with the active cycle's overrides applied.
    pub fn rules_for_cycle(&self, cycle_index: usize) -> FilterRules {
        match self.filter_cycles.get(cycle_index) {
            Some(cycle) => self.filter_rules.with_overrides(&cycle.params),
            None => self.filter_rules.clone(),
        }
    }

    pub fn cycle_name(&self, cycle_index: usize) -> Option<&str> {
        self.filter_cycles
            .get(cycle_index)
            .map(|c| c.name.as_str())
    }

    /// Number of presets in rotation. An empty list behaves as one implicit preset.
    pub fn cycle_count(&self) -> usize {
        self.filter_cycles.len().max(1)
    }

    pub fn search_url(&self, locality: &str, region: &Region) -> Option<String> {
        if self.search_url_template.is_empty() {
            return None;
        }
        Some(
            self.search_url_template
                .replace("{locality}", &encode_component(locality))
                .replace("{region}", &encode_component(&region.code)),
        )
    }
}

fn encode_component(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("-")
}

/// Expands `~` and environment variables in a user-supplied path.
pub fn expand_path(raw: &str) -> Result<PathBuf> {
    shellexpand::full(raw)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| SweepError::Config(format!("cannot expand {raw}: {e}")))
}
