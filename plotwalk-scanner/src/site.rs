use crate::browser::Point;
use crate::error::Result;
use crate::extract::{RawListingCard, normalize_whitespace};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static CLUSTER_COUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?P<n>\d+(?:\.\d+)?)\s*(?P<k>k)?\+?").expect("cluster count regex")
});

/// A count-per-area marker on the map overview. Recomputed on every poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterDescriptor {
    pub fingerprint: String,
    pub label: String,
    pub centroid: Point,
    pub count: u32,
}

impl ClusterDescriptor {
    pub fn new(label: &str, centroid: Point) -> Self {
        let label = normalize_whitespace(label);
        Self {
            fingerprint: format!(
                "{}@{}x{}",
                label,
                centroid.x.round() as i64,
                centroid.y.round() as i64
            ),
            count: parse_cluster_count(&label).unwrap_or(0),
            label,
            centroid,
        }
    }
}

/// `"12"`, `"12 homes"`, `"1.2k"`.
pub fn parse_cluster_count(label: &str) -> Option<u32> {
    let caps = CLUSTER_COUNT_RE.captures(label)?;
    let n: f64 = caps["n"].parse().ok()?;
    let n = if caps.name("k").is_some() { n * 1000.0 } else { n };
    Some(n.round() as u32)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrollMetrics {
    pub offset: f64,
    pub extent: f64,
    pub viewport: f64,
}

impl ScrollMetrics {
    pub fn at_end(&self) -> bool {
        self.offset + self.viewport >= self.extent - 1.0
    }
}

/// The clustered overview the walker operates on.
#[async_trait]
pub trait MapView: Send + Sync {
    /// Whether the concrete item list has replaced the clustered overview.
    async fn list_present(&self) -> Result<bool>;

    async fn clusters(&self) -> Result<Vec<ClusterDescriptor>>;

    async fn zoom_level(&self) -> Result<Option<f64>>;

    async fn can_zoom_in(&self) -> Result<bool>;

    async fn zoom_in(&self) -> Result<()>;

    async fn zoom_to(&self, level: f64) -> Result<()>;

    async fn pointer_move(&self, at: Point) -> Result<()>;

    async fn click(&self, at: Point) -> Result<()>;

    /// Click on an empty area of the map to dismiss popups and selections.
    async fn neutral_click(&self) -> Result<()>;
}

/// A lazily-rendered scroll container of listing rows.
#[async_trait]
pub trait VirtualList: Send + Sync {
    async fn mounted_rows(&self) -> Result<Vec<RawListingCard>>;

    async fn scroll_metrics(&self) -> Result<ScrollMetrics>;

    async fn scroll_to(&self, offset: f64) -> Result<()>;

    /// Scrolls the outer document a little to trigger intersection observers.
    async fn nudge_page(&self, delta: f64) -> Result<()>;

    /// The separately reported (approximate) result count, if shown.
    async fn reported_count(&self) -> Result<Option<usize>>;
}

/// Everything the orchestrator needs from the target site on the current page.
#[async_trait]
pub trait SiteDriver: MapView + VirtualList {
    /// Backend reported no map imagery (broken tiles).
    async fn map_imagery_missing(&self) -> Result<bool>;

    /// Types `query` into the site's search box. `Ok(false)` when no search box was found.
    async fn search_by_input(&self, query: &str) -> Result<bool>;

    async fn navigate(&self, url: &str) -> Result<()>;

    /// The location the results header currently claims to show.
    async fn displayed_location(&self) -> Result<Option<String>>;

    /// Reload bypassing client caches.
    async fn hard_reload(&self) -> Result<()>;

    /// Opens the card's detail view, returns its text and closes it again.
    async fn detail_text(&self, card: &RawListingCard) -> Result<Option<String>>;

    /// Contact links (tel:/mailto:) found anywhere near the card.
    async fn contact_text(&self, card: &RawListingCard) -> Result<Option<String>>;
}
