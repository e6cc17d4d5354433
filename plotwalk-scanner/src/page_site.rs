//! [`SiteDriver`] backed by a live browser page.
//!
//! Every method resolves the active page through the [`PageHandle`] at call
//! time, so a page swapped in by recovery is picked up immediately.

use crate::browser::{BrowserPage, PageHandle, Point, settle};
use crate::capability::{Action, CapabilityTable, FIND_JS, Locator};
use crate::error::{Result, ScanError};
use crate::extract::{RawListingCard, normalize_whitespace};
use crate::site::{ClusterDescriptor, MapView, ScrollMetrics, SiteDriver, VirtualList};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const SEARCH_INPUT: &str = "search_input";
pub const SEARCH_SUBMIT: &str = "search_submit";
pub const RESULTS_HEADER: &str = "results_header";
pub const RESULT_COUNT: &str = "result_count";
pub const MAP_ERROR: &str = "map_error";
pub const ZOOM_IN: &str = "zoom_in";
pub const LIST_CONTAINER: &str = "list_container";
pub const MAP_CONTAINER: &str = "map_container";
pub const DETAIL_CLOSE: &str = "detail_close";

/// CSS selectors evaluated relative to one list row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowSelectors {
    pub row: String,
    pub address: String,
    pub price: String,
    pub stats: String,
    pub agent_name: String,
    pub agent_phone: String,
    pub brokerage: String,
    pub detail_link: String,
}

impl Default for RowSelectors {
    fn default() -> Self {
        Self {
            row: "[data-test='property-card'], article.property-card, li.result-item".into(),
            address: "address, [data-test='property-card-addr'], .property-address".into(),
            price: "[data-test='property-card-price'], .price".into(),
            stats: "ul li, .stats span, .property-meta span".into(),
            agent_name: ".agent-name, [data-test='agent-name']".into(),
            agent_phone: ".agent-phone, [data-test='agent-phone']".into(),
            brokerage: ".brokerage, .listing-office, [data-test='brokerage']".into(),
            detail_link: "a[href*='/property/'], a[href*='/homedetails/'], a.property-link".into(),
        }
    }
}

/// How to find things on the target site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteProfile {
    pub fields: CapabilityTable,
    pub rows: RowSelectors,
    pub cluster_css: String,
    pub detail_panel_css: Vec<String>,
    /// Query parameter carrying the map zoom level.
    pub zoom_param: String,
    pub max_zoom: Option<f64>,
    pub detail_wait_ms: u64,
    pub settle_ms: u64,
}

impl Default for SiteProfile {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            rows: RowSelectors::default(),
            cluster_css: ".cluster-marker, [data-test='map-cluster'], .marker-cluster".into(),
            detail_panel_css: vec![
                "[data-test='detail-panel']".into(),
                ".listing-detail".into(),
                "[role='dialog']".into(),
            ],
            zoom_param: "zoom".into(),
            max_zoom: Some(18.0),
            detail_wait_ms: 4000,
            settle_ms: 800,
        }
    }
}

pub fn default_fields() -> CapabilityTable {
    CapabilityTable::new()
        .field(
            SEARCH_INPUT,
            vec![
                Locator::css("input[type='search']"),
                Locator::css("input#search-box-input"),
                Locator::placeholder("city"),
                Locator::aria("search"),
            ],
        )
        .field(
            SEARCH_SUBMIT,
            vec![
                Locator::css("button[type='submit']"),
                Locator::aria("submit search"),
                Locator::text("button", "search"),
            ],
        )
        .field(
            RESULTS_HEADER,
            vec![
                Locator::css("h1.search-title"),
                Locator::css("[data-test='search-header'] h1"),
                Locator::css("h1"),
            ],
        )
        .field(
            RESULT_COUNT,
            vec![
                Locator::css(".result-count"),
                Locator::css("[data-test='result-count']"),
                Locator::text("span", "results"),
                Locator::text("span", "homes"),
            ],
        )
        .field(
            MAP_ERROR,
            vec![
                Locator::css(".gm-err-container"),
                Locator::css("[data-test='map-error']"),
                Locator::text("div", "map data unavailable"),
            ],
        )
        .field(
            ZOOM_IN,
            vec![
                Locator::aria("zoom in"),
                Locator::css("button.zoom-in"),
                Locator::css(".leaflet-control-zoom-in"),
            ],
        )
        .field(
            LIST_CONTAINER,
            vec![
                Locator::css("[data-test='search-results'] ul"),
                Locator::css("#search-page-list-container"),
                Locator::css(".results-list"),
            ],
        )
        .field(
            MAP_CONTAINER,
            vec![
                Locator::css("[data-test='map']"),
                Locator::css("#map"),
                Locator::css(".map-container"),
            ],
        )
        .field(
            DETAIL_CLOSE,
            vec![
                Locator::aria("close"),
                Locator::css("button.close"),
                Locator::text("button", "back to search"),
            ],
        )
}

const ROWS_JS: &str = r#"
const sel = arguments[1];
let container = null;
for (const loc of arguments[0]) { container = __pwFind(loc); if (container) break; }
if (!container) return [];
const text = (root, s) => {
  if (!s) return null;
  const el = root.querySelector(s);
  if (!el) return null;
  const t = (el.innerText || el.textContent || '').trim();
  return t.length ? t : null;
};
const out = [];
for (const r of container.querySelectorAll(sel.row)) {
  const addr = text(r, sel.address);
  if (!addr) continue;
  const tel = r.querySelector('a[href^="tel:"]');
  const mail = r.querySelector('a[href^="mailto:"]');
  const link = sel.detail_link ? r.querySelector(sel.detail_link) : null;
  out.push({
    address_lines: addr.split(/\n+/).map((s) => s.trim()).filter(Boolean),
    price_text: text(r, sel.price),
    stats: Array.from(r.querySelectorAll(sel.stats))
      .map((e) => (e.innerText || '').trim())
      .filter(Boolean),
    agent: {
      name: text(r, sel.agent_name),
      phone: tel ? tel.getAttribute('href').slice(4) : text(r, sel.agent_phone),
      email: mail ? mail.getAttribute('href').slice(7) : null,
      brokerage: text(r, sel.brokerage),
    },
    detail_ref: link ? link.href : null,
  });
}
return out;
"#;

const CONTAINER_JS: &str = r#"
let container = null;
for (const loc of arguments[0]) { container = __pwFind(loc); if (container) break; }
if (!container) return null;
switch (arguments[1]) {
  case 'metrics':
    return { offset: container.scrollTop, extent: container.scrollHeight, viewport: container.clientHeight };
  case 'scroll':
    container.scrollTop = arguments[2];
    container.dispatchEvent(new Event('scroll', { bubbles: true }));
    return true;
  case 'present':
    return container.querySelector(arguments[2]) !== null;
  case 'rect': {
    const r = container.getBoundingClientRect();
    return { x: r.left, y: r.top, width: r.width, height: r.height };
  }
}
return null;
"#;

const CLUSTERS_JS: &str = r#"
const out = [];
const vw = window.innerWidth, vh = window.innerHeight;
for (const el of document.querySelectorAll(arguments[0])) {
  const r = el.getBoundingClientRect();
  if (r.width <= 0 || r.height <= 0) continue;
  const x = r.left + r.width / 2, y = r.top + r.height / 2;
  if (x < 0 || y < 0 || x > vw || y > vh) continue;
  out.push({ label: (el.innerText || el.textContent || '').trim(), x, y });
}
return out;
"#;

const ROW_FOR_CARD_JS: &str = r#"
const sel = arguments[0];
const target = arguments[1];
const norm = (s) => (s || '').replace(/\s+/g, ' ').trim().toLowerCase();
for (const r of document.querySelectorAll(sel.row)) {
  const link = sel.detail_link ? r.querySelector(sel.detail_link) : null;
  if (target.detail_ref) {
    if (!link || link.href !== target.detail_ref) continue;
  } else {
    const a = r.querySelector(sel.address);
    const lines = a ? (a.innerText || a.textContent || '').split(/\n+/).map(norm).filter(Boolean) : [];
    if (lines[0] !== target.street) continue;
  }
  if (arguments[2] === 'contacts') {
    const hrefs = Array.from(r.querySelectorAll('a[href^="tel:"], a[href^="mailto:"]'))
      .map((x) => x.getAttribute('href'));
    return hrefs.length ? hrefs.join(' ') : null;
  }
  (link || r).click();
  return true;
}
return null;
"#;

const PANEL_TEXT_JS: &str = r#"
for (const s of arguments[0]) {
  const el = document.querySelector(s);
  if (el) return (el.innerText || el.textContent || '').trim();
}
return null;
"#;

#[derive(Deserialize)]
struct RawCluster {
    label: String,
    x: f64,
    y: f64,
}

#[derive(Deserialize)]
struct Rect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

pub struct PageSite {
    page: PageHandle,
    profile: Arc<SiteProfile>,
}

impl PageSite {
    pub fn new(page: PageHandle, profile: SiteProfile) -> Self {
        Self {
            page,
            profile: Arc::new(profile),
        }
    }

    fn current(&self) -> Arc<dyn BrowserPage> {
        self.page.current()
    }

    fn locators(&self, field: &str) -> Result<Value> {
        Ok(serde_json::to_value(self.profile.fields.candidates(field))?)
    }

    async fn container(&self, field: &str, verb: &str, arg: Value) -> Result<Value> {
        let script = format!("{FIND_JS}\n{CONTAINER_JS}");
        self.current()
            .evaluate(&script, vec![self.locators(field)?, json!(verb), arg])
            .await
    }

    async fn map_center(&self) -> Result<Point> {
        let rect = self.container(MAP_CONTAINER, "rect", Value::Null).await?;
        if rect.is_null() {
            return Err(ScanError::ElementNotFound(MAP_CONTAINER.to_string()));
        }
        let rect: Rect = serde_json::from_value(rect)?;
        Ok(Point::new(rect.x + rect.width / 2.0, rect.y + rect.height / 2.0))
    }

    async fn current_url(&self) -> Result<Url> {
        let raw = self.current().current_url().await?;
        Url::parse(&raw).map_err(|e| ScanError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Closes whatever a row click opened. History is only walked back when
    /// the click navigated away from `list_url`.
    async fn leave_detail(&self, page: &dyn BrowserPage, list_url: &str) -> Result<()> {
        let closed = self
            .profile
            .fields
            .resolve(page, DETAIL_CLOSE, &Action::Click)
            .await?;
        if closed.is_none() && page.current_url().await? != list_url {
            page.evaluate("history.back(); return true;", vec![]).await?;
        }
        settle(self.profile.settle_ms).await;
        Ok(())
    }

    fn with_param(url: &Url, key: &str, value: &str) -> Url {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut next = url.clone();
        next.query_pairs_mut()
            .clear()
            .extend_pairs(pairs)
            .append_pair(key, value);
        next
    }
}

#[async_trait]
impl MapView for PageSite {
    async fn list_present(&self) -> Result<bool> {
        let present = self
            .container(LIST_CONTAINER, "present", json!(self.profile.rows.row))
            .await?;
        Ok(present.as_bool().unwrap_or(false))
    }

    async fn clusters(&self) -> Result<Vec<ClusterDescriptor>> {
        let raw = self
            .current()
            .evaluate(CLUSTERS_JS, vec![json!(self.profile.cluster_css)])
            .await?;
        let raw: Vec<RawCluster> = serde_json::from_value(raw)?;
        Ok(raw
            .into_iter()
            .filter(|c| !c.label.is_empty())
            .map(|c| ClusterDescriptor::new(&c.label, Point::new(c.x, c.y)))
            .collect())
    }

    async fn zoom_level(&self) -> Result<Option<f64>> {
        let url = self.current_url().await?;
        Ok(url
            .query_pairs()
            .find(|(k, _)| k == self.profile.zoom_param.as_str())
            .and_then(|(_, v)| v.parse().ok()))
    }

    async fn can_zoom_in(&self) -> Result<bool> {
        if let (Some(level), Some(max)) = (self.zoom_level().await?, self.profile.max_zoom) {
            return Ok(level < max);
        }
        let page = self.current();
        Ok(self
            .profile
            .fields
            .resolve(page.as_ref(), ZOOM_IN, &Action::Probe)
            .await?
            .is_some())
    }

    async fn zoom_in(&self) -> Result<()> {
        let page = self.current();
        if self
            .profile
            .fields
            .resolve(page.as_ref(), ZOOM_IN, &Action::Click)
            .await?
            .is_some()
        {
            return Ok(());
        }
        debug!("No zoom control found, zooming with the wheel");
        let center = self.map_center().await?;
        page.scroll_wheel(center, -240.0).await
    }

    async fn zoom_to(&self, level: f64) -> Result<()> {
        let url = self.current_url().await?;
        let next = Self::with_param(&url, &self.profile.zoom_param, &format!("{level}"));
        self.current().navigate(next.as_str()).await
    }

    async fn pointer_move(&self, at: Point) -> Result<()> {
        self.current().pointer_move(at).await
    }

    async fn click(&self, at: Point) -> Result<()> {
        self.current().click_at(at).await
    }

    async fn neutral_click(&self) -> Result<()> {
        let rect = self.container(MAP_CONTAINER, "rect", Value::Null).await?;
        if rect.is_null() {
            return Err(ScanError::ElementNotFound(MAP_CONTAINER.to_string()));
        }
        let rect: Rect = serde_json::from_value(rect)?;
        self.current()
            .click_at(Point::new(rect.x + 24.0, rect.y + rect.height - 24.0))
            .await
    }
}

#[async_trait]
impl VirtualList for PageSite {
    async fn mounted_rows(&self) -> Result<Vec<RawListingCard>> {
        let script = format!("{FIND_JS}\n{ROWS_JS}");
        let rows = self
            .current()
            .evaluate(
                &script,
                vec![
                    self.locators(LIST_CONTAINER)?,
                    serde_json::to_value(&self.profile.rows)?,
                ],
            )
            .await?;
        Ok(serde_json::from_value(rows)?)
    }

    async fn scroll_metrics(&self) -> Result<ScrollMetrics> {
        let metrics = self.container(LIST_CONTAINER, "metrics", Value::Null).await?;
        if metrics.is_null() {
            return Err(ScanError::ElementNotFound(LIST_CONTAINER.to_string()));
        }
        Ok(serde_json::from_value(metrics)?)
    }

    async fn scroll_to(&self, offset: f64) -> Result<()> {
        self.container(LIST_CONTAINER, "scroll", json!(offset))
            .await?;
        Ok(())
    }

    async fn nudge_page(&self, delta: f64) -> Result<()> {
        self.current()
            .evaluate(
                "window.scrollBy(0, arguments[0]);\
                 setTimeout(() => window.scrollBy(0, -arguments[0]), 50);\
                 return true;",
                vec![json!(delta)],
            )
            .await?;
        Ok(())
    }

    async fn reported_count(&self) -> Result<Option<usize>> {
        let page = self.current();
        let text = self
            .profile
            .fields
            .resolve(page.as_ref(), RESULT_COUNT, &Action::ReadText)
            .await?;
        Ok(text
            .and_then(|r| r.value.as_str().map(str::to_string))
            .and_then(|t| parse_result_count(&t)))
    }
}

/// `"1,234 homes"` → 1234.
pub fn parse_result_count(text: &str) -> Option<usize> {
    let digits: String = text
        .split_whitespace()
        .find(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()))?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[async_trait]
impl SiteDriver for PageSite {
    async fn map_imagery_missing(&self) -> Result<bool> {
        let page = self.current();
        Ok(self
            .profile
            .fields
            .resolve(page.as_ref(), MAP_ERROR, &Action::Probe)
            .await?
            .is_some())
    }

    async fn search_by_input(&self, query: &str) -> Result<bool> {
        let page = self.current();
        let Some(found) = self
            .profile
            .fields
            .resolve(page.as_ref(), SEARCH_INPUT, &Action::Probe)
            .await?
        else {
            return Ok(false);
        };

        if let Locator::Css(css) = &found.locator {
            page.type_into(css, query, true).await?;
        } else {
            self.profile
                .fields
                .resolve(page.as_ref(), SEARCH_INPUT, &Action::Fill(query.to_string()))
                .await?;
            let submitted = self
                .profile
                .fields
                .resolve(page.as_ref(), SEARCH_SUBMIT, &Action::Click)
                .await?;
            if submitted.is_none() {
                return Ok(false);
            }
        }
        settle(self.profile.settle_ms).await;
        Ok(true)
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        self.current().navigate(url).await
    }

    async fn displayed_location(&self) -> Result<Option<String>> {
        let page = self.current();
        Ok(self
            .profile
            .fields
            .resolve(page.as_ref(), RESULTS_HEADER, &Action::ReadText)
            .await?
            .and_then(|r| r.value.as_str().map(str::to_string)))
    }

    async fn hard_reload(&self) -> Result<()> {
        let url = self.current_url().await?;
        let busted = Self::with_param(
            &url,
            "_pw",
            &chrono::Utc::now().timestamp_millis().to_string(),
        );
        self.current().navigate(busted.as_str()).await
    }

    async fn detail_text(&self, card: &RawListingCard) -> Result<Option<String>> {
        let Some(target) = row_target(card) else {
            return Ok(None);
        };
        let page = self.current();
        let list_url = page.current_url().await?;
        let rows = serde_json::to_value(&self.profile.rows)?;
        let opened = page
            .evaluate(ROW_FOR_CARD_JS, vec![rows, target, json!("open")])
            .await?;
        if opened.is_null() {
            return Ok(None);
        }

        let panels = self.profile.detail_panel_css.clone();
        let wait = Duration::from_millis(self.profile.detail_wait_ms);
        if page.wait_for_any(&panels, wait).await?.is_none() {
            debug!(card = %card.key(), "Detail panel never appeared");
            self.leave_detail(page.as_ref(), &list_url).await?;
            return Ok(None);
        }
        let text = page.evaluate(PANEL_TEXT_JS, vec![json!(panels)]).await?;
        self.leave_detail(page.as_ref(), &list_url).await?;

        Ok(text.as_str().map(str::to_string))
    }

    async fn contact_text(&self, card: &RawListingCard) -> Result<Option<String>> {
        let Some(target) = row_target(card) else {
            return Ok(None);
        };
        let rows = serde_json::to_value(&self.profile.rows)?;
        let hrefs = self
            .current()
            .evaluate(ROW_FOR_CARD_JS, vec![rows, target, json!("contacts")])
            .await?;
        Ok(hrefs.as_str().map(str::to_string))
    }
}

/// Identifies the card's row: by its detail link when it has one, otherwise
/// by the exact first address line.
fn row_target(card: &RawListingCard) -> Option<Value> {
    let street = card.address_lines.first()?;
    Some(json!({
        "detail_ref": card.detail_ref,
        "street": normalize_whitespace(street).to_lowercase(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::RecordingPage;

    fn site_with(page: Arc<RecordingPage>) -> PageSite {
        PageSite::new(PageHandle::new(page), SiteProfile::default())
    }

    #[test]
    fn test_parse_result_count() {
        assert_eq!(parse_result_count("1,234 homes"), Some(1234));
        assert_eq!(parse_result_count("Showing 48 results"), Some(48));
        assert_eq!(parse_result_count("No results"), None);
    }

    #[test]
    fn test_with_param_replaces_existing() {
        let url = Url::parse("https://listings.test/search?q=albany&zoom=9").unwrap();
        let next = PageSite::with_param(&url, "zoom", "12");
        assert_eq!(next.as_str(), "https://listings.test/search?q=albany&zoom=12");
    }

    #[tokio::test]
    async fn test_mounted_rows_deserialize() {
        let page = Arc::new(RecordingPage::new("p"));
        page.answers.lock().unwrap().push(json!([{
            "address_lines": ["12 Elm St", "Albany, NY 12203"],
            "price_text": "$250,000",
            "stats": ["3 bds", "2 ba"],
            "agent": { "name": "Jane Doe", "phone": null, "email": null, "brokerage": null },
            "detail_ref": "https://listings.test/property/1"
        }]));
        let site = site_with(page);

        let rows = site.mounted_rows().await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].agent.name.as_deref(), Some("Jane Doe"));
        assert_eq!(rows[0].key(), "12 elm st, albany, ny 12203");
    }

    #[tokio::test]
    async fn test_clusters_skip_unlabeled_markers() {
        let page = Arc::new(RecordingPage::new("p"));
        page.answers.lock().unwrap().push(json!([
            { "label": "12", "x": 100.0, "y": 200.0 },
            { "label": "", "x": 5.0, "y": 5.0 }
        ]));
        let site = site_with(page);

        let clusters = site.clusters().await.unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].fingerprint, "12@100x200");
    }

    #[test]
    fn test_row_target_prefers_detail_link() {
        let card = RawListingCard {
            address_lines: vec!["12  Elm St".to_string(), "Albany, NY 12203".to_string()],
            detail_ref: Some("https://listings.test/property/12".to_string()),
            ..Default::default()
        };

        let target = row_target(&card).unwrap();

        assert_eq!(target["detail_ref"], "https://listings.test/property/12");
        assert_eq!(target["street"], "12 elm st");
        assert_eq!(row_target(&RawListingCard::default()), None);
    }

    #[tokio::test]
    async fn test_detail_text_closes_when_panel_never_appears() {
        let page = Arc::new(RecordingPage::new("p"));
        // The row click succeeds; every later script answers "complete".
        page.answers.lock().unwrap().push(json!(true));
        let site = PageSite::new(
            PageHandle::new(page.clone()),
            SiteProfile {
                detail_wait_ms: 10,
                settle_ms: 0,
                ..SiteProfile::default()
            },
        );
        let card = RawListingCard {
            address_lines: vec!["12 Elm St".to_string(), "Albany, NY 12203".to_string()],
            ..Default::default()
        };

        let text = site.detail_text(&card).await.unwrap();

        assert_eq!(text, None);
        let args = page.script_args.lock().unwrap().clone();
        assert_eq!(args[0][1]["street"], "12 elm st");
        assert!(args[0][1]["detail_ref"].is_null());
        // The close control was clicked after the panel wait gave up.
        assert_eq!(args.last().unwrap()[1], json!("click"));
    }

    #[tokio::test]
    async fn test_resolves_page_at_call_time() {
        let first = Arc::new(RecordingPage::new("first"));
        let handle = PageHandle::new(first.clone());
        let site = PageSite::new(handle.clone(), SiteProfile::default());
        let second = Arc::new(RecordingPage::new("second"));
        handle.replace(second.clone());

        site.navigate("https://listings.test/").await.unwrap();

        assert!(first.calls().is_empty());
        assert_eq!(second.calls(), vec!["navigate https://listings.test/".to_string()]);
    }
}
