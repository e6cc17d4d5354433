//! Cluster resolution walker.
//!
//! Turns a clustered map overview into a concrete item list by clicking
//! clusters (largest first) and zooming in when no unvisited clusters are
//! left. All walk state lives in a per-walk [`WalkState`]; nothing leaks
//! between walks.

use crate::browser::settle;
use crate::error::Result;
use crate::site::{ClusterDescriptor, MapView};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WalkPolicy {
    /// Visit clusters, zoom in when none are left, abort at the zoom limit.
    #[default]
    Zoom,
    /// Never zoom; give up after `max_attempts` clicks or `max_duration_secs`.
    Bounded {
        max_attempts: usize,
        max_duration_secs: u64,
    },
    /// Like `Zoom`, but after a successful harvest dismiss the list and zoom
    /// back to `baseline_zoom` so the next search starts from the same view.
    ResetToBaseline { baseline_zoom: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    pub policy: WalkPolicy,
    /// Upper bound on enumerate/zoom cycles per walk.
    pub iteration_ceiling: usize,
    /// Pause between pointer move and click.
    pub hover_settle_ms: u64,
    /// Wait after a click before re-checking for the item list.
    pub click_settle_ms: u64,
    pub zoom_settle_ms: u64,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            policy: WalkPolicy::Zoom,
            iteration_ceiling: 50,
            hover_settle_ms: 150,
            click_settle_ms: 2000,
            zoom_settle_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkPhase {
    AwaitingList,
    AwaitingClusters,
    VisitingCluster,
    AdjustingZoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Nothing left to click and the map cannot zoom further.
    ZoomFloor,
    IterationCeiling,
    AttemptBudget,
    TimeBudget,
}

/// Fingerprints already clicked during one locality traversal.
#[derive(Debug, Clone, Default)]
pub struct VisitedSet {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl VisitedSet {
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Returns false if the fingerprint was already present.
    pub fn insert(&mut self, fingerprint: &str) -> bool {
        if self.seen.insert(fingerprint.to_string()) {
            self.order.push(fingerprint.to_string());
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn in_click_order(&self) -> &[String] {
        &self.order
    }
}

#[derive(Debug)]
struct WalkState {
    phase: WalkPhase,
    iterations: usize,
    zoom_steps: usize,
    clicks: usize,
    visited: VisitedSet,
    started: Instant,
}

impl WalkState {
    fn new() -> Self {
        Self {
            phase: WalkPhase::AwaitingList,
            iterations: 0,
            zoom_steps: 0,
            clicks: 0,
            visited: VisitedSet::default(),
            started: Instant::now(),
        }
    }

    fn enter(&mut self, phase: WalkPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "Walker phase change");
            self.phase = phase;
        }
    }
}

pub enum WalkOutcome<T> {
    Done(T),
    Aborted(AbortReason),
}

pub struct WalkReport<T> {
    pub outcome: WalkOutcome<T>,
    pub iterations: usize,
    pub zoom_steps: usize,
    pub visited: VisitedSet,
}

/// Invoked once the item list has replaced the clustered overview.
#[async_trait]
pub trait ListReady: Send {
    type Output: Send;

    async fn on_list_ready(&mut self) -> Self::Output;
}

pub struct ClusterWalker {
    config: WalkerConfig,
}

/// Transient UI errors degrade to `fallback`; anything else propagates.
fn soften<T>(result: Result<T>, fallback: T, what: &str) -> Result<T> {
    match result {
        Ok(v) => Ok(v),
        Err(e) if e.is_transient() => {
            debug!("{} failed transiently: {}", what, e);
            Ok(fallback)
        }
        Err(e) => Err(e),
    }
}

impl ClusterWalker {
    pub fn new(config: WalkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WalkerConfig {
        &self.config
    }

    pub async fn walk<V, C>(&self, view: &V, callback: &mut C) -> Result<WalkReport<C::Output>>
    where
        V: MapView + ?Sized,
        C: ListReady,
    {
        let mut state = WalkState::new();

        loop {
            if let Some(reason) = self.budget_exhausted(&state) {
                return Ok(self.abort(state, reason));
            }
            state.iterations += 1;

            state.enter(WalkPhase::AwaitingList);
            if soften(view.list_present().await, false, "list check")? {
                return self.finish(view, callback, state).await;
            }

            state.enter(WalkPhase::AwaitingClusters);
            let mut clusters = soften(view.clusters().await, Vec::new(), "cluster enumeration")?;
            clusters.retain(|c| !state.visited.contains(&c.fingerprint));
            clusters.sort_by(|a, b| {
                b.count
                    .cmp(&a.count)
                    .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            });

            if clusters.is_empty() {
                if matches!(self.config.policy, WalkPolicy::Bounded { .. }) {
                    settle(self.config.click_settle_ms).await;
                    continue;
                }
                if soften(view.can_zoom_in().await, false, "zoom check")? {
                    state.enter(WalkPhase::AdjustingZoom);
                    soften(view.zoom_in().await, (), "zoom in")?;
                    state.zoom_steps += 1;
                    settle(self.config.zoom_settle_ms).await;
                    continue;
                }
                return Ok(self.abort(state, AbortReason::ZoomFloor));
            }

            state.enter(WalkPhase::VisitingCluster);
            for cluster in clusters {
                if let Some(reason) = self.click_budget_exhausted(&state) {
                    return Ok(self.abort(state, reason));
                }
                state.visited.insert(&cluster.fingerprint);
                state.clicks += 1;

                if let Err(e) = self.visit(view, &cluster).await {
                    if e.is_session_dead() {
                        return Err(e);
                    }
                    warn!(fingerprint = %cluster.fingerprint, "Cluster click failed, skipping: {}", e);
                    continue;
                }
                settle(self.config.click_settle_ms).await;

                if soften(view.list_present().await, false, "list check")? {
                    return self.finish(view, callback, state).await;
                }
            }
        }
    }

    fn budget_exhausted(&self, state: &WalkState) -> Option<AbortReason> {
        if state.iterations >= self.config.iteration_ceiling {
            return Some(AbortReason::IterationCeiling);
        }
        self.click_budget_exhausted(state)
    }

    /// Limits of the bounded policy, checked before every click.
    fn click_budget_exhausted(&self, state: &WalkState) -> Option<AbortReason> {
        if let WalkPolicy::Bounded {
            max_attempts,
            max_duration_secs,
        } = self.config.policy
        {
            if state.clicks >= max_attempts {
                return Some(AbortReason::AttemptBudget);
            }
            if state.started.elapsed() >= Duration::from_secs(max_duration_secs) {
                return Some(AbortReason::TimeBudget);
            }
        }
        None
    }

    async fn visit<V: MapView + ?Sized>(&self, view: &V, cluster: &ClusterDescriptor) -> Result<()> {
        debug!(fingerprint = %cluster.fingerprint, count = cluster.count, "Visiting cluster");
        view.pointer_move(cluster.centroid).await?;
        settle(self.config.hover_settle_ms).await;
        view.click(cluster.centroid).await
    }

    async fn finish<V, C>(
        &self,
        view: &V,
        callback: &mut C,
        state: WalkState,
    ) -> Result<WalkReport<C::Output>>
    where
        V: MapView + ?Sized,
        C: ListReady,
    {
        info!(
            iterations = state.iterations,
            clusters_visited = state.visited.len(),
            zoom_steps = state.zoom_steps,
            "Item list reached"
        );
        let output = callback.on_list_ready().await;

        if let WalkPolicy::ResetToBaseline { baseline_zoom } = self.config.policy {
            if let Err(e) = self.reset_view(view, baseline_zoom).await {
                if e.is_session_dead() {
                    return Err(e);
                }
                warn!("Failed to reset map to baseline: {}", e);
            }
        }

        Ok(WalkReport {
            outcome: WalkOutcome::Done(output),
            iterations: state.iterations,
            zoom_steps: state.zoom_steps,
            visited: state.visited,
        })
    }

    async fn reset_view<V: MapView + ?Sized>(&self, view: &V, baseline_zoom: f64) -> Result<()> {
        view.neutral_click().await?;
        settle(self.config.hover_settle_ms).await;
        view.zoom_to(baseline_zoom).await?;
        settle(self.config.zoom_settle_ms).await;
        Ok(())
    }

    fn abort<T>(&self, state: WalkState, reason: AbortReason) -> WalkReport<T> {
        info!(
            ?reason,
            iterations = state.iterations,
            clusters_visited = state.visited.len(),
            "Cluster walk aborted"
        );
        WalkReport {
            outcome: WalkOutcome::Aborted(reason),
            iterations: state.iterations,
            zoom_steps: state.zoom_steps,
            visited: state.visited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::Point;
    use crate::error::ScanError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapState {
        zoom: usize,
        list_open: bool,
        clicks: Vec<String>,
        enumerations: usize,
        zoom_ins: usize,
        neutral_clicks: usize,
        zoomed_to: Option<f64>,
    }

    /// Scripted map: clusters per zoom level, some of which open the list.
    struct FakeMap {
        levels: HashMap<usize, Vec<(&'static str, f64, f64)>>,
        opens_list: Vec<&'static str>,
        failing_clicks: Vec<&'static str>,
        max_zoom: usize,
        list_initially: bool,
        /// Every enumeration yields brand-new clusters.
        adversarial: bool,
        state: Mutex<MapState>,
    }

    impl FakeMap {
        fn new(levels: Vec<(usize, Vec<(&'static str, f64, f64)>)>) -> Self {
            Self {
                levels: levels.into_iter().collect(),
                opens_list: Vec::new(),
                failing_clicks: Vec::new(),
                max_zoom: 0,
                list_initially: false,
                adversarial: false,
                state: Mutex::new(MapState::default()),
            }
        }

        fn clicks(&self) -> Vec<String> {
            self.state.lock().unwrap().clicks.clone()
        }
    }

    #[async_trait]
    impl MapView for FakeMap {
        async fn list_present(&self) -> Result<bool> {
            Ok(self.list_initially || self.state.lock().unwrap().list_open)
        }

        async fn clusters(&self) -> Result<Vec<ClusterDescriptor>> {
            let mut state = self.state.lock().unwrap();
            state.enumerations += 1;
            if self.adversarial {
                let n = state.enumerations as f64;
                return Ok(vec![
                    ClusterDescriptor::new("7", Point::new(n, 10.0)),
                    ClusterDescriptor::new("3", Point::new(n, 20.0)),
                ]);
            }
            Ok(self
                .levels
                .get(&state.zoom)
                .map(|cs| {
                    cs.iter()
                        .map(|(label, x, y)| ClusterDescriptor::new(label, Point::new(*x, *y)))
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn zoom_level(&self) -> Result<Option<f64>> {
            Ok(Some(self.state.lock().unwrap().zoom as f64))
        }

        async fn can_zoom_in(&self) -> Result<bool> {
            Ok(self.adversarial || self.state.lock().unwrap().zoom < self.max_zoom)
        }

        async fn zoom_in(&self) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.zoom += 1;
            state.zoom_ins += 1;
            Ok(())
        }

        async fn zoom_to(&self, level: f64) -> Result<()> {
            self.state.lock().unwrap().zoomed_to = Some(level);
            Ok(())
        }

        async fn pointer_move(&self, _at: Point) -> Result<()> {
            Ok(())
        }

        async fn click(&self, at: Point) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let hit = self
                .levels
                .get(&state.zoom)
                .and_then(|cs| cs.iter().find(|(_, x, y)| *x == at.x && *y == at.y))
                .map(|(label, _, _)| *label);
            state.clicks.push(format!("{}x{}", at.x, at.y));
            if let Some(label) = hit {
                if self.failing_clicks.contains(&label) {
                    return Err(ScanError::Detached(label.to_string()));
                }
                if self.opens_list.contains(&label) {
                    state.list_open = true;
                }
            }
            Ok(())
        }

        async fn neutral_click(&self) -> Result<()> {
            self.state.lock().unwrap().neutral_clicks += 1;
            Ok(())
        }
    }

    struct CountingCallback {
        calls: usize,
    }

    #[async_trait]
    impl ListReady for CountingCallback {
        type Output = usize;

        async fn on_list_ready(&mut self) -> usize {
            self.calls += 1;
            42
        }
    }

    fn walker(policy: WalkPolicy) -> ClusterWalker {
        ClusterWalker::new(WalkerConfig {
            policy,
            hover_settle_ms: 0,
            click_settle_ms: 0,
            zoom_settle_ms: 0,
            ..WalkerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_list_already_present_invokes_callback() {
        let mut map = FakeMap::new(vec![]);
        map.list_initially = true;
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Zoom)
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(report.outcome, WalkOutcome::Done(42)));
        assert_eq!(callback.calls, 1);
        assert!(map.clicks().is_empty());
    }

    #[tokio::test]
    async fn test_visits_in_descending_count_order() {
        let mut map = FakeMap::new(vec![(0, vec![("5", 300.0, 150.0), ("12", 100.0, 200.0)])]);
        map.opens_list = vec!["5"];
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Zoom)
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(report.outcome, WalkOutcome::Done(_)));
        assert_eq!(
            report.visited.in_click_order(),
            &["12@100x200".to_string(), "5@300x150".to_string()]
        );
        assert_eq!(map.clicks(), vec!["100x200", "300x150"]);
    }

    #[tokio::test]
    async fn test_zooms_in_when_clusters_exhausted() {
        let mut map = FakeMap::new(vec![
            (0, vec![("40", 200.0, 200.0)]),
            (1, vec![("25", 150.0, 180.0), ("15", 260.0, 220.0)]),
        ]);
        map.max_zoom = 3;
        map.opens_list = vec!["15"];
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Zoom)
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(report.outcome, WalkOutcome::Done(_)));
        assert_eq!(report.zoom_steps, 1);
        assert_eq!(report.visited.len(), 3);
        assert_eq!(callback.calls, 1);
    }

    #[tokio::test]
    async fn test_aborts_at_zoom_floor_without_revisiting() {
        let mut map = FakeMap::new(vec![(0, vec![("8", 50.0, 60.0)])]);
        map.max_zoom = 0;
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Zoom)
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            WalkOutcome::Aborted(AbortReason::ZoomFloor)
        ));
        assert_eq!(map.clicks(), vec!["50x60"]);
        assert_eq!(callback.calls, 0);
    }

    #[tokio::test]
    async fn test_adversarial_clusters_hit_iteration_ceiling() {
        let mut map = FakeMap::new(vec![]);
        map.adversarial = true;
        let walker = walker(WalkPolicy::Zoom);

        for _ in 0..2 {
            let mut callback = CountingCallback { calls: 0 };
            let report = walker.walk(&map, &mut callback).await.unwrap();

            assert!(matches!(
                report.outcome,
                WalkOutcome::Aborted(AbortReason::IterationCeiling)
            ));
            assert_eq!(report.iterations, 50);
            let clicked = report.visited.in_click_order();
            let unique: HashSet<_> = clicked.iter().collect();
            assert_eq!(unique.len(), clicked.len());
        }
    }

    #[tokio::test]
    async fn test_click_error_is_skipped() {
        let mut map = FakeMap::new(vec![(0, vec![("30", 10.0, 10.0), ("20", 20.0, 20.0)])]);
        map.failing_clicks = vec!["30"];
        map.opens_list = vec!["20"];
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Zoom)
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(report.outcome, WalkOutcome::Done(_)));
        assert_eq!(report.visited.len(), 2);
    }

    #[tokio::test]
    async fn test_bounded_policy_never_zooms() {
        let mut map = FakeMap::new(vec![]);
        map.adversarial = true;
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::Bounded {
            max_attempts: 3,
            max_duration_secs: 600,
        })
        .walk(&map, &mut callback)
        .await
        .unwrap();

        assert!(matches!(
            report.outcome,
            WalkOutcome::Aborted(AbortReason::AttemptBudget)
        ));
        assert_eq!(report.visited.len(), 3);
        assert_eq!(map.state.lock().unwrap().zoom_ins, 0);
    }

    #[tokio::test]
    async fn test_reset_to_baseline_after_success() {
        let mut map = FakeMap::new(vec![(0, vec![("9", 70.0, 80.0)])]);
        map.opens_list = vec!["9"];
        let mut callback = CountingCallback { calls: 0 };

        let report = walker(WalkPolicy::ResetToBaseline { baseline_zoom: 11.0 })
            .walk(&map, &mut callback)
            .await
            .unwrap();

        assert!(matches!(report.outcome, WalkOutcome::Done(_)));
        let state = map.state.lock().unwrap();
        assert_eq!(state.neutral_clicks, 1);
        assert_eq!(state.zoomed_to, Some(11.0));
    }

    #[test]
    fn test_visited_set_rejects_duplicates() {
        let mut visited = VisitedSet::default();
        assert!(visited.insert("12@100x200"));
        assert!(!visited.insert("12@100x200"));
        assert_eq!(visited.len(), 1);
    }
}
