//! Virtualized list harvester.
//!
//! Samples a lazily mounted list until the accumulated set and the container's
//! scroll extent both stop changing for `stall_window` consecutive iterations.

use crate::browser::settle;
use crate::error::Result;
use crate::extract::RawListingCard;
use crate::site::{ScrollMetrics, VirtualList};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub max_iterations: usize,
    /// Consecutive unchanged (size, extent) samples that count as converged.
    pub stall_window: usize,
    pub settle_ms: u64,
    /// Every N iterations scroll back to the top to force earlier rows to remount.
    pub rewind_every: usize,
    /// Gap to a known target small enough to justify a micro pass.
    pub micro_pass_deficit: usize,
    pub micro_pass_nudges: usize,
    pub micro_nudge_px: f64,
    /// Step used when no target count is known.
    pub small_increment_px: f64,
    pub min_step_px: f64,
    pub page_nudge_px: f64,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            max_iterations: 60,
            stall_window: 3,
            settle_ms: 800,
            rewind_every: 6,
            micro_pass_deficit: 3,
            micro_pass_nudges: 6,
            micro_nudge_px: 240.0,
            small_increment_px: 400.0,
            min_step_px: 120.0,
            page_nudge_px: 200.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarvestOutcome {
    /// Deduplicated cards in first-seen order.
    pub cards: Vec<RawListingCard>,
    pub iterations: usize,
    pub converged: bool,
    pub reported: Option<usize>,
    /// Accumulated size after each iteration.
    pub sizes: Vec<usize>,
    /// Rows still missing against the reported count after the micro pass.
    pub shortfall: Option<usize>,
}

/// Address-keyed accumulator; the newest read for a key overwrites the old one in place.
#[derive(Debug, Default)]
struct Accumulator {
    index: HashMap<String, usize>,
    cards: Vec<RawListingCard>,
}

impl Accumulator {
    fn merge(&mut self, rows: Vec<RawListingCard>) -> usize {
        let before = self.cards.len();
        for card in rows {
            let key = card.key();
            if key.is_empty() {
                continue;
            }
            match self.index.get(&key) {
                Some(&i) => self.cards[i] = card,
                None => {
                    self.index.insert(key, self.cards.len());
                    self.cards.push(card);
                }
            }
        }
        self.cards.len() - before
    }

    fn len(&self) -> usize {
        self.cards.len()
    }
}

pub struct ListHarvester {
    config: HarvesterConfig,
}

impl ListHarvester {
    pub fn new(config: HarvesterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// How far to advance the container this iteration.
    ///
    /// With a known target the step grows with the number of rows still
    /// missing relative to rows per screen, capped at one screen so no row is
    /// skipped. Without one the list is grown in small increments.
    fn growth_step(
        &self,
        target: Option<usize>,
        accumulated: usize,
        rows_per_screen: usize,
        metrics: &ScrollMetrics,
    ) -> f64 {
        let screen = (metrics.viewport * 0.9).max(self.config.min_step_px);
        match target {
            Some(t) if t > accumulated => {
                let remaining = (t - accumulated) as f64;
                let per_screen = rows_per_screen.max(1) as f64;
                (screen * (remaining / per_screen).min(1.0)).max(self.config.min_step_px)
            }
            Some(_) => self.config.min_step_px,
            None => self.config.small_increment_px.min(screen),
        }
    }

    pub async fn harvest(&self, list: &(impl VirtualList + ?Sized)) -> Result<HarvestOutcome> {
        let target = match list.reported_count().await {
            Ok(count) => count,
            Err(e) if e.is_transient() => None,
            Err(e) => return Err(e),
        };
        debug!(?target, "Starting list harvest");

        let mut acc = Accumulator::default();
        let mut outcome = HarvestOutcome {
            reported: target,
            ..Default::default()
        };
        let mut last_signature: Option<(usize, i64)> = None;
        let mut stalled = 0;

        for iteration in 1..=self.config.max_iterations {
            outcome.iterations = iteration;

            let rows = self.read_rows(list).await?;
            let rows_per_screen = rows.len();
            let added = acc.merge(rows);

            if self.config.rewind_every > 0 && iteration % self.config.rewind_every == 0 {
                let resume = list.scroll_metrics().await?.offset;
                list.scroll_to(0.0).await?;
                settle(self.config.settle_ms).await;
                let rewound = self.read_rows(list).await?;
                let recovered = acc.merge(rewound);
                if recovered > 0 {
                    debug!(recovered, "Rewind remounted earlier rows");
                }
                list.scroll_to(resume).await?;
                settle(self.config.settle_ms).await;
            }

            let metrics = list.scroll_metrics().await?;
            outcome.sizes.push(acc.len());
            debug!(
                iteration,
                added,
                total = acc.len(),
                extent = metrics.extent,
                "Harvest iteration"
            );

            let signature = (acc.len(), metrics.extent.round() as i64);
            if last_signature == Some(signature) {
                stalled += 1;
            } else {
                stalled = 0;
                last_signature = Some(signature);
            }
            if stalled >= self.config.stall_window {
                outcome.converged = true;
                break;
            }

            let step = self.growth_step(target, acc.len(), rows_per_screen, &metrics);
            let next = (metrics.offset + step).min(metrics.extent);
            list.scroll_to(next).await?;
            let after = list.scroll_metrics().await?;
            if after.at_end() {
                list.scroll_to(after.extent).await?;
                list.nudge_page(self.config.page_nudge_px).await?;
            }
            settle(self.config.settle_ms).await;
        }

        if let Some(t) = target
            && acc.len() < t
            && t - acc.len() <= self.config.micro_pass_deficit
        {
            self.micro_pass(list, &mut acc, t).await?;
        }

        if let Some(t) = target
            && acc.len() < t
        {
            let missing = t - acc.len();
            outcome.shortfall = Some(missing);
            warn!(
                harvested = acc.len(),
                reported = t,
                missing,
                "List harvest finished short of reported count"
            );
        }

        info!(
            harvested = acc.len(),
            iterations = outcome.iterations,
            converged = outcome.converged,
            "List harvest complete"
        );
        outcome.cards = acc.cards;
        Ok(outcome)
    }

    /// Short alternating nudges around the current position to mount stragglers.
    async fn micro_pass(
        &self,
        list: &(impl VirtualList + ?Sized),
        acc: &mut Accumulator,
        target: usize,
    ) -> Result<()> {
        debug!(deficit = target - acc.len(), "Running micro pass");
        for nudge in 0..self.config.micro_pass_nudges {
            let metrics = list.scroll_metrics().await?;
            let delta = if nudge % 2 == 0 {
                -self.config.micro_nudge_px
            } else {
                self.config.micro_nudge_px
            };
            list.scroll_to((metrics.offset + delta).clamp(0.0, metrics.extent))
                .await?;
            settle(self.config.settle_ms / 2).await;
            acc.merge(self.read_rows(list).await?);
            if acc.len() >= target {
                break;
            }
        }
        Ok(())
    }

    async fn read_rows(&self, list: &(impl VirtualList + ?Sized)) -> Result<Vec<RawListingCard>> {
        match list.mounted_rows().await {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_transient() => {
                debug!("Row read failed transiently: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}
