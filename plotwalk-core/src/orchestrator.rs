//! Region × locality sweep with checkpointing and unattended recovery.

use crate::checkpoint::{Checkpoint, LocalityTally};
use crate::config::{Region, SweepConfig};
use crate::data::{RunStatus, UpsertOutcome};
use crate::error::{Result, SweepError};
use crate::recovery::{
    ActivityClock, HarvestSignal, LocalityAttempts, LocalityStep, RecoveryAction, SkipReason,
    stale_cache_detected,
};
use crate::report::SweepReport;
use crate::store::{CheckpointStore, ListingStore, QuotaGate};
use async_trait::async_trait;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use plotwalk_scanner::browser::settle;
use plotwalk_scanner::extract::{NormalizedListing, Rejection, validate};
use plotwalk_scanner::{
    Authenticator, BrowserSession, ClusterWalker, FilterApplier, ListHarvester, ListReady,
    PageHandle, ScanError, SiteDriver, WalkOutcome, resolve_agent,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback for reporting sweep progress
pub type SweepProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Spinner for interactive runs, plus the callback that feeds it.
pub fn progress_spinner() -> (ProgressBar, SweepProgressCallback) {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Starting sweep...");
    let handle = pb.clone();
    (pb, Arc::new(move |msg: String| handle.set_message(msg)))
}

/// External services the orchestrator drives.
pub struct Collaborators {
    pub session: Arc<dyn BrowserSession>,
    pub auth: Arc<dyn Authenticator>,
    pub filters: Arc<dyn FilterApplier>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub listings: Arc<dyn ListingStore>,
    pub quota: Arc<dyn QuotaGate>,
}

enum RegionFlow {
    Continue,
    Stop(RunStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalityOutcome {
    Harvested,
    Skipped(SkipReason),
    Aborted,
}

/// Counters written from inside the harvest callback.
#[derive(Default)]
struct Ledger {
    persisted: AtomicU64,
    updated: AtomicU64,
    rejected: AtomicU64,
    mismatched: AtomicU64,
    filter_failures: AtomicU64,
    broken_views: AtomicU64,
}

impl Ledger {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    fn fold_into(&self, report: &mut SweepReport) {
        report.records_persisted += Self::get(&self.persisted);
        report.records_updated += Self::get(&self.updated);
        report.records_rejected += Self::get(&self.rejected);
        report.region_mismatches += Self::get(&self.mismatched);
        report.filter_failures += Self::get(&self.filter_failures);
        report.broken_view_recoveries += Self::get(&self.broken_views);
    }

    fn tally(&self, skipped: bool) -> LocalityTally {
        LocalityTally {
            persisted: Self::get(&self.persisted) + Self::get(&self.updated),
            rejected: Self::get(&self.rejected) + Self::get(&self.mismatched),
            skipped,
        }
    }
}

pub struct Orchestrator<S: SiteDriver> {
    config: SweepConfig,
    page: PageHandle,
    site: S,
    deps: Collaborators,
    abort: Arc<AtomicBool>,
    progress: Option<SweepProgressCallback>,
    walker: ClusterWalker,
    harvester: ListHarvester,
}

impl<S: SiteDriver> Orchestrator<S> {
    pub fn new(
        config: SweepConfig,
        page: PageHandle,
        site: S,
        deps: Collaborators,
        abort: Arc<AtomicBool>,
    ) -> Self {
        let walker = ClusterWalker::new(config.walker.clone());
        let harvester = ListHarvester::new(config.harvester.clone());
        Self {
            config,
            page,
            site,
            deps,
            abort,
            progress: None,
            walker,
            harvester,
        }
    }

    pub fn with_progress(mut self, progress: SweepProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn site(&self) -> &S {
        &self.site
    }

    pub fn page(&self) -> &PageHandle {
        &self.page
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn report_progress(&self, msg: String) {
        if let Some(cb) = &self.progress {
            cb(msg);
        }
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recovery.probe_timeout_ms)
    }

    /// Runs until every pass is done, the quota pauses the sweep or the abort flag is set.
    ///
    /// Only authentication failures and storage errors end the run with `Err`.
    pub async fn run(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut checkpoint = Checkpoint::load(self.deps.checkpoints.clone()).await?;

        let regions = self.config.ordered_regions();
        if regions.is_empty() {
            warn!("No regions to sweep");
            report.status = Some(RunStatus::Completed);
            return Ok(report);
        }
        if regions.iter().all(|r| r.ordered_localities().is_empty()) {
            warn!(regions = regions.len(), "No region lists any locality, nothing to sweep");
            report.status = Some(RunStatus::Completed);
            return Ok(report);
        }

        self.authenticate().await?;
        self.open_start().await?;

        loop {
            let cycle = checkpoint.filter_cycle_index();
            info!(
                cycle,
                preset = self.config.cycle_name(cycle).unwrap_or("default"),
                "Sweeping filter cycle"
            );

            for region in &regions {
                if checkpoint.is_region_complete(&region.code) {
                    debug!(region = %region.code, "Region already complete, skipping");
                    continue;
                }
                if self.aborted() {
                    report.status = Some(RunStatus::Cancelled);
                    return Ok(report);
                }

                match self
                    .sweep_region(region, cycle, &mut checkpoint, &mut report)
                    .await?
                {
                    RegionFlow::Continue => {}
                    RegionFlow::Stop(status) => {
                        report.status = Some(status);
                        return Ok(report);
                    }
                }

                checkpoint.complete_region(&region.code).await?;
                report.regions_completed += 1;

                // Purge client-side state before the next region.
                if let Err(e) = self.recycle_session().await {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    warn!(region = %region.code, "Session recycle after region failed: {}", e);
                }
            }

            if checkpoint.advance_filter_cycle(self.config.cycle_count()).await? {
                report.passes_completed += 1;
                info!(passes = report.passes_completed, "Global pass complete");
                if self
                    .config
                    .max_passes
                    .is_some_and(|max| report.passes_completed >= max)
                {
                    report.status = Some(RunStatus::Completed);
                    return Ok(report);
                }
            }
        }
    }

    async fn sweep_region(
        &self,
        region: &Region,
        cycle: usize,
        checkpoint: &mut Checkpoint,
        report: &mut SweepReport,
    ) -> Result<RegionFlow> {
        let localities = region.ordered_localities();
        let start = checkpoint.resume_index(&region.code);
        if start > 0 {
            info!(region = %region.code, start, "Resuming region from checkpoint");
        } else {
            info!(region = %region.code, localities = localities.len(), "Starting region");
        }

        for (index, locality) in localities.iter().enumerate().skip(start) {
            if self.aborted() {
                info!(region = %region.code, locality = %locality, "Abort requested");
                return Ok(RegionFlow::Stop(RunStatus::Cancelled));
            }
            self.report_progress(format!(
                "{} {}/{}: {}",
                region.code,
                index + 1,
                localities.len(),
                locality
            ));

            let ledger = Ledger::default();
            let outcome = self
                .sweep_locality(region, locality, cycle, &ledger, report)
                .await;
            ledger.fold_into(report);
            let outcome = outcome?;

            let skipped = match outcome {
                LocalityOutcome::Aborted => {
                    info!(region = %region.code, locality = %locality, "Abort requested mid-locality");
                    return Ok(RegionFlow::Stop(RunStatus::Cancelled));
                }
                LocalityOutcome::Harvested => {
                    report.localities_harvested += 1;
                    false
                }
                LocalityOutcome::Skipped(SkipReason::InactivityTimeout) => {
                    report.localities_timed_out += 1;
                    true
                }
                LocalityOutcome::Skipped(reason) => {
                    info!(region = %region.code, locality = %locality, "Locality skipped: {}", reason.as_str());
                    report.localities_skipped += 1;
                    true
                }
            };

            checkpoint
                .complete_locality(&region.code, index, ledger.tally(skipped))
                .await?;

            if self.deps.quota.is_over_threshold().await? {
                info!(region = %region.code, index, "Ingestion quota reached, pausing");
                return Ok(RegionFlow::Stop(RunStatus::Paused));
            }
        }

        Ok(RegionFlow::Continue)
    }

    async fn sweep_locality(
        &self,
        region: &Region,
        locality: &str,
        cycle: usize,
        ledger: &Ledger,
        report: &mut SweepReport,
    ) -> Result<LocalityOutcome> {
        let clock = ActivityClock::new(Duration::from_secs(
            self.config.recovery.locality_timeout_secs,
        ));
        let mut attempts = LocalityAttempts::default();

        loop {
            if self.aborted() {
                return Ok(LocalityOutcome::Aborted);
            }
            clock.resume();

            let signal = tokio::select! {
                signal = self.attempt_locality(region, locality, cycle, &clock, ledger) => signal?,
                _ = clock.expiry() => {
                    warn!(region = %region.code, locality, "No records persisted before the inactivity timeout, moving on");
                    return Ok(LocalityOutcome::Skipped(SkipReason::InactivityTimeout));
                }
            };
            if self.aborted() {
                return Ok(LocalityOutcome::Aborted);
            }

            clock.suspend();
            match attempts.next(signal, &self.config.recovery) {
                LocalityStep::Done => return Ok(LocalityOutcome::Harvested),
                LocalityStep::Skip(reason) => return Ok(LocalityOutcome::Skipped(reason)),
                LocalityStep::Retry(action) => {
                    match action {
                        RecoveryAction::RecycleSession => report.stale_cache_recoveries += 1,
                        RecoveryAction::ReplacePage => report.dead_session_recoveries += 1,
                    }
                    warn!(
                        region = %region.code,
                        locality,
                        attempt = attempts.stale_cache + attempts.dead_session,
                        ?action,
                        "Recovering and retrying locality"
                    );
                    if let Err(e) = self.recover(action).await {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        warn!(locality, "Recovery failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass over a locality. Non-fatal failures are folded into a signal.
    async fn attempt_locality(
        &self,
        region: &Region,
        locality: &str,
        cycle: usize,
        clock: &ActivityClock,
        ledger: &Ledger,
    ) -> Result<HarvestSignal> {
        match self
            .search_and_harvest(region, locality, cycle, clock, ledger)
            .await
        {
            Ok(signal) => Ok(signal),
            Err(SweepError::Scan(e)) if e.is_session_dead() => {
                warn!(region = %region.code, locality, "Session died: {}", e);
                Ok(HarvestSignal::DeadSession)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                if !self.page.current().is_responsive(self.probe_timeout()).await {
                    warn!(region = %region.code, locality, "Locality failed on an unresponsive page: {}", e);
                    return Ok(HarvestSignal::DeadSession);
                }
                warn!(region = %region.code, locality, "Locality failed: {}", e);
                Ok(HarvestSignal::SkipLocality)
            }
        }
    }

    async fn search_and_harvest(
        &self,
        region: &Region,
        locality: &str,
        cycle: usize,
        clock: &ActivityClock,
        ledger: &Ledger,
    ) -> Result<HarvestSignal> {
        if self.site.map_imagery_missing().await? {
            warn!(locality, "Map imagery missing, swapping in a fresh page");
            self.page
                .swap_fresh(self.deps.session.as_ref(), self.probe_timeout())
                .await?;
            Ledger::add(&ledger.broken_views, 1);
            self.open_start().await?;
        }

        self.apply_filters(cycle, ledger).await?;
        self.search(region, locality).await?;

        let mut step = HarvestStep {
            orchestrator: self,
            region,
            cycle_name: self.config.cycle_name(cycle),
            clock,
            ledger,
        };
        let walk = self.walker.walk(&self.site, &mut step).await?;
        debug!(
            locality,
            iterations = walk.iterations,
            zoom_steps = walk.zoom_steps,
            clusters = walk.visited.len(),
            "Walk finished"
        );
        match walk.outcome {
            WalkOutcome::Done(signal) => signal,
            WalkOutcome::Aborted(reason) => {
                info!(locality, ?reason, "No listing list reachable for this view");
                Ok(HarvestSignal::SkipLocality)
            }
        }
    }

    async fn apply_filters(&self, cycle: usize, ledger: &Ledger) -> Result<()> {
        let rules = self.config.rules_for_cycle(cycle);
        for attempt in 1..=self.config.recovery.filter_attempts.max(1) {
            let outcome = self
                .deps
                .filters
                .apply(self.page.current().as_ref(), &rules)
                .await?;
            if outcome.succeeded() {
                return Ok(());
            }
            Ledger::add(&ledger.filter_failures, outcome.failure_count() as u64);
            warn!(attempt, failures = outcome.failure_count(), "Filters incomplete");
        }

        warn!("Filters keep failing, retrying once on a fresh page");
        self.page
            .swap_fresh(self.deps.session.as_ref(), self.probe_timeout())
            .await?;
        tokio::time::sleep(Duration::from_millis(self.config.recovery.filter_cooldown_ms)).await;
        self.open_start().await?;

        let outcome = self
            .deps
            .filters
            .apply(self.page.current().as_ref(), &rules)
            .await?;
        if !outcome.succeeded() {
            Ledger::add(&ledger.filter_failures, outcome.failure_count() as u64);
            warn!(
                missing = ?outcome.failures,
                "Proceeding without full filters, the price gate still applies"
            );
        }
        Ok(())
    }

    async fn search(&self, region: &Region, locality: &str) -> Result<()> {
        let query = format!("{locality}, {}", region.code);
        let typed = match self.site.search_by_input(&query).await {
            Ok(typed) => typed,
            Err(e) if e.is_transient() => {
                debug!(locality, "Search box unusable: {}", e);
                false
            }
            Err(e) => return Err(e.into()),
        };

        if !typed {
            let url = self.config.search_url(locality, region).ok_or_else(|| {
                ScanError::ElementNotFound("search input and no search_url_template".to_string())
            })?;
            debug!(locality, url = %url, "Falling back to URL navigation");
            self.site.navigate(&url).await?;
        }
        settle(self.config.network_wait_ms).await;

        let shown = match self.site.displayed_location().await {
            Ok(shown) => shown,
            Err(e) if e.is_transient() => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(shown) = shown
            && !location_matches(&shown, locality)
        {
            warn!(locality, shown = %shown, "Results header shows another location, forcing a hard reload");
            self.site.hard_reload().await?;
            settle(self.config.initial_wait_ms).await;
        }
        Ok(())
    }

    /// Harvests the list, validates every card and persists the accepted ones.
    async fn harvest_list(
        &self,
        region: &Region,
        cycle_name: Option<&str>,
        clock: &ActivityClock,
        ledger: &Ledger,
    ) -> Result<HarvestSignal> {
        let outcome = self.harvester.harvest(&self.site).await?;
        let now = Utc::now();
        let range = self.config.price_range();

        let mut accepted: Vec<(usize, NormalizedListing)> = Vec::new();
        let mut region_parsed = 0usize;
        let mut mismatched = 0usize;
        let mut rejected = 0u64;
        for (i, card) in outcome.cards.iter().enumerate() {
            match validate(card, &region.code, &range, &self.config.source_tag, now) {
                Ok(listing) => {
                    region_parsed += 1;
                    accepted.push((i, listing));
                }
                Err(Rejection::RegionMismatch { expected, found }) => {
                    region_parsed += 1;
                    mismatched += 1;
                    debug!(card = %card.key(), expected = %expected, found = %found, "Region mismatch");
                }
                Err(rejection) => {
                    if !matches!(rejection, Rejection::MissingAddress) {
                        region_parsed += 1;
                    }
                    rejected += 1;
                    debug!(card = %card.key(), "Rejected: {}", rejection);
                }
            }
        }
        Ledger::add(&ledger.mismatched, mismatched as u64);
        Ledger::add(&ledger.rejected, rejected);

        if stale_cache_detected(
            mismatched,
            region_parsed,
            self.config.recovery.stale_share_threshold,
        ) {
            warn!(
                region = %region.code,
                mismatched,
                region_parsed,
                "Listings from another region, view is stale"
            );
            return Ok(HarvestSignal::StaleCacheRetry);
        }

        for (i, mut listing) in accepted {
            if self.aborted() {
                info!("Abort requested, stopping before the next record");
                break;
            }
            let card = &outcome.cards[i];
            let (agent, source) =
                resolve_agent(&self.site, card, self.config.open_details).await;
            debug!(address = %listing.full_address, ?source, "Agent resolved");
            listing.agent = agent;

            match self
                .deps
                .listings
                .upsert_by_address(&listing, cycle_name)
                .await?
            {
                UpsertOutcome::Inserted => Ledger::add(&ledger.persisted, 1),
                UpsertOutcome::Updated => Ledger::add(&ledger.updated, 1),
            }
            clock.touch();

            if self.deps.quota.increment_and_check().await? {
                debug!("Ingestion quota reached, finishing locality before pausing");
            }
        }

        info!(
            region = %region.code,
            cards = outcome.cards.len(),
            converged = outcome.converged,
            persisted = Ledger::get(&ledger.persisted),
            updated = Ledger::get(&ledger.updated),
            rejected,
            "List harvested"
        );
        Ok(HarvestSignal::Continue)
    }

    async fn authenticate(&self) -> Result<()> {
        let page = self.page.current();
        match self.deps.auth.authenticate(page.as_ref()).await {
            Ok(()) => Ok(()),
            Err(ScanError::Auth(msg)) => Err(SweepError::AuthFailed(msg)),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_start(&self) -> Result<()> {
        if self.config.start_url.is_empty() {
            return Ok(());
        }
        self.site.navigate(&self.config.start_url).await?;
        settle(self.config.initial_wait_ms).await;
        Ok(())
    }

    async fn recycle_session(&self) -> Result<()> {
        self.page.recycle_session(self.deps.session.as_ref()).await?;
        self.authenticate().await?;
        self.open_start().await
    }

    async fn recover(&self, action: RecoveryAction) -> Result<()> {
        match action {
            RecoveryAction::RecycleSession => self.recycle_session().await,
            RecoveryAction::ReplacePage => {
                match self
                    .page
                    .swap_fresh(self.deps.session.as_ref(), self.probe_timeout())
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_session_dead() => {
                        warn!("Fresh page unresponsive, relaunching the browser: {}", e);
                        self.page.recycle_session(self.deps.session.as_ref()).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
                self.authenticate().await?;
                self.open_start().await
            }
        }
    }
}

/// The displayed header names the requested locality.
pub fn location_matches(shown: &str, locality: &str) -> bool {
    let norm = |s: &str| {
        s.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    };
    norm(shown).contains(&norm(locality))
}

struct HarvestStep<'a, S: SiteDriver> {
    orchestrator: &'a Orchestrator<S>,
    region: &'a Region,
    cycle_name: Option<&'a str>,
    clock: &'a ActivityClock,
    ledger: &'a Ledger,
}

#[async_trait]
impl<S: SiteDriver> ListReady for HarvestStep<'_, S> {
    type Output = Result<HarvestSignal>;

    async fn on_list_ready(&mut self) -> Self::Output {
        self.orchestrator
            .harvest_list(self.region, self.cycle_name, self.clock, self.ledger)
            .await
    }
}
