use crate::data::RunStatus;
use colored::*;
use serde::Serialize;

/// Counters for one invocation of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub localities_harvested: u64,
    pub localities_skipped: u64,
    pub localities_timed_out: u64,
    pub records_persisted: u64,
    pub records_updated: u64,
    pub records_rejected: u64,
    pub region_mismatches: u64,
    pub stale_cache_recoveries: u64,
    pub dead_session_recoveries: u64,
    pub broken_view_recoveries: u64,
    pub filter_failures: u64,
    pub regions_completed: u64,
    pub passes_completed: u32,
    pub status: Option<RunStatus>,
}

impl SweepReport {
    pub fn localities_attempted(&self) -> u64 {
        self.localities_harvested + self.localities_skipped + self.localities_timed_out
    }

    pub fn status(&self) -> RunStatus {
        self.status.unwrap_or(RunStatus::Running)
    }

    pub fn render(&self) -> String {
        let status = match self.status() {
            RunStatus::Completed => "completed".green().bold(),
            RunStatus::Paused => "paused (quota reached)".yellow().bold(),
            RunStatus::Cancelled => "cancelled".yellow(),
            RunStatus::Failed => "failed".red().bold(),
            RunStatus::Running => "running".normal(),
        };

        let mut out = String::new();
        out.push_str(&format!("{}\n", "Sweep summary".bold().underline()));
        out.push_str(&format!("  {:<26} {}\n", "Status:", status));
        out.push_str(&format!(
            "  {:<26} {} harvested, {} skipped, {} timed out\n",
            "Localities:",
            self.localities_harvested.to_string().green(),
            self.localities_skipped.to_string().yellow(),
            self.localities_timed_out.to_string().yellow()
        ));
        out.push_str(&format!(
            "  {:<26} {} new, {} updated, {} rejected\n",
            "Records:",
            self.records_persisted.to_string().green(),
            self.records_updated,
            self.records_rejected.to_string().red()
        ));
        if self.region_mismatches > 0 {
            out.push_str(&format!(
                "  {:<26} {}\n",
                "Region mismatches:",
                self.region_mismatches.to_string().red()
            ));
        }
        out.push_str(&format!(
            "  {:<26} {} stale cache, {} dead session, {} broken view\n",
            "Recoveries:",
            self.stale_cache_recoveries,
            self.dead_session_recoveries,
            self.broken_view_recoveries
        ));
        if self.filter_failures > 0 {
            out.push_str(&format!(
                "  {:<26} {}\n",
                "Filter failures:", self.filter_failures
            ));
        }
        out.push_str(&format!(
            "  {:<26} {} regions, {} passes\n",
            "Completed:", self.regions_completed, self.passes_completed
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_mentions_status_and_counts() {
        colored::control::set_override(false);
        let report = SweepReport {
            localities_harvested: 3,
            localities_skipped: 1,
            records_persisted: 42,
            status: Some(RunStatus::Paused),
            ..Default::default()
        };

        let text = report.render();

        assert!(text.contains("paused (quota reached)"));
        assert!(text.contains("3 harvested, 1 skipped, 0 timed out"));
        assert!(text.contains("42 new"));
        assert_eq!(report.localities_attempted(), 4);
    }
}
