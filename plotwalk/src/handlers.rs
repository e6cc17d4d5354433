use anyhow::{Context, Result, bail};
use chrono::DateTime;
use colored::Colorize;
use plotwalk_core::config::{Region, SweepConfig, expand_path};
use plotwalk_core::data::{Database, RunStatus, StoredListing};
use plotwalk_core::store::INGEST_QUOTA;
use serde_json::{Value, json};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

pub fn print_banner() {
    println!(
        "{} {}",
        "plotwalk".bright_green().bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!("{}", "resumable listing sweeps".bright_black());
    println!();
}

/// Logs go to stderr so report output on stdout stays clean.
pub fn init_tracing(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "plotwalk={level},plotwalk_core={level},plotwalk_scanner={level}"
        ))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

pub fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

/// Asks a yes/no question on stdin. Anything but "y"/"yes" is a no.
pub fn confirm(msg: &str) -> Result<bool> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    let response = response.trim().to_lowercase();
    Ok(response == "y" || response == "yes")
}

pub fn resolve_path(raw: &str) -> Result<PathBuf> {
    Ok(expand_path(raw)?)
}

/// A configuration that sweeps one small region, for editing by hand.
pub fn starter_config() -> SweepConfig {
    SweepConfig {
        run_key: "default".to_string(),
        regions: vec![Region {
            code: "NY".to_string(),
            name: "New York".to_string(),
            localities: vec![
                "Albany".to_string(),
                "Buffalo".to_string(),
                "Rochester".to_string(),
            ],
        }],
        start_url: "https://listings.example.com/".to_string(),
        search_url_template: "https://listings.example.com/{locality}-{region}/".to_string(),
        price_ceiling: Some(500_000),
        max_passes: Some(1),
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOutcome {
    pub config_written: bool,
    pub database_replaced: bool,
}

/// Writes the starter configuration and creates the database.
///
/// Existing files are kept unless `force` is set.
pub fn init_workspace(config_path: &Path, db_path: &Path, force: bool) -> Result<InitOutcome> {
    let mut outcome = InitOutcome {
        config_written: false,
        database_replaced: false,
    };

    if force || !config_path.exists() {
        starter_config()
            .save(config_path)
            .with_context(|| format!("writing {}", config_path.display()))?;
        outcome.config_written = true;
    }

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if force && Database::exists(db_path) {
        Database::drop(db_path).with_context(|| format!("removing {}", db_path.display()))?;
        outcome.database_replaced = true;
    }
    Database::new(db_path).with_context(|| format!("creating {}", db_path.display()))?;
    Ok(outcome)
}

pub fn load_config(path: &Path) -> Result<SweepConfig> {
    if !path.exists() {
        bail!(
            "no configuration at {} (run `plotwalk init` first)",
            path.display()
        );
    }
    SweepConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// Command-line overrides for a sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepOverrides {
    pub regions: Vec<String>,
    pub max_passes: Option<u32>,
    pub quota: Option<u64>,
    pub headed: bool,
    pub webdriver_url: Option<String>,
}

pub fn apply_overrides(config: &mut SweepConfig, overrides: &SweepOverrides) -> Result<()> {
    if !overrides.regions.is_empty() {
        let unknown: Vec<&String> = overrides
            .regions
            .iter()
            .filter(|code| {
                !config
                    .regions
                    .iter()
                    .any(|r| r.code.eq_ignore_ascii_case(code))
            })
            .collect();
        if !unknown.is_empty() {
            bail!("unknown region codes: {:?}", unknown);
        }
        config.regions.retain(|r| {
            overrides
                .regions
                .iter()
                .any(|code| r.code.eq_ignore_ascii_case(code))
        });
    }
    if overrides.max_passes.is_some() {
        config.max_passes = overrides.max_passes;
    }
    if overrides.quota.is_some() {
        config.quota_threshold = overrides.quota;
    }
    if overrides.headed {
        config.headless = false;
    }
    if let Some(url) = &overrides.webdriver_url {
        config.webdriver_url = url.clone();
    }
    Ok(())
}

pub fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed | RunStatus::Paused => 0,
        RunStatus::Cancelled => 130,
        RunStatus::Failed | RunStatus::Running => 1,
    }
}

/// `$245,000`
pub fn format_price(price: i64) -> String {
    let digits = price.abs().to_string();
    let mut grouped = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if price < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

pub fn status_json(db: &Database, run_key: &str) -> Result<Value> {
    Ok(json!({
        "run_key": run_key,
        "cursor": db.get_cursor(run_key)?,
        "quota": db.get_quota(INGEST_QUOTA)?,
        "listings": db.count_listings()?,
        "runs": db.get_runs(run_key, 5)?,
    }))
}

pub fn render_status(db: &Database, run_key: &str) -> Result<String> {
    let mut out = String::new();
    out.push_str(&format!("{} {}\n", "Run key:".bold(), run_key));

    match db.get_cursor(run_key)? {
        Some(cursor) => {
            let position = match (&cursor.region, cursor.locality_index) {
                (Some(region), Some(index)) => format!("{region}, locality #{} done", index + 1),
                (Some(region), None) => format!("{region}, not started"),
                _ => "between regions".to_string(),
            };
            out.push_str(&format!("  {:<22} {}\n", "Position:", position));
            out.push_str(&format!(
                "  {:<22} {}\n",
                "Completed regions:",
                if cursor.completed_regions.is_empty() {
                    "-".to_string()
                } else {
                    cursor.completed_regions.join(", ")
                }
            ));
            out.push_str(&format!(
                "  {:<22} {} (pass {})\n",
                "Filter cycle:", cursor.filter_cycle_index, cursor.pass_count
            ));
            out.push_str(&format!(
                "  {:<22} {} persisted, {} rejected, {} skipped\n",
                "Totals:",
                cursor.total_persisted.to_string().green(),
                cursor.total_rejected,
                cursor.total_skipped.to_string().yellow()
            ));
        }
        None => out.push_str(&format!("  {}\n", "No checkpoint yet".bright_black())),
    }

    let quota = db.get_quota(INGEST_QUOTA)?;
    let threshold = quota
        .threshold
        .map(|t| t.to_string())
        .unwrap_or_else(|| "unlimited".to_string());
    let quota_line = format!("{} / {}", quota.count, threshold);
    out.push_str(&format!(
        "  {:<22} {}\n",
        "Quota:",
        if quota.is_over() {
            quota_line.red().bold()
        } else {
            quota_line.normal()
        }
    ));
    out.push_str(&format!("  {:<22} {}\n", "Listings stored:", db.count_listings()?));

    let runs = db.get_runs(run_key, 5)?;
    if !runs.is_empty() {
        out.push_str(&format!("\n{}\n", "Recent runs".bold().underline()));
        for run in runs {
            out.push_str(&format!(
                "  {}  {:<10} {} persisted, {} localities\n",
                format_timestamp(run.started_at),
                run.status,
                run.persisted,
                run.localities
            ));
        }
    }
    Ok(out)
}

pub fn render_listings(listings: &[StoredListing]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{}\n",
        format!(
            "{:<44} {:>12} {:<24} {}",
            "ADDRESS", "PRICE", "AGENT", "CYCLE"
        )
        .bold()
    ));
    for listing in listings {
        out.push_str(&format!(
            "{:<44} {:>12} {:<24} {}\n",
            listing.full_address,
            format_price(listing.price),
            listing.agent_name.as_deref().unwrap_or("-"),
            listing.filter_cycle.as_deref().unwrap_or("-")
        ));
    }
    out
}

/// Clears the checkpoint (and optionally the quota). Returns whether a checkpoint existed.
pub fn reset_progress(db: &Database, run_key: &str, quota: bool) -> Result<bool> {
    let cleared = db.clear_cursor(run_key)? > 0;
    if quota {
        db.reset_quota(INGEST_QUOTA)?;
    }
    Ok(cleared)
}
