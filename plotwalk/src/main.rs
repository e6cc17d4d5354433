use anyhow::{Context, Result};
use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use plotwalk::handlers::{
    SweepOverrides, apply_overrides, confirm, exit_code, init_tracing, init_workspace,
    load_config, print_banner, print_divider, render_listings, render_status, reset_progress,
    resolve_path, status_json,
};
use plotwalk_core::data::{Database, RunStatus};
use plotwalk_core::orchestrator::{Collaborators, Orchestrator, progress_spinner};
use plotwalk_core::store::{INGEST_QUOTA, SqliteStore};
use plotwalk_scanner::auth::{Anonymous, Credentials, EnvOrPrompt};
use plotwalk_scanner::{
    Authenticator, BrowserSession, FormAuthenticator, PageHandle, PageSite, TableFilterApplier,
    WebDriverOptions, WebDriverSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

mod commands;

#[tokio::main]
async fn main() {
    let cmd = command_argument_builder();
    let chosen_command = cmd.get_matches();
    let quiet = chosen_command.get_flag("quiet");

    if !quiet {
        print_banner();
    }

    if chosen_command.subcommand().is_none() {
        return;
    }
    init_tracing(chosen_command.get_flag("verbose"));

    let result = match chosen_command.subcommand() {
        Some(("init", sub)) => handle_init(&chosen_command, sub),
        Some(("sweep", sub)) => handle_sweep(&chosen_command, sub).await,
        Some(("status", sub)) => handle_status(&chosen_command, sub),
        Some(("listings", sub)) => handle_listings(&chosen_command, sub),
        Some(("reset", sub)) => handle_reset(&chosen_command, sub),
        Some(("export-config", sub)) => handle_export_config(&chosen_command, sub),
        _ => unreachable!("clap should ensure we don't get here"),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red().bold(), e);
            std::process::exit(1);
        }
    }
}

fn paths(global: &ArgMatches) -> Result<(PathBuf, PathBuf)> {
    let config = global
        .get_one::<String>("config")
        .context("missing --config")?;
    let database = global
        .get_one::<String>("database")
        .context("missing --database")?;
    Ok((resolve_path(config)?, resolve_path(database)?))
}

fn handle_init(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (config_path, db_path) = paths(global)?;
    let mut force = args.get_flag("force");

    print_divider();
    println!("{}", "  PLOTWALK INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    if !force && (config_path.exists() || db_path.exists()) {
        println!("{}", "⚠ WARNING".yellow().bold());
        if config_path.exists() {
            println!("  {} {}", "•".yellow(), config_path.display());
        }
        if db_path.exists() {
            println!("  {} {}", "•".yellow(), db_path.display());
        }
        force = confirm("Overwrite existing files? [y/N]:")?;
        if !force {
            println!("Keeping existing files.");
        }
    }

    let outcome = init_workspace(&config_path, &db_path, force)?;
    if outcome.config_written {
        println!("{} Config: {}", "✓".green().bold(), config_path.display());
    }
    if outcome.database_replaced {
        println!("{} Existing database removed", "✓".green().bold());
    }
    println!("{} Database: {}", "✓".green().bold(), db_path.display());
    Ok(0)
}

async fn handle_sweep(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (config_path, db_path) = paths(global)?;
    let mut config = load_config(&config_path)?;
    let overrides = SweepOverrides {
        regions: args
            .get_many::<String>("region")
            .map(|codes| codes.cloned().collect())
            .unwrap_or_default(),
        max_passes: args.get_one::<u32>("max-passes").copied(),
        quota: args.get_one::<u64>("quota").copied(),
        headed: args.get_flag("headed"),
        webdriver_url: args.get_one::<String>("webdriver").cloned(),
    };
    apply_overrides(&mut config, &overrides)?;

    let db = Database::new(&db_path)?;
    db.set_quota_threshold(INGEST_QUOTA, config.quota_threshold)?;
    let store = SqliteStore::new(db, &config.run_key);
    let run_id = store.db()?.create_run(&config.run_key)?;

    let abort = Arc::new(AtomicBool::new(false));
    let flag = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current record before stopping");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let options = WebDriverOptions {
        endpoint: config.webdriver_url.clone(),
        headless: config.headless,
        ..Default::default()
    };
    info!(endpoint = %options.endpoint, "Connecting to WebDriver");
    let (session, first_page) = match WebDriverSession::connect(options).await {
        Ok(connected) => connected,
        Err(e) => {
            store
                .db()?
                .finish_run(&run_id, RunStatus::Failed, 0, 0, 0)?;
            return Err(e).context("starting the browser session");
        }
    };
    let session: Arc<dyn BrowserSession> = Arc::new(session);
    let page = PageHandle::new(first_page);

    let auth: Arc<dyn Authenticator> = if config.login.login_url.is_empty() {
        Arc::new(Anonymous)
    } else {
        let credentials = Credentials::from_env(&config.username_env, &config.password_env)?;
        Arc::new(FormAuthenticator::new(
            config.login.clone(),
            credentials,
            Box::new(EnvOrPrompt(config.verification_code_env.clone())),
        ))
    };
    let filters = Arc::new(TableFilterApplier::new(
        config.filter_fields.clone(),
        config.site.settle_ms,
    ));
    let site = PageSite::new(page.clone(), config.site.clone());
    let deps = Collaborators {
        session: session.clone(),
        auth,
        filters,
        checkpoints: Arc::new(store.clone()),
        listings: Arc::new(store.clone()),
        quota: Arc::new(store.clone()),
    };

    let (spinner, progress) = progress_spinner();
    let orchestrator = Orchestrator::new(config, page, site, deps, abort).with_progress(progress);
    let result = orchestrator.run().await;
    spinner.finish_and_clear();

    if let Err(e) = session.shutdown().await {
        warn!("Browser shutdown failed: {}", e);
    }

    match result {
        Ok(report) => {
            store.db()?.finish_run(
                &run_id,
                report.status(),
                report.records_persisted + report.records_updated,
                report.records_rejected,
                report.localities_attempted(),
            )?;
            println!("{}", report.render());
            Ok(exit_code(report.status()))
        }
        Err(e) => {
            store
                .db()?
                .finish_run(&run_id, RunStatus::Failed, 0, 0, 0)?;
            Err(e).context("sweep failed")
        }
    }
}

fn handle_status(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (config_path, db_path) = paths(global)?;
    let config = load_config(&config_path)?;
    let db = Database::new(&db_path)?;

    if args.get_flag("json") {
        println!(
            "{}",
            serde_json::to_string_pretty(&status_json(&db, &config.run_key)?)?
        );
    } else {
        print!("{}", render_status(&db, &config.run_key)?);
    }
    Ok(0)
}

fn handle_listings(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (_, db_path) = paths(global)?;
    let db = Database::new(&db_path)?;
    let region = args.get_one::<String>("region").map(String::as_str);
    let limit = args.get_one::<usize>("limit").copied().unwrap_or(50);

    let mut listings = db.get_listings(region)?;
    listings.truncate(limit);

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&listings)?);
    } else {
        print!("{}", render_listings(&listings));
        println!("{} listing(s)", listings.len());
    }
    Ok(0)
}

fn handle_reset(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (config_path, db_path) = paths(global)?;
    let config = load_config(&config_path)?;
    let db = Database::new(&db_path)?;

    if reset_progress(&db, &config.run_key, args.get_flag("quota"))? {
        println!("{} Checkpoint cleared for {}", "✓".green().bold(), config.run_key);
    } else {
        println!("No checkpoint stored for {}", config.run_key);
    }
    Ok(0)
}

fn handle_export_config(global: &ArgMatches, args: &ArgMatches) -> Result<i32> {
    let (config_path, _) = paths(global)?;
    let config = load_config(&config_path)?;

    match args.get_one::<PathBuf>("output") {
        Some(out) => {
            config.save(out)?;
            println!("{} Wrote {}", "✓".green().bold(), out.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(0)
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
